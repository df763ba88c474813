//! Session cookie handling for the browser backend.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

pub const REQUIRED_COOKIES: &[&str] = &["__Secure-1PSID", "__Secure-3PSID"];

pub const OPTIONAL_COOKIES: &[&str] = &[
    "HSID",
    "SSID",
    "APISID",
    "SAPISID",
    "__Secure-1PAPISID",
    "__Secure-3PAPISID",
];

const DEFAULT_DOMAIN: &str = ".google.com";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub secure: bool,
}

impl CookieRecord {
    /// Cookies with these prefixes are rejected by browsers unless secure.
    pub fn requires_secure(&self) -> bool {
        self.name.starts_with("__Secure-") || self.name.starts_with("__Host-")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CookieValidation {
    pub valid: bool,
    pub missing: Vec<String>,
    pub found: Vec<String>,
    pub total_cookies: usize,
}

/// Parses a raw `name=value; name2=value2` header string.
///
/// Pairs without `=` or with an empty name are skipped. Only the first `=`
/// splits, so values may themselves contain `=`.
pub fn parse_cookie_string(raw: &str) -> Vec<CookieRecord> {
    raw.split(';')
        .filter_map(|part| {
            let (name, value) = part.trim().split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some(CookieRecord {
                name: name.to_string(),
                value: value.trim().to_string(),
                domain: DEFAULT_DOMAIN.to_string(),
                path: "/".to_string(),
                secure: false,
            })
        })
        .collect()
}

/// Rewrites parsed cookies for injection into a page on `host`.
pub fn cookies_for_domain(cookies: &[CookieRecord], host: &str) -> Vec<CookieRecord> {
    cookies
        .iter()
        .map(|cookie| {
            let mut out = cookie.clone();
            out.domain = host.to_string();
            out.path = "/".to_string();
            out.secure = cookie.secure || cookie.requires_secure();
            out
        })
        .collect()
}

pub fn to_cookie_string(cookies: &[CookieRecord]) -> String {
    cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Checks a raw cookie string for the session cookies the Flow UI needs.
pub fn validate_cookies(raw: &str) -> CookieValidation {
    let cookies = parse_cookie_string(raw);
    let has = |name: &str| cookies.iter().any(|c| c.name == name);

    let missing: Vec<String> = REQUIRED_COOKIES
        .iter()
        .filter(|name| !has(name))
        .map(|name| name.to_string())
        .collect();
    let found: Vec<String> = REQUIRED_COOKIES
        .iter()
        .chain(OPTIONAL_COOKIES.iter())
        .filter(|name| has(name))
        .map(|name| name.to_string())
        .collect();

    CookieValidation {
        valid: missing.is_empty(),
        missing,
        found,
        total_cookies: cookies.len(),
    }
}

#[derive(Debug, Deserialize)]
struct ExportedCookie {
    name: String,
    #[serde(default)]
    value: String,
}

/// Converts a browser-extension export (`[{"name":..,"value":..},..]`)
/// into a raw cookie string.
pub fn cookie_string_from_export(json: &str) -> Result<String> {
    let exported: Vec<ExportedCookie> =
        serde_json::from_str(json).context("Cookie export is not a JSON array of cookies")?;
    Ok(exported
        .iter()
        .filter(|c| !c.name.is_empty())
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; "))
}

/// Reads a cookie file: either an extension JSON export or a raw header string.
pub async fn load_cookie_file<P: AsRef<Path>>(path: P) -> Result<String> {
    let content = fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read cookie file: {}", path.as_ref().display()))?;
    let trimmed = content.trim();
    if trimmed.starts_with('[') {
        cookie_string_from_export(trimmed)
    } else {
        Ok(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_pairs() {
        let cookies = parse_cookie_string("a=1; b=2");
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0].name, "a");
        assert_eq!(cookies[1].value, "2");
        assert_eq!(cookies[0].domain, ".google.com");
        assert_eq!(cookies[0].path, "/");
    }

    #[test]
    fn empty_and_garbage_strings() {
        assert!(parse_cookie_string("").is_empty());
        assert!(parse_cookie_string("; ;novalue; =x").is_empty());
    }

    #[test]
    fn value_keeps_inner_equals() {
        let cookies = parse_cookie_string("token=abc==; x=y");
        assert_eq!(cookies[0].value, "abc==");
    }

    #[test]
    fn round_trip_preserves_pairs() {
        let raw = "SID=one; __Secure-1PSID=two; HSID=three";
        let again = parse_cookie_string(&to_cookie_string(&parse_cookie_string(raw)));
        let pairs: Vec<_> = again.iter().map(|c| (c.name.as_str(), c.value.as_str())).collect();
        assert_eq!(
            pairs,
            vec![("SID", "one"), ("__Secure-1PSID", "two"), ("HSID", "three")]
        );
    }

    #[test]
    fn domain_override_forces_secure_prefixes() {
        let cookies = parse_cookie_string("__Secure-3PSID=a; __Host-x=b; NID=c");
        let scoped = cookies_for_domain(&cookies, "labs.google");
        assert!(scoped.iter().all(|c| c.domain == "labs.google" && c.path == "/"));
        assert!(scoped[0].secure);
        assert!(scoped[1].secure);
        assert!(!scoped[2].secure);
    }

    #[test]
    fn validation_reports_missing_required() {
        let result = validate_cookies("HSID=1; SSID=2; NID=3");
        assert!(!result.valid);
        assert_eq!(result.missing, vec!["__Secure-1PSID", "__Secure-3PSID"]);
        assert_eq!(result.found, vec!["HSID", "SSID"]);
        assert_eq!(result.total_cookies, 3);
    }

    #[test]
    fn validation_accepts_required_pair() {
        let result = validate_cookies("__Secure-1PSID=a; __Secure-3PSID=b");
        assert!(result.valid);
        assert!(result.missing.is_empty());
    }

    #[test]
    fn export_json_becomes_header_string() {
        let json = r#"[{"name":"a","value":"1","domain":".google.com"},{"name":"b","value":"2"}]"#;
        assert_eq!(cookie_string_from_export(json).unwrap(), "a=1; b=2");
        assert!(cookie_string_from_export("{}").is_err());
    }

    #[tokio::test]
    async fn loads_either_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("cookies.txt");
        let export = dir.path().join("cookies.json");
        tokio::fs::write(&raw, "a=1; b=2\n").await.unwrap();
        tokio::fs::write(&export, r#"[{"name":"c","value":"3"}]"#)
            .await
            .unwrap();

        assert_eq!(load_cookie_file(&raw).await.unwrap(), "a=1; b=2");
        assert_eq!(load_cookie_file(&export).await.unwrap(), "c=3");
    }
}
