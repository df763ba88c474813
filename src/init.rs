use anyhow::Result;
use reqwest::Client;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::info;

/// Creates the brief's output directory and the parent of the history file.
pub async fn ensure_directories(output_dir: &Path, history_file: &Path) -> Result<()> {
    let history_dir = history_file.parent().filter(|p| !p.as_os_str().is_empty());
    for dir in std::iter::once(output_dir).chain(history_dir) {
        if !dir.exists() {
            fs::create_dir_all(dir).await?;
            info!("Created directory: {}", dir.display());
        }
    }
    Ok(())
}

/// True when a WebDriver server answers `/status` as ready.
pub async fn check_webdriver(client: &Client, base_url: &str) -> bool {
    let url = format!("{}/status", base_url.trim_end_matches('/'));
    let resp = match client.get(&url).timeout(Duration::from_secs(5)).send().await {
        Ok(resp) if resp.status().is_success() => resp,
        _ => return false,
    };
    match resp.json::<serde_json::Value>().await {
        Ok(body) => body["value"]["ready"].as_bool().unwrap_or(true),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn creates_output_and_history_dirs() {
        let root = tempfile::tempdir().unwrap();
        let output = root.path().join("out");
        let history = root.path().join("history").join("video_history.json");
        ensure_directories(&output, &history).await.unwrap();
        assert!(output.is_dir());
        assert!(root.path().join("history").is_dir());
        assert!(!history.exists());

        // Bare file names have no parent to create.
        ensure_directories(&output, Path::new("video_history.json"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn webdriver_status_reports_readiness() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"value": {"ready": false, "message": "busy"}})),
            )
            .mount(&server)
            .await;
        assert!(!check_webdriver(&Client::new(), &server.uri()).await);
    }

    #[tokio::test]
    async fn unreachable_webdriver_is_not_ready() {
        assert!(!check_webdriver(&Client::new(), "http://127.0.0.1:1").await);
    }
}
