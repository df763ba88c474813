//! Minimal W3C WebDriver client (chromedriver, geckodriver).

use crate::backend::browser::driver::{BrowserDriver, ElementId};
use crate::backend::browser::selectors::Locator;
use crate::cookies::CookieRecord;
use crate::error::{GenResult, GenerationError};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

/// Key under which W3C drivers return element references.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

const ESCAPE_KEY: &str = "\u{E00C}";

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(default)]
    value: Value,
}

pub struct WebDriverClient {
    client: Client,
    base_url: String,
    headless: bool,
    page_load_timeout: Duration,
    session_id: Option<String>,
}

impl WebDriverClient {
    pub fn new(
        client: Client,
        base_url: &str,
        headless: bool,
        page_load_timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            headless,
            page_load_timeout,
            session_id: None,
        }
    }

    fn session(&self) -> GenResult<&str> {
        self.session_id
            .as_deref()
            .ok_or_else(|| GenerationError::session("browser session not started"))
    }

    fn capabilities(&self) -> Value {
        let mut args = vec![
            "--window-size=1280,900".to_string(),
            "--disable-blink-features=AutomationControlled".to_string(),
            "--no-first-run".to_string(),
        ];
        if self.headless {
            args.push("--headless=new".to_string());
        }
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "pageLoadStrategy": "normal",
                    "timeouts": {"pageLoad": self.page_load_timeout.as_millis() as u64},
                    "goog:chromeOptions": {"args": args}
                }
            }
        })
    }

    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> GenResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.request(method, &url);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let raw = resp.text().await.unwrap_or_default();
        let reply: Reply = serde_json::from_str(&raw).unwrap_or(Reply { value: Value::Null });

        if !status.is_success() {
            let code = reply.value.get("error").and_then(|v| v.as_str()).unwrap_or("unknown error");
            let message = reply.value.get("message").and_then(|v| v.as_str()).unwrap_or("");
            let first_line = message.lines().next().unwrap_or("");
            return Err(GenerationError::backend(format!(
                "WebDriver {} ({}): {}",
                code,
                status.as_u16(),
                first_line
            )));
        }
        Ok(reply.value)
    }

    async fn session_call(&self, method: Method, path: &str, body: Option<Value>) -> GenResult<Value> {
        let path = format!("/session/{}{}", self.session()?, path);
        self.call(method, &path, body).await
    }
}

fn element_ids(value: &Value) -> Vec<ElementId> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get(ELEMENT_KEY).and_then(|v| v.as_str()))
                .map(|id| ElementId(id.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl BrowserDriver for WebDriverClient {
    async fn start(&mut self) -> GenResult<()> {
        if self.session_id.is_some() {
            return Ok(());
        }
        let value = self.call(Method::POST, "/session", Some(self.capabilities())).await?;
        let id = value
            .get("sessionId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GenerationError::backend("WebDriver returned no session id"))?;
        debug!("WebDriver session {}", id);
        self.session_id = Some(id.to_string());
        Ok(())
    }

    async fn goto(&mut self, url: &str) -> GenResult<()> {
        self.session_call(Method::POST, "/url", Some(json!({ "url": url })))
            .await
            .map(|_| ())
    }

    async fn ready_state(&mut self) -> GenResult<String> {
        let body = json!({"script": "return document.readyState", "args": []});
        let value = self.session_call(Method::POST, "/execute/sync", Some(body)).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn add_cookies(&mut self, cookies: &[CookieRecord]) -> GenResult<()> {
        for cookie in cookies {
            let body = json!({
                "cookie": {
                    "name": cookie.name,
                    "value": cookie.value,
                    "domain": cookie.domain,
                    "path": cookie.path,
                    "secure": cookie.secure,
                }
            });
            if let Err(err) = self.session_call(Method::POST, "/cookie", Some(body)).await {
                debug!("cookie {} rejected: {}", cookie.name, err);
            }
        }
        Ok(())
    }

    async fn current_url(&mut self) -> GenResult<String> {
        let value = self.session_call(Method::GET, "/url", None).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn find_all(&mut self, locator: &Locator) -> GenResult<Vec<ElementId>> {
        let body = json!({"using": locator.using.wire_name(), "value": locator.value});
        let value = self.session_call(Method::POST, "/elements", Some(body)).await?;
        Ok(element_ids(&value))
    }

    async fn is_visible(&mut self, element: &ElementId) -> GenResult<bool> {
        let path = format!("/element/{}/displayed", element.0);
        let value = self.session_call(Method::GET, &path, None).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn attribute(&mut self, element: &ElementId, name: &str) -> GenResult<Option<String>> {
        let path = format!("/element/{}/attribute/{}", element.0, name);
        let value = self.session_call(Method::GET, &path, None).await?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn fill(&mut self, element: &ElementId, text: &str) -> GenResult<()> {
        let clear = format!("/element/{}/clear", element.0);
        self.session_call(Method::POST, &clear, Some(json!({}))).await?;
        let value = format!("/element/{}/value", element.0);
        self.session_call(Method::POST, &value, Some(json!({ "text": text })))
            .await
            .map(|_| ())
    }

    async fn click(&mut self, element: &ElementId) -> GenResult<()> {
        let path = format!("/element/{}/click", element.0);
        self.session_call(Method::POST, &path, Some(json!({})))
            .await
            .map(|_| ())
    }

    async fn press_escape(&mut self) -> GenResult<()> {
        let body = json!({
            "actions": [{
                "type": "key",
                "id": "keyboard",
                "actions": [
                    {"type": "keyDown", "value": ESCAPE_KEY},
                    {"type": "keyUp", "value": ESCAPE_KEY}
                ]
            }]
        });
        self.session_call(Method::POST, "/actions", Some(body))
            .await
            .map(|_| ())
    }

    async fn close(&mut self) -> GenResult<()> {
        if let Some(id) = self.session_id.take() {
            self.call(Method::DELETE, &format!("/session/{}", id), None).await?;
        }
        Ok(())
    }
}
