//! Locator tables for the Flow web UI.
//!
//! These are tuned against one snapshot of a third-party page and drift with
//! it, so they live in configuration. Each list is tried in order and the
//! first visible match wins.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocatorStrategy {
    #[serde(rename = "css")]
    Css,
    #[serde(rename = "xpath")]
    XPath,
}

impl LocatorStrategy {
    /// Strategy name on the WebDriver wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            LocatorStrategy::Css => "css selector",
            LocatorStrategy::XPath => "xpath",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    pub using: LocatorStrategy,
    pub value: String,
}

impl Locator {
    pub fn css(value: impl Into<String>) -> Self {
        Self {
            using: LocatorStrategy::Css,
            value: value.into(),
        }
    }

    pub fn xpath(value: impl Into<String>) -> Self {
        Self {
            using: LocatorStrategy::XPath,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSelectors {
    /// Any of these visible means the session is signed in and usable.
    pub ready: Vec<Locator>,
    pub new_project: Vec<Locator>,
    pub close_popup: Vec<Locator>,
    pub prompt_input: Vec<Locator>,
    pub submit: Vec<Locator>,
    pub rendered_video: Locator,
}

impl Default for BrowserSelectors {
    fn default() -> Self {
        let new_project =
            "//button[contains(., 'New project') or contains(., 'Dự án mới')]".to_string();
        Self {
            ready: vec![
                Locator::css("#PINHOLE_TEXT_AREA_ELEMENT_ID"),
                Locator::css("textarea"),
            ],
            new_project: vec![Locator::xpath(new_project)],
            close_popup: vec![
                Locator::css(r#"button[aria-label*="Close"]"#),
                Locator::css(r#"button[aria-label*="Dismiss"]"#),
                Locator::xpath("//button[.//i[contains(text(), 'close')]]"),
                Locator::css("button.close"),
                Locator::css(r#"[data-dismiss="modal"]"#),
                Locator::css(r#"div[role="dialog"] button"#),
            ],
            prompt_input: vec![
                Locator::css("#PINHOLE_TEXT_AREA_ELEMENT_ID"),
                Locator::css(r#"textarea[placeholder*="Tạo một video"]"#),
                Locator::css("textarea"),
            ],
            submit: vec![
                Locator::xpath("//button[.//i[contains(text(), 'arrow_forward')]]"),
                Locator::css(r#"button[class*="arrow_forward"]"#),
            ],
            rendered_video: Locator::css("video"),
        }
    }
}
