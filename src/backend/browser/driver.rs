use crate::backend::browser::selectors::Locator;
use crate::cookies::CookieRecord;
use crate::error::GenResult;
use async_trait::async_trait;

/// Opaque element reference valid for the current page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementId(pub String);

/// The page operations the Flow state machine needs from a browser.
///
/// Calls take `&mut self`: one driver is one page, and the backend
/// serializes access to it.
#[async_trait]
pub trait BrowserDriver: Send {
    async fn start(&mut self) -> GenResult<()>;

    async fn goto(&mut self, url: &str) -> GenResult<()>;

    /// `document.readyState` of the current page.
    async fn ready_state(&mut self) -> GenResult<String>;

    /// Cookies are added for the page currently loaded.
    async fn add_cookies(&mut self, cookies: &[CookieRecord]) -> GenResult<()>;

    async fn current_url(&mut self) -> GenResult<String>;

    async fn find_all(&mut self, locator: &Locator) -> GenResult<Vec<ElementId>>;

    async fn is_visible(&mut self, element: &ElementId) -> GenResult<bool>;

    async fn attribute(&mut self, element: &ElementId, name: &str) -> GenResult<Option<String>>;

    /// Clears the field, then types `text`.
    async fn fill(&mut self, element: &ElementId, text: &str) -> GenResult<()>;

    async fn click(&mut self, element: &ElementId) -> GenResult<()>;

    async fn press_escape(&mut self) -> GenResult<()>;

    async fn close(&mut self) -> GenResult<()>;
}
