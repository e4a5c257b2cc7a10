//! Where the user sees the authorization page.
//!
//! A surface is opened before the login does anything else, then navigated
//! once the authorization URL exists. Popup-style surfaces report when the
//! user closes them; the system browser cannot, so it never reports closed.

use url::Url;

use crate::error::AuthError;

pub trait InteractiveSurface: Send {
    /// Called synchronously at the start of a login.
    fn open(&mut self) -> Result<(), AuthError>;

    fn navigate(&mut self, url: &Url) -> Result<(), AuthError>;

    fn is_closed(&self) -> bool;

    /// Called when the login finishes, whatever the outcome.
    fn close(&mut self) {}
}

/// Opens the authorization URL in the operating system's default browser.
#[derive(Debug, Default)]
pub struct SystemBrowser;

impl InteractiveSurface for SystemBrowser {
    fn open(&mut self) -> Result<(), AuthError> {
        Ok(())
    }

    fn navigate(&mut self, url: &Url) -> Result<(), AuthError> {
        open::that(url.as_str()).map_err(|e| {
            tracing::warn!(error = %e, "Failed to open browser");
            AuthError::PopupBlocked(e.to_string())
        })
    }

    fn is_closed(&self) -> bool {
        false
    }
}

/// Hands the URL to a callback instead of opening anything (headless terminals).
pub struct PrintUrl<F: FnMut(&Url) + Send> {
    print: F,
}

impl<F: FnMut(&Url) + Send> PrintUrl<F> {
    pub fn new(print: F) -> Self {
        Self { print }
    }
}

impl<F: FnMut(&Url) + Send> InteractiveSurface for PrintUrl<F> {
    fn open(&mut self) -> Result<(), AuthError> {
        Ok(())
    }

    fn navigate(&mut self, url: &Url) -> Result<(), AuthError> {
        (self.print)(url);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        false
    }
}

/// Tries the system browser and falls back to printing the URL.
pub struct BrowserOrPrint<F: FnMut(&Url) + Send> {
    fallback: PrintUrl<F>,
}

impl<F: FnMut(&Url) + Send> BrowserOrPrint<F> {
    pub fn new(print: F) -> Self {
        Self {
            fallback: PrintUrl::new(print),
        }
    }
}

impl<F: FnMut(&Url) + Send> InteractiveSurface for BrowserOrPrint<F> {
    fn open(&mut self) -> Result<(), AuthError> {
        Ok(())
    }

    fn navigate(&mut self, url: &Url) -> Result<(), AuthError> {
        if SystemBrowser.navigate(url).is_err() {
            return self.fallback.navigate(url);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        false
    }
}
