use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("Browser engine unavailable")]
    EngineUnavailable,

    #[error("Engine launch failed: {0}")]
    EngineLaunchFailed(String),

    #[error("Navigation timed out after {0:?}")]
    NavigationTimeout(Duration),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Page error: {0}")]
    PageError(String),

    #[error("Screenshot capture failed")]
    CaptureFailed(#[source] Box<RenderError>),

    #[error("Cache metadata error: {0}")]
    CacheIo(String),

    #[error("Remote store error: {0}")]
    RemoteStore(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl RenderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RenderError::EngineUnavailable
                | RenderError::NavigationTimeout(_)
                | RenderError::NavigationFailed(_)
                | RenderError::PageError(_)
        )
    }

    /// True when the failure ultimately came from a navigation timeout,
    /// including one wrapped by `CaptureFailed` after retry exhaustion.
    /// Callers use this to show a "server responding slowly" message.
    pub fn is_navigation_timeout(&self) -> bool {
        match self {
            RenderError::NavigationTimeout(_) => true,
            RenderError::CaptureFailed(inner) => inner.is_navigation_timeout(),
            _ => false,
        }
    }

    pub fn capture_failed(last: RenderError) -> Self {
        RenderError::CaptureFailed(Box::new(last))
    }
}

impl From<std::io::Error> for RenderError {
    fn from(err: std::io::Error) -> Self {
        RenderError::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for RenderError {
    fn from(err: rusqlite::Error) -> Self {
        RenderError::CacheIo(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(RenderError::EngineUnavailable.is_retryable());
        assert!(RenderError::NavigationTimeout(Duration::from_secs(120)).is_retryable());
        assert!(RenderError::PageError("crashed".into()).is_retryable());
        assert!(!RenderError::InvalidUrl("nope".into()).is_retryable());
        assert!(!RenderError::Configuration("bad".into()).is_retryable());
    }

    #[test]
    fn navigation_timeout_survives_capture_wrapping() {
        let err = RenderError::capture_failed(RenderError::NavigationTimeout(
            Duration::from_secs(120),
        ));
        assert!(err.is_navigation_timeout());

        let err = RenderError::capture_failed(RenderError::PageError("boom".into()));
        assert!(!err.is_navigation_timeout());
    }
}
