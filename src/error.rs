//! Central error handling for the forge3d integrator
//!
//! Provides a unified RenderError enum with consistent categorization
//! and the sticky per-device error state used by the wavefront queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::config::ConfigError;

/// Centralized error type for all integrator operations
#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    #[error("Device error: {0}")]
    Device(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RenderError {
    /// Convenience constructors for common error types
    pub fn device<T: ToString>(msg: T) -> Self {
        RenderError::Device(msg.to_string())
    }

    pub fn render<T: ToString>(msg: T) -> Self {
        RenderError::Render(msg.to_string())
    }

    pub fn category(&self) -> &'static str {
        match self {
            RenderError::Device(_) => "Device",
            RenderError::Render(_) => "Render",
            RenderError::Config(_) => "Config",
            RenderError::Io(_) => "IO",
            RenderError::Json(_) => "JSON",
        }
    }
}

/// Result type alias for integrator operations
pub type RenderResult<T> = Result<T, RenderError>;

/// Unrecoverable device error. Once set it stays set until the device is
/// recreated; queue operations check it and turn into no-ops.
#[derive(Debug, Default)]
pub struct DeviceErrorState {
    have_error: AtomicBool,
    message: Mutex<Option<String>>,
}

impl DeviceErrorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error. Only the first message is kept and logged.
    pub fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        let mut slot = self.message.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            log::error!("{message}");
            *slot = Some(message);
        }
        self.have_error.store(true, Ordering::Release);
    }

    pub fn have_error(&self) -> bool {
        self.have_error.load(Ordering::Acquire)
    }

    pub fn error_message(&self) -> Option<String> {
        if !self.have_error() {
            return None;
        }
        self.message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn to_render_error(&self) -> Option<RenderError> {
        self.error_message().map(RenderError::Device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_sticky_and_keeps_first_message() {
        let state = DeviceErrorState::new();
        assert!(!state.have_error());
        assert!(state.error_message().is_none());

        state.set_error("launch failed");
        state.set_error("second failure");

        assert!(state.have_error());
        assert_eq!(state.error_message().as_deref(), Some("launch failed"));
        match state.to_render_error() {
            Some(RenderError::Device(msg)) => assert_eq!(msg, "launch failed"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_render_error_display() {
        let err = RenderError::device("out of memory");
        assert_eq!(err.to_string(), "Device error: out of memory");
        assert_eq!(err.category(), "Device");
    }
}
