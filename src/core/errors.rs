//! Core error types

use thiserror::Error;

/// Errors surfaced by the locker core.
///
/// Only two of these are survivable: a plugin protocol violation tears down
/// the plugin connection, and a feedback inconsistency tears down forwarding
/// for that plugin session. Upstream errors end the process, because a lock
/// screen that has lost its display connection cannot guarantee the lock.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("upstream display error: {0}")]
    Upstream(String),

    #[error("plugin protocol violation: {0}")]
    PluginProtocol(String),

    #[error("dmabuf feedback inconsistency: {0}")]
    Feedback(String),

    #[error("credential verifier error: {0}")]
    Verifier(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl LockError {
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    pub fn plugin_protocol(msg: impl Into<String>) -> Self {
        Self::PluginProtocol(msg.into())
    }

    pub fn feedback(msg: impl Into<String>) -> Self {
        Self::Feedback(msg.into())
    }

    pub fn verifier(msg: impl Into<String>) -> Self {
        Self::Verifier(msg.into())
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, LockError>;
