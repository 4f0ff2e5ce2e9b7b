//! Error handling module
//!
//! Based on anyhow but adds domain-specific error contexts to improve
//! debugging and user feedback.

use std::io;

/// Main error types for the torfleet application
///
/// Each error clearly expresses the context where it occurred (config,
/// network, process, etc.) to reduce problem resolution time.
#[derive(Debug)]
pub enum TorfleetError {
    /// Configuration file related errors
    Config(String),
    /// Network/IO related errors
    Network(String),
    /// Process management related errors
    Process(String),
    /// Backend connection related errors
    Backend(String),
    /// Health check related errors
    HealthCheck(String),
    /// Backend control-channel related errors (auth, framing, rejected command)
    Control(String),
    /// DNS proxy related errors
    Dns(String),
}

impl std::fmt::Display for TorfleetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TorfleetError::Config(msg) => write!(f, "Config error: {}", msg),
            TorfleetError::Network(msg) => write!(f, "Network error: {}", msg),
            TorfleetError::Process(msg) => write!(f, "Process control error: {}", msg),
            TorfleetError::Backend(msg) => write!(f, "Backend connection failed: {}", msg),
            TorfleetError::HealthCheck(msg) => write!(f, "Health check failed: {}", msg),
            TorfleetError::Control(msg) => write!(f, "Control channel error: {}", msg),
            TorfleetError::Dns(msg) => write!(f, "DNS proxy error: {}", msg),
        }
    }
}

impl std::error::Error for TorfleetError {}

/// Helper trait for adding context to anyhow::Error
pub trait ResultExt<T> {
    /// Add configuration error context
    fn context_config(self, msg: &str) -> anyhow::Result<T>;
    /// Add network error context
    fn context_network(self, msg: &str) -> anyhow::Result<T>;
    /// Add process error context
    fn context_process(self, msg: &str) -> anyhow::Result<T>;
    /// Add backend error context
    fn context_backend(self, msg: &str) -> anyhow::Result<T>;
    /// Add control-channel error context
    fn context_control(self, msg: &str) -> anyhow::Result<T>;
    /// Add DNS error context
    fn context_dns(self, msg: &str) -> anyhow::Result<T>;
}

impl<T> ResultExt<T> for anyhow::Result<T> {
    fn context_config(self, msg: &str) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::anyhow!("{}: {}", TorfleetError::Config(msg.to_string()), e))
    }

    fn context_network(self, msg: &str) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::anyhow!("{}: {}", TorfleetError::Network(msg.to_string()), e))
    }

    fn context_process(self, msg: &str) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::anyhow!("{}: {}", TorfleetError::Process(msg.to_string()), e))
    }

    fn context_backend(self, msg: &str) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::anyhow!("{}: {}", TorfleetError::Backend(msg.to_string()), e))
    }

    fn context_control(self, msg: &str) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::anyhow!("{}: {}", TorfleetError::Control(msg.to_string()), e))
    }

    fn context_dns(self, msg: &str) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::anyhow!("{}: {}", TorfleetError::Dns(msg.to_string()), e))
    }
}

impl<T> ResultExt<T> for io::Result<T> {
    fn context_config(self, msg: &str) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::anyhow!("{}: {}", TorfleetError::Config(msg.to_string()), e))
    }

    fn context_network(self, msg: &str) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::anyhow!("{}: {}", TorfleetError::Network(msg.to_string()), e))
    }

    fn context_process(self, msg: &str) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::anyhow!("{}: {}", TorfleetError::Process(msg.to_string()), e))
    }

    fn context_backend(self, msg: &str) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::anyhow!("{}: {}", TorfleetError::Backend(msg.to_string()), e))
    }

    fn context_control(self, msg: &str) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::anyhow!("{}: {}", TorfleetError::Control(msg.to_string()), e))
    }

    fn context_dns(self, msg: &str) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::anyhow!("{}: {}", TorfleetError::Dns(msg.to_string()), e))
    }
}

/// Generate user-friendly error message
///
/// Converts internal errors into messages users can understand and act upon.
pub fn format_user_error(error: &anyhow::Error) -> String {
    let error_str = error.to_string();

    if error_str.contains("Connection refused") {
        "Cannot connect to backend server. Please check if the server is running.".to_string()
    } else if error_str.contains("Permission denied") {
        "Insufficient permissions. Please check file permissions if needed.".to_string()
    } else if error_str.contains("Address already in use") {
        "Port is already in use. Please check if another process is using this port.".to_string()
    } else if error_str.contains("No such file") {
        "File not found. Please check the path.".to_string()
    } else if error_str.contains("515") {
        "Backend rejected control-channel authentication. The cookie file may be stale."
            .to_string()
    } else {
        error_str
    }
}
