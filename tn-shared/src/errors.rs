use thiserror::Error;

use crate::ValidationError;

/// Classification of network-level failures reported by external tools or
/// HTTP calls to remote agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkErrorKind {
    ConnectionRefused,
    Timeout,
    Unreachable,
    Dns,
    Other,
}

impl NetworkErrorKind {
    /// Classify a failure from the text a tool or client produced.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        // Specific causes first: iperf3 wraps all of them in "unable to connect"
        if lower.contains("connection refused") {
            NetworkErrorKind::ConnectionRefused
        } else if lower.contains("timed out") || lower.contains("timeout") {
            NetworkErrorKind::Timeout
        } else if lower.contains("no route to host")
            || lower.contains("network is unreachable")
            || lower.contains("host unreachable")
            || lower.contains("destination host unreachable")
            || lower.contains("100% packet loss")
        {
            NetworkErrorKind::Unreachable
        } else if lower.contains("name or service not known")
            || lower.contains("temporary failure in name resolution")
            || lower.contains("could not resolve")
            || lower.contains("dns error")
            || lower.contains("failed to lookup address")
        {
            NetworkErrorKind::Dns
        } else if lower.contains("unable to connect") {
            NetworkErrorKind::ConnectionRefused
        } else {
            NetworkErrorKind::Other
        }
    }
}

impl std::fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            NetworkErrorKind::ConnectionRefused => "connection refused",
            NetworkErrorKind::Timeout => "timeout",
            NetworkErrorKind::Unreachable => "host unreachable",
            NetworkErrorKind::Dns => "name resolution failed",
            NetworkErrorKind::Other => "network failure",
        };
        f.write_str(text)
    }
}

/// Common error types for the transport-network control plane
#[derive(Error, Debug)]
pub enum TnError {
    #[error("Invalid input: {0}")]
    Validation(#[from] ValidationError),

    #[error("{resource} already exists")]
    AlreadyExists { resource: String },

    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error("{resource} is busy")]
    Busy { resource: String },

    #[error("no iperf3 server running on port {port}")]
    NoServerRunning { port: u16 },

    #[error("duration too long: {requested_secs}s exceeds maximum of {max_secs}s")]
    DurationTooLong { requested_secs: u64, max_secs: u64 },

    #[error("Command failed: {message}")]
    Command { message: String },

    #[error("Network error ({kind}): {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("Operation cancelled: {message}")]
    Cancelled { message: String },

    #[error("{component} not initialized")]
    NotInitialized { component: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TnError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        TnError::Validation(ValidationError::new(field, message))
    }

    pub fn command(message: impl Into<String>) -> Self {
        TnError::Command {
            message: message.into(),
        }
    }

    /// Build a network error, classifying the failure from its message.
    pub fn network(message: impl Into<String>) -> Self {
        let message = message.into();
        TnError::Network {
            kind: NetworkErrorKind::classify(&message),
            message,
        }
    }

    /// True for failures caused by the caller's input or by resource
    /// conflicts, as opposed to system or network failures.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            TnError::Validation(_)
                | TnError::AlreadyExists { .. }
                | TnError::NotFound { .. }
                | TnError::Busy { .. }
                | TnError::NoServerRunning { .. }
                | TnError::DurationTooLong { .. }
                | TnError::Serialization(_)
        )
    }

    pub fn network_kind(&self) -> Option<NetworkErrorKind> {
        match self {
            TnError::Network { kind, .. } => Some(*kind),
            TnError::Timeout { .. } => Some(NetworkErrorKind::Timeout),
            _ => None,
        }
    }
}

/// Manager-specific errors
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("no TN agent registered for cluster {cluster}")]
    AgentNotRegistered { cluster: String },

    #[error("agent {cluster} health check failed: {message}")]
    AgentUnhealthy { cluster: String, message: String },

    #[error("agent {cluster} returned HTTP {status}: {message}")]
    AgentResponse {
        cluster: String,
        status: u16,
        message: String,
    },

    #[error("no TN agents registered")]
    NoAgents,

    #[error("{failed} of {total} agents failed: {details}")]
    PartialFailure {
        failed: usize,
        total: usize,
        details: String,
    },

    #[error(transparent)]
    Common(#[from] TnError),
}

/// Result type aliases for convenience
pub type TnResult<T> = Result<T, TnError>;
pub type ManagerResult<T> = Result<T, ManagerError>;
