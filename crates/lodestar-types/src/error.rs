use std::fmt;

use thiserror::Error;

/// Result type alias for lodestar operations
pub type Result<T> = std::result::Result<T, Error>;

/// Control plane response codes
pub mod codes {
    /// Full payload returned
    pub const EXECUTE_SUCCESS: u32 = 200000;
    /// Data unchanged since the revision sent with the request
    pub const DATA_NO_CHANGE: u32 = 200001;
    /// Heartbeat sent for an instance without health checking enabled
    pub const HEARTBEAT_ON_DISABLED_INSTANCE: u32 = 400141;
    /// Resource already exists (an instance registered twice)
    pub const EXISTED_RESOURCE: u32 = 400201;

    /// Whether a response code carries success or "not modified"
    pub fn is_success(code: u32) -> bool {
        code == EXECUTE_SUCCESS || code == DATA_NO_CHANGE
    }
}

/// Classification of transport-level failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Request did not complete within its timeout
    Timeout,
    /// TCP connection could not be established
    Connect,
    /// Host name could not be resolved
    Dns,
    /// TLS handshake or certificate failure
    Tls,
    /// Any other failure of the request task itself
    Task,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::Dns => "dns",
            TransportErrorKind::Tls => "tls",
            TransportErrorKind::Task => "task",
        };
        f.write_str(name)
    }
}

/// Error types for discovery, routing and lifecycle operations
#[derive(Error, Debug)]
pub enum Error {
    /// Network failure talking to the control plane
    #[error("Transport error ({kind}): {message}")]
    Transport { kind: TransportErrorKind, message: String },

    /// The control plane answered with a non-success response code
    #[error("Control plane error {code}: {info}")]
    Application { code: u32, info: String },

    /// Response body could not be decoded
    #[error("Server parse error: {0}")]
    ServerParse(String),

    /// A watch for this service is already active or being established
    #[error("Double watch: {0}")]
    DoubleWatch(String),

    /// A registration for this instance is already active or in progress
    #[error("Double register: {0}")]
    DoubleRegister(String),

    /// No watch exists for this service
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// A routing policy is already installed under this name
    #[error("Policy already exists: {0}")]
    PolicyExists(String),

    /// The endpoint set is empty
    #[error("No endpoints available: {0}")]
    NoEndpoints(String),

    /// Routing filters left nothing to choose from
    #[error("No matched instance: {0}")]
    NoMatchedInstance(String),

    /// Malformed request descriptor
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The manager has been shut down
    #[error("Manager has exited")]
    Exited,

    /// Generic errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a transport error
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Error::Transport { kind, message: message.into() }
    }

    /// Create an application error from a response code
    pub fn application(code: u32, info: impl Into<String>) -> Self {
        Error::Application { code, info: info.into() }
    }

    /// Whether the protocol state machine may retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }

    /// Control plane response code, if this is an application error
    pub fn response_code(&self) -> Option<u32> {
        match self {
            Error::Application { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the control plane rejected a heartbeat because health checking is off
    pub fn is_heartbeat_disabled(&self) -> bool {
        self.response_code() == Some(codes::HEARTBEAT_ON_DISABLED_INSTANCE)
    }

    /// Get error code for client consumption
    pub fn error_code(&self) -> &str {
        match self {
            Error::Transport { .. } => "TRANSPORT_ERROR",
            Error::Application { .. } => "APPLICATION_ERROR",
            Error::ServerParse(_) => "SERVER_PARSE_ERROR",
            Error::DoubleWatch(_) => "DOUBLE_WATCH",
            Error::DoubleRegister(_) => "DOUBLE_REGISTER",
            Error::ServiceNotFound(_) => "SERVICE_NOT_FOUND",
            Error::PolicyExists(_) => "POLICY_EXISTS",
            Error::NoEndpoints(_) => "NO_ENDPOINTS",
            Error::NoMatchedInstance(_) => "NO_MATCHED_INSTANCE",
            Error::InvalidRequest(_) => "INVALID_REQUEST",
            Error::Config(_) => "CONFIGURATION_ERROR",
            Error::Exited => "MANAGER_EXITED",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::ServerParse(e.to_string())
    }
}
