use std::fmt;

use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum TransportError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("resolve error {0}")]
    Resolve(#[from] ResolveError),
    #[error("transfer error {0}")]
    Transfer(#[from] TransferError),
    #[error("io error {0}")]
    Io(#[from] std::io::Error),
    #[error("serde_json error {0}")]
    Json(#[from] serde_json::Error),
    #[error("spawn thread failed {0}")]
    Spawn(std::io::Error),
    #[error("pipeline is closed")]
    PipelineClosed,
    #[error("pipeline is already started")]
    PipelineStarted,
}

impl TransportError {
    #[inline]
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(ThisError, Debug)]
pub enum ResolveError {
    #[error("resolve {host} failed: {source}")]
    Lookup {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no resolve result for {0}")]
    NoResolve(String),
    #[error("Missing authority in uri")]
    NoAuthority,
}

// Numeric codes reported by libcurl compatible engines.
pub const E_UNSUPPORTED_PROTOCOL: i32 = 1;
pub const E_COULDNT_RESOLVE_PROXY: i32 = 5;
pub const E_COULDNT_RESOLVE_HOST: i32 = 6;
pub const E_COULDNT_CONNECT: i32 = 7;
pub const E_PARTIAL_FILE: i32 = 18;
pub const E_OPERATION_TIMEDOUT: i32 = 28;
pub const E_ABORTED_BY_CALLBACK: i32 = 42;
pub const E_TOO_MANY_REDIRECTS: i32 = 47;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferErrorKind {
    UnsupportedProtocol,
    ProxyResolve,
    HostResolve,
    Connect,
    Timeout,
    TooManyRedirects,
    CallbackAborted,
    PartialFile,
    Other,
}

impl TransferErrorKind {
    pub fn from_code(code: i32) -> Self {
        match code {
            E_UNSUPPORTED_PROTOCOL => Self::UnsupportedProtocol,
            E_COULDNT_RESOLVE_PROXY => Self::ProxyResolve,
            E_COULDNT_RESOLVE_HOST => Self::HostResolve,
            E_COULDNT_CONNECT => Self::Connect,
            E_PARTIAL_FILE => Self::PartialFile,
            E_OPERATION_TIMEDOUT => Self::Timeout,
            E_ABORTED_BY_CALLBACK => Self::CallbackAborted,
            E_TOO_MANY_REDIRECTS => Self::TooManyRedirects,
            _ => Self::Other,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::UnsupportedProtocol => "unsupported protocol",
            Self::ProxyResolve => "couldn't resolve proxy",
            Self::HostResolve => "couldn't resolve host",
            Self::Connect => "couldn't connect",
            Self::Timeout => "operation timed out",
            Self::TooManyRedirects => "too many redirects",
            Self::CallbackAborted => "aborted by callback",
            Self::PartialFile => "partial file",
            Self::Other => "transfer failed",
        }
    }
}

impl fmt::Display for TransferErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a transfer engine, classified by its numeric code.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
#[error("{kind} (code {code}): {message}")]
pub struct TransferError {
    kind: TransferErrorKind,
    code: i32,
    message: String,
}

impl TransferError {
    pub fn new(kind: TransferErrorKind, code: i32, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
        }
    }

    pub fn from_code(code: i32, message: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::from_code(code), code, message)
    }

    #[inline]
    pub fn kind(&self) -> TransferErrorKind {
        self.kind
    }

    #[inline]
    pub fn code(&self) -> i32 {
        self.code
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Proxy and host resolution failures.
    #[inline]
    pub fn is_resolve(&self) -> bool {
        matches!(
            self.kind,
            TransferErrorKind::ProxyResolve | TransferErrorKind::HostResolve
        )
    }
}
