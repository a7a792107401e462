mod error;
mod secs;

pub use error::{
    ResolveError, Result, TransferError, TransferErrorKind, TransportError,
    E_ABORTED_BY_CALLBACK, E_COULDNT_CONNECT, E_COULDNT_RESOLVE_HOST, E_COULDNT_RESOLVE_PROXY,
    E_OPERATION_TIMEDOUT, E_PARTIAL_FILE, E_TOO_MANY_REDIRECTS, E_UNSUPPORTED_PROTOCOL,
};
pub type Error = TransportError;

pub mod connectors;
pub mod dns;
pub mod flowcontrol;
pub mod pipeline;
pub mod pool;
pub mod profile;
pub mod transfer;
