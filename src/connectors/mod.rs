mod tcp_connector;

pub use tcp_connector::*;

/// Manufactures new connections for a pool.
///
/// Any configuration a connection needs (address, credentials, socket options)
/// is owned by the connector itself, so `connect` takes no arguments. Plain
/// closures returning `Result` are connectors too.
pub trait Connector {
    type Connection;
    type Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error>;
}

impl<F, T, E> Connector for F
where
    F: Fn() -> Result<T, E>,
{
    type Connection = T;
    type Error = E;

    #[inline]
    fn connect(&self) -> Result<T, E> {
        (self)()
    }
}
