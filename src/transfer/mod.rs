//! Transfer engine seams.
//!
//! [`Engine`] performs one blocking transfer. [`MultiEngine`] multiplexes
//! many transfers on the calling thread and is what the
//! [`Pipeline`](crate::pipeline::Pipeline) drives.
#[cfg(feature = "curl")]
mod curl;

use std::{net::IpAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Uri};

#[cfg(feature = "curl")]
pub use self::curl::{CurlEngine, CurlMulti, CurlTransfer};
use crate::{
    dns::{ip_literal, DnsCache, Resolve, SystemResolver},
    profile::ProfileRegistry,
    ResolveError, Result, TransferError,
};

/// Flat option set handed to an engine.
#[derive(Clone, Debug)]
pub struct TransferOptions {
    pub uri: Uri,
    /// Connect to this address instead of resolving the uri host.
    pub resolve: Option<IpAddr>,
    pub timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub low_speed_limit: Option<u32>,
    pub low_speed_time: Option<Duration>,
    pub max_send_speed: Option<u64>,
    pub max_recv_speed: Option<u64>,
    pub max_connects: Option<u32>,
    pub fresh_connect: Option<bool>,
    pub forbid_reuse: Option<bool>,
    pub follow_location: bool,
    pub max_redirects: Option<u32>,
}

impl TransferOptions {
    pub fn new(uri: Uri) -> Self {
        Self {
            uri,
            resolve: None,
            timeout: None,
            connect_timeout: None,
            low_speed_limit: None,
            low_speed_time: None,
            max_send_speed: None,
            max_recv_speed: None,
            max_connects: None,
            fresh_connect: None,
            forbid_reuse: None,
            follow_location: false,
            max_redirects: None,
        }
    }

    #[inline]
    pub fn host(&self) -> Option<&str> {
        self.uri.host()
    }

    /// Explicit port, or the scheme default.
    #[inline]
    pub fn port(&self) -> u16 {
        uri_port(&self.uri)
    }
}

/// Explicit port of `uri`, or the default of its scheme.
pub fn uri_port(uri: &Uri) -> u16 {
    uri.port_u16().unwrap_or(match uri.scheme_str() {
        Some("https") => 443,
        Some("ftp") => 21,
        _ => 80,
    })
}

#[derive(Clone, Debug, Default)]
pub struct TransferOutput {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

type EngineResult<T> = std::result::Result<T, TransferError>;

pub trait Engine {
    fn perform(&mut self, options: &TransferOptions) -> EngineResult<TransferOutput>;
}

impl<E: Engine + ?Sized> Engine for &mut E {
    #[inline]
    fn perform(&mut self, options: &TransferOptions) -> EngineResult<TransferOutput> {
        (**self).perform(options)
    }
}

/// Identity of a handle registered with a [`MultiEngine`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PerformStatus {
    /// The engine has more immediate work; call `perform` again.
    pub call_again: bool,
    /// Transfers still in flight.
    pub running: usize,
}

#[derive(Debug)]
pub struct Completion {
    pub token: Token,
    pub result: EngineResult<()>,
}

pub trait MultiEngine {
    type Handle: Send + 'static;

    /// Register a transfer. On failure the handle is given back.
    fn add_handle(
        &mut self,
        handle: Self::Handle,
    ) -> std::result::Result<Token, (Self::Handle, TransferError)>;

    fn remove_handle(&mut self, token: Token) -> Option<Self::Handle>;

    fn perform(&mut self) -> EngineResult<PerformStatus>;

    /// Block until there is socket activity or `timeout` elapses.
    fn poll(&mut self, timeout: Duration) -> EngineResult<()>;

    fn drain_completions(&mut self) -> Vec<Completion>;
}

/// Runs transfers with per destination settings and cached name
/// resolution applied.
pub struct Session<E, R = SystemResolver> {
    engine: E,
    profiles: Arc<ProfileRegistry>,
    dns: Arc<DnsCache<R>>,
}

impl<E: Engine> Session<E> {
    pub fn new(engine: E) -> Self {
        Self::with_parts(engine, Default::default(), Arc::new(DnsCache::new()))
    }
}

impl<E: Engine, R: Resolve> Session<E, R> {
    pub fn with_parts(engine: E, profiles: Arc<ProfileRegistry>, dns: Arc<DnsCache<R>>) -> Self {
        Self {
            engine,
            profiles,
            dns,
        }
    }

    #[inline]
    pub fn profiles(&self) -> &Arc<ProfileRegistry> {
        &self.profiles
    }

    #[inline]
    pub fn dns(&self) -> &Arc<DnsCache<R>> {
        &self.dns
    }

    #[inline]
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// Options for `uri` with the host's profile and address filled in.
    pub fn prepare(&self, uri: Uri) -> Result<TransferOptions> {
        let mut options = TransferOptions::new(uri);
        let host = options.host().ok_or(ResolveError::NoAuthority)?;
        let profile = self.profiles.get(host);
        let address = match ip_literal(host) {
            Some(ip) => ip,
            None => self.dns.first(host)?,
        };
        profile.apply(&mut options);
        options.resolve = Some(address);
        Ok(options)
    }

    pub fn fetch(&mut self, uri: Uri) -> Result<TransferOutput> {
        let options = self.prepare(uri)?;
        self.perform(&options)
    }

    /// Run an already prepared transfer. A host resolution failure drops the
    /// cached address so the next attempt resolves again.
    pub fn perform(&mut self, options: &TransferOptions) -> Result<TransferOutput> {
        match self.engine.perform(options) {
            Ok(output) => Ok(output),
            Err(e) => {
                #[cfg(feature = "logging")]
                tracing::debug!("transfer of {} failed: {}", options.uri, e);
                if e.is_resolve() {
                    if let Some(host) = options.host() {
                        self.dns.invalidate(host);
                    }
                }
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io, net::Ipv4Addr};

    use super::*;
    use crate::{error::E_COULDNT_RESOLVE_HOST, TransportError};

    #[derive(Default)]
    struct Recorder {
        seen: Vec<TransferOptions>,
        fail_with: Option<TransferError>,
    }

    impl Engine for Recorder {
        fn perform(&mut self, options: &TransferOptions) -> EngineResult<TransferOutput> {
            self.seen.push(options.clone());
            if let Some(e) = self.fail_with.clone() {
                return Err(e);
            }
            Ok(TransferOutput {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: Bytes::from_static(b"hello"),
            })
        }
    }

    fn fixed(host: &str) -> io::Result<Vec<IpAddr>> {
        match host {
            "example.com" => Ok(vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7))]),
            _ => Err(io::Error::new(io::ErrorKind::NotFound, "unknown host")),
        }
    }

    fn session(engine: Recorder) -> Session<Recorder, fn(&str) -> io::Result<Vec<IpAddr>>> {
        Session::with_parts(
            engine,
            Arc::new(ProfileRegistry::new()),
            Arc::new(DnsCache::with_resolver(fixed as fn(&str) -> io::Result<Vec<IpAddr>>)),
        )
    }

    #[test]
    fn fetch_applies_profile_and_address() {
        let mut session = session(Recorder::default());
        session
            .profiles()
            .get_with("example.com", [("timeout", "7"), ("max_recv_speed", "4096")])
            .unwrap();

        let output = session.fetch("http://example.com:8080/a".parse().unwrap()).unwrap();
        assert_eq!(output.status, StatusCode::OK);
        assert_eq!(&output.body[..], b"hello");

        let seen = &session.engine_mut().seen[0];
        assert_eq!(seen.resolve, Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7))));
        assert_eq!(seen.timeout, Some(Duration::from_secs(7)));
        assert_eq!(seen.max_recv_speed, Some(4096));
        assert_eq!(seen.port(), 8080);
        assert!(session.dns().contains("example.com"));
    }

    #[test]
    fn literal_address_skips_dns() {
        let mut session = session(Recorder::default());
        let options = session.prepare("https://10.0.0.1/".parse().unwrap()).unwrap();
        assert_eq!(options.resolve, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert_eq!(options.port(), 443);
        assert!(session.dns().is_empty());
        session.perform(&options).unwrap();
    }

    #[test]
    fn scheme_default_ports() {
        for (uri, port) in [
            ("http://example.com/", 80),
            ("https://example.com/", 443),
            ("ftp://example.com/pub/", 21),
            ("ftp://example.com:2121/", 2121),
            ("gopher://example.com/", 80),
        ] {
            assert_eq!(uri_port(&uri.parse().unwrap()), port, "{uri}");
        }
    }

    #[test]
    fn resolve_failures() {
        let mut session = session(Recorder::default());
        assert!(matches!(
            session.fetch("http://nowhere.test/".parse().unwrap()),
            Err(TransportError::Resolve(ResolveError::Lookup { .. }))
        ));
        assert!(matches!(
            session.prepare("/relative".parse().unwrap()),
            Err(TransportError::Resolve(ResolveError::NoAuthority))
        ));
        assert!(session.engine_mut().seen.is_empty());
    }

    #[test]
    fn engine_resolve_error_invalidates_cache() {
        let mut session = session(Recorder {
            seen: Vec::new(),
            fail_with: Some(TransferError::from_code(E_COULDNT_RESOLVE_HOST, "gone")),
        });
        let err = session.fetch("http://example.com/".parse().unwrap()).unwrap_err();
        assert!(matches!(err, TransportError::Transfer(ref e) if e.is_resolve()));
        assert!(!session.dns().contains("example.com"));
    }
}
