use std::{collections::HashMap, net::IpAddr, time::Duration};

use bytes::Bytes;
use curl::{
    easy::{Easy2, Handler, List, WriteError},
    multi::{Easy2Handle, Multi},
};
use http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};

use super::{
    Completion, Engine, EngineResult, MultiEngine, PerformStatus, Token, TransferOptions,
    TransferOutput,
};
use crate::{TransferError, TransferErrorKind};

#[derive(Default, Debug)]
struct Collector {
    body: Vec<u8>,
    headers: HeaderMap,
}

impl Collector {
    fn clear(&mut self) {
        self.body.clear();
        self.headers.clear();
    }
}

impl Handler for Collector {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        self.body.extend_from_slice(data);
        Ok(data.len())
    }

    fn header(&mut self, data: &[u8]) -> bool {
        // Every response in a redirect chain starts with a status line.
        if data.starts_with(b"HTTP/") {
            self.headers.clear();
            return true;
        }
        let Some(colon) = data.iter().position(|&b| b == b':') else {
            return true;
        };
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(trim(&data[..colon])),
            HeaderValue::from_bytes(trim(&data[colon + 1..])),
        ) {
            self.headers.append(name, value);
        }
        true
    }
}

fn trim(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if !first.is_ascii_whitespace() {
            break;
        }
        bytes = rest;
    }
    while let [rest @ .., last] = bytes {
        if !last.is_ascii_whitespace() {
            break;
        }
        bytes = rest;
    }
    bytes
}

fn transfer_error(e: curl::Error) -> TransferError {
    let message = e.extra_description().unwrap_or(e.description()).to_owned();
    TransferError::from_code(e.code() as i32, message)
}

fn multi_error(e: curl::MultiError) -> TransferError {
    TransferError::new(TransferErrorKind::Other, e.code() as i32, e.description())
}

fn resolve_entry(host: &str, port: u16, addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => format!("{host}:{port}:{v4}"),
        IpAddr::V6(v6) => format!("{host}:{port}:[{v6}]"),
    }
}

fn configure(easy: &mut Easy2<Collector>, options: &TransferOptions) -> Result<(), curl::Error> {
    easy.signal(false)?;
    easy.url(&options.uri.to_string())?;
    if let (Some(addr), Some(host)) = (options.resolve, options.host()) {
        let mut list = List::new();
        list.append(&resolve_entry(host, options.port(), addr))?;
        easy.resolve(list)?;
    }
    if let Some(v) = options.timeout {
        easy.timeout(v)?;
    }
    if let Some(v) = options.connect_timeout {
        easy.connect_timeout(v)?;
    }
    if let Some(v) = options.low_speed_limit {
        easy.low_speed_limit(v)?;
    }
    if let Some(v) = options.low_speed_time {
        easy.low_speed_time(v)?;
    }
    if let Some(v) = options.max_send_speed {
        easy.max_send_speed(v)?;
    }
    if let Some(v) = options.max_recv_speed {
        easy.max_recv_speed(v)?;
    }
    if let Some(v) = options.max_connects {
        easy.max_connects(v)?;
    }
    if let Some(v) = options.fresh_connect {
        easy.fresh_connect(v)?;
    }
    if let Some(v) = options.forbid_reuse {
        easy.forbid_reuse(v)?;
    }
    easy.follow_location(options.follow_location)?;
    if let Some(v) = options.max_redirects {
        easy.max_redirections(v)?;
    }
    Ok(())
}

fn collect(easy: &mut Easy2<Collector>) -> Result<TransferOutput, curl::Error> {
    let code = easy.response_code()?;
    let collector = easy.get_mut();
    Ok(TransferOutput {
        // Transfers without a status line report 0.
        status: u16::try_from(code)
            .ok()
            .and_then(|c| StatusCode::from_u16(c).ok())
            .unwrap_or_default(),
        headers: std::mem::take(&mut collector.headers),
        body: Bytes::from(std::mem::take(&mut collector.body)),
    })
}

/// Blocking engine over one reused libcurl easy handle, so connections stay
/// cached between transfers.
pub struct CurlEngine {
    easy: Easy2<Collector>,
}

impl CurlEngine {
    pub fn new() -> Self {
        Self {
            easy: Easy2::new(Collector::default()),
        }
    }
}

impl Default for CurlEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for CurlEngine {
    fn perform(&mut self, options: &TransferOptions) -> EngineResult<TransferOutput> {
        self.easy.reset();
        self.easy.get_mut().clear();
        configure(&mut self.easy, options).map_err(transfer_error)?;
        self.easy.perform().map_err(transfer_error)?;
        collect(&mut self.easy).map_err(transfer_error)
    }
}

/// A transfer submitted to [`CurlMulti`]. Its output is filled in when the
/// multi engine hands it back.
#[derive(Debug)]
pub struct CurlTransfer {
    options: TransferOptions,
    output: Option<TransferOutput>,
}

impl CurlTransfer {
    pub fn new(options: TransferOptions) -> Self {
        Self {
            options,
            output: None,
        }
    }

    #[inline]
    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    #[inline]
    pub fn output(&self) -> Option<&TransferOutput> {
        self.output.as_ref()
    }

    #[inline]
    pub fn into_output(self) -> Option<TransferOutput> {
        self.output
    }
}

/// Multiplexing engine over the libcurl multi interface.
pub struct CurlMulti {
    multi: Multi,
    handles: HashMap<usize, (Easy2Handle<Collector>, CurlTransfer)>,
    next_token: usize,
}

impl CurlMulti {
    pub fn new() -> Self {
        Self {
            multi: Multi::new(),
            handles: HashMap::new(),
            next_token: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for CurlMulti {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiEngine for CurlMulti {
    type Handle = CurlTransfer;

    fn add_handle(
        &mut self,
        transfer: CurlTransfer,
    ) -> Result<Token, (CurlTransfer, TransferError)> {
        let mut easy = Easy2::new(Collector::default());
        if let Err(e) = configure(&mut easy, &transfer.options) {
            return Err((transfer, transfer_error(e)));
        }
        let mut handle = match self.multi.add2(easy) {
            Ok(handle) => handle,
            Err(e) => return Err((transfer, multi_error(e))),
        };
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        if let Err(e) = handle.set_token(token) {
            let _ = self.multi.remove2(handle);
            return Err((transfer, transfer_error(e)));
        }
        self.handles.insert(token, (handle, transfer));
        Ok(Token(token))
    }

    fn remove_handle(&mut self, token: Token) -> Option<CurlTransfer> {
        let (handle, mut transfer) = self.handles.remove(&token.0)?;
        match self.multi.remove2(handle) {
            Ok(mut easy) => transfer.output = collect(&mut easy).ok(),
            Err(_e) => {
                #[cfg(feature = "logging")]
                tracing::error!("remove curl handle {} failed: {}", token.0, _e);
            }
        }
        Some(transfer)
    }

    fn perform(&mut self) -> EngineResult<PerformStatus> {
        let running = self.multi.perform().map_err(multi_error)?;
        Ok(PerformStatus {
            call_again: false,
            running: running as usize,
        })
    }

    fn poll(&mut self, timeout: Duration) -> EngineResult<()> {
        self.multi
            .wait(&mut [], timeout)
            .map(|_| ())
            .map_err(multi_error)
    }

    fn drain_completions(&mut self) -> Vec<Completion> {
        let mut done = Vec::new();
        self.multi.messages(|message| {
            if let (Ok(token), Some(result)) = (message.token(), message.result()) {
                done.push(Completion {
                    token: Token(token),
                    result: result.map_err(transfer_error),
                });
            }
        });
        done
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::{Ipv4Addr, TcpListener},
        thread,
    };

    use super::*;

    fn serve_once(body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nX-Test: yes\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).unwrap();
        });
        port
    }

    #[test]
    fn easy_transfer_with_pinned_address() {
        let port = serve_once("hello");
        let mut options =
            TransferOptions::new(format!("http://pinned.test:{port}/").parse().unwrap());
        options.resolve = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
        options.timeout = Some(Duration::from_secs(5));

        let output = CurlEngine::new().perform(&options).unwrap();
        assert_eq!(output.status, StatusCode::OK);
        assert_eq!(output.headers["x-test"], "yes");
        assert_eq!(&output.body[..], b"hello");
    }

    #[test]
    fn refused_connection_is_classified() {
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let options = TransferOptions::new(format!("http://127.0.0.1:{port}/").parse().unwrap());
        let err = CurlEngine::new().perform(&options).unwrap_err();
        assert_eq!(err.kind(), TransferErrorKind::Connect);
    }

    #[test]
    fn multi_transfer_completes() {
        let port = serve_once("multi");
        let mut multi = CurlMulti::new();
        let mut options =
            TransferOptions::new(format!("http://127.0.0.1:{port}/").parse().unwrap());
        options.timeout = Some(Duration::from_secs(5));
        let token = multi.add_handle(CurlTransfer::new(options)).unwrap();

        let mut done = Vec::new();
        while done.is_empty() {
            multi.perform().unwrap();
            done = multi.drain_completions();
            if done.is_empty() {
                multi.poll(Duration::from_millis(100)).unwrap();
            }
        }
        assert_eq!(done[0].token, token);
        assert!(done[0].result.is_ok());
        let transfer = multi.remove_handle(token).unwrap();
        assert!(multi.is_empty());
        assert_eq!(&transfer.into_output().unwrap().body[..], b"multi");
    }
}
