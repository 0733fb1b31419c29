//! Per-target connection/measurement state machine.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::header::{HOST, USER_AGENT};
use http::{Method, Request};
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::{timeout_at, Instant};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use super::{connection_stats, tls, Endpoint, KernelStats, ProbeConfig, ProbeError};
use crate::stats::Stats;

const USER_AGENT_VALUE: &str = concat!("tcptrail/", env!("CARGO_PKG_VERSION"));

/// Stages of a probe round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Idle,
    Resolving,
    Connecting,
    TlsHandshaking,
    RequestSent,
    InfoExtracted,
    Closed,
}

/// An established connection, plaintext or TLS.
enum Conn {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Conn {
    fn tcp(&self) -> &TcpStream {
        match self {
            Conn::Plain(s) => s,
            Conn::Tls(s) => s.get_ref().0,
        }
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_flush(cx),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Probes a single target. Owned by exactly one scheduler loop.
///
/// The stages can be driven one at a time (`connect`, `http_get`,
/// `extract_tcp_info`, `close`) or as a full round with [`ProbeClient::probe`].
pub struct ProbeClient {
    config: Arc<ProbeConfig>,
    endpoint: Result<Endpoint, String>,
    conn: Option<Conn>,
    deadline: Option<Instant>,
    state: ProbeState,
    stats: Stats,
    tcp_info: fn(&TcpStream) -> Result<KernelStats, ProbeError>,
}

impl ProbeClient {
    pub fn new(config: Arc<ProbeConfig>) -> Self {
        let endpoint = Endpoint::parse(&config.target).map_err(|e| e.to_string());
        Self {
            config,
            endpoint,
            conn: None,
            deadline: None,
            state: ProbeState::Idle,
            stats: Stats::default(),
            tcp_info: connection_stats,
        }
    }

    #[cfg(test)]
    fn with_tcp_info(mut self, f: fn(&TcpStream) -> Result<KernelStats, ProbeError>) -> Self {
        self.tcp_info = f;
        self
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn state(&self) -> ProbeState {
        self.state
    }

    /// Name used for TLS SNI: the configured override, else the target host.
    pub fn server_name(&self) -> &str {
        if let Some(name) = self.config.server_name.as_deref() {
            return name;
        }
        match &self.endpoint {
            Ok(ep) => &ep.host,
            Err(_) => &self.config.target,
        }
    }

    /// Run one full round and return the resulting stats.
    ///
    /// Any connect or request failure leaves `State = 0`. Kernel stats that
    /// cannot be read stay zero without failing the round. The connection
    /// is closed on every path.
    pub async fn probe(&mut self) -> Result<&Stats, ProbeError> {
        self.stats.begin_round();
        self.deadline = Some(Instant::now() + self.config.timeout);

        let result = match self.run_stages().await {
            Err(ProbeError::Extraction(e)) => {
                tracing::debug!("No kernel stats for {}: {}", self.config.target, e);
                self.stats.kernel = KernelStats::default();
                Ok(())
            }
            result => result,
        };
        self.stats.state = u8::from(result.is_ok());
        self.close();

        result.map(|_| &self.stats)
    }

    async fn run_stages(&mut self) -> Result<(), ProbeError> {
        self.connect().await?;
        self.http_get().await?;
        self.extract_tcp_info()
    }

    fn deadline(&mut self) -> Instant {
        let timeout = self.config.timeout;
        *self.deadline.get_or_insert_with(|| Instant::now() + timeout)
    }

    /// Resolve the target, dial it and negotiate TLS when the target is secure.
    ///
    /// Failures bump `DNSResolveError` or `TCPConnectError` exactly once.
    pub async fn connect(&mut self) -> Result<(), ProbeError> {
        self.conn = None;
        self.stats.connect_attempts += 1;

        let endpoint = match &self.endpoint {
            Ok(ep) => ep.clone(),
            Err(e) => {
                self.stats.tcp_connect_error += 1;
                return Err(ProbeError::Connect(e.clone()));
            }
        };
        let deadline = self.deadline();

        self.state = ProbeState::Resolving;
        let addrs = match self.resolve(&endpoint, deadline).await {
            Ok(addrs) => addrs,
            Err(e) => {
                self.stats.dns_resolve_error += 1;
                self.state = ProbeState::Closed;
                return Err(e);
            }
        };

        self.state = ProbeState::Connecting;
        let start = Instant::now();
        let stream = match self.dial(&addrs, deadline).await {
            Ok(stream) => stream,
            Err(e) => {
                self.stats.tcp_connect_error += 1;
                self.state = ProbeState::Closed;
                return Err(e);
            }
        };
        self.stats.tcp_connect = micros(start.elapsed());
        let _ = stream.set_nodelay(true);

        if !endpoint.secure {
            self.conn = Some(Conn::Plain(stream));
            return Ok(());
        }

        self.state = ProbeState::TlsHandshaking;
        let start = Instant::now();
        match self.handshake(stream, deadline).await {
            Ok(tls) => {
                self.stats.tls_handshake = micros(start.elapsed()).max(1);
                self.conn = Some(Conn::Tls(Box::new(tls)));
                Ok(())
            }
            Err(e) => {
                self.stats.tcp_connect_error += 1;
                self.state = ProbeState::Closed;
                Err(e)
            }
        }
    }

    async fn resolve(
        &mut self,
        endpoint: &Endpoint,
        deadline: Instant,
    ) -> Result<Vec<SocketAddr>, ProbeError> {
        if let Ok(ip) = endpoint.host.parse() {
            return Ok(vec![SocketAddr::new(ip, endpoint.port)]);
        }

        let start = Instant::now();
        let lookup = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port));
        let resolution = |reason: String| ProbeError::Resolution {
            host: endpoint.host.clone(),
            reason,
        };

        let addrs: Vec<SocketAddr> = match timeout_at(deadline, lookup).await {
            Ok(Ok(addrs)) => addrs.collect(),
            Ok(Err(e)) => return Err(resolution(e.to_string())),
            Err(_) => return Err(resolution("timed out".to_string())),
        };
        self.stats.dns_resolve = micros(start.elapsed());

        if addrs.is_empty() {
            return Err(resolution("no addresses found".to_string()));
        }
        Ok(addrs)
    }

    /// Dial each resolved address in order until one connects.
    async fn dial(&self, addrs: &[SocketAddr], deadline: Instant) -> Result<TcpStream, ProbeError> {
        let mut last_err = None;
        for addr in addrs {
            match self.dial_one(*addr, deadline).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::debug!("dial {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ProbeError::Connect("no addresses to dial".to_string())))
    }

    async fn dial_one(&self, addr: SocketAddr, deadline: Instant) -> Result<TcpStream, ProbeError> {
        let connect_err = |e: io::Error| ProbeError::Connect(format!("{}: {}", addr, e));

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(connect_err)?;
        socket.set_nonblocking(true).map_err(connect_err)?;
        if let Some(src) = self.config.src_addr {
            socket.bind(&src.into()).map_err(|e| {
                ProbeError::Connect(format!("bind {} failed: {}", src, e))
            })?;
        }

        let socket = TcpSocket::from_std_stream(socket.into());
        match timeout_at(deadline, socket.connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(connect_err(e)),
            Err(_) => Err(ProbeError::Connect(format!(
                "{}: timed out after {:?}",
                addr, self.config.timeout
            ))),
        }
    }

    async fn handshake(
        &self,
        stream: TcpStream,
        deadline: Instant,
    ) -> Result<TlsStream<TcpStream>, ProbeError> {
        let connector = TlsConnector::from(tls::client_config(self.config.insecure)?);
        let name = tls::server_name(self.server_name())?;

        match timeout_at(deadline, connector.connect(name, stream)).await {
            Ok(Ok(tls)) => Ok(tls),
            Ok(Err(e)) => Err(ProbeError::Tls(e.to_string())),
            Err(_) => Err(ProbeError::Tls(format!("timed out after {:?}", self.config.timeout))),
        }
    }

    /// Issue a single GET over the established connection.
    ///
    /// Redirects are not followed; their status code is the result.
    pub async fn http_get(&mut self) -> Result<(), ProbeError> {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| ProbeError::Request("not connected".to_string()))?;
        let endpoint = self
            .endpoint
            .clone()
            .map_err(ProbeError::Request)?;
        let deadline = self.deadline();

        let result = timeout_at(deadline, self.exchange(conn, &endpoint)).await;
        match result {
            Ok(Ok(conn)) => {
                self.conn = Some(conn);
                self.state = ProbeState::RequestSent;
                Ok(())
            }
            Ok(Err(e)) => {
                self.state = ProbeState::Closed;
                Err(e)
            }
            Err(_) => {
                self.state = ProbeState::Closed;
                Err(ProbeError::Request(format!(
                    "timed out after {:?}",
                    self.config.timeout
                )))
            }
        }
    }

    /// Run the request/response exchange and hand the connection back intact.
    async fn exchange(&mut self, conn: Conn, endpoint: &Endpoint) -> Result<Conn, ProbeError> {
        let request_err = |e: hyper::Error| ProbeError::Request(e.to_string());

        let (mut sender, connection) = http1::handshake::<_, Empty<Bytes>>(TokioIo::new(conn))
            .await
            .map_err(request_err)?;
        let driver = tokio::spawn(connection.without_shutdown());
        let _abort = AbortOnDrop(driver.abort_handle());

        let req = Request::builder()
            .method(Method::GET)
            .uri(endpoint.path.as_str())
            .header(HOST, endpoint.authority())
            .header(USER_AGENT, USER_AGENT_VALUE)
            .body(Empty::<Bytes>::new())
            .map_err(|e| ProbeError::Request(e.to_string()))?;

        let start = Instant::now();
        let response = sender.send_request(req).await.map_err(request_err)?;
        self.stats.http_request = micros(start.elapsed());
        self.stats.http_status_code = response.status().as_u16();

        let start = Instant::now();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(request_err)?
            .to_bytes();
        self.stats.http_response = micros(start.elapsed());
        self.stats.http_rcvd_bytes = body.len() as i64;

        // With the sender gone the connection task finishes and returns the io.
        drop(sender);
        let parts = driver
            .await
            .map_err(|e| ProbeError::Request(e.to_string()))?
            .map_err(request_err)?;
        Ok(parts.io.into_inner())
    }

    /// Populate the kernel TCP fields from the live connection.
    pub fn extract_tcp_info(&mut self) -> Result<(), ProbeError> {
        let conn = self
            .conn
            .as_ref()
            .ok_or_else(|| ProbeError::Extraction("not connected".to_string()))?;
        self.stats.kernel = (self.tcp_info)(conn.tcp())?;
        self.state = ProbeState::InfoExtracted;
        Ok(())
    }

    /// Release the connection and end the current deadline. Safe to call
    /// repeatedly.
    pub fn close(&mut self) {
        self.conn = None;
        self.deadline = None;
        if self.state != ProbeState::Idle {
            self.state = ProbeState::Closed;
        }
    }
}

struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn micros(d: Duration) -> i64 {
    d.as_micros().min(i64::MAX as u128) as i64
}

#[cfg(test)]
pub(crate) mod testutil {
    //! HTTP/1.1 fixture servers, plaintext and TLS.

    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::Arc;

    use bytes::Bytes;
    use http::{Request, Response, StatusCode};
    use http_body_util::Full;
    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    pub const BODY: &str = "Hello, TCPProbe\n";

    type Headers = &'static [(&'static str, &'static str)];

    async fn serve_http<S>(stream: S, status: StatusCode, headers: Headers)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service = service_fn(move |_req: Request<Incoming>| async move {
            let mut builder = Response::builder()
                .status(status)
                .header("content-type", "text/plain");
            for (name, value) in headers {
                builder = builder.header(*name, *value);
            }
            let body = Full::new(Bytes::from_static(BODY.as_bytes()));
            Ok::<_, Infallible>(builder.body(body).unwrap())
        });
        let _ = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .await;
    }

    /// Plain HTTP server answering every request with `BODY`.
    pub async fn http_server() -> SocketAddr {
        status_server(StatusCode::OK, &[]).await
    }

    /// Plain HTTP server answering with a custom status and extra headers.
    pub async fn status_server(status: StatusCode, headers: Headers) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                tokio::spawn(serve_http(sock, status, headers));
            }
        });
        addr
    }

    /// HTTPS server with a self-signed certificate for `localhost`.
    pub async fn https_server() -> SocketAddr {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_der = CertificateDer::from(cert.cert.der().to_vec());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .unwrap();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Ok(tls) = acceptor.accept(sock).await {
                        serve_http(tls, StatusCode::OK, &[]).await;
                    }
                });
            }
        });
        addr
    }
}
