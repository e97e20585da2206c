//! Transport State Machine.
//!
//! A [`Transport`] owns one TCP socket and, once TLS has started, a rustls
//! session layered on the same socket. All socket work is done with
//! non-blocking attempts (see [`engine`]) driven by a small loop that waits
//! for readability or writability as each attempt requests.
//!
//! The transport is single-owner: every operation takes `&mut self`, so the
//! write buffer and the socket registration are never touched from two tasks
//! at once. Dropping the transport (or the future of any of its operations)
//! closes the socket and deregisters it from the reactor.

mod context;
mod engine;
mod flow;
mod state;

pub use context::TlsContext;
pub use engine::IoOutcome;
pub use flow::{WriteBuffer, HIGH_WATERMARK, LOW_WATERMARK};
pub use state::TransportState;

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use futures_util::future::BoxFuture;
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::error::{TransportError, VerifyError};
use engine::{raw_read_step, raw_write_step, TlsEngine};

/// How long `close()` waits for the peer's close_notify before giving up on
/// a two-way TLS shutdown.
pub const TLS_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Asynchronous step run after the TLS handshake and before the transport is
/// declared `TlsOpen`. An error tears the connection down.
pub type PostHandshakeHook =
    Box<dyn FnOnce(TransportInfo) -> BoxFuture<'static, Result<(), VerifyError>> + Send>;

/// Decides, when the peer half-closes, whether to stay half-open (`true`)
/// or to shut the transport down (`false`).
pub type EofHandler = Box<dyn FnMut() -> bool + Send>;

pub type CloseCallback = Box<dyn FnOnce(CloseReason) + Send>;

/// Why the transport reached `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Closed,
    Aborted,
    Failed(String),
    Dropped,
}

/// Negotiated parameters of the TLS session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSessionInfo {
    pub protocol_version: Option<String>,
    pub cipher_suite: Option<String>,
}

/// Snapshot of the transport's metadata, handed to post-handshake hooks and
/// to the framed-protocol layer.
#[derive(Debug, Clone, Default)]
pub struct TransportInfo {
    pub tls_context: Option<TlsContext>,
    pub tls_session: Option<TlsSessionInfo>,
    pub peer_certificates: Vec<CertificateDer<'static>>,
    pub peer_address: Option<SocketAddr>,
    pub peer_hostname_hint: Option<String>,
    pub server_hostname: Option<String>,
}

impl TransportInfo {
    /// The leaf certificate presented by the peer.
    pub fn peer_certificate(&self) -> Option<&CertificateDer<'static>> {
        self.peer_certificates.first()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtraInfoKey {
    TlsContext,
    TlsConnectionHandle,
    PeerCertificate,
    PeerAddress,
    PeerHostnameHint,
    ServerHostname,
}

impl ExtraInfoKey {
    pub fn name(self) -> &'static str {
        match self {
            Self::TlsContext => "tls_context",
            Self::TlsConnectionHandle => "tls_connection_handle",
            Self::PeerCertificate => "peer_certificate",
            Self::PeerAddress => "peer_address",
            Self::PeerHostnameHint => "peer_hostname_hint",
            Self::ServerHostname => "server_hostname",
        }
    }
}

impl FromStr for ExtraInfoKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tls_context" => Ok(Self::TlsContext),
            "tls_connection_handle" => Ok(Self::TlsConnectionHandle),
            "peer_certificate" => Ok(Self::PeerCertificate),
            "peer_address" => Ok(Self::PeerAddress),
            "peer_hostname_hint" => Ok(Self::PeerHostnameHint),
            "server_hostname" => Ok(Self::ServerHostname),
            other => Err(format!("unknown transport info key: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ExtraInfo {
    TlsContext(TlsContext),
    TlsSession(TlsSessionInfo),
    PeerCertificate(CertificateDer<'static>),
    PeerAddress(SocketAddr),
    Hostname(String),
}

pub struct Transport {
    socket: Option<TcpStream>,
    state: TransportState,
    tls: Option<TlsEngine>,
    tls_context: Option<TlsContext>,
    tls_session: Option<TlsSessionInfo>,
    peer_certificates: Vec<CertificateDer<'static>>,
    write_buffer: WriteBuffer,
    peer_address: Option<SocketAddr>,
    peer_hostname_hint: Option<String>,
    server_hostname: Option<String>,
    eof_handler: Option<EofHandler>,
    on_closed: Option<CloseCallback>,
    finalized: bool,
}

impl Transport {
    /// Wrap a connected socket. The transport starts in `RawOpen`.
    pub fn connect(socket: TcpStream, peer_hostname_hint: Option<&str>) -> Self {
        let peer_address = socket.peer_addr().ok();
        debug!(peer = ?peer_address, hint = ?peer_hostname_hint, "Transport open (raw)");
        Self {
            socket: Some(socket),
            state: TransportState::RawOpen,
            tls: None,
            tls_context: None,
            tls_session: None,
            peer_certificates: Vec::new(),
            write_buffer: WriteBuffer::default(),
            peer_address,
            peer_hostname_hint: peer_hostname_hint.map(str::to_string),
            server_hostname: None,
            eof_handler: None,
            on_closed: None,
            finalized: false,
        }
    }

    /// Wrap a connected socket and go straight into the TLS handshake
    /// (implicit TLS, e.g. `_xmpps-client` endpoints).
    pub async fn connect_tls(
        socket: TcpStream,
        peer_hostname_hint: Option<&str>,
        context: TlsContext,
        server_name: &str,
        post_handshake: Option<PostHandshakeHook>,
    ) -> Result<Self, TransportError> {
        let mut transport = Self::connect(socket, peer_hostname_hint);
        transport.start_tls(context, server_name, post_handshake).await?;
        Ok(transport)
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn tls_active(&self) -> bool {
        matches!(
            self.state,
            TransportState::TlsOpen | TransportState::TlsEofReceived
        )
    }

    pub fn is_closed(&self) -> bool {
        self.state == TransportState::Closed
    }

    pub fn set_eof_handler(&mut self, handler: EofHandler) {
        self.eof_handler = Some(handler);
    }

    /// Register the terminal-cleanup callback. It fires exactly once.
    pub fn on_closed(&mut self, callback: CloseCallback) {
        self.on_closed = Some(callback);
    }

    /// Observe writer backpressure: `true` while the write buffer is above
    /// the high watermark and has not yet drained to the low one.
    pub fn backpressure(&self) -> watch::Receiver<bool> {
        self.write_buffer.subscribe()
    }

    pub fn buffered_len(&self) -> usize {
        self.write_buffer.len()
    }

    /// Upgrade the raw stream to TLS.
    ///
    /// Valid only in `RawOpen`. Drives the handshake to completion, then runs
    /// `post_handshake` (if any) before entering `TlsOpen`. Any failure aborts
    /// the transport.
    pub async fn start_tls(
        &mut self,
        context: TlsContext,
        server_name: &str,
        post_handshake: Option<PostHandshakeHook>,
    ) -> Result<(), TransportError> {
        if self.state != TransportState::RawOpen {
            return Err(TransportError::InvalidState {
                state: self.state,
                operation: "start TLS",
            });
        }
        if let Err(e) = self.drain_write_buffer().await {
            self.fail(&e);
            return Err(e);
        }

        let name = ServerName::try_from(server_name.to_string()).map_err(|e| {
            TransportError::Config(format!("invalid server name {server_name}: {e}"))
        })?;
        let engine = context
            .build_client_config()
            .and_then(|config| TlsEngine::new(config, name))?;

        self.tls = Some(engine);
        self.tls_context = Some(context);
        self.server_hostname = Some(server_name.to_string());
        self.set_state(TransportState::TlsHandshaking);
        debug!(server_name, peer = ?self.peer_address, "Starting TLS handshake");

        match self.handshake(post_handshake).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(server_name, error = %e, "TLS handshake failed");
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn handshake(
        &mut self,
        post_handshake: Option<PostHandshakeHook>,
    ) -> Result<(), TransportError> {
        {
            let (sock, engine) = self.tls_parts()?;
            drive(sock, |s| engine.handshake_step(s)).await?;
        }
        if let Some(engine) = &self.tls {
            self.peer_certificates = engine.peer_certificates().unwrap_or_default();
            self.tls_session = Some(TlsSessionInfo {
                protocol_version: engine.protocol_version(),
                cipher_suite: engine.cipher_suite(),
            });
        }
        info!(
            server_name = ?self.server_hostname,
            version = ?self.tls_session.as_ref().and_then(|s| s.protocol_version.clone()),
            cipher = ?self.tls_session.as_ref().and_then(|s| s.cipher_suite.clone()),
            "TLS handshake complete"
        );

        if let Some(hook) = post_handshake {
            debug!("Running post-handshake certificate checks");
            hook(self.extra_info()).await?;
        }
        self.set_state(TransportState::TlsOpen);
        Ok(())
    }

    /// Read up to `buf.len()` bytes. `Ok(0)` means the peer closed its side;
    /// afterwards the transport is either half-open (EOF handler returned
    /// `true`) or closed.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.state {
            TransportState::RawOpen | TransportState::TlsOpen => {}
            TransportState::RawEofReceived | TransportState::TlsEofReceived => return Ok(0),
            state => {
                return Err(TransportError::InvalidState {
                    state,
                    operation: "read",
                })
            }
        }

        let result = {
            let Self { socket, tls, .. } = self;
            match socket.as_ref() {
                None => Ok(0),
                Some(sock) => match tls.as_mut() {
                    Some(engine) => drive(sock, |s| engine.read_step(s, buf)).await,
                    None => drive(sock, |s| raw_read_step(s, buf)).await,
                },
            }
        };

        match result {
            Ok(0) if !buf.is_empty() => {
                self.handle_eof().await;
                Ok(0)
            }
            Ok(n) => {
                trace!(bytes = n, "Transport read");
                Ok(n)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn handle_eof(&mut self) {
        let next = if self.tls.is_some() {
            TransportState::TlsEofReceived
        } else {
            TransportState::RawEofReceived
        };
        self.set_state(next);
        let keep_open = self.eof_handler.as_mut().map(|h| h()).unwrap_or(false);
        debug!(keep_open, "Peer closed its side of the transport");
        if !keep_open {
            self.close().await;
        }
    }

    /// Queue `data` for sending and push out as much as the socket accepts
    /// without waiting. Rejected unless the state is writable.
    pub fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if !self.state.is_writable() {
            return Err(TransportError::NotWritable(self.state));
        }
        if data.is_empty() {
            return Ok(());
        }
        self.write_buffer.push(data);
        if let Err(e) = self.try_flush_now() {
            self.fail(&e);
            return Err(e);
        }
        Ok(())
    }

    /// Wait until every queued byte has been handed to the socket.
    pub async fn flush(&mut self) -> Result<(), TransportError> {
        if let Err(e) = self.drain_write_buffer().await {
            self.fail(&e);
            return Err(e);
        }
        Ok(())
    }

    /// `write` followed by `flush`.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.write(data)?;
        self.flush().await
    }

    fn try_flush_now(&mut self) -> Result<(), TransportError> {
        let Self {
            socket,
            tls,
            write_buffer,
            ..
        } = self;
        let Some(sock) = socket.as_ref() else {
            return Ok(());
        };
        while !write_buffer.is_empty() {
            let outcome = match tls.as_mut() {
                Some(engine) => engine.write_step(sock, write_buffer.pending()),
                None => raw_write_step(sock, write_buffer.pending()),
            };
            match outcome {
                IoOutcome::Progressed(n) => write_buffer.consume(n),
                IoOutcome::WouldBlockOnRead | IoOutcome::WouldBlockOnWrite => break,
                IoOutcome::Fatal(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn drain_write_buffer(&mut self) -> Result<(), TransportError> {
        let Self {
            socket,
            tls,
            write_buffer,
            state,
            ..
        } = self;
        let Some(sock) = socket.as_ref() else {
            if write_buffer.is_empty() {
                return Ok(());
            }
            return Err(TransportError::InvalidState {
                state: *state,
                operation: "flush",
            });
        };
        while !write_buffer.is_empty() {
            let n = match tls.as_mut() {
                Some(engine) => drive(sock, |s| engine.write_step(s, write_buffer.pending())).await?,
                None => drive(sock, |s| raw_write_step(s, write_buffer.pending())).await?,
            };
            write_buffer.consume(n);
        }
        if let Some(engine) = tls.as_mut() {
            if engine.has_pending_output() {
                drive(sock, |s| engine.flush_step(s)).await?;
            }
        }
        Ok(())
    }

    /// Graceful close.
    ///
    /// Mid-handshake this is an abort. Otherwise queued data is flushed
    /// first, a TLS session performs its close_notify exchange (bounded by
    /// [`TLS_SHUTDOWN_GRACE`]), and the socket is closed. Closing a closed
    /// transport is a no-op.
    pub async fn close(&mut self) {
        match self.state {
            TransportState::Closed => {
                debug!("close() on a closed transport ignored");
                return;
            }
            TransportState::TlsHandshaking => {
                debug!("close() during TLS handshake, aborting");
                self.abort();
                return;
            }
            TransportState::TlsShuttingDown | TransportState::TlsShutDown => {
                debug!("close() while already shutting down");
                self.finalize(CloseReason::Closed);
                return;
            }
            _ => {}
        }

        if let Err(e) = self.drain_write_buffer().await {
            warn!(error = %e, "Failed to flush pending data before close");
            self.fail(&e);
            return;
        }

        if self.tls.is_some() {
            self.set_state(TransportState::TlsShuttingDown);
            let result = match self.tls_parts() {
                Ok((sock, engine)) => {
                    tokio::time::timeout(
                        TLS_SHUTDOWN_GRACE,
                        drive(sock, |s| engine.shutdown_step(s)),
                    )
                    .await
                }
                Err(e) => Ok(Err(e)),
            };
            match result {
                Ok(Ok(_)) => {
                    self.set_state(TransportState::TlsShutDown);
                    debug!("TLS shutdown complete");
                }
                Ok(Err(e)) => debug!(error = %e, "TLS shutdown failed, closing socket"),
                Err(_) => debug!(
                    grace_secs = TLS_SHUTDOWN_GRACE.as_secs(),
                    "Peer did not answer close_notify, closing socket"
                ),
            }
        }
        self.finalize(CloseReason::Closed);
    }

    /// Hard close: drop any queued data and the TLS session immediately.
    pub fn abort(&mut self) {
        if self.finalized {
            debug!("abort() on a closed transport ignored");
            return;
        }
        self.finalize(CloseReason::Aborted);
    }

    pub fn extra_info(&self) -> TransportInfo {
        TransportInfo {
            tls_context: self.tls_context.clone(),
            tls_session: self.tls_session.clone(),
            peer_certificates: self.peer_certificates.clone(),
            peer_address: self.peer_address,
            peer_hostname_hint: self.peer_hostname_hint.clone(),
            server_hostname: self.server_hostname.clone(),
        }
    }

    pub fn get_extra_info(&self, key: ExtraInfoKey) -> Option<ExtraInfo> {
        match key {
            ExtraInfoKey::TlsContext => self.tls_context.clone().map(ExtraInfo::TlsContext),
            ExtraInfoKey::TlsConnectionHandle => {
                if self.tls.is_some() {
                    self.tls_session.clone().map(ExtraInfo::TlsSession)
                } else {
                    None
                }
            }
            ExtraInfoKey::PeerCertificate => self
                .peer_certificates
                .first()
                .cloned()
                .map(ExtraInfo::PeerCertificate),
            ExtraInfoKey::PeerAddress => self.peer_address.map(ExtraInfo::PeerAddress),
            ExtraInfoKey::PeerHostnameHint => {
                self.peer_hostname_hint.clone().map(ExtraInfo::Hostname)
            }
            ExtraInfoKey::ServerHostname => self.server_hostname.clone().map(ExtraInfo::Hostname),
        }
    }

    fn tls_parts(&mut self) -> Result<(&TcpStream, &mut TlsEngine), TransportError> {
        match (self.socket.as_ref(), self.tls.as_mut()) {
            (Some(sock), Some(engine)) => Ok((sock, engine)),
            _ => Err(TransportError::InvalidState {
                state: self.state,
                operation: "drive TLS",
            }),
        }
    }

    fn set_state(&mut self, next: TransportState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transport transition {:?} -> {:?}",
            self.state,
            next
        );
        trace!(from = ?self.state, to = ?next, "Transport state change");
        self.state = next;
    }

    fn fail(&mut self, error: &TransportError) {
        if !self.finalized {
            debug!(error = %error, state = ?self.state, "Transport failed, tearing down");
        }
        self.finalize(CloseReason::Failed(error.to_string()));
    }

    /// Terminal cleanup. Runs once; later calls do nothing.
    fn finalize(&mut self, reason: CloseReason) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        self.tls = None;
        // Dropping the socket deregisters it from the reactor and closes it.
        self.socket = None;
        self.write_buffer.clear();
        if self.state != TransportState::Closed {
            self.set_state(TransportState::Closed);
        }
        debug!(reason = ?reason, peer = ?self.peer_address, "Transport closed");
        if let Some(callback) = self.on_closed.take() {
            callback(reason);
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if !self.finalized {
            self.finalize(CloseReason::Dropped);
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("state", &self.state)
            .field("peer_address", &self.peer_address)
            .field("server_hostname", &self.server_hostname)
            .field("buffered", &self.write_buffer.len())
            .finish()
    }
}

/// Repeat `step` until it makes progress, waiting on the socket for whatever
/// direction the last attempt was blocked on.
async fn drive(
    sock: &TcpStream,
    mut step: impl FnMut(&TcpStream) -> IoOutcome,
) -> Result<usize, TransportError> {
    loop {
        match step(sock) {
            IoOutcome::Progressed(n) => return Ok(n),
            IoOutcome::WouldBlockOnRead => sock.readable().await?,
            IoOutcome::WouldBlockOnWrite => sock.writable().await?,
            IoOutcome::Fatal(e) => return Err(e),
        }
    }
}
