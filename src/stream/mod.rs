//! Framed negotiation layer.
//!
//! [`NonzaStream`] is the port the security core talks through: send a few
//! negotiation elements and wait for one of a set of acceptable replies,
//! restart the stream and collect the new features, or fail the stream with
//! an error the peer can see. [`XmppStream`] implements it over a
//! [`Transport`].

pub mod framing;
pub mod nonza;

pub use framing::{extract_frame, stream_header, Frame, FrameScanner};
pub use nonza::{Nonza, NonzaKind, StartTlsFeature, StreamFeatures};

use std::borrow::Cow;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use crate::error::StreamError;
use crate::transport::{PostHandshakeHook, TlsContext, Transport};

/// Bound on buffered, not yet framed input during negotiation.
pub const MAX_NEGOTIATION_BUFFER: usize = 1024 * 1024;

/// Default bound on STARTTLS and stream-restart waits.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

const READ_CHUNK: usize = 8 * 1024;

/// The framed-protocol surface used by STARTTLS and SASL negotiation.
pub trait NonzaStream: Send {
    /// Send `nonzas` in order, then wait for the next negotiation element.
    /// A reply whose kind is not in `expected` is a protocol violation.
    fn send_and_wait_for<'a>(
        &'a mut self,
        nonzas: Vec<Nonza>,
        expected: &'a [NonzaKind],
    ) -> BoxFuture<'a, Result<Nonza, StreamError>>;

    /// Restart the stream (new header, fresh parser) and return the features
    /// the peer advertises on the new stream.
    fn reset_and_get_features<'a>(
        &'a mut self,
        timeout: Option<Duration>,
    ) -> BoxFuture<'a, Result<StreamFeatures, StreamError>>;

    /// Wait for the features of the current stream.
    fn wait_for_features<'a>(
        &'a mut self,
        timeout: Option<Duration>,
    ) -> BoxFuture<'a, Result<StreamFeatures, StreamError>>;

    /// Tell the peer the stream is being torn down, then close it.
    fn send_stream_error<'a>(
        &'a mut self,
        condition: &'a str,
        text: Option<&'a str>,
    ) -> BoxFuture<'a, ()>;

    fn tls_active(&self) -> bool;
}

/// Client side of an XMPP stream over a [`Transport`].
#[derive(Debug)]
pub struct XmppStream {
    transport: Transport,
    domain: String,
    buffer: Vec<u8>,
    scanner: FrameScanner,
    header: Option<String>,
    features: Option<StreamFeatures>,
}

impl XmppStream {
    /// Wrap a transport. Nothing is sent until [`XmppStream::start`] (or a
    /// reset) opens the stream.
    pub fn new(transport: Transport, domain: &str) -> Self {
        Self {
            transport,
            domain: domain.to_string(),
            buffer: Vec::new(),
            scanner: FrameScanner::default(),
            header: None,
            features: None,
        }
    }

    /// Send the initial stream header and wait for the first features.
    pub async fn start(&mut self, timeout: Option<Duration>) -> Result<StreamFeatures, StreamError> {
        self.restart(timeout).await
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    pub fn into_transport(self) -> Transport {
        self.transport
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The most recent `<stream:features/>`.
    pub fn features(&self) -> Option<&StreamFeatures> {
        self.features.as_ref()
    }

    /// The peer's last stream header, as received.
    pub fn peer_header(&self) -> Option<&str> {
        self.header.as_deref()
    }

    /// Negotiate STARTTLS and run the TLS handshake.
    ///
    /// Returns `Ok(false)` if the peer answered `<failure/>`; the peer closes
    /// the stream after that, so the transport is closed here as well.
    pub async fn starttls(
        &mut self,
        context: TlsContext,
        server_name: &str,
        post_handshake: Option<PostHandshakeHook>,
    ) -> Result<bool, StreamError> {
        let reply = self
            .send_and_wait(
                vec![Nonza::StartTls],
                &[NonzaKind::TlsProceed, NonzaKind::TlsFailure],
            )
            .await?;
        if reply == Nonza::TlsFailure {
            warn!(domain = %self.domain, "Peer refused STARTTLS");
            self.transport.abort();
            return Ok(false);
        }

        // Anything after <proceed/> was sent in plaintext and must not be
        // mistaken for TLS-protected data.
        if !self.buffer.is_empty() {
            warn!(
                bytes = self.buffer.len(),
                "Unexpected plaintext after <proceed/>, aborting"
            );
            self.transport.abort();
            return Err(StreamError::Protocol(
                "data received between <proceed/> and the TLS handshake".to_string(),
            ));
        }

        self.transport
            .start_tls(context, server_name, post_handshake)
            .await?;
        self.header = None;
        self.features = None;
        Ok(true)
    }

    /// Send `</stream:stream>` and close the transport.
    pub async fn close(&mut self) {
        if self.transport.state().is_writable() {
            let _ = self.transport.write_all(b"</stream:stream>").await;
        }
        self.transport.close().await;
    }

    async fn restart(&mut self, timeout: Option<Duration>) -> Result<StreamFeatures, StreamError> {
        self.buffer.clear();
        self.scanner.reset();
        self.header = None;
        self.features = None;
        let header = stream_header(&self.domain);
        debug!(domain = %self.domain, tls = self.transport.tls_active(), "Opening stream");
        self.send_raw(&header).await?;
        self.features_within(timeout).await
    }

    async fn features_within(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<StreamFeatures, StreamError> {
        if let Some(features) = &self.features {
            return Ok(features.clone());
        }
        let Some(limit) = timeout else {
            return self.read_features().await;
        };
        let result = tokio::time::timeout(limit, self.read_features()).await;
        match result {
            Ok(features) => features,
            Err(_) => {
                warn!(
                    domain = %self.domain,
                    timeout_secs = limit.as_secs(),
                    "Timed out waiting for stream features"
                );
                self.transport.abort();
                Err(StreamError::Timeout {
                    what: "stream features",
                    elapsed: limit,
                })
            }
        }
    }

    async fn read_features(&mut self) -> Result<StreamFeatures, StreamError> {
        match self.next_nonza().await? {
            Nonza::Features(features) => {
                debug!(
                    starttls = ?features.starttls,
                    mechanisms = ?features.mechanisms,
                    "Received stream features"
                );
                self.features = Some(features.clone());
                Ok(features)
            }
            other => Err(StreamError::Protocol(format!(
                "expected stream features, got {:?}",
                other.kind()
            ))),
        }
    }

    async fn send_and_wait(
        &mut self,
        nonzas: Vec<Nonza>,
        expected: &[NonzaKind],
    ) -> Result<Nonza, StreamError> {
        for nonza in &nonzas {
            debug!(target: "fluux_security::stream::xmpp", "SEND {}", log_form(nonza));
            self.transport.write(nonza.to_xml().as_bytes())?;
        }
        self.transport.flush().await?;

        let reply = self.next_nonza().await?;
        if expected.contains(&reply.kind()) {
            Ok(reply)
        } else {
            Err(StreamError::Protocol(format!(
                "unexpected {:?}, expected one of {:?}",
                reply.kind(),
                expected
            )))
        }
    }

    async fn send_raw(&mut self, xml: &str) -> Result<(), StreamError> {
        debug!(target: "fluux_security::stream::xmpp", "SEND {}", xml);
        self.transport.write_all(xml.as_bytes()).await?;
        Ok(())
    }

    /// Next negotiation element. Stream headers are recorded and skipped; a
    /// stream error or stream close ends the stream.
    async fn next_nonza(&mut self) -> Result<Nonza, StreamError> {
        loop {
            match self.next_frame().await? {
                Frame::StreamOpen(header) => {
                    debug!(target: "fluux_security::stream::xmpp", "RECV {}", header);
                    self.header = Some(header);
                }
                Frame::StreamClose => {
                    debug!(domain = %self.domain, "Peer closed the stream");
                    self.transport.close().await;
                    return Err(StreamError::Closed);
                }
                Frame::Element(xml) => {
                    let nonza = Nonza::parse(&xml)?;
                    debug!(target: "fluux_security::stream::xmpp", "RECV {}", log_form(&nonza));
                    if let Nonza::StreamError { condition, text } = nonza {
                        warn!(condition = %condition, text = ?text, "Stream error from peer");
                        self.transport.abort();
                        return Err(StreamError::Peer { condition, text });
                    }
                    return Ok(nonza);
                }
            }
        }
    }

    async fn next_frame(&mut self) -> Result<Frame, StreamError> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if let Some((frame, consumed)) = self.scanner.scan(&self.buffer)? {
                self.buffer.drain(..consumed);
                return Ok(frame);
            }
            if self.buffer.len() > MAX_NEGOTIATION_BUFFER {
                warn!(bytes = self.buffer.len(), "Negotiation buffer overflow");
                self.transport.abort();
                return Err(StreamError::BufferOverflow {
                    limit: MAX_NEGOTIATION_BUFFER,
                });
            }
            let n = self.transport.read(&mut chunk).await?;
            if n == 0 {
                return Err(StreamError::Closed);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Log form of a nonza: SASL payloads may carry credentials.
fn log_form(nonza: &Nonza) -> Cow<'static, str> {
    match nonza {
        Nonza::SaslAuth { mechanism, .. } => {
            Cow::Owned(format!("<auth mechanism='{mechanism}'>[redacted]</auth>"))
        }
        Nonza::SaslResponse(_) => Cow::Borrowed("<response>[redacted]</response>"),
        other => Cow::Owned(other.to_xml()),
    }
}

impl NonzaStream for XmppStream {
    fn send_and_wait_for<'a>(
        &'a mut self,
        nonzas: Vec<Nonza>,
        expected: &'a [NonzaKind],
    ) -> BoxFuture<'a, Result<Nonza, StreamError>> {
        Box::pin(self.send_and_wait(nonzas, expected))
    }

    fn reset_and_get_features<'a>(
        &'a mut self,
        timeout: Option<Duration>,
    ) -> BoxFuture<'a, Result<StreamFeatures, StreamError>> {
        Box::pin(self.restart(timeout))
    }

    fn wait_for_features<'a>(
        &'a mut self,
        timeout: Option<Duration>,
    ) -> BoxFuture<'a, Result<StreamFeatures, StreamError>> {
        Box::pin(self.features_within(timeout))
    }

    fn send_stream_error<'a>(
        &'a mut self,
        condition: &'a str,
        text: Option<&'a str>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let error = Nonza::StreamError {
                condition: condition.to_string(),
                text: text.map(str::to_string),
            };
            debug!(condition, "Sending stream error");
            if self.transport.state().is_writable() {
                let xml = format!("{}</stream:stream>", error.to_xml());
                if let Err(e) = self.send_raw(&xml).await {
                    debug!(error = %e, "Could not deliver stream error");
                }
            }
            self.transport.close().await;
        })
    }

    fn tls_active(&self) -> bool {
        self.transport.tls_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{loopback_listener, read_until, TestPki};
    use crate::transport::TransportState;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    const SERVER_HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' id='s1' from='localhost' version='1.0'>";

    async fn pair() -> (XmppStream, TcpStream) {
        let (listener, port) = loopback_listener().await;
        let client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (
            XmppStream::new(Transport::connect(client, Some("localhost")), "localhost"),
            server,
        )
    }

    #[tokio::test]
    async fn test_start_exchanges_headers_and_features() {
        let (mut stream, mut server) = pair().await;
        let peer = tokio::spawn(async move {
            let header = read_until(&mut server, "<stream:stream").await;
            assert!(header.contains("to='localhost'"));
            server
                .write_all(format!("{SERVER_HEADER}<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms></stream:features>").as_bytes())
                .await
                .unwrap();
            server
        });

        let features = stream.start(Some(NEGOTIATION_TIMEOUT)).await.unwrap();
        assert_eq!(features.mechanisms, vec!["PLAIN"]);
        assert!(features.starttls.is_none());
        assert!(stream.peer_header().unwrap().contains("id='s1'"));
        assert!(!stream.tls_active());
        let _server = peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_and_wait_for_checks_reply_kind() {
        let (mut stream, mut server) = pair().await;
        let peer = tokio::spawn(async move {
            read_until(&mut server, "<auth").await;
            server
                .write_all(b"<challenge xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>=</challenge>")
                .await
                .unwrap();
            read_until(&mut server, "<abort").await;
            server
                .write_all(b"<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
                .await
                .unwrap();
            server
        });

        let auth = Nonza::SaslAuth {
            mechanism: "PLAIN".to_string(),
            payload: Some(b"\0a\0b".to_vec()),
        };
        let reply = stream
            .send_and_wait_for(vec![auth], &[NonzaKind::SaslChallenge, NonzaKind::SaslSuccess])
            .await
            .unwrap();
        assert_eq!(reply, Nonza::SaslChallenge(Vec::new()));

        let err = stream
            .send_and_wait_for(vec![Nonza::SaslAbort], &[NonzaKind::SaslFailure])
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Protocol(_)));
        let _server = peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_stream_error_is_surfaced() {
        let (mut stream, mut server) = pair().await;
        let peer = tokio::spawn(async move {
            read_until(&mut server, "<stream:stream").await;
            server
                .write_all(format!("{SERVER_HEADER}<stream:error><host-unknown xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error></stream:stream>").as_bytes())
                .await
                .unwrap();
            server
        });

        match stream.start(None).await {
            Err(StreamError::Peer { condition, .. }) => assert_eq!(condition, "host-unknown"),
            other => panic!("expected a peer stream error, got {other:?}"),
        }
        assert!(stream.transport().is_closed());
        let _server = peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_feature_timeout_closes_transport() {
        let (mut stream, _server) = pair().await;
        let err = stream
            .start(Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Timeout { .. }));
        assert_eq!(stream.transport().state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_plaintext_after_proceed_aborts() {
        let (mut stream, mut server) = pair().await;
        let peer = tokio::spawn(async move {
            read_until(&mut server, "<starttls").await;
            server
                .write_all(b"<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/><iq type='set' id='evil'/>")
                .await
                .unwrap();
            server
        });

        let pki = TestPki::self_signed(&["localhost"]);
        let err = stream
            .starttls(TlsContext::new(pki.roots()), "localhost", None)
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Protocol(_)));
        assert!(stream.transport().is_closed());
        let _server = peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_starttls_refused() {
        let (mut stream, mut server) = pair().await;
        let peer = tokio::spawn(async move {
            read_until(&mut server, "<starttls").await;
            server
                .write_all(b"<failure xmlns='urn:ietf:params:xml:ns:xmpp-tls'/></stream:stream>")
                .await
                .unwrap();
            server
        });

        let pki = TestPki::self_signed(&["localhost"]);
        let upgraded = stream
            .starttls(TlsContext::new(pki.roots()), "localhost", None)
            .await
            .unwrap();
        assert!(!upgraded);
        assert!(stream.transport().is_closed());
        let _server = peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_starttls_then_reset_over_tls() {
        let (mut stream, mut server) = pair().await;
        let pki = TestPki::ca_signed(&["localhost"]);
        let acceptor = pki.acceptor();
        let peer = tokio::spawn(async move {
            read_until(&mut server, "<starttls").await;
            server
                .write_all(b"<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
                .await
                .unwrap();
            let mut tls = acceptor.accept(server).await.unwrap();
            read_until(&mut tls, "<stream:stream").await;
            tls.write_all(format!("{SERVER_HEADER}<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>SCRAM-SHA-256</mechanism></mechanisms></stream:features>").as_bytes())
                .await
                .unwrap();
            tls
        });

        assert!(stream
            .starttls(TlsContext::new(pki.roots()), "localhost", None)
            .await
            .unwrap());
        assert!(stream.tls_active());
        let features = stream
            .reset_and_get_features(Some(NEGOTIATION_TIMEOUT))
            .await
            .unwrap();
        assert_eq!(features.mechanisms, vec!["SCRAM-SHA-256"]);
        let _tls = peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_stream_error_then_close() {
        let (mut stream, mut server) = pair().await;
        let peer = tokio::spawn(async move {
            read_until(&mut server, "</stream:stream>").await
        });

        stream.send_stream_error("policy-violation", Some("TLS required")).await;
        let received = peer.await.unwrap();
        assert!(received.contains("<policy-violation xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>"));
        assert!(stream.transport().is_closed());
    }
}
