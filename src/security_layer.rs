//! Security Layer Orchestrator.
//!
//! A [`SecurityLayer`] is the immutable recipe for securing one connection:
//! how to build a TLS context, which certificate verifier to use, whether
//! TLS is mandatory, and which SASL providers to try. [`connect`] drives a
//! fresh socket through the stream header exchange and STARTTLS;
//! [`negotiate_sasl`] runs the providers over the resulting stream.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::FutureExt;
use rustls::pki_types::CertificateDer;
use serde_json::Value;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::error::{ConnectError, StreamError, TransportError, VerifyError};
use crate::jid::Jid;
use crate::sasl::provider::DEFAULT_MAX_AUTH_ATTEMPTS;
use crate::sasl::{AnonymousSaslProvider, PasswordProvider, PasswordSaslProvider, SaslProvider};
use crate::stream::{NonzaStream, StreamFeatures, XmppStream, NEGOTIATION_TIMEOUT};
use crate::transport::{PostHandshakeHook, TlsContext, Transport, TransportInfo};
use crate::verify::{
    ApprovalHook, CertificateVerifier, NullVerifier, PinStore, PinType, PinningVerifier,
    PkixVerifier,
};

/// Bound on each TCP connect attempt.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Produces a fresh TLS context for every connection attempt.
pub type TlsContextFactory = Arc<dyn Fn() -> Result<TlsContext, TransportError> + Send + Sync>;

/// Produces a fresh verifier for every connection attempt. Verifiers keep
/// per-handshake state and must not be shared between attempts.
pub type VerifierFactory = Arc<dyn Fn() -> Arc<dyn CertificateVerifier> + Send + Sync>;

/// Immutable configuration for securing a stream.
#[derive(Clone)]
pub struct SecurityLayer {
    tls_context_factory: TlsContextFactory,
    certificate_verifier_factory: VerifierFactory,
    tls_required: bool,
    sasl_providers: Vec<Arc<dyn SaslProvider>>,
    negotiation_timeout: Option<Duration>,
}

impl fmt::Debug for SecurityLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityLayer")
            .field("tls_required", &self.tls_required)
            .field("sasl_providers", &self.sasl_providers.len())
            .field("negotiation_timeout", &self.negotiation_timeout)
            .finish_non_exhaustive()
    }
}

/// Default context factory: the operating system's trust anchors.
pub fn default_tls_context_factory() -> TlsContextFactory {
    Arc::new(TlsContext::with_native_roots)
}

/// Where [`SecurityLayer::make`] gets its pins from.
#[derive(Clone)]
pub enum PinSource {
    /// Pins in the persisted JSON form, imported into a new store.
    Json(Value),
    /// A live store shared with the caller, e.g. to save new pins.
    Store(Arc<RwLock<PinStore>>),
}

/// Options for [`SecurityLayer::make`].
#[derive(Clone)]
pub struct MakeOptions {
    pub password_provider: Option<PasswordProvider>,
    pub pin_store: Option<PinSource>,
    /// Flavour of the store built from [`PinSource::Json`].
    pub pin_type: PinType,
    /// Asked about certificates that are neither valid nor pinned.
    pub post_handshake_deferred_failure: Option<ApprovalHook>,
    /// Offer ANONYMOUS with this trace token.
    pub anonymous: Option<String>,
    /// Accept any certificate.
    pub no_verify: bool,
    pub tls_context_factory: Option<TlsContextFactory>,
    pub tls_required: bool,
    pub max_auth_attempts: u32,
    pub allow_plain_without_tls: bool,
}

impl Default for MakeOptions {
    fn default() -> Self {
        Self {
            password_provider: None,
            pin_store: None,
            pin_type: PinType::PublicKey,
            post_handshake_deferred_failure: None,
            anonymous: None,
            no_verify: false,
            tls_context_factory: None,
            tls_required: true,
            max_auth_attempts: DEFAULT_MAX_AUTH_ATTEMPTS,
            allow_plain_without_tls: false,
        }
    }
}

impl SecurityLayer {
    pub fn new(
        tls_context_factory: TlsContextFactory,
        certificate_verifier_factory: VerifierFactory,
        tls_required: bool,
        sasl_providers: Vec<Arc<dyn SaslProvider>>,
    ) -> Self {
        Self {
            tls_context_factory,
            certificate_verifier_factory,
            tls_required,
            sasl_providers,
            negotiation_timeout: Some(NEGOTIATION_TIMEOUT),
        }
    }

    /// System trust anchors, PKIX verification, mandatory TLS and password
    /// authentication.
    pub fn tls_with_password_based_authentication(
        password_provider: PasswordProvider,
        max_auth_attempts: u32,
    ) -> Self {
        let provider = PasswordSaslProvider::new(password_provider)
            .with_max_auth_attempts(max_auth_attempts);
        Self::new(
            default_tls_context_factory(),
            Arc::new(|| Arc::new(PkixVerifier) as Arc<dyn CertificateVerifier>),
            true,
            vec![Arc::new(provider)],
        )
    }

    /// Build a layer from high-level options.
    ///
    /// The verifier is a [`NullVerifier`] with `no_verify`, a
    /// [`PinningVerifier`] when a pin store is given, and a [`PkixVerifier`]
    /// otherwise. ANONYMOUS, when enabled, is tried before password
    /// authentication.
    pub fn make(options: MakeOptions) -> Result<Self, ConnectError> {
        let verifier_factory: VerifierFactory = if options.no_verify {
            Arc::new(|| Arc::new(NullVerifier) as Arc<dyn CertificateVerifier>)
        } else if let Some(source) = options.pin_store {
            let store = match source {
                PinSource::Store(store) => store,
                PinSource::Json(value) => {
                    let mut store = PinStore::new(options.pin_type);
                    store
                        .import_from_json(&value, true)
                        .map_err(|e| ConnectError::TlsConfig(e.to_string()))?;
                    Arc::new(RwLock::new(store))
                }
            };
            let hook = options.post_handshake_deferred_failure;
            Arc::new(move || {
                Arc::new(PinningVerifier::new(store.clone(), hook.clone()))
                    as Arc<dyn CertificateVerifier>
            })
        } else {
            Arc::new(|| Arc::new(PkixVerifier) as Arc<dyn CertificateVerifier>)
        };

        let mut providers: Vec<Arc<dyn SaslProvider>> = Vec::new();
        if let Some(trace) = &options.anonymous {
            providers.push(Arc::new(AnonymousSaslProvider::new(trace)));
        }
        if let Some(password_provider) = options.password_provider {
            providers.push(Arc::new(
                PasswordSaslProvider::new(password_provider)
                    .with_max_auth_attempts(options.max_auth_attempts)
                    .allow_plain_without_tls(options.allow_plain_without_tls),
            ));
        }
        if providers.is_empty() {
            return Err(ConnectError::Config(
                "no SASL provider: need a password provider or anonymous".to_string(),
            ));
        }

        Ok(Self::new(
            options
                .tls_context_factory
                .unwrap_or_else(default_tls_context_factory),
            verifier_factory,
            options.tls_required,
            providers,
        ))
    }

    /// Bound on the STARTTLS exchange (including the handshake) and on
    /// each feature wait. `None` waits forever.
    pub fn with_negotiation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    pub fn tls_required(&self) -> bool {
        self.tls_required
    }

    pub fn sasl_providers(&self) -> &[Arc<dyn SaslProvider>] {
        &self.sasl_providers
    }

    pub fn negotiation_timeout(&self) -> Option<Duration> {
        self.negotiation_timeout
    }

    /// Fresh verifier and TLS context for one attempt, with the verifier's
    /// callback installed and its post-handshake step wrapped as a hook.
    async fn prepare_tls(
        &self,
        domain: &str,
        host: &str,
        port: u16,
    ) -> Result<(TlsContext, PostHandshakeHook), ConnectError> {
        let verifier = (self.certificate_verifier_factory)();
        verifier
            .pre_handshake(domain, host, port)
            .await
            .map_err(certificate_rejected)?;
        let mut context = (self.tls_context_factory)()
            .map_err(|e| ConnectError::TlsConfig(e.to_string()))?;
        verifier
            .clone()
            .setup_context(&mut context)
            .map_err(certificate_rejected)?;

        let hook: PostHandshakeHook = Box::new(move |info: TransportInfo| {
            async move { verifier.post_handshake(&info).await }.boxed()
        });
        Ok((context, hook))
    }
}

fn certificate_rejected(e: VerifyError) -> ConnectError {
    ConnectError::Transport(TransportError::CertificateRejected(e))
}

/// Connect to `host:port`, trying every address it resolves to.
pub async fn tcp_connect(host: &str, port: u16) -> Result<TcpStream, ConnectError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ConnectError::Dns(format!("{host}: {e}")))?
        .collect();

    let mut errors = Vec::new();
    for addr in addrs {
        match tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(socket)) => {
                info!(host, %addr, "Connected (TCP)");
                return Ok(socket);
            }
            Ok(Err(e)) => {
                warn!(host, %addr, error = %e, error_kind = ?e.kind(), "TCP connect failed");
                errors.push(ConnectError::io(addr, e));
            }
            Err(_) => {
                warn!(host, %addr, timeout_secs = TCP_CONNECT_TIMEOUT.as_secs(), "TCP connect timed out");
                errors.push(ConnectError::Timeout {
                    addr: addr.to_string(),
                    elapsed: TCP_CONNECT_TIMEOUT,
                });
            }
        }
    }
    Err(ConnectError::aggregate(errors)
        .unwrap_or_else(|| ConnectError::Dns(format!("{host} has no addresses"))))
}

/// Open a stream to `host:port` for `domain` and secure it with STARTTLS.
///
/// Returns the stream and the features advertised on the (possibly
/// encrypted) stream. If TLS is required but the peer does not offer or
/// refuses STARTTLS, a `policy-violation` stream error is sent and
/// [`ConnectError::TlsUnavailable`] returned. On any error the connection
/// is closed.
pub async fn connect(
    layer: &SecurityLayer,
    domain: &str,
    host: &str,
    port: u16,
) -> Result<(XmppStream, StreamFeatures), ConnectError> {
    let socket = tcp_connect(host, port).await?;
    let mut stream = XmppStream::new(Transport::connect(socket, Some(host)), domain);
    match negotiate_starttls(layer, &mut stream, domain, host, port).await {
        Ok(features) => Ok((stream, features)),
        Err(e) => {
            error!(domain, host, port, error = %e, "Securing the stream failed");
            stream.transport_mut().abort();
            Err(e)
        }
    }
}

async fn negotiate_starttls(
    layer: &SecurityLayer,
    stream: &mut XmppStream,
    domain: &str,
    host: &str,
    port: u16,
) -> Result<StreamFeatures, ConnectError> {
    let timeout = layer.negotiation_timeout;
    let features = stream.start(timeout).await?;

    if features.starttls.is_none() {
        if layer.tls_required {
            warn!(domain, "Peer does not offer STARTTLS but TLS is required");
            stream
                .send_stream_error("policy-violation", Some("TLS is required"))
                .await;
            return Err(ConnectError::TlsUnavailable(
                "peer does not offer STARTTLS".to_string(),
            ));
        }
        warn!(domain, "Peer does not offer STARTTLS, continuing unencrypted");
        return Ok(features);
    }

    let (context, hook) = layer.prepare_tls(domain, host, port).await?;
    let upgrade = stream.starttls(context, domain, Some(hook));
    let upgraded = match timeout {
        Some(limit) => tokio::time::timeout(limit, upgrade)
            .await
            .map_err(|_| StreamError::Timeout {
                what: "STARTTLS",
                elapsed: limit,
            })??,
        None => upgrade.await?,
    };
    if !upgraded {
        stream
            .send_stream_error("policy-violation", Some("STARTTLS refused"))
            .await;
        return Err(ConnectError::TlsUnavailable(
            "peer refused STARTTLS".to_string(),
        ));
    }
    info!(domain, host, port, "STARTTLS complete");

    Ok(stream.reset_and_get_features(timeout).await?)
}

/// Open a direct TLS connection (xmpps) to `host:port` for `domain` and
/// start the stream.
pub async fn connect_direct_tls(
    layer: &SecurityLayer,
    domain: &str,
    host: &str,
    port: u16,
) -> Result<(XmppStream, StreamFeatures), ConnectError> {
    let socket = tcp_connect(host, port).await?;
    let (context, hook) = layer.prepare_tls(domain, host, port).await?;
    let handshake = Transport::connect_tls(socket, Some(host), context, domain, Some(hook));
    let transport = match layer.negotiation_timeout {
        Some(limit) => tokio::time::timeout(limit, handshake)
            .await
            .map_err(|_| StreamError::Timeout {
                what: "TLS handshake",
                elapsed: limit,
            })??,
        None => handshake.await?,
    };
    info!(domain, host, port, "Connected (direct TLS)");

    let mut stream = XmppStream::new(transport, domain);
    match stream.start(layer.negotiation_timeout).await {
        Ok(features) => Ok((stream, features)),
        Err(e) => {
            stream.transport_mut().abort();
            Err(e.into())
        }
    }
}

/// Authenticate with the first provider that can.
///
/// Providers run in order. A credential failure is remembered and the next
/// provider tried; if none succeeds, that failure is returned, or
/// [`ConnectError::NoCommonMechanism`] if no provider found a usable
/// mechanism. On success the stream is reset and the post-authentication
/// features returned, waiting at most `timeout` for them.
pub async fn negotiate_sasl(
    stream: &mut dyn NonzaStream,
    providers: &[Arc<dyn SaslProvider>],
    jid: &Jid,
    features: &StreamFeatures,
    timeout: Option<Duration>,
) -> Result<StreamFeatures, ConnectError> {
    let mut credential_failure = None;
    for provider in providers {
        match provider.execute(jid, features, &mut *stream).await {
            Ok(true) => {
                debug!(jid = %jid, "SASL done, restarting stream");
                return Ok(stream.reset_and_get_features(timeout).await?);
            }
            Ok(false) => continue,
            Err(e) if e.is_credential_failure() => {
                warn!(jid = %jid, error = %e, "Provider failed on credentials, trying next");
                credential_failure = Some(e);
            }
            Err(e) => {
                error!(jid = %jid, error = %e, "SASL negotiation failed");
                stream.send_stream_error("not-authorized", None).await;
                return Err(e.into());
            }
        }
    }

    match credential_failure {
        Some(e) => {
            stream.send_stream_error("not-authorized", None).await;
            Err(e.into())
        }
        None => {
            warn!(jid = %jid, advertised = ?features.mechanisms, "No common SASL mechanism");
            stream
                .send_stream_error("policy-violation", Some("no common SASL mechanism"))
                .await;
            Err(ConnectError::NoCommonMechanism)
        }
    }
}

/// Approval hook that pins whatever it is asked about into `store` and
/// persists it with `save`. Used for trust-on-first-use.
pub fn pin_on_approval<F>(store: Arc<RwLock<PinStore>>, save: F) -> ApprovalHook
where
    F: Fn(&PinStore) + Send + Sync + 'static,
{
    let save = Arc::new(save);
    Arc::new(move |request: crate::verify::ApprovalRequest| {
        let (store, save) = (store.clone(), save.clone());
        async move {
            let leaf: CertificateDer<'static> = request.leaf;
            let mut guard = match store.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match guard.pin(&request.server_name, &leaf) {
                Ok(()) => {
                    warn!(server = %request.server_name, errors = ?request.errors, "Trusting certificate on first use");
                    save(&*guard);
                    true
                }
                Err(e) => {
                    warn!(server = %request.server_name, error = %e, "Could not pin certificate");
                    false
                }
            }
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SaslError;
    use crate::test_support::{loopback_listener, read_until, ScriptedStream, TestPki};
    use futures_util::future::BoxFuture;
    use rustls::RootCertStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;

    const SERVER_HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' id='s1' from='localhost' version='1.0'>";
    const STARTTLS_FEATURES: &str = "<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls></stream:features>";
    const SASL_FEATURES: &str = "<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>SCRAM-SHA-1</mechanism><mechanism>PLAIN</mechanism></mechanisms></stream:features>";

    fn layer_for(roots: RootCertStore, tls_required: bool) -> SecurityLayer {
        let roots = Arc::new(roots);
        SecurityLayer::new(
            Arc::new(move || Ok(TlsContext::new((*roots).clone()))),
            Arc::new(|| Arc::new(PkixVerifier) as Arc<dyn CertificateVerifier>),
            tls_required,
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn test_required_tls_without_starttls_sends_policy_violation() {
        let (listener, port) = loopback_listener().await;
        let peer = tokio::spawn(async move {
            let (mut server, _) = listener.accept().await.unwrap();
            read_until(&mut server, "<stream:stream").await;
            server
                .write_all(format!("{SERVER_HEADER}{SASL_FEATURES}").as_bytes())
                .await
                .unwrap();
            read_until(&mut server, "</stream:stream>").await
        });

        let layer = layer_for(RootCertStore::empty(), true);
        let err = connect(&layer, "localhost", "127.0.0.1", port)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::TlsUnavailable(_)));
        let received = peer.await.unwrap();
        assert!(received.contains("<policy-violation xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>"));
    }

    #[tokio::test]
    async fn test_optional_tls_without_starttls_stays_plaintext() {
        let (listener, port) = loopback_listener().await;
        let peer = tokio::spawn(async move {
            let (mut server, _) = listener.accept().await.unwrap();
            read_until(&mut server, "<stream:stream").await;
            server
                .write_all(format!("{SERVER_HEADER}{SASL_FEATURES}").as_bytes())
                .await
                .unwrap();
            server
        });

        let layer = layer_for(RootCertStore::empty(), false);
        let (stream, features) = connect(&layer, "localhost", "127.0.0.1", port)
            .await
            .unwrap();
        assert!(!stream.tls_active());
        assert!(features.has_mechanism("PLAIN"));
        let _server = peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_starttls_with_trusted_certificate() {
        let (listener, port) = loopback_listener().await;
        let pki = TestPki::ca_signed(&["localhost"]);
        let acceptor = pki.acceptor();
        let peer = tokio::spawn(async move {
            let (mut server, _) = listener.accept().await.unwrap();
            read_until(&mut server, "<stream:stream").await;
            server
                .write_all(format!("{SERVER_HEADER}{STARTTLS_FEATURES}").as_bytes())
                .await
                .unwrap();
            read_until(&mut server, "<starttls").await;
            server
                .write_all(b"<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
                .await
                .unwrap();
            let mut tls = acceptor.accept(server).await.unwrap();
            read_until(&mut tls, "<stream:stream").await;
            tls.write_all(format!("{SERVER_HEADER}{SASL_FEATURES}").as_bytes())
                .await
                .unwrap();
            tls
        });

        let layer = layer_for(pki.roots(), true);
        let (stream, features) = connect(&layer, "localhost", "127.0.0.1", port)
            .await
            .unwrap();
        assert!(stream.tls_active());
        assert_eq!(features.mechanisms, vec!["SCRAM-SHA-1", "PLAIN"]);
        let _tls = peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_untrusted_certificate_fails_and_closes() {
        let (listener, port) = loopback_listener().await;
        let pki = TestPki::self_signed(&["localhost"]);
        let acceptor = pki.acceptor();
        let peer = tokio::spawn(async move {
            let (mut server, _) = listener.accept().await.unwrap();
            read_until(&mut server, "<stream:stream").await;
            server
                .write_all(format!("{SERVER_HEADER}{STARTTLS_FEATURES}").as_bytes())
                .await
                .unwrap();
            read_until(&mut server, "<starttls").await;
            server
                .write_all(b"<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
                .await
                .unwrap();
            acceptor.accept(server).await.is_err()
        });

        let layer = layer_for(RootCertStore::empty(), true);
        let err = connect(&layer, "localhost", "127.0.0.1", port)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Stream(StreamError::Transport(_))));
        assert!(peer.await.unwrap(), "server handshake should fail too");
    }

    #[tokio::test]
    async fn test_tcp_connect_failure_names_address() {
        let (listener, port) = loopback_listener().await;
        drop(listener);
        let err = tcp_connect("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, ConnectError::Io { ref addr, .. } if addr.ends_with(&format!(":{port}"))));
    }

    enum Outcome {
        Success,
        NoMechanism,
        BadCredentials,
        Broken,
    }

    struct FakeProvider {
        outcome: Outcome,
        calls: AtomicUsize,
    }

    impl FakeProvider {
        fn new(outcome: Outcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl SaslProvider for FakeProvider {
        fn execute<'a>(
            &'a self,
            _jid: &'a Jid,
            _features: &'a StreamFeatures,
            _stream: &'a mut dyn NonzaStream,
        ) -> BoxFuture<'a, Result<bool, SaslError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = match self.outcome {
                Outcome::Success => Ok(true),
                Outcome::NoMechanism => Ok(false),
                Outcome::BadCredentials => Err(SaslError::Failure {
                    condition: "not-authorized".to_string(),
                    text: None,
                }),
                Outcome::Broken => Err(SaslError::ServerAuthentication),
            };
            Box::pin(async move { result })
        }
    }

    fn jid() -> Jid {
        "romeo@montague.example".parse().unwrap()
    }

    #[tokio::test]
    async fn test_credential_failure_then_success() {
        let mut stream = ScriptedStream::new(true, Vec::new());
        stream.after_reset.mechanisms = vec!["after-auth".to_string()];
        let first = FakeProvider::new(Outcome::BadCredentials);
        let second = FakeProvider::new(Outcome::Success);
        let providers: Vec<Arc<dyn SaslProvider>> = vec![first.clone(), second.clone()];

        let features = negotiate_sasl(&mut stream, &providers, &jid(), &StreamFeatures::default(), None)
            .await
            .unwrap();
        assert_eq!(features.mechanisms, vec!["after-auth"]);
        assert_eq!(stream.resets, 1);
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
        assert!(stream.stream_errors.is_empty());
    }

    #[tokio::test]
    async fn test_no_applicable_provider_is_no_common_mechanism() {
        let mut stream = ScriptedStream::new(true, Vec::new());
        let providers: Vec<Arc<dyn SaslProvider>> = vec![FakeProvider::new(Outcome::NoMechanism)];
        let err = negotiate_sasl(&mut stream, &providers, &jid(), &StreamFeatures::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::NoCommonMechanism));
        assert_eq!(stream.stream_errors, vec!["policy-violation"]);
        assert_eq!(stream.resets, 0);
    }

    #[tokio::test]
    async fn test_credential_failure_is_reraised_when_nothing_succeeds() {
        let mut stream = ScriptedStream::new(true, Vec::new());
        let providers: Vec<Arc<dyn SaslProvider>> = vec![
            FakeProvider::new(Outcome::BadCredentials),
            FakeProvider::new(Outcome::NoMechanism),
        ];
        let err = negotiate_sasl(&mut stream, &providers, &jid(), &StreamFeatures::default(), None)
            .await
            .unwrap_err();
        match err {
            ConnectError::Sasl(e) => assert!(e.is_credential_failure()),
            other => panic!("expected the credential failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fatal_error_stops_the_loop() {
        let mut stream = ScriptedStream::new(true, Vec::new());
        let later = FakeProvider::new(Outcome::Success);
        let providers: Vec<Arc<dyn SaslProvider>> =
            vec![FakeProvider::new(Outcome::Broken), later.clone()];
        let err = negotiate_sasl(&mut stream, &providers, &jid(), &StreamFeatures::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Sasl(SaslError::ServerAuthentication)));
        assert_eq!(later.calls.load(Ordering::SeqCst), 0);
        assert_eq!(stream.stream_errors, vec!["not-authorized"]);
    }

    #[tokio::test]
    async fn test_post_auth_reset_uses_the_given_timeout() {
        let providers: Vec<Arc<dyn SaslProvider>> = vec![FakeProvider::new(Outcome::Success)];
        for timeout in [Some(Duration::from_secs(3)), None] {
            let mut stream = ScriptedStream::new(true, Vec::new());
            negotiate_sasl(&mut stream, &providers, &jid(), &StreamFeatures::default(), timeout)
                .await
                .unwrap();
            assert_eq!(stream.reset_timeouts, vec![timeout]);
        }
    }

    fn no_password() -> PasswordProvider {
        Arc::new(|_: Jid, _: u32| async { None }.boxed())
    }

    #[test]
    fn test_make_builds_provider_list() {
        let layer = SecurityLayer::make(MakeOptions {
            password_provider: Some(no_password()),
            anonymous: Some(String::new()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(layer.sasl_providers().len(), 2);
        assert!(layer.tls_required());

        assert!(SecurityLayer::make(MakeOptions::default()).is_err());
    }

    #[test]
    fn test_make_rejects_malformed_pins() {
        let err = SecurityLayer::make(MakeOptions {
            password_provider: Some(no_password()),
            pin_store: Some(PinSource::Json(serde_json::json!({"example.org": "not-a-list"}))),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, ConnectError::TlsConfig(_)));
    }

    #[tokio::test]
    async fn test_pin_on_approval_pins_and_saves() {
        let store = Arc::new(RwLock::new(PinStore::public_key()));
        let saves = Arc::new(AtomicUsize::new(0));
        let counter = saves.clone();
        let hook = pin_on_approval(store.clone(), move |_: &PinStore| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let pki = TestPki::self_signed(&["chat.example"]);
        let approved = hook(crate::verify::ApprovalRequest {
            server_name: "chat.example".to_string(),
            leaf: pki.leaf.clone(),
            errors: vec![(18, 0)],
            hostname_matches: true,
        })
        .await;
        assert!(approved);
        assert_eq!(saves.load(Ordering::SeqCst), 1);
        assert_eq!(store.read().unwrap().query("chat.example", &pki.leaf), Some(true));
    }

    /// STARTTLS peer for certificate trust tests. Resolves to `true` if the
    /// client went on to open the encrypted stream, `false` if it gave up
    /// during or right after the handshake.
    fn starttls_peer(listener: tokio::net::TcpListener, pki: &TestPki) -> tokio::task::JoinHandle<bool> {
        use tokio::io::AsyncReadExt;

        let acceptor = pki.acceptor();
        tokio::spawn(async move {
            let (mut server, _) = listener.accept().await.unwrap();
            read_until(&mut server, "<stream:stream").await;
            server
                .write_all(format!("{SERVER_HEADER}{STARTTLS_FEATURES}").as_bytes())
                .await
                .unwrap();
            read_until(&mut server, "<starttls").await;
            server
                .write_all(b"<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
                .await
                .unwrap();
            let Ok(mut tls) = acceptor.accept(server).await else {
                return false;
            };

            let mut received = Vec::new();
            let mut chunk = [0u8; 4096];
            while !String::from_utf8_lossy(&received).contains("<stream:stream") {
                match tls.read(&mut chunk).await {
                    Ok(0) | Err(_) => return false,
                    Ok(n) => received.extend_from_slice(&chunk[..n]),
                }
            }
            tls.write_all(format!("{SERVER_HEADER}{SASL_FEATURES}").as_bytes())
                .await
                .unwrap();
            // Hold the connection until the client drops it.
            while let Ok(n) = tls.read(&mut chunk).await {
                if n == 0 {
                    break;
                }
            }
            true
        })
    }

    fn counting_hook(answer: bool) -> (ApprovalHook, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let hook: ApprovalHook = Arc::new(move |_: crate::verify::ApprovalRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { answer }.boxed()
        });
        (hook, calls)
    }

    fn pinning_layer(
        roots: RootCertStore,
        store: Arc<RwLock<PinStore>>,
        hook: Option<ApprovalHook>,
    ) -> SecurityLayer {
        let roots = Arc::new(roots);
        SecurityLayer::make(MakeOptions {
            password_provider: Some(no_password()),
            pin_store: Some(PinSource::Store(store)),
            post_handshake_deferred_failure: hook,
            tls_context_factory: Some(Arc::new(move || Ok(TlsContext::new((*roots).clone())))),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_self_signed_certificate_approved_after_handshake() {
        let (listener, port) = loopback_listener().await;
        let pki = TestPki::self_signed(&["localhost"]);
        let peer = starttls_peer(listener, &pki);

        let store = Arc::new(RwLock::new(PinStore::public_key()));
        let (hook, calls) = counting_hook(true);
        let layer = pinning_layer(RootCertStore::empty(), store, Some(hook));
        let (stream, features) = connect(&layer, "localhost", "127.0.0.1", port)
            .await
            .unwrap();
        assert!(stream.tls_active());
        assert!(features.has_mechanism("SCRAM-SHA-1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(stream);
        assert!(peer.await.unwrap());
    }

    #[tokio::test]
    async fn test_refused_approval_fails_connect_and_closes() {
        let (listener, port) = loopback_listener().await;
        let pki = TestPki::self_signed(&["localhost"]);
        let peer = starttls_peer(listener, &pki);

        let store = Arc::new(RwLock::new(PinStore::public_key()));
        let (hook, calls) = counting_hook(false);
        let layer = pinning_layer(RootCertStore::empty(), store, Some(hook));
        let err = connect(&layer, "localhost", "127.0.0.1", port)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectError::Stream(StreamError::Transport(TransportError::CertificateRejected(_)))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!peer.await.unwrap(), "client should close instead of opening the stream");
    }

    #[tokio::test]
    async fn test_pinned_certificate_connects_without_approval() {
        let (listener, port) = loopback_listener().await;
        let pki = TestPki::self_signed(&["localhost"]);
        let peer = starttls_peer(listener, &pki);

        let mut pins = PinStore::public_key();
        pins.pin("localhost", &pki.leaf).unwrap();
        let (hook, calls) = counting_hook(false);
        let layer = pinning_layer(RootCertStore::empty(), Arc::new(RwLock::new(pins)), Some(hook));
        let (stream, _) = connect(&layer, "localhost", "127.0.0.1", port)
            .await
            .unwrap();
        assert!(stream.tls_active());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        drop(stream);
        assert!(peer.await.unwrap());
    }

    #[tokio::test]
    async fn test_trust_on_first_use_records_the_pin() {
        let (listener, port) = loopback_listener().await;
        let pki = TestPki::self_signed(&["localhost"]);
        let peer = starttls_peer(listener, &pki);

        let store = Arc::new(RwLock::new(PinStore::public_key()));
        let hook = pin_on_approval(store.clone(), |_: &PinStore| {});
        let layer = pinning_layer(RootCertStore::empty(), store.clone(), Some(hook));
        let (stream, _) = connect(&layer, "localhost", "127.0.0.1", port)
            .await
            .unwrap();
        assert_eq!(store.read().unwrap().query("localhost", &pki.leaf), Some(true));

        drop(stream);
        assert!(peer.await.unwrap());
    }

    #[tokio::test]
    async fn test_trusted_certificate_for_other_name_is_rejected_without_approval() {
        let (listener, port) = loopback_listener().await;
        let pki = TestPki::ca_signed(&["evil.example"]);
        let peer = starttls_peer(listener, &pki);

        let store = Arc::new(RwLock::new(PinStore::public_key()));
        let (hook, calls) = counting_hook(true);
        let layer = pinning_layer(pki.roots(), store, Some(hook));
        let err = connect(&layer, "localhost", "127.0.0.1", port)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Stream(StreamError::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!peer.await.unwrap());
    }
}
