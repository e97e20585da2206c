//! Test fixtures: throwaway PKI, loopback peers, and a scripted stream.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::RootCertStore;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::error::StreamError;
use crate::sasl::{CredentialProvider, Credentials};
use crate::stream::{Nonza, NonzaKind, NonzaStream, StreamFeatures};

pub struct TestPki {
    pub ca: Option<CertificateDer<'static>>,
    pub leaf: CertificateDer<'static>,
    leaf_key: Vec<u8>,
}

impl TestPki {
    /// A leaf for `names` signed by a throwaway CA.
    pub fn ca_signed(names: &[&str]) -> Self {
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "Fluux Test CA");
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = rcgen::KeyPair::generate().unwrap();
        let leaf_params = rcgen::CertificateParams::new(to_strings(names)).unwrap();
        let leaf = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

        Self {
            ca: Some(ca_cert.der().clone()),
            leaf: leaf.der().clone(),
            leaf_key: leaf_key.serialize_der(),
        }
    }

    /// A lone self-signed leaf for `names`.
    pub fn self_signed(names: &[&str]) -> Self {
        let key = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(to_strings(names)).unwrap();
        let cert = params.self_signed(&key).unwrap();
        Self {
            ca: None,
            leaf: cert.der().clone(),
            leaf_key: key.serialize_der(),
        }
    }

    pub fn roots(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        if let Some(ca) = &self.ca {
            roots.add(ca.clone()).unwrap();
        }
        roots
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        let mut chain = vec![self.leaf.clone()];
        if let Some(ca) = &self.ca {
            chain.push(ca.clone());
        }
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.leaf_key.clone()));
        let config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .unwrap();
        TlsAcceptor::from(Arc::new(config))
    }
}

fn to_strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

pub async fn loopback_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback listener");
    let port = listener.local_addr().expect("listener addr").port();
    (listener, port)
}

/// Server-side helper: read from `sock` until the received text contains
/// `needle`, returning everything read so far.
pub async fn read_until<S>(sock: &mut S, needle: &str) -> String
where
    S: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut received = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let text = String::from_utf8_lossy(&received);
        if text.contains(needle) {
            return text.into_owned();
        }
        let n = sock.read(&mut chunk).await.expect("read from client");
        assert!(n > 0, "client closed before sending {needle:?}; got {text:?}");
        received.extend_from_slice(&chunk[..n]);
    }
}

/// In-memory [`NonzaStream`] that answers from a script and records what the
/// code under test sent.
pub struct ScriptedStream {
    pub replies: VecDeque<Nonza>,
    pub sent: Vec<Nonza>,
    pub tls: bool,
    pub resets: usize,
    /// Timeout passed to each reset.
    pub reset_timeouts: Vec<Option<Duration>>,
    pub stream_errors: Vec<String>,
    pub after_reset: StreamFeatures,
}

impl ScriptedStream {
    pub fn new(tls: bool, replies: Vec<Nonza>) -> Self {
        Self {
            replies: replies.into(),
            sent: Vec::new(),
            tls,
            resets: 0,
            reset_timeouts: Vec::new(),
            stream_errors: Vec::new(),
            after_reset: StreamFeatures::default(),
        }
    }
}

impl NonzaStream for ScriptedStream {
    fn send_and_wait_for<'a>(
        &'a mut self,
        nonzas: Vec<Nonza>,
        expected: &'a [NonzaKind],
    ) -> BoxFuture<'a, Result<Nonza, StreamError>> {
        Box::pin(async move {
            self.sent.extend(nonzas);
            let reply = self.replies.pop_front().ok_or(StreamError::Closed)?;
            if expected.contains(&reply.kind()) {
                Ok(reply)
            } else {
                Err(StreamError::Protocol(format!("unexpected {:?}", reply.kind())))
            }
        })
    }

    fn reset_and_get_features<'a>(
        &'a mut self,
        timeout: Option<Duration>,
    ) -> BoxFuture<'a, Result<StreamFeatures, StreamError>> {
        Box::pin(async move {
            self.resets += 1;
            self.reset_timeouts.push(timeout);
            Ok(self.after_reset.clone())
        })
    }

    fn wait_for_features<'a>(
        &'a mut self,
        _timeout: Option<Duration>,
    ) -> BoxFuture<'a, Result<StreamFeatures, StreamError>> {
        Box::pin(async move { Ok(self.after_reset.clone()) })
    }

    fn send_stream_error<'a>(
        &'a mut self,
        condition: &'a str,
        _text: Option<&'a str>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.stream_errors.push(condition.to_string()) })
    }

    fn tls_active(&self) -> bool {
        self.tls
    }
}

/// A credential provider that always answers with the same pair.
pub fn fixed_credentials(username: &str, password: &str) -> CredentialProvider {
    let credentials = Credentials {
        username: username.to_string(),
        password: password.to_string(),
    };
    Arc::new(move || {
        let credentials = credentials.clone();
        async move { Ok(credentials) }.boxed()
    })
}
