use std::fmt;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, Error, SignatureScheme};
use tracing::{debug, warn};

use super::{
    x509, CertificateVerifier, ChainContext, X509_V_ERR_CERT_HAS_EXPIRED,
    X509_V_ERR_CERT_NOT_YET_VALID, X509_V_ERR_CERT_REVOKED, X509_V_ERR_CERT_SIGNATURE_FAILURE,
    X509_V_ERR_CERT_UNTRUSTED, X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT,
    X509_V_ERR_HOSTNAME_MISMATCH, X509_V_ERR_INVALID_PURPOSE, X509_V_ERR_SELF_SIGNED_CERT_IN_CHAIN,
    X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY, X509_V_ERR_UNHANDLED_CRITICAL_EXTENSION,
    X509_V_ERR_UNSPECIFIED, X509_V_OK,
};
use crate::error::VerifyError;
use crate::transport::TlsContext;

/// Install a [`ChainWalker`] reporting to `verifier` into `ctx`.
pub fn install_chain_walker(
    ctx: &mut TlsContext,
    verifier: Arc<dyn CertificateVerifier>,
) -> Result<(), VerifyError> {
    let walker = ChainWalker::new(ctx, verifier);
    ctx.set_verifier(Arc::new(walker));
    Ok(())
}

/// rustls certificate verifier that runs WebPKI validation against the
/// context's roots, then replays the outcome certificate by certificate to a
/// [`CertificateVerifier`] in OpenSSL callback order.
pub struct ChainWalker {
    provider: Arc<CryptoProvider>,
    webpki: Option<Arc<WebPkiServerVerifier>>,
    verifier: Arc<dyn CertificateVerifier>,
}

impl ChainWalker {
    pub fn new(ctx: &TlsContext, verifier: Arc<dyn CertificateVerifier>) -> Self {
        let webpki = match WebPkiServerVerifier::builder_with_provider(
            ctx.roots().clone(),
            ctx.provider().clone(),
        )
        .build()
        {
            Ok(webpki) => Some(webpki),
            Err(e) => {
                // No usable trust anchors: every chain is untrusted.
                debug!(error = %e, "WebPKI verifier unavailable");
                None
            }
        };
        Self {
            provider: ctx.provider().clone(),
            webpki,
            verifier,
        }
    }
}

impl fmt::Debug for ChainWalker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainWalker")
            .field("has_trust_anchors", &self.webpki.is_some())
            .finish()
    }
}

impl ServerCertVerifier for ChainWalker {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        let preliminary = match &self.webpki {
            Some(webpki) => webpki
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                .err(),
            None => Some(Error::InvalidCertificate(CertificateError::UnknownIssuer)),
        };

        let chain: Vec<&CertificateDer<'_>> =
            std::iter::once(end_entity).chain(intermediates.iter()).collect();
        let failures = preliminary
            .as_ref()
            .map(|e| classify_chain_error(e, &chain, now))
            .unwrap_or_default();
        if let Some(e) = &preliminary {
            debug!(server_name = %server_name.to_str(), error = %e, failures = ?failures, "Chain validation reported errors");
        }

        let ctx = ChainContext {
            server_name: server_name.to_str().into_owned(),
        };
        let reject = || {
            preliminary
                .clone()
                .unwrap_or(Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure))
        };

        for depth in (0..chain.len()).rev() {
            let cert = chain[depth];
            for &(code, _) in failures.iter().filter(|(_, d)| *d == depth) {
                if !self.verifier.verify_callback(&ctx, cert, code, depth, false) {
                    warn!(server_name = %ctx.server_name, code, depth, "Certificate rejected");
                    return Err(reject());
                }
            }
            if !self.verifier.verify_callback(&ctx, cert, X509_V_OK, depth, true) {
                warn!(server_name = %ctx.server_name, depth, "Certificate rejected");
                return Err(reject());
            }
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Translate a WebPKI verdict into the `(code, depth)` pairs OpenSSL would
/// have reported for the same chain. `chain[0]` is the leaf.
pub fn classify_chain_error(
    error: &Error,
    chain: &[&CertificateDer<'_>],
    now: UnixTime,
) -> Vec<(i32, usize)> {
    let Error::InvalidCertificate(cert_error) = error else {
        return vec![(X509_V_ERR_UNSPECIFIED, 0)];
    };
    let top = chain.len().saturating_sub(1);
    let invalid_at = |expired: bool| {
        chain
            .iter()
            .position(|c| x509::validity_violation(c, now) == Some(expired))
            .unwrap_or(0)
    };

    match cert_error {
        CertificateError::UnknownIssuer => match chain.get(top) {
            Some(cert) if x509::is_self_signed(cert) => {
                if top == 0 {
                    vec![(X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT, 0)]
                } else {
                    vec![(X509_V_ERR_SELF_SIGNED_CERT_IN_CHAIN, top)]
                }
            }
            _ if top == 0 => vec![(X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY, 0)],
            _ => vec![
                (X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY, top),
                (X509_V_ERR_CERT_UNTRUSTED, 0),
            ],
        },
        CertificateError::Expired | CertificateError::ExpiredContext { .. } => {
            vec![(X509_V_ERR_CERT_HAS_EXPIRED, invalid_at(true))]
        }
        CertificateError::NotValidYet | CertificateError::NotValidYetContext { .. } => {
            vec![(X509_V_ERR_CERT_NOT_YET_VALID, invalid_at(false))]
        }
        CertificateError::BadSignature => vec![(X509_V_ERR_CERT_SIGNATURE_FAILURE, 0)],
        CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. } => {
            vec![(X509_V_ERR_HOSTNAME_MISMATCH, 0)]
        }
        CertificateError::Revoked => vec![(X509_V_ERR_CERT_REVOKED, 0)],
        CertificateError::InvalidPurpose | CertificateError::InvalidPurposeContext { .. } => {
            vec![(X509_V_ERR_INVALID_PURPOSE, 0)]
        }
        CertificateError::UnhandledCriticalExtension => {
            vec![(X509_V_ERR_UNHANDLED_CRITICAL_EXTENSION, 0)]
        }
        _ => vec![(X509_V_ERR_UNSPECIFIED, 0)],
    }
}

/// TLS certificate verifier that accepts all certificates without validation.
///
/// **DANGEROUS**: installed only by [`super::NullVerifier`], which callers
/// must opt into explicitly (`--dangerous-insecure-tls`).
#[derive(Debug)]
pub struct InsecureCertVerifier(pub Arc<CryptoProvider>);

impl ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestPki;
    use crate::transport::TransportInfo;
    use futures_util::future::BoxFuture;
    use std::sync::Mutex;

    /// Records every callback and answers from a fixed verdict.
    struct Recorder {
        calls: Mutex<Vec<(i32, usize, bool)>>,
        accept: bool,
    }

    impl Recorder {
        fn new(accept: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                accept,
            })
        }
    }

    impl CertificateVerifier for Recorder {
        fn pre_handshake<'a>(
            &'a self,
            _domain: &'a str,
            _host: &'a str,
            _port: u16,
        ) -> BoxFuture<'a, Result<(), VerifyError>> {
            Box::pin(async { Ok(()) })
        }

        fn setup_context(self: Arc<Self>, ctx: &mut TlsContext) -> Result<(), VerifyError> {
            install_chain_walker(ctx, self)
        }

        fn verify_callback(
            &self,
            _ctx: &ChainContext,
            _cert: &CertificateDer<'_>,
            error: i32,
            depth: usize,
            preliminary: bool,
        ) -> bool {
            self.calls.lock().unwrap().push((error, depth, preliminary));
            self.accept
        }

        fn post_handshake<'a>(
            &'a self,
            _info: &'a TransportInfo,
        ) -> BoxFuture<'a, Result<(), VerifyError>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn name(s: &str) -> ServerName<'static> {
        ServerName::try_from(s.to_string()).unwrap()
    }

    #[test]
    fn test_lone_self_signed_leaf_is_depth_zero_self_signed() {
        let pki = TestPki::self_signed(&["localhost"]);
        let err = Error::InvalidCertificate(CertificateError::UnknownIssuer);
        assert_eq!(
            classify_chain_error(&err, &[&pki.leaf], UnixTime::now()),
            vec![(X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT, 0)]
        );
    }

    #[test]
    fn test_chain_with_self_signed_root() {
        let pki = TestPki::ca_signed(&["localhost"]);
        let ca = pki.ca.clone().unwrap();
        let err = Error::InvalidCertificate(CertificateError::UnknownIssuer);
        assert_eq!(
            classify_chain_error(&err, &[&pki.leaf, &ca], UnixTime::now()),
            vec![(X509_V_ERR_SELF_SIGNED_CERT_IN_CHAIN, 1)]
        );
    }

    #[test]
    fn test_leaf_without_issuer() {
        let pki = TestPki::ca_signed(&["localhost"]);
        let err = Error::InvalidCertificate(CertificateError::UnknownIssuer);
        assert_eq!(
            classify_chain_error(&err, &[&pki.leaf], UnixTime::now()),
            vec![(X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY, 0)]
        );
    }

    #[test]
    fn test_other_errors_map_to_openssl_codes() {
        let pki = TestPki::self_signed(&["localhost"]);
        let now = UnixTime::now();
        let classify = |e: CertificateError| {
            classify_chain_error(&Error::InvalidCertificate(e), &[&pki.leaf], now)
        };
        assert_eq!(classify(CertificateError::BadSignature), vec![(7, 0)]);
        assert_eq!(classify(CertificateError::Revoked), vec![(23, 0)]);
        assert_eq!(classify(CertificateError::NotValidForName), vec![(62, 0)]);
        assert_eq!(classify(CertificateError::Expired), vec![(10, 0)]);
        assert_eq!(
            classify_chain_error(&Error::DecryptError, &[&pki.leaf], now),
            vec![(X509_V_ERR_UNSPECIFIED, 0)]
        );
    }

    #[test]
    fn test_walk_reports_deepest_first_then_leaf() {
        let pki = TestPki::ca_signed(&["localhost"]);
        let ca = pki.ca.clone().unwrap();
        // Trust nothing: the CA shows up as a self-signed cert in the chain.
        let ctx = TlsContext::new(rustls::RootCertStore::empty());
        let recorder = Recorder::new(true);
        let walker = ChainWalker::new(&ctx, recorder.clone());

        walker
            .verify_server_cert(&pki.leaf, &[ca], &name("localhost"), &[], UnixTime::now())
            .unwrap();

        assert_eq!(
            *recorder.calls.lock().unwrap(),
            vec![
                (X509_V_ERR_SELF_SIGNED_CERT_IN_CHAIN, 1, false),
                (X509_V_OK, 1, true),
                (X509_V_OK, 0, true),
            ]
        );
    }

    #[test]
    fn test_trusted_chain_reports_no_errors() {
        let pki = TestPki::ca_signed(&["localhost"]);
        let ctx = TlsContext::new(pki.roots());
        let recorder = Recorder::new(true);
        let walker = ChainWalker::new(&ctx, recorder.clone());

        walker
            .verify_server_cert(&pki.leaf, &[], &name("localhost"), &[], UnixTime::now())
            .unwrap();
        assert_eq!(*recorder.calls.lock().unwrap(), vec![(X509_V_OK, 0, true)]);
    }

    #[test]
    fn test_rejecting_callback_fails_with_engine_error() {
        let pki = TestPki::self_signed(&["localhost"]);
        let ctx = TlsContext::new(rustls::RootCertStore::empty());
        let walker = ChainWalker::new(&ctx, Recorder::new(false));

        let err = walker
            .verify_server_cert(&pki.leaf, &[], &name("localhost"), &[], UnixTime::now())
            .unwrap_err();
        assert_eq!(err, Error::InvalidCertificate(CertificateError::UnknownIssuer));
    }
}
