use std::fmt;
use std::sync::Arc;

use rustls::client::danger::ServerCertVerifier;
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, RootCertStore};
use tracing::{debug, warn};

use crate::error::TransportError;

/// Everything needed to build a rustls client session for one connection
/// attempt. Produced fresh by the security layer's context factory; the
/// certificate verifier installs its callback through [`TlsContext::set_verifier`].
#[derive(Clone)]
pub struct TlsContext {
    provider: Arc<CryptoProvider>,
    roots: Arc<RootCertStore>,
    verifier: Option<Arc<dyn ServerCertVerifier>>,
    alpn_protocols: Vec<Vec<u8>>,
}

impl TlsContext {
    pub fn new(roots: RootCertStore) -> Self {
        Self {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            roots: Arc::new(roots),
            verifier: None,
            alpn_protocols: Vec::new(),
        }
    }

    /// Context trusting the operating system's root certificates.
    pub fn with_native_roots() -> Result<Self, TransportError> {
        let mut roots = RootCertStore::empty();
        let native_certs = rustls_native_certs::load_native_certs();
        for error in &native_certs.errors {
            warn!(error = %error, "Failed to load some system root certificates");
        }
        if native_certs.certs.is_empty() {
            return Err(TransportError::Config(
                "No system root certificates found. TLS connections will fail. \
                Ensure CA certificates are installed (e.g., ca-certificates package on Linux)."
                    .to_string(),
            ));
        }
        let (added, ignored) = roots.add_parsable_certificates(native_certs.certs);
        debug!(added, ignored, "Loaded system root certificates");
        Ok(Self::new(roots))
    }

    pub fn provider(&self) -> &Arc<CryptoProvider> {
        &self.provider
    }

    pub fn roots(&self) -> &Arc<RootCertStore> {
        &self.roots
    }

    /// Route server certificate verification through `verifier` instead of
    /// the built-in WebPKI verifier.
    pub fn set_verifier(&mut self, verifier: Arc<dyn ServerCertVerifier>) {
        self.verifier = Some(verifier);
    }

    pub fn has_custom_verifier(&self) -> bool {
        self.verifier.is_some()
    }

    pub fn set_alpn_protocols(&mut self, protocols: Vec<Vec<u8>>) {
        self.alpn_protocols = protocols;
    }

    pub fn build_client_config(&self) -> Result<Arc<ClientConfig>, TransportError> {
        let builder = ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Config(e.to_string()))?;
        let mut config = match &self.verifier {
            Some(verifier) => builder
                .dangerous()
                .with_custom_certificate_verifier(verifier.clone())
                .with_no_client_auth(),
            None => builder
                .with_root_certificates(self.roots.clone())
                .with_no_client_auth(),
        };
        config.alpn_protocols = self.alpn_protocols.clone();
        Ok(Arc::new(config))
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("roots", &self.roots.len())
            .field("custom_verifier", &self.verifier.is_some())
            .field("alpn_protocols", &self.alpn_protocols.len())
            .finish()
    }
}
