use std::sync::Arc;

use futures_util::future::BoxFuture;
use rustls::pki_types::CertificateDer;
use tracing::{debug, warn};

use super::chain::{install_chain_walker, InsecureCertVerifier};
use super::{x509, CertificateVerifier, ChainContext};
use crate::error::VerifyError;
use crate::transport::{TlsContext, TransportInfo};

/// Accepts every certificate. Only for explicit opt-in (development servers
/// with throwaway certificates).
#[derive(Debug, Default)]
pub struct NullVerifier;

impl CertificateVerifier for NullVerifier {
    fn pre_handshake<'a>(
        &'a self,
        _domain: &'a str,
        _host: &'a str,
        _port: u16,
    ) -> BoxFuture<'a, Result<(), VerifyError>> {
        Box::pin(async { Ok(()) })
    }

    fn setup_context(self: Arc<Self>, ctx: &mut TlsContext) -> Result<(), VerifyError> {
        warn!("TLS certificate verification DISABLED (--dangerous-insecure-tls)");
        let verifier = InsecureCertVerifier(ctx.provider().clone());
        ctx.set_verifier(Arc::new(verifier));
        Ok(())
    }

    fn verify_callback(
        &self,
        _ctx: &ChainContext,
        _cert: &CertificateDer<'_>,
        _error: i32,
        _depth: usize,
        _preliminary: bool,
    ) -> bool {
        true
    }

    fn post_handshake<'a>(
        &'a self,
        _info: &'a TransportInfo,
    ) -> BoxFuture<'a, Result<(), VerifyError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Standard PKIX validation: the engine's chain verdict stands, and the leaf
/// must name the server.
#[derive(Debug, Default)]
pub struct PkixVerifier;

impl CertificateVerifier for PkixVerifier {
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
        ctx: &ChainContext,
        cert: &CertificateDer<'_>,
        error: i32,
        depth: usize,
        preliminary: bool,
    ) -> bool {
        if !preliminary {
            debug!(server_name = %ctx.server_name, error, depth, "PKIX validation failed");
            return false;
        }
        if depth == 0 && !x509::matches_hostname(cert, &ctx.server_name) {
            debug!(server_name = %ctx.server_name, "Leaf certificate does not name the server");
            return false;
        }
        true
    }

    fn post_handshake<'a>(
        &'a self,
        _info: &'a TransportInfo,
    ) -> BoxFuture<'a, Result<(), VerifyError>> {
        Box::pin(async { Ok(()) })
    }
}
