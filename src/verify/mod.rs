//! Certificate Trust Evaluator.
//!
//! A [`CertificateVerifier`] takes part in one TLS handshake. Its
//! `setup_context` hook installs a [`chain::ChainWalker`] into the TLS context;
//! during the handshake rustls calls the walker, which reports every
//! certificate of the presented chain (deepest first) to
//! [`CertificateVerifier::verify_callback`] together with an X.509
//! verification error code and the certificate's chain depth. After the
//! handshake, [`CertificateVerifier::post_handshake`] may resolve decisions
//! that could not be made synchronously.
//!
//! Verifiers are stateful; the security layer creates a fresh one for every
//! connection attempt.

mod chain;
mod hookable;
mod pin_store;
mod pkix;
pub mod x509;

pub use chain::{classify_chain_error, install_chain_walker, ChainWalker, InsecureCertVerifier};
pub use hookable::{
    is_deferrable, ApprovalHook, ApprovalRequest, HookableVerifier, PinningVerifier, QuickCheck, RecordedError,
    TrustRecord,
};
pub use pin_store::{PinStore, PinType};
pub use pkix::{NullVerifier, PkixVerifier};

use futures_util::future::BoxFuture;
use rustls::pki_types::CertificateDer;

use crate::error::VerifyError;
use crate::transport::{TlsContext, TransportInfo};

// OpenSSL X509_V_ERR_* codes reported to `verify_callback`.
pub const X509_V_OK: i32 = 0;
pub const X509_V_ERR_UNSPECIFIED: i32 = 1;
pub const X509_V_ERR_CERT_SIGNATURE_FAILURE: i32 = 7;
pub const X509_V_ERR_CERT_NOT_YET_VALID: i32 = 9;
pub const X509_V_ERR_CERT_HAS_EXPIRED: i32 = 10;
pub const X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT: i32 = 18;
pub const X509_V_ERR_SELF_SIGNED_CERT_IN_CHAIN: i32 = 19;
pub const X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY: i32 = 20;
pub const X509_V_ERR_UNABLE_TO_VERIFY_LEAF_SIGNATURE: i32 = 21;
pub const X509_V_ERR_CERT_REVOKED: i32 = 23;
pub const X509_V_ERR_INVALID_PURPOSE: i32 = 26;
pub const X509_V_ERR_CERT_UNTRUSTED: i32 = 27;
pub const X509_V_ERR_UNHANDLED_CRITICAL_EXTENSION: i32 = 34;
pub const X509_V_ERR_HOSTNAME_MISMATCH: i32 = 62;

/// Per-handshake data available to `verify_callback`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainContext {
    /// Name sent as SNI and checked against the leaf.
    pub server_name: String,
}

/// Strategy consulted before, during, and after a TLS handshake.
pub trait CertificateVerifier: Send + Sync {
    /// Out-of-band checks before the TLS engine exists (e.g. DANE lookups).
    fn pre_handshake<'a>(
        &'a self,
        domain: &'a str,
        host: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<(), VerifyError>>;

    /// Install the verification callback into `ctx`.
    fn setup_context(
        self: std::sync::Arc<Self>,
        ctx: &mut TlsContext,
    ) -> Result<(), VerifyError>;

    /// Called once per certificate (and once per error on that certificate)
    /// while the chain is walked. `preliminary` is the engine's own verdict
    /// for this call. Returning `false` aborts the handshake.
    fn verify_callback(
        &self,
        ctx: &ChainContext,
        cert: &CertificateDer<'_>,
        error: i32,
        depth: usize,
        preliminary: bool,
    ) -> bool;

    /// Runs after the handshake and before the transport is declared open.
    fn post_handshake<'a>(
        &'a self,
        info: &'a TransportInfo,
    ) -> BoxFuture<'a, Result<(), VerifyError>>;
}
