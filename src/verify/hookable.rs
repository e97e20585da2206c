use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use futures_util::future::BoxFuture;
use rustls::pki_types::CertificateDer;
use tracing::{debug, info, warn};

use super::chain::install_chain_walker;
use super::pin_store::PinStore;
use super::{
    x509, CertificateVerifier, ChainContext, X509_V_ERR_CERT_UNTRUSTED,
    X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT, X509_V_ERR_SELF_SIGNED_CERT_IN_CHAIN, X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY,
    X509_V_ERR_UNABLE_TO_VERIFY_LEAF_SIGNATURE,
};
use crate::error::VerifyError;
use crate::transport::{TlsContext, TransportInfo};

/// Synchronous verdict on a leaf: accept, reject, or unknown (`None`).
pub type QuickCheck = Arc<dyn Fn(&str, &CertificateDer<'_>) -> Option<bool> + Send + Sync>;

/// Asks for explicit approval of a certificate the quick check could not
/// decide on. Resolves to `true` to accept.
pub type ApprovalHook = Arc<dyn Fn(ApprovalRequest) -> BoxFuture<'static, bool> + Send + Sync>;

/// What a deferred decision is about.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub server_name: String,
    pub leaf: CertificateDer<'static>,
    pub errors: Vec<(i32, usize)>,
    pub hostname_matches: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedError {
    pub cert: CertificateDer<'static>,
    pub code: i32,
    pub depth: usize,
}

/// Everything learned about the peer's chain during one handshake.
#[derive(Debug, Clone, Default)]
pub struct TrustRecord {
    pub errors: Vec<RecordedError>,
    pub hostname_matches: bool,
    pub leaf: Option<CertificateDer<'static>>,
    pub server_name: String,
    pub deferred: bool,
}

/// Whether an error may be overridden by a quick check or explicit approval.
/// Anything else, a hostname mismatch on an otherwise trusted chain
/// included, fails the handshake outright.
pub fn is_deferrable(code: i32, depth: usize) -> bool {
    matches!(
        (code, depth),
        (X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT, _)
            | (X509_V_ERR_SELF_SIGNED_CERT_IN_CHAIN, _)
            | (X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY, _)
            | (X509_V_ERR_CERT_UNTRUSTED, 0)
    )
}

/// PKIX verification whose recoverable failures (untrusted issuer,
/// self-signed certificates) can be overridden: first by a synchronous
/// quick check, and if that cannot decide, by an asynchronous approval hook
/// after the handshake. Without an approval hook, undecided certificates
/// are rejected.
pub struct HookableVerifier {
    quick_check: Option<QuickCheck>,
    approval_hook: Option<ApprovalHook>,
    record: Mutex<TrustRecord>,
}

impl HookableVerifier {
    pub fn new(quick_check: Option<QuickCheck>, approval_hook: Option<ApprovalHook>) -> Self {
        Self {
            quick_check,
            approval_hook,
            record: Mutex::new(TrustRecord::default()),
        }
    }

    /// Snapshot of the current handshake's trust record.
    pub fn record(&self) -> TrustRecord {
        self.lock().clone()
    }

    pub fn deferred(&self) -> bool {
        self.lock().deferred
    }

    fn lock(&self) -> MutexGuard<'_, TrustRecord> {
        // A poisoned record only means a callback panicked; the data is still usable.
        self.record.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn evaluate(&self, record: &mut TrustRecord) -> bool {
        record.deferred = false;
        // A chain that validated cleanly has no error a pin or approval could
        // stand in for, so a wrong name is final.
        if record.errors.is_empty() {
            if !record.hostname_matches {
                debug!(server_name = %record.server_name, "Trusted certificate for another name");
            }
            return record.hostname_matches;
        }
        if let Some(fatal) = record
            .errors
            .iter()
            .find(|e| !is_deferrable(e.code, e.depth))
        {
            debug!(code = fatal.code, depth = fatal.depth, "Non-deferrable certificate error");
            return false;
        }
        let Some(leaf) = record.leaf.as_ref() else {
            return false;
        };
        let verdict = self
            .quick_check
            .as_ref()
            .and_then(|check| check(record.server_name.as_str(), leaf));
        match verdict {
            Some(accept) => {
                debug!(server_name = %record.server_name, accept, "Quick check decided");
                accept
            }
            None => {
                debug!(server_name = %record.server_name, "Certificate decision deferred");
                record.deferred = true;
                true
            }
        }
    }
}

impl fmt::Debug for HookableVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookableVerifier")
            .field("quick_check", &self.quick_check.is_some())
            .field("approval_hook", &self.approval_hook.is_some())
            .finish()
    }
}

impl CertificateVerifier for HookableVerifier {
    fn pre_handshake<'a>(
        &'a self,
        _domain: &'a str,
        _host: &'a str,
        _port: u16,
    ) -> BoxFuture<'a, Result<(), VerifyError>> {
        Box::pin(async { Ok(()) })
    }

    fn setup_context(self: Arc<Self>, ctx: &mut TlsContext) -> Result<(), VerifyError> {
        *self.lock() = TrustRecord::default();
        install_chain_walker(ctx, self)
    }

    fn verify_callback(
        &self,
        ctx: &ChainContext,
        cert: &CertificateDer<'_>,
        error: i32,
        depth: usize,
        _preliminary: bool,
    ) -> bool {
        let mut record = self.lock();
        if error != 0 {
            if error == X509_V_ERR_UNABLE_TO_VERIFY_LEAF_SIGNATURE && depth > 0 {
                return true;
            }
            record.errors.push(RecordedError {
                cert: cert.clone().into_owned(),
                code: error,
                depth,
            });
            return true;
        }
        if depth > 0 {
            return true;
        }

        record.leaf = Some(cert.clone().into_owned());
        record.server_name = ctx.server_name.clone();
        record.hostname_matches = x509::matches_hostname(cert, &ctx.server_name);
        self.evaluate(&mut record)
    }

    fn post_handshake<'a>(
        &'a self,
        _info: &'a TransportInfo,
    ) -> BoxFuture<'a, Result<(), VerifyError>> {
        Box::pin(async move {
            let request = {
                let record = self.lock();
                if !record.deferred {
                    return Ok(());
                }
                let Some(leaf) = record.leaf.clone() else {
                    return Err(VerifyError::Rejected {
                        reason: "deferred decision without a leaf certificate".to_string(),
                    });
                };
                ApprovalRequest {
                    server_name: record.server_name.clone(),
                    leaf,
                    errors: record.errors.iter().map(|e| (e.code, e.depth)).collect(),
                    hostname_matches: record.hostname_matches,
                }
            };

            let Some(hook) = &self.approval_hook else {
                warn!(server_name = %request.server_name, "Certificate needs approval but no approval hook is configured");
                return Err(VerifyError::NoApprovalHook);
            };
            let server_name = request.server_name.clone();
            if hook(request).await {
                info!(server_name = %server_name, "Certificate approved");
                self.lock().deferred = false;
                Ok(())
            } else {
                warn!(server_name = %server_name, "Certificate not approved");
                Err(VerifyError::Rejected {
                    reason: format!("certificate for {server_name} was not approved"),
                })
            }
        })
    }
}

/// Hookable verification whose quick check accepts certificates found in a
/// [`PinStore`] for the negotiated server name. Certificates that are not
/// pinned stay undecided and go to the approval hook.
pub struct PinningVerifier {
    inner: HookableVerifier,
    store: Arc<RwLock<PinStore>>,
}

impl PinningVerifier {
    pub fn new(store: Arc<RwLock<PinStore>>, approval_hook: Option<ApprovalHook>) -> Self {
        let lookup = store.clone();
        let quick_check: QuickCheck = Arc::new(move |hostname: &str, cert: &CertificateDer<'_>| {
            let store = lookup.read().ok()?;
            store.query(hostname, cert)
        });
        Self {
            inner: HookableVerifier::new(Some(quick_check), approval_hook),
            store,
        }
    }

    pub fn store(&self) -> &Arc<RwLock<PinStore>> {
        &self.store
    }

    pub fn record(&self) -> TrustRecord {
        self.inner.record()
    }
}

impl fmt::Debug for PinningVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinningVerifier")
            .field("inner", &self.inner)
            .finish()
    }
}

impl CertificateVerifier for PinningVerifier {
    fn pre_handshake<'a>(
        &'a self,
        domain: &'a str,
        host: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<(), VerifyError>> {
        self.inner.pre_handshake(domain, host, port)
    }

    fn setup_context(self: Arc<Self>, ctx: &mut TlsContext) -> Result<(), VerifyError> {
        *self.inner.lock() = TrustRecord::default();
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
        self.inner.verify_callback(ctx, cert, error, depth, preliminary)
    }

    fn post_handshake<'a>(
        &'a self,
        info: &'a TransportInfo,
    ) -> BoxFuture<'a, Result<(), VerifyError>> {
        self.inner.post_handshake(info)
    }
}
