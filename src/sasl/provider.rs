use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tracing::{debug, info, warn};

use super::mechanism::{Anonymous, CredentialProvider, Credentials, Mechanism, Plain};
use super::scram::Scram;
use super::SaslStateMachine;
use crate::error::{SaslError, SaslErrorCategory};
use crate::jid::Jid;
use crate::stream::{NonzaStream, StreamFeatures};

/// Default number of password prompts per mechanism.
pub const DEFAULT_MAX_AUTH_ATTEMPTS: u32 = 3;

/// Asked for the password of `jid`; the second argument counts previous
/// failed attempts. `None` aborts authentication.
pub type PasswordProvider =
    Arc<dyn Fn(Jid, u32) -> BoxFuture<'static, Option<String>> + Send + Sync>;

/// One way of authenticating, tried in order by
/// [`crate::security_layer::negotiate_sasl`].
pub trait SaslProvider: Send + Sync {
    /// `Ok(true)` on success, `Ok(false)` if no applicable mechanism is
    /// advertised, an error otherwise.
    fn execute<'a>(
        &'a self,
        jid: &'a Jid,
        features: &'a StreamFeatures,
        stream: &'a mut dyn NonzaStream,
    ) -> BoxFuture<'a, Result<bool, SaslError>>;
}

/// Run `mechanism` once on a fresh exchange.
async fn run_mechanism(
    stream: &mut dyn NonzaStream,
    mechanism: &dyn Mechanism,
    token: super::MechanismToken,
) -> Result<(), SaslError> {
    let mut sm = SaslStateMachine::new(stream);
    mechanism.authenticate(&mut sm, token).await
}

#[derive(Default)]
struct CredentialState {
    attempt: u32,
    password: Option<String>,
    declined: bool,
}

fn lock(state: &Mutex<CredentialState>) -> MutexGuard<'_, CredentialState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Password-based authentication with SCRAM, falling back to PLAIN.
pub struct PasswordSaslProvider {
    password_provider: PasswordProvider,
    max_auth_attempts: u32,
    allow_plain_without_tls: bool,
}

impl PasswordSaslProvider {
    pub fn new(password_provider: PasswordProvider) -> Self {
        Self {
            password_provider,
            max_auth_attempts: DEFAULT_MAX_AUTH_ATTEMPTS,
            allow_plain_without_tls: false,
        }
    }

    pub fn with_max_auth_attempts(mut self, attempts: u32) -> Self {
        self.max_auth_attempts = attempts.max(1);
        self
    }

    /// Allow PLAIN over an unencrypted stream. Off by default.
    pub fn allow_plain_without_tls(mut self, allow: bool) -> Self {
        self.allow_plain_without_tls = allow;
        self
    }

    /// Credentials for one negotiation: the password is asked for once and
    /// reused until a credential failure clears it.
    fn credential_provider(
        &self,
        username: String,
        jid: Jid,
        state: Arc<Mutex<CredentialState>>,
    ) -> CredentialProvider {
        let password_provider = self.password_provider.clone();
        Arc::new(move || {
            let (username, jid, state) = (username.clone(), jid.clone(), state.clone());
            let password_provider = password_provider.clone();
            async move {
                let (cached, attempt) = {
                    let state = lock(&state);
                    (state.password.clone(), state.attempt)
                };
                if let Some(password) = cached {
                    return Ok(Credentials { username, password });
                }
                match password_provider(jid, attempt).await {
                    Some(password) => {
                        lock(&state).password = Some(password.clone());
                        Ok(Credentials { username, password })
                    }
                    None => {
                        lock(&state).declined = true;
                        Err(SaslError::Aborted("no password supplied".to_string()))
                    }
                }
            }
            .boxed()
        })
    }

    async fn negotiate(
        &self,
        jid: &Jid,
        features: &StreamFeatures,
        stream: &mut dyn NonzaStream,
    ) -> Result<bool, SaslError> {
        let jid = jid.bare();
        let username = jid
            .localpart()
            .ok_or_else(|| {
                SaslError::InvalidInput(format!("{jid} has no localpart to authenticate as"))
            })?
            .to_string();
        let state = Arc::new(Mutex::new(CredentialState::default()));
        let credentials = self.credential_provider(username, jid.clone(), state.clone());

        let mut mechanisms: Vec<Box<dyn Mechanism>> = vec![Box::new(Scram::new(credentials.clone()))];
        if stream.tls_active() || self.allow_plain_without_tls {
            mechanisms.push(Box::new(Plain::new(credentials)));
        } else if features.has_mechanism("PLAIN") {
            debug!("Not offering PLAIN over an unencrypted stream");
        }

        loop {
            let Some((index, token)) = mechanisms
                .iter()
                .enumerate()
                .find_map(|(i, m)| m.any_supported(&features.mechanisms).map(|t| (i, t)))
            else {
                debug!(advertised = ?features.mechanisms, "No usable password mechanism left");
                return Ok(false);
            };
            let mechanism = mechanisms.remove(index);
            info!(mechanism = token.name(), jid = %jid, "Authenticating");

            let mut last_credential_error = None;
            for attempt in 0..self.max_auth_attempts {
                lock(&state).attempt = attempt;
                match run_mechanism(stream, mechanism.as_ref(), token.clone()).await {
                    Ok(()) => {
                        info!(mechanism = token.name(), jid = %jid, "Authenticated");
                        return Ok(true);
                    }
                    Err(e) if lock(&state).declined => return Err(e),
                    Err(e) => match e.category() {
                        SaslErrorCategory::Credentials => {
                            warn!(
                                mechanism = token.name(),
                                attempt = attempt + 1,
                                max = self.max_auth_attempts,
                                error = %e,
                                "Authentication failed"
                            );
                            lock(&state).password = None;
                            last_credential_error = Some(e);
                        }
                        SaslErrorCategory::MechanismRejected => {
                            debug!(mechanism = mechanism.family(), error = %e, "Mechanism rejected, disabling it");
                            last_credential_error = None;
                            break;
                        }
                        SaslErrorCategory::Protocol => {
                            warn!(mechanism = token.name(), error = %e, "SASL protocol failure, trying next mechanism");
                            last_credential_error = None;
                            break;
                        }
                        SaslErrorCategory::Fatal => return Err(e),
                    },
                }
            }
            if let Some(e) = last_credential_error {
                return Err(e);
            }
        }
    }
}

impl SaslProvider for PasswordSaslProvider {
    fn execute<'a>(
        &'a self,
        jid: &'a Jid,
        features: &'a StreamFeatures,
        stream: &'a mut dyn NonzaStream,
    ) -> BoxFuture<'a, Result<bool, SaslError>> {
        Box::pin(self.negotiate(jid, features, stream))
    }
}

/// ANONYMOUS authentication.
pub struct AnonymousSaslProvider {
    trace: String,
}

impl AnonymousSaslProvider {
    pub fn new(trace: &str) -> Self {
        Self {
            trace: trace.to_string(),
        }
    }
}

impl SaslProvider for AnonymousSaslProvider {
    fn execute<'a>(
        &'a self,
        _jid: &'a Jid,
        features: &'a StreamFeatures,
        stream: &'a mut dyn NonzaStream,
    ) -> BoxFuture<'a, Result<bool, SaslError>> {
        Box::pin(async move {
            let mechanism = Anonymous::new(&self.trace);
            let Some(token) = mechanism.any_supported(&features.mechanisms) else {
                return Ok(false);
            };
            match run_mechanism(stream, &mechanism, token).await {
                Ok(()) => {
                    info!("Authenticated anonymously");
                    Ok(true)
                }
                Err(e) if e.category() == SaslErrorCategory::MechanismRejected => {
                    debug!(error = %e, "ANONYMOUS rejected");
                    Ok(false)
                }
                Err(e) => Err(e),
            }
        })
    }
}
