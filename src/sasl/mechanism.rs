use std::any::Any;
use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tracing::warn;

use super::{SaslState, SaslStateMachine};
use crate::error::SaslError;

/// Opaque value returned by [`Mechanism::any_supported`] and handed back to
/// the same mechanism's [`Mechanism::authenticate`].
#[derive(Clone)]
pub struct MechanismToken {
    /// Advertised name the mechanism selected.
    name: String,
    inner: Arc<dyn Any + Send + Sync>,
}

impl MechanismToken {
    pub fn new<T: Any + Send + Sync>(name: &str, value: T) -> Self {
        Self {
            name: name.to_string(),
            inner: Arc::new(value),
        }
    }

    /// The advertised mechanism name this token selects.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get<T: Any>(&self) -> Result<&T, SaslError> {
        self.inner.downcast_ref::<T>().ok_or_else(|| {
            SaslError::Protocol(format!("token for {} used with another mechanism", self.name))
        })
    }
}

impl fmt::Debug for MechanismToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MechanismToken").field(&self.name).finish()
    }
}

/// A SASL mechanism implementation.
pub trait Mechanism: Send + Sync {
    /// Family name (`"PLAIN"`, `"SCRAM"`, ...), used to disable a mechanism
    /// for the rest of a negotiation.
    fn family(&self) -> &'static str;

    /// Pick among the advertised mechanism names. Pure and synchronous.
    fn any_supported(&self, advertised: &[String]) -> Option<MechanismToken>;

    /// Run the exchange. Must end in `Success` or return an error.
    fn authenticate<'a, 's>(
        &'a self,
        sm: &'a mut SaslStateMachine<'s>,
        token: MechanismToken,
    ) -> BoxFuture<'a, Result<(), SaslError>>;
}

/// A username and password, not yet SASLprep'd.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Called by a mechanism when it needs credentials. An error ends the
/// exchange (e.g. the user declined to enter a password).
pub type CredentialProvider =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Credentials, SaslError>> + Send + Sync>;

/// RFC 4013 SASLprep.
pub(crate) fn saslprep(input: &str, what: &str) -> Result<String, SaslError> {
    stringprep::saslprep(input)
        .map(|s| s.into_owned())
        .map_err(|e| SaslError::InvalidInput(format!("{what} rejected by SASLprep: {e}")))
}

/// Abort after an out-of-protocol reply, then report the violation.
pub(crate) async fn abort_with(
    sm: &mut SaslStateMachine<'_>,
    reason: String,
) -> SaslError {
    if sm.state() == SaslState::Challenge {
        if let Err(e) = sm.abort().await {
            warn!(error = %e, "SASL abort failed");
        }
    }
    SaslError::Protocol(reason)
}

/// RFC 4616 PLAIN: one message carrying `\0username\0password`.
pub struct Plain {
    credentials: CredentialProvider,
}

impl Plain {
    pub fn new(credentials: CredentialProvider) -> Self {
        Self { credentials }
    }
}

impl Mechanism for Plain {
    fn family(&self) -> &'static str {
        "PLAIN"
    }

    fn any_supported(&self, advertised: &[String]) -> Option<MechanismToken> {
        advertised
            .iter()
            .any(|m| m == "PLAIN")
            .then(|| MechanismToken::new("PLAIN", ()))
    }

    fn authenticate<'a, 's>(
        &'a self,
        sm: &'a mut SaslStateMachine<'s>,
        token: MechanismToken,
    ) -> BoxFuture<'a, Result<(), SaslError>> {
        Box::pin(async move {
            token.get::<()>()?;
            let credentials = (self.credentials)().await?;
            let username = saslprep(&credentials.username, "username")?;
            let password = saslprep(&credentials.password, "password")?;

            let mut payload = Vec::with_capacity(username.len() + password.len() + 2);
            payload.push(0);
            payload.extend_from_slice(username.as_bytes());
            payload.push(0);
            payload.extend_from_slice(password.as_bytes());

            match sm.initiate("PLAIN", Some(payload)).await? {
                (SaslState::Success, _) => Ok(()),
                (state, _) => Err(abort_with(sm, format!("PLAIN ended in {state:?}")).await),
            }
        })
    }
}

/// RFC 4505 ANONYMOUS with an optional trace token.
pub struct Anonymous {
    trace: String,
}

impl Anonymous {
    pub fn new(trace: &str) -> Self {
        Self {
            trace: trace.to_string(),
        }
    }
}

impl Mechanism for Anonymous {
    fn family(&self) -> &'static str {
        "ANONYMOUS"
    }

    fn any_supported(&self, advertised: &[String]) -> Option<MechanismToken> {
        advertised
            .iter()
            .any(|m| m == "ANONYMOUS")
            .then(|| MechanismToken::new("ANONYMOUS", ()))
    }

    fn authenticate<'a, 's>(
        &'a self,
        sm: &'a mut SaslStateMachine<'s>,
        token: MechanismToken,
    ) -> BoxFuture<'a, Result<(), SaslError>> {
        Box::pin(async move {
            token.get::<()>()?;
            let trace = saslprep(&self.trace, "trace token")?;
            match sm.initiate("ANONYMOUS", Some(trace.into_bytes())).await? {
                (SaslState::Success, _) => Ok(()),
                (state, _) => Err(abort_with(sm, format!("ANONYMOUS ended in {state:?}")).await),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Nonza;
    use crate::test_support::{fixed_credentials, ScriptedStream};

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_any_supported() {
        let plain = Plain::new(fixed_credentials("u", "p"));
        assert!(plain.any_supported(&names(&["SCRAM-SHA-1", "PLAIN"])).is_some());
        assert!(plain.any_supported(&names(&["SCRAM-SHA-1"])).is_none());
        assert!(Anonymous::new("").any_supported(&names(&["ANONYMOUS"])).is_some());
    }

    #[tokio::test]
    async fn test_plain_payload() {
        let mut stream = ScriptedStream::new(true, vec![Nonza::SaslSuccess(None)]);
        let plain = Plain::new(fixed_credentials("juliet", "r\u{00AA}mpart"));
        let token = plain.any_supported(&names(&["PLAIN"])).unwrap();
        {
            let mut sm = SaslStateMachine::new(&mut stream);
            plain.authenticate(&mut sm, token).await.unwrap();
        }
        // SASLprep maps U+00AA to "a" (NFKC).
        assert_eq!(
            stream.sent[0],
            Nonza::SaslAuth {
                mechanism: "PLAIN".to_string(),
                payload: Some(b"\0juliet\0rampart".to_vec()),
            }
        );
    }

    #[tokio::test]
    async fn test_plain_challenge_is_a_violation() {
        let mut stream = ScriptedStream::new(
            true,
            vec![
                Nonza::SaslChallenge(Vec::new()),
                Nonza::SaslFailure {
                    condition: "aborted".to_string(),
                    text: None,
                },
            ],
        );
        let plain = Plain::new(fixed_credentials("u", "p"));
        let token = plain.any_supported(&names(&["PLAIN"])).unwrap();
        let mut sm = SaslStateMachine::new(&mut stream);
        let err = plain.authenticate(&mut sm, token).await.unwrap_err();
        assert!(matches!(err, SaslError::Protocol(_)));
        assert_eq!(stream.sent.last(), Some(&Nonza::SaslAbort));
    }

    #[tokio::test]
    async fn test_plain_rejects_prohibited_characters() {
        let mut stream = ScriptedStream::new(true, Vec::new());
        let plain = Plain::new(fixed_credentials("u", "bad\u{0007}"));
        let token = plain.any_supported(&names(&["PLAIN"])).unwrap();
        let mut sm = SaslStateMachine::new(&mut stream);
        assert!(matches!(
            plain.authenticate(&mut sm, token).await,
            Err(SaslError::InvalidInput(_))
        ));
        assert!(stream.sent.is_empty());
    }

    #[tokio::test]
    async fn test_anonymous_sends_trace_token() {
        let mut stream = ScriptedStream::new(false, vec![Nonza::SaslSuccess(None)]);
        let anonymous = Anonymous::new("");
        let token = anonymous.any_supported(&names(&["ANONYMOUS"])).unwrap();
        {
            let mut sm = SaslStateMachine::new(&mut stream);
            anonymous.authenticate(&mut sm, token).await.unwrap();
        }
        assert!(stream.sent[0].to_xml().ends_with(">=</auth>"));
    }

    #[tokio::test]
    async fn test_foreign_token_is_rejected() {
        let mut stream = ScriptedStream::new(true, Vec::new());
        let plain = Plain::new(fixed_credentials("u", "p"));
        let mut sm = SaslStateMachine::new(&mut stream);
        let foreign = MechanismToken::new("PLAIN", 42u8);
        assert!(plain.authenticate(&mut sm, foreign).await.is_err());
    }
}
