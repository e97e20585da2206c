//! SASL Negotiation Engine.
//!
//! [`SaslStateMachine`] is the wire-level exchange (auth, challenge,
//! response, success, failure, abort). Mechanisms in [`mechanism`] and
//! [`scram`] drive it; providers in [`provider`] pick a mechanism from the
//! peer's advertisement and own the credential retry policy.

pub mod mechanism;
pub mod provider;
pub mod scram;

pub use mechanism::{Anonymous, Credentials, CredentialProvider, Mechanism, MechanismToken, Plain};
pub use provider::{AnonymousSaslProvider, PasswordProvider, PasswordSaslProvider, SaslProvider};
pub use scram::{Scram, ScramHash};

use tracing::debug;

use crate::error::{SaslError, StreamError};
use crate::stream::{Nonza, NonzaKind, NonzaStream};

const OUTCOMES: &[NonzaKind] = &[
    NonzaKind::SaslChallenge,
    NonzaKind::SaslSuccess,
    NonzaKind::SaslFailure,
];

/// Progress of one SASL exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslState {
    Initial,
    Challenge,
    Success,
    Failure,
}

/// One SASL exchange over a negotiation stream.
pub struct SaslStateMachine<'s> {
    stream: &'s mut dyn NonzaStream,
    state: SaslState,
}

impl<'s> SaslStateMachine<'s> {
    pub fn new(stream: &'s mut dyn NonzaStream) -> Self {
        Self {
            stream,
            state: SaslState::Initial,
        }
    }

    pub fn state(&self) -> SaslState {
        self.state
    }

    /// Whether the underlying channel is encrypted.
    pub fn tls_active(&self) -> bool {
        self.stream.tls_active()
    }

    /// Send `<auth/>` and wait for the first outcome.
    pub async fn initiate(
        &mut self,
        mechanism: &str,
        payload: Option<Vec<u8>>,
    ) -> Result<(SaslState, Option<Vec<u8>>), SaslError> {
        if self.state != SaslState::Initial {
            return Err(SaslError::Protocol(format!(
                "initiate is not allowed in state {:?}",
                self.state
            )));
        }
        debug!(mechanism, "Starting SASL exchange");
        self.exchange(Nonza::SaslAuth {
            mechanism: mechanism.to_string(),
            payload,
        })
        .await
    }

    /// Answer the last challenge.
    pub async fn response(
        &mut self,
        payload: Vec<u8>,
    ) -> Result<(SaslState, Option<Vec<u8>>), SaslError> {
        if self.state != SaslState::Challenge {
            return Err(SaslError::Protocol(format!(
                "response is not allowed in state {:?}",
                self.state
            )));
        }
        self.exchange(Nonza::SaslResponse(payload)).await
    }

    /// Abandon the exchange. The peer must answer with `<failure/>`.
    pub async fn abort(&mut self) -> Result<(), SaslError> {
        if matches!(self.state, SaslState::Initial | SaslState::Success | SaslState::Failure) {
            return Err(SaslError::Protocol(format!(
                "abort is not allowed in state {:?}",
                self.state
            )));
        }
        debug!("Aborting SASL exchange");
        let reply = self
            .stream
            .send_and_wait_for(vec![Nonza::SaslAbort], OUTCOMES)
            .await
            .map_err(stream_error)?;
        self.state = SaslState::Failure;
        match reply {
            Nonza::SaslFailure { .. } => Ok(()),
            other => Err(SaslError::Protocol(format!(
                "expected failure after abort, got {:?}",
                other.kind()
            ))),
        }
    }

    async fn exchange(
        &mut self,
        nonza: Nonza,
    ) -> Result<(SaslState, Option<Vec<u8>>), SaslError> {
        let reply = match self.stream.send_and_wait_for(vec![nonza], OUTCOMES).await {
            Ok(reply) => reply,
            Err(e) => {
                self.state = SaslState::Failure;
                return Err(stream_error(e));
            }
        };
        match reply {
            Nonza::SaslChallenge(payload) => {
                self.state = SaslState::Challenge;
                Ok((SaslState::Challenge, Some(payload)))
            }
            Nonza::SaslSuccess(payload) => {
                self.state = SaslState::Success;
                Ok((SaslState::Success, payload))
            }
            Nonza::SaslFailure { condition, text } => {
                self.state = SaslState::Failure;
                debug!(condition = %condition, text = ?text, "SASL failure");
                Err(SaslError::Failure { condition, text })
            }
            other => {
                self.state = SaslState::Failure;
                Err(SaslError::Protocol(format!("unexpected {:?}", other.kind())))
            }
        }
    }
}

/// Unexpected reply kinds are SASL protocol violations; anything else means
/// the stream itself is gone.
fn stream_error(e: StreamError) -> SaslError {
    match e {
        StreamError::Protocol(msg) => SaslError::Protocol(msg),
        other => SaslError::Stream(other),
    }
}
