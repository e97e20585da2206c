//! SCRAM-SHA-* (RFC 5802, RFC 7677) without channel binding.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::future::BoxFuture;
use hmac::digest::core_api::BlockSizeUser;
use hmac::digest::{Digest, KeyInit};
use hmac::{Mac, SimpleHmac};
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use super::mechanism::{abort_with, saslprep, CredentialProvider, Mechanism, MechanismToken};
use super::{SaslState, SaslStateMachine};
use crate::error::SaslError;

/// Random bytes in the client nonce (before base64).
pub const NONCE_LENGTH: usize = 15;

/// Highest iteration count accepted from a server. The key derivation runs
/// on the connection task, so this bounds how long a server can stall it.
pub const MAX_SCRAM_ITERATIONS: u32 = 1_000_000;

/// GS2 header for "no channel binding, no authzid".
const GS2_HEADER: &str = "n,,";

/// Hash functions in order of preference, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramHash {
    Sha512,
    Sha384,
    Sha256,
    Sha224,
    Sha1,
}

impl ScramHash {
    pub const PREFERENCE: [ScramHash; 5] = [
        ScramHash::Sha512,
        ScramHash::Sha384,
        ScramHash::Sha256,
        ScramHash::Sha224,
        ScramHash::Sha1,
    ];

    pub fn mechanism_name(self) -> &'static str {
        match self {
            Self::Sha512 => "SCRAM-SHA-512",
            Self::Sha384 => "SCRAM-SHA-384",
            Self::Sha256 => "SCRAM-SHA-256",
            Self::Sha224 => "SCRAM-SHA-224",
            Self::Sha1 => "SCRAM-SHA-1",
        }
    }

    fn hash(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha512 => sha2::Sha512::digest(data).to_vec(),
            Self::Sha384 => sha2::Sha384::digest(data).to_vec(),
            Self::Sha256 => sha2::Sha256::digest(data).to_vec(),
            Self::Sha224 => sha2::Sha224::digest(data).to_vec(),
            Self::Sha1 => sha1::Sha1::digest(data).to_vec(),
        }
    }

    fn hmac(self, key: &[u8], data: &[u8]) -> Result<Vec<u8>, SaslError> {
        match self {
            Self::Sha512 => hmac_with::<sha2::Sha512>(key, data),
            Self::Sha384 => hmac_with::<sha2::Sha384>(key, data),
            Self::Sha256 => hmac_with::<sha2::Sha256>(key, data),
            Self::Sha224 => hmac_with::<sha2::Sha224>(key, data),
            Self::Sha1 => hmac_with::<sha1::Sha1>(key, data),
        }
    }

    fn salted_password(
        self,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
    ) -> Result<Vec<u8>, SaslError> {
        match self {
            Self::Sha512 => pbkdf2_with::<sha2::Sha512>(password, salt, iterations),
            Self::Sha384 => pbkdf2_with::<sha2::Sha384>(password, salt, iterations),
            Self::Sha256 => pbkdf2_with::<sha2::Sha256>(password, salt, iterations),
            Self::Sha224 => pbkdf2_with::<sha2::Sha224>(password, salt, iterations),
            Self::Sha1 => pbkdf2_with::<sha1::Sha1>(password, salt, iterations),
        }
    }
}

fn hmac_with<D>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SaslError>
where
    D: Digest + BlockSizeUser + Clone,
{
    let mut mac = <SimpleHmac<D> as KeyInit>::new_from_slice(key)
        .map_err(|e| SaslError::Protocol(format!("HMAC key: {e}")))?;
    Mac::update(&mut mac, data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn pbkdf2_with<D>(password: &[u8], salt: &[u8], iterations: u32) -> Result<Vec<u8>, SaslError>
where
    D: Digest + BlockSizeUser + Clone + Sync,
{
    let mut out = vec![0u8; <D as Digest>::output_size()];
    pbkdf2::pbkdf2::<SimpleHmac<D>>(password, salt, iterations, &mut out)
        .map_err(|e| SaslError::Protocol(format!("PBKDF2: {e}")))?;
    Ok(out)
}

/// `=` and `,` are escaped in SCRAM attribute values.
fn escape_username(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

/// Parsed server-first-message.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ServerFirst {
    nonce: String,
    salt: Vec<u8>,
    iterations: u32,
}

fn attributes(message: &str) -> impl Iterator<Item = (&str, &str)> {
    message.split(',').filter_map(|part| part.split_once('='))
}

fn parse_server_first(message: &str) -> Result<ServerFirst, SaslError> {
    if message.starts_with("m=") {
        return Err(SaslError::Protocol(
            "server requires an unsupported SCRAM extension".to_string(),
        ));
    }
    let (mut nonce, mut salt, mut iterations) = (None, None, None);
    for (key, value) in attributes(message) {
        match key {
            "r" => nonce = Some(value.to_string()),
            "s" => {
                salt = Some(BASE64.decode(value).map_err(|e| {
                    SaslError::Protocol(format!("invalid SCRAM salt: {e}"))
                })?)
            }
            "i" => {
                iterations = Some(value.parse::<u32>().map_err(|e| {
                    SaslError::Protocol(format!("invalid SCRAM iteration count: {e}"))
                })?)
            }
            _ => {}
        }
    }
    match (nonce, salt, iterations) {
        (Some(_), Some(_), Some(iterations)) if iterations > MAX_SCRAM_ITERATIONS => {
            Err(SaslError::Protocol(format!(
                "SCRAM iteration count {iterations} exceeds {MAX_SCRAM_ITERATIONS}"
            )))
        }
        (Some(nonce), Some(salt), Some(iterations)) if iterations > 0 => Ok(ServerFirst {
            nonce,
            salt,
            iterations,
        }),
        _ => Err(SaslError::Protocol(format!(
            "incomplete server-first-message: {message}"
        ))),
    }
}

/// Client half of one SCRAM exchange, independent of I/O.
#[derive(Debug)]
pub struct ScramClient {
    hash: ScramHash,
    client_first_bare: String,
    nonce: String,
    expected_server_signature: Option<Vec<u8>>,
}

impl ScramClient {
    /// `username` must already be SASLprep'd.
    pub fn new(hash: ScramHash, username: &str, nonce: String) -> Self {
        let client_first_bare = format!("n={},r={}", escape_username(username), nonce);
        Self {
            hash,
            client_first_bare,
            nonce,
            expected_server_signature: None,
        }
    }

    pub fn client_first(&self) -> String {
        format!("{GS2_HEADER}{}", self.client_first_bare)
    }

    /// Validate the server-first-message and compute the client-final one.
    /// `password` must already be SASLprep'd.
    pub fn client_final(&mut self, server_first: &str, password: &str) -> Result<String, SaslError> {
        let server = parse_server_first(server_first)?;
        if !server.nonce.starts_with(&self.nonce) || server.nonce.len() <= self.nonce.len() {
            return Err(SaslError::Protocol(
                "server nonce does not extend the client nonce".to_string(),
            ));
        }

        let salted = self
            .hash
            .salted_password(password.as_bytes(), &server.salt, server.iterations)?;
        let client_key = self.hash.hmac(&salted, b"Client Key")?;
        let stored_key = self.hash.hash(&client_key);
        let without_proof = format!("c={},r={}", BASE64.encode(GS2_HEADER), server.nonce);
        let auth_message = format!("{},{},{}", self.client_first_bare, server_first, without_proof);
        let client_signature = self.hash.hmac(&stored_key, auth_message.as_bytes())?;
        let proof = xor(&client_key, &client_signature);

        let server_key = self.hash.hmac(&salted, b"Server Key")?;
        self.expected_server_signature = Some(self.hash.hmac(&server_key, auth_message.as_bytes())?);

        Ok(format!("{without_proof},p={}", BASE64.encode(proof)))
    }

    /// Check the server-final-message (`v=...` or `e=...`).
    pub fn verify_server_final(&self, server_final: &str) -> Result<(), SaslError> {
        let expected = self
            .expected_server_signature
            .as_deref()
            .ok_or_else(|| SaslError::Protocol("server-final before client-final".to_string()))?;
        let mut signature = None;
        for (key, value) in attributes(server_final) {
            match key {
                "e" => {
                    return Err(SaslError::Failure {
                        condition: "not-authorized".to_string(),
                        text: Some(format!("SCRAM server error: {value}")),
                    })
                }
                "v" => signature = Some(value),
                _ => {}
            }
        }
        let signature = signature.ok_or(SaslError::ServerAuthentication)?;
        let received = BASE64
            .decode(signature)
            .map_err(|_| SaslError::ServerAuthentication)?;
        if bool::from(received.ct_eq(expected)) {
            Ok(())
        } else {
            Err(SaslError::ServerAuthentication)
        }
    }
}

/// The SCRAM family as a [`Mechanism`].
pub struct Scram {
    credentials: CredentialProvider,
    nonce: Option<String>,
}

impl Scram {
    pub fn new(credentials: CredentialProvider) -> Self {
        Self {
            credentials,
            nonce: None,
        }
    }

    /// Use a fixed client nonce instead of a random one.
    pub fn with_nonce(credentials: CredentialProvider, nonce: &str) -> Self {
        Self {
            credentials,
            nonce: Some(nonce.to_string()),
        }
    }
}

impl Mechanism for Scram {
    fn family(&self) -> &'static str {
        "SCRAM"
    }

    /// `-PLUS` variants are never selected.
    fn any_supported(&self, advertised: &[String]) -> Option<MechanismToken> {
        ScramHash::PREFERENCE
            .iter()
            .find(|hash| advertised.iter().any(|m| m == hash.mechanism_name()))
            .map(|hash| MechanismToken::new(hash.mechanism_name(), *hash))
    }

    fn authenticate<'a, 's>(
        &'a self,
        sm: &'a mut SaslStateMachine<'s>,
        token: MechanismToken,
    ) -> BoxFuture<'a, Result<(), SaslError>> {
        Box::pin(async move {
            let hash = *token.get::<ScramHash>()?;
            let credentials = (self.credentials)().await?;
            let username = saslprep(&credentials.username, "username")?;
            let password = saslprep(&credentials.password, "password")?;

            let nonce = self.nonce.clone().unwrap_or_else(generate_nonce);
            let mut client = ScramClient::new(hash, &username, nonce);
            debug!(mechanism = hash.mechanism_name(), "Starting SCRAM exchange");

            let server_first = match sm
                .initiate(hash.mechanism_name(), Some(client.client_first().into_bytes()))
                .await?
            {
                (SaslState::Challenge, Some(payload)) => payload,
                (state, _) => {
                    return Err(abort_with(sm, format!("expected server-first, got {state:?}")).await)
                }
            };
            let server_first = match String::from_utf8(server_first) {
                Ok(text) => text,
                Err(_) => {
                    return Err(abort_with(sm, "server-first is not UTF-8".to_string()).await)
                }
            };

            let client_final = match client.client_final(&server_first, &password) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "Rejecting SCRAM server-first-message");
                    return Err(abort_with(sm, e.to_string()).await);
                }
            };

            let server_final = match sm.response(client_final.into_bytes()).await? {
                (SaslState::Success, Some(payload)) => payload,
                (SaslState::Success, None) => return Err(SaslError::ServerAuthentication),
                (SaslState::Challenge, Some(payload)) => {
                    // Some servers deliver the verifier as a challenge and
                    // expect an empty response before <success/>.
                    if let Err(e) = client.verify_server_final(&String::from_utf8_lossy(&payload)) {
                        if let Err(abort) = sm.abort().await {
                            debug!(error = %abort, "SASL abort failed");
                        }
                        return Err(e);
                    }
                    return match sm.response(Vec::new()).await? {
                        (SaslState::Success, _) => Ok(()),
                        (state, _) => Err(abort_with(sm, format!("expected success, got {state:?}")).await),
                    };
                }
                (state, _) => {
                    return Err(abort_with(sm, format!("expected server-final, got {state:?}")).await)
                }
            };
            client.verify_server_final(&String::from_utf8_lossy(&server_final))
        })
    }
}
