//! Channel establishment for XMPP clients: a socket-level transport that
//! upgrades to TLS in-band, certificate trust evaluation with pinning and
//! deferred approval, and SASL authentication (SCRAM, PLAIN, ANONYMOUS).
//!
//! [`security_layer::SecurityLayer`] bundles the configuration;
//! [`connector::connect_jid`] resolves, connects, secures and authenticates.

pub mod connector;
pub mod dns;
pub mod error;
pub mod jid;
pub mod sasl;
pub mod security_layer;
pub mod stream;
pub mod transport;
pub mod verify;

#[cfg(test)]
mod test_support;

pub use connector::{connect_jid, connect_xmlstream, Connected};
pub use error::{ConnectError, SaslError, StreamError, TransportError, VerifyError};
pub use jid::Jid;
pub use security_layer::{MakeOptions, PinSource, SecurityLayer};
