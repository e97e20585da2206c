//! Minimal XMPP address (`localpart@domain/resource`).
//!
//! Only what channel establishment needs: the domain to connect to and the
//! localpart used as the SASL username. Full RFC 7622 preparation is left to
//! the stanza layer.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    localpart: Option<String>,
    domain: String,
    resource: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JidParseError {
    #[error("empty domain")]
    EmptyDomain,
    #[error("empty localpart")]
    EmptyLocalpart,
    #[error("empty resource")]
    EmptyResource,
}

impl Jid {
    pub fn localpart(&self) -> Option<&str> {
        self.localpart.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// The JID without its resource.
    pub fn bare(&self) -> Jid {
        Jid {
            localpart: self.localpart.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }
}

impl FromStr for Jid {
    type Err = JidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // The resource may itself contain '@' or '/', so split it off first.
        let (bare, resource) = match s.split_once('/') {
            Some((_, "")) => return Err(JidParseError::EmptyResource),
            Some((bare, resource)) => (bare, Some(resource.to_string())),
            None => (s, None),
        };
        let (localpart, domain) = match bare.split_once('@') {
            Some(("", _)) => return Err(JidParseError::EmptyLocalpart),
            Some((local, domain)) => (Some(local.to_string()), domain),
            None => (None, bare),
        };
        let domain = domain.trim_end_matches('.');
        if domain.is_empty() {
            return Err(JidParseError::EmptyDomain);
        }
        Ok(Jid {
            localpart,
            domain: domain.to_lowercase(),
            resource,
        })
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(local) = &self.localpart {
            write!(f, "{}@", local)?;
        }
        f.write_str(&self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}
