//! Hostname → certificate fingerprint pins.
//!
//! Persisted as a JSON object mapping each hostname to a sorted array of
//! base64 fingerprints:
//!
//! ```json
//! { "xmpp.example.org": ["MIIBIjANBgkq...", "MIIBCgKCAQEA..."] }
//! ```
//!
//! The store does no locking of its own. Share it as `Arc<RwLock<PinStore>>`
//! and serialize `pin` calls on the caller side.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rustls::pki_types::CertificateDer;
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::x509;
use crate::error::{PinStoreError, VerifyError};

/// What a pin fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinType {
    /// The SubjectPublicKeyInfo: survives certificate renewal with the same key.
    PublicKey,
    /// The whole DER certificate.
    Certificate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinStore {
    pin_type: PinType,
    pins: HashMap<String, BTreeSet<String>>,
}

impl PinStore {
    pub fn new(pin_type: PinType) -> Self {
        Self {
            pin_type,
            pins: HashMap::new(),
        }
    }

    pub fn public_key() -> Self {
        Self::new(PinType::PublicKey)
    }

    pub fn certificate() -> Self {
        Self::new(PinType::Certificate)
    }

    pub fn pin_type(&self) -> PinType {
        self.pin_type
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    pub fn fingerprint(&self, cert: &CertificateDer<'_>) -> Result<String, VerifyError> {
        let blob = match self.pin_type {
            PinType::PublicKey => x509::subject_public_key_info(cert)?,
            PinType::Certificate => cert.as_ref().to_vec(),
        };
        Ok(BASE64.encode(blob))
    }

    /// Trust `cert` for `hostname` from now on.
    pub fn pin(&mut self, hostname: &str, cert: &CertificateDer<'_>) -> Result<(), VerifyError> {
        let fingerprint = self.fingerprint(cert)?;
        let inserted = self
            .pins
            .entry(normalize(hostname))
            .or_default()
            .insert(fingerprint);
        if inserted {
            info!(hostname, pin_type = ?self.pin_type, "Pinned certificate");
        }
        Ok(())
    }

    /// `Some(true)` if `cert` is pinned for `hostname`, `None` otherwise.
    /// A pin store never rejects on its own.
    pub fn query(&self, hostname: &str, cert: &CertificateDer<'_>) -> Option<bool> {
        let pinned = self.pins.get(&normalize(hostname))?;
        let fingerprint = self.fingerprint(cert).ok()?;
        pinned.contains(&fingerprint).then_some(true)
    }

    /// Fingerprints pinned for `hostname`, sorted.
    pub fn get_pinned_for_host(&self, hostname: &str) -> Vec<String> {
        self.pins
            .get(&normalize(hostname))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Deterministic JSON form: keys and fingerprints sorted.
    pub fn export_to_json(&self) -> Value {
        let mut hosts: Vec<_> = self.pins.iter().filter(|(_, set)| !set.is_empty()).collect();
        hosts.sort_by(|a, b| a.0.cmp(b.0));
        let mut object = Map::new();
        for (host, set) in hosts {
            object.insert(
                host.clone(),
                Value::Array(set.iter().cloned().map(Value::String).collect()),
            );
        }
        Value::Object(object)
    }

    /// Load pins from the JSON form. With `override_existing` the store's
    /// contents are replaced; otherwise the pins are merged in.
    ///
    /// Hostnames are normalised the way [`PinStore::pin`] normalises them
    /// (lowercase, no trailing dot), so keys differing only in that respect
    /// are merged. Hosts with an empty array carry no pins and are skipped.
    /// Documents produced by [`PinStore::export_to_json`] import unchanged.
    pub fn import_from_json(
        &mut self,
        value: &Value,
        override_existing: bool,
    ) -> Result<(), PinStoreError> {
        let object = value
            .as_object()
            .ok_or_else(|| PinStoreError::InvalidFormat("expected a JSON object".to_string()))?;

        let mut imported: HashMap<String, BTreeSet<String>> = HashMap::new();
        for (host, fingerprints) in object {
            let list = fingerprints.as_array().ok_or_else(|| {
                PinStoreError::InvalidFormat(format!("pins for {host} are not an array"))
            })?;
            if list.is_empty() {
                continue;
            }
            let set = imported.entry(normalize(host)).or_default();
            for fingerprint in list {
                let fingerprint = fingerprint.as_str().ok_or_else(|| {
                    PinStoreError::InvalidFormat(format!("pin for {host} is not a string"))
                })?;
                BASE64.decode(fingerprint).map_err(|e| {
                    PinStoreError::InvalidFormat(format!("pin for {host} is not base64: {e}"))
                })?;
                set.insert(fingerprint.to_string());
            }
        }

        if override_existing {
            self.pins = imported;
        } else {
            for (host, set) in imported {
                self.pins.entry(host).or_default().extend(set);
            }
        }
        debug!(hosts = self.pins.len(), override_existing, "Imported pins");
        Ok(())
    }

    /// Read a store from `path`. A missing file yields an empty store.
    pub fn load(path: &Path, pin_type: PinType) -> Result<Self, PinStoreError> {
        let mut store = Self::new(pin_type);
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let value: Value = serde_json::from_str(&text)?;
                store.import_from_json(&value, true)?;
                debug!(path = %path.display(), hosts = store.pins.len(), "Loaded pin store");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No pin store yet, starting empty");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(store)
    }

    /// Write the store to `path`, replacing it atomically.
    pub fn save(&self, path: &Path) -> Result<(), PinStoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let text = serde_json::to_string_pretty(&self.export_to_json())?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "Saved pin store");
        Ok(())
    }
}

fn normalize(hostname: &str) -> String {
    hostname.trim_end_matches('.').to_ascii_lowercase()
}
