//! Certificate inspection helpers on top of `x509-parser`.

use std::net::IpAddr;

use rustls::pki_types::{CertificateDer, UnixTime};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;

use crate::error::VerifyError;

fn parse<'a>(cert: &'a CertificateDer<'_>) -> Result<X509Certificate<'a>, VerifyError> {
    x509_parser::parse_x509_certificate(cert.as_ref())
        .map(|(_, parsed)| parsed)
        .map_err(|e| VerifyError::Rejected {
            reason: format!("unparsable certificate: {e}"),
        })
}

/// DER-encoded SubjectPublicKeyInfo of `cert`.
pub fn subject_public_key_info(cert: &CertificateDer<'_>) -> Result<Vec<u8>, VerifyError> {
    Ok(parse(cert)?.public_key().raw.to_vec())
}

/// Subject and issuer are the same name.
pub fn is_self_signed(cert: &CertificateDer<'_>) -> bool {
    parse(cert)
        .map(|c| c.subject().as_raw() == c.issuer().as_raw())
        .unwrap_or(false)
}

/// `now` falls outside the certificate's validity window: `Some(true)` if it
/// expired, `Some(false)` if it is not valid yet.
pub fn validity_violation(cert: &CertificateDer<'_>, now: UnixTime) -> Option<bool> {
    let parsed = parse(cert).ok()?;
    let now = now.as_secs() as i64;
    let validity = parsed.validity();
    if now > validity.not_after.timestamp() {
        Some(true)
    } else if now < validity.not_before.timestamp() {
        Some(false)
    } else {
        None
    }
}

/// Whether `hostname` is covered by the certificate's DNS/IP subject
/// alternative names, or, when it has no DNS names at all, by its common name.
pub fn matches_hostname(cert: &CertificateDer<'_>, hostname: &str) -> bool {
    let Ok(parsed) = parse(cert) else {
        return false;
    };
    let hostname = hostname.trim_end_matches('.').to_ascii_lowercase();
    let ip: Option<IpAddr> = hostname.parse().ok();

    let mut saw_dns_name = false;
    if let Ok(Some(san)) = parsed.subject_alternative_name() {
        for name in &san.value.general_names {
            match (name, ip) {
                (GeneralName::DNSName(dns), None) => {
                    saw_dns_name = true;
                    if dns_name_matches(dns, &hostname) {
                        return true;
                    }
                }
                (GeneralName::DNSName(_), Some(_)) => saw_dns_name = true,
                (GeneralName::IPAddress(bytes), Some(ip)) => {
                    let matches = match ip {
                        IpAddr::V4(v4) => *bytes == v4.octets().as_slice(),
                        IpAddr::V6(v6) => *bytes == v6.octets().as_slice(),
                    };
                    if matches {
                        return true;
                    }
                }
                _ => {}
            }
        }
    }
    if saw_dns_name || ip.is_some() {
        return false;
    }

    let cn_match = parsed
        .subject()
        .iter_common_name()
        .filter_map(|cn| cn.as_str().ok())
        .any(|cn| dns_name_matches(cn, &hostname));
    cn_match
}

/// Case-insensitive comparison with a single left-most `*` label allowed.
fn dns_name_matches(pattern: &str, hostname: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    match pattern.strip_prefix("*.") {
        Some(suffix) => match hostname.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest == suffix && suffix.contains('.'),
            None => false,
        },
        None => pattern == hostname,
    }
}
