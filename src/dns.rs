//! Endpoint discovery: server override parsing and SRV lookup (RFC 6120 §3.2).
//!
//! Candidates are returned in connection-attempt order. Direct TLS records
//! (`_xmpps-client._tcp`) come first, then STARTTLS records
//! (`_xmpp-client._tcp`). Within each service, records are ordered by
//! priority ascending, then weight descending (RFC 2782).

use std::time::Instant;

use tracing::{info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::error::ConnectError;

/// Standard client port, STARTTLS.
pub const DEFAULT_STARTTLS_PORT: u16 = 5222;
/// Conventional direct TLS port.
pub const DEFAULT_DIRECT_TLS_PORT: u16 = 5223;

/// How the channel gets encrypted once the socket is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointMode {
    /// Plain TCP, upgraded in-band with STARTTLS.
    StartTls,
    /// TLS handshake immediately after connect.
    DirectTls,
}

/// One connection candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub mode: EndpointMode,
    /// XMPP domain to present as SNI and match against the certificate when
    /// it differs from `host` (SRV targets, `?domain=` overrides).
    pub domain: Option<String>,
}

impl Endpoint {
    pub fn new(host: &str, port: u16, mode: EndpointMode) -> Self {
        Self {
            host: host.to_string(),
            port,
            mode,
            domain: None,
        }
    }

    /// Name used for SNI and certificate verification.
    pub fn tls_name(&self) -> &str {
        self.domain.as_deref().unwrap_or(&self.host)
    }
}

/// A `--server` value, before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerSpec {
    /// Connect here, skip SRV.
    Explicit(Endpoint),
    /// Resolve SRV records for this domain.
    Domain(String),
}

fn split_domain_param(input: &str) -> (&str, Option<String>) {
    match input.split_once('?') {
        Some((host_port, query)) => (
            host_port,
            query.strip_prefix("domain=").map(str::to_string),
        ),
        None => (input, None),
    }
}

fn split_port(host_port: &str) -> Option<(&str, u16)> {
    let (host, port) = host_port.rsplit_once(':')?;
    port.parse().ok().map(|port| (host, port))
}

/// Parse a server override.
///
/// - `tls://host[:port][?domain=d]`: direct TLS, port 5223 by default
/// - `tcp://host[:port][?domain=d]`: STARTTLS, port 5222 by default
/// - `host:port`: direct TLS on 5223, STARTTLS otherwise
/// - anything else is a domain to resolve
pub fn parse_server(input: &str) -> ServerSpec {
    let trimmed = input.trim();

    let schemes = [
        ("tls://", EndpointMode::DirectTls, DEFAULT_DIRECT_TLS_PORT),
        ("tcp://", EndpointMode::StartTls, DEFAULT_STARTTLS_PORT),
    ];
    for (scheme, mode, default_port) in schemes {
        if let Some(rest) = trimmed.strip_prefix(scheme) {
            let (host_port, domain) = split_domain_param(rest);
            let (host, port) = split_port(host_port).unwrap_or((host_port, default_port));
            return ServerSpec::Explicit(Endpoint {
                domain,
                ..Endpoint::new(host, port, mode)
            });
        }
    }

    if let Some((host, port)) = split_port(trimmed) {
        let mode = if port == DEFAULT_DIRECT_TLS_PORT {
            EndpointMode::DirectTls
        } else {
            EndpointMode::StartTls
        };
        return ServerSpec::Explicit(Endpoint::new(host, port, mode));
    }

    ServerSpec::Domain(trimmed.to_string())
}

/// Candidates for `domain`, honouring an optional override.
pub async fn resolve_endpoints(
    domain: &str,
    server: Option<&str>,
) -> Result<Vec<Endpoint>, ConnectError> {
    match server.map(parse_server) {
        Some(ServerSpec::Explicit(mut endpoint)) => {
            if endpoint.domain.is_none() && endpoint.host != domain {
                endpoint.domain = Some(domain.to_string());
            }
            info!(host = %endpoint.host, port = endpoint.port, mode = ?endpoint.mode, "Using explicit server");
            Ok(vec![endpoint])
        }
        Some(ServerSpec::Domain(other)) => resolve_srv(&other).await,
        None => resolve_srv(domain).await,
    }
}

/// SRV data needed for ordering: (target, port, priority, weight).
type SrvRecord = (String, u16, u16, u16);

fn order_records(mut records: Vec<SrvRecord>, mode: EndpointMode, domain: &str) -> Vec<Endpoint> {
    records.sort_by(|a, b| a.2.cmp(&b.2).then(b.3.cmp(&a.3)));
    records
        .into_iter()
        .filter_map(|(target, port, _, _)| {
            let host = target.trim_end_matches('.');
            // A "." target means the service is decidedly not available.
            if host.is_empty() {
                return None;
            }
            Some(Endpoint {
                domain: Some(domain.to_string()),
                ..Endpoint::new(host, port, mode)
            })
        })
        .collect()
}

async fn lookup(
    resolver: &TokioAsyncResolver,
    service: &str,
    mode: EndpointMode,
    domain: &str,
) -> Vec<Endpoint> {
    let name = format!("{service}.{domain}");
    let started = Instant::now();
    match resolver.srv_lookup(name.as_str()).await {
        Ok(found) => {
            let records = found
                .iter()
                .map(|r| (r.target().to_string(), r.port(), r.priority(), r.weight()))
                .collect();
            let endpoints = order_records(records, mode, domain);
            info!(
                srv = %name,
                count = endpoints.len(),
                lookup_ms = started.elapsed().as_millis() as u64,
                "SRV lookup done"
            );
            endpoints
        }
        Err(e) => {
            info!(
                srv = %name,
                lookup_ms = started.elapsed().as_millis() as u64,
                error = %e,
                "SRV lookup failed"
            );
            Vec::new()
        }
    }
}

/// Resolve `domain` through SRV, falling back to `domain:5222` when no
/// usable record exists.
pub async fn resolve_srv(domain: &str) -> Result<Vec<Endpoint>, ConnectError> {
    if domain.is_empty() {
        return Err(ConnectError::Dns("empty domain".to_string()));
    }
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(resolver) => resolver,
        Err(e) => {
            warn!(error = %e, "Failed to load system DNS config, using default resolver");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    };

    let mut endpoints = lookup(&resolver, "_xmpps-client._tcp", EndpointMode::DirectTls, domain).await;
    endpoints.extend(lookup(&resolver, "_xmpp-client._tcp", EndpointMode::StartTls, domain).await);

    if endpoints.is_empty() {
        warn!(domain, "No SRV records, falling back to {domain}:{DEFAULT_STARTTLS_PORT}");
        endpoints.push(Endpoint::new(domain, DEFAULT_STARTTLS_PORT, EndpointMode::StartTls));
    }
    Ok(endpoints)
}
