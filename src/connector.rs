//! Connection candidates in order, then authentication.

use tracing::{info, warn};

use crate::dns::{resolve_endpoints, Endpoint, EndpointMode};
use crate::error::ConnectError;
use crate::jid::Jid;
use crate::security_layer::{connect, connect_direct_tls, negotiate_sasl, SecurityLayer};
use crate::stream::{StreamFeatures, XmppStream};

/// An authenticated stream.
#[derive(Debug)]
pub struct Connected {
    pub stream: XmppStream,
    /// Features advertised after authentication.
    pub features: StreamFeatures,
    pub endpoint: Endpoint,
}

/// Try `endpoints` in order until one yields a secured stream, then
/// authenticate as `jid` on it.
///
/// Connection failures move on to the next endpoint; if all fail, their
/// errors are aggregated. Authentication failures are returned at once.
pub async fn connect_xmlstream(
    jid: &Jid,
    layer: &SecurityLayer,
    endpoints: Vec<Endpoint>,
) -> Result<Connected, ConnectError> {
    let mut errors = Vec::new();
    for endpoint in endpoints {
        let domain = endpoint.tls_name().to_string();
        info!(host = %endpoint.host, port = endpoint.port, mode = ?endpoint.mode, domain = %domain, "Trying endpoint");
        let attempt = match endpoint.mode {
            EndpointMode::StartTls => connect(layer, &domain, &endpoint.host, endpoint.port).await,
            EndpointMode::DirectTls => {
                connect_direct_tls(layer, &domain, &endpoint.host, endpoint.port).await
            }
        };
        let (mut stream, features) = match attempt {
            Ok(connected) => connected,
            Err(e) => {
                warn!(host = %endpoint.host, port = endpoint.port, error = %e, "Endpoint failed");
                errors.push(e);
                continue;
            }
        };

        let features = negotiate_sasl(
            &mut stream,
            layer.sasl_providers(),
            jid,
            &features,
            layer.negotiation_timeout(),
        )
        .await?;
        info!(jid = %jid, host = %endpoint.host, tls = stream.transport().tls_active(), "Stream ready");
        return Ok(Connected {
            stream,
            features,
            endpoint,
        });
    }
    Err(ConnectError::aggregate(errors)
        .unwrap_or_else(|| ConnectError::Dns(format!("no endpoints for {}", jid.domain()))))
}

/// Resolve endpoints for `jid` (or use `server`) and connect.
pub async fn connect_jid(
    jid: &Jid,
    layer: &SecurityLayer,
    server: Option<&str>,
) -> Result<Connected, ConnectError> {
    let endpoints = resolve_endpoints(jid.domain(), server).await?;
    connect_xmlstream(jid, layer, endpoints).await
}
