//! Negotiation elements ("nonzas"): the top-level elements exchanged while a
//! stream is being secured and authenticated, as opposed to stanzas.
//!
//! Only the handful the channel-establishment core needs are typed; anything
//! else is carried through as [`Nonza::Other`] with its raw XML.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::framing::NS_STREAMS;
use crate::error::StreamError;

pub const NS_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const NS_STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// The `<starttls/>` stream feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartTlsFeature {
    pub required: bool,
}

/// What the peer advertised in `<stream:features/>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFeatures {
    pub starttls: Option<StartTlsFeature>,
    /// SASL mechanism names in the peer's order.
    pub mechanisms: Vec<String>,
    /// The element as received, for the stanza layer.
    pub raw: String,
}

impl StreamFeatures {
    pub fn has_mechanism(&self, name: &str) -> bool {
        self.mechanisms.iter().any(|m| m == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Nonza {
    Features(StreamFeatures),
    StartTls,
    TlsProceed,
    TlsFailure,
    SaslAuth {
        mechanism: String,
        payload: Option<Vec<u8>>,
    },
    SaslChallenge(Vec<u8>),
    SaslResponse(Vec<u8>),
    SaslSuccess(Option<Vec<u8>>),
    SaslFailure {
        condition: String,
        text: Option<String>,
    },
    SaslAbort,
    StreamError {
        condition: String,
        text: Option<String>,
    },
    Other(String),
}

/// Discriminant of [`Nonza`], used to say which replies are acceptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NonzaKind {
    Features,
    StartTls,
    TlsProceed,
    TlsFailure,
    SaslAuth,
    SaslChallenge,
    SaslResponse,
    SaslSuccess,
    SaslFailure,
    SaslAbort,
    StreamError,
    Other,
}

impl Nonza {
    pub fn kind(&self) -> NonzaKind {
        match self {
            Self::Features(_) => NonzaKind::Features,
            Self::StartTls => NonzaKind::StartTls,
            Self::TlsProceed => NonzaKind::TlsProceed,
            Self::TlsFailure => NonzaKind::TlsFailure,
            Self::SaslAuth { .. } => NonzaKind::SaslAuth,
            Self::SaslChallenge(_) => NonzaKind::SaslChallenge,
            Self::SaslResponse(_) => NonzaKind::SaslResponse,
            Self::SaslSuccess(_) => NonzaKind::SaslSuccess,
            Self::SaslFailure { .. } => NonzaKind::SaslFailure,
            Self::SaslAbort => NonzaKind::SaslAbort,
            Self::StreamError { .. } => NonzaKind::StreamError,
            Self::Other(_) => NonzaKind::Other,
        }
    }

    /// Wire form.
    pub fn to_xml(&self) -> String {
        match self {
            Self::Features(features) => {
                if !features.raw.is_empty() {
                    return features.raw.clone();
                }
                let mut xml = String::from("<stream:features>");
                if let Some(starttls) = &features.starttls {
                    if starttls.required {
                        xml.push_str(&format!("<starttls xmlns='{NS_TLS}'><required/></starttls>"));
                    } else {
                        xml.push_str(&format!("<starttls xmlns='{NS_TLS}'/>"));
                    }
                }
                if !features.mechanisms.is_empty() {
                    xml.push_str(&format!("<mechanisms xmlns='{NS_SASL}'>"));
                    for mechanism in &features.mechanisms {
                        xml.push_str(&format!("<mechanism>{}</mechanism>", escape(mechanism.as_str())));
                    }
                    xml.push_str("</mechanisms>");
                }
                xml.push_str("</stream:features>");
                xml
            }
            Self::StartTls => format!("<starttls xmlns='{NS_TLS}'/>"),
            Self::TlsProceed => format!("<proceed xmlns='{NS_TLS}'/>"),
            Self::TlsFailure => format!("<failure xmlns='{NS_TLS}'/>"),
            Self::SaslAuth { mechanism, payload } => {
                let mechanism = escape(mechanism.as_str());
                match payload {
                    None => format!("<auth xmlns='{NS_SASL}' mechanism='{mechanism}'/>"),
                    Some(data) => format!(
                        "<auth xmlns='{NS_SASL}' mechanism='{mechanism}'>{}</auth>",
                        encode_mandatory(data)
                    ),
                }
            }
            Self::SaslChallenge(data) => format!(
                "<challenge xmlns='{NS_SASL}'>{}</challenge>",
                encode_mandatory(data)
            ),
            Self::SaslResponse(data) => {
                if data.is_empty() {
                    format!("<response xmlns='{NS_SASL}'/>")
                } else {
                    format!("<response xmlns='{NS_SASL}'>{}</response>", BASE64.encode(data))
                }
            }
            Self::SaslSuccess(None) => format!("<success xmlns='{NS_SASL}'/>"),
            Self::SaslSuccess(Some(data)) => format!(
                "<success xmlns='{NS_SASL}'>{}</success>",
                encode_mandatory(data)
            ),
            Self::SaslFailure { condition, text } => format!(
                "<failure xmlns='{NS_SASL}'><{condition}/>{}</failure>",
                text.as_deref()
                    .map(|t| format!("<text>{}</text>", escape(t)))
                    .unwrap_or_default()
            ),
            Self::SaslAbort => format!("<abort xmlns='{NS_SASL}'/>"),
            Self::StreamError { condition, text } => format!(
                "<stream:error><{condition} xmlns='{NS_STREAM_ERRORS}'/>{}</stream:error>",
                text.as_deref()
                    .map(|t| format!("<text xmlns='{NS_STREAM_ERRORS}'>{}</text>", escape(t)))
                    .unwrap_or_default()
            ),
            Self::Other(raw) => raw.clone(),
        }
    }

    /// Recognise a complete top-level element.
    pub fn parse(xml: &str) -> Result<Nonza, StreamError> {
        let root = Element::parse(xml)?;
        let nonza = match (root.ns.as_deref(), root.name.as_str()) {
            (Some(NS_STREAMS), "features") => Nonza::Features(parse_features(&root, xml)),
            (Some(NS_STREAMS), "error") => {
                let (condition, text) = condition_and_text(&root, NS_STREAM_ERRORS);
                Nonza::StreamError { condition, text }
            }
            (Some(NS_TLS), "starttls") => Nonza::StartTls,
            (Some(NS_TLS), "proceed") => Nonza::TlsProceed,
            (Some(NS_TLS), "failure") => Nonza::TlsFailure,
            (Some(NS_SASL), "auth") => Nonza::SaslAuth {
                mechanism: root.attr("mechanism").unwrap_or_default().to_string(),
                payload: decode_optional(&root.text)?,
            },
            (Some(NS_SASL), "challenge") => Nonza::SaslChallenge(decode(&root.text)?),
            (Some(NS_SASL), "response") => Nonza::SaslResponse(decode(&root.text)?),
            (Some(NS_SASL), "success") => Nonza::SaslSuccess(decode_optional(&root.text)?),
            (Some(NS_SASL), "failure") => {
                let (condition, text) = condition_and_text(&root, NS_SASL);
                Nonza::SaslFailure { condition, text }
            }
            (Some(NS_SASL), "abort") => Nonza::SaslAbort,
            _ => Nonza::Other(xml.to_string()),
        };
        Ok(nonza)
    }
}

/// Base64 where an empty payload must still be visible on the wire.
fn encode_mandatory(data: &[u8]) -> String {
    if data.is_empty() {
        "=".to_string()
    } else {
        BASE64.encode(data)
    }
}

fn decode(text: &str) -> Result<Vec<u8>, StreamError> {
    let text = text.trim();
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    BASE64
        .decode(text)
        .map_err(|e| StreamError::Xml(format!("invalid base64 payload: {e}")))
}

fn decode_optional(text: &str) -> Result<Option<Vec<u8>>, StreamError> {
    if text.trim().is_empty() {
        Ok(None)
    } else {
        decode(text).map(Some)
    }
}

fn parse_features(root: &Element, raw: &str) -> StreamFeatures {
    let starttls = root.child(NS_TLS, "starttls").map(|el| StartTlsFeature {
        required: el.children.iter().any(|c| c.name == "required"),
    });
    let mechanisms = root
        .child(NS_SASL, "mechanisms")
        .map(|el| {
            el.children
                .iter()
                .filter(|c| c.name == "mechanism")
                .map(|c| c.text.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect()
        })
        .unwrap_or_default();
    StreamFeatures {
        starttls,
        mechanisms,
        raw: raw.to_string(),
    }
}

fn condition_and_text(root: &Element, ns: &str) -> (String, Option<String>) {
    let condition = root
        .children
        .iter()
        .find(|c| c.name != "text" && c.ns.as_deref() == Some(ns))
        .map(|c| c.name.clone())
        .unwrap_or_else(|| "undefined-condition".to_string());
    let text = root
        .children
        .iter()
        .find(|c| c.name == "text")
        .map(|c| c.text.clone());
    (condition, text)
}

/// Just enough of an element tree to classify negotiation elements.
#[derive(Debug, Default)]
struct Element {
    name: String,
    ns: Option<String>,
    attrs: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    fn parse(xml: &str) -> Result<Element, StreamError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let parent_ns = stack.last().and_then(|p| p.ns.clone());
                    stack.push(Element::open(&e, parent_ns)?);
                }
                Ok(Event::Empty(e)) => {
                    let parent_ns = stack.last().and_then(|p| p.ns.clone());
                    let el = Element::open(&e, parent_ns)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(el),
                        None => return Ok(el),
                    }
                }
                Ok(Event::Text(t)) => {
                    let text = t.unescape().map_err(|e| StreamError::Xml(e.to_string()))?;
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&text);
                    }
                }
                Ok(Event::CData(t)) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&String::from_utf8_lossy(&t));
                    }
                }
                Ok(Event::End(_)) => {
                    let Some(el) = stack.pop() else {
                        return Err(StreamError::Xml("unbalanced end tag".to_string()));
                    };
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(el),
                        None => return Ok(el),
                    }
                }
                Ok(Event::Eof) => {
                    return Err(StreamError::Xml("incomplete element".to_string()));
                }
                Ok(_) => {}
                Err(e) => return Err(StreamError::Xml(e.to_string())),
            }
        }
    }

    fn open(start: &BytesStart<'_>, parent_ns: Option<String>) -> Result<Element, StreamError> {
        let qname = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let (prefix, name) = match qname.split_once(':') {
            Some((prefix, local)) => (Some(prefix.to_string()), local.to_string()),
            None => (None, qname),
        };

        let mut attrs = Vec::new();
        let mut default_ns = None;
        let mut prefixed_ns = None;
        for attr in start.attributes() {
            let attr = attr.map_err(|e| StreamError::Xml(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| StreamError::Xml(e.to_string()))?
                .into_owned();
            if key == "xmlns" {
                default_ns = Some(value);
            } else if let Some(p) = key.strip_prefix("xmlns:") {
                if prefix.as_deref() == Some(p) {
                    prefixed_ns = Some(value);
                }
            } else {
                attrs.push((key, value));
            }
        }

        // The only prefix used on a client stream is `stream:`, declared on
        // the stream header and therefore absent from extracted elements.
        let ns = match prefix.as_deref() {
            Some("stream") => prefixed_ns.or_else(|| Some(NS_STREAMS.to_string())),
            Some(_) => prefixed_ns,
            None => default_ns.or(parent_ns),
        };
        Ok(Element {
            name,
            ns,
            attrs,
            children: Vec::new(),
            text: String::new(),
        })
    }

    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn child(&self, ns: &str, name: &str) -> Option<&Element> {
        self.children
            .iter()
            .find(|c| c.name == name && c.ns.as_deref() == Some(ns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_features_with_starttls_and_mechanisms() {
        let xml = "<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>SCRAM-SHA-1</mechanism><mechanism>PLAIN</mechanism></mechanisms></stream:features>";
        let Nonza::Features(features) = Nonza::parse(xml).unwrap() else {
            panic!("expected features");
        };
        assert_eq!(features.starttls, Some(StartTlsFeature { required: true }));
        assert_eq!(features.mechanisms, vec!["SCRAM-SHA-1", "PLAIN"]);
        assert!(features.has_mechanism("PLAIN"));
        assert_eq!(features.raw, xml);
    }

    #[test]
    fn test_parse_features_without_starttls() {
        let xml = "<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>ANONYMOUS</mechanism></mechanisms></stream:features>";
        let Nonza::Features(features) = Nonza::parse(xml).unwrap() else {
            panic!("expected features");
        };
        assert!(features.starttls.is_none());
        assert_eq!(features.mechanisms, vec!["ANONYMOUS"]);
    }

    #[test]
    fn test_parse_tls_replies() {
        assert_eq!(
            Nonza::parse("<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>").unwrap(),
            Nonza::TlsProceed
        );
        assert_eq!(
            Nonza::parse("<failure xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>").unwrap(),
            Nonza::TlsFailure
        );
    }

    #[test]
    fn test_failure_namespace_decides_kind() {
        let sasl = Nonza::parse(
            "<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/><text xml:lang='en'>Bad password</text></failure>",
        )
        .unwrap();
        assert_eq!(
            sasl,
            Nonza::SaslFailure {
                condition: "not-authorized".to_string(),
                text: Some("Bad password".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_sasl_payloads() {
        assert_eq!(
            Nonza::parse("<challenge xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>aGVsbG8=</challenge>").unwrap(),
            Nonza::SaslChallenge(b"hello".to_vec())
        );
        assert_eq!(
            Nonza::parse("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>").unwrap(),
            Nonza::SaslSuccess(None)
        );
        assert_eq!(
            Nonza::parse("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>=</success>").unwrap(),
            Nonza::SaslSuccess(Some(Vec::new()))
        );
        assert!(matches!(
            Nonza::parse("<challenge xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>!!!</challenge>"),
            Err(StreamError::Xml(_))
        ));
    }

    #[test]
    fn test_empty_payload_serialization() {
        let auth = Nonza::SaslAuth {
            mechanism: "ANONYMOUS".to_string(),
            payload: Some(Vec::new()),
        };
        assert!(auth.to_xml().ends_with(">=</auth>"));

        let no_payload = Nonza::SaslAuth {
            mechanism: "SCRAM-SHA-1".to_string(),
            payload: None,
        };
        assert!(no_payload.to_xml().ends_with("mechanism='SCRAM-SHA-1'/>"));

        assert_eq!(
            Nonza::SaslResponse(Vec::new()).to_xml(),
            "<response xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>"
        );
    }

    #[test]
    fn test_stream_error_round_trip() {
        let err = Nonza::StreamError {
            condition: "policy-violation".to_string(),
            text: Some("TLS required".to_string()),
        };
        let xml = err.to_xml();
        assert!(xml.starts_with("<stream:error><policy-violation"));
        assert_eq!(Nonza::parse(&xml).unwrap(), err);
    }

    #[test]
    fn test_auth_round_trip_and_kind() {
        let auth = Nonza::SaslAuth {
            mechanism: "PLAIN".to_string(),
            payload: Some(b"\0user\0pencil".to_vec()),
        };
        let parsed = Nonza::parse(&auth.to_xml()).unwrap();
        assert_eq!(parsed, auth);
        assert_eq!(parsed.kind(), NonzaKind::SaslAuth);
    }

    #[test]
    fn test_unknown_elements_are_other() {
        let xml = "<iq type='result' id='1'/>";
        assert_eq!(Nonza::parse(xml).unwrap(), Nonza::Other(xml.to_string()));
    }
}
