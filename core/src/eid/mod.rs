//! Endpoint identifiers
//!
//! An EID names either a node/application (`dtn`, `ipn`, `api`) or a
//! transport-level peer locator (`cla`). The set of schemes is closed:
//! [`Eid::create`] rejects anything else. Identifiers of other schemes that
//! arrive already decoded are wrapped with [`Eid::unknown`].

pub mod local;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use local::LocalAddresses;

/// IANA code of the `dtn` scheme
pub const EID_DTN_IANA_VALUE: u64 = 1;
/// IANA code of the `ipn` scheme
pub const EID_IPN_IANA_VALUE: u64 = 2;
/// Code used for the node-local application namespace
pub const EID_API_IANA_VALUE: u64 = 251;
/// Code used for convergence-layer EIDs
pub const EID_CLA_IANA_VALUE: u64 = 252;
/// Code reported for schemes this node does not know
pub const EID_UNKNOWN_IANA_VALUE: u64 = 0;

/// Name of the simple TCP convergence layer
pub const STCP_CLA_NAME: &str = "stcp";

/// Errors raised while parsing an EID
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum EidError {
    #[error("Missing scheme in EID: {0}")]
    MissingScheme(String),

    #[error("Unrecognized EID scheme: {0}")]
    UnknownScheme(String),

    #[error("Malformed {scheme} EID: {reason}")]
    Malformed { scheme: String, reason: String },
}

impl EidError {
    fn malformed(scheme: &str, reason: impl Into<String>) -> Self {
        EidError::Malformed {
            scheme: scheme.to_string(),
            reason: reason.into(),
        }
    }
}

/// `dtn:` identifier, either `dtn:none` or `dtn://node/path`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DtnEid {
    /// `None` for the null endpoint `dtn:none`
    pub node: Option<String>,
    /// Demux part, always starting with `/` (may be just `/`)
    pub path: String,
}

/// `ipn:node.service`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpnEid {
    pub node: u64,
    pub service: u64,
}

/// `api:me/path`, the local application namespace of this node
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ApiEid {
    pub path: String,
}

/// `cla:<cla-name>:<locator>[/sink]`
///
/// Identifies a peer by the transport that reaches it. Two CLA EIDs name the
/// same peer when the transport and locator agree; the sink only selects an
/// application endpoint at that peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClaEid {
    pub cla_name: String,
    pub locator: String,
    pub sink: String,
}

impl ClaEid {
    /// Build an `stcp` EID from host and port
    pub fn stcp(host: &str, port: u16) -> Self {
        Self {
            cla_name: STCP_CLA_NAME.to_string(),
            locator: format!("{}:{}", host, port),
            sink: String::new(),
        }
    }

    /// Host and port of a `host:port` locator, if it has that shape
    pub fn host_port(&self) -> Option<(&str, u16)> {
        let (host, port) = self.locator.rsplit_once(':')?;
        let port = port.parse().ok()?;
        Some((host, port))
    }

    /// Same peer with a different sink
    pub fn with_sink(&self, sink: &str) -> Self {
        Self {
            sink: normalize_path(sink),
            ..self.clone()
        }
    }
}

/// Identifier whose scheme this node does not interpret
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnknownEid {
    pub scheme: String,
    pub ssp: String,
}

/// Endpoint identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Eid {
    Dtn(DtnEid),
    Ipn(IpnEid),
    Api(ApiEid),
    Cla(ClaEid),
    Unknown(UnknownEid),
}

impl Eid {
    /// Parse an EID from its string form
    pub fn create(raw: &str) -> Result<Self, EidError> {
        let raw = raw.trim();
        let (scheme, ssp) = raw
            .split_once(':')
            .ok_or_else(|| EidError::MissingScheme(raw.to_string()))?;
        if scheme.is_empty() || !scheme.chars().all(is_scheme_char) {
            return Err(EidError::MissingScheme(raw.to_string()));
        }

        match scheme {
            "dtn" => parse_dtn(ssp).map(Eid::Dtn),
            "ipn" => parse_ipn(ssp).map(Eid::Ipn),
            "api" => parse_api(ssp).map(Eid::Api),
            "cla" => parse_cla(ssp).map(Eid::Cla),
            _ => Err(EidError::UnknownScheme(scheme.to_string())),
        }
    }

    /// Identifier of a scheme this node does not interpret, kept literally
    pub fn unknown(scheme: &str, ssp: &str) -> Self {
        Eid::Unknown(UnknownEid {
            scheme: scheme.to_string(),
            ssp: ssp.to_string(),
        })
    }

    /// The null endpoint `dtn:none`
    pub fn dtn_none() -> Self {
        Eid::Dtn(DtnEid {
            node: None,
            path: String::new(),
        })
    }

    /// Scheme name as it appears before the first `:`
    pub fn scheme(&self) -> &str {
        match self {
            Eid::Dtn(_) => "dtn",
            Eid::Ipn(_) => "ipn",
            Eid::Api(_) => "api",
            Eid::Cla(_) => "cla",
            Eid::Unknown(u) => &u.scheme,
        }
    }

    /// Scheme-specific part
    pub fn ssp(&self) -> String {
        match self {
            Eid::Dtn(d) => match &d.node {
                None => "none".to_string(),
                Some(node) => format!("//{}{}", node, d.path),
            },
            Eid::Ipn(i) => format!("{}.{}", i.node, i.service),
            Eid::Api(a) => format!("me{}", a.path),
            Eid::Cla(c) => format!("{}:{}{}", c.cla_name, c.locator, c.sink),
            Eid::Unknown(u) => u.ssp.clone(),
        }
    }

    pub fn iana_code(&self) -> u64 {
        match self {
            Eid::Dtn(_) => EID_DTN_IANA_VALUE,
            Eid::Ipn(_) => EID_IPN_IANA_VALUE,
            Eid::Api(_) => EID_API_IANA_VALUE,
            Eid::Cla(_) => EID_CLA_IANA_VALUE,
            Eid::Unknown(_) => EID_UNKNOWN_IANA_VALUE,
        }
    }

    /// Equality within the scheme's own semantics.
    ///
    /// CLA EIDs compare transport and locator (host and port) and ignore the
    /// sink. Unknown EIDs compare scheme and scheme-specific part literally.
    /// Different variants never match.
    pub fn matches(&self, other: &Eid) -> bool {
        match (self, other) {
            (Eid::Dtn(a), Eid::Dtn(b)) => a == b,
            (Eid::Ipn(a), Eid::Ipn(b)) => a == b,
            (Eid::Api(a), Eid::Api(b)) => a.path == b.path,
            (Eid::Cla(a), Eid::Cla(b)) => a.cla_name == b.cla_name && a.locator == b.locator,
            (Eid::Unknown(a), Eid::Unknown(b)) => a.scheme == b.scheme && a.ssp == b.ssp,
            _ => false,
        }
    }

    /// Key identifying the peer behind this EID in channel registries
    pub fn channel_key(&self) -> String {
        match self {
            Eid::Cla(c) => format!("cla:{}:{}", c.cla_name, c.locator),
            other => other.to_string(),
        }
    }

    /// The peer itself: a `cla:` EID without its sink, anything else as is
    pub fn peer(&self) -> Eid {
        match self {
            Eid::Cla(c) if !c.sink.is_empty() => Eid::Cla(c.with_sink("")),
            other => other.clone(),
        }
    }

    /// Name of the convergence layer for `cla:` EIDs
    pub fn cla_name(&self) -> Option<&str> {
        match self {
            Eid::Cla(c) => Some(&c.cla_name),
            _ => None,
        }
    }

    /// Application demux part of the EID, if the scheme has one
    pub fn sink(&self) -> Option<String> {
        match self {
            Eid::Dtn(d) if d.node.is_some() => Some(d.path.clone()),
            Eid::Ipn(i) => Some(format!("/{}", i.service)),
            Eid::Api(a) => Some(a.path.clone()),
            Eid::Cla(c) if !c.sink.is_empty() => Some(c.sink.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme(), self.ssp())
    }
}

impl FromStr for Eid {
    type Err = EidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Eid::create(s)
    }
}

impl From<ClaEid> for Eid {
    fn from(cla: ClaEid) -> Self {
        Eid::Cla(cla)
    }
}

impl Serialize for Eid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Eid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Eid::create(&raw).map_err(serde::de::Error::custom)
    }
}

fn is_scheme_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')
}

/// Ensure a demux path starts with `/`; empty stays empty
pub fn normalize_path(path: &str) -> String {
    if path.is_empty() || path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

fn parse_dtn(ssp: &str) -> Result<DtnEid, EidError> {
    if ssp == "none" {
        return Ok(DtnEid {
            node: None,
            path: String::new(),
        });
    }
    let rest = ssp
        .strip_prefix("//")
        .ok_or_else(|| EidError::malformed("dtn", "expected //node or none"))?;
    let (node, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    if node.is_empty() {
        return Err(EidError::malformed("dtn", "empty node name"));
    }
    if node.chars().any(char::is_whitespace) {
        return Err(EidError::malformed("dtn", "whitespace in node name"));
    }
    Ok(DtnEid {
        node: Some(node.to_string()),
        path: path.to_string(),
    })
}

fn parse_ipn(ssp: &str) -> Result<IpnEid, EidError> {
    let (node, service) = ssp
        .split_once('.')
        .ok_or_else(|| EidError::malformed("ipn", "expected node.service"))?;
    let node = node
        .parse()
        .map_err(|_| EidError::malformed("ipn", format!("node is not a number: {}", node)))?;
    let service = service
        .parse()
        .map_err(|_| EidError::malformed("ipn", format!("service is not a number: {}", service)))?;
    Ok(IpnEid { node, service })
}

fn parse_api(ssp: &str) -> Result<ApiEid, EidError> {
    let path = ssp
        .strip_prefix("me")
        .ok_or_else(|| EidError::malformed("api", "expected api:me"))?;
    if !path.is_empty() && !path.starts_with('/') {
        return Err(EidError::malformed("api", "path must start with /"));
    }
    Ok(ApiEid {
        path: path.to_string(),
    })
}

fn parse_cla(ssp: &str) -> Result<ClaEid, EidError> {
    let (cla_name, rest) = ssp
        .split_once(':')
        .ok_or_else(|| EidError::malformed("cla", "expected cla:<name>:<locator>"))?;
    if cla_name.is_empty() || !cla_name.chars().all(is_scheme_char) {
        return Err(EidError::malformed("cla", "invalid convergence layer name"));
    }
    let (locator, sink) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    if locator.is_empty() {
        return Err(EidError::malformed("cla", "empty locator"));
    }

    let eid = ClaEid {
        cla_name: cla_name.to_string(),
        locator: locator.to_string(),
        sink: sink.to_string(),
    };

    if cla_name == STCP_CLA_NAME {
        match locator.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                port.parse::<u16>().map_err(|_| {
                    EidError::malformed("cla", format!("port is not numeric: {}", port))
                })?;
            }
            _ => return Err(EidError::malformed("cla", "stcp locator must be host:port")),
        }
    }

    Ok(eid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dtn() {
        let eid = Eid::create("dtn://node1/sink/").unwrap();
        match &eid {
            Eid::Dtn(d) => {
                assert_eq!(d.node.as_deref(), Some("node1"));
                assert_eq!(d.path, "/sink/");
            }
            _ => panic!("Wrong variant"),
        }
        assert_eq!(eid.iana_code(), EID_DTN_IANA_VALUE);
        assert_eq!(eid.to_string(), "dtn://node1/sink/");
    }

    #[test]
    fn test_parse_dtn_without_path_gets_root() {
        let eid = Eid::create("dtn://node1").unwrap();
        assert_eq!(eid.to_string(), "dtn://node1/");
    }

    #[test]
    fn test_parse_dtn_none() {
        let eid = Eid::create("dtn:none").unwrap();
        assert_eq!(eid, Eid::dtn_none());
        assert_eq!(eid.to_string(), "dtn:none");
        assert!(eid.sink().is_none());
    }

    #[test]
    fn test_parse_ipn() {
        let eid = Eid::create("ipn:12.3").unwrap();
        assert_eq!(eid, Eid::Ipn(IpnEid { node: 12, service: 3 }));
        assert_eq!(eid.iana_code(), EID_IPN_IANA_VALUE);
        assert!(Eid::create("ipn:12").is_err());
        assert!(Eid::create("ipn:a.3").is_err());
    }

    #[test]
    fn test_parse_api() {
        let eid = Eid::create("api:me/null/").unwrap();
        assert_eq!(eid.sink().as_deref(), Some("/null/"));
        assert!(Eid::create("api:you/null/").is_err());
    }

    #[test]
    fn test_parse_stcp_cla() {
        let eid = Eid::create("cla:stcp:10.0.0.1:4556/inbox/").unwrap();
        match &eid {
            Eid::Cla(c) => {
                assert_eq!(c.cla_name, "stcp");
                assert_eq!(c.locator, "10.0.0.1:4556");
                assert_eq!(c.sink, "/inbox/");
                assert_eq!(c.host_port(), Some(("10.0.0.1", 4556)));
            }
            _ => panic!("Wrong variant"),
        }
        assert_eq!(eid.cla_name(), Some("stcp"));
        assert_eq!(eid.channel_key(), "cla:stcp:10.0.0.1:4556");
    }

    #[test]
    fn test_stcp_requires_numeric_port() {
        let err = Eid::create("cla:stcp:10.0.0.1:http").unwrap_err();
        assert!(matches!(err, EidError::Malformed { .. }));
        assert!(Eid::create("cla:stcp:10.0.0.1").is_err());
        assert!(Eid::create("cla:stcp::4556").is_err());
    }

    #[test]
    fn test_other_cla_accepts_opaque_locator() {
        let eid = Eid::create("cla:bt:AA-BB-CC").unwrap();
        assert_eq!(eid.cla_name(), Some("bt"));
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        assert_eq!(
            Eid::create("mailto:someone"),
            Err(EidError::UnknownScheme("mailto".to_string()))
        );
    }

    #[test]
    fn test_unknown_eid_kept_literally() {
        let eid = Eid::unknown("mailto", "someone");
        assert_eq!(eid.scheme(), "mailto");
        assert_eq!(eid.iana_code(), EID_UNKNOWN_IANA_VALUE);
        assert_eq!(eid.to_string(), "mailto:someone");
    }

    #[test]
    fn test_missing_scheme() {
        assert!(matches!(
            Eid::create("no-scheme-here"),
            Err(EidError::MissingScheme(_))
        ));
        assert!(Eid::create(":foo").is_err());
    }

    #[test]
    fn test_cla_matches_ignores_sink() {
        let a = Eid::create("cla:stcp:host:4556/a/").unwrap();
        let b = Eid::create("cla:stcp:host:4556/b/").unwrap();
        let c = Eid::create("cla:stcp:host:4557/a/").unwrap();
        assert!(a.matches(&b));
        assert!(b.matches(&a));
        assert!(!a.matches(&c));
    }

    #[test]
    fn test_matches_across_variants_is_false() {
        let dtn = Eid::create("dtn://host/").unwrap();
        let unknown = Eid::unknown("foo", "//host/");
        assert!(!dtn.matches(&unknown));
        assert!(!unknown.matches(&dtn));
        assert!(dtn.matches(&dtn));
    }

    #[test]
    fn test_with_sink_normalizes() {
        let base = ClaEid::stcp("peer", 4556);
        assert_eq!(base.with_sink("null/").sink, "/null/");
        assert_eq!(Eid::from(base).to_string(), "cla:stcp:peer:4556");
    }

    #[test]
    fn test_peer_drops_sink() {
        let eid = Eid::create("cla:stcp:peer:4556/chat/").unwrap();
        assert_eq!(eid.peer().to_string(), "cla:stcp:peer:4556");
        let dtn = Eid::create("dtn://node/app/").unwrap();
        assert_eq!(dtn.peer(), dtn);
    }

    #[test]
    fn test_serde_as_string() {
        let eid = Eid::create("ipn:1.2").unwrap();
        let json = serde_json::to_string(&eid).unwrap();
        assert_eq!(json, "\"ipn:1.2\"");
        let back: Eid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, eid);
        assert!(serde_json::from_str::<Eid>("\"ipn:x\"").is_err());
    }
}
