//! Canonical in-memory form of route definitions.
//!
//! `RouteDef` is the unit data clients deliver and the table builder
//! consumes. Definitions are plain serde data; equality on them drives
//! instance reuse across table generations.
use http::Uri;
use serde::{Deserialize, Serialize};

/// A scalar argument of a predicate or filter.
///
/// The untagged order matters: booleans and numbers must be tried before the
/// catch-all string variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Arg {
    Bool(bool),
    Number(f64),
    String(String),
}

impl Arg {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Arg::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric coercion to a non-negative integer; strings are not coerced.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Arg::Number(n) if *n >= 0.0 && n.fract() == 0.0 => Some(*n as u64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Arg::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::String(value.to_string())
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Arg::String(value)
    }
}

impl From<f64> for Arg {
    fn from(value: f64) -> Self {
        Arg::Number(value)
    }
}

impl From<i32> for Arg {
    fn from(value: i32) -> Self {
        Arg::Number(value as f64)
    }
}

/// Error produced by predicate/filter factories while validating and
/// coercing their arguments.
#[derive(thiserror::Error, Debug)]
pub enum CreateError {
    #[error("expected {expected} argument(s), got {got}")]
    ArgCount { expected: usize, got: usize },
    #[error("invalid argument at position {pos}: {reason}")]
    InvalidArg { pos: usize, reason: String },
    #[error("{0}")]
    Other(String),
}

impl CreateError {
    pub fn invalid_arg(pos: usize, reason: impl Into<String>) -> Self {
        Self::InvalidArg {
            pos,
            reason: reason.into(),
        }
    }
}

/// Argument accessors shared by factories: positional, typed, mandatory.
pub trait ArgsExt {
    fn require_len(&self, expected: usize) -> Result<(), CreateError>;
    fn string_at(&self, pos: usize) -> Result<String, CreateError>;
    fn u64_at(&self, pos: usize) -> Result<u64, CreateError>;
}

impl ArgsExt for [Arg] {
    fn require_len(&self, expected: usize) -> Result<(), CreateError> {
        if self.len() != expected {
            return Err(CreateError::ArgCount {
                expected,
                got: self.len(),
            });
        }
        Ok(())
    }

    fn string_at(&self, pos: usize) -> Result<String, CreateError> {
        self.get(pos)
            .and_then(|a| a.as_str())
            .map(str::to_string)
            .ok_or_else(|| CreateError::invalid_arg(pos, "expected a string"))
    }

    fn u64_at(&self, pos: usize) -> Result<u64, CreateError> {
        self.get(pos)
            .and_then(|a| a.as_u64())
            .ok_or_else(|| CreateError::invalid_arg(pos, "expected a non-negative integer"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredicateDef {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Arg>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterDef {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Arg>,
}

/// Load-balancing algorithm selector for LB backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum LbAlgorithm {
    #[default]
    RoundRobin,
    Random,
    ConsistentHash,
    PowerOfRandomNChoices,
}

/// Where a matched request goes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendDef {
    /// A fixed upstream, e.g. `http://backend.local:8080`.
    Network {
        #[serde(with = "crate::util::uri_serde")]
        address: Uri,
    },
    /// Respond from within the proxy; no upstream is contacted.
    Shunt,
    /// Re-enter route matching with the (possibly rewritten) request.
    Loopback,
    /// Target host/scheme are taken from fields filters set on the context.
    Dynamic,
    /// A load-balanced endpoint set.
    Lb {
        #[serde(default)]
        algorithm: LbAlgorithm,
        #[serde(with = "crate::util::uri_serde::vec")]
        endpoints: Vec<Uri>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDef {
    pub id: String,
    #[serde(default)]
    pub predicates: Vec<PredicateDef>,
    #[serde(default)]
    pub filters: Vec<FilterDef>,
    pub backend: BackendDef,

    // Legacy dedicated matcher fields. The table builder normalizes them
    // into predicates before instantiation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_regexp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_regexp: Option<String>,
    #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub headers: std::collections::HashMap<String, String>,
}

impl RouteDef {
    pub fn new(id: impl Into<String>, backend: BackendDef) -> Self {
        Self {
            id: id.into(),
            predicates: Vec::new(),
            filters: Vec::new(),
            backend,
            method: None,
            host_regexp: None,
            path_regexp: None,
            headers: std::collections::HashMap::new(),
        }
    }

    /// The legacy dedicated fields expressed as ordinary predicates.
    pub fn legacy_predicates(&self) -> Vec<PredicateDef> {
        let mut out = Vec::new();
        if let Some(method) = &self.method {
            out.push(PredicateDef {
                name: "Method".into(),
                args: vec![Arg::String(method.clone())],
            });
        }
        if let Some(host) = &self.host_regexp {
            out.push(PredicateDef {
                name: "Host".into(),
                args: vec![Arg::String(host.clone())],
            });
        }
        if let Some(path) = &self.path_regexp {
            out.push(PredicateDef {
                name: "PathRegexp".into(),
                args: vec![Arg::String(path.clone())],
            });
        }
        let mut headers: Vec<_> = self.headers.iter().collect();
        headers.sort();
        for (name, value) in headers {
            out.push(PredicateDef {
                name: "Header".into(),
                args: vec![Arg::String(name.clone()), Arg::String(value.clone())],
            });
        }
        out
    }

    /// Stable content fingerprint, used for snapshot dedup.
    pub fn fingerprint(&self) -> String {
        // RouteDef serialization is infallible: all fields are plain data.
        serde_json::to_string(self).expect("route definition must serialize")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RouteDef {
        let mut def = RouteDef::new(
            "api",
            BackendDef::Lb {
                algorithm: LbAlgorithm::RoundRobin,
                endpoints: vec![
                    "http://10.0.0.1:8080".parse().unwrap(),
                    "http://10.0.0.2:8080".parse().unwrap(),
                ],
            },
        );
        def.predicates = vec![
            PredicateDef {
                name: "Path".into(),
                args: vec!["/api/:version/users".into()],
            },
            PredicateDef {
                name: "Method".into(),
                args: vec!["GET".into()],
            },
            PredicateDef {
                name: "Weight".into(),
                args: vec![4.into()],
            },
        ];
        def.filters = vec![FilterDef {
            name: "setRequestHeader".into(),
            args: vec!["X-Upstream".into(), "users".into()],
        }];
        def
    }

    #[test]
    fn json_round_trip_is_identity() {
        let def = sample();
        let encoded = serde_json::to_string(&def).unwrap();
        let decoded: RouteDef = serde_json::from_str(&encoded).unwrap();
        assert_eq!(def, decoded);
        // and printing the decoded value again yields the same text
        assert_eq!(encoded, serde_json::to_string(&decoded).unwrap());
    }

    #[test]
    fn arg_scalars_deserialize_untagged() {
        let args: Vec<Arg> = serde_json::from_str(r#"["s", 2, true, 1.5]"#).unwrap();
        assert_eq!(args[0].as_str(), Some("s"));
        assert_eq!(args[1].as_u64(), Some(2));
        assert_eq!(args[2].as_bool(), Some(true));
        assert_eq!(args[3].as_f64(), Some(1.5));
        assert_eq!(args[3].as_u64(), None);
    }

    #[test]
    fn legacy_fields_normalize_to_predicates() {
        let mut def = RouteDef::new("legacy", BackendDef::Shunt);
        def.method = Some("POST".into());
        def.host_regexp = Some("^api[.]".into());
        def.headers
            .insert("X-Tenant".to_string(), "acme".to_string());
        let predicates = def.legacy_predicates();
        let names: Vec<_> = predicates.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Method", "Host", "Header"]);
    }

    #[test]
    fn backend_tags() {
        let shunt: BackendDef = serde_json::from_str(r#"{"type":"shunt"}"#).unwrap();
        assert_eq!(shunt, BackendDef::Shunt);
        let net: BackendDef =
            serde_json::from_str(r#"{"type":"network","address":"http://example.org"}"#).unwrap();
        match net {
            BackendDef::Network { address } => assert_eq!(address.host(), Some("example.org")),
            other => panic!("unexpected backend: {other:?}"),
        }
    }
}
