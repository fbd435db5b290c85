//! Canonical namespaced names.
//!
//! An [`Identifier`] is a reverse-DNS-like namespace plus a non-empty path,
//! rendered as `namespace:seg1/seg2/...`.  It is the universal addressing
//! unit: apps, packet types, endpoints, tables, registries, signals and
//! permissions are all keyed by one.

use std::fmt;
use std::path::PathBuf;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("invalid namespace {0:?}")]
    InvalidNamespace(String),
    #[error("invalid path segment {0:?}")]
    InvalidSegment(String),
    #[error("path must have at least one segment")]
    EmptyPath,
    #[error("invalid key {0:?}: {1}")]
    InvalidKey(String, &'static str),
}

/// A namespaced name: `namespace:seg1/seg2/...`.
///
/// Immutable and hashable; equality is by key.  Serializes to its key string
/// so it can double as a JSON map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier {
    namespace: String,
    path: Vec<String>,
}

fn valid_namespace(namespace: &str) -> bool {
    !namespace.is_empty()
        && namespace
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty() && !segment.contains(['/', ':', '.'])
}

impl Identifier {
    pub fn new<I, S>(namespace: &str, path: I) -> Result<Self, IdentifierError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !valid_namespace(namespace) {
            return Err(IdentifierError::InvalidNamespace(namespace.to_owned()));
        }
        let path: Vec<String> = path.into_iter().map(Into::into).collect();
        if path.is_empty() {
            return Err(IdentifierError::EmptyPath);
        }
        for segment in &path {
            if !valid_segment(segment) {
                return Err(IdentifierError::InvalidSegment(segment.clone()));
            }
        }
        Ok(Self {
            namespace: namespace.to_owned(),
            path,
        })
    }

    /// Parses the canonical `namespace:seg1/seg2` form.
    pub fn from_key(key: &str) -> Result<Self, IdentifierError> {
        let Some((namespace, path)) = key.split_once(':') else {
            return Err(IdentifierError::InvalidKey(key.to_owned(), "no separator"));
        };
        if path.contains(':') {
            return Err(IdentifierError::InvalidKey(
                key.to_owned(),
                "multiple separators",
            ));
        }
        if namespace.is_empty() || path.is_empty() {
            return Err(IdentifierError::InvalidKey(
                key.to_owned(),
                "namespace and path cannot be empty",
            ));
        }
        Self::new(namespace, path.split('/'))
    }

    /// Builds an identifier from a URL: the host reversed becomes the
    /// namespace, the URL path becomes the path.
    pub fn from_url(url: &str) -> Result<Self, IdentifierError> {
        let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
        let (netloc, path) = rest.split_once('/').unwrap_or((rest, ""));
        let namespace = namespace_from_host(netloc);
        Self::new(&namespace, path.split('/').filter(|s| !s.is_empty()))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.namespace, self.path.join("/"))
    }

    /// Appends path segments.  Panics only on segments that violate the
    /// name grammar, so callers pass literals.
    pub fn join(&self, segments: &[&str]) -> Self {
        let mut path = self.path.clone();
        for segment in segments {
            assert!(valid_segment(segment), "invalid segment {segment:?}");
            path.push((*segment).to_owned());
        }
        Self {
            namespace: self.namespace.clone(),
            path,
        }
    }

    /// True when `self` lives at or under `base`.
    pub fn is_subpath_of(&self, base: &Identifier) -> bool {
        self.namespace == base.namespace
            && self.path.len() >= base.path.len()
            && self.path[..base.path.len()] == base.path[..]
    }

    /// Filesystem-safe relative path for per-identifier storage.
    ///
    /// The namespace directory carries a short digest suffix so that two
    /// namespaces that sanitize to the same string cannot collide.
    pub fn sanitized_path(&self) -> PathBuf {
        let digest = Sha256::digest(self.namespace.as_bytes());
        let mut root = sanitize_filename(&self.namespace);
        root.push('-');
        root.push_str(&hex::encode(&digest[..4]));
        let mut path = PathBuf::from(root);
        for segment in &self.path {
            path.push(sanitize_filename(segment));
        }
        path
    }
}

/// Reverses a dotted host into a namespace, dropping any `:port` suffix.
pub fn namespace_from_host(netloc: &str) -> String {
    let host = netloc.split_once(':').map_or(netloc, |(host, _)| host);
    let mut parts: Vec<&str> = host.split('.').collect();
    parts.reverse();
    parts.join(".")
}

fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.path.join("/"))
    }
}

impl Serialize for Identifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.key())
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let key = String::deserialize(deserializer)?;
        Identifier::from_key(&key).map_err(D::Error::custom)
    }
}
