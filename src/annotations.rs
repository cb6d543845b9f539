//! Module A, annotation schema.
//!
//! Parses and serializes the reflection control annotations described in
//! spec.md §4.A, and the namespace `Matcher` predicates they carry.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::errors::AnnotationError;
use crate::qn::Qn;

/// Fixed annotation key prefix (spec.md §6). Altering this breaks user manifests.
pub const ANNOTATION_PREFIX: &str = "reflector.v1.k8s.emberstack.com/";

pub const KEY_ALLOWED: &str = "reflection-allowed";
pub const KEY_ALLOWED_NAMESPACES: &str = "reflection-allowed-namespaces";
pub const KEY_AUTO_ENABLED: &str = "reflection-auto-enabled";
pub const KEY_AUTO_NAMESPACES: &str = "reflection-auto-namespaces";
pub const KEY_REFLECTS: &str = "reflects";
pub const KEY_REFLECTED_VERSION: &str = "reflected-version";
pub const KEY_REFLECTED_AT: &str = "reflected-at";
pub const KEY_AUTO_REFLECTS: &str = "auto-reflects";

pub(crate) fn full_key(suffix: &str) -> String {
    format!("{ANNOTATION_PREFIX}{suffix}")
}

/// A single namespace-matching clause: a literal name or a full-anchored regex.
#[derive(Debug, Clone)]
pub enum Matcher {
    Literal(String),
    Regex(regex::Regex),
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Matcher::Literal(a), Matcher::Literal(b)) => a == b,
            (Matcher::Regex(a), Matcher::Regex(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

impl Matcher {
    /// A token is a regex if it parses as one *and* contains a metacharacter
    /// outside `[A-Za-z0-9_-]` (spec.md §4.A's literal/regex heuristic).
    fn parse_token(token: &str) -> Result<Self, AnnotationError> {
        let has_meta = token
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'));
        if !has_meta {
            return Ok(Matcher::Literal(token.to_string()));
        }
        let anchored = format!("^(?:{token})$");
        match regex::Regex::new(&anchored) {
            Ok(re) => Ok(Matcher::Regex(re)),
            Err(e) => Err(AnnotationError::InvalidRegex {
                key: "namespaces",
                token: token.to_string(),
                message: e.to_string(),
            }),
        }
    }

    pub fn matches(&self, namespace: &str) -> bool {
        match self {
            Matcher::Literal(s) => s == namespace,
            Matcher::Regex(re) => re.is_match(namespace),
        }
    }
}

/// Parses a comma-separated namespace-matcher annotation value (spec.md §4.A):
/// split by comma, trim, drop empties, classify each token, log+skip invalid regexes.
pub fn parse_matchers(key: &'static str, raw: Option<&str>) -> Vec<Matcher> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|token| match Matcher::parse_token(token) {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(annotation = key, token, error = %e, "skipping invalid namespace matcher");
                None
            }
        })
        .collect()
}

/// `Matches(ns, matchers)`: true iff any matcher matches `ns`, or `ns` is empty
/// meaning "no restriction" is not implied here; callers must special-case the
/// source's own namespace per spec.md §4.A.
pub fn matches_any(namespace: &str, matchers: &[Matcher]) -> bool {
    matchers.iter().any(|m| m.matches(namespace))
}

fn parse_bool(key: &'static str, annotations: &BTreeMap<String, String>) -> bool {
    match annotations.get(&full_key(key)) {
        None => false,
        Some(v) if v.eq_ignore_ascii_case("true") => true,
        Some(v) => {
            let err = AnnotationError::InvalidBool { key, value: v.clone() };
            warn!(annotation = key, error = %err, "treating as false");
            false
        }
    }
}

fn parse_qn(key: &'static str, annotations: &BTreeMap<String, String>) -> Option<Qn> {
    let raw = annotations.get(&full_key(key))?;
    match Qn::parse(raw) {
        Some(qn) => Some(qn),
        None => {
            let err = AnnotationError::InvalidQn { key, value: raw.clone() };
            warn!(annotation = key, error = %err, "treating as absent");
            None
        }
    }
}

/// Reflection properties parsed from a resource's annotations (spec.md §3 RP).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReflectionProperties {
    pub allowed: bool,
    pub allowed_namespaces: Vec<Matcher>,
    pub auto_enabled: bool,
    pub auto_namespaces: Vec<Matcher>,
    pub reflects: Option<Qn>,
    pub reflected_version: Option<String>,
    pub reflected_at: Option<DateTime<Utc>>,
    pub auto_reflects: bool,
}

impl ReflectionProperties {
    /// Parses the full RP record from a resource's annotation map.
    pub fn parse(annotations: Option<&BTreeMap<String, String>>) -> Self {
        let empty = BTreeMap::new();
        let annotations = annotations.unwrap_or(&empty);

        let allowed = parse_bool(KEY_ALLOWED, annotations);
        let allowed_namespaces = parse_matchers(
            KEY_ALLOWED_NAMESPACES,
            annotations.get(&full_key(KEY_ALLOWED_NAMESPACES)).map(String::as_str),
        );
        let auto_enabled = parse_bool(KEY_AUTO_ENABLED, annotations);
        // auto-namespaces defaults to allowed-namespaces when the annotation is absent.
        let auto_namespaces = match annotations.get(&full_key(KEY_AUTO_NAMESPACES)) {
            Some(raw) => parse_matchers(KEY_AUTO_NAMESPACES, Some(raw)),
            None => allowed_namespaces.clone(),
        };
        let reflects = parse_qn(KEY_REFLECTS, annotations);
        let reflected_version = annotations.get(&full_key(KEY_REFLECTED_VERSION)).cloned();
        let reflected_at = annotations
            .get(&full_key(KEY_REFLECTED_AT))
            .and_then(|raw| match DateTime::parse_from_rfc3339(raw) {
                Ok(dt) => Some(dt.with_timezone(&Utc)),
                Err(e) => {
                    warn!(annotation = KEY_REFLECTED_AT, value = raw, error = %e, "malformed timestamp");
                    None
                }
            });
        let auto_reflects = parse_bool(KEY_AUTO_REFLECTS, annotations);

        Self {
            allowed,
            allowed_namespaces,
            auto_enabled,
            auto_namespaces,
            reflects,
            reflected_version,
            reflected_at,
            auto_reflects,
        }
    }

    /// `Matches(ns, matchers)` with the standing exception that a source's own
    /// namespace is always permitted.
    pub fn allows_namespace(&self, source_namespace: &str, candidate: &str) -> bool {
        candidate == source_namespace || matches_any(candidate, &self.allowed_namespaces)
    }

    pub fn auto_allows_namespace(&self, source_namespace: &str, candidate: &str) -> bool {
        candidate != source_namespace && matches_any(candidate, &self.auto_namespaces)
    }
}

/// Builds the bookkeeping annotation set written onto a mirror by Sync/AutoCreate.
pub fn mirror_bookkeeping_annotations(
    source: &Qn,
    reflected_version: &str,
    reflected_at: DateTime<Utc>,
    auto_reflects: bool,
) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    map.insert(full_key(KEY_REFLECTS), source.to_string());
    map.insert(full_key(KEY_REFLECTED_VERSION), reflected_version.to_string());
    map.insert(full_key(KEY_REFLECTED_AT), reflected_at.to_rfc3339());
    if auto_reflects {
        map.insert(full_key(KEY_AUTO_REFLECTS), "true".to_string());
    }
    map
}
