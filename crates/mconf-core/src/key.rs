//! Key codec for the two physical store layouts.
//!
//! Every `Cmd` has one logical identity and two physical encodings:
//!
//! - Tree layout (ZooKeeper-like): one path per entry,
//!   `/mconf/{app}/{node}/{env}/{conf}/{group}/{version}/{data}`
//! - Map layout (Redis-like): a prefix key naming a hash,
//!   `/mconf/{app}?node={node}/{conf}?env={env}`, holding suffix keys
//!   `/{data}?group={group}&version={version}`
//!
//! Both decode back to the identical `Cmd`. The characters `/`, `?`, `&`
//! and `=` delimit levels in these encodings and are therefore rejected in
//! key segments, as is whitespace.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::KeyError;
use crate::model::{Cmd, CmdBuilder};

/// Root segment shared by both layouts.
pub const ROOT: &str = "mconf";

fn segment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[^/?&=\s]+$").expect("segment pattern is valid"))
}

/// Check that a single key level is non-empty and free of reserved characters.
pub fn validate_segment(field: &'static str, value: &str) -> Result<(), KeyError> {
    if value.is_empty() {
        return Err(KeyError::EmptySegment(field));
    }
    if !segment_pattern().is_match(value) {
        return Err(KeyError::ReservedCharacter {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Physical layout of a backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreLayout {
    /// Full path → leaf value
    Tree,
    /// Prefix key → (suffix key → value)
    Map,
}

impl StoreLayout {
    /// Resolve the layout from a connect URL scheme.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "zookeeper" | "zk" | "tree" => Some(Self::Tree),
            "redis" | "map" => Some(Self::Map),
            _ => None,
        }
    }
}

/// The node+app+env+conf portion of a key in map-layout form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrefixKey(String);

impl PrefixKey {
    /// Wrap a raw prefix string without validation (e.g. read from a store).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PrefixKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The group+version+data portion of a key in map-layout form.
///
/// Empty for a conf-level scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SuffixKey(String);

impl SuffixKey {
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for SuffixKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Encode the prefix portion of a key.
pub fn encode_prefix(cmd: &Cmd) -> PrefixKey {
    PrefixKey(format!(
        "/{ROOT}/{}?node={}/{}?env={}",
        cmd.app(),
        cmd.node(),
        cmd.conf(),
        cmd.env()
    ))
}

/// Encode the suffix portion of a key.
pub fn encode_suffix(cmd: &Cmd) -> SuffixKey {
    let Some(group) = cmd.group() else {
        return SuffixKey(String::new());
    };

    let mut suffix = format!("/{}?group={group}", cmd.data().unwrap_or(""));
    if let Some(version) = cmd.version() {
        suffix.push_str("&version=");
        suffix.push_str(version);
    }
    SuffixKey(suffix)
}

/// Decode a map-layout key pair back into a `Cmd`.
pub fn decode(prefix: &PrefixKey, suffix: &SuffixKey) -> Result<Cmd, KeyError> {
    let mut builder = parse_prefix(prefix.as_str())?;

    if !suffix.is_empty() {
        let raw = suffix.as_str();
        let malformed = || KeyError::Malformed(raw.to_string());

        let (data, query) = raw
            .strip_prefix('/')
            .and_then(|rest| rest.split_once('?'))
            .ok_or_else(malformed)?;

        if !data.is_empty() {
            builder.data = Some(data.to_string());
        }
        for param in query.split('&') {
            match param.split_once('=') {
                Some(("group", value)) => builder.group = Some(value.to_string()),
                Some(("version", value)) => builder.version = Some(value.to_string()),
                _ => return Err(malformed()),
            }
        }
    }

    builder.build()
}

/// Decode a prefix key into its conf-level scope.
pub fn decode_prefix(prefix: &PrefixKey) -> Result<Cmd, KeyError> {
    parse_prefix(prefix.as_str())?.build()
}

fn parse_prefix(raw: &str) -> Result<CmdBuilder, KeyError> {
    let malformed = || KeyError::Malformed(raw.to_string());

    let rest = strip_root(raw).ok_or_else(malformed)?;
    let mut parts = rest.split('/');
    let (app, node) = parse_level(parts.next(), "node").ok_or_else(malformed)?;
    let (conf, env) = parse_level(parts.next(), "env").ok_or_else(malformed)?;
    if parts.next().is_some() {
        return Err(malformed());
    }

    Ok(CmdBuilder::new().node(node).app(app).env(env).conf(conf))
}

/// Split `{name}?{param}={value}`.
fn parse_level<'a>(part: Option<&'a str>, param: &str) -> Option<(&'a str, &'a str)> {
    let (name, query) = part?.split_once('?')?;
    let (key, value) = query.split_once('=')?;
    (key == param).then_some((name, value))
}

fn strip_root(raw: &str) -> Option<&str> {
    raw.strip_prefix('/')?.strip_prefix(ROOT)?.strip_prefix('/')
}

/// Encode a key as a tree-layout path. Scopes produce shorter paths.
pub fn encode_tree_path(cmd: &Cmd) -> String {
    let mut segments = vec![cmd.app(), cmd.node(), cmd.env(), cmd.conf()];
    segments.extend(cmd.group());
    segments.extend(cmd.version());
    segments.extend(cmd.data());
    scope_path(&segments)
}

/// Decode a tree-layout path (conf level or deeper) into a `Cmd`.
pub fn decode_tree_path(path: &str) -> Result<Cmd, KeyError> {
    let malformed = || KeyError::Malformed(path.to_string());

    let rest = strip_root(path).ok_or_else(malformed)?;
    let segments: Vec<&str> = rest.split('/').collect();
    if !(4..=7).contains(&segments.len()) {
        return Err(malformed());
    }

    let mut builder = CmdBuilder::new()
        .app(segments[0])
        .node(segments[1])
        .env(segments[2])
        .conf(segments[3]);
    builder.group = segments.get(4).map(|s| s.to_string());
    builder.version = segments.get(5).map(|s| s.to_string());
    builder.data = segments.get(6).map(|s| s.to_string());
    builder.build()
}

/// Convert a map-layout key pair into the equivalent tree path.
pub fn tree_path(prefix: &PrefixKey, suffix: &SuffixKey) -> Result<String, KeyError> {
    decode(prefix, suffix).map(|cmd| encode_tree_path(&cmd))
}

/// Convert a tree path into the equivalent map-layout key pair.
pub fn split_tree_path(path: &str) -> Result<(PrefixKey, SuffixKey), KeyError> {
    let cmd = decode_tree_path(path)?;
    Ok((encode_prefix(&cmd), encode_suffix(&cmd)))
}

/// Join tree-layout segments under the root, e.g. `/mconf/app/node`.
pub fn scope_path(segments: &[&str]) -> String {
    let mut path = format!("/{ROOT}");
    for segment in segments {
        path.push('/');
        path.push_str(segment);
    }
    path
}
