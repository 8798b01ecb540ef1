//! Configuration center data model types.
//!
//! These types represent the logical key schema and records:
//! - `Cmd`, the five-level hierarchical key, and its builder
//! - `Entry`, a stored configuration value with revision metadata
//! - `ChangeEvent`, emitted by the registry for every mutation
//! - `DataConf`, the flattened listing record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::KeyError;
use crate::key;

/// A hierarchical configuration key.
///
/// `node`, `app`, `env` and `conf` are always present. `group`, `version`
/// and `data` progressively narrow the scope: `version` requires `group`,
/// `data` requires `version`. A `Cmd` with `data` set addresses exactly one
/// entry; without it, the `Cmd` is a scope covering every entry below it.
///
/// The derived ordering sorts a scope before every key it covers, which the
/// registry relies on for range scans.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "CmdBuilder", into = "CmdBuilder")]
pub struct Cmd {
    node: String,
    app: String,
    env: String,
    conf: String,
    group: Option<String>,
    version: Option<String>,
    data: Option<String>,
}

impl Cmd {
    /// Start building a key.
    pub fn builder() -> CmdBuilder {
        CmdBuilder::default()
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn env(&self) -> &str {
        &self.env
    }

    pub fn conf(&self) -> &str {
        &self.conf
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }

    /// True if this key addresses a single entry (all seven levels set).
    pub fn is_entry(&self) -> bool {
        self.data.is_some()
    }

    /// Check whether `other` lies within the scope of this key.
    ///
    /// The prefix levels must be equal; every optional level set on `self`
    /// must be equal on `other`. A key always covers itself.
    pub fn covers(&self, other: &Cmd) -> bool {
        self.node == other.node
            && self.app == other.app
            && self.env == other.env
            && self.conf == other.conf
            && narrows(&self.group, &other.group)
            && narrows(&self.version, &other.version)
            && narrows(&self.data, &other.data)
    }

    /// True if either key covers the other.
    pub fn overlaps(&self, other: &Cmd) -> bool {
        self.covers(other) || other.covers(self)
    }

    /// The conf-level scope of this key (group, version and data cleared).
    pub fn conf_scope(&self) -> Cmd {
        Cmd {
            group: None,
            version: None,
            data: None,
            ..self.clone()
        }
    }

    /// Convert back into a builder, e.g. to change one level.
    pub fn to_builder(&self) -> CmdBuilder {
        CmdBuilder::from(self.clone())
    }
}

fn narrows(scope: &Option<String>, key: &Option<String>) -> bool {
    match scope {
        Some(level) => key.as_deref() == Some(level.as_str()),
        None => true,
    }
}

impl std::fmt::Display for Cmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", key::encode_tree_path(self))
    }
}

/// Builder for `Cmd` with every level optional.
///
/// Also used as the set of connection-scoped defaults parsed from the
/// connect URL; `or` fills unset levels from such defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmdBuilder {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conf: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl CmdBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn app(mut self, app: impl Into<String>) -> Self {
        self.app = Some(app.into());
        self
    }

    pub fn env(mut self, env: impl Into<String>) -> Self {
        self.env = Some(env.into());
        self
    }

    pub fn conf(mut self, conf: impl Into<String>) -> Self {
        self.conf = Some(conf.into());
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Clear `group` and everything below it.
    pub fn clear_group(mut self) -> Self {
        self.group = None;
        self.clear_version()
    }

    /// Clear `version` and `data`.
    pub fn clear_version(mut self) -> Self {
        self.version = None;
        self.clear_data()
    }

    pub fn clear_data(mut self) -> Self {
        self.data = None;
        self
    }

    /// Fill every unset level from `defaults`.
    pub fn or(self, defaults: &CmdBuilder) -> Self {
        Self {
            node: self.node.or_else(|| defaults.node.clone()),
            app: self.app.or_else(|| defaults.app.clone()),
            env: self.env.or_else(|| defaults.env.clone()),
            conf: self.conf.or_else(|| defaults.conf.clone()),
            group: self.group.or_else(|| defaults.group.clone()),
            version: self.version.or_else(|| defaults.version.clone()),
            data: self.data.or_else(|| defaults.data.clone()),
        }
    }

    /// True if no level is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Check whether the prefix levels of `cmd` agree with every prefix
    /// level set on this builder. Used to scope a connection to its defaults.
    pub fn admits_prefix(&self, cmd: &Cmd) -> bool {
        let agrees = |level: &Option<String>, value: &str| {
            level.as_deref().map_or(true, |expected| expected == value)
        };
        agrees(&self.node, cmd.node())
            && agrees(&self.app, cmd.app())
            && agrees(&self.env, cmd.env())
            && agrees(&self.conf, cmd.conf())
    }

    /// Validate and build the key.
    pub fn build(self) -> Result<Cmd, KeyError> {
        let node = required("node", self.node)?;
        let app = required("app", self.app)?;
        let env = required("env", self.env)?;
        let conf = required("conf", self.conf)?;

        if self.version.is_some() && self.group.is_none() {
            return Err(KeyError::MissingParent {
                field: "version",
                requires: "group",
            });
        }
        if self.data.is_some() && self.version.is_none() {
            return Err(KeyError::MissingParent {
                field: "data",
                requires: "version",
            });
        }

        let group = optional("group", self.group)?;
        let version = optional("version", self.version)?;
        let data = optional("data", self.data)?;

        Ok(Cmd {
            node,
            app,
            env,
            conf,
            group,
            version,
            data,
        })
    }
}

fn required(field: &'static str, value: Option<String>) -> Result<String, KeyError> {
    let value = value.ok_or(KeyError::MissingSegment(field))?;
    key::validate_segment(field, &value)?;
    Ok(value)
}

fn optional(field: &'static str, value: Option<String>) -> Result<Option<String>, KeyError> {
    if let Some(ref v) = value {
        key::validate_segment(field, v)?;
    }
    Ok(value)
}

impl TryFrom<CmdBuilder> for Cmd {
    type Error = KeyError;

    fn try_from(builder: CmdBuilder) -> Result<Self, Self::Error> {
        builder.build()
    }
}

impl From<Cmd> for CmdBuilder {
    fn from(cmd: Cmd) -> Self {
        Self {
            node: Some(cmd.node),
            app: Some(cmd.app),
            env: Some(cmd.env),
            conf: Some(cmd.conf),
            group: cmd.group,
            version: cmd.version,
            data: cmd.data,
        }
    }
}

/// A stored configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// The full key of this entry (`data` always set)
    pub cmd: Cmd,

    /// The opaque JSON payload
    pub value: Value,

    /// Registry revision of the last mutation
    pub revision: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Kind of registry mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
    /// A whole scope was removed; emitted after the per-entry deletions.
    SubtreeDeleted,
}

/// A change emitted by the registry for a single key or scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub kind: ChangeKind,

    /// Entry key, or the removed scope for `SubtreeDeleted`
    pub cmd: Cmd,

    /// New value; `None` marks a deletion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    pub revision: u64,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn is_deletion(&self) -> bool {
        matches!(self.kind, ChangeKind::Deleted | ChangeKind::SubtreeDeleted)
    }
}

/// Listing record produced by the app, conf and kv-data projections.
///
/// Levels below the projection depth are `None`. `key` is the tree path of
/// the listed scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataConf {
    pub key: String,
    pub node: String,
    pub app: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conf: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,

    /// Number of entries in this scope
    pub entries: usize,

    /// Highest revision within this scope
    pub revision: u64,

    /// Most recent update within this scope
    pub updated_at: DateTime<Utc>,

    /// The entry value (kv-data listings only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn full() -> Cmd {
        Cmd::builder()
            .node("n1")
            .app("a1")
            .env("e1")
            .conf("c1")
            .group("g1")
            .version("v1")
            .data("d1")
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_requires_prefix_levels() {
        let err = Cmd::builder().node("n1").app("a1").env("e1").build();
        assert_eq!(err, Err(KeyError::MissingSegment("conf")));
    }

    #[test]
    fn test_build_rejects_data_without_version() {
        let err = Cmd::builder()
            .node("n1")
            .app("a1")
            .env("e1")
            .conf("c1")
            .group("g1")
            .data("d1")
            .build();
        assert_eq!(
            err,
            Err(KeyError::MissingParent {
                field: "data",
                requires: "version"
            })
        );
    }

    #[test]
    fn test_build_rejects_separator() {
        let err = Cmd::builder()
            .node("n/1")
            .app("a1")
            .env("e1")
            .conf("c1")
            .build();
        assert!(matches!(err, Err(KeyError::ReservedCharacter { field: "node", .. })));
    }

    #[test]
    fn test_covers() {
        let entry = full();
        let conf = entry.conf_scope();
        let group = conf.to_builder().group("g1").build().unwrap();
        let other_group = conf.to_builder().group("g2").build().unwrap();

        assert!(conf.covers(&entry));
        assert!(group.covers(&entry));
        assert!(entry.covers(&entry));
        assert!(!other_group.covers(&entry));
        assert!(!entry.covers(&conf));
        assert!(entry.overlaps(&conf));
    }

    #[test]
    fn test_scope_sorts_before_covered_keys() {
        let entry = full();
        let conf = entry.conf_scope();
        assert!(conf < entry);
    }

    #[test]
    fn test_builder_defaults() {
        let defaults = CmdBuilder::new().node("n1").app("a1").env("e1").conf("c1");
        let cmd = CmdBuilder::new()
            .group("g1")
            .version("v1")
            .data("d1")
            .or(&defaults)
            .build()
            .unwrap();
        assert_eq!(cmd, full());
    }

    #[test]
    fn test_admits_prefix() {
        let defaults = CmdBuilder::new().node("n1").app("a1");
        assert!(defaults.admits_prefix(&full()));

        let other = CmdBuilder::new().app("a2");
        assert!(!other.admits_prefix(&full()));
    }

    #[test]
    fn test_serde_validates() {
        let json = serde_json::json!({"node": "n1", "app": "a1", "env": "e1", "conf": "c1", "data": "d1"});
        let parsed: Result<Cmd, _> = serde_json::from_value(json);
        assert!(parsed.is_err());

        let encoded = serde_json::to_value(full()).unwrap();
        let decoded: Cmd = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, full());
    }
}
