//! Structure index over registry entries.
//!
//! All functions here take a snapshot of entries (typically `ConfStore::entries`
//! under a read lock) and rebuild their view from scratch.

use std::collections::{BTreeMap, BTreeSet};

use crate::key;
use crate::model::{DataConf, Entry};

/// node → app → env → conf → group → versions
pub type Structures = BTreeMap<
    String,
    BTreeMap<String, BTreeMap<String, BTreeMap<String, BTreeMap<String, BTreeSet<String>>>>>,
>;

/// Build the nested structure map.
pub fn structures<'a, I>(entries: I) -> Structures
where
    I: IntoIterator<Item = &'a Entry>,
{
    let mut tree = Structures::new();
    for entry in entries {
        let cmd = &entry.cmd;
        let (Some(group), Some(version)) = (cmd.group(), cmd.version()) else {
            continue;
        };
        tree.entry(cmd.node().to_string())
            .or_default()
            .entry(cmd.app().to_string())
            .or_default()
            .entry(cmd.env().to_string())
            .or_default()
            .entry(cmd.conf().to_string())
            .or_default()
            .entry(group.to_string())
            .or_default()
            .insert(version.to_string());
    }
    tree
}

/// One record per (node, app).
pub fn apps<'a, I>(entries: I) -> Vec<DataConf>
where
    I: IntoIterator<Item = &'a Entry>,
{
    project(entries, Level::App)
}

/// One record per (node, app, env, conf).
pub fn confs<'a, I>(entries: I) -> Vec<DataConf>
where
    I: IntoIterator<Item = &'a Entry>,
{
    project(entries, Level::Conf)
}

/// One record per entry, including its value.
pub fn kv_datas<'a, I>(entries: I) -> Vec<DataConf>
where
    I: IntoIterator<Item = &'a Entry>,
{
    project(entries, Level::Data)
}

#[derive(Clone, Copy, PartialEq)]
enum Level {
    App,
    Conf,
    Data,
}

fn project<'a, I>(entries: I, level: Level) -> Vec<DataConf>
where
    I: IntoIterator<Item = &'a Entry>,
{
    let mut records: BTreeMap<String, DataConf> = BTreeMap::new();

    for entry in entries {
        let cmd = &entry.cmd;
        let deep = |value: Option<&str>| {
            if level == Level::Data {
                value.map(String::from)
            } else {
                None
            }
        };
        let (env, conf) = match level {
            Level::App => (None, None),
            Level::Conf | Level::Data => (Some(cmd.env().to_string()), Some(cmd.conf().to_string())),
        };

        let key = match level {
            Level::App => key::scope_path(&[cmd.app(), cmd.node()]),
            Level::Conf => key::scope_path(&[cmd.app(), cmd.node(), cmd.env(), cmd.conf()]),
            Level::Data => key::encode_tree_path(cmd),
        };

        let record = records.entry(key.clone()).or_insert_with(|| DataConf {
            key,
            node: cmd.node().to_string(),
            app: cmd.app().to_string(),
            env,
            conf,
            group: deep(cmd.group()),
            version: deep(cmd.version()),
            data: deep(cmd.data()),
            entries: 0,
            revision: 0,
            updated_at: entry.updated_at,
            value: (level == Level::Data).then(|| entry.value.clone()),
        });

        record.entries += 1;
        record.revision = record.revision.max(entry.revision);
        record.updated_at = record.updated_at.max(entry.updated_at);
    }

    records.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Cmd, CmdBuilder};
    use crate::registry::{ConfStore, MemoryRegistry};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn key(node: &str, app: &str, conf: &str, group: &str, version: &str, data: &str) -> Cmd {
        CmdBuilder::new()
            .node(node)
            .app(app)
            .env("e1")
            .conf(conf)
            .group(group)
            .version(version)
            .data(data)
            .build()
            .unwrap()
    }

    fn registry() -> MemoryRegistry {
        let mut registry = MemoryRegistry::new();
        for (cmd, value) in [
            (key("n1", "a1", "c1", "g1", "v1", "d1"), json!("x")),
            (key("n1", "a1", "c1", "g1", "v2", "d1"), json!("y")),
            (key("n1", "a1", "c2", "g2", "v1", "d1"), json!("z")),
            (key("n2", "a2", "c1", "g1", "v1", "d1"), json!("w")),
        ] {
            registry.add_conf(&cmd, value, false).unwrap();
        }
        registry
    }

    #[test]
    fn test_structures() {
        let registry = registry();
        let tree = structures(registry.entries());

        let versions = &tree["n1"]["a1"]["e1"]["c1"]["g1"];
        assert_eq!(
            versions.iter().cloned().collect::<Vec<_>>(),
            vec!["v1".to_string(), "v2".to_string()]
        );
        assert!(tree["n1"]["a1"]["e1"]["c2"].contains_key("g2"));
        assert!(tree["n2"]["a2"]["e1"]["c1"].contains_key("g1"));
    }

    #[test]
    fn test_structures_after_delete() {
        let mut registry = MemoryRegistry::new();
        let cmd = key("n1", "a1", "c1", "g1", "v1", "d1");
        registry.add_conf(&cmd, json!("X"), false).unwrap();
        assert!(structures(registry.entries())["n1"]["a1"]["e1"]["c1"]["g1"].contains("v1"));

        registry.del_conf(&cmd).unwrap();
        assert!(structures(registry.entries()).is_empty());
    }

    #[test]
    fn test_apps_projection() {
        let registry = registry();
        let apps = apps(registry.entries());

        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].key, "/mconf/a1/n1");
        assert_eq!(apps[0].entries, 3);
        assert_eq!(apps[0].env, None);
        assert_eq!(apps[0].value, None);
    }

    #[test]
    fn test_confs_projection() {
        let registry = registry();
        let confs = confs(registry.entries());

        let keys: Vec<&str> = confs.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["/mconf/a1/n1/e1/c1", "/mconf/a1/n1/e1/c2", "/mconf/a2/n2/e1/c1"]
        );
        assert_eq!(confs[0].entries, 2);
        assert_eq!(confs[0].revision, 2);
        assert_eq!(confs[0].group, None);
    }

    #[test]
    fn test_kv_datas_projection() {
        let registry = registry();
        let datas = kv_datas(registry.entries());

        assert_eq!(datas.len(), 4);
        let first = &datas[0];
        assert_eq!(first.key, "/mconf/a1/n1/e1/c1/g1/v1/d1");
        assert_eq!(first.data.as_deref(), Some("d1"));
        assert_eq!(first.value, Some(json!("x")));
        assert_eq!(first.entries, 1);
    }
}
