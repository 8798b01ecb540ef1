//! Connect URL parsing.
//!
//! Format:
//!
//! ```text
//! [zookeeper|redis]://127.0.0.1:2181/mconf?node=n&app=a&env=e&conf=c&group=g&version=v&data=d
//! ```
//!
//! The scheme selects the store layout. The key-level query parameters
//! become connection-scoped `Cmd` defaults; any other parameter is kept in
//! `params` and may override settings (`allowOverwrite`, `timeout`).

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::config::{ConfigError, MconfSettings};
use crate::key::{self, StoreLayout};
use crate::model::CmdBuilder;

/// A parsed connect URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectUrl {
    raw: String,
    pub scheme: String,
    pub layout: StoreLayout,
    pub host: String,
    pub port: Option<u16>,
    /// Connection-scoped key defaults
    pub defaults: CmdBuilder,
    /// Non-key query parameters
    pub params: BTreeMap<String, String>,
}

impl ConnectUrl {
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = url.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        let layout = StoreLayout::from_scheme(scheme).ok_or_else(|| invalid("unsupported scheme"))?;

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };
        let (authority, path) = match location.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (location, ""),
        };
        if !path.is_empty() && path.trim_end_matches('/') != key::ROOT {
            return Err(invalid("path must be /mconf"));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
                (host, Some(port))
            }
            None => (authority, None),
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        let mut defaults = CmdBuilder::default();
        let mut params = BTreeMap::new();

        for param in query.unwrap_or("").split('&').filter(|p| !p.is_empty()) {
            let (name, value) = param.split_once('=').unwrap_or((param, ""));
            let slot = match name {
                "node" => Some((&mut defaults.node, "node")),
                "app" => Some((&mut defaults.app, "app")),
                "env" => Some((&mut defaults.env, "env")),
                "conf" => Some((&mut defaults.conf, "conf")),
                "group" => Some((&mut defaults.group, "group")),
                "version" => Some((&mut defaults.version, "version")),
                "data" => Some((&mut defaults.data, "data")),
                _ => None,
            };
            match slot {
                Some((slot, field)) => {
                    key::validate_segment(field, value)
                        .map_err(|e| invalid(&e.to_string()))?;
                    *slot = Some(value.to_string());
                }
                None => {
                    params.insert(name.to_string(), value.to_string());
                }
            }
        }

        Ok(Self {
            raw: url.to_string(),
            scheme: scheme.to_string(),
            layout,
            host: host.to_string(),
            port,
            defaults,
            params,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// `host:port`, or just `host` when no port was given.
    pub fn address(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Apply URL overrides (`allowOverwrite`, `timeout`) to `settings`.
    pub fn apply_to(&self, settings: &mut MconfSettings) -> Result<(), ConfigError> {
        if let Some(value) = self.param("allowOverwrite") {
            settings.allow_overwrite = parse_param("allowOverwrite", value)?;
        }
        if let Some(value) = self.param("timeout") {
            settings.connect_timeout_ms = parse_param("timeout", value)?;
        }
        Ok(())
    }
}

fn parse_param<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

impl FromStr for ConnectUrl {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ConnectUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_full_url() {
        let url = ConnectUrl::parse(
            "zookeeper://127.0.0.1:2181/mconf?node=n1&app=a1&env=dev&conf=db&group=g1&version=1.0&timeout=300",
        )
        .unwrap();

        assert_eq!(url.layout, StoreLayout::Tree);
        assert_eq!(url.address(), "127.0.0.1:2181");
        assert_eq!(url.defaults.node.as_deref(), Some("n1"));
        assert_eq!(url.defaults.conf.as_deref(), Some("db"));
        assert_eq!(url.defaults.version.as_deref(), Some("1.0"));
        assert_eq!(url.defaults.data, None);
        assert_eq!(url.param("timeout"), Some("300"));
    }

    #[test]
    fn test_parse_minimal_url() {
        let url: ConnectUrl = "redis://cache.local".parse().unwrap();
        assert_eq!(url.layout, StoreLayout::Map);
        assert_eq!(url.port, None);
        assert!(url.defaults.is_empty());
    }

    #[test]
    fn test_rejects_bad_urls() {
        for bad in [
            "127.0.0.1:2181/mconf",
            "http://127.0.0.1/mconf",
            "redis://127.0.0.1:notaport/mconf",
            "redis:///mconf",
            "redis://127.0.0.1/other",
            "redis://127.0.0.1/mconf?app=",
        ] {
            assert!(ConnectUrl::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_apply_overrides() {
        let url = ConnectUrl::parse("redis://localhost/mconf?allowOverwrite=true&timeout=250").unwrap();
        let mut settings = MconfSettings::default();
        url.apply_to(&mut settings).unwrap();

        assert!(settings.allow_overwrite);
        assert_eq!(settings.connect_timeout_ms, 250);
    }

    #[test]
    fn test_apply_rejects_bad_value() {
        let url = ConnectUrl::parse("redis://localhost/mconf?timeout=soon").unwrap();
        let mut settings = MconfSettings::default();
        let err = url.apply_to(&mut settings).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
