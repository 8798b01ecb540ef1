//! # mconf-core
//!
//! Core data model and in-memory registry for the configuration center.
//!
//! This crate provides:
//! - The hierarchical `Cmd` key and its builder
//! - Key codec for the tree-path and prefix-map store layouts
//! - In-memory registry implementation with change events
//! - Structure index (node → app → env → conf → group → versions)
//! - Settings and connection URL parsing
//!
//! This crate is intentionally runtime-agnostic and contains no async code.
//! Dispatch, persistence and backing stores live in `mconf-center`.

pub mod config;
pub mod error;
pub mod key;
pub mod model;
pub mod registry;
pub mod structure;
pub mod url;

pub use config::{ConfigError, MconfSettings, RetrySettings};
pub use error::{KeyError, MconfError, Result};
pub use key::{PrefixKey, StoreLayout, SuffixKey};
pub use model::*;
pub use registry::{ConfStore, MemoryRegistry};
pub use structure::Structures;
pub use url::ConnectUrl;
