//! Shared configuration types and JSON value helpers for the qproxy core.
//!
//! This crate intentionally does **not** depend on the runtime or any HTTP
//! client. The external config loader produces a [`Config`]; the routing
//! core only reads it.

mod config;
mod value;

pub use config::{AliasEntry, Config, RoutingConfig, RoutingStrategy};
pub use value::{parse_rfc3339, read_bool, read_f64, read_i64, value_string};
