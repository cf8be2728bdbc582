//! imagetiles - image metadata store for the tiling service
//!
//! This library crate exposes configuration loading and the chart view
//! placement helpers for the binary and integration tests. The store itself
//! lives in `imagetiles-db`.

pub mod config;
pub mod view;
