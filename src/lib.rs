//! Compositor - zero-downtime container deployments behind a path-routed proxy
//!
//! This library provides:
//! - A registration API that accepts an image archive per route name
//! - Two container backends (namespaced registries, or one container per port)
//! - A swap protocol that brings the new version live before retiring the old
//!   one, destroying it only after its in-flight requests have drained
//! - An ingress that routes `/<route>/<rest>` to the live backend of `<route>`
//! - A thin boundary over the multipass VM command-line tool

pub mod api;
pub mod backend;
pub mod bridge;
pub mod config;
pub mod context;
pub mod deploy;
pub mod docker;
pub mod drain;
pub mod error;
pub mod pool;
pub mod ports;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod vm;
