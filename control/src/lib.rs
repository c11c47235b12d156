//! silta control plane library.
//!
//! Watches ConfigMaps, Services, Endpoints and Nodes in a single namespace,
//! reconciles declared virtual servers against backend state, and emits the
//! consolidated configuration through a [`writer::ConfigWriter`].

pub mod config;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod parser;
pub mod virtual_server;
pub mod watch;
pub mod writer;
