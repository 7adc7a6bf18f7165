//! Posture Collector - security and compliance telemetry collector
//!
//! Pulls data from SaaS vendor APIs, flattens it into declared tabular
//! datasets and replaces those datasets in every configured sink. Every
//! expected dataset always materializes, even when its vendor is not
//! configured or returned nothing.
//!
//! # Architecture
//!
//! ```text
//! Runner ──► Plugin ──► Gate ──► Fetcher ──► RowBuffer ──► SinkWriter ──► sinks
//!               │                                              ▲
//!               └────────── write_blank (nothing stored) ──────┘
//! ```
//!
//! Plugins are registered statically and run one at a time; sinks and
//! alert channels are pluggable via traits.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod alert;
pub mod buffer;
pub mod config;
pub mod context;
pub mod error;
pub mod fetch;
pub mod gate;
pub mod metrics;
pub mod plugins;
pub mod pool;
pub mod registry;
pub mod runner;
pub mod schema;
pub mod sink;

pub use config::Config;
pub use context::EngineContext;
pub use error::{CollectorError, Result};
pub use registry::{Plugin, PluginRegistry};
pub use runner::{RunSummary, Runner};
