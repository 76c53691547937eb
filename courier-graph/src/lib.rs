//! Routing-graph build pipeline for the courier delivery platform.
//!
//! Turns the relational road network (segments, courier feedback, live
//! traffic) into per-variant routing graphs, drives the external
//! three-stage graph compiler over them, and manages the routing-engine
//! containers that serve the compiled outputs.

pub mod api;
pub mod cli;
pub mod config;
pub mod export;
pub mod ingest;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod profiles;
pub mod registry;
pub mod store;
pub mod weights;

pub use config::BuildConfig;
pub use model::{BuildRecord, BuildStatus};
pub use registry::BuildRegistry;
