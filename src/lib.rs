//! Live win-probability engine
//!
//! Ingests per-play model predictions, smooths them per game, persists them to
//! a week-partitioned cold store and fans live updates out to stream clients.
//! Replays of stored games run through the same stream surface.

pub mod api;
pub mod cache;
pub mod calendar;
pub mod config;
pub mod drift;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod pipeline;
pub mod replay;
pub mod search;
pub mod smoother;
pub mod storage;

pub use config::EngineConfig;
pub use engine::Engine;
