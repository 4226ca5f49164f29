//! # Flowtrace
//!
//! A provenance and replay engine for chains of generative-model calls.
//! Intercepted endpoint calls become nodes in a per-session graph; edges are
//! detected by matching prior outputs against later inputs, without any
//! cooperation from the code between the calls.
//!
//! ## Features
//!
//! - **Provenance Registry**: Tracked values carry origin sets linking them
//!   back to the call nodes that produced them
//! - **Boundary Contexts**: Explicit per-execution-unit propagation across
//!   foreign (uninstrumented) call boundaries
//! - **Content Matching**: Substring containment between recorded outputs and
//!   new inputs derives graph edges heuristically
//! - **Replay Cache**: Deterministic re-execution from fingerprint-keyed
//!   cached outputs, with user input/output overrides
//! - **Subruns**: Named nested scopes within a session, usable concurrently
//!   from forked contexts
//!
//! ## Architecture
//!
//! ```text
//! Instrumented Program → SessionCoordinator → SQLite (events + cache)
//!                              ↓
//!                        GraphEvent channel → external transport
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use flowtrace::{event_channel, Config, SessionCoordinator};
//! use flowtrace::storage::SqliteStorage;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env();
//!     flowtrace::config::init_logging(&config);
//!     let storage = Arc::new(SqliteStorage::new(&config.database).await?);
//!     let (events, _rx) = event_channel();
//!     let coordinator = SessionCoordinator::new(config, storage, events);
//!     let ctx = coordinator.start_session(Some("demo")).await;
//!     let recorded = coordinator
//!         .intercept_call(&ctx, "gpt-4", None, serde_json::json!({"prompt": "hi"}), |input| async move {
//!             Ok(serde_json::json!({"completion": "hello"}))
//!         })
//!         .await?;
//!     println!("node {}", recorded.node_id);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

/// Replay cache decisions over the fingerprint-keyed store.
pub mod cache;
/// Configuration management and logging setup.
pub mod config;
/// Boundary context and scope guard for foreign-call propagation.
pub mod context;
/// Error types and result aliases for the crate.
pub mod error;
/// Content-based edge detection between call outputs and inputs.
pub mod matcher;
/// Propagation API applied at instrumented program operations.
pub mod propagate;
/// Provenance registry mapping tracked values to origin sets.
pub mod registry;
/// Session coordination, subruns, and graph event emission.
pub mod session;
/// SQLite persistence for sessions, call events, and cache entries.
pub mod storage;
/// Tracked values, fragment extraction, and input fingerprinting.
pub mod value;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use session::{event_channel, GraphEvent, SessionContext, SessionCoordinator};
