//! Zanzibar-style relationship-based authorization engine
//!
//! This crate answers authorization questions over a graph of relationship
//! tuples, using per-namespace rewrite rules:
//! - Check: does a user hold a relation on an object?
//! - Expand: which identifiers hold a relation on an object?
//! - ListPermissions: which relations does a user hold, on which objects?
//! - BatchCheck: many checks at one consistency token, in order
//!
//! # Core Concepts
//!
//! - **Tuple**: a fact `namespace:object#relation@user`, where the user side is
//!   a user id, an object (`folders:root`) or a userset (`groups:eng#member`)
//! - **Rewrite rule**: how a relation's userset is computed from direct tuples,
//!   other relations on the same object, and relations on related objects
//! - **Consistency token**: an opaque marker pinning a request to one revision
//!   of the tuple store
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use zanzibar_engine::{
//!     AuthorizationEngine, CheckRequest, InMemoryTupleStore, NamespaceRegistry,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(InMemoryTupleStore::new());
//!     store.write("documents:doc123#owner@user456".parse()?);
//!
//!     let registry = Arc::new(NamespaceRegistry::with_defaults()?);
//!     let engine = AuthorizationEngine::new(store, registry);
//!
//!     let request = CheckRequest::new("documents", "doc123", "viewer", "user456");
//!     let result = engine.check(&request, None).await?;
//!     assert!(result.allowed);
//!
//!     // Follow-up checks against the same snapshot
//!     let again = engine.check(&request, Some(&result.token)).await?;
//!     assert_eq!(again.token, result.token);
//!
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod cache;
pub mod check;
pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod expand;
pub mod models;
pub mod permissions;
pub mod registry;
pub mod rewrite;
pub mod store;
pub mod telemetry;
pub mod token;

pub use cache::{CacheKey, InMemoryResultCache, NoopResultCache, RedisResultCache, ResultCache};
pub use config::{CacheBackend, CacheConfig, EngineConfig, LoggingConfig};
pub use engine::*;
pub use error::*;
pub use models::*;
pub use registry::{
    InMemoryNamespaceStore, NamespaceConfig, NamespaceConfigStore, NamespaceRegistry,
    RelationConfig,
};
pub use rewrite::UsersetExpression;
pub use store::{InMemoryTupleStore, Revision, TupleStore, WriteRequest};
pub use token::ConsistencyToken;
