//! Firestore REST API client for ReelPipe.
//!
//! This crate provides:
//! - A Firestore REST client whose bearer token comes from the auth guard
//! - Retry with backoff and jitter for transient failures
//! - The content session repository with compare-and-set writes keyed on
//!   the document update time

pub mod client;
pub mod error;
pub mod metrics;
pub mod retry;
pub mod session_repo;
pub mod types;


pub use client::{FirestoreClient, FirestoreConfig, WritePrecondition};
pub use error::{FirestoreError, FirestoreResult};
pub use retry::RetryConfig;
pub use session_repo::{SessionRepository, DEFAULT_SESSIONS_COLLECTION};
pub use types::{Document, Value};
