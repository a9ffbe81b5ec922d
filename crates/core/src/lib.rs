//! Automerger core library.
//!
//! This crate provides the building blocks for propagating reviewed changes
//! from one branch to others on a code review server: the propagation
//! configuration, commit classification, three-way tree merges, the review
//! server abstraction, and the event-driven propagation engine.

pub mod classifier;
pub mod config;
pub mod errors;
pub mod merge;
pub mod merge_config;
pub mod propagation;
pub mod review;
pub mod vcs;

// Re-exports for convenience.
pub use classifier::{ChangeIntent, CommitClassifier};
pub use config::ServiceConfig;
pub use merge_config::{AutomergerConfig, PropagationEdge};
pub use propagation::{Automerger, EventOutcome, ReviewEvent};
pub use review::{GerritClient, MemoryReview, ReviewApi};
pub use vcs::GitStore;
