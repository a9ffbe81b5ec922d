//! Merging a source commit onto a destination branch.

pub mod detector;
pub mod engine;
pub mod merger;

pub use detector::{ConflictType, PathConflict};
pub use engine::{MergeAttemptEngine, MergeInputs, MergeOutcome};
pub use merger::{MergeResult, Merger};
