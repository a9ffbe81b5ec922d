//! Line-based three-way text merge.
//!
//! Uses the `diffy` crate to merge a destination ("ours") and a source
//! ("theirs") version of a file against their common ancestor.

use tracing::debug;

/// The result of a three-way merge attempt.
#[derive(Debug, Clone)]
pub struct MergeResult {
    /// The merged content, with conflict markers when `has_conflicts` is set.
    pub merged_content: String,
    pub has_conflicts: bool,
    /// Number of `<<<<<<<` regions in `merged_content`.
    pub conflict_regions: usize,
}

impl MergeResult {
    fn clean(content: &str) -> Self {
        Self {
            merged_content: content.to_string(),
            has_conflicts: false,
            conflict_regions: 0,
        }
    }
}

/// Stateless three-way merge engine.
pub struct Merger;

impl Merger {
    /// Merge `ours` and `theirs` against `base`.
    ///
    /// The result always carries content. A conflicted merge contains
    /// standard `<<<<<<<` / `=======` / `>>>>>>>` markers.
    pub fn three_way_merge(base: &str, ours: &str, theirs: &str) -> MergeResult {
        // Fast path: if either side is identical to base, the other side wins cleanly.
        if ours == base {
            debug!("ours == base, theirs wins cleanly");
            return MergeResult::clean(theirs);
        }
        if theirs == base || ours == theirs {
            debug!("theirs adds nothing new, ours wins cleanly");
            return MergeResult::clean(ours);
        }

        match diffy::merge(base, ours, theirs) {
            Ok(merged) => {
                debug!("clean line merge");
                MergeResult::clean(&merged)
            }
            Err(conflicted) => {
                let conflict_regions = conflicted
                    .lines()
                    .filter(|l| l.starts_with("<<<<<<<"))
                    .count();
                debug!(conflict_regions, "line merge has conflicts");
                MergeResult {
                    merged_content: conflicted,
                    has_conflicts: true,
                    conflict_regions,
                }
            }
        }
    }
}
