//! `automerger trial-merge`: run one merge attempt against a local
//! repository and report what propagation would produce. Nothing is written.

use std::path::Path;

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};

use automerger_core::classifier::ChangeIntent;
use automerger_core::merge::{MergeAttemptEngine, MergeInputs, MergeOutcome};
use automerger_core::vcs::{CommitIdentity, GitStore, Snapshot};
use automerger_core::CommitClassifier;

use crate::style;

/// A single-repository store ignores the project name.
const LOCAL: &str = "local";

pub fn run(
    repo: &Path,
    source: &str,
    dest: &str,
    merge_all: bool,
    classifier: &CommitClassifier,
) -> Result<()> {
    let store = GitStore::single(repo, CommitIdentity::default());
    let (intent, outcome) = attempt(&store, source, dest, merge_all, classifier)?;

    println!("{}", style::header(&format!("Trial merge of {source} into {dest}")));
    println!("  Intent    : {intent}");
    println!("  Merge all : {}", if merge_all { "yes" } else { "no" });
    println!();

    match outcome {
        MergeOutcome::Clean { tree } => {
            println!("{}", style::success(&format!("clean merge, {} files", tree.len())));
            Ok(())
        }
        MergeOutcome::Blank { reverted, .. } => {
            println!(
                "{}",
                style::warn("blank merge: the destination keeps its content")
            );
            if !reverted.is_empty() {
                let mut table = Table::new();
                table.load_preset(UTF8_FULL);
                table.set_content_arrangement(ContentArrangement::Dynamic);
                table.set_header(vec!["Path", "Change withheld", "+", "-"]);
                for delta in &reverted {
                    table.add_row(vec![
                        Cell::new(&delta.path),
                        Cell::new(delta.kind),
                        Cell::new(delta.lines_added),
                        Cell::new(delta.lines_deleted),
                    ]);
                }
                println!("{table}");
            }
            Ok(())
        }
        MergeOutcome::Conflict { paths } => {
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec!["Path", "Conflict"]);
            for conflict in &paths {
                table.add_row(vec![
                    Cell::new(&conflict.path),
                    Cell::new(conflict.kind).fg(comfy_table::Color::Red),
                ]);
            }
            println!("{table}");
            anyhow::bail!("{} conflicting paths", paths.len())
        }
    }
}

/// Merge `source` (a branch or commit) onto the tip of `dest`.
fn attempt(
    store: &GitStore,
    source: &str,
    dest: &str,
    merge_all: bool,
    classifier: &CommitClassifier,
) -> Result<(ChangeIntent, MergeOutcome)> {
    let source_sha = store
        .branch_tip(LOCAL, source)
        .unwrap_or_else(|_| source.to_string());
    let info = store
        .commit_info(LOCAL, &source_sha)
        .with_context(|| format!("cannot read source commit {source}"))?;
    let dest_tip = store
        .branch_tip(LOCAL, dest)
        .with_context(|| format!("cannot resolve destination branch {dest}"))?;

    let source_tree = store.snapshot(LOCAL, &info.sha)?;
    let parent_tree = match info.parents.first() {
        Some(parent) => store.snapshot(LOCAL, parent)?,
        None => Snapshot::new(),
    };
    let dest_tree = store.snapshot(LOCAL, &dest_tip)?;
    let base = match store.merge_base(LOCAL, &info.sha, &dest_tip)? {
        Some(sha) => store.snapshot(LOCAL, &sha)?,
        None => Snapshot::new(),
    };

    let intent = classifier.classify(&info.message);
    let outcome = MergeAttemptEngine::attempt(
        &MergeInputs {
            base: &base,
            dest_tip: &dest_tree,
            source: &source_tree,
            source_parent: &parent_tree,
        },
        intent,
        merge_all,
    );
    Ok((intent, outcome))
}
