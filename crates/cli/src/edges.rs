//! `automerger edges`: the edges that apply to a project.

use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};

use automerger_core::{AutomergerConfig, PropagationEdge};

use crate::style;

pub fn run(doc: &AutomergerConfig, project: &str, source: Option<&str>) {
    let edges = select(doc, project, source);

    for skipped in doc.skipped() {
        println!("{}", style::warn(&format!("skipped entry: {skipped}")));
    }

    if edges.is_empty() {
        println!("No edges apply to {project}.");
        return;
    }

    println!();
    println!("{}", style::header(&format!("Edges for {project}")));
    println!();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Source", "Destination", "Merge all"]);

    for edge in &edges {
        let merge_all = if edge.merge_all {
            Cell::new("yes").fg(comfy_table::Color::Yellow)
        } else {
            Cell::new("no")
        };
        table.add_row(vec![
            Cell::new(&edge.source_branch),
            Cell::new(&edge.dest_branch),
            merge_all,
        ]);
    }

    println!("{table}");
    println!();
    println!(
        "{}",
        style::dim(&format!(
            "{} tracked branches",
            doc.tracked_branches(project).len()
        ))
    );
}

/// Edges applying to `project`, optionally only those leaving `source`.
fn select(doc: &AutomergerConfig, project: &str, source: Option<&str>) -> Vec<PropagationEdge> {
    match source {
        Some(branch) => doc.edges_for(branch, project),
        None => doc
            .edges()
            .iter()
            .filter(|e| e.applies_to(project))
            .cloned()
            .collect(),
    }
}
