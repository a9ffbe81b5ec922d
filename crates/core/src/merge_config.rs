//! Automerger configuration document.
//!
//! The document uses git-config syntax and lives in the review system's
//! configuration ref. Each propagation edge is keyed by
//! `"sourceBranch:destBranch"`, either as a subsection or as a dotted key:
//!
//! ```text
//! [automerger]
//!   master:ds_one.setProjects = platform/build
//! [automerger "master:ds_two"]
//!   setProjects = platform/build
//!   mergeAll = true
//! [global]
//!   blankMerge = .*DO NOT MERGE.*
//!   manifestProject = platform/manifest
//! ```
//!
//! Entries are parsed independently. A malformed entry discards only the edge
//! it belongs to; everything else still resolves.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use tracing::{debug, warn};

use crate::classifier::CommitClassifier;
use crate::errors::ConfigError;

const AUTOMERGER_SECTION: &str = "automerger";
const GLOBAL_SECTION: &str = "global";

/// Message left on a source change when a destination conflicts.
pub const DEFAULT_CONFLICT_MESSAGE: &str = "Merge conflict found on";

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

/// One configured `source -> destination` propagation rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagationEdge {
    pub source_branch: String,
    pub dest_branch: String,
    /// Projects the edge applies to. An edge with no projects applies nowhere.
    pub projects: BTreeSet<String>,
    /// Projects excluded even if listed in `projects`.
    pub ignore_projects: BTreeSet<String>,
    /// Merge content even when the change says "do not merge".
    pub merge_all: bool,
}

impl PropagationEdge {
    fn new(source_branch: &str, dest_branch: &str) -> Self {
        Self {
            source_branch: source_branch.to_string(),
            dest_branch: dest_branch.to_string(),
            projects: BTreeSet::new(),
            ignore_projects: BTreeSet::new(),
            merge_all: false,
        }
    }

    pub fn applies_to(&self, project: &str) -> bool {
        self.projects.contains(project) && !self.ignore_projects.contains(project)
    }
}

impl fmt::Display for PropagationEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source_branch, self.dest_branch)
    }
}

/// Settings from the `[global]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalSettings {
    pub blank_merge: Vec<String>,
    pub always_blank_merge: Vec<String>,
    pub conflict_message: Option<String>,
    pub manifest_project: Option<String>,
}

// ---------------------------------------------------------------------------
// Parsed document
// ---------------------------------------------------------------------------

/// A parsed automerger document.
#[derive(Debug, Clone, Default)]
pub struct AutomergerConfig {
    edges: Vec<PropagationEdge>,
    global: GlobalSettings,
    skipped: Vec<ConfigError>,
}

impl AutomergerConfig {
    /// Parse a document.
    ///
    /// Malformed entries are logged and recorded in
    /// [`skipped`](Self::skipped). The whole document only fails when it has
    /// content but not a single usable entry.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let (entries, mut errors) = tokenize(text);

        if entries.is_empty() {
            if let Some(first) = errors.first() {
                return Err(first.error.clone());
            }
        }

        let mut config = AutomergerConfig::default();
        let mut poisoned: HashSet<(String, String)> = HashSet::new();

        // Errors inside an edge section poison that edge.
        for err in &errors {
            if let Some(ref key) = err.edge_key {
                if let Ok(pair) = split_edge_key(key) {
                    poisoned.insert(pair);
                }
            }
        }

        for entry in &entries {
            match entry.section.as_str() {
                AUTOMERGER_SECTION => {
                    if let Err(err) = config.apply_edge_entry(entry) {
                        if let Some(pair) = entry.edge_key().and_then(|k| split_edge_key(&k).ok()) {
                            poisoned.insert(pair);
                        }
                        errors.push(Located::new(err, None));
                    }
                }
                GLOBAL_SECTION => config.apply_global_entry(entry),
                other => debug!(section = other, key = %entry.key, "ignoring unknown section"),
            }
        }

        if !poisoned.is_empty() {
            config.edges.retain(|e| {
                let bad = poisoned.contains(&(e.source_branch.clone(), e.dest_branch.clone()));
                if bad {
                    warn!(edge = %e, "discarding edge with malformed configuration");
                }
                !bad
            });
        }

        for err in &errors {
            warn!(error = %err.error, "skipping malformed automerger config entry");
        }
        config.skipped = errors.into_iter().map(|l| l.error).collect();

        debug!(edges = config.edges.len(), "automerger config parsed");
        Ok(config)
    }

    /// Every edge that applies to `project`, in document order.
    pub fn resolve(text: &str, project: &str) -> Result<Vec<PropagationEdge>, ConfigError> {
        let config = Self::parse(text)?;
        Ok(config
            .edges
            .into_iter()
            .filter(|e| e.applies_to(project))
            .collect())
    }

    /// Edges leaving `source_branch` that apply to `project`.
    pub fn edges_for(&self, source_branch: &str, project: &str) -> Vec<PropagationEdge> {
        self.edges
            .iter()
            .filter(|e| e.source_branch == source_branch && e.applies_to(project))
            .cloned()
            .collect()
    }

    /// All edges regardless of project.
    pub fn edges(&self) -> &[PropagationEdge] {
        &self.edges
    }

    /// Source branches with at least one edge for `project`.
    pub fn tracked_branches(&self, project: &str) -> BTreeSet<String> {
        self.edges
            .iter()
            .filter(|e| e.applies_to(project))
            .map(|e| e.source_branch.clone())
            .collect()
    }

    pub fn global(&self) -> &GlobalSettings {
        &self.global
    }

    /// Entries that were dropped while parsing.
    pub fn skipped(&self) -> &[ConfigError] {
        &self.skipped
    }

    /// Classifier built from the `[global]` marker patterns.
    pub fn classifier(&self) -> CommitClassifier {
        let (classifier, _) = CommitClassifier::from_patterns(
            &self.global.blank_merge,
            &self.global.always_blank_merge,
        );
        classifier
    }

    pub fn conflict_message(&self) -> &str {
        self.global
            .conflict_message
            .as_deref()
            .unwrap_or(DEFAULT_CONFLICT_MESSAGE)
    }

    fn apply_edge_entry(&mut self, entry: &Entry) -> Result<(), ConfigError> {
        let (edge_key, key) = match entry.subsection {
            Some(ref sub) => (sub.clone(), entry.key.clone()),
            None => match entry.key.rsplit_once('.') {
                Some((edge, key)) => (edge.to_string(), key.to_ascii_lowercase()),
                None => {
                    return Err(ConfigError::InvalidEdgeKey {
                        key: entry.key.clone(),
                        detail: format!("line {}: expected '<source>:<dest>.<key>'", entry.line),
                    })
                }
            },
        };
        let (source, dest) = split_edge_key(&edge_key)?;

        let idx = match self
            .edges
            .iter()
            .position(|e| e.source_branch == source && e.dest_branch == dest)
        {
            Some(idx) => idx,
            None => {
                self.edges.push(PropagationEdge::new(&source, &dest));
                self.edges.len() - 1
            }
        };
        let edge = &mut self.edges[idx];

        match key.as_str() {
            "setprojects" => {
                edge.projects.insert(entry.required_value()?.to_string());
            }
            "ignoreprojects" => {
                edge.ignore_projects.insert(entry.required_value()?.to_string());
            }
            "mergeall" => {
                edge.merge_all = parse_bool(entry.value.as_deref()).ok_or_else(|| {
                    ConfigError::InvalidValue {
                        field: format!("{edge_key}.mergeAll"),
                        detail: format!(
                            "line {}: '{}' is not a boolean",
                            entry.line,
                            entry.value.as_deref().unwrap_or_default()
                        ),
                    }
                })?;
            }
            other => debug!(edge = %edge_key, key = other, "ignoring unknown edge key"),
        }
        Ok(())
    }

    fn apply_global_entry(&mut self, entry: &Entry) {
        let Some(value) = entry.value.clone() else {
            debug!(key = %entry.key, "ignoring valueless global key");
            return;
        };
        match entry.key.as_str() {
            "blankmerge" => self.global.blank_merge.push(value),
            "alwaysblankmerge" => self.global.always_blank_merge.push(value),
            "conflictmessage" => self.global.conflict_message = Some(value),
            "manifestproject" => self.global.manifest_project = Some(value),
            other => debug!(key = other, "ignoring unknown global key"),
        }
    }
}

/// Split `"source:dest"` into its branch names.
fn split_edge_key(key: &str) -> Result<(String, String), ConfigError> {
    match key.split_once(':') {
        Some((src, dst)) if !src.is_empty() && !dst.is_empty() && !dst.contains(':') => {
            Ok((src.to_string(), dst.to_string()))
        }
        _ => Err(ConfigError::InvalidEdgeKey {
            key: key.to_string(),
            detail: "expected exactly one ':' between two branch names".into(),
        }),
    }
}

fn parse_bool(value: Option<&str>) -> Option<bool> {
    match value.map(|v| v.to_ascii_lowercase()) {
        None => Some(true),
        Some(v) => match v.as_str() {
            "true" | "yes" | "on" | "1" => Some(true),
            "false" | "no" | "off" | "0" | "" => Some(false),
            _ => None,
        },
    }
}

// ---------------------------------------------------------------------------
// git-config tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Entry {
    line: usize,
    /// Lowercased section name.
    section: String,
    /// Subsection, case preserved.
    subsection: Option<String>,
    /// Lowercased key, case preserved for dotted edge keys.
    key: String,
    /// `None` for a bare key (boolean true).
    value: Option<String>,
}

impl Entry {
    fn required_value(&self) -> Result<&str, ConfigError> {
        match self.value.as_deref().map(str::trim) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(ConfigError::InvalidValue {
                field: self.key.clone(),
                detail: format!("line {}: value required", self.line),
            }),
        }
    }

    fn edge_key(&self) -> Option<String> {
        match self.subsection {
            Some(ref sub) => Some(sub.clone()),
            None => self.key.rsplit_once('.').map(|(edge, _)| edge.to_string()),
        }
    }
}

/// An error plus the edge it belongs to, if any.
#[derive(Debug)]
struct Located {
    error: ConfigError,
    edge_key: Option<String>,
}

impl Located {
    fn new(error: ConfigError, edge_key: Option<String>) -> Self {
        Self { error, edge_key }
    }
}

fn tokenize(text: &str) -> (Vec<Entry>, Vec<Located>) {
    let mut entries = Vec::new();
    let mut errors = Vec::new();
    // `None` after a broken header: entries are dropped until the next one.
    let mut current: Option<(String, Option<String>)> = None;
    let mut saw_header = false;

    let mut lines = text.lines().enumerate().peekable();
    while let Some((idx, raw)) = lines.next() {
        let line_no = idx + 1;
        let mut line = raw.trim().to_string();

        // Backslash continuation joins the next physical line.
        while line.ends_with('\\') && !line.ends_with("\\\\") {
            line.pop();
            match lines.next() {
                Some((_, next)) => line.push_str(next.trim_start()),
                None => break,
            }
        }

        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if line.starts_with('[') {
            saw_header = true;
            match parse_section_header(&line) {
                Ok(header) => current = Some(header),
                Err(detail) => {
                    errors.push(Located::new(
                        ConfigError::MalformedLine {
                            line: line_no,
                            detail,
                        },
                        None,
                    ));
                    current = None;
                }
            }
            continue;
        }

        let Some((ref section, ref subsection)) = current else {
            if !saw_header {
                errors.push(Located::new(
                    ConfigError::MalformedLine {
                        line: line_no,
                        detail: "entry outside of any section".into(),
                    },
                    None,
                ));
            }
            continue;
        };

        let edge_key = if section == AUTOMERGER_SECTION {
            subsection.clone()
        } else {
            None
        };

        match parse_entry(&line) {
            Ok((key, value)) => {
                let key = if subsection.is_none() && key.contains('.') {
                    // Dotted edge keys keep branch-name case.
                    key
                } else {
                    key.to_ascii_lowercase()
                };
                entries.push(Entry {
                    line: line_no,
                    section: section.clone(),
                    subsection: subsection.clone(),
                    key,
                    value,
                });
            }
            Err(detail) => {
                let edge_key = edge_key.or_else(|| {
                    line.split('=')
                        .next()
                        .and_then(|k| k.trim().rsplit_once('.'))
                        .map(|(edge, _)| edge.to_string())
                });
                errors.push(Located::new(
                    ConfigError::MalformedLine {
                        line: line_no,
                        detail,
                    },
                    edge_key,
                ));
            }
        }
    }

    (entries, errors)
}

/// Parse `[section]`, `[section "subsection"]` or `[section.subsection]`.
fn parse_section_header(line: &str) -> Result<(String, Option<String>), String> {
    let inner = line.strip_prefix('[').ok_or("missing '['")?;
    let (name_part, rest) = match inner.find(|c: char| c == '"' || c == ']') {
        Some(pos) => inner.split_at(pos),
        None => return Err("unterminated section header".into()),
    };
    let name = name_part.trim();

    if rest.starts_with(']') {
        check_trailing(&rest[1..])?;
        if name.is_empty() {
            return Err("empty section name".into());
        }
        return match name.split_once('.') {
            Some((section, sub)) => Ok((section.to_ascii_lowercase(), Some(sub.to_string()))),
            None => {
                validate_section_name(name)?;
                Ok((name.to_ascii_lowercase(), None))
            }
        };
    }

    // Quoted subsection.
    validate_section_name(name)?;
    let mut sub = String::new();
    let mut chars = rest[1..].chars();
    loop {
        match chars.next() {
            Some('\\') => match chars.next() {
                Some(c) => sub.push(c),
                None => return Err("dangling escape in subsection".into()),
            },
            Some('"') => break,
            Some(c) => sub.push(c),
            None => return Err("unterminated subsection quote".into()),
        }
    }
    let tail: String = chars.collect();
    let tail = tail.trim_start();
    let after = tail
        .strip_prefix(']')
        .ok_or("expected ']' after subsection")?;
    check_trailing(after)?;
    Ok((name.to_ascii_lowercase(), Some(sub)))
}

fn validate_section_name(name: &str) -> Result<(), String> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(format!("invalid section name '{name}'"));
    }
    Ok(())
}

fn check_trailing(rest: &str) -> Result<(), String> {
    let rest = rest.trim();
    if rest.is_empty() || rest.starts_with('#') || rest.starts_with(';') {
        Ok(())
    } else {
        Err(format!("unexpected text after section header: '{rest}'"))
    }
}

/// Parse `key = value` or a bare `key`.
fn parse_entry(line: &str) -> Result<(String, Option<String>), String> {
    let (key, value) = match line.split_once('=') {
        Some((k, v)) => (k.trim(), Some(v)),
        None => {
            let key = line
                .split(['#', ';'])
                .next()
                .map(str::trim)
                .unwrap_or_default();
            (key, None)
        }
    };

    if key.is_empty() {
        return Err("missing key".into());
    }
    if key.chars().any(char::is_whitespace) {
        return Err(format!("invalid key '{key}'"));
    }

    let value = match value {
        Some(v) => Some(parse_value(v)?),
        None => None,
    };
    Ok((key.to_string(), value))
}

/// Unquote a value, honouring escapes and stripping trailing comments.
fn parse_value(raw: &str) -> Result<String, String> {
    let mut out = String::new();
    let mut in_quotes = false;
    // Length of `out` up to the last non-blank char outside quotes.
    let mut keep = 0;
    let mut chars = raw.trim_start().chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                keep = out.len();
            }
            '\\' => {
                let escaped = match chars.next() {
                    Some('n') => '\n',
                    Some('t') => '\t',
                    Some('b') => '\u{8}',
                    Some('"') => '"',
                    Some('\\') => '\\',
                    Some(other) => return Err(format!("unknown escape '\\{other}'")),
                    None => return Err("dangling escape".into()),
                };
                out.push(escaped);
                keep = out.len();
            }
            '#' | ';' if !in_quotes => break,
            c => {
                out.push(c);
                if in_quotes || !c.is_whitespace() {
                    keep = out.len();
                }
            }
        }
    }

    if in_quotes {
        return Err("unterminated quote".into());
    }
    out.truncate(keep);
    Ok(out)
}
