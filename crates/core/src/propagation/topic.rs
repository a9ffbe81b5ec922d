//! Topic bookkeeping for propagation groups.
//!
//! A source change and every change propagated from it share one topic, so
//! the whole group can be found with a single topic query and submitted
//! together. When a human renames the topic on any member, the rename is
//! applied to the rest of the group.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::review::{topic_query, ChangeInfo, ChangeNumber, ReviewApi, ReviewResult};

/// Prefix of topics the engine generates for changes without one.
pub const GENERATED_TOPIC_PREFIX: &str = "am-";

/// Outcome of a topic rename.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TopicSyncReport {
    /// The topic the group now carries, if any.
    pub topic: Option<String>,
    /// Other group members found under the old topic.
    pub members: Vec<ChangeNumber>,
    /// Members whose topic was rewritten.
    pub updated: Vec<ChangeNumber>,
}

pub struct TopicSynchronizer {
    review: Arc<dyn ReviewApi>,
}

impl TopicSynchronizer {
    pub fn new(review: Arc<dyn ReviewApi>) -> Self {
        Self { review }
    }

    /// The change's topic, assigning a generated one if it has none.
    pub async fn ensure_topic(&self, change: &ChangeInfo) -> ReviewResult<String> {
        if let Some(topic) = change.topic.as_deref().filter(|t| !t.is_empty()) {
            return Ok(topic.to_string());
        }
        let topic = format!("{GENERATED_TOPIC_PREFIX}{}", Uuid::new_v4());
        self.review.set_topic(change.number, &topic).await?;
        info!(change = change.number, %topic, "assigned topic");
        Ok(topic)
    }

    /// Every change under `topic`, escaped for the query language.
    pub async fn members(&self, topic: &str) -> ReviewResult<Vec<ChangeInfo>> {
        self.review.query_changes(&topic_query(topic)).await
    }

    /// Apply a rename of `change`'s topic from `old_topic` to the rest of
    /// its group.
    ///
    /// Only changes linked to `change` through propagation are touched, so
    /// unrelated changes that happen to share the old topic keep it. Members
    /// already carrying the new topic are skipped, which makes redelivery of
    /// the same rename a no-op.
    #[instrument(skip(self, change), fields(change = change.number))]
    pub async fn on_topic_changed(
        &self,
        change: &ChangeInfo,
        old_topic: Option<&str>,
    ) -> ReviewResult<TopicSyncReport> {
        let mut report = TopicSyncReport {
            topic: change.topic.clone(),
            ..TopicSyncReport::default()
        };

        let Some(new_topic) = change.topic.as_deref().filter(|t| !t.is_empty()) else {
            info!("topic removed, leaving group members as they are");
            return Ok(report);
        };
        let Some(old_topic) = old_topic.filter(|t| !t.is_empty()) else {
            debug!("no previous topic, nothing to carry over");
            return Ok(report);
        };
        if old_topic == new_topic {
            return Ok(report);
        }

        let candidates = self.members(old_topic).await?;
        let group = linked_group(change, &candidates);
        report.members = group.iter().map(|c| c.number).collect();

        for member in group {
            if member.topic.as_deref() == Some(new_topic) {
                continue;
            }
            self.review.set_topic(member.number, new_topic).await?;
            report.updated.push(member.number);
        }

        info!(
            old = old_topic,
            new = new_topic,
            updated = report.updated.len(),
            "topic rename propagated"
        );
        Ok(report)
    }
}

/// Candidates connected to `root` through propagation footers, excluding
/// `root` itself.
fn linked_group<'c>(root: &ChangeInfo, candidates: &'c [ChangeInfo]) -> Vec<&'c ChangeInfo> {
    let mut neighbours: HashMap<ChangeNumber, Vec<ChangeNumber>> = HashMap::new();
    let mut link = |a: ChangeNumber, b: ChangeNumber| {
        neighbours.entry(a).or_default().push(b);
        neighbours.entry(b).or_default().push(a);
    };
    if let Some(parent) = root.automerged_from() {
        link(root.number, parent);
    }
    for c in candidates {
        if let Some(parent) = c.automerged_from() {
            link(c.number, parent);
        }
    }

    let mut seen = BTreeSet::from([root.number]);
    let mut queue = VecDeque::from([root.number]);
    while let Some(n) = queue.pop_front() {
        for &next in neighbours.get(&n).into_iter().flatten() {
            if seen.insert(next) {
                queue.push_back(next);
            }
        }
    }

    candidates
        .iter()
        .filter(|c| c.number != root.number && seen.contains(&c.number))
        .collect()
}
