//! Vote propagation between a source change and its downstream changes.
//!
//! Votes flow in two directions and each direction has its own operation:
//! [`VotePropagator::mirror_downstream`] copies label values from a source
//! onto its downstreams, [`VotePropagator::block_upstream`] puts a blocking
//! vote on a source whose merge conflicted somewhere.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::config::PropagationConfig;
use crate::review::{
    ChangeInfo, ChangeNumber, ReviewApi, ReviewResult, VoteInput, AUTOMERGER_TAG,
    MERGE_CONFLICT_TAG,
};

/// Fallback when the conflict label is not defined on the change.
const DEFAULT_BLOCKING_VALUE: i32 = -2;

pub struct VotePropagator {
    review: Arc<dyn ReviewApi>,
    labels: Vec<String>,
    conflict_label: String,
}

impl VotePropagator {
    pub fn new(review: Arc<dyn ReviewApi>, settings: &PropagationConfig) -> Self {
        Self {
            review,
            labels: settings.mirror_labels.clone(),
            conflict_label: settings.conflict_label.clone(),
        }
    }

    /// Copy the source's current label values onto each downstream change.
    ///
    /// Writes are skipped where the downstream already carries the same
    /// machine vote, and where it is blocked by its own merge conflict.
    /// Returns the number of votes written.
    #[instrument(skip(self, source), fields(source = source.number))]
    pub async fn mirror_downstream(
        &self,
        source: &ChangeInfo,
        downstream: &[ChangeNumber],
    ) -> ReviewResult<usize> {
        let mut written = 0;

        for &number in downstream {
            let target = self.review.get_change(number).await?;

            for label in &self.labels {
                let Some(source_label) = source.label(label) else {
                    debug!(label, "label not on source, skipping");
                    continue;
                };
                let Some(target_label) = target.label(label) else {
                    debug!(label, number, "label not on downstream, skipping");
                    continue;
                };
                if target_label.tagged(MERGE_CONFLICT_TAG).is_some() {
                    debug!(label, number, "downstream blocked by its own conflict");
                    continue;
                }

                let value = source_label.value();
                if target_label.tagged(AUTOMERGER_TAG).map(|v| v.value) == Some(value) {
                    continue;
                }

                self.review
                    .set_vote(
                        number,
                        VoteInput {
                            label: label.clone(),
                            value,
                            tag: Some(AUTOMERGER_TAG.to_string()),
                            message: None,
                        },
                    )
                    .await?;
                debug!(label, value, number, "mirrored vote");
                written += 1;
            }
        }

        if written > 0 {
            info!(written, targets = downstream.len(), "mirrored votes downstream");
        }
        Ok(written)
    }

    /// Block the source change with the most negative value of the conflict
    /// label, tagged as a merge conflict.
    #[instrument(skip(self, source, message), fields(source = source.number))]
    pub async fn block_upstream(&self, source: &ChangeInfo, message: &str) -> ReviewResult<()> {
        let label = source.label(&self.conflict_label);
        let value = match label {
            Some(l) => l.min,
            None => {
                warn!(label = %self.conflict_label, "conflict label missing, using default");
                DEFAULT_BLOCKING_VALUE
            }
        };

        if label
            .and_then(|l| l.tagged(MERGE_CONFLICT_TAG))
            .is_some_and(|v| v.value == value)
        {
            debug!("source already blocked");
            return Ok(());
        }

        self.review
            .set_vote(
                source.number,
                VoteInput {
                    label: self.conflict_label.clone(),
                    value,
                    tag: Some(MERGE_CONFLICT_TAG.to_string()),
                    message: Some(message.to_string()),
                },
            )
            .await?;
        info!(value, "blocked source change on merge conflict");
        Ok(())
    }

    /// Re-apply the machine votes `previous` carried onto the new revision
    /// of change `number`.
    pub async fn carry_forward(
        &self,
        previous: &ChangeInfo,
        number: ChangeNumber,
    ) -> ReviewResult<usize> {
        let mut written = 0;
        for (label, info) in &previous.labels {
            let Some(vote) = info.tagged(AUTOMERGER_TAG) else {
                continue;
            };
            self.review
                .set_vote(
                    number,
                    VoteInput {
                        label: label.clone(),
                        value: vote.value,
                        tag: Some(AUTOMERGER_TAG.to_string()),
                        message: None,
                    },
                )
                .await?;
            written += 1;
        }
        debug!(number, written, "carried machine votes forward");
        Ok(written)
    }
}
