//! Gerrit REST API client.
//!
//! All calls use the authenticated `/a/` endpoints with HTTP basic auth.
//! Responses carry the `)]}'` XSSI guard line, which is stripped before
//! JSON decoding.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::errors::ReviewError;
use crate::review::*;

const XSSI_PREFIX: &str = ")]}'";

/// Options requested on every change read.
const CHANGE_OPTIONS: [(&str, &str); 4] = [
    ("o", "CURRENT_REVISION"),
    ("o", "CURRENT_COMMIT"),
    ("o", "DETAILED_LABELS"),
    ("o", "DETAILED_ACCOUNTS"),
];

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct GerritChange {
    #[serde(rename = "_number")]
    number: ChangeNumber,
    project: String,
    branch: String,
    #[serde(default)]
    topic: Option<String>,
    subject: String,
    status: ChangeStatus,
    #[serde(default)]
    current_revision: Option<String>,
    #[serde(default)]
    revisions: HashMap<String, GerritRevision>,
    #[serde(default)]
    labels: BTreeMap<String, GerritLabel>,
}

#[derive(Debug, Clone, Deserialize)]
struct GerritRevision {
    #[serde(rename = "_number")]
    number: u32,
    #[serde(default)]
    commit: Option<GerritCommit>,
}

#[derive(Debug, Clone, Deserialize)]
struct GerritCommit {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GerritLabel {
    #[serde(default)]
    all: Vec<GerritApproval>,
    /// Keys like `"-2"`, `" 0"`, `"+1"`.
    #[serde(default)]
    values: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GerritApproval {
    #[serde(rename = "_account_id", default)]
    account_id: Option<u64>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    value: Option<i32>,
    #[serde(default)]
    tag: Option<String>,
}

impl GerritChange {
    fn into_change_info(self) -> ChangeInfo {
        let current = self
            .current_revision
            .as_ref()
            .and_then(|sha| self.revisions.get(sha));
        let revision_number = current.map_or(0, |r| r.number);
        let message = current
            .and_then(|r| r.commit.as_ref())
            .map_or_else(|| self.subject.clone(), |c| c.message.clone());

        let labels = self
            .labels
            .into_iter()
            .map(|(name, label)| {
                let range: Vec<i32> = label
                    .values
                    .keys()
                    .filter_map(|k| k.trim().trim_start_matches('+').parse().ok())
                    .collect();
                let votes = label
                    .all
                    .into_iter()
                    .filter_map(|a| {
                        let account = a
                            .username
                            .or_else(|| a.account_id.map(|id| id.to_string()))?;
                        Some(Vote {
                            account,
                            value: a.value?,
                            tag: a.tag,
                        })
                    })
                    .collect();
                let info = LabelInfo {
                    min: range.iter().copied().min().unwrap_or(0),
                    max: range.iter().copied().max().unwrap_or(0),
                    votes,
                };
                (name, info)
            })
            .collect();

        ChangeInfo {
            number: self.number,
            project: self.project,
            branch: self.branch,
            topic: self.topic.filter(|t| !t.is_empty()),
            subject: self.subject,
            status: self.status,
            current_revision: self.current_revision.unwrap_or_default(),
            revision_number,
            message,
            labels,
        }
    }
}

#[derive(Debug, Serialize)]
struct MergeInput<'a> {
    source: &'a str,
    strategy: MergeStrategy,
    allow_conflicts: bool,
}

#[derive(Debug, Serialize)]
struct ChangeInput<'a> {
    project: &'a str,
    branch: &'a str,
    /// Gerrit uses this as the full commit message.
    subject: &'a str,
    topic: &'a str,
    base_commit: &'a str,
    merge: MergeInput<'a>,
}

#[derive(Debug, Serialize)]
struct MergePatchSetInput<'a> {
    subject: &'a str,
    inherit_parent: bool,
    merge: MergeInput<'a>,
}

#[derive(Debug, Serialize)]
struct ReviewInput<'a> {
    labels: BTreeMap<&'a str, i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tag: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Where the automerger document lives on the server.
#[derive(Debug, Clone)]
pub struct ConfigLocation {
    pub project: String,
    pub refname: String,
    pub file: String,
}

/// Asynchronous Gerrit REST client.
///
/// Gerrit builds merge commits server-side from a [`MergeRevision`]'s source
/// commit and strategy; the locally computed commit is used for logging and
/// conflict detection only.
#[derive(Clone)]
pub struct GerritClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    config: ConfigLocation,
}

impl GerritClient {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        config: ConfigLocation,
    ) -> ReviewResult<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("automerger/", env!("CARGO_PKG_VERSION"))),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;
        info!(base_url = %base_url, "created GerritClient");
        Ok(Self {
            http,
            base_url,
            username: username.into(),
            password: password.into(),
            config,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/a/{}", self.base_url, path)
    }

    async fn fetch_change(&self, number: ChangeNumber) -> ReviewResult<ChangeInfo> {
        let resp = self
            .http
            .get(self.url(&format!("changes/{number}")))
            .basic_auth(&self.username, Some(&self.password))
            .query(&CHANGE_OPTIONS)
            .send()
            .await?;
        let change: GerritChange = read_json(check_response(resp).await?).await?;
        Ok(change.into_change_info())
    }
}

#[async_trait]
impl ReviewApi for GerritClient {
    #[instrument(skip(self))]
    async fn get_change(&self, number: ChangeNumber) -> ReviewResult<ChangeInfo> {
        let change = self.fetch_change(number).await?;
        debug!(number, revision = change.revision_number, "fetched change");
        Ok(change)
    }

    #[instrument(skip(self))]
    async fn query_changes(&self, query: &str) -> ReviewResult<Vec<ChangeInfo>> {
        let resp = self
            .http
            .get(self.url("changes/"))
            .basic_auth(&self.username, Some(&self.password))
            .query(&[("q", query)])
            .query(&CHANGE_OPTIONS)
            .send()
            .await?;
        let changes: Vec<GerritChange> = read_json(check_response(resp).await?).await?;
        debug!(count = changes.len(), "query returned");
        Ok(changes.into_iter().map(GerritChange::into_change_info).collect())
    }

    #[instrument(skip(self, change), fields(project = %change.project, branch = %change.branch))]
    async fn create_change(&self, change: NewChange) -> ReviewResult<ChangeInfo> {
        let input = ChangeInput {
            project: &change.project,
            branch: &change.branch,
            subject: &change.revision.message,
            topic: &change.topic,
            base_commit: &change.revision.base_commit,
            merge: MergeInput {
                source: &change.revision.source_commit,
                strategy: change.revision.strategy,
                allow_conflicts: false,
            },
        };
        let resp = self
            .http
            .post(self.url("changes/"))
            .basic_auth(&self.username, Some(&self.password))
            .json(&input)
            .send()
            .await?;
        let created: GerritChange = read_json(check_response(resp).await?).await?;
        info!(number = created.number, "created change");
        self.fetch_change(created.number).await
    }

    #[instrument(skip(self, revision))]
    async fn append_revision(
        &self,
        number: ChangeNumber,
        revision: MergeRevision,
    ) -> ReviewResult<ChangeInfo> {
        let input = MergePatchSetInput {
            subject: &revision.message,
            inherit_parent: false,
            merge: MergeInput {
                source: &revision.source_commit,
                strategy: revision.strategy,
                allow_conflicts: false,
            },
        };
        let resp = self
            .http
            .post(self.url(&format!("changes/{number}/merge")))
            .basic_auth(&self.username, Some(&self.password))
            .json(&input)
            .send()
            .await?;
        check_response(resp).await?;
        info!(number, "appended merge patchset");
        self.fetch_change(number).await
    }

    #[instrument(skip(self, vote), fields(label = %vote.label, value = vote.value))]
    async fn set_vote(&self, number: ChangeNumber, vote: VoteInput) -> ReviewResult<()> {
        let mut labels = BTreeMap::new();
        labels.insert(vote.label.as_str(), vote.value);
        let input = ReviewInput {
            labels,
            tag: vote.tag.as_deref(),
            message: vote.message.as_deref(),
        };
        let resp = self
            .http
            .post(self.url(&format!("changes/{number}/revisions/current/review")))
            .basic_auth(&self.username, Some(&self.password))
            .json(&input)
            .send()
            .await?;
        check_response(resp).await?;
        debug!(number, "vote set");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_topic(&self, number: ChangeNumber, topic: &str) -> ReviewResult<()> {
        let url = self.url(&format!("changes/{number}/topic"));
        let req = if topic.is_empty() {
            self.http.delete(&url)
        } else {
            self.http
                .put(&url)
                .json(&serde_json::json!({ "topic": topic }))
        };
        let resp = req
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        check_response(resp).await?;
        debug!(number, "topic set");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn config_document(&self) -> ReviewResult<Option<String>> {
        let path = format!(
            "projects/{}/branches/{}/files/{}/content",
            urlencoding::encode(&self.config.project),
            urlencoding::encode(&self.config.refname),
            urlencoding::encode(&self.config.file),
        );
        let resp = self
            .http
            .get(self.url(&path))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            warn!(project = %self.config.project, file = %self.config.file, "no automerger config");
            return Ok(None);
        }
        let body = check_response(resp).await?.text().await?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(body.trim())
            .map_err(|e| ReviewError::ParseError(format!("config content is not base64: {e}")))?;
        let text = String::from_utf8(decoded)
            .map_err(|e| ReviewError::ParseError(format!("config is not UTF-8: {e}")))?;
        Ok(Some(text))
    }
}

/// Map non-success responses onto [`ReviewError`].
async fn check_response(resp: Response) -> ReviewResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let body = body.trim().to_string();
    Err(match status.as_u16() {
        401 | 403 => ReviewError::AuthenticationFailed(format!("HTTP {status}: {body}")),
        404 => ReviewError::NotFound(body),
        409 => ReviewError::Conflict(body),
        429 | 502 | 503 | 504 => ReviewError::Unavailable(format!("HTTP {status}")),
        code => ReviewError::ApiError { status: code, body },
    })
}

async fn read_json<T: DeserializeOwned>(resp: Response) -> ReviewResult<T> {
    let text = resp.text().await?;
    parse_json(&text)
}

fn parse_json<T: DeserializeOwned>(text: &str) -> ReviewResult<T> {
    let body = text.trim_start().strip_prefix(XSSI_PREFIX).unwrap_or(text);
    serde_json::from_str(body).map_err(|e| ReviewError::ParseError(e.to_string()))
}
