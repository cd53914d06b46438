//! GitHub Comment Action - writes comments on commits and pull requests.
//!
//! The rendered `heading` is written as a markdown heading at the top of the
//! comment and is also how earlier comments from the same rule are found:
//! any comment that starts with the same heading line is considered stale.
//!
//! Flow for one event:
//!
//! 1. optionally delete stale comments on every commit of the pull request
//! 2. optionally delete stale pull request comments
//! 3. write the commit comment, skipped if an identical one already exists
//! 4. write the pull request comment when `prNumber` is positive

use super::http::send_with_retries;
use super::{Action, ActionContext, ActionError, PropertySpec};
use crate::event::Event;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

/// Public GitHub API
pub const DEFAULT_API_URL: &str = "https://api.github.com";

const USER_AGENT: &str = "event-reactor";
const ACCEPT: &str = "application/vnd.github+json";
const MAX_RETRIES: u32 = 3;

const PROPERTIES: &[PropertySpec] = &[
    PropertySpec::required(
        "token",
        "GitHub token allowed to read and write comments on the repository",
    ),
    PropertySpec::required("org", "Organization or owner of the repository"),
    PropertySpec::required("repo", "Repository name"),
    PropertySpec::required("commitSha", "Commit to comment on. Rendered as a template."),
    PropertySpec::optional(
        "prNumber",
        "Pull request to comment on. Nothing is written to a pull request when empty or 0.",
    ),
    PropertySpec::optional(
        "heading",
        "Heading of the comment, also used to find earlier comments. Rendered as a template.",
    ),
    PropertySpec::required("body", "Body of the comment. Rendered as a template."),
    PropertySpec::optional(
        "enterpriseUrl",
        "GitHub Enterprise base url; the API is expected under /api/v3",
    ),
    PropertySpec::optional(
        "removeExistingPullRequestComments",
        "Delete earlier pull request comments with the same heading. Defaults to true.",
    ),
    PropertySpec::optional(
        "removeExistingCommentsFromAllPullRequestCommits",
        "Delete earlier comments with the same heading from every commit of the pull request. Defaults to false.",
    ),
    PropertySpec::optional(
        "removeDuplicateCommitComments",
        "Skip the commit comment when an identical one exists. Defaults to true.",
    ),
];

#[derive(Debug, Deserialize)]
struct Comment {
    id: u64,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct Commit {
    sha: String,
}

/// Comment text for `heading` and `body`.
fn compose(heading: &str, body: &str) -> String {
    if heading.trim().is_empty() {
        body.to_string()
    } else {
        format!("## {}\n\n{}", heading.trim(), body)
    }
}

/// Whether `comment` was written under `heading`.
fn has_heading(comment: &str, heading: &str) -> bool {
    let heading = heading.trim();
    !heading.is_empty()
        && comment
            .lines()
            .next()
            .is_some_and(|line| line.trim() == format!("## {}", heading))
}

/// API base for an optional enterprise url.
fn api_base(enterprise_url: &str) -> String {
    let enterprise_url = enterprise_url.trim().trim_end_matches('/');
    if enterprise_url.is_empty() {
        DEFAULT_API_URL.to_string()
    } else {
        format!("{}/api/v3", enterprise_url)
    }
}

/// Thin client for the comment endpoints of one repository.
struct Repository<'a> {
    http: &'a reqwest::Client,
    base: String,
    token: &'a str,
}

impl Repository<'_> {
    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(self.token)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::ACCEPT, ACCEPT)
    }

    async fn list<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<Vec<T>, ActionError> {
        let url = format!("{}{}?per_page=100", self.base, path);
        let delivered =
            send_with_retries(self.request(reqwest::Method::GET, &url), &url, MAX_RETRIES).await?;
        Ok(serde_json::from_str(&delivered.body)?)
    }

    async fn create(&self, path: &str, body: &str) -> Result<(), ActionError> {
        let url = format!("{}{}", self.base, path);
        let request = self
            .request(reqwest::Method::POST, &url)
            .json(&json!({ "body": body }));
        send_with_retries(request, &url, MAX_RETRIES).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), ActionError> {
        let url = format!("{}{}", self.base, path);
        send_with_retries(self.request(reqwest::Method::DELETE, &url), &url, MAX_RETRIES).await?;
        Ok(())
    }

    async fn commit_comments(&self, sha: &str) -> Result<Vec<Comment>, ActionError> {
        self.list(&format!("/commits/{}/comments", sha)).await
    }

    async fn remove_commit_comments(&self, sha: &str, heading: &str) -> Result<usize, ActionError> {
        let mut removed = 0;
        for comment in self.commit_comments(sha).await? {
            if has_heading(&comment.body, heading) {
                self.delete(&format!("/comments/{}", comment.id)).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn remove_pull_request_comments(&self, number: u64, heading: &str) -> Result<usize, ActionError> {
        let mut removed = 0;
        let comments: Vec<Comment> = self.list(&format!("/issues/{}/comments", number)).await?;
        for comment in comments {
            if has_heading(&comment.body, heading) {
                self.delete(&format!("/issues/comments/{}", comment.id)).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// An action that comments on a commit and its pull request.
#[derive(Clone)]
pub struct GithubCommentAction {
    ctx: ActionContext,
}

impl GithubCommentAction {
    pub const NAME: &'static str = "github/comment";

    pub fn new(ctx: ActionContext) -> Self {
        Self { ctx }
    }

    async fn bool_or(&self, name: &str, event: &Event, default: bool) -> Result<bool, ActionError> {
        let raw = self.ctx.string(name, event).await?;
        match raw.trim().to_ascii_lowercase().as_str() {
            "" => Ok(default),
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => Err(ActionError::InvalidProperty {
                name: name.to_string(),
                reason: format!("'{}' is not a boolean", other),
            }),
        }
    }

    async fn pr_number(&self, event: &Event) -> Result<u64, ActionError> {
        let raw = self.ctx.string("prNumber", event).await?;
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(0);
        }
        raw.parse::<i64>()
            .map(|n| n.max(0) as u64)
            .map_err(|e| ActionError::InvalidProperty {
                name: "prNumber".to_string(),
                reason: format!("failed to convert '{}' to an integer: {}", raw, e),
            })
    }
}

#[async_trait]
impl Action for GithubCommentAction {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Writes comments on commits and pull requests, replacing earlier comments with the same heading"
    }

    fn properties(&self) -> &[PropertySpec] {
        PROPERTIES
    }

    async fn execute(&self, event: &Event) -> Result<(), ActionError> {
        self.ctx.check_required(PROPERTIES)?;
        let options = self.ctx.template_options(event).await;

        let token = self.ctx.non_empty_string("token", event).await?;
        let org = self.ctx.non_empty_string("org", event).await?;
        let repo = self.ctx.non_empty_string("repo", event).await?;
        let sha = self.ctx.rendered("commitSha", event, &options).await?;
        if sha.trim().is_empty() {
            return Err(ActionError::EmptyProperty("commitSha".to_string()));
        }
        let pr_number = self.pr_number(event).await?;

        let heading = self.ctx.rendered("heading", event, &options).await?;
        let body = self.ctx.rendered("body", event, &options).await?;
        if body.trim().is_empty() {
            return Err(ActionError::EmptyProperty("body".to_string()));
        }

        let remove_pr_comments = self
            .bool_or("removeExistingPullRequestComments", event, true)
            .await?;
        let remove_all_commit_comments = self
            .bool_or("removeExistingCommentsFromAllPullRequestCommits", event, false)
            .await?;
        let skip_duplicates = self
            .bool_or("removeDuplicateCommitComments", event, true)
            .await?;

        let enterprise_url = self.ctx.string("enterpriseUrl", event).await?;
        let repository = Repository {
            http: &self.ctx.http,
            base: format!("{}/repos/{}/{}", api_base(&enterprise_url), org, repo),
            token: &token,
        };

        if pr_number > 0 && remove_all_commit_comments {
            let commits: Vec<Commit> = repository
                .list(&format!("/pulls/{}/commits", pr_number))
                .await?;
            for commit in commits {
                let removed = repository
                    .remove_commit_comments(&commit.sha, &heading)
                    .await?;
                debug!(commit = %commit.sha, removed, "Removed commit comments");
            }
        }

        if pr_number > 0 && remove_pr_comments {
            let removed = repository
                .remove_pull_request_comments(pr_number, &heading)
                .await?;
            debug!(pr = pr_number, removed, "Removed pull request comments");
        }

        let comment = compose(&heading, &body);
        let duplicate = skip_duplicates
            && repository
                .commit_comments(&sha)
                .await?
                .iter()
                .any(|existing| existing.body == comment);

        if duplicate {
            info!(org = %org, repo = %repo, commit = %sha, "Identical commit comment exists, skipping");
        } else {
            repository
                .create(&format!("/commits/{}/comments", sha), &comment)
                .await?;
            info!(org = %org, repo = %repo, commit = %sha, "Commit comment created");
        }

        if pr_number > 0 {
            repository
                .create(&format!("/issues/{}/comments", pr_number), &comment)
                .await?;
            info!(org = %org, repo = %repo, pr = pr_number, "Pull request comment created");
        }

        Ok(())
    }
}
