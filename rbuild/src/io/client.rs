//! Blocking HTTP client for the build server.
//!
//! The client has no overall timeout because the live build stream can run
//! for as long as the build does; every short request sets its own.

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::StatusCode;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::core::types::{
    ActionOutcome, ErrorBody, GitAction, GitState, JobView, Progress, StartedJob,
};
use crate::io::transfer::{ChangeSource, RestoreReport};
use crate::reconcile::GitEndpoint;

/// Multipart field carrying the plaintext diff.
pub const DIFF_FIELD: &str = "gitdiff";
/// Multipart field carrying one binary file; its file name is the repository path.
pub const BINARY_FIELD: &str = "binary";

/// Connection to one build server.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    base_url: String,
    http: Client,
    request_timeout: Duration,
}

impl RemoteClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(anyhow!("server url must not be empty"));
        }
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(None::<Duration>)
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            base_url,
            http,
            request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn health(&self) -> Result<()> {
        self.send(self.short(self.http.get(self.url("/health"))))?;
        Ok(())
    }

    pub fn git_state(&self) -> Result<GitState> {
        self.json(self.short(self.http.get(self.url("/git/state"))))
    }

    pub fn git_action(&self, action: &GitAction) -> Result<ActionOutcome> {
        self.json(self.short(self.http.post(self.url("/git/action")).json(action)))
    }

    /// Back up and discard the mirror's uncommitted changes.
    pub fn restore_worktree(&self) -> Result<RestoreReport> {
        self.json(self.short(self.http.post(self.url("/worktree/restore"))))
    }

    /// Upload the diff and binaries and create a build job.
    #[instrument(skip_all, fields(diff_bytes = diff.len(), binaries = binaries.len()))]
    pub fn start_job(&self, diff: Vec<u8>, binaries: Vec<(String, Vec<u8>)>) -> Result<StartedJob> {
        // File names are repository paths; keep `/` literal on the wire.
        let mut form = Form::new().percent_encode_noop().part(
            DIFF_FIELD,
            Part::bytes(diff)
                .file_name("gitdiff.diff")
                .mime_str("text/x-diff")
                .context("diff part mime")?,
        );
        for (path, bytes) in binaries {
            let mime = mime_guess::from_path(&path).first_or_octet_stream();
            let part = Part::bytes(bytes)
                .file_name(path.clone())
                .mime_str(mime.essence_str())
                .with_context(|| format!("mime for {path}"))?;
            form = form.part(BINARY_FIELD, part);
        }
        // Uploads may be large; only the connect phase is bounded.
        self.json(self.http.post(self.url("/jobs")).multipart(form))
    }

    /// Attach to the live build output and copy it to `out` until the build ends.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub fn stream_job(&self, job_id: &str, out: &mut dyn Write) -> Result<u64> {
        let mut response = self.send(self.http.get(self.url(&format!("/jobs/{job_id}/stream"))))?;
        let copied = response.copy_to(out).context("read build stream")?;
        out.flush().context("flush build output")?;
        debug!(bytes = copied, "build stream ended");
        Ok(copied)
    }

    pub fn job_status(&self, job_id: &str) -> Result<JobView> {
        self.json(self.short(self.http.get(self.url(&format!("/jobs/{job_id}")))))
    }

    pub fn job_progress(&self, job_id: &str, offset: u64) -> Result<Progress> {
        let path = format!("/jobs/{job_id}/progress/{offset}");
        self.json(self.short(self.http.get(self.url(&path))))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn short(&self, request: RequestBuilder) -> RequestBuilder {
        request.timeout(self.request_timeout)
    }

    fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self.send(request)?;
        let url = response.url().to_string();
        response
            .json()
            .with_context(|| format!("decode response from {url}"))
    }

    fn bytes(&self, request: RequestBuilder) -> Result<Vec<u8>> {
        let response = self.send(request)?;
        Ok(response.bytes().context("read response body")?.to_vec())
    }

    fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().context("send request")?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let url = response.url().to_string();
        let body = response.text().unwrap_or_default();
        Err(anyhow!("{url}: {}", error_message(status, &body)))
    }
}

impl GitEndpoint for RemoteClient {
    fn snapshot(&self) -> Result<GitState> {
        self.git_state()
    }

    fn execute(&self, action: &GitAction) -> Result<ActionOutcome> {
        self.git_action(action)
    }
}

impl ChangeSource for RemoteClient {
    fn fetch_diff(&self) -> Result<Vec<u8>> {
        self.bytes(self.short(self.http.get(self.url("/changes/diff"))))
    }

    fn list_binaries(&self) -> Result<Vec<String>> {
        self.json(self.short(self.http.get(self.url("/changes/binaries"))))
    }

    fn fetch_file(&self, path: &str) -> Result<Vec<u8>> {
        self.bytes(self.short(self.http.get(self.url("/files")).query(&[("path", path)])))
    }
}

/// Human-readable failure for a non-2xx response, preferring the server's `error` field.
fn error_message(status: StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| body.trim().to_string());
    if detail.is_empty() {
        format!("server returned {status}")
    } else {
        format!("server returned {status}: {detail}")
    }
}
