//! Client for the external Rosetta folding service.
//!
//! The `rosetta` algorithm does not run in-process: the job is posted to a
//! long-running HTTP microservice and polled until it reaches a remote
//! terminal state. The service exposes:
//!
//! - `POST /jobs`: submit `{jobId?, sequence, directions?, params?}`
//! - `GET /jobs/{id}`: status `{jobId, status, errorMessage?}` where status
//!   is one of `queued`, `running`, `succeeded`, `failed`
//! - `GET /jobs/{id}/pdb`: the folded structure, once available
//!
//! Cancellation is checked between polls; the remote service itself has no
//! cancel endpoint, so a cancelled local job simply stops polling.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::CancelToken;

/// Default interval between status polls.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Errors from the Rosetta delegation path. Transport and remote failures
/// are transient execution errors, subject to the scheduler's retry policy.
#[derive(Debug, Error)]
pub enum RosettaError {
    #[error("Rosetta request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Rosetta job {job_id} not found on the remote service")]
    RemoteNotFound { job_id: String },

    #[error("Rosetta rejected the submission ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Rosetta job failed remotely: {0}")]
    RemoteFailure(String),

    #[error("Rosetta polling cancelled")]
    Cancelled,
}

/// Submission payload for the remote service.
#[derive(Debug, Clone, Serialize)]
struct RemoteJobRequest<'a> {
    #[serde(rename = "jobId", skip_serializing_if = "Option::is_none")]
    job_id: Option<&'a str>,
    sequence: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    directions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<serde_json::Value>,
}

/// Remote submission acknowledgment.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteJobHandle {
    #[serde(rename = "jobId")]
    pub job_id: String,
    pub status: String,
}

/// Remote job status document.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteJobStatus {
    #[serde(rename = "jobId")]
    pub job_id: String,
    pub status: String,
    #[serde(rename = "errorMessage", default)]
    pub error_message: Option<String>,
}

impl RemoteJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "succeeded" | "failed")
    }
}

/// Outcome of a completed remote fold.
#[derive(Debug, Clone)]
pub struct RemoteOutcome {
    /// Remote job id (the queue handle stored on the local record).
    pub remote_id: String,
    /// PDB text of the folded structure, when the service produced one.
    pub pdb: Option<String>,
}

/// HTTP client for the Rosetta service.
#[derive(Debug, Clone)]
pub struct RosettaClient {
    http: Client,
    base_url: String,
    poll_interval: Duration,
}

impl RosettaClient {
    /// Creates a client for the service at `base_url`
    /// (e.g. "http://rosetta:8000").
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Overrides the status poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Submits a fold job, returning the remote handle.
    pub async fn submit(
        &self,
        local_job_id: &str,
        sequence: &str,
        directions: Option<Vec<String>>,
        params: Option<serde_json::Value>,
    ) -> Result<RemoteJobHandle, RosettaError> {
        let request = RemoteJobRequest {
            job_id: Some(local_job_id),
            sequence,
            directions,
            params,
        };

        let response = self
            .http
            .post(format!("{}/jobs", self.base_url))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(RosettaError::Rejected { status, body });
        }

        Ok(response.json().await?)
    }

    /// Fetches the remote status document.
    pub async fn status(&self, remote_id: &str) -> Result<RemoteJobStatus, RosettaError> {
        let response = self
            .http
            .get(format!("{}/jobs/{}", self.base_url, remote_id))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(RosettaError::RemoteNotFound {
                job_id: remote_id.to_string(),
            });
        }

        Ok(response.error_for_status()?.json().await?)
    }

    /// Downloads the PDB artifact, if the remote run produced one.
    pub async fn fetch_pdb(&self, remote_id: &str) -> Result<Option<String>, RosettaError> {
        let response = self
            .http
            .get(format!("{}/jobs/{}/pdb", self.base_url, remote_id))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        Ok(Some(response.error_for_status()?.text().await?))
    }

    /// Polls the remote job to completion.
    ///
    /// Cancellation is honored between polls: the remote run keeps going,
    /// but the local job stops waiting and acknowledges the cancel.
    pub async fn await_completion(
        &self,
        remote_id: &str,
        cancel: &CancelToken,
    ) -> Result<RemoteOutcome, RosettaError> {
        loop {
            if cancel.is_cancelled() {
                return Err(RosettaError::Cancelled);
            }

            let status = self.status(remote_id).await?;
            debug!(remote_id = %remote_id, status = %status.status, "Rosetta poll");

            match status.status.as_str() {
                "succeeded" => {
                    let pdb = self.fetch_pdb(remote_id).await?;
                    return Ok(RemoteOutcome {
                        remote_id: remote_id.to_string(),
                        pdb,
                    });
                }
                "failed" => {
                    return Err(RosettaError::RemoteFailure(
                        status
                            .error_message
                            .unwrap_or_else(|| "remote job failed without a message".to_string()),
                    ));
                }
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let client = RosettaClient::new("http://rosetta:8000/");
        assert_eq!(client.base_url, "http://rosetta:8000");
    }

    #[test]
    fn test_remote_status_parsing() {
        let status: RemoteJobStatus = serde_json::from_str(
            r#"{"jobId": "abc", "status": "succeeded", "errorMessage": null}"#,
        )
        .unwrap();
        assert_eq!(status.job_id, "abc");
        assert!(status.is_terminal());

        let status: RemoteJobStatus =
            serde_json::from_str(r#"{"jobId": "abc", "status": "running"}"#).unwrap();
        assert!(!status.is_terminal());
        assert!(status.error_message.is_none());
    }

    #[test]
    fn test_remote_request_serialization() {
        let request = RemoteJobRequest {
            job_id: Some("job-1"),
            sequence: "HPHP",
            directions: Some(vec!["U".to_string(), "R".to_string(), "D".to_string()]),
            params: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["jobId"], "job-1");
        assert_eq!(json["sequence"], "HPHP");
        assert!(json.get("params").is_none());
    }

    #[tokio::test]
    async fn test_await_completion_honors_cancellation() {
        let client = RosettaClient::new("http://127.0.0.1:1"); // nothing listening
        let token = CancelToken::new();
        token.cancel();
        let result = client.await_completion("abc", &token).await;
        assert!(matches!(result, Err(RosettaError::Cancelled)));
    }
}
