//! Client for the edge API.
//!
//! Submits a question and polls `/get-response` until the answer to that
//! question shows up or the attempts run out.

use askq_core::{AppError, AppResult, QueryId, SessionId};
use askq_dispatch::{ErrorResponse, SubmitRequest, SubmitResponse, SESSION_HEADER};
use reqwest::StatusCode;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Default number of polls before giving up on an answer.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Default pause between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct EdgeClient {
    base_url: String,
    session: SessionId,
    http: reqwest::Client,
}

impl EdgeClient {
    pub fn new(base_url: impl Into<String>, session: SessionId) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| AppError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session,
            http,
        })
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Submit `question`; returns the id the edge assigned.
    pub async fn submit(&self, question: &str) -> AppResult<QueryId> {
        let response = self
            .http
            .post(format!("{}/submit-query", self.base_url))
            .header(SESSION_HEADER, self.session.as_str())
            .json(&SubmitRequest {
                query: question.to_string(),
            })
            .send()
            .await
            .map_err(|e| AppError::Transport(format!("Failed to reach edge: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = error_detail(response).await;
            return Err(if status.is_client_error() {
                AppError::InvalidInput(detail)
            } else {
                AppError::Transport(format!("Edge error ({}): {}", status, detail))
            });
        }

        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| AppError::Transport(format!("Failed to parse edge response: {}", e)))?;
        Ok(body.query_id)
    }

    /// Fetch every answer cached for this session. An empty map means none yet.
    pub async fn poll(&self, wait: Option<Duration>) -> AppResult<BTreeMap<String, String>> {
        let mut request = self
            .http
            .get(format!("{}/get-response", self.base_url))
            .header(SESSION_HEADER, self.session.as_str());
        if let Some(wait) = wait {
            request = request.query(&[("wait_ms", wait.as_millis().to_string())]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::Transport(format!("Failed to reach edge: {}", e)))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(BTreeMap::new()),
            status if status.is_success() => response
                .json()
                .await
                .map_err(|e| AppError::Transport(format!("Failed to parse edge response: {}", e))),
            status => {
                let detail = error_detail(response).await;
                Err(AppError::Transport(format!("Edge error ({}): {}", status, detail)))
            }
        }
    }

    /// Poll until the answer to `question` appears.
    ///
    /// Transport errors during polling count as an empty poll.
    pub async fn wait_for_answer(
        &self,
        question: &str,
        max_attempts: u32,
        interval: Duration,
    ) -> AppResult<String> {
        let question = question.trim();

        for attempt in 1..=max_attempts {
            match self.poll(None).await {
                Ok(mut answers) => {
                    if let Some(answer) = answers.remove(question) {
                        return Ok(answer);
                    }
                    debug!("No answer yet (attempt {}/{})", attempt, max_attempts);
                }
                Err(e) => debug!("Poll {}/{} failed: {}", attempt, max_attempts, e),
            }

            if attempt < max_attempts {
                tokio::time::sleep(interval).await;
            }
        }

        Err(AppError::NotFound(format!(
            "No answer after {} attempts",
            max_attempts
        )))
    }

    /// Submit `question` and wait for its answer.
    pub async fn ask(
        &self,
        question: &str,
        max_attempts: u32,
        interval: Duration,
    ) -> AppResult<(QueryId, String)> {
        let query_id = self.submit(question).await?;
        debug!("Submitted question as {}", query_id);
        let answer = self.wait_for_answer(question, max_attempts, interval).await?;
        Ok((query_id, answer))
    }
}

async fn error_detail(response: reqwest::Response) -> String {
    let status = response.status();
    match response.json::<ErrorResponse>().await {
        Ok(body) => body.detail,
        Err(_) => status.to_string(),
    }
}
