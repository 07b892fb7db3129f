//! HTTP client for the remote grading service.
//!
//! The session controller never scores itself: it fetches the exam definition
//! from here, posts the frozen evidence payload once, and recovers a
//! previously graded result on re-entry.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::{Client, Response};
use serde::Deserialize;
use shared::{
    domain::CourseId,
    error::{ApiError, ApiException, ErrorCode},
    protocol::{ExamDefinition, ExamResultResponse, SubmitExamRequest},
};
use tracing::{info, warn};
use url::Url;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
/// A hung submission must not pin a session in its submitting phase forever.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);
const SUBMIT_DISPATCH_ATTEMPTS: usize = 3;
const SUBMIT_DISPATCH_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Fallback error body shape (`{"detail": "..."}`) the service emits when it
/// has no structured [`ApiError`] to offer.
#[derive(Debug, Deserialize)]
struct DetailBody {
    detail: Option<String>,
}

pub struct GradingClient {
    http: Client,
    base_url: String,
}

impl GradingClient {
    pub fn new(base_url: impl AsRef<str>) -> Result<Self> {
        let parsed = Url::parse(base_url.as_ref()).context("invalid grading service base url")?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            bail!("grading service base url must start with http:// or https://");
        }
        Ok(Self {
            http: Client::new(),
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
        })
    }

    pub async fn fetch_exam(&self, course_id: &CourseId) -> Result<ExamDefinition> {
        let response = self
            .http
            .get(format!("{}/courses/{course_id}/exam", self.base_url))
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .context("failed to reach grading service for exam definition")?;
        let response = into_service_result(response).await?;
        let definition: ExamDefinition = response
            .json()
            .await
            .context("invalid exam definition payload")?;
        info!(
            course_id = %course_id,
            questions = definition.questions.len(),
            time_limit_minutes = definition.time_limit_minutes,
            "grading: exam definition fetched"
        );
        Ok(definition)
    }

    /// Posts the evidence payload and returns the graded result.
    ///
    /// Only transport-level dispatch failures (connect errors, request
    /// timeouts) are retried, and at most twice; an HTTP rejection is never
    /// replayed, so a submission the service already graded cannot be
    /// double-counted.
    pub async fn submit_exam(
        &self,
        course_id: &CourseId,
        request: &SubmitExamRequest,
    ) -> Result<ExamResultResponse> {
        let url = format!("{}/courses/{course_id}/exam/submit", self.base_url);
        let mut attempt = 0usize;
        let response = loop {
            attempt += 1;
            match self
                .http
                .post(&url)
                .timeout(SUBMIT_TIMEOUT)
                .json(request)
                .send()
                .await
            {
                Ok(response) => break response,
                Err(err)
                    if attempt < SUBMIT_DISPATCH_ATTEMPTS
                        && (err.is_timeout() || err.is_connect()) =>
                {
                    warn!(
                        course_id = %course_id,
                        attempt,
                        max_attempts = SUBMIT_DISPATCH_ATTEMPTS,
                        "grading: submission dispatch failed, retrying: {err}"
                    );
                    tokio::time::sleep(SUBMIT_DISPATCH_RETRY_DELAY).await;
                }
                Err(err) => {
                    return Err(err).context("failed to dispatch exam submission");
                }
            }
        };
        let response = into_service_result(response).await?;
        let result: ExamResultResponse = response
            .json()
            .await
            .context("invalid grading result payload")?;
        info!(
            course_id = %course_id,
            passed = result.passed,
            malpractice_count = result.malpractice_count,
            attempts = result.attempts,
            "grading: submission graded"
        );
        Ok(result)
    }

    /// Fetches the result of an already graded session. Idempotent; used to
    /// recover after navigation without replaying proctoring.
    pub async fn fetch_last_result(&self, course_id: &CourseId) -> Result<ExamResultResponse> {
        let response = self
            .http
            .get(format!("{}/courses/{course_id}/exam/result", self.base_url))
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .context("failed to reach grading service for last result")?;
        let response = into_service_result(response).await?;
        response
            .json()
            .await
            .context("invalid grading result payload")
    }
}

async fn into_service_result(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let code = ErrorCode::from_http_status(status.as_u16());
    let body = response.text().await.unwrap_or_default();
    let message = decode_error_message(&body)
        .unwrap_or_else(|| format!("grading service returned {status}"));
    Err(ApiException::new(code, message).into())
}

fn decode_error_message(body: &str) -> Option<String> {
    if let Ok(err) = serde_json::from_str::<ApiError>(body) {
        return Some(err.message);
    }
    serde_json::from_str::<DetailBody>(body)
        .ok()
        .and_then(|body| body.detail)
}
