//! The generation oracle: whatever turns a budgeted request into an
//! edit-protocol response.

pub mod client;
pub mod prompts;
pub mod usage;

pub use client::OpenRouterOracle;
pub use usage::{merge_usage, Usage};

use crate::budget::{ExtractionLevel, FileRole};
use crate::failure::{FailureCode, StructuredFailure};
use crate::heal::FollowUp;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// A file as it appears in the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFile {
    pub path: PathBuf,
    pub role: FileRole,
    pub level: ExtractionLevel,
    pub exists: bool,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub task_id: String,
    pub instruction: String,
    pub constraints: Option<String>,
    pub files: Vec<RequestFile>,
    /// Set on heal rounds.
    pub follow_up: Option<FollowUp>,
    pub max_output_tokens: u32,
}

impl GenerationRequest {
    pub fn system_prompt(&self) -> &'static str {
        prompts::EDIT_PROTOCOL_SYSTEM
    }

    pub fn user_prompt(&self) -> String {
        prompts::render_user_prompt(self)
    }

    pub fn is_follow_up(&self) -> bool {
        self.follow_up.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OracleReply {
    pub content: String,
    pub usage: Option<Usage>,
    pub model: String,
}

#[derive(Debug, Clone, Error)]
pub enum OracleError {
    #[error("generation timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("no API key configured; set OPENROUTER_API_KEY")]
    MissingApiKey,
    #[error("provider error {status}: {message}")]
    Provider { status: u16, message: String },
    #[error("request to provider failed: {0}")]
    Transport(String),
    #[error("unreadable provider payload: {0}")]
    Payload(String),
    #[error("scripted oracle has no reply left")]
    Exhausted,
}

impl From<&OracleError> for StructuredFailure {
    fn from(err: &OracleError) -> Self {
        let code = match err {
            OracleError::Timeout(_) => FailureCode::CodegenTimeout,
            OracleError::MissingApiKey
            | OracleError::Provider { .. }
            | OracleError::Transport(_)
            | OracleError::Payload(_)
            | OracleError::Exhausted => FailureCode::CodegenProviderError,
        };
        StructuredFailure::new(code, err.to_string())
    }
}

#[async_trait]
pub trait GenerationOracle: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<OracleReply, OracleError>;

    fn name(&self) -> &str {
        "oracle"
    }
}

enum ScriptStep {
    Reply(String),
    Fail(OracleError),
    Stall(Duration, String),
}

/// Replays canned replies in order and records every request it saw.
#[derive(Default)]
pub struct ScriptedOracle {
    steps: Mutex<VecDeque<ScriptStep>>,
    seen: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedOracle {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let oracle = Self::default();
        for reply in replies {
            oracle.push_reply(reply);
        }
        oracle
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.push(ScriptStep::Reply(reply.into()));
    }

    pub fn push_error(&self, err: OracleError) {
        self.push(ScriptStep::Fail(err));
    }

    /// Reply only after `delay`, for exercising timeouts.
    pub fn push_slow_reply(&self, delay: Duration, reply: impl Into<String>) {
        self.push(ScriptStep::Stall(delay, reply.into()));
    }

    fn push(&self, step: ScriptStep) {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push_back(step);
        }
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl GenerationOracle for ScriptedOracle {
    async fn generate(&self, request: &GenerationRequest) -> Result<OracleReply, OracleError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(request.clone());
        }
        let step = self.steps.lock().ok().and_then(|mut s| s.pop_front());
        let content = match step {
            Some(ScriptStep::Reply(content)) => content,
            Some(ScriptStep::Fail(err)) => return Err(err),
            Some(ScriptStep::Stall(delay, content)) => {
                tokio::time::sleep(delay).await;
                content
            }
            None => return Err(OracleError::Exhausted),
        };
        Ok(OracleReply {
            content,
            usage: None,
            model: "scripted".to_string(),
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> GenerationRequest {
        GenerationRequest {
            task_id: "t".into(),
            instruction: "do it".into(),
            constraints: None,
            files: vec![],
            follow_up: None,
            max_output_tokens: 100,
        }
    }

    #[tokio::test]
    async fn scripted_oracle_replays_in_order() {
        let oracle = ScriptedOracle::new(["one", "two"]);
        oracle.push_error(OracleError::Provider {
            status: 500,
            message: "down".into(),
        });
        assert_eq!(oracle.generate(&request()).await.unwrap().content, "one");
        assert_eq!(oracle.generate(&request()).await.unwrap().content, "two");
        let err = oracle.generate(&request()).await.unwrap_err();
        assert_eq!(
            StructuredFailure::from(&err).code,
            FailureCode::CodegenProviderError
        );
        assert!(matches!(
            oracle.generate(&request()).await,
            Err(OracleError::Exhausted)
        ));
        assert_eq!(oracle.calls(), 4);
    }

    #[test]
    fn timeout_maps_to_codegen_timeout() {
        let failure = StructuredFailure::from(&OracleError::Timeout(Duration::from_secs(3)));
        assert_eq!(failure.code, FailureCode::CodegenTimeout);
        assert!(failure.message.contains("3s"));
        assert!(!failure.is_retryable());
    }
}
