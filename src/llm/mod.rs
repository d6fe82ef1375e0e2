//! Single-turn LLM execution interface used by graph extraction.

mod openai;

pub use openai::OpenAIExecutor;

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

/// Per-call options. No conversational state survives between calls.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub timeout: Duration,
    pub tools_disabled: bool,
    /// Scratch directory owned by the caller for the lifetime of the call.
    pub work_dir: PathBuf,
}

/// One text block returned by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteResult {
    pub payloads: Vec<Payload>,
}

impl ExecuteResult {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            payloads: vec![Payload { text: text.into() }],
        }
    }

    /// All payload texts joined with newlines.
    pub fn joined_text(&self) -> String {
        self.payloads
            .iter()
            .map(|p| p.text.as_str())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Something that can run one prompt against a language model.
#[async_trait]
pub trait LlmExecutor: Send + Sync {
    async fn execute(&self, prompt: &str, options: &ExecuteOptions) -> Result<ExecuteResult>;
}
