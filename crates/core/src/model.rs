use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;

/// Provider-reported token counts. Adapters report *cumulative* totals for
/// the lifetime of the underlying client; sessions turn consecutive reports
/// into per-call deltas.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

#[derive(Clone, Debug)]
pub struct ChatReply {
    pub text: String,
    pub usage: TokenUsage,
}

/// Opaque transport error from a chat provider. Mirrors the boxed-source
/// shape used throughout the adapter boundary so providers can surface any
/// concrete error type without the core depending on it.
#[derive(Debug)]
pub struct ChatModelError {
    inner: Box<dyn StdError + Send + Sync>,
}

impl ChatModelError {
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            inner: Box::new(error),
        }
    }

    pub fn into_inner(self) -> Box<dyn StdError + Send + Sync> {
        self.inner
    }

    pub fn as_inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.inner.as_ref()
    }
}

impl fmt::Display for ChatModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl StdError for ChatModelError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.inner.as_ref())
    }
}

/// The one contract the pipeline has with an LLM provider: deliver a system
/// prompt and a user prompt, get back text plus token accounting.
pub trait ChatModel: Send + Sync {
    fn send(&self, system_prompt: &str, user_prompt: &str) -> Result<ChatReply, ChatModelError>;
}
