use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::InterpretationOptions;
use crate::extract::AnalysisKind;
use crate::model::{ChatModel, ChatModelError, TokenUsage};
use crate::prompt::build_system_prompt;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("chat transport failed: {source}")]
    Transport {
        #[source]
        source: ChatModelError,
    },
    #[error("session is scoped to {expected} but was used for {actual}")]
    KindMismatch {
        expected: AnalysisKind,
        actual: AnalysisKind,
    },
}

/// Read-only view of a session's accounting, embedded in reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub kind: AnalysisKind,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub calls: u32,
}

impl SessionSnapshot {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Handle over the chat collaborator, scoped to exactly one analysis kind.
///
/// The intended reuse pattern is a single session across several sequential
/// interpretation calls: the system prompt is authored once at open and the
/// token counters accumulate across calls. The handle is single-writer;
/// callers that share it across threads must serialize access themselves.
pub struct ChatSession {
    kind: AnalysisKind,
    system_prompt: String,
    model: Box<dyn ChatModel>,
    input_tokens: u64,
    output_tokens: u64,
    calls: u32,
    last_reported: TokenUsage,
    created: Instant,
}

impl ChatSession {
    /// Opens a session: fixes the analysis kind and the system prompt for
    /// the session's lifetime. No tokens are spent until the first `send`.
    pub fn open(
        kind: AnalysisKind,
        model: Box<dyn ChatModel>,
        options: &InterpretationOptions,
    ) -> Self {
        Self {
            kind,
            system_prompt: build_system_prompt(kind, options),
            model,
            input_tokens: 0,
            output_tokens: 0,
            calls: 0,
            last_reported: TokenUsage::default(),
            created: Instant::now(),
        }
    }

    pub fn kind(&self) -> AnalysisKind {
        self.kind
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn calls(&self) -> u32 {
        self.calls
    }

    pub fn input_tokens(&self) -> u64 {
        self.input_tokens
    }

    pub fn output_tokens(&self) -> u64 {
        self.output_tokens
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            kind: self.kind,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            calls: self.calls,
        }
    }

    /// Transmits one main prompt. Exactly one attempt; a transport failure
    /// is recoverable and leaves all accounting untouched.
    pub fn send(&mut self, kind: AnalysisKind, prompt: &str) -> Result<String, SessionError> {
        if kind != self.kind {
            return Err(SessionError::KindMismatch {
                expected: self.kind,
                actual: kind,
            });
        }

        let reply = self
            .model
            .send(&self.system_prompt, prompt)
            .map_err(|source| SessionError::Transport { source })?;

        self.record_usage(reply.usage);
        self.calls = self.calls.saturating_add(1);
        Ok(reply.text)
    }

    /// Providers report cumulative counts that may be non-monotonic (cached
    /// replies, counter resets). The per-call delta clamps to zero so the
    /// session counters never decrease.
    fn record_usage(&mut self, reported: TokenUsage) {
        let delta_in = reported
            .input_tokens
            .saturating_sub(self.last_reported.input_tokens);
        let delta_out = reported
            .output_tokens
            .saturating_sub(self.last_reported.output_tokens);

        self.input_tokens = self.input_tokens.saturating_add(delta_in);
        self.output_tokens = self.output_tokens.saturating_add(delta_out);
        self.last_reported = reported;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChatReply;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Mutex;

    struct ScriptedModel {
        replies: Mutex<VecDeque<Result<ChatReply, String>>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Result<ChatReply, String>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
            }
        }

        fn reply(text: &str, input: u64, output: u64) -> Result<ChatReply, String> {
            Ok(ChatReply {
                text: text.to_string(),
                usage: TokenUsage::new(input, output),
            })
        }
    }

    impl ChatModel for ScriptedModel {
        fn send(&self, _system: &str, _user: &str) -> Result<ChatReply, ChatModelError> {
            let next = self
                .replies
                .lock()
                .expect("mock mutex poisoned")
                .pop_front()
                .expect("no scripted reply left");
            next.map_err(|message| {
                ChatModelError::new(io::Error::new(io::ErrorKind::Other, message))
            })
        }
    }

    fn default_options() -> InterpretationOptions {
        crate::config::ParamRegistry::for_kind(AnalysisKind::Efa)
            .merge(&[])
            .expect("defaults")
    }

    #[test]
    fn counters_accumulate_across_calls() {
        let model = ScriptedModel::new(vec![
            ScriptedModel::reply("first", 100, 40),
            ScriptedModel::reply("second", 250, 90),
        ]);
        let mut session = ChatSession::open(AnalysisKind::Efa, Box::new(model), &default_options());

        session.send(AnalysisKind::Efa, "one").expect("first call");
        assert_eq!(session.input_tokens(), 100);
        assert_eq!(session.output_tokens(), 40);

        session.send(AnalysisKind::Efa, "two").expect("second call");
        assert_eq!(session.input_tokens(), 250);
        assert_eq!(session.output_tokens(), 90);
        assert_eq!(session.calls(), 2);
    }

    #[test]
    fn decreasing_provider_counts_clamp_to_zero() {
        let model = ScriptedModel::new(vec![
            ScriptedModel::reply("first", 200, 80),
            ScriptedModel::reply("second", 150, 60),
        ]);
        let mut session = ChatSession::open(AnalysisKind::Efa, Box::new(model), &default_options());

        session.send(AnalysisKind::Efa, "one").expect("first call");
        session.send(AnalysisKind::Efa, "two").expect("second call");

        // The decrease contributes nothing; counters never go backwards.
        assert_eq!(session.input_tokens(), 200);
        assert_eq!(session.output_tokens(), 80);
    }

    #[test]
    fn failed_call_leaves_accounting_untouched() {
        let model = ScriptedModel::new(vec![
            ScriptedModel::reply("first", 120, 30),
            Err("connection reset".to_string()),
        ]);
        let mut session = ChatSession::open(AnalysisKind::Efa, Box::new(model), &default_options());

        session.send(AnalysisKind::Efa, "one").expect("first call");
        let err = session
            .send(AnalysisKind::Efa, "two")
            .expect_err("transport failure");
        assert!(matches!(err, SessionError::Transport { .. }));
        assert_eq!(session.input_tokens(), 120);
        assert_eq!(session.calls(), 1);
    }

    #[test]
    fn cross_kind_use_is_rejected_at_call_time() {
        let model = ScriptedModel::new(vec![ScriptedModel::reply("unused", 1, 1)]);
        let mut session = ChatSession::open(AnalysisKind::Efa, Box::new(model), &default_options());

        let err = session
            .send(AnalysisKind::Pca, "prompt")
            .expect_err("kind mismatch");
        assert!(matches!(err, SessionError::KindMismatch { .. }));
        assert_eq!(session.calls(), 0);
    }
}
