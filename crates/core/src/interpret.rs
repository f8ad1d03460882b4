use std::time::Instant;

use serde::Serialize;
use thiserror::Error;

use crate::config::{ConfigError, ParamRegistry, PartialOptions};
use crate::diagnostics::{DiagnosticRegistry, Diagnostics};
use crate::extract::{AnalysisData, ExtractError, ExtractorRegistry, ModelInput, VariableInfo};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::model::ChatModel;
use crate::parse::{self, ParseTier, ParsedResult};
use crate::prompt::build_main_prompt;
use crate::report;
use crate::session::{ChatSession, SessionError, SessionSnapshot};

#[derive(Debug, Error)]
pub enum InterpretError {
    #[error(transparent)]
    Options(#[from] ConfigError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Everything one interpretation call produced. The rendered report is the
/// primary artifact; the rest is kept for callers that post-process.
#[derive(Clone, Debug, Serialize)]
pub struct Interpretation {
    pub data: AnalysisData,
    pub result: ParsedResult,
    #[serde(skip)]
    pub tier: ParseTier,
    pub diagnostics: Diagnostics,
    pub snapshot: SessionSnapshot,
    pub elapsed_ms: u128,
    pub report: String,
}

/// Drives one interpretation end to end: resolve options, extract, prompt,
/// send, parse, diagnose, render. Holds no mutable state; the session owns
/// all accounting.
pub struct InterpretationService<'a> {
    params: &'a ParamRegistry,
    extractors: &'a ExtractorRegistry,
    checks: &'a DiagnosticRegistry,
    sink: &'a dyn LogSink,
}

impl<'a> InterpretationService<'a> {
    pub fn new(
        params: &'a ParamRegistry,
        extractors: &'a ExtractorRegistry,
        checks: &'a DiagnosticRegistry,
        sink: &'a dyn LogSink,
    ) -> Self {
        Self {
            params,
            extractors,
            checks,
            sink,
        }
    }

    /// One full interpretation over an already-open session. Exactly one
    /// model call is made; recoverable response defects degrade through the
    /// parse tiers instead of failing.
    pub fn interpret(
        &self,
        session: &mut ChatSession,
        input: &ModelInput,
        variable_info: &VariableInfo,
        overrides: &[&PartialOptions],
    ) -> Result<Interpretation, InterpretError> {
        let started = Instant::now();
        let kind = self.params.kind();
        let options = self.params.merge(overrides)?;

        let data = self
            .extractors
            .extract(kind, input, variable_info, &options)?;
        self.sink.log(LogRecord::new(
            LogLevel::Info,
            format!(
                "extracted {} {}(s) over {} variables",
                data.n_components,
                kind.unit_label(),
                data.n_variables
            ),
        ));

        let prompt = build_main_prompt(kind, &data, variable_info, &options);
        if options.echo {
            self.sink
                .log(LogRecord::new(LogLevel::Debug, format!("prompt:\n{prompt}")));
        }

        let raw = session.send(kind, &prompt)?;
        if options.echo {
            self.sink
                .log(LogRecord::new(LogLevel::Debug, format!("response:\n{raw}")));
        }

        let outcome = parse::parse(&raw, &data, &options);
        for warning in &outcome.warnings {
            self.sink
                .log(LogRecord::new(LogLevel::Warn, warning.clone()));
        }
        if outcome.tier.is_placeholder() {
            self.sink.log(LogRecord::new(
                LogLevel::Error,
                "falling back to placeholder interpretations".to_string(),
            ));
        }

        let diagnostics = self.checks.diagnose(&data);
        let snapshot = session.snapshot();
        let elapsed = started.elapsed();
        let report = report::build(
            &data,
            &outcome.result,
            &diagnostics,
            &snapshot,
            elapsed,
            options.report_format,
        );

        Ok(Interpretation {
            data,
            result: outcome.result,
            tier: outcome.tier,
            diagnostics,
            snapshot,
            elapsed_ms: elapsed.as_millis(),
            report,
        })
    }

    /// Convenience wrapper for one-shot callers: opens an ephemeral session,
    /// runs a single interpretation, and drops the session.
    pub fn interpret_once(
        &self,
        model: Box<dyn ChatModel>,
        input: &ModelInput,
        variable_info: &VariableInfo,
        overrides: &[&PartialOptions],
    ) -> Result<Interpretation, InterpretError> {
        let options = self.params.merge(overrides)?;
        let mut session = ChatSession::open(self.params.kind(), model, &options);
        self.interpret(&mut session, input, variable_info, overrides)
    }
}
