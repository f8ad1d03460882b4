use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::extract::AnalysisKind;
use crate::report::ReportFormat;

fn default_cutoff() -> f64 {
    0.3
}

fn default_emergency_top_n() -> usize {
    2
}

fn default_word_limit() -> u32 {
    120
}

fn default_min_coverage() -> f64 {
    0.5
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for `{name}`: {reason}")]
    InvalidParam { name: String, reason: String },
    #[error("unknown parameter `{0}`")]
    UnknownParam(String),
}

/// Outcome of validating a single parameter. Ordinary violations are data,
/// not panics; only the orchestrator entry point turns them into errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Verdict {
    Ok,
    Invalid { reason: String },
}

impl Verdict {
    pub fn is_ok(&self) -> bool {
        matches!(self, Verdict::Ok)
    }

    fn invalid(reason: impl Into<String>) -> Self {
        Verdict::Invalid {
            reason: reason.into(),
        }
    }
}

/// A parameter value as seen by `ParamRegistry::validate`.
#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
    Number(f64),
    Integer(u64),
    Text(String),
    Flag(bool),
}

/// Fully resolved and validated configuration for one interpretation call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterpretationOptions {
    pub cutoff: f64,
    pub emergency_top_n: usize,
    pub word_limit: u32,
    pub min_coverage: f64,
    pub context: String,
    pub guidelines: Option<String>,
    pub report_format: ReportFormat,
    pub echo: bool,
}

impl InterpretationOptions {
    /// Lower bound of the per-component word band (80% of the limit).
    pub fn word_floor(&self) -> u32 {
        (self.word_limit as f64 * 0.8).round() as u32
    }
}

/// Partial parameter map, one precedence layer of `ParamRegistry::merge`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialOptions {
    #[serde(default)]
    pub cutoff: Option<f64>,
    #[serde(default)]
    pub emergency_top_n: Option<usize>,
    #[serde(default)]
    pub word_limit: Option<u32>,
    #[serde(default)]
    pub min_coverage: Option<f64>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub guidelines: Option<String>,
    #[serde(default)]
    pub report_format: Option<ReportFormat>,
    #[serde(default)]
    pub echo: Option<bool>,
}

impl PartialOptions {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Read-mostly table of parameter defaults and validators for one analysis
/// kind. Constructed explicitly at startup and injected; never ambient.
#[derive(Clone, Debug)]
pub struct ParamRegistry {
    kind: AnalysisKind,
    defaults: InterpretationOptions,
}

impl ParamRegistry {
    pub fn for_kind(kind: AnalysisKind) -> Self {
        Self {
            kind,
            defaults: InterpretationOptions {
                cutoff: default_cutoff(),
                emergency_top_n: default_emergency_top_n(),
                word_limit: default_word_limit(),
                min_coverage: default_min_coverage(),
                context: String::new(),
                guidelines: None,
                report_format: ReportFormat::Markdown,
                echo: false,
            },
        }
    }

    pub fn kind(&self) -> AnalysisKind {
        self.kind
    }

    pub fn defaults(&self) -> &InterpretationOptions {
        &self.defaults
    }

    pub fn validate(&self, name: &str, value: &ParamValue) -> Verdict {
        match (name, value) {
            ("cutoff", ParamValue::Number(v)) => {
                if *v > 0.0 && *v < 1.0 {
                    Verdict::Ok
                } else {
                    Verdict::invalid(format!("cutoff must lie in (0, 1), got {v}"))
                }
            }
            ("emergency_top_n", ParamValue::Integer(_)) => Verdict::Ok,
            ("word_limit", ParamValue::Integer(v)) => {
                if *v > 0 {
                    Verdict::Ok
                } else {
                    Verdict::invalid("word_limit must be positive")
                }
            }
            ("min_coverage", ParamValue::Number(v)) => {
                if *v > 0.0 && *v <= 1.0 {
                    Verdict::Ok
                } else {
                    Verdict::invalid(format!("min_coverage must lie in (0, 1], got {v}"))
                }
            }
            ("context", ParamValue::Text(_))
            | ("guidelines", ParamValue::Text(_))
            | ("echo", ParamValue::Flag(_))
            | ("report_format", ParamValue::Text(_)) => Verdict::Ok,
            ("cutoff" | "min_coverage", _) => Verdict::invalid("expected a number"),
            ("emergency_top_n" | "word_limit", _) => Verdict::invalid("expected an integer"),
            ("context" | "guidelines" | "report_format", _) => Verdict::invalid("expected text"),
            ("echo", _) => Verdict::invalid("expected a flag"),
            _ => Verdict::invalid(format!("unknown parameter `{name}`")),
        }
    }

    /// Resolve ordered partial sources (highest precedence first) against the
    /// registry defaults into one validated configuration. Fails fast so bad
    /// input never reaches an LLM call.
    pub fn merge(&self, sources: &[&PartialOptions]) -> Result<InterpretationOptions, ConfigError> {
        fn pick<T: Clone>(sources: &[&PartialOptions], get: impl Fn(&PartialOptions) -> Option<T>) -> Option<T> {
            sources.iter().find_map(|source| get(source))
        }

        let resolved = InterpretationOptions {
            cutoff: pick(sources, |s| s.cutoff).unwrap_or(self.defaults.cutoff),
            emergency_top_n: pick(sources, |s| s.emergency_top_n)
                .unwrap_or(self.defaults.emergency_top_n),
            word_limit: pick(sources, |s| s.word_limit).unwrap_or(self.defaults.word_limit),
            min_coverage: pick(sources, |s| s.min_coverage).unwrap_or(self.defaults.min_coverage),
            context: pick(sources, |s| s.context.clone()).unwrap_or_default(),
            guidelines: pick(sources, |s| s.guidelines.clone()),
            report_format: pick(sources, |s| s.report_format).unwrap_or(self.defaults.report_format),
            echo: pick(sources, |s| s.echo).unwrap_or(self.defaults.echo),
        };

        self.check(&resolved)?;
        Ok(resolved)
    }

    fn check(&self, options: &InterpretationOptions) -> Result<(), ConfigError> {
        let checks = [
            ("cutoff", ParamValue::Number(options.cutoff)),
            (
                "emergency_top_n",
                ParamValue::Integer(options.emergency_top_n as u64),
            ),
            ("word_limit", ParamValue::Integer(options.word_limit as u64)),
            ("min_coverage", ParamValue::Number(options.min_coverage)),
        ];

        for (name, value) in checks {
            if let Verdict::Invalid { reason } = self.validate(name, &value) {
                return Err(ConfigError::InvalidParam {
                    name: name.to_string(),
                    reason,
                });
            }
        }
        Ok(())
    }
}
