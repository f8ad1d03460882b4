pub mod config;
pub mod diagnostics;
pub mod extract;
pub mod interpret;
pub mod logging;
pub mod model;
pub mod parse;
pub mod prompt;
pub mod report;
pub mod session;

pub use config::{
    ConfigError, InterpretationOptions, ParamRegistry, ParamValue, PartialOptions, Verdict,
};
pub use diagnostics::{
    CheckFn, CheckOutcome, DiagnosticCheck, DiagnosticRegistry, Diagnostics,
};
pub use extract::{
    AnalysisData, AnalysisKind, ComponentStatus, ComponentSummary, ExtractError, ExtractorFn,
    ExtractorRegistry, FactorFit, Indicator, InputShape, ModelInput, VariableInfo, VariableRow,
};
pub use interpret::{Interpretation, InterpretationService, InterpretError};
pub use logging::{LogLevel, LogRecord, LogSink, NullLogSink, StdoutLogSink, VecLogSink};
pub use model::{ChatModel, ChatModelError, ChatReply, TokenUsage};
pub use parse::{ComponentReading, ParseOutcome, ParsedResult, ParseTier, PLACEHOLDER_TEXT};
pub use prompt::{build_main_prompt, build_system_prompt, NOT_SIGNIFICANT_MARKER};
pub use report::{FormatTable, ReportFormat};
pub use session::{ChatSession, SessionError, SessionSnapshot};
