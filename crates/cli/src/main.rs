use clap::{Args, Parser, Subcommand};
use factorlens_adapters::{create_chat_adapter, AdapterError, ProfileStore};
use factorlens_core::{
    AnalysisKind, ChatModel, DiagnosticRegistry, ExtractorRegistry, FactorFit, InterpretError,
    InterpretationService, LogLevel, LogRecord, LogSink, ModelInput, ParamRegistry,
    PartialOptions, ReportFormat, StdoutLogSink, VariableInfo, VariableRow,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let sink = StdoutLogSink::new();

    match cli.command {
        Command::Interpret(args) => run_interpret(&cli.config, args, &sink),
        Command::Config(command) => handle_config(&cli.config, command, &sink),
    }
}

fn handle_config(
    config_path: &Path,
    command: ConfigCommand,
    sink: &dyn LogSink,
) -> Result<(), CliError> {
    match command {
        ConfigCommand::TestLlm(args) => run_test_llm(config_path, args, sink),
    }
}

fn run_interpret(
    config_path: &Path,
    args: InterpretArgs,
    sink: &dyn LogSink,
) -> Result<(), CliError> {
    let store = load_store(config_path)?;
    let kind = parse_kind(&args.kind)?;

    let input = load_model_input(&args.fit, args.shape)?;
    let variable_info = load_variable_info(&args.vars)?;
    let guidelines = args.load_guidelines()?;
    let overrides = args.to_overrides(&guidelines)?;

    let params = ParamRegistry::for_kind(kind);
    let extractors = ExtractorRegistry::with_builtins();
    let checks = DiagnosticRegistry::with_builtins();
    let service = InterpretationService::new(&params, &extractors, &checks, sink);

    sink.log(LogRecord::new(
        LogLevel::Info,
        format!("interpreting {} results from {}", kind, args.fit.display()),
    ));

    let model = create_chat_adapter(&store, args.profile.as_deref())?;
    let interpretation =
        service.interpret_once(model, &input, &variable_info, &[&overrides, &store.options])?;

    if interpretation.diagnostics.has_warnings {
        for warning in &interpretation.diagnostics.warnings {
            sink.log(LogRecord::new(LogLevel::Warn, warning.clone()));
        }
    }
    sink.log(LogRecord::new(
        LogLevel::Info,
        format!(
            "used {} tokens across {} call(s)",
            interpretation.snapshot.total_tokens(),
            interpretation.snapshot.calls
        ),
    ));

    match &args.output {
        Some(path) => {
            fs::write(path, &interpretation.report).map_err(|source| CliError::Io {
                path: path.clone(),
                source,
            })?;
            sink.log(LogRecord::new(
                LogLevel::Info,
                format!("report written to {}", path.display()),
            ));
        }
        None => println!("{}", interpretation.report),
    }

    Ok(())
}

fn run_test_llm(
    config_path: &Path,
    args: TestLlmArgs,
    sink: &dyn LogSink,
) -> Result<(), CliError> {
    let store = load_store(config_path)?;
    let model = create_chat_adapter(&store, args.profile.as_deref())?;

    sink.log(LogRecord::new(
        LogLevel::Info,
        "sending test prompt to the configured provider".to_string(),
    ));

    let reply = model
        .send("You are a helpful assistant.", "Reply with the single word: ok")
        .map_err(|err| CliError::TestFailed(err.to_string()))?;

    sink.log(LogRecord::new(
        LogLevel::Info,
        format!(
            "provider answered ({} tokens): {}",
            reply.usage.total(),
            reply.text.trim()
        ),
    ));
    Ok(())
}

fn load_store(path: &Path) -> Result<ProfileStore, CliError> {
    if path.exists() {
        Ok(ProfileStore::from_path(path)?)
    } else {
        Err(CliError::MissingConfig(path.to_path_buf()))
    }
}

fn load_model_input(path: &Path, shape: InputShapeArg) -> Result<ModelInput, CliError> {
    let data = fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: serde_json::Value =
        serde_json::from_str(&data).map_err(|err| CliError::InvalidInput {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;

    match shape {
        InputShapeArg::Fit => {
            let fit: FactorFit =
                serde_json::from_value(value).map_err(|err| CliError::InvalidInput {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                })?;
            Ok(ModelInput::Fit(fit))
        }
        InputShapeArg::Record => Ok(ModelInput::Record(value)),
    }
}

fn load_variable_info(path: &Path) -> Result<VariableInfo, CliError> {
    let data = fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let rows: Vec<VariableRow> =
        serde_json::from_str(&data).map_err(|err| CliError::InvalidInput {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
    Ok(VariableInfo::new(rows))
}

fn parse_kind(value: &str) -> Result<AnalysisKind, CliError> {
    match value.trim().to_lowercase().as_str() {
        "efa" | "factor" => Ok(AnalysisKind::Efa),
        "pca" | "component" => Ok(AnalysisKind::Pca),
        other => Err(CliError::UnknownKind(other.to_string())),
    }
}

fn parse_format(value: &str) -> Result<ReportFormat, CliError> {
    match value.trim().to_lowercase().as_str() {
        "markdown" | "md" => Ok(ReportFormat::Markdown),
        "plain" | "text" => Ok(ReportFormat::Plain),
        other => Err(CliError::UnknownFormat(other.to_string())),
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("config file not found: {0}")]
    MissingConfig(PathBuf),
    #[error("unknown analysis kind `{0}`, expected `efa` or `pca`")]
    UnknownKind(String),
    #[error("unknown report format `{0}`, expected `markdown` or `plain`")]
    UnknownFormat(String),
    #[error("failed to read `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not parse `{path}`: {reason}")]
    InvalidInput { path: PathBuf, reason: String },
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),
    #[error("interpretation failed: {0}")]
    Interpret(#[from] InterpretError),
    #[error("{0}")]
    TestFailed(String),
}

#[derive(Parser)]
#[command(
    name = "factorlens",
    version,
    about = "Narrative interpretation of factor and principal component analyses"
)]
struct Cli {
    /// Path to the provider profile store
    #[arg(long, global = true, default_value = "profiles.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interpret a fitted decomposition and render a report
    Interpret(InterpretArgs),
    /// Configuration related operations
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Test the configured chat provider with a tiny prompt
    TestLlm(TestLlmArgs),
}

#[derive(Args)]
struct InterpretArgs {
    /// Analysis kind: `efa` or `pca`
    #[arg(long, default_value = "efa")]
    kind: String,
    /// JSON file with the fitted model (loadings, optional variance_share and rotation)
    #[arg(long, value_name = "FILE")]
    fit: PathBuf,
    /// JSON file with variable names and descriptions
    #[arg(long, value_name = "FILE")]
    vars: PathBuf,
    /// How to read the fit file
    #[arg(long, value_enum, default_value_t = InputShapeArg::Fit)]
    shape: InputShapeArg,
    /// Provider profile name, defaults to the store's default profile
    #[arg(long)]
    profile: Option<String>,
    /// Write the report here instead of stdout
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,
    /// Report format: `markdown` or `plain`
    #[arg(long)]
    format: Option<String>,
    /// Absolute loading cutoff for significance
    #[arg(long)]
    cutoff: Option<f64>,
    /// Indicators substituted when nothing clears the cutoff
    #[arg(long, value_name = "N")]
    emergency_top_n: Option<usize>,
    /// Word limit per component narrative
    #[arg(long, value_name = "WORDS")]
    word_limit: Option<u32>,
    /// Study context passed to the model
    #[arg(long, value_name = "TEXT")]
    context: Option<String>,
    /// File with custom prompt guidelines, replaces the built-in rules
    #[arg(long, value_name = "FILE")]
    guidelines_file: Option<PathBuf>,
    /// Echo prompts and raw responses to the log
    #[arg(long)]
    echo: bool,
}

impl InterpretArgs {
    fn load_guidelines(&self) -> Result<Option<String>, CliError> {
        match &self.guidelines_file {
            Some(path) => fs::read_to_string(path)
                .map(Some)
                .map_err(|source| CliError::Io {
                    path: path.clone(),
                    source,
                }),
            None => Ok(None),
        }
    }

    fn to_overrides(&self, guidelines: &Option<String>) -> Result<PartialOptions, CliError> {
        Ok(PartialOptions {
            cutoff: self.cutoff,
            emergency_top_n: self.emergency_top_n,
            word_limit: self.word_limit,
            min_coverage: None,
            context: self.context.clone(),
            guidelines: guidelines.clone(),
            report_format: self.format.as_deref().map(parse_format).transpose()?,
            echo: if self.echo { Some(true) } else { None },
        })
    }
}

#[derive(Args)]
struct TestLlmArgs {
    /// Provider profile name, defaults to the store's default profile
    #[arg(long)]
    profile: Option<String>,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum InputShapeArg {
    /// Typed fit object
    Fit,
    /// Generic structured record
    Record,
}
