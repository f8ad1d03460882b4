use std::collections::VecDeque;
use std::sync::Mutex;

use factorlens_core::{
    AnalysisKind, ChatModel, ChatModelError, ChatReply, ChatSession, ComponentStatus,
    DiagnosticRegistry, ExtractorRegistry, FactorFit, InterpretationService, LogLevel,
    ModelInput, ParamRegistry, ParseTier, PartialOptions, TokenUsage, VariableInfo, VecLogSink,
    NOT_SIGNIFICANT_MARKER, PLACEHOLDER_TEXT,
};

struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    usage_per_call: TokenUsage,
    cumulative: Mutex<TokenUsage>,
}

impl ScriptedModel {
    fn new(replies: Vec<&str>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(str::to_string).collect()),
            usage_per_call: TokenUsage::new(600, 150),
            cumulative: Mutex::new(TokenUsage::default()),
        }
    }
}

impl ChatModel for ScriptedModel {
    fn send(&self, _system: &str, _user: &str) -> Result<ChatReply, ChatModelError> {
        let text = self
            .replies
            .lock()
            .expect("mock mutex poisoned")
            .pop_front()
            .expect("no scripted reply left");
        let mut cumulative = self.cumulative.lock().expect("mock mutex poisoned");
        cumulative.input_tokens += self.usage_per_call.input_tokens;
        cumulative.output_tokens += self.usage_per_call.output_tokens;
        Ok(ChatReply {
            text,
            usage: *cumulative,
        })
    }
}

fn survey_vars() -> VariableInfo {
    VariableInfo::from_pairs([
        ("q1", "I feel energetic at work"),
        ("q2", "I look forward to Mondays"),
        ("q3", "I find my tasks meaningful"),
        ("q4", "My pay reflects my effort"),
        ("q5", "My benefits are competitive"),
    ])
}

fn survey_fit() -> FactorFit {
    FactorFit {
        loadings: vec![
            vec![0.72, 0.08],
            vec![0.66, 0.12],
            vec![0.58, 0.05],
            vec![0.10, 0.81],
            vec![0.14, 0.74],
        ],
        variance_share: Some(vec![0.38, 0.27]),
        rotation: Some("varimax".to_string()),
    }
}

#[test]
fn efa_interpretation_runs_end_to_end() {
    let reply = r#"Here is my analysis:
```json
{
  "Factor_1": {"name": "Work Engagement", "interpretation": "Energy, anticipation and meaning cluster together, with the energy item loading strongest."},
  "Factor_2": {"name": "Compensation Satisfaction", "interpretation": "Pay fairness and benefit quality form a distinct material-reward dimension."}
}
```"#;

    let params = ParamRegistry::for_kind(AnalysisKind::Efa);
    let extractors = ExtractorRegistry::with_builtins();
    let checks = DiagnosticRegistry::with_builtins();
    let sink = VecLogSink::new();
    let service = InterpretationService::new(&params, &extractors, &checks, &sink);

    let interpretation = service
        .interpret_once(
            Box::new(ScriptedModel::new(vec![reply])),
            &ModelInput::Fit(survey_fit()),
            &survey_vars(),
            &[],
        )
        .expect("interpretation succeeds");

    assert_eq!(interpretation.tier, ParseTier::Structured);
    assert_eq!(interpretation.data.component_keys(), vec!["Factor_1", "Factor_2"]);
    assert_eq!(interpretation.result["Factor_1"].name, "Work Engagement");
    assert!(!interpretation.diagnostics.has_warnings);

    assert!(interpretation.report.contains("## Factor_1: Work Engagement"));
    assert!(interpretation.report.contains("## Factor_2: Compensation Satisfaction"));
    assert!(interpretation.report.contains("Variance explained"));
    assert!(!interpretation.report.contains("Diagnostics"));

    assert_eq!(interpretation.snapshot.calls, 1);
    assert_eq!(interpretation.snapshot.input_tokens, 600);
    assert_eq!(interpretation.snapshot.output_tokens, 150);
}

#[test]
fn emergency_component_flows_through_prompt_report_and_diagnostics() {
    // No variable clears the cutoff on the second factor.
    let fit = FactorFit {
        loadings: vec![
            vec![0.72, 0.10],
            vec![0.66, 0.12],
            vec![0.58, 0.05],
            vec![0.55, 0.22],
            vec![0.48, 0.18],
        ],
        variance_share: None,
        rotation: None,
    };
    let reply = r#"{
        "Factor_1": {"name": "Engagement", "interpretation": "A broad engagement dimension."},
        "Factor_2": {"name": "Residual", "interpretation": "Weak associations only; no item passes the threshold."}
    }"#;

    let params = ParamRegistry::for_kind(AnalysisKind::Efa);
    let extractors = ExtractorRegistry::with_builtins();
    let checks = DiagnosticRegistry::with_builtins();
    let sink = VecLogSink::new();
    let service = InterpretationService::new(&params, &extractors, &checks, &sink);

    let interpretation = service
        .interpret_once(
            Box::new(ScriptedModel::new(vec![reply])),
            &ModelInput::Fit(fit),
            &survey_vars(),
            &[],
        )
        .expect("interpretation succeeds");

    let second = interpretation.data.component(2).expect("second factor");
    assert_eq!(second.status, ComponentStatus::EmergencyFilled);
    assert_eq!(second.indicators.len(), 2);

    assert!(interpretation
        .report
        .contains(&format!("Factor_2: Residual {NOT_SIGNIFICANT_MARKER}")));
    assert!(interpretation.diagnostics.has_warnings);
    assert!(interpretation
        .diagnostics
        .warnings
        .iter()
        .any(|warning| warning.starts_with("emergency-substitution")));
}

#[test]
fn pca_record_input_with_unusable_reply_degrades_to_placeholder() {
    let record = serde_json::json!({
        "loadings": [
            [0.72, 0.08],
            [0.66, 0.12],
            [0.58, 0.05],
            [0.10, 0.81],
            [0.14, 0.74]
        ],
        "variance_share": [0.38, 0.27]
    });

    let params = ParamRegistry::for_kind(AnalysisKind::Pca);
    let extractors = ExtractorRegistry::with_builtins();
    let checks = DiagnosticRegistry::with_builtins();
    let sink = VecLogSink::new();
    let service = InterpretationService::new(&params, &extractors, &checks, &sink);

    let interpretation = service
        .interpret_once(
            Box::new(ScriptedModel::new(vec![
                "As a language model I prefer to answer in free prose.",
            ])),
            &ModelInput::Record(record),
            &survey_vars(),
            &[],
        )
        .expect("pipeline degrades instead of failing");

    assert_eq!(interpretation.tier, ParseTier::Placeholder);
    assert_eq!(
        interpretation.data.component_keys(),
        vec!["Component_1", "Component_2"]
    );
    for key in interpretation.data.component_keys() {
        assert_eq!(interpretation.result[&key].text, PLACEHOLDER_TEXT);
    }
    assert!(!sink.messages_at(LogLevel::Warn).is_empty());
    assert!(!sink.messages_at(LogLevel::Error).is_empty());
}

#[test]
fn session_is_reusable_across_sequential_interpretations() {
    let reply = r#"{
        "Factor_1": {"name": "Engagement", "interpretation": "Energy and meaning."},
        "Factor_2": {"name": "Compensation", "interpretation": "Pay and benefits."}
    }"#;

    let params = ParamRegistry::for_kind(AnalysisKind::Efa);
    let extractors = ExtractorRegistry::with_builtins();
    let checks = DiagnosticRegistry::with_builtins();
    let sink = VecLogSink::new();
    let service = InterpretationService::new(&params, &extractors, &checks, &sink);

    let options = params.merge(&[]).expect("defaults");
    let mut session = ChatSession::open(
        AnalysisKind::Efa,
        Box::new(ScriptedModel::new(vec![reply, reply])),
        &options,
    );

    let first = service
        .interpret(&mut session, &ModelInput::Fit(survey_fit()), &survey_vars(), &[])
        .expect("first interpretation");
    let second = service
        .interpret(&mut session, &ModelInput::Fit(survey_fit()), &survey_vars(), &[])
        .expect("second interpretation");

    assert_eq!(first.snapshot.calls, 1);
    assert_eq!(second.snapshot.calls, 2);
    // The mock reports cumulative counts; the session accumulates deltas.
    assert_eq!(second.snapshot.input_tokens, 1200);
    assert_eq!(second.snapshot.output_tokens, 300);
}

#[test]
fn overrides_change_cutoff_and_report_format() {
    let reply = r#"{
        "Factor_1": {"name": "Engagement", "interpretation": "Energy and meaning."},
        "Factor_2": {"name": "Compensation", "interpretation": "Pay and benefits."}
    }"#;

    let params = ParamRegistry::for_kind(AnalysisKind::Efa);
    let extractors = ExtractorRegistry::with_builtins();
    let checks = DiagnosticRegistry::with_builtins();
    let sink = VecLogSink::new();
    let service = InterpretationService::new(&params, &extractors, &checks, &sink);

    let overrides = PartialOptions {
        cutoff: Some(0.6),
        report_format: Some(factorlens_core::ReportFormat::Plain),
        ..Default::default()
    };

    let interpretation = service
        .interpret_once(
            Box::new(ScriptedModel::new(vec![reply])),
            &ModelInput::Fit(survey_fit()),
            &survey_vars(),
            &[&overrides],
        )
        .expect("interpretation succeeds");

    assert!((interpretation.data.cutoff - 0.6).abs() < 1e-9);
    // q3 (0.58) no longer clears the raised cutoff on factor 1.
    let first = interpretation.data.component(1).expect("first factor");
    assert_eq!(first.indicators.len(), 2);
    assert!(!interpretation.report.contains("##"));
}
