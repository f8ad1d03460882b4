use std::fmt::Write as _;

use crate::config::InterpretationOptions;
use crate::extract::{AnalysisData, AnalysisKind, ComponentStatus, VariableInfo};

/// Placeholder name given to components whose indicator set came from the
/// emergency rule or stayed empty.
pub const NOT_SIGNIFICANT_MARKER: &str = "(not significant)";

/// Stable persona and term definitions, sent once per session.
pub fn build_system_prompt(kind: AnalysisKind, options: &InterpretationOptions) -> String {
    let mut prompt = String::new();
    let _ = writeln!(
        prompt,
        "You are an experienced psychometrician interpreting the results of an {}.",
        kind.label()
    );
    let _ = writeln!(
        prompt,
        "A {unit} groups observed variables; an indicator is a variable whose loading on a {unit} \
         is at least {cutoff:.2} in absolute value and therefore counts as significant.",
        unit = kind.unit_label(),
        cutoff = options.cutoff
    );
    prompt.push_str(
        "Loadings close to 1 or -1 indicate a strong association; the sign gives its direction. \
         Base every statement only on the data provided by the user.\n",
    );
    prompt
}

/// Main prompt, fixed section order: guidelines, optional context, variable
/// descriptions, compact data encoding, output contract with a literal
/// worked example keyed by the real component identifiers.
pub fn build_main_prompt(
    kind: AnalysisKind,
    data: &AnalysisData,
    variable_info: &VariableInfo,
    options: &InterpretationOptions,
) -> String {
    let mut prompt = String::new();

    prompt.push_str("## Task\n");
    match &options.guidelines {
        Some(custom) => {
            prompt.push_str(custom.trim());
            prompt.push('\n');
        }
        None => push_default_guidelines(&mut prompt, kind, options),
    }

    let context = options.context.trim();
    if !context.is_empty() {
        prompt.push_str("\n## Additional context\n");
        prompt.push_str(context);
        prompt.push('\n');
    }

    prompt.push_str("\n## Variables\n");
    for row in variable_info.rows() {
        let _ = writeln!(prompt, "- {}: {}", row.name, row.description);
    }

    let _ = write!(prompt, "\n## {} results\n", title_case(kind.unit_label()));
    for component in &data.components {
        let share = component
            .variance_share
            .map(|share| format!("{:.1}% variance", share * 100.0))
            .unwrap_or_else(|| "variance share unavailable".to_string());
        let indicators = if component.indicators.is_empty() {
            format!("no indicator reached the cutoff of {:.2}", data.cutoff)
        } else {
            component
                .indicators
                .iter()
                .map(|indicator| format!("{} ({:+.2})", indicator.name, indicator.loading))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let note = match component.status {
            ComponentStatus::Regular => "",
            ComponentStatus::EmergencyFilled => {
                " [listed indicators are below the cutoff; strongest shown]"
            }
            ComponentStatus::Undefined => " [undefined]",
        };
        let _ = writeln!(prompt, "- {}: {share}; loadings: {indicators}{note}", component.key);
    }

    push_output_contract(&mut prompt, data, options);
    prompt
}

fn push_default_guidelines(
    prompt: &mut String,
    kind: AnalysisKind,
    options: &InterpretationOptions,
) {
    let _ = writeln!(
        prompt,
        "Name each {unit} with a short label (max 4 words) that captures what its indicators \
         share, then interpret it.",
        unit = kind.unit_label()
    );
    let _ = writeln!(
        prompt,
        "Write {floor}-{limit} words per {unit}. Discuss only indicators listed for that {unit} \
         and mention the strongest ones first.",
        floor = options.word_floor(),
        limit = options.word_limit,
        unit = kind.unit_label()
    );
}

fn push_output_contract(prompt: &mut String, data: &AnalysisData, options: &InterpretationOptions) {
    let keys = data.component_keys();

    prompt.push_str("\n## Output format\n");
    prompt.push_str(
        "Reply with one JSON object and nothing else. Each value is an object with a \"name\" \
         and an \"interpretation\" field. Example:\n",
    );

    // A literal worked example keyed by the real identifiers: small and
    // local models format far more reliably from a concrete instance than
    // from an abstract schema description.
    prompt.push_str("```json\n{\n");
    for (position, key) in keys.iter().enumerate() {
        let comma = if position + 1 < keys.len() { "," } else { "" };
        let _ = writeln!(
            prompt,
            "  \"{key}\": {{\"name\": \"Example label\", \"interpretation\": \"Concise narrative \
             for {key}.\"}}{comma}"
        );
    }
    prompt.push_str("}\n```\n");

    let _ = writeln!(
        prompt,
        "Required keys, exactly these and no others: {}.",
        keys.join(", ")
    );
    let _ = writeln!(
        prompt,
        "Hard constraints: valid JSON only, no prose outside the object, {}-{} words per \
         interpretation.",
        options.word_floor(),
        options.word_limit
    );
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
