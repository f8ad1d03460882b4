use std::fmt::Write as _;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::diagnostics::Diagnostics;
use crate::extract::{AnalysisData, ComponentStatus};
use crate::parse::ParsedResult;
use crate::prompt::NOT_SIGNIFICANT_MARKER;
use crate::session::SessionSnapshot;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Markdown,
    Plain,
}

/// Table of primitive renderers for one output format. The composition in
/// `build` is format-agnostic; adding a format means adding a table here.
pub struct FormatTable {
    pub heading: fn(usize, &str) -> String,
    pub emphasis: fn(&str) -> String,
    pub rule: fn() -> String,
    pub list_item: fn(&str) -> String,
    pub table_row: fn(&[String]) -> String,
}

const MARKDOWN: FormatTable = FormatTable {
    heading: |level, text| format!("{} {}\n", "#".repeat(level), text),
    emphasis: |text| format!("**{text}**"),
    rule: || "\n---\n".to_string(),
    list_item: |text| format!("- {text}\n"),
    table_row: |cells| format!("| {} |\n", cells.join(" | ")),
};

const PLAIN: FormatTable = FormatTable {
    heading: |level, text| {
        if level <= 1 {
            format!("{}\n{}\n", text.to_uppercase(), "=".repeat(text.len()))
        } else {
            format!("{}\n{}\n", text, "-".repeat(text.len()))
        }
    },
    emphasis: |text| text.to_string(),
    rule: || format!("\n{}\n", "-".repeat(40)),
    list_item: |text| format!("  * {text}\n"),
    table_row: |cells| format!("  {}\n", cells.join("  ")),
};

impl FormatTable {
    pub fn for_format(format: ReportFormat) -> &'static FormatTable {
        match format {
            ReportFormat::Markdown => &MARKDOWN,
            ReportFormat::Plain => &PLAIN,
        }
    }
}

/// Renders the final narrative: header, per-component subsections in index
/// order, an optional supplementary section, and diagnostics when present.
pub fn build(
    data: &AnalysisData,
    parsed: &ParsedResult,
    diagnostics: &Diagnostics,
    snapshot: &SessionSnapshot,
    elapsed: Duration,
    format: ReportFormat,
) -> String {
    let table = FormatTable::for_format(format);
    let mut out = String::new();

    out.push_str(&(table.heading)(
        1,
        &format!("Interpretation of {}", data.kind.label()),
    ));
    out.push_str(&(table.list_item)(&format!(
        "{}s: {}, variables: {}, cutoff: {:.2}",
        data.kind.unit_label(),
        data.n_components,
        data.n_variables,
        data.cutoff
    )));
    if let Some(rotation) = &data.rotation {
        out.push_str(&(table.list_item)(&format!("rotation: {rotation}")));
    }
    out.push_str(&(table.list_item)(&format!(
        "tokens: {} in / {} out across {} call(s), elapsed {:.1}s",
        snapshot.input_tokens,
        snapshot.output_tokens,
        snapshot.calls,
        elapsed.as_secs_f64()
    )));

    for component in &data.components {
        out.push_str(&(table.rule)());
        let reading = parsed.get(&component.key);
        let base_name = reading
            .map(|reading| reading.name.as_str())
            .unwrap_or(component.key.as_str());
        let name = match component.status {
            ComponentStatus::Regular => base_name.to_string(),
            ComponentStatus::EmergencyFilled | ComponentStatus::Undefined => {
                format!("{base_name} {NOT_SIGNIFICANT_MARKER}")
            }
        };
        out.push_str(&(table.heading)(2, &format!("{}: {}", component.key, name)));

        if let Some(reading) = reading {
            out.push_str(reading.text.trim());
            out.push('\n');
        }

        if component.indicators.is_empty() {
            out.push_str(&(table.list_item)("no indicators"));
        } else {
            for indicator in &component.indicators {
                out.push_str(&(table.list_item)(&format!(
                    "{} ({:+.2})",
                    (table.emphasis)(&indicator.name),
                    indicator.loading
                )));
            }
        }
    }

    if let Some(section) = variance_section(data, table) {
        out.push_str(&(table.rule)());
        out.push_str(&section);
    }

    if diagnostics.has_warnings {
        out.push_str(&(table.rule)());
        out.push_str(&(table.heading)(2, "Diagnostics"));
        for warning in &diagnostics.warnings {
            out.push_str(&(table.list_item)(warning));
        }
    }

    out
}

/// Supplementary variance-share table; omitted entirely when no component
/// carries a share.
fn variance_section(data: &AnalysisData, table: &FormatTable) -> Option<String> {
    if data
        .components
        .iter()
        .all(|component| component.variance_share.is_none())
    {
        return None;
    }

    let mut section = String::new();
    section.push_str(&(table.heading)(2, "Variance explained"));
    for component in &data.components {
        let share = component
            .variance_share
            .map(|share| format!("{:.1}%", share * 100.0))
            .unwrap_or_else(|| "n/a".to_string());
        section.push_str(&(table.table_row)(&[component.key.clone(), share]));
    }
    let total: f64 = data
        .components
        .iter()
        .filter_map(|component| component.variance_share)
        .sum();
    let _ = writeln!(section, "Total: {:.1}%", total * 100.0);
    Some(section)
}
