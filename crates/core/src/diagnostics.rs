use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::extract::{AnalysisData, AnalysisKind, ComponentStatus};

/// Result of one data-quality check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckOutcome {
    pub triggered: bool,
    pub affected: Vec<String>,
    pub detail: String,
}

impl CheckOutcome {
    pub fn clear() -> Self {
        Self {
            triggered: false,
            affected: Vec::new(),
            detail: String::new(),
        }
    }

    pub fn triggered(affected: Vec<String>, detail: impl Into<String>) -> Self {
        Self {
            triggered: true,
            affected,
            detail: detail.into(),
        }
    }
}

pub type CheckFn = fn(&AnalysisData) -> CheckOutcome;

#[derive(Clone)]
pub struct DiagnosticCheck {
    pub name: &'static str,
    pub run: CheckFn,
}

/// Purely observational findings, computed strictly after the LLM call.
/// They never feed back into the prompt.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub has_warnings: bool,
    pub warnings: Vec<String>,
    pub notes: Vec<String>,
}

/// Per-kind ordered list of independent checks. Warnings render in
/// declaration order; registering a kind is additive.
#[derive(Clone, Default)]
pub struct DiagnosticRegistry {
    checks: BTreeMap<AnalysisKind, Vec<DiagnosticCheck>>,
}

impl DiagnosticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for kind in [AnalysisKind::Efa, AnalysisKind::Pca] {
            registry.register(
                kind,
                DiagnosticCheck {
                    name: "cross-loading",
                    run: check_cross_loading,
                },
            );
            registry.register(
                kind,
                DiagnosticCheck {
                    name: "orphaned",
                    run: check_orphaned,
                },
            );
            registry.register(
                kind,
                DiagnosticCheck {
                    name: "emergency-substitution",
                    run: check_emergency_substitution,
                },
            );
        }
        registry
    }

    pub fn register(&mut self, kind: AnalysisKind, check: DiagnosticCheck) {
        self.checks.entry(kind).or_default().push(check);
    }

    pub fn diagnose(&self, data: &AnalysisData) -> Diagnostics {
        let mut diagnostics = Diagnostics::default();
        let Some(checks) = self.checks.get(&data.kind) else {
            return diagnostics;
        };

        for check in checks {
            let outcome = (check.run)(data);
            if outcome.triggered {
                diagnostics
                    .warnings
                    .push(format!("{}: {}", check.name, outcome.detail));
            }
        }

        diagnostics.has_warnings = !diagnostics.warnings.is_empty();
        diagnostics
            .notes
            .push(format!("{} checks evaluated", checks.len()));
        diagnostics
    }
}

/// Indicator significant on two or more components.
fn check_cross_loading(data: &AnalysisData) -> CheckOutcome {
    let mut affected = Vec::new();
    for (row, name) in data.variable_names.iter().enumerate() {
        let hits = significant_components(data, row);
        if hits.len() >= 2 {
            affected.push(format!("{} ({})", name, hits.join(", ")));
        }
    }

    if affected.is_empty() {
        CheckOutcome::clear()
    } else {
        let detail = format!(
            "indicators load above {:.2} on multiple {}s: {}",
            data.cutoff,
            data.kind.unit_label(),
            affected.join("; ")
        );
        CheckOutcome::triggered(affected, detail)
    }
}

/// Indicator significant on no component at all.
fn check_orphaned(data: &AnalysisData) -> CheckOutcome {
    let mut affected = Vec::new();
    for (row, name) in data.variable_names.iter().enumerate() {
        if significant_components(data, row).is_empty() {
            affected.push(name.clone());
        }
    }

    if affected.is_empty() {
        CheckOutcome::clear()
    } else {
        let detail = format!(
            "indicators load above {:.2} on no {}: {}",
            data.cutoff,
            data.kind.unit_label(),
            affected.join(", ")
        );
        CheckOutcome::triggered(affected, detail)
    }
}

/// Components whose indicator set came from the emergency rule, or stayed
/// empty because the emergency count was zero.
fn check_emergency_substitution(data: &AnalysisData) -> CheckOutcome {
    let mut affected = Vec::new();
    let mut details = Vec::new();
    for component in &data.components {
        match component.status {
            ComponentStatus::Regular => {}
            ComponentStatus::EmergencyFilled => {
                affected.push(component.key.clone());
                details.push(format!(
                    "{} has no indicator above {:.2}; its {} strongest indicators were \
                     substituted",
                    component.key,
                    data.cutoff,
                    component.indicators.len()
                ));
            }
            ComponentStatus::Undefined => {
                affected.push(component.key.clone());
                details.push(format!(
                    "{} has no indicator above {:.2} and remains undefined",
                    component.key, data.cutoff
                ));
            }
        }
    }

    if affected.is_empty() {
        CheckOutcome::clear()
    } else {
        CheckOutcome::triggered(affected, details.join("; "))
    }
}

fn significant_components(data: &AnalysisData, row: usize) -> Vec<String> {
    data.components
        .iter()
        .enumerate()
        .filter(|(column, _)| data.loadings[row][*column].abs() >= data.cutoff)
        .map(|(_, component)| component.key.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParamRegistry;
    use crate::extract::{ExtractorRegistry, FactorFit, ModelInput, VariableInfo};

    fn extract(loadings: Vec<Vec<f64>>, emergency_top_n: usize) -> AnalysisData {
        let mut options = ParamRegistry::for_kind(AnalysisKind::Efa)
            .merge(&[])
            .expect("defaults");
        options.emergency_top_n = emergency_top_n;
        let n = loadings.len();
        let vars = VariableInfo::from_pairs(
            (1..=n).map(|i| (format!("q{i}"), format!("question {i}"))),
        );
        ExtractorRegistry::with_builtins()
            .extract(
                AnalysisKind::Efa,
                &ModelInput::Fit(FactorFit {
                    loadings,
                    variance_share: None,
                    rotation: None,
                }),
                &vars,
                &options,
            )
            .expect("extraction succeeds")
    }

    #[test]
    fn clean_solution_produces_no_warnings() {
        let data = extract(
            vec![vec![0.7, 0.1], vec![0.6, 0.1], vec![0.1, 0.8]],
            2,
        );
        let diagnostics = DiagnosticRegistry::with_builtins().diagnose(&data);
        assert!(!diagnostics.has_warnings);
        assert!(diagnostics.warnings.is_empty());
    }

    #[test]
    fn cross_loading_indicator_is_reported() {
        let data = extract(
            vec![vec![0.7, 0.5], vec![0.6, 0.1], vec![0.1, 0.8]],
            2,
        );
        let diagnostics = DiagnosticRegistry::with_builtins().diagnose(&data);
        assert!(diagnostics.has_warnings);
        assert!(diagnostics.warnings[0].starts_with("cross-loading"));
        assert!(diagnostics.warnings[0].contains("q1"));
    }

    #[test]
    fn orphaned_indicator_is_reported() {
        let data = extract(
            vec![vec![0.7, 0.1], vec![0.1, 0.1], vec![0.1, 0.8]],
            2,
        );
        let diagnostics = DiagnosticRegistry::with_builtins().diagnose(&data);
        assert!(diagnostics
            .warnings
            .iter()
            .any(|warning| warning.starts_with("orphaned") && warning.contains("q2")));
    }

    #[test]
    fn emergency_substitution_is_reported_after_the_fact() {
        let data = extract(
            vec![vec![0.7, 0.1], vec![0.6, 0.1], vec![0.5, 0.2]],
            2,
        );
        let diagnostics = DiagnosticRegistry::with_builtins().diagnose(&data);
        assert!(diagnostics
            .warnings
            .iter()
            .any(|warning| warning.contains("Factor_2") && warning.contains("substituted")));
    }

    #[test]
    fn warnings_render_in_declaration_order() {
        // q1 cross-loads and q2 is orphaned: cross-loading is declared first.
        let data = extract(
            vec![vec![0.7, 0.5], vec![0.1, 0.1], vec![0.1, 0.8]],
            2,
        );
        let diagnostics = DiagnosticRegistry::with_builtins().diagnose(&data);
        assert!(diagnostics.warnings.len() >= 2);
        assert!(diagnostics.warnings[0].starts_with("cross-loading"));
        assert!(diagnostics.warnings[1].starts_with("orphaned"));
    }
}
