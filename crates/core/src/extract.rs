use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::config::InterpretationOptions;

/// Analysis families the pipeline interprets. The kind supplies the
/// component key prefix, the persona wording, and the diagnostic check set.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisKind {
    Efa,
    Pca,
}

impl AnalysisKind {
    pub fn key_prefix(&self) -> &'static str {
        match self {
            Self::Efa => "Factor",
            Self::Pca => "Component",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Efa => "exploratory factor analysis",
            Self::Pca => "principal component analysis",
        }
    }

    pub fn unit_label(&self) -> &'static str {
        match self {
            Self::Efa => "factor",
            Self::Pca => "component",
        }
    }
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One observed variable and its human-readable description.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableRow {
    pub name: String,
    pub description: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableInfo {
    rows: Vec<VariableRow>,
}

impl VariableInfo {
    pub fn new(rows: Vec<VariableRow>) -> Self {
        Self { rows }
    }

    pub fn from_pairs<I, S, T>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, T)>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            rows: pairs
                .into_iter()
                .map(|(name, description)| VariableRow {
                    name: name.into(),
                    description: description.into(),
                })
                .collect(),
        }
    }

    pub fn rows(&self) -> &[VariableRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().map(|row| row.name.as_str())
    }
}

/// Concrete input shapes the dispatch table distinguishes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum InputShape {
    /// A typed mirror of a fitted statistics-package object.
    FitObject,
    /// A generic structured record with a `loadings` array.
    Record,
}

impl fmt::Display for InputShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FitObject => f.write_str("fit object"),
            Self::Record => f.write_str("structured record"),
        }
    }
}

/// Numeric results of a fitted decomposition. Rows of `loadings` are
/// variables, columns are components.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FactorFit {
    pub loadings: Vec<Vec<f64>>,
    #[serde(default)]
    pub variance_share: Option<Vec<f64>>,
    #[serde(default)]
    pub rotation: Option<String>,
}

#[derive(Clone, Debug)]
pub enum ModelInput {
    Fit(FactorFit),
    Record(serde_json::Value),
}

impl ModelInput {
    pub fn shape(&self) -> InputShape {
        match self {
            Self::Fit(_) => InputShape::FitObject,
            Self::Record(_) => InputShape::Record,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    /// At least one indicator cleared the cutoff.
    Regular,
    /// No indicator cleared the cutoff; top-N substituted by the emergency rule.
    EmergencyFilled,
    /// No indicator cleared the cutoff and the emergency count was zero.
    Undefined,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Indicator {
    pub name: String,
    pub loading: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComponentSummary {
    /// 1-based component index; `key` is `<Kind>_<index>`.
    pub index: usize,
    pub key: String,
    pub variance_share: Option<f64>,
    pub indicators: Vec<Indicator>,
    pub status: ComponentStatus,
}

/// Standardized record every downstream stage reads. Built once by the
/// extractor, immutable afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisData {
    pub kind: AnalysisKind,
    pub n_components: usize,
    pub n_variables: usize,
    pub cutoff: f64,
    pub loadings: Vec<Vec<f64>>,
    pub components: Vec<ComponentSummary>,
    pub variable_names: Vec<String>,
    pub rotation: Option<String>,
}

impl AnalysisData {
    pub fn component_keys(&self) -> Vec<String> {
        self.components
            .iter()
            .map(|component| component.key.clone())
            .collect()
    }

    pub fn component(&self, index: usize) -> Option<&ComponentSummary> {
        self.components.get(index.checked_sub(1)?)
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("variable info does not match model data: {reason}")]
    DataMismatch { reason: String },
    #[error("input record is missing required field `{field}`")]
    MissingField { field: String },
    #[error("input record is malformed: {0}")]
    Malformed(String),
    #[error("no extractor registered for {kind} input shaped as {shape}")]
    Unsupported { kind: AnalysisKind, shape: InputShape },
}

impl ExtractError {
    fn mismatch(reason: impl Into<String>) -> Self {
        Self::DataMismatch {
            reason: reason.into(),
        }
    }
}

pub type ExtractorFn =
    fn(&ModelInput, &VariableInfo, &InterpretationOptions, AnalysisKind) -> Result<AnalysisData, ExtractError>;

/// Dispatch table keyed on (analysis kind, input shape), resolved once at
/// the orchestrator entry. Additive: new kinds or shapes register without
/// touching existing strategies.
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    strategies: BTreeMap<(AnalysisKind, InputShape), ExtractorFn>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for kind in [AnalysisKind::Efa, AnalysisKind::Pca] {
            registry.register(kind, InputShape::FitObject, extract_from_fit);
            registry.register(kind, InputShape::Record, extract_from_record);
        }
        registry
    }

    pub fn register(&mut self, kind: AnalysisKind, shape: InputShape, strategy: ExtractorFn) {
        self.strategies.insert((kind, shape), strategy);
    }

    pub fn supports(&self, kind: AnalysisKind, shape: InputShape) -> bool {
        self.strategies.contains_key(&(kind, shape))
    }

    pub fn extract(
        &self,
        kind: AnalysisKind,
        input: &ModelInput,
        variable_info: &VariableInfo,
        options: &InterpretationOptions,
    ) -> Result<AnalysisData, ExtractError> {
        let shape = input.shape();
        let strategy = self
            .strategies
            .get(&(kind, shape))
            .ok_or(ExtractError::Unsupported { kind, shape })?;
        strategy(input, variable_info, options, kind)
    }
}

fn extract_from_fit(
    input: &ModelInput,
    variable_info: &VariableInfo,
    options: &InterpretationOptions,
    kind: AnalysisKind,
) -> Result<AnalysisData, ExtractError> {
    let ModelInput::Fit(fit) = input else {
        return Err(ExtractError::Malformed(
            "fit extractor received a non-fit input".to_string(),
        ));
    };
    build_analysis_data(fit, variable_info, options, kind)
}

fn extract_from_record(
    input: &ModelInput,
    variable_info: &VariableInfo,
    options: &InterpretationOptions,
    kind: AnalysisKind,
) -> Result<AnalysisData, ExtractError> {
    let ModelInput::Record(value) = input else {
        return Err(ExtractError::Malformed(
            "record extractor received a non-record input".to_string(),
        ));
    };

    if value.get("loadings").is_none() {
        return Err(ExtractError::MissingField {
            field: "loadings".to_string(),
        });
    }

    let fit: FactorFit = serde_json::from_value(value.clone())
        .map_err(|err| ExtractError::Malformed(err.to_string()))?;
    build_analysis_data(&fit, variable_info, options, kind)
}

fn build_analysis_data(
    fit: &FactorFit,
    variable_info: &VariableInfo,
    options: &InterpretationOptions,
    kind: AnalysisKind,
) -> Result<AnalysisData, ExtractError> {
    let n_variables = fit.loadings.len();
    if n_variables == 0 {
        return Err(ExtractError::mismatch("loadings matrix is empty"));
    }

    let n_components = fit.loadings[0].len();
    if n_components == 0 {
        return Err(ExtractError::mismatch("loadings matrix has no components"));
    }
    for (row_index, row) in fit.loadings.iter().enumerate() {
        if row.len() != n_components {
            return Err(ExtractError::mismatch(format!(
                "loadings row {} has {} entries, expected {}",
                row_index + 1,
                row.len(),
                n_components
            )));
        }
    }

    if variable_info.len() != n_variables {
        return Err(ExtractError::mismatch(format!(
            "variable info has {} rows but the model has {} variables",
            variable_info.len(),
            n_variables
        )));
    }
    for (row_index, row) in variable_info.rows().iter().enumerate() {
        if row.name.trim().is_empty() {
            return Err(ExtractError::mismatch(format!(
                "variable {} has a blank name",
                row_index + 1
            )));
        }
        if row.description.trim().is_empty() {
            return Err(ExtractError::mismatch(format!(
                "variable `{}` has a blank description",
                row.name
            )));
        }
    }

    if let Some(shares) = &fit.variance_share {
        if shares.len() != n_components {
            return Err(ExtractError::mismatch(format!(
                "variance_share has {} entries but the model has {} components",
                shares.len(),
                n_components
            )));
        }
    }

    let variable_names: Vec<String> = variable_info.names().map(str::to_string).collect();
    let mut components = Vec::with_capacity(n_components);

    for column in 0..n_components {
        let variance_share = match &fit.variance_share {
            Some(shares) => Some(shares[column]),
            None => Some(sum_of_squares(&fit.loadings, column) / n_variables as f64),
        };

        let mut ranked: Vec<Indicator> = fit
            .loadings
            .iter()
            .enumerate()
            .map(|(row, loadings)| Indicator {
                name: variable_names[row].clone(),
                loading: loadings[column],
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.loading
                .abs()
                .partial_cmp(&a.loading.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let significant: Vec<Indicator> = ranked
            .iter()
            .filter(|indicator| indicator.loading.abs() >= options.cutoff)
            .cloned()
            .collect();

        let (indicators, status) = if !significant.is_empty() {
            (significant, ComponentStatus::Regular)
        } else if options.emergency_top_n == 0 {
            (Vec::new(), ComponentStatus::Undefined)
        } else {
            let take = options.emergency_top_n.min(ranked.len());
            (ranked[..take].to_vec(), ComponentStatus::EmergencyFilled)
        };

        let index = column + 1;
        components.push(ComponentSummary {
            index,
            key: format!("{}_{}", kind.key_prefix(), index),
            variance_share,
            indicators,
            status,
        });
    }

    Ok(AnalysisData {
        kind,
        n_components,
        n_variables,
        cutoff: options.cutoff,
        loadings: fit.loadings.clone(),
        components,
        variable_names,
        rotation: fit.rotation.clone(),
    })
}

fn sum_of_squares(loadings: &[Vec<f64>], column: usize) -> f64 {
    loadings.iter().map(|row| row[column] * row[column]).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParamRegistry;

    fn options() -> InterpretationOptions {
        ParamRegistry::for_kind(AnalysisKind::Efa)
            .merge(&[])
            .expect("defaults are valid")
    }

    fn sample_fit() -> FactorFit {
        FactorFit {
            loadings: vec![
                vec![0.71, 0.10],
                vec![0.65, 0.05],
                vec![0.12, 0.80],
            ],
            variance_share: Some(vec![0.40, 0.25]),
            rotation: Some("varimax".to_string()),
        }
    }

    fn sample_vars() -> VariableInfo {
        VariableInfo::from_pairs([
            ("q1", "I feel energetic at work"),
            ("q2", "I look forward to Mondays"),
            ("q3", "My pay reflects my effort"),
        ])
    }

    #[test]
    fn extracts_sorted_significant_indicators() {
        let registry = ExtractorRegistry::with_builtins();
        let data = registry
            .extract(
                AnalysisKind::Efa,
                &ModelInput::Fit(sample_fit()),
                &sample_vars(),
                &options(),
            )
            .expect("extraction succeeds");

        assert_eq!(data.n_components, 2);
        assert_eq!(data.n_variables, 3);
        assert_eq!(data.component_keys(), vec!["Factor_1", "Factor_2"]);

        let first = data.component(1).unwrap();
        assert_eq!(first.status, ComponentStatus::Regular);
        assert_eq!(first.indicators.len(), 2);
        assert_eq!(first.indicators[0].name, "q1");
        assert_eq!(first.indicators[1].name, "q2");
    }

    #[test]
    fn emergency_rule_substitutes_top_n() {
        let fit = FactorFit {
            loadings: vec![vec![0.71, 0.10], vec![0.65, 0.05], vec![0.55, 0.20]],
            variance_share: None,
            rotation: None,
        };
        let mut opts = options();
        opts.emergency_top_n = 2;

        let registry = ExtractorRegistry::with_builtins();
        let data = registry
            .extract(AnalysisKind::Efa, &ModelInput::Fit(fit), &sample_vars(), &opts)
            .expect("extraction succeeds");

        let second = data.component(2).unwrap();
        assert_eq!(second.status, ComponentStatus::EmergencyFilled);
        assert_eq!(second.indicators.len(), 2);
        assert_eq!(second.indicators[0].name, "q3");
    }

    #[test]
    fn emergency_count_zero_marks_component_undefined() {
        let fit = FactorFit {
            loadings: vec![vec![0.71, 0.10], vec![0.65, 0.05], vec![0.55, 0.20]],
            variance_share: None,
            rotation: None,
        };
        let mut opts = options();
        opts.emergency_top_n = 0;

        let registry = ExtractorRegistry::with_builtins();
        let data = registry
            .extract(AnalysisKind::Efa, &ModelInput::Fit(fit), &sample_vars(), &opts)
            .expect("extraction succeeds");

        let second = data.component(2).unwrap();
        assert_eq!(second.status, ComponentStatus::Undefined);
        assert!(second.indicators.is_empty());
    }

    #[test]
    fn emergency_count_never_exceeds_variable_count() {
        let fit = FactorFit {
            loadings: vec![vec![0.1], vec![0.2], vec![0.15]],
            variance_share: None,
            rotation: None,
        };
        let mut opts = options();
        opts.emergency_top_n = 10;

        let registry = ExtractorRegistry::with_builtins();
        let data = registry
            .extract(AnalysisKind::Efa, &ModelInput::Fit(fit), &sample_vars(), &opts)
            .expect("extraction succeeds");

        assert_eq!(data.component(1).unwrap().indicators.len(), 3);
    }

    #[test]
    fn row_count_mismatch_is_rejected() {
        let vars = VariableInfo::from_pairs([("q1", "only one row")]);
        let registry = ExtractorRegistry::with_builtins();
        let err = registry
            .extract(
                AnalysisKind::Efa,
                &ModelInput::Fit(sample_fit()),
                &vars,
                &options(),
            )
            .expect_err("row count differs");
        assert!(matches!(err, ExtractError::DataMismatch { .. }));
    }

    #[test]
    fn blank_description_is_rejected() {
        let vars = VariableInfo::from_pairs([
            ("q1", "fine"),
            ("q2", "   "),
            ("q3", "fine"),
        ]);
        let registry = ExtractorRegistry::with_builtins();
        let err = registry
            .extract(
                AnalysisKind::Efa,
                &ModelInput::Fit(sample_fit()),
                &vars,
                &options(),
            )
            .expect_err("blank description");
        assert!(err.to_string().contains("q2"));
    }

    #[test]
    fn record_input_requires_loadings_field() {
        let record = serde_json::json!({ "rotation": "promax" });
        let registry = ExtractorRegistry::with_builtins();
        let err = registry
            .extract(
                AnalysisKind::Pca,
                &ModelInput::Record(record),
                &sample_vars(),
                &options(),
            )
            .expect_err("loadings missing");
        assert!(matches!(err, ExtractError::MissingField { .. }));
    }

    #[test]
    fn record_input_round_trips_through_fit_path() {
        let record = serde_json::json!({
            "loadings": [[0.71, 0.10], [0.65, 0.05], [0.12, 0.80]],
            "variance_share": [0.4, 0.25]
        });
        let registry = ExtractorRegistry::with_builtins();
        let data = registry
            .extract(
                AnalysisKind::Pca,
                &ModelInput::Record(record),
                &sample_vars(),
                &options(),
            )
            .expect("record extraction succeeds");
        assert_eq!(data.component_keys(), vec!["Component_1", "Component_2"]);
    }

    #[test]
    fn variance_share_computed_when_absent() {
        let fit = FactorFit {
            loadings: vec![vec![1.0], vec![1.0], vec![1.0]],
            variance_share: None,
            rotation: None,
        };
        let registry = ExtractorRegistry::with_builtins();
        let data = registry
            .extract(AnalysisKind::Efa, &ModelInput::Fit(fit), &sample_vars(), &options())
            .expect("extraction succeeds");
        let share = data.component(1).unwrap().variance_share.unwrap();
        assert!((share - 1.0).abs() < 1e-9);
    }
}
