use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::config::InterpretationOptions;
use crate::extract::AnalysisData;

/// Text substituted by the terminal tier when no usable interpretation
/// could be recovered for a component.
pub const PLACEHOLDER_TEXT: &str =
    "The model response could not be parsed for this component; no interpretation is available.";

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ComponentReading {
    pub name: String,
    pub text: String,
}

/// Mapping from component key (`<Kind>_<i>`) to its reading. Key coverage
/// is guaranteed: every expected key is present after parsing.
pub type ParsedResult = BTreeMap<String, ComponentReading>;

/// Which tier produced the accepted result.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParseTier {
    Structured,
    StructuredRaw,
    KeyRegex,
    Placeholder,
}

impl ParseTier {
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Placeholder)
    }
}

#[derive(Clone, Debug)]
pub struct ParseOutcome {
    pub result: ParsedResult,
    pub tier: ParseTier,
    pub warnings: Vec<String>,
}

/// Cascading parse: an explicit ordered list of attempts with a guaranteed
/// terminal default, so the caller always receives a complete result.
/// Degradation is reported through `warnings`, never as an error.
pub fn parse(raw: &str, data: &AnalysisData, options: &InterpretationOptions) -> ParseOutcome {
    let expected = data.component_keys();
    let mut warnings = Vec::new();

    let attempts: [(ParseTier, fn(&str, &[String], f64, &mut Vec<String>) -> Option<ParsedResult>);
        3] = [
        (ParseTier::Structured, try_structured_cleaned),
        (ParseTier::StructuredRaw, try_structured_raw),
        (ParseTier::KeyRegex, try_key_regex),
    ];

    for (tier, attempt) in attempts {
        if let Some(mut result) = attempt(raw, &expected, options.min_coverage, &mut warnings) {
            backfill_missing(&mut result, &expected, &mut warnings);
            return ParseOutcome {
                result,
                tier,
                warnings,
            };
        }
    }

    warnings.push(
        "response was not parseable at any tier; placeholder interpretations substituted"
            .to_string(),
    );
    ParseOutcome {
        result: placeholder_result(&expected),
        tier: ParseTier::Placeholder,
        warnings,
    }
}

fn placeholder_result(expected: &[String]) -> ParsedResult {
    expected
        .iter()
        .map(|key| {
            (
                key.clone(),
                ComponentReading {
                    name: key.replace('_', " "),
                    text: PLACEHOLDER_TEXT.to_string(),
                },
            )
        })
        .collect()
}

fn backfill_missing(result: &mut ParsedResult, expected: &[String], warnings: &mut Vec<String>) {
    for key in expected {
        if !result.contains_key(key) {
            warnings.push(format!("`{key}` missing from response; placeholder substituted"));
            result.insert(
                key.clone(),
                ComponentReading {
                    name: key.replace('_', " "),
                    text: PLACEHOLDER_TEXT.to_string(),
                },
            );
        }
    }
}

/// Tier 1: isolate the brace-delimited object, normalize common small-model
/// defects, then parse structurally.
fn try_structured_cleaned(
    raw: &str,
    expected: &[String],
    min_coverage: f64,
    warnings: &mut Vec<String>,
) -> Option<ParsedResult> {
    let slice = brace_slice(raw)?;
    let cleaned = normalize_defects(slice);
    parse_object(&cleaned, expected, min_coverage, warnings)
}

/// Tier 2: the same structural parse on the untouched text, for the case
/// where Tier 1's cleaning degraded input that was already valid.
fn try_structured_raw(
    raw: &str,
    expected: &[String],
    min_coverage: f64,
    warnings: &mut Vec<String>,
) -> Option<ParsedResult> {
    if let Some(result) = parse_object(raw.trim(), expected, min_coverage, warnings) {
        return Some(result);
    }
    let slice = brace_slice(raw)?;
    parse_object(slice, expected, min_coverage, warnings)
}

/// Tier 3: per-key regex extraction across double-quoted, single-quoted and
/// unquoted key syntaxes.
fn try_key_regex(
    raw: &str,
    expected: &[String],
    min_coverage: f64,
    _warnings: &mut Vec<String>,
) -> Option<ParsedResult> {
    let mut result = ParsedResult::new();

    for key in expected {
        let escaped = regex::escape(key);
        // Object-valued entry: `"Factor_1": { ... }` in any quoting style.
        let object_re = Regex::new(&format!(
            r#"(?s)["']?{escaped}["']?\s*:\s*\{{(.*?)\}}"#
        ))
        .ok()?;
        // Bare string entry: `"Factor_1": "..."`.
        let string_re = Regex::new(&format!(
            r#"["']?{escaped}["']?\s*:\s*["']([^"']+)["']"#
        ))
        .ok()?;

        if let Some(caps) = object_re.captures(raw) {
            let body = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let name = field_from(body, "name");
            let text = field_from(body, "interpretation");
            if name.is_some() || text.is_some() {
                result.insert(
                    key.clone(),
                    ComponentReading {
                        name: name.unwrap_or_else(|| key.replace('_', " ")),
                        text: text.unwrap_or_else(|| PLACEHOLDER_TEXT.to_string()),
                    },
                );
                continue;
            }
        }

        if let Some(caps) = string_re.captures(raw) {
            if let Some(text) = caps.get(1) {
                result.insert(
                    key.clone(),
                    ComponentReading {
                        name: key.replace('_', " "),
                        text: text.as_str().trim().to_string(),
                    },
                );
            }
        }
    }

    if coverage(result.len(), expected.len()) >= min_coverage {
        Some(result)
    } else {
        None
    }
}

fn field_from(body: &str, field: &str) -> Option<String> {
    let re = Regex::new(&format!(
        r#"["']?{field}["']?\s*:\s*["']([^"']*)["']"#
    ))
    .ok()?;
    re.captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|text| !text.is_empty())
}

/// Extracts the outermost `{ ... }` span, if any.
fn brace_slice(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end > start {
        Some(&raw[start..=end])
    } else {
        None
    }
}

fn trailing_comma_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",\s*([}\]])").expect("trailing comma pattern"))
}

fn missing_comma_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"\}\s*""#).expect("missing comma pattern"))
}

/// Repairs the defects small and local models produce most often: fenced
/// output, trailing commas, missing commas between entries, raw newlines.
fn normalize_defects(slice: &str) -> String {
    let mut text = slice.replace("```json", "").replace("```", "");
    text = text.replace(['\n', '\r'], " ");
    text = trailing_comma_re().replace_all(&text, "$1").into_owned();
    text = missing_comma_re().replace_all(&text, "}, \"").into_owned();
    text
}

fn parse_object(
    candidate: &str,
    expected: &[String],
    min_coverage: f64,
    warnings: &mut Vec<String>,
) -> Option<ParsedResult> {
    let value: Value = serde_json::from_str(candidate).ok()?;
    let object = value.as_object()?;

    let mut result = ParsedResult::new();
    for key in expected {
        let Some(entry) = object.get(key) else {
            continue;
        };
        match entry {
            Value::Object(fields) => {
                let name = fields
                    .get("name")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty());
                let text = fields
                    .get("interpretation")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty());
                if name.is_none() && text.is_none() {
                    continue;
                }
                result.insert(
                    key.clone(),
                    ComponentReading {
                        name: name.map(str::to_string).unwrap_or_else(|| key.replace('_', " ")),
                        text: text
                            .map(str::to_string)
                            .unwrap_or_else(|| PLACEHOLDER_TEXT.to_string()),
                    },
                );
            }
            Value::String(text) if !text.trim().is_empty() => {
                result.insert(
                    key.clone(),
                    ComponentReading {
                        name: key.replace('_', " "),
                        text: text.trim().to_string(),
                    },
                );
            }
            _ => {}
        }
    }

    for key in object.keys() {
        if !expected.iter().any(|expected_key| expected_key == key) {
            warnings.push(format!("ignoring unexpected key `{key}` in response"));
        }
    }

    if coverage(result.len(), expected.len()) >= min_coverage {
        Some(result)
    } else {
        None
    }
}

fn coverage(found: usize, expected: usize) -> f64 {
    if expected == 0 {
        return 1.0;
    }
    found as f64 / expected as f64
}
