use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use factorlens_core::PartialOptions;

use crate::error::AdapterError;

fn default_temperature() -> f32 {
    0.4
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_timeout() -> u64 {
    300
}

/// Connection settings for one chat provider.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub interface_format: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: String::new(),
            interface_format: String::new(),
            model_name: String::new(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout: default_timeout(),
        }
    }
}

impl ProviderConfig {
    pub fn is_meaningful(&self) -> bool {
        !(self.api_key.is_empty()
            && self.base_url.is_empty()
            && self.interface_format.is_empty()
            && self.model_name.is_empty())
    }
}

/// On-disk JSON store: named provider profiles plus interpretation option
/// defaults the CLI layers under per-invocation overrides.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ProfileStore {
    #[serde(default)]
    pub profiles: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub default_profile: Option<String>,
    #[serde(default)]
    pub options: PartialOptions,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&ProviderConfig> {
        self.profiles.get(name)
    }

    pub fn upsert<S: Into<String>>(&mut self, name: S, profile: ProviderConfig) {
        self.profiles.insert(name.into(), profile);
    }

    pub fn remove(&mut self, name: &str) -> Option<ProviderConfig> {
        self.profiles.remove(name)
    }

    /// Resolves a profile by name, falling back to the configured default
    /// and then to the first stored profile.
    pub fn resolve(&self, name: Option<&str>) -> Option<(&String, &ProviderConfig)> {
        if let Some(name) = name {
            return self.profiles.get_key_value(name);
        }
        if let Some(default) = &self.default_profile {
            if let Some(found) = self.profiles.get_key_value(default) {
                return Some(found);
            }
        }
        self.profiles.iter().next()
    }

    pub fn from_json_str(input: &str) -> Result<Self, AdapterError> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(input)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, AdapterError> {
        let data = fs::read_to_string(path).map_err(|err| AdapterError::io(path, err))?;
        Self::from_json_str(&data)
    }

    pub fn to_path(&self, path: &Path) -> Result<(), AdapterError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| AdapterError::io(parent, err))?;
            }
        }
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized).map_err(|err| AdapterError::io(path, err))?;
        Ok(())
    }
}

static VERSION_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/v\d+$").unwrap());

/// Normalizes an OpenAI-style base URL: a trailing `#` suppresses rewriting,
/// otherwise a missing `/v1` segment is appended.
pub fn normalize_base_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if let Some(stripped) = trimmed.strip_suffix('#') {
        return stripped.to_string();
    }

    if VERSION_SUFFIX_RE.is_match(trimmed) || trimmed.contains("/v1") {
        trimmed.to_string()
    } else {
        format!("{}/v1", trimmed.trim_end_matches('/'))
    }
}
