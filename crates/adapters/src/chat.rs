use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{self, HeaderValue};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use factorlens_core::{ChatModel, ChatModelError, ChatReply, TokenUsage};

use crate::error::AdapterError;
use crate::profile::{normalize_base_url, ProfileStore, ProviderConfig};
use crate::retry::{call_with_retry, RetryConfig};

pub fn create_chat_adapter(
    store: &ProfileStore,
    profile_name: Option<&str>,
) -> Result<Box<dyn ChatModel>, AdapterError> {
    let (name, profile) = store.resolve(profile_name).ok_or_else(|| {
        AdapterError::InvalidConfig(match profile_name {
            Some(name) => format!("unknown provider profile `{name}`"),
            None => "no provider profiles configured".to_string(),
        })
    })?;
    create_chat_adapter_from_profile(profile)
        .map_err(|err| match err {
            AdapterError::InvalidConfig(reason) => {
                AdapterError::InvalidConfig(format!("profile `{name}`: {reason}"))
            }
            other => other,
        })
}

pub fn create_chat_adapter_from_profile(
    profile: &ProviderConfig,
) -> Result<Box<dyn ChatModel>, AdapterError> {
    let fmt = profile.interface_format.trim().to_lowercase();
    let timeout = profile.timeout.max(1);

    match fmt.as_str() {
        "openai" => Ok(Box::new(OpenAiLikeAdapter::new(
            resolve_base_url(&profile.base_url, "https://api.openai.com/v1"),
            optional_string(&profile.api_key),
            profile.model_name.clone(),
            profile.max_tokens,
            profile.temperature,
            timeout,
        )?)),
        "deepseek" => Ok(Box::new(OpenAiLikeAdapter::new(
            resolve_base_url(&profile.base_url, "https://api.deepseek.com/v1"),
            optional_string(&profile.api_key),
            profile.model_name.clone(),
            profile.max_tokens,
            profile.temperature,
            timeout,
        )?)),
        "ollama" => Ok(Box::new(OpenAiLikeAdapter::new(
            resolve_base_url(&profile.base_url, "http://localhost:11434/v1"),
            optional_string(&profile.api_key),
            profile.model_name.clone(),
            profile.max_tokens,
            profile.temperature,
            timeout,
        )?)),
        "lm studio" => Ok(Box::new(OpenAiLikeAdapter::new(
            resolve_base_url(&profile.base_url, "http://localhost:1234/v1"),
            optional_string(&profile.api_key),
            profile.model_name.clone(),
            profile.max_tokens,
            profile.temperature,
            timeout,
        )?)),
        "gemini" => Ok(Box::new(GeminiAdapter::new(
            profile.api_key.clone(),
            &profile.base_url,
            &profile.model_name,
            profile.max_tokens,
            profile.temperature,
            timeout,
        )?)),
        other => Err(AdapterError::InvalidConfig(format!(
            "unknown interface_format: {other}"
        ))),
    }
}

fn optional_string(value: &str) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn resolve_base_url(base_url: &str, default: &str) -> String {
    let raw = if base_url.trim().is_empty() {
        default
    } else {
        base_url
    };
    normalize_base_url(raw)
}

/// Lifetime token accounting for one adapter. Replies carry the cumulative
/// totals; the session layer turns consecutive reports into deltas.
#[derive(Default)]
struct UsageCounter {
    cumulative: Mutex<TokenUsage>,
}

impl UsageCounter {
    fn add(&self, input: u64, output: u64) -> TokenUsage {
        let mut guard = self
            .cumulative
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.input_tokens = guard.input_tokens.saturating_add(input);
        guard.output_tokens = guard.output_tokens.saturating_add(output);
        *guard
    }
}

struct OpenAiLikeAdapter {
    client: Client,
    url: String,
    api_key: Option<String>,
    model_name: String,
    max_tokens: Option<u32>,
    temperature: f32,
    retry: RetryConfig,
    usage: UsageCounter,
}

impl OpenAiLikeAdapter {
    fn new(
        base_url: String,
        api_key: Option<String>,
        model_name: String,
        max_tokens: u32,
        temperature: f32,
        timeout: u64,
    ) -> Result<Self, AdapterError> {
        if base_url.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "base_url must not be empty".to_string(),
            ));
        }
        if model_name.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "model_name must not be empty".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()?;

        Ok(Self {
            client,
            url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            model_name,
            max_tokens: if max_tokens == 0 {
                None
            } else {
                Some(max_tokens)
            },
            temperature,
            retry: RetryConfig::default(),
            usage: UsageCounter::default(),
        })
    }

    fn send_once(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<ChatReply, AdapterError> {
        let mut messages: Vec<ChatMessageRequest<'_>> = Vec::new();
        if !system_prompt.trim().is_empty() {
            messages.push(ChatMessageRequest {
                role: "system",
                content: system_prompt,
            });
        }
        messages.push(ChatMessageRequest {
            role: "user",
            content: user_prompt,
        });

        let body = ChatCompletionRequest {
            model: self.model_name.as_str(),
            messages,
            max_tokens: self.max_tokens,
            temperature: Some(self.temperature),
        };

        let mut request = self.client.post(&self.url).header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.json(&body).send()?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(AdapterError::HttpStatus { status, body });
        }

        let parsed: ChatCompletionResponse = response.json()?;
        let (input, output) = parsed
            .usage
            .as_ref()
            .map(|usage| (usage.prompt_tokens, usage.completion_tokens))
            .unwrap_or((0, 0));
        let text = extract_choice_content(parsed).ok_or(AdapterError::EmptyResponse)?;

        Ok(ChatReply {
            text,
            usage: self.usage.add(input, output),
        })
    }
}

impl ChatModel for OpenAiLikeAdapter {
    fn send(&self, system_prompt: &str, user_prompt: &str) -> Result<ChatReply, ChatModelError> {
        call_with_retry(|| self.send_once(system_prompt, user_prompt), &self.retry)
            .map_err(ChatModelError::new)
    }
}

struct GeminiAdapter {
    client: Client,
    url: String,
    temperature: f32,
    max_tokens: u32,
    retry: RetryConfig,
    base_delay: Duration,
    usage: UsageCounter,
}

impl GeminiAdapter {
    fn new(
        api_key: String,
        base_url: &str,
        model_name: &str,
        max_tokens: u32,
        temperature: f32,
        timeout: u64,
    ) -> Result<Self, AdapterError> {
        if api_key.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "Gemini api_key must not be empty".to_string(),
            ));
        }
        if model_name.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "Gemini model_name must not be empty".to_string(),
            ));
        }

        let base = if base_url.trim().is_empty() {
            "https://generativelanguage.googleapis.com/v1beta".to_string()
        } else {
            base_url.trim().trim_end_matches('/').to_string()
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()?;

        Ok(Self {
            client,
            url: format!("{base}/models/{model_name}:generateContent?key={api_key}"),
            temperature,
            max_tokens,
            retry: RetryConfig::default(),
            base_delay: Duration::from_secs(5),
            usage: UsageCounter::default(),
        })
    }

    fn send_once(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<ChatReply, AdapterError> {
        let request = GeminiRequest {
            system_instruction: if system_prompt.trim().is_empty() {
                None
            } else {
                Some(GeminiSystemInstruction {
                    parts: vec![GeminiRequestPart {
                        text: system_prompt,
                    }],
                })
            },
            contents: vec![GeminiRequestContent {
                role: "user",
                parts: vec![GeminiRequestPart { text: user_prompt }],
            }],
            generation_config: GeminiGenerationConfig {
                max_output_tokens: self.max_tokens,
                temperature: self.temperature,
            },
        };

        let response = self.client.post(&self.url).json(&request).send()?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(AdapterError::HttpStatus { status, body });
        }

        let parsed: GeminiResponse = response.json()?;
        let (input, output) = parsed
            .usage_metadata
            .as_ref()
            .map(|usage| (usage.prompt_token_count, usage.candidates_token_count))
            .unwrap_or((0, 0));
        let text = extract_gemini_text(parsed)?;

        Ok(ChatReply {
            text,
            usage: self.usage.add(input, output),
        })
    }

    fn rate_limit_delay(&self, err: &AdapterError, attempt: usize) -> Option<Duration> {
        let AdapterError::HttpStatus { status, body } = err else {
            return None;
        };
        let lower = body.to_ascii_lowercase();
        if *status != StatusCode::TOO_MANY_REQUESTS
            && !lower.contains("quota")
            && !lower.contains("rate limit")
        {
            return None;
        }

        if let Some(secs) = parse_retry_delay(body) {
            return Some(Duration::from_secs(secs + 5));
        }
        let multiplier = 1u32.checked_shl(attempt as u32).unwrap_or(1);
        self.base_delay
            .checked_mul(multiplier)
            .or(Some(self.base_delay))
    }
}

impl ChatModel for GeminiAdapter {
    fn send(&self, system_prompt: &str, user_prompt: &str) -> Result<ChatReply, ChatModelError> {
        let mut last_error = None;

        for attempt in 0..self.retry.max_attempts {
            match self.send_once(system_prompt, user_prompt) {
                Ok(reply) => return Ok(reply),
                Err(err) => {
                    if attempt + 1 < self.retry.max_attempts {
                        if let Some(delay) = self.rate_limit_delay(&err, attempt) {
                            warn!(
                                "Gemini rate limit encountered, retrying in {:?} (attempt {}/{})",
                                delay,
                                attempt + 1,
                                self.retry.max_attempts
                            );
                            thread::sleep(delay);
                            last_error = Some(err);
                            continue;
                        }
                    }
                    return Err(ChatModelError::new(err));
                }
            }
        }

        let err = last_error.unwrap_or(AdapterError::EmptyResponse);
        Err(ChatModelError::new(AdapterError::retry_exhausted(
            self.retry.max_attempts,
            err,
        )))
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessageRequest<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct ChatMessageRequest<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn extract_choice_content(response: ChatCompletionResponse) -> Option<String> {
    for choice in response.choices {
        if let Some(message) = choice.message {
            if let Some(content) = message.content {
                if !content.trim().is_empty() {
                    return Some(content);
                }
            }
        }
        if let Some(content) = choice.content {
            if !content.trim().is_empty() {
                return Some(content);
            }
        }
    }
    None
}

#[derive(Serialize)]
struct GeminiRequest<'a> {
    #[serde(rename = "systemInstruction")]
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction<'a>>,
    contents: Vec<GeminiRequestContent<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiSystemInstruction<'a> {
    parts: Vec<GeminiRequestPart<'a>>,
}

#[derive(Serialize)]
struct GeminiRequestContent<'a> {
    role: &'static str,
    parts: Vec<GeminiRequestPart<'a>>,
}

#[derive(Serialize)]
struct GeminiRequestPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct GeminiGenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata")]
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason")]
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    Other(serde_json::Value),
}

#[derive(Debug, Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount")]
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(rename = "candidatesTokenCount")]
    #[serde(default)]
    candidates_token_count: u64,
}

fn extract_gemini_text(response: GeminiResponse) -> Result<String, AdapterError> {
    for candidate in response.candidates {
        if let Some(reason) = candidate.finish_reason.as_deref() {
            match reason {
                "MAX_TOKENS" => warn!("Gemini response truncated due to max_tokens limit"),
                "SAFETY" => warn!("Gemini response blocked by safety filters"),
                "RECITATION" => warn!("Gemini response blocked due to recitation concerns"),
                _ => {}
            }
        }

        if let Some(content) = candidate.content {
            let mut text = String::new();
            for part in content.parts {
                if let GeminiPart::Text { text: part_text } = part {
                    text.push_str(&part_text);
                }
            }
            if !text.trim().is_empty() {
                return Ok(text);
            }
        }
    }

    Err(AdapterError::EmptyResponse)
}

fn parse_retry_delay(body: &str) -> Option<u64> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(details) = value
            .get("error")
            .and_then(|v| v.get("details"))
            .and_then(|v| v.as_array())
        {
            for detail in details {
                if let Some(delay) = detail
                    .get("retryDelay")
                    .or_else(|| detail.get("retry_delay"))
                {
                    if let Some(parsed) = parse_delay_value(delay) {
                        return Some(parsed);
                    }
                }
            }
        }
    }

    static RETRY_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"retry[_ ]?delay[^0-9]*(\d+)").expect("valid regex for retry delay")
    });

    RETRY_RE
        .captures(body)
        .and_then(|caps| caps.get(1))
        .and_then(|matched| matched.as_str().parse::<u64>().ok())
}

fn parse_delay_value(value: &serde_json::Value) -> Option<u64> {
    if let Some(number) = value.as_u64() {
        return Some(number);
    }
    if let Some(text) = value.as_str() {
        if let Ok(number) = text.trim_end_matches('s').parse::<u64>() {
            return Some(number);
        }
    }
    None
}
