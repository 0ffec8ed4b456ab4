//! The LLM adapter: turns page text into structured fields via a versioned
//! prompt template, with deterministic settings and mandatory flattening.

use std::collections::BTreeMap;
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestMessage, CreateChatCompletionRequestArgs, ResponseFormat,
};
use aws_sdk_bedrockruntime::types::{ContentBlock, ConversationRole, Message as BedrockMessage};
use keen_retry::{ExponentialJitter, RetryResult};
use leaky_bucket::RateLimiter;
use serde_json::{Map, Value};

use crate::errors::PipelineError;
use crate::model::{FieldSource, FieldValue, PageExtraction};
use crate::prelude::*;
use crate::prompt::{ChatPrompt, JsonObject};
use crate::toml_utils::{self, JsonValue};

/// Pages batched into a single LLM invocation.
pub const BATCH_PAGES: usize = 2;
/// Hard deadline for a single batch call.
const LLM_CALL_TIMEOUT: Duration = Duration::from_secs(180);
/// Retries for a transient failure within one call.
const LLM_MAX_RETRIES: usize = 3;
/// Temperature is fixed at zero for determinism.
const TEMPERATURE: f32 = 0.0;
/// Output tokens are capped, also for determinism and cost control.
const MAX_OUTPUT_TOKENS: u32 = 4096;

/// A versioned prompt template. The version travels with every
/// [`PageExtraction`] produced from it, so a caller can later decide
/// whether a prompt upgrade should trigger re-extraction.
pub struct PromptTemplate {
    pub version: String,
    prompt: ChatPrompt,
}

impl PromptTemplate {
    /// Load a prompt template from a TOML document, using the same
    /// `prompt.rs`/`toml_utils.rs` pair used for chat prompts elsewhere.
    pub fn from_toml_str(version: impl Into<String>, toml_str: &str) -> Result<Self> {
        let json = toml_utils::from_toml_str::<JsonValue>(toml_str)
            .map_err(|err| anyhow!("failed to parse prompt template: {err}"))?
            .into_json();
        let prompt: ChatPrompt = serde_json::from_value(json)?;
        Ok(PromptTemplate { version: version.into(), prompt })
    }

    fn render(&self, bindings: &JsonObject) -> Result<Value> {
        self.prompt.render_prompt(bindings)
    }
}

/// Token accounting, per call. Billing/cost estimation beyond these raw
/// counts is out of scope.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// Errors specific to LLM invocation. Mirrors [`crate::ocr::OcrError`]'s
/// shape: unavailable is retried, malformed output is not.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM backend unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),

    #[error("LLM produced malformed output: {reason}")]
    Malformed { reason: String },
}

impl From<LlmError> for PipelineError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Unavailable(_) => PipelineError::transient(err),
            LlmError::Malformed { .. } => PipelineError::permanent(err),
        }
    }
}

/// A backend capable of turning a rendered message array into a raw text
/// completion. Production code points this at an OpenAI-compatible endpoint
/// or Bedrock; tests use a stub.
#[async_trait]
pub trait LlmDriver: Send + Sync + 'static {
    async fn complete(&self, messages: &Value) -> Result<(String, TokenUsage), LlmError>;
}

/// Talks to any OpenAI-compatible chat completions endpoint (OpenAI itself,
/// or a LiteLLM/Ollama gateway pointed at via `OPENAI_API_BASE`).
pub struct OpenAiDriver {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiDriver {
    pub fn new(model: impl Into<String>) -> Self {
        let mut config = OpenAIConfig::new();
        if let Ok(base) = std::env::var("OPENAI_API_BASE") {
            config = config.with_api_base(base);
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config = config.with_api_key(key);
        }
        OpenAiDriver { client: Client::with_config(config), model: model.into() }
    }
}

#[async_trait]
impl LlmDriver for OpenAiDriver {
    async fn complete(&self, messages: &Value) -> Result<(String, TokenUsage), LlmError> {
        let messages: Vec<ChatCompletionRequestMessage> = serde_json::from_value(messages.clone())
            .map_err(|err| LlmError::Malformed { reason: format!("bad message shape: {err}") })?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .temperature(TEMPERATURE)
            .max_completion_tokens(MAX_OUTPUT_TOKENS)
            .response_format(ResponseFormat::JsonObject)
            .build()
            .map_err(|err| LlmError::Malformed { reason: err.to_string() })?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|err| LlmError::Unavailable(anyhow!(err)))?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Malformed { reason: "no choices in response".to_string() })?;
        let content = choice
            .message
            .content
            .ok_or_else(|| LlmError::Malformed { reason: "empty message content".to_string() })?;
        let usage = response
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens as u64,
                completion_tokens: u.completion_tokens as u64,
            })
            .unwrap_or_default();
        Ok((content, usage))
    }
}

/// Talks to a Bedrock-hosted model via the Converse API. Bedrock has no
/// strict JSON response mode, so the prompt itself must ask for JSON-only
/// output; malformed responses surface as [`LlmError::Malformed`].
pub struct BedrockDriver {
    client: aws_sdk_bedrockruntime::Client,
    model_id: String,
}

impl BedrockDriver {
    pub async fn new(model_id: impl Into<String>) -> Result<Self> {
        let config = crate::aws::load_aws_config().await?;
        Ok(BedrockDriver {
            client: aws_sdk_bedrockruntime::Client::new(&config),
            model_id: model_id.into(),
        })
    }
}

#[async_trait]
impl LlmDriver for BedrockDriver {
    async fn complete(&self, messages: &Value) -> Result<(String, TokenUsage), LlmError> {
        let entries = messages
            .as_array()
            .ok_or_else(|| LlmError::Malformed { reason: "messages must be an array".to_string() })?;

        let mut system_text = String::new();
        let mut conversation = Vec::new();
        for entry in entries {
            let role = entry.get("role").and_then(Value::as_str).unwrap_or("user");
            let content = entry.get("content").and_then(Value::as_str).unwrap_or_default();
            if role == "system" {
                system_text.push_str(content);
                system_text.push('\n');
                continue;
            }
            let role = if role == "assistant" { ConversationRole::Assistant } else { ConversationRole::User };
            let message = BedrockMessage::builder()
                .role(role)
                .content(ContentBlock::Text(content.to_string()))
                .build()
                .map_err(|err| LlmError::Malformed { reason: err.to_string() })?;
            conversation.push(message);
        }

        let mut request = self
            .client
            .converse()
            .model_id(&self.model_id)
            .set_messages(Some(conversation));
        if !system_text.is_empty() {
            request = request.system(aws_sdk_bedrockruntime::types::SystemContentBlock::Text(system_text));
        }

        let response = request
            .send()
            .await
            .map_err(|err| LlmError::Unavailable(anyhow!(err)))?;

        let output = response
            .output
            .ok_or_else(|| LlmError::Malformed { reason: "no output in response".to_string() })?;
        let message = output
            .as_message()
            .map_err(|_| LlmError::Malformed { reason: "unexpected Bedrock output variant".to_string() })?;
        let text = message
            .content
            .iter()
            .find_map(|block| block.as_text().ok())
            .ok_or_else(|| LlmError::Malformed { reason: "no text content block".to_string() })?
            .to_string();

        let usage = response
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.input_tokens.max(0) as u64,
                completion_tokens: u.output_tokens.max(0) as u64,
            })
            .unwrap_or_default();
        Ok((text, usage))
    }
}

/// Recursively flatten nested JSON objects into a flat map, joining keys
/// with `_`, stopping once an object looks like a leaf `{value, confidence}`
/// field (nested field objects never survive into the cache).
fn flatten(prefix: &str, value: &Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) if !is_field_leaf(map) => {
            for (key, child) in map {
                let joined = if prefix.is_empty() { key.clone() } else { format!("{prefix}_{key}") };
                flatten(&joined, child, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}

fn is_field_leaf(map: &Map<String, Value>) -> bool {
    map.contains_key("value")
}

/// Convert a flattened leaf value into a [`FieldValue`]. A `{value,
/// confidence}` object carries its own confidence; a bare scalar gets a
/// conservative default, since the model did not self-report one.
fn value_to_field(value: &Value) -> FieldValue {
    match value {
        Value::Object(map) if map.contains_key("value") => {
            let text = map.get("value").map(value_to_string).unwrap_or_default();
            let confidence = map
                .get("confidence")
                .and_then(Value::as_u64)
                .map(|c| c.min(100) as u8)
                .unwrap_or(70);
            FieldValue::ai_extracted(text, confidence)
        }
        other => FieldValue::ai_extracted(value_to_string(other), 70),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn mean_confidence(fields: &BTreeMap<String, FieldValue>) -> f64 {
    if fields.is_empty() {
        return 0.0;
    }
    let total: u32 = fields.values().map(|f| f.confidence as u32).sum();
    total as f64 / fields.len() as f64
}

/// Invokes the extraction model with a versioned prompt and turns its
/// response into [`PageExtraction`] records, flattening and rate-limiting
/// along the way.
pub struct LlmAdapter {
    driver: Arc<dyn LlmDriver>,
    rate_limiter: RateLimiter,
}

impl LlmAdapter {
    pub fn new(driver: Arc<dyn LlmDriver>, rate_limit: crate::rate_limit::RateLimit) -> Self {
        LlmAdapter { driver, rate_limiter: rate_limit.to_rate_limiter() }
    }

    async fn call_with_retry(&self, messages: &Value) -> Result<(String, TokenUsage), PipelineError> {
        self.rate_limiter.acquire_one().await;
        let jitter = ExponentialJitter::FromBackoffRange {
            backoff_range_millis: 250..=4_000,
            re_attempts: LLM_MAX_RETRIES as u32,
            jitter_ratio: 0.2,
        };

        let attempt = || async {
            tokio::time::timeout(LLM_CALL_TIMEOUT, self.driver.complete(messages))
                .await
                .map_err(|_| LlmError::Unavailable(anyhow!("LLM call timed out")))
                .and_then(|inner| inner)
        };

        let outcome = keen_retry::RetryConsumerResult::from(attempt().await)
            .retry_with(attempt)
            .with_exponential_jitter(|| jitter.clone())
            .await;

        match outcome {
            RetryResult::Ok { output, .. } => Ok(output),
            RetryResult::Fatal { input: _, error } => Err(error.into()),
            RetryResult::Unrecoverable { input: _, error, .. } => Err(error.into()),
        }
    }

    /// Extract fields for a batch of up to [`BATCH_PAGES`] adjacent pages of
    /// the same account. The template must render bindings for a `pages`
    /// array (`{index, text}`) and is expected to respond with a JSON object
    /// keyed `page_{index}` per requested page.
    #[instrument(level = "debug", skip(self, pages, prompt))]
    pub async fn extract_page_batch(
        &self,
        pages: &[(usize, &str)],
        prompt: &PromptTemplate,
    ) -> Result<BTreeMap<usize, PageExtraction>, PipelineError> {
        let bindings = json!({
            "pages": pages.iter().map(|(i, text)| json!({"index": i, "text": text})).collect::<Vec<_>>(),
        });
        let bindings = bindings.as_object().expect("object literal").clone();
        let rendered = prompt.render(&bindings).map_err(|err| PipelineError::permanent(err))?;

        let (content, _usage) = self.call_with_retry(&rendered).await?;
        let parsed: Value = serde_json::from_str(&content).map_err(|err| {
            PipelineError::from(LlmError::Malformed { reason: format!("response was not valid JSON: {err}") })
        })?;
        let top = parsed.as_object().ok_or_else(|| {
            PipelineError::from(LlmError::Malformed { reason: "response was not a JSON object".to_string() })
        })?;

        let mut out = BTreeMap::new();
        for (page_index, _) in pages {
            let key = format!("page_{page_index}");
            let page_value = top.get(&key).cloned().unwrap_or_else(|| {
                warn!(page_index, "LLM response missing key {key}, treating page as empty");
                Value::Object(Map::new())
            });
            let mut flat = BTreeMap::new();
            flatten("", &page_value, &mut flat);
            flat.remove("");
            let data: BTreeMap<String, FieldValue> =
                flat.into_iter().map(|(k, v)| (k, value_to_field(&v))).collect();
            let overall_confidence = mean_confidence(&data);
            out.insert(
                *page_index,
                PageExtraction {
                    data,
                    overall_confidence,
                    account_number: None,
                    prompt_version: prompt.version.clone(),
                    edited: false,
                    edited_at: None,
                    last_action: Some(crate::model::LastAction::Extract),
                },
            );
        }
        Ok(out)
    }

    /// A single whole-document extraction, for non-loan documents. The
    /// response is a flat JSON object directly, with no per-page wrapper.
    #[instrument(level = "debug", skip(self, text, prompt))]
    pub async fn extract_whole_document(
        &self,
        text: &str,
        prompt: &PromptTemplate,
    ) -> Result<PageExtraction, PipelineError> {
        let bindings = json!({ "text": text });
        let bindings = bindings.as_object().expect("object literal").clone();
        let rendered = prompt.render(&bindings).map_err(|err| PipelineError::permanent(err))?;

        let (content, _usage) = self.call_with_retry(&rendered).await?;
        let parsed: Value = serde_json::from_str(&content).map_err(|err| {
            PipelineError::from(LlmError::Malformed { reason: format!("response was not valid JSON: {err}") })
        })?;

        let mut flat = BTreeMap::new();
        flatten("", &parsed, &mut flat);
        flat.remove("");
        let data: BTreeMap<String, FieldValue> =
            flat.into_iter().map(|(k, v)| (k, value_to_field(&v))).collect();
        let overall_confidence = mean_confidence(&data);
        Ok(PageExtraction {
            data,
            overall_confidence,
            account_number: None,
            prompt_version: prompt.version.clone(),
            edited: false,
            edited_at: None,
            last_action: Some(crate::model::LastAction::Extract),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubDriver {
        response: String,
    }

    #[async_trait]
    impl LlmDriver for StubDriver {
        async fn complete(&self, _messages: &Value) -> Result<(String, TokenUsage), LlmError> {
            Ok((self.response.clone(), TokenUsage::default()))
        }
    }

    fn test_prompt() -> PromptTemplate {
        let toml_str = r#"
            developer = "extract fields"
            [[messages]]
            user = "{{pages}}"
        "#;
        PromptTemplate::from_toml_str("v1", toml_str).unwrap()
    }

    #[tokio::test]
    async fn flattens_nested_fields_and_records_prompt_version() {
        let response = serde_json::json!({
            "page_0": {
                "name": {"value": "John", "confidence": 95},
                "signer": {"address": {"value": "123 Main St", "confidence": 80}}
            }
        })
        .to_string();
        let adapter = LlmAdapter::new(
            Arc::new(StubDriver { response }),
            crate::rate_limit::RateLimit::new(100, crate::rate_limit::RateLimitPeriod::Second),
        );
        let prompt = test_prompt();
        let result = adapter.extract_page_batch(&[(0, "ocr text")], &prompt).await.unwrap();
        let page = &result[&0];
        assert_eq!(page.data["name"].value, "John");
        assert_eq!(page.data["name"].confidence, 95);
        assert_eq!(page.data["signer_address"].value, "123 Main St");
        assert_eq!(page.prompt_version, "v1");
        assert_eq!(page.data["name"].source, FieldSource::AiExtracted);
    }

    #[tokio::test]
    async fn missing_page_key_yields_empty_extraction_not_an_error() {
        let response = serde_json::json!({"page_0": {"x": {"value": "1", "confidence": 90}}}).to_string();
        let adapter = LlmAdapter::new(
            Arc::new(StubDriver { response }),
            crate::rate_limit::RateLimit::new(100, crate::rate_limit::RateLimitPeriod::Second),
        );
        let prompt = test_prompt();
        let result = adapter.extract_page_batch(&[(0, "a"), (1, "b")], &prompt).await.unwrap();
        assert!(result[&1].data.is_empty());
    }

    #[tokio::test]
    async fn malformed_json_response_is_a_permanent_failure() {
        let adapter = LlmAdapter::new(
            Arc::new(StubDriver { response: "not json".to_string() }),
            crate::rate_limit::RateLimit::new(100, crate::rate_limit::RateLimitPeriod::Second),
        );
        let prompt = test_prompt();
        let err = adapter.extract_page_batch(&[(0, "a")], &prompt).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn unavailable_driver_is_retried_then_recovers() {
        struct FlakyDriver {
            attempts: AtomicUsize,
        }
        #[async_trait]
        impl LlmDriver for FlakyDriver {
            async fn complete(&self, _messages: &Value) -> Result<(String, TokenUsage), LlmError> {
                if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(LlmError::Unavailable(anyhow!("simulated outage")))
                } else {
                    Ok((serde_json::json!({"page_0": {}}).to_string(), TokenUsage::default()))
                }
            }
        }
        let adapter = LlmAdapter::new(
            Arc::new(FlakyDriver { attempts: AtomicUsize::new(0) }),
            crate::rate_limit::RateLimit::new(100, crate::rate_limit::RateLimitPeriod::Second),
        );
        let prompt = test_prompt();
        let result = adapter.extract_page_batch(&[(0, "a")], &prompt).await.unwrap();
        assert!(result[&0].data.is_empty());
    }

    #[test]
    fn whole_document_extraction_flattens_the_same_way() {
        // Exercised indirectly via extract_whole_document in pipeline tests;
        // this just checks the flatten() helper in isolation.
        let mut out = BTreeMap::new();
        flatten("", &serde_json::json!({"a": {"b": {"value": "1", "confidence": 50}}}), &mut out);
        assert_eq!(out["a_b"], serde_json::json!({"value": "1", "confidence": 50}));
    }
}
