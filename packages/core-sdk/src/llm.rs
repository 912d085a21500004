use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::pin::Pin;

use crate::config::ApiKeys;
use crate::models::{normalize_messages, ChatMessage, Message, ModelConfig, ModelRef, Role};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_DEFAULT_MAX_TOKENS: u32 = 8192;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(String),
    #[error("{0}")]
    Upstream(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        LlmError::Upstream(e.to_string())
    }
}

/**
 * \brief 厂商调用约定。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    /** \brief Anthropic Messages API，system 独立字段 */
    AnthropicMessages,
    /** \brief OpenAI 兼容的 chat/completions */
    OpenAiChat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    OpenAi,
    Groq,
    TogetherAi,
    Fireworks,
    Xai,
    DeepSeek,
}

/**
 * \brief Provider 查找表的一行：新增 Provider 只需加一行。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderSpec {
    pub provider: Provider,
    pub id: &'static str,
    pub convention: Convention,
    pub key_env: &'static str,
    pub base_url: &'static str,
}

static PROVIDERS: [ProviderSpec; 7] = [
    ProviderSpec {
        provider: Provider::Anthropic,
        id: "anthropic",
        convention: Convention::AnthropicMessages,
        key_env: "ANTHROPIC_API_KEY",
        base_url: "https://api.anthropic.com",
    },
    ProviderSpec {
        provider: Provider::OpenAi,
        id: "openai",
        convention: Convention::OpenAiChat,
        key_env: "OPENAI_API_KEY",
        base_url: "https://api.openai.com/v1",
    },
    ProviderSpec {
        provider: Provider::Groq,
        id: "groq",
        convention: Convention::OpenAiChat,
        key_env: "GROQ_API_KEY",
        base_url: "https://api.groq.com/openai/v1",
    },
    ProviderSpec {
        provider: Provider::TogetherAi,
        id: "togetherai",
        convention: Convention::OpenAiChat,
        key_env: "TOGETHER_API_KEY",
        base_url: "https://api.together.xyz/v1",
    },
    ProviderSpec {
        provider: Provider::Fireworks,
        id: "fireworks",
        convention: Convention::OpenAiChat,
        key_env: "FIREWORKS_API_KEY",
        base_url: "https://api.fireworks.ai/inference/v1",
    },
    ProviderSpec {
        provider: Provider::Xai,
        id: "xai",
        convention: Convention::OpenAiChat,
        key_env: "XAI_API_KEY",
        base_url: "https://api.x.ai/v1",
    },
    ProviderSpec {
        provider: Provider::DeepSeek,
        id: "deepseek",
        convention: Convention::OpenAiChat,
        key_env: "DEEPSEEK_API_KEY",
        base_url: "https://api.deepseek.com/v1",
    },
];

impl Provider {
    /**
     * \brief 精确匹配 Provider 标识；未知标识不回退到任何默认值。
     */
    pub fn from_id(id: &str) -> Result<Self, LlmError> {
        PROVIDERS
            .iter()
            .find(|spec| spec.id == id)
            .map(|spec| spec.provider)
            .ok_or_else(|| LlmError::UnsupportedProvider(id.to_string()))
    }

    pub fn spec(self) -> &'static ProviderSpec {
        let index = match self {
            Provider::Anthropic => 0,
            Provider::OpenAi => 1,
            Provider::Groq => 2,
            Provider::TogetherAi => 3,
            Provider::Fireworks => 4,
            Provider::Xai => 5,
            Provider::DeepSeek => 6,
        };
        &PROVIDERS[index]
    }

    pub fn all() -> impl Iterator<Item = &'static ProviderSpec> {
        PROVIDERS.iter()
    }
}

/**
 * \brief 生成参数：未配置的字段不会出现在请求体里。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerationParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

impl From<&ModelConfig> for GenerationParams {
    fn from(config: &ModelConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            top_p: config.top_p,
        }
    }
}

impl GenerationParams {
    fn merge_into(&self, body: &mut Map<String, Value>) {
        if let Ok(Value::Object(params)) = serde_json::to_value(self) {
            body.extend(params);
        }
    }
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

fn boxed<S>(s: S) -> TokenStream
where
    S: Stream<Item = Result<String, LlmError>> + Send + 'static,
{
    Box::pin(s)
}

/**
 * \brief 在原系统提示词后追加 JSON Schema 约束。
 */
pub fn augment_system_prompt(system_prompt: &str, schema: &Value) -> String {
    let pretty = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
    format!(
        "{}\n\nYou must respond with a valid JSON object matching this schema:\n{}\n\nRespond ONLY with the JSON object, no additional text.",
        system_prompt, pretty
    )
}

/**
 * \brief 单个模型的结构化输出客户端。
 */
#[derive(Debug, Clone)]
pub struct LlmClient {
    model_id: String,
    spec: &'static ProviderSpec,
    api_key: Option<String>,
    base_url: String,
    params: GenerationParams,
    http: reqwest::Client,
}

impl LlmClient {
    /**
     * \brief 构建客户端；apiKey/baseURL 覆盖优先，其次为 Provider 表中的环境变量与默认地址。
     */
    pub fn new(model: &ModelRef, config: &ModelConfig, keys: &ApiKeys) -> Result<Self, LlmError> {
        let spec = Provider::from_id(&model.provider_id)?.spec();
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| keys.get(spec.key_env).map(|s| s.to_string()));
        let base_url = config
            .base_url
            .clone()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| spec.base_url.to_string());
        Ok(Self {
            model_id: model.id.clone(),
            spec,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            params: GenerationParams::from(config),
            http: reqwest::Client::new(),
        })
    }

    pub fn with_http(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn provider(&self) -> Provider {
        self.spec.provider
    }

    pub fn convention(&self) -> Convention {
        self.spec.convention
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    fn endpoint(&self) -> String {
        match self.spec.convention {
            Convention::OpenAiChat => format!("{}/chat/completions", self.base_url),
            Convention::AnthropicMessages => format!("{}/v1/messages", self.base_url),
        }
    }

    /**
     * \brief 构造流式请求体（不发送），按调用约定区分。
     */
    pub fn request_body(&self, system_prompt: &str, messages: &[Message], schema: &Value) -> Value {
        let json_system = augment_system_prompt(system_prompt, schema);
        match self.spec.convention {
            Convention::OpenAiChat => openai_body(&self.model_id, &json_system, messages, &self.params),
            Convention::AnthropicMessages => {
                anthropic_body(&self.model_id, &json_system, messages, &self.params)
            }
        }
    }

    fn headers(&self) -> Result<HeaderMap, LlmError> {
        let key = self.api_key.as_deref().ok_or_else(|| {
            LlmError::Upstream(format!(
                "no API key for provider {} (set {} or config.apiKey)",
                self.spec.id, self.spec.key_env
            ))
        })?;
        let invalid = |_| LlmError::Upstream("API key contains invalid header characters".into());
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        match self.spec.convention {
            Convention::OpenAiChat => {
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {}", key)).map_err(invalid)?,
                );
            }
            Convention::AnthropicMessages => {
                headers.insert("x-api-key", HeaderValue::from_str(key).map_err(invalid)?);
                headers.insert(
                    "anthropic-version",
                    HeaderValue::from_static(ANTHROPIC_VERSION),
                );
            }
        }
        Ok(headers)
    }

    /**
     * \brief 发起流式请求，返回文本增量序列；拼接后应为符合 schema 的 JSON。
     */
    pub async fn generate_structured(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        schema: &Value,
    ) -> Result<TokenStream, LlmError> {
        let normalized = normalize_messages(messages);
        let body = self.request_body(system_prompt, &normalized, schema);
        let headers = self.headers()?;

        tracing::debug!(
            provider = self.spec.id,
            model = %self.model_id,
            base = %self.base_url,
            messages = normalized.len(),
            "opening structured stream"
        );

        let resp = self
            .http
            .post(self.endpoint())
            .headers(headers)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::Upstream(format!(
                "{} request failed: {} -> {}",
                self.spec.id, status, text
            )));
        }

        let events = sse_data(resp);
        let out = match self.spec.convention {
            Convention::OpenAiChat => boxed(try_stream! {
                futures_util::pin_mut!(events);
                while let Some(data) = events.next().await {
                    let data = data?;
                    if data == "[DONE]" {
                        break;
                    }
                    if let Some(delta) = parse_openai_delta(&data)? {
                        yield delta;
                    }
                }
            }),
            Convention::AnthropicMessages => boxed(try_stream! {
                futures_util::pin_mut!(events);
                while let Some(data) = events.next().await {
                    let data = data?;
                    match parse_anthropic_event(&data)? {
                        AnthropicEvent::Text(delta) => {
                            yield delta;
                        }
                        AnthropicEvent::Stop => break,
                        AnthropicEvent::Other => {}
                    }
                }
            }),
        };
        Ok(out)
    }
}

fn openai_body(model: &str, json_system: &str, messages: &[Message], params: &GenerationParams) -> Value {
    let mut all = Vec::with_capacity(messages.len() + 1);
    all.push(json!({"role": "system", "content": json_system}));
    all.extend(
        messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content})),
    );
    let mut body = Map::new();
    body.insert("model".into(), json!(model));
    body.insert("messages".into(), Value::Array(all));
    body.insert("stream".into(), json!(true));
    body.insert("response_format".into(), json!({"type": "json_object"}));
    params.merge_into(&mut body);
    Value::Object(body)
}

fn anthropic_body(
    model: &str,
    json_system: &str,
    messages: &[Message],
    params: &GenerationParams,
) -> Value {
    let mut system_parts = vec![json_system.to_string()];
    let mut items = Vec::new();
    for msg in messages {
        match msg.role {
            Role::System => system_parts.push(msg.content.clone()),
            role => items.push(json!({"role": role.as_str(), "content": msg.content})),
        }
    }
    let mut body = Map::new();
    body.insert("model".into(), json!(model));
    body.insert("system".into(), json!(system_parts.join("\n\n")));
    body.insert("messages".into(), Value::Array(items));
    body.insert("stream".into(), json!(true));
    let params = GenerationParams {
        max_tokens: Some(params.max_tokens.unwrap_or(ANTHROPIC_DEFAULT_MAX_TOKENS)),
        ..params.clone()
    };
    params.merge_into(&mut body);
    Value::Object(body)
}

/**
 * \brief 增量 SSE 解析：按空行切分事件，返回每个事件的 data 字段。
 */
#[derive(Debug, Default)]
pub struct SseBuffer {
    buf: Vec<u8>,
}

impl SseBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
        let mut out = Vec::new();
        while let Some(pos) = find_double_newline(&self.buf) {
            let block = self.buf.drain(..pos + 2).collect::<Vec<u8>>();
            if let Some(line) = extract_data_line(&block) {
                out.push(line);
            }
        }
        out
    }

    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        extract_data_line(&rest)
    }
}

fn sse_data(resp: reqwest::Response) -> impl Stream<Item = Result<String, LlmError>> + Send {
    let mut stream = resp.bytes_stream();
    let mut buffer = SseBuffer::default();
    try_stream! {
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for line in buffer.push(&chunk) {
                yield line;
            }
        }
        if let Some(line) = buffer.finish() {
            yield line;
        }
    }
}

fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn extract_data_line(block: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(block);
    let data: Vec<&str> = text
        .lines()
        .map(|l| l.trim_start())
        .filter_map(|l| l.strip_prefix("data:"))
        .map(|l| l.strip_prefix(' ').unwrap_or(l))
        .collect();
    if data.is_empty() {
        None
    } else {
        Some(data.join("\n").trim().to_string())
    }
}

fn upstream_error_message(v: &Value) -> Option<String> {
    let err = v.get("error")?;
    Some(
        err.get("message")
            .and_then(|m| m.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| err.to_string()),
    )
}

/**
 * \brief 解析 OpenAI 兼容的增量；空增量返回 None。
 */
pub fn parse_openai_delta(data: &str) -> Result<Option<String>, LlmError> {
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    if let Some(message) = upstream_error_message(&v) {
        return Err(LlmError::Upstream(message));
    }
    Ok(v.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string()))
}

#[derive(Debug, PartialEq, Eq)]
pub enum AnthropicEvent {
    Text(String),
    Stop,
    Other,
}

pub fn parse_anthropic_event(data: &str) -> Result<AnthropicEvent, LlmError> {
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => return Ok(AnthropicEvent::Other),
    };
    match v.get("type").and_then(|t| t.as_str()) {
        Some("content_block_delta") => {
            let delta = v.get("delta");
            let is_text = delta
                .and_then(|d| d.get("type"))
                .and_then(|t| t.as_str())
                == Some("text_delta");
            match delta.and_then(|d| d.get("text")).and_then(|t| t.as_str()) {
                Some(text) if is_text && !text.is_empty() => Ok(AnthropicEvent::Text(text.to_string())),
                _ => Ok(AnthropicEvent::Other),
            }
        }
        Some("message_stop") => Ok(AnthropicEvent::Stop),
        Some("error") => Err(LlmError::Upstream(
            upstream_error_message(&v).unwrap_or_else(|| "anthropic stream error".to_string()),
        )),
        _ => Ok(AnthropicEvent::Other),
    }
}

/**
 * \brief 结构化生成的接缝：路由层只依赖此 trait。
 */
#[async_trait]
pub trait StructuredGenerator: Send + Sync {
    async fn generate_structured(
        &self,
        model: &ModelRef,
        config: &ModelConfig,
        system_prompt: &str,
        messages: &[ChatMessage],
        schema: &Value,
    ) -> Result<TokenStream, LlmError>;
}

/**
 * \brief 基于 HTTP 的默认实现，共享一个连接池。
 */
#[derive(Debug, Clone)]
pub struct HttpGenerator {
    keys: ApiKeys,
    http: reqwest::Client,
}

impl HttpGenerator {
    pub fn new(keys: ApiKeys) -> Self {
        Self {
            keys,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl StructuredGenerator for HttpGenerator {
    async fn generate_structured(
        &self,
        model: &ModelRef,
        config: &ModelConfig,
        system_prompt: &str,
        messages: &[ChatMessage],
        schema: &Value,
    ) -> Result<TokenStream, LlmError> {
        LlmClient::new(model, config, &self.keys)?
            .with_http(self.http.clone())
            .generate_structured(system_prompt, messages, schema)
            .await
    }
}
