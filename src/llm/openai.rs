//! OpenAI 兼容端点上的诊断客户端
//!
//! 诊断与屏幕理解都要求模型只回 JSON，因此默认使用低温度；每次调用累计 token 并记 debug 日志。

use std::sync::atomic::{AtomicU64, Ordering};

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{LlmClient, Message, Role};

/// 诊断默认温度
pub const DIAGNOSIS_TEMPERATURE: f32 = 0.2;

/// 累计 token 计数
#[derive(Debug, Default)]
pub struct TokenUsage {
    prompt: AtomicU64,
    completion: AtomicU64,
}

impl TokenUsage {
    pub fn record(&self, prompt: u64, completion: u64) {
        self.prompt.fetch_add(prompt, Ordering::Relaxed);
        self.completion.fetch_add(completion, Ordering::Relaxed);
    }

    /// (prompt, completion, total)
    pub fn snapshot(&self) -> (u64, u64, u64) {
        let p = self.prompt.load(Ordering::Relaxed);
        let c = self.completion.load(Ordering::Relaxed);
        (p, c, p + c)
    }
}

/// 依次读取环境变量，返回第一个非空值
pub(crate) fn api_key_from_env(vars: &[&str]) -> Option<String> {
    vars.iter()
        .filter_map(|v| std::env::var(v).ok())
        .find(|k| !k.trim().is_empty())
}

pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    usage: TokenUsage,
}

impl OpenAiClient {
    /// api_key 为空时回退到 OPENAI_API_KEY
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| api_key_from_env(&["OPENAI_API_KEY"]))
            .unwrap_or_default();

        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(url) = base_url {
            config = config.with_api_base(url);
        }

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            temperature: DIAGNOSIS_TEMPERATURE,
            usage: TokenUsage::default(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn convert(message: &Message) -> Result<ChatCompletionRequestMessage, String> {
        let text = message.content.clone();
        let built = match message.role {
            Role::System => ChatCompletionRequestSystemMessageArgs::default()
                .content(text)
                .build()
                .map(ChatCompletionRequestMessage::System),
            Role::User => ChatCompletionRequestUserMessageArgs::default()
                .content(text)
                .build()
                .map(ChatCompletionRequestMessage::User),
            Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                .content(text)
                .build()
                .map(ChatCompletionRequestMessage::Assistant),
        };
        built.map_err(|e| format!("invalid {:?} message: {e}", message.role))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn name(&self) -> &str {
        &self.model
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.snapshot()
    }

    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let converted = messages
            .iter()
            .map(Self::convert)
            .collect::<Result<Vec<_>, _>>()?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .temperature(self.temperature)
            .messages(converted)
            .build()
            .map_err(|e| e.to_string())?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| format!("{} request failed: {e}", self.model))?;

        if let Some(usage) = &response.usage {
            self.usage
                .record(usage.prompt_tokens as u64, usage.completion_tokens as u64);
            tracing::debug!(
                model = %self.model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "llm call"
            );
        }

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| format!("{} returned an empty completion", self.model))
    }
}
