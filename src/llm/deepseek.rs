//! DeepSeek 预设（OpenAI 兼容端点）

use crate::llm::openai::api_key_from_env;
use crate::llm::OpenAiClient;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

/// Key 取 DEEPSEEK_API_KEY，其次 OPENAI_API_KEY；model 为空时用 DEEPSEEK_MODEL 或 deepseek-chat。
pub fn create_deepseek_client(model: Option<&str>) -> OpenAiClient {
    let key = api_key_from_env(&["DEEPSEEK_API_KEY", "OPENAI_API_KEY"]);
    let model = model
        .filter(|m| !m.trim().is_empty())
        .map(String::from)
        .or_else(|| std::env::var("DEEPSEEK_MODEL").ok())
        .unwrap_or_else(|| DEEPSEEK_CHAT.to_string());
    OpenAiClient::new(Some(DEEPSEEK_BASE_URL), &model, key.as_deref())
}
