use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

pub mod watsonx;

pub use piq_core::{Completion, Usage};
pub use piq_error::{PiqError, Result};
pub use watsonx::{WatsonxClient, WatsonxConfig};

/// 一次生成请求
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            max_tokens: 1000,
            temperature: 0.1,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
pub trait CompletionModel: Send + Sync {
    fn provider(&self) -> &str;

    async fn complete(&self, req: &CompletionRequest) -> Result<Completion>;
}

#[async_trait]
pub trait EmbedModel: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// 单条文本嵌入
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PiqError::EmbeddingService {
                provider: "embed".to_string(),
                message: "empty embedding response".to_string(),
            })
    }
}

/// 后端未返回用量时，按空白分词粗略估算
pub fn estimate_usage(prompt: &str, output: &str) -> Usage {
    let prompt_tokens = prompt.split_whitespace().count() as u32;
    let completion_tokens = output.split_whitespace().count() as u32;
    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    }
}

/// 将非 2xx 响应映射为错误：401/403 视为认证失败
pub(crate) fn status_error(provider: &str, status: StatusCode, body: String) -> PiqError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        PiqError::Authentication {
            provider: provider.to_string(),
            message: format!("status={} body={}", status, body),
        }
    } else {
        PiqError::LlmService {
            provider: provider.to_string(),
            message: format!("status={} body={}", status, body),
        }
    }
}

pub(crate) fn network_error(e: reqwest::Error) -> PiqError {
    PiqError::Network {
        operation: "http_request".to_string(),
        message: e.to_string(),
    }
}

// ========== OpenAI-compatible (covers OpenAI, DeepSeek, vLLM and similar proxies) ==========

#[derive(Clone)]
pub struct OpenAiCompatConfig {
    pub base_url: String,                // e.g. https://api.openai.com
    pub api_key: String,                 // Bearer token
    pub chat_model: String,              // e.g. gpt-4o
    pub embedding_model: Option<String>, // e.g. text-embedding-3-small
}

#[derive(Clone)]
pub struct OpenAiCompatClient {
    http: Client,
    cfg: OpenAiCompatConfig,
}

impl OpenAiCompatClient {
    pub fn new(cfg: OpenAiCompatConfig) -> Self {
        Self {
            http: Client::new(),
            cfg,
        }
    }
}

#[derive(Serialize)]
struct OaiChatReqMsg {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct OaiChatReq {
    model: String,
    messages: Vec<OaiChatReqMsg>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct OaiChatRespChoiceMsg {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OaiChatRespChoice {
    message: OaiChatRespChoiceMsg,
}

#[derive(Deserialize)]
struct OaiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Deserialize)]
struct OaiChatResp {
    model: Option<String>,
    choices: Vec<OaiChatRespChoice>,
    usage: Option<OaiUsage>,
}

#[async_trait]
impl CompletionModel for OpenAiCompatClient {
    fn provider(&self) -> &str {
        "openai_compat"
    }

    #[instrument(skip(self, req), fields(model = %self.cfg.chat_model))]
    async fn complete(&self, req: &CompletionRequest) -> Result<Completion> {
        let url = format!(
            "{}/v1/chat/completions",
            self.cfg.base_url.trim_end_matches('/')
        );
        let mut messages = Vec::with_capacity(2);
        if let Some(ref system) = req.system {
            messages.push(OaiChatReqMsg {
                role: "system",
                content: system.clone(),
            });
        }
        messages.push(OaiChatReqMsg {
            role: "user",
            content: req.prompt.clone(),
        });
        let body = OaiChatReq {
            model: self.cfg.chat_model.clone(),
            messages,
            max_tokens: req.max_tokens,
            temperature: req.temperature,
        };

        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(status_error(self.provider(), status, txt));
        }

        let data: OaiChatResp = resp.json().await.map_err(network_error)?;
        let text = data
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        let usage = match data.usage {
            Some(u) => Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            },
            None => estimate_usage(&req.prompt, &text),
        };
        Ok(Completion {
            text,
            model: data.model.unwrap_or_else(|| self.cfg.chat_model.clone()),
            usage,
        })
    }
}

#[derive(Serialize)]
struct OaiEmbedReq {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct OaiEmbedData {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct OaiEmbedResp {
    data: Vec<OaiEmbedData>,
}

#[async_trait]
impl EmbedModel for OpenAiCompatClient {
    #[instrument(skip(self, texts), fields(count = texts.len()))]
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self
            .cfg
            .embedding_model
            .clone()
            .ok_or_else(|| PiqError::configuration("embedding_model", "not configured"))?;
        let url = format!("{}/v1/embeddings", self.cfg.base_url.trim_end_matches('/'));
        let body = OaiEmbedReq {
            model,
            input: texts.to_vec(),
        };

        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(match status_error("openai_compat", status, txt) {
                PiqError::LlmService { provider, message } => {
                    PiqError::EmbeddingService { provider, message }
                }
                other => other,
            });
        }

        let data: OaiEmbedResp = resp.json().await.map_err(network_error)?;
        Ok(data.data.into_iter().map(|d| d.embedding).collect())
    }
}

// ========== Anthropic (Claude) ==========

#[derive(Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub model: String,   // e.g. claude-3-5-sonnet-latest
    pub api_url: String, // default https://api.anthropic.com
}

#[derive(Clone)]
pub struct AnthropicClient {
    http: Client,
    cfg: AnthropicConfig,
}

impl AnthropicClient {
    pub fn new(cfg: AnthropicConfig) -> Self {
        Self {
            http: Client::new(),
            cfg,
        }
    }
}

#[derive(Serialize)]
struct AnthMessageContent {
    r#type: &'static str,
    text: String,
}

#[derive(Serialize)]
struct AnthMessageReqMsg {
    role: &'static str,
    content: Vec<AnthMessageContent>,
}

#[derive(Serialize)]
struct AnthMessageReq {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthMessageReqMsg>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct AnthMessageRespContent {
    #[allow(dead_code)]
    r#type: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Deserialize)]
struct AnthMessageResp {
    model: Option<String>,
    content: Vec<AnthMessageRespContent>,
    usage: Option<AnthUsage>,
}

#[async_trait]
impl CompletionModel for AnthropicClient {
    fn provider(&self) -> &str {
        "anthropic"
    }

    #[instrument(skip(self, req), fields(model = %self.cfg.model))]
    async fn complete(&self, req: &CompletionRequest) -> Result<Completion> {
        let url = format!("{}/v1/messages", self.cfg.api_url.trim_end_matches('/'));
        let body = AnthMessageReq {
            model: self.cfg.model.clone(),
            system: req.system.clone(),
            messages: vec![AnthMessageReqMsg {
                role: "user",
                content: vec![AnthMessageContent {
                    r#type: "text",
                    text: req.prompt.clone(),
                }],
            }],
            max_tokens: req.max_tokens,
            temperature: req.temperature,
        };

        let resp = self
            .http
            .post(url)
            .header("x-api-key", &self.cfg.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(status_error(self.provider(), status, txt));
        }

        let data: AnthMessageResp = resp.json().await.map_err(network_error)?;
        let mut out = String::new();
        for c in data.content.into_iter() {
            if let Some(t) = c.text {
                out.push_str(&t);
            }
        }
        let usage = match data.usage {
            Some(u) => Usage {
                prompt_tokens: u.input_tokens,
                completion_tokens: u.output_tokens,
                total_tokens: u.input_tokens + u.output_tokens,
            },
            None => estimate_usage(&req.prompt, &out),
        };
        Ok(Completion {
            text: out,
            model: data.model.unwrap_or_else(|| self.cfg.model.clone()),
            usage,
        })
    }
}

#[async_trait]
impl EmbedModel for AnthropicClient {
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(PiqError::configuration(
            "embedding_provider",
            "Anthropic does not provide embeddings; configure another embedding provider",
        ))
    }
}

// ========== Provider Factory & Config ==========

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ChatProviderConfig {
    #[serde(rename = "openai_compat")]
    OpenAiCompat {
        base_url: String,
        api_key: String,
        model: String,
    },
    #[serde(rename = "anthropic")]
    Anthropic {
        api_url: Option<String>,
        api_key: String,
        model: String,
    },
    #[serde(rename = "watsonx")]
    Watsonx {
        url: Option<String>,
        api_key: String,
        project_id: String,
        model: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EmbedProviderConfig {
    #[serde(rename = "openai_compat")]
    OpenAiCompat {
        base_url: String,
        api_key: String,
        model: String,
    },
    #[serde(rename = "watsonx")]
    Watsonx {
        url: Option<String>,
        api_key: String,
        project_id: String,
        model: String,
    },
}

pub const DEFAULT_ANTHROPIC_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_WATSONX_URL: &str = "https://us-south.ml.cloud.ibm.com";

pub fn make_chat_provider(cfg: ChatProviderConfig) -> Result<Arc<dyn CompletionModel>> {
    let provider: Arc<dyn CompletionModel> = match cfg {
        ChatProviderConfig::OpenAiCompat {
            base_url,
            api_key,
            model,
        } => Arc::new(OpenAiCompatClient::new(OpenAiCompatConfig {
            base_url,
            api_key,
            chat_model: model,
            embedding_model: None,
        })),
        ChatProviderConfig::Anthropic {
            api_url,
            api_key,
            model,
        } => Arc::new(AnthropicClient::new(AnthropicConfig {
            api_url: api_url.unwrap_or_else(|| DEFAULT_ANTHROPIC_URL.into()),
            api_key,
            model,
        })),
        ChatProviderConfig::Watsonx {
            url,
            api_key,
            project_id,
            model,
        } => Arc::new(WatsonxClient::new(WatsonxConfig {
            url: url.unwrap_or_else(|| DEFAULT_WATSONX_URL.into()),
            api_key,
            project_id,
            model,
            embedding_model: None,
            iam_url: watsonx::DEFAULT_IAM_URL.into(),
        })?),
    };
    Ok(provider)
}

pub fn make_embed_provider(cfg: EmbedProviderConfig) -> Result<Arc<dyn EmbedModel>> {
    let provider: Arc<dyn EmbedModel> = match cfg {
        EmbedProviderConfig::OpenAiCompat {
            base_url,
            api_key,
            model,
        } => Arc::new(OpenAiCompatClient::new(OpenAiCompatConfig {
            base_url,
            api_key,
            chat_model: "".into(),
            embedding_model: Some(model),
        })),
        EmbedProviderConfig::Watsonx {
            url,
            api_key,
            project_id,
            model,
        } => Arc::new(WatsonxClient::new(WatsonxConfig {
            url: url.unwrap_or_else(|| DEFAULT_WATSONX_URL.into()),
            api_key,
            project_id,
            model: "".into(),
            embedding_model: Some(model),
            iam_url: watsonx::DEFAULT_IAM_URL.into(),
        })?),
    };
    Ok(provider)
}
