//! IBM watsonx.ai 客户端：IAM API key 换取 bearer token，再调用
//! `text/generation` 与 `text/embeddings` 接口。

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::{
    estimate_usage, network_error, status_error, Completion, CompletionModel, CompletionRequest,
    EmbedModel, PiqError, Result, Usage,
};

pub const DEFAULT_IAM_URL: &str = "https://iam.cloud.ibm.com/identity/token";
const GENERATION_VERSION: &str = "2023-05-29";
const EMBEDDING_VERSION: &str = "2023-10-25";
/// token 过期前提前刷新的余量
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct WatsonxConfig {
    pub api_key: String,
    pub url: String, // e.g. https://us-south.ml.cloud.ibm.com
    pub project_id: String,
    pub model: String, // e.g. meta-llama/llama-2-70b-chat
    pub embedding_model: Option<String>, // e.g. ibm/slate-125m-english-rtrvr
    pub iam_url: String,
}

struct IamToken {
    access_token: String,
    expires_at: Instant,
}

pub struct WatsonxClient {
    http: Client,
    cfg: WatsonxConfig,
    token: RwLock<Option<IamToken>>,
}

impl WatsonxClient {
    /// 缺少 API key 或 project id 时直接返回配置错误
    pub fn new(cfg: WatsonxConfig) -> Result<Self> {
        if cfg.api_key.trim().is_empty() {
            return Err(PiqError::configuration(
                "WATSONX_AI_API_KEY",
                "watsonx.ai API key is missing",
            ));
        }
        if cfg.project_id.trim().is_empty() {
            return Err(PiqError::configuration(
                "WATSONX_AI_PROJECT_ID",
                "watsonx.ai project id is missing",
            ));
        }
        Ok(Self {
            http: Client::new(),
            cfg,
            token: RwLock::new(None),
        })
    }

    /// `{url}/ml/v1`，已包含时不再追加
    pub fn api_base(&self) -> String {
        api_base(&self.cfg.url)
    }

    async fn bearer(&self) -> Result<String> {
        {
            let guard = self.token.read().await;
            if let Some(ref t) = *guard {
                if Instant::now() + TOKEN_REFRESH_MARGIN < t.expires_at {
                    return Ok(t.access_token.clone());
                }
            }
        }

        let mut guard = self.token.write().await;
        // 等待写锁期间可能已被其他请求刷新
        if let Some(ref t) = *guard {
            if Instant::now() + TOKEN_REFRESH_MARGIN < t.expires_at {
                return Ok(t.access_token.clone());
            }
        }

        let fresh = self.request_token().await?;
        let access_token = fresh.access_token.clone();
        *guard = Some(fresh);
        Ok(access_token)
    }

    #[instrument(skip(self))]
    async fn request_token(&self) -> Result<IamToken> {
        let resp = self
            .http
            .post(&self.cfg.iam_url)
            .form(&[
                ("grant_type", "urn:ibm:params:oauth:grant-type:apikey"),
                ("apikey", self.cfg.api_key.as_str()),
            ])
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(network_error)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<IamErrorResp>(&body)
                .ok()
                .and_then(|e| e.error_message)
                .unwrap_or_else(|| format!("HTTP {}", status));
            return Err(PiqError::Authentication {
                provider: "watsonx".to_string(),
                message: format!("API key validation failed: {}", message),
            });
        }

        let data: IamTokenResp = resp.json().await.map_err(network_error)?;
        if data.access_token.is_empty() {
            return Err(PiqError::Authentication {
                provider: "watsonx".to_string(),
                message: "IAM response carried no access token".to_string(),
            });
        }
        debug!(expires_in = data.expires_in, "watsonx IAM token refreshed");
        Ok(IamToken {
            access_token: data.access_token,
            expires_at: Instant::now() + Duration::from_secs(data.expires_in.unwrap_or(3600)),
        })
    }
}

pub(crate) fn api_base(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    if trimmed.contains("/ml/v1") {
        trimmed.to_string()
    } else {
        format!("{}/ml/v1", trimmed)
    }
}

#[derive(Deserialize)]
struct IamTokenResp {
    access_token: String,
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct IamErrorResp {
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

#[derive(Serialize)]
struct GenerationParams {
    decoding_method: &'static str,
    max_new_tokens: u32,
    temperature: f32,
    top_p: f32,
    repetition_penalty: f32,
}

#[derive(Serialize)]
struct GenerationReq<'a> {
    model_id: &'a str,
    input: String,
    parameters: GenerationParams,
    project_id: &'a str,
}

#[derive(Deserialize)]
struct GenerationResult {
    generated_text: String,
    input_token_count: Option<u32>,
    generated_token_count: Option<u32>,
}

#[derive(Deserialize)]
struct GenerationResp {
    model_id: Option<String>,
    results: Vec<GenerationResult>,
}

#[async_trait]
impl CompletionModel for WatsonxClient {
    fn provider(&self) -> &str {
        "watsonx"
    }

    #[instrument(skip(self, req), fields(model = %self.cfg.model))]
    async fn complete(&self, req: &CompletionRequest) -> Result<Completion> {
        let token = self.bearer().await?;
        let full_prompt = match req.system {
            Some(ref system) => format!("{}\n\n{}", system, req.prompt),
            None => req.prompt.clone(),
        };
        let url = format!(
            "{}/text/generation?version={}",
            self.api_base(),
            GENERATION_VERSION
        );
        let body = GenerationReq {
            model_id: &self.cfg.model,
            input: full_prompt.clone(),
            parameters: GenerationParams {
                decoding_method: "greedy",
                max_new_tokens: req.max_tokens,
                temperature: req.temperature,
                top_p: 0.9,
                repetition_penalty: 1.1,
            },
            project_id: &self.cfg.project_id,
        };

        let resp = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(status_error(self.provider(), status, txt));
        }

        let data: GenerationResp = resp.json().await.map_err(network_error)?;
        let first = data.results.into_iter().next();
        let (text, usage) = match first {
            Some(GenerationResult {
                generated_text,
                input_token_count: Some(input),
                generated_token_count: Some(generated),
            }) => (
                generated_text,
                Usage {
                    prompt_tokens: input,
                    completion_tokens: generated,
                    total_tokens: input + generated,
                },
            ),
            Some(r) => {
                let usage = estimate_usage(&full_prompt, &r.generated_text);
                (r.generated_text, usage)
            }
            None => (String::new(), estimate_usage(&full_prompt, "")),
        };
        Ok(Completion {
            text,
            model: data.model_id.unwrap_or_else(|| self.cfg.model.clone()),
            usage,
        })
    }
}

#[derive(Serialize)]
struct EmbeddingReq<'a> {
    inputs: &'a [String],
    model_id: &'a str,
    project_id: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResult {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbeddingResp {
    results: Vec<EmbeddingResult>,
}

#[async_trait]
impl EmbedModel for WatsonxClient {
    #[instrument(skip(self, texts), fields(count = texts.len()))]
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self
            .cfg
            .embedding_model
            .as_deref()
            .ok_or_else(|| PiqError::configuration("embedding_model", "not configured"))?;
        let token = self.bearer().await?;
        let url = format!(
            "{}/text/embeddings?version={}",
            self.api_base(),
            EMBEDDING_VERSION
        );
        let body = EmbeddingReq {
            inputs: texts,
            model_id: model,
            project_id: &self.cfg.project_id,
        };

        let resp = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(match status_error(self.provider(), status, txt) {
                PiqError::LlmService { provider, message } => {
                    PiqError::EmbeddingService { provider, message }
                }
                other => other,
            });
        }

        let data: EmbeddingResp = resp.json().await.map_err(network_error)?;
        Ok(data.results.into_iter().map(|r| r.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WatsonxConfig {
        WatsonxConfig {
            api_key: "key".into(),
            url: "https://us-south.ml.cloud.ibm.com/".into(),
            project_id: "project".into(),
            model: "meta-llama/llama-2-70b-chat".into(),
            embedding_model: None,
            iam_url: DEFAULT_IAM_URL.into(),
        }
    }

    #[test]
    fn test_api_base_appends_ml_v1_once() {
        assert_eq!(
            api_base("https://us-south.ml.cloud.ibm.com/"),
            "https://us-south.ml.cloud.ibm.com/ml/v1"
        );
        assert_eq!(
            api_base("https://us-south.ml.cloud.ibm.com/ml/v1"),
            "https://us-south.ml.cloud.ibm.com/ml/v1"
        );
    }

    #[test]
    fn test_missing_project_id_is_configuration_error() {
        let mut cfg = config();
        cfg.project_id = " ".into();
        match WatsonxClient::new(cfg) {
            Err(PiqError::Configuration { key, .. }) => assert_eq!(key, "WATSONX_AI_PROJECT_ID"),
            _ => panic!("expected configuration error"),
        }
    }

    #[tokio::test]
    async fn test_embed_without_model_fails_before_network() {
        let client = WatsonxClient::new(config()).unwrap();
        let err = client.embed(&["text".to_string()]).await.unwrap_err();
        assert!(matches!(err, PiqError::Configuration { .. }));
    }
}
