use anyhow::{anyhow, bail, Context};
use piq_agent::{AgentConfig, ScorerConfig};
use piq_llm::{ChatProviderConfig, EmbedProviderConfig};
use piq_rag::{ChunkerConfig, HybridConfig, IngestConfig, DEFAULT_EMBEDDING_DIMENSION};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "configs/default.yaml";

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub chunker: ChunkerConfig,
    #[serde(default)]
    pub retrieval: RetrievalCfg,
    #[serde(default)]
    pub scoring: ScorerConfig,
    #[serde(default)]
    pub generation: GenerationCfg,
    pub chat_provider: Option<ProviderCfgYaml>,
    pub embedding_provider: Option<ProviderCfgYaml>,
    #[serde(default = "default_dimension")]
    pub embedding_dimension: usize,
    #[serde(default)]
    pub audit: AuditCfg,
}

fn default_dimension() -> usize {
    DEFAULT_EMBEDDING_DIMENSION
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetrievalCfg {
    pub vector_weight: f32,
    pub keyword_weight: f32,
    pub similarity_threshold: f32,
    pub max_results: usize,
    pub timeout_secs: u64,
    pub embed_batch_size: usize,
}

impl Default for RetrievalCfg {
    fn default() -> Self {
        let hybrid = HybridConfig::default();
        Self {
            vector_weight: hybrid.vector_weight,
            keyword_weight: hybrid.keyword_weight,
            similarity_threshold: hybrid.similarity_threshold,
            max_results: hybrid.max_results,
            timeout_secs: hybrid.request_timeout.as_secs(),
            embed_batch_size: IngestConfig::default().embed_batch_size,
        }
    }
}

impl RetrievalCfg {
    pub fn hybrid(&self) -> HybridConfig {
        HybridConfig {
            vector_weight: self.vector_weight,
            keyword_weight: self.keyword_weight,
            similarity_threshold: self.similarity_threshold,
            max_results: self.max_results,
            request_timeout: Duration::from_secs(self.timeout_secs),
            ..Default::default()
        }
    }

    pub fn ingest(&self) -> IngestConfig {
        IngestConfig {
            embed_batch_size: self.embed_batch_size,
            request_timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GenerationCfg {
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
    pub max_citations: usize,
}

impl Default for GenerationCfg {
    fn default() -> Self {
        let agent = AgentConfig::default();
        Self {
            max_tokens: agent.completion_max_tokens,
            temperature: agent.completion_temperature,
            timeout_secs: agent.completion_timeout.as_secs(),
            max_citations: agent.max_citations,
        }
    }
}

impl GenerationCfg {
    pub fn agent(&self) -> AgentConfig {
        AgentConfig {
            completion_max_tokens: self.max_tokens,
            completion_temperature: self.temperature,
            completion_timeout: Duration::from_secs(self.timeout_secs),
            max_citations: self.max_citations,
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AuditCfg {
    pub path: PathBuf,
}

impl Default for AuditCfg {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/audit"),
        }
    }
}

/// 配置文件只保存环境变量名，密钥在启动时从环境读取
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderCfgYaml {
    pub kind: String,
    pub model: String,
    pub base_url: Option<String>,
    pub api_url: Option<String>,
    pub url: Option<String>,
    pub api_key_env: Option<String>,
    pub project_id_env: Option<String>,
}

impl ProviderCfgYaml {
    fn api_key(&self, default_env: &str) -> anyhow::Result<String> {
        read_env(self.api_key_env.as_deref().unwrap_or(default_env))
    }

    fn project_id(&self) -> anyhow::Result<String> {
        read_env(
            self.project_id_env
                .as_deref()
                .unwrap_or("WATSONX_PROJECT_ID"),
        )
    }

    pub fn chat(&self) -> anyhow::Result<ChatProviderConfig> {
        let cfg = match self.kind.as_str() {
            "openai_compat" => ChatProviderConfig::OpenAiCompat {
                base_url: self
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com".into()),
                api_key: self.api_key("OPENAI_API_KEY")?,
                model: self.model.clone(),
            },
            "anthropic" => ChatProviderConfig::Anthropic {
                api_url: self.api_url.clone(),
                api_key: self.api_key("ANTHROPIC_API_KEY")?,
                model: self.model.clone(),
            },
            "watsonx" => ChatProviderConfig::Watsonx {
                url: self.url.clone(),
                api_key: self.api_key("WATSONX_API_KEY")?,
                project_id: self.project_id()?,
                model: self.model.clone(),
            },
            other => bail!("unsupported chat provider kind={}", other),
        };
        Ok(cfg)
    }

    pub fn embed(&self) -> anyhow::Result<EmbedProviderConfig> {
        let cfg = match self.kind.as_str() {
            "openai_compat" => EmbedProviderConfig::OpenAiCompat {
                base_url: self
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com".into()),
                api_key: self.api_key("OPENAI_API_KEY")?,
                model: self.model.clone(),
            },
            "watsonx" => EmbedProviderConfig::Watsonx {
                url: self.url.clone(),
                api_key: self.api_key("WATSONX_API_KEY")?,
                project_id: self.project_id()?,
                model: self.model.clone(),
            },
            other => bail!("unsupported embedding provider kind={}", other),
        };
        Ok(cfg)
    }
}

/// 配置文件不存在时使用全部默认值（不配置任何外部服务）
pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if !path.exists() {
        info!(path = %path.display(), "配置文件不存在，使用默认配置");
        return parse_config("{}");
    }
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let cfg = parse_config(&s)?;
    info!("load_config: {:?}", cfg);
    Ok(cfg)
}

pub fn parse_config(s: &str) -> anyhow::Result<AppConfig> {
    Ok(serde_yaml::from_str(s)?)
}

fn read_env(key: &str) -> anyhow::Result<String> {
    std::env::var(key).map_err(|_| anyhow!("missing env {}", key))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
chunker:
  chunk_size: 800
  chunk_overlap: 100
retrieval:
  similarity_threshold: 0.5
  timeout_secs: 5
chat_provider:
  kind: watsonx
  model: ibm/granite-13b-chat-v2
  api_key_env: PIQ_TEST_CHAT_KEY
  project_id_env: PIQ_TEST_PROJECT
embedding_provider:
  kind: openai_compat
  model: text-embedding-3-small
  api_key_env: PIQ_TEST_EMBED_KEY
embedding_dimension: 1536
audit:
  path: /tmp/piq-audit
"#;

    #[test]
    fn test_parse_full_config() {
        let cfg = parse_config(SAMPLE).unwrap();
        assert_eq!(cfg.chunker.chunk_size, 800);
        assert_eq!(cfg.embedding_dimension, 1536);
        assert_eq!(cfg.audit.path, PathBuf::from("/tmp/piq-audit"));

        let hybrid = cfg.retrieval.hybrid();
        assert_eq!(hybrid.similarity_threshold, 0.5);
        assert_eq!(hybrid.vector_weight, 0.7);
        assert_eq!(hybrid.request_timeout, Duration::from_secs(5));
        assert_eq!(cfg.scoring.manual_review_threshold, 0.7);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = parse_config("{}").unwrap();
        assert!(cfg.chat_provider.is_none());
        assert!(cfg.embedding_provider.is_none());
        assert_eq!(cfg.embedding_dimension, DEFAULT_EMBEDDING_DIMENSION);
        assert_eq!(cfg.chunker.chunk_overlap, 200);
        assert_eq!(cfg.generation.agent().completion_max_tokens, 1500);
    }

    #[test]
    fn test_scoring_section_sets_review_threshold() {
        let cfg = parse_config("scoring:\n  manual_review_threshold: 0.8\n").unwrap();
        assert_eq!(cfg.scoring.manual_review_threshold, 0.8);
        let scorer = piq_agent::ConfidenceScorer::new(cfg.scoring);
        assert!(scorer.needs_manual_review(0.75));
        assert!(!scorer.needs_manual_review(0.8));
    }

    #[test]
    fn test_provider_keys_come_from_env() {
        let cfg = parse_config(SAMPLE).unwrap();
        let chat = cfg.chat_provider.unwrap();

        std::env::remove_var("PIQ_TEST_CHAT_KEY");
        let err = chat.chat().unwrap_err();
        assert!(err.to_string().contains("PIQ_TEST_CHAT_KEY"));

        std::env::set_var("PIQ_TEST_CHAT_KEY", "k");
        std::env::set_var("PIQ_TEST_PROJECT", "p");
        match chat.chat().unwrap() {
            ChatProviderConfig::Watsonx {
                url,
                api_key,
                project_id,
                ..
            } => {
                assert!(url.is_none());
                assert_eq!(api_key, "k");
                assert_eq!(project_id, "p");
            }
            other => panic!("unexpected provider {:?}", other),
        }
    }

    #[test]
    fn test_unsupported_kinds_are_rejected() {
        let cfg = ProviderCfgYaml {
            kind: "anthropic".into(),
            model: "claude".into(),
            base_url: None,
            api_url: None,
            url: None,
            api_key_env: None,
            project_id_env: None,
        };
        let err = cfg.embed().unwrap_err();
        assert!(err.to_string().contains("unsupported embedding provider"));

        let cfg = ProviderCfgYaml {
            kind: "qwen".into(),
            ..cfg
        };
        assert!(cfg.chat().is_err());
    }
}
