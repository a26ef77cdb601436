mod config;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use piq_agent::{ConfidenceScorer, QaService, ReasoningLoop};
use piq_audit::{AuditSink, SledAuditLog};
use piq_core::{AuditQuery, ChunkMetadata, QuestionContext, META_FILENAME};
use piq_error::{ErrorMetadataBuilder, PiqError};
use piq_llm::{make_chat_provider, make_embed_provider, CompletionModel, EmbedModel};
use piq_rag::{
    ContentStore, DocumentIngestor, HybridSearch, MemoryContentStore, Retriever, TextChunker,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{load_config, AppConfig, DEFAULT_CONFIG_PATH};

#[derive(Debug, Parser)]
#[command(name = "policyiq", version, about = "合规问答命令行工具")]
struct Cli {
    /// YAML 配置文件
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 预览文档分块结果，不调用外部服务
    Chunk {
        file: PathBuf,
        #[arg(long)]
        document_id: Option<String>,
    },
    /// 载入文档后回答一个合规问题
    Ask {
        question: String,
        /// 回答前载入的文档，可重复
        #[arg(long = "doc")]
        docs: Vec<PathBuf>,
        #[arg(long)]
        user: Option<String>,
        /// 未配置生成服务时仍以降级模式运行
        #[arg(long)]
        allow_degraded: bool,
    },
    /// 查询审计日志
    Audit {
        /// 按记录 ID 读取单条记录
        #[arg(long)]
        id: Option<Uuid>,
        #[arg(long, default_value_t = 100)]
        limit: usize,
        #[arg(long)]
        min_confidence: Option<f32>,
        #[arg(long)]
        document_id: Option<String>,
        /// RFC 3339 时间，例如 2024-05-01T00:00:00Z
        #[arg(long)]
        start: Option<DateTime<Utc>>,
        #[arg(long)]
        end: Option<DateTime<Utc>>,
    },
    /// 检查检索链路健康状态
    Health,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    dotenv().ok();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<PiqError>() {
                Some(err) => {
                    let meta = ErrorMetadataBuilder::new("cli").build(err);
                    err.log(&meta);
                    eprintln!("{}", err.user_message());
                }
                None => {
                    error!(error = %e, "命令执行失败");
                    eprintln!("error: {:#}", e);
                }
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = load_config(&cli.config)?;
    match cli.command {
        Command::Chunk { file, document_id } => chunk(&cfg, &file, document_id),
        Command::Ask {
            question,
            docs,
            user,
            allow_degraded,
        } => ask(&cfg, &question, &docs, user, allow_degraded).await,
        Command::Audit {
            id,
            limit,
            min_confidence,
            document_id,
            start,
            end,
        } => {
            let log = SledAuditLog::open(&cfg.audit.path)?;
            if let Some(id) = id {
                match log.get(id).await? {
                    Some(record) => print_json(&record)?,
                    None => anyhow::bail!("audit record {} not found", id),
                }
                return Ok(());
            }
            let query = AuditQuery {
                start,
                end,
                min_confidence,
                document_id,
                limit,
            };
            query.validate()?;
            let records = log.query(&query).await?;
            info!(count = records.len(), "审计查询完成");
            print_json(&records)
        }
        Command::Health => {
            let store = Arc::new(MemoryContentStore::new(cfg.embedding_dimension));
            let search = HybridSearch::new(
                build_embedder(&cfg)?,
                Some(store as Arc<dyn ContentStore>),
                cfg.retrieval.hybrid(),
            );
            print_json(&search.health_check().await?)
        }
    }
}

fn chunk(cfg: &AppConfig, file: &Path, document_id: Option<String>) -> anyhow::Result<()> {
    let text = read_document(file)?;
    let doc_id = document_id.unwrap_or_else(|| default_document_id(file));
    let chunker = TextChunker::new(cfg.chunker.clone());
    let chunks = chunker.chunk(&text, &doc_id, Some(&file_metadata(file)));
    info!(document_id = %doc_id, chunks = chunks.len(), "分块完成");
    print_json(&chunks)
}

async fn ask(
    cfg: &AppConfig,
    question: &str,
    docs: &[PathBuf],
    user: Option<String>,
    allow_degraded: bool,
) -> anyhow::Result<()> {
    let embedder = build_embedder(cfg)?;
    let store = Arc::new(MemoryContentStore::new(cfg.embedding_dimension));

    if !docs.is_empty() {
        let embedder = embedder.clone().ok_or_else(|| {
            PiqError::configuration("embedding_provider", "documents need an embedding provider")
        })?;
        let ingestor = DocumentIngestor::new(
            TextChunker::new(cfg.chunker.clone()),
            embedder,
            store.clone() as Arc<dyn ContentStore>,
            cfg.retrieval.ingest(),
        );
        for file in docs {
            let text = read_document(file)?;
            let report = ingestor
                .ingest(&default_document_id(file), &text, Some(file_metadata(file)))
                .await?;
            info!(
                document_id = %report.document_id,
                chunks = report.chunks_count,
                "文档已载入"
            );
        }
    }

    let retriever: Arc<dyn Retriever> = Arc::new(HybridSearch::new(
        embedder,
        Some(store as Arc<dyn ContentStore>),
        cfg.retrieval.hybrid(),
    ));
    let mut builder = ReasoningLoop::builder()
        .retriever(retriever)
        .scorer(ConfidenceScorer::new(cfg.scoring.clone()))
        .config(cfg.generation.agent());
    if let Some(llm) = build_chat(cfg)? {
        builder = builder.completion_model(llm);
    }
    let reasoning = if allow_degraded {
        builder.build()
    } else {
        builder.try_build()?
    };

    let audit: Option<Arc<dyn AuditSink>> = match SledAuditLog::open(&cfg.audit.path) {
        Ok(log) => Some(Arc::new(log)),
        Err(e) => {
            warn!(error = %e, path = %cfg.audit.path.display(), "审计日志不可用");
            None
        }
    };
    let service = QaService::new(reasoning, audit);
    let answered = service
        .answer_question(question, Some(QuestionContext { user_id: user }))
        .await?;
    print_json(&answered)
}

fn build_chat(cfg: &AppConfig) -> anyhow::Result<Option<Arc<dyn CompletionModel>>> {
    match &cfg.chat_provider {
        Some(p) => Ok(Some(make_chat_provider(p.chat()?)?)),
        None => Ok(None),
    }
}

fn build_embedder(cfg: &AppConfig) -> anyhow::Result<Option<Arc<dyn EmbedModel>>> {
    match &cfg.embedding_provider {
        Some(p) => Ok(Some(make_embed_provider(p.embed()?)?)),
        None => Ok(None),
    }
}

fn read_document(file: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(file).with_context(|| format!("read document {}", file.display()))
}

/// 文件名去掉扩展名作为文档 ID
fn default_document_id(file: &Path) -> String {
    file.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn file_metadata(file: &Path) -> ChunkMetadata {
    let mut meta = ChunkMetadata::new();
    if let Some(name) = file.file_name() {
        meta.insert(META_FILENAME.to_string(), name.to_string_lossy().into_owned());
    }
    meta
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};
    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}
