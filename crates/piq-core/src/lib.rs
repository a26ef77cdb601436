use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// 嵌入向量，由外部嵌入服务生成，核心逻辑只做相似度比较
pub type Embedding = Vec<f32>;

/// 文档块的自由元数据（filename、document_type、total_pages 等）
pub type ChunkMetadata = BTreeMap<String, String>;

/// 元数据中具有特殊含义的键，写入存储时映射到检索结果字段
pub const META_DOCUMENT_NAME: &str = "document_name";
pub const META_FILENAME: &str = "filename";
pub const META_SECTION: &str = "section";
pub const META_PAGE_NUMBER: &str = "page_number";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    pub chunk_index: usize,
    pub char_count: usize,
    pub word_count: usize,
    pub metadata: Option<ChunkMetadata>,
}

impl Chunk {
    pub fn new(
        document_id: &str,
        chunk_index: usize,
        text: String,
        metadata: Option<ChunkMetadata>,
    ) -> Self {
        Self {
            chunk_id: Self::make_id(document_id, chunk_index),
            document_id: document_id.to_string(),
            char_count: text.chars().count(),
            word_count: text.split_whitespace().count(),
            text,
            chunk_index,
            metadata,
        }
    }

    /// `{document_id}_chunk_{index}`
    pub fn make_id(document_id: &str, chunk_index: usize) -> String {
        format!("{}_chunk_{}", document_id, chunk_index)
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(key))
            .map(String::as_str)
    }
}

/// 内容存储返回的单条命中记录。`score` 的含义取决于查询来源：
/// 向量查询为相似度，关键词查询为相关度。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreHit {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    pub document_name: Option<String>,
    pub section: Option<String>,
    pub page_number: Option<u32>,
    pub score: f32,
}

impl StoreHit {
    pub fn from_chunk(chunk: &Chunk, score: f32) -> Self {
        Self {
            chunk_id: chunk.chunk_id.clone(),
            document_id: chunk.document_id.clone(),
            text: chunk.text.clone(),
            document_name: chunk
                .meta(META_DOCUMENT_NAME)
                .or_else(|| chunk.meta(META_FILENAME))
                .map(str::to_string),
            section: chunk.meta(META_SECTION).map(str::to_string),
            page_number: chunk
                .meta(META_PAGE_NUMBER)
                .and_then(|p| p.trim().parse().ok()),
            score,
        }
    }
}

/// 混合检索结果，每次查询临时计算，不持久化
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    pub document_name: Option<String>,
    pub section: Option<String>,
    pub page_number: Option<u32>,
    pub vector_score: f32,
    pub keyword_score: f32,
    pub combined_score: f32,
}

impl SearchResult {
    /// 从命中记录构造，各维度分数置零，由融合过程填充
    pub fn from_hit(hit: StoreHit) -> Self {
        Self {
            chunk_id: hit.chunk_id,
            document_id: hit.document_id,
            text: hit.text,
            document_name: hit.document_name,
            section: hit.section,
            page_number: hit.page_number,
            vector_score: 0.0,
            keyword_score: 0.0,
            combined_score: 0.0,
        }
    }
}

/// 问题分解计划，仅在单次推理循环内存在
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub is_complex: bool,
    pub sub_questions: Vec<String>,
    pub reasoning: String,
}

impl Plan {
    pub fn single(question: &str, reasoning: &str) -> Self {
        Self {
            is_complex: false,
            sub_questions: vec![question.to_string()],
            reasoning: reasoning.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// 生成服务的一次完整返回
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningResult {
    pub answer: String,
    pub llm_response: Option<Completion>,
    pub context_used: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLabel {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub is_supported: bool,
    /// 支撑证据的 chunk_id
    pub supporting_evidence: Vec<String>,
    /// 缺乏依据的论断
    pub gaps: Vec<String>,
    pub confidence: ConfidenceLabel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub document_id: String,
    pub document_name: Option<String>,
    pub section: Option<String>,
    pub page_number: Option<u32>,
    pub chunk_id: String,
    pub relevance_score: f32,
    pub excerpt: String,
}

/// 最终答案，每个问题生成一次，之后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub answer: String,
    pub explanation: String,
    pub citations: Vec<Citation>,
    pub confidence_score: f32,
    pub manual_review_recommended: bool,
    pub reasoning_steps: Vec<String>,
}

/// 调用方附带的问题上下文
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuestionContext {
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedSource {
    pub chunk_id: String,
    pub document_id: String,
    pub combined_score: f32,
}

impl From<&SearchResult> for RetrievedSource {
    fn from(r: &SearchResult) -> Self {
        Self {
            chunk_id: r.chunk_id.clone(),
            document_id: r.document_id.clone(),
            combined_score: r.combined_score,
        }
    }
}

/// 审计记录：一次问答交互的不可变快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub question: String,
    pub answer: String,
    pub explanation: String,
    pub citations: Vec<Citation>,
    pub confidence_score: f32,
    pub user_id: Option<String>,
    pub llm_prompt: Option<String>,
    pub llm_response: Option<String>,
    pub retrieved_sources: Vec<RetrievedSource>,
    pub reasoning_steps: Vec<String>,
    pub manual_review_recommended: bool,
}

impl AuditRecord {
    pub fn references_document(&self, document_id: &str) -> bool {
        self.retrieved_sources
            .iter()
            .any(|s| s.document_id == document_id)
            || self.citations.iter().any(|c| c.document_id == document_id)
    }
}

pub const AUDIT_QUERY_DEFAULT_LIMIT: usize = 100;
pub const AUDIT_QUERY_MAX_LIMIT: usize = 1000;

/// 审计日志查询条件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub min_confidence: Option<f32>,
    pub document_id: Option<String>,
    pub limit: usize,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            min_confidence: None,
            document_id: None,
            limit: AUDIT_QUERY_DEFAULT_LIMIT,
        }
    }
}

impl AuditQuery {
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 || self.limit > AUDIT_QUERY_MAX_LIMIT {
            return Err(Error::validation(format!(
                "limit must be between 1 and {}, got {}",
                AUDIT_QUERY_MAX_LIMIT, self.limit
            )));
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start > end {
                return Err(Error::validation("start must not be after end"));
            }
        }
        Ok(())
    }

    /// 记录是否满足全部过滤条件
    pub fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(start) = self.start {
            if record.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if record.timestamp > end {
                return false;
            }
        }
        if let Some(min) = self.min_confidence {
            if record.confidence_score < min {
                return false;
            }
        }
        if let Some(ref document_id) = self.document_id {
            if !record.references_document(document_id) {
                return false;
            }
        }
        true
    }
}

/// 协作服务健康状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded { reason: String },
    Unhealthy { error: String },
}

pub use piq_error::{PiqError as Error, Result};
