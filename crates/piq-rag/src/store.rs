use async_trait::async_trait;
use piq_core::{Chunk, Embedding, HealthStatus, StoreHit};
use piq_error::{PiqError, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::lexical::{LexicalConfig, LexicalIndex};

pub const DEFAULT_EMBEDDING_DIMENSION: usize = 768;

/// 内容存储：保存文档块及其嵌入，提供向量与关键词两种查询
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// 相似度不低于 `threshold` 的块，按相似度降序
    async fn vector_search(
        &self,
        embedding: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<StoreHit>>;

    /// 关键词相关度降序
    async fn keyword_search(&self, query: &str, top_k: usize) -> Result<Vec<StoreHit>>;

    /// `chunks` 与 `embeddings` 一一对应，返回写入条数
    async fn store_chunks(&self, chunks: &[Chunk], embeddings: &[Embedding]) -> Result<usize>;

    /// 删除文档的全部块，返回删除条数
    async fn delete_document(&self, document_id: &str) -> Result<usize>;

    /// 文档的全部块，按 chunk_index 升序；文档不存在时为空
    async fn get_document_chunks(&self, document_id: &str) -> Result<Vec<Chunk>>;

    async fn health_check(&self) -> Result<HealthStatus> {
        Ok(HealthStatus::Healthy)
    }
}

/// 余弦相似度；任一向量为空或为零向量时返回 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

struct StoredChunk {
    chunk: Chunk,
    embedding: Embedding,
}

#[derive(Default)]
struct MemoryState {
    /// 插入顺序，保证同分结果稳定
    order: Vec<String>,
    chunks: HashMap<String, StoredChunk>,
    lexical: LexicalIndex,
}

/// 基于内存的内容存储
pub struct MemoryContentStore {
    dimension: usize,
    state: RwLock<MemoryState>,
}

impl Default for MemoryContentStore {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIMENSION)
    }
}

impl MemoryContentStore {
    pub fn new(dimension: usize) -> Self {
        Self::with_lexical(dimension, LexicalConfig::default())
    }

    pub fn with_lexical(dimension: usize, lexical: LexicalConfig) -> Self {
        Self {
            dimension,
            state: RwLock::new(MemoryState {
                lexical: LexicalIndex::new(lexical),
                ..Default::default()
            }),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn store_error(operation: &str, message: impl Into<String>) -> PiqError {
    PiqError::ContentStore {
        operation: operation.to_string(),
        message: message.into(),
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    #[instrument(skip(self, embedding))]
    async fn vector_search(
        &self,
        embedding: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<StoreHit>> {
        if embedding.len() != self.dimension {
            return Err(store_error(
                "vector_search",
                format!(
                    "query dimension {} does not match store dimension {}",
                    embedding.len(),
                    self.dimension
                ),
            ));
        }

        let state = self.state.read().await;
        let mut hits: Vec<StoreHit> = state
            .order
            .iter()
            .filter_map(|id| state.chunks.get(id))
            .filter_map(|stored| {
                let similarity = cosine_similarity(embedding, &stored.embedding);
                (similarity >= threshold).then(|| StoreHit::from_chunk(&stored.chunk, similarity))
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(top_k);

        debug!(results = hits.len(), "向量检索完成");
        Ok(hits)
    }

    #[instrument(skip(self))]
    async fn keyword_search(&self, query: &str, top_k: usize) -> Result<Vec<StoreHit>> {
        let state = self.state.read().await;
        let hits: Vec<StoreHit> = state
            .lexical
            .search(query, top_k)
            .into_iter()
            .filter_map(|(id, relevance)| {
                state
                    .chunks
                    .get(&id)
                    .map(|stored| StoreHit::from_chunk(&stored.chunk, relevance))
            })
            .collect();

        debug!(results = hits.len(), "关键词检索完成");
        Ok(hits)
    }

    #[instrument(skip(self, chunks, embeddings), fields(count = chunks.len()))]
    async fn store_chunks(&self, chunks: &[Chunk], embeddings: &[Embedding]) -> Result<usize> {
        if chunks.len() != embeddings.len() {
            return Err(store_error(
                "store_chunks",
                format!(
                    "{} chunks but {} embeddings",
                    chunks.len(),
                    embeddings.len()
                ),
            ));
        }
        if let Some(bad) = embeddings.iter().find(|e| e.len() != self.dimension) {
            return Err(store_error(
                "store_chunks",
                format!(
                    "embedding dimension {} does not match store dimension {}",
                    bad.len(),
                    self.dimension
                ),
            ));
        }

        let mut state = self.state.write().await;
        for (chunk, embedding) in chunks.iter().zip(embeddings.iter()) {
            if !state.chunks.contains_key(&chunk.chunk_id) {
                state.order.push(chunk.chunk_id.clone());
            }
            state.lexical.insert(&chunk.chunk_id, &chunk.text);
            state.chunks.insert(
                chunk.chunk_id.clone(),
                StoredChunk {
                    chunk: chunk.clone(),
                    embedding: embedding.clone(),
                },
            );
        }

        debug!(total = state.order.len(), "文档块已写入");
        Ok(chunks.len())
    }

    #[instrument(skip(self))]
    async fn delete_document(&self, document_id: &str) -> Result<usize> {
        let mut state = self.state.write().await;
        let removed: Vec<String> = state
            .chunks
            .values()
            .filter(|s| s.chunk.document_id == document_id)
            .map(|s| s.chunk.chunk_id.clone())
            .collect();

        for id in &removed {
            state.chunks.remove(id);
            state.lexical.remove(id);
        }
        state.order.retain(|id| !removed.contains(id));

        debug!(removed = removed.len(), "文档已删除");
        Ok(removed.len())
    }

    #[instrument(skip(self))]
    async fn get_document_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let state = self.state.read().await;
        let mut chunks: Vec<Chunk> = state
            .order
            .iter()
            .filter_map(|id| state.chunks.get(id))
            .filter(|s| s.chunk.document_id == document_id)
            .map(|s| s.chunk.clone())
            .collect();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        if self.is_empty().await {
            return Ok(HealthStatus::Degraded {
                reason: "content store holds no chunks".to_string(),
            });
        }
        Ok(HealthStatus::Healthy)
    }
}
