use piq_core::{ChunkMetadata, Embedding};
use piq_error::{PiqError, Result};
use piq_llm::EmbedModel;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::chunker::TextChunker;
use crate::store::ContentStore;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// 每次嵌入请求携带的块数
    pub embed_batch_size: usize,
    pub request_timeout: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            embed_batch_size: 16,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub document_id: String,
    pub chunks_count: usize,
}

/// 文档入库：分块、嵌入、写入内容存储
pub struct DocumentIngestor {
    chunker: TextChunker,
    embedder: Arc<dyn EmbedModel>,
    store: Arc<dyn ContentStore>,
    config: IngestConfig,
}

impl DocumentIngestor {
    pub fn new(
        chunker: TextChunker,
        embedder: Arc<dyn EmbedModel>,
        store: Arc<dyn ContentStore>,
        config: IngestConfig,
    ) -> Self {
        Self {
            chunker,
            embedder,
            store,
            config,
        }
    }

    #[instrument(skip(self, text, metadata), fields(chars = text.len()))]
    pub async fn ingest(
        &self,
        document_id: &str,
        text: &str,
        metadata: Option<ChunkMetadata>,
    ) -> Result<IngestReport> {
        if document_id.trim().is_empty() {
            return Err(PiqError::validation("document_id must not be empty"));
        }

        let chunks = self.chunker.chunk(text, document_id, metadata.as_ref());
        if chunks.is_empty() {
            debug!(document_id, "文档无可索引内容");
            return Ok(IngestReport {
                document_id: document_id.to_string(),
                chunks_count: 0,
            });
        }

        let batch_size = self.config.embed_batch_size.max(1);
        let mut embeddings: Vec<Embedding> = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors =
                tokio::time::timeout(self.config.request_timeout, self.embedder.embed(&texts))
                    .await
                    .map_err(|_| PiqError::timeout("embed", self.config.request_timeout))??;
            if vectors.len() != texts.len() {
                return Err(PiqError::EmbeddingService {
                    provider: "embed".to_string(),
                    message: format!(
                        "expected {} embeddings, received {}",
                        texts.len(),
                        vectors.len()
                    ),
                });
            }
            embeddings.extend(vectors);
        }

        let stored = tokio::time::timeout(
            self.config.request_timeout,
            self.store.store_chunks(&chunks, &embeddings),
        )
        .await
        .map_err(|_| PiqError::timeout("store_chunks", self.config.request_timeout))??;

        info!(document_id, chunks = stored, "文档入库完成");
        Ok(IngestReport {
            document_id: document_id.to_string(),
            chunks_count: stored,
        })
    }

    #[instrument(skip(self))]
    pub async fn delete_document(&self, document_id: &str) -> Result<usize> {
        if document_id.trim().is_empty() {
            return Err(PiqError::validation("document_id must not be empty"));
        }
        let removed = self.store.delete_document(document_id).await?;
        info!(document_id, removed, "文档已删除");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkerConfig;
    use crate::store::MemoryContentStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 记录调用次数的嵌入模型
    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbedModel for CountingEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    struct ShortEmbedder;

    #[async_trait]
    impl EmbedModel for ShortEmbedder {
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(vec![])
        }
    }

    fn ingestor(embedder: Arc<dyn EmbedModel>, store: Arc<MemoryContentStore>) -> DocumentIngestor {
        DocumentIngestor::new(
            TextChunker::new(ChunkerConfig {
                chunk_size: 30,
                chunk_overlap: 0,
            }),
            embedder,
            store,
            IngestConfig {
                embed_batch_size: 2,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_ingest_chunks_embeds_in_batches_and_stores() {
        let embedder = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
        });
        let store = Arc::new(MemoryContentStore::new(2));
        let ing = ingestor(embedder.clone(), store.clone());

        let text = "aaaaaaaaaaaaaaaaaaaa\n\nbbbbbbbbbbbbbbbbbbbb\n\ncccccccccccccccccccc";
        let report = ing.ingest("policy", text, None).await.unwrap();
        assert_eq!(report.chunks_count, 3);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.len().await, 3);

        let stored = store.get_document_chunks("policy").await.unwrap();
        let ids: Vec<&str> = stored.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["policy_chunk_0", "policy_chunk_1", "policy_chunk_2"]);
        assert_eq!(stored[2].text, "cccccccccccccccccccc");

        assert_eq!(ing.delete_document("policy").await.unwrap(), 3);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_empty_text_ingests_nothing() {
        let store = Arc::new(MemoryContentStore::new(2));
        let ing = ingestor(
            Arc::new(CountingEmbedder {
                calls: AtomicUsize::new(0),
            }),
            store.clone(),
        );
        let report = ing.ingest("empty", "   ", None).await.unwrap();
        assert_eq!(report.chunks_count, 0);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_blank_document_id_is_rejected() {
        let store = Arc::new(MemoryContentStore::new(2));
        let ing = ingestor(Arc::new(ShortEmbedder), store);
        let err = ing.ingest(" ", "text", None).await.unwrap_err();
        assert!(matches!(err, PiqError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_embedding_count_mismatch_is_an_error() {
        let store = Arc::new(MemoryContentStore::new(2));
        let ing = ingestor(Arc::new(ShortEmbedder), store.clone());
        let err = ing.ingest("doc", "some text", None).await.unwrap_err();
        assert!(matches!(err, PiqError::EmbeddingService { .. }));
        assert!(store.is_empty().await);
    }
}
