use async_trait::async_trait;
use piq_core::{HealthStatus, SearchResult, StoreHit};
use piq_error::{PiqError, Result};
use piq_llm::EmbedModel;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::store::ContentStore;

/// 混合检索配置
#[derive(Debug, Clone)]
pub struct HybridConfig {
    /// 向量检索权重
    pub vector_weight: f32,
    /// 关键词检索权重
    pub keyword_weight: f32,
    /// 默认返回结果数
    pub max_results: usize,
    /// 向量检索的最低相似度
    pub similarity_threshold: f32,
    /// 各路检索返回的结果数倍数（用于后续融合）
    pub retrieval_multiplier: usize,
    /// 单次外部调用超时
    pub request_timeout: Duration,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            vector_weight: 0.7,
            keyword_weight: 0.3,
            max_results: 10,
            similarity_threshold: 0.7,
            retrieval_multiplier: 2,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// 推理循环使用的检索接口
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str, top_k: Option<usize>) -> Result<Vec<SearchResult>>;
}

/// 向量 + 关键词混合检索。任何协作服务缺失或失败时降级为空结果，不向调用方报错。
pub struct HybridSearch {
    embedder: Option<Arc<dyn EmbedModel>>,
    store: Option<Arc<dyn ContentStore>>,
    config: HybridConfig,
}

impl HybridSearch {
    pub fn new(
        embedder: Option<Arc<dyn EmbedModel>>,
        store: Option<Arc<dyn ContentStore>>,
        config: HybridConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            config,
        }
    }

    pub fn config(&self) -> &HybridConfig {
        &self.config
    }

    #[instrument(skip(self))]
    pub async fn search(&self, query: &str, top_k: Option<usize>) -> Vec<SearchResult> {
        let top_k = top_k.unwrap_or(self.config.max_results);

        let (Some(embedder), Some(store)) = (&self.embedder, &self.store) else {
            warn!("embedding backend or content store not configured, returning no results");
            return Vec::new();
        };

        let embedding = match self.bounded("embed", embedder.embed_one(query)).await {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "query embedding failed, returning no results");
                return Vec::new();
            }
        };

        let fetch_k = top_k.saturating_mul(self.config.retrieval_multiplier);

        let vector_hits = self
            .bounded(
                "vector_search",
                store.vector_search(&embedding, fetch_k, self.config.similarity_threshold),
            )
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "vector search failed, continuing without it");
                Vec::new()
            });

        let keyword_hits = self
            .bounded("keyword_search", store.keyword_search(query, fetch_k))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "keyword search failed, continuing without it");
                Vec::new()
            });

        let results = fuse_results(
            vector_hits,
            keyword_hits,
            self.config.vector_weight,
            self.config.keyword_weight,
            top_k,
        );

        debug!(results = results.len(), "混合检索完成");
        results
    }

    pub async fn health_check(&self) -> Result<HealthStatus> {
        match (&self.embedder, &self.store) {
            (Some(_), Some(store)) => store.health_check().await,
            (None, _) => Ok(HealthStatus::Unhealthy {
                error: "embedding backend not configured".to_string(),
            }),
            (_, None) => Ok(HealthStatus::Unhealthy {
                error: "content store not configured".to_string(),
            }),
        }
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.config.request_timeout, fut)
            .await
            .map_err(|_| PiqError::timeout(operation, self.config.request_timeout))?
    }
}

#[async_trait]
impl Retriever for HybridSearch {
    async fn retrieve(&self, query: &str, top_k: Option<usize>) -> Result<Vec<SearchResult>> {
        Ok(self.search(query, top_k).await)
    }
}

/// 按 chunk_id 融合两路结果。只出现在一路中的块，缺失维度记 0 分。
/// 排序稳定，同分时保留首次出现的顺序（向量结果在前）。
pub fn fuse_results(
    vector_hits: Vec<StoreHit>,
    keyword_hits: Vec<StoreHit>,
    vector_weight: f32,
    keyword_weight: f32,
    top_k: usize,
) -> Vec<SearchResult> {
    let mut fused: Vec<SearchResult> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    let mut record = |hit: StoreHit, is_vector: bool| {
        let score = hit.score;
        let known = positions.get(&hit.chunk_id).copied();
        let pos = match known {
            Some(pos) => {
                let existing = &mut fused[pos];
                if existing.document_name.is_none() {
                    existing.document_name = hit.document_name;
                }
                if existing.section.is_none() {
                    existing.section = hit.section;
                }
                if existing.page_number.is_none() {
                    existing.page_number = hit.page_number;
                }
                pos
            }
            None => {
                positions.insert(hit.chunk_id.clone(), fused.len());
                fused.push(SearchResult::from_hit(hit));
                fused.len() - 1
            }
        };
        if is_vector {
            fused[pos].vector_score = score;
        } else {
            fused[pos].keyword_score = score;
        }
    };

    for hit in vector_hits {
        record(hit, true);
    }
    for hit in keyword_hits {
        record(hit, false);
    }

    for r in fused.iter_mut() {
        r.combined_score = vector_weight * r.vector_score + keyword_weight * r.keyword_score;
    }

    fused.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    fused.truncate(top_k);
    fused
}
