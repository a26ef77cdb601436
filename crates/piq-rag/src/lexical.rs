use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// 关键词检索配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LexicalConfig {
    /// 停用词列表
    pub stop_words: HashSet<String>,
    /// 最小词长（字符数）
    pub min_word_length: usize,
    /// 最大查询词数
    pub max_query_terms: usize,
    /// TF-IDF 权重
    pub tfidf_weight: f32,
    /// 查询词覆盖率权重
    pub coverage_weight: f32,
}

impl Default for LexicalConfig {
    fn default() -> Self {
        let stop_words = [
            "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with",
            "by", "this", "that", "is", "are", "was", "were", "be", "been", "have", "has", "had",
            "do", "does", "did", "will", "would", "could", "should", "what", "which", "how",
        ]
        .iter()
        .map(|w| w.to_string())
        .collect();

        Self {
            stop_words,
            min_word_length: 2,
            max_query_terms: 20,
            tfidf_weight: 0.7,
            coverage_weight: 0.3,
        }
    }
}

/// 倒排索引，以 chunk_id 为文档单位
#[derive(Debug, Default)]
pub struct LexicalIndex {
    config: LexicalConfig,
    /// chunk -> 词频
    term_freq: HashMap<String, HashMap<String, u32>>,
    /// 词 -> 包含该词的 chunk
    inverted: HashMap<String, BTreeSet<String>>,
}

impl LexicalIndex {
    pub fn new(config: LexicalConfig) -> Self {
        Self {
            config,
            term_freq: HashMap::new(),
            inverted: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.term_freq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.term_freq.is_empty()
    }

    /// 写入或替换一个 chunk 的索引项
    pub fn insert(&mut self, chunk_id: &str, text: &str) {
        self.remove(chunk_id);

        let mut freq: HashMap<String, u32> = HashMap::new();
        for token in self.tokenize(text) {
            *freq.entry(token).or_insert(0) += 1;
        }
        for term in freq.keys() {
            self.inverted
                .entry(term.clone())
                .or_default()
                .insert(chunk_id.to_string());
        }
        self.term_freq.insert(chunk_id.to_string(), freq);
    }

    pub fn remove(&mut self, chunk_id: &str) {
        let Some(freq) = self.term_freq.remove(chunk_id) else {
            return;
        };
        for term in freq.keys() {
            if let Some(ids) = self.inverted.get_mut(term) {
                ids.remove(chunk_id);
                if ids.is_empty() {
                    self.inverted.remove(term);
                }
            }
        }
    }

    /// 返回 (chunk_id, 相关度)，相关度按本次查询的最高分归一化到 (0, 1]，
    /// 按相关度降序，同分按 chunk_id 升序
    pub fn search(&self, query: &str, top_k: usize) -> Vec<(String, f32)> {
        let mut seen = HashSet::new();
        let query_terms: Vec<String> = self
            .tokenize(query)
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .take(self.config.max_query_terms)
            .collect();
        if query_terms.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let candidates: BTreeSet<&String> = query_terms
            .iter()
            .filter_map(|t| self.inverted.get(t))
            .flatten()
            .collect();

        let mut scored: Vec<(String, f32)> = candidates
            .into_iter()
            .map(|id| (id.clone(), self.score(&query_terms, id)))
            .filter(|(_, s)| *s > 0.0)
            .collect();

        let max = scored.iter().map(|(_, s)| *s).fold(0.0f32, f32::max);
        if max <= 0.0 {
            return Vec::new();
        }
        for (_, s) in scored.iter_mut() {
            *s /= max;
        }

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(top_k);
        scored
    }

    fn score(&self, query_terms: &[String], chunk_id: &str) -> f32 {
        let Some(freq) = self.term_freq.get(chunk_id) else {
            return 0.0;
        };
        let total = self.term_freq.len() as f32;
        let mut score = 0.0;
        let mut matched = 0usize;

        for term in query_terms {
            if let Some(&tf) = freq.get(term) {
                matched += 1;
                let df = self.inverted.get(term).map(|ids| ids.len()).unwrap_or(1) as f32;
                let idf = (total / df).ln();
                score += tf as f32 * idf * self.config.tfidf_weight;
            }
        }

        if matched > 0 {
            score += (matched as f32 / query_terms.len() as f32) * self.config.coverage_weight;
        }
        score
    }

    fn tokenize(&self, text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| {
                w.chars().count() >= self.config.min_word_length
                    && !self.config.stop_words.contains(*w)
            })
            .map(str::to_string)
            .collect()
    }
}
