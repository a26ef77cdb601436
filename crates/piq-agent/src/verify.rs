use async_trait::async_trait;
use piq_core::{ConfidenceLabel, ReasoningResult, SearchResult, Verification};
use piq_error::{PiqError, Result};

/// 最多引用的支撑证据数
pub const MAX_SUPPORTING_EVIDENCE: usize = 3;

/// 答案自检：判断生成的答案是否有检索证据支撑
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(
        &self,
        question: &str,
        reasoning: &ReasoningResult,
        search_results: &[SearchResult],
    ) -> Result<Verification>;
}

/// 直接放行：视为有支撑，证据取前 3 个检索结果，置信度 medium
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughVerifier;

#[async_trait]
impl Verifier for PassThroughVerifier {
    async fn verify(
        &self,
        _question: &str,
        _reasoning: &ReasoningResult,
        search_results: &[SearchResult],
    ) -> Result<Verification> {
        Ok(Verification {
            is_supported: true,
            supporting_evidence: search_results
                .iter()
                .take(MAX_SUPPORTING_EVIDENCE)
                .map(|r| r.chunk_id.clone())
                .collect(),
            gaps: vec![],
            confidence: ConfidenceLabel::Medium,
        })
    }
}

/// 校验失败时的保守结果
pub fn failed_verification(err: &PiqError) -> Verification {
    Verification {
        is_supported: false,
        supporting_evidence: vec![],
        gaps: vec![format!("verification unavailable: {}", err)],
        confidence: ConfidenceLabel::Low,
    }
}

/// 自定义校验器可能返回超过上限的证据，这里截断
pub(crate) fn bounded(mut v: Verification) -> Verification {
    v.supporting_evidence.truncate(MAX_SUPPORTING_EVIDENCE);
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str) -> SearchResult {
        SearchResult {
            chunk_id: id.to_string(),
            document_id: "d".to_string(),
            text: String::new(),
            document_name: None,
            section: None,
            page_number: None,
            vector_score: 0.0,
            keyword_score: 0.0,
            combined_score: 0.0,
        }
    }

    #[tokio::test]
    async fn test_pass_through_takes_top_three() {
        let reasoning = ReasoningResult {
            answer: "a".to_string(),
            llm_response: None,
            context_used: 4,
        };
        let results: Vec<SearchResult> = ["a", "b", "c", "d"].iter().map(|id| result(id)).collect();
        let v = PassThroughVerifier
            .verify("q", &reasoning, &results)
            .await
            .unwrap();
        assert!(v.is_supported);
        assert_eq!(v.supporting_evidence, vec!["a", "b", "c"]);
        assert!(v.gaps.is_empty());
        assert_eq!(v.confidence, ConfidenceLabel::Medium);
    }

    #[test]
    fn test_failed_verification_is_conservative() {
        let v = failed_verification(&PiqError::validation("bad"));
        assert!(!v.is_supported);
        assert_eq!(v.gaps.len(), 1);
        assert_eq!(v.confidence, ConfidenceLabel::Low);
    }
}
