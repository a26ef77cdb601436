use piq_core::{ConfidenceLabel, SearchResult, Verification};
use serde::{Deserialize, Serialize};

const RETRIEVAL_WEIGHT: f32 = 0.4;
const COMPLETENESS_WEIGHT: f32 = 0.3;
const VERIFICATION_WEIGHT: f32 = 0.3;

/// 参与检索质量评分的结果数
const RETRIEVAL_TOP_N: usize = 5;

const COMPLIANCE_INDICATORS: [&str; 5] = ["section", "article", "clause", "regulation", "policy"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerConfig {
    /// 低于该值时建议人工复核
    pub manual_review_threshold: f32,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            manual_review_threshold: 0.7,
        }
    }
}

/// 答案置信度评分，纯函数，相同输入得到相同输出
#[derive(Debug, Clone, Default)]
pub struct ConfidenceScorer {
    config: ScorerConfig,
}

impl ConfidenceScorer {
    pub fn new(config: ScorerConfig) -> Self {
        Self { config }
    }

    pub fn manual_review_threshold(&self) -> f32 {
        self.config.manual_review_threshold
    }

    pub fn needs_manual_review(&self, confidence: f32) -> bool {
        confidence < self.config.manual_review_threshold
    }

    /// 没有答案或没有检索证据时置信度为 0
    pub fn score(
        &self,
        answer: &str,
        search_results: &[SearchResult],
        verification: &Verification,
    ) -> f32 {
        if answer.is_empty() || search_results.is_empty() {
            return 0.0;
        }

        let confidence = retrieval_quality(search_results) * RETRIEVAL_WEIGHT
            + completeness(answer) * COMPLETENESS_WEIGHT
            + verification_support(verification) * VERIFICATION_WEIGHT;
        confidence.clamp(0.0, 1.0)
    }
}

fn retrieval_quality(results: &[SearchResult]) -> f32 {
    let top: Vec<f32> = results
        .iter()
        .take(RETRIEVAL_TOP_N)
        .map(|r| r.combined_score)
        .collect();
    if top.is_empty() {
        return 0.0;
    }
    let mean = top.iter().sum::<f32>() / top.len() as f32;
    mean.clamp(0.0, 1.0)
}

fn completeness(answer: &str) -> f32 {
    let lower = answer.to_lowercase();
    let has_indicator = COMPLIANCE_INDICATORS.iter().any(|w| lower.contains(*w));
    let has_explanation = answer.split_whitespace().count() > 20;

    let length_score = (answer.chars().count() as f32 / 500.0).min(1.0);
    let indicator_score = if has_indicator { 0.5 } else { 0.2 };
    let explanation_score = if has_explanation { 0.3 } else { 0.1 };

    length_score * 0.4 + indicator_score * 0.3 + explanation_score * 0.3
}

fn verification_support(v: &Verification) -> f32 {
    let base = if v.is_supported { 0.7 } else { 0.3 };
    let factor = match v.confidence {
        ConfidenceLabel::High => 1.0,
        ConfidenceLabel::Medium => 0.7,
        ConfidenceLabel::Low => 0.4,
    };
    let gap_penalty = (0.1 * v.gaps.len() as f32).min(0.3);
    (base * factor - gap_penalty).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn result(score: f32) -> SearchResult {
        SearchResult {
            chunk_id: "c".to_string(),
            document_id: "d".to_string(),
            text: "t".to_string(),
            document_name: None,
            section: None,
            page_number: None,
            vector_score: score,
            keyword_score: score,
            combined_score: score,
        }
    }

    fn verification(supported: bool, label: ConfidenceLabel, gaps: usize) -> Verification {
        Verification {
            is_supported: supported,
            supporting_evidence: vec![],
            gaps: (0..gaps).map(|i| format!("gap {i}")).collect(),
            confidence: label,
        }
    }

    #[test]
    fn test_zero_without_answer_or_evidence() {
        let scorer = ConfidenceScorer::default();
        let v = verification(true, ConfidenceLabel::High, 0);
        assert_eq!(scorer.score("", &[result(0.9)], &v), 0.0);
        assert_eq!(scorer.score("An answer.", &[], &v), 0.0);
    }

    #[test]
    fn test_known_score() {
        let scorer = ConfidenceScorer::default();
        // 100 字符，无关键词，20 个词以内
        let answer = "x".repeat(100);
        let v = verification(true, ConfidenceLabel::Medium, 0);
        let score = scorer.score(&answer, &[result(0.8), result(0.6)], &v);

        let retrieval = 0.7;
        let completeness = 0.2 * 0.4 + 0.2 * 0.3 + 0.1 * 0.3;
        let support = 0.7 * 0.7;
        let expected = retrieval * 0.4 + completeness * 0.3 + support * 0.3;
        assert!((score - expected).abs() < 1e-5);
    }

    #[test]
    fn test_indicator_keywords_are_case_insensitive() {
        assert!(completeness("See ARTICLE 17.") > completeness("See item 17."));
    }

    #[test]
    fn test_gap_penalty_is_capped() {
        let many = verification(true, ConfidenceLabel::High, 10);
        assert!((verification_support(&many) - 0.4).abs() < 1e-6);
        let unsupported = verification(false, ConfidenceLabel::Low, 5);
        assert_eq!(verification_support(&unsupported), 0.0);
    }

    #[test]
    fn test_only_top_five_results_count() {
        let mut results: Vec<SearchResult> = (0..5).map(|_| result(1.0)).collect();
        results.push(result(0.0));
        assert!((retrieval_quality(&results) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_manual_review_gate() {
        let scorer = ConfidenceScorer::default();
        assert!(scorer.needs_manual_review(0.69));
        assert!(!scorer.needs_manual_review(0.7));
    }

    fn arb_label() -> impl Strategy<Value = ConfidenceLabel> {
        prop_oneof![
            Just(ConfidenceLabel::High),
            Just(ConfidenceLabel::Medium),
            Just(ConfidenceLabel::Low)
        ]
    }

    proptest! {
        #[test]
        fn confidence_stays_in_unit_interval(
            answer in ".{0,800}",
            scores in proptest::collection::vec(-2.0f32..3.0, 0..12),
            supported in any::<bool>(),
            label in arb_label(),
            gaps in 0usize..6,
        ) {
            let scorer = ConfidenceScorer::default();
            let results: Vec<SearchResult> = scores.into_iter().map(result).collect();
            let v = verification(supported, label, gaps);
            let score = scorer.score(&answer, &results, &v);
            prop_assert!((0.0..=1.0).contains(&score));
            prop_assert_eq!(score, scorer.score(&answer, &results, &v));
            if answer.is_empty() || results.is_empty() {
                prop_assert_eq!(score, 0.0);
            }
        }
    }
}
