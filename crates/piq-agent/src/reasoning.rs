use piq_core::{
    Answer, Citation, Completion, Plan, ReasoningResult, SearchResult, Verification,
};
use piq_error::{ErrorMetadataBuilder, PiqError, Result};
use piq_llm::{CompletionModel, CompletionRequest};
use piq_rag::Retriever;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::confidence::ConfidenceScorer;
use crate::plan::{fallback_plan, Planner, SingleQuestionPlanner};
use crate::prompt::{build_answer_prompt, DEFAULT_SYSTEM_PROMPT};
use crate::verify::{self, failed_verification, PassThroughVerifier, Verifier};

pub const LLM_NOT_CONFIGURED_ANSWER: &str =
    "LLM service not configured. Please check watsonx.ai credentials.";

const COMPONENT: &str = "reasoning_loop";
const DIRECT_ANSWER_FALLBACK_CHARS: usize = 200;
const SHORT_EXPLANATION_CHARS: usize = 200;
const EXPLANATION_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// 合并去重后保留的检索结果数
    pub max_merged_results: usize,
    pub max_citations: usize,
    /// 引用摘录的字符数
    pub excerpt_chars: usize,
    pub completion_max_tokens: u32,
    pub completion_temperature: f32,
    pub completion_timeout: Duration,
    pub system_prompt: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_merged_results: 10,
            max_citations: 5,
            excerpt_chars: 300,
            completion_max_tokens: 1500,
            completion_temperature: 0.1,
            completion_timeout: Duration::from_secs(60),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// 单个问题各阶段的中间产物，供审计使用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningTrace {
    pub plan: Plan,
    pub search_results: Vec<SearchResult>,
    pub prompt: Option<String>,
    pub reasoning: ReasoningResult,
    pub verification: Verification,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionOutcome {
    pub answer: Answer,
    pub trace: ReasoningTrace,
}

/// PLAN → SEARCH → REASON → VERIFY → RESPOND。
///
/// 每个阶段失败都降级为有效的输出，任何问题都会得到结构完整的 [`Answer`]。
pub struct ReasoningLoop {
    planner: Arc<dyn Planner>,
    retriever: Option<Arc<dyn Retriever>>,
    llm: Option<Arc<dyn CompletionModel>>,
    verifier: Arc<dyn Verifier>,
    scorer: ConfidenceScorer,
    config: AgentConfig,
}

#[derive(Default)]
pub struct ReasoningLoopBuilder {
    planner: Option<Arc<dyn Planner>>,
    retriever: Option<Arc<dyn Retriever>>,
    llm: Option<Arc<dyn CompletionModel>>,
    verifier: Option<Arc<dyn Verifier>>,
    scorer: Option<ConfidenceScorer>,
    config: Option<AgentConfig>,
}

impl ReasoningLoopBuilder {
    pub fn planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn completion_model(mut self, llm: Arc<dyn CompletionModel>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn scorer(mut self, scorer: ConfidenceScorer) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// 缺少协作服务时以降级模式运行
    pub fn build(self) -> ReasoningLoop {
        if self.retriever.is_none() {
            warn!("检索服务未配置，所有问题将没有检索结果");
        }
        if self.llm.is_none() {
            warn!("生成服务未配置，答案将为固定的降级提示");
        }
        ReasoningLoop {
            planner: self
                .planner
                .unwrap_or_else(|| Arc::new(SingleQuestionPlanner) as Arc<dyn Planner>),
            retriever: self.retriever,
            llm: self.llm,
            verifier: self
                .verifier
                .unwrap_or_else(|| Arc::new(PassThroughVerifier) as Arc<dyn Verifier>),
            scorer: self.scorer.unwrap_or_default(),
            config: self.config.unwrap_or_default(),
        }
    }

    /// 没有生成服务时在初始化阶段报配置错误
    pub fn try_build(self) -> Result<ReasoningLoop> {
        if self.llm.is_none() {
            return Err(PiqError::configuration(
                "completion_model",
                "no answer-generation backend configured",
            ));
        }
        Ok(self.build())
    }
}

impl ReasoningLoop {
    pub fn builder() -> ReasoningLoopBuilder {
        ReasoningLoopBuilder::default()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn scorer(&self) -> &ConfidenceScorer {
        &self.scorer
    }

    #[instrument(skip(self, question), fields(question_len = question.len()))]
    pub async fn process_question(&self, question: &str) -> QuestionOutcome {
        let plan = self.plan(question).await;
        let search_results = self.search(&plan).await;
        let (reasoning, prompt) = self.reason(question, &search_results).await;
        let verification = self.verify(question, &reasoning, &search_results).await;
        let answer = self.respond(&plan, &reasoning, &verification, &search_results);

        info!(
            chunks = search_results.len(),
            confidence = answer.confidence_score,
            manual_review = answer.manual_review_recommended,
            "问题处理完成"
        );

        QuestionOutcome {
            answer,
            trace: ReasoningTrace {
                plan,
                search_results,
                prompt,
                reasoning,
                verification,
            },
        }
    }

    async fn plan(&self, question: &str) -> Plan {
        match self.planner.plan(question).await {
            Ok(plan) if !plan.sub_questions.is_empty() => plan,
            Ok(_) => fallback_plan(question),
            Err(e) => {
                self.log_stage_error("plan", &e);
                fallback_plan(question)
            }
        }
    }

    async fn search(&self, plan: &Plan) -> Vec<SearchResult> {
        let Some(retriever) = &self.retriever else {
            return Vec::new();
        };

        let mut all = Vec::new();
        for sub_question in &plan.sub_questions {
            match retriever.retrieve(sub_question, None).await {
                Ok(results) => all.extend(results),
                Err(e) => self.log_stage_error("search", &e),
            }
        }

        let merged = merge_results(all, self.config.max_merged_results);
        debug!(
            sub_questions = plan.sub_questions.len(),
            merged = merged.len(),
            "检索阶段完成"
        );
        merged
    }

    async fn reason(
        &self,
        question: &str,
        search_results: &[SearchResult],
    ) -> (ReasoningResult, Option<String>) {
        let Some(llm) = &self.llm else {
            return (
                ReasoningResult {
                    answer: LLM_NOT_CONFIGURED_ANSWER.to_string(),
                    llm_response: None,
                    context_used: 0,
                },
                None,
            );
        };

        let context: Vec<&str> = search_results.iter().map(|r| r.text.as_str()).collect();
        let prompt = build_answer_prompt(question, &context);
        let request = CompletionRequest::new(prompt.clone())
            .with_system(self.config.system_prompt.clone())
            .with_max_tokens(self.config.completion_max_tokens)
            .with_temperature(self.config.completion_temperature);

        let completion: Result<Completion> =
            tokio::time::timeout(self.config.completion_timeout, llm.complete(&request))
                .await
                .unwrap_or_else(|_| {
                    Err(PiqError::timeout("complete", self.config.completion_timeout))
                });

        let result = match completion {
            Ok(c) => ReasoningResult {
                answer: c.text.clone(),
                llm_response: Some(c),
                context_used: context.len(),
            },
            Err(e) => {
                self.log_stage_error("reason", &e);
                ReasoningResult {
                    answer: format!("Error generating answer: {}", e),
                    llm_response: None,
                    context_used: context.len(),
                }
            }
        };
        (result, Some(prompt))
    }

    async fn verify(
        &self,
        question: &str,
        reasoning: &ReasoningResult,
        search_results: &[SearchResult],
    ) -> Verification {
        match self
            .verifier
            .verify(question, reasoning, search_results)
            .await
        {
            Ok(v) => verify::bounded(v),
            Err(e) => {
                self.log_stage_error("verify", &e);
                failed_verification(&e)
            }
        }
    }

    fn respond(
        &self,
        plan: &Plan,
        reasoning: &ReasoningResult,
        verification: &Verification,
        search_results: &[SearchResult],
    ) -> Answer {
        let raw = reasoning.answer.as_str();

        let citations: Vec<Citation> = search_results
            .iter()
            .take(self.config.max_citations)
            .map(|r| Citation {
                document_id: r.document_id.clone(),
                document_name: r.document_name.clone(),
                section: r.section.clone(),
                page_number: r.page_number,
                chunk_id: r.chunk_id.clone(),
                relevance_score: r.combined_score,
                excerpt: format!("{}...", take_chars(&r.text, self.config.excerpt_chars)),
            })
            .collect();

        let confidence_score = self.scorer.score(raw, search_results, verification);

        Answer {
            answer: direct_answer(raw),
            explanation: explanation(raw),
            citations,
            confidence_score,
            manual_review_recommended: self.scorer.needs_manual_review(confidence_score),
            reasoning_steps: self.reasoning_steps(plan, reasoning, search_results.len()),
        }
    }

    fn reasoning_steps(
        &self,
        plan: &Plan,
        reasoning: &ReasoningResult,
        retrieved: usize,
    ) -> Vec<String> {
        let plan_step = if plan.is_complex {
            format!(
                "Question decomposed into {} sub-questions",
                plan.sub_questions.len()
            )
        } else {
            "Question analyzed and decomposed".to_string()
        };
        let reason_step = if self.llm.is_none() {
            "Answer generation skipped: LLM service not configured"
        } else if reasoning.llm_response.is_none() {
            "Answer generation failed, error reported in answer"
        } else {
            "Generated answer using LLM reasoning"
        };

        vec![
            plan_step,
            format!("Retrieved {} relevant document chunks", retrieved),
            reason_step.to_string(),
            "Verified answer against source documents".to_string(),
            "Calculated confidence score".to_string(),
        ]
    }

    fn log_stage_error(&self, stage: &str, err: &PiqError) {
        let meta = ErrorMetadataBuilder::new(COMPONENT)
            .operation(stage)
            .context("stage", stage)
            .build(err);
        err.log(&meta);
    }
}

/// 按 chunk_id 去重（先出现者保留），按综合分数稳定降序，截取前 `limit` 条
pub fn merge_results(results: Vec<SearchResult>, limit: usize) -> Vec<SearchResult> {
    let mut seen = HashSet::new();
    let mut unique: Vec<SearchResult> = results
        .into_iter()
        .filter(|r| seen.insert(r.chunk_id.clone()))
        .collect();
    unique.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    unique.truncate(limit);
    unique
}

fn take_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// 第一行非空且不是标题的内容；没有则取前 200 个字符
fn direct_answer(raw: &str) -> String {
    raw.lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .unwrap_or_else(|| take_chars(raw, DIRECT_ANSWER_FALLBACK_CHARS).to_string())
}

fn explanation(raw: &str) -> String {
    if raw.chars().count() > SHORT_EXPLANATION_CHARS {
        format!("{}...", take_chars(raw, EXPLANATION_CHARS))
    } else {
        raw.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use piq_core::{ConfidenceLabel, Usage};

    fn result(id: &str, score: f32, text: &str) -> SearchResult {
        SearchResult {
            chunk_id: id.to_string(),
            document_id: "policy".to_string(),
            text: text.to_string(),
            document_name: Some("policy.pdf".to_string()),
            section: None,
            page_number: Some(3),
            vector_score: score,
            keyword_score: score,
            combined_score: score,
        }
    }

    struct FixedRetriever(Vec<SearchResult>);

    #[async_trait]
    impl Retriever for FixedRetriever {
        async fn retrieve(&self, _: &str, _: Option<usize>) -> Result<Vec<SearchResult>> {
            Ok(self.0.clone())
        }
    }

    struct EchoModel;

    #[async_trait]
    impl CompletionModel for EchoModel {
        fn provider(&self) -> &str {
            "echo"
        }

        async fn complete(&self, req: &CompletionRequest) -> Result<Completion> {
            assert_eq!(req.max_tokens, 1500);
            assert!(req.system.as_deref().unwrap_or_default().contains("PolicyIQ"));
            Ok(Completion {
                text: "# Summary\n\nYes, Article 17 applies.\nMore detail.".to_string(),
                model: "echo-1".to_string(),
                usage: Usage::default(),
            })
        }
    }

    struct BrokenModel;

    #[async_trait]
    impl CompletionModel for BrokenModel {
        fn provider(&self) -> &str {
            "broken"
        }

        async fn complete(&self, _: &CompletionRequest) -> Result<Completion> {
            Err(PiqError::LlmService {
                provider: "broken".to_string(),
                message: "503".to_string(),
            })
        }
    }

    struct SlowModel;

    #[async_trait]
    impl CompletionModel for SlowModel {
        fn provider(&self) -> &str {
            "slow"
        }

        async fn complete(&self, _: &CompletionRequest) -> Result<Completion> {
            std::future::pending().await
        }
    }

    struct FailingPlanner;

    #[async_trait]
    impl Planner for FailingPlanner {
        async fn plan(&self, _: &str) -> Result<Plan> {
            Err(PiqError::Internal {
                message: "planner crashed".to_string(),
            })
        }
    }

    struct FailingVerifier;

    #[async_trait]
    impl Verifier for FailingVerifier {
        async fn verify(
            &self,
            _: &str,
            _: &ReasoningResult,
            _: &[SearchResult],
        ) -> Result<Verification> {
            Err(PiqError::LlmService {
                provider: "critic".to_string(),
                message: "timeout".to_string(),
            })
        }
    }

    #[test]
    fn test_merge_dedups_sorts_and_caps() {
        let mut results: Vec<SearchResult> = (0..12)
            .map(|i| result(&format!("c{i}"), i as f32 / 20.0, "t"))
            .collect();
        results.push(result("c11", 0.01, "duplicate"));
        let merged = merge_results(results, 10);
        assert_eq!(merged.len(), 10);
        assert_eq!(merged[0].chunk_id, "c11");
        assert_eq!(merged[0].text, "t");
    }

    #[test]
    fn test_direct_answer_skips_headings_and_blank_lines() {
        assert_eq!(direct_answer("\n# Title\n  Yes.  \nNo."), "Yes.");
        assert_eq!(direct_answer("## only heading"), "## only heading");
        let long_heading = format!("#{}", "x".repeat(300));
        assert_eq!(direct_answer(&long_heading).chars().count(), 200);
    }

    #[test]
    fn test_explanation_truncation() {
        assert_eq!(explanation("short"), "short");
        let long = "y".repeat(600);
        let e = explanation(&long);
        assert_eq!(e.chars().count(), 503);
        assert!(e.ends_with("..."));
    }

    #[tokio::test]
    async fn test_degraded_loop_without_collaborators() {
        let rl = ReasoningLoop::builder().build();
        let outcome = rl.process_question("Is MFA required?").await;
        assert_eq!(outcome.answer.answer, LLM_NOT_CONFIGURED_ANSWER);
        assert_eq!(outcome.answer.confidence_score, 0.0);
        assert!(outcome.answer.manual_review_recommended);
        assert!(outcome.answer.citations.is_empty());
        assert_eq!(outcome.trace.reasoning.context_used, 0);
        assert!(outcome.trace.prompt.is_none());
    }

    #[test]
    fn test_try_build_requires_completion_model() {
        let err = ReasoningLoop::builder().try_build().err().unwrap();
        assert!(matches!(err, PiqError::Configuration { .. }));
        assert!(ReasoningLoop::builder()
            .completion_model(Arc::new(EchoModel))
            .try_build()
            .is_ok());
    }

    #[tokio::test]
    async fn test_full_loop_builds_citations() {
        let long_text = "z".repeat(400);
        let rl = ReasoningLoop::builder()
            .retriever(Arc::new(FixedRetriever(vec![
                result("a", 0.9, &long_text),
                result("b", 0.8, "short"),
            ])))
            .completion_model(Arc::new(EchoModel))
            .build();

        let outcome = rl.process_question("Does erasure apply?").await;
        let answer = &outcome.answer;
        assert_eq!(answer.answer, "Yes, Article 17 applies.");
        assert_eq!(answer.citations.len(), 2);
        assert_eq!(answer.citations[0].excerpt.chars().count(), 303);
        assert_eq!(answer.citations[1].excerpt, "short...");
        assert_eq!(answer.citations[0].page_number, Some(3));
        assert!(answer.confidence_score > 0.0 && answer.confidence_score <= 1.0);
        assert_eq!(
            answer.manual_review_recommended,
            answer.confidence_score < 0.7
        );
        assert_eq!(answer.reasoning_steps[1], "Retrieved 2 relevant document chunks");
        assert_eq!(outcome.trace.reasoning.context_used, 2);
        assert_eq!(
            outcome.trace.verification.supporting_evidence,
            vec!["a", "b"]
        );
        assert!(outcome
            .trace
            .prompt
            .as_deref()
            .unwrap_or_default()
            .contains("[Context 2]:\nshort"));
    }

    #[tokio::test]
    async fn test_llm_failure_is_reported_in_answer() {
        let rl = ReasoningLoop::builder()
            .retriever(Arc::new(FixedRetriever(vec![result("a", 0.9, "text")])))
            .completion_model(Arc::new(BrokenModel))
            .build();
        let outcome = rl.process_question("q").await;
        assert!(outcome
            .trace
            .reasoning
            .answer
            .starts_with("Error generating answer:"));
        assert!(outcome.trace.reasoning.llm_response.is_none());
        assert_eq!(outcome.trace.reasoning.context_used, 1);
    }

    #[tokio::test]
    async fn test_completion_timeout_degrades() {
        let config = AgentConfig {
            completion_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let rl = ReasoningLoop::builder()
            .completion_model(Arc::new(SlowModel))
            .config(config)
            .build();
        let outcome = rl.process_question("q").await;
        assert!(outcome
            .answer
            .answer
            .starts_with("Error generating answer:"));
    }

    #[tokio::test]
    async fn test_stage_failures_fall_back() {
        let rl = ReasoningLoop::builder()
            .planner(Arc::new(FailingPlanner))
            .verifier(Arc::new(FailingVerifier))
            .retriever(Arc::new(FixedRetriever(vec![result("a", 0.9, "text")])))
            .completion_model(Arc::new(EchoModel))
            .build();
        let outcome = rl.process_question("What is PCI DSS 3.4?").await;
        assert_eq!(outcome.trace.plan.reasoning, "Default plan");
        assert_eq!(outcome.trace.plan.sub_questions, vec!["What is PCI DSS 3.4?"]);
        assert!(!outcome.trace.verification.is_supported);
        assert_eq!(outcome.trace.verification.confidence, ConfidenceLabel::Low);
        assert_eq!(outcome.trace.verification.gaps.len(), 1);
    }
}
