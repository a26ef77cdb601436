use chrono::Utc;
use piq_audit::AuditSink;
use piq_core::{Answer, AuditQuery, AuditRecord, QuestionContext, RetrievedSource};
use piq_error::{ErrorMetadataBuilder, PiqError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::reasoning::{QuestionOutcome, ReasoningLoop};

pub const MAX_QUESTION_CHARS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnsweredQuestion {
    /// 审计写入失败时为 None
    pub audit_id: Option<Uuid>,
    pub answer: Answer,
}

/// 对外的问答入口：校验问题、运行推理循环、写审计记录
pub struct QaService {
    reasoning: ReasoningLoop,
    audit: Option<Arc<dyn AuditSink>>,
}

impl QaService {
    pub fn new(reasoning: ReasoningLoop, audit: Option<Arc<dyn AuditSink>>) -> Self {
        Self { reasoning, audit }
    }

    pub fn reasoning(&self) -> &ReasoningLoop {
        &self.reasoning
    }

    #[instrument(skip(self, question, context))]
    pub async fn answer_question(
        &self,
        question: &str,
        context: Option<QuestionContext>,
    ) -> Result<AnsweredQuestion> {
        validate_question(question)?;
        let context = context.unwrap_or_default();

        let outcome = self.reasoning.process_question(question).await;
        let record = audit_record(question, &context, &outcome);
        let audit_id = self.write_audit(&record).await;

        Ok(AnsweredQuestion {
            audit_id,
            answer: outcome.answer,
        })
    }

    pub async fn query_audit(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>> {
        self.audit_sink()?.query(query).await
    }

    pub async fn get_audit(&self, id: Uuid) -> Result<Option<AuditRecord>> {
        self.audit_sink()?.get(id).await
    }

    fn audit_sink(&self) -> Result<&Arc<dyn AuditSink>> {
        self.audit
            .as_ref()
            .ok_or_else(|| PiqError::configuration("audit_log", "no audit sink configured"))
    }

    async fn write_audit(&self, record: &AuditRecord) -> Option<Uuid> {
        let sink = self.audit.as_ref()?;
        match sink.append(record).await {
            Ok(()) => {
                info!(audit_id = %record.id, "审计记录已保存");
                Some(record.id)
            }
            Err(e) => {
                let meta = ErrorMetadataBuilder::new("qa_service")
                    .operation("audit_append")
                    .request_id(&record.id.to_string())
                    .build(&e);
                e.log(&meta);
                None
            }
        }
    }
}

/// 问题不能为空白，且不超过 1000 个字符
pub fn validate_question(question: &str) -> Result<()> {
    if question.trim().is_empty() {
        return Err(PiqError::validation("question must not be empty"));
    }
    let len = question.chars().count();
    if len > MAX_QUESTION_CHARS {
        return Err(PiqError::validation(format!(
            "question must be at most {} characters, got {}",
            MAX_QUESTION_CHARS, len
        )));
    }
    Ok(())
}

fn audit_record(
    question: &str,
    context: &QuestionContext,
    outcome: &QuestionOutcome,
) -> AuditRecord {
    let answer = &outcome.answer;
    let trace = &outcome.trace;
    AuditRecord {
        id: Uuid::new_v4(),
        timestamp: Utc::now(),
        question: question.to_string(),
        answer: answer.answer.clone(),
        explanation: answer.explanation.clone(),
        citations: answer.citations.clone(),
        confidence_score: answer.confidence_score,
        user_id: context.user_id.clone(),
        llm_prompt: trace.prompt.clone(),
        llm_response: trace.reasoning.llm_response.as_ref().map(|c| c.text.clone()),
        retrieved_sources: trace
            .search_results
            .iter()
            .map(RetrievedSource::from)
            .collect(),
        reasoning_steps: answer.reasoning_steps.clone(),
        manual_review_recommended: answer.manual_review_recommended,
    }
}
