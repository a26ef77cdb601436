//! 合规问答推理：置信度评分、问题规划、答案校验、推理循环与问答服务。

pub mod confidence;
pub mod plan;
pub mod prompt;
pub mod reasoning;
pub mod service;
pub mod verify;

pub use confidence::{ConfidenceScorer, ScorerConfig};
pub use plan::{Planner, SingleQuestionPlanner};
pub use prompt::{build_answer_prompt, DEFAULT_SYSTEM_PROMPT};
pub use reasoning::{
    merge_results, AgentConfig, QuestionOutcome, ReasoningLoop, ReasoningLoopBuilder,
    ReasoningTrace, LLM_NOT_CONFIGURED_ANSWER,
};
pub use service::{validate_question, AnsweredQuestion, QaService, MAX_QUESTION_CHARS};
pub use verify::{PassThroughVerifier, Verifier};

pub use piq_error::{PiqError, Result};
