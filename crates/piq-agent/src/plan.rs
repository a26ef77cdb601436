use async_trait::async_trait;
use piq_core::Plan;
use piq_error::Result;

/// 问题分解策略。实现可以把复杂问题拆成 2-3 个子问题。
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, question: &str) -> Result<Plan>;
}

/// 不做分解，子问题即原问题
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleQuestionPlanner;

#[async_trait]
impl Planner for SingleQuestionPlanner {
    async fn plan(&self, question: &str) -> Result<Plan> {
        Ok(Plan::single(
            question,
            "Single question, no decomposition needed",
        ))
    }
}

/// 规划失败时使用的计划
pub fn fallback_plan(question: &str) -> Plan {
    Plan::single(question, "Default plan")
}
