//! 问答审计日志：每次交互写入一条不可变记录，可按时间、置信度、文档查询。

pub mod sled_log;

use async_trait::async_trait;
use piq_core::{AuditQuery, AuditRecord};
use piq_error::Result;
use tokio::sync::RwLock;
use uuid::Uuid;

pub use piq_error::PiqError;
pub use sled_log::SledAuditLog;

/// 审计日志写入与查询接口。并发写入时每条记录必须原子落盘。
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: &AuditRecord) -> Result<()>;

    /// 按时间倒序返回满足条件的记录，最多 `query.limit` 条
    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>>;

    async fn get(&self, id: Uuid) -> Result<Option<AuditRecord>>;
}

/// 内存审计日志，进程退出即丢失
#[derive(Default)]
pub struct MemoryAuditLog {
    records: RwLock<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn append(&self, record: &AuditRecord) -> Result<()> {
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>> {
        query.validate()?;
        let records = self.records.read().await;
        let mut matched: Vec<AuditRecord> = records
            .iter()
            .rev()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matched.truncate(query.limit);
        Ok(matched)
    }

    async fn get(&self, id: Uuid) -> Result<Option<AuditRecord>> {
        let records = self.records.read().await;
        Ok(records.iter().find(|r| r.id == id).cloned())
    }
}
