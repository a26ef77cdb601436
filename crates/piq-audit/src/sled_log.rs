use async_trait::async_trait;
use chrono::{DateTime, Utc};
use piq_core::{AuditQuery, AuditRecord};
use piq_error::{PiqError, Result};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use std::ops::Bound;
use std::path::Path;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::AuditSink;

const RECORDS_TREE: &str = "audit_records";
const TIME_INDEX_TREE: &str = "audit_by_time";

/// 基于 sled 的持久化审计日志。
///
/// `audit_records`: id -> JSON 记录；`audit_by_time`: 时间戳 + id -> id，
/// 两棵树在同一事务内写入。
#[derive(Clone)]
pub struct SledAuditLog {
    db: sled::Db,
    records: sled::Tree,
    by_time: sled::Tree,
}

impl SledAuditLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    pub fn from_db(db: sled::Db) -> Result<Self> {
        let records = db.open_tree(RECORDS_TREE)?;
        let by_time = db.open_tree(TIME_INDEX_TREE)?;
        Ok(Self {
            db,
            records,
            by_time,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn load(&self, id: &[u8]) -> Result<Option<AuditRecord>> {
        match self.records.get(id)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// 有符号微秒时间戳映射为保序的大端字节
fn time_prefix(ts: DateTime<Utc>) -> [u8; 8] {
    ((ts.timestamp_micros() as u64) ^ (1 << 63)).to_be_bytes()
}

fn time_key(ts: DateTime<Utc>, id: Uuid) -> Vec<u8> {
    let mut key = time_prefix(ts).to_vec();
    key.extend_from_slice(id.as_bytes());
    key
}

fn transaction_error(err: TransactionError<PiqError>) -> PiqError {
    match err {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => e.into(),
    }
}

#[async_trait]
impl AuditSink for SledAuditLog {
    #[instrument(skip(self, record), fields(id = %record.id))]
    async fn append(&self, record: &AuditRecord) -> Result<()> {
        let id_key = record.id.as_bytes().to_vec();
        let index_key = time_key(record.timestamp, record.id);
        let value = serde_json::to_vec(record)?;

        let records = self.records.clone();
        let by_time = self.by_time.clone();
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            (&records, &by_time)
                .transaction(|(records, by_time)| {
                    records.insert(id_key.clone(), value.clone())?;
                    by_time.insert(index_key.clone(), id_key.clone())?;
                    Ok::<(), ConflictableTransactionError<PiqError>>(())
                })
                .map_err(transaction_error)?;
            db.flush()?;
            Ok(())
        })
        .await??;

        debug!("审计记录已写入");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>> {
        query.validate()?;

        let lower = match query.start {
            Some(start) => Bound::Included(time_prefix(start).to_vec()),
            None => Bound::Unbounded,
        };
        let upper = match query.end {
            // 结束时间当微秒内的所有 id 都应包含
            Some(end) => Bound::Included(time_key(end, Uuid::from_bytes([0xff; 16]))),
            None => Bound::Unbounded,
        };

        let mut out = Vec::new();
        for entry in self.by_time.range::<Vec<u8>, _>((lower, upper)).rev() {
            let (_, id) = entry?;
            let Some(record) = self.load(&id)? else {
                continue;
            };
            if query.matches(&record) {
                out.push(record);
                if out.len() >= query.limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    async fn get(&self, id: Uuid) -> Result<Option<AuditRecord>> {
        self.load(id.as_bytes())
    }
}
