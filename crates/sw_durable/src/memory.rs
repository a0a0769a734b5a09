//! 内存存储后端
//!
//! 进程内实现，适用于测试与不需要跨重启持久化的部署。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use sw_core::{ExecutionId, ExecutionInstance, Result, SleepTicket, StepRecord, StepWeaveError};

use crate::store::{resolve_step_write, ExecutionStore, StepLedger, StepWrite, TicketStore};

/// 内存存储
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// 每个执行的步骤，保持写入顺序
    steps: RwLock<HashMap<ExecutionId, Vec<StepRecord>>>,
    tickets: RwLock<HashMap<ExecutionId, SleepTicket>>,
    executions: RwLock<HashMap<ExecutionId, ExecutionInstance>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StepLedger for MemoryStore {
    async fn get_step(&self, execution_id: ExecutionId, step_name: &str) -> Result<Option<StepRecord>> {
        let steps = self.steps.read().await;
        Ok(steps
            .get(&execution_id)
            .and_then(|records| records.iter().find(|r| r.step_name == step_name))
            .cloned())
    }

    async fn write_step(&self, record: StepRecord) -> Result<StepRecord> {
        let mut steps = self.steps.write().await;
        let records = steps.entry(record.execution_id).or_default();
        let position = records.iter().position(|r| r.step_name == record.step_name);

        match resolve_step_write(position.map(|i| &records[i]), &record)? {
            StepWrite::Unchanged => Ok(position.map(|i| records[i].clone()).unwrap_or(record)),
            StepWrite::Write => {
                match position {
                    Some(i) => records[i] = record.clone(),
                    None => records.push(record.clone()),
                }
                Ok(record)
            }
        }
    }

    async fn list_steps(&self, execution_id: ExecutionId) -> Result<Vec<StepRecord>> {
        let steps = self.steps.read().await;
        Ok(steps.get(&execution_id).cloned().unwrap_or_default())
    }

    async fn delete_steps(&self, execution_id: ExecutionId) -> Result<()> {
        self.steps.write().await.remove(&execution_id);
        Ok(())
    }
}

#[async_trait]
impl TicketStore for MemoryStore {
    async fn put_ticket(&self, ticket: &SleepTicket) -> Result<()> {
        self.tickets
            .write()
            .await
            .insert(ticket.execution_id, ticket.clone());
        Ok(())
    }

    async fn get_ticket(&self, execution_id: ExecutionId) -> Result<Option<SleepTicket>> {
        Ok(self.tickets.read().await.get(&execution_id).cloned())
    }

    async fn due_tickets(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SleepTicket>> {
        let tickets = self.tickets.read().await;
        let mut due: Vec<SleepTicket> = tickets.values().filter(|t| t.is_due(now)).cloned().collect();
        due.sort_by_key(|t| t.wake_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn consume_ticket(&self, execution_id: ExecutionId, resume_token: Uuid) -> Result<bool> {
        let mut tickets = self.tickets.write().await;
        match tickets.get(&execution_id) {
            Some(ticket) if ticket.resume_token == resume_token => {
                tickets.remove(&execution_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_ticket(&self, execution_id: ExecutionId) -> Result<bool> {
        Ok(self.tickets.write().await.remove(&execution_id).is_some())
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn insert_execution(&self, instance: &ExecutionInstance) -> Result<()> {
        self.executions
            .write()
            .await
            .insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<ExecutionInstance>> {
        Ok(self.executions.read().await.get(&id).cloned())
    }

    async fn update_execution(&self, instance: &ExecutionInstance) -> Result<()> {
        let mut executions = self.executions.write().await;
        match executions.get_mut(&instance.id) {
            Some(slot) => {
                *slot = instance.clone();
                Ok(())
            }
            None => Err(StepWeaveError::NotFound(format!("execution {}", instance.id))),
        }
    }

    async fn list_executions(&self) -> Result<Vec<ExecutionInstance>> {
        let mut all: Vec<ExecutionInstance> = self.executions.read().await.values().cloned().collect();
        all.sort_by_key(|e| e.created_at);
        Ok(all)
    }

    async fn list_unfinished(&self) -> Result<Vec<ExecutionInstance>> {
        let mut unfinished: Vec<ExecutionInstance> = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| !e.is_terminal())
            .cloned()
            .collect();
        unfinished.sort_by_key(|e| e.created_at);
        Ok(unfinished)
    }

    async fn list_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ExecutionId>> {
        Ok(self
            .executions
            .read()
            .await
            .values()
            .filter(|e| e.is_terminal() && e.updated_at < cutoff)
            .map(|e| e.id)
            .collect())
    }

    async fn delete_execution(&self, id: ExecutionId) -> Result<()> {
        self.executions.write().await.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sw_core::{EventEnvelope, ExecutionStatus, StepStatus};
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_record_step_is_idempotent() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        let now = Utc::now();

        assert_ok!(store.record_step(id, "step-1", json!({ "data": "a" }), now).await);
        assert_ok!(store.record_step(id, "step-1", json!({ "data": "a" }), now).await);

        let steps = store.list_steps(id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_conflicting_result_is_rejected() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        let now = Utc::now();

        store.record_step(id, "step-1", json!(1), now).await.unwrap();
        let err = store.record_step(id, "step-1", json!(2), now).await.unwrap_err();

        assert!(matches!(err, StepWeaveError::StepConflict { .. }));
        let step = store.get_step(id, "step-1").await.unwrap().unwrap();
        assert_eq!(step.result, json!(1));
    }

    #[tokio::test]
    async fn test_missing_step_is_not_an_error() {
        let store = MemoryStore::new();
        assert_eq!(store.get_step(Uuid::new_v4(), "nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_steps_are_isolated_per_execution() {
        let store = MemoryStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();

        store.record_step(a, "step-1", json!("a"), now).await.unwrap();
        store.record_step(b, "step-1", json!("b"), now).await.unwrap();

        assert_eq!(store.get_step(a, "step-1").await.unwrap().unwrap().result, json!("a"));
        assert_eq!(store.get_step(b, "step-1").await.unwrap().unwrap().result, json!("b"));
    }

    #[tokio::test]
    async fn test_ticket_consumption_requires_matching_token() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        let now = Utc::now();

        let first = SleepTicket::new(id, now);
        store.put_ticket(&first).await.unwrap();
        let second = SleepTicket::new(id, now + chrono::Duration::seconds(5));
        store.put_ticket(&second).await.unwrap();

        assert!(!store.consume_ticket(id, first.resume_token).await.unwrap());
        assert_eq!(store.get_ticket(id).await.unwrap(), Some(second.clone()));
        assert!(store.consume_ticket(id, second.resume_token).await.unwrap());
        assert_eq!(store.get_ticket(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_due_tickets_are_ordered_and_limited() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for offset in [3, 1, 2, 10] {
            let ticket = SleepTicket::new(Uuid::new_v4(), now - chrono::Duration::seconds(offset));
            store.put_ticket(&ticket).await.unwrap();
        }
        store
            .put_ticket(&SleepTicket::new(Uuid::new_v4(), now + chrono::Duration::seconds(60)))
            .await
            .unwrap();

        let due = store.due_tickets(now, 3).await.unwrap();
        assert_eq!(due.len(), 3);
        assert!(due.windows(2).all(|w| w[0].wake_at <= w[1].wake_at));
    }

    #[tokio::test]
    async fn test_update_unknown_execution_fails() {
        let store = MemoryStore::new();
        let instance = ExecutionInstance::new(
            "hello-world-function",
            EventEnvelope::new("test/hello-world", json!({})),
            Utc::now(),
        );

        assert!(matches!(
            store.update_execution(&instance).await,
            Err(StepWeaveError::NotFound(_))
        ));

        store.insert_execution(&instance).await.unwrap();
        let mut updated = instance.clone();
        updated.transition(ExecutionStatus::Sleeping, Utc::now());
        store.update_execution(&updated).await.unwrap();

        let unfinished = store.list_unfinished().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].status, ExecutionStatus::Sleeping);
    }
}
