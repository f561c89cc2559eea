use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{ControllerError, ControllerResult};
use crate::id::{OperationId, TransactionId};

/// The master metadata service facade. All calls are asynchronous and are
/// only awaited at the defined lifecycle suspension points; the scheduling
/// hot path never touches this interface.
#[async_trait]
pub trait MasterClient: Send + Sync {
    async fn start_transaction(&self, title: String) -> ControllerResult<TransactionId>;
    async fn commit_transaction(&self, id: TransactionId) -> ControllerResult<()>;
    async fn abort_transaction(&self, id: TransactionId) -> ControllerResult<()>;
    async fn download_snapshot(&self, operation: OperationId)
        -> ControllerResult<Option<Vec<u8>>>;
    async fn upload_snapshot(&self, operation: OperationId, blob: Vec<u8>)
        -> ControllerResult<()>;
    async fn remove_snapshot(&self, operation: OperationId) -> ControllerResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug, Default)]
struct InMemoryMasterState {
    next_transaction_id: u64,
    transactions: HashMap<TransactionId, TransactionState>,
    snapshots: HashMap<OperationId, Vec<u8>>,
}

/// A process-local master used by tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryMaster {
    state: Mutex<InMemoryMasterState>,
}

impl InMemoryMaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transaction_state(&self, id: TransactionId) -> Option<TransactionState> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.transactions.get(&id).copied())
    }

    pub fn has_snapshot(&self, operation: OperationId) -> bool {
        self.state
            .lock()
            .map(|state| state.snapshots.contains_key(&operation))
            .unwrap_or(false)
    }
}

#[async_trait]
impl MasterClient for InMemoryMaster {
    async fn start_transaction(&self, _title: String) -> ControllerResult<TransactionId> {
        let mut state = self.state.lock()?;
        state.next_transaction_id += 1;
        let id = TransactionId::from(state.next_transaction_id);
        state.transactions.insert(id, TransactionState::Active);
        Ok(id)
    }

    async fn commit_transaction(&self, id: TransactionId) -> ControllerResult<()> {
        let mut state = self.state.lock()?;
        match state.transactions.get_mut(&id) {
            Some(transaction) => {
                if *transaction != TransactionState::Active {
                    return Err(ControllerError::InternalError(format!(
                        "transaction {id} is not active"
                    )));
                }
                *transaction = TransactionState::Committed;
                Ok(())
            }
            None => Err(ControllerError::InternalError(format!(
                "no such transaction {id}"
            ))),
        }
    }

    async fn abort_transaction(&self, id: TransactionId) -> ControllerResult<()> {
        let mut state = self.state.lock()?;
        if let Some(transaction) = state.transactions.get_mut(&id) {
            if *transaction == TransactionState::Active {
                *transaction = TransactionState::Aborted;
            }
        }
        Ok(())
    }

    async fn download_snapshot(
        &self,
        operation: OperationId,
    ) -> ControllerResult<Option<Vec<u8>>> {
        let state = self.state.lock()?;
        Ok(state.snapshots.get(&operation).cloned())
    }

    async fn upload_snapshot(
        &self,
        operation: OperationId,
        blob: Vec<u8>,
    ) -> ControllerResult<()> {
        let mut state = self.state.lock()?;
        state.snapshots.insert(operation, blob);
        Ok(())
    }

    async fn remove_snapshot(&self, operation: OperationId) -> ControllerResult<()> {
        let mut state = self.state.lock()?;
        state.snapshots.remove(&operation);
        Ok(())
    }
}
