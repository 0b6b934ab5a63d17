use std::collections::HashSet;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::message::TxId;

#[derive(Debug, Default)]
struct Inner {
    /// Last committed register value.
    state: i64,
    /// Transaction currently holding the prepare lock, if any.
    locked_by: Option<TxId>,
    /// Value reserved by the lock holder, applied on commit.
    proposed_value: i64,
    /// Transactions already applied; makes `commit` idempotent.
    committed: HashSet<TxId>,
}

/// In-memory register plus the single prepare lock that serializes
/// transactions on this node.
///
/// Every transition happens under one mutex and none of the operations
/// await, so this is safe to call from any task.
#[derive(Debug)]
pub struct VolatileStore {
    inner: Mutex<Inner>,
}

impl VolatileStore {
    pub fn new(state: i64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state,
                ..Inner::default()
            }),
        }
    }

    /// Reserves the register for `tx_id`. Re-preparing the holder succeeds so
    /// that a recovered lock and a coordinator retry cannot deadlock.
    pub fn prepare(&self, tx_id: TxId, new_value: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        if inner.committed.contains(&tx_id) {
            return Err(Error::AlreadyCommitted);
        }

        if let Some(holder) = inner.locked_by {
            if holder == tx_id {
                return Ok(());
            }
            return Err(Error::Busy);
        }

        inner.locked_by = Some(tx_id);
        inner.proposed_value = new_value;
        Ok(())
    }

    /// Applies the proposed value and releases the lock. A repeat commit of
    /// an applied transaction is a no-op.
    pub fn commit(&self, tx_id: TxId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        if inner.committed.contains(&tx_id) {
            return Ok(());
        }

        if inner.locked_by != Some(tx_id) {
            return Err(Error::InvalidCommit);
        }

        inner.state = inner.proposed_value;
        inner.locked_by = None;
        inner.committed.insert(tx_id);
        Ok(())
    }

    /// Releases the lock if `tx_id` holds it. Aborting a transaction this
    /// node never prepared is a no-op, which is what presumed abort needs.
    pub fn abort(&self, tx_id: TxId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        if inner.committed.contains(&tx_id) {
            return Err(Error::CannotAbortCommitted);
        }

        if inner.locked_by == Some(tx_id) {
            inner.locked_by = None;
            inner.proposed_value = inner.state;
        }
        Ok(())
    }

    pub fn state(&self) -> i64 {
        self.inner.lock().unwrap().state
    }

    /// Resets the register and committed history, discarding any lock.
    /// Used once at startup before replaying the log's verdict.
    pub fn recover(&self, state: i64, committed: HashSet<TxId>) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = state;
        inner.proposed_value = state;
        inner.locked_by = None;
        inner.committed = committed;
    }

    pub fn committed_history(&self) -> HashSet<TxId> {
        self.inner.lock().unwrap().committed.clone()
    }
}
