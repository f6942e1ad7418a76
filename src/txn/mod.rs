//! Client-side transaction bookkeeping.
//!
//! A transaction is a backend version state plus a handle the caller
//! holds. The table below tracks every handle ever issued so that using
//! a committed or rolled-back handle fails loudly instead of silently
//! reading the wrong visibility.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;
use uuid::Uuid;

use crate::core::{GeoError, Result};
use crate::plan::Transaction;
use crate::session::{DEFAULT_STATE, StateId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
}

/// One open (or finished) transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionContext {
    pub handle: Uuid,
    /// State the pending state was branched from.
    pub base_state: StateId,
    /// Overlay state all operations under this handle run against.
    pub pending_state: StateId,
    pub status: TransactionStatus,
}

impl TransactionContext {
    pub fn transaction(&self) -> Transaction {
        Transaction::Versioned {
            handle: self.handle,
            state: self.pending_state,
        }
    }
}

/// Handle-to-context map shared by the facade.
#[derive(Default)]
pub struct TransactionTable {
    inner: RwLock<HashMap<Uuid, TransactionContext>>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly created pending state and issue its handle.
    pub fn begin(&self, pending_state: StateId) -> Result<TransactionContext> {
        let context = TransactionContext {
            handle: Uuid::new_v4(),
            base_state: DEFAULT_STATE,
            pending_state,
            status: TransactionStatus::Active,
        };
        self.inner.write()?.insert(context.handle, context);
        debug!(handle = %context.handle, state = pending_state, "transaction started");
        Ok(context)
    }

    /// Look up a handle that must still be active.
    pub fn active(&self, handle: Uuid) -> Result<TransactionContext> {
        let inner = self.inner.read()?;
        let context = inner
            .get(&handle)
            .ok_or_else(|| GeoError::IllegalState(format!("unknown transaction {}", handle)))?;
        match context.status {
            TransactionStatus::Active => Ok(*context),
            TransactionStatus::Committed => Err(GeoError::IllegalState(format!(
                "transaction {} is already committed",
                handle
            ))),
            TransactionStatus::RolledBack => Err(GeoError::IllegalState(format!(
                "transaction {} is already rolled back",
                handle
            ))),
        }
    }

    /// Move an active handle to a terminal status.
    pub fn finish(&self, handle: Uuid, status: TransactionStatus) -> Result<TransactionContext> {
        let mut inner = self.inner.write()?;
        let context = inner
            .get_mut(&handle)
            .ok_or_else(|| GeoError::IllegalState(format!("unknown transaction {}", handle)))?;
        if context.status != TransactionStatus::Active {
            return Err(GeoError::IllegalState(format!(
                "transaction {} is no longer active",
                handle
            )));
        }
        context.status = status;
        debug!(handle = %handle, ?status, "transaction finished");
        Ok(*context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_and_resolve_active() {
        let table = TransactionTable::new();
        let context = table.begin(7).unwrap();
        let resolved = table.active(context.handle).unwrap();
        assert_eq!(resolved.pending_state, 7);
        assert_eq!(resolved.base_state, DEFAULT_STATE);
    }

    #[test]
    fn test_finished_handle_is_rejected() {
        let table = TransactionTable::new();
        let context = table.begin(3).unwrap();
        table
            .finish(context.handle, TransactionStatus::Committed)
            .unwrap();

        assert!(table.active(context.handle).is_err());
        assert!(table
            .finish(context.handle, TransactionStatus::RolledBack)
            .is_err());
    }

    #[test]
    fn test_unknown_handle_is_rejected() {
        let table = TransactionTable::new();
        assert!(table.active(Uuid::new_v4()).is_err());
    }
}
