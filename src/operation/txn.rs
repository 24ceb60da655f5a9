//! Terminal operation of a transaction on one enlisted partition.

use crate::engine::UndoRecord;
use crate::operation::{
    BackupAware, BackupOperation, MapBackup, OpContext, OpHeader, OpResponse,
    Operation,
};
use crate::utils::GridError;

use serde::{Deserialize, Serialize};

/// Commits (drops the undo log) or rolls back (replays the undo log in
/// reverse) the transaction stamped on the header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnFinishOperation {
    pub commit: bool,
}

impl Operation for TxnFinishOperation {
    /// Replica-side effects of a rollback.
    type Local = Vec<BackupOperation>;

    fn run(
        &mut self,
        ctx: &mut OpContext<'_>,
        restored: &mut Vec<BackupOperation>,
    ) -> Result<OpResponse, GridError> {
        let txn = ctx.header.txn.ok_or_else(|| {
            GridError::Misuse("transaction finish without transaction".into())
        })?;
        let log = ctx.store.take_undo_log(txn);
        let touched = log.len() as u64;
        if self.commit {
            return Ok(OpResponse::Size(touched));
        }

        for UndoRecord { map, key, previous } in log.into_iter().rev() {
            let store = ctx.store.map(&map);
            let op = match previous {
                Some(value) => {
                    store.put(key.clone(), value.clone(), None);
                    MapBackup::Put {
                        key,
                        value,
                        ttl_ms: None,
                    }
                }
                None => {
                    store.remove(&key);
                    MapBackup::Remove { key }
                }
            };
            restored.push(BackupOperation::Map { name: map, op });
        }
        Ok(OpResponse::Size(touched))
    }

    fn as_backup_aware(&self) -> Option<&dyn BackupAware<Vec<BackupOperation>>> {
        Some(self)
    }

    fn is_partition_level(&self) -> bool {
        true
    }
}

impl BackupAware<Vec<BackupOperation>> for TxnFinishOperation {
    fn should_backup(
        &self,
        restored: &Vec<BackupOperation>,
        response: &OpResponse,
    ) -> bool {
        !self.commit && !restored.is_empty() && !response.is_error()
    }

    fn backup_operation(
        &self,
        _header: &OpHeader,
        restored: &Vec<BackupOperation>,
    ) -> BackupOperation {
        BackupOperation::Batch(restored.clone())
    }
}
