//! List (collection) service operations. A list lives entirely inside the
//! partition its name hashes to.

use crate::cluster::Data;
use crate::engine::{EntryEvent, EntryEventKind};
use crate::operation::{
    BackupAware, BackupOperation, ListBackup, OpContext, OpHeader, OpResponse,
    Operation,
};
use crate::utils::{DomainError, GridError};

use serde::{Deserialize, Serialize};

/// Appends an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddOperation {
    pub value: Data,
}

impl Operation for AddOperation {
    type Local = ();

    fn run(
        &mut self,
        ctx: &mut OpContext<'_>,
        _local: &mut (),
    ) -> Result<OpResponse, GridError> {
        let name = ctx.header.name.clone();
        ctx.store.list(&name).push(self.value.clone());
        Ok(OpResponse::Bool(true))
    }

    fn after_run(
        &mut self,
        ctx: &mut OpContext<'_>,
        _local: (),
    ) -> Result<(), GridError> {
        if ctx.has_listener() {
            ctx.publish(EntryEvent {
                kind: EntryEventKind::Added,
                key: None,
                value: Some(self.value.clone()),
                old_value: None,
            });
        }
        Ok(())
    }

    fn as_backup_aware(&self) -> Option<&dyn BackupAware<()>> {
        Some(self)
    }
}

impl BackupAware<()> for AddOperation {
    fn should_backup(&self, _local: &(), response: &OpResponse) -> bool {
        !response.is_error()
    }

    fn backup_operation(&self, header: &OpHeader, _local: &()) -> BackupOperation {
        BackupOperation::List {
            name: header.name.clone(),
            op: ListBackup::Add {
                value: self.value.clone(),
            },
        }
    }
}

/// Removes every item of the list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearOperation;

/// Local execution context of `ClearOperation`.
#[derive(Debug, Default)]
pub struct ClearLocal {
    /// Items before the clear, captured only when someone listens.
    snapshot: Vec<Data>,

    /// Number of items removed.
    removed: usize,
}

impl Operation for ClearOperation {
    type Local = ClearLocal;

    fn before_run(
        &mut self,
        ctx: &mut OpContext<'_>,
    ) -> Result<ClearLocal, GridError> {
        let mut local = ClearLocal::default();
        if ctx.has_listener() {
            if let Some(list) = ctx.store.existing_list(&ctx.header.name) {
                local.snapshot = list.clone();
            }
        }
        Ok(local)
    }

    fn run(
        &mut self,
        ctx: &mut OpContext<'_>,
        local: &mut ClearLocal,
    ) -> Result<OpResponse, GridError> {
        if let Some(list) = ctx.store.existing_list(&ctx.header.name) {
            local.removed = list.len();
            list.clear();
        }
        Ok(OpResponse::Size(local.removed as u64))
    }

    fn after_run(
        &mut self,
        ctx: &mut OpContext<'_>,
        local: ClearLocal,
    ) -> Result<(), GridError> {
        for item in local.snapshot {
            ctx.publish(EntryEvent {
                kind: EntryEventKind::Removed,
                key: None,
                value: None,
                old_value: Some(item),
            });
        }
        Ok(())
    }

    fn as_backup_aware(&self) -> Option<&dyn BackupAware<ClearLocal>> {
        Some(self)
    }

    fn is_partition_level(&self) -> bool {
        true
    }
}

impl BackupAware<ClearLocal> for ClearOperation {
    fn should_backup(&self, local: &ClearLocal, response: &OpResponse) -> bool {
        local.removed > 0 && !response.is_error()
    }

    fn backup_operation(
        &self,
        header: &OpHeader,
        _local: &ClearLocal,
    ) -> BackupOperation {
        BackupOperation::List {
            name: header.name.clone(),
            op: ListBackup::Clear,
        }
    }
}

/// Removes the item at a position. An out-of-range index is answered with an
/// `IndexOutOfRange` value rather than an execution failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveIndexOperation {
    pub index: i64,
}

impl Operation for RemoveIndexOperation {
    type Local = Option<Data>;

    fn run(
        &mut self,
        ctx: &mut OpContext<'_>,
        local: &mut Option<Data>,
    ) -> Result<OpResponse, GridError> {
        let name = ctx.header.name.clone();
        let list = ctx.store.list(&name);
        if self.index < 0 || self.index as usize >= list.len() {
            return Ok(OpResponse::Error(DomainError::IndexOutOfRange {
                index: self.index,
                size: list.len(),
            }));
        }
        let removed = list.remove(self.index as usize);
        *local = Some(removed.clone());
        Ok(OpResponse::Value(Some(removed)))
    }

    fn after_run(
        &mut self,
        ctx: &mut OpContext<'_>,
        local: Option<Data>,
    ) -> Result<(), GridError> {
        if let Some(item) = local {
            if ctx.has_listener() {
                ctx.publish(EntryEvent {
                    kind: EntryEventKind::Removed,
                    key: None,
                    value: None,
                    old_value: Some(item),
                });
            }
        }
        Ok(())
    }

    fn as_backup_aware(&self) -> Option<&dyn BackupAware<Option<Data>>> {
        Some(self)
    }
}

impl BackupAware<Option<Data>> for RemoveIndexOperation {
    fn should_backup(&self, _local: &Option<Data>, response: &OpResponse) -> bool {
        !response.is_error()
    }

    fn backup_operation(
        &self,
        header: &OpHeader,
        _local: &Option<Data>,
    ) -> BackupOperation {
        BackupOperation::List {
            name: header.name.clone(),
            op: ListBackup::RemoveIndex { index: self.index },
        }
    }
}

/// Read-only list queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListReadOperation {
    Size,
    Get { index: i64 },
    Contains { value: Data },
}

impl Operation for ListReadOperation {
    type Local = ();

    fn run(
        &mut self,
        ctx: &mut OpContext<'_>,
        _local: &mut (),
    ) -> Result<OpResponse, GridError> {
        let empty = Vec::new();
        let list = ctx
            .store
            .existing_list(&ctx.header.name)
            .map_or(&empty, |list| &*list);
        Ok(match self {
            ListReadOperation::Size => OpResponse::Size(list.len() as u64),
            ListReadOperation::Get { index } => {
                if *index < 0 || *index as usize >= list.len() {
                    OpResponse::Error(DomainError::IndexOutOfRange {
                        index: *index,
                        size: list.len(),
                    })
                } else {
                    OpResponse::Value(Some(list[*index as usize].clone()))
                }
            }
            ListReadOperation::Contains { value } => {
                OpResponse::Bool(list.contains(value))
            }
        })
    }
}
