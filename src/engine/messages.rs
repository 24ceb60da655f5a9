//! Messages exchanged between members.

use crate::cluster::{to_data, Data};
use crate::operation::{BackupOperation, OpEnvelope, OpResponse};
use crate::partition::PartitionId;
use crate::utils::GridError;

use serde::{Deserialize, Serialize};

/// Locally unique invocation ID type.
pub type InvocationId = u64;

/// Peer-peer message type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMsg {
    /// Run an operation; partition-level ones carry their partition in the
    /// header, member-level ones none.
    Invoke { id: InvocationId, op: OpEnvelope },

    /// Outcome of an `Invoke`, routed back by invocation ID.
    Response {
        id: InvocationId,
        result: Result<OpResponse, GridError>,
    },

    /// Backup of a primary effect. `ack` is set when the primary waits for
    /// the acknowledgement.
    Backup {
        partition: PartitionId,
        version: u64,
        op: BackupOperation,
        ack: Option<u64>,
    },

    /// Acknowledgement of an applied backup.
    BackupAck { ack: u64 },
}

impl PeerMsg {
    #[inline]
    pub fn encode(&self) -> Result<Data, GridError> {
        to_data(self)
    }
}
