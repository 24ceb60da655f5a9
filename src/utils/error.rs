//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

use crate::cluster::Address;
use crate::partition::PartitionId;

use serde::{Deserialize, Serialize};

/// Invocation ID type, duplicated here to avoid a cycle with `engine`.
type InvocationId = u64;

/// Expected domain-level failure of an operation. These travel as operation
/// response values (not as execution failures), so that they never trigger
/// backup replication; the proxy turns them into `GridError::Domain`.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum DomainError {
    /// List index outside `[0, size)`.
    IndexOutOfRange { index: i64, size: usize },

    /// Key is locked by another caller thread.
    KeyLocked { holder: u64 },

    /// Unlock attempted by a thread that does not hold the lock.
    NotLockOwner,

    /// No entry processor of that name is registered on the owner.
    UnknownProcessor { name: String },
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DomainError::IndexOutOfRange { index, size } => {
                write!(f, "index {} out of range for size {}", index, size)
            }
            DomainError::KeyLocked { holder } => {
                write!(f, "key locked by thread {}", holder)
            }
            DomainError::NotLockOwner => {
                write!(f, "current thread is not the lock owner")
            }
            DomainError::UnknownProcessor { name } => {
                write!(f, "no entry processor named '{}'", name)
            }
        }
    }
}

/// Customized error type for gridset.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum GridError {
    /// Partition has no owner yet; cluster may still be stabilizing.
    NoOwner { partition: PartitionId },

    /// Target member cannot be reached through the transport.
    Unreachable { target: Address, cause: String },

    /// Receiver does not own the partition anymore (migrated away).
    WrongTarget {
        partition: PartitionId,
        member: Address,
    },

    /// Target member left the cluster while the invocation was in flight.
    MemberLeft { member: Address },

    /// Operation's `run()` failed on the executing member.
    Execution { cause: String },

    /// Local wait bound exceeded; remote side is not informed.
    Timeout {
        invocation: InvocationId,
        waited_ms: u64,
    },

    /// Fan-out where at least one partition failed.
    PartialAggregate {
        failed: Vec<(PartitionId, String)>,
    },

    /// Domain failure value translated at the proxy boundary.
    Domain(DomainError),

    /// Locally detected misuse (bad argument), no round trip made.
    Misuse(String),

    /// Engine is not accepting invocations (not active yet, or stopped).
    NotActive,

    /// Engine shut down while the invocation was still pending.
    ShuttingDown,

    /// Local waiting was cancelled by the caller.
    Cancelled,

    /// Wrapper used at the proxy boundary; preserves the original cause.
    Proxy { op: String, cause: Box<GridError> },

    /// Anything else.
    Msg(String),
}

impl GridError {
    pub fn msg(msg: impl ToString) -> Self {
        GridError::Msg(msg.to_string())
    }

    /// Whether the failure is a transient routing condition that a caller may
    /// retry after a short delay.
    pub fn is_retryable(&self) -> bool {
        match self {
            GridError::NoOwner { .. } => true,
            GridError::Proxy { cause, .. } => cause.is_retryable(),
            _ => false,
        }
    }

    /// Strips any proxy-boundary wrapping.
    pub fn root_cause(&self) -> &GridError {
        match self {
            GridError::Proxy { cause, .. } => cause.root_cause(),
            e => e,
        }
    }

    /// Wraps the error as a proxy-boundary failure of operation `op`. An
    /// already wrapped error is returned as is.
    pub fn at_proxy(self, op: &str) -> Self {
        match self {
            GridError::Proxy { .. } => self,
            e => GridError::Proxy {
                op: op.into(),
                cause: Box::new(e),
            },
        }
    }
}

impl fmt::Display for GridError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GridError::NoOwner { partition } => {
                write!(f, "partition {} has no owner", partition)
            }
            GridError::Unreachable { target, cause } => {
                write!(f, "member {} unreachable: {}", target, cause)
            }
            GridError::WrongTarget { partition, member } => write!(
                f,
                "member {} is not the owner of partition {}",
                member, partition
            ),
            GridError::MemberLeft { member } => {
                write!(f, "member {} left the cluster", member)
            }
            GridError::Execution { cause } => {
                write!(f, "remote execution failed: {}", cause)
            }
            GridError::Timeout {
                invocation,
                waited_ms,
            } => write!(
                f,
                "invocation {} timed out after {} ms",
                invocation, waited_ms
            ),
            GridError::PartialAggregate { failed } => {
                write!(f, "{} partition(s) failed:", failed.len())?;
                for (p, cause) in failed {
                    write!(f, " [{}: {}]", p, cause)?;
                }
                Ok(())
            }
            GridError::Domain(e) => write!(f, "{}", e),
            GridError::Misuse(m) => write!(f, "illegal argument: {}", m),
            GridError::NotActive => write!(f, "node is not active"),
            GridError::ShuttingDown => write!(f, "node is shutting down"),
            GridError::Cancelled => write!(f, "invocation cancelled"),
            GridError::Proxy { op, cause } => {
                write!(f, "{} failed: {}", op, cause)
            }
            GridError::Msg(m) => write!(f, "{}", m), // no literal quotes
        }
    }
}

impl error::Error for GridError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `GridError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for GridError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                GridError::Msg(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `GridError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for GridError {
            fn from(e: $error) -> GridError {
                GridError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(tokio::sync::broadcast::error::RecvError);

impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);
impl_from_error_generic!(tokio::sync::broadcast::error::SendError<T>);
