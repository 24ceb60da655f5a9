//! Membership view and node lifecycle state of one member.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::RwLock;

use crate::cluster::Address;

/// Lifecycle state of a member node.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum NodeState {
    Starting = 0,
    Active = 1,
    ShuttingDown = 2,
    Shutdown = 3,
}

impl NodeState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => NodeState::Starting,
            1 => NodeState::Active,
            2 => NodeState::ShuttingDown,
            _ => NodeState::Shutdown,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What this member currently believes the cluster looks like. Kept up to
/// date by the (external) membership subsystem.
#[derive(Debug)]
pub struct ClusterView {
    /// My own address.
    me: Address,

    /// Current member list, always including myself.
    members: RwLock<Vec<Address>>,

    /// Node lifecycle state.
    state: AtomicU8,
}

impl ClusterView {
    /// Creates a view with only myself as member, in `Starting` state.
    pub fn new(me: Address) -> Self {
        ClusterView {
            me,
            members: RwLock::new(vec![me]),
            state: AtomicU8::new(NodeState::Starting as u8),
        }
    }

    #[inline]
    pub fn me(&self) -> Address {
        self.me
    }

    /// Snapshot of the current member list.
    pub fn current_members(&self) -> Vec<Address> {
        self.members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replaces the member list. Returns the members that disappeared.
    pub fn set_members(&self, members: &[Address]) -> Vec<Address> {
        let mut list = self.members.write().unwrap_or_else(|e| e.into_inner());
        let gone: Vec<Address> = list
            .iter()
            .filter(|m| !members.contains(m))
            .copied()
            .collect();
        *list = members.to_vec();
        if !list.contains(&self.me) {
            list.push(self.me);
        }
        gone.into_iter().filter(|&m| m != self.me).collect()
    }

    /// Whether `member` is in the current member list.
    pub fn is_member(&self, member: Address) -> bool {
        self.members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&member)
    }

    #[inline]
    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_state(&self, state: NodeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state() == NodeState::Active
    }
}

#[cfg(test)]
mod members_tests {
    use super::*;

    fn addr(port: u16) -> Address {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn set_members_reports_gone() {
        let view = ClusterView::new(addr(5701));
        assert_eq!(view.current_members(), vec![addr(5701)]);
        let gone = view.set_members(&[addr(5701), addr(5702), addr(5703)]);
        assert!(gone.is_empty());
        let gone = view.set_members(&[addr(5703)]);
        assert_eq!(gone, vec![addr(5702)]);
        // myself never dropped
        assert!(view.is_member(addr(5701)));
        assert!(!view.is_member(addr(5702)));
    }

    #[test]
    fn lifecycle_state() {
        let view = ClusterView::new(addr(5701));
        assert_eq!(view.state(), NodeState::Starting);
        assert!(!view.is_active());
        view.set_state(NodeState::Active);
        assert!(view.is_active());
        view.set_state(NodeState::Shutdown);
        assert_eq!(view.state(), NodeState::Shutdown);
    }
}
