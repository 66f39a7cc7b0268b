//! Server health state.
//!
//! # States
//! - Up: server is eligible for its clusters' active lists
//! - Down: server is excluded from load balancing
//!
//! # State Transitions
//! ```text
//! Down → Up: one successful probe (or registration of an external server)
//! Up → Down: one failed probe
//! ```
//!
//! Only the transition is reported; repeated results in the same state are
//! silent so the dispatch table is not rebuilt on every probe.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::model::Status;

impl From<u8> for Status {
    fn from(val: u8) -> Self {
        match val {
            1 => Status::Up,
            _ => Status::Down,
        }
    }
}

impl From<Status> for u8 {
    fn from(status: Status) -> Self {
        match status {
            Status::Down => 0,
            Status::Up => 1,
        }
    }
}

/// Atomic holder of a server's [`Status`].
#[derive(Debug, Default)]
pub struct HealthState(AtomicU8);

impl HealthState {
    pub fn new(status: Status) -> Self {
        Self(AtomicU8::new(status.into()))
    }

    pub fn get(&self) -> Status {
        Status::from(self.0.load(Ordering::Acquire))
    }

    pub fn is_up(&self) -> bool {
        self.get() == Status::Up
    }

    /// Store `status`. Returns true when it differs from the previous one.
    pub fn set(&self, status: Status) -> bool {
        let prev = self.0.swap(status.into(), Ordering::AcqRel);
        prev != u8::from(status)
    }
}

/// A status transition reported to the dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub server_id: u64,
    pub status: Status,
}
