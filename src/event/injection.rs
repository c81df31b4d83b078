//! Injection ticket
//!
//! Shared between the injecting caller, the event record and every dispatch
//! entry created from it. The caller blocks on the dispatcher's condition
//! variables; the ticket itself only holds the outcome.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of an injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionResult {
    /// Not resolved yet
    Pending,
    /// Delivered (or consumed by the policy)
    Succeeded,
    /// Dropped or no target could be found
    Failed,
    /// The injector may not target the chosen window
    PermissionDenied,
    /// The caller's timeout elapsed first
    TimedOut,
}

impl fmt::Display for InjectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::TimedOut => "TIMED_OUT",
        };
        f.write_str(name)
    }
}

/// How long `inject_event` blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Return as soon as the event is queued
    #[default]
    None,
    /// Wait until targets are resolved
    WaitForResult,
    /// Additionally wait until every foreground target finished the event
    WaitForFinished,
}

#[derive(Debug)]
struct Progress {
    result: InjectionResult,
    pending_foreground_dispatches: u32,
}

/// Injection ticket.
#[derive(Debug)]
pub struct InjectionState {
    /// Injecting process id
    pub injector_pid: i32,
    /// Injecting user id
    pub injector_uid: i32,
    /// Caller does not wait for the result
    pub is_async: bool,
    /// Injector may target windows owned by other users; decided once,
    /// before the event is queued
    pub has_permission: bool,
    progress: Mutex<Progress>,
}

impl InjectionState {
    /// Fresh pending ticket.
    pub fn new(injector_pid: i32, injector_uid: i32, is_async: bool) -> Self {
        Self {
            injector_pid,
            injector_uid,
            is_async,
            has_permission: false,
            progress: Mutex::new(Progress {
                result: InjectionResult::Pending,
                pending_foreground_dispatches: 0,
            }),
        }
    }

    /// Record the permission check made for the injector.
    pub fn with_permission(mut self, has_permission: bool) -> Self {
        self.has_permission = has_permission;
        self
    }

    /// Current result.
    pub fn result(&self) -> InjectionResult {
        self.progress.lock().result
    }

    /// Resolve the ticket. Returns false if it was already resolved.
    pub fn resolve(&self, result: InjectionResult) -> bool {
        let mut progress = self.progress.lock();
        if progress.result != InjectionResult::Pending {
            return false;
        }
        progress.result = result;
        true
    }

    /// Outstanding foreground deliveries.
    pub fn pending_foreground_dispatches(&self) -> u32 {
        self.progress.lock().pending_foreground_dispatches
    }

    /// A foreground dispatch entry was queued.
    pub fn increment_pending_foreground(&self) {
        self.progress.lock().pending_foreground_dispatches += 1;
    }

    /// A foreground dispatch entry finished; returns the remaining count.
    pub fn decrement_pending_foreground(&self) -> u32 {
        let mut progress = self.progress.lock();
        progress.pending_foreground_dispatches = progress.pending_foreground_dispatches.saturating_sub(1);
        progress.pending_foreground_dispatches
    }
}
