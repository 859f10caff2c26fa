//! Handles to supervised processes.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    Hypervisor,
    Proxy,
}

impl ProcessKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessKind::Hypervisor => "hypervisor",
            ProcessKind::Proxy => "proxy",
        }
    }
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A process started for a session.
///
/// Holds the owned child while this runtime spawned it, so termination
/// can signal and reap through the handle. After a restart only the pid
/// recorded in the registry remains; see [`ManagedProcess::from_pid`].
pub struct ManagedProcess {
    pid: u32,
    kind: ProcessKind,
    child: Option<tokio::process::Child>,
}

impl ManagedProcess {
    /// Wrap a freshly spawned child. `None` when the child has no pid,
    /// which only happens once it has been reaped.
    pub fn from_child(child: tokio::process::Child, kind: ProcessKind) -> Option<Self> {
        let pid = child.id()?;
        Some(Self {
            pid,
            kind,
            child: Some(child),
        })
    }

    /// Reference a process known only by its recorded pid.
    pub fn from_pid(pid: u32, kind: ProcessKind) -> Self {
        Self {
            pid,
            kind,
            child: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn kind(&self) -> ProcessKind {
        self.kind
    }

    pub fn is_owned(&self) -> bool {
        self.child.is_some()
    }

    pub(crate) fn take_child(&mut self) -> Option<tokio::process::Child> {
        self.child.take()
    }
}

impl fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("pid", &self.pid)
            .field("kind", &self.kind)
            .field("owned", &self.child.is_some())
            .finish()
    }
}
