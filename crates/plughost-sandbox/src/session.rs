//! Sandbox sessions.
//!
//! A session is an ephemeral scope with its own scratch tree
//! (`input/ output/ temp/ cache/ logs/`), a set of limits, and the process
//! groups it launched.  Sessions live only in memory.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ResourceLimits;
use crate::limits::ResourceSnapshot;

/// Subdirectories created under every session root.
pub const SCRATCH_DIRS: [&str; 5] = ["input", "output", "temp", "cache", "logs"];

/// Opaque session handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Read-only view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub owner_id: String,
    pub root: PathBuf,
    pub limits: ResourceLimits,
    pub created_at: DateTime<Utc>,
    /// Last recorded snapshot.
    pub snapshot: ResourceSnapshot,
    /// Leaders of the process groups currently owned.
    pub processes: Vec<u32>,
}

#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) id: SessionId,
    pub(crate) owner_id: String,
    pub(crate) root: PathBuf,
    pub(crate) limits: ResourceLimits,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) snapshot: ResourceSnapshot,
    /// CPU seconds consumed by runs that already finished.
    pub(crate) cpu_spent: f64,
    /// Process group leaders (pid == pgid).
    pub(crate) processes: BTreeSet<u32>,
}

impl Session {
    pub(crate) fn new(owner_id: String, root: PathBuf, limits: ResourceLimits) -> Self {
        Self {
            id: SessionId::generate(),
            owner_id,
            root,
            limits,
            created_at: Utc::now(),
            snapshot: ResourceSnapshot::default(),
            cpu_spent: 0.0,
            processes: BTreeSet::new(),
        }
    }

    pub(crate) fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            owner_id: self.owner_id.clone(),
            root: self.root.clone(),
            limits: self.limits.clone(),
            created_at: self.created_at,
            snapshot: self.snapshot,
            processes: self.processes.iter().copied().collect(),
        }
    }
}

/// Ids of recently cleaned sessions, oldest first.  Once `capacity` is
/// reached the oldest id is forgotten.
#[derive(Debug)]
pub(crate) struct RetiredSessions {
    ids: Mutex<VecDeque<SessionId>>,
    capacity: usize,
}

impl RetiredSessions {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            ids: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn insert(&self, id: SessionId) {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        ids.push_back(id);
        while ids.len() > self.capacity {
            ids.pop_front();
        }
    }

    pub(crate) fn contains(&self, id: &SessionId) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Create the scratch tree under `root`.
pub(crate) fn create_scratch_tree(root: &Path) -> std::io::Result<()> {
    for dir in SCRATCH_DIRS {
        std::fs::create_dir_all(root.join(dir))?;
    }
    Ok(())
}
