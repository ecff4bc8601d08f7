//! Resource sampling for owned process trees and scratch directories.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::limits::ResourceSnapshot;
use crate::platform;

const MIB: f64 = 1024.0 * 1024.0;

/// Reusable sampler.  Keeps one `sysinfo::System` so repeated samples only
/// refresh process data.
pub(crate) struct Monitor {
    system: System,
}

impl Monitor {
    pub(crate) fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Sample the process trees rooted at `roots` plus the disk usage of
    /// `scratch`.
    pub(crate) fn sample(&mut self, roots: &[u32], scratch: &Path) -> ResourceSnapshot {
        let mut snapshot = self.sample_processes(roots);
        snapshot.disk_mb = dir_size(scratch) as f64 / MIB;
        snapshot
    }

    /// Memory, CPU and process count of every process descending from
    /// `roots` (roots included).
    pub(crate) fn sample_processes(&mut self, roots: &[u32]) -> ResourceSnapshot {
        if roots.is_empty() {
            return ResourceSnapshot::default();
        }

        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new().with_memory(),
        );

        // Threads may be listed alongside processes; they share their
        // owner's memory and are not separate processes.
        let threads: HashSet<Pid> = self
            .system
            .processes()
            .iter()
            .filter_map(|(pid, process)| process.tasks().map(|tasks| (pid, tasks)))
            .flat_map(|(pid, tasks)| tasks.iter().filter(move |tid| *tid != pid).copied())
            .collect();

        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (pid, process) in self.system.processes() {
            if threads.contains(pid) {
                continue;
            }
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*pid);
            }
        }

        let mut snapshot = ResourceSnapshot::default();
        let mut memory_bytes: u64 = 0;
        let mut stack: Vec<Pid> = roots.iter().map(|p| Pid::from_u32(*p)).collect();

        while let Some(pid) = stack.pop() {
            let Some(process) = self.system.process(pid) else {
                continue;
            };
            snapshot.process_count += 1;
            memory_bytes = memory_bytes.saturating_add(process.memory());
            snapshot.cpu_seconds += platform::cpu_seconds(pid.as_u32()).unwrap_or(0.0);
            if let Some(kids) = children.get(&pid) {
                stack.extend(kids.iter().copied());
            }
        }

        snapshot.memory_mb = memory_bytes as f64 / MIB;
        snapshot
    }
}

/// Total size in bytes of all regular files under `path`.  Unreadable
/// entries are ignored.  Symlinks are not followed.
pub(crate) fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };

    entries
        .flatten()
        .map(|entry| match entry.file_type() {
            Ok(ft) if ft.is_dir() => dir_size(&entry.path()),
            Ok(ft) if ft.is_file() => entry.metadata().map(|m| m.len()).unwrap_or(0),
            _ => 0,
        })
        .sum()
}
