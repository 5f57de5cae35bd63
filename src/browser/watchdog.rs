//! Process-table probe: resource usage of the browser trees we own and a
//! sweep for browser processes nobody owns any more.

use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::{debug, warn};

/// Substrings of executable names that belong to the browser family.
const BROWSER_FAMILY: &[&str] = &["chrome", "chromium", "headless_shell"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessUsage {
    pub pids_count: usize,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone)]
struct ProcInfo {
    pid: u32,
    parent: Option<u32>,
    name: String,
    cmd: String,
    memory: u64,
}

/// Blocking; call from `spawn_blocking`.
pub struct ProcessProbe {
    system: Mutex<System>,
    marker: Option<String>,
}

impl ProcessProbe {
    /// `marker` is the command-line substring identifying our browsers.
    /// Without it the orphan sweep never kills anything.
    pub fn new(marker: Option<String>) -> Self {
        ProcessProbe {
            system: Mutex::new(System::new()),
            marker,
        }
    }

    fn snapshot(&self, system: &mut System) -> Vec<ProcInfo> {
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing()
                .with_memory()
                .with_cmd(UpdateKind::OnlyIfNotSet),
        );
        system
            .processes()
            .iter()
            .filter(|(_, p)| p.thread_kind().is_none())
            .map(|(pid, p)| ProcInfo {
                pid: pid.as_u32(),
                parent: p.parent().map(|pp| pp.as_u32()),
                name: p.name().to_string_lossy().to_lowercase(),
                cmd: p
                    .cmd()
                    .iter()
                    .map(|s| s.to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join(" "),
                memory: p.memory(),
            })
            .collect()
    }

    /// PIDs and resident memory of the tracked roots plus all descendants.
    pub fn usage(&self, roots: &HashSet<u32>) -> ProcessUsage {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        let procs = self.snapshot(&mut system);
        let tree = descendants(&procs, roots);
        procs
            .iter()
            .filter(|p| tree.contains(&p.pid))
            .fold(ProcessUsage::default(), |acc, p| ProcessUsage {
                pids_count: acc.pids_count + 1,
                memory_bytes: acc.memory_bytes + p.memory,
            })
    }

    /// Kill marked browser processes that sit outside every tracked tree.
    /// Returns the PIDs signalled.
    pub fn sweep_orphans(&self, roots: &HashSet<u32>) -> Vec<u32> {
        let Some(marker) = self.marker.as_deref() else {
            return Vec::new();
        };
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        let procs = self.snapshot(&mut system);
        let orphans = find_orphans(&procs, roots, marker);

        let mut killed = Vec::new();
        for pid in orphans {
            match system.process(Pid::from_u32(pid)) {
                Some(process) if process.kill() => {
                    warn!("[Watchdog] Killed orphaned browser process {}", pid);
                    killed.push(pid);
                }
                Some(_) => warn!("[Watchdog] Failed to kill orphan {}", pid),
                None => debug!("[Watchdog] Orphan {} already gone", pid),
            }
        }
        killed
    }
}

fn descendants(procs: &[ProcInfo], roots: &HashSet<u32>) -> HashSet<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for p in procs {
        if let Some(parent) = p.parent {
            children.entry(parent).or_default().push(p.pid);
        }
    }

    let mut seen: HashSet<u32> = HashSet::new();
    let mut queue: VecDeque<u32> = roots.iter().copied().collect();
    while let Some(pid) = queue.pop_front() {
        if !seen.insert(pid) {
            continue;
        }
        if let Some(kids) = children.get(&pid) {
            queue.extend(kids.iter().copied());
        }
    }
    seen
}

fn find_orphans(procs: &[ProcInfo], roots: &HashSet<u32>, marker: &str) -> Vec<u32> {
    let owned = descendants(procs, roots);
    let mut orphans: Vec<u32> = procs
        .iter()
        .filter(|p| !owned.contains(&p.pid))
        .filter(|p| BROWSER_FAMILY.iter().any(|f| p.name.contains(f)))
        .filter(|p| p.cmd.contains(marker))
        .map(|p| p.pid)
        .collect();
    orphans.sort_unstable();
    orphans
}
