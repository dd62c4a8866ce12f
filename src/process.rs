//! Host process helpers — find and stop editor processes by name.

use serde::Serialize;
use sysinfo::{ProcessesToUpdate, System};

/// A running process on this machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostProcess {
    pub pid: u32,
    pub name: String,
}

fn snapshot() -> System {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    sys
}

/// Running processes whose name contains `filter` (case-insensitive), sorted by name.
///
/// `None` lists everything.
pub fn list_processes(filter: Option<&str>) -> Vec<HostProcess> {
    let needle = filter.map(str::to_lowercase);
    let sys = snapshot();

    let mut found: Vec<HostProcess> = sys
        .processes()
        .iter()
        .map(|(pid, process)| HostProcess {
            pid: pid.as_u32(),
            name: process.name().to_string_lossy().into_owned(),
        })
        .filter(|p| match &needle {
            Some(n) => p.name.to_lowercase().contains(n.as_str()),
            None => true,
        })
        .collect();

    found.sort_by(|a, b| a.name.cmp(&b.name).then(a.pid.cmp(&b.pid)));
    found
}

/// Signal every process named `name`. Returns how many were signalled.
pub fn kill_by_name(name: &str) -> usize {
    let sys = snapshot();
    let mut killed = 0;

    for (pid, process) in sys.processes() {
        let process_name = process.name().to_string_lossy();
        if !matches_process_name(&process_name, name) {
            continue;
        }
        if process.kill() {
            tracing::info!(pid = pid.as_u32(), name = %process_name, "terminated host process");
            killed += 1;
        } else {
            tracing::warn!(pid = pid.as_u32(), name = %process_name, "failed to terminate host process");
        }
    }

    killed
}

/// Exact name match, ignoring case and a trailing `.exe` on either side.
fn matches_process_name(candidate: &str, wanted: &str) -> bool {
    fn stem(name: &str) -> String {
        let lower = name.trim().to_lowercase();
        match lower.strip_suffix(".exe") {
            Some(s) => s.to_string(),
            None => lower,
        }
    }
    let wanted = stem(wanted);
    !wanted.is_empty() && stem(candidate) == wanted
}
