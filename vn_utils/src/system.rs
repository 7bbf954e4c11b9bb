use sysinfo::{Pid, PidExt, ProcessExt, ProcessRefreshKind, Signal, System, SystemExt};

pub fn is_process_running(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_process_specifics(Pid::from_u32(pid), ProcessRefreshKind::new())
        .then(|| sys.process(Pid::from_u32(pid)).map(|proc| proc.status()))
        .flatten()
        .map_or(false, |status| status != sysinfo::ProcessStatus::Zombie)
}

/// Send `signal` to the process with the given pid. Returns false if the
/// process does not exist or the signal is not supported on this platform.
pub fn signal_process(pid: u32, signal: Signal) -> bool {
    let mut sys = System::new();
    sys.refresh_process_specifics(Pid::from_u32(pid), ProcessRefreshKind::new());
    sys.process(Pid::from_u32(pid))
        .and_then(|proc| proc.kill_with(signal))
        .unwrap_or(false)
}

/// Send `signal` to every process whose name equals `name`.
/// Returns the number of processes signaled.
pub fn signal_processes_by_name(name: &str, signal: Signal) -> usize {
    let mut sys = System::new();
    sys.refresh_processes_specifics(ProcessRefreshKind::new());
    sys.processes_by_exact_name(name)
        .filter(|proc| proc.kill_with(signal).unwrap_or(false))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_running() {
        assert!(is_process_running(std::process::id()));
    }

    #[test]
    fn test_absent_process() {
        // pid max on linux is bounded well below u32::MAX by default
        assert!(!is_process_running(u32::MAX - 1));
        assert!(!signal_process(u32::MAX - 1, Signal::Hangup));
    }
}
