use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;
use tlshook_common::{PROCESS_EVENT_EXEC, PROCESS_EVENT_EXIT, ProcessEvent};
use tokio::sync::broadcast;

/// Capacity of the notification channel. Subscribers that fall further
/// behind lose notifications and rely on the periodic sweep.
pub const NOTIFICATION_CAPACITY: usize = 4096;

/// Resolves a path from a process's namespace to the host filesystem.
/// Handles containerized processes by looking through <proc_root>/<PID>/root.
pub fn resolve_host_path(proc_root: &Path, pid: u32, container_path: &Path) -> PathBuf {
    if container_path.starts_with(proc_root) {
        return container_path.to_path_buf();
    }

    // <proc_root>/<PID>/root/<CONTAINER_PATH>
    let mut root_path = proc_root.join(pid.to_string()).join("root");
    let relative_path = container_path.strip_prefix("/").unwrap_or(container_path);
    root_path.push(relative_path);

    root_path
}

/// View of the processes running on the host.
pub trait ProcessSource: Send + Sync {
    /// Every pid currently visible.
    fn live_pids(&self) -> Result<Vec<u32>>;

    /// Executable of `pid`, as seen from inside the process's namespace.
    fn exe_path(&self, pid: u32) -> Result<PathBuf>;

    /// Path through which the agent reaches `exe` of `pid`.
    fn host_path(&self, pid: u32, exe: &Path) -> PathBuf;
}

pub struct ProcfsSource {
    proc_root: PathBuf,
}

impl ProcfsSource {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

impl Default for ProcfsSource {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcessSource for ProcfsSource {
    fn live_pids(&self) -> Result<Vec<u32>> {
        let procs = procfs::process::all_processes_with_root(&self.proc_root)
            .with_context(|| format!("could not list {}", self.proc_root.display()))?;

        // Processes may exit while we iterate; skip the ones that vanished.
        Ok(procs
            .filter_map(|p| p.ok())
            .filter_map(|p| u32::try_from(p.pid).ok())
            .collect())
    }

    fn exe_path(&self, pid: u32) -> Result<PathBuf> {
        let process = procfs::process::Process::new_with_root(self.proc_root.join(pid.to_string()))
            .with_context(|| format!("process {} not found", pid))?;
        process
            .exe()
            .with_context(|| format!("could not read executable of process {}", pid))
    }

    fn host_path(&self, pid: u32, exe: &Path) -> PathBuf {
        resolve_host_path(&self.proc_root, pid, exe)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessNotification {
    Exec(u32),
    Exit(u32),
}

impl ProcessNotification {
    pub fn from_event(event: ProcessEvent) -> Option<Self> {
        match event.kind {
            PROCESS_EVENT_EXEC => Some(Self::Exec(event.pid)),
            PROCESS_EVENT_EXIT => Some(Self::Exit(event.pid)),
            _ => None,
        }
    }
}

/// Fans process start/exit notifications out to subscribers. Delivery is
/// best effort.
pub struct ProcessMonitor {
    tx: broadcast::Sender<ProcessNotification>,
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new(NOTIFICATION_CAPACITY)
    }
}

impl ProcessMonitor {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessNotification> {
        self.tx.subscribe()
    }

    pub fn notify(&self, notification: ProcessNotification) {
        // Sending only fails without subscribers.
        let _ = self.tx.send(notification);
    }

    pub fn notify_exec(&self, pid: u32) {
        self.notify(ProcessNotification::Exec(pid));
    }

    pub fn notify_exit(&self, pid: u32) {
        self.notify(ProcessNotification::Exit(pid));
    }

    /// Forwards an event read from the kernel.
    pub fn notify_event(&self, event: ProcessEvent) {
        match ProcessNotification::from_event(event) {
            Some(notification) => self.notify(notification),
            None => debug!("Ignoring process event of kind {}", event.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_host_path() {
        let root = Path::new("/proc");
        assert_eq!(
            resolve_host_path(root, 42, Path::new("/usr/bin/server")),
            PathBuf::from("/proc/42/root/usr/bin/server")
        );
        assert_eq!(
            resolve_host_path(root, 42, Path::new("/proc/7/exe")),
            PathBuf::from("/proc/7/exe")
        );
        assert_eq!(
            resolve_host_path(Path::new("/host/proc"), 1, Path::new("app")),
            PathBuf::from("/host/proc/1/root/app")
        );
    }

    #[test]
    fn test_procfs_sees_current_process() {
        let source = ProcfsSource::default();
        let me = std::process::id();

        assert!(source.live_pids().unwrap().contains(&me));
        assert_eq!(
            source.exe_path(me).unwrap(),
            std::env::current_exe().unwrap()
        );
    }

    #[test]
    fn test_procfs_unknown_pid() {
        let source = ProcfsSource::default();
        // Above the kernel's pid_max limit.
        assert!(source.exe_path(u32::MAX - 1).is_err());
    }

    #[test]
    fn test_notification_from_kernel_event() {
        let exec = ProcessEvent {
            pid: 5,
            kind: PROCESS_EVENT_EXEC,
        };
        let exit = ProcessEvent {
            pid: 5,
            kind: PROCESS_EVENT_EXIT,
        };
        let bogus = ProcessEvent { pid: 5, kind: 9 };
        assert_eq!(
            ProcessNotification::from_event(exec),
            Some(ProcessNotification::Exec(5))
        );
        assert_eq!(
            ProcessNotification::from_event(exit),
            Some(ProcessNotification::Exit(5))
        );
        assert_eq!(ProcessNotification::from_event(bogus), None);
    }

    #[tokio::test]
    async fn test_monitor_fans_out() {
        let monitor = ProcessMonitor::new(8);
        let mut a = monitor.subscribe();
        let mut b = monitor.subscribe();

        monitor.notify_exec(10);
        monitor.notify_exit(10);

        for rx in [&mut a, &mut b] {
            assert_eq!(rx.recv().await.unwrap(), ProcessNotification::Exec(10));
            assert_eq!(rx.recv().await.unwrap(), ProcessNotification::Exit(10));
        }
    }

    #[test]
    fn test_monitor_without_subscribers() {
        let monitor = ProcessMonitor::default();
        monitor.notify_exec(1);
    }
}
