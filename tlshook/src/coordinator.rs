//! Decides which processes get Go TLS uprobes and keeps the hooks in step
//! with the processes that run each binary.
//!
//! Process start/exit notifications attach and detach pids through the
//! [`FileRegistry`]. The first pid of a binary triggers the analysis and the
//! hook installation, the last one removes the hooks again. Notifications
//! can be lost, so a periodic sweep compares the registry against the
//! processes that are actually alive.

use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context, bail};
use log::{debug, info, trace, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, watch},
    task::{JoinHandle, JoinSet},
    time::MissedTickBehavior,
};

use crate::analyzer::{AnalyzeError, BinaryAnalyzer};
use crate::probes::gotls::{self, FunctionSpec, GO_TLS_FUNCTIONS};
use crate::probes::{HookHandle, HookInstaller, OffsetsTable};
use crate::process::{ProcessMonitor, ProcessNotification, ProcessSource};
use crate::registry::{BinaryId, FilePath, FileRegistry, RegistryError};
use crate::telemetry;

pub const REGISTRY_NAME: &str = "go-tls";
/// Matches the agent's own executables.
pub const DEFAULT_INTERNAL_PROCESS_PATTERN: &str = r"(^|/)tlshook(-[a-z]+)?$";
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);
/// Size above which the set of ineligible binaries is forgotten.
pub const MAX_INELIGIBLE_ENTRIES: usize = 4096;

static DEFAULT_INTERNAL_PROCESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(DEFAULT_INTERNAL_PROCESS_PATTERN).unwrap());

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Never instrument the agent's own pid.
    pub exclude_self: bool,
    /// Executables matching this pattern are never instrumented.
    pub internal_process_pattern: Regex,
    pub sync_interval: Duration,
    /// Analyze binaries again even if an earlier analysis found them
    /// unusable.
    pub retry_ineligible: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            exclude_self: true,
            internal_process_pattern: DEFAULT_INTERNAL_PROCESS_RE.clone(),
            sync_interval: DEFAULT_SYNC_INTERVAL,
            retry_ineligible: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("pid {0} is the agent itself")]
    SelfExcluded(u32),

    #[error("pid {pid} runs agent component {}", path.display())]
    InternalProcess { pid: u32, path: PathBuf },

    #[error("could not resolve the executable of pid {pid}: {source:#}")]
    ExePath {
        pid: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl AttachError {
    /// Outcomes that are part of normal operation: excluded processes,
    /// processes gone before we looked at them, duplicates.
    pub fn is_benign(&self) -> bool {
        match self {
            Self::SelfExcluded(_) | Self::InternalProcess { .. } | Self::ExePath { .. } => true,
            Self::Registry(e) => e.is_benign(),
        }
    }

    /// The binary cannot be instrumented, now or on a later attempt.
    pub fn is_ineligible(&self) -> bool {
        let Self::Registry(RegistryError::Registration { source, .. }) = self else {
            return false;
        };
        source.is::<KnownIneligible>()
            || source
                .downcast_ref::<AnalyzeError>()
                .is_some_and(AnalyzeError::is_ineligible)
    }
}

/// Returned instead of analyzing a binary that failed analysis before.
#[derive(Debug, Error)]
#[error("binary {0} was found ineligible earlier")]
pub struct KnownIneligible(pub BinaryId);

/// Result of one reconciliation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Live processes attached because no notification was seen for them.
    pub attached: usize,
    /// Tracked processes that were gone.
    pub detached: usize,
    pub alive: usize,
}

#[derive(Debug, Default)]
struct CoordinatorStats {
    analyses: AtomicU64,
    analysis_time_us: AtomicU64,
    missing_symbols: AtomicU64,
    hooks_installed: AtomicU64,
    hooks_removed: AtomicU64,
    hook_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStatsSnapshot {
    pub analyses: u64,
    pub analysis_time: Duration,
    /// Binaries without a symbol table.
    pub missing_symbols: u64,
    pub hooks_installed: u64,
    pub hooks_removed: u64,
    pub hook_failures: u64,
}

pub struct GoTlsCoordinator {
    config: CoordinatorConfig,
    functions: &'static [FunctionSpec],
    registry: FileRegistry<Vec<HookHandle>>,
    analyzer: Arc<dyn BinaryAnalyzer>,
    installer: Arc<dyn HookInstaller>,
    offsets: Arc<dyn OffsetsTable>,
    processes: Arc<dyn ProcessSource>,
    ineligible: Mutex<HashSet<BinaryId>>,
    stats: Arc<CoordinatorStats>,
}

impl GoTlsCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        analyzer: Arc<dyn BinaryAnalyzer>,
        installer: Arc<dyn HookInstaller>,
        offsets: Arc<dyn OffsetsTable>,
        processes: Arc<dyn ProcessSource>,
    ) -> Self {
        Self {
            config,
            functions: &GO_TLS_FUNCTIONS,
            registry: FileRegistry::new(REGISTRY_NAME),
            analyzer,
            installer,
            offsets,
            processes,
            ineligible: Mutex::new(HashSet::new()),
            stats: Arc::new(CoordinatorStats::default()),
        }
    }

    pub fn registry(&self) -> &FileRegistry<Vec<HookHandle>> {
        &self.registry
    }

    pub fn stats(&self) -> CoordinatorStatsSnapshot {
        let get = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CoordinatorStatsSnapshot {
            analyses: get(&self.stats.analyses),
            analysis_time: Duration::from_micros(get(&self.stats.analysis_time_us)),
            missing_symbols: get(&self.stats.missing_symbols),
            hooks_installed: get(&self.stats.hooks_installed),
            hooks_removed: get(&self.stats.hooks_removed),
            hook_failures: get(&self.stats.hook_failures),
        }
    }

    /// Instruments the executable of `pid` unless it is excluded. Further
    /// processes of an already instrumented binary only add a reference.
    ///
    /// A pid still tracked under another binary has replaced its image. If
    /// the new image is not instrumented, the pid is dropped from the old
    /// binary so its hooks do not outlive their last real user.
    pub fn attach_pid(&self, pid: u32) -> Result<(), AttachError> {
        let result = self.register_pid(pid);
        if let Err(e) = &result
            && !matches!(
                e,
                AttachError::Registry(RegistryError::AlreadyRegistered { .. })
            )
            && let Some(previous) = self.registry.identity_of(pid)
        {
            debug!("pid {} no longer runs binary {}: {:#}", pid, previous, e);
            if let Err(e) = self.registry.unregister(pid) {
                trace!("pid {} left binary {} already: {}", pid, previous, e);
            }
        }
        result
    }

    fn register_pid(&self, pid: u32) -> Result<(), AttachError> {
        if self.config.exclude_self && pid == std::process::id() {
            return Err(AttachError::SelfExcluded(pid));
        }

        let exe = self
            .processes
            .exe_path(pid)
            .map_err(|source| AttachError::ExePath { pid, source })?;
        if self
            .config
            .internal_process_pattern
            .is_match(&exe.to_string_lossy())
        {
            return Err(AttachError::InternalProcess { pid, path: exe });
        }

        let host_path = self.processes.host_path(pid, &exe);
        let installer = self.installer.clone();
        let offsets = self.offsets.clone();
        let stats = self.stats.clone();

        self.registry.register(
            host_path,
            pid,
            |file| self.instrument(file),
            move |file, handles| {
                uninstrument(installer.as_ref(), offsets.as_ref(), &stats, file, handles)
            },
            |file| {
                debug!(
                    "pid {} shares instrumented binary {}",
                    pid,
                    file.host_path.display()
                )
            },
        )?;
        Ok(())
    }

    /// Like [`attach_pid`](Self::attach_pid) but a pid that is already
    /// tracked counts as success.
    pub fn attach_pid_tolerant(&self, pid: u32) -> Result<(), AttachError> {
        match self.attach_pid(pid) {
            Err(AttachError::Registry(RegistryError::AlreadyRegistered { .. })) => Ok(()),
            other => other,
        }
    }

    /// Drops the reference of `pid`. Hooks are removed with the last
    /// process of a binary.
    pub fn detach_pid(&self, pid: u32) -> Result<(), RegistryError> {
        self.registry.unregister(pid)
    }

    pub fn handle_process_start(&self, pid: u32) {
        match self.attach_pid(pid) {
            Ok(()) => debug!("Attached Go TLS hooks for pid {}", pid),
            Err(e) if e.is_benign() || e.is_ineligible() => {
                trace!("Not instrumenting pid {}: {:#}", pid, e)
            }
            Err(e) => warn!("Failed to instrument pid {}: {:#}", pid, e),
        }
    }

    pub fn handle_process_exit(&self, pid: u32) {
        match self.detach_pid(pid) {
            Ok(()) => debug!("Detached pid {}", pid),
            Err(e) if e.is_benign() => trace!("{}", e),
            Err(e) => warn!("Failed to detach pid {}: {:#}", pid, e),
        }
    }

    fn handle_notification(&self, notification: ProcessNotification) {
        match notification {
            ProcessNotification::Exec(pid) => self.handle_process_start(pid),
            ProcessNotification::Exit(pid) => self.handle_process_exit(pid),
        }
    }

    /// Reconciles the registry with the live processes: attaches processes
    /// whose start was missed and detaches tracked pids that are gone.
    pub fn sync(&self) -> SyncReport {
        let mut candidates = self.registry.registered_processes();

        let live = match self.processes.live_pids() {
            Ok(live) => live,
            Err(e) => {
                warn!("Skipping Go TLS sweep, could not list processes: {:#}", e);
                return SyncReport::default();
            }
        };

        let mut report = SyncReport {
            alive: live.len(),
            ..Default::default()
        };

        for pid in live {
            if candidates.remove(&pid) {
                continue;
            }
            match self.attach_pid(pid) {
                Ok(()) => report.attached += 1,
                Err(e) => trace!("Sweep skipped pid {}: {:#}", pid, e),
            }
        }

        for pid in candidates {
            match self.detach_pid(pid) {
                Ok(()) => report.detached += 1,
                Err(e) => trace!("Sweep could not detach pid {}: {}", pid, e),
            }
        }

        report
    }

    /// Removes every hook and forgets every process.
    pub fn shutdown(&self) {
        self.registry.clear();
    }

    /// Consumes notifications of `monitor` and runs the periodic sweep until
    /// the returned handle is stopped.
    pub fn start(self: Arc<Self>, monitor: &ProcessMonitor) -> CoordinatorHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let events = tokio::spawn(self.clone().run_events(monitor.subscribe(), stop_rx.clone()));
        let sweeps = tokio::spawn(self.clone().run_sweeps(stop_rx));

        info!(
            "Go TLS coordinator started, sweeping every {:?}",
            self.config.sync_interval
        );
        CoordinatorHandle {
            coordinator: self,
            stop_tx,
            tasks: vec![events, sweeps],
        }
    }

    async fn run_events(
        self: Arc<Self>,
        mut notifications: broadcast::Receiver<ProcessNotification>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut jobs = JoinSet::new();

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                received = notifications.recv() => match received {
                    Ok(notification) => {
                        let this = self.clone();
                        jobs.spawn_blocking(move || this.handle_notification(notification));
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Lost {} process notifications, relying on the next sweep", missed)
                    }
                    Err(RecvError::Closed) => break,
                },
                Some(joined) = jobs.join_next(), if !jobs.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Process notification job failed: {}", e);
                    }
                }
            }
        }

        drop(notifications);
        while let Some(joined) = jobs.join_next().await {
            if let Err(e) = joined {
                warn!("Process notification job failed: {}", e);
            }
        }
    }

    async fn run_sweeps(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let period = self.config.sync_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {
                    let this = self.clone();
                    let swept = tokio::task::spawn_blocking(move || {
                        let report = this.sync();
                        this.registry.log();
                        report
                    })
                    .await;
                    match swept {
                        Ok(report) => debug!("Go TLS sweep: {:?}", report),
                        Err(e) => warn!("Go TLS sweep failed: {}", e),
                    }
                }
            }
        }
    }

    /// Analyzes the binary and installs its hooks. Either every hook is
    /// installed or none is.
    fn instrument(&self, file: &FilePath) -> anyhow::Result<Vec<HookHandle>> {
        if !self.config.retry_ineligible && self.is_known_ineligible(file.id) {
            return Err(KnownIneligible(file.id).into());
        }

        let started = Instant::now();
        let inspected = self.analyzer.inspect(&file.host_path, self.functions);
        self.record_analysis(started.elapsed());

        let result = match inspected {
            Ok(result) => result,
            Err(e) => {
                if matches!(e, AnalyzeError::NoSymbols(_)) {
                    self.stats.missing_symbols.fetch_add(1, Ordering::Relaxed);
                    telemetry::record_missing_symbols();
                }
                if e.is_ineligible() {
                    self.mark_ineligible(file.id);
                }
                return Err(e.into());
            }
        };

        let targets = gotls::hook_targets(self.functions, &result, file.id)?;
        self.offsets
            .put(file.id, &gotls::offsets_data(self.functions, &result))?;

        let mut handles = Vec::with_capacity(targets.len());
        for target in &targets {
            match self.installer.install(&file.host_path, target) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    self.stats.hook_failures.fetch_add(1, Ordering::Relaxed);
                    telemetry::record_hook_failure("install", target.program);

                    let removed = remove_hooks(self.installer.as_ref(), &self.stats, handles);
                    debug!(
                        "Rolled back {} hooks on {}",
                        removed,
                        file.host_path.display()
                    );
                    if let Err(e) = self.offsets.delete(file.id) {
                        warn!(
                            "Failed to remove offsets of {}: {:#}",
                            file.host_path.display(),
                            e
                        );
                    }
                    return Err(e.context(format!(
                        "could not install {} ({}) at {:#x}",
                        target.program, target.uid, target.offset
                    )));
                }
            }
        }

        self.forget_ineligible(file.id);
        self.stats
            .hooks_installed
            .fetch_add(handles.len() as u64, Ordering::Relaxed);
        telemetry::record_hooks_installed(handles.len() as u64);
        info!(
            "Installed {} Go TLS hooks on {} ({})",
            handles.len(),
            file.host_path.display(),
            file.id
        );
        Ok(handles)
    }

    fn record_analysis(&self, elapsed: Duration) {
        self.stats.analyses.fetch_add(1, Ordering::Relaxed);
        self.stats
            .analysis_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        telemetry::record_analysis_time(elapsed);
    }

    fn is_known_ineligible(&self, id: BinaryId) -> bool {
        self.ineligible
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&id)
    }

    fn mark_ineligible(&self, id: BinaryId) {
        let mut ineligible = self.ineligible.lock().unwrap_or_else(|e| e.into_inner());
        if ineligible.len() >= MAX_INELIGIBLE_ENTRIES {
            debug!("Forgetting {} ineligible binaries", ineligible.len());
            ineligible.clear();
        }
        ineligible.insert(id);
    }

    fn forget_ineligible(&self, id: BinaryId) {
        self.ineligible
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }
}

/// Removes `handles` in reverse installation order. Returns how many were
/// removed cleanly.
fn remove_hooks(
    installer: &dyn HookInstaller,
    stats: &CoordinatorStats,
    handles: Vec<HookHandle>,
) -> usize {
    let mut removed = 0;
    for handle in handles.into_iter().rev() {
        match installer.remove(&handle) {
            Ok(()) => removed += 1,
            Err(e) => {
                stats.hook_failures.fetch_add(1, Ordering::Relaxed);
                telemetry::record_hook_failure("remove", handle.program);
                debug!("Failed to remove hook {}: {:#}", handle.uid, e);
            }
        }
    }
    stats
        .hooks_removed
        .fetch_add(removed as u64, Ordering::Relaxed);
    telemetry::record_hooks_removed(removed as u64);
    removed
}

/// Tears down a binary's instrumentation. Every step is attempted even if an
/// earlier one failed.
fn uninstrument(
    installer: &dyn HookInstaller,
    offsets: &dyn OffsetsTable,
    stats: &CoordinatorStats,
    file: &FilePath,
    handles: Vec<HookHandle>,
) -> anyhow::Result<()> {
    let total = handles.len();
    let offsets_removed = offsets.delete(file.id);
    let removed = remove_hooks(installer, stats, handles);

    info!(
        "Removed {} of {} Go TLS hooks from {}",
        removed,
        total,
        file.host_path.display()
    );

    offsets_removed
        .with_context(|| format!("could not remove offsets of {}", file.id))?;
    if removed < total {
        bail!("{} hooks could not be removed cleanly", total - removed);
    }
    Ok(())
}

/// Running coordinator tasks.
pub struct CoordinatorHandle {
    coordinator: Arc<GoTlsCoordinator>,
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl CoordinatorHandle {
    pub fn coordinator(&self) -> &Arc<GoTlsCoordinator> {
        &self.coordinator
    }

    /// Stops the notification and sweep tasks, waits for in-flight work and
    /// removes every hook. Returns once nothing is instrumented anymore.
    pub async fn stop(self) {
        // Fails only if both tasks already ended.
        let _ = self.stop_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Go TLS coordinator task failed: {}", e);
            }
        }

        let coordinator = self.coordinator;
        if let Err(e) = tokio::task::spawn_blocking(move || coordinator.shutdown()).await {
            warn!("Failed to remove Go TLS hooks: {}", e);
        }
        info!("Go TLS coordinator stopped");
    }
}
