pub mod analyzer;
pub mod coordinator;
pub mod probes;
pub mod process;
pub mod registry;
pub mod settings;
pub mod telemetry;
#[cfg(test)]
mod testutil;

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use aya::Ebpf;
use aya_log::EbpfLogger;
use log::{info, warn};
use tlshook_common::ProcessEvent;
use tokio::signal;

use crate::analyzer::ElfAnalyzer;
use crate::coordinator::GoTlsCoordinator;
use crate::probes::{
    TracepointConfig, attach_tracepoint,
    gotls::{AyaHookInstaller, AyaOffsetsTable, GO_TLS_FUNCTIONS},
    request_shutdown, spawn_ringbuf_handler,
};
use crate::process::{ProcessMonitor, ProcfsSource};
use crate::settings::Settings;

pub const DEFAULT_BPF_OBJECT: &str = "/usr/lib/tlshook/tlshook.bpf.o";
pub const PROCESS_EVENTS_MAP: &str = "PROCESS_EVENTS";

const PROCESS_TRACEPOINTS: [TracepointConfig<'static>; 2] = [
    TracepointConfig {
        program_name: "tlshook_process_exec",
        category: "sched",
        name: "sched_process_exec",
    },
    TracepointConfig {
        program_name: "tlshook_process_exit",
        category: "sched",
        name: "sched_process_exit",
    },
];

pub struct TlsHookEngine {
    pub settings: Settings,
    bpf: Ebpf,
}

impl TlsHookEngine {
    pub fn new(settings: Settings, bpf_object: &Path) -> Result<Self> {
        bump_memlock_rlimit()?;
        let mut bpf = Ebpf::load_file(bpf_object)
            .with_context(|| format!("Failed to load {}", bpf_object.display()))?;
        if let Err(e) = EbpfLogger::init(&mut bpf) {
            warn!("Failed to initialize eBPF logger: {}", e);
        }
        Ok(Self { settings, bpf })
    }

    pub async fn run(mut self) -> Result<()> {
        let monitor = Arc::new(ProcessMonitor::default());
        self.attach_process_events(monitor.clone())?;

        let config = self
            .settings
            .to_coordinator_config()
            .context("Invalid Go TLS settings")?;
        let offsets = AyaOffsetsTable::from_ebpf(&mut self.bpf)?;
        let installer = AyaHookInstaller::new(self.bpf, &GO_TLS_FUNCTIONS)?;
        let analyzer = ElfAnalyzer::new(self.settings.go_tls.struct_offsets);
        let processes = ProcfsSource::new(self.settings.proc_root());

        let coordinator = Arc::new(GoTlsCoordinator::new(
            config,
            Arc::new(analyzer),
            Arc::new(installer),
            Arc::new(offsets),
            Arc::new(processes),
        ));

        // Subscribe before the initial sweep so no start in between is missed.
        let handle = coordinator.clone().start(&monitor);
        let report = {
            let coordinator = coordinator.clone();
            tokio::task::spawn_blocking(move || coordinator.sync()).await?
        };
        info!(
            "Initial sweep instrumented {} of {} processes",
            report.attached, report.alive
        );
        coordinator.registry().log();

        info!("Monitoring active. Press Ctrl-C to exit.");
        signal::ctrl_c().await?;
        info!("Exiting...");

        request_shutdown();
        handle.stop().await;
        Ok(())
    }

    fn attach_process_events(&mut self, monitor: Arc<ProcessMonitor>) -> Result<()> {
        let mut attached = 0;
        for config in PROCESS_TRACEPOINTS {
            if attach_tracepoint(&mut self.bpf, config)? {
                attached += 1;
            }
        }
        if attached < PROCESS_TRACEPOINTS.len() {
            warn!("Process notifications are incomplete; relying on periodic sweeps");
        }

        spawn_ringbuf_handler(&mut self.bpf, PROCESS_EVENTS_MAP, move |event: ProcessEvent| {
            monitor.notify_event(event)
        })
    }
}

fn bump_memlock_rlimit() -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to increase rlimit");
    }
    Ok(())
}
