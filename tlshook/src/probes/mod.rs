use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use aya::{Ebpf, maps::RingBuf, programs::TracePoint};
use log::{info, warn};
use tlshook_common::TlsOffsetsData;

use crate::registry::BinaryId;

pub mod gotls;

static SHUTDOWN: once_cell::sync::Lazy<Arc<AtomicBool>> =
    once_cell::sync::Lazy::new(|| Arc::new(AtomicBool::new(false)));

pub fn shutdown_flag() -> Arc<AtomicBool> {
    SHUTDOWN.clone()
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

/// A single uprobe to place: which program, at which file offset, under
/// which unique id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookTarget {
    pub program: &'static str,
    pub offset: u64,
    pub uid: String,
}

/// Opaque handle of an installed hook, used to remove it later.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HookHandle {
    pub id: u64,
    pub program: &'static str,
    pub uid: String,
}

/// Installs and removes individual uprobes.
pub trait HookInstaller: Send + Sync {
    fn install(&self, binary: &Path, target: &HookTarget) -> Result<HookHandle>;
    fn remove(&self, handle: &HookHandle) -> Result<()>;
}

/// Per-binary data shared with the uprobe programs, keyed by binary identity.
pub trait OffsetsTable: Send + Sync {
    fn put(&self, id: BinaryId, data: &TlsOffsetsData) -> Result<()>;
    fn delete(&self, id: BinaryId) -> Result<()>;
}

pub struct TracepointConfig<'a> {
    pub program_name: &'a str,
    pub category: &'a str,
    pub name: &'a str,
}

pub const POLL_INTERVAL_MS: u64 = 10;

fn tracepoint_exists(category: &str, name: &str) -> bool {
    const TRACEFS_MOUNT_POINTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

    TRACEFS_MOUNT_POINTS.iter().any(|base| {
        Path::new(base)
            .join("events")
            .join(category)
            .join(name)
            .exists()
    })
}

pub fn attach_tracepoint(bpf: &mut Ebpf, config: TracepointConfig) -> Result<bool> {
    if !tracepoint_exists(config.category, config.name) {
        warn!(
            "Tracepoint {}:{} not available; skipping {}",
            config.category, config.name, config.program_name
        );
        return Ok(false);
    }

    info!("Loading program {}", config.program_name);
    let program: &mut TracePoint = bpf
        .program_mut(config.program_name)
        .with_context(|| format!("Failed to find {} program", config.program_name))?
        .try_into()?;
    program.load()?;
    program
        .attach(config.category, config.name)
        .with_context(|| format!("Failed to attach {}", config.name))?;
    Ok(true)
}

pub fn spawn_ringbuf_handler<T, F>(bpf: &mut Ebpf, map_name: &str, handler: F) -> Result<()>
where
    T: Copy + Send + 'static,
    F: Fn(T) + Send + 'static,
{
    let mut ring_buf = RingBuf::try_from(
        bpf.take_map(map_name)
            .with_context(|| format!("Failed to get {} map", map_name))?,
    )?;
    let shutdown = shutdown_flag();

    tokio::task::spawn_blocking(move || {
        while !shutdown.load(Ordering::Relaxed) {
            let mut has_work = false;
            while let Some(item) = ring_buf.next() {
                has_work = true;
                if item.len() >= std::mem::size_of::<T>() {
                    let event = unsafe { (item.as_ptr() as *const T).read_unaligned() };
                    handler(event);
                }
            }
            if !has_work {
                std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
            }
        }
    });
    Ok(())
}
