//! In-memory collaborators for exercising the coordinator without a kernel.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, bail};
use tlshook_common::TlsOffsetsData;

use crate::analyzer::{AnalyzeError, BinaryAnalyzer, FunctionLocation, InspectionResult};
use crate::probes::gotls::FunctionSpec;
use crate::probes::{HookHandle, HookInstaller, HookTarget, OffsetsTable};
use crate::process::ProcessSource;
use crate::registry::BinaryId;

/// Hooks installed per binary with [`FakeAnalyzer`] and the full function
/// table: Read entry + 2 returns, Write entry + 1 return, Close entry.
pub const HOOKS_PER_BINARY: usize = 6;

#[derive(Default)]
pub struct FakeAnalyzer {
    calls: AtomicUsize,
    stripped: Mutex<HashSet<PathBuf>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeAnalyzer {
    /// Analyses of `path` fail with [`AnalyzeError::NoSymbols`].
    pub fn strip(&self, path: &Path) {
        self.stripped.lock().unwrap().insert(path.to_path_buf());
    }

    pub fn unstrip(&self, path: &Path) {
        self.stripped.lock().unwrap().remove(path);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl BinaryAnalyzer for FakeAnalyzer {
    fn inspect(
        &self,
        path: &Path,
        functions: &[FunctionSpec],
    ) -> Result<InspectionResult, AnalyzeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.stripped.lock().unwrap().contains(path) {
            return Err(AnalyzeError::NoSymbols(path.to_path_buf()));
        }

        let functions = functions
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let entry = 0x1000 * (i as u64 + 1);
                let returns = match (spec.wants_return_offsets(), i) {
                    (false, _) => vec![],
                    (true, 0) => vec![entry + 0x40, entry + 0x80],
                    (true, _) => vec![entry + 0x40],
                };
                (spec.symbol, FunctionLocation { entry, returns })
            })
            .collect();

        Ok(InspectionResult {
            functions,
            struct_offsets: Default::default(),
        })
    }
}

#[derive(Default)]
pub struct FakeInstaller {
    next_id: AtomicU64,
    attempts: AtomicUsize,
    installed: Mutex<HashMap<u64, (PathBuf, HookTarget)>>,
    fail_on_attempt: Mutex<Option<usize>>,
    fail_removals: Mutex<bool>,
    removed: AtomicUsize,
}

impl FakeInstaller {
    /// The `n`th install attempt from now on fails (1-based).
    pub fn fail_on_attempt(&self, n: usize) {
        let base = self.attempts.load(Ordering::SeqCst);
        *self.fail_on_attempt.lock().unwrap() = Some(base + n);
    }

    pub fn fail_removals(&self, fail: bool) {
        *self.fail_removals.lock().unwrap() = fail;
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn installed_count(&self) -> usize {
        self.installed.lock().unwrap().len()
    }

    /// Hooks currently installed on `binary`.
    pub fn installed_on(&self, binary: &Path) -> usize {
        self.installed
            .lock()
            .unwrap()
            .values()
            .filter(|(path, _)| path == binary)
            .count()
    }
}

impl HookInstaller for FakeInstaller {
    fn install(&self, binary: &Path, target: &HookTarget) -> Result<HookHandle> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.fail_on_attempt.lock().unwrap() == Some(attempt) {
            bail!("cannot attach {} at {:#x}", target.program, target.offset);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.installed
            .lock()
            .unwrap()
            .insert(id, (binary.to_path_buf(), target.clone()));
        Ok(HookHandle {
            id,
            program: target.program,
            uid: target.uid.clone(),
        })
    }

    fn remove(&self, handle: &HookHandle) -> Result<()> {
        let removed = self.installed.lock().unwrap().remove(&handle.id);
        if removed.is_none() {
            bail!("unknown hook {}", handle.id);
        }
        self.removed.fetch_add(1, Ordering::SeqCst);
        if *self.fail_removals.lock().unwrap() {
            bail!("detach of {} reported an error", handle.uid);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeOffsetsTable {
    entries: Mutex<HashMap<BinaryId, TlsOffsetsData>>,
}

impl FakeOffsetsTable {
    pub fn contains(&self, id: BinaryId) -> bool {
        self.entries.lock().unwrap().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl OffsetsTable for FakeOffsetsTable {
    fn put(&self, id: BinaryId, data: &TlsOffsetsData) -> Result<()> {
        self.entries.lock().unwrap().insert(id, *data);
        Ok(())
    }

    fn delete(&self, id: BinaryId) -> Result<()> {
        match self.entries.lock().unwrap().remove(&id) {
            Some(_) => Ok(()),
            None => bail!("no entry for {}", id),
        }
    }
}

/// Processes backed by files in a temporary directory. Host paths are the
/// executable paths themselves.
pub struct FakeProcesses {
    dir: tempfile::TempDir,
    live: Mutex<HashMap<u32, PathBuf>>,
    listing_fails: Mutex<bool>,
}

impl FakeProcesses {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            live: Mutex::new(HashMap::new()),
            listing_fails: Mutex::new(false),
        }
    }

    /// Creates a distinct executable file named `name`.
    pub fn binary(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, name.as_bytes()).unwrap();
        path
    }

    pub fn spawn(&self, pid: u32, exe: &Path) {
        self.live.lock().unwrap().insert(pid, exe.to_path_buf());
    }

    /// The process disappears without anyone being told.
    pub fn kill(&self, pid: u32) {
        self.live.lock().unwrap().remove(&pid);
    }

    pub fn fail_listing(&self, fail: bool) {
        *self.listing_fails.lock().unwrap() = fail;
    }
}

impl ProcessSource for FakeProcesses {
    fn live_pids(&self) -> Result<Vec<u32>> {
        if *self.listing_fails.lock().unwrap() {
            bail!("proc is not mounted");
        }
        let mut pids: Vec<u32> = self.live.lock().unwrap().keys().copied().collect();
        pids.sort_unstable();
        Ok(pids)
    }

    fn exe_path(&self, pid: u32) -> Result<PathBuf> {
        match self.live.lock().unwrap().get(&pid) {
            Some(path) => Ok(path.clone()),
            None => bail!("process {} not found", pid),
        }
    }

    fn host_path(&self, _pid: u32, exe: &Path) -> PathBuf {
        exe.to_path_buf()
    }
}
