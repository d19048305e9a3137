//! Uprobes on Go's `crypto/tls` package.

use std::{
    collections::HashMap,
    path::Path,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result, bail};
use aya::{
    Ebpf,
    maps::{HashMap as BpfHashMap, MapData},
    programs::{UProbe, uprobe::UProbeLinkId},
};
use log::{debug, info};
use tlshook_common::{TlsBinaryId, TlsOffsetsData};

use super::{HookHandle, HookInstaller, HookTarget, OffsetsTable};
use crate::analyzer::InspectionResult;
use crate::registry::BinaryId;

pub const OFFSETS_DATA_MAP: &str = "offsets_data";

pub const READ_GO_TLS_FUNC: &str = "crypto/tls.(*Conn).Read";
pub const WRITE_GO_TLS_FUNC: &str = "crypto/tls.(*Conn).Write";
pub const CLOSE_GO_TLS_FUNC: &str = "crypto/tls.(*Conn).Close";

/// How the uprobe program finds the arguments of the function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamLookup {
    Read,
    Write,
    Close,
}

/// A function to intercept and the programs attached to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionSpec {
    pub symbol: &'static str,
    pub entry_program: &'static str,
    /// Attached to every return instruction when set.
    pub return_program: Option<&'static str>,
    pub lookup: ParamLookup,
}

impl FunctionSpec {
    pub fn wants_return_offsets(&self) -> bool {
        self.return_program.is_some()
    }
}

pub static GO_TLS_FUNCTIONS: [FunctionSpec; 3] = [
    FunctionSpec {
        symbol: READ_GO_TLS_FUNC,
        entry_program: "uprobe__crypto_tls_Conn_Read",
        return_program: Some("uprobe__crypto_tls_Conn_Read__return"),
        lookup: ParamLookup::Read,
    },
    FunctionSpec {
        symbol: WRITE_GO_TLS_FUNC,
        entry_program: "uprobe__crypto_tls_Conn_Write",
        return_program: Some("uprobe__crypto_tls_Conn_Write__return"),
        lookup: ParamLookup::Write,
    },
    FunctionSpec {
        symbol: CLOSE_GO_TLS_FUNC,
        entry_program: "uprobe__crypto_tls_Conn_Close",
        return_program: None,
        lookup: ParamLookup::Close,
    },
];

/// Every program name referenced by `functions`.
pub fn programs(functions: &[FunctionSpec]) -> impl Iterator<Item = &'static str> + '_ {
    functions
        .iter()
        .flat_map(|f| std::iter::once(f.entry_program).chain(f.return_program))
}

/// Expands an inspection result into the hooks to install for binary `id`,
/// entry hook first, then one hook per return location.
pub fn hook_targets(
    functions: &[FunctionSpec],
    result: &InspectionResult,
    id: BinaryId,
) -> Result<Vec<HookTarget>> {
    let uid = id.uid();
    let mut targets = Vec::new();

    for spec in functions {
        let location = result
            .functions
            .get(spec.symbol)
            .with_context(|| format!("inspection result lacks {}", spec.symbol))?;

        targets.push(HookTarget {
            program: spec.entry_program,
            offset: location.entry,
            uid: uid.clone(),
        });

        match spec.return_program {
            Some(program) => {
                targets.extend(location.returns.iter().enumerate().map(|(i, &offset)| {
                    HookTarget {
                        program,
                        offset,
                        uid: format!("{}_{:x}", uid, i),
                    }
                }));
            }
            None if !location.returns.is_empty() => {
                bail!(
                    "{} has return locations but no return program",
                    spec.symbol
                );
            }
            None => {}
        }
    }

    Ok(targets)
}

/// Builds the per-binary blob read by the uprobe programs.
pub fn offsets_data(functions: &[FunctionSpec], result: &InspectionResult) -> TlsOffsetsData {
    let returns = |lookup: ParamLookup| {
        functions
            .iter()
            .filter(|f| f.lookup == lookup)
            .filter_map(|f| result.functions.get(f.symbol))
            .map(|location| location.returns.len() as u32)
            .sum::<u32>()
    };
    let offsets = &result.struct_offsets;

    TlsOffsetsData {
        tls_conn_inner_conn: offsets.tls_conn_inner_conn,
        tcp_conn_inner_conn: offsets.tcp_conn_inner_conn,
        conn_fd: offsets.conn_fd,
        net_fd_pfd: offsets.net_fd_pfd,
        fd_sysfd: offsets.fd_sysfd,
        read_return_count: returns(ParamLookup::Read),
        write_return_count: returns(ParamLookup::Write),
    }
}

/// Attaches uprobe programs of a loaded eBPF object.
pub struct AyaHookInstaller {
    bpf: Mutex<Ebpf>,
    links: Mutex<HashMap<u64, UProbeLinkId>>,
    next_id: AtomicU64,
}

impl AyaHookInstaller {
    /// Loads every program referenced by `functions` into the kernel.
    pub fn new(mut bpf: Ebpf, functions: &[FunctionSpec]) -> Result<Self> {
        for name in programs(functions) {
            info!("Loading program {}", name);
            let program: &mut UProbe = bpf
                .program_mut(name)
                .with_context(|| format!("Failed to find {} program", name))?
                .try_into()?;
            program
                .load()
                .with_context(|| format!("Failed to load {}", name))?;
        }

        Ok(Self {
            bpf: Mutex::new(bpf),
            links: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }
}

impl HookInstaller for AyaHookInstaller {
    fn install(&self, binary: &Path, target: &HookTarget) -> Result<HookHandle> {
        let mut bpf = self.bpf.lock().unwrap_or_else(|e| e.into_inner());
        let program: &mut UProbe = bpf
            .program_mut(target.program)
            .with_context(|| format!("Failed to find {} program", target.program))?
            .try_into()?;
        let link = program
            .attach(None, target.offset, binary, None)
            .with_context(|| {
                format!(
                    "Failed to attach {} to {} at {:#x}",
                    target.program,
                    binary.display(),
                    target.offset
                )
            })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, link);
        debug!(
            "Attached {} ({}) to {} at {:#x}",
            target.program,
            target.uid,
            binary.display(),
            target.offset
        );

        Ok(HookHandle {
            id,
            program: target.program,
            uid: target.uid.clone(),
        })
    }

    fn remove(&self, handle: &HookHandle) -> Result<()> {
        let mut bpf = self.bpf.lock().unwrap_or_else(|e| e.into_inner());
        let link = self
            .links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle.id)
            .with_context(|| format!("Unknown hook {} ({})", handle.id, handle.uid))?;

        let program: &mut UProbe = bpf
            .program_mut(handle.program)
            .with_context(|| format!("Failed to find {} program", handle.program))?
            .try_into()?;
        program
            .detach(link)
            .with_context(|| format!("Failed to detach {} ({})", handle.program, handle.uid))?;
        Ok(())
    }
}

/// The `offsets_data` map of the eBPF object.
pub struct AyaOffsetsTable {
    map: Mutex<BpfHashMap<MapData, TlsBinaryId, TlsOffsetsData>>,
}

impl AyaOffsetsTable {
    pub fn from_ebpf(bpf: &mut Ebpf) -> Result<Self> {
        let map = bpf
            .take_map(OFFSETS_DATA_MAP)
            .with_context(|| format!("could not get {} map", OFFSETS_DATA_MAP))?;
        Ok(Self {
            map: Mutex::new(BpfHashMap::try_from(map)?),
        })
    }
}

impl OffsetsTable for AyaOffsetsTable {
    fn put(&self, id: BinaryId, data: &TlsOffsetsData) -> Result<()> {
        let key = TlsBinaryId::from(id);
        self.map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, *data, 0)
            .with_context(|| format!("could not write inspection result for {}", id))
    }

    fn delete(&self, id: BinaryId) -> Result<()> {
        let key = TlsBinaryId::from(id);
        self.map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key)
            .with_context(|| format!("could not remove inspection result for {}", id))
    }
}
