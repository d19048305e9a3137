//! Binary inspection: where to place the uprobes of a Go binary and which
//! struct offsets the probes need.

pub mod elf;

use std::{collections::HashMap, path::Path, path::PathBuf};

use serde::Deserialize;
use thiserror::Error;

pub use elf::ElfAnalyzer;

use crate::probes::gotls::FunctionSpec;

#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error("could not open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} could not be parsed as an ELF file: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },

    #[error("{} has no symbol table", .0.display())]
    NoSymbols(PathBuf),

    #[error("{} does not contain {symbol}", path.display())]
    MissingFunction { path: PathBuf, symbol: &'static str },

    #[error("{}: unsupported architecture {arch}", path.display())]
    UnsupportedArch { path: PathBuf, arch: String },

    #[error("could not find return locations of {symbol}: {reason}")]
    Disassembly { symbol: &'static str, reason: String },
}

impl AnalyzeError {
    /// The binary cannot be instrumented no matter how often we retry.
    pub fn is_ineligible(&self) -> bool {
        !matches!(self, Self::Open { .. })
    }
}

/// File offsets of one instrumented function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionLocation {
    pub entry: u64,
    pub returns: Vec<u64>,
}

/// Field offsets from `*tls.Conn` down to the socket fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StructOffsets {
    pub tls_conn_inner_conn: u64,
    pub tcp_conn_inner_conn: u64,
    pub conn_fd: u64,
    pub net_fd_pfd: u64,
    pub fd_sysfd: u64,
}

impl Default for StructOffsets {
    // Layout of Go 1.17+ on 64-bit targets.
    fn default() -> Self {
        Self {
            tls_conn_inner_conn: 0,
            tcp_conn_inner_conn: 0,
            conn_fd: 0,
            net_fd_pfd: 0,
            fd_sysfd: 16,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InspectionResult {
    pub functions: HashMap<&'static str, FunctionLocation>,
    pub struct_offsets: StructOffsets,
}

pub trait BinaryAnalyzer: Send + Sync {
    /// Locates every function of `functions` in the binary at `path`.
    fn inspect(
        &self,
        path: &Path,
        functions: &[FunctionSpec],
    ) -> Result<InspectionResult, AnalyzeError>;
}
