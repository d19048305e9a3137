use std::{collections::HashMap, path::Path};

use capstone::{Capstone, arch, prelude::*};
use log::debug;
use object::{Architecture, BinaryFormat, Object, ObjectSegment, ObjectSymbol, ObjectSymbolTable};

use super::{AnalyzeError, BinaryAnalyzer, FunctionLocation, InspectionResult, StructOffsets};
use crate::probes::gotls::FunctionSpec;

const AARCH64_RET: u32 = 0xd65f_03c0;

/// Finds the Go TLS functions through the ELF symbol table.
#[derive(Debug, Clone, Default)]
pub struct ElfAnalyzer {
    struct_offsets: StructOffsets,
}

impl ElfAnalyzer {
    pub fn new(struct_offsets: StructOffsets) -> Self {
        Self { struct_offsets }
    }
}

impl BinaryAnalyzer for ElfAnalyzer {
    fn inspect(
        &self,
        path: &Path,
        functions: &[FunctionSpec],
    ) -> Result<InspectionResult, AnalyzeError> {
        let data = std::fs::read(path).map_err(|source| AnalyzeError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let parse_error = |reason: String| AnalyzeError::Parse {
            path: path.to_path_buf(),
            reason,
        };

        let file = object::File::parse(&*data).map_err(|e| parse_error(e.to_string()))?;
        if file.format() != BinaryFormat::Elf {
            return Err(parse_error(format!("unexpected format {:?}", file.format())));
        }

        let Some(symtab) = file.symbol_table() else {
            return Err(AnalyzeError::NoSymbols(path.to_path_buf()));
        };

        let mut symbols: HashMap<&str, (u64, u64)> = HashMap::new();
        for symbol in symtab.symbols() {
            if let Ok(name) = symbol.name()
                && functions.iter().any(|f| f.symbol == name)
            {
                symbols.insert(name, (symbol.address(), symbol.size()));
            }
        }

        let mut result = InspectionResult {
            functions: HashMap::with_capacity(functions.len()),
            struct_offsets: self.struct_offsets,
        };

        for spec in functions {
            let &(address, size) =
                symbols
                    .get(spec.symbol)
                    .ok_or_else(|| AnalyzeError::MissingFunction {
                        path: path.to_path_buf(),
                        symbol: spec.symbol,
                    })?;
            let entry = file_offset(&file, address).ok_or_else(|| {
                parse_error(format!("{} is outside every loadable segment", spec.symbol))
            })?;

            let returns = if spec.wants_return_offsets() {
                let code = usize::try_from(entry)
                    .ok()
                    .zip(usize::try_from(size).ok())
                    .and_then(|(start, len)| data.get(start..start.checked_add(len)?))
                    .ok_or_else(|| parse_error(format!("{} has an invalid size", spec.symbol)))?;
                return_offsets(file.architecture(), code, entry).map_err(|e| match e {
                    ReturnScanError::UnsupportedArch(name) => AnalyzeError::UnsupportedArch {
                        path: path.to_path_buf(),
                        arch: name,
                    },
                    ReturnScanError::Disassembly(reason) => AnalyzeError::Disassembly {
                        symbol: spec.symbol,
                        reason,
                    },
                })?
            } else {
                Vec::new()
            };

            debug!(
                "{}: {} at {:#x} with {} return locations",
                path.display(),
                spec.symbol,
                entry,
                returns.len()
            );
            result
                .functions
                .insert(spec.symbol, FunctionLocation { entry, returns });
        }

        Ok(result)
    }
}

/// Translates a virtual address into an offset in the file, which is what
/// uprobes are attached by.
fn file_offset(file: &object::File, address: u64) -> Option<u64> {
    file.segments().find_map(|segment| {
        let start = segment.address();
        let (offset, size) = segment.file_range();
        (address >= start && address < start + size).then(|| address - start + offset)
    })
}

#[derive(Debug)]
enum ReturnScanError {
    UnsupportedArch(String),
    Disassembly(String),
}

/// Offsets of every return instruction in `code`, which starts at file
/// offset `base`.
fn return_offsets(
    architecture: Architecture,
    code: &[u8],
    base: u64,
) -> Result<Vec<u64>, ReturnScanError> {
    match architecture {
        Architecture::X86_64 => {
            let cs = Capstone::new()
                .x86()
                .mode(arch::x86::ArchMode::Mode64)
                .build()
                .map_err(|e| ReturnScanError::Disassembly(format!("capstone init failed: {e}")))?;
            let insns = cs
                .disasm_all(code, base)
                .map_err(|e| ReturnScanError::Disassembly(e.to_string()))?;
            Ok(insns
                .iter()
                .filter(|insn| matches!(insn.mnemonic(), Some("ret" | "retq")))
                .map(|insn| insn.address())
                .collect())
        }
        // Fixed-width encoding, no need for a disassembler.
        Architecture::Aarch64 => Ok(code
            .chunks_exact(4)
            .enumerate()
            .filter(|(_, word)| u32::from_le_bytes([word[0], word[1], word[2], word[3]]) == AARCH64_RET)
            .map(|(i, _)| base + 4 * i as u64)
            .collect()),
        other => Err(ReturnScanError::UnsupportedArch(format!("{other:?}"))),
    }
}
