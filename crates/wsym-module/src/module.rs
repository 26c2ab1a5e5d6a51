//! The `Module` type: spec.md §4.4's five queries, backed by
//! [`crate::dwarf_info::DwarfInfo`] and a `wasmparser`-located code-section
//! base offset.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::dwarf_info::{self, DwarfInfo};
use crate::types::{
    CompilerType, MemoryLocation, RawLocation, Scope, SourceLocation, SourceScript, VariableInternal,
    VariableSummary, WasmAddressSpace,
};

pub struct Module {
    pub bytes: Vec<u8>,
    pub code_section_base: u32,
    pub dwarf: DwarfInfo,
}

impl Module {
    pub fn parse(bytes: Vec<u8>) -> Result<Self> {
        let code_section_base = dwarf_info::code_section_base(&bytes)?;
        let dwarf = parse_dwarf(&bytes)?;
        Ok(Module {
            bytes,
            code_section_base,
            dwarf,
        })
    }

    /// All (directory, filename) pairs named by the line program, in first-
    /// seen order, skipping empty filenames — spec.md §4.4.
    pub fn source_scripts(&self) -> Vec<SourceScript> {
        self.dwarf.source_scripts()
    }

    /// The most specific source location known for a code-section-relative
    /// raw offset, or `None` if the offset precedes the first row or maps
    /// to a synthetic (line==0 or column==0) row. The line table indexes
    /// absolute addresses, so `offset` is shifted by the code section's
    /// base file offset before the lookup (spec.md §8 scenario 2).
    pub fn source_location_from_offset(&self, offset: u32) -> Option<SourceLocation> {
        let address = offset as u64 + self.code_section_base as u64;
        let row = self.dwarf.row_at_or_before(address)?;
        Some(SourceLocation {
            file: row.file.clone(),
            line: row.line,
            column: row.column,
        })
    }

    /// All raw offsets whose line program row has `line == source.line`.
    /// Column is intentionally not compared, matching the original's
    /// `getOffsetFromSourceLocation` (see spec.md §9). Line-program
    /// addresses are absolute; subtracting the code section's base file
    /// offset turns them back into the code-section-relative offsets the
    /// wire format uses.
    pub fn offset_from_source_location(&self, source: &SourceLocation) -> Vec<u32> {
        let mut offsets: Vec<u32> = self
            .dwarf
            .rows_matching_line(source.line)
            .map(|r| (r.address - self.code_section_base as u64) as u32)
            .collect();
        offsets.sort_unstable();
        offsets.dedup();
        offsets
    }

    /// Parameters and locals of the function containing `offset`, plus —
    /// unconditionally — every CU-level global (the preserved ".*" quirk
    /// from spec.md §9).
    pub fn variables_in_scope(&self, offset: u32) -> Vec<VariableSummary> {
        let address = offset as u64 + self.code_section_base as u64;
        let mut out = Vec::new();
        if let Some(sub) = self.dwarf.subprogram_containing(address) {
            for var in sub.variables_at(address) {
                let type_name = var
                    .type_offset
                    .and_then(|o| self.dwarf.resolve_type(o))
                    .map(type_display_name)
                    .unwrap_or_else(|| "int".to_string());
                out.push(VariableSummary {
                    name: var.name.clone(),
                    scope: if var.is_parameter { Scope::Parameter } else { Scope::Local },
                    type_name,
                });
            }
        }
        for global in &self.dwarf.globals {
            let type_name = global
                .type_offset
                .and_then(|o| self.dwarf.resolve_type(o))
                .map(type_display_name)
                .unwrap_or_else(|| "int".to_string());
            out.push(VariableSummary {
                name: global.name.clone(),
                scope: Scope::Global,
                type_name,
            });
        }
        out
    }

    /// Resolves a variable name visible at `offset` into everything the
    /// printer needs to compile and format it.
    pub fn variable_format_script(&self, offset: u32, name: &str) -> Option<VariableInternal> {
        let address = offset as u64 + self.code_section_base as u64;
        let sub = self.dwarf.subprogram_containing(address);
        if let Some(sub) = sub {
            if let Some(var) = sub.variables_at(address).into_iter().find(|v| v.name == name) {
                return Some(VariableInternal {
                    name: var.name.clone(),
                    scope: if var.is_parameter { Scope::Parameter } else { Scope::Local },
                    ty: var
                        .type_offset
                        .and_then(|o| self.dwarf.resolve_type(o))
                        .cloned()
                        .unwrap_or(CompilerType::Scalar { name: "int".into(), size_bytes: 4 }),
                    location: MemoryLocation {
                        address_space: WasmAddressSpace::Memory,
                        expression: var.location.clone().unwrap_or_default(),
                    },
                    frame_base: sub.frame_base.clone(),
                });
            }
        }
        self.dwarf.globals.iter().find(|g| g.name == name).map(|global| VariableInternal {
            name: global.name.clone(),
            scope: Scope::Global,
            ty: global
                .type_offset
                .and_then(|o| self.dwarf.resolve_type(o))
                .cloned()
                .unwrap_or(CompilerType::Scalar { name: "int".into(), size_bytes: 4 }),
            location: MemoryLocation {
                address_space: WasmAddressSpace::Memory,
                expression: global.location.clone().unwrap_or_default(),
            },
            frame_base: None,
        })
    }

    pub fn raw_location(&self, module: crate::types::ModuleId, offset: u32) -> RawLocation {
        RawLocation { module, offset }
    }
}

fn type_display_name(ty: &CompilerType) -> String {
    match ty {
        CompilerType::Scalar { name, .. } => name.clone(),
        CompilerType::Pointer { name } => name.clone(),
        CompilerType::Array { element, .. } => format!("{}[]", type_display_name(element)),
        CompilerType::Aggregate { name, .. } => name.clone(),
    }
}

fn parse_dwarf(wasm: &[u8]) -> Result<DwarfInfo> {
    let sections = wasm_dwarf_sections(wasm)?;
    DwarfInfo::parse(|id| sections.get(section_name(id)).cloned().unwrap_or_default())
}

fn section_name(id: gimli::SectionId) -> &'static str {
    id.name()
}

/// Pulls the named `.debug_*` custom sections out of a `.wasm` module.
/// DWARF for WebAssembly lives in custom sections named after the section
/// they'd occupy in an ELF object (`.debug_info`, `.debug_line`, ...).
fn wasm_dwarf_sections(wasm: &[u8]) -> Result<std::collections::HashMap<&'static str, Vec<u8>>> {
    let mut out = std::collections::HashMap::new();
    for payload in wasmparser::Parser::new(0).parse_all(wasm) {
        if let wasmparser::Payload::CustomSection(reader) = payload.context("parsing wasm module")? {
            if let Some(name) = KNOWN_SECTIONS.iter().find(|n| **n == reader.name()) {
                out.insert(*name, reader.data().to_vec());
            }
        }
    }
    Ok(out)
}

const KNOWN_SECTIONS: &[&str] = &[
    ".debug_abbrev",
    ".debug_info",
    ".debug_line",
    ".debug_line_str",
    ".debug_str",
    ".debug_str_offsets",
    ".debug_addr",
    ".debug_ranges",
    ".debug_rnglists",
    ".debug_loc",
    ".debug_loclists",
];

/// Resolves a module's search-path-relative file reference the way
/// `ModuleCache::resolveLocalModuleFile` does: absolute paths are tried
/// as-is, then relative to each search path by basename; relative paths
/// are tried under each search path directly.
pub fn resolve_local_module_file(path: &Path, search_paths: &[PathBuf]) -> Option<PathBuf> {
    if path.is_absolute() {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        let basename = path.file_name()?;
        for base in search_paths {
            let candidate = base.join(basename);
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    } else {
        for base in search_paths {
            let candidate = base.join(path);
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }
}
