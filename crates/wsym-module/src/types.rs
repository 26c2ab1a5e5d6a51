//! Data model shared by `Module`, `ModuleCache`, and the variable printer —
//! spec.md §3, carried over unchanged in meaning.

use std::path::PathBuf;

/// Opaque handle a caller uses to refer to a loaded module across RPC
/// calls. Stable for the lifetime of the cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u64);

/// A source location as the RPC layer presents it: 0-based line/column on
/// the wire, converted to/from DWARF's 1-based line program rows exactly
/// once at the RPC boundary (see `wsym-rpc`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

/// An offset into a module's code section, relative to that section's base
/// file offset (not relative to the start of the `.wasm` file).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawLocation {
    pub module: ModuleId,
    pub offset: u32,
}

/// Where in the DWARF variable taxonomy a name was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Local,
    Parameter,
    Global,
}

/// What `listVariablesInScope` hands back for each visible name: enough to
/// label it, not enough to read it (that needs `VariableInternal`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableSummary {
    pub name: String,
    pub scope: Scope,
    pub type_name: String,
}

/// The Wasm-specific address space a `MemoryLocation` resolves into, per
/// the vendor `DW_OP_WASM_location` extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WasmAddressSpace {
    Memory,
    Local,
    Global,
}

/// A variable's location, not yet compiled: the raw DWARF expression bytes
/// plus which address space they resolve into.
#[derive(Debug, Clone)]
pub struct MemoryLocation {
    pub address_space: WasmAddressSpace,
    pub expression: Vec<u8>,
}

/// One field of an `Aggregate` compiler type, in declaration order.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub ty: CompilerType,
    pub offset_bytes: u32,
}

/// Stands in for the original's LLDB `CompilerType` handle (§3): a
/// minimal, self-contained type description resolved once per
/// compilation unit from `DW_AT_type` reference chains and memoized by
/// DIE offset (see `wsym-module::dwarf_info`).
#[derive(Debug, Clone)]
pub enum CompilerType {
    /// A formatter-backed primitive (`int64_t`, `int32_t`, `int`, `int8_t`,
    /// `const char *`, ...), named the way `PrimitiveFormatters` keys it.
    Scalar { name: String, size_bytes: u32 },
    Pointer { name: String },
    /// `complete: false` when the array's upper bound is unknown (DWARF
    /// omits `DW_AT_count`/`DW_AT_upper_bound`) — formatting such a type is
    /// a compile-time (not a Wasm runtime) failure, per spec.md §4.2.
    Array {
        element: Box<CompilerType>,
        count: Option<u64>,
        complete: bool,
    },
    Aggregate { name: String, fields: Vec<Field> },
}

impl CompilerType {
    pub fn size_bytes(&self) -> Option<u32> {
        match self {
            CompilerType::Scalar { size_bytes, .. } => Some(*size_bytes),
            CompilerType::Pointer { .. } => Some(4),
            CompilerType::Array { element, count, complete } => {
                if !complete {
                    return None;
                }
                Some(element.size_bytes()? as u32 * (*count)? as u32)
            }
            CompilerType::Aggregate { fields, .. } => {
                fields.last().map(|f| f.offset_bytes + f.ty.size_bytes().unwrap_or(0))
            }
        }
    }
}

/// Everything the variable printer needs to compile and format one
/// variable: its type, its (uncompiled) location, and — for `fbreg` — the
/// raw frame-base expression of the function it lives in.
#[derive(Debug, Clone)]
pub struct VariableInternal {
    pub name: String,
    pub scope: Scope,
    pub ty: CompilerType,
    pub location: MemoryLocation,
    pub frame_base: Option<Vec<u8>>,
}

/// One entry of `source_scripts`: a de-duplicated (directory, filename)
/// pair, skipping DWARF entries with an empty filename (spec.md §4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceScript {
    pub directory: Option<PathBuf>,
    pub filename: String,
}
