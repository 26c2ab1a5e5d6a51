//! Gimli-backed DWARF line-table and DIE-tree access.
//!
//! The sorted-rows-plus-binary-search line lookup follows the same shape as
//! `mavity-webgl2`'s `distill_wasm` tool's hand-rolled `DwarfLookup`: gimli
//! gives us a line-program row iterator, not a lookup structure, so we
//! materialize the rows once per module and search over them ourselves.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use gimli::{EndianSlice, RunTimeEndian};

use crate::types::{CompilerType, Field, SourceScript};

type Reader<'a> = EndianSlice<'a, RunTimeEndian>;
type Dwarf<'a> = gimli::Dwarf<Reader<'a>>;
type Unit<'a> = gimli::Unit<Reader<'a>>;

/// One row of a compilation unit's line program, flattened and sorted by
/// code address for binary search in both directions.
#[derive(Debug, Clone)]
pub struct LineRow {
    pub address: u64,
    pub file: String,
    pub directory: Option<PathBuf>,
    pub line: u32,
    pub column: u32,
}

/// A formal parameter or local/block-scoped variable found under a
/// `DW_TAG_subprogram`.
#[derive(Debug, Clone)]
pub struct RawVariable {
    pub name: String,
    pub is_parameter: bool,
    pub type_offset: Option<usize>,
    pub location: Option<Vec<u8>>,
}

/// One `DW_TAG_subprogram`: enough to resolve `fbreg` and to list
/// parameters/locals in scope at a given address. `variables` holds only
/// the ones declared directly under the subprogram (not inside any
/// `DW_TAG_lexical_block`); nested blocks live in `blocks` so scope
/// queries can resolve the specific block containing an address instead
/// of flattening every block's locals together.
#[derive(Debug, Clone)]
pub struct Subprogram {
    pub name: String,
    pub low_pc: u64,
    pub high_pc: u64,
    pub frame_base: Option<Vec<u8>>,
    pub variables: Vec<RawVariable>,
    pub blocks: Vec<LexicalBlock>,
}

impl Subprogram {
    /// Parameters/locals visible at `address`: the subprogram's own
    /// directly-declared variables, plus the contents of every lexical
    /// block on the path down to the innermost block actually containing
    /// `address`. A sibling block that doesn't contain `address` (e.g. the
    /// other arm of an `if`/`else`) contributes nothing.
    pub fn variables_at(&self, address: u64) -> Vec<&RawVariable> {
        let mut out: Vec<&RawVariable> = self.variables.iter().collect();
        collect_block_variables(&self.blocks, address, &mut out);
        out
    }
}

/// One `DW_TAG_lexical_block`. Blocks with no `DW_AT_low_pc`/`DW_AT_high_pc`
/// (e.g. using `DW_AT_ranges` instead, which this parser doesn't read)
/// carry `low_pc == high_pc == 0` and so never match any address — their
/// variables are excluded rather than wrongly treated as always in scope.
#[derive(Debug, Clone)]
pub struct LexicalBlock {
    pub low_pc: u64,
    pub high_pc: u64,
    pub variables: Vec<RawVariable>,
    pub blocks: Vec<LexicalBlock>,
}

impl LexicalBlock {
    fn contains(&self, address: u64) -> bool {
        self.low_pc < self.high_pc && address >= self.low_pc && address < self.high_pc
    }
}

fn collect_block_variables<'a>(blocks: &'a [LexicalBlock], address: u64, out: &mut Vec<&'a RawVariable>) {
    for block in blocks {
        if block.contains(address) {
            out.extend(block.variables.iter());
            collect_block_variables(&block.blocks, address, out);
        }
    }
}

/// A CU-level (`DW_TAG_variable` directly under `DW_TAG_compile_unit`)
/// global, used by `variables_in_scope`'s "append every global" pass.
#[derive(Debug, Clone)]
pub struct GlobalVariable {
    pub name: String,
    pub type_offset: Option<usize>,
    pub location: Option<Vec<u8>>,
}

pub struct DwarfInfo {
    pub rows: Vec<LineRow>,
    pub subprograms: Vec<Subprogram>,
    pub globals: Vec<GlobalVariable>,
    type_cache: HashMap<usize, CompilerType>,
}

impl DwarfInfo {
    /// Parses every compilation unit's line program and variable/type DIEs
    /// out of a `.debug_*` section bundle. `section` returns the raw bytes
    /// of a DWARF section by id, or an empty slice if the module has none.
    pub fn parse<F>(section: F) -> Result<Self>
    where
        F: Fn(gimli::SectionId) -> Vec<u8>,
    {
        let owned = gimli::DwarfSections::load(|id| -> Result<Vec<u8>, gimli::Error> { Ok(section(id)) })
            .context("loading DWARF sections")?;
        let dwarf: Dwarf = owned.borrow(|section| EndianSlice::new(section, RunTimeEndian::Little));

        let mut rows = Vec::new();
        let mut subprograms = Vec::new();
        let mut globals = Vec::new();
        let mut type_cache = HashMap::new();

        let mut unit_headers = dwarf.units();
        while let Some(header) = unit_headers.next().context("reading unit header")? {
            let unit = dwarf.unit(header).context("reading unit")?;
            collect_line_rows(&dwarf, &unit, &mut rows)?;
            collect_entries(&dwarf, &unit, &mut subprograms, &mut globals, &mut type_cache)?;
        }

        rows.sort_by_key(|r| r.address);

        Ok(DwarfInfo {
            rows,
            subprograms,
            globals,
            type_cache,
        })
    }

    pub fn resolve_type(&self, offset: usize) -> Option<&CompilerType> {
        self.type_cache.get(&offset)
    }

    pub fn subprogram_containing(&self, address: u64) -> Option<&Subprogram> {
        self.subprograms
            .iter()
            .find(|f| address >= f.low_pc && address < f.high_pc)
    }

    /// Implements `source_location_from_offset`: the row with the greatest
    /// address not exceeding `offset`, per spec.md §4.4's "line>0 &&
    /// column>0" filter.
    pub fn row_at_or_before(&self, address: u64) -> Option<&LineRow> {
        let idx = match self.rows.binary_search_by_key(&address, |r| r.address) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        self.rows[idx..]
            .iter()
            .take_while(|r| r.address == self.rows[idx].address)
            .chain(std::iter::once(&self.rows[idx]))
            .find(|r| r.line > 0 && r.column > 0)
            .or_else(|| {
                let row = &self.rows[idx];
                (row.line > 0 && row.column > 0).then_some(row)
            })
    }

    /// All rows whose `line` matches `line` (column is deliberately not
    /// compared — see the preserved quirk noted in spec.md §9).
    pub fn rows_matching_line(&self, line: u32) -> impl Iterator<Item = &LineRow> {
        self.rows.iter().filter(move |r| r.line == line)
    }

    pub fn source_scripts(&self) -> Vec<SourceScript> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for row in &self.rows {
            if row.file.is_empty() {
                continue;
            }
            let key = (row.directory.clone(), row.file.clone());
            if seen.insert(key) {
                out.push(SourceScript {
                    directory: row.directory.clone(),
                    filename: row.file.clone(),
                });
            }
        }
        out
    }
}

fn collect_line_rows(dwarf: &Dwarf, unit: &Unit, out: &mut Vec<LineRow>) -> Result<()> {
    let Some(program) = unit.line_program.clone() else {
        return Ok(());
    };
    let mut rows = program.rows();
    while let Some((header, row)) = rows.next_row().context("reading line row")? {
        let file = row
            .file(header)
            .and_then(|f| dwarf.attr_string(unit, f.path_name()).ok())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let directory = row
            .file(header)
            .and_then(|f| f.directory(header))
            .and_then(|d| dwarf.attr_string(unit, d).ok())
            .map(|s| PathBuf::from(s.to_string_lossy().into_owned()));
        let line = row.line().map(|l| l.get() as u32).unwrap_or(0);
        let column = match row.column() {
            gimli::ColumnType::LeftEdge => 0,
            gimli::ColumnType::Column(c) => c.get() as u32,
        };
        out.push(LineRow {
            address: row.address(),
            file,
            directory,
            line,
            column,
        });
    }
    Ok(())
}

fn collect_entries(
    dwarf: &Dwarf,
    unit: &Unit,
    subprograms: &mut Vec<Subprogram>,
    globals: &mut Vec<GlobalVariable>,
    type_cache: &mut HashMap<usize, CompilerType>,
) -> Result<()> {
    let mut tree = unit.entries_tree(None).context("building entries tree")?;
    let root = tree.root().context("reading CU root")?;
    walk_cu(dwarf, unit, root, subprograms, globals)?;

    // Resolve every type DIE we saw referenced, memoized by offset.
    let offsets: Vec<usize> = {
        let mut offsets = Vec::new();
        for sub in subprograms.iter() {
            offsets.extend(subprogram_type_offsets(sub));
        }
        offsets.extend(globals.iter().filter_map(|g| g.type_offset));
        offsets
    };
    for offset in offsets {
        resolve_type_at(dwarf, unit, offset, type_cache)?;
    }
    Ok(())
}

fn walk_cu(
    dwarf: &Dwarf,
    unit: &Unit,
    node: gimli::EntriesTreeNode<Reader>,
    subprograms: &mut Vec<Subprogram>,
    globals: &mut Vec<GlobalVariable>,
) -> Result<()> {
    let mut children = node.children();
    while let Some(child) = children.next().context("walking CU children")? {
        let entry = child.entry();
        match entry.tag() {
            gimli::DW_TAG_subprogram => {
                subprograms.push(read_subprogram(dwarf, unit, child)?);
            }
            gimli::DW_TAG_variable => {
                globals.push(GlobalVariable {
                    name: die_name(dwarf, unit, entry)?.unwrap_or_default(),
                    type_offset: die_type_offset(entry),
                    location: die_location(entry)?,
                });
            }
            _ => {
                walk_cu(dwarf, unit, child, subprograms, globals)?;
            }
        }
    }
    Ok(())
}

fn read_subprogram(dwarf: &Dwarf, unit: &Unit, node: gimli::EntriesTreeNode<Reader>) -> Result<Subprogram> {
    let entry = node.entry();
    let name = die_name(dwarf, unit, entry)?.unwrap_or_default();
    let low_pc = entry
        .attr_value(gimli::DW_AT_low_pc)?
        .and_then(|v| v.udata_value())
        .unwrap_or(0);
    let high_pc_attr = entry.attr_value(gimli::DW_AT_high_pc)?;
    let high_pc = match high_pc_attr {
        Some(gimli::AttributeValue::Udata(n)) => low_pc + n,
        Some(v) => v.udata_value().unwrap_or(low_pc),
        None => low_pc,
    };
    let frame_base = entry
        .attr_value(gimli::DW_AT_frame_base)?
        .and_then(|v| match v {
            gimli::AttributeValue::Exprloc(expr) => Some(expr.0.to_slice().ok()?.to_vec()),
            _ => None,
        });

    let (variables, blocks) = collect_scope(dwarf, unit, node)?;

    Ok(Subprogram {
        name,
        low_pc,
        high_pc,
        frame_base,
        variables,
        blocks,
    })
}

/// Collects the variables and nested lexical blocks declared directly
/// under `node` (a subprogram or lexical block), recursing into each
/// nested block so its own range and contents are tracked separately
/// rather than flattened into the parent's variable list.
fn collect_scope(
    dwarf: &Dwarf,
    unit: &Unit,
    node: gimli::EntriesTreeNode<Reader>,
) -> Result<(Vec<RawVariable>, Vec<LexicalBlock>)> {
    let mut variables = Vec::new();
    let mut blocks = Vec::new();
    let mut children = node.children();
    while let Some(child) = children.next().context("walking scope children")? {
        let entry = child.entry();
        match entry.tag() {
            gimli::DW_TAG_formal_parameter | gimli::DW_TAG_variable => {
                variables.push(RawVariable {
                    name: die_name(dwarf, unit, entry)?.unwrap_or_default(),
                    is_parameter: entry.tag() == gimli::DW_TAG_formal_parameter,
                    type_offset: die_type_offset(entry),
                    location: die_location(entry)?,
                });
            }
            gimli::DW_TAG_lexical_block => {
                let (low_pc, high_pc) = block_pc_range(entry)?;
                let (block_variables, nested_blocks) = collect_scope(dwarf, unit, child)?;
                blocks.push(LexicalBlock {
                    low_pc,
                    high_pc,
                    variables: block_variables,
                    blocks: nested_blocks,
                });
            }
            _ => {}
        }
    }
    Ok((variables, blocks))
}

fn block_pc_range(entry: &gimli::DebuggingInformationEntry<Reader>) -> Result<(u64, u64)> {
    let low_pc = entry
        .attr_value(gimli::DW_AT_low_pc)?
        .and_then(|v| v.udata_value())
        .unwrap_or(0);
    let high_pc = match entry.attr_value(gimli::DW_AT_high_pc)? {
        Some(gimli::AttributeValue::Udata(n)) => low_pc + n,
        Some(v) => v.udata_value().unwrap_or(low_pc),
        None => low_pc,
    };
    Ok((low_pc, high_pc))
}

fn subprogram_type_offsets(sub: &Subprogram) -> Vec<usize> {
    let mut offsets: Vec<usize> = sub.variables.iter().filter_map(|v| v.type_offset).collect();
    offsets.extend(block_type_offsets(&sub.blocks));
    offsets
}

fn block_type_offsets(blocks: &[LexicalBlock]) -> Vec<usize> {
    let mut offsets = Vec::new();
    for block in blocks {
        offsets.extend(block.variables.iter().filter_map(|v| v.type_offset));
        offsets.extend(block_type_offsets(&block.blocks));
    }
    offsets
}

fn die_name(dwarf: &Dwarf, unit: &Unit, entry: &gimli::DebuggingInformationEntry<Reader>) -> Result<Option<String>> {
    match entry.attr_value(gimli::DW_AT_name)? {
        Some(v) => Ok(Some(dwarf.attr_string(unit, v)?.to_string_lossy().into_owned())),
        None => Ok(None),
    }
}

fn die_type_offset(entry: &gimli::DebuggingInformationEntry<Reader>) -> Option<usize> {
    match entry.attr_value(gimli::DW_AT_type).ok()?? {
        gimli::AttributeValue::UnitRef(gimli::UnitOffset(o)) => Some(o),
        _ => None,
    }
}

fn die_location(entry: &gimli::DebuggingInformationEntry<Reader>) -> Result<Option<Vec<u8>>> {
    Ok(entry.attr_value(gimli::DW_AT_location)?.and_then(|v| match v {
        gimli::AttributeValue::Exprloc(expr) => expr.0.to_slice().ok().map(|s| s.to_vec()),
        _ => None,
    }))
}

fn resolve_type_at(
    dwarf: &Dwarf,
    unit: &Unit,
    offset: usize,
    cache: &mut HashMap<usize, CompilerType>,
) -> Result<()> {
    if cache.contains_key(&offset) {
        return Ok(());
    }
    let unit_offset = gimli::UnitOffset(offset);
    let mut cursor = unit.entries_at_offset(unit_offset)?;
    let Some((_, entry)) = cursor.next_dfs()? else {
        return Ok(());
    };

    let ty = match entry.tag() {
        gimli::DW_TAG_base_type => {
            let name = die_name(dwarf, unit, entry)?.unwrap_or_else(|| "int".to_string());
            let size = entry
                .attr_value(gimli::DW_AT_byte_size)?
                .and_then(|v| v.udata_value())
                .unwrap_or(4) as u32;
            CompilerType::Scalar { name, size_bytes: size }
        }
        gimli::DW_TAG_pointer_type => {
            let pointee = die_type_offset(entry);
            let name = pointee
                .and_then(|o| {
                    resolve_type_at(dwarf, unit, o, cache).ok()?;
                    cache.get(&o).map(type_name)
                })
                .unwrap_or_else(|| "void".to_string());
            CompilerType::Pointer { name: format!("{name} *") }
        }
        gimli::DW_TAG_array_type => {
            let element_offset = die_type_offset(entry);
            let mut count = None;
            let mut complete = false;
            if let Some(eo) = element_offset {
                resolve_type_at(dwarf, unit, eo, cache)?;
            }
            let mut children = unit.entries_tree(Some(unit_offset))?;
            let root = children.root()?;
            let mut it = root.children();
            while let Some(child) = it.next()? {
                if child.entry().tag() == gimli::DW_TAG_subrange_type {
                    let e = child.entry();
                    if let Some(v) = e.attr_value(gimli::DW_AT_count)?.and_then(|v| v.udata_value()) {
                        count = Some(v);
                        complete = true;
                    } else if let Some(v) = e.attr_value(gimli::DW_AT_upper_bound)?.and_then(|v| v.udata_value()) {
                        count = Some(v + 1);
                        complete = true;
                    }
                }
            }
            let element = element_offset
                .and_then(|o| cache.get(&o).cloned())
                .unwrap_or(CompilerType::Scalar { name: "int".into(), size_bytes: 4 });
            CompilerType::Array {
                element: Box::new(element),
                count,
                complete,
            }
        }
        gimli::DW_TAG_structure_type | gimli::DW_TAG_class_type => {
            let name = die_name(dwarf, unit, entry)?.unwrap_or_default();
            let mut fields = Vec::new();
            let mut children = unit.entries_tree(Some(unit_offset))?;
            let root = children.root()?;
            let mut it = root.children();
            while let Some(child) = it.next()? {
                let e = child.entry();
                if e.tag() != gimli::DW_TAG_member {
                    continue;
                }
                let field_name = die_name(dwarf, unit, e)?.unwrap_or_default();
                anyhow::ensure!(
                    e.attr_value(gimli::DW_AT_bit_size)?.is_none() && e.attr_value(gimli::DW_AT_data_bit_offset)?.is_none(),
                    "bit-field member `{field_name}` is not byte-aligned; aggregate recursion assumes byte offsets"
                );
                let field_offset = e
                    .attr_value(gimli::DW_AT_data_member_location)?
                    .and_then(|v| v.udata_value())
                    .unwrap_or(0) as u32;
                if let Some(to) = die_type_offset(e) {
                    resolve_type_at(dwarf, unit, to, cache)?;
                    let field_ty = cache.get(&to).cloned().unwrap_or(CompilerType::Scalar {
                        name: "int".into(),
                        size_bytes: 4,
                    });
                    fields.push(Field {
                        name: field_name,
                        ty: field_ty,
                        offset_bytes: field_offset,
                    });
                }
            }
            CompilerType::Aggregate { name, fields }
        }
        _ => CompilerType::Scalar { name: "int".into(), size_bytes: 4 },
    };

    cache.insert(offset, ty);
    Ok(())
}

fn type_name(ty: &CompilerType) -> String {
    match ty {
        CompilerType::Scalar { name, .. } => name.clone(),
        CompilerType::Pointer { name } => name.clone(),
        CompilerType::Array { element, .. } => format!("{}[]", type_name(element)),
        CompilerType::Aggregate { name, .. } => name.clone(),
    }
}

/// Finds the Wasm code section's base file offset, the subtrahend used to
/// turn DWARF addresses (which are absolute-file-offset-based for these
/// producers) into the code-section-relative "raw offsets" spec.md's wire
/// format exposes. Mirrors the `wasmparser::Parser::parse_all` scan
/// `mavity-webgl2`'s `distill_wasm` tool performs for the same purpose.
pub fn code_section_base(wasm: &[u8]) -> Result<u32> {
    for payload in wasmparser::Parser::new(0).parse_all(wasm) {
        if let wasmparser::Payload::CodeSectionStart { range, .. } = payload.context("parsing wasm module")? {
            return Ok(range.start as u32);
        }
    }
    anyhow::bail!("module has no code section")
}
