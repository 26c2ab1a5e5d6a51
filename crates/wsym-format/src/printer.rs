//! The variable printer: spec.md §4.2, generating a self-contained Wasm
//! module whose single export, `wasm_format`, writes one variable's value
//! as JSON into its own scratch memory and returns a pointer to it (or
//! `0` on failure).
//!
//! The recursion structure -- scalars/pointers format themselves in one
//! call, arrays and aggregates both open with `format_begin_array` and
//! close with `format_end_array`, separated by `format_sep` -- is carried
//! over unchanged from `Variables.cc::formatVariable`/`formatArray`/
//! `formatAggregate`. Only the IR target (`walrus` instead of LLVM) is new.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use walrus::ir::{BinaryOp, ExtendedLoad, LoadKind, MemArg, Value};
use walrus::{ConstExpr, DataKind, FunctionId, InstrSeqBuilder, LocalId, Module, ModuleConfig, ModuleLocals, ValType};

use wsym_dwarf::{FrameContext, HostImports, LocationCompiler};
use wsym_module::{CompilerType, VariableInternal};

use crate::runtime::{self, Runtime};

struct VariableFrame<'a>(&'a Option<Vec<u8>>);

impl FrameContext for VariableFrame<'_> {
    fn frame_base_expression(&self) -> Option<&[u8]> {
        self.0.as_deref()
    }
}

/// Dedup'd map from a name or type-display string to where it lives in the
/// module's data (`offset`, `len`), baked in once up front so every
/// `Step` closure below can just `i32_const` its way to the right literal.
type NamePool = HashMap<String, (i32, i32)>;

/// One unit of codegen for `emit_pipeline`. `Setup` steps run unconditionally
/// and don't touch `buf`/`size` (address arithmetic, essentially); `Format`
/// steps are the ones that actually write bytes, following the
/// `callFormatter(buf, size) -> bytes_written_or_negative` convention.
enum Step {
    Setup(Box<dyn Fn(&mut InstrSeqBuilder)>),
    Format(Box<dyn Fn(&mut InstrSeqBuilder, LocalId, LocalId)>),
}

/// Generates a module formatting `variable`'s current value.
///
/// `scratch_pad_pages` sizes the module's own linear memory beyond the
/// space needed for digit-rendering scratch and embedded name literals --
/// see `SPEC_FULL.md` §3's `ServerConfig::scratch_pad_pages`.
pub fn generate_module(variable: &VariableInternal, scratch_pad_pages: u32) -> Result<Module> {
    let mut module = Module::with_config(ModuleConfig::new());

    let mem_ty = module.types.add(&[ValType::I32, ValType::I32, ValType::I32], &[]);
    let (get_memory, _) = module.add_import_func("env", "__getMemory", mem_ty);
    let local_ty = module.types.add(&[ValType::I32, ValType::I32], &[]);
    let (get_local, _) = module.add_import_func("env", "__getLocal", local_ty);
    let sbrk_ty = module.types.add(&[ValType::I32], &[ValType::I32]);
    let (sbrk, _) = module.add_import_func("env", "sbrk", sbrk_ty);

    let rt = runtime::build_into(&mut module, get_memory);
    let imports = HostImports { get_memory, get_local, memory: rt.memory, scratch_offset: runtime::DEREF_SCRATCH_OFFSET };

    let mut names = Vec::new();
    collect_names(&variable.ty, &variable.name, &mut names);
    names.sort();
    names.dedup();

    let mut pool: NamePool = HashMap::new();
    let mut next_offset = rt.literal_base;
    for name in &names {
        let bytes = name.as_bytes();
        let len = bytes.len() as i32;
        module.data.add(
            DataKind::Active { memory: rt.memory, offset: ConstExpr::Value(Value::I32(next_offset)) },
            bytes.to_vec(),
        );
        pool.insert(name.clone(), (next_offset, len));
        next_offset += len;
    }
    let heap_base_value = next_offset;

    let needed_pages = (heap_base_value as u32 / 65536) + scratch_pad_pages.max(1) + 1;
    module.memories.get_mut(rt.memory).initial = needed_pages;

    let heap_base = module
        .globals
        .add_local(ValType::I32, false, ConstExpr::Value(Value::I32(heap_base_value)));

    let primitive_formatters = primitive_formatter_table(&rt);

    let mut builder = walrus::FunctionBuilder::new(&mut module.types, &[], &[ValType::I32]);
    builder.name("wasm_format".into());

    let buf = module.locals.add(ValType::I32);
    let size = module.locals.add(ValType::I32);
    let start = module.locals.add(ValType::I32);
    let addr = module.locals.add(ValType::I32);
    let pipeline_result = module.locals.add(ValType::I32);
    let step_result = module.locals.add(ValType::I32);

    let frame = VariableFrame(&variable.frame_base);
    let expr = variable.location.expression.clone();

    let steps = steps_for(
        &variable.ty,
        &variable.name,
        addr,
        &mut module.locals,
        &primitive_formatters,
        &pool,
        &rt,
        get_memory,
        runtime::DEREF_SCRATCH_OFFSET,
    )?;

    {
        let location_compiler = LocationCompiler::new(&mut module.locals, &imports, &frame);
        let seq = builder.func_body();

        seq.global_get(heap_base);
        seq.local_tee(start);
        seq.local_set(buf);

        seq.global_get(heap_base);
        seq.i32_const(0).call(sbrk);
        seq.call(rt.get_scratch_pad_size);
        seq.local_set(size);

        location_compiler.compile(seq, &expr)?;
        seq.local_set(addr);

        emit_pipeline(seq, buf, size, pipeline_result, step_result, &steps);

        seq.local_get(pipeline_result).i32_const(0).binop(BinaryOp::I32GtS);
        seq.if_else(
            Some(ValType::I32),
            |then| {
                then.local_get(start);
            },
            |else_| {
                else_.i32_const(0);
            },
        );
    }

    let function_id = builder.finish(vec![], &mut module.funcs);
    module.exports.add("wasm_format", function_id);

    Ok(module)
}

/// Replaces the link-and-write-object-file step: the module is already
/// fully assembled, so this is just `Module::emit_wasm()`.
pub fn generate_code(mut module: Module) -> Result<Vec<u8>> {
    Ok(module.emit_wasm())
}

fn primitive_formatter_table(rt: &Runtime) -> HashMap<&'static str, FunctionId> {
    let mut map = HashMap::new();
    map.insert("int64_t", rt.format_int64);
    map.insert("int32_t", rt.format_int32);
    map.insert("int", rt.format_int);
    map.insert("int8_t", rt.format_int8);
    map
}

/// The display string baked into a container's `"type"` field --
/// `Variables.cc`'s `CompilerType::GetTypeName()`. Arrays synthesize
/// `"<element> [<count>]"`; everything else carries its own name already.
fn type_display_name(ty: &CompilerType) -> String {
    match ty {
        CompilerType::Scalar { name, .. } => name.clone(),
        CompilerType::Pointer { name } => name.clone(),
        CompilerType::Aggregate { name, .. } => name.clone(),
        CompilerType::Array { element, count, .. } => {
            format!("{} [{}]", type_display_name(element), count.unwrap_or(0))
        }
    }
}

/// Walks `ty` collecting every name/type-display string a `Format` step
/// will need as a literal: `name` itself (every node carries its own
/// display name into its formatter call), plus array/aggregate
/// `type_display_name`s. Synthesizes array element names as `"name[i]"`,
/// matching `formatArray`'s `Name + "[" + i + "]"`.
fn collect_names(ty: &CompilerType, name: &str, out: &mut Vec<String>) {
    out.push(name.to_string());
    match ty {
        CompilerType::Scalar { .. } | CompilerType::Pointer { .. } => {}
        CompilerType::Array { element, count, complete } => {
            if !*complete {
                return;
            }
            out.push(type_display_name(ty));
            if let Some(count) = count {
                for i in 0..*count {
                    collect_names(element, &format!("{name}[{i}]"), out);
                }
            }
        }
        CompilerType::Aggregate { name: type_name, fields } => {
            out.push(type_name.clone());
            for field in fields {
                collect_names(&field.ty, &field.name, out);
            }
        }
    }
}

fn pool_lookup(pool: &NamePool, key: &str) -> Result<(i32, i32)> {
    pool.get(key)
        .copied()
        .ok_or_else(|| anyhow!("internal error: name literal {key:?} missing from pool"))
}

/// Builds the step sequence that formats the value at `addr`, labeled
/// `name`. DWARF array counts and aggregate field offsets are known at
/// module-build time, so both recursion cases unroll directly into Rust-
/// level loops -- no Wasm `block`/`loop` is ever emitted here (the one
/// exception, reading a NUL-terminated C string, lives in
/// `runtime::build_format_string`).
#[allow(clippy::too_many_arguments)]
fn steps_for(
    ty: &CompilerType,
    name: &str,
    addr: LocalId,
    locals: &mut ModuleLocals,
    primitives: &HashMap<&'static str, FunctionId>,
    pool: &NamePool,
    rt: &Runtime,
    get_memory: FunctionId,
    scratch_offset: i32,
) -> Result<Vec<Step>> {
    match ty {
        CompilerType::Scalar { name: type_name, size_bytes } => {
            let formatter = *primitives
                .get(type_name.as_str())
                .ok_or_else(|| anyhow!("no formatter for type {type_name}"))?;
            let read = match type_name.as_str() {
                "int64_t" => ScalarRead::I64,
                "int8_t" => ScalarRead::I8Signed,
                _ => ScalarRead::I32,
            };
            let (name_off, name_len) = pool_lookup(pool, name)?;
            Ok(vec![scalar_step(addr, *size_bytes as i32, read, get_memory, rt.memory, scratch_offset, formatter, name_off, name_len)])
        }
        CompilerType::Pointer { name: type_name } => {
            if type_name != "const char *" {
                return Err(anyhow!("no formatter for type {type_name}"));
            }
            let (name_off, name_len) = pool_lookup(pool, name)?;
            Ok(vec![pointer_string_step(addr, get_memory, rt.memory, scratch_offset, rt.format_string, name_off, name_len)])
        }
        CompilerType::Array { element, count, complete } => {
            if !*complete {
                return Err(anyhow!("array has unknown size, cannot format"));
            }
            let count = count.ok_or_else(|| anyhow!("array has no known element count"))?;
            let elem_size = element
                .size_bytes()
                .ok_or_else(|| anyhow!("array element type has unknown size"))? as i32;

            let (name_off, name_len) = pool_lookup(pool, name)?;
            let (type_off, type_len) = pool_lookup(pool, &type_display_name(ty))?;

            let mut steps = vec![begin_step(rt.format_begin_array, name_off, name_len, type_off, type_len)];
            for i in 0..count {
                if i > 0 {
                    steps.push(rt_call_step(rt.format_sep));
                }
                let elem_name = format!("{name}[{i}]");
                steps.extend(field_steps(
                    element,
                    &elem_name,
                    addr,
                    i as i32 * elem_size,
                    locals,
                    primitives,
                    pool,
                    rt,
                    get_memory,
                    scratch_offset,
                )?);
            }
            steps.push(rt_call_step(rt.format_end_array));
            Ok(steps)
        }
        CompilerType::Aggregate { name: type_name, fields } => {
            let (name_off, name_len) = pool_lookup(pool, name)?;
            let (type_off, type_len) = pool_lookup(pool, type_name)?;

            let mut steps = vec![begin_step(rt.format_begin_array, name_off, name_len, type_off, type_len)];
            for (i, field) in fields.iter().enumerate() {
                if i > 0 {
                    steps.push(rt_call_step(rt.format_sep));
                }
                steps.extend(field_steps(
                    &field.ty,
                    &field.name,
                    addr,
                    field.offset_bytes as i32,
                    locals,
                    primitives,
                    pool,
                    rt,
                    get_memory,
                    scratch_offset,
                )?);
            }
            steps.push(rt_call_step(rt.format_end_array));
            Ok(steps)
        }
    }
}

/// `steps_for`, but for a member/element living at `base + byte_offset`.
/// When the offset is non-zero this first materializes the computed
/// address into a fresh local via a `Setup` step, since every `steps_for`
/// closure addresses a single fixed `LocalId`.
#[allow(clippy::too_many_arguments)]
fn field_steps(
    ty: &CompilerType,
    name: &str,
    base: LocalId,
    byte_offset: i32,
    locals: &mut ModuleLocals,
    primitives: &HashMap<&'static str, FunctionId>,
    pool: &NamePool,
    rt: &Runtime,
    get_memory: FunctionId,
    scratch_offset: i32,
) -> Result<Vec<Step>> {
    if byte_offset == 0 {
        return steps_for(ty, name, base, locals, primitives, pool, rt, get_memory, scratch_offset);
    }
    let field_addr = locals.add(ValType::I32);
    let mut steps = vec![Step::Setup(Box::new(move |seq: &mut InstrSeqBuilder| {
        seq.local_get(base);
        seq.i32_const(byte_offset);
        seq.binop(BinaryOp::I32Add);
        seq.local_set(field_addr);
    }))];
    steps.extend(steps_for(ty, name, field_addr, locals, primitives, pool, rt, get_memory, scratch_offset)?);
    Ok(steps)
}

/// How to load a scalar's bytes back out of the scratch word after
/// `__getMemory` has written them there.
#[derive(Clone, Copy)]
enum ScalarRead {
    I32,
    I64,
    I8Signed,
}

#[allow(clippy::too_many_arguments)]
fn scalar_step(
    addr: LocalId,
    size_bytes: i32,
    read: ScalarRead,
    get_memory: FunctionId,
    memory: walrus::MemoryId,
    scratch_offset: i32,
    formatter: FunctionId,
    name_off: i32,
    name_len: i32,
) -> Step {
    Step::Format(Box::new(move |seq: &mut InstrSeqBuilder, buf: LocalId, size: LocalId| {
        seq.local_get(addr).i32_const(size_bytes).i32_const(scratch_offset).call(get_memory);
        seq.i32_const(0);
        match read {
            ScalarRead::I32 => {
                seq.load(memory, LoadKind::I32 { atomic: false }, MemArg { align: 2, offset: scratch_offset as u32 });
            }
            ScalarRead::I64 => {
                seq.load(memory, LoadKind::I64 { atomic: false }, MemArg { align: 3, offset: scratch_offset as u32 });
            }
            ScalarRead::I8Signed => {
                seq.load(
                    memory,
                    LoadKind::I32_8 { kind: ExtendedLoad::SignExtend },
                    MemArg { align: 0, offset: scratch_offset as u32 },
                );
            }
        }
        seq.i32_const(name_off);
        seq.i32_const(name_len);
        seq.local_get(buf);
        seq.local_get(size);
        seq.call(formatter);
    }))
}

/// Reads the pointer value itself (4 bytes at `addr`) to get the string's
/// address, then hands it to `format_string`, which does its own
/// byte-at-a-time read of the pointee.
fn pointer_string_step(
    addr: LocalId,
    get_memory: FunctionId,
    memory: walrus::MemoryId,
    scratch_offset: i32,
    format_string: FunctionId,
    name_off: i32,
    name_len: i32,
) -> Step {
    Step::Format(Box::new(move |seq: &mut InstrSeqBuilder, buf: LocalId, size: LocalId| {
        seq.local_get(addr).i32_const(4).i32_const(scratch_offset).call(get_memory);
        seq.i32_const(0);
        seq.load(memory, LoadKind::I32 { atomic: false }, MemArg { align: 2, offset: scratch_offset as u32 });
        seq.i32_const(name_off);
        seq.i32_const(name_len);
        seq.local_get(buf);
        seq.local_get(size);
        seq.call(format_string);
    }))
}

fn begin_step(formatter: FunctionId, name_off: i32, name_len: i32, type_off: i32, type_len: i32) -> Step {
    Step::Format(Box::new(move |seq: &mut InstrSeqBuilder, buf: LocalId, size: LocalId| {
        seq.i32_const(name_off);
        seq.i32_const(name_len);
        seq.i32_const(type_off);
        seq.i32_const(type_len);
        seq.local_get(buf);
        seq.local_get(size);
        seq.call(formatter);
    }))
}

fn rt_call_step(formatter: FunctionId) -> Step {
    Step::Format(Box::new(move |seq: &mut InstrSeqBuilder, buf: LocalId, size: LocalId| {
        seq.local_get(buf).local_get(size).call(formatter);
    }))
}

/// Runs `steps` in sequence, short-circuiting to a negative `total` the
/// moment any `Format` step returns a negative value (`-ENOSPC`), threading
/// `buf`/`size` forward and accumulating a running byte total otherwise.
/// Mirrors `Variables.cc::callFormatter`'s "advance buffer/size by returned
/// offset, bail on `< 0`" loop, restructured as nested `if`/`else` per
/// `SPEC_FULL.md` §4.2. `step_result` is a single scratch local reused by
/// every `Format` step in the chain.
fn emit_pipeline(seq: &mut InstrSeqBuilder, buf: LocalId, size: LocalId, total: LocalId, step_result: LocalId, steps: &[Step]) {
    seq.i32_const(0);
    seq.local_set(total);
    run_steps(seq, buf, size, total, step_result, steps);
}

fn run_steps(seq: &mut InstrSeqBuilder, buf: LocalId, size: LocalId, total: LocalId, step_result: LocalId, steps: &[Step]) {
    match steps.split_first() {
        None => {}
        Some((Step::Setup(emit), rest)) => {
            emit(seq);
            run_steps(seq, buf, size, total, step_result, rest);
        }
        Some((Step::Format(emit), rest)) => {
            emit(seq, buf, size);
            seq.local_tee(step_result);
            seq.i32_const(0);
            seq.binop(BinaryOp::I32LtS);
            seq.if_else(
                None,
                |then| {
                    // Force the final `total > 0` check to fail; leaving
                    // `total` at its partial sum would let a mid-chain
                    // -ENOSPC slip through as a false success.
                    then.local_get(step_result);
                    then.local_set(total);
                },
                |else_| {
                    else_.local_get(buf).local_get(step_result).binop(BinaryOp::I32Add);
                    else_.local_set(buf);
                    else_.local_get(size).local_get(step_result).binop(BinaryOp::I32Sub);
                    else_.local_set(size);
                    else_.local_get(total).local_get(step_result).binop(BinaryOp::I32Add);
                    else_.local_set(total);
                    run_steps(else_, buf, size, total, step_result, rest);
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wsym_module::{Field, MemoryLocation, Scope, WasmAddressSpace};

    /// `DW_OP_addr <u32>`: a fixed memory address, little-endian.
    fn addr_expr(address: u32) -> Vec<u8> {
        let mut bytes = vec![0x03];
        bytes.extend_from_slice(&address.to_le_bytes());
        bytes
    }

    fn variable(name: &str, ty: CompilerType) -> VariableInternal {
        VariableInternal {
            name: name.to_string(),
            scope: Scope::Global,
            ty,
            location: MemoryLocation { address_space: WasmAddressSpace::Memory, expression: addr_expr(0x1000) },
            frame_base: None,
        }
    }

    #[test]
    fn formats_scalar() {
        let variable = variable("x", CompilerType::Scalar { name: "int32_t".into(), size_bytes: 4 });
        let module = generate_module(&variable, 1).expect("builds");
        let bytes = generate_code(module).expect("emits");
        assert!(!bytes.is_empty());
    }

    #[test]
    fn formats_array_of_int() {
        let variable = variable(
            "A",
            CompilerType::Array {
                element: Box::new(CompilerType::Scalar { name: "int32_t".into(), size_bytes: 4 }),
                count: Some(4),
                complete: true,
            },
        );
        let module = generate_module(&variable, 1).expect("builds");
        assert!(!generate_code(module).expect("emits").is_empty());
    }

    #[test]
    fn formats_aggregate() {
        let variable = variable(
            "p",
            CompilerType::Aggregate {
                name: "Point".into(),
                fields: vec![
                    Field { name: "x".into(), ty: CompilerType::Scalar { name: "int32_t".into(), size_bytes: 4 }, offset_bytes: 0 },
                    Field { name: "y".into(), ty: CompilerType::Scalar { name: "int32_t".into(), size_bytes: 4 }, offset_bytes: 4 },
                ],
            },
        );
        let module = generate_module(&variable, 1).expect("builds");
        assert!(!generate_code(module).expect("emits").is_empty());
    }

    #[test]
    fn incomplete_array_is_rejected() {
        let variable = variable(
            "A",
            CompilerType::Array {
                element: Box::new(CompilerType::Scalar { name: "int32_t".into(), size_bytes: 4 }),
                count: None,
                complete: false,
            },
        );
        assert!(generate_module(&variable, 1).is_err());
    }

    #[test]
    fn non_char_pointer_has_no_formatter() {
        let variable = variable("p", CompilerType::Pointer { name: "int *".into() });
        assert!(generate_module(&variable, 1).is_err());
    }

    #[test]
    fn unknown_scalar_type_has_no_formatter() {
        let variable = variable("x", CompilerType::Scalar { name: "double".into(), size_bytes: 8 });
        assert!(generate_module(&variable, 1).is_err());
    }

    #[test]
    fn type_display_name_formats_array_suffix() {
        let ty = CompilerType::Array {
            element: Box::new(CompilerType::Scalar { name: "int".into(), size_bytes: 4 }),
            count: Some(4),
            complete: true,
        };
        assert_eq!(type_display_name(&ty), "int [4]");
    }
}
