//! The runtime formatter functions, built directly as `walrus` IR.
//!
//! In the original these live in a precompiled `formatters.cc` translation
//! unit that gets linked into every generated module. We have no linker step
//! (see the redesign note in `SPEC_FULL.md` §1), so `build_into` inserts the
//! same functions, with the same ABI, straight into the target module as
//! `walrus::LocalFunction`s. Every writer below follows `formatters.cc`'s
//! contract: NUL-terminate on success, return `-ENOSPC` and touch nothing
//! else on overflow.
//!
//! One deliberate departure from `formatters.cc`: `name`/`type` arguments
//! there are NUL-terminated `char *`, scanned to find their length.
//! Callers here always know the length up front (every name is a literal
//! baked into the module's data by the printer), so every formatter takes
//! an explicit `(ptr, len)` pair instead — cheaper, and it keeps this file
//! as loop-free as `Variables.cc`'s aggregate/array recursion.

use walrus::ir::{BinaryOp, ExtendedLoad, LoadKind, MemArg, StoreKind, UnaryOp};
use walrus::{ConstExpr, DataKind, FunctionBuilder, FunctionId, InstrSeqBuilder, MemoryId, Module, ValType};

/// Mirrors `<errno.h>`'s `ENOSPC`, which the original's formatters return
/// negated on a buffer overflow.
pub const ENOSPC: i32 = 12;

/// Decimal digits of the widest value we ever format (`i64::MIN`'s
/// magnitude, `9223372036854775808`, is 19 digits).
const MAX_DIGITS: i32 = 19;

/// Byte offset of the scratch region `format_int*`/`render_digits` render
/// decimal digits into. One byte of headroom ahead of the digit array
/// itself, for a sign byte written directly adjacent to the first
/// significant digit.
const DIGIT_SCRATCH_OFFSET: i32 = 0;
const DIGIT_AREA_OFFSET: i32 = DIGIT_SCRATCH_OFFSET + 1;
const DIGIT_SCRATCH_LEN: i32 = MAX_DIGITS + 1;

/// Scratch word `wsym_dwarf::LocationCompiler` stages `__getMemory`/
/// `__getLocal` reads through (see `HostImports::scratch_offset`), reused
/// here by `format_string`'s one-byte-at-a-time reads and by the printer's
/// own scalar/pointer loads — none of these ever run concurrently within
/// one generated function body, so one shared word is enough.
pub const DEREF_SCRATCH_OFFSET: i32 = DIGIT_SCRATCH_OFFSET + DIGIT_SCRATCH_LEN;
const DEREF_SCRATCH_LEN: i32 = 4;

/// Handles of the functions `build_into` just emitted, ready to be `call`ed
/// by the variable printer.
pub struct Runtime {
    pub memory: MemoryId,
    pub get_scratch_pad_size: FunctionId,
    /// `(name_ptr, name_len, type_ptr, type_len, buf, size) -> i32`, opens
    /// `{"type":"T","name":"N","value":[`. Shared by arrays and aggregates.
    pub format_begin_array: FunctionId,
    pub format_end_array: FunctionId,
    pub format_sep: FunctionId,
    /// `(value, name_ptr, name_len, buf, size) -> i32`, self-contained
    /// `{"type":"...","name":"N","value":"V"}` records.
    pub format_int64: FunctionId,
    pub format_int32: FunctionId,
    pub format_int: FunctionId,
    pub format_int8: FunctionId,
    /// `(str_ptr, name_ptr, name_len, buf, size) -> i32`.
    pub format_string: FunctionId,
    /// First byte offset free for the printer's own data (the name/type
    /// literal pool, then the heap used for the JSON output itself).
    pub literal_base: i32,
}

pub fn build_into(module: &mut Module, get_memory: FunctionId) -> Runtime {
    let memory = module.memories.add_local(false, false, 1, None);
    let mut cursor = DEREF_SCRATCH_OFFSET + DEREF_SCRATCH_LEN;

    let get_scratch_pad_size = build_get_scratch_pad_size(module);
    let format_begin_array = build_format_begin_array(module, memory, &mut cursor);
    let format_end_array = build_literal_writer(module, memory, &mut cursor, b"]}", "format_end_array");
    let format_sep = build_literal_writer(module, memory, &mut cursor, b",", "format_sep");
    let render_digits = build_render_digits(module, memory);
    let format_int64 = build_int_formatter(module, memory, &mut cursor, render_digits, true, "int64_t", "format_int64_t");
    let format_int32 = build_int_formatter(module, memory, &mut cursor, render_digits, false, "int32_t", "format_int32_t");
    let format_int = build_int_formatter(module, memory, &mut cursor, render_digits, false, "int", "format_int");
    let format_int8 = build_int_formatter(module, memory, &mut cursor, render_digits, false, "int8_t", "format_int8_t");
    let format_string = build_format_string(module, memory, &mut cursor, get_memory);

    Runtime {
        memory,
        get_scratch_pad_size,
        format_begin_array,
        format_end_array,
        format_sep,
        format_int64,
        format_int32,
        format_int,
        format_int8,
        format_string,
        literal_base: cursor,
    }
}

/// Appends `bytes` as an active data segment at `*cursor`, advancing it,
/// and returns `(offset, len)`.
fn add_literal(module: &mut Module, memory: MemoryId, cursor: &mut i32, bytes: &[u8]) -> (i32, i32) {
    let offset = *cursor;
    let len = bytes.len() as i32;
    module
        .data
        .add(DataKind::Active { memory, offset: ConstExpr::Value(walrus::ir::Value::I32(offset)) }, bytes.to_vec());
    *cursor += len;
    (offset, len)
}

/// `get_scratch_pad_size(begin, end) -> i32`: `0` if the range is empty or
/// `end` is the original's `(char *)-1` sentinel, else `end - begin`.
fn build_get_scratch_pad_size(module: &mut Module) -> FunctionId {
    let mut builder = FunctionBuilder::new(&mut module.types, &[ValType::I32, ValType::I32], &[ValType::I32]);
    builder.name("get_scratch_pad_size".into());
    let begin = module.locals.add(ValType::I32);
    let end = module.locals.add(ValType::I32);
    let sentinel = module.locals.add(ValType::I32);
    {
        let seq = builder.func_body();
        seq.local_get(end).i32_const(-1).binop(BinaryOp::I32Eq);
        seq.local_get(begin).local_get(end).binop(BinaryOp::I32GeS);
        seq.binop(BinaryOp::I32Or);
        seq.local_set(sentinel);

        seq.i32_const(0);
        seq.local_get(end).local_get(begin).binop(BinaryOp::I32Sub);
        seq.local_get(sentinel);
        seq.select(Some(ValType::I32));
    }
    builder.finish(vec![begin, end], &mut module.funcs)
}

/// One piece of a concatenated write: either a fixed literal already laid
/// down as a data segment, or a `(ptr, len)` pair carried by locals.
enum Part {
    Literal(i32, i32),
    Dynamic(walrus::LocalId, walrus::LocalId),
}

/// Shared tail for every "concatenate some fixed and dynamic byte strings,
/// NUL-terminate, bail with `-ENOSPC` if it doesn't fit" formatter body.
/// `total_len` must already hold the sum of every part's length.
fn emit_concat(
    seq: &mut InstrSeqBuilder,
    memory: MemoryId,
    buf: walrus::LocalId,
    size: walrus::LocalId,
    write: walrus::LocalId,
    total_len: walrus::LocalId,
    parts: &[Part],
) {
    seq.local_get(total_len).i32_const(1).binop(BinaryOp::I32Add);
    seq.local_get(size);
    seq.binop(BinaryOp::I32GtS);
    seq.if_else(
        Some(ValType::I32),
        |then| {
            then.i32_const(-ENOSPC);
        },
        |else_| {
            else_.local_get(buf);
            else_.local_set(write);
            for part in parts {
                match *part {
                    Part::Literal(off, len) => {
                        else_.local_get(write);
                        else_.i32_const(off);
                        else_.i32_const(len);
                        else_.memory_copy(memory, memory);
                        else_.local_get(write).i32_const(len).binop(BinaryOp::I32Add);
                        else_.local_set(write);
                    }
                    Part::Dynamic(ptr, len) => {
                        else_.local_get(write);
                        else_.local_get(ptr);
                        else_.local_get(len);
                        else_.memory_copy(memory, memory);
                        else_.local_get(write).local_get(len).binop(BinaryOp::I32Add);
                        else_.local_set(write);
                    }
                }
            }
            else_.local_get(write);
            else_.i32_const(0);
            else_.store(memory, StoreKind::I32_8 { atomic: false }, MemArg { align: 0, offset: 0 });
            else_.local_get(total_len);
        },
    );
}

/// Builds `format_begin_array`/`format_end_array`/`format_sep`'s sibling
/// that opens the array/aggregate object:
/// `{"type":"T","name":"N","value":[`.
fn build_format_begin_array(module: &mut Module, memory: MemoryId, cursor: &mut i32) -> FunctionId {
    let pfx = add_literal(module, memory, cursor, b"{\"type\":\"");
    let mid = add_literal(module, memory, cursor, b"\",\"name\":\"");
    let sfx = add_literal(module, memory, cursor, b"\",\"value\":[");

    let i32x6 = [ValType::I32; 6];
    let mut builder = FunctionBuilder::new(&mut module.types, &i32x6, &[ValType::I32]);
    builder.name("format_begin_array".into());
    let name_ptr = module.locals.add(ValType::I32);
    let name_len = module.locals.add(ValType::I32);
    let type_ptr = module.locals.add(ValType::I32);
    let type_len = module.locals.add(ValType::I32);
    let buf = module.locals.add(ValType::I32);
    let size = module.locals.add(ValType::I32);
    let total_len = module.locals.add(ValType::I32);
    let write = module.locals.add(ValType::I32);
    {
        let seq = builder.func_body();
        seq.i32_const(pfx.1 + mid.1 + sfx.1);
        seq.local_get(type_len).binop(BinaryOp::I32Add);
        seq.local_get(name_len).binop(BinaryOp::I32Add);
        seq.local_set(total_len);

        emit_concat(
            seq,
            memory,
            buf,
            size,
            write,
            total_len,
            &[
                Part::Literal(pfx.0, pfx.1),
                Part::Dynamic(type_ptr, type_len),
                Part::Literal(mid.0, mid.1),
                Part::Dynamic(name_ptr, name_len),
                Part::Literal(sfx.0, sfx.1),
            ],
        );
    }
    builder.finish(vec![name_ptr, name_len, type_ptr, type_len, buf, size], &mut module.funcs)
}

/// Builds a `(buf, size) -> i32` formatter that writes one fixed literal
/// plus a NUL terminator, or fails with `-ENOSPC`.
fn build_literal_writer(module: &mut Module, memory: MemoryId, cursor: &mut i32, bytes: &[u8], name: &str) -> FunctionId {
    let (off, len) = add_literal(module, memory, cursor, bytes);
    let mut builder = FunctionBuilder::new(&mut module.types, &[ValType::I32, ValType::I32], &[ValType::I32]);
    builder.name(name.into());
    let buf = module.locals.add(ValType::I32);
    let size = module.locals.add(ValType::I32);
    {
        let seq = builder.func_body();
        seq.i32_const(len + 1);
        seq.local_get(size);
        seq.binop(BinaryOp::I32GtS);
        seq.if_else(
            Some(ValType::I32),
            |then| {
                then.i32_const(-ENOSPC);
            },
            |else_| {
                else_.local_get(buf);
                else_.i32_const(off);
                else_.i32_const(len);
                else_.memory_copy(memory, memory);
                else_.local_get(buf).i32_const(len).binop(BinaryOp::I32Add);
                else_.i32_const(0);
                else_.store(memory, StoreKind::I32_8 { atomic: false }, MemArg { align: 0, offset: 0 });
                else_.i32_const(len);
            },
        );
    }
    builder.finish(vec![buf, size], &mut module.funcs)
}

/// `render_digits(value: i64) -> (start: i32, len: i32)`: renders `value`'s
/// decimal ASCII form into the fixed digit scratch region using a
/// branch-free, fixed-width computation (every one of [`MAX_DIGITS`]
/// digits is computed unconditionally; only the significant suffix is ever
/// meaningful), and returns where that suffix starts and how long it is.
/// No Wasm-level loop is needed to find how many digits there are.
fn build_render_digits(module: &mut Module, memory: MemoryId) -> FunctionId {
    let mut builder = FunctionBuilder::new(&mut module.types, &[ValType::I64], &[ValType::I32, ValType::I32]);
    builder.name("render_digits".into());
    let value = module.locals.add(ValType::I64);
    let mag = module.locals.add(ValType::I64);
    let is_neg = module.locals.add(ValType::I32);
    let num_digits = module.locals.add(ValType::I32);
    let start = module.locals.add(ValType::I32);
    let len = module.locals.add(ValType::I32);
    {
        let seq = builder.func_body();

        // is_neg = value < 0
        seq.local_get(value).i64_const(0).binop(BinaryOp::I64LtS);
        seq.local_set(is_neg);

        // mag = is_neg ? (0 - value) : value -- wraps correctly for i64::MIN
        seq.i64_const(0).local_get(value).binop(BinaryOp::I64Sub);
        seq.local_get(value);
        seq.local_get(is_neg);
        seq.select(Some(ValType::I64));
        seq.local_set(mag);

        // num_digits = 1 + sum(mag >= 10^k) for k in 1..=MAX_DIGITS - 1
        seq.i32_const(1);
        let mut threshold: i64 = 10;
        for _ in 1..MAX_DIGITS {
            seq.local_get(mag).i64_const(threshold).binop(BinaryOp::I64GeU);
            seq.binop(BinaryOp::I32Add);
            threshold = threshold.saturating_mul(10);
        }
        seq.local_set(num_digits);

        // Unconditionally render all MAX_DIGITS digits, most significant
        // first, into the digit area.
        for i in 0..MAX_DIGITS {
            let place = MAX_DIGITS - 1 - i;
            let divisor: i64 = 10i64.pow(place as u32);
            seq.i32_const(DIGIT_AREA_OFFSET + i);
            seq.local_get(mag).i64_const(divisor).binop(BinaryOp::I64DivU).i64_const(10).binop(BinaryOp::I64RemU);
            seq.unop(UnaryOp::I32WrapI64);
            seq.i32_const(b'0' as i32).binop(BinaryOp::I32Add);
            seq.store(memory, StoreKind::I32_8 { atomic: false }, MemArg { align: 0, offset: 0 });
        }

        // len = num_digits + is_neg; start = area_end - len
        seq.local_get(num_digits).local_get(is_neg).binop(BinaryOp::I32Add);
        seq.local_set(len);
        seq.i32_const(DIGIT_AREA_OFFSET + MAX_DIGITS);
        seq.local_get(len).binop(BinaryOp::I32Sub);
        seq.local_set(start);

        // buf[start] = '-' if negative -- always lands one byte before the
        // first significant digit, inside the reserved sign byte when
        // num_digits == MAX_DIGITS.
        seq.local_get(is_neg);
        seq.if_else(
            None,
            |then| {
                then.local_get(start);
                then.i32_const(b'-' as i32);
                then.store(memory, StoreKind::I32_8 { atomic: false }, MemArg { align: 0, offset: 0 });
            },
            |_| {},
        );

        seq.local_get(start);
        seq.local_get(len);
    }
    builder.finish(vec![value], &mut module.funcs)
}

/// Builds one of `format_int64_t`/`format_int32_t`/`format_int`/
/// `format_int8_t`: renders `value` via [`build_render_digits`], then
/// assembles `{"type":"<type_name>","name":"N","value":"V"}`. All four are
/// numerically identical on this target (everything widens to `i64`
/// first), matching `formatters.cc`'s shared `formatValue<T>` template
/// instantiated once per C integer type -- only the embedded type name
/// differs.
fn build_int_formatter(
    module: &mut Module,
    memory: MemoryId,
    cursor: &mut i32,
    render_digits: FunctionId,
    wide: bool,
    type_name: &str,
    wasm_name: &str,
) -> FunctionId {
    let pfx = add_literal(module, memory, cursor, format!("{{\"type\":\"{type_name}\",\"name\":\"").as_bytes());
    let mid = add_literal(module, memory, cursor, b"\",\"value\":\"");
    let sfx = add_literal(module, memory, cursor, b"\"}");

    let value_ty = if wide { ValType::I64 } else { ValType::I32 };
    let mut builder =
        FunctionBuilder::new(&mut module.types, &[value_ty, ValType::I32, ValType::I32, ValType::I32, ValType::I32], &[ValType::I32]);
    builder.name(wasm_name.into());
    let value = module.locals.add(value_ty);
    let name_ptr = module.locals.add(ValType::I32);
    let name_len = module.locals.add(ValType::I32);
    let buf = module.locals.add(ValType::I32);
    let size = module.locals.add(ValType::I32);
    let value64 = module.locals.add(ValType::I64);
    let digit_start = module.locals.add(ValType::I32);
    let digit_len = module.locals.add(ValType::I32);
    let total_len = module.locals.add(ValType::I32);
    let write = module.locals.add(ValType::I32);
    {
        let seq = builder.func_body();
        if wide {
            seq.local_get(value);
        } else {
            seq.local_get(value).unop(UnaryOp::I64ExtendSI32);
        }
        seq.local_set(value64);

        seq.local_get(value64).call(render_digits);
        seq.local_set(digit_len);
        seq.local_set(digit_start);

        seq.i32_const(pfx.1 + mid.1 + sfx.1);
        seq.local_get(name_len).binop(BinaryOp::I32Add);
        seq.local_get(digit_len).binop(BinaryOp::I32Add);
        seq.local_set(total_len);

        emit_concat(
            seq,
            memory,
            buf,
            size,
            write,
            total_len,
            &[
                Part::Literal(pfx.0, pfx.1),
                Part::Dynamic(name_ptr, name_len),
                Part::Literal(mid.0, mid.1),
                Part::Dynamic(digit_start, digit_len),
                Part::Literal(sfx.0, sfx.1),
            ],
        );
    }
    builder.finish(vec![value, name_ptr, name_len, buf, size], &mut module.funcs)
}

/// `format_string(str_ptr, name_ptr, name_len, buf, size) -> i32`: reads a
/// NUL-terminated C string one byte at a time through `__getMemory` (its
/// length isn't known up front, unlike every other formatter here, so this
/// is the one place in the runtime that needs a real Wasm loop), copying up
/// to the first NUL or until the output is full, and assembles
/// `{"type":"const char *","name":"N","value":"V"}`.
fn build_format_string(module: &mut Module, memory: MemoryId, cursor: &mut i32, get_memory: FunctionId) -> FunctionId {
    let pfx = add_literal(module, memory, cursor, b"{\"type\":\"const char *\",\"name\":\"");
    let mid = add_literal(module, memory, cursor, b"\",\"value\":\"");
    let sfx = add_literal(module, memory, cursor, b"\"}");

    let i32x5 = [ValType::I32; 5];
    let mut builder = FunctionBuilder::new(&mut module.types, &i32x5, &[ValType::I32]);
    builder.name("format_string".into());
    let str_ptr = module.locals.add(ValType::I32);
    let name_ptr = module.locals.add(ValType::I32);
    let name_len = module.locals.add(ValType::I32);
    let buf = module.locals.add(ValType::I32);
    let size = module.locals.add(ValType::I32);
    let fixed_len = module.locals.add(ValType::I32);
    let max_str_len = module.locals.add(ValType::I32);
    let write = module.locals.add(ValType::I32);
    let i = module.locals.add(ValType::I32);
    let byte = module.locals.add(ValType::I32);
    let total_len = module.locals.add(ValType::I32);
    {
        let seq = builder.func_body();

        // fixed_len = everything but the string content itself.
        seq.i32_const(pfx.1 + mid.1 + sfx.1);
        seq.local_get(name_len).binop(BinaryOp::I32Add);
        seq.local_set(fixed_len);

        seq.local_get(fixed_len).i32_const(1).binop(BinaryOp::I32Add);
        seq.local_get(size);
        seq.binop(BinaryOp::I32GtS);
        seq.if_else(
            Some(ValType::I32),
            |then| {
                then.i32_const(-ENOSPC);
            },
            |else_| {
                else_.local_get(buf);
                else_.local_set(write);

                else_.local_get(write);
                else_.i32_const(pfx.0);
                else_.i32_const(pfx.1);
                else_.memory_copy(memory, memory);
                else_.local_get(write).i32_const(pfx.1).binop(BinaryOp::I32Add).local_set(write);

                else_.local_get(write);
                else_.local_get(name_ptr);
                else_.local_get(name_len);
                else_.memory_copy(memory, memory);
                else_.local_get(write).local_get(name_len).binop(BinaryOp::I32Add).local_set(write);

                else_.local_get(write);
                else_.i32_const(mid.0);
                else_.i32_const(mid.1);
                else_.memory_copy(memory, memory);
                else_.local_get(write).i32_const(mid.1).binop(BinaryOp::I32Add).local_set(write);

                // Room left for string content: size - fixed_len - 1 (NUL).
                else_.local_get(size).local_get(fixed_len).binop(BinaryOp::I32Sub).i32_const(1).binop(BinaryOp::I32Sub);
                else_.local_set(max_str_len);

                else_.i32_const(0);
                else_.local_set(i);
                else_.block(None, |block| {
                    let exit = block.id();
                    block.loop_(None, |loop_| {
                        let top = loop_.id();
                        loop_.local_get(i).local_get(max_str_len).binop(BinaryOp::I32GeS);
                        loop_.br_if(exit);

                        loop_.local_get(str_ptr).local_get(i).binop(BinaryOp::I32Add);
                        loop_.i32_const(1);
                        loop_.i32_const(DEREF_SCRATCH_OFFSET);
                        loop_.call(get_memory);
                        loop_.i32_const(0);
                        loop_.load(
                            memory,
                            LoadKind::I32_8 { kind: ExtendedLoad::ZeroExtend },
                            MemArg { align: 0, offset: DEREF_SCRATCH_OFFSET as u32 },
                        );
                        loop_.local_tee(byte);
                        loop_.i32_const(0).binop(BinaryOp::I32Eq);
                        loop_.br_if(exit);

                        loop_.local_get(write).local_get(i).binop(BinaryOp::I32Add);
                        loop_.local_get(byte);
                        loop_.store(memory, StoreKind::I32_8 { atomic: false }, MemArg { align: 0, offset: 0 });

                        loop_.local_get(i).i32_const(1).binop(BinaryOp::I32Add);
                        loop_.local_set(i);
                        loop_.br(top);
                    });
                });

                else_.local_get(write).local_get(i).binop(BinaryOp::I32Add).local_set(write);

                else_.local_get(write);
                else_.i32_const(sfx.0);
                else_.i32_const(sfx.1);
                else_.memory_copy(memory, memory);
                else_.local_get(write).i32_const(sfx.1).binop(BinaryOp::I32Add).local_set(write);

                else_.local_get(write);
                else_.i32_const(0);
                else_.store(memory, StoreKind::I32_8 { atomic: false }, MemArg { align: 0, offset: 0 });

                else_.local_get(fixed_len).local_get(i).binop(BinaryOp::I32Add).i32_const(sfx.1).binop(BinaryOp::I32Add);
                else_.local_set(total_len);
                else_.local_get(total_len);
            },
        );
    }
    builder.finish(vec![str_ptr, name_ptr, name_len, buf, size], &mut module.funcs)
}
