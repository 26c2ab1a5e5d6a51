//! Compiles a single DWARF location expression into Wasm IR.
//!
//! This is the Rust analogue of the original symbol server's
//! `DWARFLocationParser`, except the target IR is `walrus` rather than LLVM.
//! Every DWARF-expression stack slot becomes one `i32` local of the
//! function being built, pushed and popped with `local.set`/`local.get` on
//! the caller-supplied `InstrSeqBuilder` — the same "keep an explicit value
//! stack next to the builder" shape `cranelift-wasm`'s operator translator
//! uses, just with `walrus::ir::LocalId` standing in for a Cranelift `Value`.
//!
//! Only `i32` addresses are modeled: the symbol server only ever targets
//! wasm32 linear memory, so there is no need for a 64-bit operand variant.

use walrus::ir::{BinaryOp, LoadKind, MemArg};
use walrus::{FunctionId, InstrSeqBuilder, LocalId, MemoryId, ModuleLocals, ValType};

/// Opcode byte values, DWARF5 §7.7.1 plus the Wasm vendor extension used by
/// the LLVM WebAssembly backend for locals/globals/operand-stack slots.
#[allow(dead_code)]
mod opcode {
    pub const ADDR: u8 = 0x03;
    pub const DEREF: u8 = 0x06;
    pub const CONST1U: u8 = 0x08;
    pub const CONST1S: u8 = 0x09;
    pub const CONST2U: u8 = 0x0a;
    pub const CONST2S: u8 = 0x0b;
    pub const CONST4U: u8 = 0x0c;
    pub const CONST4S: u8 = 0x0d;
    pub const CONST8U: u8 = 0x0e;
    pub const CONST8S: u8 = 0x0f;
    pub const CONSTU: u8 = 0x10;
    pub const CONSTS: u8 = 0x11;
    pub const DUP: u8 = 0x12;
    pub const DROP: u8 = 0x13;
    pub const OVER: u8 = 0x14;
    pub const PICK: u8 = 0x15;
    pub const SWAP: u8 = 0x16;
    pub const ROT: u8 = 0x17;
    pub const AND: u8 = 0x1a;
    pub const DIV: u8 = 0x1b;
    pub const MINUS: u8 = 0x1c;
    pub const MOD: u8 = 0x1d;
    pub const MUL: u8 = 0x1e;
    pub const NEG: u8 = 0x1f;
    pub const NOT: u8 = 0x20;
    pub const OR: u8 = 0x21;
    pub const PLUS: u8 = 0x22;
    pub const PLUS_UCONST: u8 = 0x23;
    pub const SHL: u8 = 0x24;
    pub const SHR: u8 = 0x25;
    pub const SHRA: u8 = 0x26;
    pub const XOR: u8 = 0x27;
    pub const SKIP: u8 = 0x2f;
    pub const LIT0: u8 = 0x30;
    pub const LIT31: u8 = 0x4f;
    pub const REG0: u8 = 0x50;
    pub const REG31: u8 = 0x6f;
    pub const BREG0: u8 = 0x70;
    pub const BREG31: u8 = 0x8f;
    pub const REGX: u8 = 0x90;
    pub const FBREG: u8 = 0x91;
    pub const BREGX: u8 = 0x92;
    pub const PIECE: u8 = 0x93;
    pub const NOP: u8 = 0x96;
    pub const BIT_PIECE: u8 = 0x9d;
    pub const STACK_VALUE: u8 = 0x9f;
    /// Non-standard: emitted by LLVM's WebAssembly backend in place of the
    /// register-based opcodes DWARF has no use for on this target.
    pub const WASM_LOCATION: u8 = 0xed;
}

#[derive(Debug, thiserror::Error)]
pub enum LocationError {
    #[error("DW_OP_{0}: operand stack underflow")]
    StackUnderflow(&'static str),
    #[error("DW_OP_{0}: not supported for WebAssembly")]
    Unsupported(&'static str),
    #[error("DW_OP_{0}: {1}")]
    Malformed(&'static str, String),
    #[error("unknown DWARF opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("DW_OP_WASM_location: unknown wasm location kind {0}")]
    UnknownWasmLocationKind(u64),
    #[error("DW_OP_fbreg: function has no frame base expression")]
    NoFrameBase,
    #[error("expression ended with an empty operand stack")]
    EmptyResult,
}

pub type Result<T> = std::result::Result<T, LocationError>;

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Cursor { bytes, pos: 0 }
    }

    fn eof(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn u8(&mut self) -> Option<u8> {
        let b = *self.bytes.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn fixed(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return None;
        }
        let s = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Some(s)
    }

    fn u16(&mut self) -> Option<u16> {
        Some(u16::from_le_bytes(self.fixed(2)?.try_into().unwrap()))
    }
    fn i16(&mut self) -> Option<i16> {
        Some(i16::from_le_bytes(self.fixed(2)?.try_into().unwrap()))
    }
    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_le_bytes(self.fixed(4)?.try_into().unwrap()))
    }
    fn i32(&mut self) -> Option<i32> {
        Some(i32::from_le_bytes(self.fixed(4)?.try_into().unwrap()))
    }
    fn u64(&mut self) -> Option<u64> {
        Some(u64::from_le_bytes(self.fixed(8)?.try_into().unwrap()))
    }
    fn i64(&mut self) -> Option<i64> {
        Some(i64::from_le_bytes(self.fixed(8)?.try_into().unwrap()))
    }

    fn uleb128(&mut self) -> Option<u64> {
        let mut result: u64 = 0;
        let mut shift = 0;
        loop {
            let b = self.u8()?;
            result |= u64::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                return Some(result);
            }
            shift += 7;
        }
    }

    fn sleb128(&mut self) -> Option<i64> {
        let mut result: i64 = 0;
        let mut shift = 0;
        let mut b;
        loop {
            b = self.u8()?;
            result |= i64::from(b & 0x7f) << shift;
            shift += 7;
            if b & 0x80 == 0 {
                break;
            }
        }
        if shift < 64 && (b & 0x40) != 0 {
            result |= -1i64 << shift;
        }
        Some(result)
    }

    fn skip(&mut self, n: i64) {
        self.pos = (self.pos as i64 + n).max(0) as usize;
    }
}

/// The Wasm-local-vs-global-vs-operand-stack-slot discriminant used by
/// `DW_OP_WASM_location`'s first operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WasmLocationKind {
    Local,
    Global,
    OperandStack,
}

impl WasmLocationKind {
    fn from_u64(v: u64) -> Option<Self> {
        match v {
            0 => Some(WasmLocationKind::Local),
            1 => Some(WasmLocationKind::Global),
            2 => Some(WasmLocationKind::OperandStack),
            _ => None,
        }
    }
}

/// Gives the compiler access to the frame-base expression of the function
/// whose variables are being formatted, for `DW_OP_fbreg`.
pub trait FrameContext {
    fn frame_base_expression(&self) -> Option<&[u8]>;
}

impl FrameContext for () {
    fn frame_base_expression(&self) -> Option<&[u8]> {
        None
    }
}

/// Host capabilities the compiled expression calls out to: reading a byte
/// range of the debuggee's linear memory, and reading one of its locals.
/// Per the produced module's ABI, neither returns a value directly —
/// `get_memory` is `(offset: i32, size: i32, out_ptr: i32) -> ()` and
/// `get_local` is `(index: i32, out_ptr: i32) -> ()`; the host writes the
/// requested bytes into *this* module's own memory at `out_ptr`, which the
/// compiler then loads back from. `scratch_offset` is where the compiler is
/// allowed to stage these reads; the caller (the variable printer) owns
/// that memory region and guarantees nothing else uses it concurrently.
pub struct HostImports {
    pub get_memory: FunctionId,
    pub get_local: FunctionId,
    pub memory: MemoryId,
    pub scratch_offset: i32,
}

/// Compiles one DWARF location expression into the given instruction
/// sequence, leaving the resulting address on top of the Wasm operand stack
/// (as an `i32`) when it returns `Ok`.
pub struct LocationCompiler<'m, 'f> {
    locals: &'m mut ModuleLocals,
    imports: &'m HostImports,
    frame: &'f dyn FrameContext,
    stack: Vec<LocalId>,
}

impl<'m, 'f> LocationCompiler<'m, 'f> {
    pub fn new(
        locals: &'m mut ModuleLocals,
        imports: &'m HostImports,
        frame: &'f dyn FrameContext,
    ) -> Self {
        LocationCompiler {
            locals,
            imports,
            frame,
            stack: Vec::new(),
        }
    }

    /// Compiles `expr` onto `seq`, returning the local holding the final
    /// address/value. The local is also left on the Wasm stack via a
    /// trailing `local.get`, mirroring `DWARFLocationParser::parse`'s
    /// "result is the top of OperandStack" contract.
    pub fn compile(&mut self, seq: &mut InstrSeqBuilder, expr: &[u8]) -> Result<LocalId> {
        let mut cursor = Cursor::new(expr);
        while !cursor.eof() {
            let op = cursor.u8().expect("checked by eof()");
            self.step(seq, &mut cursor, op)?;
        }
        let result = *self.stack.last().ok_or(LocationError::EmptyResult)?;
        seq.local_get(result);
        Ok(result)
    }

    fn push_new(&mut self, seq: &mut InstrSeqBuilder) -> LocalId {
        let local = self.locals.add(ValType::I32);
        seq.local_set(local);
        self.stack.push(local);
        local
    }

    fn push_const(&mut self, seq: &mut InstrSeqBuilder, value: i32) {
        seq.i32_const(value);
        self.push_new(seq);
    }

    fn pop(&mut self, op: &'static str) -> Result<LocalId> {
        self.stack.pop().ok_or(LocationError::StackUnderflow(op))
    }

    fn peek(&self, op: &'static str, depth_from_top: usize) -> Result<LocalId> {
        let len = self.stack.len();
        if depth_from_top >= len {
            return Err(LocationError::StackUnderflow(op));
        }
        Ok(self.stack[len - 1 - depth_from_top])
    }

    fn binop(&mut self, seq: &mut InstrSeqBuilder, op: &'static str, wasm_op: BinaryOp) -> Result<()> {
        let rhs = self.pop(op)?;
        let lhs = self.pop(op)?;
        seq.local_get(lhs).local_get(rhs).binop(wasm_op);
        self.push_new(seq);
        Ok(())
    }

    fn step(&mut self, seq: &mut InstrSeqBuilder, cur: &mut Cursor, op: u8) -> Result<()> {
        use opcode::*;
        match op {
            ADDR => {
                let addr = cur
                    .u32()
                    .ok_or_else(|| LocationError::Malformed("addr", "truncated address".into()))?;
                self.push_const(seq, addr as i32);
            }
            CONST1U => {
                let v = cur.u8().ok_or_else(trunc("const1u"))?;
                self.push_const(seq, v as i32);
            }
            CONST1S => {
                let v = cur.u8().ok_or_else(trunc("const1s"))? as i8;
                self.push_const(seq, v as i32);
            }
            CONST2U => self.push_const(seq, cur.u16().ok_or_else(trunc("const2u"))? as i32),
            CONST2S => self.push_const(seq, cur.i16().ok_or_else(trunc("const2s"))? as i32),
            CONST4U => self.push_const(seq, cur.u32().ok_or_else(trunc("const4u"))? as i32),
            CONST4S => self.push_const(seq, cur.i32().ok_or_else(trunc("const4s"))?),
            CONST8U => self.push_const(seq, cur.u64().ok_or_else(trunc("const8u"))? as i32),
            CONST8S => self.push_const(seq, cur.i64().ok_or_else(trunc("const8s"))? as i32),
            CONSTU => self.push_const(seq, cur.uleb128().ok_or_else(trunc("constu"))? as i32),
            CONSTS => self.push_const(seq, cur.sleb128().ok_or_else(trunc("consts"))? as i32),

            LIT0..=LIT31 => self.push_const(seq, (op - LIT0) as i32),

            DUP => {
                let top = self.peek("dup", 0)?;
                seq.local_get(top);
                self.push_new(seq);
            }
            DROP => {
                self.pop("drop")?;
            }
            OVER => {
                let v = self.peek("over", 1)?;
                seq.local_get(v);
                self.push_new(seq);
            }
            PICK => {
                let idx = cur.u8().ok_or_else(trunc("pick"))? as usize;
                let v = self.peek("pick", idx)?;
                seq.local_get(v);
                self.push_new(seq);
            }
            SWAP => {
                let a = self.pop("swap")?;
                let b = self.pop("swap")?;
                self.stack.push(a);
                self.stack.push(b);
            }
            ROT => {
                let a = self.pop("rot")?;
                let b = self.pop("rot")?;
                let c = self.pop("rot")?;
                self.stack.push(a);
                self.stack.push(c);
                self.stack.push(b);
            }

            AND => self.binop(seq, "and", BinaryOp::I32And)?,
            OR => self.binop(seq, "or", BinaryOp::I32Or)?,
            XOR => self.binop(seq, "xor", BinaryOp::I32Xor)?,
            PLUS => self.binop(seq, "plus", BinaryOp::I32Add)?,
            MINUS => self.binop(seq, "minus", BinaryOp::I32Sub)?,
            MUL => self.binop(seq, "mul", BinaryOp::I32Mul)?,
            DIV => self.binop(seq, "div", BinaryOp::I32DivS)?,
            MOD => self.binop(seq, "mod", BinaryOp::I32RemS)?,
            SHL => self.binop(seq, "shl", BinaryOp::I32Shl)?,
            SHR => self.binop(seq, "shr", BinaryOp::I32ShrU)?,
            SHRA => self.binop(seq, "shra", BinaryOp::I32ShrS)?,

            NEG => {
                let v = self.pop("neg")?;
                seq.i32_const(0).local_get(v).binop(BinaryOp::I32Sub);
                self.push_new(seq);
            }
            // Preserves the original's bug: `parseNot` emits arithmetic
            // negation, the same code as `neg`, not a bitwise complement.
            NOT => {
                let v = self.pop("not")?;
                seq.i32_const(0).local_get(v).binop(BinaryOp::I32Sub);
                self.push_new(seq);
            }

            PLUS_UCONST => {
                let c = cur.uleb128().ok_or_else(trunc("plus_uconst"))?;
                let v = self.pop("plus_uconst")?;
                seq.local_get(v).i32_const(c as i32).binop(BinaryOp::I32Add);
                self.push_new(seq);
            }

            SKIP => {
                let delta = cur.i16().ok_or_else(trunc("skip"))?;
                cur.skip(delta as i64);
            }

            FBREG => {
                let fb = self
                    .frame
                    .frame_base_expression()
                    .ok_or(LocationError::NoFrameBase)?
                    .to_vec();
                let offset = cur.sleb128().ok_or_else(trunc("fbreg"))?;
                let mut sub = LocationCompiler::new(&mut *self.locals, self.imports, &());
                let base = sub.compile(seq, &fb)?;
                seq.local_get(base).i32_const(offset as i32).binop(BinaryOp::I32Add);
                self.push_new(seq);
            }

            DEREF => {
                let addr = self.pop("deref")?;
                let scratch = self.imports.scratch_offset;
                seq.local_get(addr).i32_const(4).i32_const(scratch).call(self.imports.get_memory);
                seq.i32_const(0)
                    .load(self.imports.memory, LoadKind::I32 { atomic: false }, MemArg { align: 2, offset: scratch as u32 });
                self.push_new(seq);
            }

            NOP => {}
            STACK_VALUE => {
                // Marks the top-of-stack as a value rather than an address;
                // the printer checks for this via `is_stack_value` below, so
                // there is nothing to emit here.
            }

            WASM_LOCATION => {
                let kind_raw = cur.uleb128().ok_or_else(trunc("WASM_location"))?;
                let kind = WasmLocationKind::from_u64(kind_raw)
                    .ok_or(LocationError::UnknownWasmLocationKind(kind_raw))?;
                let index = cur.uleb128().ok_or_else(trunc("WASM_location"))?;
                match kind {
                    WasmLocationKind::Local => {
                        let scratch = self.imports.scratch_offset;
                        seq.i32_const(index as i32).i32_const(scratch).call(self.imports.get_local);
                        seq.i32_const(0).load(
                            self.imports.memory,
                            LoadKind::I32 { atomic: false },
                            MemArg { align: 2, offset: scratch as u32 },
                        );
                        self.push_new(seq);
                    }
                    WasmLocationKind::Global => {
                        return Err(LocationError::Malformed(
                            "WASM_location",
                            "global locations are not implemented".into(),
                        ))
                    }
                    WasmLocationKind::OperandStack => {
                        return Err(LocationError::Malformed(
                            "WASM_location",
                            "operand-stack locations are not implemented".into(),
                        ))
                    }
                }
            }

            PIECE => return Err(LocationError::Unsupported("piece")),
            BIT_PIECE => return Err(LocationError::Unsupported("bit_piece")),
            REG0..=REG31 | REGX => return Err(LocationError::Unsupported("reg")),
            BREG0..=BREG31 | BREGX => return Err(LocationError::Unsupported("breg")),

            other => return Err(LocationError::UnknownOpcode(other)),
        }
        Ok(())
    }
}

fn trunc(op: &'static str) -> impl FnOnce() -> LocationError {
    move || LocationError::Malformed(op, "truncated operand".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use walrus::{FunctionBuilder, ModuleConfig, ValType as VT};

    fn harness() -> (Module, HostImports) {
        let mut module = Module::with_config(ModuleConfig::new());
        let memory = module.memories.add_local(false, false, 1, None);
        let mem_ty = module.types.add(&[VT::I32, VT::I32, VT::I32], &[]);
        let (get_memory, _) = module.add_import_func("env", "__getMemory", mem_ty);
        let loc_ty = module.types.add(&[VT::I32, VT::I32], &[]);
        let (get_local, _) = module.add_import_func("env", "__getLocal", loc_ty);
        (
            module,
            HostImports {
                get_memory,
                get_local,
                memory,
                scratch_offset: 19,
            },
        )
    }

    #[test]
    fn compiles_addr_plus_uconst() {
        let (mut module, imports) = harness();
        let mut builder = FunctionBuilder::new(&mut module.types, &[], &[VT::I32]);
        let expr = {
            let mut bytes = vec![opcode::ADDR];
            bytes.extend_from_slice(&100u32.to_le_bytes());
            bytes.push(opcode::PLUS_UCONST);
            bytes.push(5);
            bytes
        };
        let result = {
            let seq = builder.func_body();
            let compiler = LocationCompiler::new(&mut module.locals, &imports, &());
            compiler.compile(seq, &expr).expect("compiles")
        };
        let _ = result;
        let _function_id = builder.finish(vec![], &mut module.funcs);
    }

    #[test]
    fn not_compiles_like_neg() {
        let (mut module, imports) = harness();
        let mut builder = FunctionBuilder::new(&mut module.types, &[], &[VT::I32]);
        let expr_not = vec![opcode::LIT0 + 5, opcode::NOT];
        let seq = builder.func_body();
        let compiler = LocationCompiler::new(&mut module.locals, &imports, &());
        // `not` must not fail or behave as a bitwise complement; it should
        // compile the same way `neg` does (see the comment on the NOT arm).
        compiler.compile(seq, &expr_not).expect("compiles like neg");
    }

    #[test]
    fn pick_rejects_underflow() {
        let (mut module, imports) = harness();
        let mut builder = FunctionBuilder::new(&mut module.types, &[], &[VT::I32]);
        let expr = vec![opcode::PICK, 3];
        let seq = builder.func_body();
        let compiler = LocationCompiler::new(&mut module.locals, &imports, &());
        let err = compiler.compile(seq, &expr).unwrap_err();
        assert!(matches!(err, LocationError::StackUnderflow("pick")));
    }

    #[test]
    fn unknown_wasm_location_kind_is_reported() {
        let (mut module, imports) = harness();
        let mut builder = FunctionBuilder::new(&mut module.types, &[], &[VT::I32]);
        let expr = vec![opcode::WASM_LOCATION, 9, 0];
        let seq = builder.func_body();
        let compiler = LocationCompiler::new(&mut module.locals, &imports, &());
        let err = compiler.compile(seq, &expr).unwrap_err();
        assert!(matches!(err, LocationError::UnknownWasmLocationKind(9)));
    }

    #[test]
    fn register_opcodes_are_unsupported() {
        let (mut module, imports) = harness();
        let mut builder = FunctionBuilder::new(&mut module.types, &[], &[VT::I32]);
        let expr = vec![opcode::REG0];
        let seq = builder.func_body();
        let compiler = LocationCompiler::new(&mut module.locals, &imports, &());
        let err = compiler.compile(seq, &expr).unwrap_err();
        assert!(matches!(err, LocationError::Unsupported("reg")));
    }
}
