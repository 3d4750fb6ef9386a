//! Bytecode representation for the karst virtual machine.
//!
//! A compiled module is a [`Bytecode`] object: one flat, growable byte array
//! shared by every function, plus the side tables that mediate between the
//! compiler and the VM — a constant pool, a function-stub table, the symbol
//! table, and a source-location map keyed by bytecode address.
//!
//! # Encoding
//!
//! The first byte of each instruction is the [`Op`] discriminant; operands
//! follow immediately, multi-byte operands in **little-endian** order.
//! Instruction width derives from the opcode (see [`instr_width`]).
//! `OP_JUMP` and `OP_CJUMP` take a signed 16-bit displacement relative to the
//! end of the instruction: the target is `addr + 3 + offset`.

use crate::token::SourceLoc;
use crate::value::{SymbolId, SymbolTable, Value};

// ─────────────────────────────────────────────────────────────────────────────
// Opcodes
// ─────────────────────────────────────────────────────────────────────────────

/// Every instruction the karst VM can execute.
///
/// Stack operands are consumed (popped) unless noted otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    /// Do nothing.
    Nop = 0x00,
    /// Pop one value; it lands in the VM's last-pop register.
    Pop = 0x01,
    /// Push `stack[bp + slot]`.  Operand: u8 slot.
    Local = 0x02,
    /// Store the popped value into `stack[bp + slot]`.  Operand: u8 slot.
    SetLocal = 0x03,
    /// Duplicate the value at the given depth from the top.  Operand: u8.
    Copy = 0x04,
    /// Push the current closure's upvalue.  Operand: u8 id.
    Upvalue = 0x05,
    /// Store the popped value through an upvalue.  Operand: u8 id.
    SetUpvalue = 0x06,
    /// Instantiate a closure from a function stub.  Operand: u16 stub id.
    Closure = 0x07,
    /// Pop n slots, closing any upvalues above the new stack top.
    /// Operand: u8 n.
    Close = 0x08,
    /// Pop a name (symbol), push the global bound to it.
    Global = 0x10,
    /// Pop a value then a name; bind the global.  Leaves the name on the
    /// stack.
    SetGlobal = 0x11,
    /// Push a constant.  Operand: u16 constant id.
    Const = 0x12,
    /// Push `null`.
    Null = 0x13,
    /// Push `false`.
    False = 0x14,
    /// Push `true`.
    True = 0x15,
    /// Pop a key then an object; push the property value.
    ObjGet = 0x16,
    /// Pop a new value, a key, and an object; set the property and push the
    /// new value back.
    ObjSet = 0x17,
    /// Reserved.
    Module = 0x18,
    /// Reserved.
    Import = 0x19,
    /// `ip = addr + 3 + offset`.  Operand: i16 offset.
    Jump = 0x30,
    /// Pop; jump as `Jump` if the value is falsy.  Operand: i16 offset.
    CJump = 0x31,
    /// Call the value below the arguments.  Operand: u8 argc.
    Call = 0x32,
    /// Return from the current function.
    Return = 0x33,
    /// Reserved (call with a trailing argument list spliced in).
    Apply = 0x34,
}

impl TryFrom<u8> for Op {
    type Error = u8;
    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0x00 => Ok(Op::Nop),
            0x01 => Ok(Op::Pop),
            0x02 => Ok(Op::Local),
            0x03 => Ok(Op::SetLocal),
            0x04 => Ok(Op::Copy),
            0x05 => Ok(Op::Upvalue),
            0x06 => Ok(Op::SetUpvalue),
            0x07 => Ok(Op::Closure),
            0x08 => Ok(Op::Close),
            0x10 => Ok(Op::Global),
            0x11 => Ok(Op::SetGlobal),
            0x12 => Ok(Op::Const),
            0x13 => Ok(Op::Null),
            0x14 => Ok(Op::False),
            0x15 => Ok(Op::True),
            0x16 => Ok(Op::ObjGet),
            0x17 => Ok(Op::ObjSet),
            0x18 => Ok(Op::Module),
            0x19 => Ok(Op::Import),
            0x30 => Ok(Op::Jump),
            0x31 => Ok(Op::CJump),
            0x32 => Ok(Op::Call),
            0x33 => Ok(Op::Return),
            0x34 => Ok(Op::Apply),
            other => Err(other),
        }
    }
}

/// Width in bytes of an instruction plus its operands.
pub fn instr_width(op: Op) -> u32 {
    match op {
        Op::Nop
        | Op::Pop
        | Op::Global
        | Op::SetGlobal
        | Op::Null
        | Op::False
        | Op::True
        | Op::ObjGet
        | Op::ObjSet
        | Op::Module
        | Op::Import
        | Op::Return => 1,
        Op::Local
        | Op::SetLocal
        | Op::Copy
        | Op::Upvalue
        | Op::SetUpvalue
        | Op::Close
        | Op::Call
        | Op::Apply => 2,
        Op::Const | Op::Closure | Op::Jump | Op::CJump => 3,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Function stubs
// ─────────────────────────────────────────────────────────────────────────────

/// Where a closure sources one captured variable when it is instantiated:
/// from the enclosing frame's stack (`direct`) or from the enclosing
/// closure's own upvalue array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalueDesc {
    /// A local slot (if `direct`) or an upvalue id of the enclosing function.
    pub slot: u8,
    pub direct: bool,
}

/// Compile-time description of a function, shared by every closure
/// instantiated from the same source `fn` form.
#[derive(Debug, Clone)]
pub struct FuncStub {
    /// Parameter names in declaration order.
    pub positional: Vec<SymbolId>,
    /// Index of the first optional parameter; equals `positional.len()` when
    /// every parameter is required.
    pub optional_index: u8,
    /// Whether the function accepts a variadic list argument.
    pub var_list: bool,
    /// Whether the function accepts a variadic table argument.
    pub var_table: bool,
    /// Upvalue descriptors, in capture order.
    pub upvals: Vec<UpvalueDesc>,
    /// The namespace the function was defined in.
    pub ns: Value,
    /// Bytecode address of the function body.
    pub addr: u32,
}

impl FuncStub {
    /// Number of required arguments.
    #[inline]
    pub fn required(&self) -> u8 {
        self.optional_index
    }

    #[inline]
    pub fn num_upvals(&self) -> u8 {
        self.upvals.len() as u8
    }

    /// Register an upvalue and return its id.  Idempotent per
    /// `(slot, direct)` pair.
    pub fn get_upvalue(&mut self, slot: u8, direct: bool) -> u8 {
        for (i, u) in self.upvals.iter().enumerate() {
            if u.slot == slot && u.direct == direct {
                return i as u8;
            }
        }
        let id = self.upvals.len() as u8;
        self.upvals.push(UpvalueDesc { slot, direct });
        id
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Source map
// ─────────────────────────────────────────────────────────────────────────────

/// One source-map region.  `upper` is the first bytecode address *not*
/// covered by this entry; the most recent entry is open-ended and carries the
/// sentinel `0`.
#[derive(Debug, Clone)]
struct SourceMapEntry {
    upper: u32,
    loc: SourceLoc,
}

// ─────────────────────────────────────────────────────────────────────────────
// Bytecode
// ─────────────────────────────────────────────────────────────────────────────

/// The compiled artifact: instruction bytes plus side tables.
///
/// Addresses are indices into the byte array and stay stable as the array
/// grows.
#[derive(Debug, Default)]
pub struct Bytecode {
    data: Vec<u8>,
    constants: Vec<Value>,
    functions: Vec<FuncStub>,
    /// The module's symbol table (interning delegates here).
    pub symbols: SymbolTable,
    locs: Vec<SourceMapEntry>,
}

impl Bytecode {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Writing ──────────────────────────────────────────────────────────────

    /// Current size, which is also the address the next write lands at.
    #[inline]
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    #[inline]
    pub fn write_byte(&mut self, b: u8) {
        self.data.push(b);
    }

    #[inline]
    pub fn write_op(&mut self, op: Op) {
        self.write_byte(op as u8);
    }

    /// Append a 16-bit value, little-endian.
    #[inline]
    pub fn write_short(&mut self, s: u16) {
        let [lo, hi] = s.to_le_bytes();
        self.write_byte(lo);
        self.write_byte(hi);
    }

    // ── Reading ──────────────────────────────────────────────────────────────

    #[inline]
    pub fn read_byte(&self, addr: u32) -> u8 {
        self.data[addr as usize]
    }

    /// Read a 16-bit value, little-endian.
    #[inline]
    pub fn read_short(&self, addr: u32) -> u16 {
        u16::from_le_bytes([self.data[addr as usize], self.data[addr as usize + 1]])
    }

    /// Overwrite a previously written short (jump backfilling).
    pub fn patch_short(&mut self, addr: u32, s: u16) {
        let [lo, hi] = s.to_le_bytes();
        self.data[addr as usize] = lo;
        self.data[addr as usize + 1] = hi;
    }

    /// Roll the byte array back to `size`, discarding a partially emitted
    /// form after a compile error.  Constants and stubs registered by the
    /// aborted form stay in their tables; nothing references them.
    pub fn truncate(&mut self, size: u32) {
        self.data.truncate(size as usize);
    }

    // ── Constant pool ────────────────────────────────────────────────────────

    /// Register a constant and return its id.  Constants are not
    /// de-duplicated.
    pub fn add_constant(&mut self, v: Value) -> u16 {
        let id = self.constants.len();
        assert!(id < 0x1_0000, "constant pool overflow");
        self.constants.push(v);
        id as u16
    }

    /// Register a numeric constant.
    pub fn num_const(&mut self, n: f64) -> u16 {
        self.add_constant(Value::number(n))
    }

    /// Register a symbol constant.
    pub fn sym_const(&mut self, id: SymbolId) -> u16 {
        self.add_constant(Value::symbol(id))
    }

    pub fn get_constant(&self, id: u16) -> Option<Value> {
        self.constants.get(id as usize).copied()
    }

    #[inline]
    pub fn num_constants(&self) -> u16 {
        self.constants.len() as u16
    }

    // ── Function stubs ───────────────────────────────────────────────────────

    /// Register a stub for a function whose body starts at the current write
    /// position.  Returns the stub id used by `OP_CLOSURE`.
    pub fn add_function(&mut self, positional: Vec<SymbolId>, ns: Value) -> u16 {
        let id = self.functions.len();
        assert!(id < 0x1_0000, "function table overflow");
        let optional_index = positional.len() as u8;
        self.functions.push(FuncStub {
            positional,
            optional_index,
            var_list: false,
            var_table: false,
            upvals: Vec::new(),
            ns,
            addr: self.size(),
        });
        id as u16
    }

    pub fn function(&self, id: u16) -> Option<&FuncStub> {
        self.functions.get(id as usize)
    }

    pub fn function_mut(&mut self, id: u16) -> Option<&mut FuncStub> {
        self.functions.get_mut(id as usize)
    }

    #[inline]
    pub fn num_functions(&self) -> u16 {
        self.functions.len() as u16
    }

    // ── Symbols ──────────────────────────────────────────────────────────────

    /// Intern a name and return its id.
    pub fn intern(&mut self, name: &str) -> SymbolId {
        self.symbols.intern(name)
    }

    /// Intern a name and return it as a tagged symbol value.
    pub fn symbol_value(&mut self, name: &str) -> Value {
        Value::symbol(self.symbols.intern(name))
    }

    // ── Source map ───────────────────────────────────────────────────────────

    /// Declare that bytes written from here on originate at `loc`.  Closes
    /// the previous region by stamping its upper bound with the current size.
    pub fn set_loc(&mut self, loc: SourceLoc) {
        let size = self.size();
        let n = self.locs.len();
        if n > 0 {
            if self.locs[n - 1].loc == loc {
                return;
            }
            // If the open region covers no bytes yet, retarget it in place
            // instead of leaving a zero-width entry behind.
            let open_start = if n >= 2 { self.locs[n - 2].upper } else { 0 };
            if open_start == size {
                self.locs[n - 1].loc = loc;
                return;
            }
            self.locs[n - 1].upper = size;
        }
        self.locs.push(SourceMapEntry { upper: 0, loc });
    }

    /// The source location of the instruction at `addr`: the first entry
    /// whose upper bound exceeds the address, or the open-ended tail.
    pub fn location_of(&self, addr: u32) -> Option<SourceLoc> {
        for entry in &self.locs {
            if entry.upper > addr || entry.upper == 0 {
                return Some(entry.loc.clone());
            }
        }
        None
    }

    // ── Disassembly ──────────────────────────────────────────────────────────

    /// Render the whole byte array as human-readable text.  Debugging aid;
    /// never used during normal execution.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let mut addr = 0u32;
        while addr < self.size() {
            let (text, width) = self.disassemble_instruction(addr);
            out.push_str(&format!("{addr:04x}  {text}\n"));
            addr += width;
        }
        out
    }

    /// Disassemble the single instruction at `addr`, returning the rendered
    /// text and the instruction width.
    pub fn disassemble_instruction(&self, addr: u32) -> (String, u32) {
        let byte = self.read_byte(addr);
        let op = match Op::try_from(byte) {
            Ok(op) => op,
            Err(b) => return (format!("UNKNOWN({b:#04x})"), 1),
        };
        let width = instr_width(op);
        let text = match width {
            1 => format!("{op:?}"),
            2 => format!("{op:?} {}", self.read_byte(addr + 1)),
            _ => match op {
                Op::Const => {
                    let id = self.read_short(addr + 1);
                    let rendered = self
                        .get_constant(id)
                        .map(|v| crate::value::display_value(v, &self.symbols))
                        .unwrap_or_else(|| "<oob>".to_string());
                    format!("{op:?} [{id}] = {rendered}")
                }
                Op::Closure => {
                    let id = self.read_short(addr + 1);
                    format!("{op:?} fn#{id}")
                }
                Op::Jump | Op::CJump => {
                    let offset = self.read_short(addr + 1) as i16;
                    let target = addr as i64 + 3 + offset as i64;
                    format!("{op:?} {offset:+} -> {target:04x}")
                }
                _ => format!("{op:?}"),
            },
        };
        (text, width)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
