//! opcode.rs — Opcodes of the Vitte register machine (spec §4.4).
//!
//! The spec describes a literal 32-bit instruction word (`bits 0-7
//! opcode, 8-15 A, 16-23 B, 24-31 C`, with ABx/jump forms folding B
//! and C into one 16-bit field, and a few variable-length forms
//! trailing a 64-bit literal). §6 leaves the wire format
//! implementer-defined ("Implementer-defined, but must be a stable
//! serialization"); rather than hand-packing bytes the way a C VM
//! would, we let each `Op` variant carry its operands as typed Rust
//! fields (`Reg`, `ConstIx`, …) occupying the same semantic roles as
//! the spec's A/B/C/Bx, and get the "stable serialization" from
//! `serde`/`bincode` over the enum directly — exactly how the
//! teacher's own `bytecode::op::Op` does it. See `DESIGN.md` for the
//! reasoning.
//!
//! **Compat:** like the teacher's `Op`, this enum's bincode encoding
//! depends on variant order — add new variants at the bottom.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use core::fmt;

/// Register index — one VM stack slot relative to the frame's `stack_base`.
pub type Reg = u8;
/// Index into a chunk's constant pool.
pub type ConstIx = u16;
/// Index into a closure's upvalue array.
pub type UpvalueIx = u16;
/// Index into `VmState::globalSlots`.
pub type GlobalSlotIx = u16;
/// Index into the function-constant table (for `Closure`).
pub type FuncIx = u32;

/// The binary arithmetic family: `+ − × ÷ %`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl ArithOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            ArithOp::Add => "add",
            ArithOp::Sub => "sub",
            ArithOp::Mul => "mul",
            ArithOp::Div => "div",
            ArithOp::Mod => "mod",
        }
    }
}

/// Bitwise family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BitOp {
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

impl BitOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            BitOp::And => "band",
            BitOp::Or => "bor",
            BitOp::Xor => "bxor",
            BitOp::Shl => "shl",
            BitOp::Shr => "shr",
        }
    }
}

/// The six comparison predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            CmpOp::Eq => "eq",
            CmpOp::Ne => "ne",
            CmpOp::Lt => "lt",
            CmpOp::Le => "le",
            CmpOp::Gt => "gt",
            CmpOp::Ge => "ge",
        }
    }

    pub fn eval(self, ord: core::cmp::Ordering, numerically_equal: bool) -> bool {
        use core::cmp::Ordering::*;
        match self {
            CmpOp::Eq => numerically_equal,
            CmpOp::Ne => !numerically_equal,
            CmpOp::Lt => ord == Less,
            CmpOp::Le => ord != Greater,
            CmpOp::Gt => ord == Greater,
            CmpOp::Ge => ord != Less,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum IncDecKind {
    PreInc,
    PreDec,
    PostInc,
    PostDec,
}

/// Vitte's register-machine instruction set (spec §4.4).
///
/// Forms, per the spec: ABC (three registers), AB, ABx (one register
/// + a 16-bit index/offset), A-only, and the handful of
/// variable-length forms that carry a 64-bit literal inline
/// (`*RL` arithmetic/comparison/branch variants below).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Op {
    // ----- Structure -----
    Nop,
    /// `RET Ra` — return the value in register A.
    Return { src: Reg },
    /// `RET` with no operand — implicit-null return.
    ReturnNull,

    // ----- Move / constants / literals -----
    Move { dst: Reg, src: Reg },
    LoadConst { dst: Reg, k: ConstIx },
    LoadNull { dst: Reg },
    LoadTrue { dst: Reg },
    LoadFalse { dst: Reg },

    // ----- Arithmetic: reg/reg, reg/imm, reg/lit64 -----
    ArithRR { op: ArithOp, dst: Reg, lhs: Reg, rhs: Reg },
    ArithRI { op: ArithOp, dst: Reg, lhs: Reg, imm: i16 },
    ArithRL { op: ArithOp, dst: Reg, lhs: Reg, lit: f64 },

    // ----- Bitwise (reg/reg) -----
    BitRR { op: BitOp, dst: Reg, lhs: Reg, rhs: Reg },

    // ----- Unary -----
    Neg { dst: Reg, src: Reg },
    Not { dst: Reg, src: Reg },
    BitNot { dst: Reg, src: Reg },

    // ----- Comparison: reg/reg, reg/imm, reg/lit64 -----
    CmpRR { op: CmpOp, dst: Reg, lhs: Reg, rhs: Reg },
    CmpRI { op: CmpOp, dst: Reg, lhs: Reg, imm: i16 },
    CmpRL { op: CmpOp, dst: Reg, lhs: Reg, lit: f64 },

    // ----- Jumps -----
    Jump { offset: i32 },
    JumpIfFalse { cond: Reg, offset: i32 },
    JumpIfTrue { cond: Reg, offset: i32 },

    // ----- Fused branch-and-compare: reg/reg, reg/imm, reg/lit64 -----
    BranchCmpRR { op: CmpOp, lhs: Reg, rhs: Reg, offset: i32 },
    BranchCmpRI { op: CmpOp, lhs: Reg, imm: i16, offset: i32 },
    BranchCmpRL { op: CmpOp, lhs: Reg, lit: f64, offset: i32 },

    // ----- Globals: direct / cached / slot-write-through-bypassing -----
    GetGlobal { dst: Reg, name: ConstIx },
    SetGlobal { name: ConstIx, src: Reg },
    GetGlobalCached { dst: Reg, slot: GlobalSlotIx },
    SetGlobalCached { slot: GlobalSlotIx, src: Reg },
    SlotSetGlobal { slot: GlobalSlotIx, src: Reg },

    // ----- Closures / upvalues -----
    Closure { dst: Reg, func: FuncIx },
    GetUpvalue { dst: Reg, up: UpvalueIx },
    SetUpvalue { up: UpvalueIx, src: Reg },
    SlotGetUpvalue { dst: Reg, up: UpvalueIx },
    SlotSetUpvalue { up: UpvalueIx, src: Reg },
    CloseUpvalue { at: Reg },
    CloseFrameUpvalues,

    // ----- Calls -----
    Call { callee: Reg, argc: u8 },
    TailCall { callee: Reg, argc: u8 },
    TailCallSelf { argc: u8 },
    SmartTailCall { callee: Reg, argc: u8 },

    // ----- Lists -----
    NewList { dst: Reg },
    ListAppend { list: Reg, value: Reg },
    ListSpread { list: Reg, iterable: Reg },
    ListGet { dst: Reg, list: Reg, index: Reg },
    ListSet { list: Reg, index: Reg, value: Reg },

    // ----- Maps -----
    NewMap { dst: Reg },
    MapSet { map: Reg, key: Reg, value: Reg },
    MapSpread { map: Reg, iterable: Reg },
    MapGet { dst: Reg, map: Reg, key: Reg },

    // ----- Structs -----
    NewStruct { dst: Reg, schema: ConstIx },
    StructGetField { dst: Reg, instance: Reg, field: ConstIx },
    StructSetField { instance: Reg, field: ConstIx, value: Reg },

    // ----- Dispatcher (native overload set) -----
    NewDispatcher { dst: Reg, name: ConstIx },

    // ----- References (five flavors) + deref get/set -----
    MakeRef { dst: Reg, target: Reg },
    SlotMakeRef { dst: Reg, target: Reg },
    MakeGlobalRef { dst: Reg, name: ConstIx },
    MakeIndexRef { dst: Reg, container: Reg, index: Reg },
    MakePropertyRef { dst: Reg, container: Reg, key: Reg },
    DerefGet { dst: Reg, r: Reg },
    DerefSet { r: Reg, value: Reg },
    SlotDerefSet { r: Reg, value: Reg },

    // ----- Pre/post increment/decrement -----
    IncDec { kind: IncDecKind, dst: Reg, src: Reg },

    // ----- typeof -----
    TypeOf { dst: Reg, src: Reg },

    // ----- Debug / I/O (dev) -----
    Print { src: Reg },

    // ----- Control-effect opcodes (§4.7) -----
    PushPrompt { tag: Reg },
    PopPrompt,
    Capture { dst: Reg, tag: Reg },
    Resume { dst: Reg, cont: Reg, value: Reg },
    Abort { tag: Reg, value: Reg },
    Shift { dst: Reg, tag: Reg, handler: Reg },
}

impl Op {
    /// Is this a control-transfer instruction that may move `ip`
    /// somewhere other than the next instruction?
    pub fn is_jump(&self) -> bool {
        matches!(
            self,
            Op::Jump { .. }
                | Op::JumpIfFalse { .. }
                | Op::JumpIfTrue { .. }
                | Op::BranchCmpRR { .. }
                | Op::BranchCmpRI { .. }
                | Op::BranchCmpRL { .. }
        )
    }

    /// Does this instruction end the current frame's execution
    /// outright (a block/trace terminator)?
    pub fn is_terminator(&self) -> bool {
        matches!(self, Op::Return { .. } | Op::ReturnNull)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Nop => write!(f, "nop"),
            Op::Return { src } => write!(f, "ret r{src}"),
            Op::ReturnNull => write!(f, "retn"),
            Op::Move { dst, src } => write!(f, "mov r{dst}, r{src}"),
            Op::LoadConst { dst, k } => write!(f, "ldc r{dst}, k{k}"),
            Op::LoadNull { dst } => write!(f, "ldnull r{dst}"),
            Op::LoadTrue { dst } => write!(f, "ldtrue r{dst}"),
            Op::LoadFalse { dst } => write!(f, "ldfalse r{dst}"),
            Op::ArithRR { op, dst, lhs, rhs } => {
                write!(f, "{} r{dst}, r{lhs}, r{rhs}", op.mnemonic())
            }
            Op::ArithRI { op, dst, lhs, imm } => {
                write!(f, "{}i r{dst}, r{lhs}, {imm}", op.mnemonic())
            }
            Op::ArithRL { op, dst, lhs, lit } => {
                write!(f, "{}l r{dst}, r{lhs}, {lit}", op.mnemonic())
            }
            Op::BitRR { op, dst, lhs, rhs } => write!(f, "{} r{dst}, r{lhs}, r{rhs}", op.mnemonic()),
            Op::Neg { dst, src } => write!(f, "neg r{dst}, r{src}"),
            Op::Not { dst, src } => write!(f, "not r{dst}, r{src}"),
            Op::BitNot { dst, src } => write!(f, "bnot r{dst}, r{src}"),
            Op::CmpRR { op, dst, lhs, rhs } => write!(f, "{} r{dst}, r{lhs}, r{rhs}", op.mnemonic()),
            Op::CmpRI { op, dst, lhs, imm } => write!(f, "{}i r{dst}, r{lhs}, {imm}", op.mnemonic()),
            Op::CmpRL { op, dst, lhs, lit } => write!(f, "{}l r{dst}, r{lhs}, {lit}", op.mnemonic()),
            Op::Jump { offset } => write!(f, "jmp {offset:+}"),
            Op::JumpIfFalse { cond, offset } => write!(f, "jz r{cond}, {offset:+}"),
            Op::JumpIfTrue { cond, offset } => write!(f, "jnz r{cond}, {offset:+}"),
            Op::BranchCmpRR { op, lhs, rhs, offset } => {
                write!(f, "b{} r{lhs}, r{rhs}, {offset:+}", op.mnemonic())
            }
            Op::BranchCmpRI { op, lhs, imm, offset } => {
                write!(f, "b{}i r{lhs}, {imm}, {offset:+}", op.mnemonic())
            }
            Op::BranchCmpRL { op, lhs, lit, offset } => {
                write!(f, "b{}l r{lhs}, {lit}, {offset:+}", op.mnemonic())
            }
            Op::GetGlobal { dst, name } => write!(f, "gget r{dst}, k{name}"),
            Op::SetGlobal { name, src } => write!(f, "gset k{name}, r{src}"),
            Op::GetGlobalCached { dst, slot } => write!(f, "ggetc r{dst}, s{slot}"),
            Op::SetGlobalCached { slot, src } => write!(f, "gsetc s{slot}, r{src}"),
            Op::SlotSetGlobal { slot, src } => write!(f, "gsets s{slot}, r{src}"),
            Op::Closure { dst, func } => write!(f, "clo r{dst}, f{func}"),
            Op::GetUpvalue { dst, up } => write!(f, "ugetr{dst}, u{up}"),
            Op::SetUpvalue { up, src } => write!(f, "uset u{up}, r{src}"),
            Op::SlotGetUpvalue { dst, up } => write!(f, "ugets r{dst}, u{up}"),
            Op::SlotSetUpvalue { up, src } => write!(f, "usets u{up}, r{src}"),
            Op::CloseUpvalue { at } => write!(f, "cupval r{at}"),
            Op::CloseFrameUpvalues => write!(f, "cupvalf"),
            Op::Call { callee, argc } => write!(f, "call r{callee}, {argc}"),
            Op::TailCall { callee, argc } => write!(f, "tcall r{callee}, {argc}"),
            Op::TailCallSelf { argc } => write!(f, "tcallself {argc}"),
            Op::SmartTailCall { callee, argc } => write!(f, "stcall r{callee}, {argc}"),
            Op::NewList { dst } => write!(f, "newlist r{dst}"),
            Op::ListAppend { list, value } => write!(f, "lapp r{list}, r{value}"),
            Op::ListSpread { list, iterable } => write!(f, "lspread r{list}, r{iterable}"),
            Op::ListGet { dst, list, index } => write!(f, "lget r{dst}, r{list}, r{index}"),
            Op::ListSet { list, index, value } => write!(f, "lset r{list}, r{index}, r{value}"),
            Op::NewMap { dst } => write!(f, "newmap r{dst}"),
            Op::MapSet { map, key, value } => write!(f, "mset r{map}, r{key}, r{value}"),
            Op::MapSpread { map, iterable } => write!(f, "mspread r{map}, r{iterable}"),
            Op::MapGet { dst, map, key } => write!(f, "mget r{dst}, r{map}, r{key}"),
            Op::NewStruct { dst, schema } => write!(f, "newstruct r{dst}, k{schema}"),
            Op::StructGetField { dst, instance, field } => {
                write!(f, "sfget r{dst}, r{instance}, k{field}")
            }
            Op::StructSetField { instance, field, value } => {
                write!(f, "sfset r{instance}, k{field}, r{value}")
            }
            Op::NewDispatcher { dst, name } => write!(f, "newdisp r{dst}, k{name}"),
            Op::MakeRef { dst, target } => write!(f, "mkref r{dst}, r{target}"),
            Op::SlotMakeRef { dst, target } => write!(f, "mkrefs r{dst}, r{target}"),
            Op::MakeGlobalRef { dst, name } => write!(f, "mkrefg r{dst}, k{name}"),
            Op::MakeIndexRef { dst, container, index } => {
                write!(f, "mkrefi r{dst}, r{container}, r{index}")
            }
            Op::MakePropertyRef { dst, container, key } => {
                write!(f, "mkrefp r{dst}, r{container}, r{key}")
            }
            Op::DerefGet { dst, r: src } => write!(f, "dget r{dst}, r{src}"),
            Op::DerefSet { r, value } => write!(f, "dset r{r}, r{value}"),
            Op::SlotDerefSet { r, value } => write!(f, "dsets r{r}, r{value}"),
            Op::IncDec { kind, dst, src } => write!(f, "{kind:?} r{dst}, r{src}"),
            Op::TypeOf { dst, src } => write!(f, "typeof r{dst}, r{src}"),
            Op::Print { src } => write!(f, "print r{src}"),
            Op::PushPrompt { tag } => write!(f, "pushprompt r{tag}"),
            Op::PopPrompt => write!(f, "popprompt"),
            Op::Capture { dst, tag } => write!(f, "capture r{dst}, r{tag}"),
            Op::Resume { dst, cont, value } => write!(f, "resume r{dst}, r{cont}, r{value}"),
            Op::Abort { tag, value } => write!(f, "abort r{tag}, r{value}"),
            Op::Shift { dst, tag, handler } => write!(f, "shift r{dst}, r{tag}, r{handler}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_human() {
        assert_eq!(Op::LoadConst { dst: 1, k: 2 }.to_string(), "ldc r1, k2");
        assert_eq!(
            Op::ArithRR { op: ArithOp::Add, dst: 0, lhs: 1, rhs: 2 }.to_string(),
            "add r0, r1, r2"
        );
        assert_eq!(Op::Jump { offset: -3 }.to_string(), "jmp -3");
    }

    #[test]
    fn cmp_eval_matches_predicates() {
        use core::cmp::Ordering::*;
        assert!(CmpOp::Lt.eval(Less, false));
        assert!(!CmpOp::Lt.eval(Equal, true));
        assert!(CmpOp::Ge.eval(Equal, true));
        assert!(CmpOp::Eq.eval(Equal, true));
        assert!(CmpOp::Ne.eval(Equal, false));
    }

    #[test]
    fn jump_and_terminator_classification() {
        assert!(Op::Jump { offset: 1 }.is_jump());
        assert!(Op::BranchCmpRR { op: CmpOp::Eq, lhs: 0, rhs: 1, offset: 2 }.is_jump());
        assert!(!Op::Call { callee: 0, argc: 1 }.is_jump());
        assert!(Op::Return { src: 0 }.is_terminator());
        assert!(Op::ReturnNull.is_terminator());
    }
}
