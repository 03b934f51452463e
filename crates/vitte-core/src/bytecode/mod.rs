//! Bytecode core for Vitte: opcodes, chunk format, helpers.

pub mod chunk;
pub mod opcode;

pub use chunk::{Chunk, ChunkFlags, ChunkLoadError, ConstPool, ConstValue, FunctionProto, LineTable};
pub use opcode::{ArithOp, BitOp, CmpOp, ConstIx, FuncIx, GlobalSlotIx, IncDecKind, Op, Reg, UpvalueIx};
