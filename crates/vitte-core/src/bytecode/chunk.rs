//! chunk.rs — Compiled unit: code + constants + debug info (spec §3
//! "Chunk", §4.4, §6 "chunk lifecycle").
//!
//! Mirrors the teacher's `bytecode::chunk::Chunk` shape (header with a
//! magic/version/hash, a deduplicated constant pool, a run-length
//! line table) but carries the register-machine `Op` from `opcode.rs`
//! instead of the teacher's stack-machine one, and drops the
//! teacher's own disassembler/loader conveniences that have no
//! counterpart here (no `Chunk::disassemble`, no CLI loader).

use ahash::AHashMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::bytecode::opcode::Op;
use crate::object::UpvalueDesc;

/// Magic bytes stamped on every serialized chunk.
pub const CHUNK_MAGIC: [u8; 4] = *b"VITC";
/// Current on-disk format version; bump on any breaking layout change.
pub const CHUNK_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChunkFlags {
    pub has_debug_info: bool,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChunkHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub flags: ChunkFlags,
    /// FNV-1a hash of the serialized body, checked on load.
    pub hash_fnv1a_64: u64,
}

/// A literal too wide (or too variably-typed) to fit an instruction's
/// immediate field: strings, oversized numbers, struct/enum schema
/// names, function prototypes referenced by `CLOSURE`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ConstValue {
    Number(f64),
    Str(String),
    /// A nested function prototype, addressed by `Op::Closure { func }`.
    Function(FunctionProto),
}

/// The static (compile-time) description of a function, independent
/// of any particular closure's captured upvalues.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FunctionProto {
    pub name: String,
    pub arity: u8,
    pub max_regs: u16,
    pub upvalue_descriptors: Vec<UpvalueDesc>,
    pub chunk: Box<Chunk>,
}

/// Deduplicated constant table. Strings dedupe by value (mirrors the
/// teacher's `ConstPool`, which interns strings by an ahash-keyed map
/// so the same literal appearing twice in source gets one slot).
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConstPool {
    values: Vec<ConstValue>,
    #[cfg_attr(feature = "serde", serde(skip))]
    string_index: AHashMap<String, u16>,
}

impl ConstPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_number(&mut self, n: f64) -> u16 {
        let idx = self.values.len() as u16;
        self.values.push(ConstValue::Number(n));
        idx
    }

    /// Interns `s`: returns the existing index if this string literal
    /// was already pushed, otherwise appends and indexes it.
    pub fn push_string(&mut self, s: &str) -> u16 {
        if let Some(&idx) = self.string_index.get(s) {
            return idx;
        }
        let idx = self.values.len() as u16;
        self.values.push(ConstValue::Str(s.to_owned()));
        self.string_index.insert(s.to_owned(), idx);
        idx
    }

    pub fn push_function(&mut self, proto: FunctionProto) -> u16 {
        let idx = self.values.len() as u16;
        self.values.push(ConstValue::Function(proto));
        idx
    }

    pub fn get(&self, idx: u16) -> Option<&ConstValue> {
        self.values.get(idx as usize)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Rebuilds the dedup index after deserialization (it's skipped
    /// over the wire since it's pure derived state).
    fn rebuild_string_index(&mut self) {
        self.string_index.clear();
        for (i, v) in self.values.iter().enumerate() {
            if let ConstValue::Str(s) = v {
                self.string_index.insert(s.clone(), i as u16);
            }
        }
    }
}

/// Run-length-encoded map from instruction index to source line.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LineTable {
    /// `(run_length, line)` pairs; `run_length` instructions in a row
    /// share `line`.
    runs: Vec<(u32, u32)>,
}

impl LineTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: u32) {
        if let Some(last) = self.runs.last_mut() {
            if last.1 == line {
                last.0 += 1;
                return;
            }
        }
        self.runs.push((1, line));
    }

    pub fn line_for(&self, instr_index: usize) -> Option<u32> {
        let mut remaining = instr_index;
        for &(len, line) in &self.runs {
            if remaining < len as usize {
                return Some(line);
            }
            remaining -= len as usize;
        }
        None
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DebugInfo {
    pub source_name: Option<String>,
    pub local_names: Vec<(u16, String)>,
}

/// A compiled function body: register bytecode plus everything needed
/// to run and debug it, with no pointer back to a parser or AST.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Chunk {
    pub header: ChunkHeader,
    pub ops: Vec<Op>,
    pub consts: ConstPool,
    pub lines: LineTable,
    pub debug: DebugInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChunkLoadError {
    #[error("truncated chunk: expected at least {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("bad magic bytes")]
    BadMagic,
    #[error("unsupported chunk version {found} (expected {expected})")]
    UnsupportedVersion { found: u16, expected: u16 },
    #[error("hash mismatch: chunk body does not match its stored FNV-1a hash")]
    HashMismatch,
    #[error("decode failed")]
    Decode,
}

impl Chunk {
    pub fn new() -> Self {
        Self {
            header: ChunkHeader {
                magic: CHUNK_MAGIC,
                version: CHUNK_VERSION,
                flags: ChunkFlags::default(),
                hash_fnv1a_64: 0,
            },
            ops: Vec::new(),
            consts: ConstPool::new(),
            lines: LineTable::new(),
            debug: DebugInfo::default(),
        }
    }

    pub fn push_op(&mut self, op: Op, line: u32) -> usize {
        let idx = self.ops.len();
        self.ops.push(op);
        self.lines.push(line);
        idx
    }

    pub fn line_for(&self, ip: usize) -> Option<u32> {
        self.lines.line_for(ip)
    }

    /// Serializes with bincode, stamping a fresh FNV-1a hash over the
    /// body so `from_bytes` can detect bit-rot/corruption.
    #[cfg(feature = "serde")]
    pub fn to_bytes(&self) -> Result<Vec<u8>, ChunkLoadError> {
        let mut me = self.clone();
        me.header.hash_fnv1a_64 = 0;
        let body = bincode::serialize(&me).map_err(|_| ChunkLoadError::Decode)?;
        let hash = crate::object::fnv1a_hash(&body);
        me.header.hash_fnv1a_64 = hash;
        bincode::serialize(&me).map_err(|_| ChunkLoadError::Decode)
    }

    #[cfg(feature = "serde")]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChunkLoadError> {
        const MIN_LEN: usize = 16;
        if bytes.len() < MIN_LEN {
            return Err(ChunkLoadError::Truncated { expected: MIN_LEN, got: bytes.len() });
        }
        let mut chunk: Chunk = bincode::deserialize(bytes).map_err(|_| ChunkLoadError::Decode)?;
        if chunk.header.magic != CHUNK_MAGIC {
            return Err(ChunkLoadError::BadMagic);
        }
        if chunk.header.version != CHUNK_VERSION {
            return Err(ChunkLoadError::UnsupportedVersion {
                found: chunk.header.version,
                expected: CHUNK_VERSION,
            });
        }
        let stored_hash = chunk.header.hash_fnv1a_64;
        chunk.header.hash_fnv1a_64 = 0;
        let body = bincode::serialize(&chunk).map_err(|_| ChunkLoadError::Decode)?;
        let recomputed = crate::object::fnv1a_hash(&body);
        if recomputed != stored_hash {
            return Err(ChunkLoadError::HashMismatch);
        }
        chunk.header.hash_fnv1a_64 = stored_hash;
        chunk.consts.rebuild_string_index();
        Ok(chunk)
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::opcode::{ArithOp, Op};

    fn sample_chunk() -> Chunk {
        let mut c = Chunk::new();
        let k = c.consts.push_number(42.0);
        c.push_op(Op::LoadConst { dst: 0, k }, 1);
        c.push_op(Op::ArithRR { op: ArithOp::Add, dst: 1, lhs: 0, rhs: 0 }, 2);
        c.push_op(Op::Return { src: 1 }, 2);
        c
    }

    #[test]
    fn line_table_runs_compress_repeats() {
        let c = sample_chunk();
        assert_eq!(c.line_for(0), Some(1));
        assert_eq!(c.line_for(1), Some(2));
        assert_eq!(c.line_for(2), Some(2));
        assert_eq!(c.line_for(3), None);
    }

    #[test]
    fn const_pool_dedups_strings() {
        let mut pool = ConstPool::new();
        let a = pool.push_string("hello");
        let b = pool.push_string("hello");
        let c = pool.push_string("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.len(), 2);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn roundtrip_preserves_contents() {
        let c = sample_chunk();
        let bytes = c.to_bytes().expect("serialize");
        let back = Chunk::from_bytes(&bytes).expect("deserialize");
        assert_eq!(back.ops, c.ops);
        assert_eq!(back.consts, c.consts);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn corrupted_bytes_are_rejected() {
        let c = sample_chunk();
        let mut bytes = c.to_bytes().expect("serialize");
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(
            Chunk::from_bytes(&bytes),
            Err(ChunkLoadError::HashMismatch) | Err(ChunkLoadError::Decode)
        ));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn truncated_bytes_are_rejected() {
        assert_eq!(
            Chunk::from_bytes(&[0u8; 4]),
            Err(ChunkLoadError::Truncated { expected: 16, got: 4 })
        );
    }
}
