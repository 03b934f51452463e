//! error.rs — Taxonomy of failures the VM can raise (spec §7).
//!
//! `VmError` is the *kind* of a failure; it never carries a stack
//! trace itself (printf-style messages are the old way — see the
//! teacher's `ChunkLoadError`/`vitte_core::Error` for the shape we
//! follow: small enums, `#[error]` messages, no formatting work done
//! until something actually asks for a string). `RuntimeError` is
//! what crosses the host boundary: a `VmError` plus the frame trace
//! captured while unwinding.

use thiserror::Error;

use crate::frame::TraceFrame;

/// A single runtime failure, classified by `spec.md` §7's taxonomy.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum VmError {
    /// Wrong value type where an opcode or native expected another.
    #[error("type error: {0}")]
    Type(String),

    /// Wrong argument count to a call or native dispatcher.
    #[error("arity error: expected {expected}, got {got}")]
    Arity { expected: u8, got: u8 },

    /// List index, stack, frame, prompt, or resume-nesting bound violated.
    #[error("bounds error: {0}")]
    Bounds(BoundsKind),

    /// `capture`/`abort`/`resume`/`shift` used incorrectly.
    #[error("control-effect error: {0}")]
    ControlEffect(ControlEffectKind),

    /// A name (global, field, upvalue) could not be resolved.
    #[error("undefined: {0}")]
    Undefined(String),

    /// Out-of-memory during GC/stack growth, or an invariant violation.
    /// Fatal errors abort the process after a diagnostic is emitted —
    /// the VM does not attempt to keep running past one.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Which bound was exceeded.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BoundsKind {
    #[error("list index {index} out of bounds (len {len})")]
    ListIndex { index: i64, len: usize },
    #[error("value stack overflow (capacity {capacity})")]
    StackOverflow { capacity: usize },
    #[error("call-frame overflow (capacity {capacity})")]
    FrameOverflow { capacity: usize },
    #[error("prompt-stack overflow (capacity {capacity})")]
    PromptOverflow { capacity: usize },
    #[error("resume-nesting overflow (capacity {capacity})")]
    ResumeOverflow { capacity: usize },
}

/// Why a control-effect operator failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControlEffectKind {
    #[error("no prompt with tag {0:?} is currently installed")]
    MissingPrompt(crate::object::PromptTagId),
    #[error("continuation is not Valid (already consumed or invalidated)")]
    NotValid,
}

/// Status returned to the host, matching §6's `{CompileError, RuntimeError}`
/// (compile errors are relayed from outside the core; the core only ever
/// constructs `RuntimeError`).
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub kind: VmError,
    /// Frame-by-frame trace captured during unwinding, innermost first.
    pub trace: Vec<TraceFrame>,
}

impl core::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "runtime error: {}", self.kind)?;
        for frame in &self.trace {
            writeln!(f, "  at {frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

impl RuntimeError {
    pub fn new(kind: VmError, trace: Vec<TraceFrame>) -> Self {
        Self { kind, trace }
    }
}

pub type VmResult<T> = Result<T, VmError>;
