//! vitte-core — Execution core of the Vitte VM.
//!
//! Everything needed to run compiled bytecode: the NaN-boxed value
//! model, the heap and its tracing garbage collector, the register
//! bytecode format, the dispatch loop, upvalues, and delimited
//! continuations. This crate has no parser, no compiler, and no I/O
//! of its own — `vitte-vm` builds the host embedding surface on top
//! of it.
//!
//! ## Modules
//! - `value`       : the NaN-boxed `Value` type.
//! - `object`      : heap object kinds (`Obj`) and their payloads.
//! - `heap`        : the object slab, allocation accounting, string interning.
//! - `gc`          : the tracing mark-sweep collector.
//! - `bytecode`    : `Op`, `Chunk`, the constant pool, debug info.
//! - `frame`       : call frames and error trace frames.
//! - `upvalue`     : the VM-wide open-upvalue chain.
//! - `prompt`      : prompts and delimited continuations.
//! - `preempt`     : the cooperative preemption budget.
//! - `native`      : native-function signature parsing.
//! - `interpreter` : the `Vm` and its dispatch loop.
//! - `error`       : the runtime error taxonomy.
//!
//! ## Features
//! - **std** *(default)*: currently required; reserved for a future no_std split.
//! - **serde**: chunk (de)serialization via `serde`/`bincode`.
//! - **tracing**: instrumentation of GC cycles and control-effect operators.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]
#![cfg_attr(not(debug_assertions), warn(missing_docs))]

pub mod bytecode;
pub mod error;
pub mod frame;
pub mod gc;
pub mod heap;
pub mod interpreter;
pub mod native;
pub mod object;
pub mod preempt;
pub mod prompt;
pub mod upvalue;
pub mod value;

pub use bytecode::{Chunk, ChunkFlags, ChunkLoadError, ConstPool, ConstValue, Op};
pub use error::{BoundsKind, ControlEffectKind, RuntimeError, VmError, VmResult};
pub use interpreter::{Vm, VmLimits};
pub use object::{HeapHandle, Obj};
pub use value::Value;

/// Crate version, as reported by Cargo.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// A short banner for logs/tools.
pub fn version() -> String {
    format!("vitte-core {VERSION}")
}

pub mod prelude {
    pub use crate::{
        bytecode::{self, Chunk, ConstValue, Op},
        error::{RuntimeError, VmError, VmResult},
        interpreter::{Vm, VmLimits},
        object::{HeapHandle, Obj},
        value::Value,
        version,
    };
}

/// Asserts `$cond`, otherwise returning a `VmError::Fatal` built from
/// the format string. Mirrors the ergonomics of `assert!` for code
/// paths that must degrade to a runtime error instead of panicking.
#[macro_export]
macro_rules! vit_assert {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err($crate::error::VmError::Fatal(format!($($arg)*)));
        }
    };
    ($cond:expr) => {
        if !$cond {
            return Err($crate::error::VmError::Fatal("assertion failed".into()));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_nonempty() {
        assert!(!version().is_empty());
    }

    #[test]
    fn prelude_reexports_resolve() {
        use crate::prelude::*;
        let _c = Chunk::new();
        let _v = Value::null();
    }
}
