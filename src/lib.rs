//! pourover translates `javap -c -verbose` listings into a compact IR and
//! runs that IR on a small stack interpreter covering the integer and
//! reference subset of the JVM instruction set.
//!
//! ```text
//! text --JavapParser--> raw ClassIR --normalize--> ClassIR --Manifest::load--> Runtime
//! ```
pub mod bytecode;
pub mod error;
pub mod ir;
pub mod jvm;
pub mod normalize;
pub mod pipeline;
pub mod profiler;
pub mod program;
pub mod runtime;
pub mod value;

pub use error::{Error, ParseFormatError, Result, RuntimeError, RuntimeErrorKind};
pub use ir::{ClassIR, Instruction, MethodIR, Operand};
pub use jvm::JavapParser;
pub use normalize::{normalize_class, normalize_classes};
pub use pipeline::{translate, ClassSource, DirectorySource, MemorySource};
pub use program::{Manifest, MethodKey};
pub use runtime::{BridgeCall, Runtime, RuntimeConfig};
pub use value::{Heap, Value};
