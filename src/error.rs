//! Error types shared by the parser, the normalizer and the runtime.
use std::fmt;

use thiserror::Error;

/// Crate level result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top level error returned by the translation pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// Disassembly text or IR that cannot be translated.
    #[error(transparent)]
    Format(#[from] ParseFormatError),

    /// A class failed to translate; the whole run is aborted.
    #[error("failed to translate class {class}: {source}")]
    Translate {
        class: String,
        #[source]
        source: ParseFormatError,
    },

    /// Execution failure surfaced by the interpreter.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// A class source collaborator failed to produce text.
    #[error("class source failed for {class}: {reason}")]
    Source { class: String, reason: String },

    /// Manifest (de)serialization failure.
    #[error("manifest encoding failed: {0}")]
    Manifest(#[from] serde_json::Error),

    /// Configuration variable that does not parse.
    #[error("invalid value `{value}` for {variable}")]
    Config { variable: String, value: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Malformed disassembly, unresolvable branch targets and IR that is not
/// ready for execution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseFormatError {
    #[error("no class declaration found in disassembly")]
    MissingClassHeader,

    /// A `stack=`, `locals=` or `args_size=` field that is missing,
    /// repeated or not a non-negative integer, or an unknown metric.
    #[error("line {line}: malformed metric `{field}={value}`")]
    BadMetric {
        line: usize,
        field: String,
        value: String,
    },

    #[error("line {line}: instruction offset {offset} does not follow offset {previous}")]
    NonMonotonicOffset {
        line: usize,
        offset: u32,
        previous: u32,
    },

    #[error("line {line}: malformed instruction `{text}`")]
    BadInstruction { line: usize, text: String },

    #[error("line {line}: method `{method}` has code but no descriptor")]
    MissingDescriptor { line: usize, method: String },

    #[error("method `{method}`: {source}")]
    BadDescriptor {
        method: String,
        #[source]
        source: DescriptorError,
    },

    #[error(
        "{class}.{method}: branch at offset {offset} targets offset {target} \
         which is not an instruction boundary"
    )]
    UnresolvedBranch {
        class: String,
        method: String,
        offset: u32,
        target: u32,
    },

    /// A jump that does not carry exactly one non-negative offset.
    #[error("{class}.{method}: branch at offset {offset} has malformed operands `{operands}`")]
    BadBranchOperand {
        class: String,
        method: String,
        offset: u32,
        operands: String,
    },

    /// IR handed to the loader still carries parser-level operands or
    /// out of range branch indices.
    #[error("{class}.{method}: instruction {index} is not normalized: {reason}")]
    NotNormalized {
        class: String,
        method: String,
        index: usize,
        reason: String,
    },
}

/// Method descriptor that does not follow `(params)return`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed descriptor `{descriptor}`: {reason}")]
pub struct DescriptorError {
    pub descriptor: String,
    pub reason: String,
}

impl DescriptorError {
    pub fn new(descriptor: &str, reason: impl Into<String>) -> Self {
        Self {
            descriptor: descriptor.to_string(),
            reason: reason.into(),
        }
    }
}

/// `RuntimeErrorKind` represents the possible errors that can occur
/// during execution.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    /// Unknown class, method or missing bridge.
    Lookup,
    /// Integer division or remainder by zero.
    Arithmetic,
    /// Opcode the interpreter does not implement.
    UnsupportedOperation,
    /// A handler found a value of the wrong kind.
    TypeMismatch,
    StackUnderflow,
    InvalidLocal,
    /// An operand the handler needs could not be classified.
    BadOperand,
    /// Execution ran past the last instruction without returning.
    FellOffEnd,
    NullReference,
    IndexOutOfBounds,
    CallDepthExceeded,
    BudgetExhausted,
    /// A host bridge reported a failure.
    Bridge,
}

impl fmt::Display for RuntimeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Lookup => "lookup error",
            Self::Arithmetic => "arithmetic fault",
            Self::UnsupportedOperation => "unsupported operation",
            Self::TypeMismatch => "type mismatch",
            Self::StackUnderflow => "operand stack underflow",
            Self::InvalidLocal => "invalid local variable",
            Self::BadOperand => "bad operand",
            Self::FellOffEnd => "execution fell off the end of the method",
            Self::NullReference => "null reference",
            Self::IndexOutOfBounds => "index out of bounds",
            Self::CallDepthExceeded => "call depth exceeded",
            Self::BudgetExhausted => "instruction budget exhausted",
            Self::Bridge => "bridge failure",
        };
        f.write_str(name)
    }
}

/// Where in the interpreted code an error was raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub class: String,
    pub method: String,
    pub descriptor: String,
    pub index: usize,
    pub offset: u32,
    pub opcode: String,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}.{}{} #{} (offset {}, {})",
            self.class, self.method, self.descriptor, self.index, self.offset, self.opcode
        )
    }
}

/// `RuntimeError` carries the failure kind, a message and the location of
/// the failing instruction together with the chain of callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}{}", render_location(.location, .callers))]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub message: String,
    pub location: Option<Location>,
    pub callers: Vec<Location>,
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            location: None,
            callers: Vec::new(),
        }
    }

    pub fn lookup(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::Lookup, message)
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::TypeMismatch, message)
    }

    pub fn bad_operand(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::BadOperand, message)
    }

    /// Attach `location` as the failing instruction, or as a caller when the
    /// error already points into a callee.
    pub fn at(mut self, location: Location) -> Self {
        if self.location.is_none() {
            self.location = Some(location);
        } else {
            self.callers.push(location);
        }
        self
    }
}

fn render_location(location: &Option<Location>, callers: &[Location]) -> String {
    let mut out = String::new();
    if let Some(location) = location {
        out.push_str(&format!(" at {location}"));
    }
    for caller in callers {
        out.push_str(&format!("\n  called from {caller}"));
    }
    out
}
