//! Intermediate representation produced by the disassembly parser and
//! rewritten in place by the normalizer.
//!
//! The same types describe both stages. Parser output carries byte offsets
//! (`Operand::BranchOffset`) and constant pool tokens (`Operand::PoolIndex`);
//! normalized output only carries dense instruction indices and fully
//! classified operands. The serde representation is the manifest format.
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bytecode::OPCode;

/// Root of the class hierarchy, used when a class declares no superclass.
pub const ROOT_CLASS: &str = "java/lang/Object";

/// Canonical form of a class name: slash separated.
pub fn canonical_name(name: &str) -> String {
    name.replace('.', "/")
}

/// A single class, either freshly parsed or normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassIR {
    pub name: String,
    pub super_name: String,
    pub methods: Vec<MethodIR>,
}

impl ClassIR {
    pub fn method(&self, name: &str, descriptor: &str) -> Option<&MethodIR> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.descriptor == descriptor)
    }
}

/// A method with an executable body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodIR {
    pub name: String,
    pub descriptor: String,
    pub flags: BTreeSet<Flag>,
    pub max_stack: u16,
    pub max_locals: u16,
    pub args_size: u16,
    pub instructions: Vec<Instruction>,
}

impl MethodIR {
    pub fn is_static(&self) -> bool {
        self.flags.contains(&Flag::Static)
    }
}

/// One instruction. `offset` is the byte offset from the disassembly and
/// is kept after normalization for diagnostics only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub offset: u32,
    pub opcode: OPCode,
    pub operands: Vec<Operand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Instruction {
    pub fn new(offset: u32, opcode: OPCode, operands: Vec<Operand>) -> Self {
        Self {
            offset,
            opcode,
            operands,
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn operand(&self, index: usize) -> Option<&Operand> {
        self.operands.get(index)
    }
}

/// Instruction operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum Operand {
    IntLiteral(i32),
    LocalIndex(u16),
    /// Dense index of the target instruction.
    BranchTarget(usize),
    ConstLiteral(Constant),
    FieldRef(MemberRef),
    MethodRef(MemberRef),
    ClassRef(String),
    /// Text that could not be classified.
    Raw(String),
    /// `#n` constant pool token, parser output only.
    PoolIndex(u16),
    /// Branch target still expressed as a byte offset, parser output only.
    BranchOffset(u32),
}

impl Operand {
    /// Whether this operand can only appear before normalization.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::PoolIndex(_) | Self::BranchOffset(_))
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::IntLiteral(v) => write!(f, "{v}"),
            Self::LocalIndex(i) => write!(f, "local {i}"),
            Self::BranchTarget(i) => write!(f, "-> #{i}"),
            Self::ConstLiteral(c) => write!(f, "{c}"),
            Self::FieldRef(r) => write!(f, "field {r}"),
            Self::MethodRef(r) => write!(f, "method {r}"),
            Self::ClassRef(name) => write!(f, "class {name}"),
            Self::Raw(text) => write!(f, "raw {text:?}"),
            Self::PoolIndex(i) => write!(f, "#{i}"),
            Self::BranchOffset(o) => write!(f, "-> @{o}"),
        }
    }
}

/// Typed literal loaded by `LDC`, `LDC_W` and `LDC2_W`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Constant {
    String(String),
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class(String),
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s:?}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}f"),
            Self::Long(v) => write!(f, "{v}l"),
            Self::Double(v) => write!(f, "{v}d"),
            Self::Class(name) => write!(f, "{name}.class"),
        }
    }
}

/// Symbolic reference to a field or method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberRef {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

impl fmt::Display for MemberRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}:{}", self.owner, self.name, self.descriptor)
    }
}

/// Method access flags as printed by the disassembler.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Flag {
    #[serde(rename = "ACC_PUBLIC")]
    Public,
    #[serde(rename = "ACC_PRIVATE")]
    Private,
    #[serde(rename = "ACC_PROTECTED")]
    Protected,
    #[serde(rename = "ACC_STATIC")]
    Static,
    #[serde(rename = "ACC_FINAL")]
    Final,
    #[serde(rename = "ACC_SYNCHRONIZED")]
    Synchronized,
    #[serde(rename = "ACC_BRIDGE")]
    Bridge,
    #[serde(rename = "ACC_VARARGS")]
    Varargs,
    #[serde(rename = "ACC_NATIVE")]
    Native,
    #[serde(rename = "ACC_ABSTRACT")]
    Abstract,
    #[serde(rename = "ACC_STRICT")]
    Strict,
    #[serde(rename = "ACC_SYNTHETIC")]
    Synthetic,
}

impl FromStr for Flag {
    type Err = ();

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let flag = match token {
            "ACC_PUBLIC" => Self::Public,
            "ACC_PRIVATE" => Self::Private,
            "ACC_PROTECTED" => Self::Protected,
            "ACC_STATIC" => Self::Static,
            "ACC_FINAL" => Self::Final,
            "ACC_SYNCHRONIZED" => Self::Synchronized,
            "ACC_BRIDGE" => Self::Bridge,
            "ACC_VARARGS" => Self::Varargs,
            "ACC_NATIVE" => Self::Native,
            "ACC_ABSTRACT" => Self::Abstract,
            "ACC_STRICT" => Self::Strict,
            "ACC_SYNTHETIC" => Self::Synthetic,
            _ => return Err(()),
        };
        Ok(flag)
    }
}
