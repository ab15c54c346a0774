//! JVM opcodes understood by the normalizer and the interpreter.
//!
//! Opcodes are identified by their mnemonic rather than their byte value
//! since the input is disassembly text. Mnemonics without a dedicated
//! variant survive as `OPCode::Other` so that parsing never fails on an
//! instruction the interpreter does not implement.
use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! opcodes {
    ($($variant:ident => $mnemonic:literal,)*) => {
        /// JVM instruction mnemonic, with numeric suffix forms such as
        /// `ILOAD_1` collapsed onto their base mnemonic.
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum OPCode {
            $($variant,)*
            Other(String),
        }

        impl OPCode {
            /// Upper-case mnemonic of the opcode.
            pub fn mnemonic(&self) -> &str {
                match self {
                    $(Self::$variant => $mnemonic,)*
                    Self::Other(name) => name,
                }
            }

            /// Opcode for an upper or lower case mnemonic.
            pub fn from_mnemonic(mnemonic: &str) -> Self {
                let upper = mnemonic.to_ascii_uppercase();
                match upper.as_str() {
                    $($mnemonic => Self::$variant,)*
                    _ => Self::Other(upper),
                }
            }
        }
    };
}

opcodes! {
    Nop => "NOP",
    AconstNull => "ACONST_NULL",
    Iconst => "ICONST",
    Lconst => "LCONST",
    Fconst => "FCONST",
    Dconst => "DCONST",
    Bipush => "BIPUSH",
    Sipush => "SIPUSH",
    Ldc => "LDC",
    LdcW => "LDC_W",
    Ldc2W => "LDC2_W",
    Iload => "ILOAD",
    Lload => "LLOAD",
    Fload => "FLOAD",
    Dload => "DLOAD",
    Aload => "ALOAD",
    Istore => "ISTORE",
    Lstore => "LSTORE",
    Fstore => "FSTORE",
    Dstore => "DSTORE",
    Astore => "ASTORE",
    Iaload => "IALOAD",
    Baload => "BALOAD",
    Caload => "CALOAD",
    Saload => "SALOAD",
    Aaload => "AALOAD",
    Iastore => "IASTORE",
    Bastore => "BASTORE",
    Castore => "CASTORE",
    Sastore => "SASTORE",
    Aastore => "AASTORE",
    Pop => "POP",
    Pop2 => "POP2",
    Dup => "DUP",
    DupX1 => "DUP_X1",
    DupX2 => "DUP_X2",
    Dup2 => "DUP2",
    Swap => "SWAP",
    Iadd => "IADD",
    Isub => "ISUB",
    Imul => "IMUL",
    Idiv => "IDIV",
    Irem => "IREM",
    Ineg => "INEG",
    Ishl => "ISHL",
    Ishr => "ISHR",
    Iushr => "IUSHR",
    Iand => "IAND",
    Ior => "IOR",
    Ixor => "IXOR",
    Iinc => "IINC",
    I2b => "I2B",
    I2c => "I2C",
    I2s => "I2S",
    Ifeq => "IFEQ",
    Ifne => "IFNE",
    Iflt => "IFLT",
    Ifge => "IFGE",
    Ifgt => "IFGT",
    Ifle => "IFLE",
    IfIcmpeq => "IF_ICMPEQ",
    IfIcmpne => "IF_ICMPNE",
    IfIcmplt => "IF_ICMPLT",
    IfIcmpge => "IF_ICMPGE",
    IfIcmpgt => "IF_ICMPGT",
    IfIcmple => "IF_ICMPLE",
    IfAcmpeq => "IF_ACMPEQ",
    IfAcmpne => "IF_ACMPNE",
    Ifnull => "IFNULL",
    Ifnonnull => "IFNONNULL",
    Goto => "GOTO",
    GotoW => "GOTO_W",
    Ireturn => "IRETURN",
    Lreturn => "LRETURN",
    Freturn => "FRETURN",
    Dreturn => "DRETURN",
    Areturn => "ARETURN",
    Return => "RETURN",
    Getstatic => "GETSTATIC",
    Putstatic => "PUTSTATIC",
    Getfield => "GETFIELD",
    Putfield => "PUTFIELD",
    Invokevirtual => "INVOKEVIRTUAL",
    Invokespecial => "INVOKESPECIAL",
    Invokestatic => "INVOKESTATIC",
    Invokeinterface => "INVOKEINTERFACE",
    Invokedynamic => "INVOKEDYNAMIC",
    New => "NEW",
    Newarray => "NEWARRAY",
    Anewarray => "ANEWARRAY",
    Multianewarray => "MULTIANEWARRAY",
    Arraylength => "ARRAYLENGTH",
    Athrow => "ATHROW",
    Checkcast => "CHECKCAST",
    Instanceof => "INSTANCEOF",
    Monitorenter => "MONITORENTER",
    Monitorexit => "MONITOREXIT",
}

/// Operand transform applied by the normalizer. Opcodes are grouped by
/// the shape of their operands, not by what they do.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Family {
    /// Integer pushed as is.
    Immediate,
    /// Local variable slot, optionally followed by an increment.
    Local,
    /// Constant pool literal described by the trailing comment.
    ConstantLoad,
    /// Jump whose operand is a byte offset.
    ControlTransfer,
    FieldAccess,
    Invocation,
    /// Class named by the trailing comment.
    TypeReference,
    /// Operands passed through untouched.
    Plain,
}

impl OPCode {
    pub fn family(&self) -> Family {
        match self {
            Self::Iconst | Self::Bipush | Self::Sipush => Family::Immediate,
            Self::Iload
            | Self::Lload
            | Self::Fload
            | Self::Dload
            | Self::Aload
            | Self::Istore
            | Self::Lstore
            | Self::Fstore
            | Self::Dstore
            | Self::Astore
            | Self::Iinc => Family::Local,
            Self::Ldc | Self::LdcW | Self::Ldc2W => Family::ConstantLoad,
            Self::Ifeq
            | Self::Ifne
            | Self::Iflt
            | Self::Ifge
            | Self::Ifgt
            | Self::Ifle
            | Self::IfIcmpeq
            | Self::IfIcmpne
            | Self::IfIcmplt
            | Self::IfIcmpge
            | Self::IfIcmpgt
            | Self::IfIcmple
            | Self::IfAcmpeq
            | Self::IfAcmpne
            | Self::Ifnull
            | Self::Ifnonnull
            | Self::Goto
            | Self::GotoW => Family::ControlTransfer,
            Self::Getstatic | Self::Putstatic | Self::Getfield | Self::Putfield => {
                Family::FieldAccess
            }
            Self::Invokevirtual
            | Self::Invokespecial
            | Self::Invokestatic
            | Self::Invokeinterface
            | Self::Invokedynamic => Family::Invocation,
            Self::New
            | Self::Anewarray
            | Self::Multianewarray
            | Self::Checkcast
            | Self::Instanceof => Family::TypeReference,
            _ => Family::Plain,
        }
    }

    /// Split a suffixed mnemonic such as `iload_2` or `iconst_m1` into its
    /// base opcode and the immediate encoded in the suffix.
    pub fn split_suffix(mnemonic: &str) -> Option<(OPCode, i32)> {
        let (base, suffix) = mnemonic.rsplit_once('_')?;
        let value = match suffix {
            "m1" | "M1" => -1,
            digits if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => {
                digits.parse().ok()?
            }
            _ => return None,
        };
        Some((OPCode::from_mnemonic(base), value))
    }
}

impl From<String> for OPCode {
    fn from(mnemonic: String) -> Self {
        Self::from_mnemonic(&mnemonic)
    }
}

impl From<OPCode> for String {
    fn from(opcode: OPCode) -> Self {
        opcode.mnemonic().to_string()
    }
}

impl fmt::Display for OPCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}
