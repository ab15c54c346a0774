//! Rewrites raw parser IR into execution-ready IR.
//!
//! Pass 1 maps every byte offset onto a dense instruction index and
//! reclassifies operands by opcode family, reading symbolic references out
//! of the disassembler comment. Pass 2 turns branch offsets into indices.
//! Operands that are already classified are left alone, so normalizing
//! normalized IR changes nothing.
use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

use crate::bytecode::{Family, OPCode};
use crate::error::ParseFormatError;
use crate::ir::{canonical_name, ClassIR, Constant, Instruction, MemberRef, MethodIR, Operand};

lazy_static! {
    static ref FIELD_COMMENT: Regex =
        Regex::new(r"^Field\s+(?:(.+)\.)?([^.:\s]+):(\S+)$").expect("field comment regex");
    static ref METHOD_COMMENT: Regex =
        Regex::new(r#"^(?:Interface)?Method\s+(?:(.+)\.)?("[^"]+"|[^.:\s"]+):(\S+)$"#)
            .expect("method comment regex");
    static ref CLASS_COMMENT: Regex =
        Regex::new(r#"^class\s+"?([^"\s]+)"?$"#).expect("class comment regex");
    static ref STRING_CONSTANT: Regex = Regex::new(r"^String(?:\s(.*))?$").expect("string regex");
    static ref INT_CONSTANT: Regex = Regex::new(r"^int\s+(-?\d+)$").expect("int regex");
    static ref FLOAT_CONSTANT: Regex =
        Regex::new(r"^float\s+(\S+?)f?$").expect("float regex");
    static ref LONG_CONSTANT: Regex = Regex::new(r"^long\s+(-?\d+)l?$").expect("long regex");
    static ref DOUBLE_CONSTANT: Regex =
        Regex::new(r"^double\s+(\S+?)d?$").expect("double regex");
}

/// Normalize every class, stopping at the first failure.
pub fn normalize_classes(classes: Vec<ClassIR>) -> Result<Vec<ClassIR>, ParseFormatError> {
    classes.into_iter().map(normalize_class).collect()
}

/// Normalize one class. Either every method normalizes or the class fails.
pub fn normalize_class(class: ClassIR) -> Result<ClassIR, ParseFormatError> {
    let name = canonical_name(&class.name);
    let methods = class
        .methods
        .into_iter()
        .map(|method| normalize_method(&name, method))
        .collect::<Result<Vec<_>, _>>()?;
    debug!(class = %name, methods = methods.len(), "normalized class");
    Ok(ClassIR {
        name,
        super_name: canonical_name(&class.super_name),
        methods,
    })
}

fn normalize_method(class: &str, method: MethodIR) -> Result<MethodIR, ParseFormatError> {
    let MethodIR {
        name,
        descriptor,
        flags,
        max_stack,
        max_locals,
        args_size,
        instructions,
    } = method;

    // Pass 1: offset -> index, operand classification.
    let offsets: HashMap<u32, usize> = instructions
        .iter()
        .enumerate()
        .map(|(index, insn)| (insn.offset, index))
        .collect();
    let mut instructions: Vec<Instruction> = instructions
        .into_iter()
        .map(|insn| normalize_instruction(class, insn))
        .collect();

    // Pass 2: branch offsets -> dense indices.
    for insn in &mut instructions {
        let at = insn.offset;
        if insn.opcode.family() == Family::ControlTransfer
            && !matches!(
                insn.operands.as_slice(),
                [Operand::BranchOffset(_) | Operand::BranchTarget(_)]
            )
        {
            return Err(ParseFormatError::BadBranchOperand {
                class: class.to_string(),
                method: name.clone(),
                offset: at,
                operands: render_operands(&insn.operands),
            });
        }
        for operand in &mut insn.operands {
            if let Operand::BranchOffset(target) = *operand {
                let index = offsets.get(&target).copied().ok_or_else(|| {
                    ParseFormatError::UnresolvedBranch {
                        class: class.to_string(),
                        method: name.clone(),
                        offset: at,
                        target,
                    }
                })?;
                *operand = Operand::BranchTarget(index);
            }
        }
    }

    Ok(MethodIR {
        name,
        descriptor,
        flags,
        max_stack,
        max_locals,
        args_size,
        instructions,
    })
}

/// Reclassify the operands of one instruction by opcode family.
pub fn normalize_instruction(class: &str, insn: Instruction) -> Instruction {
    let Instruction {
        offset,
        opcode,
        operands,
        comment,
    } = insn;

    // `iload_1`, `iconst_m1`, ... carry their operand in the mnemonic.
    if let OPCode::Other(mnemonic) = &opcode {
        if let Some((base, value)) = OPCode::split_suffix(mnemonic) {
            let operand = match base.family() {
                Family::Local => local_index(value),
                _ => Operand::IntLiteral(value),
            };
            return Instruction {
                offset,
                opcode: base,
                operands: vec![operand],
                comment,
            };
        }
    }

    let operands = match opcode.family() {
        Family::Immediate | Family::Plain => operands
            .into_iter()
            .map(|operand| match operand {
                Operand::PoolIndex(index) => Operand::Raw(format!("#{index}")),
                operand => operand,
            })
            .collect(),
        Family::Local => operands
            .into_iter()
            .enumerate()
            .map(|(position, operand)| match (position, operand) {
                (0, Operand::IntLiteral(value)) => local_index(value),
                (_, operand) => operand,
            })
            .collect(),
        Family::ControlTransfer => operands
            .into_iter()
            .map(|operand| match operand {
                Operand::IntLiteral(value) if value >= 0 => Operand::BranchOffset(value as u32),
                operand => operand,
            })
            .collect(),
        Family::ConstantLoad => {
            symbolic(operands, comment.as_deref(), |op| matches!(op, Operand::ConstLiteral(_)), |c| {
                parse_constant(c).map(Operand::ConstLiteral)
            })
        }
        Family::FieldAccess => symbolic(
            operands,
            comment.as_deref(),
            |op| matches!(op, Operand::FieldRef(_)),
            |c| parse_field_ref(class, c).map(Operand::FieldRef),
        ),
        Family::Invocation => symbolic(
            operands,
            comment.as_deref(),
            |op| matches!(op, Operand::MethodRef(_)),
            |c| parse_method_ref(class, c).map(Operand::MethodRef),
        ),
        Family::TypeReference => symbolic(
            operands,
            comment.as_deref(),
            |op| matches!(op, Operand::ClassRef(_)),
            |c| parse_class_ref(c).map(Operand::ClassRef),
        ),
    };

    Instruction {
        offset,
        opcode,
        operands,
        comment,
    }
}

fn render_operands(operands: &[Operand]) -> String {
    operands
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn local_index(value: i32) -> Operand {
    u16::try_from(value)
        .map(Operand::LocalIndex)
        .unwrap_or_else(|_| Operand::Raw(value.to_string()))
}

/// Replace the leading pool reference with the symbol described by the
/// comment. Keeps already classified operands and trailing immediates
/// (`invokeinterface #9, 2`, `multianewarray #4, 2`).
fn symbolic(
    operands: Vec<Operand>,
    comment: Option<&str>,
    is_classified: impl Fn(&Operand) -> bool,
    parse: impl Fn(&str) -> Option<Operand>,
) -> Vec<Operand> {
    if operands.first().is_some_and(&is_classified) {
        return operands;
    }
    let symbol = match comment {
        Some(text) => parse(text).unwrap_or_else(|| Operand::Raw(text.to_string())),
        None => Operand::Raw(String::new()),
    };
    let mut rest = operands.into_iter();
    if let Some(first) = rest.next() {
        if !matches!(first, Operand::PoolIndex(_) | Operand::Raw(_)) {
            // Not a pool token: keep it after the symbol.
            return std::iter::once(symbol)
                .chain(std::iter::once(first))
                .chain(rest)
                .collect();
        }
    }
    std::iter::once(symbol).chain(rest).collect()
}

/// `String ...`, `int n`, `float xf`, `long nl`, `double xd`, `class C`.
pub fn parse_constant(comment: &str) -> Option<Constant> {
    if let Some(caps) = STRING_CONSTANT.captures(comment) {
        let text = caps.get(1).map_or("", |text| text.as_str());
        return Some(Constant::String(text.to_string()));
    }
    if let Some(caps) = INT_CONSTANT.captures(comment) {
        return caps[1].parse().ok().map(Constant::Int);
    }
    if let Some(caps) = FLOAT_CONSTANT.captures(comment) {
        return caps[1].parse().ok().map(Constant::Float);
    }
    if let Some(caps) = LONG_CONSTANT.captures(comment) {
        return caps[1].parse().ok().map(Constant::Long);
    }
    if let Some(caps) = DOUBLE_CONSTANT.captures(comment) {
        return caps[1].parse().ok().map(Constant::Double);
    }
    parse_class_ref(comment).map(Constant::Class)
}

/// `Field [owner.]name:descriptor`; a missing owner is the current class.
pub fn parse_field_ref(class: &str, comment: &str) -> Option<MemberRef> {
    let caps = FIELD_COMMENT.captures(comment)?;
    Some(MemberRef {
        owner: caps
            .get(1)
            .map_or_else(|| class.to_string(), |owner| unquoted_name(owner.as_str())),
        name: caps[2].to_string(),
        descriptor: caps[3].to_string(),
    })
}

/// `[Interface]Method [owner.]name:descriptor`; a missing owner is the
/// current class.
pub fn parse_method_ref(class: &str, comment: &str) -> Option<MemberRef> {
    let caps = METHOD_COMMENT.captures(comment)?;
    Some(MemberRef {
        owner: caps
            .get(1)
            .map_or_else(|| class.to_string(), |owner| unquoted_name(owner.as_str())),
        name: caps[2].trim_matches('"').to_string(),
        descriptor: caps[3].to_string(),
    })
}

/// `class name`, with array class names quoted by the disassembler.
pub fn parse_class_ref(comment: &str) -> Option<String> {
    CLASS_COMMENT
        .captures(comment)
        .map(|caps| canonical_name(&caps[1]))
}

fn unquoted_name(name: &str) -> String {
    canonical_name(name.trim_matches('"'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Flag;
    use crate::jvm::JavapParser;

    fn raw(offset: u32, mnemonic: &str, operands: Vec<Operand>) -> Instruction {
        Instruction::new(offset, OPCode::from_mnemonic(mnemonic), operands)
    }

    fn method(instructions: Vec<Instruction>) -> MethodIR {
        MethodIR {
            name: "run".to_string(),
            descriptor: "()I".to_string(),
            flags: [Flag::Static].into_iter().collect(),
            max_stack: 2,
            max_locals: 2,
            args_size: 0,
            instructions,
        }
    }

    fn class(instructions: Vec<Instruction>) -> ClassIR {
        ClassIR {
            name: "demo.Loop".to_string(),
            super_name: "java.lang.Object".to_string(),
            methods: vec![method(instructions)],
        }
    }

    fn countdown() -> ClassIR {
        class(vec![
            raw(0, "bipush", vec![Operand::IntLiteral(10)]),
            raw(2, "istore_0", vec![]),
            raw(3, "iload_0", vec![]),
            raw(4, "ifle", vec![Operand::IntLiteral(13)]),
            raw(7, "iinc", vec![Operand::IntLiteral(0), Operand::IntLiteral(-1)]),
            raw(10, "goto", vec![Operand::IntLiteral(3)]),
            raw(13, "iload_0", vec![]),
            raw(14, "ireturn", vec![]),
        ])
    }

    #[test]
    fn maps_offsets_onto_dense_indices() {
        let normalized = normalize_class(countdown()).unwrap();
        assert_eq!(normalized.name, "demo/Loop");
        assert_eq!(normalized.super_name, "java/lang/Object");
        let code = &normalized.methods[0].instructions;
        assert_eq!(code.len(), 8);
        assert_eq!(code[3].opcode, OPCode::Ifle);
        assert_eq!(code[3].operands, vec![Operand::BranchTarget(6)]);
        assert_eq!(code[5].operands, vec![Operand::BranchTarget(2)]);
        assert_eq!(code[3].offset, 4);
    }

    #[test]
    fn collapses_suffixed_mnemonics() {
        let normalized = normalize_class(countdown()).unwrap();
        let code = &normalized.methods[0].instructions;
        assert_eq!(code[1].opcode, OPCode::Istore);
        assert_eq!(code[1].operands, vec![Operand::LocalIndex(0)]);
        assert_eq!(code[4].operands, vec![Operand::LocalIndex(0), Operand::IntLiteral(-1)]);

        let minus_one = normalize_instruction("X", raw(0, "iconst_m1", vec![]));
        assert_eq!(minus_one.opcode, OPCode::Iconst);
        assert_eq!(minus_one.operands, vec![Operand::IntLiteral(-1)]);
    }

    #[test]
    fn unresolvable_branch_is_a_format_error() {
        let broken = class(vec![
            raw(0, "iconst_0", vec![]),
            raw(1, "ifeq", vec![Operand::IntLiteral(5)]),
            raw(4, "iconst_1", vec![]),
            raw(5, "ireturn", vec![]),
        ]);
        assert!(normalize_class(broken).is_ok());

        let broken = class(vec![
            raw(0, "iconst_0", vec![]),
            raw(1, "ifeq", vec![Operand::IntLiteral(3)]),
            raw(4, "iconst_1", vec![]),
            raw(5, "ireturn", vec![]),
        ]);
        assert_eq!(
            normalize_class(broken).unwrap_err(),
            ParseFormatError::UnresolvedBranch {
                class: "demo/Loop".to_string(),
                method: "run".to_string(),
                offset: 1,
                target: 3,
            }
        );
    }

    #[test]
    fn branches_need_exactly_one_offset() {
        let backwards = class(vec![
            raw(0, "iconst_0", vec![]),
            raw(1, "goto", vec![Operand::IntLiteral(-3)]),
            raw(4, "ireturn", vec![]),
        ]);
        assert_eq!(
            normalize_class(backwards).unwrap_err(),
            ParseFormatError::BadBranchOperand {
                class: "demo/Loop".to_string(),
                method: "run".to_string(),
                offset: 1,
                operands: "-3".to_string(),
            }
        );

        let bare = class(vec![
            raw(0, "iconst_0", vec![]),
            raw(1, "goto", vec![]),
            raw(4, "ireturn", vec![]),
        ]);
        assert!(matches!(
            normalize_class(bare),
            Err(ParseFormatError::BadBranchOperand { offset: 1, .. })
        ));

        let token = class(vec![
            raw(0, "ifeq", vec![Operand::Raw("L1".to_string())]),
            raw(3, "iconst_0", vec![]),
            raw(4, "ireturn", vec![]),
        ]);
        assert!(matches!(
            normalize_class(token),
            Err(ParseFormatError::BadBranchOperand { offset: 0, .. })
        ));

        let doubled = class(vec![
            raw(0, "goto", vec![Operand::IntLiteral(3), Operand::IntLiteral(3)]),
            raw(3, "iconst_0", vec![]),
            raw(4, "ireturn", vec![]),
        ]);
        assert!(normalize_class(doubled).is_err());
    }

    #[test]
    fn empty_string_constants_survive_the_trimmed_comment() {
        assert_eq!(parse_constant("String"), Some(Constant::String(String::new())));
        assert_eq!(parse_constant("String  "), Some(Constant::String(" ".to_string())));
        assert_eq!(parse_constant("Strings x"), None);

        let text = [
            "public class Blank",
            "{",
            "  public static java.lang.String blank();",
            "    descriptor: ()Ljava/lang/String;",
            "    flags: (0x0009) ACC_PUBLIC, ACC_STATIC",
            "    Code:",
            "      stack=1, locals=0, args_size=0",
            "         0: ldc           #7                  // String ",
            "         2: areturn",
            "}",
        ]
        .join("\n");
        let class = normalize_class(JavapParser::parse(&text).unwrap()).unwrap();
        assert_eq!(
            class.methods[0].instructions[0].operands,
            vec![Operand::ConstLiteral(Constant::String(String::new()))]
        );
    }

    #[test]
    fn normalizing_twice_changes_nothing() {
        let once = normalize_class(countdown()).unwrap();
        let twice = normalize_class(once.clone()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn reads_constants_from_comments() {
        assert_eq!(
            parse_constant("String hello, world"),
            Some(Constant::String("hello, world".to_string()))
        );
        assert_eq!(parse_constant("int 100000"), Some(Constant::Int(100000)));
        assert_eq!(parse_constant("float 1.5f"), Some(Constant::Float(1.5)));
        assert_eq!(parse_constant("long 9000000000l"), Some(Constant::Long(9_000_000_000)));
        assert_eq!(parse_constant("double 2.25d"), Some(Constant::Double(2.25)));
        assert_eq!(
            parse_constant("class java/lang/String"),
            Some(Constant::Class("java/lang/String".to_string()))
        );
        assert_eq!(parse_constant("MethodType (I)V"), None);
    }

    #[test]
    fn reads_member_references_from_comments() {
        let field = parse_field_ref("Sample", "Field java/lang/System.out:Ljava/io/PrintStream;")
            .unwrap();
        assert_eq!(field.owner, "java/lang/System");
        assert_eq!(field.name, "out");
        assert_eq!(field.descriptor, "Ljava/io/PrintStream;");

        let own = parse_field_ref("Sample", "Field counter:I").unwrap();
        assert_eq!(own.owner, "Sample");

        let init = parse_method_ref("Sample", r#"Method java/lang/Object."<init>":()V"#).unwrap();
        assert_eq!(init.owner, "java/lang/Object");
        assert_eq!(init.name, "<init>");
        assert_eq!(init.descriptor, "()V");

        let local = parse_method_ref("Sample", "Method add:(II)I").unwrap();
        assert_eq!(local.owner, "Sample");

        let own_init = parse_method_ref("Sample", r#"Method "<init>":()V"#).unwrap();
        assert_eq!((own_init.owner.as_str(), own_init.name.as_str()), ("Sample", "<init>"));

        let iface = parse_method_ref("Sample", "InterfaceMethod java/util/List.size:()I").unwrap();
        assert_eq!(iface.owner, "java/util/List");

        let clone = parse_method_ref("Sample", r#"Method "[I".clone:()Ljava/lang/Object;"#).unwrap();
        assert_eq!(clone.owner, "[I");
        assert_eq!(clone.name, "clone");
    }

    #[test]
    fn unparseable_comments_become_raw() {
        let insn = raw(0, "invokedynamic", vec![Operand::PoolIndex(7), Operand::IntLiteral(0)])
            .with_comment("InvokeDynamic #0:makeConcatWithConstants:(I)Ljava/lang/String;");
        let normalized = normalize_instruction("Sample", insn);
        assert_eq!(
            normalized.operands,
            vec![
                Operand::Raw(
                    "InvokeDynamic #0:makeConcatWithConstants:(I)Ljava/lang/String;".to_string()
                ),
                Operand::IntLiteral(0),
            ]
        );

        let insn = raw(0, "getstatic", vec![Operand::PoolIndex(2)]).with_comment("Something odd");
        let normalized = normalize_instruction("Sample", insn);
        assert_eq!(normalized.operands, vec![Operand::Raw("Something odd".to_string())]);

        let insn = raw(0, "ldc", vec![Operand::PoolIndex(2)]);
        let normalized = normalize_instruction("Sample", insn);
        assert_eq!(normalized.operands, vec![Operand::Raw(String::new())]);
    }

    #[test]
    fn keeps_trailing_immediates() {
        let insn = raw(0, "invokeinterface", vec![Operand::PoolIndex(9), Operand::IntLiteral(1)])
            .with_comment("InterfaceMethod java/lang/Runnable.run:()V");
        let normalized = normalize_instruction("Sample", insn);
        assert!(matches!(normalized.operands[0], Operand::MethodRef(_)));
        assert_eq!(normalized.operands[1], Operand::IntLiteral(1));
    }

    #[test]
    fn array_class_references_are_unquoted() {
        let insn = raw(0, "anewarray", vec![Operand::PoolIndex(4)])
            .with_comment(r#"class "[Ljava/lang/String;""#);
        let normalized = normalize_instruction("Sample", insn);
        assert_eq!(
            normalized.operands,
            vec![Operand::ClassRef("[Ljava/lang/String;".to_string())]
        );
    }

    #[test]
    fn normalizes_parsed_listing() {
        let text = r#"
public class Counter
{
  public static int count(int);
    descriptor: (I)I
    flags: (0x0009) ACC_PUBLIC, ACC_STATIC
    Code:
      stack=2, locals=2, args_size=1
         0: iconst_0
         1: istore_1
         2: iload_0
         3: ifle          16
         6: iinc          1, 1
         9: iinc          0, -1
        12: goto          2
        15: nop
        16: iload_1
        17: ireturn
}
"#;
        let class = normalize_class(JavapParser::parse(text).unwrap()).unwrap();
        let code = &class.methods[0].instructions;
        assert_eq!(code.len(), 10);
        assert_eq!(code[3].operands, vec![Operand::BranchTarget(8)]);
        assert_eq!(code[6].operands, vec![Operand::BranchTarget(2)]);
        let offsets: Vec<u32> = code.iter().map(|i| i.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3, 6, 9, 12, 15, 16, 17]);
    }
}
