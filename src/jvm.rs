//! Lightweight parser for `javap -c -verbose` disassembly listings.
//!
//! The listing is scanned line by line by a small state machine:
//!
//! ```text
//! Header ──class line──▶ Signature ──method line──▶ Metadata ──Code:──▶ Code
//!                            ▲                          │                 │
//!                            └──── blank / new method ──┘                 │
//!                            └──────────── blank / section header ───────┘
//! ```
//!
//! The output is a raw `ClassIR`: operands are classified by token shape
//! only and branch targets are still byte offsets.
use std::collections::BTreeSet;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, trace, warn};

use crate::bytecode::OPCode;
use crate::error::ParseFormatError;
use crate::ir::{canonical_name, ClassIR, Flag, Instruction, MethodIR, Operand, ROOT_CLASS};
use crate::program::MethodDescriptor;

lazy_static! {
    static ref CLASS_HEADER: Regex = Regex::new(
        r"^(?:[\w$]+\s+)*(class|interface|enum)\s+([^\s{]+)(?:\s+extends\s+([^\s{,]+))?"
    )
    .expect("class header regex");
    static ref METHOD_SIGNATURE: Regex =
        Regex::new(r"^(?:[^\s(]+\s+)*([^\s(]+)\(([^)]*)\)(?:\s+throws\s+[^;]+)?;$")
            .expect("method signature regex");
    static ref STATIC_INITIALIZER: Regex =
        Regex::new(r"^static\s*\{\s*\};$").expect("static initializer regex");
    static ref INSTRUCTION: Regex =
        Regex::new(r"(?i)^(\d+):\s+([a-z][a-z0-9_]*)(.*)$").expect("instruction regex");
    static ref HEX_INT: Regex = Regex::new(r"(?i)^0x[0-9a-f]+$").expect("hex regex");
}

/// Headers that close the instruction listing of a method.
const SECTION_TERMINATORS: &[&str] = &[
    "LineNumberTable",
    "LocalVariableTable",
    "LocalVariableTypeTable",
    "Exception table",
    "Exceptions:",
    "StackMapTable",
    "RuntimeVisibleAnnotations",
    "RuntimeInvisibleAnnotations",
    "RuntimeVisibleParameterAnnotations",
    "RuntimeInvisibleParameterAnnotations",
    "MethodParameters",
    "Signature:",
];

/// Parser state, one per kind of line we are waiting for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ScanState {
    Header,
    Signature,
    Metadata,
    Code,
}

/// Method whose body is being captured.
#[derive(Debug)]
struct PendingMethod {
    name: String,
    line: usize,
    descriptor: Option<String>,
    flags: BTreeSet<Flag>,
    max_stack: u16,
    max_locals: u16,
    args_size: u16,
    instructions: Vec<Instruction>,
}

impl PendingMethod {
    fn new(name: String, line: usize) -> Self {
        Self {
            name,
            line,
            descriptor: None,
            flags: BTreeSet::new(),
            max_stack: 0,
            max_locals: 0,
            args_size: 0,
            instructions: Vec::new(),
        }
    }
}

/// `JavapParser` turns the disassembly of exactly one class into raw IR.
pub struct JavapParser {
    state: ScanState,
    class_name: Option<String>,
    super_name: String,
    current: Option<PendingMethod>,
    methods: Vec<MethodIR>,
}

impl JavapParser {
    /// Parse the listing of a single class. Any malformed line aborts the
    /// whole class.
    pub fn parse(text: &str) -> Result<ClassIR, ParseFormatError> {
        let mut parser = Self {
            state: ScanState::Header,
            class_name: None,
            super_name: ROOT_CLASS.to_string(),
            current: None,
            methods: Vec::new(),
        };
        for (index, line) in text.lines().enumerate() {
            parser.feed(index + 1, line)?;
        }
        parser.finish_method()?;

        let name = parser.class_name.ok_or(ParseFormatError::MissingClassHeader)?;
        debug!(class = %name, methods = parser.methods.len(), "parsed disassembly");
        Ok(ClassIR {
            name,
            super_name: parser.super_name,
            methods: parser.methods,
        })
    }

    fn feed(&mut self, line_no: usize, line: &str) -> Result<(), ParseFormatError> {
        let trimmed = line.trim();
        match self.state {
            ScanState::Header => self.scan_header(trimmed),
            ScanState::Signature => {
                self.scan_signature(line_no, trimmed);
                Ok(())
            }
            ScanState::Metadata => self.scan_metadata(line_no, trimmed),
            ScanState::Code => self.scan_code(line_no, trimmed),
        }
    }

    fn scan_header(&mut self, trimmed: &str) -> Result<(), ParseFormatError> {
        let declaration = strip_generics(trimmed);
        if let Some(caps) = CLASS_HEADER.captures(&declaration) {
            let name = canonical_name(&caps[2]);
            // Interfaces list their super-interfaces after `extends`.
            if &caps[1] != "interface" {
                if let Some(parent) = caps.get(3) {
                    self.super_name = canonical_name(parent.as_str());
                }
            }
            debug!(class = %name, super_name = %self.super_name, "class header");
            self.class_name = Some(name);
            self.state = ScanState::Signature;
        }
        Ok(())
    }

    /// Start a new method if `trimmed` is a method signature.
    fn scan_signature(&mut self, line_no: usize, trimmed: &str) {
        if let Some(name) = self.method_name(trimmed) {
            trace!(line = line_no, method = %name, "method signature");
            self.current = Some(PendingMethod::new(name, line_no));
            self.state = ScanState::Metadata;
        }
    }

    fn method_name(&self, trimmed: &str) -> Option<String> {
        if STATIC_INITIALIZER.is_match(trimmed) {
            return Some("<clinit>".to_string());
        }
        let declaration = strip_generics(trimmed);
        let caps = METHOD_SIGNATURE.captures(&declaration)?;
        let name = canonical_name(&caps[1]);
        // Constructors are printed under the class name.
        let is_constructor = self.class_name.as_deref() == Some(name.as_str());
        Some(if is_constructor {
            "<init>".to_string()
        } else {
            name
        })
    }

    fn scan_metadata(&mut self, line_no: usize, trimmed: &str) -> Result<(), ParseFormatError> {
        if trimmed.is_empty() {
            return self.finish_method();
        }
        let Some(method) = self.current.as_mut() else {
            self.state = ScanState::Signature;
            return Ok(());
        };
        if let Some(descriptor) = trimmed.strip_prefix("descriptor:") {
            method.descriptor = Some(descriptor.trim().to_string());
        } else if let Some(flags) = trimmed.strip_prefix("flags:") {
            method.flags = parse_flags(flags);
        } else if trimmed.starts_with("Code:") {
            self.state = ScanState::Code;
        } else if self.method_name(trimmed).is_some() {
            // A body-less method followed directly by the next signature.
            self.finish_method()?;
            self.scan_signature(line_no, trimmed);
        }
        Ok(())
    }

    fn scan_code(&mut self, line_no: usize, trimmed: &str) -> Result<(), ParseFormatError> {
        if trimmed.is_empty()
            || SECTION_TERMINATORS
                .iter()
                .any(|header| trimmed.starts_with(header))
        {
            return self.finish_method();
        }
        let Some(method) = self.current.as_mut() else {
            self.state = ScanState::Signature;
            return Ok(());
        };

        if trimmed.starts_with("stack=") {
            return parse_metrics(line_no, trimmed, method);
        }

        let Some(caps) = INSTRUCTION.captures(trimmed) else {
            // Switch table bodies and other decorations.
            trace!(line = line_no, "skipping unclassified code line");
            return Ok(());
        };
        let offset: u32 = caps[1]
            .parse()
            .map_err(|_| ParseFormatError::BadInstruction {
                line: line_no,
                text: trimmed.to_string(),
            })?;
        if let Some(previous) = method.instructions.last().map(|i| i.offset) {
            if offset <= previous {
                return Err(ParseFormatError::NonMonotonicOffset {
                    line: line_no,
                    offset,
                    previous,
                });
            }
        }

        let (operand_text, comment) = split_comment(&caps[3]);
        let mut insn = Instruction::new(
            offset,
            OPCode::from_mnemonic(&caps[2]),
            parse_operands(operand_text),
        );
        insn.comment = comment;
        method.instructions.push(insn);
        Ok(())
    }

    /// Close the current method, emitting it only if it captured code.
    fn finish_method(&mut self) -> Result<(), ParseFormatError> {
        self.state = ScanState::Signature;
        let Some(method) = self.current.take() else {
            return Ok(());
        };
        if method.instructions.is_empty() {
            debug!(method = %method.name, "discarding method without code");
            return Ok(());
        }
        let descriptor = method
            .descriptor
            .ok_or_else(|| ParseFormatError::MissingDescriptor {
                line: method.line,
                method: method.name.clone(),
            })?;
        MethodDescriptor::parse(&descriptor).map_err(|source| {
            ParseFormatError::BadDescriptor {
                method: method.name.clone(),
                source,
            }
        })?;
        debug!(
            method = %method.name,
            descriptor = %descriptor,
            instructions = method.instructions.len(),
            "captured method"
        );
        self.methods.push(MethodIR {
            name: method.name,
            descriptor,
            flags: method.flags,
            max_stack: method.max_stack,
            max_locals: method.max_locals,
            args_size: method.args_size,
            instructions: method.instructions,
        });
        Ok(())
    }
}

/// Parse `stack=<n>, locals=<n>, args_size=<n>`. Every field must be
/// present exactly once as a non-negative integer, and nothing else may
/// appear on the line.
fn parse_metrics(
    line_no: usize,
    trimmed: &str,
    method: &mut PendingMethod,
) -> Result<(), ParseFormatError> {
    let bad = |field: &str, value: &str| ParseFormatError::BadMetric {
        line: line_no,
        field: field.to_string(),
        value: value.to_string(),
    };
    let (mut stack, mut locals, mut args_size) = (None, None, None);
    for metric in trimmed.split(',') {
        let (key, value) = metric.split_once('=').unwrap_or((metric, ""));
        let (key, value) = (key.trim(), value.trim());
        let slot = match key {
            "stack" => &mut stack,
            "locals" => &mut locals,
            "args_size" => &mut args_size,
            _ => return Err(bad(key, value)),
        };
        if slot.is_some() {
            return Err(bad(key, value));
        }
        *slot = Some(value.parse::<u16>().map_err(|_| bad(key, value))?);
    }
    method.max_stack = stack.ok_or_else(|| bad("stack", ""))?;
    method.max_locals = locals.ok_or_else(|| bad("locals", ""))?;
    method.args_size = args_size.ok_or_else(|| bad("args_size", ""))?;
    Ok(())
}

fn parse_flags(text: &str) -> BTreeSet<Flag> {
    text.split(|c: char| c == ',' || c.is_whitespace())
        .map(|token| token.trim_matches(|c| c == '(' || c == ')'))
        .filter(|token| token.starts_with("ACC_"))
        .filter_map(|token| match token.parse::<Flag>() {
            Ok(flag) => Some(flag),
            Err(()) => {
                // ACC_SUPER and friends only apply to classes.
                if token != "ACC_SUPER" {
                    warn!(token, "ignoring unknown method flag");
                }
                None
            }
        })
        .collect()
}

/// Split an instruction remainder into its operand text and its trailing
/// `//` comment.
fn split_comment(segment: &str) -> (&str, Option<String>) {
    match segment.find("//") {
        Some(index) => {
            let comment = segment[index + 2..].trim();
            let comment = (!comment.is_empty()).then(|| comment.to_string());
            (segment[..index].trim(), comment)
        }
        None => (segment.trim(), None),
    }
}

/// Tokenize operands on commas and whitespace and classify each token by
/// its shape.
fn parse_operands(text: &str) -> Vec<Operand> {
    text.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .map(classify_token)
        .collect()
}

fn classify_token(token: &str) -> Operand {
    if let Some(index) = token.strip_prefix('#') {
        if let Ok(index) = index.parse() {
            return Operand::PoolIndex(index);
        }
    }
    if token
        .strip_prefix(['+', '-'])
        .unwrap_or(token)
        .bytes()
        .all(|b| b.is_ascii_digit())
    {
        if let Ok(value) = token.parse::<i32>() {
            return Operand::IntLiteral(value);
        }
    }
    if HEX_INT.is_match(token) {
        if let Ok(value) = u32::from_str_radix(&token[2..], 16) {
            return Operand::IntLiteral(value as i32);
        }
    }
    Operand::Raw(token.to_string())
}

/// Remove generic parameter lists, `Map<K, List<V>>` becomes `Map`.
fn strip_generics(text: &str) -> String {
    let mut depth = 0usize;
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => depth += 1,
            '>' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;
    use std::path::Path;

    const ADD_ONLY: &str = r#"
Classfile /tmp/Adder.class
  Compiled from "Adder.java"
public class demo.Adder extends demo.Base
  minor version: 0
  major version: 65
  flags: (0x0021) ACC_PUBLIC, ACC_SUPER
{
  public static int add(int, int);
    descriptor: (II)I
    flags: (0x0009) ACC_PUBLIC, ACC_STATIC
    Code:
      stack=2, locals=2, args_size=2
         0: iload_0
         1: iload_1
         2: iadd
         3: ireturn
      LineNumberTable:
        line 3: 0
}
"#;

    #[test]
    fn can_parse_sample_listing() {
        let env_var = env::var("CARGO_MANIFEST_DIR").unwrap();
        let path = Path::new(&env_var).join("support/Sample.javap");
        let text = fs::read_to_string(path).unwrap();
        let class = JavapParser::parse(&text).unwrap();

        assert_eq!(class.name, "Sample");
        assert_eq!(class.super_name, ROOT_CLASS);
        let names: Vec<&str> = class.methods.iter().map(|m| m.name.as_str()).collect();
        assert!(names.contains(&"<init>"));
        assert!(names.contains(&"<clinit>"));
        assert!(names.contains(&"factorial"));

        let factorial = class.method("factorial", "(I)I").unwrap();
        assert_eq!(factorial.max_stack, 2);
        assert_eq!(factorial.max_locals, 3);
        assert_eq!(factorial.args_size, 1);
        assert_eq!(factorial.instructions.len(), 15);
    }

    #[test]
    fn captures_class_names_and_metrics() {
        let class = JavapParser::parse(ADD_ONLY).unwrap();
        assert_eq!(class.name, "demo/Adder");
        assert_eq!(class.super_name, "demo/Base");
        assert_eq!(class.methods.len(), 1);

        let add = &class.methods[0];
        assert_eq!(add.name, "add");
        assert_eq!(add.descriptor, "(II)I");
        assert!(add.is_static());
        assert!(add.flags.contains(&Flag::Public));
        assert_eq!((add.max_stack, add.max_locals, add.args_size), (2, 2, 2));
        let offsets: Vec<u32> = add.instructions.iter().map(|i| i.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3]);
        assert_eq!(add.instructions[0].opcode, OPCode::Other("ILOAD_0".to_string()));
        assert_eq!(add.instructions[2].opcode, OPCode::Iadd);
    }

    #[test]
    fn classifies_operand_tokens() {
        assert_eq!(
            parse_operands("#7"),
            vec![Operand::PoolIndex(7)]
        );
        assert_eq!(
            parse_operands("2, -1"),
            vec![Operand::IntLiteral(2), Operand::IntLiteral(-1)]
        );
        assert_eq!(parse_operands("0x1F"), vec![Operand::IntLiteral(31)]);
        assert_eq!(parse_operands("int"), vec![Operand::Raw("int".to_string())]);
        assert_eq!(
            parse_operands("#9,  2"),
            vec![Operand::PoolIndex(9), Operand::IntLiteral(2)]
        );
    }

    #[test]
    fn keeps_trailing_comment_verbatim() {
        let (operands, comment) =
            split_comment(" #13                 // String http://example.com");
        assert_eq!(operands, "#13");
        assert_eq!(comment.as_deref(), Some("String http://example.com"));
        assert_eq!(split_comment("   "), ("", None));
    }

    #[test]
    fn drops_methods_without_code() {
        let text = r#"
public abstract class Shape
{
  public abstract int area();
    descriptor: ()I
    flags: (0x0401) ACC_PUBLIC, ACC_ABSTRACT

  public int twice(int);
    descriptor: (I)I
    flags: (0x0001) ACC_PUBLIC
    Code:
      stack=2, locals=2, args_size=2
         0: iload_1
         1: iconst_2
         2: imul
         3: ireturn
}
"#;
        let class = JavapParser::parse(text).unwrap();
        assert_eq!(class.methods.len(), 1);
        assert_eq!(class.methods[0].name, "twice");
        assert_eq!(class.methods[0].descriptor, "(I)I");
    }

    #[test]
    fn abstract_method_directly_followed_by_signature() {
        let text = r#"
public interface Greeter
{
  public abstract void greet();
    descriptor: ()V
    flags: (0x0401) ACC_PUBLIC, ACC_ABSTRACT
  public static int answer();
    descriptor: ()I
    flags: (0x0009) ACC_PUBLIC, ACC_STATIC
    Code:
      stack=1, locals=0, args_size=0
         0: bipush        42
         2: ireturn
}
"#;
        let class = JavapParser::parse(text).unwrap();
        assert_eq!(class.name, "Greeter");
        assert_eq!(class.methods.len(), 1);
        assert_eq!(class.methods[0].name, "answer");
        assert_eq!(class.methods[0].descriptor, "()I");
    }

    #[test]
    fn malformed_metrics_fail_loudly() {
        let text = ADD_ONLY.replace("locals=2", "locals=two");
        let err = JavapParser::parse(&text).unwrap_err();
        assert_eq!(
            err,
            ParseFormatError::BadMetric {
                line: 13,
                field: "locals".to_string(),
                value: "two".to_string(),
            }
        );
    }

    #[test]
    fn negative_metrics_are_rejected() {
        let text = ADD_ONLY.replace("stack=2", "stack=-2");
        assert!(matches!(
            JavapParser::parse(&text),
            Err(ParseFormatError::BadMetric { .. })
        ));
    }

    #[test]
    fn missing_metrics_are_not_defaulted() {
        let text = ADD_ONLY.replace("stack=2, locals=2, args_size=2", "stack=2, args_size=2");
        assert_eq!(
            JavapParser::parse(&text).unwrap_err(),
            ParseFormatError::BadMetric {
                line: 13,
                field: "locals".to_string(),
                value: String::new(),
            }
        );
    }

    #[test]
    fn unknown_metric_tokens_are_rejected() {
        let text = ADD_ONLY.replace("args_size=2", "args_size=2, junk");
        assert_eq!(
            JavapParser::parse(&text).unwrap_err(),
            ParseFormatError::BadMetric {
                line: 13,
                field: "junk".to_string(),
                value: String::new(),
            }
        );

        let text = ADD_ONLY.replace("args_size=2", "args_size=2, stack=3");
        assert!(matches!(
            JavapParser::parse(&text),
            Err(ParseFormatError::BadMetric { .. })
        ));
    }

    #[test]
    fn offsets_must_increase() {
        let text = ADD_ONLY.replace("2: iadd", "1: iadd");
        let err = JavapParser::parse(&text).unwrap_err();
        assert!(matches!(
            err,
            ParseFormatError::NonMonotonicOffset {
                offset: 1,
                previous: 1,
                ..
            }
        ));
    }

    #[test]
    fn missing_header_is_an_error() {
        let err = JavapParser::parse("  stack=1, locals=0, args_size=0\n").unwrap_err();
        assert_eq!(err, ParseFormatError::MissingClassHeader);
    }

    #[test]
    fn code_without_descriptor_is_an_error() {
        let text = ADD_ONLY.replace("    descriptor: (II)I\n", "");
        assert!(matches!(
            JavapParser::parse(&text),
            Err(ParseFormatError::MissingDescriptor { .. })
        ));
    }

    #[test]
    fn switch_bodies_are_skipped() {
        let text = r#"
public class Switch
{
  public static int pick(int);
    descriptor: (I)I
    flags: (0x0009) ACC_PUBLIC, ACC_STATIC
    Code:
      stack=1, locals=1, args_size=1
         0: iload_0
         1: tableswitch   { // 0 to 1
                       0: 24
                       1: 26
                 default: 28
            }
        24: iconst_1
        25: ireturn
        26: iconst_2
        27: ireturn
        28: iconst_0
        29: ireturn
}
"#;
        let class = JavapParser::parse(text).unwrap();
        let offsets: Vec<u32> = class.methods[0].instructions.iter().map(|i| i.offset).collect();
        assert_eq!(offsets, vec![0, 1, 24, 25, 26, 27, 28, 29]);
    }

    #[test]
    fn constructors_and_generics() {
        let text = r#"
public class demo.Box<T extends java.lang.Comparable<T>> extends demo.Holder<T>
{
  public demo.Box();
    descriptor: ()V
    flags: (0x0001) ACC_PUBLIC
    Code:
      stack=1, locals=1, args_size=1
         0: aload_0
         1: invokespecial #1                  // Method demo/Holder."<init>":()V
         4: return

  public <R> R map(java.util.function.Function<T, R>) throws java.io.IOException;
    descriptor: (Ljava/util/function/Function;)Ljava/lang/Object;
    flags: (0x0001) ACC_PUBLIC
    Code:
      stack=1, locals=2, args_size=2
         0: aconst_null
         1: areturn
}
"#;
        let class = JavapParser::parse(text).unwrap();
        assert_eq!(class.name, "demo/Box");
        assert_eq!(class.super_name, "demo/Holder");
        assert_eq!(class.methods[0].name, "<init>");
        assert_eq!(
            class.methods[0].instructions[1].comment.as_deref(),
            Some(r#"Method demo/Holder."<init>":()V"#)
        );
        assert_eq!(class.methods[1].name, "map");
    }
}
