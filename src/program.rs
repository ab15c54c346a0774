//! Loaded representation of the Java program we want to run: the class
//! table, the per-class method tables and the descriptor types that size
//! frames and calls.
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, warn};

use crate::bytecode::Family;
use crate::error::{DescriptorError, ParseFormatError};
use crate::ir::{canonical_name, ClassIR, MethodIR, Operand};

lazy_static! {
    static ref METHOD_DESCRIPTOR: Regex =
        Regex::new(r"^\(([^)]*)\)(.+)$").expect("descriptor regex");
}

/// Types that can appear in a descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BaseTypeKind {
    Byte,
    Char,
    Short,
    Boolean,
    Int,
    Long,
    Float,
    Double,
    Void,
    Object,
    Array,
}

/// JVM value type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type {
    pub t: BaseTypeKind,
    /// Class name for objects, component type for arrays.
    pub class_name: Option<String>,
    pub sub_t: Option<Box<Type>>,
}

impl Type {
    fn base(t: BaseTypeKind) -> Self {
        Self {
            t,
            class_name: None,
            sub_t: None,
        }
    }

    /// Returns the number of local variable slots the type occupies.
    pub fn size(&self) -> usize {
        match self.t {
            BaseTypeKind::Long | BaseTypeKind::Double => 2,
            BaseTypeKind::Void => 0,
            _ => 1,
        }
    }

    /// Whether values of this type are modeled as 32-bit integers.
    pub fn is_int_like(&self) -> bool {
        matches!(
            self.t,
            BaseTypeKind::Byte
                | BaseTypeKind::Char
                | BaseTypeKind::Short
                | BaseTypeKind::Boolean
                | BaseTypeKind::Int
        )
    }

    /// Decode the type at the start of `type_str`, returning it together
    /// with the number of bytes it spans.
    pub fn decode(type_str: &str) -> Result<(Type, usize), String> {
        let first = type_str.chars().next().ok_or("unexpected end of descriptor")?;
        let t = match first {
            'B' => BaseTypeKind::Byte,
            'C' => BaseTypeKind::Char,
            'S' => BaseTypeKind::Short,
            'Z' => BaseTypeKind::Boolean,
            'I' => BaseTypeKind::Int,
            'J' => BaseTypeKind::Long,
            'F' => BaseTypeKind::Float,
            'D' => BaseTypeKind::Double,
            'V' => BaseTypeKind::Void,
            'L' => {
                let end = type_str
                    .find(';')
                    .ok_or_else(|| format!("unterminated class type `{type_str}`"))?;
                if end == 1 {
                    return Err("empty class name".to_string());
                }
                let ty = Type {
                    t: BaseTypeKind::Object,
                    class_name: Some(canonical_name(&type_str[1..end])),
                    sub_t: None,
                };
                return Ok((ty, end + 1));
            }
            '[' => {
                let (component, length) = Self::decode(&type_str[1..])?;
                if component.t == BaseTypeKind::Void {
                    return Err("array of void".to_string());
                }
                let ty = Type {
                    t: BaseTypeKind::Array,
                    class_name: None,
                    sub_t: Some(Box::new(component)),
                };
                return Ok((ty, length + 1));
            }
            other => return Err(format!("unknown type code `{other}`")),
        };
        Ok((Self::base(t), 1))
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (self.t, &self.class_name, &self.sub_t) {
            (BaseTypeKind::Object, Some(name), _) => write!(f, "L{name};"),
            (BaseTypeKind::Array, _, Some(component)) => write!(f, "[{component}"),
            (t, _, _) => {
                let code = match t {
                    BaseTypeKind::Byte => 'B',
                    BaseTypeKind::Char => 'C',
                    BaseTypeKind::Short => 'S',
                    BaseTypeKind::Boolean => 'Z',
                    BaseTypeKind::Int => 'I',
                    BaseTypeKind::Long => 'J',
                    BaseTypeKind::Float => 'F',
                    BaseTypeKind::Double => 'D',
                    _ => 'V',
                };
                write!(f, "{code}")
            }
        }
    }
}

/// Parsed method descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub arg_types: Vec<Type>,
    pub return_type: Type,
}

impl MethodDescriptor {
    /// Parse a descriptor of the form `(params)return`.
    pub fn parse(descriptor: &str) -> Result<Self, DescriptorError> {
        let caps = METHOD_DESCRIPTOR
            .captures(descriptor)
            .ok_or_else(|| DescriptorError::new(descriptor, "expected `(params)return`"))?;
        let arg_string = caps.get(1).map_or("", |m| m.as_str());
        let return_type_string = caps.get(2).map_or("", |m| m.as_str());

        let mut arg_types = Vec::new();
        let mut rest = arg_string;
        while !rest.is_empty() {
            let (t, length) =
                Type::decode(rest).map_err(|reason| DescriptorError::new(descriptor, reason))?;
            if t.t == BaseTypeKind::Void {
                return Err(DescriptorError::new(descriptor, "void parameter"));
            }
            arg_types.push(t);
            rest = &rest[length..];
        }

        let (return_type, length) = Type::decode(return_type_string)
            .map_err(|reason| DescriptorError::new(descriptor, reason))?;
        if length != return_type_string.len() {
            return Err(DescriptorError::new(
                descriptor,
                format!("trailing characters after return type `{return_type}`"),
            ));
        }

        Ok(Self {
            arg_types,
            return_type,
        })
    }

    /// Number of operand stack values a call consumes, not counting the
    /// receiver.
    pub fn arg_count(&self) -> usize {
        self.arg_types.len()
    }

    /// Number of local variable slots the arguments occupy.
    pub fn arg_slots(&self) -> usize {
        self.arg_types.iter().map(Type::size).sum()
    }

    /// Whether a call pushes a result.
    pub fn returns_value(&self) -> bool {
        self.return_type.t != BaseTypeKind::Void
    }
}

/// Identity of a method, used for lookups and bridge registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodKey {
    pub class: String,
    pub name: String,
    pub descriptor: String,
}

impl MethodKey {
    pub fn new(class: &str, name: &str, descriptor: &str) -> Self {
        Self {
            class: canonical_name(class),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}{}", self.class, self.name, self.descriptor)
    }
}

/// Method ready for execution.
#[derive(Debug)]
pub struct LoadedMethod {
    /// Dense id, unique across the manifest.
    pub id: usize,
    pub class: String,
    pub ir: MethodIR,
    pub descriptor: MethodDescriptor,
}

impl LoadedMethod {
    pub fn name(&self) -> &str {
        &self.ir.name
    }

    pub fn is_static(&self) -> bool {
        self.ir.is_static()
    }
}

/// Class entry in the class table.
#[derive(Debug)]
pub struct LoadedClass {
    pub name: String,
    /// Recorded for diagnostics; method lookup never consults it.
    pub super_name: String,
    methods: HashMap<(String, String), Rc<LoadedMethod>>,
}

impl LoadedClass {
    pub fn method(&self, name: &str, descriptor: &str) -> Option<&Rc<LoadedMethod>> {
        self.methods
            .get(&(name.to_string(), descriptor.to_string()))
    }
}

/// The loaded, execution-ready set of classes.
#[derive(Debug, Default)]
pub struct Manifest {
    classes: HashMap<String, LoadedClass>,
    method_count: usize,
}

impl Manifest {
    /// Build the class table from normalized classes.
    ///
    /// Rejects IR that still carries parser-level operands, branch indices
    /// outside the method and malformed method descriptors.
    pub fn load(classes: Vec<ClassIR>) -> Result<Self, ParseFormatError> {
        let mut manifest = Manifest::default();
        for class in classes {
            manifest.insert(class)?;
        }
        debug!(
            classes = manifest.classes.len(),
            methods = manifest.method_count,
            "manifest loaded"
        );
        Ok(manifest)
    }

    fn insert(&mut self, class: ClassIR) -> Result<(), ParseFormatError> {
        let name = canonical_name(&class.name);
        let mut methods = HashMap::new();
        for method in class.methods {
            verify_method(&name, &method)?;
            let descriptor = MethodDescriptor::parse(&method.descriptor).map_err(|source| {
                ParseFormatError::BadDescriptor {
                    method: format!("{name}.{}", method.name),
                    source,
                }
            })?;
            let loaded = LoadedMethod {
                id: self.method_count,
                class: name.clone(),
                descriptor,
                ir: method,
            };
            self.method_count += 1;
            methods.insert(
                (loaded.ir.name.clone(), loaded.ir.descriptor.clone()),
                Rc::new(loaded),
            );
        }
        let loaded = LoadedClass {
            name: name.clone(),
            super_name: canonical_name(&class.super_name),
            methods,
        };
        if self.classes.insert(name.clone(), loaded).is_some() {
            warn!(class = %name, "duplicate class in manifest, keeping the last definition");
        }
        Ok(())
    }

    pub fn class(&self, name: &str) -> Option<&LoadedClass> {
        self.classes.get(&canonical_name(name))
    }

    /// Find a method by exact owner, name and descriptor.
    pub fn find_method(&self, key: &MethodKey) -> Option<Rc<LoadedMethod>> {
        self.classes
            .get(&key.class)
            .and_then(|class| class.method(&key.name, &key.descriptor))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

fn verify_method(class: &str, method: &MethodIR) -> Result<(), ParseFormatError> {
    let not_normalized = |index: usize, reason: String| ParseFormatError::NotNormalized {
        class: class.to_string(),
        method: method.name.clone(),
        index,
        reason,
    };
    if method.instructions.is_empty() {
        return Err(not_normalized(0, "method has no instructions".to_string()));
    }
    for (index, insn) in method.instructions.iter().enumerate() {
        if insn.opcode.family() == Family::ControlTransfer
            && !matches!(insn.operands.as_slice(), [Operand::BranchTarget(_)])
        {
            return Err(not_normalized(index, "branch has no resolved target".to_string()));
        }
        for operand in &insn.operands {
            match operand {
                op if op.is_unresolved() => {
                    return Err(not_normalized(index, format!("operand {op} is unresolved")));
                }
                Operand::BranchTarget(target) if *target >= method.instructions.len() => {
                    return Err(not_normalized(
                        index,
                        format!("branch target #{target} is out of range"),
                    ));
                }
                _ => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::OPCode;
    use crate::ir::{Flag, Instruction};

    fn method(name: &str, descriptor: &str, instructions: Vec<Instruction>) -> MethodIR {
        MethodIR {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            flags: [Flag::Static].into_iter().collect(),
            max_stack: 2,
            max_locals: 2,
            args_size: 2,
            instructions,
        }
    }

    fn class(methods: Vec<MethodIR>) -> ClassIR {
        ClassIR {
            name: "demo.Sample".to_string(),
            super_name: "java.lang.Object".to_string(),
            methods,
        }
    }

    #[test]
    fn counts_one_value_per_parameter() {
        let descriptor = MethodDescriptor::parse("(I[[JLjava/lang/String;D)V").unwrap();
        assert_eq!(descriptor.arg_count(), 4);
        assert_eq!(descriptor.arg_slots(), 1 + 1 + 1 + 2);
        assert!(!descriptor.returns_value());
        assert_eq!(descriptor.arg_types[1].t, BaseTypeKind::Array);
        assert_eq!(
            descriptor.arg_types[2].class_name.as_deref(),
            Some("java/lang/String")
        );
    }

    #[test]
    fn object_arrays_count_once() {
        let descriptor = MethodDescriptor::parse("([Ljava/lang/String;)I").unwrap();
        assert_eq!(descriptor.arg_count(), 1);
        assert!(descriptor.returns_value());
        assert_eq!(descriptor.arg_types[0].to_string(), "[Ljava/lang/String;");
    }

    #[test]
    fn empty_parameter_list() {
        let descriptor = MethodDescriptor::parse("()Ljava/lang/Object;").unwrap();
        assert_eq!(descriptor.arg_count(), 0);
        assert_eq!(descriptor.return_type.t, BaseTypeKind::Object);
    }

    #[test]
    fn rejects_malformed_descriptors() {
        for bad in ["II)V", "(Q)V", "(Ljava/lang/String)V", "(I)", "(I)VV", "(V)V", "(I)[V"] {
            assert!(MethodDescriptor::parse(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn loads_classes_under_canonical_names() {
        let add = method(
            "add",
            "(II)I",
            vec![
                Instruction::new(0, OPCode::Iload, vec![Operand::LocalIndex(0)]),
                Instruction::new(1, OPCode::Iload, vec![Operand::LocalIndex(1)]),
                Instruction::new(2, OPCode::Iadd, vec![]),
                Instruction::new(3, OPCode::Ireturn, vec![]),
            ],
        );
        let manifest = Manifest::load(vec![class(vec![add])]).unwrap();
        let loaded = manifest.class("demo.Sample").unwrap();
        assert_eq!(loaded.name, "demo/Sample");
        assert_eq!(loaded.super_name, "java/lang/Object");

        let found = manifest
            .find_method(&MethodKey::new("demo.Sample", "add", "(II)I"))
            .unwrap();
        assert!(found.is_static());
        assert_eq!(found.descriptor.arg_count(), 2);
        assert!(manifest
            .find_method(&MethodKey::new("demo/Sample", "add", "(I)I"))
            .is_none());
    }

    #[test]
    fn rejects_raw_branch_offsets() {
        let looping = method(
            "spin",
            "()V",
            vec![Instruction::new(0, OPCode::Goto, vec![Operand::BranchOffset(0)])],
        );
        let err = Manifest::load(vec![class(vec![looping])]).unwrap_err();
        assert!(matches!(err, ParseFormatError::NotNormalized { index: 0, .. }));
    }

    #[test]
    fn rejects_branches_without_a_resolved_target() {
        let shapes = [
            vec![],
            vec![Operand::IntLiteral(-3)],
            vec![Operand::Raw("L1".to_string())],
        ];
        for operands in shapes {
            let jump = method(
                "jump",
                "()V",
                vec![
                    Instruction::new(0, OPCode::Ifeq, operands),
                    Instruction::new(3, OPCode::Return, vec![]),
                ],
            );
            let err = Manifest::load(vec![class(vec![jump])]).unwrap_err();
            assert!(matches!(err, ParseFormatError::NotNormalized { index: 0, .. }));
        }
    }

    #[test]
    fn rejects_out_of_range_targets() {
        let jump = method(
            "jump",
            "()V",
            vec![
                Instruction::new(0, OPCode::Goto, vec![Operand::BranchTarget(5)]),
                Instruction::new(3, OPCode::Return, vec![]),
            ],
        );
        assert!(Manifest::load(vec![class(vec![jump])]).is_err());
    }

    #[test]
    fn rejects_bad_method_descriptors() {
        let broken = method(
            "broken",
            "(II",
            vec![Instruction::new(0, OPCode::Return, vec![])],
        );
        let err = Manifest::load(vec![class(vec![broken])]).unwrap_err();
        assert!(matches!(err, ParseFormatError::BadDescriptor { .. }));
    }
}
