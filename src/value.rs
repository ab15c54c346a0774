//! Values manipulated by the interpreter and the heap that backs object
//! references.
use std::collections::HashMap;
use std::fmt;

use crate::program::BaseTypeKind;

/// Opaque handle to a heap object.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef(u32);

impl ObjectRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// JVM value types. Everything that is not a 32-bit integer lives on the
/// heap and travels as a reference.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i32),
    Ref(ObjectRef),
    Null,
}

impl Value {
    pub fn as_int(self) -> Option<i32> {
        match self {
            Self::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_reference(self) -> bool {
        !matches!(self, Self::Int(_))
    }

    /// Short name used in type mismatch messages.
    pub fn kind(self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Ref(_) => "reference",
            Self::Null => "null",
        }
    }

    /// Default value of a field with the given descriptor.
    pub fn default_for(descriptor: &str) -> Self {
        match descriptor.chars().next() {
            Some('B' | 'C' | 'S' | 'Z' | 'I') => Self::Int(0),
            _ => Self::Null,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Ref(r) => write!(f, "{r}"),
            Self::Null => f.write_str("null"),
        }
    }
}

/// Objects owned by the heap.
#[derive(Debug, Clone, PartialEq)]
pub enum HeapObject {
    String(String),
    /// Class literal loaded by `LDC`.
    Class(String),
    Float(f32),
    Long(i64),
    Double(f64),
    Instance {
        class: String,
        fields: HashMap<String, Value>,
    },
    IntArray {
        component: BaseTypeKind,
        elements: Vec<i32>,
    },
    RefArray {
        component: String,
        elements: Vec<Value>,
    },
}

impl HeapObject {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Class(_) => "class literal",
            Self::Float(_) => "float",
            Self::Long(_) => "long",
            Self::Double(_) => "double",
            Self::Instance { .. } => "instance",
            Self::IntArray { .. } | Self::RefArray { .. } => "array",
        }
    }

    /// Whether the value occupies two slots in the JVM's view of the
    /// operand stack.
    pub fn is_wide(&self) -> bool {
        matches!(self, Self::Long(_) | Self::Double(_))
    }
}

/// Grow-only object store. Strings and class literals are interned so that
/// loading the same constant twice yields the same reference.
#[derive(Debug, Default)]
pub struct Heap {
    objects: Vec<HeapObject>,
    strings: HashMap<String, ObjectRef>,
    classes: HashMap<String, ObjectRef>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, object: HeapObject) -> ObjectRef {
        let handle = ObjectRef(self.objects.len() as u32);
        self.objects.push(object);
        handle
    }

    pub fn get(&self, handle: ObjectRef) -> Option<&HeapObject> {
        self.objects.get(handle.index())
    }

    pub fn get_mut(&mut self, handle: ObjectRef) -> Option<&mut HeapObject> {
        self.objects.get_mut(handle.index())
    }

    pub fn intern_string(&mut self, text: &str) -> ObjectRef {
        if let Some(handle) = self.strings.get(text) {
            return *handle;
        }
        let handle = self.alloc(HeapObject::String(text.to_string()));
        self.strings.insert(text.to_string(), handle);
        handle
    }

    pub fn class_literal(&mut self, name: &str) -> ObjectRef {
        if let Some(handle) = self.classes.get(name) {
            return *handle;
        }
        let handle = self.alloc(HeapObject::Class(name.to_string()));
        self.classes.insert(name.to_string(), handle);
        handle
    }

    /// Text of a string object, `None` for anything else.
    pub fn string(&self, value: Value) -> Option<&str> {
        match value {
            Value::Ref(handle) => match self.get(handle)? {
                HeapObject::String(text) => Some(text),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn is_wide(&self, value: Value) -> bool {
        match value {
            Value::Ref(handle) => self.get(handle).is_some_and(HeapObject::is_wide),
            _ => false,
        }
    }

    /// Human readable rendering, as printed by the console bridges.
    pub fn render(&self, value: Value) -> String {
        let handle = match value {
            Value::Ref(handle) => handle,
            other => return other.to_string(),
        };
        match self.get(handle) {
            Some(HeapObject::String(text)) => text.clone(),
            Some(HeapObject::Class(name)) => format!("class {}", name.replace('/', ".")),
            Some(HeapObject::Float(v)) => format!("{v:?}"),
            Some(HeapObject::Long(v)) => v.to_string(),
            Some(HeapObject::Double(v)) => format!("{v:?}"),
            Some(HeapObject::Instance { class, .. }) => format!("{}{handle}", class.replace('/', ".")),
            Some(HeapObject::IntArray { elements, .. }) => format!("{elements:?}"),
            Some(HeapObject::RefArray { component, elements }) => {
                format!("{component}[{}]{handle}", elements.len())
            }
            None => format!("<dangling {handle}>"),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
