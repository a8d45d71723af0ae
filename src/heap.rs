//! Heap object model: tagged values, shared references, monitors and the
//! allocation helpers consumed by the interpreter.
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::classfile::ClassRef;
use crate::errors::VmError;
use crate::methodarea::MethodArea;

/// Array element kind for reference arrays. Primitive kinds follow the
/// `newarray` encoding.
pub const ELEM_REF: u8 = 0;
pub const ELEM_BOOLEAN: u8 = 4;
pub const ELEM_CHAR: u8 = 5;
pub const ELEM_FLOAT: u8 = 6;
pub const ELEM_DOUBLE: u8 = 7;
pub const ELEM_BYTE: u8 = 8;
pub const ELEM_SHORT: u8 = 9;
pub const ELEM_INT: u8 = 10;
pub const ELEM_LONG: u8 = 11;

/// Values that can live on an operand stack or in a local variable slot.
#[derive(Debug, Clone, Default)]
pub enum Value {
    Int(i32),
    Ref(Reference),
    #[default]
    Null,
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Ref(a), Self::Ref(b)) => Reference::ptr_eq(a, b),
            (Self::Null, Self::Null) => true,
            _ => false,
        }
    }
}

/// Default value for a field of the given descriptor: zero for primitives,
/// null for reference and array types.
pub fn default_for_descriptor(descriptor: &str) -> Value {
    match descriptor.as_bytes().first() {
        Some(b'L') | Some(b'[') => Value::Null,
        _ => Value::Int(0),
    }
}

/// Mutex backing `synchronized` methods and the explicit monitor opcodes.
/// Non-reentrant; enter and exit may be split across instructions, so the
/// lock state is tracked explicitly instead of through a guard.
pub struct Monitor {
    held: Mutex<bool>,
    cond: Condvar,
}

impl Monitor {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Block until the monitor is free, then take it.
    pub fn enter(&self) {
        let mut held = self.held.lock();
        while *held {
            self.cond.wait(&mut held);
        }
        *held = true;
    }

    /// Take the monitor only if it is free.
    pub fn try_enter(&self) -> bool {
        let mut held = self.held.lock();
        if *held {
            false
        } else {
            *held = true;
            true
        }
    }

    /// Release the monitor and wake one waiter.
    pub fn exit(&self) {
        let mut held = self.held.lock();
        *held = false;
        self.cond.notify_one();
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Monitor {{ held: {} }}", *self.held.lock())
    }
}

/// A shared handle to a heap allocation. Cloning is cheap and identity
/// comparison (`if_acmpeq`) is pointer equality.
#[derive(Clone)]
pub struct Reference(Arc<ReferenceInner>);

pub struct ReferenceInner {
    monitor: Monitor,
    kind: RefKind,
}

/// What a reference points at: a plain object, an array, or a class.
pub enum RefKind {
    Object(HeapObject),
    Array(ArrayObject),
    Class(ClassRef),
}

/// An instance allocation: the class that produced it plus its fields,
/// keyed by simple name.
pub struct HeapObject {
    pub class: ClassRef,
    fields: RwLock<HashMap<String, Value>>,
}

impl HeapObject {
    pub fn field(&self, name: &str) -> Result<Value, VmError> {
        self.fields
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| VmError::UnknownField(format!("{}.{}", self.class.full_name, name)))
    }

    /// Overwrite a declared field. Writing an undeclared name is a linkage
    /// error, not an insert.
    pub fn put_field(&self, name: &str, value: Value) -> Result<(), VmError> {
        let mut fields = self.fields.write();
        match fields.get_mut(name) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(VmError::UnknownField(format!(
                "{}.{}",
                self.class.full_name, name
            ))),
        }
    }
}

pub struct ArrayObject {
    pub element_kind: u8,
    data: RwLock<Vec<Value>>,
}

impl ArrayObject {
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    pub fn get(&self, index: i32) -> Result<Value, VmError> {
        let data = self.data.read();
        usize::try_from(index)
            .ok()
            .and_then(|ix| data.get(ix).cloned())
            .ok_or(VmError::IndexOutOfBounds(index, data.len()))
    }

    pub fn set(&self, index: i32, value: Value) -> Result<(), VmError> {
        let mut data = self.data.write();
        let len = data.len();
        let slot = usize::try_from(index)
            .ok()
            .and_then(|ix| data.get_mut(ix))
            .ok_or(VmError::IndexOutOfBounds(index, len))?;
        *slot = value;
        Ok(())
    }
}

impl Reference {
    pub fn new(kind: RefKind) -> Self {
        Self(Arc::new(ReferenceInner {
            monitor: Monitor::new(),
            kind,
        }))
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    pub fn monitor(&self) -> &Monitor {
        &self.0.monitor
    }

    pub fn kind(&self) -> &RefKind {
        &self.0.kind
    }

    pub fn as_object(&self) -> Result<&HeapObject, VmError> {
        match &self.0.kind {
            RefKind::Object(object) => Ok(object),
            _ => Err(VmError::ExpectedObject),
        }
    }

    pub fn as_array(&self) -> Result<&ArrayObject, VmError> {
        match &self.0.kind {
            RefKind::Array(array) => Ok(array),
            _ => Err(VmError::ExpectedArray),
        }
    }

    /// Fully qualified name of the class that produced this object.
    pub fn object_class_name(&self) -> Result<String, VmError> {
        Ok(self.as_object()?.class.full_name.clone())
    }

    /// The text of a `java/lang/String` instance, decoded from its `value`
    /// char array. `None` for anything else.
    pub fn as_string_text(&self) -> Option<String> {
        let object = self.as_object().ok()?;
        if object.class.full_name != "java/lang/String" {
            return None;
        }
        let Ok(Value::Ref(chars)) = object.field("value") else {
            return None;
        };
        let array = chars.as_array().ok()?;
        let mut text = String::with_capacity(array.len());
        for ix in 0..array.len() {
            match array.get(ix as i32) {
                Ok(Value::Int(point)) => text.push(char::from_u32(point as u32)?),
                _ => return None,
            }
        }
        Some(text)
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.kind {
            RefKind::Object(object) => write!(f, "Object({})", object.class.full_name),
            RefKind::Array(array) => {
                write!(f, "Array(kind={}, len={})", array.element_kind, array.len())
            }
            RefKind::Class(class) => write!(f, "Class({})", class.full_name),
        }
    }
}

/// Allocate an instance of `class`, with every field declared by the class
/// and its superclasses present at its default value.
pub fn new_object(class: &ClassRef, area: &MethodArea) -> Result<Reference, VmError> {
    let mut fields = HashMap::new();
    let mut current = class.clone();
    loop {
        for field in &current.fields {
            if field.is_static() {
                continue;
            }
            let name = current.utf8(field.name_index)?;
            let descriptor = current.utf8(field.descriptor_index)?;
            fields
                .entry(name.to_string())
                .or_insert_with(|| default_for_descriptor(descriptor));
        }
        match area.superclass(&current)? {
            Some(parent) => current = parent,
            None => break,
        }
    }
    Ok(Reference::new(RefKind::Object(HeapObject {
        class: class.clone(),
        fields: RwLock::new(fields),
    })))
}

/// Allocate an array of `len` elements of the given kind, zero or null
/// filled.
pub fn new_array(len: usize, element_kind: u8) -> Reference {
    let default = if element_kind == ELEM_REF {
        Value::Null
    } else {
        Value::Int(0)
    };
    Reference::new(RefKind::Array(ArrayObject {
        element_kind,
        data: RwLock::new(vec![default; len]),
    }))
}

/// Allocate a reference array, null filled.
pub fn new_object_array(len: usize) -> Reference {
    new_array(len, ELEM_REF)
}

/// Allocate a `java/lang/String` whose `value` field holds the code points
/// of `text` as a char array.
pub fn new_string_object(text: &str, area: &MethodArea) -> Result<Reference, VmError> {
    let class = area.load_class("java/lang/String")?;
    let chars = new_array(text.chars().count(), ELEM_CHAR);
    {
        let array = chars.as_array()?;
        for (ix, point) in text.chars().enumerate() {
            array.set(ix as i32, Value::Int(point as i32))?;
        }
    }
    let mut fields = HashMap::new();
    fields.insert("value".to_string(), Value::Ref(chars));
    Ok(Reference::new(RefKind::Object(HeapObject {
        class,
        fields: RwLock::new(fields),
    })))
}
