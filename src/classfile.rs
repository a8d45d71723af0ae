//! Class file parsing and the runtime class model.
use std::collections::HashMap;
use std::fmt;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt};
use num_enum::TryFromPrimitive;
use parking_lot::RwLock;

use crate::errors::VmError;
use crate::heap::{Monitor, Value};

/// Values of magic bytes of a JVM class file.
pub const CLASS_FILE_MAGIC: u32 = 0xCAFE_BABE;

/// Method and field access flags.
pub mod access {
    pub const PUBLIC: u16 = 0x0001;
    pub const PRIVATE: u16 = 0x0002;
    pub const STATIC: u16 = 0x0008;
    pub const FINAL: u16 = 0x0010;
    pub const SYNCHRONIZED: u16 = 0x0020;
    pub const NATIVE: u16 = 0x0100;
    pub const INTERFACE: u16 = 0x0200;
    pub const ABSTRACT: u16 = 0x0400;
}

/// Constant pool entries. Index 0 is a reserved sentinel: entry numbering
/// starts at 1, and 0 in a `super_class` or `catch_type` slot means
/// "none" / "catch-any".
#[derive(Debug, Clone)]
pub enum Const {
    Class {
        name_index: u16,
    },
    FieldRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    MethodRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    InterfaceMethodRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    String {
        string_index: u16,
    },
    Integer {
        bytes: u32,
    },
    Float {
        bytes: u32,
    },
    Long {
        hi_bytes: u32,
        lo_bytes: u32,
    },
    Double {
        hi_bytes: u32,
        lo_bytes: u32,
    },
    NameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    Utf8 {
        bytes: String,
    },
    MethodHandle {
        reference_kind: u8,
        reference_index: u16,
    },
    MethodType {
        descriptor_index: u16,
    },
    InvokeDynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    // Fills index 0 and the shadow slot after a Long or Double.
    Reserved,
}

impl Const {
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Class { .. } => "Class",
            Self::FieldRef { .. } => "FieldRef",
            Self::MethodRef { .. } => "MethodRef",
            Self::InterfaceMethodRef { .. } => "InterfaceMethodRef",
            Self::String { .. } => "String",
            Self::Integer { .. } => "Integer",
            Self::Float { .. } => "Float",
            Self::Long { .. } => "Long",
            Self::Double { .. } => "Double",
            Self::NameAndType { .. } => "NameAndType",
            Self::Utf8 { .. } => "Utf8",
            Self::MethodHandle { .. } => "MethodHandle",
            Self::MethodType { .. } => "MethodType",
            Self::InvokeDynamic { .. } => "InvokeDynamic",
            Self::Reserved => "Reserved",
        }
    }
}

/// Tags discriminating constant pool entries on disk.
#[repr(u8)]
#[derive(Debug, Copy, Clone, TryFromPrimitive)]
enum ConstantTag {
    Utf8 = 1,
    Integer = 3,
    Float = 4,
    Long = 5,
    Double = 6,
    Class = 7,
    String = 8,
    FieldRef = 9,
    MethodRef = 10,
    InterfaceMethodRef = 11,
    NameAndType = 12,
    MethodHandle = 15,
    MethodType = 16,
    InvokeDynamic = 18,
}

/// One row of a method's exception table: a pc range guarded by a handler.
/// `catch_type` indexes a `Class` entry, or 0 for catch-any.
#[derive(Debug, Clone)]
pub struct ExceptionEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

/// The body of a bytecode method.
#[derive(Debug, Clone)]
pub struct CodeAttr {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionEntry>,
}

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
}

impl FieldInfo {
    pub const fn is_static(&self) -> bool {
        self.access_flags & access::STATIC != 0
    }
}

#[derive(Debug)]
pub struct MethodInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub code: Option<CodeAttr>,
}

impl MethodInfo {
    pub const fn is_static(&self) -> bool {
        self.access_flags & access::STATIC != 0
    }

    pub const fn is_native(&self) -> bool {
        self.access_flags & access::NATIVE != 0
    }

    pub const fn is_synchronized(&self) -> bool {
        self.access_flags & access::SYNCHRONIZED != 0
    }

    pub const fn is_private(&self) -> bool {
        self.access_flags & access::PRIVATE != 0
    }
}

/// The raw result of parsing a class file, before the method area
/// finalizes it into a `ClassDef`.
#[derive(Debug)]
pub struct ParsedClass {
    pub minor_version: u16,
    pub major_version: u16,
    pub const_pool: Vec<Const>,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
}

impl ParsedClass {
    pub fn full_name(&self) -> Result<String, VmError> {
        pool_class_name(&self.const_pool, self.this_class).map(str::to_string)
    }
}

/// A loaded class: parsed constant pool and members plus the runtime state
/// the interpreter needs (precomputed v-table, static fields, class
/// monitor).
pub struct ClassDef {
    pub full_name: String,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub const_pool: Vec<Const>,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<Arc<MethodInfo>>,
    pub vtable: RwLock<Vec<VTableEntry>>,
    pub static_fields: RwLock<HashMap<String, Value>>,
    pub monitor: Monitor,
}

pub type ClassRef = Arc<ClassDef>;

/// One virtually dispatched method visible on instances of a class,
/// together with the class that physically declares it.
#[derive(Clone)]
pub struct VTableEntry {
    pub name: String,
    pub descriptor: String,
    pub method: Arc<MethodInfo>,
    pub class: ClassRef,
}

impl fmt::Debug for ClassDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDef")
            .field("full_name", &self.full_name)
            .field("methods", &self.methods.len())
            .field("fields", &self.fields.len())
            .finish()
    }
}

impl ClassDef {
    pub fn entry(&self, index: u16) -> Result<&Const, VmError> {
        pool_entry(&self.const_pool, index)
    }

    pub fn utf8(&self, index: u16) -> Result<&str, VmError> {
        pool_utf8(&self.const_pool, index)
    }

    /// Fully qualified class name behind a `Class` entry.
    pub fn class_name(&self, index: u16) -> Result<&str, VmError> {
        pool_class_name(&self.const_pool, index)
    }

    /// `(name, descriptor)` behind a `NameAndType` entry.
    pub fn name_and_type(&self, index: u16) -> Result<(&str, &str), VmError> {
        match pool_entry(&self.const_pool, index)? {
            Const::NameAndType {
                name_index,
                descriptor_index,
            } => Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?)),
            _ => Err(VmError::BadConstant(index, "NameAndType")),
        }
    }

    /// `(class name, method name, descriptor)` behind a `MethodRef` or
    /// `InterfaceMethodRef` entry.
    pub fn method_ref(&self, index: u16) -> Result<(&str, &str, &str), VmError> {
        match pool_entry(&self.const_pool, index)? {
            Const::MethodRef {
                class_index,
                name_and_type_index,
            }
            | Const::InterfaceMethodRef {
                class_index,
                name_and_type_index,
            } => {
                let class = self.class_name(*class_index)?;
                let (name, descriptor) = self.name_and_type(*name_and_type_index)?;
                Ok((class, name, descriptor))
            }
            _ => Err(VmError::BadConstant(index, "MethodRef")),
        }
    }

    /// `(class name, field name, descriptor)` behind a `FieldRef` entry.
    pub fn field_ref(&self, index: u16) -> Result<(&str, &str, &str), VmError> {
        match pool_entry(&self.const_pool, index)? {
            Const::FieldRef {
                class_index,
                name_and_type_index,
            } => {
                let class = self.class_name(*class_index)?;
                let (name, descriptor) = self.name_and_type(*name_and_type_index)?;
                Ok((class, name, descriptor))
            }
            _ => Err(VmError::BadConstant(index, "FieldRef")),
        }
    }

    pub fn integer(&self, index: u16) -> Result<i32, VmError> {
        match pool_entry(&self.const_pool, index)? {
            Const::Integer { bytes } => Ok(*bytes as i32),
            _ => Err(VmError::BadConstant(index, "Integer")),
        }
    }

    /// Name of the declared superclass, or `None` when `super_class` is the
    /// index-0 sentinel.
    pub fn super_name(&self) -> Result<Option<&str>, VmError> {
        if self.super_class == 0 {
            return Ok(None);
        }
        self.class_name(self.super_class).map(Some)
    }

    pub fn method_name(&self, method: &MethodInfo) -> Result<&str, VmError> {
        self.utf8(method.name_index)
    }
}

pub(crate) fn pool_entry(pool: &[Const], index: u16) -> Result<&Const, VmError> {
    match pool.get(index as usize) {
        Some(Const::Reserved) | None => Err(VmError::BadConstant(index, "valid entry")),
        Some(entry) => Ok(entry),
    }
}

pub(crate) fn pool_utf8(pool: &[Const], index: u16) -> Result<&str, VmError> {
    match pool_entry(pool, index)? {
        Const::Utf8 { bytes } => Ok(bytes),
        _ => Err(VmError::BadConstant(index, "Utf8")),
    }
}

pub(crate) fn pool_class_name(pool: &[Const], index: u16) -> Result<&str, VmError> {
    match pool_entry(pool, index)? {
        Const::Class { name_index } => pool_utf8(pool, *name_index),
        _ => Err(VmError::BadConstant(index, "Class")),
    }
}

/// `ClassParser` namespaces the functions that decode a class file byte
/// stream into a `ParsedClass`.
#[derive(Debug)]
pub struct ClassParser;

impl ClassParser {
    pub fn parse(class_file_bytes: &[u8]) -> Result<ParsedClass, VmError> {
        let mut buffer = Cursor::new(class_file_bytes);
        let magic = buffer.read_u32::<BigEndian>()?;
        if magic != CLASS_FILE_MAGIC {
            return Err(VmError::ClassFormat(format!(
                "bad magic 0x{magic:08x}"
            )));
        }
        let minor_version = buffer.read_u16::<BigEndian>()?;
        let major_version = buffer.read_u16::<BigEndian>()?;

        let const_pool = parse_constant_pool(&mut buffer)?;

        let access_flags = buffer.read_u16::<BigEndian>()?;
        let this_class = buffer.read_u16::<BigEndian>()?;
        let super_class = buffer.read_u16::<BigEndian>()?;

        let interfaces_count = buffer.read_u16::<BigEndian>()?;
        let mut interfaces = Vec::with_capacity(interfaces_count as usize);
        for _ in 0..interfaces_count {
            interfaces.push(buffer.read_u16::<BigEndian>()?);
        }

        let fields = parse_fields(&mut buffer)?;
        let methods = parse_methods(&mut buffer, &const_pool)?;
        // Class level attributes (SourceFile and friends) are not consumed.
        skip_attributes(&mut buffer)?;

        Ok(ParsedClass {
            minor_version,
            major_version,
            const_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
        })
    }
}

fn parse_constant_pool(buffer: &mut Cursor<&[u8]>) -> Result<Vec<Const>, VmError> {
    let count = buffer.read_u16::<BigEndian>()? as usize;
    // The first entry in the pool is at index 1.
    let mut pool = vec![Const::Reserved; count.max(1)];
    let mut index = 1;
    while index < count {
        let tag = buffer.read_u8()?;
        let tag = ConstantTag::try_from(tag)
            .map_err(|_| VmError::ClassFormat(format!("unsupported constant tag {tag}")))?;
        match tag {
            ConstantTag::Utf8 => {
                let length = buffer.read_u16::<BigEndian>()?;
                let mut buf = vec![0u8; length as usize];
                buffer.read_exact(&mut buf)?;
                let bytes = String::from_utf8(buf)
                    .map_err(|e| VmError::ClassFormat(format!("bad utf8 constant: {e}")))?;
                pool[index] = Const::Utf8 { bytes };
            }
            ConstantTag::Integer => {
                pool[index] = Const::Integer {
                    bytes: buffer.read_u32::<BigEndian>()?,
                };
            }
            ConstantTag::Float => {
                pool[index] = Const::Float {
                    bytes: buffer.read_u32::<BigEndian>()?,
                };
            }
            ConstantTag::Long => {
                pool[index] = Const::Long {
                    hi_bytes: buffer.read_u32::<BigEndian>()?,
                    lo_bytes: buffer.read_u32::<BigEndian>()?,
                };
                // Longs and doubles take two pool slots.
                index += 1;
            }
            ConstantTag::Double => {
                pool[index] = Const::Double {
                    hi_bytes: buffer.read_u32::<BigEndian>()?,
                    lo_bytes: buffer.read_u32::<BigEndian>()?,
                };
                index += 1;
            }
            ConstantTag::Class => {
                pool[index] = Const::Class {
                    name_index: buffer.read_u16::<BigEndian>()?,
                };
            }
            ConstantTag::String => {
                pool[index] = Const::String {
                    string_index: buffer.read_u16::<BigEndian>()?,
                };
            }
            ConstantTag::FieldRef => {
                pool[index] = Const::FieldRef {
                    class_index: buffer.read_u16::<BigEndian>()?,
                    name_and_type_index: buffer.read_u16::<BigEndian>()?,
                };
            }
            ConstantTag::MethodRef => {
                pool[index] = Const::MethodRef {
                    class_index: buffer.read_u16::<BigEndian>()?,
                    name_and_type_index: buffer.read_u16::<BigEndian>()?,
                };
            }
            ConstantTag::InterfaceMethodRef => {
                pool[index] = Const::InterfaceMethodRef {
                    class_index: buffer.read_u16::<BigEndian>()?,
                    name_and_type_index: buffer.read_u16::<BigEndian>()?,
                };
            }
            ConstantTag::NameAndType => {
                pool[index] = Const::NameAndType {
                    name_index: buffer.read_u16::<BigEndian>()?,
                    descriptor_index: buffer.read_u16::<BigEndian>()?,
                };
            }
            ConstantTag::MethodHandle => {
                pool[index] = Const::MethodHandle {
                    reference_kind: buffer.read_u8()?,
                    reference_index: buffer.read_u16::<BigEndian>()?,
                };
            }
            ConstantTag::MethodType => {
                pool[index] = Const::MethodType {
                    descriptor_index: buffer.read_u16::<BigEndian>()?,
                };
            }
            ConstantTag::InvokeDynamic => {
                pool[index] = Const::InvokeDynamic {
                    bootstrap_method_attr_index: buffer.read_u16::<BigEndian>()?,
                    name_and_type_index: buffer.read_u16::<BigEndian>()?,
                };
            }
        }
        index += 1;
    }
    Ok(pool)
}

fn parse_fields(buffer: &mut Cursor<&[u8]>) -> Result<Vec<FieldInfo>, VmError> {
    let count = buffer.read_u16::<BigEndian>()?;
    let mut fields = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let access_flags = buffer.read_u16::<BigEndian>()?;
        let name_index = buffer.read_u16::<BigEndian>()?;
        let descriptor_index = buffer.read_u16::<BigEndian>()?;
        skip_attributes(buffer)?;
        fields.push(FieldInfo {
            access_flags,
            name_index,
            descriptor_index,
        });
    }
    Ok(fields)
}

fn parse_methods(
    buffer: &mut Cursor<&[u8]>,
    pool: &[Const],
) -> Result<Vec<MethodInfo>, VmError> {
    let count = buffer.read_u16::<BigEndian>()?;
    let mut methods = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let access_flags = buffer.read_u16::<BigEndian>()?;
        let name_index = buffer.read_u16::<BigEndian>()?;
        let descriptor_index = buffer.read_u16::<BigEndian>()?;
        let code = parse_method_attributes(buffer, pool)?;
        methods.push(MethodInfo {
            access_flags,
            name_index,
            descriptor_index,
            code,
        });
    }
    Ok(methods)
}

/// Walk a method's attribute list, decoding the `Code` attribute and
/// skipping everything else by length.
fn parse_method_attributes(
    buffer: &mut Cursor<&[u8]>,
    pool: &[Const],
) -> Result<Option<CodeAttr>, VmError> {
    let count = buffer.read_u16::<BigEndian>()?;
    let mut code = None;
    for _ in 0..count {
        let name_index = buffer.read_u16::<BigEndian>()?;
        let length = buffer.read_u32::<BigEndian>()?;
        if pool_utf8(pool, name_index)? == "Code" {
            code = Some(parse_code_attribute(buffer)?);
        } else {
            buffer.seek(SeekFrom::Current(i64::from(length)))?;
        }
    }
    Ok(code)
}

fn parse_code_attribute(buffer: &mut Cursor<&[u8]>) -> Result<CodeAttr, VmError> {
    let max_stack = buffer.read_u16::<BigEndian>()?;
    let max_locals = buffer.read_u16::<BigEndian>()?;
    let code_length = buffer.read_u32::<BigEndian>()?;
    let mut code = vec![0u8; code_length as usize];
    buffer.read_exact(&mut code)?;
    let exception_table_length = buffer.read_u16::<BigEndian>()?;
    let mut exception_table = Vec::with_capacity(exception_table_length as usize);
    for _ in 0..exception_table_length {
        exception_table.push(ExceptionEntry {
            start_pc: buffer.read_u16::<BigEndian>()?,
            end_pc: buffer.read_u16::<BigEndian>()?,
            handler_pc: buffer.read_u16::<BigEndian>()?,
            catch_type: buffer.read_u16::<BigEndian>()?,
        });
    }
    // Nested attributes (LineNumberTable, StackMapTable, ...) are not
    // consumed.
    skip_attributes(buffer)?;
    Ok(CodeAttr {
        max_stack,
        max_locals,
        code,
        exception_table,
    })
}

fn skip_attributes(buffer: &mut Cursor<&[u8]>) -> Result<(), VmError> {
    let count = buffer.read_u16::<BigEndian>()?;
    for _ in 0..count {
        let _name_index = buffer.read_u16::<BigEndian>()?;
        let length = buffer.read_u32::<BigEndian>()?;
        buffer.seek(SeekFrom::Current(i64::from(length)))?;
    }
    Ok(())
}

/// Read a class file from disk into a buffer.
pub fn read_class_file(path: &Path) -> Result<Vec<u8>, VmError> {
    Ok(std::fs::read(path)?)
}

/// Programmatic construction of a `ParsedClass`, as an alternative to
/// parsing a byte stream. The method area uses it for the built-in core
/// definitions; embedding hosts and tests use it to define classes
/// without a compiler in the loop.
pub struct ClassBuilder {
    access_flags: u16,
    this_class: u16,
    super_class: u16,
    pool: Vec<Const>,
    fields: Vec<FieldInfo>,
    methods: Vec<MethodInfo>,
}

impl ClassBuilder {
    pub fn new(name: &str) -> Self {
        let mut builder = Self {
            access_flags: access::PUBLIC,
            this_class: 0,
            super_class: 0,
            pool: vec![Const::Reserved],
            fields: Vec::new(),
            methods: Vec::new(),
        };
        builder.this_class = builder.class_const(name);
        builder
    }

    pub fn with_super(mut self, name: &str) -> Self {
        self.super_class = self.class_const(name);
        self
    }

    fn push(&mut self, entry: Const) -> u16 {
        self.pool.push(entry);
        (self.pool.len() - 1) as u16
    }

    pub fn utf8(&mut self, text: &str) -> u16 {
        self.push(Const::Utf8 {
            bytes: text.to_string(),
        })
    }

    pub fn class_const(&mut self, name: &str) -> u16 {
        let name_index = self.utf8(name);
        self.push(Const::Class { name_index })
    }

    pub fn string_const(&mut self, text: &str) -> u16 {
        let string_index = self.utf8(text);
        self.push(Const::String { string_index })
    }

    pub fn int_const(&mut self, value: i32) -> u16 {
        self.push(Const::Integer {
            bytes: value as u32,
        })
    }

    pub fn name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        self.push(Const::NameAndType {
            name_index,
            descriptor_index,
        })
    }

    pub fn method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.class_const(class);
        let name_and_type_index = self.name_and_type(name, descriptor);
        self.push(Const::MethodRef {
            class_index,
            name_and_type_index,
        })
    }

    pub fn interface_method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.class_const(class);
        let name_and_type_index = self.name_and_type(name, descriptor);
        self.push(Const::InterfaceMethodRef {
            class_index,
            name_and_type_index,
        })
    }

    pub fn field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.class_const(class);
        let name_and_type_index = self.name_and_type(name, descriptor);
        self.push(Const::FieldRef {
            class_index,
            name_and_type_index,
        })
    }

    pub fn field(&mut self, access_flags: u16, name: &str, descriptor: &str) {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        self.fields.push(FieldInfo {
            access_flags,
            name_index,
            descriptor_index,
        });
    }

    pub fn method(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
    ) {
        self.method_with_table(
            access_flags,
            name,
            descriptor,
            max_stack,
            max_locals,
            code,
            Vec::new(),
        );
    }

    pub fn method_with_table(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
        exception_table: Vec<ExceptionEntry>,
    ) {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        self.methods.push(MethodInfo {
            access_flags,
            name_index,
            descriptor_index,
            code: Some(CodeAttr {
                max_stack,
                max_locals,
                code,
                exception_table,
            }),
        });
    }

    pub fn native_method(&mut self, access_flags: u16, name: &str, descriptor: &str) {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        self.methods.push(MethodInfo {
            access_flags: access_flags | access::NATIVE,
            name_index,
            descriptor_index,
            code: None,
        });
    }

    pub fn build(self) -> ParsedClass {
        ParsedClass {
            minor_version: 0,
            major_version: 61,
            const_pool: self.pool,
            access_flags: self.access_flags,
            this_class: self.this_class,
            super_class: self.super_class,
            interfaces: Vec::new(),
            fields: self.fields,
            methods: self.methods,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testkit::sample_class_bytes;
    use super::*;

    #[test]
    fn parses_the_sample_class() {
        let parsed = ClassParser::parse(&sample_class_bytes()).unwrap();
        assert_eq!(parsed.full_name().unwrap(), "Sample");
        assert_eq!(
            pool_class_name(&parsed.const_pool, parsed.super_class).unwrap(),
            "java/lang/Object"
        );
        assert_eq!(parsed.fields.len(), 1);
        assert!(parsed.fields[0].is_static());
        assert_eq!(parsed.methods.len(), 1);

        let method = &parsed.methods[0];
        assert_eq!(pool_utf8(&parsed.const_pool, method.name_index).unwrap(), "inc");
        let code = method.code.as_ref().unwrap();
        assert_eq!(code.max_stack, 1);
        assert_eq!(code.code, vec![0x04, 0xac]);
        assert_eq!(code.exception_table.len(), 1);
        let entry = &code.exception_table[0];
        assert_eq!(entry.handler_pc, 2);
        assert_eq!(
            pool_class_name(&parsed.const_pool, entry.catch_type).unwrap(),
            "E"
        );
    }

    #[test]
    fn rejects_a_bad_magic_header() {
        let mut bytes = sample_class_bytes();
        bytes[0] = 0xde;
        assert!(matches!(
            ClassParser::parse(&bytes),
            Err(VmError::ClassFormat(_))
        ));
    }

    #[test]
    fn pool_accessors_check_entry_kinds() {
        let parsed = ClassParser::parse(&sample_class_bytes()).unwrap();
        // Entry 13 is an Integer, entry 1 a Utf8.
        match pool_entry(&parsed.const_pool, 13).unwrap() {
            Const::Integer { bytes } => assert_eq!(*bytes, 42),
            other => panic!("expected an integer, got {}", other.kind_name()),
        }
        assert!(matches!(
            pool_utf8(&parsed.const_pool, 13),
            Err(VmError::BadConstant(13, "Utf8"))
        ));
        assert!(matches!(
            pool_entry(&parsed.const_pool, 0),
            Err(VmError::BadConstant(0, _))
        ));
    }

    #[test]
    fn truncated_input_is_an_error() {
        let bytes = sample_class_bytes();
        assert!(ClassParser::parse(&bytes[..bytes.len() / 2]).is_err());
    }
}
