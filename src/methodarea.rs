//! Method area: loading, caching and finalizing class definitions.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::classfile::{
    access, ClassBuilder, ClassDef, ClassParser, ClassRef, ParsedClass, VTableEntry,
    read_class_file,
};
use crate::errors::VmError;
use crate::heap::{default_for_descriptor, Monitor};
use crate::natives;

/// Where loaded classes live. Definitions are parsed and finalized once,
/// then shared; `load_class` is idempotent.
pub struct MethodArea {
    classpath: Vec<PathBuf>,
    classes: Mutex<HashMap<String, ClassRef>>,
}

impl MethodArea {
    pub fn new(classpath: Vec<PathBuf>) -> Self {
        Self {
            classpath,
            classes: Mutex::new(HashMap::new()),
        }
    }

    /// Look a class up by fully qualified name, loading it from the
    /// classpath on first use. A small set of core definitions is
    /// synthesized when the classpath does not provide them.
    pub fn load_class(&self, full_name: &str) -> Result<ClassRef, VmError> {
        if let Some(def) = self.classes.lock().get(full_name) {
            return Ok(def.clone());
        }
        for dir in &self.classpath {
            let path = dir.join(format!("{full_name}.class"));
            if path.is_file() {
                debug!("loading class {full_name} from {}", path.display());
                let bytes = read_class_file(&path)?;
                let parsed = ClassParser::parse(&bytes)
                    .map_err(|e| e.context(format!("failed to parse '{}'", path.display())))?;
                return self.define_class(parsed);
            }
        }
        match builtin_class(full_name) {
            Some(parsed) => self.define_class(parsed),
            None => Err(VmError::ClassNotFound(full_name.to_string())),
        }
    }

    /// Finalize a parsed class into a `ClassDef` and register it: resolve
    /// its full name, seed static fields at their descriptor defaults and
    /// precompute the v-table.
    pub fn define_class(&self, parsed: ParsedClass) -> Result<ClassRef, VmError> {
        let full_name = parsed.full_name()?;

        let mut static_fields = HashMap::new();
        for field in &parsed.fields {
            if !field.is_static() {
                continue;
            }
            let name = crate::classfile::pool_utf8(&parsed.const_pool, field.name_index)?;
            let descriptor =
                crate::classfile::pool_utf8(&parsed.const_pool, field.descriptor_index)?;
            static_fields.insert(name.to_string(), default_for_descriptor(descriptor));
        }

        let def: ClassRef = Arc::new(ClassDef {
            full_name: full_name.clone(),
            access_flags: parsed.access_flags,
            this_class: parsed.this_class,
            super_class: parsed.super_class,
            const_pool: parsed.const_pool,
            interfaces: parsed.interfaces,
            fields: parsed.fields,
            methods: parsed.methods.into_iter().map(Arc::new).collect(),
            vtable: RwLock::new(Vec::new()),
            static_fields: RwLock::new(static_fields),
            monitor: Monitor::new(),
        });

        let vtable = self.build_vtable(&def)?;
        *def.vtable.write() = vtable;

        self.classes.lock().insert(full_name, def.clone());
        Ok(def)
    }

    /// Declared superclass of `def`, or `None` where the hierarchy walk
    /// stops: at the index-0 sentinel, or at `java/lang/Exception`, which
    /// has no loadable definition here.
    pub fn superclass(&self, def: &ClassDef) -> Result<Option<ClassRef>, VmError> {
        let Some(name) = def.super_name()? else {
            return Ok(None);
        };
        if name == "java/lang/Exception" {
            return Ok(None);
        }
        let name = name.to_string();
        self.load_class(&name)
            .map(Some)
            .map_err(|e| e.context(format!("failed to load superclass '{name}'")))
    }

    /// The v-table starts as a copy of the superclass's table; own methods
    /// then override matching entries or append.
    fn build_vtable(&self, def: &ClassRef) -> Result<Vec<VTableEntry>, VmError> {
        let mut table = match self.superclass(def)? {
            Some(parent) => parent.vtable.read().clone(),
            None => Vec::new(),
        };
        for method in &def.methods {
            if method.is_static() || method.is_private() {
                continue;
            }
            let name = def.utf8(method.name_index)?;
            if name == "<init>" || name == "<clinit>" {
                continue;
            }
            let descriptor = def.utf8(method.descriptor_index)?;
            match table
                .iter_mut()
                .find(|entry| entry.name == name && entry.descriptor == descriptor)
            {
                Some(entry) => {
                    entry.method = method.clone();
                    entry.class = def.clone();
                }
                None => table.push(VTableEntry {
                    name: name.to_string(),
                    descriptor: descriptor.to_string(),
                    method: method.clone(),
                    class: def.clone(),
                }),
            }
        }
        Ok(table)
    }
}

/// Core definitions synthesized in place of a bundled runtime library.
fn builtin_class(full_name: &str) -> Option<ParsedClass> {
    match full_name {
        "java/lang/Object" | "java/lang/Class" => Some(ClassBuilder::new(full_name).build()),
        "java/lang/String" => {
            let mut builder = ClassBuilder::new(full_name);
            builder.field(access::PRIVATE | access::FINAL, "value", "[C");
            Some(builder.build())
        }
        natives::PRINTER_CLASS => {
            let mut builder = ClassBuilder::new(full_name);
            for &(name, descriptor, _) in natives::PRINTER_METHODS {
                builder.native_method(access::PUBLIC | access::STATIC, name, descriptor);
            }
            Some(builder.build())
        }
        _ => None,
    }
}
