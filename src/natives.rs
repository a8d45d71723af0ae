//! Registry of native methods callable from bytecode.
use std::collections::HashMap;

use crate::classfile::ClassRef;
use crate::heap::Value;
use crate::vm::Vm;

/// Class carrying the built-in print family.
pub const PRINTER_CLASS: &str = "lungo/io/Printer";

/// `(name, descriptor, declared argument count)` of every built-in printer
/// native. The method area declares these on the printer class so linkage
/// finds them; the registry binds their implementations.
pub const PRINTER_METHODS: &[(&str, &str, usize)] = &[
    ("print", "(I)V", 1),
    ("print", "(C)V", 1),
    ("print", "(Ljava/lang/String;)V", 1),
    ("println", "()V", 0),
    ("println", "(I)V", 1),
    ("println", "(C)V", 1),
    ("println", "(Ljava/lang/String;)V", 1),
];

/// Positional arguments handed to a native function: the VM handle first,
/// the receiver (or owning class, for static natives) second, then the
/// declared arguments in source order.
pub enum NativeOperand<'vm> {
    Vm(&'vm Vm),
    Class(ClassRef),
    Value(Value),
}

pub type NativeFn = fn(&[NativeOperand]) -> Option<Value>;

struct NativeEntry {
    func: NativeFn,
    arg_count: usize,
}

/// Lookup table from `(class, name, descriptor)` to a bound function and
/// its declared argument count.
pub struct NativeRegistry {
    methods: HashMap<String, NativeEntry>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// A registry with the print family pre-registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for &(name, descriptor, arg_count) in PRINTER_METHODS {
            let func: NativeFn = match (name, descriptor) {
                ("print", "(C)V") => native_print_char,
                ("println", "(C)V") => native_println_char,
                ("print", _) => native_print,
                (_, _) => native_println,
            };
            registry.register(PRINTER_CLASS, name, descriptor, arg_count, func);
        }
        registry
    }

    pub fn register(
        &mut self,
        class: &str,
        name: &str,
        descriptor: &str,
        arg_count: usize,
        func: NativeFn,
    ) {
        self.methods
            .insert(key(class, name, descriptor), NativeEntry { func, arg_count });
    }

    pub fn find(&self, class: &str, name: &str, descriptor: &str) -> Option<(NativeFn, usize)> {
        self.methods
            .get(&key(class, name, descriptor))
            .map(|entry| (entry.func, entry.arg_count))
    }
}

impl Default for NativeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn key(class: &str, name: &str, descriptor: &str) -> String {
    format!("{class}.{name}{descriptor}")
}

/// Printable text of a value: ints as numbers, strings as their text,
/// null as `null`.
fn format_value(value: &Value) -> String {
    match value {
        Value::Int(v) => v.to_string(),
        Value::Null => "null".to_string(),
        Value::Ref(reference) => reference
            .as_string_text()
            .unwrap_or_else(|| format!("{reference:?}")),
    }
}

fn native_print(args: &[NativeOperand]) -> Option<Value> {
    for arg in args.iter().skip(2) {
        if let NativeOperand::Value(value) = arg {
            print!("{}", format_value(value));
        }
    }
    None
}

fn native_println(args: &[NativeOperand]) -> Option<Value> {
    native_print(args);
    println!();
    None
}

fn native_print_char(args: &[NativeOperand]) -> Option<Value> {
    for arg in args.iter().skip(2) {
        if let NativeOperand::Value(Value::Int(point)) = arg {
            if let Some(c) = char::from_u32(*point as u32) {
                print!("{c}");
            }
        }
    }
    None
}

fn native_println_char(args: &[NativeOperand]) -> Option<Value> {
    native_print_char(args);
    println!();
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native_forty_two(_args: &[NativeOperand]) -> Option<Value> {
        Some(Value::Int(42))
    }

    #[test]
    fn registered_methods_are_found() {
        let mut registry = NativeRegistry::new();
        registry.register("Widget", "spin", "(I)I", 1, native_forty_two);
        let (func, arg_count) = registry.find("Widget", "spin", "(I)I").unwrap();
        assert_eq!(arg_count, 1);
        assert_eq!(func(&[]), Some(Value::Int(42)));
    }

    #[test]
    fn lookups_match_on_the_full_signature() {
        let mut registry = NativeRegistry::new();
        registry.register("Widget", "spin", "(I)I", 1, native_forty_two);
        assert!(registry.find("Widget", "spin", "(C)I").is_none());
        assert!(registry.find("Widget", "whirl", "(I)I").is_none());
        assert!(registry.find("Gadget", "spin", "(I)I").is_none());
    }

    #[test]
    fn builtins_cover_the_print_family() {
        let registry = NativeRegistry::with_builtins();
        for &(name, descriptor, arg_count) in PRINTER_METHODS {
            let (_, found) = registry
                .find(PRINTER_CLASS, name, descriptor)
                .unwrap_or_else(|| panic!("missing builtin {name}{descriptor}"));
            assert_eq!(found, arg_count);
        }
    }

    #[test]
    fn values_format_like_java_prints_them() {
        assert_eq!(format_value(&Value::Int(-7)), "-7");
        assert_eq!(format_value(&Value::Null), "null");
    }
}
