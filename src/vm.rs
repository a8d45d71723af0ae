//! Top level virtual machine wiring.
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::errors::VmError;
use crate::heap::Value;
use crate::methodarea::MethodArea;
use crate::natives::NativeRegistry;
use crate::runtime::Engine;

/// A running virtual machine instance: the class registry, the native
/// bindings and the command line arguments exposed to the guest program.
pub struct Vm {
    pub method_area: MethodArea,
    pub natives: NativeRegistry,
    pub cmd_args: Vec<String>,
    debug_trace: Mutex<Vec<Value>>,
}

impl Vm {
    pub fn new(classpath: Vec<PathBuf>, cmd_args: Vec<String>) -> Self {
        Self {
            method_area: MethodArea::new(classpath),
            natives: NativeRegistry::with_builtins(),
            cmd_args,
            debug_trace: Mutex::new(Vec::new()),
        }
    }

    /// Load `main_class` and run its `main(String[])`. An exception that
    /// escapes `main` surfaces as an uncaught-exception error naming the
    /// exception's class.
    pub fn run(&self, main_class: &str) -> Result<(), VmError> {
        let def = self.method_area.load_class(main_class)?;
        match Engine::new(self).execute_main(&def) {
            Err(VmError::ExceptionThrown(exception)) => {
                let name = exception
                    .object_class_name()
                    .unwrap_or_else(|_| "<unknown>".to_string());
                Err(VmError::UncaughtException(name))
            }
            other => other,
        }
    }

    /// Record the declared arguments of a `print*` native invocation.
    pub(crate) fn record_debug_print(&self, values: impl IntoIterator<Item = Value>) {
        self.debug_trace.lock().extend(values);
    }

    /// Everything the guest printed through `print*` natives so far, in
    /// order.
    pub fn debug_trace(&self) -> Vec<Value> {
        self.debug_trace.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::{access, ClassBuilder};
    use crate::natives::PRINTER_CLASS;

    const MAIN_FLAGS: u16 = access::PUBLIC | access::STATIC;
    const MAIN_DESC: &str = "([Ljava/lang/String;)V";

    #[test]
    fn runs_main_and_records_prints() {
        let vm = Vm::new(Vec::new(), Vec::new());
        let mut builder = ClassBuilder::new("Main");
        let println = builder.method_ref(PRINTER_CLASS, "println", "(I)V");
        let [hi, lo] = println.to_be_bytes();
        builder.method(
            MAIN_FLAGS,
            "main",
            MAIN_DESC,
            1,
            1,
            vec![0x10, 9, 0xb8, hi, lo, 0xb1], // bipush 9; invokestatic; return
        );
        vm.method_area.define_class(builder.build()).unwrap();

        vm.run("Main").unwrap();
        assert_eq!(vm.debug_trace(), vec![Value::Int(9)]);
    }

    #[test]
    fn main_receives_the_command_line_as_a_string_array() {
        let args = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let vm = Vm::new(Vec::new(), args);
        let mut builder = ClassBuilder::new("Main");
        let println = builder.method_ref(PRINTER_CLASS, "println", "(I)V");
        let [hi, lo] = println.to_be_bytes();
        builder.method(
            MAIN_FLAGS,
            "main",
            MAIN_DESC,
            1,
            1,
            // aload_0; arraylength; invokestatic println(I)V; return
            vec![0x2a, 0xbe, 0xb8, hi, lo, 0xb1],
        );
        vm.method_area.define_class(builder.build()).unwrap();

        vm.run("Main").unwrap();
        assert_eq!(vm.debug_trace(), vec![Value::Int(3)]);
    }

    #[test]
    fn uncaught_exceptions_name_the_thrown_class() {
        let vm = Vm::new(Vec::new(), Vec::new());
        vm.method_area
            .define_class(ClassBuilder::new("E").with_super("java/lang/Exception").build())
            .unwrap();

        let mut builder = ClassBuilder::new("Main");
        let e = builder.class_const("E");
        let init = builder.method_ref("E", "<init>", "()V");
        let [ehi, elo] = e.to_be_bytes();
        let [ihi, ilo] = init.to_be_bytes();
        builder.method(
            MAIN_FLAGS,
            "main",
            MAIN_DESC,
            2,
            1,
            // new E; dup; invokespecial E.<init>; athrow
            vec![0xbb, ehi, elo, 0x59, 0xb7, ihi, ilo, 0xbf],
        );
        vm.method_area.define_class(builder.build()).unwrap();

        match vm.run("Main") {
            Err(VmError::UncaughtException(name)) => assert_eq!(name, "E"),
            other => panic!("expected an uncaught exception, got {other:?}"),
        }
    }

    #[test]
    fn missing_main_class_is_a_load_error() {
        let vm = Vm::new(Vec::new(), Vec::new());
        assert!(matches!(
            vm.run("NoSuchClass"),
            Err(VmError::ClassNotFound(_))
        ));
    }
}
