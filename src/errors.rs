//! Error types shared across the virtual machine.
use thiserror::Error;

use crate::heap::Reference;

/// `VmError` covers every failure the machine can report: linkage errors,
/// malformed inputs, operand stack misuse and the in-flight exception
/// sentinel used by the unwinding machinery.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("class '{0}' not found")]
    ClassNotFound(String),

    #[error("method '{name}{descriptor}' not found in '{class}'")]
    MethodNotFound {
        class: String,
        name: String,
        descriptor: String,
    },

    #[error("unsupported byte code 0x{0:02x}")]
    UnsupportedOpcode(u8),

    #[error("unsupported argument descriptor '{arg}' in '{descriptor}'")]
    UnsupportedDescriptor { arg: String, descriptor: String },

    #[error("unsupported native method '{class}.{name}{descriptor}'")]
    UnsupportedNativeMethod {
        class: String,
        name: String,
        descriptor: String,
    },

    #[error("truncated '{0}' immediate at pc {1}")]
    BadDecode(&'static str, usize),

    #[error("unsupported constant pool entry '{0}'")]
    UnsupportedConstant(&'static str),

    #[error("constant pool entry {0} is not a {1}")]
    BadConstant(u16, &'static str),

    #[error("malformed class file: {0}")]
    ClassFormat(String),

    #[error("method '{0}' has no code attribute")]
    MissingCode(String),

    #[error("expected an int on the operand stack")]
    ExpectedInt,

    #[error("expected a reference on the operand stack")]
    ExpectedReference,

    #[error("expected an array reference")]
    ExpectedArray,

    #[error("expected an object reference")]
    ExpectedObject,

    #[error("null reference")]
    NullReference,

    #[error("operand stack underflow")]
    StackUnderflow,

    #[error("local variable index {0} out of range")]
    BadLocal(usize),

    #[error("array index {0} out of bounds for length {1}")]
    IndexOutOfBounds(i32, usize),

    #[error("negative array length {0}")]
    NegativeArrayLength(i32),

    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("uncaught exception '{0}'")]
    UncaughtException(String),

    /// Sentinel carried through the invocation return path while a thrown
    /// exception is looking for a handler. Never wrapped in context so it
    /// survives multi-frame unwinds intact.
    #[error("exception in flight")]
    ExceptionThrown(Reference),

    #[error("{context}")]
    Context {
        context: String,
        #[source]
        source: Box<VmError>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VmError {
    /// Wrap the error with a description of the failing step. An in-flight
    /// exception passes through untouched.
    pub fn context(self, context: impl Into<String>) -> Self {
        match self {
            Self::ExceptionThrown(_) => self,
            other => Self::Context {
                context: context.into(),
                source: Box::new(other),
            },
        }
    }
}
