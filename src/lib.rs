//! lungo is a miniature JVM: a class file parser and a stack based
//! bytecode interpreter for a subset of the instruction set, with
//! virtual dispatch, table driven exception handling, monitors and
//! pre-registered native methods.
pub mod bytecode;
pub mod classfile;
pub mod descriptor;
pub mod errors;
pub mod frame;
pub mod heap;
pub mod methodarea;
pub mod natives;
pub mod runtime;
pub mod vm;
