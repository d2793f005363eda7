//! Translates compiled stack-machine bytecode units into a typed,
//! LLVM-flavoured IR module.

pub mod ir;
pub mod translate;
pub mod unit;

pub use ir::Module;
pub use translate::{TranslateError, Translator, TranslatorConfig, translate_unit};
pub use unit::{Func, Unit};
