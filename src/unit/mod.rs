//! # Compiled units
//!
//! The translator's input: a [`Unit`] produced by an external compiler front
//! end. A unit owns one bytecode buffer; every [`Func`] is a `[base, past)`
//! window into it, so all offsets are absolute within the unit.

pub mod asm;
pub mod disasm;
pub mod op;

use serde::{Deserialize, Serialize};

pub use op::{Instr, InstrIter, Offset, Opcode};

/// A compiled collection of functions sharing one source origin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub filepath: String,

    /// Bytecode for every function in the unit.
    pub bytecode: Vec<u8>,

    /// Literal string table, indexed by SA immediates.
    pub strings: Vec<String>,

    pub funcs: Vec<Func>,
}

impl Unit {
    pub fn new(filepath: impl Into<String>) -> Self {
        Self {
            filepath: filepath.into(),
            ..Self::default()
        }
    }

    pub fn string(&self, id: u32) -> Option<&str> {
        self.strings.get(id as usize).map(String::as_str)
    }

    /// Return the id of `s`, adding it to the string table if needed.
    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(pos) = self.strings.iter().position(|x| x == s) {
            return pos as u32;
        }
        self.strings.push(s.to_string());
        (self.strings.len() - 1) as u32
    }

    pub fn pseudo_main(&self) -> Option<&Func> {
        self.funcs.iter().find(|f| f.is_pseudo_main)
    }

    /// Decode a function's instructions in offset order.
    pub fn instrs<'a>(&'a self, func: &Func) -> InstrIter<'a> {
        InstrIter::new(&self.bytecode, func.base, func.past)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

/// One compiled function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Func {
    pub name: String,
    pub base: Offset,
    pub past: Offset,
    pub params: Vec<Param>,

    /// Local slot names. Parameters occupy the first `params.len()` slots.
    pub locals: Vec<String>,

    /// Value-stack capacity of one activation.
    pub max_stack: u32,

    /// Protected regions, outermost first for regions sharing a start.
    pub eh_table: Vec<EhEntry>,

    pub is_pseudo_main: bool,
}

impl Func {
    pub fn contains(&self, offset: Offset) -> bool {
        self.base <= offset && offset < self.past
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,

    /// Entry offset of the code computing this parameter's default value.
    pub default_value: Option<Offset>,
}

/// One exception-handler table entry, protecting `[base, past)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EhEntry {
    pub base: Offset,
    pub past: Offset,
    pub kind: EhKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EhKind {
    /// Exception class name -> handler offset, in match order.
    Catch { handlers: Vec<(String, Offset)> },
    Fault { handler: Offset },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_dedups() {
        let mut unit = Unit::new("t.php");
        let a = unit.intern("hello");
        let b = unit.intern("world");
        assert_eq!(unit.intern("hello"), a);
        assert_ne!(a, b);
        assert_eq!(unit.string(b), Some("world"));
        assert_eq!(unit.string(9), None);
    }

    #[test]
    fn test_unit_postcard_roundtrip() {
        let mut unit = Unit::new("t.php");
        unit.bytecode = vec![Opcode::Null.byte(), Opcode::RetC.byte()];
        unit.funcs.push(Func {
            name: "main".to_string(),
            base: 0,
            past: 2,
            max_stack: 1,
            eh_table: vec![EhEntry {
                base: 0,
                past: 1,
                kind: EhKind::Fault { handler: 1 },
            }],
            is_pseudo_main: true,
            ..Func::default()
        });

        let bytes = unit.to_bytes().unwrap();
        assert_eq!(Unit::from_bytes(&bytes).unwrap(), unit);
    }

    #[test]
    fn test_pseudo_main_lookup() {
        let mut unit = Unit::new("t.php");
        unit.funcs.push(Func {
            name: "f".to_string(),
            ..Func::default()
        });
        assert!(unit.pseudo_main().is_none());
        unit.funcs.push(Func {
            name: "main".to_string(),
            is_pseudo_main: true,
            ..Func::default()
        });
        assert_eq!(unit.pseudo_main().map(|f| f.name.as_str()), Some("main"));
    }
}
