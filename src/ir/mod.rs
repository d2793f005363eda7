//! # Translated IR
//!
//! A small, LLVM-flavoured intermediate representation: named struct
//! layouts, string globals, external declarations and functions made of
//! basic blocks. Values are SSA-numbered per function.
//!
//! Exception regions are carried as `EhEnter`/`EhLeave` marker instructions
//! so a backend can rebuild landing pads from them.

pub mod builder;
pub mod print;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use builder::FunctionBuilder;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Type {
    Void,
    I1,
    I8,
    I32,
    I64,
    F64,
    Struct(String),
    Ptr(Box<Type>),
}

impl Type {
    pub fn named(name: &str) -> Type {
        Type::Struct(name.to_string())
    }

    pub fn ptr(self) -> Type {
        Type::Ptr(Box::new(self))
    }

    /// Element type of a pointer.
    pub fn pointee(&self) -> Option<&Type> {
        match self {
            Type::Ptr(inner) => Some(inner),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Value(ValueId),
    /// Function parameter by position.
    Arg(u32),
    Int { ty: Type, value: i64 },
    Float(f64),
    Global(String),
    Null(Type),
}

impl Operand {
    pub fn i8(value: i8) -> Operand {
        Operand::Int {
            ty: Type::I8,
            value: value as i64,
        }
    }

    pub fn i64(value: i64) -> Operand {
        Operand::Int { ty: Type::I64, value }
    }

    pub fn as_value(&self) -> Option<ValueId> {
        match self {
            Operand::Value(id) => Some(*id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
}

/// Handler attached to a protected region: class name -> label for catch
/// regions, a single label for fault regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EhHandler {
    Catch(BTreeMap<String, String>),
    Fault(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InstKind {
    /// Stack slot for one `ty`.
    Alloca { ty: Type },
    /// Heap allocation of `count` × `ty`; yields `ty*`.
    Malloc { ty: Type, count: Operand },
    /// Address of field `field` of the struct `strukt` at `base`.
    FieldAddr {
        strukt: String,
        base: Operand,
        field: u32,
    },
    /// Address of element `index` of an array of `elem` at `base`.
    ElemAddr {
        elem: Type,
        base: Operand,
        index: Operand,
    },
    Load { ty: Type, ptr: Operand },
    Store { value: Operand, ptr: Operand },
    Binary {
        op: BinOp,
        ty: Type,
        lhs: Operand,
        rhs: Operand,
    },
    Call {
        callee: String,
        ret: Type,
        args: Vec<Operand>,
    },
    EhEnter { region: u32, handler: EhHandler },
    EhLeave { region: u32 },
}

impl InstKind {
    pub fn has_result(&self) -> bool {
        match self {
            InstKind::Store { .. } | InstKind::EhEnter { .. } | InstKind::EhLeave { .. } => false,
            InstKind::Call { ret, .. } => *ret != Type::Void,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inst {
    pub result: Option<ValueId>,
    pub kind: InstKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Terminator {
    Ret(Option<Operand>),
    Br(BlockId),
    CondBr {
        cond: Operand,
        then_block: BlockId,
        else_block: BlockId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub name: String,
    pub insts: Vec<Inst>,
    pub term: Option<Terminator>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<(String, Type)>,
    pub ret: Type,
    /// Empty for a declaration without a body.
    pub blocks: Vec<Block>,
}

impl Function {
    pub fn declare(name: &str, params: Vec<(String, Type)>, ret: Type) -> Self {
        Self {
            name: name.to_string(),
            params,
            ret,
            blocks: Vec::new(),
        }
    }

    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn block_named(&self, name: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.name == name)
    }

    /// All instructions in block order.
    pub fn insts(&self) -> impl Iterator<Item = &Inst> {
        self.blocks.iter().flat_map(|b| b.insts.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructDecl {
    pub name: String,
    pub fields: Vec<Type>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GlobalInit {
    /// NUL-terminated character data.
    CString(String),
    /// A `string_data` record pointing at a `CString` global.
    StringData { len: u32, chars: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalDecl {
    pub name: String,
    pub ty: Type,
    pub init: GlobalInit,
}

/// Function defined outside the module, C linkage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternDecl {
    pub name: String,
    pub params: Vec<Type>,
    pub ret: Type,
}

/// The translator's output artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub structs: Vec<StructDecl>,
    pub globals: Vec<GlobalDecl>,
    pub externs: Vec<ExternDecl>,

    /// Functions in emission order.
    pub functions: Vec<Function>,

    /// Function table: name -> index into `functions`.
    table: BTreeMap<String, usize>,

    /// Interned string literal -> its `string_data` global.
    interned: BTreeMap<String, String>,
}

impl Module {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn add_struct(&mut self, name: &str, fields: Vec<Type>) {
        self.structs.push(StructDecl {
            name: name.to_string(),
            fields,
        });
    }

    pub fn struct_decl(&self, name: &str) -> Option<&StructDecl> {
        self.structs.iter().find(|s| s.name == name)
    }

    pub fn declare_extern(&mut self, name: &str, params: Vec<Type>, ret: Type) {
        if self.extern_decl(name).is_none() {
            self.externs.push(ExternDecl {
                name: name.to_string(),
                params,
                ret,
            });
        }
    }

    pub fn extern_decl(&self, name: &str) -> Option<&ExternDecl> {
        self.externs.iter().find(|e| e.name == name)
    }

    /// Add a function signature to the table. Returns `None` if the name is
    /// already taken.
    pub fn declare_function(&mut self, func: Function) -> Option<usize> {
        if self.table.contains_key(&func.name) {
            return None;
        }
        let idx = self.functions.len();
        self.table.insert(func.name.clone(), idx);
        self.functions.push(func);
        Some(idx)
    }

    /// Replace a declared function with its definition.
    pub fn define_function(&mut self, idx: usize, func: Function) {
        debug_assert_eq!(self.functions[idx].name, func.name);
        self.functions[idx] = func;
    }

    pub fn lookup_function(&self, name: &str) -> Option<usize> {
        self.table.get(name).copied()
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.lookup_function(name).map(|i| &self.functions[i])
    }

    pub fn function_names(&self) -> Vec<&str> {
        self.functions.iter().map(|f| f.name.as_str()).collect()
    }

    /// Intern a string literal, returning the name of its `string_data`
    /// global.
    pub fn intern_string(&mut self, s: &str, string_data: &str) -> String {
        if let Some(name) = self.interned.get(s) {
            return name.clone();
        }
        let n = self.interned.len();
        let chars = format!("str.{}", n);
        let data = format!("sd.{}", n);
        self.globals.push(GlobalDecl {
            name: chars.clone(),
            ty: Type::I8,
            init: GlobalInit::CString(s.to_string()),
        });
        self.globals.push(GlobalDecl {
            name: data.clone(),
            ty: Type::named(string_data),
            init: GlobalInit::StringData {
                len: s.len() as u32,
                chars,
            },
        });
        self.interned.insert(s.to_string(), data.clone());
        data
    }

    pub fn global(&self, name: &str) -> Option<&GlobalDecl> {
        self.globals.iter().find(|g| g.name == name)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_table_rejects_duplicates() {
        let mut m = Module::new("m");
        assert_eq!(m.declare_function(Function::declare("f", vec![], Type::Void)), Some(0));
        assert_eq!(m.declare_function(Function::declare("g", vec![], Type::Void)), Some(1));
        assert_eq!(m.declare_function(Function::declare("f", vec![], Type::I64)), None);
        assert_eq!(m.lookup_function("g"), Some(1));
        assert_eq!(m.function_names(), vec!["f", "g"]);
        assert!(m.function("f").unwrap().is_declaration());
    }

    #[test]
    fn test_intern_string_shares_globals() {
        let mut m = Module::new("m");
        let a = m.intern_string("hi", "string_data");
        let b = m.intern_string("hi", "string_data");
        let c = m.intern_string("there", "string_data");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(m.globals.len(), 4);
        assert_eq!(
            m.global(&a).unwrap().init,
            GlobalInit::StringData {
                len: 2,
                chars: "str.0".to_string()
            }
        );
    }

    #[test]
    fn test_call_result_depends_on_return_type() {
        let void_call = InstKind::Call {
            callee: "f".to_string(),
            ret: Type::Void,
            args: vec![],
        };
        let int_call = InstKind::Call {
            callee: "puts".to_string(),
            ret: Type::I32,
            args: vec![],
        };
        assert!(!void_call.has_result());
        assert!(int_call.has_result());
        assert!(!InstKind::EhLeave { region: 0 }.has_result());
    }

    #[test]
    fn test_module_postcard_roundtrip() {
        let mut m = Module::new("m");
        m.add_struct("pair", vec![Type::I64, Type::F64]);
        m.intern_string("x", "string_data");
        m.declare_function(Function::declare(
            "f",
            vec![("a".to_string(), Type::named("pair").ptr())],
            Type::Void,
        ));
        let bytes = m.to_bytes().unwrap();
        let back = Module::from_bytes(&bytes).unwrap();
        assert_eq!(back, m);
        assert_eq!(back.lookup_function("f"), Some(0));
    }
}
