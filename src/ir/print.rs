//! Textual listing of a [`Module`], loosely following LLVM assembly syntax.

use std::fmt;

use super::{
    BinOp, EhHandler, Function, GlobalInit, Inst, InstKind, Module, Operand, Terminator, Type,
};

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::I1 => write!(f, "i1"),
            Type::I8 => write!(f, "i8"),
            Type::I32 => write!(f, "i32"),
            Type::I64 => write!(f, "i64"),
            Type::F64 => write!(f, "double"),
            Type::Struct(name) => write!(f, "%{}", name),
            Type::Ptr(inner) => write!(f, "{}*", inner),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Value(id) => write!(f, "%{}", id.0),
            Operand::Arg(i) => write!(f, "%arg{}", i),
            Operand::Int { ty, value } => write!(f, "{} {}", ty, value),
            Operand::Float(d) => write!(f, "double {:?}", d),
            Operand::Global(name) => write!(f, "@{}", name),
            Operand::Null(ty) => write!(f, "{} null", ty),
        }
    }
}

fn write_inst(f: &mut fmt::Formatter<'_>, inst: &Inst) -> fmt::Result {
    write!(f, "  ")?;
    if let Some(id) = inst.result {
        write!(f, "%{} = ", id.0)?;
    }
    match &inst.kind {
        InstKind::Alloca { ty } => write!(f, "alloca {}", ty),
        InstKind::Malloc { ty, count } => write!(f, "malloc {}, {}", ty, count),
        InstKind::FieldAddr {
            strukt,
            base,
            field,
        } => write!(f, "fieldaddr %{}, {}, {}", strukt, base, field),
        InstKind::ElemAddr { elem, base, index } => {
            write!(f, "elemaddr {}, {}, {}", elem, base, index)
        }
        InstKind::Load { ty, ptr } => write!(f, "load {}, {}", ty, ptr),
        InstKind::Store { value, ptr } => write!(f, "store {}, {}", value, ptr),
        InstKind::Binary { op, ty, lhs, rhs } => {
            let name = match op {
                BinOp::Add => "add",
                BinOp::Sub => "sub",
            };
            write!(f, "{} {} {}, {}", name, ty, lhs, rhs)
        }
        InstKind::Call { callee, ret, args } => {
            let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
            write!(f, "call {} @{}({})", ret, callee, args.join(", "))
        }
        InstKind::EhEnter { region, handler } => match handler {
            EhHandler::Catch(map) => {
                let list: Vec<String> = map
                    .iter()
                    .map(|(class, label)| format!("{} => %{}", class, label))
                    .collect();
                write!(f, ".try {} catch {{ {} }}", region, list.join(", "))
            }
            EhHandler::Fault(label) => write!(f, ".try {} fault %{}", region, label),
        },
        InstKind::EhLeave { region } => write!(f, ".end_try {}", region),
    }?;
    writeln!(f)
}

fn write_term(f: &mut fmt::Formatter<'_>, func: &Function, term: &Terminator) -> fmt::Result {
    match term {
        Terminator::Ret(None) => writeln!(f, "  ret void"),
        Terminator::Ret(Some(v)) => writeln!(f, "  ret {}", v),
        Terminator::Br(target) => writeln!(f, "  br %{}", func.block(*target).name),
        Terminator::CondBr {
            cond,
            then_block,
            else_block,
        } => writeln!(
            f,
            "  br {}, %{}, %{}",
            cond,
            func.block(*then_block).name,
            func.block(*else_block).name
        ),
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self
            .params
            .iter()
            .enumerate()
            .map(|(i, (_, ty))| format!("{} %arg{}", ty, i))
            .collect();
        let keyword = if self.is_declaration() {
            "declare"
        } else {
            "define"
        };
        write!(f, "{} {} @{}({})", keyword, self.ret, self.name, params.join(", "))?;
        if self.is_declaration() {
            return writeln!(f);
        }
        writeln!(f, " {{")?;
        for block in &self.blocks {
            writeln!(f, "{}:", block.name)?;
            for inst in &block.insts {
                write_inst(f, inst)?;
            }
            match &block.term {
                Some(term) => write_term(f, self, term)?,
                None => writeln!(f, "  ; <no terminator>")?,
            }
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; module {}", self.name)?;
        for s in &self.structs {
            let fields: Vec<String> = s.fields.iter().map(|t| t.to_string()).collect();
            writeln!(f, "%{} = type {{ {} }}", s.name, fields.join(", "))?;
        }
        for g in &self.globals {
            match &g.init {
                GlobalInit::CString(s) => writeln!(f, "@{} = constant c{:?}", g.name, s)?,
                GlobalInit::StringData { len, chars } => {
                    writeln!(f, "@{} = constant {} {{ i32 {}, @{} }}", g.name, g.ty, len, chars)?
                }
            }
        }
        for e in &self.externs {
            let params: Vec<String> = e.params.iter().map(|t| t.to_string()).collect();
            writeln!(f, "declare {} @{}({})", e.ret, e.name, params.join(", "))?;
        }
        for func in &self.functions {
            writeln!(f)?;
            write!(f, "{}", func)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::FunctionBuilder;

    #[test]
    fn test_type_display() {
        assert_eq!(Type::named("typed_value_t").ptr().ptr().to_string(), "%typed_value_t**");
        assert_eq!(Type::F64.to_string(), "double");
    }

    #[test]
    fn test_function_listing() {
        let mut b = FunctionBuilder::new(Function::declare(
            "f",
            vec![("ret".to_string(), Type::I64.ptr())],
            Type::Void,
        ));
        let l = b.block_for_label("L0");
        b.store(Operand::i64(7), Operand::Arg(0));
        b.fall_through(l);
        b.position_at(l);
        b.terminate(Terminator::Ret(None));
        let text = b.finish().to_string();

        assert!(text.starts_with("define void @f(i64* %arg0) {"));
        assert!(text.contains("  store i64 7, %arg0\n"));
        assert!(text.contains("  br %L0\n"));
        assert!(text.contains("L0:\n  ret void\n"));
    }

    #[test]
    fn test_module_listing_has_declarations() {
        let mut m = Module::new("demo");
        m.add_struct("string_data", vec![Type::I32, Type::I8.ptr()]);
        m.declare_extern("puts", vec![Type::I8.ptr()], Type::I32);
        m.intern_string("hi", "string_data");
        m.declare_function(Function::declare("g", vec![], Type::Void));
        let text = m.to_string();

        assert!(text.contains("%string_data = type { i32, i8* }"));
        assert!(text.contains("declare i32 @puts(i8*)"));
        assert!(text.contains("@str.0 = constant c\"hi\""));
        assert!(text.contains("declare void @g()"));
    }
}
