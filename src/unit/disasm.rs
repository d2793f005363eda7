use std::collections::BTreeSet;
use std::fmt::Write;

use crate::unit::op::{Imm, Instr, Offset};
use crate::unit::{EhKind, Func, Unit};

/// Print disassembly of every function in a unit
pub fn print_unit(unit: &Unit) {
    println!("=== UNIT {} ===\n", unit.filepath);
    for func in &unit.funcs {
        print!("{}", disassemble_func(unit, func));
        println!();
    }
}

/// Disassemble one function. Jump targets are marked with `►`.
pub fn disassemble_func(unit: &Unit, func: &Func) -> String {
    let mut out = String::new();
    let name = if func.is_pseudo_main {
        "<pseudo-main>"
    } else {
        func.name.as_str()
    };

    let _ = writeln!(out, "════════════════════════════════════════");
    let _ = writeln!(out, " {} [{}, {})", name, func.base, func.past);
    for (i, param) in func.params.iter().enumerate() {
        match param.default_value {
            Some(dv) => {
                let _ = writeln!(out, " param {} ${} = DV@{:04}", i, param.name, dv);
            }
            None => {
                let _ = writeln!(out, " param {} ${}", i, param.name);
            }
        }
    }
    for ent in &func.eh_table {
        let _ = match &ent.kind {
            EhKind::Catch { handlers } => {
                let list: Vec<String> = handlers
                    .iter()
                    .map(|(class, off)| format!("{}→{:04}", class, off))
                    .collect();
                writeln!(out, " catch [{:04}, {:04}) {}", ent.base, ent.past, list.join(" "))
            }
            EhKind::Fault { handler } => writeln!(
                out,
                " fault [{:04}, {:04}) →{:04}",
                ent.base, ent.past, handler
            ),
        };
    }
    let _ = writeln!(out, "════════════════════════════════════════");

    let instrs: Vec<_> = unit.instrs(func).collect();
    let targets = collect_jump_targets(instrs.iter().filter_map(|i| i.as_ref().ok()));

    for item in instrs {
        match item {
            Ok(instr) => {
                let marker = if targets.contains(&instr.offset) {
                    "► "
                } else {
                    "  "
                };
                let _ = writeln!(out, "{:04} {}{}", instr.offset, marker, format_instr(unit, &instr));
            }
            Err(e) => {
                let _ = writeln!(out, "  ; {}", e);
            }
        }
    }
    out
}

fn collect_jump_targets<'a>(instrs: impl Iterator<Item = &'a Instr>) -> BTreeSet<Offset> {
    instrs.flat_map(|i| i.branch_targets()).collect()
}

fn format_instr(unit: &Unit, instr: &Instr) -> String {
    let mut parts = vec![format!("{:<11}", instr.op.mnemonic())];
    for imm in &instr.imms {
        parts.push(format_imm(unit, instr.offset, imm));
    }
    parts.join(" ").trim_end().to_string()
}

fn format_imm(unit: &Unit, at: Offset, imm: &Imm) -> String {
    let abs = |rel: i32| (at as i64 + rel as i64) as Offset;
    match imm {
        Imm::Iva(v) => v.to_string(),
        Imm::Local(id) => format!("L:{}", id),
        Imm::Iter(id) => format!("I:{}", id),
        Imm::Str(id) => match unit.string(*id) {
            Some(s) => format!("{:?}", s),
            None => format!("<str {}>", id),
        },
        Imm::I64(n) => n.to_string(),
        Imm::F64(d) => format!("{:?}", d),
        Imm::Branch(rel) => format!("{:+} (→ {:04})", rel, abs(*rel)),
        Imm::BranchTable(rels) => {
            let list: Vec<String> = rels.iter().map(|r| format!("{:04}", abs(*r))).collect();
            format!("<{}>", list.join(" "))
        }
        Imm::StrBranchTable(pairs) => {
            let list: Vec<String> = pairs
                .iter()
                .map(|(id, r)| format!("{:?}:{:04}", unit.string(*id).unwrap_or("?"), abs(*r)))
                .collect();
            format!("<{}>", list.join(" "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::asm::Assembler;

    #[test]
    fn test_disassembly_marks_targets() {
        let mut unit = Unit::new("t.php");
        let mut asm = Assembler::new(&mut unit, "f");
        let out = asm.new_label();
        asm.true_().jmp_nz(out).string("no").print().pop_c();
        asm.bind(out).null().ret_c();
        let idx = asm.finish();

        let text = disassemble_func(&unit, &unit.funcs[idx]);
        assert!(text.contains(" f [0, "));
        assert!(text.contains("JmpNZ"));
        assert!(text.contains("\"no\""));
        let null_line = text.lines().find(|l| l.contains("Null")).unwrap();
        assert!(null_line.contains('►'), "{}", null_line);
    }

    #[test]
    fn test_disassembly_reports_bad_bytes() {
        let mut unit = Unit::new("t.php");
        let mut asm = Assembler::pseudo_main(&mut unit);
        asm.nop().raw(&[0xfe]);
        let idx = asm.finish();

        let text = disassemble_func(&unit, &unit.funcs[idx]);
        assert!(text.contains("<pseudo-main>"));
        assert!(text.contains("unknown opcode byte 0xfe"));
    }
}
