//! Bytecode assembler.
//!
//! Builds a [`Func`] into a [`Unit`] one instruction at a time. Branches and
//! protected regions refer to [`AsmLabel`]s that are patched when the
//! function is finished.

use super::op::{Offset, Opcode, encode_iva};
use super::{EhEntry, EhKind, Func, Param, Unit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsmLabel(usize);

struct Fixup {
    /// Position of the 4-byte immediate to patch.
    at: usize,
    /// Start of the branching instruction; offsets are relative to it.
    instr_start: usize,
    label: AsmLabel,
}

enum RegionHandler {
    Catch(Vec<(String, AsmLabel)>),
    Fault(AsmLabel),
}

pub struct Assembler<'u> {
    unit: &'u mut Unit,
    name: String,
    is_pseudo_main: bool,
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
    params: Vec<(String, Option<AsmLabel>)>,
    locals: Vec<String>,
    regions: Vec<(AsmLabel, AsmLabel, RegionHandler)>,
    depth: i64,
    max_depth: i64,
    max_stack: Option<u32>,
}

impl<'u> Assembler<'u> {
    pub fn new(unit: &'u mut Unit, name: &str) -> Self {
        Self {
            unit,
            name: name.to_string(),
            is_pseudo_main: false,
            code: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            params: Vec::new(),
            locals: Vec::new(),
            regions: Vec::new(),
            depth: 0,
            max_depth: 0,
            max_stack: None,
        }
    }

    /// Assemble the unit's top-level code.
    pub fn pseudo_main(unit: &'u mut Unit) -> Self {
        let mut asm = Self::new(unit, "");
        asm.is_pseudo_main = true;
        asm
    }

    // =========================================================================
    // Declarations
    // =========================================================================

    /// Declare the next parameter; returns its local slot.
    ///
    /// # Panics
    ///
    /// Panics if a non-parameter local was declared first.
    pub fn param(&mut self, name: &str) -> u32 {
        self.push_param(name, None)
    }

    /// Declare a parameter whose default value is computed at `entry`.
    pub fn param_with_default(&mut self, name: &str, entry: AsmLabel) -> u32 {
        self.push_param(name, Some(entry))
    }

    fn push_param(&mut self, name: &str, entry: Option<AsmLabel>) -> u32 {
        assert_eq!(
            self.locals.len(),
            self.params.len(),
            "parameters must be declared before other locals"
        );
        self.params.push((name.to_string(), entry));
        self.locals.push(name.to_string());
        (self.locals.len() - 1) as u32
    }

    /// Slot of the named local, declaring it on first use.
    pub fn local(&mut self, name: &str) -> u32 {
        if let Some(pos) = self.locals.iter().position(|l| l == name) {
            return pos as u32;
        }
        self.locals.push(name.to_string());
        (self.locals.len() - 1) as u32
    }

    /// Override the computed value-stack capacity.
    pub fn max_stack(&mut self, cells: u32) -> &mut Self {
        self.max_stack = Some(cells);
        self
    }

    pub fn new_label(&mut self) -> AsmLabel {
        self.labels.push(None);
        AsmLabel(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: AsmLabel) -> &mut Self {
        self.labels[label.0] = Some(self.code.len());
        self
    }

    pub fn bound_label(&mut self) -> AsmLabel {
        let label = self.new_label();
        self.bind(label);
        label
    }

    pub fn catch_region(
        &mut self,
        start: AsmLabel,
        end: AsmLabel,
        handlers: &[(&str, AsmLabel)],
    ) -> &mut Self {
        let handlers = handlers
            .iter()
            .map(|(class, label)| (class.to_string(), *label))
            .collect();
        self.regions.push((start, end, RegionHandler::Catch(handlers)));
        self
    }

    pub fn fault_region(&mut self, start: AsmLabel, end: AsmLabel, handler: AsmLabel) -> &mut Self {
        self.regions.push((start, end, RegionHandler::Fault(handler)));
        self
    }

    // =========================================================================
    // Instructions
    // =========================================================================

    fn op(&mut self, op: Opcode, delta: i64) -> &mut Self {
        self.code.push(op.byte());
        self.depth = (self.depth + delta).max(0);
        self.max_depth = self.max_depth.max(self.depth);
        self
    }

    fn i32_imm(&mut self, value: i32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    fn branch_imm(&mut self, instr_start: usize, label: AsmLabel) {
        self.fixups.push(Fixup {
            at: self.code.len(),
            instr_start,
            label,
        });
        self.i32_imm(0);
    }

    fn branch(&mut self, op: Opcode, delta: i64, label: AsmLabel) -> &mut Self {
        let start = self.code.len();
        self.op(op, delta);
        self.branch_imm(start, label);
        self
    }

    pub fn nop(&mut self) -> &mut Self {
        self.op(Opcode::Nop, 0)
    }

    pub fn null(&mut self) -> &mut Self {
        self.op(Opcode::Null, 1)
    }

    pub fn true_(&mut self) -> &mut Self {
        self.op(Opcode::True, 1)
    }

    pub fn int(&mut self, n: i64) -> &mut Self {
        self.op(Opcode::Int, 1);
        self.code.extend_from_slice(&n.to_le_bytes());
        self
    }

    pub fn double(&mut self, d: f64) -> &mut Self {
        self.op(Opcode::Double, 1);
        self.code.extend_from_slice(&d.to_le_bytes());
        self
    }

    pub fn string(&mut self, s: &str) -> &mut Self {
        let id = self.unit.intern(s);
        self.op(Opcode::String, 1);
        self.i32_imm(id as i32);
        self
    }

    pub fn pop_c(&mut self) -> &mut Self {
        self.op(Opcode::PopC, -1)
    }

    pub fn pop_r(&mut self) -> &mut Self {
        self.op(Opcode::PopR, -1)
    }

    pub fn dup(&mut self) -> &mut Self {
        self.op(Opcode::Dup, 1)
    }

    pub fn add(&mut self) -> &mut Self {
        self.op(Opcode::Add, -1)
    }

    pub fn concat(&mut self) -> &mut Self {
        self.op(Opcode::Concat, -1)
    }

    pub fn print(&mut self) -> &mut Self {
        self.op(Opcode::Print, 0)
    }

    pub fn ret_c(&mut self) -> &mut Self {
        self.op(Opcode::RetC, -1)
    }

    pub fn throw(&mut self) -> &mut Self {
        self.op(Opcode::Throw, -1)
    }

    pub fn unwind(&mut self) -> &mut Self {
        self.op(Opcode::Unwind, 0)
    }

    pub fn catch(&mut self) -> &mut Self {
        self.op(Opcode::Catch, 1)
    }

    pub fn cget_l(&mut self, local: u32) -> &mut Self {
        self.op(Opcode::CGetL, 1);
        encode_iva(&mut self.code, local);
        self
    }

    pub fn set_l(&mut self, local: u32) -> &mut Self {
        self.op(Opcode::SetL, 0);
        encode_iva(&mut self.code, local);
        self
    }

    pub fn jmp(&mut self, target: AsmLabel) -> &mut Self {
        self.branch(Opcode::Jmp, 0, target)
    }

    pub fn jmp_z(&mut self, target: AsmLabel) -> &mut Self {
        self.branch(Opcode::JmpZ, -1, target)
    }

    pub fn jmp_nz(&mut self, target: AsmLabel) -> &mut Self {
        self.branch(Opcode::JmpNZ, -1, target)
    }

    pub fn switch(&mut self, targets: &[AsmLabel]) -> &mut Self {
        let start = self.code.len();
        self.op(Opcode::Switch, -1);
        self.i32_imm(targets.len() as i32);
        for target in targets {
            self.branch_imm(start, *target);
        }
        self
    }

    pub fn sswitch(&mut self, cases: &[(&str, AsmLabel)]) -> &mut Self {
        let start = self.code.len();
        self.op(Opcode::SSwitch, -1);
        self.i32_imm(cases.len() as i32);
        for (s, target) in cases {
            let id = self.unit.intern(s);
            self.i32_imm(id as i32);
            self.branch_imm(start, *target);
        }
        self
    }

    pub fn iter_init(&mut self, iter: u32, done: AsmLabel, local: u32) -> &mut Self {
        self.iter_op(Opcode::IterInit, iter, done, local)
    }

    pub fn iter_next(&mut self, iter: u32, body: AsmLabel, local: u32) -> &mut Self {
        self.iter_op(Opcode::IterNext, iter, body, local)
    }

    fn iter_op(&mut self, op: Opcode, iter: u32, target: AsmLabel, local: u32) -> &mut Self {
        let start = self.code.len();
        self.op(op, -1);
        encode_iva(&mut self.code, iter);
        self.branch_imm(start, target);
        encode_iva(&mut self.code, local);
        self
    }

    pub fn fpush_func_d(&mut self, argc: u32, name: &str) -> &mut Self {
        let id = self.unit.intern(name);
        self.op(Opcode::FPushFuncD, 0);
        encode_iva(&mut self.code, argc);
        self.i32_imm(id as i32);
        self
    }

    pub fn fpass_c(&mut self, param: u32) -> &mut Self {
        self.op(Opcode::FPassC, 0);
        encode_iva(&mut self.code, param);
        self
    }

    pub fn fpass_ce(&mut self, param: u32) -> &mut Self {
        self.op(Opcode::FPassCE, 0);
        encode_iva(&mut self.code, param);
        self
    }

    pub fn fcall(&mut self, argc: u32) -> &mut Self {
        self.op(Opcode::FCall, 1 - argc as i64);
        encode_iva(&mut self.code, argc);
        self
    }

    /// Append raw bytes, bypassing all bookkeeping.
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.code.extend_from_slice(bytes);
        self
    }

    // =========================================================================
    // Finishing
    // =========================================================================

    fn resolve(&self, label: AsmLabel) -> usize {
        match self.labels[label.0] {
            Some(pos) => pos,
            None => panic!("label {} used in '{}' but never bound", label.0, self.name),
        }
    }

    /// Patch branches, append the code to the unit and register the function.
    /// Returns the function's index in `unit.funcs`.
    ///
    /// # Panics
    ///
    /// Panics if a referenced label was never bound.
    pub fn finish(mut self) -> usize {
        let base = self.unit.bytecode.len() as Offset;

        for fixup in &self.fixups {
            let target = self.resolve(fixup.label) as i64;
            let rel = (target - fixup.instr_start as i64) as i32;
            self.code[fixup.at..fixup.at + 4].copy_from_slice(&rel.to_le_bytes());
        }

        let abs = |pos: usize| base + pos as Offset;

        let params = self
            .params
            .iter()
            .map(|(name, entry)| Param {
                name: name.clone(),
                default_value: entry.map(|l| abs(self.resolve(l))),
            })
            .collect();

        let eh_table = self
            .regions
            .iter()
            .map(|(start, end, handler)| EhEntry {
                base: abs(self.resolve(*start)),
                past: abs(self.resolve(*end)),
                kind: match handler {
                    RegionHandler::Catch(handlers) => EhKind::Catch {
                        handlers: handlers
                            .iter()
                            .map(|(class, l)| (class.clone(), abs(self.resolve(*l))))
                            .collect(),
                    },
                    RegionHandler::Fault(l) => EhKind::Fault {
                        handler: abs(self.resolve(*l)),
                    },
                },
            })
            .collect();

        let func = Func {
            name: std::mem::take(&mut self.name),
            base,
            past: base + self.code.len() as Offset,
            params,
            locals: std::mem::take(&mut self.locals),
            max_stack: self.max_stack.unwrap_or(self.max_depth as u32),
            eh_table,
            is_pseudo_main: self.is_pseudo_main,
        };

        self.unit.bytecode.append(&mut self.code);
        self.unit.funcs.push(func);
        self.unit.funcs.len() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::op::Imm;

    #[test]
    fn test_straight_line_function() {
        let mut unit = Unit::new("t.php");
        let mut asm = Assembler::pseudo_main(&mut unit);
        asm.int(5).print().pop_c().null().ret_c();
        let idx = asm.finish();

        let func = unit.funcs[idx].clone();
        assert!(func.is_pseudo_main);
        assert_eq!(func.base, 0);
        assert_eq!(func.past as usize, unit.bytecode.len());
        assert_eq!(func.max_stack, 1);

        let ops: Vec<Opcode> = unit.instrs(&func).map(|i| i.unwrap().op).collect();
        assert_eq!(
            ops,
            vec![
                Opcode::Int,
                Opcode::Print,
                Opcode::PopC,
                Opcode::Null,
                Opcode::RetC
            ]
        );
    }

    #[test]
    fn test_backward_and_forward_branches() {
        let mut unit = Unit::new("t.php");
        let mut asm = Assembler::new(&mut unit, "loop");
        let top = asm.bound_label();
        let out = asm.new_label();
        asm.true_().jmp_z(out).jmp(top);
        asm.bind(out).null().ret_c();
        let idx = asm.finish();

        let func = unit.funcs[idx].clone();
        let instrs: Vec<_> = unit.instrs(&func).map(|i| i.unwrap()).collect();
        assert_eq!(instrs[1].op, Opcode::JmpZ);
        assert_eq!(instrs[1].branch_targets(), vec![instrs[3].offset]);
        assert_eq!(instrs[2].branch_targets(), vec![instrs[0].offset]);
    }

    #[test]
    fn test_second_function_offsets_are_absolute() {
        let mut unit = Unit::new("t.php");
        let mut a = Assembler::new(&mut unit, "a");
        a.null().ret_c();
        a.finish();

        let mut b = Assembler::new(&mut unit, "b");
        let x = b.param("x");
        let dv = b.new_label();
        let body = b.bound_label();
        let end = b.new_label();
        b.cget_l(x).ret_c();
        b.bind(end);
        b.bind(dv).int(1).set_l(x).pop_c().jmp(body);
        b.fault_region(body, end, dv);
        let idx = b.finish();

        let func = &unit.funcs[idx];
        assert_eq!(func.base, 2);
        assert_eq!(func.locals, vec!["x".to_string()]);
        assert_eq!(func.params[0].default_value, Some(func.base + 3));
        assert_eq!(
            func.eh_table[0],
            EhEntry {
                base: 2,
                past: 5,
                kind: EhKind::Fault { handler: 5 }
            }
        );
    }

    #[test]
    fn test_sswitch_interns_case_strings() {
        let mut unit = Unit::new("t.php");
        let mut asm = Assembler::new(&mut unit, "s");
        let a = asm.new_label();
        asm.string("k").sswitch(&[("a", a), ("k", a)]);
        asm.bind(a).null().ret_c();
        let idx = asm.finish();

        let func = unit.funcs[idx].clone();
        let sw = unit.instrs(&func).nth(1).unwrap().unwrap();
        match &sw.imms[0] {
            Imm::StrBranchTable(pairs) => {
                assert_eq!(unit.string(pairs[0].0), Some("a"));
                assert_eq!(unit.string(pairs[1].0), Some("k"));
            }
            other => panic!("unexpected immediate {:?}", other),
        }
    }

    #[test]
    #[should_panic(expected = "never bound")]
    fn test_unbound_label_panics() {
        let mut unit = Unit::new("t.php");
        let mut asm = Assembler::new(&mut unit, "bad");
        let l = asm.new_label();
        asm.jmp(l);
        asm.finish();
    }
}
