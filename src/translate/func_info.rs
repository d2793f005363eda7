//! Per-function metadata pass: jump-target labels, exception regions and
//! default-value entry points.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::translate::translate_error::{Location, TranslateError};
use crate::unit::op::Offset;
use crate::unit::{EhKind, Func, Instr, Unit};

/// Handler labels chosen for one exception-table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EhInfo {
    /// Exception class name -> handler label.
    Catch { blocks: BTreeMap<String, String> },
    Fault { label: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LabelKind {
    Jump,
    Catch,
    Fault,
    DefaultValue,
}

impl LabelKind {
    fn prefix(self) -> &'static str {
        match self {
            LabelKind::Jump => "L",
            LabelKind::Catch => "C",
            LabelKind::Fault => "F",
            LabelKind::DefaultValue => "DV",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug)]
pub struct FuncInfo<'a> {
    pub unit: &'a Unit,
    pub func: &'a Func,

    /// Name used for this function in the IR and in errors.
    pub name: String,

    /// Decoded body, in offset order.
    pub instrs: Vec<Instr>,

    /// Offset -> label name. One label per offset.
    pub labels: BTreeMap<Offset, String>,

    /// Exception-table index -> handler labels.
    pub eh_info: HashMap<usize, EhInfo>,

    /// (region start, exception-table index) in table order.
    pub eh_starts: Vec<(Offset, usize)>,

    counters: [u32; 4],
    boundaries: BTreeSet<Offset>,
}

impl<'a> FuncInfo<'a> {
    pub fn build(unit: &'a Unit, func: &'a Func, name: &str) -> Result<Self, TranslateError> {
        let instrs = unit
            .instrs(func)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TranslateError::decode(name, e))?;
        let boundaries = instrs.iter().map(|i| i.offset).collect();

        let mut info = FuncInfo {
            unit,
            func,
            name: name.to_string(),
            instrs: Vec::new(),
            labels: BTreeMap::new(),
            eh_info: HashMap::new(),
            eh_starts: Vec::new(),
            counters: [0; 4],
            boundaries,
        };

        for instr in &instrs {
            for target in instr.branch_targets() {
                info.add_label(LabelKind::Jump, target, instr.offset)?;
            }
        }

        for (idx, ent) in func.eh_table.iter().enumerate() {
            let eh = match &ent.kind {
                EhKind::Catch { handlers } => {
                    let mut blocks = BTreeMap::new();
                    for (class, handler) in handlers {
                        let label = info.add_label(LabelKind::Catch, *handler, ent.base)?;
                        blocks.insert(class.clone(), label);
                    }
                    EhInfo::Catch { blocks }
                }
                EhKind::Fault { handler } => EhInfo::Fault {
                    label: info.add_label(LabelKind::Fault, *handler, ent.base)?,
                },
            };
            info.eh_info.insert(idx, eh);
            info.eh_starts.push((ent.base, idx));
        }

        for param in &func.params {
            if let Some(dv) = param.default_value {
                info.add_label(LabelKind::DefaultValue, dv, dv)?;
            }
        }

        info.instrs = instrs;
        tracing::trace!(
            "{}: {} labels, {} eh regions",
            info.name,
            info.labels.len(),
            info.eh_starts.len()
        );
        Ok(info)
    }

    /// Label for `target`, creating one of `kind` on first reference.
    fn add_label(
        &mut self,
        kind: LabelKind,
        target: Offset,
        from: Offset,
    ) -> Result<String, TranslateError> {
        if !self.boundaries.contains(&target) {
            return Err(TranslateError::UnresolvedTarget {
                at: Location::new(&self.name, from),
                target,
            });
        }
        if let Some(label) = self.labels.get(&target) {
            return Ok(label.clone());
        }
        let counter = &mut self.counters[kind.index()];
        let label = format!("{}{}", kind.prefix(), counter);
        *counter += 1;
        self.labels.insert(target, label.clone());
        Ok(label)
    }

    pub fn label_at(&self, offset: Offset) -> Option<&str> {
        self.labels.get(&offset).map(String::as_str)
    }

    pub fn location(&self, offset: Offset) -> Location {
        Location::new(&self.name, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::asm::Assembler;

    fn info_for(unit: &Unit, idx: usize) -> FuncInfo<'_> {
        let func = &unit.funcs[idx];
        FuncInfo::build(unit, func, &func.name).unwrap()
    }

    #[test]
    fn test_straight_line_has_no_labels() {
        let mut unit = Unit::new("t.php");
        let mut asm = Assembler::new(&mut unit, "f");
        asm.int(5).print().pop_c().null().ret_c();
        let idx = asm.finish();

        let info = info_for(&unit, idx);
        assert!(info.labels.is_empty());
        assert!(info.eh_info.is_empty());
        assert!(info.eh_starts.is_empty());
        assert_eq!(info.instrs.len(), 5);
    }

    #[test]
    fn test_repeated_targets_share_a_label() {
        let mut unit = Unit::new("t.php");
        let mut asm = Assembler::new(&mut unit, "f");
        let a = asm.new_label();
        let b = asm.new_label();
        asm.true_().jmp_z(a).true_().jmp_nz(a).jmp(b);
        asm.bind(a).nop();
        asm.bind(b).null().ret_c();
        let idx = asm.finish();

        let info = info_for(&unit, idx);
        let names: Vec<&str> = info.labels.values().map(String::as_str).collect();
        assert_eq!(names, vec!["L0", "L1"]);
    }

    #[test]
    fn test_switch_contributes_every_case() {
        let mut unit = Unit::new("t.php");
        let mut asm = Assembler::new(&mut unit, "f");
        let (a, b, c) = (asm.new_label(), asm.new_label(), asm.new_label());
        asm.int(1).switch(&[a, b, c, a]);
        asm.bind(a).null().ret_c();
        asm.bind(b).null().ret_c();
        asm.bind(c).null().ret_c();
        let idx = asm.finish();

        let info = info_for(&unit, idx);
        assert_eq!(info.labels.len(), 3);
    }

    #[test]
    fn test_kinds_have_independent_counters() {
        let mut unit = Unit::new("t.php");
        let mut asm = Assembler::new(&mut unit, "f");
        let dv = asm.new_label();
        let x = asm.param_with_default("x", dv);
        let start = asm.bound_label();
        let end = asm.new_label();
        let catch_a = asm.new_label();
        let catch_b = asm.new_label();
        let fault = asm.new_label();
        let exit = asm.new_label();
        asm.cget_l(x).pop_c().jmp(exit);
        asm.bind(end);
        asm.bind(catch_a).catch().pop_c().jmp(exit);
        asm.bind(catch_b).catch().pop_c().jmp(exit);
        asm.bind(fault).unwind();
        asm.bind(dv).int(3).set_l(x).pop_c().jmp(start);
        asm.bind(exit).null().ret_c();
        asm.catch_region(start, end, &[("Exception", catch_a), ("MyErr", catch_b)]);
        asm.fault_region(start, end, fault);
        let idx = asm.finish();

        let info = info_for(&unit, idx);
        let base = unit.funcs[idx].base;
        assert_eq!(info.label_at(base), Some("L1"));
        assert_eq!(
            info.eh_info[&0],
            EhInfo::Catch {
                blocks: BTreeMap::from([
                    ("Exception".to_string(), "C0".to_string()),
                    ("MyErr".to_string(), "C1".to_string()),
                ])
            }
        );
        assert_eq!(
            info.eh_info[&1],
            EhInfo::Fault {
                label: "F0".to_string()
            }
        );
        assert_eq!(info.eh_starts, vec![(base, 0), (base, 1)]);
        let dv_offset = unit.funcs[idx].params[0].default_value.unwrap();
        assert_eq!(info.label_at(dv_offset), Some("DV0"));
    }

    #[test]
    fn test_label_set_matches_targets() {
        let mut unit = Unit::new("t.php");
        let mut asm = Assembler::new(&mut unit, "f");
        let a = asm.new_label();
        let start = asm.bound_label();
        let end = asm.new_label();
        let h = asm.new_label();
        asm.true_().jmp_z(a).nop();
        asm.bind(end).bind(a).null().ret_c();
        asm.bind(h).unwind();
        asm.fault_region(start, end, h);
        let idx = asm.finish();

        let func = &unit.funcs[idx];
        let info = info_for(&unit, idx);
        let mut expected = BTreeSet::new();
        for instr in &info.instrs {
            expected.extend(instr.branch_targets());
        }
        if let EhKind::Fault { handler } = func.eh_table[0].kind {
            expected.insert(handler);
        }
        let got: BTreeSet<Offset> = info.labels.keys().copied().collect();
        assert_eq!(got, expected);
        assert!(got.iter().all(|o| func.contains(*o)));
    }

    #[test]
    fn test_target_outside_function_is_fatal() {
        let mut unit = Unit::new("t.php");
        let mut asm = Assembler::new(&mut unit, "f");
        asm.raw(&[crate::unit::Opcode::Jmp.byte()]);
        asm.raw(&100i32.to_le_bytes());
        let idx = asm.finish();

        let func = &unit.funcs[idx];
        let err = FuncInfo::build(&unit, func, "f").unwrap_err();
        assert!(matches!(
            err,
            TranslateError::UnresolvedTarget { target: 100, .. }
        ));
    }

    #[test]
    fn test_target_inside_an_instruction_is_fatal() {
        let mut unit = Unit::new("t.php");
        let mut asm = Assembler::new(&mut unit, "f");
        asm.int(7);
        asm.raw(&[crate::unit::Opcode::Jmp.byte()]);
        asm.raw(&(-8i32).to_le_bytes());
        let idx = asm.finish();

        let func = &unit.funcs[idx];
        assert!(FuncInfo::build(&unit, func, "f").is_err());
    }
}
