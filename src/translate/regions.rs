//! Walks a function body in offset order, interleaving exception-region
//! markers and labels with the emitted instructions.

use std::cmp::Reverse;
use std::collections::BTreeSet;

use crate::ir::{EhHandler, InstKind};
use crate::translate::emit::FunctionEmitter;
use crate::translate::func_info::{EhInfo, FuncInfo};
use crate::translate::translate_error::TranslateError;
use crate::unit::op::Offset;

fn handler(info: &EhInfo) -> EhHandler {
    match info {
        EhInfo::Catch { blocks } => EhHandler::Catch(blocks.clone()),
        EhInfo::Fault { label } => EhHandler::Fault(label.clone()),
    }
}

/// Open regions keyed by end offset. Regions sharing an end close
/// innermost (most recently opened) first.
#[derive(Default)]
struct PendingEnds {
    ends: BTreeSet<(Offset, Reverse<u32>, usize)>,
    opened: u32,
}

impl PendingEnds {
    fn open(&mut self, end: Offset, region: usize) {
        self.ends.insert((end, Reverse(self.opened), region));
        self.opened += 1;
    }

    /// Next region whose end is at or before `offset`.
    fn close_through(&mut self, offset: Offset) -> Option<usize> {
        let first = *self.ends.first()?;
        if first.0 > offset {
            return None;
        }
        self.ends.remove(&first);
        Some(first.2)
    }
}

fn close_regions(em: &mut FunctionEmitter<'_>, pending: &mut PendingEnds, offset: Offset) {
    while let Some(region) = pending.close_through(offset) {
        em.b.append(InstKind::EhLeave {
            region: region as u32,
        });
    }
}

/// Emit the whole body of `info.func`. At each instruction, regions ending
/// there close, the label's block is entered, regions starting there open,
/// and then the opcode is emitted.
///
/// Close markers stay at the end of the block before a label; if that block
/// already ended they go at the head of the label's block. Open markers
/// always follow the label, so every branch to a region's first label
/// passes its `EhEnter`.
pub fn emit_body(em: &mut FunctionEmitter<'_>, info: &FuncInfo<'_>) -> Result<(), TranslateError> {
    let table = &info.func.eh_table;
    let mut starts = info.eh_starts.clone();
    starts.sort_by_key(|(offset, _)| *offset);
    let mut next_start = 0;
    let mut pending = PendingEnds::default();

    for instr in &info.instrs {
        let offset = instr.offset;
        let label = info.label_at(offset);

        let close_before_label = label.is_none() || !em.b.is_terminated();
        if close_before_label {
            close_regions(em, &mut pending, offset);
        }
        if let Some(label) = label {
            em.enter_label(label);
        }
        if !close_before_label {
            close_regions(em, &mut pending, offset);
        }

        while next_start < starts.len() && starts[next_start].0 <= offset {
            let region = starts[next_start].1;
            next_start += 1;
            let Some(eh) = info.eh_info.get(&region) else {
                continue;
            };
            em.b.append(InstKind::EhEnter {
                region: region as u32,
                handler: handler(eh),
            });
            pending.open(table[region].past, region);
        }

        em.emit(info, instr)?;
    }

    close_regions(em, &mut pending, Offset::MAX);
    Ok(())
}
