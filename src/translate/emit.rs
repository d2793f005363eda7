//! Per-opcode lowering onto the explicit value stack.

use std::collections::HashMap;

use crate::ir::{Function, FunctionBuilder, Module, Operand, Terminator, Type};
use crate::translate::TranslatorConfig;
use crate::translate::call::CallStack;
use crate::translate::func_info::FuncInfo;
use crate::translate::layout;
use crate::translate::translate_error::{Location, TranslateError};
use crate::unit::op::{Imm, Instr, Offset, Opcode};

/// Static (pops, pushes) of an opcode the emitter does not lower.
fn skipped_effect(instr: &Instr) -> (u32, u32) {
    match instr.op {
        Opcode::True | Opcode::False | Opcode::Catch => (0, 1),
        Opcode::Add | Opcode::Sub | Opcode::Concat => (2, 1),
        Opcode::Not => (1, 1),
        Opcode::Switch | Opcode::SSwitch | Opcode::Throw | Opcode::IterInit => (1, 0),
        _ => (0, 0),
    }
}

/// Lowers one function body. Owns all per-function state; a new emitter is
/// built for every function.
pub struct FunctionEmitter<'t> {
    pub(crate) b: FunctionBuilder,
    pub(crate) module: &'t mut Module,
    config: &'t TranslatorConfig,
    pub(crate) name: String,
    is_pseudo_main: bool,

    /// `stack_t*` of this activation.
    stack: Operand,
    /// Locals arena, one tagged value per slot.
    locals: Operand,
    num_locals: u32,
    capacity: u32,

    /// Static value-stack depth at the current instruction.
    depth: u32,
    /// Whether the current instruction can be reached by falling through.
    reachable: bool,
    /// Depth recorded at branches, by target label.
    label_depths: HashMap<String, u32>,

    pub(crate) calls: CallStack,
    skipped: usize,
}

impl<'t> FunctionEmitter<'t> {
    /// Start the body of `decl` and emit the prologue: value stack, locals
    /// arena and, for ordinary functions, copies of the incoming arguments.
    pub fn new(
        decl: Function,
        module: &'t mut Module,
        config: &'t TranslatorConfig,
        info: &FuncInfo<'_>,
    ) -> Self {
        let func = info.func;
        let mut b = FunctionBuilder::new(decl);
        let stack = layout::alloc_stack(&mut b, func.max_stack);
        let num_locals = func.locals.len().max(func.params.len()) as u32;
        let locals = layout::alloc_locals(&mut b, num_locals);

        if !func.is_pseudo_main {
            // argument i arrives as parameter i + 1, after the return slot
            for i in 0..func.params.len() as u32 {
                let slot = layout::local_slot(&mut b, &locals, i);
                layout::copy_fields(&mut b, &Operand::Arg(i + 1), &slot);
            }
        }

        Self {
            b,
            module,
            config,
            name: info.name.clone(),
            is_pseudo_main: func.is_pseudo_main,
            stack,
            locals,
            num_locals,
            capacity: func.max_stack,
            depth: 0,
            reachable: true,
            label_depths: HashMap::new(),
            calls: CallStack::default(),
            skipped: 0,
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub(crate) fn location(&self, offset: Offset) -> Location {
        Location::new(&self.name, offset)
    }

    // =========================================================================
    // Value stack
    // =========================================================================

    fn take(&mut self, instr: &Instr, count: u32) -> Result<(), TranslateError> {
        if self.depth < count {
            if self.config.verify_stack_depth {
                return Err(TranslateError::StackUnderflow {
                    at: self.location(instr.offset),
                    op: instr.op,
                });
            }
            self.depth = 0;
        } else {
            self.depth -= count;
        }
        Ok(())
    }

    fn give(&mut self, instr: &Instr, count: u32) -> Result<(), TranslateError> {
        if self.config.verify_stack_depth && self.depth + count > self.capacity {
            return Err(TranslateError::StackOverflow {
                at: self.location(instr.offset),
                op: instr.op,
                capacity: self.capacity,
            });
        }
        self.depth += count;
        Ok(())
    }

    pub(crate) fn pop_value(&mut self, instr: &Instr) -> Result<Operand, TranslateError> {
        self.take(instr, 1)?;
        Ok(layout::pop(&mut self.b, &self.stack))
    }

    pub(crate) fn push_value(&mut self, instr: &Instr, value: Operand) -> Result<(), TranslateError> {
        self.give(instr, 1)?;
        layout::push(&mut self.b, &self.stack, value);
        Ok(())
    }

    fn peek_value(&mut self, instr: &Instr) -> Result<Operand, TranslateError> {
        if self.depth == 0 && self.config.verify_stack_depth {
            return Err(TranslateError::StackUnderflow {
                at: self.location(instr.offset),
                op: instr.op,
            });
        }
        Ok(layout::peek(&mut self.b, &self.stack))
    }

    // =========================================================================
    // Blocks
    // =========================================================================

    /// Start the block for `label`. Falls through from the current block if
    /// it is still open; otherwise the static depth comes from the branches
    /// that target the label (0 for handler entries).
    pub fn enter_label(&mut self, label: &str) {
        let block = self.b.block_for_label(label);
        if self.reachable {
            self.b.fall_through(block);
        } else {
            self.depth = self.label_depths.get(label).copied().unwrap_or(0);
        }
        self.b.position_at(block);
        self.reachable = true;
    }

    fn end_block(&mut self, term: Terminator) {
        self.b.terminate(term);
        self.reachable = false;
    }

    fn branch_label<'i>(
        &mut self,
        info: &'i FuncInfo<'_>,
        instr: &Instr,
    ) -> Result<&'i str, TranslateError> {
        let Some(target) = instr.branch_targets().first().copied() else {
            return Err(self.malformed(instr));
        };
        let label = info
            .label_at(target)
            .ok_or_else(|| TranslateError::UnresolvedTarget {
                at: self.location(instr.offset),
                target,
            })?;
        self.label_depths.entry(label.to_string()).or_insert(self.depth);
        Ok(label)
    }

    // =========================================================================
    // Opcodes
    // =========================================================================

    pub(crate) fn malformed(&self, instr: &Instr) -> TranslateError {
        TranslateError::MalformedInstr {
            at: self.location(instr.offset),
            op: instr.op,
        }
    }

    /// Integer immediate at `index` (IVA, local, iterator or string id).
    pub(crate) fn u32_imm(&self, instr: &Instr, index: usize) -> Result<u32, TranslateError> {
        instr.u32_imm(index).ok_or_else(|| self.malformed(instr))
    }

    fn string_imm(&self, info: &FuncInfo<'_>, instr: &Instr, index: usize) -> Result<String, TranslateError> {
        let id = self.u32_imm(instr, index)?;
        info.unit
            .string(id)
            .map(str::to_string)
            .ok_or_else(|| TranslateError::BadStringId {
                at: self.location(instr.offset),
                id,
            })
    }

    fn local_imm(&mut self, instr: &Instr) -> Result<Operand, TranslateError> {
        let id = self.u32_imm(instr, 0)?;
        if id >= self.num_locals {
            return Err(TranslateError::BadLocalId {
                at: self.location(instr.offset),
                id,
            });
        }
        Ok(layout::local_slot(&mut self.b, &self.locals, id))
    }

    /// Emit the IR for one instruction.
    pub fn emit(&mut self, info: &FuncInfo<'_>, instr: &Instr) -> Result<(), TranslateError> {
        tracing::trace!("{}@{:04}: {}", self.name, instr.offset, instr.op);
        match instr.op {
            Opcode::Nop => {}

            // literals
            Opcode::Null => {
                let tv = layout::make_null(&mut self.b);
                self.push_value(instr, tv)?;
            }
            Opcode::Int => {
                let Some(Imm::I64(n)) = instr.imms.first().cloned() else {
                    return Err(self.malformed(instr));
                };
                let tv = layout::make_int(&mut self.b, n);
                self.push_value(instr, tv)?;
            }
            Opcode::Double => {
                let Some(Imm::F64(d)) = instr.imms.first().cloned() else {
                    return Err(self.malformed(instr));
                };
                let tv = layout::make_double(&mut self.b, d);
                self.push_value(instr, tv)?;
            }
            Opcode::String => {
                let s = self.string_imm(info, instr, 0)?;
                let tv = layout::make_string(&mut self.b, self.module, &s);
                self.push_value(instr, tv)?;
            }

            // stack
            Opcode::PopC | Opcode::PopR => {
                self.pop_value(instr)?;
            }
            Opcode::Dup => {
                let top = self.peek_value(instr)?;
                let copy = layout::clone_value(&mut self.b, &top);
                self.push_value(instr, copy)?;
            }

            // locals
            Opcode::SetL => {
                let slot = self.local_imm(instr)?;
                let value = self.peek_value(instr)?;
                layout::copy_fields(&mut self.b, &value, &slot);
            }
            Opcode::CGetL => {
                let slot = self.local_imm(instr)?;
                let copy = layout::clone_value(&mut self.b, &slot);
                self.push_value(instr, copy)?;
            }

            Opcode::Print => {
                let value = self.pop_value(instr)?;
                let chars = layout::string_chars(&mut self.b, &value);
                self.b.call(layout::PUTS, Type::I32, vec![chars]);
                let one = layout::make_int(&mut self.b, 1);
                self.push_value(instr, one)?;
            }

            Opcode::RetC => {
                if self.is_pseudo_main {
                    self.end_block(Terminator::Ret(Some(Operand::i64(0))));
                } else {
                    let value = self.pop_value(instr)?;
                    layout::copy_fields(&mut self.b, &value, &Operand::Arg(0));
                    self.end_block(Terminator::Ret(None));
                }
            }

            // branches
            Opcode::Jmp => {
                let label = self.branch_label(info, instr)?;
                let target = self.b.block_for_label(label);
                self.end_block(Terminator::Br(target));
            }
            Opcode::JmpZ | Opcode::JmpNZ => {
                let value = self.pop_value(instr)?;
                let label = self.branch_label(info, instr)?;
                let target = self.b.block_for_label(label);
                let fall = match info.label_at(instr.next_offset()) {
                    Some(next) => {
                        self.label_depths.entry(next.to_string()).or_insert(self.depth);
                        self.b.block_for_label(next)
                    }
                    None => self.b.anon_block(),
                };
                let cond = self.b.call_value(layout::TRUTHY, Type::I1, vec![value]);
                let (then_block, else_block) = if instr.op == Opcode::JmpNZ {
                    (target, fall)
                } else {
                    (fall, target)
                };
                self.b.terminate(Terminator::CondBr {
                    cond,
                    then_block,
                    else_block,
                });
                self.b.position_at(fall);
            }

            // calls
            Opcode::FPushFuncD => {
                let callee = self.string_imm(info, instr, 1)?;
                self.push_call(instr, callee)?;
            }
            Opcode::FPassC | Opcode::FPassCE => self.pass_arg(instr)?,
            Opcode::FCall => self.finish_call(instr)?,

            _ => self.skip(instr)?,
        }
        Ok(())
    }

    fn skip(&mut self, instr: &Instr) -> Result<(), TranslateError> {
        if self.config.strict_opcodes {
            return Err(TranslateError::UnsupportedOpcode {
                at: self.location(instr.offset),
                op: instr.op,
            });
        }
        tracing::debug!("{}@{:04}: skipping {}", self.name, instr.offset, instr.op);
        let (pops, pushes) = skipped_effect(instr);
        self.take(instr, pops)?;
        self.give(instr, pushes)?;
        self.skipped += 1;
        Ok(())
    }

    /// Close the body: reject unfinished calls and give every open block the
    /// function's default return.
    pub fn finish(mut self, past: Offset) -> Result<Function, TranslateError> {
        if let Some(ar) = self.calls.pop() {
            return Err(TranslateError::UnfinishedCall {
                at: self.location(past),
                callee: ar.callee,
            });
        }
        let is_pseudo_main = self.is_pseudo_main;
        let sealed = self.b.seal_open_blocks(|| {
            if is_pseudo_main {
                Terminator::Ret(Some(Operand::i64(0)))
            } else {
                Terminator::Ret(None)
            }
        });
        if sealed > 0 {
            tracing::debug!("{}: synthesized {} return(s)", self.name, sealed);
        }
        if self.skipped > 0 {
            tracing::debug!("{}: skipped {} instruction(s)", self.name, self.skipped);
        }
        Ok(self.b.finish())
    }
}
