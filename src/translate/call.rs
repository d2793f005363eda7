//! Call emulation: pending calls live on their own stack of pseudo
//! activation records until the matching `FCall` lowers them.

use crate::ir::{Operand, Type};
use crate::translate::emit::FunctionEmitter;
use crate::translate::layout;
use crate::translate::translate_error::TranslateError;
use crate::unit::op::{Instr, Offset, Opcode};

/// Translator-side record of a call whose arguments are being set up.
#[derive(Debug, Clone, PartialEq)]
pub struct PseudoActRec {
    pub callee: String,
    pub num_args: u32,
    /// Arguments in left-to-right order, filled when the call is lowered.
    pub args: Vec<Operand>,
    /// `FPass*` instructions seen so far.
    pub passed: u32,
    /// Offset of the `FPushFuncD` that opened the call.
    pub at: Offset,
}

impl PseudoActRec {
    pub fn new(callee: &str, num_args: u32, at: Offset) -> Self {
        Self {
            callee: callee.to_string(),
            num_args,
            args: Vec::with_capacity(num_args as usize),
            passed: 0,
            at,
        }
    }
}

#[derive(Debug, Default)]
pub struct CallStack {
    records: Vec<PseudoActRec>,
}

impl CallStack {
    pub fn push(&mut self, ar: PseudoActRec) {
        self.records.push(ar);
    }

    pub fn pop(&mut self) -> Option<PseudoActRec> {
        self.records.pop()
    }

    pub fn peek(&self) -> Option<&PseudoActRec> {
        self.records.last()
    }

    pub fn peek_mut(&mut self) -> Option<&mut PseudoActRec> {
        self.records.last_mut()
    }

    pub fn in_call(&self) -> bool {
        !self.records.is_empty()
    }

    /// Number of nested call sequences in flight.
    pub fn depth(&self) -> usize {
        self.records.len()
    }
}

impl FunctionEmitter<'_> {
    pub(crate) fn push_call(&mut self, instr: &Instr, callee: String) -> Result<(), TranslateError> {
        let argc = self.u32_imm(instr, 0)?;
        tracing::trace!("{}@{:04}: call to '{}' with {} args", self.name, instr.offset, callee, argc);
        self.calls.push(PseudoActRec::new(&callee, argc, instr.offset));
        Ok(())
    }

    pub(crate) fn pass_arg(&mut self, instr: &Instr) -> Result<(), TranslateError> {
        let at = self.location(instr.offset);
        let param = self.u32_imm(instr, 0)?;
        let ar = self
            .calls
            .peek_mut()
            .ok_or_else(|| TranslateError::NoPendingCall {
                at: at.clone(),
                op: instr.op,
            })?;
        if param >= ar.num_args {
            return Err(TranslateError::BadParamId {
                at,
                callee: ar.callee.clone(),
                param,
                argc: ar.num_args,
            });
        }
        ar.passed += 1;
        Ok(())
    }

    /// Lower a complete call sequence: one IR call taking a fresh null
    /// return slot plus the arguments, whose slot is then pushed as the
    /// call's result.
    pub(crate) fn finish_call(&mut self, instr: &Instr) -> Result<(), TranslateError> {
        let argc = self.u32_imm(instr, 0)?;
        let mut ar = self.calls.pop().ok_or_else(|| TranslateError::NoPendingCall {
            at: self.location(instr.offset),
            op: Opcode::FCall,
        })?;
        if ar.num_args != argc {
            return Err(TranslateError::ArgCountMismatch {
                at: self.location(instr.offset),
                callee: ar.callee,
                argc,
                expected: ar.num_args,
            });
        }
        if ar.passed != argc {
            return Err(TranslateError::UnpassedArgs {
                at: self.location(instr.offset),
                callee: ar.callee,
                passed: ar.passed,
                argc,
            });
        }

        let declared = match self.module.function(&ar.callee) {
            Some(f) if f.ret == Type::Void && !f.params.is_empty() => f.params.len() as u32 - 1,
            _ => {
                return Err(TranslateError::UnknownCallee {
                    at: self.location(instr.offset),
                    callee: ar.callee,
                });
            }
        };

        let retval = layout::make_null(&mut self.b);

        // last pushed is consumed first
        for _ in 0..argc {
            let v = self.pop_value(instr)?;
            ar.args.push(v);
        }
        ar.args.reverse();

        if argc > declared {
            tracing::debug!(
                "{}@{:04}: dropping {} surplus argument(s) to '{}'",
                self.name,
                instr.offset,
                argc - declared,
                ar.callee
            );
            ar.args.truncate(declared as usize);
        }
        while (ar.args.len() as u32) < declared {
            let pad = layout::make_null(&mut self.b);
            ar.args.push(pad);
        }

        let mut args = Vec::with_capacity(ar.args.len() + 1);
        args.push(retval.clone());
        args.append(&mut ar.args);
        self.b.call(&ar.callee, Type::Void, args);

        self.push_value(instr, retval)
    }
}
