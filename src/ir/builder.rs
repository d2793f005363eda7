use std::collections::HashMap;

use super::{BinOp, Block, BlockId, Function, Inst, InstKind, Operand, Terminator, Type, ValueId};

/// Appends instructions to one function body.
///
/// Instructions go to the current block. Appending after a terminator opens
/// a fresh anonymous block, so unreachable code still lands in a block of
/// its own. The finished function lists blocks in the order they were first
/// positioned at, which is bytecode order for the translator.
pub struct FunctionBuilder {
    func: Function,
    current: BlockId,
    /// Blocks in first-positioned order.
    layout: Vec<BlockId>,
    next_value: u32,
    anon_blocks: u32,
    label_blocks: HashMap<String, BlockId>,
}

impl FunctionBuilder {
    /// Start a body for the declared signature `func`, positioned at `entry`.
    pub fn new(mut func: Function) -> Self {
        func.blocks.clear();
        let mut builder = Self {
            func,
            current: BlockId(0),
            layout: Vec::new(),
            next_value: 0,
            anon_blocks: 0,
            label_blocks: HashMap::new(),
        };
        let entry = builder.create_block("entry");
        builder.position_at(entry);
        builder
    }

    pub fn function(&self) -> &Function {
        &self.func
    }

    pub fn create_block(&mut self, name: &str) -> BlockId {
        self.func.blocks.push(Block {
            name: name.to_string(),
            insts: Vec::new(),
            term: None,
        });
        BlockId((self.func.blocks.len() - 1) as u32)
    }

    /// Block carrying `label`, created on first request.
    pub fn block_for_label(&mut self, label: &str) -> BlockId {
        if let Some(id) = self.label_blocks.get(label) {
            return *id;
        }
        let id = self.create_block(label);
        self.label_blocks.insert(label.to_string(), id);
        id
    }

    /// Fresh block with a generated name.
    pub fn anon_block(&mut self) -> BlockId {
        let name = format!("bb.{}", self.anon_blocks);
        self.anon_blocks += 1;
        self.create_block(&name)
    }

    pub fn position_at(&mut self, block: BlockId) {
        if !self.layout.contains(&block) {
            self.layout.push(block);
        }
        self.current = block;
    }

    pub fn current_block(&self) -> BlockId {
        self.current
    }

    pub fn is_terminated(&self) -> bool {
        self.func.block(self.current).term.is_some()
    }

    fn open_block(&mut self) -> &mut Block {
        if self.is_terminated() {
            let anon = self.anon_block();
            self.position_at(anon);
        }
        &mut self.func.blocks[self.current.0 as usize]
    }

    /// Append an instruction. Returns its result, or `None` for instructions
    /// that produce no value.
    pub fn append(&mut self, kind: InstKind) -> Option<Operand> {
        let result = if kind.has_result() {
            let id = ValueId(self.next_value);
            self.next_value += 1;
            Some(id)
        } else {
            None
        };
        self.open_block().insts.push(Inst { result, kind });
        result.map(Operand::Value)
    }

    /// Append an instruction that must produce a value.
    fn value(&mut self, kind: InstKind) -> Operand {
        match self.append(kind) {
            Some(v) => v,
            None => unreachable!("instruction kind always has a result"),
        }
    }

    pub fn terminate(&mut self, term: Terminator) {
        self.open_block().term = Some(term);
    }

    /// Fall through into `target` unless the current block already ended.
    pub fn fall_through(&mut self, target: BlockId) {
        if !self.is_terminated() && self.current != target {
            self.terminate(Terminator::Br(target));
        }
    }

    /// Terminate every block still lacking a terminator. Returns how many
    /// blocks were sealed.
    pub fn seal_open_blocks(&mut self, term: impl Fn() -> Terminator) -> usize {
        let mut sealed = 0;
        for block in &mut self.func.blocks {
            if block.term.is_none() {
                block.term = Some(term());
                sealed += 1;
            }
        }
        sealed
    }

    /// Return the function with its blocks in layout order. Blocks never
    /// positioned at keep their creation order after the rest.
    pub fn finish(mut self) -> Function {
        let mut order = self.layout;
        for id in 0..self.func.blocks.len() as u32 {
            if !order.contains(&BlockId(id)) {
                order.push(BlockId(id));
            }
        }

        let mut remap = vec![BlockId(0); order.len()];
        for (new, old) in order.iter().enumerate() {
            remap[old.0 as usize] = BlockId(new as u32);
        }

        let mut old_blocks: Vec<Option<Block>> =
            std::mem::take(&mut self.func.blocks).into_iter().map(Some).collect();
        for old in &order {
            if let Some(mut block) = old_blocks[old.0 as usize].take() {
                block.term = block.term.map(|t| remap_term(t, &remap));
                self.func.blocks.push(block);
            }
        }
        self.func
    }

    // =========================================================================
    // Instruction helpers
    // =========================================================================

    pub fn alloca(&mut self, ty: Type) -> Operand {
        self.value(InstKind::Alloca { ty })
    }

    pub fn malloc(&mut self, ty: Type, count: Operand) -> Operand {
        self.value(InstKind::Malloc { ty, count })
    }

    pub fn field_addr(&mut self, strukt: &str, base: Operand, field: u32) -> Operand {
        self.value(InstKind::FieldAddr {
            strukt: strukt.to_string(),
            base,
            field,
        })
    }

    pub fn elem_addr(&mut self, elem: Type, base: Operand, index: Operand) -> Operand {
        self.value(InstKind::ElemAddr { elem, base, index })
    }

    pub fn load(&mut self, ty: Type, ptr: Operand) -> Operand {
        self.value(InstKind::Load { ty, ptr })
    }

    pub fn store(&mut self, value: Operand, ptr: Operand) {
        self.append(InstKind::Store { value, ptr });
    }

    pub fn binary(&mut self, op: BinOp, ty: Type, lhs: Operand, rhs: Operand) -> Operand {
        self.value(InstKind::Binary { op, ty, lhs, rhs })
    }

    pub fn call(&mut self, callee: &str, ret: Type, args: Vec<Operand>) -> Option<Operand> {
        self.append(InstKind::Call {
            callee: callee.to_string(),
            ret,
            args,
        })
    }

    /// Call a helper with a non-void return.
    pub fn call_value(&mut self, callee: &str, ret: Type, args: Vec<Operand>) -> Operand {
        self.value(InstKind::Call {
            callee: callee.to_string(),
            ret,
            args,
        })
    }
}

fn remap_term(term: Terminator, remap: &[BlockId]) -> Terminator {
    match term {
        Terminator::Ret(v) => Terminator::Ret(v),
        Terminator::Br(b) => Terminator::Br(remap[b.0 as usize]),
        Terminator::CondBr {
            cond,
            then_block,
            else_block,
        } => Terminator::CondBr {
            cond,
            then_block: remap[then_block.0 as usize],
            else_block: remap[else_block.0 as usize],
        },
    }
}
