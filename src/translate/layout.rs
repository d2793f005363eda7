//! Tagged-value and value-stack layouts, and the IR sequences that build and
//! move them.
//!
//! ```text
//! %string_data   = { i32 len, i8* chars }
//! %typed_value_t = { i8 tag, i64 num, double dbl, %string_data* pstr }
//! %stack_t       = { i64 size, i64 max_size, %typed_value_t** data }
//! ```
//!
//! Stack operations perform no bounds checks in the emitted IR; the
//! translator tracks depth statically instead (see `emit`). Running code
//! that disagrees with that static depth is undefined behaviour.

use crate::ir::{BinOp, FunctionBuilder, Module, Operand, Type};

pub const STRING_DATA: &str = "string_data";
pub const TYPED_VALUE: &str = "typed_value_t";
pub const STACK: &str = "stack_t";

/// External output primitive: `i32 puts(i8*)`.
pub const PUTS: &str = "puts";
/// External truthiness helper: `i1 tv_truthy(typed_value_t*)`.
pub const TRUTHY: &str = "tv_truthy";

/// Discriminant stored in a tagged value's `tag` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum Tag {
    Null = 0,
    Int = 1,
    Double = 2,
    String = 3,
}

// field indices
pub const TV_TAG: u32 = 0;
pub const TV_NUM: u32 = 1;
pub const TV_DBL: u32 = 2;
pub const TV_PSTR: u32 = 3;

pub const SD_LEN: u32 = 0;
pub const SD_CHARS: u32 = 1;

pub const STACK_SIZE: u32 = 0;
pub const STACK_MAX: u32 = 1;
pub const STACK_DATA: u32 = 2;

pub fn tv_type() -> Type {
    Type::named(TYPED_VALUE)
}

pub fn tv_ptr() -> Type {
    tv_type().ptr()
}

fn pstr_type() -> Type {
    Type::named(STRING_DATA).ptr()
}

/// Types of the four tagged-value fields, in field order.
fn tv_fields() -> [(u32, Type); 4] {
    [
        (TV_TAG, Type::I8),
        (TV_NUM, Type::I64),
        (TV_DBL, Type::F64),
        (TV_PSTR, pstr_type()),
    ]
}

/// Declare the shared layouts and external helpers in `module`.
pub fn define_types(module: &mut Module) {
    module.add_struct(STRING_DATA, vec![Type::I32, Type::I8.ptr()]);
    module.add_struct(
        TYPED_VALUE,
        tv_fields().into_iter().map(|(_, ty)| ty).collect(),
    );
    module.add_struct(STACK, vec![Type::I64, Type::I64, tv_ptr().ptr()]);

    module.declare_extern(PUTS, vec![Type::I8.ptr()], Type::I32);
    module.declare_extern(TRUTHY, vec![tv_ptr()], Type::I1);
}

// =============================================================================
// Tagged values
// =============================================================================

fn set_field(b: &mut FunctionBuilder, tv: &Operand, field: u32, value: Operand) {
    let addr = b.field_addr(TYPED_VALUE, tv.clone(), field);
    b.store(value, addr);
}

fn set_tag(b: &mut FunctionBuilder, tv: &Operand, tag: Tag) {
    set_field(b, tv, TV_TAG, Operand::i8(tag as i8));
}

/// Fill every field of the tagged value at `tv` with its null state.
pub fn init_null(b: &mut FunctionBuilder, tv: &Operand) {
    set_tag(b, tv, Tag::Null);
    set_field(b, tv, TV_NUM, Operand::i64(0));
    set_field(b, tv, TV_DBL, Operand::Float(0.0));
    set_field(b, tv, TV_PSTR, Operand::Null(pstr_type()));
}

/// Allocate a fresh null tagged value.
pub fn make_null(b: &mut FunctionBuilder) -> Operand {
    let tv = b.malloc(tv_type(), Operand::i64(1));
    init_null(b, &tv);
    tv
}

pub fn make_int(b: &mut FunctionBuilder, n: i64) -> Operand {
    let tv = make_null(b);
    set_tag(b, &tv, Tag::Int);
    set_field(b, &tv, TV_NUM, Operand::i64(n));
    tv
}

pub fn make_double(b: &mut FunctionBuilder, d: f64) -> Operand {
    let tv = make_null(b);
    set_tag(b, &tv, Tag::Double);
    set_field(b, &tv, TV_DBL, Operand::Float(d));
    tv
}

/// Intern `s` as a module constant and wrap it in a fresh tagged value.
pub fn make_string(b: &mut FunctionBuilder, module: &mut Module, s: &str) -> Operand {
    let data = module.intern_string(s, STRING_DATA);
    let tv = make_null(b);
    set_tag(b, &tv, Tag::String);
    set_field(b, &tv, TV_PSTR, Operand::Global(data));
    tv
}

/// Copy all four fields of `from` into `to`, field by field.
pub fn copy_fields(b: &mut FunctionBuilder, from: &Operand, to: &Operand) {
    for (field, ty) in tv_fields() {
        let src = b.field_addr(TYPED_VALUE, from.clone(), field);
        let value = b.load(ty, src);
        let dst = b.field_addr(TYPED_VALUE, to.clone(), field);
        b.store(value, dst);
    }
}

/// Fresh tagged value holding a copy of `from`.
pub fn clone_value(b: &mut FunctionBuilder, from: &Operand) -> Operand {
    let tv = make_null(b);
    copy_fields(b, from, &tv);
    tv
}

/// Load the character pointer of a string tagged value.
pub fn string_chars(b: &mut FunctionBuilder, tv: &Operand) -> Operand {
    let pstr_addr = b.field_addr(TYPED_VALUE, tv.clone(), TV_PSTR);
    let pstr = b.load(pstr_type(), pstr_addr);
    let chars_addr = b.field_addr(STRING_DATA, pstr, SD_CHARS);
    b.load(Type::I8.ptr(), chars_addr)
}

// =============================================================================
// Value stack
// =============================================================================

/// Allocate a value stack with room for `capacity` values. Returns a
/// `stack_t*`.
pub fn alloc_stack(b: &mut FunctionBuilder, capacity: u32) -> Operand {
    let stack = b.alloca(Type::named(STACK));
    let data = b.malloc(tv_ptr(), Operand::i64(capacity as i64));

    let size = b.field_addr(STACK, stack.clone(), STACK_SIZE);
    b.store(Operand::i64(0), size);
    let max = b.field_addr(STACK, stack.clone(), STACK_MAX);
    b.store(Operand::i64(capacity as i64), max);
    let slot = b.field_addr(STACK, stack.clone(), STACK_DATA);
    b.store(data, slot);
    stack
}

/// Address of the stack's size field and its current value.
fn load_size(b: &mut FunctionBuilder, stack: &Operand) -> (Operand, Operand) {
    let addr = b.field_addr(STACK, stack.clone(), STACK_SIZE);
    let size = b.load(Type::I64, addr.clone());
    (addr, size)
}

fn slot_at(b: &mut FunctionBuilder, stack: &Operand, index: Operand) -> Operand {
    let data_addr = b.field_addr(STACK, stack.clone(), STACK_DATA);
    let data = b.load(tv_ptr().ptr(), data_addr);
    b.elem_addr(tv_ptr(), data, index)
}

pub fn push(b: &mut FunctionBuilder, stack: &Operand, value: Operand) {
    let (size_addr, size) = load_size(b, stack);
    let slot = slot_at(b, stack, size.clone());
    b.store(value, slot);
    let grown = b.binary(BinOp::Add, Type::I64, size, Operand::i64(1));
    b.store(grown, size_addr);
}

pub fn pop(b: &mut FunctionBuilder, stack: &Operand) -> Operand {
    let (size_addr, size) = load_size(b, stack);
    let top = b.binary(BinOp::Sub, Type::I64, size, Operand::i64(1));
    b.store(top.clone(), size_addr);
    let slot = slot_at(b, stack, top);
    b.load(tv_ptr(), slot)
}

pub fn peek(b: &mut FunctionBuilder, stack: &Operand) -> Operand {
    let (_, size) = load_size(b, stack);
    let top = b.binary(BinOp::Sub, Type::I64, size, Operand::i64(1));
    let slot = slot_at(b, stack, top);
    b.load(tv_ptr(), slot)
}

// =============================================================================
// Locals
// =============================================================================

/// Allocate `count` null-initialised tagged values as a locals arena.
pub fn alloc_locals(b: &mut FunctionBuilder, count: u32) -> Operand {
    let arena = b.malloc(tv_type(), Operand::i64(count as i64));
    for id in 0..count {
        let slot = local_slot(b, &arena, id);
        init_null(b, &slot);
    }
    arena
}

pub fn local_slot(b: &mut FunctionBuilder, arena: &Operand, id: u32) -> Operand {
    b.elem_addr(tv_type(), arena.clone(), Operand::i64(id as i64))
}
