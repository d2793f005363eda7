use thiserror::Error;

/// Byte offset into a unit's bytecode.
pub type Offset = u32;

// =============================================================================
// OPCODE - Stack-machine instructions
// =============================================================================

/// One-byte opcodes of the instruction set.
///
/// Stack effects are written as `( before -- after )`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,

    // stack ops
    PopC, // ( v -- )
    PopR, // ( v -- )
    Dup,  // ( v -- v v )

    // literals
    Null,   // ( -- null )
    True,   // ( -- true )
    False,  // ( -- false )
    Int,    // ( -- int )      I64A
    Double, // ( -- double )   DA
    String, // ( -- string )   SA

    // arithmetic / string
    Add,
    Sub,
    Concat,
    Not,

    // I/O
    Print, // ( v -- 1 )

    // ==========================================================================
    // Branches. Offsets are relative to the start of the branching instruction.
    // ==========================================================================
    Jmp,     // BA
    JmpZ,    // BA, ( cond -- )
    JmpNZ,   // BA, ( cond -- )
    Switch,  // BLA, ( int -- )
    SSwitch, // SLA, ( string -- )

    // function exit / exceptions
    RetC, // ( v -- )
    Throw,
    Unwind,
    Catch, // ( -- exn )

    // locals
    CGetL, // LA, ( -- v )
    SetL,  // LA, ( v -- v )

    // ==========================================================================
    // Calls: FPushFuncD opens a call, FPass* mark arguments, FCall finishes it.
    // ==========================================================================
    FPushFuncD, // IVA argc, SA name
    FPassC,     // IVA param
    FPassCE,    // IVA param
    FCall,      // IVA argc, ( args.. -- ret )

    // iteration
    IterInit, // IA, BA, LA
    IterNext, // IA, BA, LA
}

/// Kinds of immediate operand that follow an opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmKind {
    /// Variable-size unsigned integer.
    Iva,
    /// Local id, encoded as IVA.
    La,
    /// Iterator id, encoded as IVA.
    Ia,
    /// String-table id, 4 bytes.
    Sa,
    I64a,
    Da,
    /// Relative branch offset, 4 bytes.
    Ba,
    /// Vector of relative branch offsets.
    Bla,
    /// Vector of (string id, relative branch offset) pairs.
    Sla,
}

impl Opcode {
    pub const ALL: [Opcode; 32] = [
        Opcode::Nop,
        Opcode::PopC,
        Opcode::PopR,
        Opcode::Dup,
        Opcode::Null,
        Opcode::True,
        Opcode::False,
        Opcode::Int,
        Opcode::Double,
        Opcode::String,
        Opcode::Add,
        Opcode::Sub,
        Opcode::Concat,
        Opcode::Not,
        Opcode::Print,
        Opcode::Jmp,
        Opcode::JmpZ,
        Opcode::JmpNZ,
        Opcode::Switch,
        Opcode::SSwitch,
        Opcode::RetC,
        Opcode::Throw,
        Opcode::Unwind,
        Opcode::Catch,
        Opcode::CGetL,
        Opcode::SetL,
        Opcode::FPushFuncD,
        Opcode::FPassC,
        Opcode::FPassCE,
        Opcode::FCall,
        Opcode::IterInit,
        Opcode::IterNext,
    ];

    pub fn from_byte(byte: u8) -> Option<Opcode> {
        Self::ALL.get(byte as usize).copied()
    }

    pub fn byte(self) -> u8 {
        self as u8
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Nop => "Nop",
            Opcode::PopC => "PopC",
            Opcode::PopR => "PopR",
            Opcode::Dup => "Dup",
            Opcode::Null => "Null",
            Opcode::True => "True",
            Opcode::False => "False",
            Opcode::Int => "Int",
            Opcode::Double => "Double",
            Opcode::String => "String",
            Opcode::Add => "Add",
            Opcode::Sub => "Sub",
            Opcode::Concat => "Concat",
            Opcode::Not => "Not",
            Opcode::Print => "Print",
            Opcode::Jmp => "Jmp",
            Opcode::JmpZ => "JmpZ",
            Opcode::JmpNZ => "JmpNZ",
            Opcode::Switch => "Switch",
            Opcode::SSwitch => "SSwitch",
            Opcode::RetC => "RetC",
            Opcode::Throw => "Throw",
            Opcode::Unwind => "Unwind",
            Opcode::Catch => "Catch",
            Opcode::CGetL => "CGetL",
            Opcode::SetL => "SetL",
            Opcode::FPushFuncD => "FPushFuncD",
            Opcode::FPassC => "FPassC",
            Opcode::FPassCE => "FPassCE",
            Opcode::FCall => "FCall",
            Opcode::IterInit => "IterInit",
            Opcode::IterNext => "IterNext",
        }
    }

    /// Immediate layout following the opcode byte.
    pub fn immediates(self) -> &'static [ImmKind] {
        use ImmKind::*;
        match self {
            Opcode::Int => &[I64a],
            Opcode::Double => &[Da],
            Opcode::String => &[Sa],
            Opcode::Jmp | Opcode::JmpZ | Opcode::JmpNZ => &[Ba],
            Opcode::Switch => &[Bla],
            Opcode::SSwitch => &[Sla],
            Opcode::CGetL | Opcode::SetL => &[La],
            Opcode::FPushFuncD => &[Iva, Sa],
            Opcode::FPassC | Opcode::FPassCE | Opcode::FCall => &[Iva],
            Opcode::IterInit | Opcode::IterNext => &[Ia, Ba, La],
            _ => &[],
        }
    }

    pub fn is_branch(self) -> bool {
        self.immediates()
            .iter()
            .any(|k| matches!(k, ImmKind::Ba | ImmKind::Bla | ImmKind::Sla))
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

// =============================================================================
// DECODING
// =============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("unknown opcode byte {byte:#04x} at offset {offset}")]
    UnknownOpcode { byte: u8, offset: Offset },

    #[error("instruction at offset {offset} runs past the end of the code")]
    Truncated { offset: Offset },

    #[error("negative vector length {len} at offset {offset}")]
    BadVectorLength { len: i32, offset: Offset },
}

/// A decoded immediate operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Imm {
    Iva(u32),
    Local(u32),
    Iter(u32),
    Str(u32),
    I64(i64),
    F64(f64),
    Branch(i32),
    BranchTable(Vec<i32>),
    StrBranchTable(Vec<(u32, i32)>),
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    pub offset: Offset,
    pub op: Opcode,
    pub imms: Vec<Imm>,
    pub len: u32,
}

impl Instr {
    pub fn next_offset(&self) -> Offset {
        self.offset + self.len
    }

    /// Absolute offsets this instruction may branch to, in immediate order.
    pub fn branch_targets(&self) -> Vec<Offset> {
        let abs = |rel: i32| (self.offset as i64 + rel as i64) as Offset;
        let mut targets = Vec::new();
        for imm in &self.imms {
            match imm {
                Imm::Branch(rel) => targets.push(abs(*rel)),
                Imm::BranchTable(rels) => targets.extend(rels.iter().map(|r| abs(*r))),
                Imm::StrBranchTable(pairs) => targets.extend(pairs.iter().map(|(_, r)| abs(*r))),
                _ => {}
            }
        }
        targets
    }

    /// Integer-valued immediate at `index` (counts, ids).
    pub fn u32_imm(&self, index: usize) -> Option<u32> {
        match self.imms.get(index)? {
            Imm::Iva(v) | Imm::Local(v) | Imm::Iter(v) | Imm::Str(v) => Some(*v),
            _ => None,
        }
    }
}

struct Cursor<'a> {
    code: &'a [u8],
    pos: usize,
    start: Offset,
}

impl<'a> Cursor<'a> {
    fn bytes<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let end = self.pos + N;
        let slice = self
            .code
            .get(self.pos..end)
            .ok_or(DecodeError::Truncated { offset: self.start })?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.bytes::<1>()?[0])
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.bytes()?))
    }

    fn iva(&mut self) -> Result<u32, DecodeError> {
        let first = self.u8()?;
        if first & 0x80 == 0 {
            return Ok(first as u32);
        }
        let rest = self.bytes::<3>()?;
        Ok(u32::from_be_bytes([first & 0x7f, rest[0], rest[1], rest[2]]))
    }

    fn vec_len(&mut self) -> Result<usize, DecodeError> {
        let len = self.i32()?;
        if len < 0 {
            return Err(DecodeError::BadVectorLength {
                len,
                offset: self.start,
            });
        }
        Ok(len as usize)
    }
}

/// Decode the instruction starting at `offset` within `code`.
pub fn decode(code: &[u8], offset: Offset) -> Result<Instr, DecodeError> {
    let mut cur = Cursor {
        code,
        pos: offset as usize,
        start: offset,
    };
    let byte = cur.u8()?;
    let op = Opcode::from_byte(byte).ok_or(DecodeError::UnknownOpcode { byte, offset })?;

    let mut imms = Vec::with_capacity(op.immediates().len());
    for kind in op.immediates() {
        let imm = match kind {
            ImmKind::Iva => Imm::Iva(cur.iva()?),
            ImmKind::La => Imm::Local(cur.iva()?),
            ImmKind::Ia => Imm::Iter(cur.iva()?),
            ImmKind::Sa => Imm::Str(cur.i32()? as u32),
            ImmKind::I64a => Imm::I64(i64::from_le_bytes(cur.bytes()?)),
            ImmKind::Da => Imm::F64(f64::from_le_bytes(cur.bytes()?)),
            ImmKind::Ba => Imm::Branch(cur.i32()?),
            ImmKind::Bla => {
                let len = cur.vec_len()?;
                let mut rels = Vec::with_capacity(len);
                for _ in 0..len {
                    rels.push(cur.i32()?);
                }
                Imm::BranchTable(rels)
            }
            ImmKind::Sla => {
                let len = cur.vec_len()?;
                let mut pairs = Vec::with_capacity(len);
                for _ in 0..len {
                    let id = cur.i32()? as u32;
                    pairs.push((id, cur.i32()?));
                }
                Imm::StrBranchTable(pairs)
            }
        };
        imms.push(imm);
    }

    Ok(Instr {
        offset,
        op,
        imms,
        len: (cur.pos - offset as usize) as u32,
    })
}

/// Append `value` in IVA encoding.
///
/// # Panics
///
/// Panics if `value` does not fit in 31 bits.
pub fn encode_iva(out: &mut Vec<u8>, value: u32) {
    if value < 0x80 {
        out.push(value as u8);
    } else {
        assert!(value < 0x8000_0000, "IVA immediate out of range: {}", value);
        let mut bytes = value.to_be_bytes();
        bytes[0] |= 0x80;
        out.extend_from_slice(&bytes);
    }
}

/// Decode instructions from `base` up to (not including) `past`.
pub struct InstrIter<'a> {
    code: &'a [u8],
    pos: Offset,
    past: Offset,
}

impl<'a> InstrIter<'a> {
    pub fn new(code: &'a [u8], base: Offset, past: Offset) -> Self {
        Self {
            code,
            pos: base,
            past,
        }
    }
}

impl Iterator for InstrIter<'_> {
    type Item = Result<Instr, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.past {
            return None;
        }
        match decode(self.code, self.pos) {
            Ok(instr) => {
                self.pos = instr.next_offset();
                Some(Ok(instr))
            }
            Err(e) => {
                // stop after the first error
                self.pos = self.past;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iva_bytes(v: u32) -> Vec<u8> {
        let mut out = Vec::new();
        encode_iva(&mut out, v);
        out
    }

    #[test]
    fn test_opcode_bytes_match_table() {
        for (i, op) in Opcode::ALL.iter().enumerate() {
            assert_eq!(op.byte() as usize, i, "{} out of order", op);
            assert_eq!(Opcode::from_byte(i as u8), Some(*op));
        }
        assert_eq!(Opcode::from_byte(Opcode::ALL.len() as u8), None);
    }

    #[test]
    fn test_iva_short_and_long_forms() {
        assert_eq!(iva_bytes(5), vec![5]);
        assert_eq!(iva_bytes(0x7f), vec![0x7f]);
        assert_eq!(iva_bytes(0x80), vec![0x80, 0x00, 0x00, 0x80]);

        let mut code = vec![Opcode::FPassC.byte()];
        code.extend(iva_bytes(300));
        let instr = decode(&code, 0).unwrap();
        assert_eq!(instr.imms, vec![Imm::Iva(300)]);
        assert_eq!(instr.len, 5);
    }

    #[test]
    fn test_decode_int() {
        let mut code = vec![Opcode::Int.byte()];
        code.extend_from_slice(&(-7i64).to_le_bytes());
        let instr = decode(&code, 0).unwrap();
        assert_eq!(instr.op, Opcode::Int);
        assert_eq!(instr.imms, vec![Imm::I64(-7)]);
        assert_eq!(instr.next_offset(), 9);
    }

    #[test]
    fn test_branch_targets_are_absolute() {
        // padding so the jump sits at offset 3
        let mut code = vec![Opcode::Nop.byte(); 3];
        code.push(Opcode::Jmp.byte());
        code.extend_from_slice(&(-3i32).to_le_bytes());
        let instr = decode(&code, 3).unwrap();
        assert_eq!(instr.branch_targets(), vec![0]);
    }

    #[test]
    fn test_switch_targets() {
        let mut code = vec![Opcode::Switch.byte()];
        code.extend_from_slice(&3i32.to_le_bytes());
        for rel in [20i32, 30, 20] {
            code.extend_from_slice(&rel.to_le_bytes());
        }
        let instr = decode(&code, 0).unwrap();
        assert_eq!(instr.branch_targets(), vec![20, 30, 20]);
        assert!(instr.op.is_branch());
    }

    #[test]
    fn test_unknown_opcode() {
        let err = decode(&[0xff], 0).unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnknownOpcode {
                byte: 0xff,
                offset: 0
            }
        );
    }

    #[test]
    fn test_truncated_immediate() {
        let code = [Opcode::Int.byte(), 1, 2];
        assert_eq!(
            decode(&code, 0).unwrap_err(),
            DecodeError::Truncated { offset: 0 }
        );
    }

    #[test]
    fn test_iter_stops_after_error() {
        let code = [Opcode::Nop.byte(), 0xee, Opcode::Nop.byte()];
        let items: Vec<_> = InstrIter::new(&code, 0, code.len() as Offset).collect();
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
    }
}
