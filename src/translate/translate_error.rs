use thiserror::Error;

use crate::unit::op::{DecodeError, Offset, Opcode};

/// Function and bytecode offset an error refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub func: String,
    pub offset: Offset,
}

impl Location {
    pub fn new(func: &str, offset: Offset) -> Self {
        Self {
            func: func.to_string(),
            offset,
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{:04}", self.func, self.offset)
    }
}

/// Translation failure. Every variant except `UnsupportedOpcode` means the
/// input unit breaks the bytecode's structural rules; `Codec` is I/O-side.
#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("{func}: {source}")]
    Decode {
        func: String,
        #[source]
        source: DecodeError,
    },

    #[error("{at}: stack underflow in {op}")]
    StackUnderflow { at: Location, op: Opcode },

    #[error("{at}: stack overflow in {op}, capacity is {capacity}")]
    StackOverflow {
        at: Location,
        op: Opcode,
        capacity: u32,
    },

    #[error("{at}: branch target {target} is outside the function")]
    UnresolvedTarget { at: Location, target: Offset },

    #[error("{at}: {op} without a pending call")]
    NoPendingCall { at: Location, op: Opcode },

    #[error("{at}: call to undefined function '{callee}'")]
    UnknownCallee { at: Location, callee: String },

    #[error("{at}: FCall with {argc} arguments finishes a call to '{callee}' set up with {expected}")]
    ArgCountMismatch {
        at: Location,
        callee: String,
        argc: u32,
        expected: u32,
    },

    #[error("{at}: parameter {param} passed to '{callee}', which was set up with {argc} arguments")]
    BadParamId {
        at: Location,
        callee: String,
        param: u32,
        argc: u32,
    },

    #[error("{at}: call to '{callee}' finished after {passed} of {argc} arguments were passed")]
    UnpassedArgs {
        at: Location,
        callee: String,
        passed: u32,
        argc: u32,
    },

    #[error("{at}: call to '{callee}' still pending at end of function")]
    UnfinishedCall { at: Location, callee: String },

    #[error("{at}: unknown string id {id}")]
    BadStringId { at: Location, id: u32 },

    #[error("{at}: unknown local id {id}")]
    BadLocalId { at: Location, id: u32 },

    #[error("{at}: {op} is missing its immediate")]
    MalformedInstr { at: Location, op: Opcode },

    #[error("{at}: unsupported opcode {op}")]
    UnsupportedOpcode { at: Location, op: Opcode },

    #[error("unit '{0}' has no pseudo-main function")]
    MissingMain(String),

    #[error("function '{0}' is defined more than once")]
    DuplicateFunction(String),

    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),
}

impl TranslateError {
    pub fn decode(func: &str, source: DecodeError) -> Self {
        TranslateError::Decode {
            func: func.to_string(),
            source,
        }
    }

    /// Location the error refers to, if it has one.
    pub fn location(&self) -> Option<&Location> {
        match self {
            TranslateError::StackUnderflow { at, .. }
            | TranslateError::StackOverflow { at, .. }
            | TranslateError::UnresolvedTarget { at, .. }
            | TranslateError::NoPendingCall { at, .. }
            | TranslateError::UnknownCallee { at, .. }
            | TranslateError::ArgCountMismatch { at, .. }
            | TranslateError::BadParamId { at, .. }
            | TranslateError::UnpassedArgs { at, .. }
            | TranslateError::UnfinishedCall { at, .. }
            | TranslateError::BadStringId { at, .. }
            | TranslateError::BadLocalId { at, .. }
            | TranslateError::MalformedInstr { at, .. }
            | TranslateError::UnsupportedOpcode { at, .. } => Some(at),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_display() {
        assert_eq!(Location::new("foo", 7).to_string(), "foo@0007");
    }

    #[test]
    fn test_underflow_display() {
        let err = TranslateError::StackUnderflow {
            at: Location::new("f", 12),
            op: Opcode::PopC,
        };
        let msg = err.to_string();
        assert!(msg.contains("f@0012"));
        assert!(msg.contains("underflow"));
        assert!(msg.contains("PopC"));
    }

    #[test]
    fn test_unknown_callee_display() {
        let err = TranslateError::UnknownCallee {
            at: Location::new("main", 3),
            callee: "nope".to_string(),
        };
        assert!(err.to_string().contains("'nope'"));
        assert_eq!(err.location(), Some(&Location::new("main", 3)));
    }

    #[test]
    fn test_malformed_instr_display() {
        let err = TranslateError::MalformedInstr {
            at: Location::new("f", 2),
            op: Opcode::Int,
        };
        assert_eq!(err.to_string(), "f@0002: Int is missing its immediate");
        assert!(err.location().is_some());
    }

    #[test]
    fn test_decode_error_keeps_source() {
        let err = TranslateError::decode("g", DecodeError::Truncated { offset: 4 });
        assert!(err.to_string().starts_with("g: "));
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.location().is_none());
    }

    #[test]
    fn test_unit_level_errors() {
        assert!(
            TranslateError::MissingMain("a.php".to_string())
                .to_string()
                .contains("a.php")
        );
        assert!(
            TranslateError::DuplicateFunction("f".to_string())
                .to_string()
                .contains("more than once")
        );
    }
}
