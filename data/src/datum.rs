//! Element types exchanged on graph edges.
use std::fmt;

use crate::internal::*;

/// Element type of a tensor edge.
///
/// The numeric codes are the wire enumeration shared with the operator
/// providers. They are part of the external interface: keep them stable.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DatumType {
    F32,
    F64,
    F16,
    U8,
    I32,
    I8,
    I64,
    I16,
    U16,
    U32,
    U64,
}

impl DatumType {
    /// Wire code of this element type.
    pub fn code(&self) -> i32 {
        use DatumType::*;
        match self {
            F32 => 0,
            F64 => 1,
            F16 => 2,
            U8 => 3,
            I32 => 4,
            I8 => 5,
            I64 => 6,
            I16 => 7,
            U16 => 8,
            U32 => 9,
            U64 => 10,
        }
    }

    pub fn from_code(code: i32) -> GraftResult<DatumType> {
        use DatumType::*;
        Ok(match code {
            0 => F32,
            1 => F64,
            2 => F16,
            3 => U8,
            4 => I32,
            5 => I8,
            6 => I64,
            7 => I16,
            8 => U16,
            9 => U32,
            10 => U64,
            _ => bail!("unknown element type code {}", code),
        })
    }

    pub fn size_of(&self) -> usize {
        use DatumType::*;
        match self {
            U8 | I8 => 1,
            F16 | U16 | I16 => 2,
            F32 | U32 | I32 => 4,
            F64 | U64 | I64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DatumType::F16 | DatumType::F32 | DatumType::F64)
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, DatumType::I8 | DatumType::I16 | DatumType::I32 | DatumType::I64)
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(self, DatumType::U8 | DatumType::U16 | DatumType::U32 | DatumType::U64)
    }
}

impl TryFrom<i32> for DatumType {
    type Error = anyhow::Error;
    fn try_from(code: i32) -> GraftResult<DatumType> {
        DatumType::from_code(code)
    }
}

impl fmt::Display for DatumType {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", format!("{self:?}").to_lowercase())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codes_roundtrip() {
        for code in 0..=10 {
            assert_eq!(DatumType::from_code(code).unwrap().code(), code);
        }
        assert!(DatumType::from_code(11).is_err());
        assert!(DatumType::from_code(-1).is_err());
    }

    #[test]
    fn display() {
        assert_eq!(DatumType::F32.to_string(), "f32");
        assert_eq!(DatumType::U16.to_string(), "u16");
    }
}
