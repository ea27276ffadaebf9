use crate::ObjectIdBuilder;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

/// Identifies a byte payload by its content. Two byte-identical payloads always have the same id,
/// no matter which command produced them.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize, Default)]
pub struct ObjectId(pub u128);

impl ObjectId {
    pub const HASH_SIZE: usize = 16;

    pub const fn null() -> Self {
        ObjectId(0)
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Hash a complete buffer
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut builder = ObjectIdBuilder::new();
        builder.write(bytes);
        builder.compute_hash()
    }

    /// Order-dependent combination of two ids, `combine(a, b) != combine(b, a)` in general
    pub fn combine(
        left: ObjectId,
        right: ObjectId,
    ) -> Self {
        let mut builder = ObjectIdBuilder::new();
        builder.write(&left.as_bytes());
        builder.write(&right.as_bytes());
        builder.compute_hash()
    }

    pub fn as_bytes(&self) -> [u8; Self::HASH_SIZE] {
        self.0.to_be_bytes()
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }
}

impl Debug for ObjectId {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_tuple("ObjectId")
            .field(&format_args!("{:0>32x}", self.0))
            .finish()
    }
}

impl Display for ObjectId {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "{:0>32x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectIdParseError {
    InvalidLength(usize),
    InvalidDigit,
}

impl std::error::Error for ObjectIdParseError {}

impl Display for ObjectIdParseError {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        match *self {
            ObjectIdParseError::InvalidLength(length) => write!(
                f,
                "ObjectId must be {} hex digits, found {}",
                ObjectId::HASH_SIZE * 2,
                length
            ),
            ObjectIdParseError::InvalidDigit => f.write_str("ObjectId contains a non-hex character"),
        }
    }
}

impl FromStr for ObjectId {
    type Err = ObjectIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ObjectId::HASH_SIZE * 2 {
            return Err(ObjectIdParseError::InvalidLength(s.len()));
        }

        // from_str_radix accepts a leading '+', which is not valid here
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ObjectIdParseError::InvalidDigit);
        }

        u128::from_str_radix(s, 16)
            .map(ObjectId)
            .map_err(|_| ObjectIdParseError::InvalidDigit)
    }
}
