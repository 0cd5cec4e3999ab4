//! Element kinds and packed typed element identifiers.
//!
//! A [`TypedElementId`] stores the element kind and its signed numeric id in a
//! single `u64`, so a column of typed ids sorts by kind first and then by id:
//!
//! ```text
//!  63 62 61 60 59  58 57 56  55                                   0
//! ┌─────┬─────┬───┬────────┬──────────────────────────────────────┐
//! │  0  │kind │sgn│   0    │              |element id|            │
//! └─────┴─────┴───┴────────┴──────────────────────────────────────┘
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const TYPE_SHIFT: u32 = 60;
const TYPE_MASK: u64 = 0b11;
const SIGN_MASK: u64 = 1 << 59;
const ID_MASK: u64 = (1 << 56) - 1;

/// Kind of a map element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    /// A point with coordinates.
    Node,
    /// An ordered list of node references.
    Way,
    /// An ordered list of typed members with roles.
    Relation,
}

impl ElementType {
    /// Returns the lowercase element name used in change documents.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Way => "way",
            Self::Relation => "relation",
        }
    }

    const fn type_num(self) -> u64 {
        match self {
            Self::Node => 0,
            Self::Way => 1,
            Self::Relation => 2,
        }
    }

    /// Parses an element name from raw bytes, as read from XML.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedElementType`] for any other name.
    pub fn from_bytes(name: &[u8]) -> Result<Self> {
        match name {
            b"node" => Ok(Self::Node),
            b"way" => Ok(Self::Way),
            b"relation" => Ok(Self::Relation),
            other => Err(Error::UnsupportedElementType {
                kind: String::from_utf8_lossy(other).into_owned(),
            }),
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ElementType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_bytes(s.as_bytes())
    }
}

/// Element kind and numeric id packed into one sortable integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypedElementId(u64);

impl TypedElementId {
    /// Packs an element kind and id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ElementIdOutOfRange`] if `|id|` does not fit in 56 bits.
    pub fn new(element_type: ElementType, id: i64) -> Result<Self> {
        let magnitude = id.unsigned_abs();
        if magnitude > ID_MASK {
            return Err(Error::ElementIdOutOfRange { id });
        }
        let signed = if id < 0 {
            magnitude | SIGN_MASK
        } else {
            magnitude
        };
        Ok(Self(signed | (element_type.type_num() << TYPE_SHIFT)))
    }

    /// Wraps an already packed value, as read back from storage.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the packed value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the element kind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedElementType`] if the kind bits are not a known kind.
    pub fn element_type(self) -> Result<ElementType> {
        match (self.0 >> TYPE_SHIFT) & TYPE_MASK {
            0 => Ok(ElementType::Node),
            1 => Ok(ElementType::Way),
            2 => Ok(ElementType::Relation),
            other => Err(Error::UnsupportedElementType {
                kind: format!("#{other}"),
            }),
        }
    }

    /// Returns the signed element id.
    #[must_use]
    pub const fn element_id(self) -> i64 {
        let magnitude = (self.0 & ID_MASK) as i64;
        if self.0 & SIGN_MASK != 0 {
            -magnitude
        } else {
            magnitude
        }
    }
}

impl fmt::Display for TypedElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.element_type() {
            Ok(kind) => write!(f, "{kind}/{}", self.element_id()),
            Err(_) => write!(f, "#{:#x}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_kind_into_high_bits() {
        let node = TypedElementId::new(ElementType::Node, 42).unwrap();
        let way = TypedElementId::new(ElementType::Way, 42).unwrap();
        let relation = TypedElementId::new(ElementType::Relation, 42).unwrap();

        assert_eq!(node.as_u64(), 42);
        assert_eq!(way.as_u64(), (1 << 60) | 42);
        assert_eq!(relation.as_u64(), (2 << 60) | 42);
        assert!(node < way && way < relation);
    }

    #[test]
    fn unpacks_kind_and_signed_id() {
        let id = TypedElementId::new(ElementType::Way, -17).unwrap();
        assert_eq!(id.element_type().unwrap(), ElementType::Way);
        assert_eq!(id.element_id(), -17);
        assert_eq!(id.to_string(), "way/-17");
    }

    #[test]
    fn rejects_ids_wider_than_56_bits() {
        let err = TypedElementId::new(ElementType::Node, 1 << 56).unwrap_err();
        assert!(matches!(err, Error::ElementIdOutOfRange { .. }));
        assert!(TypedElementId::new(ElementType::Node, (1 << 56) - 1).is_ok());
    }

    #[test]
    fn unknown_element_names_are_rejected() {
        let err = ElementType::from_bytes(b"area").unwrap_err();
        assert!(err.to_string().contains("area"));
    }
}
