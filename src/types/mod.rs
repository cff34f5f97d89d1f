#![forbid(unsafe_code)]
//! Identifier newtypes, the crate error type, and the on-disk object header.

use std::fmt;

/// Checksum helpers for on-disk objects.
pub mod checksum;

/// Virtual or physical object identifier as stored in object headers and tree values.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Oid(pub u64);
/// Transaction identifier; selects the object-map entry valid at a point in time.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Xid(pub u64);
/// Physical block address on the underlying device.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Paddr(pub u64);

/// Errors surfaced by block sources, node decoding and tree traversal.
#[derive(thiserror::Error, Debug)]
pub enum ApfsError {
    /// Underlying block read failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// On-disk structure is inconsistent with itself or with the block size.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller violated an API precondition.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Object could not be resolved.
    #[error("not found")]
    NotFound,
    /// Stored Fletcher-64 checksum does not match the block contents.
    #[error("checksum mismatch in block {paddr}")]
    Checksum {
        /// Address the block was read from.
        paddr: Paddr,
    },
    /// Block carries an object type other than the one the reader expected.
    #[error("unexpected object type {found:#x} in block {paddr} (expected {expected})")]
    UnexpectedObject {
        /// Address the block was read from.
        paddr: Paddr,
        /// Human readable name of the expected object kind.
        expected: &'static str,
        /// Raw `o_type` value found in the header.
        found: u32,
    },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ApfsError>;

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Paddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for Oid {
    fn from(value: u64) -> Self {
        Oid(value)
    }
}

impl From<u64> for Xid {
    fn from(value: u64) -> Self {
        Xid(value)
    }
}

impl From<u64> for Paddr {
    fn from(value: u64) -> Self {
        Paddr(value)
    }
}

pub mod object {
    //! The 32-byte `obj_phys_t` header that prefixes every on-disk object.

    use core::convert::TryInto;

    use super::{ApfsError, Oid, Result, Xid};

    /// Length of the object header.
    pub const OBJ_HDR_LEN: usize = 32;

    pub mod header {
        //! Byte offsets for fixed header fields.
        use core::ops::Range;

        /// Stored checksum.
        pub const CKSUM: Range<usize> = 0..8;
        /// Object id.
        pub const OID: Range<usize> = 8..16;
        /// Transaction id.
        pub const XID: Range<usize> = 16..24;
        /// Type and storage flags.
        pub const TYPE: Range<usize> = 24..28;
        /// Subtype.
        pub const SUBTYPE: Range<usize> = 28..32;
    }

    /// Mask selecting the object type from `o_type`.
    pub const OBJECT_TYPE_MASK: u32 = 0x0000_ffff;
    /// Mask selecting the storage flags from `o_type`.
    pub const OBJECT_TYPE_FLAGS_MASK: u32 = 0xffff_0000;
    /// Object is addressed physically.
    pub const OBJ_PHYSICAL: u32 = 0x4000_0000;
    /// Object lives in the ephemeral area.
    pub const OBJ_EPHEMERAL: u32 = 0x8000_0000;
    /// Virtual objects carry no storage flag.
    pub const OBJ_VIRTUAL: u32 = 0;

    /// Object kinds this crate reads.
    #[repr(u32)]
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum ObjectType {
        /// Root node of a B-tree.
        BTree = 0x2,
        /// Non-root node of a B-tree.
        BTreeNode = 0x3,
        /// Object map header.
        Omap = 0xb,
    }

    impl ObjectType {
        /// Returns the raw type value.
        pub const fn as_u32(self) -> u32 {
            self as u32
        }

        /// Extracts the type from a raw `o_type`, ignoring storage flags.
        pub fn from_raw(raw: u32) -> Option<Self> {
            match raw & OBJECT_TYPE_MASK {
                0x2 => Some(ObjectType::BTree),
                0x3 => Some(ObjectType::BTreeNode),
                0xb => Some(ObjectType::Omap),
                _ => None,
            }
        }
    }

    /// Decoded `obj_phys_t`.
    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct ObjectHeader {
        /// Fletcher-64 checksum over the rest of the block.
        pub cksum: u64,
        /// Object identifier.
        pub oid: Oid,
        /// Transaction that last modified the object.
        pub xid: Xid,
        /// Type and storage flags.
        pub o_type: u32,
        /// Subtype (for B-tree nodes: the kind of tree).
        pub o_subtype: u32,
    }

    impl ObjectHeader {
        /// Creates a header with a zero checksum.
        pub fn new(oid: Oid, xid: Xid, o_type: u32, o_subtype: u32) -> Self {
            Self {
                cksum: 0,
                oid,
                xid,
                o_type,
                o_subtype,
            }
        }

        /// Returns the object kind, if it is one this crate knows.
        pub fn object_type(&self) -> Option<ObjectType> {
            ObjectType::from_raw(self.o_type)
        }

        /// Returns the storage flags portion of `o_type`.
        pub fn storage_flags(&self) -> u32 {
            self.o_type & OBJECT_TYPE_FLAGS_MASK
        }

        /// Writes the header into the first 32 bytes of `dst`.
        pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
            if dst.len() < OBJ_HDR_LEN {
                return Err(ApfsError::Invalid("object header buffer too small"));
            }
            dst[header::CKSUM].copy_from_slice(&self.cksum.to_le_bytes());
            dst[header::OID].copy_from_slice(&self.oid.0.to_le_bytes());
            dst[header::XID].copy_from_slice(&self.xid.0.to_le_bytes());
            dst[header::TYPE].copy_from_slice(&self.o_type.to_le_bytes());
            dst[header::SUBTYPE].copy_from_slice(&self.o_subtype.to_le_bytes());
            Ok(())
        }

        /// Reads the header from the first 32 bytes of `src`.
        pub fn decode(src: &[u8]) -> Result<Self> {
            if src.len() < OBJ_HDR_LEN {
                return Err(ApfsError::Corruption("object header truncated"));
            }
            let cksum = u64::from_le_bytes(src[header::CKSUM].try_into().unwrap());
            let oid = u64::from_le_bytes(src[header::OID].try_into().unwrap());
            let xid = u64::from_le_bytes(src[header::XID].try_into().unwrap());
            let o_type = u32::from_le_bytes(src[header::TYPE].try_into().unwrap());
            let o_subtype = u32::from_le_bytes(src[header::SUBTYPE].try_into().unwrap());
            Ok(Self {
                cksum,
                oid: Oid(oid),
                xid: Xid(xid),
                o_type,
                o_subtype,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::object::{self, ObjectHeader, ObjectType};
    use super::{Oid, Xid};

    #[test]
    fn object_header_roundtrip() {
        let mut buf = [0u8; object::OBJ_HDR_LEN];
        let header = ObjectHeader::new(
            Oid(0x404),
            Xid(7),
            ObjectType::BTreeNode.as_u32() | object::OBJ_PHYSICAL,
            0xb,
        );
        header.encode(&mut buf).unwrap();
        let decoded = ObjectHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.object_type(), Some(ObjectType::BTreeNode));
        assert_eq!(decoded.storage_flags(), object::OBJ_PHYSICAL);
    }

    #[test]
    fn object_header_rejects_truncated_input() {
        assert!(ObjectHeader::decode(&[0u8; 16]).is_err());
    }

    #[test]
    fn object_type_ignores_storage_flags() {
        assert_eq!(
            ObjectType::from_raw(0x8000_0002),
            Some(ObjectType::BTree)
        );
        assert_eq!(ObjectType::from_raw(0x4000_0001), None);
    }
}
