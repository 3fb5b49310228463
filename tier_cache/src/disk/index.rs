use std::collections::HashMap;
use std::io::{Read, Write};

use crate::error::{CacheError, Result};
use crate::serialization::*;

const INDEX_FORMAT_VERSION: u8 = 1;

/// The index record for one block of the data file.
///
/// A `payload_size` of zero marks a freed block sitting on the free list,
/// available for reuse by any payload that fits in `block_size`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DiskElement {
    /// Byte offset of the block in the data file.
    pub position: u64,
    /// Allocated length of the block; never shrinks once allocated.
    pub block_size: u32,
    /// Valid bytes currently stored in the block.
    pub payload_size: u32,
    /// Absolute expiry instant in milliseconds; `u64::MAX` if eternal.
    pub expiry_time: u64,
}

impl DiskElement {
    fn serialize<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_u64(writer, self.position)?;
        write_u32(writer, self.block_size)?;
        write_u32(writer, self.payload_size)?;
        write_u64(writer, self.expiry_time)?;
        Ok(())
    }

    fn deserialize<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            position: read_u64(reader)?,
            block_size: read_u32(reader)?,
            payload_size: read_u32(reader)?,
            expiry_time: read_u64(reader)?,
        })
    }
}

/// The two structures persisted together in the index file: the key to
/// block mapping and the free list.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct DiskIndex {
    pub elements: HashMap<String, DiskElement>,
    pub free_space: Vec<DiskElement>,
}

impl DiskIndex {
    /// Serializes the elements map followed by the free list.
    pub fn serialize<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_u8(writer, INDEX_FORMAT_VERSION)?;
        write_u32(writer, self.elements.len() as u32)?;
        for (key, element) in &self.elements {
            write_bytes(writer, key.as_bytes())?;
            element.serialize(writer)?;
        }
        write_u32(writer, self.free_space.len() as u32)?;
        for free in &self.free_space {
            free.serialize(writer)?;
        }
        Ok(())
    }

    /// Reads an index back. Any failure here means the file is dirty or from
    /// a foreign version; the caller falls back to an empty index and
    /// discards the data file.
    pub fn deserialize<R: Read>(reader: &mut R) -> Result<Self> {
        let version = read_u8(reader)?;
        if version != INDEX_FORMAT_VERSION {
            return Err(CacheError::serialization(format!("unknown index format version {version}")));
        }
        let element_count = read_u32(reader)?;
        let mut elements = HashMap::with_capacity(element_count as usize);
        for _ in 0..element_count {
            let key = read_string(reader).map_err(CacheError::serialization)?;
            elements.insert(key, DiskElement::deserialize(reader)?);
        }
        let free_count = read_u32(reader)?;
        let mut free_space = Vec::with_capacity(free_count as usize);
        for _ in 0..free_count {
            free_space.push(DiskElement::deserialize(reader)?);
        }
        Ok(Self { elements, free_space })
    }
}
