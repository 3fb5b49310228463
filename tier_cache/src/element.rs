use std::io::{Read, Write};
use std::mem::size_of;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{CacheError, Result};
use crate::serialization::*;

/// Version byte written ahead of every serialized element. Bumped whenever
/// the byte layout changes; readers reject unknown versions.
const ELEMENT_FORMAT_VERSION: u8 = 1;

/// Current wall clock in milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One cache entry: a key, an optional byte payload and the access
/// bookkeeping the expiry checks run on.
///
/// A `None` value marks an entry whose payload could not be materialized;
/// such entries always test as expired.
///
/// Access times start at zero and are only advanced by
/// [`update_access_statistics`](Element::update_access_statistics), so the
/// invariant `next_to_last_access_time <= last_access_time <= now` holds over
/// the element's whole history.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    key: String,
    value: Option<Vec<u8>>,
    creation_time: u64,
    last_access_time: u64,
    next_to_last_access_time: u64,
    hit_count: u64,
}

impl Element {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            creation_time: now_ms(),
            last_access_time: 0,
            next_to_last_access_time: 0,
            hit_count: 0,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Consumes the element, returning the payload if present.
    pub fn into_value(self) -> Option<Vec<u8>> {
        self.value
    }

    pub fn creation_time(&self) -> u64 {
        self.creation_time
    }

    pub fn last_access_time(&self) -> u64 {
        self.last_access_time
    }

    /// The access time one before the most recent one. Idle expiry is
    /// computed against this so that the probing read itself does not push
    /// the idle clock forward and mask staleness.
    pub fn next_to_last_access_time(&self) -> u64 {
        self.next_to_last_access_time
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count
    }

    /// Records a hit: shifts the last access time into the next-to-last slot
    /// and stamps the last access time with the current clock.
    pub fn update_access_statistics(&mut self) {
        self.next_to_last_access_time = self.last_access_time;
        self.last_access_time = now_ms();
        self.hit_count += 1;
    }

    /// Re-stamps the element as freshly created. Used when an element that
    /// was previously read out of a cache is put back in.
    pub fn reset_access_statistics(&mut self) {
        self.creation_time = now_ms();
        self.last_access_time = 0;
        self.next_to_last_access_time = 0;
        self.hit_count = 0;
    }

    /// The encoded byte length of this element.
    pub fn serialized_size(&self) -> usize {
        let value_len = self.value.as_ref().map(|v| size_of::<u32>() + v.len()).unwrap_or(0);
        2 * size_of::<u8>() + size_of::<u32>() + self.key.len() + value_len + 4 * size_of::<u64>()
    }

    pub fn serialize<W: Write>(&self, writer: &mut W) -> Result<usize> {
        write_u8(writer, ELEMENT_FORMAT_VERSION)?;
        write_u8(writer, self.value.is_some() as u8)?;
        write_bytes(writer, self.key.as_bytes())?;
        if let Some(value) = &self.value {
            write_bytes(writer, value)?;
        }
        write_u64(writer, self.creation_time)?;
        write_u64(writer, self.last_access_time)?;
        write_u64(writer, self.next_to_last_access_time)?;
        write_u64(writer, self.hit_count)?;
        Ok(self.serialized_size())
    }

    pub fn deserialize<R: Read>(reader: &mut R) -> Result<Self> {
        let version = read_u8(reader)?;
        if version != ELEMENT_FORMAT_VERSION {
            return Err(CacheError::serialization(format!("unknown element format version {version}")));
        }
        let has_value = read_u8(reader)? != 0;
        let key = read_string(reader).map_err(CacheError::serialization)?;
        let value = if has_value { Some(read_bytes(reader)?) } else { None };
        Ok(Self {
            key,
            value,
            creation_time: read_u64(reader)?,
            last_access_time: read_u64(reader)?,
            next_to_last_access_time: read_u64(reader)?,
            hit_count: read_u64(reader)?,
        })
    }
}
