//! Little-endian read/write helpers shared by the element and index byte
//! formats.

use std::io::{Read, Write};
use std::mem::size_of;

pub fn write_u8<W: Write>(writer: &mut W, v: u8) -> Result<(), std::io::Error> {
    writer.write_all(&[v])
}

pub fn write_u32<W: Write>(writer: &mut W, v: u32) -> Result<(), std::io::Error> {
    writer.write_all(&v.to_le_bytes())
}

pub fn write_u64<W: Write>(writer: &mut W, v: u64) -> Result<(), std::io::Error> {
    writer.write_all(&v.to_le_bytes())
}

/// Writes the length as a `u32` followed by the raw bytes.
pub fn write_bytes<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<(), std::io::Error> {
    write_u32(writer, bytes.len() as u32)?;
    writer.write_all(bytes)
}

pub fn read_u8<R: Read>(reader: &mut R) -> Result<u8, std::io::Error> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf[..])?;
    Ok(buf[0])
}

pub fn read_u32<R: Read>(reader: &mut R) -> Result<u32, std::io::Error> {
    let mut buf = [0u8; size_of::<u32>()];
    reader.read_exact(&mut buf[..])?;
    Ok(u32::from_le_bytes(buf))
}

pub fn read_u64<R: Read>(reader: &mut R) -> Result<u64, std::io::Error> {
    let mut buf = [0u8; size_of::<u64>()];
    reader.read_exact(&mut buf[..])?;
    Ok(u64::from_le_bytes(buf))
}

pub fn read_bytes<R: Read>(reader: &mut R) -> Result<Vec<u8>, std::io::Error> {
    let len = read_u32(reader)? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf[..])?;
    Ok(buf)
}

/// Reads a length-prefixed UTF-8 string.
pub fn read_string<R: Read>(reader: &mut R) -> Result<String, std::io::Error> {
    let bytes = read_bytes(reader)?;
    String::from_utf8(bytes).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
