//! Single-file artifact container
//!
//! Layout (all integers little-endian):
//! ```text
//! "FCAR" | u16 version | u32 entry count | entries...
//! entry = u32 name length | name (UTF-8) | u32 data length | data
//! ```
//! Entries keep the order they were written in.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

use crate::errors::ArchiveError;

pub const ARCHIVE_MAGIC: &[u8; 4] = b"FCAR";
pub const ARCHIVE_VERSION: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub data: Vec<u8>,
}

impl ArchiveEntry {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// Length-prefixed `[u32 len][bytes]` frame
pub(crate) fn write_frame<W: Write>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "entry exceeds 4 GiB"))?;
    writer.write_u32::<LittleEndian>(len)?;
    writer.write_all(bytes)
}

pub fn write_archive(entries: &[ArchiveEntry]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    out.write_all(ARCHIVE_MAGIC)?;
    out.write_u16::<LittleEndian>(ARCHIVE_VERSION)?;
    let count = u32::try_from(entries.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many entries"))?;
    out.write_u32::<LittleEndian>(count)?;
    for entry in entries {
        write_frame(&mut out, entry.name.as_bytes())?;
        write_frame(&mut out, &entry.data)?;
    }
    Ok(out)
}

fn read_frame(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>, ArchiveError> {
    let len = cursor.read_u32::<LittleEndian>()? as u64;
    let remaining = cursor.get_ref().len() as u64 - cursor.position();
    if len > remaining {
        return Err(ArchiveError::Truncated(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("frame of {} bytes, {} left", len, remaining),
        )));
    }
    let mut buf = vec![0u8; len as usize];
    cursor.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_archive(bytes: &[u8]) -> Result<Vec<ArchiveEntry>, ArchiveError> {
    let mut cursor = Cursor::new(bytes);

    let mut magic = [0u8; 4];
    cursor.read_exact(&mut magic)?;
    if &magic != ARCHIVE_MAGIC {
        return Err(ArchiveError::BadMagic);
    }
    let version = cursor.read_u16::<LittleEndian>()?;
    if version != ARCHIVE_VERSION {
        return Err(ArchiveError::UnsupportedVersion(version));
    }

    let count = cursor.read_u32::<LittleEndian>()?;
    let mut entries = Vec::new();
    for _ in 0..count {
        let name = read_frame(&mut cursor)?;
        let name = String::from_utf8(name)
            .map_err(|e| ArchiveError::InvalidEntry(String::from_utf8_lossy(e.as_bytes()).into_owned()))?;
        let data = read_frame(&mut cursor)?;
        entries.push(ArchiveEntry { name, data });
    }
    Ok(entries)
}
