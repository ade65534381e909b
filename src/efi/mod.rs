//! EFI/UEFI Platform Init Firmware Volume (FV) container (component H).
//! Ported from `original_source/pkg/efi/{efi,volume}.go`.

pub mod compression;
pub mod file;
pub mod patch;
pub mod section;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{self, Cursor, Read, Write};

pub use file::{FileType, FirmwareFile};
pub use section::{Section, SectionType};

#[derive(thiserror::Error, Debug)]
pub enum EfiError {
    #[error("volume shorter than the {0}-byte firmware volume header")]
    Truncated(usize),
    #[error("bad firmware volume signature {0:?}, expected `_FVH`")]
    BadSignature([u8; 4]),
    #[error("firmware volume header checksum mismatch")]
    BadHeaderChecksum,
    #[error("firmware file header checksum mismatch for file {0}")]
    BadFileChecksum(Guid),
    #[error("firmware file data checksum mismatch for file {0}")]
    BadDataChecksum(Guid),
    #[error("section extends past its containing file")]
    SectionOutOfBounds,
    #[error(transparent)]
    Compression(#[from] compression::CompressionError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Mixed-endian 16-byte GUID, formatted the way EDK2 tooling prints one:
/// the first three fields are little-endian, the trailing 8 bytes are
/// printed as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    pub fn read(mut r: impl Read) -> io::Result<Guid> {
        let mut bytes = [0u8; 16];
        r.read_exact(&mut bytes)?;
        Ok(Guid(bytes))
    }

    pub fn write(&self, mut w: impl Write) -> io::Result<()> {
        w.write_all(&self.0)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // EFI GUIDs store their first three fields little-endian, which is
        // exactly `Uuid::from_bytes_le`'s layout, so formatting is just a
        // borrow of the `uuid` crate's canonical rendering.
        write!(f, "{}", uuid::Uuid::from_bytes_le(self.0))
    }
}

/// A reader bounded to `[start, start+len)` of an underlying byte slice,
/// tracking the global offset so nested sections can report absolute
/// positions in errors. Mirrors `pkg/efi`'s `NestedReader`.
pub struct NestedReader<'a> {
    data: &'a [u8],
    pub global_offset: usize,
    pos: usize,
}

impl<'a> NestedReader<'a> {
    pub fn new(data: &'a [u8], global_offset: usize) -> Self {
        Self { data, global_offset, pos: 0 }
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

impl<'a> Read for NestedReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = (&self.data[self.pos..]).read(buf)?;
        self.pos += n;
        Ok(n)
    }
}

/// Complement-to-zero 16-bit checksum over `words`: the byte this
/// function returns makes `words.iter().sum() == 0` in wrapping u16
/// arithmetic.
pub fn checksum16(words: &[u16]) -> u16 {
    0u16.wrapping_sub(words.iter().fold(0u16, |acc, w| acc.wrapping_add(*w)))
}

pub fn checksum8(bytes: &[u8]) -> u8 {
    0u8.wrapping_sub(bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)))
}

pub const FVH_SIGNATURE: &[u8; 4] = b"_FVH";
pub const HEADER_LEN: usize = 0x48 + 8; // fixed fields + one 2-entry block map terminator

#[derive(Debug, Clone)]
pub struct FirmwareVolumeHeader {
    pub zero_vector: [u8; 16],
    pub file_system_guid: Guid,
    pub volume_length: u64,
    pub attributes: u32,
    pub header_length: u16,
    pub checksum: u16,
    pub ext_header_offset: u16,
    pub revision: u8,
    /// (block_count, block_size) pairs, terminated by a (0, 0) entry.
    pub block_map: Vec<(u32, u32)>,
}

#[derive(Debug, Clone)]
pub struct Volume {
    pub header: FirmwareVolumeHeader,
    pub files: Vec<FirmwareFile>,
    /// Trailing bytes past the last file (0xFF padding plus any data the
    /// historical tool calls `Custom`), preserved for byte-exact output.
    pub trailing: Vec<u8>,
}

impl Volume {
    pub fn read(data: &[u8]) -> Result<Volume, EfiError> {
        if data.len() < 0x48 {
            return Err(EfiError::Truncated(0x48));
        }
        let mut cur = Cursor::new(data);
        let mut zero_vector = [0u8; 16];
        cur.read_exact(&mut zero_vector)?;
        let file_system_guid = Guid::read(&mut cur)?;
        let volume_length = cur.read_u64::<LittleEndian>()?;
        let mut signature = [0u8; 4];
        cur.read_exact(&mut signature)?;
        if &signature != FVH_SIGNATURE {
            return Err(EfiError::BadSignature(signature));
        }
        let attributes = cur.read_u32::<LittleEndian>()?;
        let header_length = cur.read_u16::<LittleEndian>()?;
        let checksum = cur.read_u16::<LittleEndian>()?;
        let ext_header_offset = cur.read_u16::<LittleEndian>()?;
        let _reserved = cur.read_u8()?;
        let revision = cur.read_u8()?;

        let mut block_map = Vec::new();
        loop {
            let count = cur.read_u32::<LittleEndian>()?;
            let size = cur.read_u32::<LittleEndian>()?;
            block_map.push((count, size));
            if count == 0 && size == 0 {
                break;
            }
        }

        let header_bytes = &data[..header_length as usize];
        let mut words = Vec::with_capacity(header_bytes.len() / 2);
        for chunk in header_bytes.chunks_exact(2) {
            words.push(u16::from_le_bytes([chunk[0], chunk[1]]));
        }
        if checksum16(&words) != 0 {
            return Err(EfiError::BadHeaderChecksum);
        }

        let mut offset = header_length as usize;
        let mut files = Vec::new();
        loop {
            if offset + 24 > data.len() {
                break;
            }
            if data[offset..offset + 16].iter().all(|&b| b == 0xFF) {
                break;
            }
            let file = FirmwareFile::read(&data[offset..])?;
            offset += file.padded_len();
            files.push(file);
        }
        let trailing = data[offset..].to_vec();

        Ok(Volume {
            header: FirmwareVolumeHeader {
                zero_vector,
                file_system_guid,
                volume_length,
                attributes,
                header_length,
                checksum,
                ext_header_offset,
                revision,
                block_map,
            },
            files,
            trailing,
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>, EfiError> {
        let mut header = Vec::new();
        header.extend_from_slice(&self.header.zero_vector);
        self.header.file_system_guid.write(&mut header)?;
        header.write_u64::<LittleEndian>(self.header.volume_length)?;
        header.extend_from_slice(FVH_SIGNATURE);
        header.write_u32::<LittleEndian>(self.header.attributes)?;
        header.write_u16::<LittleEndian>(self.header.header_length)?;
        let checksum_offset = header.len();
        header.write_u16::<LittleEndian>(0)?;
        header.write_u16::<LittleEndian>(self.header.ext_header_offset)?;
        header.write_u8(0)?;
        header.write_u8(self.header.revision)?;
        for (count, size) in &self.header.block_map {
            header.write_u32::<LittleEndian>(*count)?;
            header.write_u32::<LittleEndian>(*size)?;
        }
        header.resize(self.header.header_length as usize, 0);

        let mut words = Vec::with_capacity(header.len() / 2);
        for chunk in header.chunks_exact(2) {
            words.push(u16::from_le_bytes([chunk[0], chunk[1]]));
        }
        words[checksum_offset / 2] = 0;
        let checksum = checksum16(&words);
        header[checksum_offset..checksum_offset + 2].copy_from_slice(&checksum.to_le_bytes());

        let mut out = header;
        for file in &self.files {
            let serialized = file.serialize()?;
            out.extend_from_slice(&serialized);
            let padding = file.padded_len() - serialized.len();
            out.extend(std::iter::repeat(0xFFu8).take(padding));
        }
        out.extend_from_slice(&self.trailing);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum16_is_complement_to_zero() {
        let words = [0x1234u16, 0x5678, 0x9abc];
        let c = checksum16(&words);
        let sum = words.iter().fold(c, |acc, w| acc.wrapping_add(*w));
        assert_eq!(sum, 0);
    }

    #[test]
    fn checksum8_is_complement_to_zero() {
        let bytes = [1u8, 2, 3, 4, 250];
        let c = checksum8(&bytes);
        let sum = bytes.iter().fold(c, |acc, b| acc.wrapping_add(*b));
        assert_eq!(sum, 0);
    }

    #[test]
    fn guid_formats_mixed_endian() {
        let guid = Guid([
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
            0x0f, 0x10,
        ]);
        assert_eq!(guid.to_string(), "04030201-0605-0807-090a-0b0c0d0e0f10");
    }
}
