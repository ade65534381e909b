//! Firmware File Section (FFS) file header and body (component H).
//! Ported from `original_source/pkg/efi/file.go`.

use super::{checksum16, checksum8, EfiError, Guid, Section};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileType {
    Raw = 1,
    FreeForm = 2,
    SecurityCore = 3,
    PeiCore = 4,
    DxeCore = 5,
    PeimDriver = 6,
    Driver = 7,
    CombinedPeimDriver = 8,
    Application = 9,
    Smm = 10,
    FirmwareVolumeImage = 11,
    CombinedSmmDxe = 12,
    SmmCore = 13,
    Padding = 240,
}

impl FileType {
    fn from_u8(v: u8) -> FileType {
        use FileType::*;
        match v {
            1 => Raw,
            2 => FreeForm,
            3 => SecurityCore,
            4 => PeiCore,
            5 => DxeCore,
            6 => PeimDriver,
            7 => Driver,
            8 => CombinedPeimDriver,
            9 => Application,
            10 => Smm,
            11 => FirmwareVolumeImage,
            12 => CombinedSmmDxe,
            13 => SmmCore,
            _ => Padding,
        }
    }
}

const DATA_CHECKSUM_VALID: u8 = 0x40;
const HEADER_LEN: usize = 24;

#[derive(Debug, Clone)]
pub struct FirmwareFile {
    pub name: Guid,
    pub file_type: FileType,
    pub attributes: u8,
    pub sections: Vec<Section>,
    /// Raw section bytes as read, preserved so re-serialization doesn't
    /// need every section type to round-trip perfectly.
    raw_body: Vec<u8>,
}

impl FirmwareFile {
    pub fn read(data: &[u8]) -> Result<FirmwareFile, EfiError> {
        let name = Guid(data[0..16].try_into().unwrap());
        let header_checksum = data[17];
        let data_checksum = data[18];
        let file_type = FileType::from_u8(data[19]);
        let attributes = data[20];
        let size = u32::from(data[21]) | u32::from(data[22]) << 8 | u32::from(data[23]) << 16;

        let mut header_words = Vec::new();
        for chunk in data[0..HEADER_LEN].chunks_exact(2) {
            header_words.push(u16::from_le_bytes([chunk[0], chunk[1]]));
        }
        // the stored header checksum byte is part of the checksummed
        // range, so verifying needs it zeroed first.
        let mut zeroed_header = data[0..HEADER_LEN].to_vec();
        zeroed_header[16] = 0;
        zeroed_header[17] = 0;
        let mut zeroed_words = Vec::new();
        for chunk in zeroed_header.chunks_exact(2) {
            zeroed_words.push(u16::from_le_bytes([chunk[0], chunk[1]]));
        }
        if checksum16(&zeroed_words) & 0xFF != u16::from(header_checksum) {
            return Err(EfiError::BadFileChecksum(name));
        }

        let body = &data[HEADER_LEN..size as usize];
        if attributes & DATA_CHECKSUM_VALID != 0 && checksum8(body) != data_checksum {
            return Err(EfiError::BadDataChecksum(name));
        }

        let sections = if matches!(file_type, FileType::Padding) {
            Vec::new()
        } else {
            Section::read_all(body)?
        };

        Ok(FirmwareFile {
            name,
            file_type,
            attributes,
            sections,
            raw_body: body.to_vec(),
        })
    }

    /// Resizes a padding file's body in place (zero-filled), used by
    /// `patch::secore_fixup` to absorb a size delta elsewhere in the
    /// volume without moving any other file's absolute offset.
    pub fn resize_padding_body(&mut self, new_total_len: usize) {
        let new_body_len = new_total_len.saturating_sub(HEADER_LEN);
        self.raw_body.resize(new_body_len, 0);
    }

    /// Length including 8-byte alignment padding to the next file.
    pub fn padded_len(&self) -> usize {
        let len = HEADER_LEN + self.body_bytes().len();
        (len + 7) & !7
    }

    fn body_bytes(&self) -> Vec<u8> {
        if self.sections.is_empty() && matches!(self.file_type, FileType::Padding) {
            self.raw_body.clone()
        } else {
            Section::serialize_all(&self.sections)
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, EfiError> {
        let body = self.body_bytes();
        let size = HEADER_LEN + body.len();
        let mut out = Vec::with_capacity(size);
        self.name.write(&mut out)?;
        out.write_u16::<LittleEndian>(0xAA55)?; // IntegrityCheck.Checksum16 placeholder field (filled below)
        out.write_u8(self.file_type as u8)?;
        out.write_u8(self.attributes)?;
        out.write_u8((size & 0xFF) as u8)?;
        out.write_u8(((size >> 8) & 0xFF) as u8)?;
        out.write_u8(((size >> 16) & 0xFF) as u8)?;
        out.write_u8(0)?; // state, cleared in serialized output

        let data_checksum = if self.attributes & DATA_CHECKSUM_VALID != 0 {
            checksum8(&body)
        } else {
            0
        };

        let mut header = out[..HEADER_LEN].to_vec();
        header[16] = 0;
        header[17] = 0;
        header[18] = data_checksum;
        let mut words = Vec::new();
        for chunk in header.chunks_exact(2) {
            words.push(u16::from_le_bytes([chunk[0], chunk[1]]));
        }
        let header_checksum = (checksum16(&words) & 0xFF) as u8;
        out[17] = header_checksum;
        out[18] = data_checksum;

        out.extend_from_slice(&body);
        Ok(out)
    }
}

/// Builds the all-0xFF marker pattern used to detect the end of a file
/// directory list within a volume (component H helper).
pub fn is_end_of_files_marker(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == 0xFF)
}
