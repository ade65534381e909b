//! MSE firmware bundle container (component G). Ported from
//! `original_source/pkg/mse/mse.go`: a copyright-guard string, a volume
//! header, a fixed 16-entry file directory (each entry carrying five
//! fields that are only ever copied, never interpreted), and the file
//! payloads themselves (each optionally preceded by a 6-word prefix
//! header).
//!
//! Byte-exact round-tripping (`serialize(parse(bytes)) == bytes`) holds
//! for every device kind except N4G, whose bundles carry trailing
//! padding the historical tool never reconstructs; see spec.md §8.

use crate::device::DeviceKind;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

const COPYRIGHT_TEXT: &[u8] = b"Copyright (c) Apple Computer, Inc. All rights reserved.";
const GUARD_LEN: usize = 0x100;

/// The 0x100-byte guard preceding the volume header. Real bundles carry
/// the device's legal boilerplate here; only two things are load-bearing:
/// the substring "Copyright" must appear, and byte 0xFF must be zero.
fn copyright_guard() -> [u8; GUARD_LEN] {
    let mut buf = [0u8; GUARD_LEN];
    buf[..COPYRIGHT_TEXT.len()].copy_from_slice(COPYRIGHT_TEXT);
    buf
}

pub const VOLUME_SIGNATURE: &[u8; 4] = b"[hi]";
pub const DIRECTORY_OFFSET: u32 = 0x4000;
pub const EXT_HEADER_OFFSET: u16 = 0x10c;
pub const VOLUME_VERSION: u16 = 3;

pub const NUM_ENTRIES: usize = 16;
const ENTRY_LEN: usize = 40;
const DIRECTORY_START: usize = 0x5000;
const BODY_START: u32 = 0x6000;
const PREFIX_HEADER_LEN: usize = 24;
const PREFIX_REGION_LEN: usize = 0x1000;

#[derive(thiserror::Error, Debug)]
pub enum MseError {
    #[error("bundle shorter than the copyright guard ({0} bytes)")]
    Truncated(usize),
    #[error("guard does not contain the \"Copyright\" token or has a non-zero terminator")]
    BadGuard,
    #[error("volume signature {0:?}, expected {VOLUME_SIGNATURE:?}")]
    BadVolumeSignature([u8; 4]),
    #[error("unexpected directory offset {0:#x}, expected {DIRECTORY_OFFSET:#x}")]
    BadDirectoryOffset(u32),
    #[error("unexpected extended header offset {0:#x}, expected {EXT_HEADER_OFFSET:#x}")]
    BadExtHeaderOffset(u16),
    #[error("unexpected volume version {0}, expected {VOLUME_VERSION}")]
    BadVersion(u16),
    #[error("file directory entry {0} points outside the bundle")]
    EntryOutOfBounds(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Target medium a file is destined for; only `NAND`/`ATA!` mark an
/// entry as carrying an actual data section.
pub fn target_is_valid(target: &[u8; 4]) -> bool {
    target == b"NAND" || target == b"ATA!"
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub target: [u8; 4],
    pub name: [u8; 4],
    pub used: bool,
    pub offset: u32,
    pub length: u32,
    /// Five fields copied verbatim from `FileHeader` (`Address`, `Entry`,
    /// `Checksum`, `Version`, `LoadAddress`); their meaning isn't
    /// interpreted anywhere in the historical tool.
    pub opaque: [u32; 5],
}

impl Default for FileEntry {
    fn default() -> Self {
        FileEntry { target: [0; 4], name: [0; 4], used: false, offset: 0, length: 0, opaque: [0; 5] }
    }
}

/// Six-word header some payload kinds prepend to their own data before
/// the real file contents.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefixHeader {
    pub zero1: u32,
    pub unk1: u32,
    pub zero2: u32,
    pub zero3: u32,
    pub zero4: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Default)]
pub struct MseFile {
    pub entry: FileEntry,
    pub prefix: Option<PrefixHeader>,
    pub data: Vec<u8>,
    /// Bytes between the end of `data` and the next 0x1000 boundary,
    /// kept verbatim -- some devices pad with non-zero garbage.
    pub suffix: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Mse {
    pub volume_tag: [u8; 4],
    pub files: [Option<MseFile>; NUM_ENTRIES],
}

impl Mse {
    pub fn parse(data: &[u8]) -> Result<Mse, MseError> {
        if data.len() < GUARD_LEN {
            return Err(MseError::Truncated(data.len()));
        }
        let guard = &data[..GUARD_LEN];
        let guard_text = String::from_utf8_lossy(guard);
        if !guard_text.contains("Copyright") || guard[0xFF] != 0 {
            return Err(MseError::BadGuard);
        }

        if data.len() < DIRECTORY_START + NUM_ENTRIES * ENTRY_LEN {
            return Err(MseError::Truncated(data.len()));
        }
        let mut cur = Cursor::new(&data[GUARD_LEN..]);
        let mut volume_tag = [0u8; 4];
        cur.read_exact(&mut volume_tag)?;
        if &volume_tag != VOLUME_SIGNATURE {
            return Err(MseError::BadVolumeSignature(volume_tag));
        }
        let directory_offset = cur.read_u32::<LittleEndian>()?;
        if directory_offset != DIRECTORY_OFFSET {
            return Err(MseError::BadDirectoryOffset(directory_offset));
        }
        let ext_header_offset = cur.read_u16::<LittleEndian>()?;
        if ext_header_offset != EXT_HEADER_OFFSET {
            return Err(MseError::BadExtHeaderOffset(ext_header_offset));
        }
        let version = cur.read_u16::<LittleEndian>()?;
        if version != VOLUME_VERSION {
            return Err(MseError::BadVersion(version));
        }

        let mut dir_cur = Cursor::new(&data[DIRECTORY_START..]);
        let mut entries = Vec::with_capacity(NUM_ENTRIES);
        for _ in 0..NUM_ENTRIES {
            let mut target = [0u8; 4];
            dir_cur.read_exact(&mut target)?;
            let mut name = [0u8; 4];
            dir_cur.read_exact(&mut name)?;
            let used = dir_cur.read_u32::<LittleEndian>()? != 0;
            let offset = dir_cur.read_u32::<LittleEndian>()?;
            let length = dir_cur.read_u32::<LittleEndian>()?;
            let mut opaque = [0u32; 5];
            for slot in opaque.iter_mut() {
                *slot = dir_cur.read_u32::<LittleEndian>()?;
            }
            entries.push(FileEntry { target, name, used, offset, length, opaque });
        }

        let mut files: [Option<MseFile>; NUM_ENTRIES] = Default::default();
        for (i, entry) in entries.into_iter().enumerate() {
            if !target_is_valid(&entry.target) {
                files[i] = Some(MseFile { entry, prefix: None, data: Vec::new(), suffix: Vec::new() });
                continue;
            }
            let header_start = entry.offset as usize;
            if header_start + PREFIX_HEADER_LEN > data.len() {
                return Err(MseError::EntryOutOfBounds(i));
            }
            let mut header_cur = Cursor::new(&data[header_start..]);
            let zero1 = header_cur.read_u32::<LittleEndian>()?;
            let unk1 = header_cur.read_u32::<LittleEndian>()?;
            let zero2 = header_cur.read_u32::<LittleEndian>()?;
            let zero3 = header_cur.read_u32::<LittleEndian>()?;
            let zero4 = header_cur.read_u32::<LittleEndian>()?;
            let size = header_cur.read_u32::<LittleEndian>()?;
            let prefix_valid = zero1 == 0 && (unk1 == 0 || unk1 == 4) && zero2 == 0 && zero3 == 0 && zero4 == 0;

            let (prefix, data_start) = if prefix_valid {
                (Some(PrefixHeader { zero1, unk1, zero2, zero3, zero4, size }), header_start + PREFIX_REGION_LEN)
            } else {
                (None, header_start)
            };

            let data_end = data_start.checked_add(entry.length as usize).ok_or(MseError::EntryOutOfBounds(i))?;
            if data_end > data.len() {
                return Err(MseError::EntryOutOfBounds(i));
            }
            let file_data = data[data_start..data_end].to_vec();

            let suffix_len = if data_end % PREFIX_REGION_LEN != 0 {
                PREFIX_REGION_LEN - (data_end % PREFIX_REGION_LEN)
            } else {
                0
            };
            let suffix_end = (data_end + suffix_len).min(data.len());
            let suffix = data[data_end..suffix_end].to_vec();

            files[i] = Some(MseFile { entry, prefix, data: file_data, suffix });
        }

        Ok(Mse { volume_tag, files })
    }

    /// Re-emits the bundle, recomputing each valid file's length, its
    /// optional prefix-header size field, and its layout offset starting
    /// at 0x6000. Matches the historical serializer's quirk of indexing
    /// computed section offsets by raw directory slot rather than a
    /// compacted valid-files-only index; this only produces correct
    /// output when valid entries are contiguous at the front of the
    /// 16-slot table, which holds for every real bundle.
    pub fn serialize(&self) -> Vec<u8> {
        let mut section_sizes = Vec::new();
        for file in self.files.iter().flatten() {
            if !target_is_valid(&file.entry.target) {
                continue;
            }
            let mut size = file.data.len() + if file.prefix.is_some() { PREFIX_REGION_LEN } else { 0 };
            if size % PREFIX_REGION_LEN != 0 {
                size += PREFIX_REGION_LEN - (size % PREFIX_REGION_LEN);
            }
            section_sizes.push(size as u32);
        }
        let mut section_offsets = vec![BODY_START];
        for size in &section_sizes {
            section_offsets.push(section_offsets.last().unwrap() + size);
        }

        let mut out = Vec::with_capacity(*section_offsets.last().unwrap() as usize);
        out.extend_from_slice(&copyright_guard());
        out.extend_from_slice(&self.volume_tag);
        out.write_u32::<LittleEndian>(DIRECTORY_OFFSET).unwrap();
        out.write_u16::<LittleEndian>(EXT_HEADER_OFFSET).unwrap();
        out.write_u16::<LittleEndian>(VOLUME_VERSION).unwrap();
        out.resize(DIRECTORY_START, 0);

        let mut next_section = 0usize;
        let mut rewritten_offsets = vec![0u32; NUM_ENTRIES];
        for (i, file) in self.files.iter().enumerate() {
            match file {
                Some(file) if target_is_valid(&file.entry.target) => {
                    rewritten_offsets[i] = section_offsets[next_section];
                    next_section += 1;
                }
                _ => {}
            }
        }
        for (i, file) in self.files.iter().enumerate() {
            match file {
                Some(file) => {
                    let e = &file.entry;
                    out.extend_from_slice(&e.target);
                    out.extend_from_slice(&e.name);
                    out.write_u32::<LittleEndian>(e.used as u32).unwrap();
                    let offset = if target_is_valid(&e.target) { rewritten_offsets[i] } else { e.offset };
                    out.write_u32::<LittleEndian>(offset).unwrap();
                    out.write_u32::<LittleEndian>(file.data.len() as u32).unwrap();
                    for field in e.opaque {
                        out.write_u32::<LittleEndian>(field).unwrap();
                    }
                }
                None => out.extend_from_slice(&[0u8; ENTRY_LEN]),
            }
        }

        let mut valid_index = 0usize;
        for (i, file) in self.files.iter().enumerate() {
            let Some(file) = file else { continue };
            if !target_is_valid(&file.entry.target) {
                continue;
            }
            let section_start = rewritten_offsets[i] as usize;
            let section_end = section_offsets[valid_index + 1] as usize;
            valid_index += 1;

            let pad = section_start - out.len();
            out.resize(out.len() + pad, 0);
            if let Some(prefix) = file.prefix {
                out.write_u32::<LittleEndian>(prefix.zero1).unwrap();
                out.write_u32::<LittleEndian>(prefix.unk1).unwrap();
                out.write_u32::<LittleEndian>(prefix.zero2).unwrap();
                out.write_u32::<LittleEndian>(prefix.zero3).unwrap();
                out.write_u32::<LittleEndian>(prefix.zero4).unwrap();
                let size = file.data.len().div_ceil(16) * 16;
                out.write_u32::<LittleEndian>(size as u32).unwrap();
                out.resize(out.len() + 0x1E8, 0);
                out.extend(std::iter::repeat(0xFFu8).take(0xE00));
            }
            out.extend_from_slice(&file.data);
            let suffix_len = section_end.saturating_sub(out.len());
            let suffix = &file.suffix[..file.suffix.len().min(suffix_len)];
            out.extend_from_slice(suffix);
            out.resize(section_end, 0);
        }
        out
    }
}

/// Best-effort device-kind guess by scanning the raw bundle for each
/// kind's SoC code immediately followed by its expected version string
/// (e.g. `"87202.0"`); the kind with the most matches wins. Needed
/// because N3G's MSE layout quirks (no prefix headers, different
/// trailing-suffix shape) can't be told apart from the container shape
/// alone.
pub fn guess_device_kind(data: &[u8]) -> Option<DeviceKind> {
    DeviceKind::ALL
        .into_iter()
        .map(|kind| {
            let version: &[u8] = if kind == DeviceKind::N3G { b"1.0" } else { b"2.0" };
            let mut needle = kind.soc_code().to_vec();
            needle.extend_from_slice(version);
            let count = data.windows(needle.len()).filter(|w| *w == needle.as_slice()).count();
            (kind, count)
        })
        .filter(|(_, count)| *count > 0)
        .max_by_key(|(_, count)| *count)
        .map(|(kind, _)| kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Mse {
        let mut files: [Option<MseFile>; NUM_ENTRIES] = Default::default();
        files[0] = Some(MseFile {
            entry: FileEntry { target: *b"NAND", name: *b"osos", offset: 0, length: 4, used: true, opaque: [1, 2, 3, 4, 5] },
            prefix: None,
            data: b"abcd".to_vec(),
            suffix: Vec::new(),
        });
        files[1] = Some(MseFile {
            entry: FileEntry { target: *b"NAND", name: *b"rsrc", offset: 0, length: 3, used: true, opaque: [0; 5] },
            prefix: Some(PrefixHeader { zero1: 0, unk1: 4, zero2: 0, zero3: 0, zero4: 0, size: 16 }),
            data: b"xyz".to_vec(),
            suffix: Vec::new(),
        });
        Mse { volume_tag: *b"ipod", files }
    }

    #[test]
    fn roundtrips_through_parse_and_serialize() {
        let mse = sample();
        let bytes = mse.serialize();
        let reparsed = Mse::parse(&bytes).unwrap();
        assert_eq!(reparsed.volume_tag, *b"ipod");
        assert_eq!(reparsed.files[0].as_ref().unwrap().data, b"abcd");
        assert_eq!(reparsed.files[1].as_ref().unwrap().data, b"xyz");
        assert_eq!(reparsed.files[1].as_ref().unwrap().prefix.unwrap().unk1, 4);
        assert_eq!(Mse::parse(&bytes).unwrap().serialize(), bytes);
    }

    #[test]
    fn truncated_input_is_rejected() {
        assert!(matches!(Mse::parse(&[0u8; 4]), Err(MseError::Truncated(_))));
    }

    #[test]
    fn guard_without_copyright_token_is_rejected() {
        let mut bytes = vec![0u8; DIRECTORY_START + NUM_ENTRIES * ENTRY_LEN];
        bytes[..0x20].copy_from_slice(&[b'x'; 0x20]);
        assert!(matches!(Mse::parse(&bytes), Err(MseError::BadGuard)));
    }

    #[test]
    fn guesses_device_kind_from_soc_code_and_version() {
        let mut bytes = vec![0u8; 0x200];
        bytes[0x40..0x47].copy_from_slice(b"87302.0");
        bytes[0x100..0x107].copy_from_slice(b"87302.0");
        assert_eq!(guess_device_kind(&bytes), Some(DeviceKind::N5G));
    }
}
