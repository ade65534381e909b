//! Syscfg NOR configuration block (component L). Ported from
//! `original_source/pkg/syscfg/syscfg.go`: a fixed header followed by a
//! flat array of 4-byte tag + 16-byte value entries. Unlike most of this
//! crate's formats, unknown tags are a hard parse error rather than
//! passed through -- the historical tool treats an unrecognized tag as a
//! sign the block isn't really syscfg data at all.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{self, Cursor, Read};

pub const HEADER_LEN: usize = 24;
const ENTRY_LEN: usize = 20;
const VALUE_LEN: usize = 16;

#[derive(thiserror::Error, Debug)]
pub enum SyscfgError {
    #[error("block shorter than the {HEADER_LEN}-byte syscfg header")]
    Truncated,
    #[error("unknown syscfg tag {0:?}")]
    UnknownTag([u8; 4]),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Tags the historical tool recognizes; anything else is a hard error.
/// Extend this list as new tags are confirmed against real dumps rather
/// than guessed.
const KNOWN_TAGS: &[&[u8; 4]] = &[b"Shdw", b"SrNm", b"Mdl#", b"FCCI", b"HwVr", b"Regn", b"Lcod"];

#[derive(Debug, Clone)]
pub struct Entry {
    pub tag: [u8; 4],
    pub value: [u8; VALUE_LEN],
}

#[derive(Debug, Clone)]
pub struct SyscfgBlock {
    pub tag: [u8; 4],
    pub size: u32,
    pub unk1: u32,
    pub unk2: u32,
    pub unk3: u32,
    pub entries: Vec<Entry>,
}

impl SyscfgBlock {
    pub fn parse(data: &[u8]) -> Result<SyscfgBlock, SyscfgError> {
        if data.len() < HEADER_LEN {
            return Err(SyscfgError::Truncated);
        }
        let mut cur = Cursor::new(data);
        let mut tag = [0u8; 4];
        cur.read_exact(&mut tag)?;
        let size = cur.read_u32::<LittleEndian>()?;
        let unk1 = cur.read_u32::<LittleEndian>()?;
        let unk2 = cur.read_u32::<LittleEndian>()?;
        let unk3 = cur.read_u32::<LittleEndian>()?;
        let num_kvs = cur.read_u32::<LittleEndian>()?;

        if data.len() < HEADER_LEN + num_kvs as usize * ENTRY_LEN {
            return Err(SyscfgError::Truncated);
        }

        let mut entries = Vec::with_capacity(num_kvs as usize);
        for _ in 0..num_kvs {
            let mut entry_tag = [0u8; 4];
            cur.read_exact(&mut entry_tag)?;
            if !KNOWN_TAGS.iter().any(|known| **known == entry_tag) {
                return Err(SyscfgError::UnknownTag(entry_tag));
            }
            let mut value = [0u8; VALUE_LEN];
            cur.read_exact(&mut value)?;
            entries.push(Entry { tag: entry_tag, value });
        }

        Ok(SyscfgBlock { tag, size, unk1, unk2, unk3, entries })
    }

    pub fn get(&self, tag: &[u8; 4]) -> Option<&Entry> {
        self.entries.iter().find(|e| &e.tag == tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    fn sample_bytes(entries: &[([u8; 4], [u8; 16])]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"SCfg");
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(entries.len() as u32).unwrap();
        for (tag, value) in entries {
            out.extend_from_slice(tag);
            out.extend_from_slice(value);
        }
        out
    }

    #[test]
    fn parses_known_tags() {
        let bytes = sample_bytes(&[(*b"SrNm", [7u8; 16])]);
        let block = SyscfgBlock::parse(&bytes).unwrap();
        assert_eq!(block.entries.len(), 1);
        assert_eq!(block.get(b"SrNm").unwrap().value, [7u8; 16]);
    }

    #[test]
    fn unknown_tag_is_a_hard_error() {
        let bytes = sample_bytes(&[(*b"????", [0u8; 16])]);
        assert!(matches!(SyscfgBlock::parse(&bytes), Err(SyscfgError::UnknownTag(_))));
    }

    #[test]
    fn truncated_block_is_rejected() {
        assert!(matches!(SyscfgBlock::parse(&[0u8; 4]), Err(SyscfgError::Truncated)));
    }
}
