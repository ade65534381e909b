//! Volume patching (component J). Ported from
//! `original_source/pkg/cfw/{cfw,fixup}.go`: a visitor walks every PE32
//! section of every file in a volume, and a patch describes a byte-exact
//! or offset-anchored replacement to apply to whichever section the
//! visitor selects.

use super::file::FileType;
use super::section::Section;
use super::{EfiError, Guid, Volume};

#[derive(thiserror::Error, Debug)]
pub enum PatchError {
    #[error("pattern not found in target section")]
    PatternNotFound,
    #[error("pattern found {0} times, expected exactly one match")]
    AmbiguousMatch(usize),
    #[error("patch at offset {offset:#x} (len {len}) extends past the section ({section_len} bytes)")]
    OutOfBounds { offset: usize, len: usize, section_len: usize },
    #[error("security-core padding file must shrink by {needed} bytes but only {available} are free")]
    InsufficientPadding { needed: usize, available: usize },
    #[error("no file with GUID {0} found in volume")]
    FileNotFound(Guid),
    #[error("file {0} contains more than one PE32 section")]
    AmbiguousPe32Section(Guid),
    #[error(transparent)]
    Efi(#[from] EfiError),
}

/// A single edit to apply to a PE32 section's bytes.
pub trait Patch {
    fn apply(&self, section: &mut Vec<u8>) -> Result<(), PatchError>;
}

/// Replaces the unique occurrence of `find` with `replace` (same length
/// or not); errors if the pattern doesn't appear exactly once.
pub struct ReplaceExact {
    pub find: Vec<u8>,
    pub replace: Vec<u8>,
}

impl Patch for ReplaceExact {
    fn apply(&self, section: &mut Vec<u8>) -> Result<(), PatchError> {
        let matches: Vec<usize> = section
            .windows(self.find.len().max(1))
            .enumerate()
            .filter(|(_, w)| *w == self.find.as_slice())
            .map(|(i, _)| i)
            .collect();
        match matches.len() {
            0 => Err(PatchError::PatternNotFound),
            1 => {
                let at = matches[0];
                section.splice(at..at + self.find.len(), self.replace.iter().copied());
                Ok(())
            }
            n => Err(PatchError::AmbiguousMatch(n)),
        }
    }
}

/// Overwrites `data` at a fixed `offset`, failing if it would run past
/// the end of the section.
pub struct PatchAt {
    pub offset: usize,
    pub data: Vec<u8>,
}

impl Patch for PatchAt {
    fn apply(&self, section: &mut Vec<u8>) -> Result<(), PatchError> {
        let end = self.offset + self.data.len();
        if end > section.len() {
            return Err(PatchError::OutOfBounds {
                offset: self.offset,
                len: self.data.len(),
                section_len: section.len(),
            });
        }
        section[self.offset..end].copy_from_slice(&self.data);
        Ok(())
    }
}

/// A named group of patches applied together, so a single "superdiags"
/// or "cfw" flow can be expressed as one `Patches` value.
pub struct Patches {
    pub label: String,
    pub patches: Vec<Box<dyn Patch>>,
}

impl Patch for Patches {
    fn apply(&self, section: &mut Vec<u8>) -> Result<(), PatchError> {
        for patch in &self.patches {
            patch.apply(section)?;
        }
        Ok(())
    }
}

/// Selects which PE32 sections a patch pass should touch.
pub trait VolumeVisitor {
    /// Called once per file before its sections are visited, so a
    /// visitor can track which file it's currently inside.
    fn visit_file(&mut self, _name: Guid) {}
    fn visit_pe32(&mut self, file_type: FileType, data: &mut Vec<u8>) -> Result<(), PatchError>;
}

/// Runs several visitors over the same volume in sequence.
pub struct MultipleVisitors(pub Vec<Box<dyn VolumeVisitor>>);

impl VolumeVisitor for MultipleVisitors {
    fn visit_file(&mut self, name: Guid) {
        for visitor in &mut self.0 {
            visitor.visit_file(name);
        }
    }

    fn visit_pe32(&mut self, file_type: FileType, data: &mut Vec<u8>) -> Result<(), PatchError> {
        for visitor in &mut self.0 {
            visitor.visit_pe32(file_type, data)?;
        }
        Ok(())
    }
}

/// Recursively walks every section of every file in `volume` (descending
/// into Compression/GUID-defined/nested-FV sections), calling
/// `visitor.visit_file` once per file and `visitor.visit_pe32` on each
/// PE32 leaf's raw bytes.
pub fn visit_pe32_in_file(volume: &mut Volume, visitor: &mut impl VolumeVisitor) -> Result<(), PatchError> {
    for file in &mut volume.files {
        visitor.visit_file(file.name);
        visit_sections(file.file_type, &mut file.sections, visitor)?;
    }
    Ok(())
}

fn visit_sections(
    file_type: FileType,
    sections: &mut [Section],
    visitor: &mut impl VolumeVisitor,
) -> Result<(), PatchError> {
    for section in sections {
        match section {
            Section::Pe32(data) => visitor.visit_pe32(file_type, data)?,
            Section::Compression { sections, .. } => visit_sections(file_type, sections, visitor)?,
            Section::GuidDefined { sections: Some(sections), .. } => {
                visit_sections(file_type, sections, visitor)?
            }
            Section::FirmwareVolumeImage(nested) => visit_pe32_in_file(nested, visitor)?,
            _ => {}
        }
    }
    Ok(())
}

/// Applies `patch` to the single PE32 section found inside the file
/// named `file_guid`, wherever in the file's section tree it lives.
/// Errors distinctly if the file's GUID never matches, or if it contains
/// more than one PE32 section.
pub struct VisitPe32InFile {
    pub file_guid: Guid,
    pub patch: Box<dyn Patch>,
    in_file: bool,
    applied: bool,
}

impl VisitPe32InFile {
    pub fn new(file_guid: Guid, patch: Box<dyn Patch>) -> Self {
        Self { file_guid, patch, in_file: false, applied: false }
    }

    /// Call after [`visit_pe32_in_file`] finishes walking the volume;
    /// mirrors the historical tool's `Done()` check.
    pub fn finish(&self) -> Result<(), PatchError> {
        if self.applied {
            Ok(())
        } else {
            Err(PatchError::FileNotFound(self.file_guid))
        }
    }
}

impl VolumeVisitor for VisitPe32InFile {
    fn visit_file(&mut self, name: Guid) {
        self.in_file = name.0 == self.file_guid.0;
    }

    fn visit_pe32(&mut self, _file_type: FileType, data: &mut Vec<u8>) -> Result<(), PatchError> {
        if !self.in_file {
            return Ok(());
        }
        if self.applied {
            return Err(PatchError::AmbiguousPe32Section(self.file_guid));
        }
        self.patch.apply(data)?;
        self.applied = true;
        Ok(())
    }
}

/// Applies a patch to every file of a given [`FileType`] in the volume.
pub struct ByFileType {
    pub file_type: FileType,
    pub patch: Box<dyn Patch>,
}

impl VolumeVisitor for ByFileType {
    fn visit_pe32(&mut self, file_type: FileType, data: &mut Vec<u8>) -> Result<(), PatchError> {
        if file_type == self.file_type {
            self.patch.apply(data)?;
        }
        Ok(())
    }
}

/// Finds the security-core padding file (a `Padding`-typed file that
/// immediately precedes the last file in the volume) so a patch that
/// changes total volume size can absorb the delta there, keeping every
/// later file's absolute offset unchanged.
pub fn secore_offset(volume: &Volume) -> Option<usize> {
    if volume.files.len() < 2 {
        return None;
    }
    let candidate = volume.files.len() - 2;
    if volume.files[candidate].file_type == FileType::Padding {
        Some(candidate)
    } else {
        None
    }
}

/// Resizes the padding file found by [`secore_offset`] by `delta` bytes
/// (negative: volume grew and padding must shrink; positive: volume
/// shrank and padding grows back to fill the gap). Fails if a shrink
/// would take the padding file negative.
pub fn secore_fixup(volume: &mut Volume, delta: i64) -> Result<(), PatchError> {
    let index = secore_offset(volume).ok_or(PatchError::PatternNotFound)?;
    let padding = &mut volume.files[index];
    let current_len = padding.padded_len();
    if delta < 0 {
        let shrink = (-delta) as usize;
        if shrink > current_len {
            return Err(PatchError::InsufficientPadding { needed: shrink, available: current_len });
        }
    }
    let new_len = (current_len as i64 + delta).max(0) as usize;
    padding.resize_padding_body(new_len);
    Ok(())
}
