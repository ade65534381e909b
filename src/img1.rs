//! IMG1 fixed-header image container (component F). Ported from
//! `original_source/pkg/image/image.go`. The magic field is not a
//! constant: it is the connected device's four-ASCII-byte SoC code
//! (e.g. `8702`, `8720`), so reading an image also recovers its
//! [`DeviceKind`].

use crate::device::DeviceKind;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

pub const HEADER_LEN: usize = 0x50;

#[derive(thiserror::Error, Debug)]
pub enum Img1Error {
    #[error("magic {0:?} does not match any known device SoC code")]
    NotImage1([u8; 4]),
    #[error("image shorter than the {HEADER_LEN}-byte IMG1 header")]
    Truncated,
    #[error("unsupported version {0:?} for {1:?}")]
    UnsupportedVersion([u8; 3], DeviceKind),
    #[error("unknown format byte {0:#x}")]
    UnknownFormat(u8),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The four historical format codes, preserved verbatim from
/// `image.go`'s `Format{SignedEncrypted,Signed,X509SignedEncrypted,
/// X509Signed}` constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Format {
    SignedEncrypted = 1,
    Signed = 2,
    X509SignedEncrypted = 3,
    X509Signed = 4,
}

impl Format {
    fn from_u8(v: u8) -> Result<Format, Img1Error> {
        Ok(match v {
            1 => Format::SignedEncrypted,
            2 => Format::Signed,
            3 => Format::X509SignedEncrypted,
            4 => Format::X509Signed,
            other => return Err(Img1Error::UnknownFormat(other)),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Img1Header {
    pub version: [u8; 3],
    pub format: Format,
    pub entrypoint: u32,
    pub body_length: u32,
    pub data_length: u32,
    pub footer_cert_offset: u32,
    pub footer_cert_length: u32,
    pub salt: [u8; 32],
    pub unknown1: u16,
    pub security_epoch: u16,
    pub header_signature: [u8; 16],
}

/// N3G carries no unsigned signature/certificate trailer at all; every
/// later generation gets 0x80 bytes of signature and 0x300 of
/// certificate, per `image.go`'s `MakeUnsigned`.
fn sig_cert_lens(kind: DeviceKind) -> (usize, usize) {
    if kind == DeviceKind::N3G { (0, 0) } else { (0x80, 0x300) }
}

fn expected_version(kind: DeviceKind) -> &'static [u8; 3] {
    if kind == DeviceKind::N3G { b"1.0" } else { b"2.0" }
}

#[derive(Debug, Clone)]
pub struct Img1Image {
    pub kind: DeviceKind,
    pub header: Img1Header,
    pub body: Vec<u8>,
    pub signature: Vec<u8>,
    pub certificate: Vec<u8>,
}

impl Img1Image {
    pub fn read(data: &[u8]) -> Result<Img1Image, Img1Error> {
        if data.len() < HEADER_LEN {
            return Err(Img1Error::Truncated);
        }
        let mut cur = Cursor::new(data);
        let mut magic = [0u8; 4];
        cur.read_exact(&mut magic)?;
        let kind = DeviceKind::from_soc_code(&magic).ok_or(Img1Error::NotImage1(magic))?;

        let mut version = [0u8; 3];
        cur.read_exact(&mut version)?;
        if &version != expected_version(kind) {
            return Err(Img1Error::UnsupportedVersion(version, kind));
        }
        let format = Format::from_u8(cur.read_u8()?)?;
        let entrypoint = cur.read_u32::<LittleEndian>()?;
        let body_length = cur.read_u32::<LittleEndian>()?;
        let data_length = cur.read_u32::<LittleEndian>()?;
        let footer_cert_offset = cur.read_u32::<LittleEndian>()?;
        let footer_cert_length = cur.read_u32::<LittleEndian>()?;
        let mut salt = [0u8; 32];
        cur.read_exact(&mut salt)?;
        let unknown1 = cur.read_u16::<LittleEndian>()?;
        let security_epoch = cur.read_u16::<LittleEndian>()?;
        let mut header_signature = [0u8; 16];
        cur.read_exact(&mut header_signature)?;
        debug_assert_eq!(cur.position() as usize, HEADER_LEN);

        let header_region = kind.img1_header_region();
        let body_start = header_region.min(data.len());
        let body_end = (body_start + body_length as usize).min(data.len());
        let body = data[body_start..body_end].to_vec();

        let (sig_len, cert_len) = sig_cert_lens(kind);
        let sig_start = body_end;
        let sig_end = (sig_start + sig_len).min(data.len());
        let signature = data.get(sig_start..sig_end).unwrap_or(&[]).to_vec();
        let cert_start = sig_end;
        let cert_end = (cert_start + cert_len).min(data.len());
        let certificate = data.get(cert_start..cert_end).unwrap_or(&[]).to_vec();

        Ok(Img1Image {
            kind,
            header: Img1Header {
                version,
                format,
                entrypoint,
                body_length,
                data_length,
                footer_cert_offset,
                footer_cert_length,
                salt,
                unknown1,
                security_epoch,
                header_signature,
            },
            body,
            signature,
            certificate,
        })
    }

    /// Builds an image with the historical "make unsigned" transform
    /// used by `makedfu`/`decrypt` to repackage a firmware body under a
    /// header that the post-exploit resident loader accepts
    /// unconditionally: N3G gets `Format::Signed` with no trailer at
    /// all, every later generation gets `Format::X509Signed` with the
    /// usual 0x80+0x300 filler trailer.
    pub fn make_unsigned(kind: DeviceKind, entrypoint: u32, body: &[u8]) -> Img1Image {
        let mut padded_body = body.to_vec();
        let aligned = padded_body.len().div_ceil(16) * 16;
        padded_body.resize(aligned, 0);
        let (sig_len, cert_len) = sig_cert_lens(kind);
        let format = if kind == DeviceKind::N3G { Format::Signed } else { Format::X509Signed };
        let body_length = padded_body.len() as u32;
        let data_length = body_length + sig_len as u32 + cert_len as u32;
        Img1Image {
            kind,
            header: Img1Header {
                version: *expected_version(kind),
                format,
                entrypoint,
                body_length,
                data_length,
                footer_cert_offset: body_length + sig_len as u32,
                footer_cert_length: cert_len as u32,
                salt: [0u8; 32],
                unknown1: 0,
                security_epoch: 0,
                header_signature: [0u8; 16],
            },
            body: padded_body,
            signature: vec![b'S'; sig_len],
            certificate: vec![b'C'; cert_len],
        }
    }

    pub fn write(&self) -> Result<Vec<u8>, Img1Error> {
        let header_region = self.kind.img1_header_region();
        let mut out = Vec::with_capacity(
            header_region + self.body.len() + self.signature.len() + self.certificate.len(),
        );
        out.extend_from_slice(self.kind.soc_code());
        out.extend_from_slice(&self.header.version);
        out.write_u8(self.header.format as u8)?;
        out.write_u32::<LittleEndian>(self.header.entrypoint)?;
        out.write_u32::<LittleEndian>(self.header.body_length)?;
        out.write_u32::<LittleEndian>(self.header.data_length)?;
        out.write_u32::<LittleEndian>(self.header.footer_cert_offset)?;
        out.write_u32::<LittleEndian>(self.header.footer_cert_length)?;
        out.extend_from_slice(&self.header.salt);
        out.write_u16::<LittleEndian>(self.header.unknown1)?;
        out.write_u16::<LittleEndian>(self.header.security_epoch)?;
        out.extend_from_slice(&self.header.header_signature);
        debug_assert_eq!(out.len(), HEADER_LEN);
        out.resize(header_region, 0);
        out.extend_from_slice(&self.body);
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&self.certificate);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_image_roundtrips() {
        let image = Img1Image::make_unsigned(DeviceKind::N5G, 0x2202_0000, b"payload");
        let bytes = image.write().unwrap();
        let reparsed = Img1Image::read(&bytes).unwrap();
        assert_eq!(reparsed.kind, DeviceKind::N5G);
        assert_eq!(reparsed.header.entrypoint, 0x2202_0000);
        assert_eq!(reparsed.header.body_length, 16);
        assert_eq!(bytes.len(), 0x600 + 16 + 0x80 + 0x300);
    }

    #[test]
    fn n3g_unsigned_image_has_no_trailer() {
        let image = Img1Image::make_unsigned(DeviceKind::N3G, 0x2202_0000, &[0xAA; 8]);
        assert_eq!(image.header.format, Format::Signed);
        assert!(image.signature.is_empty());
        assert!(image.certificate.is_empty());
        let bytes = image.write().unwrap();
        assert_eq!(bytes.len(), 0x800 + 16);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = vec![0u8; HEADER_LEN];
        bytes[..4].copy_from_slice(b"XXXX");
        assert!(matches!(Img1Image::read(&bytes), Err(Img1Error::NotImage1(_))));
    }

    #[test]
    fn truncated_image_is_rejected() {
        assert!(matches!(Img1Image::read(&[0u8; 4]), Err(Img1Error::Truncated)));
    }
}
