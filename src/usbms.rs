//! SCSI Bulk-Only Transport plus the vendor subcommands iPod mass-storage
//! mode uses for firmware updates (component K). Ported from
//! `original_source/pkg/usbms/{usbms,scsi,ipod}.go`.

use crate::usb::UsbTransport;
use byteorder::{BigEndian, WriteBytesExt};
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum ScsiError {
    #[error(transparent)]
    Usb(#[from] crate::usb::UsbError),
    #[error("CSW signature mismatch")]
    BadCswSignature,
    #[error("CSW tag {actual:#x} does not match CBW tag {expected:#x}")]
    TagMismatch { expected: u32, actual: u32 },
    #[error("command completed with non-zero status {0}")]
    CommandFailed(u8),
    #[error("vendor subcommand {0:#x} data exceeds its {1}-byte limit")]
    VendorPayloadTooLong(u8, usize),
}

const CBW_SIGNATURE: u32 = 0x4342_5355;
const CSW_SIGNATURE: u32 = 0x4353_5355;
const BULK_OUT_EP: u8 = 0x02;
const BULK_IN_EP: u8 = 0x81;

pub const VENDOR_OPCODE: u8 = 0xC6;

/// `IPodUpdateKind` values for [`Host::ipod_update_send_full`], per
/// `original_source/pkg/usbms/ipod.go`.
pub const UPDATE_KIND_FIRMWARE: u8 = 0;
pub const UPDATE_KIND_BOOTLOADER: u8 = 1;

#[derive(Debug, Clone, Copy)]
pub enum VendorSubcommand {
    UpdateStart = 0x90,
    UpdateChunk = 0x91,
    UpdateEnd = 0x92,
    Repartition = 0x94,
    UpdateFinalize = 0x31,
}

/// Per-opcode vendor payload length limit, per spec.md §6's subcommand
/// layout: `UpdateStart{1B sub, 1B kind, 4B size}`, `UpdateChunk{1B sub,
/// 2B BE n_sectors}`, `UpdateEnd{1B sub}`, `UpdateFinalize{1B sub}`,
/// `Repartition{1B sub, 4B BE size/1024}`.
fn vendor_payload_limit(sub: VendorSubcommand) -> usize {
    match sub {
        VendorSubcommand::Repartition => 4,
        VendorSubcommand::UpdateStart => 5,
        VendorSubcommand::UpdateChunk => 2,
        VendorSubcommand::UpdateEnd | VendorSubcommand::UpdateFinalize => 0,
    }
}

/// Builds a 0xC6 vendor CDB: opcode, subcommand, then up to the
/// subcommand's byte limit of payload, zero-padded to a 16-byte CDB.
fn vendor_cdb(sub: VendorSubcommand, payload: &[u8]) -> Result<[u8; 16], ScsiError> {
    let limit = vendor_payload_limit(sub);
    if payload.len() > limit {
        return Err(ScsiError::VendorPayloadTooLong(sub as u8, limit));
    }
    let mut cdb = [0u8; 16];
    cdb[0] = VENDOR_OPCODE;
    cdb[1] = sub as u8;
    cdb[2..2 + payload.len()].copy_from_slice(payload);
    Ok(cdb)
}

struct Cbw {
    tag: u32,
    data_transfer_length: u32,
    direction_in: bool,
    lun: u8,
    cdb: Vec<u8>,
}

impl Cbw {
    fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(31);
        out.extend_from_slice(&CBW_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&self.tag.to_le_bytes());
        out.extend_from_slice(&self.data_transfer_length.to_le_bytes());
        out.push(if self.direction_in { 0x80 } else { 0x00 });
        out.push(self.lun);
        out.push(self.cdb.len() as u8);
        out.extend_from_slice(&self.cdb);
        out.resize(31, 0);
        out
    }
}

struct Csw {
    tag: u32,
    status: u8,
}

impl Csw {
    fn parse(bytes: &[u8]) -> Result<Csw, ScsiError> {
        let signature = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if signature != CSW_SIGNATURE {
            return Err(ScsiError::BadCswSignature);
        }
        let tag = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let status = bytes[12];
        Ok(Csw { tag, status })
    }
}

/// SCSI Bulk-Only Transport host, wrapping a [`UsbTransport`] and keeping
/// its own command tag counter.
pub struct Host<'a, T: UsbTransport> {
    usb: &'a T,
    next_tag: u32,
    timeout: Duration,
}

impl<'a, T: UsbTransport> Host<'a, T> {
    pub fn new(usb: &'a T) -> Self {
        Self { usb, next_tag: 1, timeout: Duration::from_secs(5) }
    }

    fn raw_command(&mut self, cdb: &[u8], transfer_in: Option<&mut [u8]>, transfer_out: Option<&[u8]>) -> Result<(), ScsiError> {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);

        let data_len = transfer_in.as_ref().map_or(0, |b| b.len())
            + transfer_out.map_or(0, |b| b.len());
        let cbw = Cbw {
            tag,
            data_transfer_length: data_len as u32,
            direction_in: transfer_in.is_some(),
            lun: 0,
            cdb: cdb.to_vec(),
        };
        self.usb.bulk_out(BULK_OUT_EP, &cbw.bytes(), self.timeout)?;

        if let Some(out) = transfer_out {
            self.usb.bulk_out(BULK_OUT_EP, out, self.timeout)?;
        }
        if let Some(buf) = transfer_in {
            self.usb.bulk_in(BULK_IN_EP, buf, self.timeout)?;
        }

        let mut csw_buf = [0u8; 13];
        self.usb.bulk_in(BULK_IN_EP, &mut csw_buf, self.timeout)?;
        let csw = Csw::parse(&csw_buf)?;
        if csw.tag != tag {
            return Err(ScsiError::TagMismatch { expected: tag, actual: csw.tag });
        }
        if csw.status != 0 {
            return Err(ScsiError::CommandFailed(csw.status));
        }
        Ok(())
    }

    /// SCSI INQUIRY with a vital product data page, used to identify the
    /// attached disk before issuing vendor commands.
    pub fn inquiry_vpd(&mut self, page: u8) -> Result<Vec<u8>, ScsiError> {
        let mut cdb = [0u8; 6];
        cdb[0] = 0x12; // INQUIRY
        cdb[1] = 0x01; // EVPD
        cdb[2] = page;
        cdb[4] = 0xFF;
        let mut buf = vec![0u8; 0xFF];
        self.raw_command(&cdb, Some(&mut buf), None)?;
        Ok(buf)
    }

    fn vendor_command(&mut self, sub: VendorSubcommand, payload: &[u8]) -> Result<(), ScsiError> {
        let cdb = vendor_cdb(sub, payload)?;
        self.raw_command(&cdb, None, None)
    }

    fn vendor_command_with_data(&mut self, sub: VendorSubcommand, payload: &[u8], data: &[u8]) -> Result<(), ScsiError> {
        let cdb = vendor_cdb(sub, payload)?;
        self.raw_command(&cdb, None, Some(data))
    }

    /// `size_bytes` must be 4096-byte aligned; the wire payload carries
    /// it in 1 KiB units.
    pub fn ipod_repartition(&mut self, size_bytes: u32) -> Result<(), ScsiError> {
        let mut payload = Vec::new();
        payload.write_u32::<BigEndian>(size_bytes / 1024).unwrap();
        self.vendor_command(VendorSubcommand::Repartition, &payload)
    }

    pub fn ipod_update_start(&mut self, kind: u8, total_len: u32) -> Result<(), ScsiError> {
        let mut payload = Vec::new();
        payload.push(kind);
        payload.write_u32::<BigEndian>(total_len).unwrap();
        self.vendor_command(VendorSubcommand::UpdateStart, &payload)
    }

    pub fn ipod_update_end(&mut self) -> Result<(), ScsiError> {
        self.vendor_command(VendorSubcommand::UpdateEnd, &[])
    }

    const CHUNK_BLOCKS: usize = 8;
    const BLOCK_SIZE: usize = 4096;

    /// Sends one chunk of up to 8 4096-byte sectors. `chunk`'s length must
    /// be an exact multiple of 4096 bytes; the final chunk of an update
    /// may carry fewer than 8 sectors and is sent at its true, smaller
    /// size rather than padded out.
    pub fn ipod_update_send_chunk(&mut self, chunk: &[u8]) -> Result<(), ScsiError> {
        debug_assert_eq!(chunk.len() % Self::BLOCK_SIZE, 0);
        debug_assert!(chunk.len() <= Self::CHUNK_BLOCKS * Self::BLOCK_SIZE);
        let n_sectors = (chunk.len() / Self::BLOCK_SIZE) as u16;
        let mut payload = Vec::new();
        payload.write_u16::<BigEndian>(n_sectors).unwrap();
        self.vendor_command_with_data(VendorSubcommand::UpdateChunk, &payload, chunk)
    }

    /// Zero-pads `data` up to a 4096-byte boundary, then sends the whole
    /// update sequence: `UpdateStart{kind, original_length}`, one
    /// `UpdateChunk` per 32768-byte group (the last carrying however many
    /// whole sectors remain), then `UpdateEnd`.
    pub fn ipod_update_send_full(&mut self, kind: u8, data: &[u8]) -> Result<(), ScsiError> {
        let chunk_size = Self::CHUNK_BLOCKS * Self::BLOCK_SIZE;
        let padded_len = data.len().div_ceil(Self::BLOCK_SIZE) * Self::BLOCK_SIZE;
        let mut padded = data.to_vec();
        padded.resize(padded_len, 0);

        self.ipod_update_start(kind, data.len() as u32)?;
        for chunk in padded.chunks(chunk_size) {
            self.ipod_update_send_chunk(chunk)?;
        }
        self.ipod_update_end()
    }

    /// Finalizes a firmware update with sub 0x31; when `reset` is set,
    /// additionally issues the opcode 0x1E/0x1B reboot sequence the
    /// historical tool uses to restart the device afterward.
    pub fn ipod_finalize(&mut self, reset: bool) -> Result<(), ScsiError> {
        self.vendor_command(VendorSubcommand::UpdateFinalize, &[])?;
        if reset {
            let cdb_reload = [0x1e, 0, 0, 0, 0, 0];
            self.raw_command(&cdb_reload, None, None)?;
            let cdb_stop = [0x1b, 0, 0, 0, 0, 0x02, 0];
            self.raw_command(&cdb_stop, None, None)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbw_bytes_are_31_bytes_with_signature() {
        let cbw = Cbw { tag: 1, data_transfer_length: 0, direction_in: true, lun: 0, cdb: vec![0x12] };
        let bytes = cbw.bytes();
        assert_eq!(bytes.len(), 31);
        assert_eq!(&bytes[0..4], &CBW_SIGNATURE.to_le_bytes());
    }

    #[test]
    fn vendor_cdb_rejects_oversized_payload() {
        let payload = vec![0u8; 20];
        assert!(matches!(
            vendor_cdb(VendorSubcommand::Repartition, &payload),
            Err(ScsiError::VendorPayloadTooLong(_, _))
        ));
    }

    #[test]
    fn csw_parse_rejects_bad_signature() {
        let bytes = [0u8; 13];
        assert!(matches!(Csw::parse(&bytes), Err(ScsiError::BadCswSignature)));
    }

    #[test]
    fn update_chunking_pads_to_4096_and_reports_true_sector_count() {
        const BLOCK_SIZE: usize = 4096;
        const CHUNK_BLOCKS: usize = 8;

        let unpadded_len = 32768 + 4096 * 3 - 100;
        let data = vec![0xABu8; unpadded_len];
        let padded_len = data.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        assert_eq!(padded_len, 32768 + 4096 * 3);

        let mut padded = data.clone();
        padded.resize(padded_len, 0);
        let chunk_size = CHUNK_BLOCKS * BLOCK_SIZE;
        let sector_counts: Vec<usize> =
            padded.chunks(chunk_size).map(|c| c.len() / BLOCK_SIZE).collect();
        assert_eq!(sector_counts, vec![8, 3]);
    }
}
