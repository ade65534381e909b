//! Integration-level round-trip checks for the container/image formats,
//! run against temp-file-backed input the way the teacher's own
//! integration tests exercise `blri::process` end to end.

use dfuhax::device::DeviceKind;
use dfuhax::efi::compression::{tiano_compress, tiano_decompress};
use dfuhax::img1::Img1Image;
use dfuhax::mse::{FileEntry, Mse, MseFile, NUM_ENTRIES};
use dfuhax::syscfg::SyscfgBlock;
use std::io::Write;

#[test]
fn img1_makes_unsigned_image_and_reads_it_back_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("image.bin");

    let image = Img1Image::make_unsigned(DeviceKind::N5G, 0x2202_0000, b"resident code here");
    let bytes = image.write().unwrap();
    std::fs::File::create(&path).unwrap().write_all(&bytes).unwrap();

    let reread = std::fs::read(&path).unwrap();
    let parsed = Img1Image::read(&reread).unwrap();
    assert_eq!(parsed.kind, DeviceKind::N5G);
    assert_eq!(parsed.header.entrypoint, 0x2202_0000);
    assert!(parsed.body.starts_with(b"resident code here"));
    assert_eq!(parsed.body.len() % 16, 0, "body is padded to a 16-byte boundary");
}

#[test]
fn mse_bundle_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bundle.mse");

    let mut files: [Option<MseFile>; NUM_ENTRIES] = Default::default();
    files[0] = Some(MseFile {
        entry: FileEntry {
            target: *b"NAND",
            name: *b"osos",
            used: true,
            offset: 0,
            length: 4,
            opaque: [0; 5],
        },
        prefix: None,
        data: b"boot".to_vec(),
        suffix: Vec::new(),
    });
    let mse = Mse { volume_tag: *b"ipod", files };
    let bytes = mse.serialize();
    std::fs::write(&path, &bytes).unwrap();

    let reread = std::fs::read(&path).unwrap();
    let parsed = Mse::parse(&reread).unwrap();
    assert_eq!(parsed.files[0].as_ref().unwrap().data, b"boot");
    assert_eq!(parsed.serialize(), bytes);
}

#[test]
fn tiano_round_trips_arbitrary_binary_data() {
    let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let compressed = tiano_compress(&data).unwrap();
    assert!(compressed.len() < data.len(), "should compress repetitive-ish data");
    let decompressed = tiano_decompress(&compressed).unwrap();
    assert_eq!(decompressed, data);
}

#[test]
fn syscfg_rejects_a_block_with_a_foreign_tag() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"SCfg");
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(b"huh?");
    bytes.extend_from_slice(&[0u8; 16]);

    assert!(SyscfgBlock::parse(&bytes).is_err());
}
