//! Shared test utilities for building DSK byte images and +3DOS disks.
//!
//! These helpers de-duplicate image construction across the dsk, cpm and
//! fdc test modules. They intentionally support just what the test suite
//! needs (small geometries, single extents, 8-bit allocation blocks).
//!
//! Layout notes:
//! - Standard DSK: "MV - CPC" signature, single 16-bit track size at 0x32,
//!   256-byte Track-Info header per track, sector entries of 8 bytes from
//!   offset 0x18, payloads concatenated from header+0x100.
//! - Extended DSK: "EXTENDED CPC DSK" signature, per-track size high-byte
//!   table at 0x34 (0 = unformatted).
//! - +3DOS disks built here use the fallback geometry the directory reader
//!   assumes when no boot specification is present: 1 reserved track,
//!   1024-byte blocks, 2 directory blocks, 9 sectors of 512 bytes per
//!   track with IDs 1..9.

#![allow(dead_code)]

use crate::dsk::DskImage;

/// One sector for `build_extended_dsk`.
#[derive(Clone, Debug)]
pub struct SectorSpec {
    pub c: u8,
    pub h: u8,
    pub id: u8,
    pub size_code: u8,
    pub st1: u8,
    pub st2: u8,
    pub data: Vec<u8>,
}

impl SectorSpec {
    /// Filler sector of nominal length.
    pub fn plain(c: u8, h: u8, id: u8, size_code: u8) -> Self {
        Self {
            c,
            h,
            id,
            size_code,
            st1: 0,
            st2: 0,
            data: vec![0xE5; 128usize << (size_code & 7) as usize],
        }
    }
}

fn track_block(cyl: u8, head: u8, sectors: &[SectorSpec]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"Track-Info\r\n\0\0\0\0");
    out.push(cyl);
    out.push(head);
    out.extend_from_slice(&[0, 0]);
    out.push(sectors.first().map_or(2, |s| s.size_code));
    out.push(sectors.len() as u8);
    out.push(0x4E);
    out.push(0xE5);
    for s in sectors {
        out.push(s.c);
        out.push(s.h);
        out.push(s.id);
        out.push(s.size_code);
        out.push(s.st1);
        out.push(s.st2);
        out.extend_from_slice(&(s.data.len() as u16).to_le_bytes());
    }
    out.resize(0x100, 0);
    for s in sectors {
        out.extend_from_slice(&s.data);
    }
    let pad = (256 - out.len() % 256) % 256;
    out.resize(out.len() + pad, 0);
    out
}

/// Build a standard DSK with uniform geometry and filler payloads.
pub fn build_standard_dsk(
    tracks: u8,
    sides: u8,
    sector_ids: &[u8],
    size_code: u8,
    filler: u8,
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"MV - CPC EMU Disk-File\r\nDisk-Info\r\n");
    out.resize(0x30, 0);
    out.push(tracks);
    out.push(sides);
    let track_size = 0x100 + sector_ids.len() * (128usize << (size_code & 7) as usize);
    out.extend_from_slice(&(track_size as u16).to_le_bytes());
    out.resize(0x100, 0);
    for cyl in 0..tracks {
        for head in 0..sides {
            let sectors: Vec<SectorSpec> = sector_ids
                .iter()
                .map(|&id| SectorSpec {
                    data: vec![filler; 128usize << (size_code & 7) as usize],
                    ..SectorSpec::plain(cyl, head, id, size_code)
                })
                .collect();
            let block = track_block(cyl, head, &sectors);
            out.extend_from_slice(&block[..track_size]);
        }
    }
    out
}

/// Build an extended DSK from explicit per-track sector lists. An empty
/// list produces an unformatted track.
pub fn build_extended_dsk(tracks: u8, sides: u8, specs: &[Vec<SectorSpec>]) -> Vec<u8> {
    assert_eq!(specs.len(), tracks as usize * sides as usize);
    let mut out = Vec::new();
    out.extend_from_slice(b"EXTENDED CPC DSK File\r\nDisk-Info\r\n");
    out.resize(0x30, 0);
    out.push(tracks);
    out.push(sides);
    out.extend_from_slice(&[0, 0]);
    let bodies: Vec<Vec<u8>> = specs
        .iter()
        .enumerate()
        .map(|(i, sectors)| {
            if sectors.is_empty() {
                Vec::new()
            } else {
                track_block(
                    (i / sides.max(1) as usize) as u8,
                    (i % sides.max(1) as usize) as u8,
                    sectors,
                )
            }
        })
        .collect();
    for body in &bodies {
        out.push((body.len() >> 8) as u8);
    }
    out.resize(0x100, 0);
    for body in bodies {
        out.extend_from_slice(&body);
    }
    out
}

/// 128-byte +3DOS file header: magic, total length, and the +3 BASIC
/// header fields (type, data length, param), checksummed.
pub fn plus3dos_header(total_len: u32, file_type: u8, data_len: u16, param: u16) -> [u8; 128] {
    let mut h = [0u8; 128];
    h[..8].copy_from_slice(b"PLUS3DOS");
    h[8] = 0x1A;
    h[9] = 1; // issue
    h[10] = 0; // version
    h[11..15].copy_from_slice(&total_len.to_le_bytes());
    h[15] = file_type;
    h[16..18].copy_from_slice(&data_len.to_le_bytes());
    h[18..20].copy_from_slice(&param.to_le_bytes());
    let sum: u32 = h[..127].iter().map(|&b| b as u32).sum();
    h[127] = (sum & 0xFF) as u8;
    h
}

/// One file for `build_plus3_image`: `name` in `NAME.EXT` form, raw CP/M
/// contents (header included when the file carries one).
pub struct Plus3FileSpec {
    pub name: &'static str,
    pub data: Vec<u8>,
}

const SECTORS_PER_TRACK: usize = 9;
const SECTOR_SIZE: usize = 512;
const BLOCK_SIZE: usize = 1024;
const SECTORS_PER_BLOCK: usize = BLOCK_SIZE / SECTOR_SIZE;
const RESERVED_TRACKS: usize = 1;
const DIR_BLOCKS: usize = 2;

/// Write `bytes` at the given absolute data-area sector index (sector 0 is
/// the first directory sector).
fn write_abs_sector(img: &mut DskImage, abs: usize, bytes: &[u8]) {
    let track = RESERVED_TRACKS + abs / SECTORS_PER_TRACK;
    let id = (abs % SECTORS_PER_TRACK) as u8 + 1;
    assert!(img.write_sector(track as u8, 0, id, bytes));
}

/// Build a formatted single-sided +3 data disk holding the given files,
/// laid out with the fallback CP/M geometry (no boot specification).
pub fn build_plus3_image(files: &[Plus3FileSpec]) -> DskImage {
    let ids: Vec<u8> = (1..=SECTORS_PER_TRACK as u8).collect();
    let mut img = DskImage::new_formatted(40, 1, &ids, 2, 0xE5);

    let mut dir = vec![0xE5u8; DIR_BLOCKS * BLOCK_SIZE];
    let mut next_block: u8 = DIR_BLOCKS as u8;
    for (index, file) in files.iter().enumerate() {
        let (name, ext) = file.name.split_once('.').unwrap_or((file.name, ""));
        let entry = &mut dir[index * 32..index * 32 + 32];
        entry.fill(0);
        for (i, b) in name.bytes().chain(std::iter::repeat(b' ')).take(8).enumerate() {
            entry[1 + i] = b;
        }
        for (i, b) in ext.bytes().chain(std::iter::repeat(b' ')).take(3).enumerate() {
            entry[9 + i] = b;
        }
        let records = file.data.len().div_ceil(128);
        assert!(records <= 128, "single-extent builder");
        entry[15] = records as u8; // RC
        for (i, chunk) in file.data.chunks(BLOCK_SIZE).enumerate() {
            let block = next_block;
            entry[16 + i] = block;
            for (s, part) in chunk.chunks(SECTOR_SIZE).enumerate() {
                write_abs_sector(&mut img, block as usize * SECTORS_PER_BLOCK + s, part);
            }
            next_block += 1;
        }
    }
    for (s, part) in dir.chunks(SECTOR_SIZE).enumerate() {
        write_abs_sector(&mut img, s, part);
    }
    img
}
