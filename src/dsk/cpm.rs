/*!
CP/M / +3DOS directory and file reader over a parsed DSK image.

The boot sector (track 0, head 0, lowest sector ID) may open with a 16-byte
+3DOS disk specification. When that block checksums to zero mod 256 and
carries a plausible block shift (3..5) and reserved-track count (0..3) its
fields are adopted; otherwise the reader falls back to the stock +3 data
geometry (1 reserved track, 1 KiB blocks, 2 directory blocks) with the
sector layout inferred from track 0.

Directory entries are 32 bytes; multi-extent files reassemble by
`(user, name, ext)`. Files opening with a valid `PLUS3DOS` header report
the header's length minus the 128-byte header itself; everything else uses
the CP/M record arithmetic.
*/

use std::collections::BTreeMap;

use log::debug;

use super::DskImage;

/// Geometry the directory walk runs under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskSpec {
    pub reserved_tracks: usize,
    pub block_size: usize,
    pub block_shift: u8,
    pub dir_blocks: usize,
    pub sectors_per_track: usize,
    pub sector_size: usize,
}

/// +3DOS header fields of interest. `load_address` and `autostart` read
/// the same header word; which one is meaningful depends on the file type
/// (CODE load address vs BASIC LINE number).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Plus3Info {
    pub plus3_type: u8,
    pub data_length: u16,
    pub load_address: u16,
    pub autostart: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Extent {
    index: usize,
    rc: u8,
    bc: u8,
    blocks: Vec<u16>,
}

/// One reassembled directory entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpmFile {
    pub user: u8,
    pub name: String,
    pub ext: String,
    /// File size in bytes: +3DOS header length minus 128 when a header is
    /// present, CP/M record arithmetic otherwise.
    pub size: usize,
    pub plus3: Option<Plus3Info>,
    extents: Vec<Extent>,
}

impl CpmFile {
    /// `NAME.EXT` display form with padding trimmed.
    pub fn display_name(&self) -> String {
        if self.ext.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.name, self.ext)
        }
    }
}

/// Read the disk specification, falling back to stock +3 geometry.
pub fn disk_spec(disk: &DskImage) -> DiskSpec {
    let boot = disk.track(0, 0).and_then(|t| t.lowest_sector());
    if let Some(boot) = boot {
        if boot.data.len() >= 16 {
            let spec = &boot.data[..16];
            let sum: u32 = spec.iter().map(|&b| b as u32).sum();
            let block_shift = spec[6];
            let reserved = spec[5];
            if sum % 256 == 0 && (3..=5).contains(&block_shift) && reserved <= 3 && spec[3] > 0 {
                return DiskSpec {
                    reserved_tracks: reserved as usize,
                    block_size: 128usize << block_shift as usize,
                    block_shift,
                    dir_blocks: spec[7] as usize,
                    sectors_per_track: spec[3] as usize,
                    sector_size: 128usize << (spec[4] & 7) as usize,
                };
            }
        }
    }
    // Geometry inferred from track 0.
    let (spt, ssz) = disk
        .track(0, 0)
        .and_then(|t| t.lowest_sector().map(|s| (t.sectors.len(), s.nominal_len())))
        .unwrap_or((9, 512));
    debug!("no valid disk specification, assuming +3 data geometry");
    DiskSpec {
        reserved_tracks: 1,
        block_size: 1024,
        block_shift: 3,
        dir_blocks: 2,
        sectors_per_track: spt,
        sector_size: ssz,
    }
}

/// Read `len` bytes from the data area starting at absolute sector
/// `start`. Sector 0 is the first sector (lowest ID) of the first track
/// past the reserved ones; sectors advance in ID order and then across
/// tracks.
fn read_data_sectors(disk: &DskImage, spec: &DiskSpec, start: usize, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut abs = start;
    while out.len() < len {
        let track_index = spec.reserved_tracks + abs / spec.sectors_per_track;
        let within = abs % spec.sectors_per_track;
        let Some(track) = disk.tracks.get(track_index) else {
            break;
        };
        let ordered = track.sectors_by_id();
        let Some(sector) = ordered.get(within) else {
            break;
        };
        let take = spec.sector_size.min(sector.data.len());
        out.extend_from_slice(&sector.data[..take]);
        if take < spec.sector_size {
            out.resize(out.len() + spec.sector_size - take, 0xE5);
        }
        abs += 1;
    }
    out.truncate(len);
    out
}

fn sectors_per_block(spec: &DiskSpec) -> usize {
    (spec.block_size / spec.sector_size).max(1)
}

/// Total allocation blocks on the disk; decides 8- vs 16-bit block
/// numbers in directory entries.
fn total_blocks(disk: &DskImage, spec: &DiskSpec) -> usize {
    let tracks = disk.tracks.len().saturating_sub(spec.reserved_tracks);
    tracks * spec.sectors_per_track * spec.sector_size / spec.block_size.max(1)
}

fn ascii_name(bytes: &[u8]) -> String {
    let s: String = bytes.iter().map(|&b| (b & 0x7F) as char).collect();
    s.trim_end().to_string()
}

/// Walk the directory and reassemble the file list.
pub fn list_files(disk: &DskImage) -> Vec<CpmFile> {
    let spec = disk_spec(disk);
    let dir = read_data_sectors(disk, &spec, 0, spec.dir_blocks * spec.block_size);
    let wide_blocks = total_blocks(disk, &spec) > 255;

    let mut groups: BTreeMap<(u8, String, String), Vec<Extent>> = BTreeMap::new();
    for entry in dir.chunks_exact(32) {
        let user = entry[0];
        if user == 0xE5 || user > 15 {
            continue;
        }
        let name = ascii_name(&entry[1..9]);
        let ext = ascii_name(&entry[9..12]);
        let extent_index = entry[12] as usize | (entry[14] as usize) << 5;
        let bc = entry[13];
        let rc = entry[15];
        let mut blocks = Vec::new();
        if wide_blocks {
            for pair in entry[16..32].chunks_exact(2) {
                let b = u16::from_le_bytes([pair[0], pair[1]]);
                if b != 0 {
                    blocks.push(b);
                }
            }
        } else {
            for &b in &entry[16..32] {
                if b != 0 {
                    blocks.push(b as u16);
                }
            }
        }
        groups.entry((user, name, ext)).or_default().push(Extent {
            index: extent_index,
            rc,
            bc,
            blocks,
        });
    }

    let mut files = Vec::new();
    for ((user, name, ext), mut extents) in groups {
        extents.sort_by_key(|e| e.index);
        let last = extents.last().cloned().unwrap_or_default();
        let max_extent = last.index;
        let mut size = max_extent * 16384 + last.rc as usize * 128;
        if last.bc > 0 {
            size -= 128 - last.bc as usize;
        }
        let mut file = CpmFile {
            user,
            name,
            ext,
            size,
            plus3: None,
            extents,
        };
        apply_plus3_header(disk, &spec, &mut file);
        files.push(file);
    }
    files
}

/// Inspect the file's first sector for a +3DOS header and adopt its size
/// and metadata when valid.
fn apply_plus3_header(disk: &DskImage, spec: &DiskSpec, file: &mut CpmFile) {
    let Some(first_block) = file
        .extents
        .first()
        .and_then(|e| e.blocks.first().copied())
    else {
        return;
    };
    let first = read_data_sectors(
        disk,
        spec,
        first_block as usize * sectors_per_block(spec),
        128,
    );
    if first.len() < 128 || &first[..8] != b"PLUS3DOS" || first[8] != 0x1A {
        return;
    }
    let total = u32::from_le_bytes([first[11], first[12], first[13], first[14]]);
    file.size = (total as usize).saturating_sub(128);
    file.plus3 = Some(Plus3Info {
        plus3_type: first[15],
        data_length: u16::from_le_bytes([first[16], first[17]]),
        load_address: u16::from_le_bytes([first[18], first[19]]),
        autostart: u16::from_le_bytes([first[18], first[19]]),
    });
}

/// Read a file's contents: extents ascending, each block mapped to its
/// run of sectors, truncated to the reported size. The 128-byte +3DOS
/// header, when present, is not part of the returned data.
pub fn read_file(disk: &DskImage, file: &CpmFile) -> Vec<u8> {
    let spec = disk_spec(disk);
    let spb = sectors_per_block(&spec);
    let mut raw = Vec::new();
    for extent in &file.extents {
        for &block in &extent.blocks {
            raw.extend(read_data_sectors(
                disk,
                &spec,
                block as usize * spb,
                spec.block_size,
            ));
        }
    }
    if file.plus3.is_some() {
        let end = (128 + file.size).min(raw.len());
        raw[128.min(raw.len())..end].to_vec()
    } else {
        raw.truncate(file.size);
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{build_plus3_image, plus3dos_header, Plus3FileSpec};

    #[test]
    fn fallback_spec_when_boot_sector_is_filler() {
        let img = build_plus3_image(&[]);
        let spec = disk_spec(&img);
        assert_eq!(spec.reserved_tracks, 1);
        assert_eq!(spec.block_size, 1024);
        assert_eq!(spec.dir_blocks, 2);
        assert_eq!(spec.sectors_per_track, 9);
        assert_eq!(spec.sector_size, 512);
    }

    #[test]
    fn boot_spec_is_adopted_when_valid() {
        let mut img = build_plus3_image(&[]);
        // 16-byte spec: 2 reserved tracks, shift 4 (2 KiB blocks), 3 dir
        // blocks, 5 sectors of 1 KiB, padded to checksum zero.
        let mut spec = [0u8; 16];
        spec[2] = 40;
        spec[3] = 5; // sectors per track
        spec[4] = 3; // 128 << 3 = 1024
        spec[5] = 2; // reserved tracks
        spec[6] = 4; // block shift
        spec[7] = 3; // dir blocks
        let sum: u32 = spec[..15].iter().map(|&b| b as u32).sum();
        spec[15] = ((256 - (sum % 256)) % 256) as u8;
        let mut boot = vec![0u8; 512];
        boot[..16].copy_from_slice(&spec);
        img.write_sector(0, 0, 1, &boot);
        let got = disk_spec(&img);
        assert_eq!(got.reserved_tracks, 2);
        assert_eq!(got.block_size, 2048);
        assert_eq!(got.dir_blocks, 3);
        assert_eq!(got.sectors_per_track, 5);
        assert_eq!(got.sector_size, 1024);
    }

    #[test]
    fn plain_cpm_file_uses_record_arithmetic() {
        let img = build_plus3_image(&[Plus3FileSpec {
            name: "README.TXT",
            data: vec![0x41; 700],
        }]);
        let files = list_files(&img);
        assert_eq!(files.len(), 1);
        let f = &files[0];
        assert_eq!(f.display_name(), "README.TXT");
        assert_eq!(f.user, 0);
        assert!(f.plus3.is_none());
        // 700 bytes round up to 6 records.
        assert_eq!(f.size, 768);
        let data = read_file(&img, f);
        assert_eq!(data.len(), 768);
        assert!(data[..700].iter().all(|&b| b == 0x41));
    }

    #[test]
    fn plus3dos_header_overrides_size() {
        // S6: GAME.BAS raw 1152 bytes, header total 1024+128 -> size 1024,
        // type 0, autostart line 10.
        let header = plus3dos_header(1024 + 128, 0, 1024, 10);
        let mut data = header.to_vec();
        data.extend(std::iter::repeat(0x42).take(1024));
        let img = build_plus3_image(&[Plus3FileSpec {
            name: "GAME.BAS",
            data,
        }]);
        let files = list_files(&img);
        assert_eq!(files.len(), 1);
        let f = &files[0];
        assert_eq!(f.display_name(), "GAME.BAS");
        assert_eq!(f.size, 1024);
        let info = f.plus3.unwrap();
        assert_eq!(info.plus3_type, 0);
        assert_eq!(info.autostart, 10);
        assert_eq!(info.data_length, 1024);
        let body = read_file(&img, f);
        assert_eq!(body.len(), 1024);
        assert!(body.iter().all(|&b| b == 0x42));
    }

    #[test]
    fn corrupt_magic_falls_back_to_cpm_size() {
        let mut header = plus3dos_header(512 + 128, 3, 512, 0x8000);
        header[8] = 0; // break the soft-EOF byte
        let mut data = header.to_vec();
        data.extend(std::iter::repeat(0x13).take(512));
        let img = build_plus3_image(&[Plus3FileSpec {
            name: "CODE.BIN",
            data,
        }]);
        let f = &list_files(&img)[0];
        assert!(f.plus3.is_none());
        assert_eq!(f.size, 640);
    }

    #[test]
    fn deleted_and_high_user_entries_are_skipped() {
        let img = build_plus3_image(&[Plus3FileSpec {
            name: "KEEP.ME",
            data: vec![1; 128],
        }]);
        // The builder leaves unused directory space as 0xE5 entries, which
        // must not surface as files.
        let files = list_files(&img);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].display_name(), "KEEP.ME");
    }

    #[test]
    fn multi_block_file_reads_in_order() {
        let mut data = Vec::new();
        for i in 0..2500u32 {
            data.push((i % 251) as u8);
        }
        let expect = data.clone();
        let img = build_plus3_image(&[Plus3FileSpec {
            name: "BIG.DAT",
            data,
        }]);
        let f = &list_files(&img)[0];
        assert_eq!(f.size, 2500usize.div_ceil(128) * 128);
        let got = read_file(&img, f);
        assert_eq!(&got[..2500], &expect[..]);
    }
}
