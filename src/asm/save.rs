/*!
Save-command emitters: SAVEBIN / SAVESNA / SAVETAP / EMPTYTAP / SAVETRD /
EMPTYTRD.

Each directive captures a snapshot of the relevant output bytes at the
moment it executes (later code may overwrite the same addresses) and
appends a self-describing `SaveCommand`. The driver materializes the
commands in order after the final pass; nothing is written mid-pass.

TAP blocks follow the standard tape format: a 2-byte length, a flag byte
(0x00 header / 0xFF data), the payload, and an XOR checksum. TRD images
are 640 KiB Beta Disk layouts with the system sector on track 0.
*/

/// Header types used by SAVETAP.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TapMode {
    Basic,
    Code,
    Numbers,
    Chars,
    Headless,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SaveKind {
    Bin,
    Sna,
    Tap,
    EmptyTap,
    Trd,
    EmptyTrd,
}

/// One recorded output artefact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaveCommand {
    pub kind: SaveKind,
    pub filename: String,
    /// Origin address of the captured data (0 where not meaningful).
    pub start: u16,
    pub length: usize,
    /// Fully rendered file contents, captured at directive time.
    pub data: Vec<u8>,
    /// Name inside a container format (the TR-DOS catalogue entry for
    /// SAVETRD, the tape header name for SAVETAP).
    pub member: Option<String>,
    pub expected_md5: Option<String>,
}

// ------------------------------- TAP ---------------------------------

fn tap_block(flag: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.extend_from_slice(&((payload.len() as u16 + 2).to_le_bytes()));
    out.push(flag);
    out.extend_from_slice(payload);
    let checksum = payload.iter().fold(flag, |acc, &b| acc ^ b);
    out.push(checksum);
    out
}

fn tap_name(name: &str) -> [u8; 10] {
    let mut out = [b' '; 10];
    for (i, b) in name.bytes().take(10).enumerate() {
        out[i] = b;
    }
    out
}

/// Render one tape file (header block + data block, or a bare headless
/// block).
pub fn tap_file(mode: TapMode, name: &str, param1: u16, data: &[u8]) -> Vec<u8> {
    if mode == TapMode::Headless {
        return tap_block(0xFF, data);
    }
    let type_byte = match mode {
        TapMode::Basic => 0,
        TapMode::Numbers => 1,
        TapMode::Chars => 2,
        TapMode::Code => 3,
        TapMode::Headless => unreachable!(),
    };
    let mut header = Vec::with_capacity(17);
    header.push(type_byte);
    header.extend_from_slice(&tap_name(name));
    header.extend_from_slice(&(data.len() as u16).to_le_bytes());
    // Param 1: autostart line (BASIC) or load address (CODE).
    header.extend_from_slice(&param1.to_le_bytes());
    // Param 2: variables offset for BASIC, 0x8000 for the rest.
    let param2: u16 = if mode == TapMode::Basic {
        data.len() as u16
    } else {
        0x8000
    };
    header.extend_from_slice(&param2.to_le_bytes());
    let mut out = tap_block(0x00, &header);
    out.extend_from_slice(&tap_block(0xFF, data));
    out
}

// ------------------------------- SNA ---------------------------------

/// Build a 48K .sna snapshot around the captured memory image
/// (0x4000..0xFFFF). The program counter lands on the stack, IM 1, border
/// 7, everything else zeroed.
pub fn sna_file(memory_48k: &[u8], pc: u16) -> Vec<u8> {
    assert_eq!(memory_48k.len(), 0xC000);
    let mut mem = memory_48k.to_vec();
    let sp: u16 = 0xFFFE;
    let ofs = (sp - 0x4000) as usize;
    mem[ofs] = (pc & 0xFF) as u8;
    mem[ofs + 1] = (pc >> 8) as u8;

    let mut out = Vec::with_capacity(27 + mem.len());
    out.push(0x3F); // I
    out.extend_from_slice(&[0; 8]); // HL' DE' BC' AF'
    out.extend_from_slice(&[0; 10]); // HL DE BC IY IX
    out.push(0x04); // IFF2 set: interrupts enabled
    out.push(0x00); // R
    out.extend_from_slice(&[0; 2]); // AF
    out.extend_from_slice(&sp.to_le_bytes());
    out.push(0x01); // IM 1
    out.push(0x07); // border
    debug_assert_eq!(out.len(), 27);
    out.extend_from_slice(&mem);
    out
}

// ------------------------------- TRD ---------------------------------

pub const TRD_SIZE: usize = 640 * 1024;
const TRD_SECTOR: usize = 256;
const TRD_SYSTEM: usize = 8 * TRD_SECTOR; // track 0, sector 8

/// Blank 80-track double-sided TR-DOS image.
pub fn empty_trd(label: &str) -> Vec<u8> {
    let mut img = vec![0u8; TRD_SIZE];
    img[TRD_SYSTEM + 0xE1] = 0; // first free sector
    img[TRD_SYSTEM + 0xE2] = 1; // first free track
    img[TRD_SYSTEM + 0xE3] = 0x16; // 80 tracks, two sides
    img[TRD_SYSTEM + 0xE4] = 0; // file count
    let free: u16 = 2544;
    img[TRD_SYSTEM + 0xE5..TRD_SYSTEM + 0xE7].copy_from_slice(&free.to_le_bytes());
    img[TRD_SYSTEM + 0xE7] = 0x10; // TR-DOS identifier
    for (i, b) in label.bytes().chain(std::iter::repeat(b' ')).take(8).enumerate() {
        img[TRD_SYSTEM + 0xF5 + i] = b;
    }
    img
}

/// Append a file to a TRD image: a 16-byte catalogue entry plus the data
/// in the next free sectors. `name` is `NAME.E` (single-letter extension,
/// defaulting to `C`). Returns false when the catalogue or disk is full.
pub fn trd_add_file(img: &mut [u8], name: &str, start: u16, data: &[u8]) -> bool {
    if img.len() < TRD_SIZE {
        return false;
    }
    let file_count = img[TRD_SYSTEM + 0xE4] as usize;
    if file_count >= 128 {
        return false;
    }
    let sectors = data.len().div_ceil(TRD_SECTOR).max(1);
    let free_sector = img[TRD_SYSTEM + 0xE1] as usize;
    let free_track = img[TRD_SYSTEM + 0xE2] as usize;
    let free_total =
        u16::from_le_bytes([img[TRD_SYSTEM + 0xE5], img[TRD_SYSTEM + 0xE6]]) as usize;
    if sectors > free_total {
        return false;
    }

    let (base, ext) = name.split_once('.').unwrap_or((name, "C"));
    let entry = TRD_SYSTEM - 8 * TRD_SECTOR + file_count * 16; // catalogue starts at track 0 sector 0
    for (i, b) in base.bytes().chain(std::iter::repeat(b' ')).take(8).enumerate() {
        img[entry + i] = b;
    }
    img[entry + 8] = ext.bytes().next().unwrap_or(b'C');
    img[entry + 9..entry + 11].copy_from_slice(&start.to_le_bytes());
    img[entry + 11..entry + 13].copy_from_slice(&(data.len() as u16).to_le_bytes());
    img[entry + 13] = sectors as u8;
    img[entry + 14] = free_sector as u8;
    img[entry + 15] = free_track as u8;

    let mut offset = (free_track * 16 + free_sector) * TRD_SECTOR;
    for chunk in data.chunks(TRD_SECTOR) {
        img[offset..offset + chunk.len()].copy_from_slice(chunk);
        offset += TRD_SECTOR;
    }

    let next = free_track * 16 + free_sector + sectors;
    img[TRD_SYSTEM + 0xE1] = (next % 16) as u8;
    img[TRD_SYSTEM + 0xE2] = (next / 16) as u8;
    img[TRD_SYSTEM + 0xE4] = (file_count + 1) as u8;
    let remaining = (free_total - sectors) as u16;
    img[TRD_SYSTEM + 0xE5..TRD_SYSTEM + 0xE7].copy_from_slice(&remaining.to_le_bytes());
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_block_checksums() {
        let block = tap_block(0xFF, &[1, 2, 3]);
        assert_eq!(block[0], 5);
        assert_eq!(block[1], 0);
        assert_eq!(block[2], 0xFF);
        assert_eq!(*block.last().unwrap(), 0xFF ^ 1 ^ 2 ^ 3);
    }

    #[test]
    fn tap_code_file_layout() {
        let tap = tap_file(TapMode::Code, "SCREEN", 0x4000, &[0xAA; 16]);
        // Header block: 2 len + 1 flag + 17 payload + 1 checksum.
        assert_eq!(tap[0], 19);
        assert_eq!(tap[2], 0x00);
        assert_eq!(tap[3], 3, "CODE type");
        assert_eq!(&tap[4..10], b"SCREEN");
        let data_block = &tap[21..];
        assert_eq!(data_block[2], 0xFF);
        assert_eq!(data_block.len(), 2 + 1 + 16 + 1);
    }

    #[test]
    fn headless_tap_is_one_block() {
        let tap = tap_file(TapMode::Headless, "", 0, &[1, 2]);
        assert_eq!(tap.len(), 2 + 1 + 2 + 1);
        assert_eq!(tap[2], 0xFF);
    }

    #[test]
    fn sna_places_pc_on_stack() {
        let mem = vec![0u8; 0xC000];
        let sna = sna_file(&mem, 0x8000);
        assert_eq!(sna.len(), 27 + 0xC000);
        assert_eq!(sna[23], 0xFE, "SP low");
        assert_eq!(sna[24], 0xFF, "SP high");
        assert_eq!(sna[25], 0x01, "IM 1");
        let stack = 27 + (0xFFFE - 0x4000) as usize;
        assert_eq!(sna[stack], 0x00);
        assert_eq!(sna[stack + 1], 0x80);
    }

    #[test]
    fn trd_roundtrip() {
        let mut img = empty_trd("TEST");
        assert_eq!(img.len(), TRD_SIZE);
        assert_eq!(img[TRD_SYSTEM + 0xE7], 0x10);
        let data = vec![0x42u8; 600];
        assert!(trd_add_file(&mut img, "GAME.C", 0x8000, &data));
        // Catalogue entry 0.
        assert_eq!(&img[0..4], b"GAME");
        assert_eq!(img[8], b'C');
        assert_eq!(u16::from_le_bytes([img[9], img[10]]), 0x8000);
        assert_eq!(u16::from_le_bytes([img[11], img[12]]), 600);
        assert_eq!(img[13], 3, "sector count");
        // Data lands at track 1 sector 0.
        let data_start = 16 * TRD_SECTOR;
        assert_eq!(img[data_start], 0x42);
        assert_eq!(img[TRD_SYSTEM + 0xE4], 1);
        assert_eq!(
            u16::from_le_bytes([img[TRD_SYSTEM + 0xE5], img[TRD_SYSTEM + 0xE6]]),
            2541
        );
        // A second file starts after the first.
        assert!(trd_add_file(&mut img, "B", 0, &[1]));
        assert_eq!(img[TRD_SYSTEM + 0xE1], 4);
    }
}
