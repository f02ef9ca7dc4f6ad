/*!
CPC DSK / extended DSK disk-image host.

Features:
- Parse standard ("MV - CPC") and extended ("EXTENDED CPC DSK") images
  into tracks of sector records, preserving the declared ST1/ST2 bytes.
- Weak-sector detection: a sector stored as an exact multiple k > 1 of its
  nominal size holds k recorded copies; every byte position where at least
  two copies disagree lands in the sector's weak map, and the first copy is
  the read baseline. If no byte differs the weak map is cleared and the
  data is plain oversized storage.
- Serialize back to extended DSK at declared lengths (weak copies are
  written as stored, never re-randomized).
- Blank-image construction and whole-track formatting for the FDC's Format
  Track command.

Unformatted tracks (size 0 in the extended track table) are accepted and
yield empty sector lists.

Submodule `cpm` walks the CP/M / +3DOS directory of a parsed image.
*/

pub mod cpm;

use crate::errors::DskFormatError;

const STANDARD_SIG: &[u8; 8] = b"MV - CPC";
const EXTENDED_SIG: &[u8; 16] = b"EXTENDED CPC DSK";
const TRACK_SIG: &[u8; 10] = b"Track-Info";
const CREATOR: &[u8] = b"speccy-dsk    ";
const TRACK_HEADER_LEN: usize = 0x100;
const DISK_HEADER_LEN: usize = 0x100;

/// One sector record as the DSK declares it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sector {
    /// Cylinder byte from the ID field (C).
    pub c: u8,
    /// Head byte from the ID field (H).
    pub h: u8,
    /// Sector ID (R).
    pub id: u8,
    /// Size code (N); nominal length is `128 << N`.
    pub size_code: u8,
    pub st1: u8,
    pub st2: u8,
    /// Stored payload, exactly the physical length the image declares
    /// (may exceed or fall short of nominal).
    pub data: Vec<u8>,
    /// Byte positions that differ between stored copies of a weak sector.
    pub weak_map: Option<Vec<usize>>,
}

impl Sector {
    pub fn nominal_len(&self) -> usize {
        128usize << (self.size_code & 7) as usize
    }

    /// Number of stored copies (1 unless the weak-sector heuristic fired).
    pub fn copy_len(&self) -> usize {
        if self.weak_map.is_some() {
            self.nominal_len()
        } else {
            self.data.len()
        }
    }

    /// Detect multi-copy weak storage and fill `weak_map`.
    fn detect_weak(&mut self) {
        self.weak_map = None;
        let nominal = self.nominal_len();
        if nominal == 0 || self.data.len() <= nominal || self.data.len() % nominal != 0 {
            return;
        }
        let copies = self.data.len() / nominal;
        let mut weak = Vec::new();
        for pos in 0..nominal {
            let first = self.data[pos];
            if (1..copies).any(|c| self.data[c * nominal + pos] != first) {
                weak.push(pos);
            }
        }
        if !weak.is_empty() {
            self.weak_map = Some(weak);
        }
    }
}

/// One track: ordered sector list as declared by the Track-Info block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Track {
    pub sectors: Vec<Sector>,
}

impl Track {
    pub fn sector(&self, id: u8) -> Option<&Sector> {
        self.sectors.iter().find(|s| s.id == id)
    }

    pub fn sector_mut(&mut self, id: u8) -> Option<&mut Sector> {
        self.sectors.iter_mut().find(|s| s.id == id)
    }

    /// Sector with the lowest ID (boot/directory reads start there).
    pub fn lowest_sector(&self) -> Option<&Sector> {
        self.sectors.iter().min_by_key(|s| s.id)
    }

    /// Sector references sorted ascending by ID.
    pub fn sectors_by_id(&self) -> Vec<&Sector> {
        let mut v: Vec<&Sector> = self.sectors.iter().collect();
        v.sort_by_key(|s| s.id);
        v
    }
}

/// A parsed disk image: tracks indexed by `cylinder * num_sides + head`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DskImage {
    pub num_tracks: u8,
    pub num_sides: u8,
    pub extended: bool,
    pub tracks: Vec<Track>,
}

impl DskImage {
    /// Empty (fully unformatted) image.
    pub fn new(num_tracks: u8, num_sides: u8) -> Self {
        let count = num_tracks as usize * num_sides as usize;
        Self {
            num_tracks,
            num_sides,
            extended: true,
            tracks: vec![Track::default(); count],
        }
    }

    /// Blank formatted image: every track carries `sector_ids` sectors of
    /// `128 << size_code` filler bytes.
    pub fn new_formatted(
        num_tracks: u8,
        num_sides: u8,
        sector_ids: &[u8],
        size_code: u8,
        filler: u8,
    ) -> Self {
        let mut img = Self::new(num_tracks, num_sides);
        for cyl in 0..num_tracks {
            for head in 0..num_sides {
                let track = img.track_mut(cyl, head).unwrap();
                track.sectors = sector_ids
                    .iter()
                    .map(|&id| Sector {
                        c: cyl,
                        h: head,
                        id,
                        size_code,
                        st1: 0,
                        st2: 0,
                        data: vec![filler; 128usize << (size_code & 7) as usize],
                        weak_map: None,
                    })
                    .collect();
            }
        }
        img
    }

    pub fn track(&self, cyl: u8, head: u8) -> Option<&Track> {
        self.tracks
            .get(cyl as usize * self.num_sides as usize + head as usize)
    }

    pub fn track_mut(&mut self, cyl: u8, head: u8) -> Option<&mut Track> {
        self.tracks
            .get_mut(cyl as usize * self.num_sides as usize + head as usize)
    }

    /// Write into a sector's stored payload, truncating to the stored
    /// physical length.
    pub fn write_sector(&mut self, cyl: u8, head: u8, id: u8, bytes: &[u8]) -> bool {
        let Some(sector) = self
            .track_mut(cyl, head)
            .and_then(|t| t.sector_mut(id))
        else {
            return false;
        };
        let n = bytes.len().min(sector.data.len());
        sector.data[..n].copy_from_slice(&bytes[..n]);
        true
    }

    /// Replace a whole track's layout (FDC Format Track).
    pub fn format_track(
        &mut self,
        cyl: u8,
        head: u8,
        ids: &[(u8, u8, u8, u8)],
        filler: u8,
    ) -> bool {
        let Some(track) = self.track_mut(cyl, head) else {
            return false;
        };
        track.sectors = ids
            .iter()
            .map(|&(c, h, r, n)| Sector {
                c,
                h,
                id: r,
                size_code: n,
                st1: 0,
                st2: 0,
                data: vec![filler; 128usize << (n & 7) as usize],
                weak_map: None,
            })
            .collect();
        true
    }

    /// Parse a standard or extended DSK file.
    pub fn parse(data: &[u8]) -> Result<Self, DskFormatError> {
        if data.len() < DISK_HEADER_LEN {
            return Err(DskFormatError::TooSmall(data.len()));
        }
        let extended = data.len() >= 16 && &data[..16] == EXTENDED_SIG;
        let standard = &data[..8] == STANDARD_SIG;
        if !extended && !standard {
            return Err(DskFormatError::BadSignature);
        }

        let num_tracks = data[0x30];
        let num_sides = data[0x31].max(1);
        let count = num_tracks as usize * num_sides as usize;

        let mut img = Self {
            num_tracks,
            num_sides,
            extended,
            tracks: Vec::with_capacity(count),
        };

        let mut offset = DISK_HEADER_LEN;
        for index in 0..count {
            let size = if extended {
                (data.get(0x34 + index).copied().unwrap_or(0) as usize) << 8
            } else {
                u16::from_le_bytes([data[0x32], data[0x33]]) as usize
            };
            if size == 0 {
                // Unformatted track: allowed, contributes nothing.
                img.tracks.push(Track::default());
                continue;
            }
            if offset + size > data.len() {
                return Err(DskFormatError::TruncatedTrack { track: index });
            }
            let track = parse_track(&data[offset..offset + size], index)?;
            img.tracks.push(track);
            offset += size;
        }
        Ok(img)
    }

    /// Serialize as an extended DSK. Payloads write back at their stored
    /// lengths; weak copies persist exactly as stored.
    pub fn save(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(EXTENDED_SIG);
        out.extend_from_slice(b" File\r\nDisk-Info\r\n");
        out.resize(0x22, 0);
        out.extend_from_slice(CREATOR);
        out.resize(0x30, 0);
        out.push(self.num_tracks);
        out.push(self.num_sides);
        out.extend_from_slice(&[0, 0]); // unused in extended images

        let mut bodies: Vec<Vec<u8>> = Vec::with_capacity(self.tracks.len());
        for (index, track) in self.tracks.iter().enumerate() {
            bodies.push(serialize_track(track, index, self.num_sides));
        }
        for body in &bodies {
            debug_assert!(body.len() % 256 == 0);
            out.push((body.len() >> 8) as u8);
        }
        out.resize(DISK_HEADER_LEN, 0);
        for body in bodies {
            out.extend_from_slice(&body);
        }
        out
    }
}

fn parse_track(bytes: &[u8], index: usize) -> Result<Track, DskFormatError> {
    if bytes.len() < TRACK_HEADER_LEN || &bytes[..10] != TRACK_SIG {
        return Err(DskFormatError::BadTrackHeader { track: index });
    }
    let sector_count = bytes[0x15] as usize;
    let default_size_code = bytes[0x14];
    let mut sectors = Vec::with_capacity(sector_count);
    let mut payload = TRACK_HEADER_LEN;
    for s in 0..sector_count {
        let entry = 0x18 + s * 8;
        if entry + 8 > TRACK_HEADER_LEN {
            break;
        }
        let size_code = bytes[entry + 3];
        let declared = u16::from_le_bytes([bytes[entry + 6], bytes[entry + 7]]) as usize;
        // Standard images carry no per-sector length; extended images use
        // 0 to mean "nominal".
        let stored = if declared != 0 {
            declared
        } else {
            128usize << (if size_code != 0 { size_code } else { default_size_code } & 7) as usize
        };
        let end = (payload + stored).min(bytes.len());
        let mut sector = Sector {
            c: bytes[entry],
            h: bytes[entry + 1],
            id: bytes[entry + 2],
            size_code,
            st1: bytes[entry + 4],
            st2: bytes[entry + 5],
            data: bytes[payload..end].to_vec(),
            weak_map: None,
        };
        sector.detect_weak();
        sectors.push(sector);
        payload += stored;
    }
    Ok(Track { sectors })
}

fn serialize_track(track: &Track, index: usize, num_sides: u8) -> Vec<u8> {
    if track.sectors.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    out.extend_from_slice(TRACK_SIG);
    out.extend_from_slice(b"\r\n\0\0");
    out.resize(0x10, 0);
    out.push((index / num_sides.max(1) as usize) as u8); // track number
    out.push((index % num_sides.max(1) as usize) as u8); // side number
    out.extend_from_slice(&[0, 0]);
    out.push(track.sectors.first().map_or(2, |s| s.size_code)); // sector size
    out.push(track.sectors.len() as u8);
    out.push(0x4E); // gap#3
    out.push(0xE5); // filler
    for s in &track.sectors {
        out.push(s.c);
        out.push(s.h);
        out.push(s.id);
        out.push(s.size_code);
        out.push(s.st1);
        out.push(s.st2);
        let len = s.data.len() as u16;
        out.extend_from_slice(&len.to_le_bytes());
    }
    out.resize(TRACK_HEADER_LEN, 0);
    for s in &track.sectors {
        out.extend_from_slice(&s.data);
    }
    // Track blocks are padded to a 256-byte boundary.
    let pad = (256 - out.len() % 256) % 256;
    out.resize(out.len() + pad, 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{build_extended_dsk, build_standard_dsk, SectorSpec};

    #[test]
    fn parses_standard_image() {
        let raw = build_standard_dsk(2, 1, &[1, 2, 3], 2, 0xE5);
        let img = DskImage::parse(&raw).unwrap();
        assert!(!img.extended);
        assert_eq!(img.num_tracks, 2);
        assert_eq!(img.num_sides, 1);
        let t0 = img.track(0, 0).unwrap();
        assert_eq!(t0.sectors.len(), 3);
        assert_eq!(t0.sectors[0].id, 1);
        assert_eq!(t0.sectors[0].data.len(), 512);
        assert!(t0.sectors[0].data.iter().all(|&b| b == 0xE5));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            DskImage::parse(&[0u8; 10]),
            Err(DskFormatError::TooSmall(10))
        ));
        let mut junk = vec![0u8; 0x200];
        junk[..8].copy_from_slice(b"NOT A DK");
        assert!(matches!(
            DskImage::parse(&junk),
            Err(DskFormatError::BadSignature)
        ));
    }

    #[test]
    fn extended_unformatted_tracks_are_empty() {
        let specs = vec![
            vec![SectorSpec::plain(0, 0, 1, 2)],
            vec![], // unformatted
            vec![SectorSpec::plain(2, 0, 1, 2)],
        ];
        let raw = build_extended_dsk(3, 1, &specs);
        let img = DskImage::parse(&raw).unwrap();
        assert_eq!(img.track(0, 0).unwrap().sectors.len(), 1);
        assert!(img.track(1, 0).unwrap().sectors.is_empty());
        assert_eq!(img.track(2, 0).unwrap().sectors.len(), 1);
    }

    #[test]
    fn weak_sector_detection() {
        // Two copies differing at positions 3 and 300.
        let mut copy_a = vec![0x11u8; 512];
        let mut copy_b = copy_a.clone();
        copy_b[3] = 0x12;
        copy_b[300] = 0x99;
        let mut data = copy_a.clone();
        data.extend_from_slice(&copy_b);
        let spec = SectorSpec {
            c: 0,
            h: 0,
            id: 1,
            size_code: 2,
            st1: 0,
            st2: 0,
            data,
        };
        let raw = build_extended_dsk(1, 1, &[vec![spec]]);
        let img = DskImage::parse(&raw).unwrap();
        let s = &img.track(0, 0).unwrap().sectors[0];
        assert_eq!(s.weak_map.as_deref(), Some(&[3usize, 300][..]));
        assert_eq!(s.copy_len(), 512);
        assert_eq!(s.data.len(), 1024);
        // Identical copies clear the weak map.
        copy_a.extend_from_slice(&vec![0x11u8; 512]);
        let spec = SectorSpec {
            c: 0,
            h: 0,
            id: 1,
            size_code: 2,
            st1: 0,
            st2: 0,
            data: copy_a,
        };
        let raw = build_extended_dsk(1, 1, &[vec![spec]]);
        let img = DskImage::parse(&raw).unwrap();
        assert!(img.track(0, 0).unwrap().sectors[0].weak_map.is_none());
    }

    #[test]
    fn non_integer_multiple_is_not_weak() {
        let spec = SectorSpec {
            c: 0,
            h: 0,
            id: 1,
            size_code: 2,
            st1: 0,
            st2: 0,
            data: vec![0xAB; 700], // longer than 512 but not a multiple
        };
        let raw = build_extended_dsk(1, 1, &[vec![spec]]);
        let img = DskImage::parse(&raw).unwrap();
        let s = &img.track(0, 0).unwrap().sectors[0];
        assert!(s.weak_map.is_none());
        assert_eq!(s.data.len(), 700);
    }

    #[test]
    fn write_sector_truncates_to_stored_length() {
        let mut img = DskImage::new_formatted(1, 1, &[1, 2], 1, 0x00); // 256-byte sectors
        let long = vec![0x5A; 400];
        assert!(img.write_sector(0, 0, 2, &long));
        let s = img.track(0, 0).unwrap().sector(2).unwrap();
        assert_eq!(s.data.len(), 256);
        assert!(s.data.iter().all(|&b| b == 0x5A));
        assert!(!img.write_sector(0, 0, 9, &long));
    }

    #[test]
    fn save_reload_roundtrip() {
        let mut img = DskImage::new_formatted(2, 2, &[0xC1, 0xC2, 0xC3], 2, 0xE5);
        img.write_sector(1, 1, 0xC2, b"hello dsk");
        img.track_mut(0, 0).unwrap().sector_mut(0xC1).unwrap().st1 = 0x20;
        let saved = img.save();
        let back = DskImage::parse(&saved).unwrap();
        assert_eq!(back.num_tracks, 2);
        assert_eq!(back.num_sides, 2);
        let s = back.track(1, 1).unwrap().sector(0xC2).unwrap();
        assert_eq!(&s.data[..9], b"hello dsk");
        assert_eq!(
            back.track(0, 0).unwrap().sector(0xC1).unwrap().st1,
            0x20,
            "status bytes survive the roundtrip"
        );
    }

    #[test]
    fn lowest_sector_and_id_ordering() {
        let mut img = DskImage::new_formatted(1, 1, &[5, 1, 9], 2, 0);
        assert_eq!(img.track(0, 0).unwrap().lowest_sector().unwrap().id, 1);
        let ordered: Vec<u8> = img
            .track(0, 0)
            .unwrap()
            .sectors_by_id()
            .iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ordered, vec![1, 5, 9]);
        img.format_track(0, 0, &[(0, 0, 1, 2), (0, 0, 2, 2)], 0xE5);
        assert_eq!(img.track(0, 0).unwrap().sectors.len(), 2);
    }
}
