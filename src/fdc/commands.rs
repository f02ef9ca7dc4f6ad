/*!
µPD765 command parsing and execution.

Each command declares a fixed parameter count; once the last byte arrives
the command executes immediately (the +3 polls MSR, so the instant model is
observably equivalent). Multi-sector reads and writes scan sector IDs
`R..=max(R, EOT)` against the physical track, honouring the SK bit and the
deleted-data address mark, and finish in abnormal termination because the
+3 never asserts TC.

Weak sectors re-randomize their unstable byte positions on every read.
Sectors flagged with a CRC error whose declared size fits the stored data
randomize everything past `min(256, copy_len)` to look unstable; a sector
stored *shorter* than declared is the truthful oversized-sector technique
and reads back exactly as stored.
*/

use rand::Rng;

use super::{DataDirection, DiskActivity, Fdc, FdcPhase, FormatInfo};

const CMD_READ_TRACK: u8 = 0x02;
const CMD_SPECIFY: u8 = 0x03;
const CMD_SENSE_DRIVE: u8 = 0x04;
const CMD_WRITE_DATA: u8 = 0x05;
const CMD_READ_DATA: u8 = 0x06;
const CMD_RECALIBRATE: u8 = 0x07;
const CMD_SENSE_INTERRUPT: u8 = 0x08;
const CMD_WRITE_DELETED: u8 = 0x09;
const CMD_READ_ID: u8 = 0x0A;
const CMD_READ_DELETED: u8 = 0x0C;
const CMD_FORMAT_TRACK: u8 = 0x0D;
const CMD_SEEK: u8 = 0x0F;
const CMD_SCAN_EQUAL: u8 = 0x11;
const CMD_SCAN_LOW_EQUAL: u8 = 0x19;
const CMD_SCAN_HIGH_EQUAL: u8 = 0x1D;

pub(crate) const ST0_SEEK_END: u8 = 0x20;
pub(crate) const ST0_ABNORMAL: u8 = 0x40;
pub(crate) const ST0_INVALID: u8 = 0x80;
pub(crate) const ST1_MISSING_AM: u8 = 0x01;
pub(crate) const ST1_NOT_WRITABLE: u8 = 0x02;
pub(crate) const ST1_NO_DATA: u8 = 0x04;
pub(crate) const ST1_CRC_ERROR: u8 = 0x20;
pub(crate) const ST1_END_OF_TRACK: u8 = 0x80;
pub(crate) const ST2_SCAN_NOT_SATISFIED: u8 = 0x04;
pub(crate) const ST2_CRC_ERROR_DATA: u8 = 0x20;
pub(crate) const ST2_CONTROL_MARK: u8 = 0x40;

/// Total command length (command byte included) by the low 5 bits.
pub(crate) fn parameter_count(cmd: u8) -> usize {
    match cmd & 0x1F {
        CMD_READ_TRACK
        | CMD_WRITE_DATA
        | CMD_READ_DATA
        | CMD_WRITE_DELETED
        | CMD_READ_DELETED
        | CMD_SCAN_EQUAL
        | CMD_SCAN_LOW_EQUAL
        | CMD_SCAN_HIGH_EQUAL => 9,
        CMD_SPECIFY | CMD_SEEK => 3,
        CMD_SENSE_DRIVE | CMD_RECALIBRATE | CMD_READ_ID => 2,
        CMD_FORMAT_TRACK => 6,
        CMD_SENSE_INTERRUPT => 1,
        _ => 1,
    }
}

/// One sector's contribution to a read transfer, before randomization.
struct ReadChunk {
    start: usize,
    len: usize,
    weak: Vec<usize>,
    /// Chunk-relative offset to randomize from (CRC-error emulation).
    randomize_from: Option<usize>,
}

impl Fdc {
    /// Execute a fully collected command buffer.
    pub(crate) fn dispatch(&mut self) {
        let cmd = self.command[0];
        self.op.mt = cmd & 0x80 != 0;
        self.op.mfm = cmd & 0x40 != 0;
        self.op.skip = cmd & 0x20 != 0;
        match cmd & 0x1F {
            CMD_READ_TRACK => self.cmd_read_track(),
            CMD_SPECIFY => self.phase = FdcPhase::Idle,
            CMD_SENSE_DRIVE => self.cmd_sense_drive_status(),
            CMD_WRITE_DATA => self.cmd_write(false),
            CMD_READ_DATA => self.cmd_read(false),
            CMD_RECALIBRATE => self.cmd_recalibrate(),
            CMD_SENSE_INTERRUPT => self.cmd_sense_interrupt(),
            CMD_WRITE_DELETED => self.cmd_write(true),
            CMD_READ_ID => self.cmd_read_id(),
            CMD_READ_DELETED => self.cmd_read(true),
            CMD_FORMAT_TRACK => self.cmd_format_track(),
            CMD_SEEK => self.cmd_seek(),
            CMD_SCAN_EQUAL | CMD_SCAN_LOW_EQUAL | CMD_SCAN_HIGH_EQUAL => self.cmd_scan(),
            _ => self.post_result(vec![ST0_INVALID]),
        }
    }

    /// Latch head/drive selection plus the C/H/R/N/EOT/DTL registers of a
    /// 9-byte transfer command.
    fn latch_transfer_params(&mut self) {
        let c = &self.command;
        self.op.drive = c[1] & 0x03;
        self.op.head = (c[1] >> 2) & 0x01;
        self.op.c = c[2];
        self.op.h = c[3];
        self.op.r = c[4];
        self.op.n = c[5];
        self.op.eot = c[6];
        self.op.dtl = c[8];
    }

    fn base_st0(&self) -> u8 {
        self.op.drive | self.op.head << 2
    }

    fn transfer_result(&self, st0: u8, st1: u8, st2: u8, r: u8) -> Vec<u8> {
        vec![st0, st1, st2, self.op.c, self.op.h, r, self.op.n]
    }

    // ------------------------------ reads ------------------------------

    fn cmd_read(&mut self, deleted: bool) {
        self.latch_transfer_params();
        self.op.deleted = deleted;
        let drive = self.op.drive as usize;
        let head = self.op.head;
        let track_no = self.drives[drive].track;
        self.notify(DiskActivity::Read, track_no, self.op.r, head, drive as u8);

        let mut st1 = 0u8;
        let mut st2 = 0u8;
        let mut data = Vec::new();
        let mut chunks: Vec<ReadChunk> = Vec::new();
        let mut next_r = self.op.r;

        let track = self.drives[drive]
            .disk
            .as_ref()
            .and_then(|d| d.track(track_no, head));
        match track {
            None => st1 |= ST1_NO_DATA,
            Some(track) => {
                let last = self.op.eot.max(self.op.r);
                let mut sid = self.op.r;
                loop {
                    let Some(sector) = track.sector(sid) else {
                        st1 |= ST1_NO_DATA;
                        next_r = sid;
                        break;
                    };
                    let ddam = sector.st2 & ST2_CONTROL_MARK != 0;
                    let mismatch = ddam != deleted;
                    if mismatch && self.op.skip {
                        next_r = sid.wrapping_add(1);
                        if sid == last {
                            st1 |= ST1_END_OF_TRACK;
                            break;
                        }
                        sid = sid.wrapping_add(1);
                        continue;
                    }
                    let copy_len = sector.copy_len();
                    let take = copy_len.min(sector.nominal_len());
                    let start = data.len();
                    data.extend_from_slice(&sector.data[..take]);
                    let weak = sector
                        .weak_map
                        .as_ref()
                        .map(|w| w.iter().filter(|&&p| p < take).copied().collect())
                        .unwrap_or_default();
                    let crc = sector.st1 & ST1_CRC_ERROR != 0;
                    // A stored length shorter than declared is truthful
                    // oversized-sector data; only same-or-longer storage
                    // gets the unstable-read treatment.
                    let randomize_from = if crc && sector.nominal_len() <= sector.data.len() {
                        Some(256.min(copy_len))
                    } else {
                        None
                    };
                    chunks.push(ReadChunk {
                        start,
                        len: take,
                        weak,
                        randomize_from,
                    });
                    if mismatch {
                        st2 |= ST2_CONTROL_MARK;
                        next_r = sid.wrapping_add(1);
                        break;
                    }
                    if crc {
                        st1 |= ST1_CRC_ERROR;
                        st2 |= sector.st2 & ST2_CRC_ERROR_DATA;
                        next_r = sid.wrapping_add(1);
                        break;
                    }
                    next_r = sid.wrapping_add(1);
                    if sid == last {
                        st1 |= ST1_END_OF_TRACK;
                        break;
                    }
                    sid = sid.wrapping_add(1);
                }
            }
        }

        self.randomize_chunks(&mut data, &chunks);
        let st0 = self.base_st0() | ST0_ABNORMAL;
        let result = self.transfer_result(st0, st1, st2, next_r);
        if data.is_empty() {
            self.post_result(result);
        } else {
            self.start_execution(data, DataDirection::FdcToCpu, result);
        }
    }

    fn cmd_read_track(&mut self) {
        self.latch_transfer_params();
        let drive = self.op.drive as usize;
        let head = self.op.head;
        let track_no = self.drives[drive].track;
        self.notify(DiskActivity::Read, track_no, self.op.r, head, drive as u8);

        let mut st1 = 0u8;
        let mut data = Vec::new();
        let mut chunks = Vec::new();
        let track = self.drives[drive]
            .disk
            .as_ref()
            .and_then(|d| d.track(track_no, head));
        match track {
            None => st1 |= ST1_NO_DATA,
            Some(track) => {
                if track.sectors.is_empty() {
                    st1 |= ST1_MISSING_AM;
                }
                // Physical order, IDs ignored, up to EOT sectors.
                let count = (self.op.eot.max(1) as usize).min(track.sectors.len());
                for sector in &track.sectors[..count] {
                    let take = sector.copy_len().min(sector.nominal_len());
                    let start = data.len();
                    data.extend_from_slice(&sector.data[..take]);
                    let weak = sector
                        .weak_map
                        .as_ref()
                        .map(|w| w.iter().filter(|&&p| p < take).copied().collect())
                        .unwrap_or_default();
                    chunks.push(ReadChunk {
                        start,
                        len: take,
                        weak,
                        randomize_from: None,
                    });
                }
                st1 |= ST1_END_OF_TRACK;
            }
        }
        self.randomize_chunks(&mut data, &chunks);
        let st0 = self.base_st0() | ST0_ABNORMAL;
        let result = self.transfer_result(st0, st1, 0, self.op.r);
        if data.is_empty() {
            self.post_result(result);
        } else {
            self.start_execution(data, DataDirection::FdcToCpu, result);
        }
    }

    fn randomize_chunks(&mut self, data: &mut [u8], chunks: &[ReadChunk]) {
        for chunk in chunks {
            for &pos in &chunk.weak {
                data[chunk.start + pos] = self.rng.r#gen();
            }
            if let Some(from) = chunk.randomize_from {
                for b in &mut data[chunk.start + from.min(chunk.len)..chunk.start + chunk.len] {
                    *b = self.rng.r#gen();
                }
            }
        }
    }

    fn cmd_read_id(&mut self) {
        let c1 = self.command[1];
        self.op.drive = c1 & 0x03;
        self.op.head = (c1 >> 2) & 0x01;
        let drive = self.op.drive as usize;
        let track_no = self.drives[drive].track;
        self.notify(DiskActivity::Read, track_no, 0, self.op.head, drive as u8);
        let header = self.drives[drive]
            .disk
            .as_ref()
            .and_then(|d| d.track(track_no, self.op.head))
            .and_then(|t| t.sectors.first())
            .map(|s| (s.c, s.h, s.id, s.size_code));
        match header {
            Some((c, h, r, n)) => {
                self.post_result(vec![self.base_st0(), 0, 0, c, h, r, n]);
            }
            None => {
                let st0 = self.base_st0() | ST0_ABNORMAL;
                self.post_result(vec![st0, ST1_MISSING_AM, 0, track_no, self.op.head, 0, 0]);
            }
        }
    }

    // ------------------------------ writes -----------------------------

    fn cmd_write(&mut self, deleted: bool) {
        self.latch_transfer_params();
        self.op.deleted = deleted;
        let drive = self.op.drive as usize;
        let head = self.op.head;
        let track_no = self.drives[drive].track;
        self.notify(DiskActivity::Write, track_no, self.op.r, head, drive as u8);

        if self.drives[drive].disk.is_none() {
            let st0 = self.base_st0() | ST0_ABNORMAL;
            let result = self.transfer_result(st0, ST1_NO_DATA, 0, self.op.r);
            self.post_result(result);
            return;
        }
        if self.drives[drive].write_protect {
            let st0 = self.base_st0() | ST0_ABNORMAL;
            let result = self.transfer_result(st0, ST1_NOT_WRITABLE, 0, self.op.r);
            self.post_result(result);
            return;
        }
        let sectors = self.op.eot.max(self.op.r) as usize - self.op.r as usize + 1;
        let expected = sectors * (128usize << (self.op.n & 7) as usize);
        self.format_info = None;
        // The result is computed at commit time, once the data landed.
        self.start_execution(vec![0; expected], DataDirection::CpuToFdc, Vec::new());
    }

    fn cmd_format_track(&mut self) {
        // Parameters: HD/US, N, SC (sectors), GPL, D (filler).
        let c1 = self.command[1];
        self.op.drive = c1 & 0x03;
        self.op.head = (c1 >> 2) & 0x01;
        self.op.n = self.command[2];
        self.op.eot = self.command[3];
        let filler = self.command[5];
        let drive = self.op.drive as usize;
        self.op.c = self.drives[drive].track;
        self.op.h = self.op.head;
        self.op.r = 1;

        if self.drives[drive].disk.is_none() {
            let st0 = self.base_st0() | ST0_ABNORMAL;
            let result = self.transfer_result(st0, ST1_NO_DATA, 0, self.op.r);
            self.post_result(result);
            return;
        }
        if self.drives[drive].write_protect {
            let st0 = self.base_st0() | ST0_ABNORMAL;
            let result = self.transfer_result(st0, ST1_NOT_WRITABLE, 0, self.op.r);
            self.post_result(result);
            return;
        }
        self.format_info = Some(FormatInfo {
            drive: self.op.drive,
            head: self.op.head,
            filler,
        });
        let quads = self.op.eot as usize * 4;
        self.start_execution(vec![0; quads], DataDirection::CpuToFdc, Vec::new());
    }

    // --------------------------- seek family ---------------------------

    fn cmd_recalibrate(&mut self) {
        let drive = (self.command[1] & 0x03) as usize;
        self.drives[drive].track = 0;
        self.notify(DiskActivity::Seek, 0, 0, 0, drive as u8);
        self.raise_seek_interrupt(drive as u8, 0);
        self.phase = FdcPhase::Idle;
    }

    fn cmd_seek(&mut self) {
        let drive = (self.command[1] & 0x03) as usize;
        let head = (self.command[1] >> 2) & 0x01;
        let track = self.command[2];
        self.drives[drive].track = track;
        self.notify(DiskActivity::Seek, track, 0, head, drive as u8);
        self.raise_seek_interrupt(drive as u8, track);
        self.phase = FdcPhase::Idle;
    }

    fn raise_seek_interrupt(&mut self, drive: u8, track: u8) {
        self.interrupt_pending = true;
        self.saved_st0 = ST0_SEEK_END | drive;
        self.saved_track = track;
        self.drive_busy |= 1 << drive;
    }

    fn cmd_sense_interrupt(&mut self) {
        if self.interrupt_pending {
            self.interrupt_pending = false;
            self.drive_busy &= !(1 << (self.saved_st0 & 0x03));
            let result = vec![self.saved_st0, self.saved_track];
            self.post_result(result);
        } else {
            self.post_result(vec![ST0_INVALID]);
        }
    }

    // ------------------------------ status -----------------------------

    fn cmd_sense_drive_status(&mut self) {
        let c1 = self.command[1];
        let drive = (c1 & 0x03) as usize;
        let head = (c1 >> 2) & 0x01;
        let d = &self.drives[drive];
        let mut st3 = (drive as u8) | head << 2;
        if let Some(disk) = &d.disk {
            st3 |= 0x20; // ready
            if disk.num_sides == 2 {
                st3 |= 0x08;
            }
            if d.write_protect {
                st3 |= 0x40;
            }
        } else {
            // No disk: not ready, and the WP sensor reads protected.
            st3 |= 0x40;
        }
        if d.track == 0 {
            st3 |= 0x10;
        }
        self.post_result(vec![st3]);
    }

    fn cmd_scan(&mut self) {
        self.latch_transfer_params();
        let st0 = self.base_st0() | ST0_ABNORMAL;
        let result = self.transfer_result(st0, 0, ST2_SCAN_NOT_SATISFIED, self.op.r);
        self.post_result(result);
    }
}

/// Commit a CPU-to-FDC transfer: either a Format Track quad stream or a
/// Write Data payload. Replaces the pending result with the final status.
pub(crate) fn commit_cpu_transfer(fdc: &mut Fdc) {
    if let Some(info) = fdc.format_info.take() {
        let drive = info.drive as usize;
        let track_no = fdc.drives[drive].track;
        let ids: Vec<(u8, u8, u8, u8)> = fdc
            .data
            .chunks_exact(4)
            .map(|q| (q[0], q[1], q[2], q[3]))
            .collect();
        if let Some(disk) = fdc.drives[drive].disk.as_mut() {
            disk.format_track(track_no, info.head, &ids, info.filler);
        }
        fdc.notify(DiskActivity::Format, track_no, 0, info.head, info.drive);
        let st0 = fdc.base_st0() | ST0_ABNORMAL;
        let result = fdc.transfer_result(st0, 0, 0, fdc.op.r);
        fdc.pending_result = Some(result);
        return;
    }

    let drive = fdc.op.drive as usize;
    let head = fdc.op.head;
    let track_no = fdc.drives[drive].track;
    let nominal = 128usize << (fdc.op.n & 7) as usize;
    let deleted = fdc.op.deleted;
    let mut st1 = 0u8;
    let mut next_r = fdc.op.r;
    let last = fdc.op.eot.max(fdc.op.r);

    let data = std::mem::take(&mut fdc.data);
    if let Some(disk) = fdc.drives[drive].disk.as_mut() {
        let mut offset = 0usize;
        let mut sid = fdc.op.r;
        loop {
            let chunk_end = (offset + nominal).min(data.len());
            let present = disk
                .track_mut(track_no, head)
                .and_then(|t| t.sector_mut(sid))
                .is_some();
            if !present {
                st1 |= ST1_NO_DATA;
                next_r = sid;
                break;
            }
            disk.write_sector(track_no, head, sid, &data[offset..chunk_end]);
            if let Some(sector) = disk.track_mut(track_no, head).and_then(|t| t.sector_mut(sid)) {
                if deleted {
                    sector.st2 |= ST2_CONTROL_MARK;
                } else {
                    sector.st2 &= !ST2_CONTROL_MARK;
                }
            }
            offset = chunk_end;
            next_r = sid.wrapping_add(1);
            if sid == last {
                st1 |= ST1_END_OF_TRACK;
                break;
            }
            sid = sid.wrapping_add(1);
        }
    } else {
        st1 |= ST1_NO_DATA;
    }
    fdc.data = data;
    let st0 = fdc.base_st0() | ST0_ABNORMAL;
    let result = fdc.transfer_result(st0, st1, 0, next_r);
    fdc.pending_result = Some(result);
}
