/*!
µPD765A floppy disk controller.

Register interface (ZX Spectrum +3 wiring):
- Main Status Register: port 0x2FFD, read-only.
- Data register: port 0x3FFD, read/write, one byte at a time.

State machine: IDLE -> COMMAND (parameter bytes accumulate) -> EXECUTION
(data transfer) -> RESULT (status bytes drain) -> IDLE. Commands run in an
instant-completion model: RQM is always high and every command finishes
within the port access that completes it. Because the +3 leaves the TC line
unconnected, every successful data transfer terminates "abnormally"
(ST0 bit 6) by running off the end of its buffer.

Command execution lives in the `commands` submodule.
*/

pub mod commands;

use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::dsk::DskImage;

/// Phase of the command state machine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FdcPhase {
    Idle,
    Command,
    Execution,
    Result,
}

/// Direction of the execution-phase data transfer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataDirection {
    CpuToFdc,
    FdcToCpu,
}

/// What a disk-activity observer is told.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DiskActivity {
    Read,
    Write,
    Seek,
    Format,
}

pub type ActivityHook = Box<dyn FnMut(DiskActivity, u8, u8, u8, u8)>;

/// One drive: head position plus whatever disk is inserted.
#[derive(Default)]
pub struct Drive {
    pub track: u8,
    pub disk: Option<DskImage>,
    pub motor_on: bool,
    pub write_protect: bool,
}

/// Operation registers latched from the current command's parameters.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct OpRegs {
    pub drive: u8,
    pub head: u8,
    pub c: u8,
    pub h: u8,
    pub r: u8,
    pub n: u8,
    pub eot: u8,
    pub dtl: u8,
    pub mt: bool,
    pub mfm: bool,
    pub skip: bool,
    /// Deleted-data command variant (Read/Write Deleted Data).
    pub deleted: bool,
}

/// Pending format parameters while the CPU streams C/H/R/N quads.
#[derive(Clone, Debug)]
pub(crate) struct FormatInfo {
    pub drive: u8,
    pub head: u8,
    pub filler: u8,
}

pub struct Fdc {
    pub(crate) drives: [Drive; 4],
    pub(crate) phase: FdcPhase,
    pub(crate) command: Vec<u8>,
    pub(crate) command_len: usize,
    pub(crate) result: Vec<u8>,
    pub(crate) result_pos: usize,
    pub(crate) data: Vec<u8>,
    pub(crate) data_pos: usize,
    pub(crate) direction: DataDirection,
    pub(crate) op: OpRegs,
    pub(crate) st0: u8,
    pub(crate) st1: u8,
    pub(crate) st2: u8,
    pub(crate) interrupt_pending: bool,
    pub(crate) saved_st0: u8,
    pub(crate) saved_track: u8,
    /// Per-drive busy bits cleared by Sense Interrupt Status.
    pub(crate) drive_busy: u8,
    /// Result bytes to surface once the execution transfer drains.
    pub(crate) pending_result: Option<Vec<u8>>,
    pub(crate) format_info: Option<FormatInfo>,
    pub(crate) rng: SmallRng,
    pub(crate) on_activity: Option<ActivityHook>,
}

impl Fdc {
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    /// Deterministic construction for tests: weak-sector and CRC-error
    /// randomization draw from this seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            drives: Default::default(),
            phase: FdcPhase::Idle,
            command: Vec::with_capacity(9),
            command_len: 0,
            result: Vec::new(),
            result_pos: 0,
            data: Vec::new(),
            data_pos: 0,
            direction: DataDirection::FdcToCpu,
            op: OpRegs::default(),
            st0: 0,
            st1: 0,
            st2: 0,
            interrupt_pending: false,
            saved_st0: 0,
            saved_track: 0,
            drive_busy: 0,
            pending_result: None,
            format_info: None,
            rng: SmallRng::seed_from_u64(seed),
            on_activity: None,
        }
    }

    pub fn insert_disk(&mut self, drive: usize, disk: DskImage) {
        if let Some(d) = self.drives.get_mut(drive) {
            d.disk = Some(disk);
            d.track = 0;
        }
    }

    pub fn eject_disk(&mut self, drive: usize) -> Option<DskImage> {
        self.drives.get_mut(drive).and_then(|d| d.disk.take())
    }

    pub fn disk(&self, drive: usize) -> Option<&DskImage> {
        self.drives.get(drive).and_then(|d| d.disk.as_ref())
    }

    pub fn set_write_protect(&mut self, drive: usize, protect: bool) {
        if let Some(d) = self.drives.get_mut(drive) {
            d.write_protect = protect;
        }
    }

    /// Gate-array motor line (+3 port 0x1FFD bit 3): a pure flag.
    pub fn set_motor(&mut self, on: bool) {
        for d in &mut self.drives {
            d.motor_on = on;
        }
    }

    pub fn motor_on(&self) -> bool {
        self.drives[0].motor_on
    }

    pub fn set_activity_hook(&mut self, hook: Option<ActivityHook>) {
        self.on_activity = hook;
    }

    pub(crate) fn notify(&mut self, kind: DiskActivity, track: u8, sector: u8, head: u8, drive: u8) {
        if let Some(hook) = self.on_activity.as_mut() {
            hook(kind, track, sector, head, drive);
        }
    }

    /// Main Status Register (port 0x2FFD).
    ///
    /// Bit 7 RQM is always high (instant completion); bit 6 DIO follows the
    /// transfer direction; bit 5 EXM marks the execution phase; bit 4 CB is
    /// high whenever a command is in flight; bits 0..3 mirror per-drive
    /// seek busy state.
    pub fn read_main_status(&self) -> u8 {
        let mut msr = 0x80;
        match self.phase {
            FdcPhase::Idle => {}
            FdcPhase::Command => msr |= 0x10,
            FdcPhase::Execution => {
                msr |= 0x10 | 0x20;
                if self.direction == DataDirection::FdcToCpu {
                    msr |= 0x40;
                }
            }
            FdcPhase::Result => msr |= 0x10 | 0x40,
        }
        msr | (self.drive_busy & 0x0F)
    }

    /// Data register read (port 0x3FFD).
    pub fn read_data(&mut self) -> u8 {
        match self.phase {
            FdcPhase::Result => {
                let b = self.result.get(self.result_pos).copied().unwrap_or(0xFF);
                self.result_pos += 1;
                if self.result_pos >= self.result.len() {
                    self.phase = FdcPhase::Idle;
                }
                b
            }
            FdcPhase::Execution if self.direction == DataDirection::FdcToCpu => {
                let b = self.data.get(self.data_pos).copied().unwrap_or(0xFF);
                self.data_pos += 1;
                if self.data_pos >= self.data.len() {
                    self.finish_execution();
                }
                b
            }
            _ => 0xFF,
        }
    }

    /// +3 port-read decode: 0x2FFD is the main status register, 0x3FFD
    /// the data register. `None` for ports that are not ours.
    pub fn read_port(&mut self, port: u16) -> Option<u8> {
        match port & 0xF002 {
            0x2000 => Some(self.read_main_status()),
            0x3000 => Some(self.read_data()),
            _ => None,
        }
    }

    /// +3 port-write decode: only the data register accepts writes.
    /// Returns whether the port was claimed.
    pub fn write_port(&mut self, port: u16, byte: u8) -> bool {
        if port & 0xF002 == 0x3000 {
            self.write_data(byte);
            true
        } else {
            false
        }
    }

    /// Data register write (port 0x3FFD).
    pub fn write_data(&mut self, byte: u8) {
        match self.phase {
            FdcPhase::Idle => self.start_command(byte),
            FdcPhase::Command => {
                self.command.push(byte);
                if self.command.len() >= self.command_len {
                    self.dispatch();
                }
            }
            FdcPhase::Execution if self.direction == DataDirection::CpuToFdc => {
                if self.data_pos < self.data.len() {
                    self.data[self.data_pos] = byte;
                    self.data_pos += 1;
                }
                if self.data_pos >= self.data.len() {
                    self.finish_execution();
                }
            }
            FdcPhase::Result => {
                // Writing the data register mid-result aborts to idle and
                // starts collecting a fresh command with this byte.
                self.phase = FdcPhase::Idle;
                self.result.clear();
                self.result_pos = 0;
                self.start_command(byte);
            }
            _ => {}
        }
    }

    fn start_command(&mut self, byte: u8) {
        self.command.clear();
        self.command.push(byte);
        self.command_len = commands::parameter_count(byte);
        self.phase = FdcPhase::Command;
        if self.command.len() >= self.command_len {
            self.dispatch();
        }
    }

    /// Post a result buffer and enter the result phase.
    pub(crate) fn post_result(&mut self, bytes: Vec<u8>) {
        self.result = bytes;
        self.result_pos = 0;
        self.phase = FdcPhase::Result;
    }

    /// Enter the execution phase around `data`.
    pub(crate) fn start_execution(&mut self, data: Vec<u8>, direction: DataDirection, result: Vec<u8>) {
        self.data = data;
        self.data_pos = 0;
        self.direction = direction;
        self.pending_result = Some(result);
        self.phase = FdcPhase::Execution;
    }

    fn finish_execution(&mut self) {
        if self.direction == DataDirection::CpuToFdc {
            commands::commit_cpu_transfer(self);
        }
        match self.pending_result.take() {
            Some(r) => self.post_result(r),
            None => self.phase = FdcPhase::Idle,
        }
    }

    pub fn reset(&mut self) {
        let hook = self.on_activity.take();
        let mut fresh = Fdc::with_seed(rand::random());
        std::mem::swap(&mut fresh.drives, &mut self.drives);
        *self = fresh;
        self.on_activity = hook;
        for d in &mut self.drives {
            d.track = 0;
            d.motor_on = false;
        }
    }
}

impl Default for Fdc {
    fn default() -> Self {
        Self::new()
    }
}
