/*!
Banked memory subsystem.

The `Memory` facade owns the ROM set, the RAM pages, an optional TR-DOS ROM,
and the live paging state, and decodes the paging ports on behalf of the CPU
core's port writes. Submodules:

- paging: per-model port-write state machine (`PagingState`).
- contention: ULA contention classification for the current pager state.

Address map for the 128-family models (slot = addr >> 14):
- slot 0: current ROM, TR-DOS ROM, or RAM 0 under the clone machines'
  RAM-over-ROM modes; all four slots become RAM under +2A special paging.
- slot 1: RAM 5, slot 2: RAM 2, slot 3: the selected bank.

The 48K model has no pager: a single 48 KiB block above the ROM.

Reads and writes may fire optional observer hooks for watchpoint support;
normal writes to ROM are silently dropped, debug pokes may edit ROM when
`allow_rom_edit` is set.
*/

pub mod contention;
pub mod paging;

pub use paging::PagingState;

use crate::machine::{MachineProfile, PagingModel};
use crate::z80::ReadByte;

const PAGE_SIZE: usize = 0x4000;

pub type AccessHook = Box<dyn FnMut(u16, u8)>;

/// Where a CPU address lands at the current pager state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Target {
    Rom { bank: usize, ofs: usize },
    Trdos { ofs: usize },
    Ram { page: usize, ofs: usize },
    /// The unpaged 48K block (offset from 0x4000).
    Block { ofs: usize },
}

pub struct Memory {
    profile: &'static MachineProfile,
    rom: Vec<Vec<u8>>,
    ram: Vec<Vec<u8>>,
    trdos_rom: Option<Vec<u8>>,
    state: PagingState,
    allow_rom_edit: bool,
    on_read: Option<AccessHook>,
    on_write: Option<AccessHook>,
}

impl Memory {
    pub fn new(profile: &'static MachineProfile) -> Self {
        let ram = if profile.paging == PagingModel::None {
            vec![vec![0u8; 3 * PAGE_SIZE]]
        } else {
            (0..profile.ram_pages).map(|_| vec![0u8; PAGE_SIZE]).collect()
        };
        Self {
            profile,
            rom: (0..profile.rom_banks).map(|_| vec![0u8; PAGE_SIZE]).collect(),
            ram,
            trdos_rom: None,
            state: PagingState::new(),
            allow_rom_edit: false,
            on_read: None,
            on_write: None,
        }
    }

    pub fn profile(&self) -> &'static MachineProfile {
        self.profile
    }

    pub fn state(&self) -> &PagingState {
        &self.state
    }

    /// Copy a ROM image into bank `bank` (truncated/zero-padded to 16 KiB).
    pub fn load_rom_bank(&mut self, bank: usize, image: &[u8]) {
        if let Some(dst) = self.rom.get_mut(bank) {
            let n = image.len().min(PAGE_SIZE);
            dst[..n].copy_from_slice(&image[..n]);
        }
    }

    /// Install the Beta Disk TR-DOS ROM (ignored on Scorpion, whose TR-DOS
    /// is ROM bank 3 of the main set).
    pub fn load_trdos_rom(&mut self, image: &[u8]) {
        let mut page = vec![0u8; PAGE_SIZE];
        let n = image.len().min(PAGE_SIZE);
        page[..n].copy_from_slice(&image[..n]);
        self.trdos_rom = Some(page);
    }

    pub fn set_trdos_active(&mut self, active: bool) {
        self.state.trdos_active = active;
    }

    pub fn set_allow_rom_edit(&mut self, allow: bool) {
        self.allow_rom_edit = allow;
    }

    pub fn set_read_hook(&mut self, hook: Option<AccessHook>) {
        self.on_read = hook;
    }

    pub fn set_write_hook(&mut self, hook: Option<AccessHook>) {
        self.on_write = hook;
    }

    fn map(&self, addr: u16) -> Target {
        let st = &self.state;
        if self.profile.paging == PagingModel::None {
            return if addr < 0x4000 {
                if st.trdos_active && self.trdos_rom.is_some() {
                    Target::Trdos { ofs: addr as usize }
                } else {
                    Target::Rom {
                        bank: 0,
                        ofs: addr as usize,
                    }
                }
            } else {
                Target::Block {
                    ofs: addr as usize - 0x4000,
                }
            };
        }
        let slot = (addr >> 14) as usize;
        let ofs = (addr & 0x3FFF) as usize;
        if self.profile.paging == PagingModel::Plus2a && st.special_paging_mode {
            return Target::Ram {
                page: st.special_banks[slot] as usize,
                ofs,
            };
        }
        match slot {
            0 => {
                let ram_over_rom = match self.profile.paging {
                    PagingModel::Pentagon1024 => st.ram_in_rom_mode,
                    PagingModel::Scorpion => st.scorpion_ram_in_rom_mode,
                    _ => false,
                };
                if ram_over_rom {
                    return Target::Ram { page: 0, ofs };
                }
                if st.trdos_active {
                    // Scorpion carries TR-DOS as ROM bank 3 of the main set.
                    if self.profile.paging == PagingModel::Scorpion {
                        return Target::Rom { bank: 3, ofs };
                    }
                    if self.trdos_rom.is_some() {
                        return Target::Trdos { ofs };
                    }
                }
                Target::Rom {
                    bank: st.cur_rom_bank as usize % self.rom.len(),
                    ofs,
                }
            }
            1 => Target::Ram { page: 5, ofs },
            2 => Target::Ram { page: 2, ofs },
            _ => Target::Ram {
                page: st.cur_ram_bank as usize,
                ofs,
            },
        }
    }

    fn peek(&self, addr: u16) -> u8 {
        match self.map(addr) {
            Target::Rom { bank, ofs } => self.rom[bank][ofs],
            Target::Trdos { ofs } => self.trdos_rom.as_ref().map_or(0xFF, |r| r[ofs]),
            Target::Ram { page, ofs } => {
                self.ram.get(page).map_or(0xFF, |p| p[ofs])
            }
            Target::Block { ofs } => self.ram[0][ofs],
        }
    }

    /// CPU read. Fires the read hook.
    pub fn read(&mut self, addr: u16) -> u8 {
        let val = self.peek(addr);
        if let Some(hook) = self.on_read.as_mut() {
            hook(addr, val);
        }
        val
    }

    /// CPU write. ROM targets are silently dropped. Fires the write hook.
    pub fn write(&mut self, addr: u16, val: u8) {
        match self.map(addr) {
            Target::Rom { .. } | Target::Trdos { .. } => {}
            Target::Ram { page, ofs } => {
                if let Some(p) = self.ram.get_mut(page) {
                    p[ofs] = val;
                }
            }
            Target::Block { ofs } => self.ram[0][ofs] = val,
        }
        if let Some(hook) = self.on_write.as_mut() {
            hook(addr, val);
        }
    }

    /// Debugger write: may edit ROM when `allow_rom_edit` is set, and does
    /// not fire hooks.
    pub fn poke(&mut self, addr: u16, val: u8) {
        match self.map(addr) {
            Target::Rom { bank, ofs } => {
                if self.allow_rom_edit {
                    self.rom[bank][ofs] = val;
                }
            }
            Target::Trdos { ofs } => {
                if self.allow_rom_edit {
                    if let Some(r) = self.trdos_rom.as_mut() {
                        r[ofs] = val;
                    }
                }
            }
            Target::Ram { page, ofs } => {
                if let Some(p) = self.ram.get_mut(page) {
                    p[ofs] = val;
                }
            }
            Target::Block { ofs } => self.ram[0][ofs] = val,
        }
    }

    /// Port write; only the paging ports are claimed here.
    pub fn write_port(&mut self, port: u16, val: u8) {
        if paging::decodes_1ffd(self.profile, port) {
            match self.profile.paging {
                PagingModel::Plus2a => paging::write_1ffd_plus3(&mut self.state, val),
                PagingModel::Scorpion => {
                    paging::write_1ffd_scorpion(self.profile, &mut self.state, val)
                }
                _ => {}
            }
            return;
        }
        if paging::decodes_eff7(self.profile, port) {
            paging::write_eff7(&mut self.state, val);
            return;
        }
        if paging::decodes_7ffd(self.profile, port) {
            paging::write_7ffd(self.profile, &mut self.state, val);
        }
    }

    /// The pager drives no port reads; the bus floats high.
    pub fn read_port(&mut self, _port: u16) -> u8 {
        0xFF
    }

    /// Is `addr` subject to ULA contention at the present pager state?
    pub fn is_contended(&self, addr: u16) -> bool {
        contention::is_contended(self.profile, &self.state, addr)
    }

    /// Restore power-on paging (memory contents are preserved).
    pub fn reset(&mut self) {
        self.state = PagingState::new();
    }
}

impl ReadByte for Memory {
    fn read_byte(&self, addr: u16) -> u8 {
        self.peek(addr)
    }
}

#[cfg(test)]
mod tests;
