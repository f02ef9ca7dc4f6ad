/*!
Machine profile registry.

A `MachineProfile` is the immutable description of one emulated model:
memory geometry, paging model, contention behaviour, default peripherals,
and the identifiers used by Z80/SZX snapshot headers. The live paging state
lives in `memory::Memory`; profiles only parameterise it.

Profiles supported: 48K, 128K, +2, +2A, +3, Pentagon 128, Pentagon 1024,
Scorpion ZS-256.
*/

/// Which paging state machine the memory subsystem runs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PagingModel {
    /// 48K: no paging ports, single 48 KiB RAM block.
    None,
    /// 128K / +2 / Pentagon 128: port 7FFD only.
    Bank128,
    /// +2A / +3: 7FFD plus 1FFD with special all-RAM modes.
    Plus2a,
    /// Pentagon 1024: 7FFD extended bank bits plus port EFF7.
    Pentagon1024,
    /// Scorpion ZS-256: 7FFD plus exact-match 1FFD.
    Scorpion,
}

/// Which addresses the ULA contends (none for clone machines).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UlaProfile {
    Ula48,
    Ula128,
    Ula3,
    NoContention,
}

/// Fine-grained contention switches per bus cycle kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ContentionFlags {
    pub mreq: bool,
    pub io: bool,
    pub internal: bool,
}

impl ContentionFlags {
    pub const NONE: Self = Self {
        mreq: false,
        io: false,
        internal: false,
    };
    pub const FULL: Self = Self {
        mreq: true,
        io: true,
        internal: true,
    };
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MachineId {
    Spectrum48,
    Spectrum128,
    Plus2,
    Plus2a,
    Plus3,
    Pentagon128,
    Pentagon1024,
    Scorpion256,
}

/// Immutable description of one machine model.
#[derive(Clone, Debug)]
pub struct MachineProfile {
    pub id: MachineId,
    /// Number of 16 KiB RAM pages; 0 means a single unpaged 48 KiB block.
    pub ram_pages: u8,
    /// Number of 16 KiB ROM banks in the ROM set.
    pub rom_banks: u8,
    /// ROM set filename the host should load.
    pub rom_file: &'static str,
    /// ROM bank holding 48 BASIC (the editor ROM is bank 0).
    pub basic_rom_bank: u8,
    pub paging: PagingModel,
    pub ula: UlaProfile,
    pub contention: ContentionFlags,
    /// Per-T-state delay pattern applied within a contended 8-cycle window.
    pub delay_pattern: [u8; 8],
    /// Length of the maskable interrupt pulse in T-states.
    pub int_pulse_tstates: u32,
    pub ay_present: bool,
    pub ay_clock_hz: u32,
    /// Beta Disk Interface (TR-DOS) fitted by default.
    pub beta_disk: bool,
    /// µPD765 FDC fitted (the +3).
    pub fdc_present: bool,
    /// Hardware-mode byte used by .z80 snapshots (version 3 value).
    pub z80_hw_mode: u8,
    /// Machine id used by .szx snapshots.
    pub szx_id: u8,
}

const DELAY_ULA: [u8; 8] = [6, 5, 4, 3, 2, 1, 0, 0];
const DELAY_PLUS3: [u8; 8] = [1, 0, 7, 6, 5, 4, 3, 2];
const DELAY_NONE: [u8; 8] = [0; 8];

const AY_CLOCK_SINCLAIR: u32 = 1_773_400;
const AY_CLOCK_PENTAGON: u32 = 1_750_000;

static PROFILES: [MachineProfile; 8] = [
    MachineProfile {
        id: MachineId::Spectrum48,
        ram_pages: 0,
        rom_banks: 1,
        rom_file: "48.rom",
        basic_rom_bank: 0,
        paging: PagingModel::None,
        ula: UlaProfile::Ula48,
        contention: ContentionFlags::FULL,
        delay_pattern: DELAY_ULA,
        int_pulse_tstates: 32,
        ay_present: false,
        ay_clock_hz: AY_CLOCK_SINCLAIR,
        beta_disk: false,
        fdc_present: false,
        z80_hw_mode: 0,
        szx_id: 1,
    },
    MachineProfile {
        id: MachineId::Spectrum128,
        ram_pages: 8,
        rom_banks: 2,
        rom_file: "128.rom",
        basic_rom_bank: 1,
        paging: PagingModel::Bank128,
        ula: UlaProfile::Ula128,
        contention: ContentionFlags::FULL,
        delay_pattern: DELAY_ULA,
        int_pulse_tstates: 36,
        ay_present: true,
        ay_clock_hz: AY_CLOCK_SINCLAIR,
        beta_disk: false,
        fdc_present: false,
        z80_hw_mode: 4,
        szx_id: 2,
    },
    MachineProfile {
        id: MachineId::Plus2,
        ram_pages: 8,
        rom_banks: 2,
        rom_file: "plus2.rom",
        basic_rom_bank: 1,
        paging: PagingModel::Bank128,
        ula: UlaProfile::Ula128,
        contention: ContentionFlags::FULL,
        delay_pattern: DELAY_ULA,
        int_pulse_tstates: 36,
        ay_present: true,
        ay_clock_hz: AY_CLOCK_SINCLAIR,
        beta_disk: false,
        fdc_present: false,
        z80_hw_mode: 12,
        szx_id: 3,
    },
    MachineProfile {
        id: MachineId::Plus2a,
        ram_pages: 8,
        rom_banks: 4,
        rom_file: "plus3.rom",
        basic_rom_bank: 3,
        paging: PagingModel::Plus2a,
        ula: UlaProfile::Ula3,
        contention: ContentionFlags {
            mreq: true,
            io: false,
            internal: false,
        },
        delay_pattern: DELAY_PLUS3,
        int_pulse_tstates: 32,
        ay_present: true,
        ay_clock_hz: AY_CLOCK_SINCLAIR,
        beta_disk: false,
        fdc_present: false,
        z80_hw_mode: 13,
        szx_id: 4,
    },
    MachineProfile {
        id: MachineId::Plus3,
        ram_pages: 8,
        rom_banks: 4,
        rom_file: "plus3.rom",
        basic_rom_bank: 3,
        paging: PagingModel::Plus2a,
        ula: UlaProfile::Ula3,
        contention: ContentionFlags {
            mreq: true,
            io: false,
            internal: false,
        },
        delay_pattern: DELAY_PLUS3,
        int_pulse_tstates: 32,
        ay_present: true,
        ay_clock_hz: AY_CLOCK_SINCLAIR,
        beta_disk: false,
        fdc_present: true,
        z80_hw_mode: 7,
        szx_id: 5,
    },
    MachineProfile {
        id: MachineId::Pentagon128,
        ram_pages: 8,
        rom_banks: 2,
        rom_file: "pentagon.rom",
        basic_rom_bank: 1,
        paging: PagingModel::Bank128,
        ula: UlaProfile::NoContention,
        contention: ContentionFlags::NONE,
        delay_pattern: DELAY_NONE,
        int_pulse_tstates: 36,
        ay_present: true,
        ay_clock_hz: AY_CLOCK_PENTAGON,
        beta_disk: true,
        fdc_present: false,
        z80_hw_mode: 9,
        szx_id: 7,
    },
    MachineProfile {
        id: MachineId::Pentagon1024,
        ram_pages: 64,
        rom_banks: 2,
        rom_file: "pentagon1024.rom",
        basic_rom_bank: 1,
        paging: PagingModel::Pentagon1024,
        ula: UlaProfile::NoContention,
        contention: ContentionFlags::NONE,
        delay_pattern: DELAY_NONE,
        int_pulse_tstates: 36,
        ay_present: true,
        ay_clock_hz: AY_CLOCK_PENTAGON,
        beta_disk: true,
        fdc_present: false,
        z80_hw_mode: 9,
        szx_id: 14,
    },
    MachineProfile {
        id: MachineId::Scorpion256,
        ram_pages: 16,
        rom_banks: 4,
        rom_file: "scorpion.rom",
        basic_rom_bank: 1,
        paging: PagingModel::Scorpion,
        ula: UlaProfile::NoContention,
        contention: ContentionFlags::NONE,
        delay_pattern: DELAY_NONE,
        int_pulse_tstates: 36,
        ay_present: true,
        ay_clock_hz: AY_CLOCK_SINCLAIR,
        beta_disk: true,
        fdc_present: false,
        z80_hw_mode: 10,
        szx_id: 10,
    },
];

/// Look up the immutable profile for a machine id.
pub fn profile(id: MachineId) -> &'static MachineProfile {
    PROFILES.iter().find(|p| p.id == id).unwrap()
}

/// Map a .z80 snapshot hardware-mode byte to a machine.
///
/// Version 2 headers (23-byte extension) and version 3 headers (54/55 bytes)
/// assign different meanings to several mode values; hardware mode 9 is
/// Pentagon in either version.
pub fn profile_by_z80_hw_mode(hw_mode: u8, ext_header_len: u16) -> MachineId {
    let v3 = ext_header_len > 23;
    match hw_mode {
        0 | 1 | 2 => MachineId::Spectrum48,
        3 => {
            if v3 {
                MachineId::Spectrum48
            } else {
                MachineId::Spectrum128
            }
        }
        4 | 5 | 6 => MachineId::Spectrum128,
        7 | 8 => MachineId::Plus3,
        9 => MachineId::Pentagon128,
        10 => MachineId::Scorpion256,
        12 => MachineId::Plus2,
        13 => MachineId::Plus2a,
        _ => MachineId::Spectrum48,
    }
}

/// Map an .szx machine id to a machine. `None` for models outside the
/// supported set (TC2048, SE and friends).
pub fn profile_by_szx_id(id: u8) -> Option<MachineId> {
    match id {
        0 | 1 => Some(MachineId::Spectrum48),
        2 => Some(MachineId::Spectrum128),
        3 => Some(MachineId::Plus2),
        4 => Some(MachineId::Plus2a),
        5 | 6 => Some(MachineId::Plus3),
        7 => Some(MachineId::Pentagon128),
        10 => Some(MachineId::Scorpion256),
        13 | 14 => Some(MachineId::Pentagon1024),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_consistent() {
        for p in &PROFILES {
            assert_eq!(profile(p.id).szx_id, p.szx_id);
            if p.paging == PagingModel::None {
                assert_eq!(p.ram_pages, 0);
            } else {
                assert!(p.ram_pages >= 8);
            }
        }
    }

    #[test]
    fn z80_hw_mode_9_is_always_pentagon() {
        assert_eq!(profile_by_z80_hw_mode(9, 23), MachineId::Pentagon128);
        assert_eq!(profile_by_z80_hw_mode(9, 54), MachineId::Pentagon128);
    }

    #[test]
    fn z80_hw_mode_3_differs_by_version() {
        assert_eq!(profile_by_z80_hw_mode(3, 23), MachineId::Spectrum128);
        assert_eq!(profile_by_z80_hw_mode(3, 55), MachineId::Spectrum48);
    }

    #[test]
    fn szx_ids_cover_supported_models() {
        assert_eq!(profile_by_szx_id(5), Some(MachineId::Plus3));
        assert_eq!(profile_by_szx_id(14), Some(MachineId::Pentagon1024));
        assert_eq!(profile_by_szx_id(8), None);
    }

    #[test]
    fn plus3_is_the_only_fdc_machine() {
        for p in &PROFILES {
            assert_eq!(p.fdc_present, p.id == MachineId::Plus3);
        }
    }
}
