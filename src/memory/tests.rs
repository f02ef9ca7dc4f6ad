//! Integration tests for the memory facade: paging port writes observed
//! through CPU-visible reads and writes.

use super::Memory;
use crate::machine::{profile, MachineId};

fn mem(id: MachineId) -> Memory {
    Memory::new(profile(id))
}

/// Stamp each ROM bank with a recognizable first byte.
fn stamp_roms(m: &mut Memory, banks: usize) {
    for b in 0..banks {
        let mut image = vec![0u8; 16];
        image[0] = 0xA0 + b as u8;
        m.load_rom_bank(b, &image);
    }
}

#[test]
fn spectrum48_has_no_paging() {
    let mut m = mem(MachineId::Spectrum48);
    stamp_roms(&mut m, 1);
    assert_eq!(m.read(0x0000), 0xA0);
    m.write(0x0000, 0x55);
    assert_eq!(m.read(0x0000), 0xA0, "ROM writes are dropped");
    m.write(0x8000, 0x42);
    assert_eq!(m.read(0x8000), 0x42);
    // 7FFD writes change nothing.
    m.write_port(0x7FFD, 0x17);
    assert_eq!(m.state().cur_ram_bank, 0);
}

#[test]
fn bank128_selects_ram_rom_and_screen() {
    let mut m = mem(MachineId::Spectrum128);
    stamp_roms(&mut m, 2);
    // Make bank 3 recognizable.
    m.write_port(0x7FFD, 0x03);
    m.write(0xC000, 0x33);
    m.write_port(0x7FFD, 0x00);
    assert_eq!(m.read(0xC000), 0x00);
    m.write_port(0x7FFD, 0x03);
    assert_eq!(m.read(0xC000), 0x33);
    // ROM bank follows bit 4.
    assert_eq!(m.read(0x0000), 0xA0);
    m.write_port(0x7FFD, 0x10);
    assert_eq!(m.read(0x0000), 0xA1);
    // Screen bank follows bit 3.
    m.write_port(0x7FFD, 0x08);
    assert_eq!(m.state().screen_bank, 7);
    m.write_port(0x7FFD, 0x00);
    assert_eq!(m.state().screen_bank, 5);
}

#[test]
fn bank5_and_bank2_are_fixed_slots() {
    let mut m = mem(MachineId::Spectrum128);
    m.write(0x4000, 0x55);
    m.write(0x8000, 0x22);
    // Map bank 5 at 0xC000 and observe the same byte.
    m.write_port(0x7FFD, 0x05);
    assert_eq!(m.read(0xC000), 0x55);
    m.write_port(0x7FFD, 0x02);
    assert_eq!(m.read(0xC000), 0x22);
}

#[test]
fn paging_lock_latches_until_reset() {
    let mut m = mem(MachineId::Spectrum128);
    stamp_roms(&mut m, 2);
    m.write_port(0x7FFD, 0x23); // bank 3 + lock
    let before = m.state().clone();
    for val in [0x00u8, 0x07, 0x10, 0x08, 0x3F] {
        m.write_port(0x7FFD, val);
        assert_eq!(m.state(), &before, "lock must ignore value {val:#x}");
    }
    m.reset();
    assert!(!m.state().paging_disabled);
    m.write_port(0x7FFD, 0x01);
    assert_eq!(m.state().cur_ram_bank, 1);
}

#[test]
fn plus2a_special_paging_all_ram() {
    // S4: 1FFD bit 0 set maps RAM 0/1/2/3 across the address space.
    let mut m = mem(MachineId::Plus2a);
    stamp_roms(&mut m, 4);
    m.write_port(0x1FFD, 0x01);
    assert_eq!(m.state().special_banks, [0, 1, 2, 3]);
    for (slot, marker) in [(0u16, 0x10u8), (1, 0x11), (2, 0x12), (3, 0x13)] {
        let addr = slot << 14;
        m.write(addr, marker);
        assert_eq!(m.read(addr), marker, "slot {slot} must accept writes");
    }
    // Returning to normal paging restores ROM at slot 0.
    m.write_port(0x1FFD, 0x00);
    assert_eq!(m.read(0x0000), 0xA0);
    // RAM 0 still holds the special-mode write, now visible nowhere at
    // slot 0 but reachable as bank 0 at 0xC000.
    m.write_port(0x7FFD, 0x00);
    assert_eq!(m.read(0xC000), 0x10);
}

#[test]
fn plus3_rom_bank_combines_both_ports() {
    let mut m = mem(MachineId::Plus3);
    stamp_roms(&mut m, 4);
    m.write_port(0x7FFD, 0x00);
    m.write_port(0x1FFD, 0x00);
    assert_eq!(m.read(0x0000), 0xA0);
    m.write_port(0x7FFD, 0x10);
    assert_eq!(m.read(0x0000), 0xA1);
    m.write_port(0x1FFD, 0x04);
    assert_eq!(m.read(0x0000), 0xA3, "1FFD bit 2 is the high ROM bit");
    m.write_port(0x7FFD, 0x00);
    assert_eq!(m.read(0x0000), 0xA2);
}

#[test]
fn trdos_pages_over_rom() {
    let mut m = mem(MachineId::Pentagon128);
    stamp_roms(&mut m, 2);
    let mut trdos = vec![0u8; 16];
    trdos[0] = 0xBD;
    m.load_trdos_rom(&trdos);
    assert_eq!(m.read(0x0000), 0xA0);
    m.set_trdos_active(true);
    assert_eq!(m.read(0x0000), 0xBD);
    m.set_trdos_active(false);
    assert_eq!(m.read(0x0000), 0xA0);
}

#[test]
fn scorpion_trdos_is_rom_bank_3() {
    let mut m = mem(MachineId::Scorpion256);
    stamp_roms(&mut m, 4);
    m.set_trdos_active(true);
    assert_eq!(m.read(0x0000), 0xA3);
}

#[test]
fn scorpion_ram_over_rom_is_writable() {
    let mut m = mem(MachineId::Scorpion256);
    stamp_roms(&mut m, 4);
    m.write_port(0x1FFD, 0x01);
    m.write(0x0000, 0x99);
    assert_eq!(m.read(0x0000), 0x99);
    m.write_port(0x1FFD, 0x00);
    assert_eq!(m.read(0x0000), 0xA0);
}

#[test]
fn pentagon_ram_over_rom_via_eff7() {
    let mut m = mem(MachineId::Pentagon1024);
    stamp_roms(&mut m, 2);
    m.write_port(0xEFF7, 0x08 | 0x04);
    m.write(0x0000, 0x77);
    assert_eq!(m.read(0x0000), 0x77);
    m.write_port(0xEFF7, 0x04);
    assert_eq!(m.read(0x0000), 0xA0);
}

#[test]
fn debug_poke_edits_rom_only_when_allowed() {
    let mut m = mem(MachineId::Spectrum48);
    stamp_roms(&mut m, 1);
    m.poke(0x0000, 0x11);
    assert_eq!(m.read(0x0000), 0xA0);
    m.set_allow_rom_edit(true);
    m.poke(0x0000, 0x11);
    assert_eq!(m.read(0x0000), 0x11);
}

#[test]
fn port_reads_float_high() {
    let mut m = mem(MachineId::Spectrum128);
    assert_eq!(m.read_port(0x7FFD), 0xFF);
}

#[test]
fn hooks_observe_accesses() {
    use std::cell::RefCell;
    use std::rc::Rc;
    let seen = Rc::new(RefCell::new(Vec::new()));
    let mut m = mem(MachineId::Spectrum48);
    let log = seen.clone();
    m.set_write_hook(Some(Box::new(move |addr, val| {
        log.borrow_mut().push((addr, val));
    })));
    m.write(0x8000, 0x42);
    assert_eq!(seen.borrow().as_slice(), &[(0x8000, 0x42)]);
}
