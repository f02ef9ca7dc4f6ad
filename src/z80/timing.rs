/*!
Symbolic T-state timing for decoded instructions.

Conditional instructions report both paths as `taken/not-taken` ("13/8" for
DJNZ, "11/5" for RET cc); repeating block operations report "21/16". The
tables split by prefix exactly as the decoder does, so the string for an
address always matches the instruction `disasm` reports there.
*/

use super::ReadByte;

/// T-state count for the instruction at `addr`, as a symbolic string.
pub fn tstates<M: ReadByte + ?Sized>(mem: &M, addr: u16) -> &'static str {
    let op = mem.read_byte(addr);
    match op {
        0xDD | 0xFD => {
            let next = mem.read_byte(addr.wrapping_add(1));
            if matches!(next, 0xDD | 0xFD | 0xED) {
                return "4"; // redundant prefix decodes as DEFB
            }
            if next == 0xCB {
                let op = mem.read_byte(addr.wrapping_add(3));
                return if (op >> 6) == 1 { "20" } else { "23" };
            }
            indexed_tstates(next)
        }
        0xED => {
            let next = mem.read_byte(addr.wrapping_add(1));
            if matches!(next, 0xDD | 0xFD | 0xED | 0xCB) {
                return "4";
            }
            ed_tstates(next)
        }
        0xCB => cb_tstates(mem.read_byte(addr.wrapping_add(1))),
        _ => main_tstates(op),
    }
}

fn main_tstates(op: u8) -> &'static str {
    let x = op >> 6;
    let y = (op >> 3) & 7;
    let z = op & 7;
    let p = y >> 1;
    let q = y & 1;
    match x {
        0 => match z {
            0 => match y {
                0 | 1 => "4",
                2 => "13/8",
                3 => "12",
                _ => "12/7",
            },
            1 => {
                if q == 0 {
                    "10"
                } else {
                    "11"
                }
            }
            2 => match p {
                0 | 1 => "7",
                2 => "16",
                _ => "13",
            },
            3 => "6",
            4 | 5 => {
                if y == 6 {
                    "11"
                } else {
                    "4"
                }
            }
            6 => {
                if y == 6 {
                    "10"
                } else {
                    "7"
                }
            }
            _ => "4",
        },
        1 => {
            if y == 6 || z == 6 {
                if y == 6 && z == 6 {
                    "4" // HALT
                } else {
                    "7"
                }
            } else {
                "4"
            }
        }
        2 => {
            if z == 6 {
                "7"
            } else {
                "4"
            }
        }
        _ => match z {
            0 => "11/5",
            1 => {
                if q == 0 {
                    "10"
                } else {
                    match p {
                        0 => "10",
                        1 | 2 => "4",
                        _ => "6",
                    }
                }
            }
            2 => "10",
            3 => match y {
                0 => "10",
                2 | 3 => "11",
                4 => "19",
                _ => "4",
            },
            4 => "17/10",
            5 => {
                if q == 0 {
                    "11"
                } else {
                    "17"
                }
            }
            6 => "7",
            _ => "11",
        },
    }
}

fn cb_tstates(op: u8) -> &'static str {
    let x = op >> 6;
    let z = op & 7;
    if z == 6 {
        if x == 1 {
            "12" // BIT n,(HL)
        } else {
            "15"
        }
    } else {
        "8"
    }
}

fn ed_tstates(op: u8) -> &'static str {
    let x = op >> 6;
    let y = (op >> 3) & 7;
    let z = op & 7;
    if x == 1 {
        return match z {
            0 | 1 => "12",
            2 => "15",
            3 => "20",
            4 => "8",
            5 => "14",
            6 => "8",
            _ => match y {
                0..=3 => "9",
                4 | 5 => "18",
                _ => "8",
            },
        };
    }
    if x == 2 && z <= 3 {
        return match y {
            4 | 5 => "16",
            6 | 7 => "21/16",
            _ => "8",
        };
    }
    "8"
}

fn indexed_tstates(op: u8) -> &'static str {
    let x = op >> 6;
    let y = (op >> 3) & 7;
    let z = op & 7;
    match op {
        0x21 => return "14",                 // LD IX,nn
        0x22 | 0x2A => return "20",          // LD (nn),IX / LD IX,(nn)
        0x23 | 0x2B => return "10",          // INC/DEC IX
        0x34 | 0x35 => return "23",          // INC/DEC (IX+d)
        0x36 => return "19",                 // LD (IX+d),n
        0x26 | 0x2E => return "11",          // LD IXH/IXL,n
        0xE1 => return "14",                 // POP IX
        0xE3 => return "23",                 // EX (SP),IX
        0xE5 => return "15",                 // PUSH IX
        0xE9 => return "8",                  // JP (IX)
        0xF9 => return "10",                 // LD SP,IX
        0x09 | 0x19 | 0x29 | 0x39 => return "15", // ADD IX,rp
        _ => {}
    }
    match x {
        0 if z == 4 || z == 5 => "8", // INC/DEC IXH/IXL
        1 => {
            if y == 6 || z == 6 {
                "19"
            } else {
                "8"
            }
        }
        2 => {
            if z == 6 {
                "19"
            } else {
                "8"
            }
        }
        _ => "8",
    }
}
