/*!
Z80 disassembler: full documented + undocumented instruction set with
DD/FD/ED/CB prefix chains.

Decode rules:
- A DD or FD immediately followed by another DD/FD/ED decodes as a one-byte
  `DEFB` covering just the first prefix; an ED followed by DD/FD/ED/CB does
  the same. The second byte is decoded fresh on the next call.
- DD CB d op / FD CB d op split `op` into (x, y, z); the undocumented
  result-copy forms append `,r[z]` when `z != 6`.
- DD/FD prefixes substitute `(HL)` with `(IX+d)` and, only when the
  instruction has no memory operand, `H`/`L` with `IXH`/`IXL`. `LD` forms
  that touch memory keep the plain `H`/`L` name.
- Combinations the hardware leaves undefined degrade to a NOP decode; the
  caller always receives valid bytes with length >= 1.

Control-flow targets land in `refs` when requested, tagged by kind, so a
debugger can build cross-reference maps without re-parsing mnemonics.
*/

use super::{
    disp, hex, indexed, IndexReg, ReadByte, ALU, BLOCK, CC, IM_MODE, R8, ROT, RP, RP2,
};

/// Reference kinds attached to decoded control-flow and address operands.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RefKind {
    Jp,
    Jr,
    Djnz,
    Call,
    Rst,
    LdImm,
    LdInd,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Ref {
    pub kind: RefKind,
    pub target: u16,
}

/// One decoded instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedInstr {
    pub addr: u16,
    pub bytes: Vec<u8>,
    pub mnemonic: String,
    pub length: u8,
    pub refs: Vec<Ref>,
}

struct Cursor<'a, M: ReadByte + ?Sized> {
    mem: &'a M,
    start: u16,
    len: u16,
    bytes: Vec<u8>,
    refs: Vec<Ref>,
    want_refs: bool,
}

impl<'a, M: ReadByte + ?Sized> Cursor<'a, M> {
    fn new(mem: &'a M, start: u16, want_refs: bool) -> Self {
        Self {
            mem,
            start,
            len: 0,
            bytes: Vec::with_capacity(4),
            refs: Vec::new(),
            want_refs,
        }
    }

    fn next(&mut self) -> u8 {
        let b = self.mem.read_byte(self.start.wrapping_add(self.len));
        self.bytes.push(b);
        self.len += 1;
        b
    }

    fn word(&mut self) -> u16 {
        let lo = self.next() as u16;
        let hi = self.next() as u16;
        (hi << 8) | lo
    }

    /// Address of the byte after everything consumed so far.
    fn pc(&self) -> u16 {
        self.start.wrapping_add(self.len)
    }

    fn reference(&mut self, kind: RefKind, target: u16) {
        if self.want_refs {
            self.refs.push(Ref { kind, target });
        }
    }

    fn finish(self, mnemonic: String) -> DecodedInstr {
        DecodedInstr {
            addr: self.start,
            bytes: self.bytes,
            mnemonic,
            length: self.len as u8,
            refs: self.refs,
        }
    }
}

/// Disassemble one instruction at `addr`.
pub fn disassemble<M: ReadByte + ?Sized>(mem: &M, addr: u16, want_refs: bool) -> DecodedInstr {
    let mut cur = Cursor::new(mem, addr, want_refs);
    let op = cur.next();
    let text = match op {
        0xDD => decode_indexed(&mut cur, IndexReg::Ix),
        0xFD => decode_indexed(&mut cur, IndexReg::Iy),
        0xED => decode_ed(&mut cur),
        0xCB => {
            let op = cur.next();
            decode_cb(op)
        }
        _ => decode_main(&mut cur, op),
    };
    cur.finish(text)
}

/// DD/FD prefix decode, including the redundant-prefix DEFB rule.
fn decode_indexed<M: ReadByte + ?Sized>(cur: &mut Cursor<M>, ir: IndexReg) -> String {
    // Peek without consuming: a second prefix byte terminates this decode
    // as a one-byte DEFB.
    let next = cur.mem.read_byte(cur.pc());
    if matches!(next, 0xDD | 0xFD | 0xED) {
        return format!("DEFB {}", hex(ir.prefix() as u32));
    }
    let op = cur.next();
    if op == 0xCB {
        let d = cur.next() as i8;
        let op = cur.next();
        return decode_indexed_cb(ir, d, op);
    }

    let x = op >> 6;
    let y = (op >> 3) & 7;
    let z = op & 7;
    let p = y >> 1;
    let q = y & 1;

    match (x, z) {
        // ADD IX,rp with the HL slot mapping to IX itself.
        (0, 1) if q == 1 => {
            let rhs = if p == 2 { ir.name() } else { RP[p as usize] };
            return format!("ADD {},{}", ir.name(), rhs);
        }
        (0, 1) if p == 2 => {
            let nn = cur.word();
            cur.reference(RefKind::LdImm, nn);
            return format!("LD {},{}", ir.name(), hex(nn as u32));
        }
        (0, 2) if p == 2 => {
            let nn = cur.word();
            cur.reference(RefKind::LdInd, nn);
            return if q == 0 {
                format!("LD ({}),{}", hex(nn as u32), ir.name())
            } else {
                format!("LD {},({})", ir.name(), hex(nn as u32))
            };
        }
        (0, 3) if p == 2 => {
            return if q == 0 {
                format!("INC {}", ir.name())
            } else {
                format!("DEC {}", ir.name())
            };
        }
        (0, 4) | (0, 5) if (4..=6).contains(&y) => {
            let verb = if z == 4 { "INC" } else { "DEC" };
            return if y == 6 {
                let d = cur.next() as i8;
                format!("{verb} {}", indexed(ir, d))
            } else {
                format!("{verb} {}", ir.half(y == 4))
            };
        }
        (0, 6) if (4..=6).contains(&y) => {
            return if y == 6 {
                let d = cur.next() as i8;
                let n = cur.next();
                format!("LD {},{}", indexed(ir, d), hex(n as u32))
            } else {
                let n = cur.next();
                format!("LD {},{}", ir.half(y == 4), hex(n as u32))
            };
        }
        (1, _) => {
            // LD r,r' family. Memory forms keep plain H/L names.
            if y == 6 && z == 6 {
                return nop_fallback();
            }
            if y == 6 {
                let d = cur.next() as i8;
                return format!("LD {},{}", indexed(ir, d), R8[z as usize]);
            }
            if z == 6 {
                let d = cur.next() as i8;
                return format!("LD {},{}", R8[y as usize], indexed(ir, d));
            }
            if (4..=5).contains(&y) || (4..=5).contains(&z) {
                let dst = if (4..=5).contains(&y) {
                    ir.half(y == 4).to_string()
                } else {
                    R8[y as usize].to_string()
                };
                let src = if (4..=5).contains(&z) {
                    ir.half(z == 4).to_string()
                } else {
                    R8[z as usize].to_string()
                };
                return format!("LD {dst},{src}");
            }
            return nop_fallback();
        }
        (2, _) => {
            if z == 6 {
                let d = cur.next() as i8;
                return format!("{}{}", ALU[y as usize], indexed(ir, d));
            }
            if (4..=5).contains(&z) {
                return format!("{}{}", ALU[y as usize], ir.half(z == 4));
            }
            return nop_fallback();
        }
        _ => {}
    }

    match op {
        0xE1 => format!("POP {}", ir.name()),
        0xE3 => format!("EX (SP),{}", ir.name()),
        0xE5 => format!("PUSH {}", ir.name()),
        0xE9 => format!("JP ({})", ir.name()),
        0xF9 => format!("LD SP,{}", ir.name()),
        _ => nop_fallback(),
    }
}

fn nop_fallback() -> String {
    "NOP".to_string()
}

/// DD CB d op / FD CB d op: indexed bit operations, with the undocumented
/// result-copy register appended for `z != 6`.
fn decode_indexed_cb(ir: IndexReg, d: i8, op: u8) -> String {
    let x = op >> 6;
    let y = (op >> 3) & 7;
    let z = op & 7;
    let target = indexed(ir, d);
    match x {
        0 => {
            if z == 6 {
                format!("{} {}", ROT[y as usize], target)
            } else {
                format!("{} {},{}", ROT[y as usize], target, R8[z as usize])
            }
        }
        1 => format!("BIT {y},{target}"),
        2 => {
            if z == 6 {
                format!("RES {y},{target}")
            } else {
                format!("RES {y},{target},{}", R8[z as usize])
            }
        }
        _ => {
            if z == 6 {
                format!("SET {y},{target}")
            } else {
                format!("SET {y},{target},{}", R8[z as usize])
            }
        }
    }
}

fn decode_cb(op: u8) -> String {
    let x = op >> 6;
    let y = (op >> 3) & 7;
    let z = op & 7;
    match x {
        0 => format!("{} {}", ROT[y as usize], R8[z as usize]),
        1 => format!("BIT {y},{}", R8[z as usize]),
        2 => format!("RES {y},{}", R8[z as usize]),
        _ => format!("SET {y},{}", R8[z as usize]),
    }
}

fn decode_ed<M: ReadByte + ?Sized>(cur: &mut Cursor<M>) -> String {
    let next = cur.mem.read_byte(cur.pc());
    if matches!(next, 0xDD | 0xFD | 0xED | 0xCB) {
        return format!("DEFB {}", hex(0xED));
    }
    let op = cur.next();
    let x = op >> 6;
    let y = (op >> 3) & 7;
    let z = op & 7;
    let p = y >> 1;
    let q = y & 1;

    if x == 1 {
        return match z {
            0 => {
                if y == 6 {
                    "IN F,(C)".to_string()
                } else {
                    format!("IN {},(C)", R8[y as usize])
                }
            }
            1 => {
                if y == 6 {
                    "OUT (C),0".to_string()
                } else {
                    format!("OUT (C),{}", R8[y as usize])
                }
            }
            2 => {
                let verb = if q == 0 { "SBC" } else { "ADC" };
                format!("{verb} HL,{}", RP[p as usize])
            }
            3 => {
                let nn = cur.word();
                cur.reference(RefKind::LdInd, nn);
                if q == 0 {
                    format!("LD ({}),{}", hex(nn as u32), RP[p as usize])
                } else {
                    format!("LD {},({})", RP[p as usize], hex(nn as u32))
                }
            }
            4 => "NEG".to_string(),
            5 => {
                if y == 1 {
                    "RETI".to_string()
                } else {
                    "RETN".to_string()
                }
            }
            6 => format!("IM {}", IM_MODE[y as usize]),
            _ => match y {
                0 => "LD I,A".to_string(),
                1 => "LD R,A".to_string(),
                2 => "LD A,I".to_string(),
                3 => "LD A,R".to_string(),
                4 => "RRD".to_string(),
                5 => "RLD".to_string(),
                _ => nop_fallback(),
            },
        };
    }
    if x == 2 && y >= 4 && z <= 3 {
        return BLOCK[(y - 4) as usize][z as usize].to_string();
    }
    nop_fallback()
}

fn decode_main<M: ReadByte + ?Sized>(cur: &mut Cursor<M>, op: u8) -> String {
    let x = op >> 6;
    let y = (op >> 3) & 7;
    let z = op & 7;
    let p = y >> 1;
    let q = y & 1;

    match x {
        0 => match z {
            0 => match y {
                0 => "NOP".to_string(),
                1 => "EX AF,AF'".to_string(),
                2 => {
                    let d = cur.next() as i8;
                    let target = cur.pc().wrapping_add(d as u16);
                    cur.reference(RefKind::Djnz, target);
                    format!("DJNZ {}", hex(target as u32))
                }
                3 => {
                    let d = cur.next() as i8;
                    let target = cur.pc().wrapping_add(d as u16);
                    cur.reference(RefKind::Jr, target);
                    format!("JR {}", hex(target as u32))
                }
                _ => {
                    let d = cur.next() as i8;
                    let target = cur.pc().wrapping_add(d as u16);
                    cur.reference(RefKind::Jr, target);
                    format!("JR {},{}", CC[(y - 4) as usize], hex(target as u32))
                }
            },
            1 => {
                if q == 0 {
                    let nn = cur.word();
                    cur.reference(RefKind::LdImm, nn);
                    format!("LD {},{}", RP[p as usize], hex(nn as u32))
                } else {
                    format!("ADD HL,{}", RP[p as usize])
                }
            }
            2 => match (q, p) {
                (0, 0) => "LD (BC),A".to_string(),
                (0, 1) => "LD (DE),A".to_string(),
                (0, 2) => {
                    let nn = cur.word();
                    cur.reference(RefKind::LdInd, nn);
                    format!("LD ({}),HL", hex(nn as u32))
                }
                (0, _) => {
                    let nn = cur.word();
                    cur.reference(RefKind::LdInd, nn);
                    format!("LD ({}),A", hex(nn as u32))
                }
                (1, 0) => "LD A,(BC)".to_string(),
                (1, 1) => "LD A,(DE)".to_string(),
                (1, 2) => {
                    let nn = cur.word();
                    cur.reference(RefKind::LdInd, nn);
                    format!("LD HL,({})", hex(nn as u32))
                }
                _ => {
                    let nn = cur.word();
                    cur.reference(RefKind::LdInd, nn);
                    format!("LD A,({})", hex(nn as u32))
                }
            },
            3 => {
                if q == 0 {
                    format!("INC {}", RP[p as usize])
                } else {
                    format!("DEC {}", RP[p as usize])
                }
            }
            4 => format!("INC {}", R8[y as usize]),
            5 => format!("DEC {}", R8[y as usize]),
            6 => {
                let n = cur.next();
                format!("LD {},{}", R8[y as usize], hex(n as u32))
            }
            _ => ["RLCA", "RRCA", "RLA", "RRA", "DAA", "CPL", "SCF", "CCF"][y as usize]
                .to_string(),
        },
        1 => {
            if y == 6 && z == 6 {
                "HALT".to_string()
            } else {
                format!("LD {},{}", R8[y as usize], R8[z as usize])
            }
        }
        2 => format!("{}{}", ALU[y as usize], R8[z as usize]),
        _ => match z {
            0 => format!("RET {}", CC[y as usize]),
            1 => {
                if q == 0 {
                    format!("POP {}", RP2[p as usize])
                } else {
                    match p {
                        0 => "RET".to_string(),
                        1 => "EXX".to_string(),
                        2 => "JP (HL)".to_string(),
                        _ => "LD SP,HL".to_string(),
                    }
                }
            }
            2 => {
                let nn = cur.word();
                cur.reference(RefKind::Jp, nn);
                format!("JP {},{}", CC[y as usize], hex(nn as u32))
            }
            3 => match y {
                0 => {
                    let nn = cur.word();
                    cur.reference(RefKind::Jp, nn);
                    format!("JP {}", hex(nn as u32))
                }
                2 => {
                    let n = cur.next();
                    format!("OUT ({}),A", hex(n as u32))
                }
                3 => {
                    let n = cur.next();
                    format!("IN A,({})", hex(n as u32))
                }
                4 => "EX (SP),HL".to_string(),
                5 => "EX DE,HL".to_string(),
                6 => "DI".to_string(),
                _ => "EI".to_string(),
            },
            4 => {
                let nn = cur.word();
                cur.reference(RefKind::Call, nn);
                format!("CALL {},{}", CC[y as usize], hex(nn as u32))
            }
            5 => {
                if q == 0 {
                    format!("PUSH {}", RP2[p as usize])
                } else {
                    // p = 1/2/3 are the DD/ED/FD prefixes, handled before
                    // decode_main is entered; only CALL nn remains.
                    let nn = cur.word();
                    cur.reference(RefKind::Call, nn);
                    format!("CALL {}", hex(nn as u32))
                }
            }
            6 => {
                let n = cur.next();
                format!("{}{}", ALU[y as usize], hex(n as u32))
            }
            _ => {
                let target = (y * 8) as u16;
                cur.reference(RefKind::Rst, target);
                format!("RST {}", hex(target as u32))
            }
        },
    }
}

/// Find a start address from which `rows` decoded instructions land exactly
/// on `target`, scanning backward up to `4 * (rows + 2)` bytes. Falls back
/// to the target itself when no alignment exists.
///
/// Debugger views use this to keep a fixed number of rows above the cursor
/// stable while scrolling backward through unaligned code.
pub fn find_position<M: ReadByte + ?Sized>(mem: &M, target: u16, rows: usize) -> u16 {
    if rows == 0 {
        return target;
    }
    let max_back = 4 * (rows + 2);
    for back in rows..=max_back {
        let start = target.wrapping_sub(back as u16);
        let mut addr = start;
        for _ in 0..rows {
            addr = addr.wrapping_add(disassemble(mem, addr, false).length as u16);
        }
        if addr == target {
            return start;
        }
    }
    target
}
