/*!
Z80 encoder: mnemonic + operand texts -> bytes.

The inverse of the disassembler, built over the same register/condition
tables. Operand sub-expressions are evaluated through a caller-supplied
callback so the assembler can resolve symbols; an unresolved expression
encodes as zero with the `undefined` flag set, and the assembler re-emits on
a later pass once the symbol lands.

Error policy: invalid operand combinations, bad condition codes, bad RST
targets, bad bit indices and bad IM modes are `Err` diagnostics. JR/DJNZ
displacements outside [-128, 127] are a warning and wrap at byte level.
*/

use super::{IndexReg, CC, R8, ROT, RP};

/// Value returned by the expression callback.
#[derive(Copy, Clone, Debug)]
pub struct EvalValue {
    pub value: i64,
    pub undefined: bool,
}

impl EvalValue {
    pub fn known(value: i64) -> Self {
        Self {
            value,
            undefined: false,
        }
    }
}

/// One encode request: mnemonic, operand texts, and the address the
/// instruction will occupy (JR/DJNZ are PC-relative).
pub struct EncodeRequest<'a> {
    pub mnemonic: &'a str,
    pub operands: &'a [&'a str],
    pub addr: u16,
}

/// Encode result: bytes plus resolution state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub undefined: bool,
    pub warning: Option<String>,
}

impl Encoded {
    fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            undefined: false,
            warning: None,
        }
    }
}

/// Parsed shape of a single operand.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Op {
    /// 8-bit register index into `R8` (never 6).
    R(u8),
    MemHl,
    MemBc,
    MemDe,
    MemSp,
    MemC,
    /// 16-bit pair index into `RP`.
    Rp(u8),
    Af,
    AfAlt,
    IReg,
    RReg,
    FReg,
    Index(IndexReg),
    IndexHalf(IndexReg, bool),
    /// `(IX+expr)` / `(IY-expr)`; the signed expression text (may be empty).
    MemIndex(IndexReg, String),
    /// `(expr)` memory operand.
    MemImm(String),
    /// Bare expression.
    Imm(String),
}

/// Does the first character's parenthesis close only at the very end?
fn fully_parenthesized(s: &str) -> bool {
    let b = s.as_bytes();
    if b.is_empty() || b[0] != b'(' {
        return false;
    }
    let mut depth = 0usize;
    for (i, &c) in b.iter().enumerate() {
        match c {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return i == b.len() - 1;
                }
            }
            _ => {}
        }
    }
    false
}

fn classify(raw: &str) -> Op {
    let s = raw.trim();
    let up = s.to_ascii_uppercase();
    match up.as_str() {
        "A" => return Op::R(7),
        "B" => return Op::R(0),
        "C" => return Op::R(1),
        "D" => return Op::R(2),
        "E" => return Op::R(3),
        "H" => return Op::R(4),
        "L" => return Op::R(5),
        "I" => return Op::IReg,
        "R" => return Op::RReg,
        "F" => return Op::FReg,
        "BC" => return Op::Rp(0),
        "DE" => return Op::Rp(1),
        "HL" => return Op::Rp(2),
        "SP" => return Op::Rp(3),
        "AF" => return Op::Af,
        "AF'" | "AF`" => return Op::AfAlt,
        "IX" => return Op::Index(IndexReg::Ix),
        "IY" => return Op::Index(IndexReg::Iy),
        "IXH" => return Op::IndexHalf(IndexReg::Ix, true),
        "IXL" => return Op::IndexHalf(IndexReg::Ix, false),
        "IYH" => return Op::IndexHalf(IndexReg::Iy, true),
        "IYL" => return Op::IndexHalf(IndexReg::Iy, false),
        _ => {}
    }
    if fully_parenthesized(s) {
        let inner = s[1..s.len() - 1].trim();
        let inner_up = inner.to_ascii_uppercase();
        match inner_up.as_str() {
            "HL" => return Op::MemHl,
            "BC" => return Op::MemBc,
            "DE" => return Op::MemDe,
            "SP" => return Op::MemSp,
            "C" => return Op::MemC,
            "IX" => return Op::MemIndex(IndexReg::Ix, String::new()),
            "IY" => return Op::MemIndex(IndexReg::Iy, String::new()),
            _ => {}
        }
        if inner_up.starts_with("IX") || inner_up.starts_with("IY") {
            let ir = if inner_up.starts_with("IX") {
                IndexReg::Ix
            } else {
                IndexReg::Iy
            };
            let rest = inner[2..].trim();
            if rest.is_empty() || rest.starts_with('+') || rest.starts_with('-') {
                return Op::MemIndex(ir, rest.to_string());
            }
        }
        return Op::MemImm(inner.to_string());
    }
    Op::Imm(s.to_string())
}

fn cond_index(text: &str) -> Option<u8> {
    let up = text.trim().to_ascii_uppercase();
    CC.iter().position(|c| *c == up).map(|i| i as u8)
}

type Eval<'e> = dyn FnMut(&str) -> EvalValue + 'e;

struct Ctx<'a, 'e> {
    req: &'a EncodeRequest<'a>,
    eval: &'a mut Eval<'e>,
    undefined: bool,
    warning: Option<String>,
}

impl<'a, 'e> Ctx<'a, 'e> {
    fn byte(&mut self, expr: &str) -> Result<u8, String> {
        let v = (self.eval)(expr);
        if v.undefined {
            self.undefined = true;
            return Ok(0);
        }
        if !(-128..=255).contains(&v.value) {
            return Err(format!("value {} out of 8-bit range", v.value));
        }
        Ok((v.value & 0xFF) as u8)
    }

    fn word(&mut self, expr: &str) -> Result<u16, String> {
        let v = (self.eval)(expr);
        if v.undefined {
            self.undefined = true;
            return Ok(0);
        }
        if !(-32768..=65535).contains(&v.value) {
            return Err(format!("value {} out of 16-bit range", v.value));
        }
        Ok((v.value & 0xFFFF) as u16)
    }

    /// Signed index displacement; defaults to 0 for bare `(IX)`.
    fn displacement(&mut self, expr: &str) -> Result<u8, String> {
        if expr.is_empty() {
            return Ok(0);
        }
        let v = (self.eval)(expr);
        if v.undefined {
            self.undefined = true;
            return Ok(0);
        }
        if !(-128..=127).contains(&v.value) {
            return Err(format!("index displacement {} out of range", v.value));
        }
        Ok((v.value & 0xFF) as u8)
    }

    /// Relative displacement for JR/DJNZ: relative to the address after the
    /// two-byte instruction. Out of range warns and wraps modulo 256.
    fn relative(&mut self, expr: &str) -> Result<u8, String> {
        let v = (self.eval)(expr);
        if v.undefined {
            self.undefined = true;
            return Ok(0);
        }
        let origin = self.req.addr.wrapping_add(2) as i64;
        let delta = v.value - origin;
        if !(-128..=127).contains(&delta) {
            self.warning = Some(format!(
                "relative jump out of range ({delta}); displacement wraps"
            ));
        }
        Ok((delta & 0xFF) as u8)
    }
}

/// Encode one instruction. `Err` carries the diagnostic text; the assembler
/// routes it through the error collector and keeps going.
pub fn encode(req: &EncodeRequest, eval: &mut Eval) -> Result<Encoded, String> {
    let ops: Vec<Op> = req.operands.iter().map(|o| classify(o)).collect();
    let mut ctx = Ctx {
        req,
        eval,
        undefined: false,
        warning: None,
    };
    let m = req.mnemonic.to_ascii_uppercase();
    let bytes = dispatch(&m, &ops, req.operands, &mut ctx)?;
    Ok(Encoded {
        bytes,
        undefined: ctx.undefined,
        warning: ctx.warning,
    })
}

fn bad(m: &str) -> String {
    format!("invalid operands for {m}")
}

/// Does the encoder recognize this mnemonic? The assembler routes
/// unrecognized names to the macro and struct tables instead.
pub fn is_mnemonic(m: &str) -> bool {
    matches!(
        m.to_ascii_uppercase().as_str(),
        "NOP" | "HALT" | "DI" | "EI" | "EXX" | "DAA" | "CPL" | "SCF" | "CCF" | "RLCA"
            | "RRCA" | "RLA" | "RRA" | "NEG" | "RETI" | "RETN" | "RRD" | "RLD" | "LDI"
            | "LDD" | "LDIR" | "LDDR" | "CPI" | "CPD" | "CPIR" | "CPDR" | "INI" | "IND"
            | "INIR" | "INDR" | "OUTI" | "OUTD" | "OTIR" | "OTDR" | "LD" | "PUSH" | "POP"
            | "EX" | "ADD" | "ADC" | "SBC" | "SUB" | "AND" | "XOR" | "OR" | "CP" | "INC"
            | "DEC" | "RLC" | "RRC" | "RL" | "RR" | "SLA" | "SRA" | "SLL" | "SLI" | "SRL"
            | "BIT" | "RES" | "SET" | "JP" | "JR" | "DJNZ" | "CALL" | "RET" | "RST" | "IN"
            | "OUT" | "IM"
    )
}

fn dispatch(
    m: &str,
    ops: &[Op],
    raw: &[&str],
    ctx: &mut Ctx,
) -> Result<Vec<u8>, String> {
    match m {
        "NOP" => no_ops(m, ops, vec![0x00]),
        "HALT" => no_ops(m, ops, vec![0x76]),
        "DI" => no_ops(m, ops, vec![0xF3]),
        "EI" => no_ops(m, ops, vec![0xFB]),
        "EXX" => no_ops(m, ops, vec![0xD9]),
        "DAA" => no_ops(m, ops, vec![0x27]),
        "CPL" => no_ops(m, ops, vec![0x2F]),
        "SCF" => no_ops(m, ops, vec![0x37]),
        "CCF" => no_ops(m, ops, vec![0x3F]),
        "RLCA" => no_ops(m, ops, vec![0x07]),
        "RRCA" => no_ops(m, ops, vec![0x0F]),
        "RLA" => no_ops(m, ops, vec![0x17]),
        "RRA" => no_ops(m, ops, vec![0x1F]),
        "NEG" => no_ops(m, ops, vec![0xED, 0x44]),
        "RETI" => no_ops(m, ops, vec![0xED, 0x4D]),
        "RETN" => no_ops(m, ops, vec![0xED, 0x45]),
        "RRD" => no_ops(m, ops, vec![0xED, 0x67]),
        "RLD" => no_ops(m, ops, vec![0xED, 0x6F]),
        "LDI" => no_ops(m, ops, vec![0xED, 0xA0]),
        "LDD" => no_ops(m, ops, vec![0xED, 0xA8]),
        "LDIR" => no_ops(m, ops, vec![0xED, 0xB0]),
        "LDDR" => no_ops(m, ops, vec![0xED, 0xB8]),
        "CPI" => no_ops(m, ops, vec![0xED, 0xA1]),
        "CPD" => no_ops(m, ops, vec![0xED, 0xA9]),
        "CPIR" => no_ops(m, ops, vec![0xED, 0xB1]),
        "CPDR" => no_ops(m, ops, vec![0xED, 0xB9]),
        "INI" => no_ops(m, ops, vec![0xED, 0xA2]),
        "IND" => no_ops(m, ops, vec![0xED, 0xAA]),
        "INIR" => no_ops(m, ops, vec![0xED, 0xB2]),
        "INDR" => no_ops(m, ops, vec![0xED, 0xBA]),
        "OUTI" => no_ops(m, ops, vec![0xED, 0xA3]),
        "OUTD" => no_ops(m, ops, vec![0xED, 0xAB]),
        "OTIR" => no_ops(m, ops, vec![0xED, 0xB3]),
        "OTDR" => no_ops(m, ops, vec![0xED, 0xBB]),
        "LD" => encode_ld(ops, ctx),
        "PUSH" => encode_push_pop(m, ops, 0xC5),
        "POP" => encode_push_pop(m, ops, 0xC1),
        "EX" => encode_ex(ops),
        "ADD" => encode_add(ops, ctx),
        "ADC" => encode_adc_sbc(m, ops, ctx, 1, 0x4A),
        "SBC" => encode_adc_sbc(m, ops, ctx, 3, 0x42),
        "SUB" => encode_alu8(m, ops, ctx, 2),
        "AND" => encode_alu8(m, ops, ctx, 4),
        "XOR" => encode_alu8(m, ops, ctx, 5),
        "OR" => encode_alu8(m, ops, ctx, 6),
        "CP" => encode_alu8(m, ops, ctx, 7),
        "INC" => encode_inc_dec(m, ops, ctx, true),
        "DEC" => encode_inc_dec(m, ops, ctx, false),
        "RLC" | "RRC" | "RL" | "RR" | "SLA" | "SRA" | "SLL" | "SLI" | "SRL" => {
            encode_rot(m, ops, ctx)
        }
        "BIT" => encode_bitop(m, ops, raw, ctx, 1),
        "RES" => encode_bitop(m, ops, raw, ctx, 2),
        "SET" => encode_bitop(m, ops, raw, ctx, 3),
        "JP" => encode_jp(ops, raw, ctx),
        "JR" => encode_jr(ops, raw, ctx),
        "DJNZ" => match ops {
            [Op::Imm(e)] => {
                let d = ctx.relative(e)?;
                Ok(vec![0x10, d])
            }
            _ => Err(bad(m)),
        },
        "CALL" => encode_call(ops, raw, ctx),
        "RET" => match ops {
            [] => Ok(vec![0xC9]),
            [_] => {
                let cc = cond_index(raw[0]).ok_or_else(|| bad("RET"))?;
                Ok(vec![0xC0 + cc * 8])
            }
            _ => Err(bad(m)),
        },
        "RST" => match ops {
            [Op::Imm(e)] => {
                let v = (ctx.eval)(e);
                if v.undefined {
                    ctx.undefined = true;
                    return Ok(vec![0xC7]);
                }
                if v.value % 8 != 0 || !(0..=56).contains(&v.value) {
                    return Err(format!("invalid RST target {}", v.value));
                }
                Ok(vec![0xC7 + v.value as u8])
            }
            _ => Err(bad(m)),
        },
        "IN" => encode_in(ops, ctx),
        "OUT" => encode_out(ops, ctx),
        "IM" => match ops {
            [Op::Imm(e)] => {
                let v = (ctx.eval)(e);
                if v.undefined {
                    ctx.undefined = true;
                    return Ok(vec![0xED, 0x46]);
                }
                match v.value {
                    0 => Ok(vec![0xED, 0x46]),
                    1 => Ok(vec![0xED, 0x56]),
                    2 => Ok(vec![0xED, 0x5E]),
                    _ => Err(format!("invalid interrupt mode {}", v.value)),
                }
            }
            _ => Err(bad(m)),
        },
        _ => Err(format!("unknown mnemonic {m}")),
    }
}

fn no_ops(m: &str, ops: &[Op], bytes: Vec<u8>) -> Result<Vec<u8>, String> {
    if ops.is_empty() {
        Ok(bytes)
    } else {
        Err(format!("{m} takes no operands"))
    }
}

/// 8-bit source encodings shared by LD-to-register and the ALU family.
/// Returns (prefix, r-slot, trailing displacement) or falls back to an
/// immediate.
enum Src8 {
    Slot(Option<u8>, u8, Option<u8>),
    Imm(u8),
}

fn src8(op: &Op, ctx: &mut Ctx) -> Result<Src8, String> {
    match op {
        Op::R(r) => Ok(Src8::Slot(None, *r, None)),
        Op::MemHl => Ok(Src8::Slot(None, 6, None)),
        Op::IndexHalf(ir, hi) => Ok(Src8::Slot(
            Some(ir.prefix()),
            if *hi { 4 } else { 5 },
            None,
        )),
        Op::MemIndex(ir, e) => {
            let d = ctx.displacement(e)?;
            Ok(Src8::Slot(Some(ir.prefix()), 6, Some(d)))
        }
        Op::Imm(e) => Ok(Src8::Imm(ctx.byte(e)?)),
        _ => Err("invalid 8-bit operand".to_string()),
    }
}

fn encode_ld(ops: &[Op], ctx: &mut Ctx) -> Result<Vec<u8>, String> {
    if ops.len() != 2 {
        return Err(bad("LD"));
    }
    let (dst, src) = (&ops[0], &ops[1]);
    // Long forms come before the generic register moves.
    match (dst, src) {
        (Op::R(7), Op::IReg) => return Ok(vec![0xED, 0x57]),
        (Op::R(7), Op::RReg) => return Ok(vec![0xED, 0x5F]),
        (Op::IReg, Op::R(7)) => return Ok(vec![0xED, 0x47]),
        (Op::RReg, Op::R(7)) => return Ok(vec![0xED, 0x4F]),
        (Op::Rp(3), Op::Rp(2)) => return Ok(vec![0xF9]),
        (Op::Rp(3), Op::Index(ir)) => return Ok(vec![ir.prefix(), 0xF9]),
        (Op::R(7), Op::MemBc) => return Ok(vec![0x0A]),
        (Op::R(7), Op::MemDe) => return Ok(vec![0x1A]),
        (Op::MemBc, Op::R(7)) => return Ok(vec![0x02]),
        (Op::MemDe, Op::R(7)) => return Ok(vec![0x12]),
        (Op::MemHl, Op::MemHl) => {
            return Err("LD (HL),(HL) is not encodable (collides with HALT)".to_string())
        }
        _ => {}
    }
    match (dst, src) {
        // Indexed memory destination.
        (Op::MemIndex(ir, e), Op::R(r)) => {
            let d = ctx.displacement(e)?;
            return Ok(vec![ir.prefix(), 0x70 + r, d]);
        }
        (Op::MemIndex(ir, e), Op::Imm(n)) => {
            let d = ctx.displacement(e)?;
            let n = ctx.byte(n)?;
            return Ok(vec![ir.prefix(), 0x36, d, n]);
        }
        (Op::R(r), Op::MemIndex(ir, e)) => {
            let d = ctx.displacement(e)?;
            return Ok(vec![ir.prefix(), 0x46 + r * 8, d]);
        }
        // Direct-address forms.
        (Op::Rp(2), Op::MemImm(e)) => {
            let nn = ctx.word(e)?;
            return Ok(vec![0x2A, lo(nn), hi(nn)]);
        }
        (Op::MemImm(e), Op::Rp(2)) => {
            let nn = ctx.word(e)?;
            return Ok(vec![0x22, lo(nn), hi(nn)]);
        }
        (Op::R(7), Op::MemImm(e)) => {
            let nn = ctx.word(e)?;
            return Ok(vec![0x3A, lo(nn), hi(nn)]);
        }
        (Op::MemImm(e), Op::R(7)) => {
            let nn = ctx.word(e)?;
            return Ok(vec![0x32, lo(nn), hi(nn)]);
        }
        (Op::Rp(p), Op::MemImm(e)) => {
            let nn = ctx.word(e)?;
            return Ok(vec![0xED, 0x4B + p * 0x10, lo(nn), hi(nn)]);
        }
        (Op::MemImm(e), Op::Rp(p)) => {
            let nn = ctx.word(e)?;
            return Ok(vec![0xED, 0x43 + p * 0x10, lo(nn), hi(nn)]);
        }
        (Op::Index(ir), Op::MemImm(e)) => {
            let nn = ctx.word(e)?;
            return Ok(vec![ir.prefix(), 0x2A, lo(nn), hi(nn)]);
        }
        (Op::MemImm(e), Op::Index(ir)) => {
            let nn = ctx.word(e)?;
            return Ok(vec![ir.prefix(), 0x22, lo(nn), hi(nn)]);
        }
        // 16-bit immediates.
        (Op::Rp(p), Op::Imm(e)) => {
            let nn = ctx.word(e)?;
            return Ok(vec![0x01 + p * 0x10, lo(nn), hi(nn)]);
        }
        (Op::Index(ir), Op::Imm(e)) => {
            let nn = ctx.word(e)?;
            return Ok(vec![ir.prefix(), 0x21, lo(nn), hi(nn)]);
        }
        _ => {}
    }
    // Generic 8-bit moves, including the undocumented index halves.
    let dst_slot: (Option<u8>, u8) = match dst {
        Op::R(r) => (None, *r),
        Op::MemHl => (None, 6),
        Op::IndexHalf(ir, hi) => (Some(ir.prefix()), if *hi { 4 } else { 5 }),
        _ => return Err(bad("LD")),
    };
    match src {
        Op::Imm(e) => {
            let n = ctx.byte(e)?;
            let (prefix, y) = dst_slot;
            let mut out = Vec::new();
            if let Some(p) = prefix {
                out.push(p);
            }
            out.push(0x06 + y * 8);
            out.push(n);
            Ok(out)
        }
        _ => {
            let s = src8(src, ctx)?;
            let Src8::Slot(src_prefix, z, d) = s else {
                return Err(bad("LD"));
            };
            let (dst_prefix, y) = dst_slot;
            // A prefixed half can pair with plain registers B/C/D/E/A but
            // not with H, L or (HL); a displaced memory operand pairs with
            // plain registers only.
            match (dst_prefix, src_prefix) {
                (Some(a), Some(b)) if a != b => return Err(bad("LD")),
                (Some(_), Some(_)) => {
                    if y == 6 || z == 6 {
                        return Err(bad("LD"));
                    }
                }
                (Some(_), None) => {
                    if z == 4 || z == 5 || z == 6 {
                        return Err(bad("LD"));
                    }
                }
                (None, Some(_)) => {
                    if y == 6 || (d.is_none() && (y == 4 || y == 5)) {
                        return Err(bad("LD"));
                    }
                }
                (None, None) => {}
            }
            let mut out = Vec::new();
            if let Some(p) = dst_prefix.or(src_prefix) {
                out.push(p);
            }
            out.push(0x40 + y * 8 + z);
            if let Some(d) = d {
                out.push(d);
            }
            Ok(out)
        }
    }
}

fn lo(v: u16) -> u8 {
    (v & 0xFF) as u8
}

fn hi(v: u16) -> u8 {
    (v >> 8) as u8
}

fn encode_push_pop(m: &str, ops: &[Op], base: u8) -> Result<Vec<u8>, String> {
    match ops {
        [Op::Rp(p)] if *p < 3 => Ok(vec![base + p * 0x10]),
        [Op::Af] => Ok(vec![base + 0x30]),
        [Op::Index(ir)] => Ok(vec![ir.prefix(), base + 0x20]),
        _ => Err(bad(m)),
    }
}

fn encode_ex(ops: &[Op]) -> Result<Vec<u8>, String> {
    match ops {
        [Op::Af, Op::AfAlt] => Ok(vec![0x08]),
        [Op::Rp(1), Op::Rp(2)] => Ok(vec![0xEB]),
        [Op::MemSp, Op::Rp(2)] => Ok(vec![0xE3]),
        [Op::MemSp, Op::Index(ir)] => Ok(vec![ir.prefix(), 0xE3]),
        _ => Err(bad("EX")),
    }
}

fn encode_add(ops: &[Op], ctx: &mut Ctx) -> Result<Vec<u8>, String> {
    match ops {
        [Op::Rp(2), Op::Rp(p)] => Ok(vec![0x09 + p * 0x10]),
        [Op::Index(ir), rhs] => {
            // ADD IX,rp maps IX itself into the HL slot; ADD IX,HL and
            // cross-index pairs are invalid.
            let p = match rhs {
                Op::Rp(0) => 0,
                Op::Rp(1) => 1,
                Op::Index(other) if other == ir => 2,
                Op::Rp(3) => 3,
                _ => return Err(bad("ADD")),
            };
            Ok(vec![ir.prefix(), 0x09 + p * 0x10])
        }
        _ => encode_alu8("ADD", ops, ctx, 0),
    }
}

fn encode_adc_sbc(
    m: &str,
    ops: &[Op],
    ctx: &mut Ctx,
    alu_y: u8,
    ed_base: u8,
) -> Result<Vec<u8>, String> {
    match ops {
        [Op::Rp(2), Op::Rp(p)] => Ok(vec![0xED, ed_base + p * 0x10]),
        _ => encode_alu8(m, ops, ctx, alu_y),
    }
}

fn encode_alu8(m: &str, ops: &[Op], ctx: &mut Ctx, y: u8) -> Result<Vec<u8>, String> {
    // Accept both `OP src` and the explicit `OP A,src` spelling.
    let src = match ops {
        [s] => s,
        [Op::R(7), s] => s,
        _ => return Err(bad(m)),
    };
    match src8(src, ctx)? {
        Src8::Slot(prefix, z, d) => {
            let mut out = Vec::new();
            if let Some(p) = prefix {
                out.push(p);
            }
            out.push(0x80 + y * 8 + z);
            if let Some(d) = d {
                out.push(d);
            }
            Ok(out)
        }
        Src8::Imm(n) => Ok(vec![0xC6 + y * 8, n]),
    }
}

fn encode_inc_dec(m: &str, ops: &[Op], ctx: &mut Ctx, inc: bool) -> Result<Vec<u8>, String> {
    let (r_base, rp_base) = if inc { (0x04, 0x03) } else { (0x05, 0x0B) };
    match ops {
        [Op::R(r)] => Ok(vec![r_base + r * 8]),
        [Op::MemHl] => Ok(vec![r_base + 6 * 8]),
        [Op::Rp(p)] => Ok(vec![rp_base + p * 0x10]),
        [Op::Index(ir)] => Ok(vec![ir.prefix(), rp_base + 0x20]),
        [Op::IndexHalf(ir, hi)] => {
            let y = if *hi { 4 } else { 5 };
            Ok(vec![ir.prefix(), r_base + y * 8])
        }
        [Op::MemIndex(ir, e)] => {
            let d = ctx.displacement(e)?;
            Ok(vec![ir.prefix(), r_base + 6 * 8, d])
        }
        _ => Err(bad(m)),
    }
}

fn rot_index(m: &str) -> u8 {
    let name = if m == "SLI" { "SLL" } else { m };
    ROT.iter().position(|r| *r == name).unwrap() as u8
}

fn encode_rot(m: &str, ops: &[Op], ctx: &mut Ctx) -> Result<Vec<u8>, String> {
    let y = rot_index(m);
    match ops {
        [Op::R(r)] => Ok(vec![0xCB, y * 8 + r]),
        [Op::MemHl] => Ok(vec![0xCB, y * 8 + 6]),
        [Op::MemIndex(ir, e)] => {
            let d = ctx.displacement(e)?;
            Ok(vec![ir.prefix(), 0xCB, d, y * 8 + 6])
        }
        // Undocumented result-copy form: ROT (IX+d),r
        [Op::MemIndex(ir, e), Op::R(r)] => {
            let d = ctx.displacement(e)?;
            Ok(vec![ir.prefix(), 0xCB, d, y * 8 + r])
        }
        _ => Err(bad(m)),
    }
}

fn encode_bitop(
    m: &str,
    ops: &[Op],
    raw: &[&str],
    ctx: &mut Ctx,
    x: u8,
) -> Result<Vec<u8>, String> {
    if ops.len() < 2 {
        return Err(bad(m));
    }
    let bit = {
        let v = (ctx.eval)(raw[0]);
        if v.undefined {
            ctx.undefined = true;
            0
        } else {
            if !(0..=7).contains(&v.value) {
                return Err(format!("bit index {} out of range", v.value));
            }
            v.value as u8
        }
    };
    let base = x * 0x40 + bit * 8;
    match (&ops[1], ops.get(2)) {
        (Op::R(r), None) => Ok(vec![0xCB, base + r]),
        (Op::MemHl, None) => Ok(vec![0xCB, base + 6]),
        (Op::MemIndex(ir, e), None) => {
            let d = ctx.displacement(e)?;
            Ok(vec![ir.prefix(), 0xCB, d, base + 6])
        }
        // Result-copy forms exist for RES/SET only.
        (Op::MemIndex(ir, e), Some(Op::R(r))) if x != 1 => {
            let d = ctx.displacement(e)?;
            Ok(vec![ir.prefix(), 0xCB, d, base + r])
        }
        _ => Err(bad(m)),
    }
}

fn encode_jp(ops: &[Op], raw: &[&str], ctx: &mut Ctx) -> Result<Vec<u8>, String> {
    match ops {
        [Op::MemHl] => Ok(vec![0xE9]),
        [Op::MemIndex(ir, e)] if e.is_empty() => Ok(vec![ir.prefix(), 0xE9]),
        [Op::Imm(e)] => {
            let nn = ctx.word(e)?;
            Ok(vec![0xC3, lo(nn), hi(nn)])
        }
        [_, Op::Imm(e)] => {
            let cc = cond_index(raw[0]).ok_or_else(|| bad("JP"))?;
            let nn = ctx.word(e)?;
            Ok(vec![0xC2 + cc * 8, lo(nn), hi(nn)])
        }
        _ => Err(bad("JP")),
    }
}

fn encode_jr(ops: &[Op], raw: &[&str], ctx: &mut Ctx) -> Result<Vec<u8>, String> {
    match ops {
        [Op::Imm(e)] => {
            let d = ctx.relative(e)?;
            Ok(vec![0x18, d])
        }
        [_, Op::Imm(e)] => {
            let cc = cond_index(raw[0]).ok_or_else(|| bad("JR"))?;
            if cc > 3 {
                return Err(format!("JR does not accept condition {}", CC[cc as usize]));
            }
            let d = ctx.relative(e)?;
            Ok(vec![0x20 + cc * 8, d])
        }
        _ => Err(bad("JR")),
    }
}

fn encode_call(ops: &[Op], raw: &[&str], ctx: &mut Ctx) -> Result<Vec<u8>, String> {
    match ops {
        [Op::Imm(e)] => {
            let nn = ctx.word(e)?;
            Ok(vec![0xCD, lo(nn), hi(nn)])
        }
        [_, Op::Imm(e)] => {
            let cc = cond_index(raw[0]).ok_or_else(|| bad("CALL"))?;
            let nn = ctx.word(e)?;
            Ok(vec![0xC4 + cc * 8, lo(nn), hi(nn)])
        }
        _ => Err(bad("CALL")),
    }
}

fn encode_in(ops: &[Op], ctx: &mut Ctx) -> Result<Vec<u8>, String> {
    match ops {
        [Op::R(7), Op::MemImm(e)] => {
            let n = ctx.byte(e)?;
            Ok(vec![0xDB, n])
        }
        [Op::R(r), Op::MemC] => Ok(vec![0xED, 0x40 + r * 8]),
        [Op::FReg, Op::MemC] => Ok(vec![0xED, 0x70]),
        [Op::MemC] => Ok(vec![0xED, 0x70]),
        _ => Err(bad("IN")),
    }
}

fn encode_out(ops: &[Op], ctx: &mut Ctx) -> Result<Vec<u8>, String> {
    match ops {
        [Op::MemImm(e), Op::R(7)] => {
            let n = ctx.byte(e)?;
            Ok(vec![0xD3, n])
        }
        [Op::MemC, Op::R(r)] => Ok(vec![0xED, 0x41 + r * 8]),
        [Op::MemC, Op::Imm(e)] => {
            // Only the undocumented OUT (C),0 form exists.
            let v = (ctx.eval)(e);
            if v.undefined {
                ctx.undefined = true;
            } else if v.value != 0 {
                return Err("OUT (C),n only supports 0".to_string());
            }
            Ok(vec![0xED, 0x71])
        }
        _ => Err(bad("OUT")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal expression evaluator for codec tests: decimal, `$`-hex,
    /// trailing-h hex, or the literal `UNDEF`.
    fn eval(expr: &str) -> EvalValue {
        let e = expr.trim();
        if e.eq_ignore_ascii_case("UNDEF") {
            return EvalValue {
                value: 0,
                undefined: true,
            };
        }
        let (neg, e) = match e.strip_prefix('-') {
            Some(rest) => (true, rest.trim()),
            None => (false, e),
        };
        let v = if let Some(hex) = e.strip_prefix('$') {
            i64::from_str_radix(hex, 16).unwrap()
        } else if let Some(hex) = e.strip_suffix(['h', 'H']) {
            i64::from_str_radix(hex, 16).unwrap()
        } else {
            e.parse::<i64>().unwrap()
        };
        EvalValue::known(if neg { -v } else { v })
    }

    fn enc(mnemonic: &str, operands: &[&str]) -> Encoded {
        enc_at(mnemonic, operands, 0)
    }

    fn enc_at(mnemonic: &str, operands: &[&str], addr: u16) -> Encoded {
        encode(
            &EncodeRequest {
                mnemonic,
                operands,
                addr,
            },
            &mut eval,
        )
        .unwrap()
    }

    fn enc_err(mnemonic: &str, operands: &[&str]) -> String {
        encode(
            &EncodeRequest {
                mnemonic,
                operands,
                addr: 0,
            },
            &mut eval,
        )
        .unwrap_err()
    }

    #[test]
    fn ld_register_forms() {
        assert_eq!(enc("LD", &["A", "B"]).bytes, vec![0x78]);
        assert_eq!(enc("LD", &["A", "$12"]).bytes, vec![0x3E, 0x12]);
        assert_eq!(enc("LD", &["(HL)", "B"]).bytes, vec![0x70]);
        assert_eq!(enc("LD", &["H", "(HL)"]).bytes, vec![0x66]);
        assert_eq!(enc("LD", &["A", "I"]).bytes, vec![0xED, 0x57]);
        assert_eq!(enc("LD", &["R", "A"]).bytes, vec![0xED, 0x4F]);
        assert_eq!(enc("LD", &["SP", "HL"]).bytes, vec![0xF9]);
        assert_eq!(enc("LD", &["SP", "IY"]).bytes, vec![0xFD, 0xF9]);
        assert_eq!(enc("LD", &["A", "(BC)"]).bytes, vec![0x0A]);
        assert_eq!(enc("LD", &["(DE)", "A"]).bytes, vec![0x12]);
    }

    #[test]
    fn ld_sixteen_bit_forms() {
        assert_eq!(enc("LD", &["BC", "$1234"]).bytes, vec![0x01, 0x34, 0x12]);
        assert_eq!(enc("LD", &["HL", "($4000)"]).bytes, vec![0x2A, 0x00, 0x40]);
        assert_eq!(enc("LD", &["($4000)", "HL"]).bytes, vec![0x22, 0x00, 0x40]);
        assert_eq!(
            enc("LD", &["DE", "($4000)"]).bytes,
            vec![0xED, 0x5B, 0x00, 0x40]
        );
        assert_eq!(
            enc("LD", &["($4000)", "SP"]).bytes,
            vec![0xED, 0x73, 0x00, 0x40]
        );
        assert_eq!(
            enc("LD", &["IX", "$8000"]).bytes,
            vec![0xDD, 0x21, 0x00, 0x80]
        );
        assert_eq!(
            enc("LD", &["IY", "($5B00)"]).bytes,
            vec![0xFD, 0x2A, 0x00, 0x5B]
        );
        assert_eq!(enc("LD", &["A", "($5C78)"]).bytes, vec![0x3A, 0x78, 0x5C]);
    }

    #[test]
    fn ld_undocumented_halves() {
        // S3: LD IXH,$12
        assert_eq!(enc("LD", &["IXH", "$12"]).bytes, vec![0xDD, 0x26, 0x12]);
        assert_eq!(enc("LD", &["A", "IXH"]).bytes, vec![0xDD, 0x7C]);
        assert_eq!(enc("LD", &["IYL", "B"]).bytes, vec![0xFD, 0x68]);
        assert_eq!(enc("LD", &["IXH", "IXL"]).bytes, vec![0xDD, 0x65]);
        // Mixing halves with H/L or across index registers is invalid.
        enc_err("LD", &["IXH", "H"]);
        enc_err("LD", &["IXH", "IYL"]);
        enc_err("LD", &["IXH", "(HL)"]);
    }

    #[test]
    fn ld_indexed_memory() {
        assert_eq!(enc("LD", &["(IX+5)", "B"]).bytes, vec![0xDD, 0x70, 0x05]);
        assert_eq!(enc("LD", &["A", "(IY-2)"]).bytes, vec![0xFD, 0x7E, 0xFE]);
        assert_eq!(
            enc("LD", &["(IX+2)", "$42"]).bytes,
            vec![0xDD, 0x36, 0x02, 0x42]
        );
        // H keeps its plain meaning next to indexed memory.
        assert_eq!(enc("LD", &["H", "(IX+1)"]).bytes, vec![0xDD, 0x66, 0x01]);
        assert_eq!(enc("LD", &["(IX)", "C"]).bytes, vec![0xDD, 0x71, 0x00]);
    }

    #[test]
    fn ld_hl_hl_is_an_error() {
        let e = enc_err("LD", &["(HL)", "(HL)"]);
        assert!(e.contains("HALT"));
    }

    #[test]
    fn alu_forms() {
        assert_eq!(enc("ADD", &["A", "B"]).bytes, vec![0x80]);
        assert_eq!(enc("ADD", &["B"]).bytes, vec![0x80]);
        assert_eq!(enc("SUB", &["(HL)"]).bytes, vec![0x96]);
        assert_eq!(enc("CP", &["$2A"]).bytes, vec![0xFE, 0x2A]);
        assert_eq!(enc("XOR", &["A"]).bytes, vec![0xAF]);
        assert_eq!(enc("AND", &["IXL"]).bytes, vec![0xDD, 0xA5]);
        assert_eq!(enc("OR", &["(IX+3)"]).bytes, vec![0xDD, 0xB6, 0x03]);
        assert_eq!(enc("ADD", &["HL", "SP"]).bytes, vec![0x39]);
        assert_eq!(enc("ADD", &["IX", "BC"]).bytes, vec![0xDD, 0x09]);
        assert_eq!(enc("ADD", &["IX", "IX"]).bytes, vec![0xDD, 0x29]);
        assert_eq!(enc("ADC", &["HL", "BC"]).bytes, vec![0xED, 0x4A]);
        assert_eq!(enc("SBC", &["HL", "DE"]).bytes, vec![0xED, 0x52]);
        assert_eq!(enc("SBC", &["A", "C"]).bytes, vec![0x99]);
        enc_err("ADD", &["IX", "HL"]);
        enc_err("ADD", &["IX", "IY"]);
    }

    #[test]
    fn inc_dec_forms() {
        assert_eq!(enc("INC", &["A"]).bytes, vec![0x3C]);
        assert_eq!(enc("DEC", &["(HL)"]).bytes, vec![0x35]);
        assert_eq!(enc("INC", &["SP"]).bytes, vec![0x33]);
        assert_eq!(enc("INC", &["IX"]).bytes, vec![0xDD, 0x23]);
        assert_eq!(enc("DEC", &["IYH"]).bytes, vec![0xFD, 0x25]);
        assert_eq!(enc("INC", &["(IX-1)"]).bytes, vec![0xDD, 0x34, 0xFF]);
    }

    #[test]
    fn rotate_and_bit_forms() {
        assert_eq!(enc("RLC", &["B"]).bytes, vec![0xCB, 0x00]);
        assert_eq!(enc("SRL", &["(HL)"]).bytes, vec![0xCB, 0x3E]);
        assert_eq!(enc("SLL", &["A"]).bytes, vec![0xCB, 0x37]);
        assert_eq!(enc("RL", &["(IX+1)"]).bytes, vec![0xDD, 0xCB, 0x01, 0x16]);
        assert_eq!(
            enc("RLC", &["(IX+1)", "B"]).bytes,
            vec![0xDD, 0xCB, 0x01, 0x00]
        );
        assert_eq!(enc("BIT", &["7", "A"]).bytes, vec![0xCB, 0x7F]);
        assert_eq!(enc("SET", &["0", "(HL)"]).bytes, vec![0xCB, 0xC6]);
        assert_eq!(
            enc("SET", &["7", "(IX+5)"]).bytes,
            vec![0xDD, 0xCB, 0x05, 0xFE]
        );
        assert_eq!(
            enc("RES", &["1", "(IY+0)", "C"]).bytes,
            vec![0xFD, 0xCB, 0x00, 0x89]
        );
        enc_err("BIT", &["8", "A"]);
        enc_err("BIT", &["7", "(IX+1)", "B"]);
    }

    #[test]
    fn jumps_and_calls() {
        assert_eq!(enc("JP", &["$8000"]).bytes, vec![0xC3, 0x00, 0x80]);
        assert_eq!(enc("JP", &["NZ", "$8000"]).bytes, vec![0xC2, 0x00, 0x80]);
        assert_eq!(enc("JP", &["M", "$8000"]).bytes, vec![0xFA, 0x00, 0x80]);
        assert_eq!(enc("JP", &["(HL)"]).bytes, vec![0xE9]);
        assert_eq!(enc("JP", &["(IY)"]).bytes, vec![0xFD, 0xE9]);
        assert_eq!(enc("CALL", &["$1234"]).bytes, vec![0xCD, 0x34, 0x12]);
        assert_eq!(enc("CALL", &["PE", "$1234"]).bytes, vec![0xEC, 0x34, 0x12]);
        assert_eq!(enc("RET", &[]).bytes, vec![0xC9]);
        assert_eq!(enc("RET", &["C"]).bytes, vec![0xD8]);
        assert_eq!(enc("RST", &["$38"]).bytes, vec![0xFF]);
        assert_eq!(enc("RST", &["8"]).bytes, vec![0xCF]);
        enc_err("RST", &["7"]);
        enc_err("JP", &["XX", "$8000"]);
    }

    #[test]
    fn relative_jumps() {
        // Branch to self: target 0, origin 2, d = -2.
        assert_eq!(enc_at("JR", &["0"], 0).bytes, vec![0x18, 0xFE]);
        assert_eq!(enc_at("JR", &["Z", "$12"], 0x10).bytes, vec![0x28, 0x00]);
        assert_eq!(enc_at("DJNZ", &["$100"], 0x100).bytes, vec![0x10, 0xFE]);
        // JR only accepts NZ/Z/NC/C.
        enc_err("JR", &["PO", "0"]);
        // Out of range warns and wraps.
        let e = enc_at("JR", &["$200"], 0);
        assert!(e.warning.is_some());
        assert_eq!(e.bytes[0], 0x18);
    }

    #[test]
    fn io_and_misc() {
        assert_eq!(enc("IN", &["A", "($FE)"]).bytes, vec![0xDB, 0xFE]);
        assert_eq!(enc("IN", &["C", "(C)"]).bytes, vec![0xED, 0x48]);
        assert_eq!(enc("IN", &["F", "(C)"]).bytes, vec![0xED, 0x70]);
        assert_eq!(enc("OUT", &["($FE)", "A"]).bytes, vec![0xD3, 0xFE]);
        assert_eq!(enc("OUT", &["(C)", "B"]).bytes, vec![0xED, 0x41]);
        assert_eq!(enc("OUT", &["(C)", "0"]).bytes, vec![0xED, 0x71]);
        assert_eq!(enc("IM", &["2"]).bytes, vec![0xED, 0x5E]);
        assert_eq!(enc("EX", &["AF", "AF'"]).bytes, vec![0x08]);
        assert_eq!(enc("EX", &["AF", "AF`"]).bytes, vec![0x08]);
        assert_eq!(enc("EX", &["(SP)", "IX"]).bytes, vec![0xDD, 0xE3]);
        assert_eq!(enc("PUSH", &["AF"]).bytes, vec![0xF5]);
        assert_eq!(enc("POP", &["IY"]).bytes, vec![0xFD, 0xE1]);
        assert_eq!(enc("LDIR", &[]).bytes, vec![0xED, 0xB0]);
        enc_err("IM", &["3"]);
        enc_err("OUT", &["(C)", "1"]);
    }

    #[test]
    fn undefined_expressions_encode_as_zero() {
        let e = enc("LD", &["A", "UNDEF"]);
        assert!(e.undefined);
        assert_eq!(e.bytes, vec![0x3E, 0x00]);
        let e = enc("JP", &["UNDEF"]);
        assert!(e.undefined);
        assert_eq!(e.bytes, vec![0xC3, 0x00, 0x00]);
    }

    #[test]
    fn roundtrip_against_disassembler() {
        use crate::z80::disassemble;
        // Encode, then decode, then re-encode from the decoded text.
        let cases: &[(&str, &[&str])] = &[
            ("LD", &["A", "B"]),
            ("LD", &["IXH", "$12"]),
            ("LD", &["(IX+5)", "B"]),
            ("ADD", &["IX", "BC"]),
            ("SET", &["7", "(IX+5)"]),
            ("JP", &["$8000"]),
            ("OUT", &["(C)", "0"]),
            ("LDIR", &[]),
        ];
        for (m, operands) in cases {
            let first = enc(m, operands);
            let d = disassemble(first.bytes.as_slice(), 0, false);
            let (dm, dops) = match d.mnemonic.split_once(' ') {
                Some((head, rest)) => (head, rest.split(',').collect::<Vec<_>>()),
                None => (d.mnemonic.as_str(), Vec::new()),
            };
            let second = encode(
                &EncodeRequest {
                    mnemonic: dm,
                    operands: &dops,
                    addr: 0,
                },
                &mut eval,
            )
            .unwrap();
            assert_eq!(second.bytes, first.bytes, "case {m} {operands:?}");
        }
    }
}
