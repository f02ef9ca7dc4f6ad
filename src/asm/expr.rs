/*!
Expression lexer and evaluator.

Precedence, lowest binding first: `||`, `&&`, `|`, `^`, `&`, `== !=`,
`< > <= >=`, `<< >>` (arithmetic left, logical right), `+ -`, `* / %`,
then unary `+ - ~ !` and the named prefix functions `high low not abs
defined` (parentheses optional).

All arithmetic is 32-bit wrapping. There is no short-circuiting: when any
operand is undefined the whole result is undefined (value 0), except for
`defined`, which always yields 0/1. Division or modulo by a defined zero
is a hard evaluation error.

Numeric literals: decimal, `$`/`0x`-prefixed or trailing-`h` hex, `%` or
trailing-`b` binary, and character literals (multi-character folds
big-endian). `$` is the current address, `$$` the section start, and
`\d+[BF]` are temporary-label references.
*/

use super::symbols::SymbolTable;

/// Evaluation context: a symbol snapshot plus the location counters and
/// diagnostic totals the built-ins read.
pub struct EvalContext<'a> {
    pub symbols: &'a mut SymbolTable,
    pub current_address: u16,
    pub section_start: u16,
    pub errors: i32,
    pub warnings: i32,
}

/// Result of evaluating one expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvalResult {
    pub value: i32,
    pub undefined: bool,
    /// First undefined symbol encountered, for diagnostics.
    pub symbol: Option<String>,
}

#[derive(Copy, Clone, Debug)]
struct Val {
    v: i32,
    undef: bool,
}

impl Val {
    fn known(v: i32) -> Self {
        Self { v, undef: false }
    }
    fn undefined() -> Self {
        Self { v: 0, undef: true }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Tok {
    Num(i32),
    Ident(String),
    TempRef(u32, bool), // (N, forward)
    Dollar,
    DollarDollar,
    LParen,
    RParen,
    Op(&'static str),
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.src.get(self.pos + 1).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t')) {
            self.pos += 1;
        }
    }

    /// `prev_operand` disambiguates `%`: modulo after an operand, binary
    /// literal otherwise.
    fn next(&mut self, prev_operand: bool) -> Result<Option<Tok>, String> {
        self.skip_ws();
        let Some(c) = self.peek() else {
            return Ok(None);
        };
        // Two-character operators first.
        let two: Option<&'static str> = match (c, self.peek2()) {
            (b'|', Some(b'|')) => Some("||"),
            (b'&', Some(b'&')) => Some("&&"),
            (b'=', Some(b'=')) => Some("=="),
            (b'!', Some(b'=')) => Some("!="),
            (b'<', Some(b'=')) => Some("<="),
            (b'>', Some(b'=')) => Some(">="),
            (b'<', Some(b'<')) => Some("<<"),
            (b'>', Some(b'>')) => Some(">>"),
            _ => None,
        };
        if let Some(op) = two {
            self.pos += 2;
            return Ok(Some(Tok::Op(op)));
        }
        match c {
            b'(' => {
                self.pos += 1;
                Ok(Some(Tok::LParen))
            }
            b')' => {
                self.pos += 1;
                Ok(Some(Tok::RParen))
            }
            b'%' if !prev_operand && matches!(self.peek2(), Some(b'0') | Some(b'1')) => {
                // `%1010` binary literal.
                self.pos += 1;
                self.lex_binary()
            }
            b'+' | b'-' | b'*' | b'/' | b'%' | b'^' | b'~' | b'!' | b'&' | b'|' | b'<' | b'>'
            | b'=' => {
                self.pos += 1;
                let op: &'static str = match c {
                    b'+' => "+",
                    b'-' => "-",
                    b'*' => "*",
                    b'/' => "/",
                    b'%' => "%",
                    b'^' => "^",
                    b'~' => "~",
                    b'!' => "!",
                    b'&' => "&",
                    b'|' => "|",
                    b'<' => "<",
                    b'>' => ">",
                    _ => "==", // bare `=` compares
                };
                Ok(Some(Tok::Op(op)))
            }
            b'$' => {
                self.pos += 1;
                if self.peek() == Some(b'$') {
                    self.pos += 1;
                    return Ok(Some(Tok::DollarDollar));
                }
                if self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                    return self.lex_radix(16, |c| c.is_ascii_hexdigit());
                }
                Ok(Some(Tok::Dollar))
            }
            b'\'' | b'"' => self.lex_char(c),
            b'0'..=b'9' => self.lex_number(),
            _ if is_ident_start(c) => Ok(Some(self.lex_ident())),
            _ => Err(format!("unexpected character '{}'", c as char)),
        }
    }

    fn lex_radix(&mut self, radix: u32, valid: fn(u8) -> bool) -> Result<Option<Tok>, String> {
        let start = self.pos;
        while self.peek().is_some_and(valid) {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        i64::from_str_radix(text, radix)
            .map(|v| Some(Tok::Num(v as i32)))
            .map_err(|_| format!("bad numeric literal '{text}'"))
    }

    fn lex_binary(&mut self) -> Result<Option<Tok>, String> {
        self.lex_radix(2, |c| c == b'0' || c == b'1')
    }

    /// Numbers starting with a digit: decimal, `0x` hex, trailing-`h`
    /// hex, trailing-`b` binary, or a temporary-label reference `NB`/`NF`.
    fn lex_number(&mut self) -> Result<Option<Tok>, String> {
        let start = self.pos;
        if self.peek() == Some(b'0') && matches!(self.peek2(), Some(b'x') | Some(b'X')) {
            self.pos += 2;
            return self.lex_radix(16, |c| c.is_ascii_hexdigit());
        }
        // Consume the longest alphanumeric run, then classify.
        while self.peek().is_some_and(|c| c.is_ascii_alphanumeric()) {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        let upper = text.to_ascii_uppercase();
        if let Some(hex) = upper.strip_suffix('H') {
            return i64::from_str_radix(hex, 16)
                .map(|v| Some(Tok::Num(v as i32)))
                .map_err(|_| format!("bad hex literal '{text}'"));
        }
        if upper.len() > 1 {
            if let Some(digits) = upper.strip_suffix('F') {
                if let Ok(n) = digits.parse::<u32>() {
                    return Ok(Some(Tok::TempRef(n, true)));
                }
            }
            if let Some(digits) = upper.strip_suffix('B') {
                // `10b` is a backward temp-label reference, `1010b` a
                // binary literal: temp labels are short, binary runs of
                // 0/1 longer than two digits read as numbers.
                let binary_like =
                    digits.len() > 2 && digits.bytes().all(|b| b == b'0' || b == b'1');
                if binary_like {
                    if let Ok(v) = i64::from_str_radix(digits, 2) {
                        return Ok(Some(Tok::Num(v as i32)));
                    }
                }
                if let Ok(n) = digits.parse::<u32>() {
                    return Ok(Some(Tok::TempRef(n, false)));
                }
            }
        }
        text.parse::<i64>()
            .map(|v| Some(Tok::Num(v as i32)))
            .map_err(|_| format!("bad numeric literal '{text}'"))
    }

    /// Character literal; multi-character contents fold big-endian.
    fn lex_char(&mut self, quote: u8) -> Result<Option<Tok>, String> {
        self.pos += 1;
        let mut value: i64 = 0;
        loop {
            match self.peek() {
                None => return Err("unterminated character literal".to_string()),
                Some(c) if c == quote => {
                    self.pos += 1;
                    return Ok(Some(Tok::Num(value as i32)));
                }
                Some(c) => {
                    value = (value << 8) | c as i64;
                    self.pos += 1;
                }
            }
        }
    }

    fn lex_ident(&mut self) -> Tok {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_char) {
            self.pos += 1;
        }
        Tok::Ident(std::str::from_utf8(&self.src[start..self.pos]).unwrap().to_string())
    }
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || matches!(c, b'_' | b'.' | b'@' | b'?')
}

fn is_ident_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, b'_' | b'.' | b'@' | b'?' | b'\'')
}

struct Parser<'a, 'c> {
    toks: Vec<Tok>,
    pos: usize,
    ctx: &'a mut EvalContext<'c>,
    first_undefined: Option<String>,
}

/// Binary operator tiers, lowest precedence first.
const TIERS: &[&[&str]] = &[
    &["||"],
    &["&&"],
    &["|"],
    &["^"],
    &["&"],
    &["==", "!="],
    &["<", ">", "<=", ">="],
    &["<<", ">>"],
    &["+", "-"],
    &["*", "/", "%"],
];

impl<'a, 'c> Parser<'a, 'c> {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn bump(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, tok: &Tok) -> Result<(), String> {
        if self.peek() == Some(tok) {
            self.pos += 1;
            Ok(())
        } else {
            Err(format!("expected {tok:?}"))
        }
    }

    fn parse_tier(&mut self, tier: usize) -> Result<Val, String> {
        if tier >= TIERS.len() {
            return self.parse_unary();
        }
        let mut lhs = self.parse_tier(tier + 1)?;
        while let Some(Tok::Op(op)) = self.peek() {
            if !TIERS[tier].contains(op) {
                break;
            }
            let op = *op;
            self.pos += 1;
            let rhs = self.parse_tier(tier + 1)?;
            lhs = self.apply(op, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn apply(&mut self, op: &str, a: Val, b: Val) -> Result<Val, String> {
        if a.undef || b.undef {
            // Division by an undefined value is not an error; the whole
            // expression is simply undefined this pass.
            return Ok(Val::undefined());
        }
        let (x, y) = (a.v, b.v);
        let v = match op {
            "||" => ((x != 0) || (y != 0)) as i32,
            "&&" => ((x != 0) && (y != 0)) as i32,
            "|" => x | y,
            "^" => x ^ y,
            "&" => x & y,
            "==" => (x == y) as i32,
            "!=" => (x != y) as i32,
            "<" => (x < y) as i32,
            ">" => (x > y) as i32,
            "<=" => (x <= y) as i32,
            ">=" => (x >= y) as i32,
            "<<" => x.wrapping_shl(y as u32 & 31),
            ">>" => ((x as u32).wrapping_shr(y as u32 & 31)) as i32,
            "+" => x.wrapping_add(y),
            "-" => x.wrapping_sub(y),
            "*" => x.wrapping_mul(y),
            "/" => {
                if y == 0 {
                    return Err("division by zero".to_string());
                }
                x.wrapping_div(y)
            }
            "%" => {
                if y == 0 {
                    return Err("division by zero".to_string());
                }
                x.wrapping_rem(y)
            }
            _ => unreachable!(),
        };
        Ok(Val::known(v))
    }

    fn parse_unary(&mut self) -> Result<Val, String> {
        match self.peek() {
            Some(Tok::Op("+")) => {
                self.pos += 1;
                self.parse_unary()
            }
            Some(Tok::Op("-")) => {
                self.pos += 1;
                let v = self.parse_unary()?;
                Ok(if v.undef {
                    v
                } else {
                    Val::known(v.v.wrapping_neg())
                })
            }
            Some(Tok::Op("~")) => {
                self.pos += 1;
                let v = self.parse_unary()?;
                Ok(if v.undef { v } else { Val::known(!v.v) })
            }
            Some(Tok::Op("!")) => {
                self.pos += 1;
                let v = self.parse_unary()?;
                Ok(if v.undef {
                    v
                } else {
                    Val::known((v.v == 0) as i32)
                })
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Val, String> {
        match self.bump() {
            Some(Tok::Num(v)) => Ok(Val::known(v)),
            Some(Tok::Dollar) => Ok(Val::known(self.ctx.current_address as i32)),
            Some(Tok::DollarDollar) => Ok(Val::known(self.ctx.section_start as i32)),
            Some(Tok::LParen) => {
                let v = self.parse_tier(0)?;
                self.expect(&Tok::RParen)?;
                Ok(v)
            }
            Some(Tok::TempRef(n, forward)) => {
                match self.ctx.symbols.lookup_temp(n, forward) {
                    Some(addr) => Ok(Val::known(addr as i32)),
                    None => {
                        let tag = if forward { 'F' } else { 'B' };
                        self.note_undefined(format!("{n}{tag}"));
                        Ok(Val::undefined())
                    }
                }
            }
            Some(Tok::Ident(name)) => self.resolve_ident(name),
            other => Err(format!("expected operand, found {other:?}")),
        }
    }

    fn resolve_ident(&mut self, name: String) -> Result<Val, String> {
        match name.to_ascii_lowercase().as_str() {
            "high" => {
                let v = self.parse_function_arg()?;
                return Ok(if v.undef {
                    v
                } else {
                    Val::known((v.v >> 8) & 0xFF)
                });
            }
            "low" => {
                let v = self.parse_function_arg()?;
                return Ok(if v.undef { v } else { Val::known(v.v & 0xFF) });
            }
            "not" => {
                let v = self.parse_function_arg()?;
                return Ok(if v.undef {
                    v
                } else {
                    Val::known((v.v == 0) as i32)
                });
            }
            "abs" => {
                let v = self.parse_function_arg()?;
                return Ok(if v.undef {
                    v
                } else {
                    Val::known(v.v.wrapping_abs())
                });
            }
            "defined" => {
                // `defined` never propagates undefinedness.
                let name = self.parse_symbol_arg()?;
                let known = self.ctx.symbols.is_defined(&name);
                return Ok(Val::known(known as i32));
            }
            "_errors" => return Ok(Val::known(self.ctx.errors)),
            "_warnings" => return Ok(Val::known(self.ctx.warnings)),
            _ => {}
        }
        match self.ctx.symbols.lookup(&name) {
            Some(v) => Ok(Val::known(v)),
            None => {
                self.note_undefined(name);
                Ok(Val::undefined())
            }
        }
    }

    fn parse_function_arg(&mut self) -> Result<Val, String> {
        if self.peek() == Some(&Tok::LParen) {
            self.pos += 1;
            let v = self.parse_tier(0)?;
            self.expect(&Tok::RParen)?;
            Ok(v)
        } else {
            self.parse_unary()
        }
    }

    /// `defined X` / `defined(X)`: the operand is a name, not a value.
    fn parse_symbol_arg(&mut self) -> Result<String, String> {
        let parenthesized = self.peek() == Some(&Tok::LParen);
        if parenthesized {
            self.pos += 1;
        }
        let name = match self.bump() {
            Some(Tok::Ident(name)) => name,
            other => return Err(format!("expected symbol name, found {other:?}")),
        };
        if parenthesized {
            self.expect(&Tok::RParen)?;
        }
        Ok(name)
    }

    fn note_undefined(&mut self, name: String) {
        if self.first_undefined.is_none() {
            self.first_undefined = Some(name);
        }
    }
}

/// Evaluate `expr` against the context. `Err` is a syntax or
/// division-by-zero diagnostic; an unresolved symbol is not an error but
/// an undefined result.
pub fn evaluate(expr: &str, ctx: &mut EvalContext) -> Result<EvalResult, String> {
    let mut lexer = Lexer::new(expr);
    let mut toks: Vec<Tok> = Vec::new();
    loop {
        let prev_operand = matches!(
            toks.last(),
            Some(Tok::Num(_))
                | Some(Tok::Ident(_))
                | Some(Tok::TempRef(..))
                | Some(Tok::Dollar)
                | Some(Tok::DollarDollar)
                | Some(Tok::RParen)
        );
        match lexer.next(prev_operand)? {
            Some(t) => toks.push(t),
            None => break,
        }
    }
    if toks.is_empty() {
        return Err("empty expression".to_string());
    }
    let mut parser = Parser {
        toks,
        pos: 0,
        ctx,
        first_undefined: None,
    };
    let val = parser.parse_tier(0)?;
    if parser.pos != parser.toks.len() {
        return Err(format!(
            "unexpected trailing tokens in expression '{expr}'"
        ));
    }
    Ok(EvalResult {
        value: val.v,
        undefined: val.undef,
        symbol: parser.first_undefined,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expr: &str) -> EvalResult {
        let mut symbols = SymbolTable::new();
        symbols.define_value("ten", 10, super::super::symbols::SymbolKind::Equ, "t", 1).unwrap();
        symbols.define_label("start", 0x8000, "t", 2).unwrap();
        let mut ctx = EvalContext {
            symbols: &mut symbols,
            current_address: 0x4000,
            section_start: 0x4000,
            errors: 0,
            warnings: 0,
        };
        evaluate(expr, &mut ctx).unwrap()
    }

    fn val(expr: &str) -> i32 {
        let r = eval(expr);
        assert!(!r.undefined, "{expr} unexpectedly undefined");
        r.value
    }

    #[test]
    fn literals() {
        assert_eq!(val("42"), 42);
        assert_eq!(val("$FF"), 255);
        assert_eq!(val("0x10"), 16);
        assert_eq!(val("0FFh"), 255);
        assert_eq!(val("1Bh"), 0x1B);
        assert_eq!(val("%1010"), 10);
        assert_eq!(val("1010b"), 10);
        assert_eq!(val("'A'"), 65);
        assert_eq!(val("'AB'"), 0x4142);
    }

    #[test]
    fn precedence_and_arithmetic() {
        assert_eq!(val("2+3*4"), 14);
        assert_eq!(val("(2+3)*4"), 20);
        assert_eq!(val("10/3"), 3);
        assert_eq!(val("10%3"), 1);
        assert_eq!(val("1<<4"), 16);
        assert_eq!(val("-16>>2"), 0x3FFFFFFC, "right shift is logical");
        assert_eq!(val("1<<3 | 1"), 9);
        assert_eq!(val("5 & 3 ^ 1"), 0);
        assert_eq!(val("2 < 3"), 1);
        assert_eq!(val("2 == 3 || 1"), 1);
        assert_eq!(val("~0"), -1);
        assert_eq!(val("!5"), 0);
        assert_eq!(val("-5 + 10"), 5);
    }

    #[test]
    fn functions() {
        assert_eq!(val("high $1234"), 0x12);
        assert_eq!(val("low($1234)"), 0x34);
        assert_eq!(val("abs(-7)"), 7);
        assert_eq!(val("not 0"), 1);
        assert_eq!(val("defined ten"), 1);
        assert_eq!(val("defined nope"), 0);
        assert_eq!(val("defined(start)"), 1);
    }

    #[test]
    fn location_counters_and_symbols() {
        assert_eq!(val("$"), 0x4000);
        assert_eq!(val("$$"), 0x4000);
        assert_eq!(val("ten*2"), 20);
        assert_eq!(val("start+1"), 0x8001);
        assert_eq!(val("_ERRORS"), 0);
    }

    #[test]
    fn undefined_propagates() {
        let r = eval("missing+1");
        assert!(r.undefined);
        assert_eq!(r.value, 0);
        assert_eq!(r.symbol.as_deref(), Some("missing"));
        // Except through `defined`.
        let r = eval("defined missing");
        assert!(!r.undefined);
        assert_eq!(r.value, 0);
        // Undefined divisor is not a division error.
        assert!(eval("10/missing").undefined);
    }

    #[test]
    fn division_by_zero_errors() {
        let mut symbols = SymbolTable::new();
        let mut ctx = EvalContext {
            symbols: &mut symbols,
            current_address: 0,
            section_start: 0,
            errors: 0,
            warnings: 0,
        };
        assert!(evaluate("1/0", &mut ctx).is_err());
        assert!(evaluate("1%0", &mut ctx).is_err());
        assert!(evaluate("1+", &mut ctx).is_err());
    }

    #[test]
    fn temp_label_refs() {
        let mut symbols = SymbolTable::new();
        symbols.begin_pass();
        symbols.define_temp(2, 0x9000);
        let mut ctx = EvalContext {
            symbols: &mut symbols,
            current_address: 0,
            section_start: 0,
            errors: 0,
            warnings: 0,
        };
        let r = evaluate("2B", &mut ctx).unwrap();
        assert_eq!(r.value, 0x9000);
        let r = evaluate("2F", &mut ctx).unwrap();
        assert!(r.undefined);
    }
}
