/*!
Source line parsing.

Splits assembler source into `SourceLine` records: optional label (a token
starting in column 0, or anything ending with `:`), optional mnemonic,
operand texts split on top-level commas, and the trailing comment. The raw
text is preserved because macro and REPT bodies re-emit their captured
source verbatim, including quoted-string operands.
*/

/// One parsed source line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLine {
    pub label: Option<String>,
    pub mnemonic: Option<String>,
    pub operands: Vec<String>,
    pub comment: Option<String>,
    pub file: String,
    pub line: u32,
    pub raw: String,
}

impl SourceLine {
    pub fn mnemonic_upper(&self) -> String {
        self.mnemonic
            .as_deref()
            .unwrap_or_default()
            .to_ascii_uppercase()
    }
}

/// Find the start of a `;` comment outside string/char literals.
fn comment_start(s: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices() {
        match (quote, c) {
            (Some(q), _) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, ';') => return Some(i),
            _ => {}
        }
    }
    None
}

/// Split operands on top-level commas, respecting parentheses and quotes.
pub fn split_operands(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match (quote, c) {
            (Some(q), _) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                out.push(s[start..i].trim().to_string());
                start = i + 1;
            }
            _ => {}
        }
    }
    let tail = s[start..].trim();
    if !tail.is_empty() || !out.is_empty() {
        out.push(tail.to_string());
    }
    out.retain(|o| !o.is_empty());
    out
}

/// Is this token a label? Either it sat in column 0 or it ends with `:`.
fn is_label_token(token: &str, at_column_zero: bool) -> bool {
    token.ends_with(':') || at_column_zero
}

/// Parse one physical line.
pub fn parse_line(text: &str, file: &str, line: u32) -> SourceLine {
    let raw = text.to_string();
    let (code, comment) = match comment_start(text) {
        Some(i) => (
            &text[..i],
            Some(text[i + 1..].trim().to_string()),
        ),
        None => (text, None),
    };

    let mut label = None;
    let mut rest = code;
    let at_column_zero = !code.starts_with([' ', '\t']) && !code.trim().is_empty();
    let trimmed = code.trim_start();
    if !trimmed.is_empty() {
        let token_end = trimmed
            .find(|c: char| c.is_whitespace())
            .unwrap_or(trimmed.len());
        let first = &trimmed[..token_end];
        // `=` assignments keep the name as a label-like left-hand side.
        if is_label_token(first, at_column_zero) && !first.starts_with('=') {
            let name = first.trim_end_matches(':');
            if !name.is_empty() {
                label = Some(name.to_string());
            }
            let offset = (trimmed.as_ptr() as usize - code.as_ptr() as usize) + token_end;
            rest = &code[offset..];
        }
    }

    let rest = rest.trim();
    let (mnemonic, operand_text) = if rest.is_empty() {
        (None, "")
    } else if let Some(eq_rhs) = rest.strip_prefix('=') {
        (Some("=".to_string()), eq_rhs.trim())
    } else {
        let end = rest
            .find(|c: char| c.is_whitespace())
            .unwrap_or(rest.len());
        (Some(rest[..end].to_string()), rest[end..].trim())
    };

    SourceLine {
        label,
        mnemonic,
        operands: split_operands(operand_text),
        comment,
        file: file.to_string(),
        line,
        raw,
    }
}

/// Parse a whole source text.
pub fn parse_source(text: &str, file: &str) -> Vec<SourceLine> {
    text.lines()
        .enumerate()
        .map(|(i, l)| parse_line(l, file, i as u32 + 1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_and_instruction() {
        let l = parse_line("start:  LD A,5", "t.asm", 1);
        assert_eq!(l.label.as_deref(), Some("start"));
        assert_eq!(l.mnemonic.as_deref(), Some("LD"));
        assert_eq!(l.operands, vec!["A", "5"]);
    }

    #[test]
    fn column_zero_label_without_colon() {
        let l = parse_line("start LD A,5", "t.asm", 1);
        assert_eq!(l.label.as_deref(), Some("start"));
        assert_eq!(l.mnemonic.as_deref(), Some("LD"));
    }

    #[test]
    fn indented_instruction_has_no_label() {
        let l = parse_line("  RET", "t.asm", 1);
        assert_eq!(l.label, None);
        assert_eq!(l.mnemonic.as_deref(), Some("RET"));
        assert!(l.operands.is_empty());
    }

    #[test]
    fn comments_respect_quotes() {
        let l = parse_line("  DB \"a;b\", ';' ; trailing", "t.asm", 1);
        assert_eq!(l.mnemonic.as_deref(), Some("DB"));
        assert_eq!(l.operands, vec!["\"a;b\"", "';'"]);
        assert_eq!(l.comment.as_deref(), Some("trailing"));
    }

    #[test]
    fn operand_split_respects_parens() {
        assert_eq!(
            split_operands("(IX+1), (2, 3), 'x,y'"),
            vec!["(IX+1)", "(2, 3)", "'x,y'"]
        );
        assert_eq!(split_operands(""), Vec::<String>::new());
    }

    #[test]
    fn assignment_form() {
        let l = parse_line("count = 5+1", "t.asm", 1);
        assert_eq!(l.label.as_deref(), Some("count"));
        assert_eq!(l.mnemonic.as_deref(), Some("="));
        assert_eq!(l.operands, vec!["5+1"]);
    }

    #[test]
    fn temp_label_line() {
        let l = parse_line("1: DJNZ 1B", "t.asm", 1);
        assert_eq!(l.label.as_deref(), Some("1"));
        assert_eq!(l.mnemonic.as_deref(), Some("DJNZ"));
        assert_eq!(l.operands, vec!["1B"]);
    }

    #[test]
    fn empty_and_comment_only_lines() {
        let l = parse_line("", "t.asm", 1);
        assert_eq!(l.mnemonic, None);
        let l = parse_line("; just a note", "t.asm", 2);
        assert_eq!(l.mnemonic, None);
        assert_eq!(l.comment.as_deref(), Some("just a note"));
    }

    #[test]
    fn md5_comment_passthrough() {
        let l = parse_line("  SAVEBIN \"out.bin\",0,16 ; md5: 0123abc", "t.asm", 1);
        assert_eq!(l.comment.as_deref(), Some("md5: 0123abc"));
        assert_eq!(l.operands.len(), 3);
    }
}
