/*!
Macro, REPT and STRUCT support.

Macro bodies are captured as raw source text and expanded by line-wise
substitution: parameter names are replaced at identifier boundaries, so
quoted strings and unrelated identifiers pass through untouched (several
directives, SAVETAP among them, reconstruct their own operands from the
raw text). Every call gets a monotonically increasing id; local labels
defined inside the expansion are mangled with it to avoid collisions.

REPT/DUP capture the same way and expand by re-parsing the body `count`
times.

STRUCT definitions collect field declarations (`BYTE`, `WORD`, `DWORD`,
`TEXT n`, or a previously defined struct for nesting) with optional
default values, produce `.field` offset symbols plus a name-equals-size
symbol, and instantiate as a pseudo-mnemonic filling fields in order.
*/

use std::collections::HashMap;

/// One captured body line: raw text plus its original line number.
pub type BodyLine = (String, u32);

#[derive(Clone, Debug)]
pub struct MacroDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<BodyLine>,
    pub file: String,
}

/// In-progress MACRO capture; `depth` tracks nested MACRO/ENDM pairs.
#[derive(Clone, Debug)]
pub struct MacroCapture {
    pub def: MacroDef,
    pub depth: usize,
}

/// In-progress REPT/DUP capture.
#[derive(Clone, Debug)]
pub struct ReptCapture {
    pub count: i64,
    pub body: Vec<BodyLine>,
    pub file: String,
    pub depth: usize,
}

/// Replace `needle` with `replacement` wherever it stands alone as an
/// identifier, skipping quoted regions.
fn substitute_word(line: &str, needle: &str, replacement: &str) -> String {
    let bytes = line.as_bytes();
    let mut out = String::with_capacity(line.len());
    let mut i = 0usize;
    let mut quote: Option<u8> = None;
    let is_word = |c: u8| c.is_ascii_alphanumeric() || c == b'_';
    while i < bytes.len() {
        let c = bytes[i];
        if let Some(q) = quote {
            out.push(c as char);
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        if c == b'\'' || c == b'"' {
            quote = Some(c);
            out.push(c as char);
            i += 1;
            continue;
        }
        if line[i..].starts_with(needle) {
            let before_ok = i == 0 || !is_word(bytes[i - 1]);
            let after = i + needle.len();
            let after_ok = after >= bytes.len() || !is_word(bytes[after]);
            if before_ok && after_ok {
                out.push_str(replacement);
                i = after;
                continue;
            }
        }
        out.push(c as char);
        i += 1;
    }
    out
}

/// Expand a macro body with the given arguments. Missing arguments
/// substitute as empty text; extras are ignored.
pub fn expand_macro(def: &MacroDef, args: &[String]) -> Vec<BodyLine> {
    def.body
        .iter()
        .map(|(raw, line)| {
            let mut text = raw.clone();
            for (i, param) in def.params.iter().enumerate() {
                let arg = args.get(i).map(String::as_str).unwrap_or("");
                text = substitute_word(&text, param, arg);
            }
            (text, *line)
        })
        .collect()
}

// ------------------------------ structs -------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Byte,
    Word,
    Dword,
    Text(usize),
    /// Embedded struct by name.
    Nested(String),
}

impl FieldKind {
    pub fn size(&self, structs: &HashMap<String, StructDef>) -> usize {
        match self {
            FieldKind::Byte => 1,
            FieldKind::Word => 2,
            FieldKind::Dword => 4,
            FieldKind::Text(n) => *n,
            FieldKind::Nested(name) => structs.get(name).map_or(0, |s| s.size),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StructField {
    pub name: String,
    pub kind: FieldKind,
    /// Default numeric value, or default text for `TEXT` fields.
    pub default: i64,
    pub default_text: Option<String>,
}

#[derive(Clone, Debug)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<StructField>,
    pub size: usize,
}

/// In-progress STRUCT capture.
#[derive(Clone, Debug)]
pub struct StructCapture {
    pub name: String,
    pub fields: Vec<StructField>,
}

impl StructDef {
    /// Byte image of one field given an already-evaluated value.
    pub fn field_bytes(
        kind: &FieldKind,
        value: i64,
        text: Option<&str>,
        structs: &HashMap<String, StructDef>,
    ) -> Vec<u8> {
        match kind {
            FieldKind::Byte => vec![(value & 0xFF) as u8],
            FieldKind::Word => (value as u16).to_le_bytes().to_vec(),
            FieldKind::Dword => (value as u32).to_le_bytes().to_vec(),
            FieldKind::Text(n) => {
                let mut out = vec![0x20u8; *n];
                if let Some(t) = text {
                    for (i, b) in t.bytes().take(*n).enumerate() {
                        out[i] = b;
                    }
                }
                out
            }
            FieldKind::Nested(name) => structs
                .get(name)
                .map(|s| s.default_bytes(structs))
                .unwrap_or_default(),
        }
    }

    /// Byte image of the whole struct with every field defaulted.
    pub fn default_bytes(&self, structs: &HashMap<String, StructDef>) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size);
        for f in &self.fields {
            out.extend(Self::field_bytes(
                &f.kind,
                f.default,
                f.default_text.as_deref(),
                structs,
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(params: &[&str], body: &[&str]) -> MacroDef {
        MacroDef {
            name: "m".into(),
            params: params.iter().map(|s| s.to_string()).collect(),
            body: body
                .iter()
                .enumerate()
                .map(|(i, s)| (s.to_string(), i as u32 + 1))
                .collect(),
            file: "t.asm".into(),
        }
    }

    #[test]
    fn parameter_substitution_is_word_bounded() {
        let m = def(&["val"], &["  LD A,val", "  LD B,value", "  DB \"val\""]);
        let out = expand_macro(&m, &["7".to_string()]);
        assert_eq!(out[0].0, "  LD A,7");
        assert_eq!(out[1].0, "  LD B,value", "prefix of longer word untouched");
        assert_eq!(out[2].0, "  DB \"val\"", "quoted text untouched");
    }

    #[test]
    fn missing_arguments_become_empty() {
        let m = def(&["a", "b"], &["  DB a b"]);
        let out = expand_macro(&m, &["1".to_string()]);
        assert_eq!(out[0].0, "  DB 1 ");
    }

    #[test]
    fn struct_field_bytes() {
        let structs = HashMap::new();
        assert_eq!(
            StructDef::field_bytes(&FieldKind::Byte, 0x1FF, None, &structs),
            vec![0xFF]
        );
        assert_eq!(
            StructDef::field_bytes(&FieldKind::Word, 0x1234, None, &structs),
            vec![0x34, 0x12]
        );
        assert_eq!(
            StructDef::field_bytes(&FieldKind::Dword, 0x01020304, None, &structs),
            vec![4, 3, 2, 1]
        );
        assert_eq!(
            StructDef::field_bytes(&FieldKind::Text(4), 0, Some("AB"), &structs),
            vec![b'A', b'B', 0x20, 0x20]
        );
    }

    #[test]
    fn nested_struct_defaults() {
        let mut structs = HashMap::new();
        structs.insert(
            "POINT".to_string(),
            StructDef {
                name: "POINT".into(),
                fields: vec![
                    StructField {
                        name: "x".into(),
                        kind: FieldKind::Byte,
                        default: 1,
                        default_text: None,
                    },
                    StructField {
                        name: "y".into(),
                        kind: FieldKind::Byte,
                        default: 2,
                        default_text: None,
                    },
                ],
                size: 2,
            },
        );
        let rect = StructDef {
            name: "RECT".into(),
            fields: vec![
                StructField {
                    name: "tl".into(),
                    kind: FieldKind::Nested("POINT".into()),
                    default: 0,
                    default_text: None,
                },
                StructField {
                    name: "w".into(),
                    kind: FieldKind::Word,
                    default: 0x10,
                    default_text: None,
                },
            ],
            size: 4,
        };
        assert_eq!(rect.default_bytes(&structs), vec![1, 2, 0x10, 0]);
    }
}
