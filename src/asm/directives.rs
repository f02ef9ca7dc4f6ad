/*!
Directive dispatch for the assembler driver.

Handles the data/layout directives (ORG, DB/DW/DS and friends, ALIGN,
DISP/ENT), symbol directives (EQU, `=`, DEFL, MODULE), source structure
(INCLUDE, INCBIN, MACRO, REPT/DUP, STRUCT, conditionals), the DEVICE
memory model, and the output emitters (SAVEBIN/SAVESNA/SAVETAP/SAVETRD
plus their EMPTY* companions and MD5CHECK).

Conditional directives execute even when the surrounding block is
inactive; everything else is skipped by the driver in that case.
*/

use crate::errors::AsmError;
use crate::machine::{self, MachineId};
use crate::memory::Memory;

use super::macros::{
    FieldKind, MacroCapture, MacroDef, ReptCapture, StructCapture, StructDef, StructField,
};
use super::parser::{self, SourceLine};
use super::save::{self, SaveCommand, SaveKind, TapMode};
use super::symbols::SymbolKind;
use super::{Assembler, Cond, MAX_INCLUDE_DEPTH};

/// Strip matching quotes from a filename/string operand.
fn unquote(op: &str) -> Option<&str> {
    let b = op.as_bytes();
    if b.len() >= 2 && (b[0] == b'"' || b[0] == b'\'') && b[b.len() - 1] == b[0] {
        Some(&op[1..op.len() - 1])
    } else {
        None
    }
}

/// A DB-style operand is a string when it is fully quoted.
fn string_operand(op: &str) -> Option<&str> {
    unquote(op)
}

impl<'v> Assembler<'v> {
    // --------------------------- conditionals ---------------------------

    pub(crate) fn handle_conditional(&mut self, line: &SourceLine, m: &str) {
        match m {
            "IF" | "IFDEF" | "IFNDEF" | "IFUSED" | "IFNUSED" => {
                let parent = self.cond_active();
                let value = if !parent {
                    false
                } else {
                    match m {
                        "IF" => self
                            .first_operand(line, m)
                            .map(|e| self.eval_value(&e, line) != 0)
                            .unwrap_or(false),
                        "IFDEF" | "IFNDEF" => {
                            let defined = self
                                .first_operand(line, m)
                                .map(|n| self.symbols.is_defined(&n))
                                .unwrap_or(false);
                            if m == "IFDEF" { defined } else { !defined }
                        }
                        _ => {
                            let used = self
                                .first_operand(line, m)
                                .map(|n| self.symbols.is_used(&n))
                                .unwrap_or(false);
                            if m == "IFUSED" { used } else { !used }
                        }
                    }
                };
                self.cond_stack.push(Cond {
                    active: parent && value,
                    taken: value,
                    parent_active: parent,
                });
            }
            "ELSE" => match self.cond_stack.last_mut() {
                Some(top) => {
                    top.active = top.parent_active && !top.taken;
                    top.taken = true;
                }
                None => self.error(line, "ELSE without IF"),
            },
            "ELSEIF" => {
                let Some(top) = self.cond_stack.pop() else {
                    self.error(line, "ELSEIF without IF");
                    return;
                };
                let mut next = top;
                if !next.parent_active || next.taken {
                    next.active = false;
                } else {
                    let value = self
                        .first_operand(line, m)
                        .map(|e| self.eval_value(&e, line) != 0)
                        .unwrap_or(false);
                    next.active = value;
                    next.taken = value;
                }
                self.cond_stack.push(next);
            }
            _ => {
                if self.cond_stack.pop().is_none() {
                    self.error(line, "ENDIF without IF");
                }
            }
        }
    }

    fn first_operand(&mut self, line: &SourceLine, m: &str) -> Option<String> {
        match line.operands.first() {
            Some(op) => Some(op.clone()),
            None => {
                self.error(line, format!("{m} needs an operand"));
                None
            }
        }
    }

    // ------------------------- capture states ---------------------------

    pub(crate) fn capture_macro_line(&mut self, line: &SourceLine, m: &str) {
        let capture = self.pending_macro.as_mut().expect("macro capture");
        match m {
            "MACRO" => {
                capture.depth += 1;
                capture.def.body.push((line.raw.clone(), line.line));
            }
            "ENDM" | "ENDMACRO" => {
                if capture.depth > 0 {
                    capture.depth -= 1;
                    capture.def.body.push((line.raw.clone(), line.line));
                } else {
                    let capture = self.pending_macro.take().unwrap();
                    self.macros
                        .insert(capture.def.name.clone(), capture.def);
                }
            }
            _ => capture.def.body.push((line.raw.clone(), line.line)),
        }
    }

    pub(crate) fn capture_rept_line(
        &mut self,
        line: &SourceLine,
        m: &str,
    ) -> Result<(), AsmError> {
        let capture = self.pending_rept.as_mut().expect("rept capture");
        match m {
            "REPT" | "DUP" => {
                capture.depth += 1;
                capture.body.push((line.raw.clone(), line.line));
                Ok(())
            }
            "ENDR" | "EDUP" => {
                if capture.depth > 0 {
                    capture.depth -= 1;
                    capture.body.push((line.raw.clone(), line.line));
                    return Ok(());
                }
                let capture = self.pending_rept.take().unwrap();
                for _ in 0..capture.count.max(0) {
                    for (raw, body_line) in &capture.body {
                        let parsed = parser::parse_line(raw, &capture.file, *body_line);
                        self.process_line(&parsed)?;
                    }
                }
                Ok(())
            }
            _ => {
                capture.body.push((line.raw.clone(), line.line));
                Ok(())
            }
        }
    }

    pub(crate) fn capture_struct_line(&mut self, line: &SourceLine, m: &str) {
        if m == "ENDS" {
            let capture = self.pending_struct.take().expect("struct capture");
            self.finish_struct(capture, line);
            return;
        }
        let Some(field_name) = line.label.clone() else {
            if line.mnemonic.is_some() {
                self.error(line, "struct fields need a name");
            }
            return;
        };
        let kind = match m {
            "BYTE" | "DB" | "DEFB" => FieldKind::Byte,
            "WORD" | "DW" | "DEFW" => FieldKind::Word,
            "DWORD" | "DD" => FieldKind::Dword,
            "TEXT" => {
                let len = line
                    .operands
                    .first()
                    .cloned()
                    .map(|e| self.eval_value(&e, line).max(0) as usize)
                    .unwrap_or(0);
                FieldKind::Text(len)
            }
            other if self.structs.contains_key(other) => FieldKind::Nested(other.to_string()),
            other => {
                self.error(line, format!("unknown struct field type '{other}'"));
                return;
            }
        };
        let (default, default_text) = match &kind {
            FieldKind::Text(_) => {
                let text = line
                    .operands
                    .get(1)
                    .and_then(|o| string_operand(o))
                    .map(str::to_string);
                (0, text)
            }
            FieldKind::Nested(_) => (0, None),
            _ => {
                let v = line
                    .operands
                    .first()
                    .cloned()
                    .map(|e| self.eval_value(&e, line) as i64)
                    .unwrap_or(0);
                (v, None)
            }
        };
        self.pending_struct
            .as_mut()
            .expect("struct capture")
            .fields
            .push(StructField {
                name: field_name,
                kind,
                default,
                default_text,
            });
    }

    fn finish_struct(&mut self, capture: StructCapture, line: &SourceLine) {
        let mut offset = 0usize;
        for field in &capture.fields {
            let name = format!("{}.{}", capture.name, field.name);
            if self
                .symbols
                .define_value(&name, offset as i32, SymbolKind::Equ, &line.file, line.line)
                .is_err()
            {
                self.error(line, format!("duplicate struct field '{name}'"));
            }
            offset += field.kind.size(&self.structs);
        }
        if self
            .symbols
            .define_value(
                &capture.name,
                offset as i32,
                SymbolKind::Equ,
                &line.file,
                line.line,
            )
            .is_err()
        {
            self.error(line, format!("duplicate symbol '{}'", capture.name));
        }
        self.structs.insert(
            capture.name.clone(),
            StructDef {
                name: capture.name,
                fields: capture.fields,
                size: offset,
            },
        );
    }

    /// Emit one struct instance: operands fill fields in order, defaults
    /// fill the rest, strings pad to the field length with 0x20.
    pub(crate) fn instantiate_struct(&mut self, def: &StructDef, line: &SourceLine) {
        if let Some(label) = line.label.clone() {
            let mut offset = 0usize;
            for field in &def.fields {
                let name = format!("{label}.{}", field.name);
                let addr = self.current_address.wrapping_add(offset as u16) as i32;
                let _ = self
                    .symbols
                    .define_value(&name, addr, SymbolKind::Equ, &line.file, line.line);
                offset += field.kind.size(&self.structs);
            }
        }
        let mut bytes = Vec::with_capacity(def.size);
        for (i, field) in def.fields.iter().enumerate() {
            let operand = line.operands.get(i);
            let rendered = match (&field.kind, operand) {
                (FieldKind::Text(_), Some(op)) => {
                    let text = string_operand(op).map(str::to_string);
                    StructDef::field_bytes(&field.kind, 0, text.as_deref(), &self.structs)
                }
                (FieldKind::Nested(_), _) | (_, None) => StructDef::field_bytes(
                    &field.kind,
                    field.default,
                    field.default_text.as_deref(),
                    &self.structs,
                ),
                (_, Some(op)) => {
                    let v = self.eval_value(&op.clone(), line) as i64;
                    StructDef::field_bytes(&field.kind, v, None, &self.structs)
                }
            };
            bytes.extend(rendered);
        }
        self.emit(&bytes);
    }

    // ------------------------- main dispatch ----------------------------

    /// Returns Ok(true) when the mnemonic was a directive.
    pub(crate) fn handle_directive(
        &mut self,
        line: &SourceLine,
        m: &str,
    ) -> Result<bool, AsmError> {
        match m {
            "ORG" => {
                if let Some(e) = self.first_operand(line, m) {
                    let addr = self.eval_value(&e, line) as u16;
                    self.current_address = addr;
                    self.section_start = addr;
                    self.org_addresses.push(addr);
                    if !self.output_anchored {
                        self.output_start = addr;
                        self.output_anchored = true;
                    }
                }
            }
            "EQU" | "=" | "DEFL" => self.define_symbol_directive(line, m),
            "DB" | "DEFB" | "DEFM" => self.emit_data_bytes(line, 0, false, false),
            "DZ" => self.emit_data_bytes(line, 0, false, true),
            "DC" => self.emit_data_bytes(line, 0, true, false),
            "ABYTE" => self.emit_abyte(line, false, false),
            "ABYTEC" => self.emit_abyte(line, true, false),
            "ABYTEZ" => self.emit_abyte(line, false, true),
            "DW" | "DEFW" => self.emit_data_words(line),
            "DS" | "DEFS" => {
                let size = self
                    .first_operand(line, m)
                    .map(|e| self.eval_value(&e, line))
                    .unwrap_or(0);
                let fill = line
                    .operands
                    .get(1)
                    .cloned()
                    .map(|e| self.eval_value(&e, line) as u8)
                    .unwrap_or(0);
                if size < 0 {
                    self.error(line, "negative DS size");
                } else {
                    self.emit(&vec![fill; size as usize]);
                }
            }
            "ALIGN" => {
                let n = self
                    .first_operand(line, m)
                    .map(|e| self.eval_value(&e, line))
                    .unwrap_or(1);
                let fill = line
                    .operands
                    .get(1)
                    .cloned()
                    .map(|e| self.eval_value(&e, line) as u8)
                    .unwrap_or(0);
                if n > 0 {
                    let n = n as u16;
                    let pad = (n - self.current_address % n) % n;
                    self.emit(&vec![fill; pad as usize]);
                }
            }
            "DISP" | "PHASE" => {
                if let Some(e) = self.first_operand(line, m) {
                    let target = self.eval_value(&e, line) as u16;
                    if self.physical_address.is_some() {
                        self.error(line, "nested DISP");
                    } else {
                        self.physical_address = Some(self.current_address);
                        self.current_address = target;
                    }
                }
            }
            "ENT" | "DEPHASE" => match self.physical_address.take() {
                Some(p) => self.current_address = p,
                None => self.error(line, "ENT without DISP"),
            },
            "ASSERT" => {
                if self.pass > 1 {
                    if let Some(e) = self.first_operand(line, m) {
                        match self.eval_expr(&e) {
                            Ok(r) if !r.undefined && r.value == 0 => {
                                let msg = line
                                    .operands
                                    .get(1)
                                    .and_then(|o| string_operand(o))
                                    .unwrap_or(&e);
                                self.error(line, format!("assertion failed: {msg}"));
                            }
                            Ok(_) => {}
                            Err(err) => self.error(line, err),
                        }
                    }
                }
            }
            "INCLUDE" => return self.include(line).map(|_| true),
            "INCBIN" => self.incbin(line),
            "MACRO" => self.start_macro(line),
            "ENDM" | "ENDMACRO" => self.error(line, "ENDM without MACRO"),
            "REPT" | "DUP" => {
                let count = self
                    .first_operand(line, m)
                    .map(|e| self.eval_value(&e, line) as i64)
                    .unwrap_or(0);
                self.pending_rept = Some(ReptCapture {
                    count,
                    body: Vec::new(),
                    file: line.file.clone(),
                    depth: 0,
                });
            }
            "ENDR" | "EDUP" => self.error(line, "ENDR without REPT"),
            "STRUCT" => {
                let name = line
                    .operands
                    .first()
                    .cloned()
                    .or_else(|| line.label.clone());
                match name {
                    Some(name) => {
                        self.pending_struct = Some(StructCapture {
                            name: name.to_ascii_uppercase(),
                            fields: Vec::new(),
                        });
                    }
                    None => self.error(line, "STRUCT needs a name"),
                }
            }
            "ENDS" => self.error(line, "ENDS without STRUCT"),
            "MODULE" => match line.operands.first() {
                Some(name) => self.symbols.push_module(name),
                None => self.error(line, "MODULE needs a name"),
            },
            "ENDMODULE" => {
                if !self.symbols.pop_module() {
                    self.error(line, "ENDMODULE without MODULE");
                }
            }
            "DEVICE" => self.select_device(line),
            "END" => self.ended = true,
            "SAVEBIN" => self.save_bin(line),
            "SAVESNA" => self.save_sna(line),
            "EMPTYTAP" => self.empty_tap(line),
            "SAVETAP" => self.save_tap(line),
            "EMPTYTRD" => self.empty_trd_directive(line),
            "SAVETRD" => self.save_trd(line),
            "MD5CHECK" => self.md5check(line),
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn define_symbol_directive(&mut self, line: &SourceLine, m: &str) {
        let Some(name) = line.label.clone() else {
            self.error(line, format!("{m} needs a label"));
            return;
        };
        let Some(expr) = line.operands.first().cloned() else {
            self.error(line, format!("{m} needs a value"));
            return;
        };
        match self.eval_expr(&expr) {
            Ok(r) => {
                if r.undefined {
                    self.emitted_undefined = true;
                    return;
                }
                let kind = if m == "DEFL" {
                    SymbolKind::Defl
                } else {
                    SymbolKind::Equ
                };
                if let Err(full) =
                    self.symbols
                        .define_value(&name, r.value, kind, &line.file, line.line)
                {
                    self.error(line, format!("conflicting redefinition of '{full}'"));
                }
            }
            Err(e) => self.error(line, e),
        }
    }

    // ----------------------------- data ---------------------------------

    /// DB/DZ/DC and the ABYTE family share this emitter. `offset` is
    /// added to every byte; `set_high` sets bit 7 on the last byte;
    /// `zero_terminate` appends 0.
    fn emit_data_bytes(&mut self, line: &SourceLine, offset: i32, set_high: bool, zero: bool) {
        self.emit_data_bytes_from(line, 0, offset, set_high, zero)
    }

    fn emit_data_bytes_from(
        &mut self,
        line: &SourceLine,
        first: usize,
        offset: i32,
        set_high: bool,
        zero: bool,
    ) {
        let mut bytes: Vec<u8> = Vec::new();
        if line.operands.len() <= first {
            self.error(line, "data directive needs operands");
            return;
        }
        for op in line.operands[first..].iter() {
            if let Some(text) = string_operand(op) {
                for ch in text.bytes() {
                    bytes.push((ch as i32 + offset) as u8);
                }
                continue;
            }
            let v = match self.eval_expr(op) {
                Ok(r) => {
                    if r.undefined {
                        self.emitted_undefined = true;
                    }
                    r.value
                }
                Err(e) => {
                    self.error(line, e);
                    0
                }
            };
            let v = v + offset;
            if !(-128..=255).contains(&v) {
                self.error(line, format!("byte value {v} out of range"));
            }
            bytes.push((v & 0xFF) as u8);
        }
        if set_high {
            if let Some(last) = bytes.last_mut() {
                *last |= 0x80;
            }
        }
        if zero {
            bytes.push(0);
        }
        self.emit(&bytes);
    }

    fn emit_abyte(&mut self, line: &SourceLine, set_high: bool, zero: bool) {
        let Some(offset_expr) = line.operands.first().cloned() else {
            self.error(line, "ABYTE needs an offset");
            return;
        };
        let offset = self.eval_value(&offset_expr, line);
        self.emit_data_bytes_from(line, 1, offset, set_high, zero);
    }

    fn emit_data_words(&mut self, line: &SourceLine) {
        let mut bytes = Vec::with_capacity(line.operands.len() * 2);
        if line.operands.is_empty() {
            self.error(line, "DW needs operands");
            return;
        }
        for op in &line.operands {
            let v = self.eval_value(op, line);
            if !(-32768..=65535).contains(&v) {
                self.error(line, format!("word value {v} out of range"));
            }
            bytes.extend_from_slice(&(v as u16).to_le_bytes());
        }
        self.emit(&bytes);
    }

    // --------------------------- includes -------------------------------

    fn include(&mut self, line: &SourceLine) -> Result<(), AsmError> {
        let Some(op) = line.operands.first() else {
            self.error(line, "INCLUDE needs a filename");
            return Ok(());
        };
        let path = unquote(op).unwrap_or(op).to_string();
        let resolved = self.resolve_path(&line.file, &path);
        if self.include_stack.contains(&resolved) {
            return Err(AsmError::CircularInclude(resolved));
        }
        if self.include_stack.len() >= MAX_INCLUDE_DEPTH {
            return Err(AsmError::IncludeDepth(MAX_INCLUDE_DEPTH));
        }
        let Some(source) = self.read_text(&resolved) else {
            self.error(line, format!("cannot include \"{path}\""));
            return Ok(());
        };
        let lines = parser::parse_source(&source, &resolved);
        self.include_stack.push(resolved);
        for inner in &lines {
            self.process_line(inner)?;
        }
        self.include_stack.pop();
        Ok(())
    }

    fn resolve_path(&self, from: &str, path: &str) -> String {
        self.vfs_resolve(from, path)
    }

    fn incbin(&mut self, line: &SourceLine) {
        let Some(op) = line.operands.first() else {
            self.error(line, "INCBIN needs a filename");
            return;
        };
        let path = unquote(op).unwrap_or(op).to_string();
        let resolved = self.resolve_path(&line.file, &path);
        let Some(data) = self.read_bytes(&resolved) else {
            self.error(line, format!("cannot read \"{path}\""));
            return;
        };
        let offset = line
            .operands
            .get(1)
            .cloned()
            .map(|e| self.eval_value(&e, line).max(0) as usize)
            .unwrap_or(0);
        let available = data.len().saturating_sub(offset);
        let length = match line.operands.get(2).cloned() {
            Some(e) => {
                let want = self.eval_value(&e, line).max(0) as usize;
                if want > available {
                    self.warning(
                        line,
                        format!("INCBIN length {want} exceeds file size, truncated"),
                    );
                }
                want.min(available)
            }
            None => available,
        };
        let slice = data[offset..offset + length].to_vec();
        self.emit(&slice);
    }

    fn start_macro(&mut self, line: &SourceLine) {
        // Both spellings: `name MACRO params` and `MACRO name, params`.
        let (name, params) = if let Some(label) = line.label.clone() {
            (label, line.operands.clone())
        } else if let Some(first) = line.operands.first().cloned() {
            (first, line.operands[1..].to_vec())
        } else {
            self.error(line, "MACRO needs a name");
            return;
        };
        self.pending_macro = Some(MacroCapture {
            def: MacroDef {
                name: name.to_ascii_uppercase(),
                params,
                body: Vec::new(),
                file: line.file.clone(),
            },
            depth: 0,
        });
    }

    // ---------------------------- devices -------------------------------

    fn select_device(&mut self, line: &SourceLine) {
        let Some(name) = line.operands.first() else {
            self.error(line, "DEVICE needs a name");
            return;
        };
        let id = match name.to_ascii_uppercase().as_str() {
            "ZXSPECTRUM48" => Some(MachineId::Spectrum48),
            "ZXSPECTRUM128" => Some(MachineId::Spectrum128),
            "ZXSPECTRUMPLUS3" | "PLUS3" => Some(MachineId::Plus3),
            "PENTAGON128" => Some(MachineId::Pentagon128),
            "SCORPION256" => Some(MachineId::Scorpion256),
            "NONE" => None,
            other => {
                self.error(line, format!("unknown device '{other}'"));
                return;
            }
        };
        self.device = id.map(|id| {
            let mut mem = Memory::new(machine::profile(id));
            mem.set_allow_rom_edit(true);
            mem
        });
    }

    // ------------------------- save directives ---------------------------

    fn expected_md5(&self, line: &SourceLine, filename: &str) -> Option<String> {
        if let Some(comment) = &line.comment {
            let c = comment.trim();
            if let Some(rest) = c.strip_prefix("md5:").or_else(|| c.strip_prefix("MD5:")) {
                return Some(rest.trim().to_ascii_lowercase());
            }
        }
        self.md5_assoc.get(filename).cloned()
    }

    fn save_filename(&mut self, line: &SourceLine, what: &str) -> Option<String> {
        match line.operands.first().and_then(|o| unquote(o)) {
            Some(f) => Some(f.to_string()),
            None => {
                self.error(line, format!("{what} needs a quoted filename"));
                None
            }
        }
    }

    fn push_save(&mut self, cmd: SaveCommand) {
        self.save_commands.push(cmd);
    }

    fn save_bin(&mut self, line: &SourceLine) {
        let Some(filename) = self.save_filename(line, "SAVEBIN") else {
            return;
        };
        let (Some(start_e), Some(len_e)) =
            (line.operands.get(1).cloned(), line.operands.get(2).cloned())
        else {
            self.error(line, "SAVEBIN needs start and length");
            return;
        };
        let start = self.eval_value(&start_e, line) as u16;
        let length = self.eval_value(&len_e, line).max(0) as usize;
        let data = self.output_slice(start, length);
        let expected_md5 = self.expected_md5(line, &filename);
        self.push_save(SaveCommand {
            kind: SaveKind::Bin,
            filename,
            start,
            length,
            data,
            member: None,
            expected_md5,
        });
    }

    fn save_sna(&mut self, line: &SourceLine) {
        let Some(filename) = self.save_filename(line, "SAVESNA") else {
            return;
        };
        let pc = line
            .operands
            .get(1)
            .cloned()
            .map(|e| self.eval_value(&e, line) as u16)
            .unwrap_or(self.output_start);
        let mem = self.output_slice(0x4000, 0xC000);
        let data = save::sna_file(&mem, pc);
        let expected_md5 = self.expected_md5(line, &filename);
        self.push_save(SaveCommand {
            kind: SaveKind::Sna,
            filename,
            start: pc,
            length: data.len(),
            data,
            member: None,
            expected_md5,
        });
    }

    fn empty_tap(&mut self, line: &SourceLine) {
        let Some(filename) = self.save_filename(line, "EMPTYTAP") else {
            return;
        };
        let expected_md5 = self.expected_md5(line, &filename);
        self.push_save(SaveCommand {
            kind: SaveKind::EmptyTap,
            filename,
            start: 0,
            length: 0,
            data: Vec::new(),
            member: None,
            expected_md5,
        });
    }

    fn save_tap(&mut self, line: &SourceLine) {
        let Some(filename) = self.save_filename(line, "SAVETAP") else {
            return;
        };
        let mode_text = line
            .operands
            .get(1)
            .map(|o| o.to_ascii_uppercase())
            .unwrap_or_default();
        let mode = match mode_text.as_str() {
            "BASIC" => Some(TapMode::Basic),
            "CODE" => Some(TapMode::Code),
            "NUMBERS" => Some(TapMode::Numbers),
            "CHARS" => Some(TapMode::Chars),
            "HEADLESS" => Some(TapMode::Headless),
            _ => None,
        };
        let (mode, name, start_idx) = match mode {
            // SAVETAP "file", MODE, "name", start, length[, param]
            Some(TapMode::Headless) => (TapMode::Headless, String::new(), 2),
            Some(m) => {
                let name = line
                    .operands
                    .get(2)
                    .and_then(|o| unquote(o))
                    .unwrap_or("")
                    .to_string();
                (m, name, 3)
            }
            // Simple form: SAVETAP "file", start, length
            None => {
                let stem = filename
                    .rsplit('/')
                    .next()
                    .unwrap_or(&filename)
                    .split('.')
                    .next()
                    .unwrap_or(&filename)
                    .to_string();
                (TapMode::Code, stem, 1)
            }
        };
        let (Some(start_e), Some(len_e)) = (
            line.operands.get(start_idx).cloned(),
            line.operands.get(start_idx + 1).cloned(),
        ) else {
            self.error(line, "SAVETAP needs start and length");
            return;
        };
        let start = self.eval_value(&start_e, line) as u16;
        let length = self.eval_value(&len_e, line).max(0) as usize;
        let param = line
            .operands
            .get(start_idx + 2)
            .cloned()
            .map(|e| self.eval_value(&e, line) as u16)
            .unwrap_or(match mode {
                TapMode::Code => start,
                TapMode::Basic => 0x8000, // no autostart
                _ => 0,
            });
        let body = self.output_slice(start, length);
        let data = save::tap_file(mode, &name, param, &body);
        let expected_md5 = self.expected_md5(line, &filename);
        self.push_save(SaveCommand {
            kind: SaveKind::Tap,
            filename,
            start,
            length,
            data,
            member: Some(name),
            expected_md5,
        });
    }

    fn empty_trd_directive(&mut self, line: &SourceLine) {
        let Some(filename) = self.save_filename(line, "EMPTYTRD") else {
            return;
        };
        let label = line
            .operands
            .get(1)
            .and_then(|o| unquote(o))
            .unwrap_or("empty")
            .to_string();
        let data = save::empty_trd(&label);
        let expected_md5 = self.expected_md5(line, &filename);
        self.push_save(SaveCommand {
            kind: SaveKind::EmptyTrd,
            filename,
            start: 0,
            length: data.len(),
            data,
            member: None,
            expected_md5,
        });
    }

    fn save_trd(&mut self, line: &SourceLine) {
        let Some(filename) = self.save_filename(line, "SAVETRD") else {
            return;
        };
        let Some(member) = line.operands.get(1).and_then(|o| unquote(o)).map(str::to_string)
        else {
            self.error(line, "SAVETRD needs a catalogue name");
            return;
        };
        let (Some(start_e), Some(len_e)) =
            (line.operands.get(2).cloned(), line.operands.get(3).cloned())
        else {
            self.error(line, "SAVETRD needs start and length");
            return;
        };
        let start = self.eval_value(&start_e, line) as u16;
        let length = self.eval_value(&len_e, line).max(0) as usize;
        let data = self.output_slice(start, length);
        let expected_md5 = self.expected_md5(line, &filename);
        self.push_save(SaveCommand {
            kind: SaveKind::Trd,
            filename,
            start,
            length,
            data,
            member: Some(member),
            expected_md5,
        });
    }

    fn md5check(&mut self, line: &SourceLine) {
        let (Some(file), Some(md5)) = (
            line.operands.first().and_then(|o| unquote(o)),
            line.operands.get(1).and_then(|o| unquote(o)),
        ) else {
            self.error(line, "MD5CHECK needs a filename and a digest");
            return;
        };
        self.md5_assoc
            .insert(file.to_string(), md5.to_ascii_lowercase());
    }

    // --------------------------- VFS access ------------------------------

    fn vfs_resolve(&self, from: &str, path: &str) -> String {
        self.vfs.resolve(from, path)
    }

    fn read_text(&self, path: &str) -> Option<String> {
        self.vfs.read_text(path)
    }

    fn read_bytes(&self, path: &str) -> Option<Vec<u8>> {
        self.vfs.read(path)
    }
}
