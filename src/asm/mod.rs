/*!
Multi-pass Z80 macro assembler (sjasmplus-compatible subset).

Pipeline: reset shared state, install command-line defines as EQUs, parse
the root source, then iterate passes (capped at 10). Each pass clears the
output and address counters, promotes the temporary-label tables, and
walks the parsed lines; symbol lookups fall back to the previous pass's
values so forward references resolve from pass 2 on. The run terminates
when no symbol is undefined and no symbol moved; an undefined count that
stops shrinking is a hard error listing the names, and a `changed` flag
still set after pass 5 is a non-convergence error.

Submodules:
- parser: source text -> `SourceLine` records
- expr / symbols: expression evaluation against the symbol snapshot
- directives: the directive dispatch (`ORG`, `DB`, `INCLUDE`, ...)
- macros: MACRO / REPT / STRUCT capture and expansion
- save: SAVEBIN / SAVESNA / SAVETAP / SAVETRD emitters
*/

pub mod directives;
pub mod expr;
pub mod macros;
pub mod parser;
pub mod save;
pub mod symbols;

use std::collections::HashMap;

use log::debug;

use crate::errors::{AsmError, Diagnostic, ErrorCollector};
use crate::memory::Memory;
use crate::vfs::Vfs;
use crate::z80::encoder::{self, EncodeRequest, EvalValue};

use expr::{EvalContext, EvalResult};
use macros::{MacroCapture, MacroDef, ReptCapture, StructCapture, StructDef};
use parser::{parse_source, SourceLine};
use save::SaveCommand;
use symbols::{SymbolKind, SymbolTable};

pub const MAX_PASSES: usize = 10;
pub const MAX_INCLUDE_DEPTH: usize = 32;
const PROGRESS_INTERVAL: usize = 5000;

/// One conditional-stack frame.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Cond {
    pub active: bool,
    /// Some branch of this IF chain has already been taken.
    pub taken: bool,
    pub parent_active: bool,
}

#[derive(Default)]
pub struct AssembleOptions {
    /// `-D NAME=VALUE` command-line defines, installed as EQUs.
    pub defines: Vec<(String, String)>,
    /// Pass cap override; 0 means the default.
    pub max_passes: usize,
}

/// Everything a driver needs after a successful run.
#[derive(Debug)]
pub struct AssembleOutput {
    pub output: Vec<u8>,
    pub output_start: u16,
    pub save_commands: Vec<SaveCommand>,
    pub symbols: Vec<(String, i32)>,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
    pub passes: usize,
}

pub struct Assembler<'v> {
    vfs: &'v dyn Vfs,
    pub(crate) symbols: SymbolTable,
    pub(crate) collector: ErrorCollector,
    pub(crate) current_address: u16,
    /// Output-position counter while DISP is active.
    pub(crate) physical_address: Option<u16>,
    pub(crate) section_start: u16,
    pub(crate) output: Vec<u8>,
    pub(crate) output_start: u16,
    pub(crate) output_anchored: bool,
    pub(crate) org_addresses: Vec<u16>,
    pub(crate) pass: usize,
    /// An undefined expression was emitted as zero this pass.
    pub(crate) emitted_undefined: bool,
    pub(crate) cond_stack: Vec<Cond>,
    pub(crate) macros: HashMap<String, MacroDef>,
    pub(crate) pending_macro: Option<MacroCapture>,
    pub(crate) pending_rept: Option<ReptCapture>,
    pub(crate) structs: HashMap<String, StructDef>,
    pub(crate) pending_struct: Option<StructCapture>,
    pub(crate) include_stack: Vec<String>,
    pub(crate) save_commands: Vec<SaveCommand>,
    pub(crate) md5_assoc: HashMap<String, String>,
    pub(crate) macro_counter: usize,
    pub(crate) macro_suffix_stack: Vec<Option<usize>>,
    /// Set by END: the rest of the pass is skipped.
    pub(crate) ended: bool,
    max_passes: usize,
    defines: Vec<(String, String)>,
    lines_processed: usize,
    progress: Option<Box<dyn FnMut(usize)>>,
    /// Parallel memory model selected by DEVICE.
    pub(crate) device: Option<Memory>,
}

impl<'v> Assembler<'v> {
    pub fn new(vfs: &'v dyn Vfs, options: AssembleOptions) -> Self {
        Self {
            vfs,
            symbols: SymbolTable::new(),
            collector: ErrorCollector::new(),
            current_address: 0,
            physical_address: None,
            section_start: 0,
            output: Vec::new(),
            output_start: 0,
            output_anchored: false,
            org_addresses: Vec::new(),
            pass: 0,
            emitted_undefined: false,
            cond_stack: Vec::new(),
            macros: HashMap::new(),
            pending_macro: None,
            pending_rept: None,
            structs: HashMap::new(),
            pending_struct: None,
            include_stack: Vec::new(),
            save_commands: Vec::new(),
            md5_assoc: HashMap::new(),
            macro_counter: 0,
            macro_suffix_stack: Vec::new(),
            ended: false,
            max_passes: if options.max_passes == 0 {
                MAX_PASSES
            } else {
                options.max_passes
            },
            defines: options.defines,
            lines_processed: 0,
            progress: None,
            device: None,
        }
    }

    /// Install a synchronous progress hook, invoked every 5,000 lines.
    pub fn set_progress_hook(&mut self, hook: Option<Box<dyn FnMut(usize)>>) {
        self.progress = hook;
    }

    /// Addresses every ORG of the last pass set, in order.
    pub fn org_addresses(&self) -> &[u16] {
        &self.org_addresses
    }

    /// Run the full pass loop over `main_path`.
    pub fn assemble(&mut self, main_path: &str) -> Result<AssembleOutput, AsmError> {
        let source = self
            .vfs
            .read_text(main_path)
            .ok_or_else(|| AsmError::FileNotFound(main_path.to_string()))?;
        let lines = parse_source(&source, main_path);

        let max_passes = self.max_passes;
        let mut prev_undefined = usize::MAX;
        let mut passes = 0usize;
        loop {
            passes += 1;
            self.begin_pass(passes);
            self.include_stack.push(main_path.to_string());
            for line in &lines {
                self.process_line(line)?;
            }
            self.include_stack.pop();
            self.finish_pass(main_path);

            let undefined = self.symbols.undefined_count();
            let changed = self.symbols.changed() || self.emitted_undefined;
            debug!(
                "pass {passes}: {} bytes, {undefined} undefined, changed={changed}",
                self.output.len()
            );
            if undefined == 0 && !changed {
                break;
            }
            if passes >= 2 && undefined > 0 && undefined >= prev_undefined {
                let names = self.symbols.undefined_names();
                return Err(AsmError::UndefinedSymbols {
                    count: names.len(),
                    names: names.join(", "),
                });
            }
            if passes >= 5 && undefined == 0 && changed {
                return Err(AsmError::NoConvergence { passes });
            }
            if passes >= max_passes {
                return Err(AsmError::NoConvergence { passes });
            }
            prev_undefined = undefined;
        }

        for (name, file, line) in self.symbols.unused_labels() {
            self.collector
                .warning(&file, line, format!("label '{name}' is never used"));
        }

        Ok(AssembleOutput {
            output: self.output.clone(),
            output_start: self.output_start,
            save_commands: std::mem::take(&mut self.save_commands),
            symbols: self.symbols.listing(),
            errors: self.collector.errors().to_vec(),
            warnings: self.collector.warnings().to_vec(),
            passes,
        })
    }

    fn begin_pass(&mut self, pass: usize) {
        self.pass = pass;
        self.symbols.begin_pass();
        self.collector.clear();
        self.current_address = 0;
        self.physical_address = None;
        self.section_start = 0;
        self.output.clear();
        self.output_start = 0;
        self.output_anchored = false;
        self.org_addresses.clear();
        self.emitted_undefined = false;
        self.cond_stack.clear();
        self.macros.clear();
        self.pending_macro = None;
        self.pending_rept = None;
        self.structs.clear();
        self.pending_struct = None;
        self.include_stack.clear();
        self.save_commands.clear();
        self.md5_assoc.clear();
        self.macro_counter = 0;
        self.macro_suffix_stack.clear();
        self.ended = false;
        self.device = None;
        self.lines_processed = 0;

        for (name, value) in self.defines.clone() {
            let parsed = match self.eval_expr(&value) {
                Ok(r) if !r.undefined => r.value,
                _ => 0,
            };
            if self
                .symbols
                .define_value(&name, parsed, SymbolKind::Equ, "<cli>", 0)
                .is_err()
            {
                self.collector
                    .error("<cli>", 0, format!("conflicting define '{name}'"));
            }
        }
    }

    fn finish_pass(&mut self, main_path: &str) {
        if self.pending_macro.take().is_some() {
            self.collector
                .error(main_path, 0, "unterminated MACRO definition");
        }
        if self.pending_rept.take().is_some() {
            self.collector.error(main_path, 0, "unterminated REPT block");
        }
        if self.pending_struct.take().is_some() {
            self.collector.error(main_path, 0, "unterminated STRUCT");
        }
        if !self.cond_stack.is_empty() {
            self.collector
                .error(main_path, 0, "unterminated conditional block");
            self.cond_stack.clear();
        }
    }

    // ------------------------- line processing -------------------------

    pub(crate) fn cond_active(&self) -> bool {
        self.cond_stack.iter().all(|c| c.active)
    }

    pub(crate) fn process_line(&mut self, line: &SourceLine) -> Result<(), AsmError> {
        if self.ended {
            return Ok(());
        }
        self.lines_processed += 1;
        if self.lines_processed % PROGRESS_INTERVAL == 0 {
            let n = self.lines_processed;
            if let Some(hook) = self.progress.as_mut() {
                hook(n);
            }
        }

        let m = line.mnemonic_upper();

        // Capture states swallow everything until their terminator.
        if self.pending_macro.is_some() {
            self.capture_macro_line(line, &m);
            return Ok(());
        }
        if self.pending_rept.is_some() {
            return self.capture_rept_line(line, &m);
        }
        if self.pending_struct.is_some() {
            self.capture_struct_line(line, &m);
            return Ok(());
        }

        // Conditional directives always execute.
        if matches!(
            m.as_str(),
            "IF" | "IFDEF" | "IFNDEF" | "IFUSED" | "IFNUSED" | "ELSE" | "ELSEIF" | "ENDIF"
        ) {
            self.handle_conditional(line, &m);
            return Ok(());
        }
        if !self.cond_active() {
            return Ok(());
        }

        // Directives that consume the label themselves.
        let label_consumed = matches!(m.as_str(), "EQU" | "=" | "DEFL" | "MACRO" | "STRUCT");
        if !label_consumed {
            if let Some(label) = &line.label {
                self.define_line_label(label, line);
            }
        }

        if line.mnemonic.is_none() {
            return Ok(());
        }

        if self.handle_directive(line, &m)? {
            return Ok(());
        }
        if encoder::is_mnemonic(&m) {
            self.encode_instruction(line);
            return Ok(());
        }
        if let Some(def) = self.structs.get(&m).cloned() {
            self.instantiate_struct(&def, line);
            return Ok(());
        }
        if let Some(def) = self.macros.get(&m).cloned() {
            return self.call_macro(&def, line);
        }
        self.error(line, format!("unknown mnemonic '{}'", m));
        Ok(())
    }

    fn define_line_label(&mut self, label: &str, line: &SourceLine) {
        if label.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(n) = label.parse::<u32>() {
                self.symbols.define_temp(n, self.current_address);
                return;
            }
        }
        if let Err(full) =
            self.symbols
                .define_label(label, self.current_address, &line.file, line.line)
        {
            self.error(line, format!("duplicate label '{full}'"));
        }
    }

    // ------------------------ expression helpers -----------------------

    pub(crate) fn eval_expr(&mut self, text: &str) -> Result<EvalResult, String> {
        let mut ctx = EvalContext {
            symbols: &mut self.symbols,
            current_address: self.current_address,
            section_start: self.section_start,
            errors: self.collector.error_count() as i32,
            warnings: self.collector.warning_count() as i32,
        };
        expr::evaluate(text, &mut ctx)
    }

    /// Evaluate an operand, reporting syntax errors, returning 0 for
    /// undefined values and marking the pass changed.
    pub(crate) fn eval_value(&mut self, text: &str, line: &SourceLine) -> i32 {
        match self.eval_expr(text) {
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
        }
    }

    // --------------------------- diagnostics ---------------------------

    pub(crate) fn error(&mut self, line: &SourceLine, message: impl Into<String>) {
        self.collector.error(&line.file, line.line, message);
    }

    pub(crate) fn warning(&mut self, line: &SourceLine, message: impl Into<String>) {
        self.collector.warning(&line.file, line.line, message);
    }

    // ----------------------------- output ------------------------------

    /// Append bytes at the output position, zero-extending across forward
    /// ORG gaps. Advances both address counters modulo 0x10000.
    pub(crate) fn emit(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            self.advance(0);
            return;
        }
        let addr = self.physical_address.unwrap_or(self.current_address);
        if !self.output_anchored {
            self.output_start = addr;
            self.output_anchored = true;
        }
        if addr < self.output_start {
            // Emitting below the anchor cannot be represented in the
            // linear buffer; drop the bytes but keep the counters honest.
            self.advance(bytes.len());
            return;
        }
        let offset = (addr - self.output_start) as usize;
        if self.output.len() < offset + bytes.len() {
            self.output.resize(offset + bytes.len(), 0);
        }
        self.output[offset..offset + bytes.len()].copy_from_slice(bytes);
        if let Some(dev) = self.device.as_mut() {
            for (i, &b) in bytes.iter().enumerate() {
                dev.poke(addr.wrapping_add(i as u16), b);
            }
        }
        self.advance(bytes.len());
    }

    fn advance(&mut self, len: usize) {
        let len = (len % 0x10000) as u16;
        self.current_address = self.current_address.wrapping_add(len);
        if let Some(p) = self.physical_address.as_mut() {
            *p = p.wrapping_add(len);
        }
    }

    /// Bytes currently in the output buffer for `start..start+len`
    /// (addresses outside the emitted range read as zero).
    pub(crate) fn output_slice(&self, start: u16, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        for (i, slot) in out.iter_mut().enumerate() {
            let addr = start.wrapping_add(i as u16);
            if addr >= self.output_start {
                let ofs = (addr - self.output_start) as usize;
                if let Some(&b) = self.output.get(ofs) {
                    *slot = b;
                }
            }
        }
        out
    }

    // -------------------------- instructions ---------------------------

    fn encode_instruction(&mut self, line: &SourceLine) {
        let operands: Vec<&str> = line.operands.iter().map(String::as_str).collect();
        let req = EncodeRequest {
            mnemonic: line.mnemonic.as_deref().unwrap_or_default(),
            operands: &operands,
            addr: self.current_address,
        };
        let mut eval_errors: Vec<String> = Vec::new();
        let symbols = &mut self.symbols;
        let current = self.current_address;
        let section = self.section_start;
        let errors = self.collector.error_count() as i32;
        let warnings = self.collector.warning_count() as i32;
        let mut eval = |text: &str| -> EvalValue {
            let mut ctx = EvalContext {
                symbols: &mut *symbols,
                current_address: current,
                section_start: section,
                errors,
                warnings,
            };
            match expr::evaluate(text, &mut ctx) {
                Ok(r) => EvalValue {
                    value: r.value as i64,
                    undefined: r.undefined,
                },
                Err(e) => {
                    eval_errors.push(e);
                    EvalValue {
                        value: 0,
                        undefined: false,
                    }
                }
            }
        };
        let result = encoder::encode(&req, &mut eval);
        for e in eval_errors {
            self.error(line, e);
        }
        match result {
            Ok(encoded) => {
                if encoded.undefined {
                    self.emitted_undefined = true;
                }
                if let Some(w) = encoded.warning {
                    self.warning(line, w);
                }
                self.emit(&encoded.bytes);
            }
            Err(e) => self.error(line, e),
        }
    }

    // ------------------------- macro expansion --------------------------

    fn call_macro(&mut self, def: &MacroDef, line: &SourceLine) -> Result<(), AsmError> {
        self.macro_counter += 1;
        let id = self.macro_counter;
        let body = macros::expand_macro(def, &line.operands);
        self.macro_suffix_stack.push(Some(id));
        self.symbols.set_macro_suffix(Some(id));
        for (raw, body_line) in &body {
            let parsed = parser::parse_line(raw, &def.file, *body_line);
            self.process_line(&parsed)?;
        }
        self.macro_suffix_stack.pop();
        let outer = self.macro_suffix_stack.last().copied().flatten();
        self.symbols.set_macro_suffix(outer);
        Ok(())
    }
}

/// Convenience wrapper: assemble `main_path` with the given options.
pub fn assemble(
    vfs: &dyn Vfs,
    main_path: &str,
    options: AssembleOptions,
) -> Result<AssembleOutput, AsmError> {
    Assembler::new(vfs, options).assemble(main_path)
}

#[cfg(test)]
mod tests;
