/*!
Shared error taxonomy for the toolchain.

Split by propagation policy:
- `DskFormatError`: hard failures loading a DSK image. The loader returns
  these; unformatted tracks in extended images are *not* errors.
- `AsmError`: fatal assembler conditions that abort the run (convergence
  failure, include cycles, exceeded depth). Everything non-fatal goes
  through the `ErrorCollector` instead so a single run can report many
  diagnostics.

The emulator-side components (memory pager, FDC, disassembler) never return
errors across their public surface; every condition there is observable
machine state (status registers, DEFB fallback decodes).
*/

use thiserror::Error;

/// Hard failures while parsing a DSK/EDSK image.
#[derive(Debug, Error)]
pub enum DskFormatError {
    #[error("file too small for a DSK header ({0} bytes)")]
    TooSmall(usize),
    #[error("unrecognized DSK signature")]
    BadSignature,
    #[error("track {track} extends past end of file")]
    TruncatedTrack { track: usize },
    #[error("track {track} missing Track-Info header")]
    BadTrackHeader { track: usize },
}

/// Fatal assembler conditions; non-fatal diagnostics go to the collector.
#[derive(Debug, Error)]
pub enum AsmError {
    #[error("{count} symbol(s) still undefined and not converging: {names}")]
    UndefinedSymbols { count: usize, names: String },
    #[error("assembly did not converge after {passes} passes")]
    NoConvergence { passes: usize },
    #[error("circular include of \"{0}\"")]
    CircularInclude(String),
    #[error("include depth exceeds {0}")]
    IncludeDepth(usize),
    #[error("cannot read \"{0}\"")]
    FileNotFound(String),
}

/// A single diagnostic with source position, produced during assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub message: String,
    pub file: String,
    pub line: u32,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.file, self.line, self.message)
    }
}

/// Accumulates errors and warnings across an assembly run.
///
/// The assembler funnels every non-fatal condition here and keeps going, so
/// one invocation reports as many diagnostics as possible. `_ERRORS` and
/// `_WARNINGS` built-in symbols read the live counts.
#[derive(Debug, Default)]
pub struct ErrorCollector {
    errors: Vec<Diagnostic>,
    warnings: Vec<Diagnostic>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(&mut self, file: &str, line: u32, message: impl Into<String>) {
        self.errors.push(Diagnostic {
            message: message.into(),
            file: file.to_string(),
            line,
        });
    }

    pub fn warning(&mut self, file: &str, line: u32, message: impl Into<String>) {
        self.warnings.push(Diagnostic {
            message: message.into(),
            file: file.to_string(),
            line,
        });
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    pub fn errors(&self) -> &[Diagnostic] {
        &self.errors
    }

    pub fn warnings(&self) -> &[Diagnostic] {
        &self.warnings
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Drop diagnostics from a finished pass so the next pass reports fresh.
    pub fn clear(&mut self) {
        self.errors.clear();
        self.warnings.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_counts_and_positions() {
        let mut c = ErrorCollector::new();
        c.error("main.asm", 12, "bad operand");
        c.warning("main.asm", 30, "label never used");
        assert_eq!(c.error_count(), 1);
        assert_eq!(c.warning_count(), 1);
        assert_eq!(format!("{}", c.errors()[0]), "main.asm:12: bad operand");
    }

    #[test]
    fn clear_resets_between_passes() {
        let mut c = ErrorCollector::new();
        c.error("a.asm", 1, "x");
        c.clear();
        assert!(!c.has_errors());
    }
}
