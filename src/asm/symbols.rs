/*!
Symbol table with module prefixes, local labels, and temporary labels.

Name resolution:
- A leading `@` forces an absolute (unprefixed) lookup.
- A leading `.` makes the name local: it is prefixed with the most recent
  non-local label.
- Anything else is prefixed by the module stack joined with `.`; lookups
  fall back to the bare name so code inside a module can still reach
  globals.

The table is recreated every pass; lookups fall back to the previous
pass's values so forward references resolve from the second pass on. A
definition whose value differs from the previous pass marks the pass as
changed.

Temporary labels `N:` keep per-N ordered definition lists. `NB` resolves
to the nearest previous definition in the current pass; `NF` resolves from
the *previous* pass's list (the next definition has not been reached yet
in this pass).
*/

use std::collections::{HashMap, HashSet};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SymbolKind {
    Label,
    Equ,
    Defl,
}

#[derive(Clone, Debug)]
pub struct Symbol {
    pub value: i32,
    pub kind: SymbolKind,
    pub used: bool,
    pub file: String,
    pub line: u32,
}

#[derive(Copy, Clone, Debug)]
struct TempDef {
    addr: u16,
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    map: HashMap<String, Symbol>,
    prev: HashMap<String, i32>,
    /// Names referenced while (still) unresolvable in either table.
    undefined_refs: HashSet<String>,
    module_stack: Vec<String>,
    last_global_label: String,
    /// Suffix applied to local labels inside a macro expansion.
    macro_suffix: Option<usize>,
    temp: HashMap<u32, Vec<TempDef>>,
    prev_temp: HashMap<u32, Vec<TempDef>>,
    /// Whether any definition this pass differed from the previous pass.
    changed: bool,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new pass: current definitions become the fallback set and
    /// temp-label lists are promoted.
    pub fn begin_pass(&mut self) {
        let prev: HashMap<String, i32> =
            self.map.iter().map(|(k, s)| (k.clone(), s.value)).collect();
        if !prev.is_empty() {
            self.prev = prev;
        }
        self.map.clear();
        self.undefined_refs.clear();
        self.prev_temp = std::mem::take(&mut self.temp);
        self.module_stack.clear();
        self.last_global_label.clear();
        self.macro_suffix = None;
        self.changed = false;
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn undefined_count(&self) -> usize {
        self.undefined_refs.len()
    }

    pub fn undefined_names(&self) -> Vec<String> {
        let mut v: Vec<String> = self.undefined_refs.iter().cloned().collect();
        v.sort();
        v
    }

    // --------------------------- name shaping ---------------------------

    pub fn push_module(&mut self, name: &str) {
        self.module_stack.push(name.to_string());
    }

    pub fn pop_module(&mut self) -> bool {
        self.module_stack.pop().is_some()
    }

    pub fn set_macro_suffix(&mut self, id: Option<usize>) {
        self.macro_suffix = id;
    }

    fn module_prefix(&self) -> String {
        self.module_stack.join(".")
    }

    /// Fully qualify a source-level name.
    pub fn qualify(&self, name: &str) -> String {
        if let Some(abs) = name.strip_prefix('@') {
            return abs.to_string();
        }
        if name.starts_with('.') {
            let mut full = format!("{}{}", self.last_global_label, name);
            if let Some(id) = self.macro_suffix {
                full = format!("{full}__m{id}");
            }
            return full;
        }
        let prefix = self.module_prefix();
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}.{name}")
        }
    }

    // --------------------------- definitions ----------------------------

    /// Define a label at an address. Duplicate labels in one pass are an
    /// error (`Err` carries the qualified name).
    pub fn define_label(
        &mut self,
        name: &str,
        addr: u16,
        file: &str,
        line: u32,
    ) -> Result<(), String> {
        let full = self.qualify(name);
        if !name.starts_with('.') {
            self.last_global_label = full.clone();
        }
        self.insert(full, addr as i32, SymbolKind::Label, file, line, false)
    }

    /// Define an EQU (`Err` on conflicting redefinition) or DEFL (always
    /// allowed to move).
    pub fn define_value(
        &mut self,
        name: &str,
        value: i32,
        kind: SymbolKind,
        file: &str,
        line: u32,
    ) -> Result<(), String> {
        let full = self.qualify(name);
        self.insert(full, value, kind, file, line, kind == SymbolKind::Defl)
    }

    fn insert(
        &mut self,
        full: String,
        value: i32,
        kind: SymbolKind,
        file: &str,
        line: u32,
        redefinable: bool,
    ) -> Result<(), String> {
        if let Some(existing) = self.map.get_mut(&full) {
            if redefinable || (existing.kind == kind && existing.value == value) {
                existing.value = value;
                return Ok(());
            }
            return Err(full);
        }
        // DEFL symbols move by design; they never hold up convergence.
        if kind != SymbolKind::Defl && self.prev.get(&full) != Some(&value) {
            self.changed = true;
        }
        self.undefined_refs.remove(&full);
        self.map.insert(
            full,
            Symbol {
                value,
                kind,
                used: false,
                file: file.to_string(),
                line,
            },
        );
        Ok(())
    }

    // ----------------------------- lookups ------------------------------

    /// Resolve a source-level reference. Marks the symbol used. Returns
    /// `None` when the name is unknown in both the current and previous
    /// pass tables (and records it as an undefined reference).
    pub fn lookup(&mut self, name: &str) -> Option<i32> {
        let full = self.qualify(name);
        if let Some(v) = self.lookup_full(&full) {
            return Some(v);
        }
        // Names inside a module may still refer to globals.
        if !name.starts_with(['.', '@']) && full != name {
            if let Some(v) = self.lookup_full(name) {
                return Some(v);
            }
        }
        self.undefined_refs.insert(full);
        None
    }

    fn lookup_full(&mut self, full: &str) -> Option<i32> {
        if let Some(sym) = self.map.get_mut(full) {
            sym.used = true;
            return Some(sym.value);
        }
        self.prev.get(full).copied()
    }

    /// Is the name defined (either table), without marking it used?
    pub fn is_defined(&self, name: &str) -> bool {
        let full = self.qualify(name);
        self.map.contains_key(&full)
            || self.prev.contains_key(&full)
            || self.map.contains_key(name)
            || self.prev.contains_key(name)
    }

    /// Has the name been referenced this pass?
    pub fn is_used(&self, name: &str) -> bool {
        let full = self.qualify(name);
        self.map.get(&full).map(|s| s.used).unwrap_or(false)
    }

    /// Labels defined but never referenced this pass (for warnings).
    pub fn unused_labels(&self) -> Vec<(String, String, u32)> {
        let mut v: Vec<(String, String, u32)> = self
            .map
            .iter()
            .filter(|(_, s)| s.kind == SymbolKind::Label && !s.used)
            .map(|(name, s)| (name.clone(), s.file.clone(), s.line))
            .collect();
        v.sort();
        v
    }

    /// Sorted `(name, value)` pairs for symbol listings.
    pub fn listing(&self) -> Vec<(String, i32)> {
        let mut v: Vec<(String, i32)> =
            self.map.iter().map(|(k, s)| (k.clone(), s.value)).collect();
        v.sort();
        v
    }

    // -------------------------- temporary labels -------------------------

    pub fn define_temp(&mut self, n: u32, addr: u16) {
        self.temp.entry(n).or_default().push(TempDef { addr });
    }

    /// Resolve `NB` (backward) or `NF` (forward). Forward references come
    /// from the previous pass's list.
    pub fn lookup_temp(&mut self, n: u32, forward: bool) -> Option<u16> {
        let seen = self.temp.get(&n).map(|v| v.len()).unwrap_or(0);
        if forward {
            let addr = self.prev_temp.get(&n).and_then(|v| v.get(seen)).map(|d| d.addr);
            if addr.is_none() {
                self.undefined_refs.insert(format!("{n}F"));
            }
            addr
        } else {
            let addr = self.temp.get(&n).and_then(|v| v.last()).map(|d| d.addr);
            if addr.is_none() {
                self.undefined_refs.insert(format!("{n}B"));
            }
            addr
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_and_local_prefixes() {
        let mut t = SymbolTable::new();
        t.define_label("start", 0x8000, "a.asm", 1).unwrap();
        t.define_label(".loop", 0x8002, "a.asm", 2).unwrap();
        assert_eq!(t.lookup("start"), Some(0x8000));
        assert_eq!(t.lookup(".loop"), Some(0x8002));
        t.push_module("snd");
        t.define_label("play", 0x9000, "a.asm", 5).unwrap();
        assert_eq!(t.lookup("play"), Some(0x9000));
        assert_eq!(t.lookup("@snd.play"), Some(0x9000));
        // Globals remain reachable from inside the module.
        assert_eq!(t.lookup("start"), Some(0x8000));
        t.pop_module();
        assert_eq!(t.lookup("snd.play"), Some(0x9000));
    }

    #[test]
    fn duplicate_labels_error() {
        let mut t = SymbolTable::new();
        t.define_label("x", 1, "a", 1).unwrap();
        assert!(t.define_label("x", 2, "a", 2).is_err());
        // Same value is tolerated (re-processing the same line).
        assert!(t.define_label("x", 1, "a", 1).is_ok());
    }

    #[test]
    fn equ_vs_defl_redefinition() {
        let mut t = SymbolTable::new();
        t.define_value("k", 5, SymbolKind::Equ, "a", 1).unwrap();
        assert!(t.define_value("k", 6, SymbolKind::Equ, "a", 2).is_err());
        t.define_value("d", 1, SymbolKind::Defl, "a", 3).unwrap();
        assert!(t.define_value("d", 2, SymbolKind::Defl, "a", 4).is_ok());
        assert_eq!(t.lookup("d"), Some(2));
    }

    #[test]
    fn previous_pass_resolves_forward_refs() {
        let mut t = SymbolTable::new();
        t.begin_pass();
        assert_eq!(t.lookup("later"), None);
        assert_eq!(t.undefined_count(), 1);
        t.define_label("later", 0x0004, "a", 2).unwrap();
        assert!(t.changed());
        t.begin_pass();
        assert_eq!(t.lookup("later"), Some(0x0004));
        assert_eq!(t.undefined_count(), 0);
        t.define_label("later", 0x0004, "a", 2).unwrap();
        assert!(!t.changed(), "stable value means no change");
    }

    #[test]
    fn changed_when_value_moves() {
        let mut t = SymbolTable::new();
        t.begin_pass();
        t.define_label("l", 10, "a", 1).unwrap();
        t.begin_pass();
        t.define_label("l", 12, "a", 1).unwrap();
        assert!(t.changed());
    }

    #[test]
    fn temp_labels_backward_and_forward() {
        let mut t = SymbolTable::new();
        t.begin_pass();
        t.define_temp(1, 0x8000);
        assert_eq!(t.lookup_temp(1, false), Some(0x8000));
        assert_eq!(t.lookup_temp(1, true), None, "no next def this pass");
        t.define_temp(1, 0x8010);
        assert_eq!(t.lookup_temp(1, false), Some(0x8010));
        // Next pass: forward refs come from the promoted list.
        t.begin_pass();
        t.define_temp(1, 0x8000);
        assert_eq!(t.lookup_temp(1, true), Some(0x8010));
    }

    #[test]
    fn unused_label_reporting() {
        let mut t = SymbolTable::new();
        t.define_label("used", 1, "a", 1).unwrap();
        t.define_label("lonely", 2, "a", 2).unwrap();
        t.lookup("used");
        let unused = t.unused_labels();
        assert_eq!(unused.len(), 1);
        assert_eq!(unused[0].0, "lonely");
    }

    #[test]
    fn macro_suffix_isolates_locals() {
        let mut t = SymbolTable::new();
        t.define_label("outer", 0x100, "a", 1).unwrap();
        t.set_macro_suffix(Some(1));
        t.define_label(".l", 0x110, "a", 2).unwrap();
        t.set_macro_suffix(Some(2));
        t.define_label(".l", 0x120, "a", 3).unwrap();
        assert_eq!(t.lookup(".l"), Some(0x120));
        t.set_macro_suffix(None);
        assert!(t.lookup(".l").is_none());
    }
}
