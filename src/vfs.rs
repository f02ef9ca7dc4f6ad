/*!
Virtual file system consumed by INCLUDE/INCBIN and the disk-image loader.

The core only ever sees byte buffers. Two implementations:
- `MemoryVfs`: preloaded path -> bytes map, used by unit tests and by
  embedded callers.
- `HostVfs`: thin wrapper over `std::fs` rooted at a base directory, used
  by the CLI driver.

Paths are resolved relative to the including file's directory first, then
the VFS root, matching how sjasmplus-style INCLUDE chains behave.
*/

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub trait Vfs {
    /// Read a whole file as bytes. `None` when the path does not resolve.
    fn read(&self, path: &str) -> Option<Vec<u8>>;

    /// Read a file as UTF-8 text (lossy; assembler sources tolerate 8-bit
    /// character sets in strings).
    fn read_text(&self, path: &str) -> Option<String> {
        self.read(path)
            .map(|b| String::from_utf8_lossy(&b).into_owned())
    }

    /// Resolve `path` as seen from the file `from` (used for nested
    /// INCLUDEs). Defaults to returning `path` unchanged.
    fn resolve(&self, from: &str, path: &str) -> String {
        let _ = from;
        path.to_string()
    }
}

/// In-memory VFS for tests and embedded use.
#[derive(Debug, Default, Clone)]
pub struct MemoryVfs {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryVfs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(path, contents)` pairs.
    pub fn from_pairs<I, P, B>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (P, B)>,
        P: Into<String>,
        B: Into<Vec<u8>>,
    {
        let mut v = Self::new();
        for (p, b) in pairs {
            v.files.insert(p.into(), b.into());
        }
        v
    }

    pub fn insert(&mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), bytes.into());
    }
}

impl Vfs for MemoryVfs {
    fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.files.get(path).cloned()
    }
}

/// Host-filesystem VFS rooted at a directory.
#[derive(Debug, Clone)]
pub struct HostVfs {
    root: PathBuf,
}

impl HostVfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Vfs for HostVfs {
    fn read(&self, path: &str) -> Option<Vec<u8>> {
        let p = Path::new(path);
        let full = if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        };
        fs::read(full).ok()
    }

    fn resolve(&self, from: &str, path: &str) -> String {
        // Try sibling-of-including-file first, then fall back to the raw
        // path (resolved against the root by `read`).
        if let Some(dir) = Path::new(from).parent() {
            let sibling = dir.join(path);
            let full = if sibling.is_absolute() {
                sibling.clone()
            } else {
                self.root.join(&sibling)
            };
            if full.exists() {
                return sibling.to_string_lossy().into_owned();
            }
        }
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_vfs_roundtrip() {
        let vfs = MemoryVfs::from_pairs([("main.asm", b"NOP".to_vec())]);
        assert_eq!(vfs.read("main.asm").unwrap(), b"NOP");
        assert!(vfs.read("missing.asm").is_none());
    }

    #[test]
    fn read_text_is_lossy() {
        let mut vfs = MemoryVfs::new();
        vfs.insert("x", vec![0x44, 0x42, 0xFF]);
        let t = vfs.read_text("x").unwrap();
        assert!(t.starts_with("DB"));
    }
}
