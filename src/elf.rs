//! ELF binary inspection (C3).
//!
//! Grounded on `original_source/src/elftool.c`'s `elftool_has_dependency`
//! and `elftool_has_abi`, reimplemented on top of `goblin` instead of
//! hand-rolled `libelf` section walking.

use std::path::Path;

use goblin::elf::Elf;

use crate::error::{NvcError, Result};

/// The GNU ABI tag recorded in `.note.ABI-tag`: `(os, major, minor, patch)`.
/// `os == 0` means Linux, per `ELF_NOTE_OS_LINUX`.
pub type AbiTag = [u32; 3];

pub struct ElfTool<'a> {
    path: &'a Path,
    elf: Elf<'a>,
    bytes: &'a [u8],
}

impl<'a> ElfTool<'a> {
    pub fn parse(path: &'a Path, bytes: &'a [u8]) -> Result<Self> {
        let elf = Elf::parse(bytes).map_err(|e| NvcError::parse(format!("elf file read error: {}", path.display()), e))?;
        Ok(ElfTool { path, elf, bytes })
    }

    /// True if the binary has a `DT_NEEDED` entry whose name starts
    /// with `lib` (a prefix match, since sonames carry a version suffix).
    pub fn has_dependency(&self, lib: &str) -> bool {
        self.elf
            .libraries
            .iter()
            .any(|dep| dep.starts_with(lib))
    }

    /// Checks the `.note.ABI-tag` note against `expect`, matching
    /// `elftool_has_abi`'s `desc[1..4]` comparison (OS must be Linux).
    pub fn has_abi(&self, expect: AbiTag) -> bool {
        for note_section in self.elf.iter_note_headers(self.bytes).into_iter().flatten() {
            let Ok(note) = note_section else { continue };
            if note.name != "GNU" || note.n_type != 1 {
                continue;
            }
            if note.desc.len() < 16 {
                continue;
            }
            let words: Vec<u32> = note
                .desc
                .chunks_exact(4)
                .take(4)
                .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            if words.len() == 4 && words[0] == 0 && [words[1], words[2], words[3]] == expect {
                return true;
            }
        }
        false
    }

    pub fn path(&self) -> &Path {
        self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_elf_bytes() {
        let path = Path::new("/tmp/not-an-elf");
        let bytes = b"not an elf file";
        assert!(ElfTool::parse(path, bytes).is_err());
    }
}
