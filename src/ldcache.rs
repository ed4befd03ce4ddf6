//! `ld.so.cache` parser (C2).
//!
//! Grounded on `original_source/src/ldcache.c`: memory-maps the cache,
//! skips the legacy libc5 header block if present, validates the
//! `glibc-ld.so.cache1.1` header, then walks the packed `entry_libc6`
//! array matching library basenames by prefix.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{IoContext, NvcError, Result};
use crate::fs::path::path_resolve_full;

const MAGIC_LIBC5: &[u8] = b"ld.so-1.7.0";
const MAGIC_LIBC6: &[u8] = b"glibc-ld.so.cache";
const MAGIC_VERSION: &[u8] = b"1.1";

const ENTRY_LIBC5_SIZE: usize = 12; // i32 flags, u32 key, u32 value

bitflags::bitflags! {
    /// Low byte of `entry_libc6.flags`: the object file type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LdType: u32 {
        const ELF = 0x0001;
        const ELF_LIBC5 = 0x0002;
        const ELF_LIBC6 = 0x0003;
    }
}

/// High byte of `entry_libc6.flags`: target ABI, used to select entries
/// matching the host's architecture (`LD_X8664_LIB64` etc. in `ldcache.h`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LdArch(pub u32);

impl LdArch {
    pub const I386_LIB32: LdArch = LdArch(0x0000);
    pub const X8664_LIB64: LdArch = LdArch(0x0300);
    pub const AARCH64_LIB64: LdArch = LdArch(0x0a00);
    pub const X8664_LIBX32: LdArch = LdArch(0x0800);

    const MASK: u32 = 0xff00;
}

struct Libc6Header<'a> {
    data: &'a [u8],
    nlibs: u32,
    entries_offset: usize,
}

const LIBC6_HEADER_FIXED: usize = 18 /* magic */ + 3 /* version */ + 4 + 4 + 5 * 4;
const LIBC6_ENTRY_SIZE: usize = 4 + 4 + 4 + 4 + 8; // flags,key,value,osversion,hwcap

/// A memory-mapped, validated `ld.so.cache` ready for lookups.
pub struct LdCache {
    _map: Mmap,
    base: *const u8,
    size: usize,
    header_offset: usize,
}

// SAFETY: the mmap is held for the lifetime of LdCache and never remapped.
unsafe impl Send for LdCache {}
unsafe impl Sync for LdCache {}

impl LdCache {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).io_context(format!("file mapping failed: {}", path.display()))?;
        let map = unsafe { Mmap::map(&file) }.io_context(format!("file mapping failed: {}", path.display()))?;
        let size = map.len();
        let base = map.as_ptr();

        let bytes = &map[..];
        let mut offset = 0usize;
        if bytes.len() > MAGIC_LIBC5.len() && &bytes[..MAGIC_LIBC5.len()] == MAGIC_LIBC5 {
            let nlibs = u32::from_ne_bytes(bytes[11..15].try_into().unwrap_or_default());
            offset = 11 + 4 + nlibs as usize * ENTRY_LIBC5_SIZE;
            let align = std::mem::align_of::<u32>().max(8);
            offset = (offset + align - 1) & !(align - 1);
        }

        if bytes.len() <= offset + LIBC6_HEADER_FIXED {
            return Err(NvcError::parse("unsupported file format", path.display()));
        }
        let magic = &bytes[offset..offset + MAGIC_LIBC6.len()];
        let version_off = offset + 18;
        let version = &bytes[version_off..version_off + MAGIC_VERSION.len()];
        if magic != MAGIC_LIBC6 || version != MAGIC_VERSION {
            return Err(NvcError::parse("unsupported file format", path.display()));
        }

        Ok(LdCache {
            _map: map,
            base,
            size,
            header_offset: offset,
        })
    }

    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base, self.size) }
    }

    fn nlibs(&self) -> u32 {
        let b = self.bytes();
        let off = self.header_offset + 18 + 3;
        u32::from_ne_bytes(b[off..off + 4].try_into().unwrap())
    }

    fn entries_start(&self) -> usize {
        self.header_offset + LIBC6_HEADER_FIXED
    }

    fn cstr_at(&self, offset: usize) -> Option<&str> {
        let b = self.bytes();
        if offset >= b.len() {
            return None;
        }
        let rest = &b[offset..];
        let end = rest.iter().position(|&c| c == 0)?;
        std::str::from_utf8(&rest[..end]).ok()
    }

    /// Resolves every basename in `want` against the entries matching
    /// `arch`, preferring (per `ldcache_resolve`'s `select` callback) the
    /// most-recently-seen entry for each basename.
    pub fn resolve(&self, root: &Path, arch: LdArch, want: &[&str]) -> Result<Vec<Option<PathBuf>>> {
        let mut out: Vec<Option<PathBuf>> = vec![None; want.len()];
        let start = self.entries_start();

        for i in 0..self.nlibs() as usize {
            let off = start + i * LIBC6_ENTRY_SIZE;
            let bytes = self.bytes();
            if off + LIBC6_ENTRY_SIZE > bytes.len() {
                break;
            }
            let flags = u32::from_ne_bytes(bytes[off..off + 4].try_into().unwrap());
            let key_off = u32::from_ne_bytes(bytes[off + 4..off + 8].try_into().unwrap()) as usize;
            let value_off = u32::from_ne_bytes(bytes[off + 8..off + 12].try_into().unwrap()) as usize;

            if flags & LdType::ELF.bits() == 0 || flags & LdArch::MASK != arch.0 {
                continue;
            }
            let (Some(key), Some(value)) = (self.cstr_at(key_off), self.cstr_at(value_off)) else {
                continue;
            };

            for (j, lib) in want.iter().enumerate() {
                if !key.starts_with(lib) {
                    continue;
                }
                let resolved = path_resolve_full(root, Path::new(value))?;
                out[j] = Some(resolved);
                break;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_minimal_cache(dir: &Path, entries: &[(&str, &str, u32)]) -> PathBuf {
        let mut strtab = Vec::new();
        let mut recs = Vec::new();
        for (key, value, arch) in entries {
            let key_off = strtab.len() as u32;
            strtab.extend_from_slice(key.as_bytes());
            strtab.push(0);
            let value_off = strtab.len() as u32;
            strtab.extend_from_slice(value.as_bytes());
            strtab.push(0);
            recs.push((LdType::ELF.bits() | arch, key_off, value_off));
        }

        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC_LIBC6);
        buf.extend_from_slice(MAGIC_VERSION);
        buf.extend_from_slice(&(recs.len() as u32).to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes()); // table_size
        buf.extend_from_slice(&[0u8; 20]); // unused[5]

        let header_len = buf.len();
        let entries_len = recs.len() * LIBC6_ENTRY_SIZE;
        let strtab_base = header_len + entries_len;

        for (flags, key_off, value_off) in &recs {
            buf.extend_from_slice(&flags.to_ne_bytes());
            buf.extend_from_slice(&(*key_off + strtab_base as u32).to_ne_bytes());
            buf.extend_from_slice(&(*value_off + strtab_base as u32).to_ne_bytes());
            buf.extend_from_slice(&0u32.to_ne_bytes()); // osversion
            buf.extend_from_slice(&0u64.to_ne_bytes()); // hwcap
        }
        buf.extend_from_slice(&strtab);

        let path = dir.join("ld.so.cache");
        std::fs::write(&path, buf).unwrap();
        path
    }

    #[test]
    fn resolves_matching_entry_by_arch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("usr/lib")).unwrap();
        std::fs::write(dir.path().join("usr/lib/libnvidia-ml.so.1"), b"").unwrap();

        let cache_path = write_minimal_cache(
            dir.path(),
            &[("libnvidia-ml.so.1", "/usr/lib/libnvidia-ml.so.1", LdArch::X8664_LIB64.0)],
        );

        let cache = LdCache::open(&cache_path).unwrap();
        let resolved = cache.resolve(dir.path(), LdArch::X8664_LIB64, &["libnvidia-ml.so"]).unwrap();
        assert_eq!(resolved[0], Some(dir.path().join("usr/lib/libnvidia-ml.so.1")));
    }

    #[test]
    fn skips_entries_for_other_arch() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = write_minimal_cache(
            dir.path(),
            &[("libnvidia-ml.so.1", "/usr/lib32/libnvidia-ml.so.1", LdArch::I386_LIB32.0)],
        );
        let cache = LdCache::open(&cache_path).unwrap();
        let resolved = cache.resolve(dir.path(), LdArch::X8664_LIB64, &["libnvidia-ml.so"]).unwrap();
        assert_eq!(resolved[0], None);
    }
}
