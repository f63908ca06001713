//! Shared object files
//!
//! A DSO contributes definitions with weak-like precedence (any archive
//! or object definition beats it) and a list of undefined symbols that
//! decide which of the link's own globals must be exported. Versioned
//! definitions intern under `name@version`, and additionally under the
//! plain name when the version is the default one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::context::Context;
use crate::elf::{
    self, Dyn, Ehdr, Phdr, Shdr, Sym, DT_SONAME, PF_W, PT_LOAD, SHT_DYNAMIC, SHT_DYNSYM,
    SHT_GNU_VERDEF, SHT_GNU_VERSYM, SHT_NOBITS, VERSYM_HIDDEN, VER_NDX_GLOBAL,
    VER_NDX_LAST_RESERVED, VER_NDX_LOCAL,
};
use crate::error::{Error, Result};
use crate::input::FileRef;
use crate::symbol::Symbol;

#[derive(Debug)]
/// One shared object participating in the link
pub struct SharedFile {
    /// Index of this file in the context's DSO list
    pub id: u32,
    /// Path given on the command line
    pub name: String,
    /// DT_SONAME, or the file name when the DSO has none
    pub soname: String,
    /// Position in the file total order
    pub priority: u32,
    /// Defined dynamic symbols (parallel to `versyms` and `symbols`)
    pub elf_syms: Vec<Sym>,
    /// Version index per defined symbol
    pub versyms: Vec<u16>,
    /// Interned handle per defined symbol
    pub symbols: Vec<Arc<Symbol>>,
    /// Symbols this DSO needs from the rest of the link
    pub undefs: Vec<Arc<Symbol>>,
    /// Version names indexed by version index
    pub version_strings: Vec<String>,
    /// Program headers, used to tell read-only data from writable
    pub phdrs: Vec<Phdr>,
    alive: AtomicBool,
}

impl SharedFile {
    /// Parse the dynamic symbol table and version tables of a DSO
    pub fn parse(ctx: &Context, id: u32, name: String, data: &[u8]) -> Result<Self> {
        let class = ctx.machine.class();
        let path = name.clone();

        if data.len() < class.ehdr_size() {
            return Err(Error::FileTooSmall { path });
        }
        if data[elf::EI_CLASS] != class.ident_byte() {
            return Err(Error::UnsupportedClass {
                path,
                value: data[elf::EI_CLASS],
            });
        }
        let ehdr = Ehdr::parse(class, data).ok_or_else(|| Error::FileTooSmall {
            path: name.clone(),
        })?;
        if ehdr.e_machine != ctx.machine.e_machine() {
            return Err(Error::MachineMismatch {
                path,
                expected: ctx.machine.name(),
            });
        }

        let shdrs = parse_shdrs(&path, class, data, &ehdr)?;

        let mut file = Self {
            id,
            name: name.clone(),
            soname: String::new(),
            priority: 0,
            elf_syms: Vec::new(),
            versyms: Vec::new(),
            symbols: Vec::new(),
            undefs: Vec::new(),
            version_strings: Vec::new(),
            phdrs: parse_phdrs(class, data, &ehdr),
            alive: AtomicBool::new(true),
        };

        let Some(dynsym) = shdrs.iter().find(|s| s.sh_type == SHT_DYNSYM) else {
            file.soname = basename(&name);
            return Ok(file);
        };

        let strtab = section_bytes(&path, data, shdrs.get(dynsym.sh_link as usize))?;
        file.soname = read_soname(&path, class, data, &shdrs, strtab)?.unwrap_or_else(|| basename(&name));
        file.version_strings = read_verdef(&path, data, &shdrs)?;

        let entsize = class.sym_size();
        let bytes = section_bytes(&path, data, Some(dynsym))?;
        let esyms: Vec<Sym> = (0..bytes.len() / entsize)
            .map(|i| Sym::parse(class, &bytes[i * entsize..]))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| Error::TruncatedSection {
                path: path.clone(),
                section: ".dynsym".to_string(),
            })?;

        let vers: Vec<u16> = match shdrs.iter().find(|s| s.sh_type == SHT_GNU_VERSYM) {
            Some(shdr) => section_bytes(&path, data, Some(shdr))?
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect(),
            None => Vec::new(),
        };

        let first_global = dynsym.sh_info as usize;
        for (i, esym) in esyms.iter().enumerate().skip(first_global) {
            let sym_name = std::str::from_utf8(
                elf::string_at(strtab, esym.st_name as usize).unwrap_or(b""),
            )
            .unwrap_or("");

            if !esym.is_defined() {
                file.undefs.push(ctx.intern(sym_name));
                continue;
            }

            if vers.is_empty() {
                file.elf_syms.push(*esym);
                file.versyms.push(VER_NDX_GLOBAL);
                file.symbols.push(ctx.intern(sym_name));
            } else {
                let raw = vers.get(i).copied().unwrap_or(VER_NDX_GLOBAL);
                let ver = raw & !VERSYM_HIDDEN;
                if ver == VER_NDX_LOCAL {
                    continue;
                }

                if ver > VER_NDX_LAST_RESERVED {
                    let verstr = file
                        .version_strings
                        .get(ver as usize)
                        .cloned()
                        .unwrap_or_default();
                    let mangled = format!("{sym_name}@{verstr}");
                    file.elf_syms.push(*esym);
                    file.versyms.push(ver);
                    file.symbols.push(ctx.intern(&mangled));
                }

                if raw & VERSYM_HIDDEN == 0 {
                    file.elf_syms.push(*esym);
                    file.versyms.push(ver);
                    file.symbols.push(ctx.intern(sym_name));
                }
            }
        }

        Ok(file)
    }

    /// Whether the file survives as a DT_NEEDED dependency
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Keep the DSO as a dependency
    pub fn set_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    /// Drop the DSO; no reference to it survived resolution
    pub fn kill(&self) {
        self.alive.store(false, Ordering::Relaxed);
    }

    /// Whether the address backing `sym` sits in a read-only segment;
    /// decides which copy-relocation section a reservation lands in
    pub fn is_readonly(&self, value: u64) -> bool {
        self.phdrs.iter().any(|phdr| {
            phdr.p_type == PT_LOAD
                && phdr.p_flags & PF_W == 0
                && phdr.p_vaddr <= value
                && value < phdr.p_vaddr + phdr.p_memsz
        })
    }

    /// Other symbols of this DSO sharing `sym`'s address. A copy
    /// relocation moves every alias with it.
    pub fn find_aliases(&self, sym: &Arc<Symbol>) -> Vec<Arc<Symbol>> {
        let this = FileRef::Dso(self.id);
        let value = {
            let repr = crate::lock(&sym.repr);
            if repr.file != Some(this) {
                return Vec::new();
            }
            match self.elf_syms.get(repr.sym_idx as usize) {
                Some(esym) => esym.st_value,
                None => return Vec::new(),
            }
        };

        self.symbols
            .iter()
            .enumerate()
            .filter(|(i, other)| {
                !Arc::ptr_eq(other, sym)
                    && self.elf_syms[*i].st_value == value
                    && crate::lock(&other.repr).file == Some(this)
            })
            .map(|(_, other)| Arc::clone(other))
            .collect()
    }
}

fn basename(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

fn read_soname(
    path: &str,
    class: elf::Class,
    data: &[u8],
    shdrs: &[Shdr],
    strtab: &[u8],
) -> Result<Option<String>> {
    let Some(dynamic) = shdrs.iter().find(|s| s.sh_type == SHT_DYNAMIC) else {
        return Ok(None);
    };
    let bytes = section_bytes(path, data, Some(dynamic))?;
    let entsize = class.dyn_size();
    for chunk in bytes.chunks_exact(entsize) {
        if let Some(dyn_entry) = Dyn::parse(class, chunk) {
            if dyn_entry.d_tag == DT_SONAME {
                let name = elf::string_at(strtab, dyn_entry.d_val as usize).unwrap_or(b"");
                return Ok(Some(String::from_utf8_lossy(name).into_owned()));
            }
        }
    }
    Ok(None)
}

fn read_verdef(path: &str, data: &[u8], shdrs: &[Shdr]) -> Result<Vec<String>> {
    let mut ret = vec![String::new(); VER_NDX_LAST_RESERVED as usize + 1];

    let Some(verdef_sec) = shdrs.iter().find(|s| s.sh_type == SHT_GNU_VERDEF) else {
        return Ok(ret);
    };
    let verdef_bytes = section_bytes(path, data, Some(verdef_sec))?;
    let strtab = section_bytes(path, data, shdrs.get(verdef_sec.sh_link as usize))?;

    let mut pos = 0usize;
    loop {
        let Some(ver) = elf::Verdef::parse(verdef_bytes.get(pos..).unwrap_or(&[])) else {
            break;
        };
        let aux_pos = pos + ver.vd_aux as usize;
        if let Some(aux) = elf::Verdaux::parse(verdef_bytes.get(aux_pos..).unwrap_or(&[])) {
            let name = elf::string_at(strtab, aux.vda_name as usize).unwrap_or(b"");
            let idx = ver.vd_ndx as usize;
            if ret.len() <= idx {
                ret.resize(idx + 1, String::new());
            }
            ret[idx] = String::from_utf8_lossy(name).into_owned();
        }
        if ver.vd_next == 0 {
            break;
        }
        pos += ver.vd_next as usize;
    }
    Ok(ret)
}

fn parse_phdrs(class: elf::Class, data: &[u8], ehdr: &Ehdr) -> Vec<Phdr> {
    let off = ehdr.e_phoff as usize;
    (0..ehdr.e_phnum as usize)
        .filter_map(|i| Phdr::parse(class, data.get(off + i * class.phdr_size()..).unwrap_or(&[])))
        .collect()
}

fn parse_shdrs(path: &str, class: elf::Class, data: &[u8], ehdr: &Ehdr) -> Result<Vec<Shdr>> {
    if ehdr.e_shoff == 0 {
        return Ok(Vec::new());
    }
    let off = ehdr.e_shoff as usize;
    let first = Shdr::parse(class, data.get(off..).unwrap_or(&[])).ok_or_else(|| {
        Error::CorruptSectionTable {
            path: path.to_string(),
        }
    })?;
    let count = if ehdr.e_shnum == 0 {
        first.sh_size as usize
    } else {
        ehdr.e_shnum as usize
    };
    if off + count * class.shdr_size() > data.len() {
        return Err(Error::CorruptSectionTable {
            path: path.to_string(),
        });
    }
    (0..count)
        .map(|i| Shdr::parse(class, &data[off + i * class.shdr_size()..]))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| Error::CorruptSectionTable {
            path: path.to_string(),
        })
}

fn section_bytes<'a>(path: &str, data: &'a [u8], shdr: Option<&Shdr>) -> Result<&'a [u8]> {
    let Some(shdr) = shdr else { return Ok(&[]) };
    if shdr.sh_type == SHT_NOBITS {
        return Ok(&[]);
    }
    let start = shdr.sh_offset as usize;
    let end = start + shdr.sh_size as usize;
    data.get(start..end).ok_or_else(|| Error::TruncatedSection {
        path: path.to_string(),
        section: format!("#{}", shdr.sh_name),
    })
}
