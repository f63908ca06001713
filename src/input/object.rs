//! Relocatable object files
//!
//! Parsing builds the in-memory model the rest of the pipeline works on:
//! one [InputSection] per interesting section (decompressed if needed),
//! comdat-group claims, the raw symbol table, and one [Symbol] handle
//! per entry. Locals are privately owned; globals come from the
//! process-wide interner so every file referencing a name shares one
//! record.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::compress::decompress_section;
use crate::context::Context;
use crate::elf::{
    self, Ehdr, Rel, Shdr, Sym, GRP_COMDAT, SHF_ALLOC, SHF_EXCLUDE, SHN_XINDEX, SHT_GROUP,
    SHT_NOBITS, SHT_NULL, SHT_REL, SHT_RELA, SHT_STRTAB, SHT_SYMTAB, SHT_SYMTAB_SHNDX,
    STT_SECTION,
};
use crate::error::{Error, Result};
use crate::input::ehframe::{CieRecord, FdeRecord};
use crate::input::section::InputSection;
use crate::input::{ComdatGroup, FileRef, SectionId};
use crate::merge::SectionFragment;
use crate::symbol::{Origin, Symbol};

#[derive(Debug)]
/// One relocatable object participating in the link
pub struct ObjectFile {
    /// Index of this file in the context's object list
    pub id: u32,
    /// Path, or member name for archive members
    pub name: String,
    /// Containing archive path, empty for loose objects
    pub archive_name: String,
    /// Whether the file came out of an archive (lazy semantics)
    pub is_in_lib: bool,
    /// Position in the file total order; lower wins resolution ties
    pub priority: u32,
    /// Index of the first global in the symbol table
    pub first_global: usize,
    /// The raw symbol table
    pub elf_syms: Vec<Sym>,
    /// The symbol-name string table
    pub symbol_strtab: Vec<u8>,
    /// One handle per raw symbol entry
    pub symbols: Vec<Arc<Symbol>>,
    /// Version suffix per global, parsed from `name@version`
    pub symvers: Vec<Option<String>>,
    /// Section slots; uninteresting sections stay `None`
    pub sections: Vec<Option<InputSection>>,
    /// Extended section indices, if the file carries SHT_SYMTAB_SHNDX
    pub shndx_table: Vec<u32>,
    /// Comdat claims: the interned group and the member section indices
    pub comdat_groups: Vec<(Arc<ComdatGroup>, Vec<u32>)>,
    /// Fragments this file's mergeable sections were split into
    pub fragments: Vec<Arc<SectionFragment>>,
    /// Parsed .eh_frame CIEs
    pub cies: Vec<CieRecord>,
    /// Parsed .eh_frame FDEs
    pub fdes: Vec<FdeRecord>,
    /// The file defines at least one COMMON symbol
    pub has_common: bool,
    /// Demote this file's globals to hidden (--exclude-libs)
    pub exclude_libs: bool,
    /// Dynamic relocations this file's sections will emit
    pub num_dynrel: AtomicU64,
    /// Byte offset of this file's region inside .rela.dyn
    pub reldyn_offset: u64,
    /// Locals this file contributes to .symtab
    pub num_local_symtab: u64,
    /// Globals this file contributes to .symtab
    pub num_global_symtab: u64,
    /// Bytes this file contributes to .strtab
    pub strtab_size: u64,
    /// Start of this file's local entries in .symtab
    pub local_symtab_offset: u64,
    /// Start of this file's global entries in .symtab
    pub global_symtab_offset: u64,
    /// Start of this file's strings in .strtab
    pub strtab_offset: u64,
    alive: AtomicBool,
}

impl ObjectFile {
    /// An empty file record; index 0 holds the internal file built by
    /// `create_internal_file`
    pub fn internal(id: u32) -> Self {
        Self {
            id,
            name: "<internal>".to_string(),
            archive_name: String::new(),
            is_in_lib: false,
            priority: 1,
            first_global: 1,
            elf_syms: Vec::new(),
            symbol_strtab: Vec::new(),
            symbols: Vec::new(),
            symvers: Vec::new(),
            sections: Vec::new(),
            shndx_table: Vec::new(),
            comdat_groups: Vec::new(),
            fragments: Vec::new(),
            cies: Vec::new(),
            fdes: Vec::new(),
            has_common: false,
            exclude_libs: false,
            num_dynrel: AtomicU64::new(0),
            reldyn_offset: 0,
            num_local_symtab: 0,
            num_global_symtab: 0,
            strtab_size: 0,
            local_symtab_offset: 0,
            global_symtab_offset: 0,
            strtab_offset: 0,
            alive: AtomicBool::new(true),
        }
    }

    /// Parse an object file. Archive members start dead and wait for the
    /// resolver's reachability walk.
    pub fn parse(
        ctx: &Context,
        id: u32,
        name: String,
        archive_name: String,
        is_in_lib: bool,
        data: &[u8],
    ) -> Result<Self> {
        let mut file = Self::internal(id);
        file.name = name;
        file.archive_name = archive_name;
        file.is_in_lib = is_in_lib;
        file.priority = 0;
        file.first_global = 0;
        file.alive = AtomicBool::new(!is_in_lib);

        let class = ctx.machine.class();
        let path = file.display_name();

        if data.len() < class.ehdr_size() {
            return Err(Error::FileTooSmall { path });
        }
        if data[..4] != elf::ELF_MAGIC {
            return Err(Error::NotAnElf { path });
        }
        if data[elf::EI_CLASS] != class.ident_byte() {
            return Err(Error::UnsupportedClass {
                path,
                value: data[elf::EI_CLASS],
            });
        }
        if data[elf::EI_DATA] != elf::ELFDATA2LSB {
            return Err(Error::UnsupportedEncoding {
                path,
                value: data[elf::EI_DATA],
            });
        }
        let ehdr = Ehdr::parse(class, data).ok_or_else(|| Error::FileTooSmall {
            path: file.display_name(),
        })?;
        if ehdr.e_machine != ctx.machine.e_machine() {
            return Err(Error::MachineMismatch {
                path,
                expected: ctx.machine.name(),
            });
        }

        let shdrs = parse_shdrs(&path, class, data, &ehdr)?;
        let shstrtab = section_bytes(&path, data, shdrs.get(shstrndx(&ehdr, &shdrs)))?;

        // Locate the symbol table before sections: comdat signatures
        // name symbols.
        if let Some(symtab) = shdrs.iter().find(|s| s.sh_type == SHT_SYMTAB) {
            file.first_global = symtab.sh_info as usize;
            let bytes = section_bytes_of(&path, data, symtab)?;
            let entsize = class.sym_size();
            file.elf_syms = (0..bytes.len() / entsize)
                .map(|i| Sym::parse(class, &bytes[i * entsize..]))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| Error::TruncatedSection {
                    path: file.display_name(),
                    section: ".symtab".to_string(),
                })?;
            file.symbol_strtab =
                section_bytes(&path, data, shdrs.get(symtab.sh_link as usize))?.to_vec();
        }

        file.initialize_sections(ctx, data, &shdrs, shstrtab)?;
        file.initialize_symbols(ctx)?;
        Ok(file)
    }

    fn initialize_sections(
        &mut self,
        ctx: &Context,
        data: &[u8],
        shdrs: &[Shdr],
        shstrtab: &[u8],
    ) -> Result<()> {
        let class = ctx.machine.class();
        let path = self.display_name();
        self.sections = Vec::new();
        self.sections.resize_with(shdrs.len(), || None);

        for (i, shdr) in shdrs.iter().enumerate() {
            if shdr.sh_flags & SHF_EXCLUDE != 0 && shdr.sh_flags & SHF_ALLOC == 0 {
                continue;
            }

            match shdr.sh_type {
                SHT_GROUP => {
                    let esym = self
                        .elf_syms
                        .get(shdr.sh_info as usize)
                        .ok_or_else(|| Error::InvalidSymbolIndex { path: path.clone() })?;
                    let signature = elf::string_at(&self.symbol_strtab, esym.st_name as usize)
                        .unwrap_or(b"")
                        .to_vec();

                    let bytes = section_bytes_of(&path, data, shdr)?;
                    let entries: Vec<u32> = bytes
                        .chunks_exact(4)
                        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect();
                    if entries.is_empty() {
                        return Err(Error::EmptyGroup { path });
                    }
                    if entries[0] == 0 {
                        continue;
                    }
                    if entries[0] != GRP_COMDAT {
                        return Err(Error::UnsupportedGroupFormat { path });
                    }

                    let (group, _) = ctx
                        .comdat_groups
                        .insert_with(&signature, ComdatGroup::default);
                    self.comdat_groups.push((group, entries[1..].to_vec()));
                }
                SHT_SYMTAB_SHNDX => {
                    let bytes = section_bytes_of(&path, data, shdr)?;
                    self.shndx_table = bytes
                        .chunks_exact(4)
                        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect();
                }
                SHT_SYMTAB | SHT_STRTAB | SHT_REL | SHT_RELA | SHT_NULL => {}
                _ => {
                    let name = std::str::from_utf8(
                        elf::string_at(shstrtab, shdr.sh_name as usize).unwrap_or(b""),
                    )
                    .unwrap_or("")
                    .to_string();

                    if name == ".note.GNU-stack"
                        || name == ".note.gnu.property"
                        || name.starts_with(".gnu.warning.")
                    {
                        continue;
                    }
                    if (ctx.options.strip_all || ctx.options.strip_debug)
                        && is_debug_section(shdr, &name)
                    {
                        continue;
                    }

                    let raw = section_bytes_of(&path, data, shdr)?;
                    let (contents, shdr2) =
                        match decompress_section(class, &path, &name, shdr, raw)? {
                            Some((contents, shdr2)) => (contents, shdr2),
                            None => (raw.to_vec().into_boxed_slice(), *shdr),
                        };

                    let mut shdr2 = shdr2;
                    shdr2.sh_addralign = shdr2.sh_addralign.max(1);
                    if !shdr2.sh_addralign.is_power_of_two() {
                        return Err(Error::TruncatedSection {
                            path,
                            section: name,
                        });
                    }

                    let mut isec =
                        InputSection::new(self.id, i as u32, name, shdr2, contents);
                    isec.is_rela = ctx.machine.is_rela();
                    isec.osec = ctx.osec_registry.get_or_create(
                        &isec.name,
                        isec.shdr.sh_type,
                        isec.shdr.sh_flags,
                    );
                    self.sections[i] = Some(isec);
                }
            }
        }

        // Attach relocation arrays to the sections they patch.
        for shdr in shdrs {
            let is_rela = shdr.sh_type == SHT_RELA;
            if shdr.sh_type != SHT_REL && shdr.sh_type != SHT_RELA {
                continue;
            }
            let Some(target) = self
                .sections
                .get_mut(shdr.sh_info as usize)
                .and_then(Option::as_mut)
            else {
                continue;
            };

            let bytes = section_bytes_of(&path, data, shdr)?;
            let entsize = class.rel_size(is_rela);
            target.rels = (0..bytes.len() / entsize)
                .map(|i| Rel::parse(class, is_rela, &bytes[i * entsize..]))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| Error::TruncatedSection {
                    path: path.clone(),
                    section: target.name.clone(),
                })?;
            target.is_rela = is_rela;
            if target.shdr.sh_flags & SHF_ALLOC != 0 {
                target.rel_actions = (0..target.rels.len())
                    .map(|_| std::sync::atomic::AtomicU8::new(0))
                    .collect();
            }
        }
        Ok(())
    }

    fn initialize_symbols(&mut self, ctx: &Context) -> Result<()> {
        if self.elf_syms.is_empty() {
            return Ok(());
        }
        let path = self.display_name();
        let this = FileRef::Obj(self.id);

        self.symbols = Vec::with_capacity(self.elf_syms.len());
        self.symbols.push(Arc::new(Symbol::new("")));

        // Locals are owned by the file and resolved immediately.
        for i in 1..self.first_global.min(self.elf_syms.len()) {
            let esym = self.elf_syms[i];
            let mut name = std::str::from_utf8(
                elf::string_at(&self.symbol_strtab, esym.st_name as usize).unwrap_or(b""),
            )
            .unwrap_or("")
            .to_string();

            if esym.is_common() {
                return Err(Error::CommonLocalSymbol { path });
            }

            let section = if esym.is_abs() {
                None
            } else {
                self.section_idx_of(&esym, i)
            };
            if name.is_empty() && esym.typ() == STT_SECTION {
                if let Some(idx) = section {
                    if let Some(isec) = self.sections.get(idx).and_then(Option::as_ref) {
                        name = isec.name.clone();
                    }
                }
            }

            let sym = Arc::new(Symbol::new(&name));
            {
                let mut repr = crate::lock(&sym.repr);
                repr.file = Some(this);
                repr.sym_idx = i as u32;
                repr.value = esym.st_value;
                repr.origin = match section {
                    Some(idx) => Origin::Section(SectionId {
                        file: self.id,
                        index: idx as u32,
                    }),
                    None => Origin::None,
                };
            }
            if self.should_write_to_local_symtab(ctx, &sym, &esym, section) {
                sym.write_to_symtab.store(true, Ordering::Relaxed);
                self.strtab_size += sym.name().len() as u64 + 1;
                self.num_local_symtab += 1;
            }
            self.symbols.push(sym);
        }

        // Globals are interned; version suffixes split off here.
        let num_globals = self.elf_syms.len().saturating_sub(self.first_global);
        self.symvers = vec![None; num_globals];

        for i in self.first_global..self.elf_syms.len() {
            let esym = self.elf_syms[i];
            let full = std::str::from_utf8(
                elf::string_at(&self.symbol_strtab, esym.st_name as usize).unwrap_or(b""),
            )
            .unwrap_or("");

            let mut key = full;
            if let Some(pos) = full.find('@') {
                let ver = &full[pos + 1..];
                // "name@@ver" is the default version: the plain name is
                // the canonical key. "name@ver" stays a distinct alias.
                if ver.starts_with('@') {
                    key = &full[..pos];
                    if esym.is_defined() {
                        self.symvers[i - self.first_global] = Some(ver[1..].to_string());
                    }
                } else if esym.is_defined() {
                    self.symvers[i - self.first_global] = Some(ver.to_string());
                }
            }

            if esym.is_common() {
                self.has_common = true;
            }
            self.symbols.push(ctx.intern(key));
        }
        Ok(())
    }

    fn should_write_to_local_symtab(
        &self,
        ctx: &Context,
        sym: &Symbol,
        esym: &Sym,
        section: Option<usize>,
    ) -> bool {
        if ctx.options.discard_all || ctx.options.strip_all {
            return false;
        }
        if esym.typ() == STT_SECTION {
            return false;
        }

        // Assembler-local labels are dropped under --discard-locals, and
        // always when they point into a mergeable section.
        if sym.name().starts_with(".L") {
            if ctx.options.discard_locals {
                return false;
            }
            if let Some(isec) = section
                .and_then(|idx| self.sections.get(idx))
                .and_then(Option::as_ref)
            {
                if isec.shdr.sh_flags & elf::SHF_MERGE != 0 {
                    return false;
                }
            }
        }
        true
    }

    /// Resolve a symbol's defining section index, honoring the extended
    /// index table
    pub fn section_idx_of(&self, esym: &Sym, sym_idx: usize) -> Option<usize> {
        if esym.is_abs() || esym.is_common() || esym.is_undef() {
            return None;
        }
        if esym.st_shndx == SHN_XINDEX {
            return self.shndx_table.get(sym_idx).map(|&v| v as usize);
        }
        Some(esym.st_shndx as usize)
    }

    /// Name shown in diagnostics: `archive(member)` or the plain path
    pub fn display_name(&self) -> String {
        if self.archive_name.is_empty() {
            self.name.clone()
        } else {
            format!("{}({})", self.archive_name, self.name)
        }
    }

    /// Whether the file participates in the link
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Mark the file live; returns whether this call changed it
    pub fn set_alive(&self) -> bool {
        !self.alive.swap(true, Ordering::Relaxed)
    }

    /// Remove the file from the link
    pub fn kill(&self) {
        self.alive.store(false, Ordering::Relaxed);
    }

    /// Indices of the file's global symbol entries
    pub fn globals(&self) -> std::ops::Range<usize> {
        self.first_global.min(self.symbols.len())..self.symbols.len()
    }
}

fn is_debug_section(shdr: &Shdr, name: &str) -> bool {
    shdr.sh_flags & SHF_ALLOC == 0 && (name.starts_with(".debug") || name.starts_with(".zdebug"))
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

    // A section count of zero means the real count is in the first
    // header's sh_size.
    let count = if ehdr.e_shnum == 0 {
        first.sh_size as usize
    } else {
        ehdr.e_shnum as usize
    };

    let table_end = off + count * class.shdr_size();
    if table_end > data.len() {
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

// e_shstrndx is 16 bits; SHN_XINDEX redirects to the first header's
// sh_link.
fn shstrndx(ehdr: &Ehdr, shdrs: &[Shdr]) -> usize {
    if ehdr.e_shstrndx == SHN_XINDEX {
        shdrs.first().map(|s| s.sh_link as usize).unwrap_or(0)
    } else {
        ehdr.e_shstrndx as usize
    }
}

fn section_bytes<'a>(path: &str, data: &'a [u8], shdr: Option<&Shdr>) -> Result<&'a [u8]> {
    match shdr {
        Some(shdr) => section_bytes_of(path, data, shdr),
        None => Ok(&[]),
    }
}

fn section_bytes_of<'a>(path: &str, data: &'a [u8], shdr: &Shdr) -> Result<&'a [u8]> {
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
