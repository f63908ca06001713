//! Linker-synthesized sections
//!
//! These chunks have no input bytes; their contents are derived from the
//! resolved symbol graph. Sizing happens during layout, content during
//! the parallel write. The GOT keeps a single entry table that both the
//! sizer and the writer derive from, so the reserved `.rela.dyn` space
//! always matches what application emits.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::context::Context;
use crate::elf::{
    self, Rel, Shdr, Sym, SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHT_DYNAMIC, SHT_DYNSYM,
    SHT_GNU_HASH, SHT_GNU_VERDEF, SHT_GNU_VERNEED, SHT_GNU_VERSYM, SHT_HASH, SHT_NOBITS,
    SHT_NOTE, SHT_PROGBITS, SHT_RELA, SHT_STRTAB, SHT_SYMTAB, STT_GNU_IFUNC,
};
use crate::symbol::{Origin, Symbol};

fn alloc_shdr(sh_type: u32, sh_flags: u64, align: u64) -> Shdr {
    Shdr {
        sh_type,
        sh_flags,
        sh_addralign: align,
        ..Shdr::default()
    }
}

#[derive(Debug)]
/// The ELF header chunk
pub struct OutputEhdr {
    /// Pseudo-header carrying the chunk's place in the image
    pub hdr: Shdr,
}

impl OutputEhdr {
    /// Header-kind chunk covering the file header bytes
    pub fn new() -> Self {
        Self {
            hdr: alloc_shdr(SHT_PROGBITS, SHF_ALLOC, 8),
        }
    }
}

impl Default for OutputEhdr {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
/// The program header table chunk
pub struct OutputPhdr {
    /// Pseudo-header carrying the chunk's place in the image
    pub hdr: Shdr,
    /// Assembled program headers
    pub phdrs: Vec<elf::Phdr>,
}

impl OutputPhdr {
    /// Header-kind chunk covering the program header table
    pub fn new() -> Self {
        Self {
            hdr: alloc_shdr(SHT_PROGBITS, SHF_ALLOC, 8),
            phdrs: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
/// The section header table chunk
pub struct OutputShdr {
    /// Pseudo-header; sh_size is the table size
    pub hdr: Shdr,
}

impl OutputShdr {
    /// A table chunk aligned for direct record access
    pub fn new() -> Self {
        Self {
            hdr: Shdr {
                sh_addralign: 8,
                ..Shdr::default()
            },
        }
    }
}

#[derive(Debug)]
/// One computed GOT slot with its optional dynamic relocation
pub struct GotEntry {
    /// Slot index
    pub idx: u32,
    /// Link-time slot value
    pub val: u64,
    /// Dynamic relocation the loader applies to the slot
    pub rel: Option<Rel>,
}

#[derive(Debug)]
/// .got: loader-resolved addresses, TLS module/offset pairs and
/// descriptors
pub struct GotSection {
    /// Output header
    pub hdr: Shdr,
    /// Output section header index
    pub shndx: u32,
    /// Symbols with plain GOT slots, in slot order
    pub got_syms: Vec<(u32, Arc<Symbol>)>,
    /// Symbols with thread-pointer slots
    pub gottp_syms: Vec<(u32, Arc<Symbol>)>,
    /// Symbols with general-dynamic pairs
    pub tlsgd_syms: Vec<(u32, Arc<Symbol>)>,
    /// Symbols with TLS descriptor pairs
    pub tlsdesc_syms: Vec<(u32, Arc<Symbol>)>,
    tlsld: Option<u32>,
    num_slots: u32,
}

impl GotSection {
    /// An empty GOT
    pub fn new(word: u64) -> Self {
        Self {
            hdr: alloc_shdr(SHT_PROGBITS, SHF_ALLOC | SHF_WRITE, word),
            shndx: 0,
            got_syms: Vec::new(),
            gottp_syms: Vec::new(),
            tlsgd_syms: Vec::new(),
            tlsdesc_syms: Vec::new(),
            tlsld: None,
            num_slots: 0,
        }
    }

    /// Reserve a plain slot
    pub fn add_got(&mut self, sym: Arc<Symbol>) -> u32 {
        let idx = self.num_slots;
        self.num_slots += 1;
        self.got_syms.push((idx, sym));
        idx
    }

    /// Reserve a thread-pointer-relative slot
    pub fn add_gottp(&mut self, sym: Arc<Symbol>) -> u32 {
        let idx = self.num_slots;
        self.num_slots += 1;
        self.gottp_syms.push((idx, sym));
        idx
    }

    /// Reserve a module-id/offset pair
    pub fn add_tlsgd(&mut self, sym: Arc<Symbol>) -> u32 {
        let idx = self.num_slots;
        self.num_slots += 2;
        self.tlsgd_syms.push((idx, sym));
        idx
    }

    /// Reserve a TLS descriptor pair
    pub fn add_tlsdesc(&mut self, sym: Arc<Symbol>) -> u32 {
        let idx = self.num_slots;
        self.num_slots += 2;
        self.tlsdesc_syms.push((idx, sym));
        idx
    }

    /// Reserve the link-wide local-dynamic pair, at most once
    pub fn add_tlsld(&mut self) {
        if self.tlsld.is_none() {
            self.tlsld = Some(self.num_slots);
            self.num_slots += 2;
        }
    }

    /// Slot index of the local-dynamic pair
    pub fn tlsld_idx(&self) -> Option<u32> {
        self.tlsld
    }

    /// Address of the local-dynamic pair
    pub fn tlsld_addr(&self, ctx: &Context) -> u64 {
        self.hdr.sh_addr + u64::from(self.tlsld.unwrap_or(0)) * ctx.machine.word_size() as u64
    }

    /// Number of reserved slots
    pub fn num_slots(&self) -> u32 {
        self.num_slots
    }

    /// Compute every slot's value and dynamic relocation. This is the
    /// single source both the .rela.dyn sizer and the writer read.
    pub fn entries(&self, ctx: &Context) -> Vec<GotEntry> {
        let word = ctx.machine.word_size() as u64;
        let base = self.hdr.sh_addr;
        let machine = ctx.machine;
        let mut out = Vec::new();

        for (idx, sym) in &self.got_syms {
            let slot_addr = base + u64::from(*idx) * word;
            if sym.get_type(ctx) == STT_GNU_IFUNC && !sym.is_imported() {
                out.push(GotEntry {
                    idx: *idx,
                    val: 0,
                    rel: Some(Rel {
                        r_offset: slot_addr,
                        r_type: machine.r_irelative(),
                        r_sym: 0,
                        r_addend: sym.origin_addr(ctx) as i64,
                    }),
                });
            } else if sym.is_imported() {
                out.push(GotEntry {
                    idx: *idx,
                    val: 0,
                    rel: Some(Rel {
                        r_offset: slot_addr,
                        r_type: machine.r_glob_dat(),
                        r_sym: sym.get_dynsym_idx(ctx),
                        r_addend: 0,
                    }),
                });
            } else if ctx.is_pic() {
                let val = sym.get_addr(ctx);
                out.push(GotEntry {
                    idx: *idx,
                    val,
                    rel: Some(Rel {
                        r_offset: slot_addr,
                        r_type: machine.r_relative(),
                        r_sym: 0,
                        r_addend: val as i64,
                    }),
                });
            } else {
                out.push(GotEntry {
                    idx: *idx,
                    val: sym.get_addr(ctx),
                    rel: None,
                });
            }
        }

        for (idx, sym) in &self.gottp_syms {
            let slot_addr = base + u64::from(*idx) * word;
            if sym.is_imported() {
                out.push(GotEntry {
                    idx: *idx,
                    val: 0,
                    rel: Some(Rel {
                        r_offset: slot_addr,
                        r_type: machine.r_tpoff(),
                        r_sym: sym.get_dynsym_idx(ctx),
                        r_addend: 0,
                    }),
                });
            } else {
                out.push(GotEntry {
                    idx: *idx,
                    val: machine.tp_relative(ctx, sym.get_addr(ctx)) as u64,
                    rel: None,
                });
            }
        }

        for (idx, sym) in &self.tlsgd_syms {
            let mod_addr = base + u64::from(*idx) * word;
            let off_addr = mod_addr + word;
            let dtpoff = sym.get_addr(ctx) as i64 - ctx.tls_begin as i64;

            if sym.is_imported() || ctx.is_shared() {
                out.push(GotEntry {
                    idx: *idx,
                    val: 0,
                    rel: Some(Rel {
                        r_offset: mod_addr,
                        r_type: machine.r_dtpmod(),
                        r_sym: sym.get_dynsym_idx(ctx),
                        r_addend: 0,
                    }),
                });
                if sym.is_imported() {
                    out.push(GotEntry {
                        idx: *idx + 1,
                        val: 0,
                        rel: Some(Rel {
                            r_offset: off_addr,
                            r_type: machine.r_dtpoff(),
                            r_sym: sym.get_dynsym_idx(ctx),
                            r_addend: 0,
                        }),
                    });
                } else {
                    out.push(GotEntry {
                        idx: *idx + 1,
                        val: dtpoff as u64,
                        rel: None,
                    });
                }
            } else {
                // The executable is always module 1.
                out.push(GotEntry {
                    idx: *idx,
                    val: 1,
                    rel: None,
                });
                out.push(GotEntry {
                    idx: *idx + 1,
                    val: dtpoff as u64,
                    rel: None,
                });
            }
        }

        for (idx, sym) in &self.tlsdesc_syms {
            let slot_addr = base + u64::from(*idx) * word;
            let addend = if sym.is_imported() {
                0
            } else {
                sym.get_addr(ctx) as i64 - ctx.tls_begin as i64
            };
            out.push(GotEntry {
                idx: *idx,
                val: 0,
                rel: Some(Rel {
                    r_offset: slot_addr,
                    r_type: machine.r_tlsdesc(),
                    r_sym: if sym.is_imported() {
                        sym.get_dynsym_idx(ctx)
                    } else {
                        0
                    },
                    r_addend: addend,
                }),
            });
        }

        if let Some(idx) = self.tlsld {
            let mod_addr = base + u64::from(idx) * word;
            if ctx.is_shared() {
                out.push(GotEntry {
                    idx,
                    val: 0,
                    rel: Some(Rel {
                        r_offset: mod_addr,
                        r_type: machine.r_dtpmod(),
                        r_sym: 0,
                        r_addend: 0,
                    }),
                });
            } else {
                out.push(GotEntry {
                    idx,
                    val: 1,
                    rel: None,
                });
            }
        }

        out
    }

    /// Dynamic relocations the GOT will emit, grouped as
    /// (relative, irelative, symbolic)
    pub fn count_dynrels(&self, ctx: &Context) -> (u64, u64, u64) {
        let mut relative = 0;
        let mut irelative = 0;
        let mut symbolic = 0;
        for entry in self.entries(ctx) {
            match entry.rel {
                Some(rel) if rel.r_type == ctx.machine.r_relative() => relative += 1,
                Some(rel) if rel.r_type == ctx.machine.r_irelative() => irelative += 1,
                Some(_) => symbolic += 1,
                None => {}
            }
        }
        (relative, irelative, symbolic)
    }

    /// Write the slots and their dynamic relocations
    pub fn copy_buf(&self, ctx: &Context, buf: &mut [u8], dynrel: &mut crate::scan::DynrelWriter) {
        let word = ctx.machine.word_size();
        for entry in self.entries(ctx) {
            let off = entry.idx as usize * word;
            elf::put_word(ctx.machine.class(), buf, off, entry.val);
            if let Some(rel) = entry.rel {
                dynrel.push(rel);
            }
        }
    }
}

#[derive(Debug, Default)]
/// .got.plt: three reserved slots plus one lazy slot per PLT entry
pub struct GotPltSection {
    /// Output header
    pub hdr: Shdr,
    /// Output section header index
    pub shndx: u32,
}

impl GotPltSection {
    /// An empty .got.plt
    pub fn new(word: u64) -> Self {
        Self {
            hdr: alloc_shdr(SHT_PROGBITS, SHF_ALLOC | SHF_WRITE, word),
            shndx: 0,
        }
    }

    /// Write the reserved slots and the lazy resolver back-pointers
    pub fn copy_buf(&self, ctx: &Context, buf: &mut [u8]) {
        let class = ctx.machine.class();
        let word = ctx.machine.word_size();

        // Slot 0 holds the address of .dynamic; the next two belong to
        // the runtime loader.
        elf::put_word(class, buf, 0, ctx.dynamic.hdr.sh_addr);
        elf::put_word(class, buf, word, 0);
        elf::put_word(class, buf, 2 * word, 0);

        for (idx, _sym) in ctx.plt.symbols.iter().enumerate() {
            let off = (3 + idx) * word;
            elf::put_word(
                class,
                buf,
                off,
                crate::arch::gotplt_slot_value(ctx, idx as u32),
            );
        }
    }
}

#[derive(Debug, Default)]
/// .plt: lazy-binding stubs
pub struct PltSection {
    /// Output header
    pub hdr: Shdr,
    /// Output section header index
    pub shndx: u32,
    /// Symbols with PLT entries, in entry order
    pub symbols: Vec<Arc<Symbol>>,
}

impl PltSection {
    /// An empty .plt
    pub fn new() -> Self {
        Self {
            hdr: alloc_shdr(SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR, 16),
            shndx: 0,
            symbols: Vec::new(),
        }
    }

    /// Append a stub, returning its index
    pub fn add(&mut self, sym: Arc<Symbol>) -> u32 {
        let idx = self.symbols.len() as u32;
        self.symbols.push(sym);
        idx
    }
}

#[derive(Debug, Default)]
/// .plt.got: eager stubs for symbols that already own GOT slots
pub struct PltGotSection {
    /// Output header
    pub hdr: Shdr,
    /// Output section header index
    pub shndx: u32,
    /// Symbols with eager stubs, in entry order
    pub symbols: Vec<Arc<Symbol>>,
}

impl PltGotSection {
    /// An empty .plt.got
    pub fn new() -> Self {
        Self {
            hdr: alloc_shdr(SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR, 16),
            shndx: 0,
            symbols: Vec::new(),
        }
    }

    /// Append a stub, returning its index
    pub fn add(&mut self, sym: Arc<Symbol>) -> u32 {
        let idx = self.symbols.len() as u32;
        self.symbols.push(sym);
        idx
    }
}

#[derive(Debug, Default)]
/// .rela.dyn: loader fixups for sections, GOT slots and copy
/// reservations
pub struct RelDynSection {
    /// Output header
    pub hdr: Shdr,
    /// Output section header index
    pub shndx: u32,
    /// Leading R_*_RELATIVE entries, for DT_RELACOUNT
    pub relcount: u64,
    /// R_*_IRELATIVE entries following them
    pub irelcount: u64,
}

impl RelDynSection {
    /// An empty .rela.dyn
    pub fn new(word: u64) -> Self {
        Self {
            hdr: alloc_shdr(SHT_RELA, SHF_ALLOC, word),
            shndx: 0,
            relcount: 0,
            irelcount: 0,
        }
    }
}

#[derive(Debug, Default)]
/// .rela.plt: one JUMP_SLOT per PLT entry
pub struct RelPltSection {
    /// Output header
    pub hdr: Shdr,
    /// Output section header index
    pub shndx: u32,
}

impl RelPltSection {
    /// An empty .rela.plt
    pub fn new(word: u64) -> Self {
        Self {
            hdr: alloc_shdr(SHT_RELA, SHF_ALLOC, word),
            shndx: 0,
        }
    }

    /// Write the JUMP_SLOT relocations
    pub fn copy_buf(&self, ctx: &Context, buf: &mut [u8]) {
        let class = ctx.machine.class();
        let is_rela = ctx.machine.is_rela();
        let entsize = class.rel_size(is_rela);
        let word = ctx.machine.word_size() as u64;

        for (idx, sym) in ctx.plt.symbols.iter().enumerate() {
            let rel = Rel {
                r_offset: ctx.gotplt.hdr.sh_addr + (3 + idx as u64) * word,
                r_type: ctx.machine.r_jump_slot(),
                r_sym: sym.get_dynsym_idx(ctx),
                r_addend: 0,
            };
            rel.write_to(class, is_rela, &mut buf[idx * entsize..]);
        }
    }
}

#[derive(Debug, Default)]
/// A string table with content-addressed deduplication (.dynstr,
/// .shstrtab)
pub struct StringTableSection {
    /// Output header
    pub hdr: Shdr,
    /// Output section header index
    pub shndx: u32,
    /// Raw bytes, starting with the mandatory NUL
    pub content: Vec<u8>,
    map: FxHashMap<String, u32>,
}

impl StringTableSection {
    /// A table holding only the leading NUL
    pub fn new() -> Self {
        Self {
            hdr: alloc_shdr(SHT_STRTAB, 0, 1),
            shndx: 0,
            content: vec![0],
            map: FxHashMap::default(),
        }
    }

    /// Intern a string, returning its offset
    pub fn add(&mut self, s: &str) -> u32 {
        if let Some(&off) = self.map.get(s) {
            return off;
        }
        let off = self.content.len() as u32;
        self.content.extend_from_slice(s.as_bytes());
        self.content.push(0);
        self.map.insert(s.to_string(), off);
        off
    }

    /// Offset of an already-interned string
    pub fn find(&self, s: &str) -> u32 {
        self.map.get(s).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
/// .dynsym: symbols visible to the runtime loader
pub struct DynsymSection {
    /// Output header
    pub hdr: Shdr,
    /// Output section header index
    pub shndx: u32,
    /// Entries after the null symbol, in final order once finalized
    pub symbols: Vec<Arc<Symbol>>,
    /// Index of the first gnu-hashed entry (counting the null symbol)
    pub first_hashed: u32,
}

impl DynsymSection {
    /// A table holding only the null entry
    pub fn new() -> Self {
        Self {
            hdr: alloc_shdr(SHT_DYNSYM, SHF_ALLOC, 8),
            shndx: 0,
            symbols: Vec::new(),
            first_hashed: 1,
        }
    }

    /// Number of entries including the null symbol
    pub fn count(&self) -> usize {
        self.symbols.len() + 1
    }
}

#[derive(Debug, Default)]
/// .symtab and .strtab headers; files write their own slices
pub struct SymtabSection {
    /// Output header
    pub hdr: Shdr,
    /// Output section header index
    pub shndx: u32,
}

impl SymtabSection {
    /// An empty .symtab
    pub fn new() -> Self {
        Self {
            hdr: alloc_shdr(SHT_SYMTAB, 0, 8),
            shndx: 0,
        }
    }
}

#[derive(Debug, Default)]
/// .dynamic: the loader's table of contents
pub struct DynamicSection {
    /// Output header
    pub hdr: Shdr,
    /// Output section header index
    pub shndx: u32,
    /// Assembled entries, terminated by DT_NULL
    pub entries: Vec<elf::Dyn>,
}

impl DynamicSection {
    /// An empty .dynamic
    pub fn new(word: u64) -> Self {
        Self {
            hdr: alloc_shdr(SHT_DYNAMIC, SHF_ALLOC | SHF_WRITE, word),
            shndx: 0,
            entries: Vec::new(),
        }
    }

    /// Write the entries
    pub fn copy_buf(&self, ctx: &Context, buf: &mut [u8]) {
        let class = ctx.machine.class();
        for (i, entry) in self.entries.iter().enumerate() {
            entry.write_to(class, &mut buf[i * class.dyn_size()..]);
        }
    }
}

#[derive(Debug, Default)]
/// .hash: the SysV hash table over .dynsym
pub struct HashSection {
    /// Output header
    pub hdr: Shdr,
    /// Output section header index
    pub shndx: u32,
}

impl HashSection {
    /// An empty .hash
    pub fn new() -> Self {
        Self {
            hdr: alloc_shdr(SHT_HASH, SHF_ALLOC, 4),
            shndx: 0,
        }
    }

    /// Size for `count` dynamic symbols
    pub fn size_for(count: usize) -> u64 {
        // header (nbucket, nchain) + one bucket and one chain per entry
        (2 + count + count) as u64 * 4
    }

    /// Build the table
    pub fn copy_buf(&self, ctx: &Context, buf: &mut [u8]) {
        let count = ctx.dynsym.count();
        elf::put_u32(buf, 0, count as u32);
        elf::put_u32(buf, 4, count as u32);

        let buckets_off = 8;
        let chains_off = 8 + count * 4;

        for (i, sym) in ctx.dynsym.symbols.iter().enumerate() {
            let idx = i + 1;
            let hash = elf::elf_hash(sym.name_without_version().as_bytes()) as usize % count;
            let head_off = buckets_off + hash * 4;
            let prev = elf::u32le(buf, head_off).unwrap_or(0);
            elf::put_u32(buf, chains_off + idx * 4, prev);
            elf::put_u32(buf, head_off, idx as u32);
        }
    }
}

#[derive(Debug, Default)]
/// .gnu.hash: bloom-filtered hash table over the exported tail of
/// .dynsym
pub struct GnuHashSection {
    /// Output header
    pub hdr: Shdr,
    /// Output section header index
    pub shndx: u32,
    /// Bucket count
    pub num_buckets: u32,
    /// Bloom filter words
    pub num_bloom: u32,
}

/// Hashed symbols per bucket
pub const GNU_HASH_LOAD_FACTOR: u32 = 8;
/// Second bloom hash shift
pub const GNU_HASH_BLOOM_SHIFT: u32 = 26;

impl GnuHashSection {
    /// An empty .gnu.hash
    pub fn new(word: u64) -> Self {
        Self {
            hdr: alloc_shdr(SHT_GNU_HASH, SHF_ALLOC, word),
            shndx: 0,
            num_buckets: 1,
            num_bloom: 1,
        }
    }

    /// Choose table parameters for `num_hashed` exported symbols
    pub fn update_params(&mut self, num_hashed: usize) {
        self.num_buckets = ((num_hashed as u32) / GNU_HASH_LOAD_FACTOR).max(1);
        self.num_bloom = crate::next_power_of_two((num_hashed as u64 / 8).max(1)) as u32;
    }

    /// Size for the chosen parameters
    pub fn size(&self, ctx: &Context, num_hashed: usize) -> u64 {
        16 + u64::from(self.num_bloom) * ctx.machine.word_size() as u64
            + u64::from(self.num_buckets) * 4
            + num_hashed as u64 * 4
    }

    /// Build the table. The hashed symbols are the tail of .dynsym
    /// starting at `first_hashed`, already sorted by bucket.
    pub fn copy_buf(&self, ctx: &Context, buf: &mut [u8]) {
        let word = ctx.machine.word_size();
        let class = ctx.machine.class();
        let symndx = ctx.dynsym.first_hashed;
        let hashed: Vec<&Arc<Symbol>> = ctx
            .dynsym
            .symbols
            .iter()
            .skip(symndx as usize - 1)
            .collect();

        elf::put_u32(buf, 0, self.num_buckets);
        elf::put_u32(buf, 4, symndx);
        elf::put_u32(buf, 8, self.num_bloom);
        elf::put_u32(buf, 12, GNU_HASH_BLOOM_SHIFT);

        let bloom_off = 16;
        let buckets_off = bloom_off + self.num_bloom as usize * word;
        let chain_off = buckets_off + self.num_buckets as usize * 4;
        let bits = (word * 8) as u32;

        for sym in &hashed {
            let h = elf::gnu_hash(sym.name_without_version().as_bytes());
            let word_idx = (h / bits) as usize % self.num_bloom as usize;
            let mask: u64 =
                (1u64 << (h % bits)) | (1u64 << ((h >> GNU_HASH_BLOOM_SHIFT) % bits));
            let off = bloom_off + word_idx * word;
            let cur = elf::wordle(class, buf, off).unwrap_or(0);
            elf::put_word(class, buf, off, cur | mask);
        }

        for (i, sym) in hashed.iter().enumerate() {
            let h = elf::gnu_hash(sym.name_without_version().as_bytes());
            let bucket = (h % self.num_buckets) as usize;
            let head_off = buckets_off + bucket * 4;
            if elf::u32le(buf, head_off) == Some(0) {
                elf::put_u32(buf, head_off, symndx + i as u32);
            }

            // The low bit terminates each bucket's chain.
            let last_in_bucket = match hashed.get(i + 1) {
                Some(next) => {
                    elf::gnu_hash(next.name_without_version().as_bytes()) % self.num_buckets
                        != h % self.num_buckets
                }
                None => true,
            };
            let val = (h & !1) | u32::from(last_in_bucket);
            elf::put_u32(buf, chain_off + i * 4, val);
        }
    }
}

#[derive(Debug, Default)]
/// .interp
pub struct InterpSection {
    /// Output header
    pub hdr: Shdr,
    /// Output section header index
    pub shndx: u32,
}

impl InterpSection {
    /// An empty .interp
    pub fn new() -> Self {
        Self {
            hdr: alloc_shdr(SHT_PROGBITS, SHF_ALLOC, 1),
            shndx: 0,
        }
    }
}

#[derive(Debug, Default)]
/// .note.gnu.build-id
pub struct BuildIdSection {
    /// Output header
    pub hdr: Shdr,
    /// Output section header index
    pub shndx: u32,
    /// Digest length in bytes
    pub desc_size: usize,
}

impl BuildIdSection {
    /// An empty build-id note
    pub fn new() -> Self {
        Self {
            hdr: alloc_shdr(SHT_NOTE, SHF_ALLOC, 4),
            shndx: 0,
            desc_size: 16,
        }
    }

    /// Note size: header, "GNU\0", digest
    pub fn size(&self) -> u64 {
        (elf::Nhdr::SIZE + 4 + self.desc_size) as u64
    }

    /// Write the note frame; the digest itself is patched in last
    pub fn copy_buf(&self, buf: &mut [u8]) {
        elf::Nhdr {
            n_namesz: 4,
            n_descsz: self.desc_size as u32,
            n_type: elf::NT_GNU_BUILD_ID,
        }
        .write_to(buf);
        buf[elf::Nhdr::SIZE..elf::Nhdr::SIZE + 4].copy_from_slice(b"GNU\0");
    }
}

#[derive(Debug, Default)]
/// Copy-relocation BSS, in the plain and RELRO flavors
pub struct CopyrelSection {
    /// Output header
    pub hdr: Shdr,
    /// Output section header index
    pub shndx: u32,
    /// Whether this is the RELRO flavor
    pub relro: bool,
    /// Symbols with reservations here
    pub symbols: Vec<Arc<Symbol>>,
}

impl CopyrelSection {
    /// An empty copy-relocation section
    pub fn new(relro: bool) -> Self {
        Self {
            hdr: alloc_shdr(SHT_NOBITS, SHF_ALLOC | SHF_WRITE, 64),
            shndx: 0,
            relro,
            symbols: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
/// .gnu.version: one version index per .dynsym entry
pub struct VersymSection {
    /// Output header
    pub hdr: Shdr,
    /// Output section header index
    pub shndx: u32,
    /// One entry per dynamic symbol, null entry included
    pub contents: Vec<u16>,
}

impl VersymSection {
    /// An empty .gnu.version
    pub fn new() -> Self {
        Self {
            hdr: Shdr {
                sh_type: SHT_GNU_VERSYM,
                sh_flags: SHF_ALLOC,
                sh_addralign: 2,
                sh_entsize: 2,
                ..Shdr::default()
            },
            shndx: 0,
            contents: Vec::new(),
        }
    }

    /// Write the indices
    pub fn copy_buf(&self, buf: &mut [u8]) {
        for (i, v) in self.contents.iter().enumerate() {
            elf::put_u16(buf, i * 2, *v);
        }
    }
}

#[derive(Debug, Default)]
/// .gnu.version_r: versions required from depended-on DSOs
pub struct VerneedSection {
    /// Output header
    pub hdr: Shdr,
    /// Output section header index
    pub shndx: u32,
    /// Assembled records
    pub contents: Vec<u8>,
}

impl VerneedSection {
    /// An empty .gnu.version_r
    pub fn new() -> Self {
        Self {
            hdr: Shdr {
                sh_type: SHT_GNU_VERNEED,
                sh_flags: SHF_ALLOC,
                sh_addralign: 4,
                ..Shdr::default()
            },
            shndx: 0,
            contents: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
/// .gnu.version_d: versions this output defines
pub struct VerdefSection {
    /// Output header
    pub hdr: Shdr,
    /// Output section header index
    pub shndx: u32,
    /// Assembled records
    pub contents: Vec<u8>,
}

impl VerdefSection {
    /// An empty .gnu.version_d
    pub fn new() -> Self {
        Self {
            hdr: Shdr {
                sh_type: SHT_GNU_VERDEF,
                sh_flags: SHF_ALLOC,
                sh_addralign: 4,
                ..Shdr::default()
            },
            shndx: 0,
            contents: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
/// A live .eh_frame record scheduled for output
pub struct FrameRef {
    /// Owning object
    pub file: u32,
    /// Record index in that file's CIE or FDE list
    pub idx: u32,
}

#[derive(Debug, Default)]
/// .eh_frame: unique CIEs plus live FDEs
pub struct EhFrameSection {
    /// Output header
    pub hdr: Shdr,
    /// Output section header index
    pub shndx: u32,
    /// Leader CIEs in output order
    pub cies: Vec<FrameRef>,
    /// Live FDEs in output order
    pub fdes: Vec<FrameRef>,
}

impl EhFrameSection {
    /// An empty .eh_frame
    pub fn new() -> Self {
        Self {
            hdr: alloc_shdr(SHT_PROGBITS, SHF_ALLOC, 8),
            shndx: 0,
            cies: Vec::new(),
            fdes: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
/// .eh_frame_hdr: the binary-search table PT_GNU_EH_FRAME points at
pub struct EhFrameHdrSection {
    /// Output header
    pub hdr: Shdr,
    /// Output section header index
    pub shndx: u32,
}

impl EhFrameHdrSection {
    /// Fixed part before the search table
    pub const HEADER_SIZE: usize = 12;

    /// An empty .eh_frame_hdr
    pub fn new() -> Self {
        Self {
            hdr: alloc_shdr(SHT_PROGBITS, SHF_ALLOC, 4),
            shndx: 0,
        }
    }
}

/// Sort .dynsym into its final order and assign indices and .dynstr
/// offsets.
///
/// Unhashed entries (imports) come first, gnu-hashed exports last and
/// grouped by bucket, which is the layout .gnu.hash requires.
pub fn finalize_dynsym(ctx: &mut Context) {
    let mut symbols = std::mem::take(&mut ctx.dynsym.symbols);

    let num_hashed = symbols.iter().filter(|s| s.is_exported()).count();
    ctx.gnuhash.update_params(num_hashed);
    let num_buckets = ctx.gnuhash.num_buckets;

    symbols.sort_by_key(|sym: &Arc<Symbol>| -> (bool, u32, u32) {
        if sym.is_exported() {
            let h = elf::gnu_hash(sym.name_without_version().as_bytes()) % num_buckets;
            (true, h, sym.aux_idx().unwrap_or(0) as u32)
        } else {
            (false, 0, sym.aux_idx().unwrap_or(0) as u32)
        }
    });

    ctx.dynsym.first_hashed = (1 + symbols.len() - num_hashed) as u32;

    for (i, sym) in symbols.iter().enumerate() {
        let off = ctx.dynstr.add(sym.name_without_version());
        if let Some(aux_idx) = sym.aux_idx() {
            ctx.symbol_aux[aux_idx].dynsym_idx = (i + 1) as u32;
            ctx.symbol_aux[aux_idx].dynstr_off = off;
        }
    }

    ctx.dynsym.symbols = symbols;
    ctx.dynsym.hdr.sh_size = (ctx.dynsym.count() * ctx.machine.class().sym_size()) as u64;
    ctx.dynsym.hdr.sh_entsize = ctx.machine.class().sym_size() as u64;
    ctx.dynsym.hdr.sh_info = 1;
}

/// Write the .dynsym entries
pub fn write_dynsym(ctx: &Context, buf: &mut [u8]) {
    let class = ctx.machine.class();
    let entsize = class.sym_size();

    for (i, sym) in ctx.dynsym.symbols.iter().enumerate() {
        let repr = crate::lock(&sym.repr);
        let esym = match repr.file {
            Some(crate::input::FileRef::Obj(f)) => ctx.objs[f as usize]
                .elf_syms
                .get(repr.sym_idx as usize)
                .copied()
                .unwrap_or_default(),
            Some(crate::input::FileRef::Dso(f)) => ctx.dsos[f as usize]
                .elf_syms
                .get(repr.sym_idx as usize)
                .copied()
                .unwrap_or_default(),
            None => Sym::default(),
        };
        drop(repr);

        let imported = sym.is_imported();
        let has_copyrel = crate::lock(&sym.repr).has_copyrel;
        let mut out = Sym {
            st_name: sym
                .aux_idx()
                .map(|idx| ctx.symbol_aux[idx].dynstr_off)
                .unwrap_or(0),
            st_info: esym.st_info,
            st_other: sym.visibility(),
            st_shndx: elf::SHN_UNDEF,
            st_value: 0,
            st_size: esym.st_size,
        };

        // A copy-relocated symbol is re-exported at its reservation so
        // the providing DSO binds to the copy.
        if !imported || has_copyrel {
            let addr = sym.get_addr(ctx);
            out.st_value = if esym.typ() == elf::STT_TLS {
                addr - ctx.tls_begin
            } else {
                addr
            };
            out.st_shndx = output_shndx(ctx, sym).unwrap_or(elf::SHN_ABS);
        }

        out.write_to(class, &mut buf[(i + 1) * entsize..]);
    }
}

/// The output section header index a symbol's address falls in
pub fn output_shndx(ctx: &Context, sym: &Symbol) -> Option<u16> {
    let repr = crate::lock(&sym.repr);
    if repr.has_copyrel {
        let shndx = if repr.copyrel_readonly {
            ctx.dynbss_relro.shndx
        } else {
            ctx.dynbss.shndx
        };
        return Some(shndx as u16);
    }
    match &repr.origin {
        Origin::Section(sid) => {
            let isec = ctx.isec(*sid)?;
            if !isec.is_alive() {
                return None;
            }
            Some(ctx.output_sections[isec.osec as usize].shndx as u16)
        }
        Origin::Fragment(frag) => {
            Some(ctx.merged_sections[frag.parent as usize].shndx as u16)
        }
        Origin::None => {
            if repr.shndx != 0 {
                Some(repr.shndx as u16)
            } else {
                None
            }
        }
    }
}
