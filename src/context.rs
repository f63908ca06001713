//! The link context
//!
//! One [Context] owns everything a link touches: options, the symbol and
//! comdat interners, the parsed input files, the output-section
//! registries and every synthetic chunk. There is no global state; every
//! pass receives the context explicitly.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use typed_builder::TypedBuilder;

use crate::arch::Machine;
use crate::chunks::synthetic::{
    BuildIdSection, CopyrelSection, DynamicSection, DynsymSection, EhFrameHdrSection,
    EhFrameSection, GnuHashSection, GotPltSection, GotSection, HashSection, InterpSection,
    OutputEhdr, OutputPhdr, OutputShdr, PltGotSection, PltSection, RelDynSection, RelPltSection,
    StringTableSection, SymtabSection, VerdefSection, VerneedSection, VersymSection,
};
use crate::chunks::{ChunkId, OutputSection, OutputSectionRegistry};
use crate::error::Diagnostics;
use crate::input::object::ObjectFile;
use crate::input::shared::SharedFile;
use crate::input::{ComdatGroup, SectionId};
use crate::interner::ConcurrentMap;
use crate::merge::{MergedSection, MergedSectionRegistry};
use crate::symbol::{Symbol, SymbolAux};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What kind of image the link produces
pub enum LinkMode {
    /// Position-dependent executable
    Pde,
    /// Position-independent executable
    Pie,
    /// Shared object
    Dso,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Build-id generation policy
pub enum BuildIdKind {
    #[default]
    /// No build-id note
    None,
    /// A fast non-cryptographic digest of the image
    Fast,
    /// A literal hex string from the command line
    Hex(Vec<u8>),
}

#[derive(Debug, Clone, TypedBuilder)]
/// Every knob the driver exposes; tests construct these directly
pub struct Options {
    #[builder(default = String::from("a.out"))]
    /// Output path
    pub output: String,
    #[builder(default = LinkMode::Pde)]
    /// Output kind
    pub mode: LinkMode,
    #[builder(default = String::from("_start"))]
    /// Entry-point symbol
    pub entry: String,
    #[builder(default = 0x40_0000)]
    /// Base address for position-dependent output
    pub image_base: u64,
    #[builder(default = true)]
    /// Enable GOT/TLS instruction relaxations
    pub relax: bool,
    #[builder(default)]
    /// Eager binding (-z now): RELRO covers .got.plt
    pub z_now: bool,
    #[builder(default = true)]
    /// Emit a PT_GNU_RELRO segment
    pub z_relro: bool,
    #[builder(default)]
    /// Collect unreferenced sections
    pub gc_sections: bool,
    #[builder(default)]
    /// Log sections the collector removes
    pub print_gc_sections: bool,
    #[builder(default)]
    /// Omit all symbols from .symtab
    pub strip_all: bool,
    #[builder(default)]
    /// Omit debug sections
    pub strip_debug: bool,
    #[builder(default)]
    /// Omit local symbols from .symtab
    pub discard_all: bool,
    #[builder(default)]
    /// Omit assembler-local labels from .symtab
    pub discard_locals: bool,
    #[builder(default)]
    /// Export every defined global to .dynsym
    pub export_dynamic: bool,
    #[builder(default)]
    /// Bind defined symbols locally even in a DSO
    pub bsymbolic: bool,
    #[builder(default)]
    /// Bind defined functions locally even in a DSO
    pub bsymbolic_functions: bool,
    #[builder(default, setter(strip_option))]
    /// DT_SONAME value
    pub soname: Option<String>,
    #[builder(default)]
    /// DT_RUNPATH entries
    pub rpaths: Vec<String>,
    #[builder(default, setter(strip_option))]
    /// PT_INTERP contents
    pub dynamic_linker: Option<String>,
    #[builder(default)]
    /// Emit the SysV .hash table
    pub hash_style_sysv: bool,
    #[builder(default = true)]
    /// Emit the .gnu.hash table
    pub hash_style_gnu: bool,
    #[builder(default)]
    /// Build-id policy
    pub build_id: BuildIdKind,
    #[builder(default)]
    /// Worker threads; zero means automatic
    pub threads: usize,
    #[builder(default)]
    /// Names forced undefined, also reachability roots
    pub undefined: Vec<String>,
    #[builder(default)]
    /// Drop DT_NEEDED entries for unreferenced shared objects
    pub as_needed: bool,
    #[builder(default)]
    /// Archives whose members get hidden visibility ("ALL" for all)
    pub exclude_libs: Vec<String>,
    #[builder(default)]
    /// Symbols whose resolution steps are logged
    pub trace_symbols: Vec<String>,
    #[builder(default)]
    /// Warn about mismatched common symbols
    pub warn_common: bool,
    #[builder(default)]
    /// Turn warnings into errors
    pub fatal_warnings: bool,
    #[builder(default)]
    /// Version names defined by this output
    pub version_definitions: Vec<String>,
    #[builder(default = true)]
    /// Emit .eh_frame_hdr and PT_GNU_EH_FRAME
    pub eh_frame_hdr: bool,
    #[builder(default = crate::elf::VER_NDX_GLOBAL)]
    /// Version index newly resolved definitions start with
    pub default_version: u16,
}

#[derive(Debug)]
/// All state of one link
pub struct Context {
    /// The option set driving this link
    pub options: Options,
    /// Target architecture
    pub machine: Machine,
    /// Recoverable-error channel
    pub diags: Diagnostics,
    /// The process-wide symbol interner
    pub symbol_map: ConcurrentMap<Symbol>,
    /// Comdat signatures
    pub comdat_groups: ConcurrentMap<ComdatGroup>,
    /// Object files; index 0 is the internal file
    pub objs: Vec<ObjectFile>,
    /// Shared objects
    pub dsos: Vec<SharedFile>,
    /// Output-section registry used while inputs are parsed
    pub osec_registry: OutputSectionRegistry,
    /// Frozen output sections, valid from binning onward
    pub output_sections: Vec<OutputSection>,
    /// Merged-section registry used while mergeable sections split
    pub merged_registry: MergedSectionRegistry,
    /// Frozen merged sections
    pub merged_sections: Vec<MergedSection>,
    /// Side table indexed by each symbol's aux index
    pub symbol_aux: Vec<SymbolAux>,
    /// The ordered chunk list, valid after layout
    pub chunks: Vec<ChunkId>,
    /// Start of the TLS template
    pub tls_begin: u64,
    /// Aligned end of the TLS template
    pub tls_end: u64,
    /// Total output file size, valid after layout
    pub filesize: u64,

    /// ELF header chunk
    pub ehdr: OutputEhdr,
    /// Program header chunk
    pub phdr: OutputPhdr,
    /// Section header chunk
    pub shdr: OutputShdr,
    /// .got
    pub got: GotSection,
    /// .got.plt
    pub gotplt: GotPltSection,
    /// .plt
    pub plt: PltSection,
    /// .plt.got
    pub pltgot: PltGotSection,
    /// .rela.dyn
    pub reldyn: RelDynSection,
    /// .rela.plt
    pub relplt: RelPltSection,
    /// .dynsym
    pub dynsym: DynsymSection,
    /// .dynstr
    pub dynstr: StringTableSection,
    /// .dynamic
    pub dynamic: DynamicSection,
    /// .hash
    pub hash: HashSection,
    /// .gnu.hash
    pub gnuhash: GnuHashSection,
    /// .interp
    pub interp: InterpSection,
    /// .note.gnu.build-id
    pub buildid: BuildIdSection,
    /// .eh_frame
    pub ehframe: EhFrameSection,
    /// .eh_frame_hdr
    pub ehframehdr: EhFrameHdrSection,
    /// Copy-relocation BSS
    pub dynbss: CopyrelSection,
    /// Copy-relocation BSS that RELRO covers
    pub dynbss_relro: CopyrelSection,
    /// .gnu.version
    pub versym: VersymSection,
    /// .gnu.version_r
    pub verneed: VerneedSection,
    /// .gnu.version_d
    pub verdef: VerdefSection,
    /// .symtab
    pub symtab: SymtabSection,
    /// .strtab
    pub strtab: StringTableSection,
    /// .shstrtab
    pub shstrtab: StringTableSection,

    /// Set when any x86 initial-exec TLS relocation was seen; forces
    /// DF_STATIC_TLS-style eager processing
    pub has_gottp_rel: AtomicBool,
}

impl Context {
    /// Create a context for one link
    pub fn new(options: Options, machine: Machine) -> Self {
        let word = machine.word_size() as u64;
        let diags = Diagnostics::new(options.fatal_warnings);
        Self {
            options,
            machine,
            diags,
            symbol_map: ConcurrentMap::new(),
            comdat_groups: ConcurrentMap::new(),
            objs: Vec::new(),
            dsos: Vec::new(),
            osec_registry: OutputSectionRegistry::default(),
            output_sections: Vec::new(),
            merged_registry: MergedSectionRegistry::default(),
            merged_sections: Vec::new(),
            symbol_aux: Vec::new(),
            chunks: Vec::new(),
            tls_begin: 0,
            tls_end: 0,
            filesize: 0,
            ehdr: OutputEhdr::new(),
            phdr: OutputPhdr::new(),
            shdr: OutputShdr::new(),
            got: GotSection::new(word),
            gotplt: GotPltSection::new(word),
            plt: PltSection::new(),
            pltgot: PltGotSection::new(),
            reldyn: RelDynSection::new(word),
            relplt: RelPltSection::new(word),
            dynsym: DynsymSection::new(),
            dynstr: StringTableSection::new(),
            dynamic: DynamicSection::new(word),
            hash: HashSection::new(),
            gnuhash: GnuHashSection::new(word),
            interp: InterpSection::new(),
            buildid: BuildIdSection::new(),
            ehframe: EhFrameSection::new(),
            ehframehdr: EhFrameHdrSection::new(),
            dynbss: CopyrelSection::new(false),
            dynbss_relro: CopyrelSection::new(true),
            versym: VersymSection::new(),
            verneed: VerneedSection::new(),
            verdef: VerdefSection::new(),
            symtab: SymtabSection::new(),
            strtab: StringTableSection::new(),
            shstrtab: StringTableSection::new(),
            has_gottp_rel: AtomicBool::new(false),
        }
    }

    /// Intern a symbol name, marking it traced if requested
    pub fn intern(&self, name: &str) -> Arc<Symbol> {
        let (sym, created) = self.symbol_map.insert_with(name.as_bytes(), || Symbol::new(name));
        if created && self.options.trace_symbols.iter().any(|t| t == name) {
            sym.traced.store(true, std::sync::atomic::Ordering::Relaxed);
        }
        sym
    }

    /// Look up an already-interned symbol
    pub fn get_symbol(&self, name: &str) -> Option<Arc<Symbol>> {
        self.symbol_map.get(name.as_bytes())
    }

    /// The section a [SectionId] names, if its slot is populated
    pub fn isec(&self, sid: SectionId) -> Option<&crate::input::section::InputSection> {
        self.objs
            .get(sid.file as usize)?
            .sections
            .get(sid.index as usize)?
            .as_ref()
    }

    /// The output kind
    pub fn link_mode(&self) -> LinkMode {
        self.options.mode
    }

    /// Whether the output is a shared object
    pub fn is_shared(&self) -> bool {
        self.options.mode == LinkMode::Dso
    }

    /// Whether the output is position-independent
    pub fn is_pic(&self) -> bool {
        matches!(self.options.mode, LinkMode::Pie | LinkMode::Dso)
    }

    /// Whether the output carries dynamic linking machinery
    pub fn is_dynamic(&self) -> bool {
        !self.dsos.is_empty() || self.is_pic()
    }

    /// The image base address; position-independent output loads at 0
    pub fn image_base(&self) -> u64 {
        if self.is_pic() {
            0
        } else {
            self.options.image_base
        }
    }

    /// Whether TLS descriptor sequences may be rewritten to local-exec
    pub fn relax_tlsdesc(&self) -> bool {
        self.options.relax && !self.is_shared()
    }

    /// Display name of a file reference
    pub fn file_name(&self, file: crate::input::FileRef) -> String {
        match file {
            crate::input::FileRef::Obj(idx) => self.objs[idx as usize].display_name(),
            crate::input::FileRef::Dso(idx) => self.dsos[idx as usize].name.clone(),
        }
    }

    /// Priority of a file reference
    pub fn file_priority(&self, file: crate::input::FileRef) -> u32 {
        match file {
            crate::input::FileRef::Obj(idx) => self.objs[idx as usize].priority,
            crate::input::FileRef::Dso(idx) => self.dsos[idx as usize].priority,
        }
    }

    /// The header of any chunk
    pub fn chunk_hdr(&self, id: ChunkId) -> &crate::elf::Shdr {
        match id {
            ChunkId::Ehdr => &self.ehdr.hdr,
            ChunkId::Phdr => &self.phdr.hdr,
            ChunkId::Shdr => &self.shdr.hdr,
            ChunkId::Osec(i) => &self.output_sections[i as usize].hdr,
            ChunkId::Merged(i) => &self.merged_sections[i as usize].hdr,
            ChunkId::Got => &self.got.hdr,
            ChunkId::GotPlt => &self.gotplt.hdr,
            ChunkId::Plt => &self.plt.hdr,
            ChunkId::PltGot => &self.pltgot.hdr,
            ChunkId::RelDyn => &self.reldyn.hdr,
            ChunkId::RelPlt => &self.relplt.hdr,
            ChunkId::Dynsym => &self.dynsym.hdr,
            ChunkId::Dynstr => &self.dynstr.hdr,
            ChunkId::Dynamic => &self.dynamic.hdr,
            ChunkId::Hash => &self.hash.hdr,
            ChunkId::GnuHash => &self.gnuhash.hdr,
            ChunkId::Interp => &self.interp.hdr,
            ChunkId::BuildId => &self.buildid.hdr,
            ChunkId::EhFrame => &self.ehframe.hdr,
            ChunkId::EhFrameHdr => &self.ehframehdr.hdr,
            ChunkId::Copyrel => &self.dynbss.hdr,
            ChunkId::CopyrelRelro => &self.dynbss_relro.hdr,
            ChunkId::Versym => &self.versym.hdr,
            ChunkId::Verneed => &self.verneed.hdr,
            ChunkId::Verdef => &self.verdef.hdr,
            ChunkId::Symtab => &self.symtab.hdr,
            ChunkId::Strtab => &self.strtab.hdr,
            ChunkId::Shstrtab => &self.shstrtab.hdr,
        }
    }

    /// Mutable access to the header of any chunk
    pub fn chunk_hdr_mut(&mut self, id: ChunkId) -> &mut crate::elf::Shdr {
        match id {
            ChunkId::Ehdr => &mut self.ehdr.hdr,
            ChunkId::Phdr => &mut self.phdr.hdr,
            ChunkId::Shdr => &mut self.shdr.hdr,
            ChunkId::Osec(i) => &mut self.output_sections[i as usize].hdr,
            ChunkId::Merged(i) => &mut self.merged_sections[i as usize].hdr,
            ChunkId::Got => &mut self.got.hdr,
            ChunkId::GotPlt => &mut self.gotplt.hdr,
            ChunkId::Plt => &mut self.plt.hdr,
            ChunkId::PltGot => &mut self.pltgot.hdr,
            ChunkId::RelDyn => &mut self.reldyn.hdr,
            ChunkId::RelPlt => &mut self.relplt.hdr,
            ChunkId::Dynsym => &mut self.dynsym.hdr,
            ChunkId::Dynstr => &mut self.dynstr.hdr,
            ChunkId::Dynamic => &mut self.dynamic.hdr,
            ChunkId::Hash => &mut self.hash.hdr,
            ChunkId::GnuHash => &mut self.gnuhash.hdr,
            ChunkId::Interp => &mut self.interp.hdr,
            ChunkId::BuildId => &mut self.buildid.hdr,
            ChunkId::EhFrame => &mut self.ehframe.hdr,
            ChunkId::EhFrameHdr => &mut self.ehframehdr.hdr,
            ChunkId::Copyrel => &mut self.dynbss.hdr,
            ChunkId::CopyrelRelro => &mut self.dynbss_relro.hdr,
            ChunkId::Versym => &mut self.versym.hdr,
            ChunkId::Verneed => &mut self.verneed.hdr,
            ChunkId::Verdef => &mut self.verdef.hdr,
            ChunkId::Symtab => &mut self.symtab.hdr,
            ChunkId::Strtab => &mut self.strtab.hdr,
            ChunkId::Shstrtab => &mut self.shstrtab.hdr,
        }
    }

    /// Display name of any chunk
    pub fn chunk_name(&self, id: ChunkId) -> &str {
        let rela = self.machine.is_rela();
        match id {
            ChunkId::Ehdr => "",
            ChunkId::Phdr => "",
            ChunkId::Shdr => "",
            ChunkId::Osec(i) => &self.output_sections[i as usize].name,
            ChunkId::Merged(i) => &self.merged_sections[i as usize].name,
            ChunkId::Got => ".got",
            ChunkId::GotPlt => ".got.plt",
            ChunkId::Plt => ".plt",
            ChunkId::PltGot => ".plt.got",
            ChunkId::RelDyn => {
                if rela {
                    ".rela.dyn"
                } else {
                    ".rel.dyn"
                }
            }
            ChunkId::RelPlt => {
                if rela {
                    ".rela.plt"
                } else {
                    ".rel.plt"
                }
            }
            ChunkId::Dynsym => ".dynsym",
            ChunkId::Dynstr => ".dynstr",
            ChunkId::Dynamic => ".dynamic",
            ChunkId::Hash => ".hash",
            ChunkId::GnuHash => ".gnu.hash",
            ChunkId::Interp => ".interp",
            ChunkId::BuildId => ".note.gnu.build-id",
            ChunkId::EhFrame => ".eh_frame",
            ChunkId::EhFrameHdr => ".eh_frame_hdr",
            ChunkId::Copyrel => ".copyrel",
            ChunkId::CopyrelRelro => ".copyrel.rel.ro",
            ChunkId::Versym => ".gnu.version",
            ChunkId::Verneed => ".gnu.version_r",
            ChunkId::Verdef => ".gnu.version_d",
            ChunkId::Symtab => ".symtab",
            ChunkId::Strtab => ".strtab",
            ChunkId::Shstrtab => ".shstrtab",
        }
    }

    /// Record the section header index assigned to a chunk
    pub fn set_chunk_shndx(&mut self, id: ChunkId, shndx: u32) {
        match id {
            ChunkId::Osec(i) => self.output_sections[i as usize].shndx = shndx,
            ChunkId::Merged(i) => self.merged_sections[i as usize].shndx = shndx,
            ChunkId::Got => self.got.shndx = shndx,
            ChunkId::GotPlt => self.gotplt.shndx = shndx,
            ChunkId::Plt => self.plt.shndx = shndx,
            ChunkId::PltGot => self.pltgot.shndx = shndx,
            ChunkId::RelDyn => self.reldyn.shndx = shndx,
            ChunkId::RelPlt => self.relplt.shndx = shndx,
            ChunkId::Dynsym => self.dynsym.shndx = shndx,
            ChunkId::Dynstr => self.dynstr.shndx = shndx,
            ChunkId::Dynamic => self.dynamic.shndx = shndx,
            ChunkId::Hash => self.hash.shndx = shndx,
            ChunkId::GnuHash => self.gnuhash.shndx = shndx,
            ChunkId::Interp => self.interp.shndx = shndx,
            ChunkId::BuildId => self.buildid.shndx = shndx,
            ChunkId::EhFrame => self.ehframe.shndx = shndx,
            ChunkId::EhFrameHdr => self.ehframehdr.shndx = shndx,
            ChunkId::Copyrel => self.dynbss.shndx = shndx,
            ChunkId::CopyrelRelro => self.dynbss_relro.shndx = shndx,
            ChunkId::Versym => self.versym.shndx = shndx,
            ChunkId::Verneed => self.verneed.shndx = shndx,
            ChunkId::Verdef => self.verdef.shndx = shndx,
            ChunkId::Symtab => self.symtab.shndx = shndx,
            ChunkId::Strtab => self.strtab.shndx = shndx,
            ChunkId::Shstrtab => self.shstrtab.shndx = shndx,
            ChunkId::Ehdr | ChunkId::Phdr | ChunkId::Shdr => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_image_base_is_zero_for_pic() {
        let pde = Context::new(Options::builder().build(), Machine::X86_64);
        assert_eq!(pde.image_base(), 0x40_0000);

        let pie = Context::new(
            Options::builder().mode(LinkMode::Pie).build(),
            Machine::X86_64,
        );
        assert_eq!(pie.image_base(), 0);
        assert!(pie.is_pic());
        assert!(!pie.is_shared());
    }

    #[test]
    fn test_intern_marks_traced_symbols() {
        let opts = Options::builder()
            .trace_symbols(vec!["printf".to_string()])
            .build();
        let ctx = Context::new(opts, Machine::X86_64);
        let sym = ctx.intern("printf");
        assert!(sym.traced.load(std::sync::atomic::Ordering::Relaxed));
        let other = ctx.intern("puts");
        assert!(!other.traced.load(std::sync::atomic::Ordering::Relaxed));
    }
}
