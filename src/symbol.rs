//! Canonical symbols
//!
//! Global symbols are interned by name: every input file that mentions a
//! name holds the same `Arc<Symbol>`, so resolution is a race over one
//! record arbitrated by that record's own lock. Local symbols use the
//! same type but are privately owned by their file and never contested.
//!
//! Fields fall into three groups by synchronization need: the resolution
//! state behind the per-symbol mutex, the accumulated-needs mask and
//! visibility as atomics (writers race during scanning), and the
//! auxiliary table index assigned once scanning is over.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::context::Context;
use crate::elf::{Sym, STT_GNU_IFUNC, STV_HIDDEN, STV_PROTECTED};
use crate::input::{FileRef, SectionId};
use crate::merge::SectionFragment;

/// Sentinel for "no index assigned"
pub const NONE_IDX: u32 = u32::MAX;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Dynamic-linking machinery a symbol was found to require during
    /// relocation scanning
    pub struct Needs: u32 {
        /// A slot in .got
        const GOT = 1 << 0;
        /// A stub in .plt (or .plt.got when a GOT slot already exists)
        const PLT = 1 << 1;
        /// A thread-pointer-relative GOT slot
        const GOTTP = 1 << 2;
        /// A two-slot general-dynamic TLS GOT pair
        const TLSGD = 1 << 3;
        /// The link-wide local-dynamic TLS GOT pair
        const TLSLD = 1 << 4;
        /// A two-slot TLS descriptor
        const TLSDESC = 1 << 5;
        /// A BSS reservation plus a COPY relocation
        const COPYREL = 1 << 6;
        /// An entry in .dynsym
        const DYNSYM = 1 << 7;
    }
}

#[derive(Debug, Clone, Default)]
/// Where a symbol's value points
pub enum Origin {
    #[default]
    /// Absolute value, undefined, or linker-synthesized address
    None,
    /// Defined inside an input section; value is section-relative
    Section(SectionId),
    /// Defined inside a merged fragment; value is fragment-relative
    Fragment(Arc<SectionFragment>),
}

#[derive(Debug, Default)]
/// Resolution state guarded by the symbol's lock
pub struct SymbolRepr {
    /// The file currently providing the winning definition
    pub file: Option<FileRef>,
    /// Index into that file's raw symbol table
    pub sym_idx: u32,
    /// Value relative to the origin
    pub value: u64,
    /// What the value is relative to
    pub origin: Origin,
    /// Assigned version index
    pub ver_idx: u16,
    /// Definition lives in an archive member not yet pulled in
    pub is_lazy: bool,
    /// Definition is weak (set for DSO definitions until a strong
    /// reference pins them)
    pub is_weak: bool,
    /// Resolved at run time by the dynamic loader
    pub is_imported: bool,
    /// Visible to the dynamic loader
    pub is_exported: bool,
    /// Redirected into a copy-relocation reservation
    pub has_copyrel: bool,
    /// The reservation sits in the RELRO copy section
    pub copyrel_readonly: bool,
    /// Output section index for linker-synthesized symbols
    pub shndx: u32,
}

#[derive(Debug)]
/// A canonical symbol record
pub struct Symbol {
    name: Box<str>,
    /// Resolution state; see [SymbolRepr]
    pub repr: Mutex<SymbolRepr>,
    flags: AtomicU32,
    visibility: AtomicU8,
    aux_idx: AtomicU32,
    /// Log every resolution decision involving this symbol
    pub traced: AtomicBool,
    /// Selected for the output .symtab
    pub write_to_symtab: AtomicBool,
}

impl Symbol {
    /// Create an unresolved symbol record
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            repr: Mutex::new(SymbolRepr::default()),
            flags: AtomicU32::new(0),
            visibility: AtomicU8::new(crate::elf::STV_DEFAULT),
            aux_idx: AtomicU32::new(NONE_IDX),
            traced: AtomicBool::new(false),
            write_to_symtab: AtomicBool::new(false),
        }
    }

    /// The interned name, including any `@version` suffix
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The name with any `@version` suffix removed
    pub fn name_without_version(&self) -> &str {
        match self.name.find('@') {
            Some(pos) => &self.name[..pos],
            None => &self.name,
        }
    }

    /// Reset to the unresolved state, keeping the name
    pub fn clear(&self) {
        *crate::lock(&self.repr) = SymbolRepr::default();
    }

    /// Accumulate needs bits; concurrent scanners may race freely
    pub fn add_flags(&self, needs: Needs) {
        self.flags.fetch_or(needs.bits(), Ordering::Relaxed);
    }

    /// The accumulated needs mask
    pub fn flags(&self) -> Needs {
        Needs::from_bits_retain(self.flags.load(Ordering::Relaxed))
    }

    /// Current merged visibility
    pub fn visibility(&self) -> u8 {
        self.visibility.load(Ordering::Relaxed)
    }

    /// Merge in an observed visibility; the most restrictive wins no
    /// matter the arrival order (hidden < protected < default).
    pub fn merge_visibility(&self, visibility: u8) {
        fn restrictiveness(v: u8) -> u8 {
            match v {
                STV_HIDDEN => 1,
                STV_PROTECTED => 2,
                _ => 3,
            }
        }

        let mut current = self.visibility.load(Ordering::Relaxed);
        while restrictiveness(visibility) < restrictiveness(current) {
            match self.visibility.compare_exchange_weak(
                current,
                visibility,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Auxiliary-table slot, if one was assigned
    pub fn aux_idx(&self) -> Option<usize> {
        match self.aux_idx.load(Ordering::Relaxed) {
            NONE_IDX => None,
            idx => Some(idx as usize),
        }
    }

    /// Assign the auxiliary-table slot (done once, serially)
    pub fn set_aux_idx(&self, idx: usize) {
        self.aux_idx.store(idx as u32, Ordering::Relaxed);
    }

    fn aux<'a>(&self, ctx: &'a Context) -> Option<&'a SymbolAux> {
        ctx.symbol_aux.get(self.aux_idx()?)
    }

    /// The raw symbol record backing the current definition
    pub fn esym(&self, ctx: &Context) -> Sym {
        let repr = crate::lock(&self.repr);
        esym_of(ctx, &repr)
    }

    /// Whether the current definition is an undefined weak reference
    pub fn is_undef_weak(&self, ctx: &Context) -> bool {
        self.esym(ctx).is_undef_weak()
    }

    /// Whether the symbol resolves at run time
    pub fn is_imported(&self) -> bool {
        crate::lock(&self.repr).is_imported
    }

    /// Whether the symbol is visible to the dynamic loader
    pub fn is_exported(&self) -> bool {
        crate::lock(&self.repr).is_exported
    }

    /// The ELF type of the current definition
    pub fn get_type(&self, ctx: &Context) -> u8 {
        self.esym(ctx).typ()
    }

    /// Whether the symbol's address is a link-time constant plus the
    /// load bias, which is what instruction relaxation requires
    pub fn is_relative(&self, ctx: &Context) -> bool {
        let repr = crate::lock(&self.repr);
        if repr.is_imported {
            return false;
        }
        if esym_of(ctx, &repr).typ() == STT_GNU_IFUNC {
            return false;
        }
        !matches!(repr.origin, Origin::None) || repr.shndx != 0
    }

    /// Whether the definition survives section elimination
    pub fn is_alive(&self, ctx: &Context) -> bool {
        let repr = crate::lock(&self.repr);
        match &repr.origin {
            Origin::Section(sid) => ctx
                .isec(*sid)
                .map(|isec| isec.is_alive())
                .unwrap_or(false),
            Origin::Fragment(frag) => frag.is_alive(),
            Origin::None => true,
        }
    }

    /// Final virtual address of the symbol
    pub fn get_addr(&self, ctx: &Context) -> u64 {
        let repr = crate::lock(&self.repr);

        if repr.has_copyrel {
            let base = if repr.copyrel_readonly {
                ctx.dynbss_relro.hdr.sh_addr
            } else {
                ctx.dynbss.hdr.sh_addr
            };
            return base + repr.value;
        }

        // The address of an ifunc, and of any imported function, is its
        // PLT entry.
        if esym_of(ctx, &repr).typ() == STT_GNU_IFUNC {
            if let Some(addr) = self.plt_addr(ctx) {
                return addr;
            }
        }
        if repr.is_imported {
            if let Some(addr) = self.plt_addr(ctx) {
                return addr;
            }
            return 0;
        }

        match &repr.origin {
            Origin::Fragment(frag) => frag.get_addr(ctx) + repr.value,
            Origin::Section(sid) => match ctx.isec(*sid) {
                Some(isec) if isec.is_alive() => {
                    ctx.output_sections[isec.osec as usize].hdr.sh_addr
                        + isec.offset()
                        + repr.value
                }
                _ => 0,
            },
            Origin::None => repr.value,
        }
    }

    /// The address of the definition itself, bypassing the PLT and
    /// copy-relocation redirections `get_addr` performs. The ifunc GOT
    /// machinery needs the resolver function's own address.
    pub fn origin_addr(&self, ctx: &Context) -> u64 {
        let repr = crate::lock(&self.repr);
        match &repr.origin {
            Origin::Fragment(frag) => frag.get_addr(ctx) + repr.value,
            Origin::Section(sid) => match ctx.isec(*sid) {
                Some(isec) if isec.is_alive() => {
                    ctx.output_sections[isec.osec as usize].hdr.sh_addr
                        + isec.offset()
                        + repr.value
                }
                _ => 0,
            },
            Origin::None => repr.value,
        }
    }

    fn plt_addr(&self, ctx: &Context) -> Option<u64> {
        let aux = self.aux(ctx)?;
        if aux.plt_idx != NONE_IDX {
            let entry = ctx.machine.plt_entry_size() as u64;
            return Some(
                ctx.plt.hdr.sh_addr
                    + ctx.machine.plt_header_size() as u64
                    + u64::from(aux.plt_idx) * entry,
            );
        }
        if aux.pltgot_idx != NONE_IDX {
            let entry = ctx.machine.pltgot_entry_size() as u64;
            return Some(ctx.pltgot.hdr.sh_addr + u64::from(aux.pltgot_idx) * entry);
        }
        None
    }

    /// Address of the symbol's PLT entry; only valid once one exists
    pub fn get_plt_addr(&self, ctx: &Context) -> u64 {
        self.plt_addr(ctx).unwrap_or(0)
    }

    /// Index of the symbol's GOT slot
    pub fn got_idx(&self, ctx: &Context) -> Option<u32> {
        self.aux(ctx)
            .map(|a| a.got_idx)
            .filter(|&idx| idx != NONE_IDX)
    }

    /// Address of the symbol's GOT slot
    pub fn get_got_addr(&self, ctx: &Context) -> u64 {
        let idx = self.got_idx(ctx).unwrap_or(0);
        ctx.got.hdr.sh_addr + u64::from(idx) * ctx.machine.word_size() as u64
    }

    /// Index of the symbol's .got.plt slot
    pub fn gotplt_idx(&self, ctx: &Context) -> Option<u32> {
        self.aux(ctx)
            .map(|a| a.gotplt_idx)
            .filter(|&idx| idx != NONE_IDX)
    }

    /// Address of the symbol's .got.plt slot
    pub fn get_gotplt_addr(&self, ctx: &Context) -> u64 {
        let idx = self.gotplt_idx(ctx).unwrap_or(0);
        ctx.gotplt.hdr.sh_addr + u64::from(idx) * ctx.machine.word_size() as u64
    }

    /// Index of the symbol's thread-pointer-relative GOT slot
    pub fn gottp_idx(&self, ctx: &Context) -> Option<u32> {
        self.aux(ctx)
            .map(|a| a.gottp_idx)
            .filter(|&idx| idx != NONE_IDX)
    }

    /// Address of the symbol's thread-pointer-relative GOT slot
    pub fn get_gottp_addr(&self, ctx: &Context) -> u64 {
        let idx = self.gottp_idx(ctx).unwrap_or(0);
        ctx.got.hdr.sh_addr + u64::from(idx) * ctx.machine.word_size() as u64
    }

    /// Index of the symbol's general-dynamic TLS slot pair
    pub fn tlsgd_idx(&self, ctx: &Context) -> Option<u32> {
        self.aux(ctx)
            .map(|a| a.tlsgd_idx)
            .filter(|&idx| idx != NONE_IDX)
    }

    /// Address of the symbol's general-dynamic TLS slot pair
    pub fn get_tlsgd_addr(&self, ctx: &Context) -> u64 {
        let idx = self.tlsgd_idx(ctx).unwrap_or(0);
        ctx.got.hdr.sh_addr + u64::from(idx) * ctx.machine.word_size() as u64
    }

    /// Index of the symbol's TLS descriptor slot pair
    pub fn tlsdesc_idx(&self, ctx: &Context) -> Option<u32> {
        self.aux(ctx)
            .map(|a| a.tlsdesc_idx)
            .filter(|&idx| idx != NONE_IDX)
    }

    /// Address of the symbol's TLS descriptor slot pair
    pub fn get_tlsdesc_addr(&self, ctx: &Context) -> u64 {
        let idx = self.tlsdesc_idx(ctx).unwrap_or(0);
        ctx.got.hdr.sh_addr + u64::from(idx) * ctx.machine.word_size() as u64
    }

    /// The symbol's index in the output .dynsym
    pub fn get_dynsym_idx(&self, ctx: &Context) -> u32 {
        self.aux(ctx)
            .map(|a| a.dynsym_idx)
            .filter(|&idx| idx != NONE_IDX)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
/// Per-symbol indices into the synthetic sections, allocated only for
/// symbols that accumulated needs bits
pub struct SymbolAux {
    /// Slot in .got
    pub got_idx: u32,
    /// Slot in .got.plt
    pub gotplt_idx: u32,
    /// Stub index in .plt
    pub plt_idx: u32,
    /// Stub index in .plt.got
    pub pltgot_idx: u32,
    /// Entry in .dynsym
    pub dynsym_idx: u32,
    /// Thread-pointer GOT slot
    pub gottp_idx: u32,
    /// General-dynamic TLS slot pair
    pub tlsgd_idx: u32,
    /// TLS descriptor slot pair
    pub tlsdesc_idx: u32,
    /// Name offset in .dynstr
    pub dynstr_off: u32,
}

impl Default for SymbolAux {
    fn default() -> Self {
        Self {
            got_idx: NONE_IDX,
            gotplt_idx: NONE_IDX,
            plt_idx: NONE_IDX,
            pltgot_idx: NONE_IDX,
            dynsym_idx: NONE_IDX,
            gottp_idx: NONE_IDX,
            tlsgd_idx: NONE_IDX,
            tlsdesc_idx: NONE_IDX,
            dynstr_off: 0,
        }
    }
}

fn esym_of(ctx: &Context, repr: &SymbolRepr) -> Sym {
    match repr.file {
        Some(FileRef::Obj(idx)) => ctx.objs[idx as usize]
            .elf_syms
            .get(repr.sym_idx as usize)
            .copied()
            .unwrap_or_default(),
        Some(FileRef::Dso(idx)) => ctx.dsos[idx as usize]
            .elf_syms
            .get(repr.sym_idx as usize)
            .copied()
            .unwrap_or_default(),
        None => Sym::default(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::elf::{STV_DEFAULT, STV_HIDDEN, STV_PROTECTED};

    #[test]
    fn test_merge_visibility_most_restrictive_wins() {
        let sym = Symbol::new("foo");
        assert_eq!(sym.visibility(), STV_DEFAULT);
        sym.merge_visibility(STV_PROTECTED);
        assert_eq!(sym.visibility(), STV_PROTECTED);
        sym.merge_visibility(STV_DEFAULT);
        assert_eq!(sym.visibility(), STV_PROTECTED);
        sym.merge_visibility(STV_HIDDEN);
        assert_eq!(sym.visibility(), STV_HIDDEN);
    }

    #[test]
    fn test_flags_accumulate() {
        let sym = Symbol::new("foo");
        sym.add_flags(Needs::GOT);
        sym.add_flags(Needs::PLT | Needs::DYNSYM);
        assert!(sym.flags().contains(Needs::GOT | Needs::PLT | Needs::DYNSYM));
        assert!(!sym.flags().contains(Needs::COPYREL));
    }

    #[test]
    fn test_versioned_name_split() {
        let sym = Symbol::new("gets@GLIBC_2.2.5");
        assert_eq!(sym.name(), "gets@GLIBC_2.2.5");
        assert_eq!(sym.name_without_version(), "gets");

        let plain = Symbol::new("gets");
        assert_eq!(plain.name_without_version(), "gets");
    }

    #[test]
    fn test_clear_resets_resolution() {
        let sym = Symbol::new("foo");
        {
            let mut repr = crate::lock(&sym.repr);
            repr.file = Some(FileRef::Obj(3));
            repr.value = 0x1000;
            repr.is_lazy = true;
        }
        sym.clear();
        let repr = crate::lock(&sym.repr);
        assert!(repr.file.is_none());
        assert_eq!(repr.value, 0);
        assert!(!repr.is_lazy);
    }
}
