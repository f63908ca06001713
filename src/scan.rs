//! Relocation scanning
//!
//! Before anything can be laid out, every relocation in every live
//! allocated section is classified: does it resolve at link time, does
//! it need a base-relative or symbolic dynamic relocation, a PLT stub, a
//! GOT slot, a copy reservation, or is it unrepresentable under the
//! requested output kind? The per-architecture policy tables make that
//! decision; this module provides the shared machinery and the pass that
//! turns the accumulated per-symbol needs into assigned slots.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use rayon::prelude::*;

use crate::context::{Context, LinkMode};
use crate::elf::{Class, Rel, SHF_ALLOC, STT_FUNC};
use crate::error::{Error, Result};
use crate::input::object::ObjectFile;
use crate::input::section::InputSection;
use crate::input::FileRef;
use crate::symbol::{Needs, Origin, Symbol, SymbolAux};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
/// Per-relocation classification stored by the scanner and consumed by
/// the applicator
pub enum RelAction {
    /// Resolve fully at link time
    Plain = 0,
    /// Emit R_*_RELATIVE and store the link-time value
    Baserel = 1,
    /// Emit a symbolic dynamic relocation and store the addend
    Dynrel = 2,
}

impl RelAction {
    /// Decode a stored classification byte
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Baserel,
            2 => Self::Dynrel,
            _ => Self::Plain,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// One cell of a policy table
pub enum Action {
    /// Resolve at link time
    None,
    /// Unrepresentable under this output kind
    Error,
    /// Reserve BSS and emit a COPY relocation
    Copyrel,
    /// Route the reference through a PLT stub
    Plt,
    /// Emit a symbolic dynamic relocation
    Dynrel,
    /// Emit an R_*_RELATIVE dynamic relocation
    Baserel,
}

/// Rows: DSO, PIE, PDE. Columns: absolute, local, imported data,
/// imported code.
pub type ActionTable = [[Action; 4]; 3];

fn table_row(mode: LinkMode) -> usize {
    match mode {
        LinkMode::Dso => 0,
        LinkMode::Pie => 1,
        LinkMode::Pde => 2,
    }
}

fn table_column(ctx: &Context, sym: &Symbol) -> usize {
    let repr = crate::lock(&sym.repr);
    if repr.is_imported {
        let is_func = match repr.file {
            Some(FileRef::Dso(idx)) => ctx.dsos[idx as usize]
                .elf_syms
                .get(repr.sym_idx as usize)
                .map(|e| e.typ() == STT_FUNC)
                .unwrap_or(false),
            Some(FileRef::Obj(idx)) => ctx.objs[idx as usize]
                .elf_syms
                .get(repr.sym_idx as usize)
                .map(|e| e.typ() == STT_FUNC)
                .unwrap_or(false),
            None => false,
        };
        if is_func {
            3
        } else {
            2
        }
    } else if repr.file == Some(FileRef::Obj(0)) {
        // Linker-synthesized markers move with the image base even
        // though their raw records look absolute.
        1
    } else if matches!(repr.origin, Origin::None) && repr.shndx == 0 {
        // Absolute values need no load-bias fixup.
        0
    } else {
        1
    }
}

/// Decide what one relocation requires, given its policy table
pub fn dispatch(
    ctx: &Context,
    file: &ObjectFile,
    isec: &InputSection,
    table: &ActionTable,
    rel_idx: usize,
    rel: &Rel,
    sym: &Arc<Symbol>,
) -> Result<()> {
    let action = table[table_row(ctx.link_mode())][table_column(ctx, sym)];
    match action {
        Action::None => {}
        Action::Error => {
            return Err(Error::UnrepresentableRelocation {
                file: file.display_name(),
                section: isec.name.clone(),
                r_type: rel.r_type,
                symbol: sym.name().to_string(),
            });
        }
        Action::Copyrel => {
            sym.add_flags(Needs::COPYREL | Needs::DYNSYM);
        }
        Action::Plt => {
            sym.add_flags(Needs::PLT);
        }
        Action::Dynrel => {
            sym.add_flags(Needs::DYNSYM);
            isec.set_rel_action(rel_idx, RelAction::Dynrel);
            isec.add_dynrel(false);
        }
        Action::Baserel => {
            isec.set_rel_action(rel_idx, RelAction::Baserel);
            isec.add_dynrel(true);
        }
    }
    Ok(())
}

/// Record an undefined-symbol diagnostic and keep scanning
pub fn report_undef(ctx: &Context, file: &ObjectFile, sym: &Symbol) {
    ctx.diags.error(format!(
        "undefined symbol: {}: {}",
        file.display_name(),
        sym.name()
    ));
}

/// Writes dynamic relocations into a section's reserved `.rela.dyn`
/// slice. Each section's slice is disjoint, so application needs no
/// synchronization.
pub struct DynrelWriter<'a> {
    buf: Option<&'a mut [u8]>,
    pos: usize,
    class: Class,
    is_rela: bool,
}

impl<'a> DynrelWriter<'a> {
    /// Wrap a section's reserved slice (or nothing for static links)
    pub fn new(ctx: &Context, buf: Option<&'a mut [u8]>) -> Self {
        Self {
            buf,
            pos: 0,
            class: ctx.machine.class(),
            is_rela: ctx.machine.is_rela(),
        }
    }

    /// Append one dynamic relocation
    pub fn push(&mut self, rel: Rel) {
        let size = self.class.rel_size(self.is_rela);
        if let Some(buf) = self.buf.as_deref_mut() {
            if self.pos + size <= buf.len() {
                rel.write_to(self.class, self.is_rela, &mut buf[self.pos..]);
            }
            self.pos += size;
        }
    }
}

/// Scan every live allocated section, then assign synthetic-section
/// slots for every symbol that accumulated needs bits
pub fn scan_relocations(ctx: &mut Context) -> Result<()> {
    scan_files(ctx)?;
    ctx.diags.checkpoint()?;

    mark_dynamic_symbols(ctx);
    mark_copyrel_aliases(ctx);

    let syms = collect_flagged_symbols(ctx);
    ctx.symbol_aux = vec![SymbolAux::default(); syms.len()];
    assign_slots(ctx, &syms);
    Ok(())
}

fn scan_files(ctx: &mut Context) -> Result<()> {
    let shared: &Context = ctx;
    shared.objs.par_iter().try_for_each(|file| -> Result<()> {
        if !file.is_alive() {
            return Ok(());
        }

        for isec in file.sections.iter().flatten() {
            if !isec.is_alive() || isec.shdr.sh_flags & SHF_ALLOC == 0 || isec.rels.is_empty() {
                continue;
            }
            // Reserve this section's slice of the file's .rela.dyn
            // region; application writes into it without locking.
            isec.reldyn_offset
                .store(file.num_dynrel.load(Ordering::Relaxed), Ordering::Relaxed);
            crate::arch::scan_section(shared, file, isec)?;
            file.num_dynrel
                .fetch_add(isec.num_dynrel.load(Ordering::Relaxed), Ordering::Relaxed);
        }

        // A CIE may reference personality routines; external ones go
        // through the PLT.
        for cie in &file.cies {
            let Some(isec) = file
                .sections
                .get(cie.isec as usize)
                .and_then(Option::as_ref)
            else {
                continue;
            };
            for rel in &isec.rels[cie.rel_begin as usize..cie.rel_end as usize] {
                let Some(sym) = file.symbols.get(rel.r_sym as usize) else {
                    continue;
                };
                if sym.is_imported() {
                    if sym.get_type(shared) != STT_FUNC {
                        return Err(Error::BadRelocationSequence {
                            file: file.display_name(),
                            section: isec.name.clone(),
                            message: format!(
                                "{}: .eh_frame CIE record with an external data reference is not supported",
                                sym.name()
                            ),
                        });
                    }
                    sym.add_flags(Needs::PLT);
                }
            }
        }
        Ok(())
    })
}

fn mark_dynamic_symbols(ctx: &Context) {
    ctx.objs.par_iter().for_each(|file| {
        if !file.is_alive() {
            return;
        }
        let this = FileRef::Obj(file.id);
        for i in file.globals() {
            let sym = &file.symbols[i];
            let wants = {
                let repr = crate::lock(&sym.repr);
                repr.file == Some(this) && (repr.is_imported || repr.is_exported)
            };
            if wants {
                sym.add_flags(Needs::DYNSYM);
            }
        }
    });
}

fn mark_copyrel_aliases(ctx: &Context) {
    ctx.dsos.par_iter().for_each(|file| {
        if !file.is_alive() {
            return;
        }
        for sym in &file.symbols {
            if sym.flags().contains(Needs::COPYREL) {
                for alias in file.find_aliases(sym) {
                    alias.add_flags(Needs::DYNSYM);
                }
            }
        }
    });
}

/// Gather every symbol with a nonzero needs mask, owned-file order first
/// for objects then shared objects, and hand out auxiliary-table slots.
/// The file pre-sort makes the ordering, and therefore the output,
/// deterministic.
fn collect_flagged_symbols(ctx: &Context) -> Vec<Arc<Symbol>> {
    let mut syms: Vec<Arc<Symbol>> = Vec::new();

    let mut visit = |sym: &Arc<Symbol>, owner: FileRef| {
        if sym.flags().is_empty() || sym.aux_idx().is_some() {
            return;
        }
        if crate::lock(&sym.repr).file != Some(owner) {
            return;
        }
        sym.set_aux_idx(syms.len());
        syms.push(Arc::clone(sym));
    };

    for file in &ctx.objs {
        if file.is_alive() {
            for sym in &file.symbols {
                visit(sym, FileRef::Obj(file.id));
            }
        }
    }
    for file in &ctx.dsos {
        if file.is_alive() {
            for sym in &file.symbols {
                visit(sym, FileRef::Dso(file.id));
            }
        }
    }
    syms
}

fn assign_slots(ctx: &mut Context, syms: &[Arc<Symbol>]) {
    for sym in syms {
        let flags = sym.flags();
        let Some(aux_idx) = sym.aux_idx() else {
            continue;
        };

        // Any loader-visible machinery for an imported symbol needs a
        // .dynsym entry for its relocations to name.
        let needs_dynsym = flags.contains(Needs::DYNSYM)
            || (sym.is_imported()
                && flags.intersects(
                    Needs::PLT | Needs::GOT | Needs::GOTTP | Needs::TLSGD | Needs::TLSDESC,
                ));
        if needs_dynsym {
            ctx.dynsym.symbols.push(Arc::clone(sym));
        }

        if flags.contains(Needs::GOT) {
            ctx.symbol_aux[aux_idx].got_idx = ctx.got.add_got(Arc::clone(sym));
        }

        if flags.contains(Needs::PLT) {
            if flags.contains(Needs::GOT) {
                // The symbol already owns a real GOT slot; a .plt.got
                // stub jumps through it and no lazy slot is needed.
                ctx.symbol_aux[aux_idx].pltgot_idx = ctx.pltgot.add(Arc::clone(sym));
            } else {
                let plt_idx = ctx.plt.add(Arc::clone(sym));
                ctx.symbol_aux[aux_idx].plt_idx = plt_idx;
                ctx.symbol_aux[aux_idx].gotplt_idx = 3 + plt_idx;
            }
        }

        if flags.contains(Needs::GOTTP) {
            ctx.symbol_aux[aux_idx].gottp_idx = ctx.got.add_gottp(Arc::clone(sym));
        }
        if flags.contains(Needs::TLSGD) {
            ctx.symbol_aux[aux_idx].tlsgd_idx = ctx.got.add_tlsgd(Arc::clone(sym));
        }
        if flags.contains(Needs::TLSDESC) {
            ctx.symbol_aux[aux_idx].tlsdesc_idx = ctx.got.add_tlsdesc(Arc::clone(sym));
        }
        if flags.contains(Needs::TLSLD) {
            ctx.got.add_tlsld();
        }

        if flags.contains(Needs::COPYREL) {
            add_copyrel(ctx, sym);
        }
    }
}

fn add_copyrel(ctx: &mut Context, sym: &Arc<Symbol>) {
    let (dso_idx, value, size) = {
        let repr = crate::lock(&sym.repr);
        if repr.has_copyrel {
            return;
        }
        let Some(FileRef::Dso(idx)) = repr.file else {
            return;
        };
        let Some(esym) = ctx.dsos[idx as usize].elf_syms.get(repr.sym_idx as usize) else {
            return;
        };
        (idx as usize, esym.st_value, esym.st_size)
    };

    let readonly = ctx.dsos[dso_idx].is_readonly(value);
    let sect = if readonly {
        &mut ctx.dynbss_relro
    } else {
        &mut ctx.dynbss
    };

    // The DSO does not tell us the definition's alignment; 64 covers
    // every type the psABIs define.
    let offset = crate::align_to(sect.hdr.sh_size, 64);
    sect.hdr.sh_size = offset + size;
    sect.symbols.push(Arc::clone(sym));

    {
        let mut repr = crate::lock(&sym.repr);
        repr.has_copyrel = true;
        repr.value = offset;
        repr.copyrel_readonly = readonly;
    }

    for alias in ctx.dsos[dso_idx].find_aliases(sym) {
        let mut repr = crate::lock(&alias.repr);
        repr.has_copyrel = true;
        repr.value = offset;
        repr.copyrel_readonly = readonly;
    }
}
