//! Section garbage collection (--gc-sections)
//!
//! A mark-and-sweep over the section graph: vertices are input sections,
//! edges are relocations. Anything reachable from a root stays; the rest
//! is killed before binning so it neither occupies space nor keeps
//! symbols alive. Only allocated sections are candidates; debug sections
//! survive regardless.

use rayon::prelude::*;

use crate::context::Context;
use crate::elf::{
    SHF_ALLOC, SHT_FINI_ARRAY, SHT_INIT_ARRAY, SHT_NOTE, SHT_PREINIT_ARRAY,
};
use crate::input::section::InputSection;
use crate::input::{FileRef, SectionId};
use crate::symbol::Origin;

fn is_init_fini(isec: &InputSection) -> bool {
    matches!(
        isec.shdr.sh_type,
        SHT_INIT_ARRAY | SHT_FINI_ARRAY | SHT_PREINIT_ARRAY
    ) || isec.name.starts_with(".ctors")
        || isec.name.starts_with(".dtors")
        || isec.name.starts_with(".init")
        || isec.name.starts_with(".fini")
}

fn mark(ctx: &Context, sid: SectionId) -> Option<SectionId> {
    let isec = ctx.isec(sid)?;
    if isec.is_alive() && isec.mark_visited() {
        Some(sid)
    } else {
        None
    }
}

fn symbol_target(ctx: &Context, sym: &crate::symbol::Symbol) -> Option<SectionId> {
    let repr = crate::lock(&sym.repr);
    match &repr.origin {
        Origin::Fragment(frag) => {
            frag.mark_alive();
            None
        }
        Origin::Section(sid) => Some(*sid),
        Origin::None => None,
    }
}

/// Follow every outgoing edge of one live section
fn visit(ctx: &Context, sid: SectionId, found: &mut Vec<SectionId>) {
    let Some(isec) = ctx.isec(sid) else { return };
    let file = &ctx.objs[sid.file as usize];

    // A relocation can point at a merged fragment instead of a section;
    // fragments are marked directly.
    for fref in &isec.rel_fragments {
        fref.frag.mark_alive();
    }

    // Keep the .eh_frame records covering this code, and whatever those
    // records reference (LSDAs, personality data).
    if isec.fde_begin != crate::symbol::NONE_IDX {
        for fde in &file.fdes[isec.fde_begin as usize..isec.fde_end as usize] {
            let Some(frame_sec) = file
                .sections
                .get(fde.isec as usize)
                .and_then(Option::as_ref)
            else {
                continue;
            };
            for rel in &frame_sec.rels[fde.rel_begin as usize + 1..fde.rel_end as usize] {
                let Some(sym) = file.symbols.get(rel.r_sym as usize) else {
                    continue;
                };
                if let Some(target) = symbol_target(ctx, sym) {
                    if let Some(next) = mark(ctx, target) {
                        found.push(next);
                    }
                }
            }
        }
    }

    for rel in &isec.rels {
        let Some(sym) = file.symbols.get(rel.r_sym as usize) else {
            continue;
        };
        if let Some(target) = symbol_target(ctx, sym) {
            if let Some(next) = mark(ctx, target) {
                found.push(next);
            }
        }
    }
}

fn collect_root_set(ctx: &Context) -> Vec<SectionId> {
    let mut roots: Vec<SectionId> = Vec::new();

    for file in &ctx.objs {
        if !file.is_alive() {
            continue;
        }
        for isec in file.sections.iter().flatten() {
            if !isec.is_alive() {
                continue;
            }
            let sid = SectionId {
                file: isec.file,
                index: isec.index,
            };

            // Only allocated sections are subject to collection.
            if isec.shdr.sh_flags & SHF_ALLOC == 0 {
                isec.mark_visited();
                continue;
            }
            if is_init_fini(isec) || isec.shdr.sh_type == SHT_NOTE {
                if let Some(sid) = mark(ctx, sid) {
                    roots.push(sid);
                }
            }
        }

        // Exported symbols anchor their sections.
        for i in file.globals() {
            let sym = &file.symbols[i];
            let keep = {
                let repr = crate::lock(&sym.repr);
                repr.file == Some(FileRef::Obj(file.id)) && repr.is_exported
            };
            if keep {
                if let Some(target) = symbol_target(ctx, sym) {
                    if let Some(sid) = mark(ctx, target) {
                        roots.push(sid);
                    }
                }
            }
        }

        // CIE records and everything they reference stay; they are a
        // unit of inclusion with their FDEs.
        for cie in &file.cies {
            let Some(frame_sec) = file
                .sections
                .get(cie.isec as usize)
                .and_then(Option::as_ref)
            else {
                continue;
            };
            for rel in &frame_sec.rels[cie.rel_begin as usize..cie.rel_end as usize] {
                if let Some(sym) = file.symbols.get(rel.r_sym as usize) {
                    if let Some(target) = symbol_target(ctx, sym) {
                        if let Some(sid) = mark(ctx, target) {
                            roots.push(sid);
                        }
                    }
                }
            }
        }
    }

    // The entry symbol and every --undefined name are roots.
    for name in ctx
        .options
        .undefined
        .iter()
        .chain(std::iter::once(&ctx.options.entry))
    {
        if let Some(sym) = ctx.get_symbol(name) {
            if let Some(target) = symbol_target(ctx, &sym) {
                if let Some(sid) = mark(ctx, target) {
                    roots.push(sid);
                }
            }
        }
    }

    roots
}

fn mark_nonalloc_fragments(ctx: &Context) {
    ctx.objs.par_iter().for_each(|file| {
        for frag in &file.fragments {
            if ctx.merged_registry.entry_flags(frag.parent) & SHF_ALLOC == 0 {
                frag.mark_alive();
            }
        }
    });
}

fn sweep(ctx: &Context) {
    ctx.objs.par_iter().for_each(|file| {
        if !file.is_alive() {
            return;
        }
        for isec in file.sections.iter().flatten() {
            if isec.is_alive() && !isec.is_visited() {
                if ctx.options.print_gc_sections {
                    log::info!("removing unused section {}", isec.display(ctx));
                }
                isec.kill();
            }
        }
    });
}

/// Mark all sections reachable from the roots, then kill the rest
pub fn gc_sections(ctx: &mut Context) {
    let shared: &Context = ctx;
    mark_nonalloc_fragments(shared);

    let mut frontier = collect_root_set(shared);
    while !frontier.is_empty() {
        frontier = frontier
            .par_iter()
            .flat_map_iter(|&sid| {
                let mut found = Vec::new();
                visit(shared, sid, &mut found);
                found
            })
            .collect();
    }

    sweep(shared);
}
