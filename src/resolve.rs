//! Symbol resolution
//!
//! Resolution decides, for every referenced name, which file's
//! definition wins. The protocol runs in four phases, each parallel over
//! files: lazy registration of archive members, regular registration of
//! command-line objects, a reachability walk that pulls referenced
//! archive members into the link, and a shared-object overlay for
//! whatever is still undefined. Every phase is order-independent because
//! candidates are totally ordered by a rank, and rank comparisons happen
//! under the contested symbol's own lock.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use rayon::prelude::*;

use crate::context::Context;
use crate::elf::{Shdr, Sym, SHF_ALLOC, SHF_WRITE, SHT_NOBITS, STB_WEAK, STV_HIDDEN};
use crate::error::Result;
use crate::input::object::ObjectFile;
use crate::input::section::InputSection;
use crate::input::{FileRef, SectionId};
use crate::symbol::{Origin, Symbol, SymbolRepr};

// Rank classes, lower wins. Ties break on file priority.
const RANK_STRONG: u64 = 1 << 24;
const RANK_COMMON: u64 = 2 << 24;
const RANK_WEAK: u64 = 3 << 24;
const RANK_LAZY: u64 = 4 << 24;
const RANK_UNCLAIMED: u64 = 5 << 24;

fn candidate_rank(priority: u32, esym: &Sym) -> u64 {
    if esym.bind() == STB_WEAK {
        RANK_WEAK + u64::from(priority)
    } else if esym.is_common() {
        RANK_COMMON + u64::from(priority)
    } else {
        RANK_STRONG + u64::from(priority)
    }
}

fn current_rank(ctx: &Context, repr: &SymbolRepr) -> u64 {
    let Some(file) = repr.file else {
        return RANK_UNCLAIMED;
    };
    let priority = ctx.file_priority(file);
    if repr.is_lazy {
        return RANK_LAZY + u64::from(priority);
    }
    match file {
        FileRef::Obj(idx) => match ctx.objs[idx as usize].elf_syms.get(repr.sym_idx as usize) {
            Some(esym) => candidate_rank(priority, esym),
            None => RANK_STRONG + u64::from(priority),
        },
        // A DSO definition ranks like a weak one.
        FileRef::Dso(_) => RANK_WEAK + u64::from(priority),
    }
}

fn current_common_size(ctx: &Context, repr: &SymbolRepr) -> Option<u64> {
    let Some(FileRef::Obj(idx)) = repr.file else {
        return None;
    };
    if repr.is_lazy {
        return None;
    }
    ctx.objs[idx as usize]
        .elf_syms
        .get(repr.sym_idx as usize)
        .filter(|esym| esym.is_common())
        .map(|esym| esym.st_size)
}

/// Install `file`'s definition of symbol `i` if it outranks the current
/// owner. Tentative (common) definitions compete on size first so the
/// most demanding declaration provides the storage.
fn maybe_override_symbol(ctx: &Context, file: &ObjectFile, i: usize, sym: &Arc<Symbol>) {
    let esym = file.elf_syms[i];
    let section = file.section_idx_of(&esym, i);
    let new_rank = candidate_rank(file.priority, &esym);

    let mut repr = crate::lock(&sym.repr);

    let wins = if esym.is_common() {
        match current_common_size(ctx, &repr) {
            Some(cur_size) => {
                esym.st_size > cur_size
                    || (esym.st_size == cur_size && new_rank < current_rank(ctx, &repr))
            }
            None => new_rank < current_rank(ctx, &repr),
        }
    } else {
        new_rank < current_rank(ctx, &repr)
    };

    if !wins {
        return;
    }

    repr.file = Some(FileRef::Obj(file.id));
    repr.sym_idx = i as u32;
    repr.value = esym.st_value;
    repr.origin = match section {
        Some(idx) => Origin::Section(SectionId {
            file: file.id,
            index: idx as u32,
        }),
        None => Origin::None,
    };
    repr.ver_idx = ctx.options.default_version;
    repr.is_lazy = false;
    repr.is_weak = esym.bind() == STB_WEAK;
    repr.is_imported = false;
    repr.is_exported = false;

    if sym.traced.load(Ordering::Relaxed) {
        let kind = if esym.bind() == STB_WEAK {
            "weak definition"
        } else {
            "definition"
        };
        log::info!(
            "trace-symbol: {}: {} of {}",
            file.display_name(),
            kind,
            sym.name()
        );
    }
}

fn merge_file_visibility(file: &ObjectFile, i: usize, sym: &Symbol) {
    let esym = file.elf_syms[i];
    let visibility = if file.exclude_libs {
        STV_HIDDEN
    } else {
        esym.visibility()
    };
    sym.merge_visibility(visibility);
}

/// Run the four resolution phases, retire symbols of unreferenced
/// archive members and DSOs, and claim leftovers for dynamic binding.
pub fn resolve_symbols(ctx: &mut Context) -> Result<()> {
    apply_exclude_libs(ctx);

    let shared: &Context = ctx;

    // Phase A: archive members advertise lazy definitions.
    shared.objs.par_iter().for_each(|file| {
        if !file.is_in_lib {
            return;
        }
        for i in file.globals() {
            let esym = file.elf_syms[i];
            if !esym.is_defined() {
                continue;
            }
            let sym = &file.symbols[i];
            let mut repr = crate::lock(&sym.repr);
            let current_priority = repr
                .file
                .map(|f| shared.file_priority(f))
                .unwrap_or(u32::MAX);
            if repr.file.is_none() || (repr.is_lazy && file.priority < current_priority) {
                repr.file = Some(FileRef::Obj(file.id));
                repr.sym_idx = i as u32;
                repr.is_lazy = true;
                if sym.traced.load(Ordering::Relaxed) {
                    log::info!(
                        "trace-symbol: {}: lazy definition of {}",
                        file.display_name(),
                        sym.name()
                    );
                }
            }
        }
    });

    // Phase B: command-line objects register their definitions.
    shared.objs.par_iter().for_each(|file| {
        if file.is_in_lib {
            return;
        }
        for i in file.globals() {
            let sym = &file.symbols[i];
            merge_file_visibility(file, i, sym);
            if file.elf_syms[i].is_defined() {
                maybe_override_symbol(shared, file, i, sym);
            }
        }
    });

    // Phase C: walk references, pulling archive members in.
    let mut frontier: Vec<u32> = Vec::new();
    for file in shared.objs.iter() {
        if file.is_alive() {
            frontier.push(file.id);
        }
    }
    for name in shared
        .options
        .undefined
        .iter()
        .chain(std::iter::once(&shared.options.entry))
    {
        if let Some(sym) = shared.get_symbol(name) {
            if let Some(FileRef::Obj(idx)) = crate::lock(&sym.repr).file {
                if shared.objs[idx as usize].set_alive() {
                    frontier.push(idx);
                }
            }
        }
    }

    while !frontier.is_empty() {
        frontier = frontier
            .par_iter()
            .flat_map_iter(|&fid| {
                let file = &shared.objs[fid as usize];
                let mut found = Vec::new();
                mark_live_objects(shared, file, &mut found);
                found
            })
            .collect();
    }

    // Unreferenced archive members drop out; their registrations go
    // with them.
    shared.objs.par_iter().for_each(|file| {
        if file.is_alive() {
            return;
        }
        let this = FileRef::Obj(file.id);
        for i in file.globals() {
            let sym = &file.symbols[i];
            if crate::lock(&sym.repr).file == Some(this) {
                sym.clear();
            }
        }
    });

    // Phase D: shared objects claim whatever is still open.
    shared.dsos.par_iter().for_each(|file| {
        for (i, esym) in file.elf_syms.iter().enumerate() {
            let sym = &file.symbols[i];
            let mut repr = crate::lock(&sym.repr);
            let current_priority = repr
                .file
                .map(|f| shared.file_priority(f))
                .unwrap_or(u32::MAX);
            let unclaimed = repr.file.is_none() || repr.is_lazy;
            if unclaimed || file.priority < current_priority {
                repr.file = Some(FileRef::Dso(file.id));
                repr.sym_idx = i as u32;
                repr.value = esym.st_value;
                repr.origin = Origin::None;
                repr.ver_idx = file.versyms.get(i).copied().unwrap_or(0);
                repr.is_lazy = false;
                repr.is_weak = true;
                repr.is_imported = true;
                repr.is_exported = false;

                if sym.traced.load(Ordering::Relaxed) {
                    log::info!(
                        "trace-symbol: {}: definition of {}",
                        file.name,
                        sym.name()
                    );
                }
            }
        }
    });

    // Under --as-needed only DSOs something actually references
    // survive as dependencies.
    if shared.options.as_needed {
        shared.dsos.par_iter().for_each(|file| file.kill());
    }
    shared.objs.par_iter().for_each(|file| {
        if !file.is_alive() {
            return;
        }
        for i in file.globals() {
            if file.elf_syms[i].is_defined() {
                continue;
            }
            let sym = &file.symbols[i];
            let mut repr = crate::lock(&sym.repr);
            if let Some(FileRef::Dso(idx)) = repr.file {
                shared.dsos[idx as usize].set_alive();
                if file.elf_syms[i].bind() != STB_WEAK {
                    repr.is_weak = false;
                }
            }
        }
    });
    shared.dsos.par_iter().for_each(|file| {
        if file.is_alive() {
            return;
        }
        let this = FileRef::Dso(file.id);
        for sym in &file.symbols {
            if crate::lock(&sym.repr).file == Some(this) {
                sym.clear();
            }
        }
    });

    // A shared object may legitimately leave references open for its
    // eventual executable; claim them as imports. Executables report
    // theirs when the scanner visits the referencing relocation.
    if shared.is_shared() {
        shared.objs.par_iter().for_each(|file| {
            if !file.is_alive() {
                return;
            }
            for i in file.globals() {
                if file.elf_syms[i].is_defined() {
                    continue;
                }
                let sym = &file.symbols[i];
                let mut repr = crate::lock(&sym.repr);
                if repr.file.is_none() {
                    repr.file = Some(FileRef::Obj(file.id));
                    repr.sym_idx = i as u32;
                    repr.value = 0;
                    repr.origin = Origin::None;
                    repr.is_imported = true;
                    repr.is_exported = false;
                }
            }
        });
    }

    Ok(())
}

fn mark_live_objects(ctx: &Context, file: &ObjectFile, found: &mut Vec<u32>) {
    debug_assert!(file.is_alive());

    for i in file.globals() {
        let esym = file.elf_syms[i];
        let sym = &file.symbols[i];
        merge_file_visibility(file, i, sym);

        if esym.is_defined() {
            if file.is_in_lib {
                maybe_override_symbol(ctx, file, i, sym);
            }
            continue;
        }

        if sym.traced.load(Ordering::Relaxed) {
            let kind = if esym.bind() == STB_WEAK {
                "weak reference"
            } else {
                "reference"
            };
            log::info!(
                "trace-symbol: {}: {} to {}",
                file.display_name(),
                kind,
                sym.name()
            );
        }

        if esym.bind() == STB_WEAK {
            continue;
        }
        if let Some(FileRef::Obj(owner)) = crate::lock(&sym.repr).file {
            if ctx.objs[owner as usize].set_alive() {
                found.push(owner);
            }
        }
    }
}

fn apply_exclude_libs(ctx: &mut Context) {
    if ctx.options.exclude_libs.is_empty() {
        return;
    }
    let all = ctx.options.exclude_libs.iter().any(|l| l == "ALL");
    let list = ctx.options.exclude_libs.clone();
    for file in ctx.objs.iter_mut() {
        if file.archive_name.is_empty() {
            continue;
        }
        let base = file
            .archive_name
            .rsplit('/')
            .next()
            .unwrap_or(&file.archive_name)
            .to_string();
        if all || list.contains(&file.archive_name) || list.contains(&base) {
            file.exclude_libs = true;
        }
    }
}

/// Arbitrate comdat groups and retire the losers' member sections
pub fn eliminate_comdats(ctx: &mut Context) {
    ctx.objs.par_iter().for_each(|file| {
        if !file.is_alive() {
            return;
        }
        for (group, _) in &file.comdat_groups {
            group.claim(file.priority);
        }
    });

    ctx.objs.par_iter().for_each(|file| {
        if !file.is_alive() {
            return;
        }
        for (group, members) in &file.comdat_groups {
            if group.owner() == file.priority {
                continue;
            }
            for &idx in members {
                if let Some(isec) = file.sections.get(idx as usize).and_then(Option::as_ref) {
                    isec.kill();
                }
            }
        }
    });
}

/// Give every winning COMMON symbol backing storage in a synthetic
/// `.common` NOBITS section of its owning file
pub fn convert_common_symbols(ctx: &mut Context) {
    let registry = &ctx.osec_registry;
    let warn_common = ctx.options.warn_common;
    let diags = &ctx.diags;
    let objs = &mut ctx.objs;

    objs.par_iter_mut().for_each(|file| {
        if !file.is_alive() || !file.has_common {
            return;
        }
        let this = FileRef::Obj(file.id);

        for i in file.first_global..file.elf_syms.len() {
            let esym = file.elf_syms[i];
            if !esym.is_common() {
                continue;
            }
            let sym = Arc::clone(&file.symbols[i]);

            {
                let repr = crate::lock(&sym.repr);
                if repr.file != Some(this) || repr.sym_idx != i as u32 {
                    if warn_common {
                        diags.warn(format!(
                            "{}: multiple common symbols: {}",
                            file.display_name(),
                            sym.name()
                        ));
                    }
                    continue;
                }
            }

            // st_value of a common symbol is its alignment request.
            let shdr = Shdr {
                sh_type: SHT_NOBITS,
                sh_flags: SHF_ALLOC | SHF_WRITE,
                sh_size: esym.st_size,
                sh_addralign: esym.st_value.max(1),
                ..Shdr::default()
            };
            let index = file.sections.len() as u32;
            let mut isec =
                InputSection::new(file.id, index, ".common".to_string(), shdr, Box::new([]));
            isec.osec = registry.get_or_create(".common", SHT_NOBITS, SHF_ALLOC | SHF_WRITE);
            file.sections.push(Some(isec));

            let mut repr = crate::lock(&sym.repr);
            repr.origin = Origin::Section(SectionId {
                file: file.id,
                index,
            });
            repr.value = 0;
        }
    });
}

/// Give every surviving undefined weak reference an owner so downstream
/// passes can assume one exists
pub fn convert_undefined_weak_symbols(ctx: &mut Context) {
    let shared: &Context = ctx;
    shared.objs.par_iter().for_each(|file| {
        if !file.is_alive() {
            return;
        }
        let this = FileRef::Obj(file.id);

        for i in file.globals() {
            let esym = file.elf_syms[i];
            if !esym.is_undef() || esym.bind() != STB_WEAK {
                continue;
            }

            let sym = &file.symbols[i];
            let mut repr = crate::lock(&sym.repr);

            let is_new = repr.file.is_none();
            let tie_but_higher_priority = !is_new
                && matches!(repr.file, Some(FileRef::Obj(owner))
                    if shared.objs[owner as usize].elf_syms
                        .get(repr.sym_idx as usize)
                        .map(Sym::is_undef_weak)
                        .unwrap_or(false)
                        && file.priority < shared.objs[owner as usize].priority);

            if is_new || tie_but_higher_priority {
                repr.file = Some(this);
                repr.origin = Origin::None;
                repr.value = 0;
                repr.sym_idx = i as u32;
                repr.ver_idx = shared.options.default_version;
                repr.is_lazy = false;
                if shared.is_shared() {
                    repr.is_imported = true;
                }

                if sym.traced.load(Ordering::Relaxed) {
                    log::info!(
                        "trace-symbol: {}: unresolved weak symbol {}",
                        file.display_name(),
                        sym.name()
                    );
                }
            }
        }
    });
}

/// Report every pair of conflicting strong definitions
pub fn check_duplicate_symbols(ctx: &mut Context) -> Result<()> {
    let shared: &Context = ctx;
    shared.objs.par_iter().for_each(|file| {
        if !file.is_alive() {
            return;
        }
        let this = FileRef::Obj(file.id);

        for i in file.globals() {
            let esym = file.elf_syms[i];
            let sym = &file.symbols[i];

            if !esym.is_defined() || esym.is_common() || esym.bind() == STB_WEAK {
                continue;
            }

            // A definition in a comdat-eliminated section never
            // conflicts.
            let eliminated = file
                .section_idx_of(&esym, i)
                .and_then(|idx| file.sections.get(idx).and_then(Option::as_ref))
                .map(|isec| !isec.is_alive())
                .unwrap_or(false);
            if eliminated {
                continue;
            }

            let owner = crate::lock(&sym.repr).file;
            if owner != Some(this) {
                let other = owner
                    .map(|f| shared.file_name(f))
                    .unwrap_or_else(|| "?".to_string());
                shared.diags.error(format!(
                    "duplicate symbol: {}: {}: {}",
                    file.display_name(),
                    other,
                    sym.name()
                ));
            }
        }
    });

    ctx.diags.checkpoint()
}

/// Decide which globals are exported to, or imported from, the dynamic
/// symbol table
pub fn compute_import_export(ctx: &mut Context) {
    let shared: &Context = ctx;

    // Symbols a DSO needs from us must be exported.
    if !shared.is_shared() {
        shared.dsos.par_iter().for_each(|file| {
            if !file.is_alive() {
                return;
            }
            for sym in &file.undefs {
                let mut repr = crate::lock(&sym.repr);
                let defined_here = matches!(repr.file, Some(FileRef::Obj(_)));
                if defined_here && sym.visibility() != STV_HIDDEN {
                    repr.is_exported = true;
                }
            }
        });
    }

    // A DSO exports its globals by default; so does --export-dynamic.
    if shared.is_shared() || shared.options.export_dynamic {
        shared.objs.par_iter().for_each(|file| {
            if !file.is_alive() {
                return;
            }
            let this = FileRef::Obj(file.id);
            for i in file.globals() {
                let sym = &file.symbols[i];
                let mut repr = crate::lock(&sym.repr);
                if repr.file != Some(this) {
                    continue;
                }
                if sym.visibility() == STV_HIDDEN || repr.ver_idx == crate::elf::VER_NDX_LOCAL {
                    continue;
                }
                repr.is_exported = true;

                // Unless symbolic binding pins them, exported DSO
                // definitions stay interposable.
                if shared.is_shared()
                    && sym.visibility() != crate::elf::STV_PROTECTED
                    && !shared.options.bsymbolic
                    && !(shared.options.bsymbolic_functions
                        && file.elf_syms[i].typ() == crate::elf::STT_FUNC)
                {
                    repr.is_imported = true;
                }
            }
        });
    }
}

/// Map `name@version` suffixes onto the version indices this link
/// defines
pub fn parse_symbol_versions(ctx: &mut Context) -> Result<()> {
    let mut verdefs = rustc_hash::FxHashMap::default();
    for (i, name) in ctx.options.version_definitions.iter().enumerate() {
        verdefs.insert(
            name.clone(),
            crate::elf::VER_NDX_LAST_RESERVED + 1 + i as u16,
        );
    }

    let shared: &Context = ctx;
    shared.objs.par_iter().for_each(|file| {
        if !file.is_alive() {
            return;
        }
        let this = FileRef::Obj(file.id);

        for (rel_idx, ver) in file.symvers.iter().enumerate() {
            let Some(ver) = ver else { continue };
            let i = file.first_global + rel_idx;
            let sym = &file.symbols[i];
            let mut repr = crate::lock(&sym.repr);
            if repr.file != Some(this) {
                continue;
            }

            let (is_default, name) = match ver.strip_prefix('@') {
                Some(rest) => (true, rest),
                None => (false, ver.as_str()),
            };

            match verdefs.get(name) {
                Some(&idx) => {
                    repr.ver_idx = idx;
                    if !is_default {
                        repr.ver_idx |= crate::elf::VERSYM_HIDDEN;
                    }
                }
                None => {
                    shared.diags.error(format!(
                        "{}: symbol {} has undefined version {}",
                        file.display_name(),
                        sym.name_without_version(),
                        name
                    ));
                }
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_candidate_rank_ordering() {
        let strong = Sym {
            st_info: Sym::info(crate::elf::STB_GLOBAL, 0),
            st_shndx: 1,
            ..Sym::default()
        };
        let weak = Sym {
            st_info: Sym::info(STB_WEAK, 0),
            st_shndx: 1,
            ..Sym::default()
        };
        let common = Sym {
            st_info: Sym::info(crate::elf::STB_GLOBAL, 0),
            st_shndx: crate::elf::SHN_COMMON,
            ..Sym::default()
        };

        // Strong beats common beats weak, regardless of priority.
        assert!(candidate_rank(100, &strong) < candidate_rank(2, &common));
        assert!(candidate_rank(100, &common) < candidate_rank(2, &weak));
        // Within a class, the lower-priority file wins.
        assert!(candidate_rank(2, &strong) < candidate_rank(3, &strong));
        // Everything beats lazy and unclaimed.
        assert!(candidate_rank(u32::MAX, &weak) < RANK_LAZY);
        assert!(RANK_LAZY < RANK_UNCLAIMED);
    }
}
