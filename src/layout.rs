//! Image layout
//!
//! After scanning, every chunk's size is computable; this module decides
//! what the image contains and where. Chunks are ordered by kind (the
//! header pair first, then read-only, executable, TLS, RELRO, writable
//! data, BSS, non-allocated tails), addresses honor page alignment and
//! the PT_LOAD congruence rule, and the program header table is derived
//! from the final order. Linker-provided marker symbols are bound to
//! their chunks at the end.

use std::sync::Arc;

use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::chunks::synthetic::{FrameRef, HashSection};
use crate::chunks::ChunkId;
use crate::context::Context;
use crate::elf::{
    self, Phdr, PF_R, PF_W, PF_X, PT_DYNAMIC, PT_GNU_EH_FRAME, PT_GNU_RELRO, PT_GNU_STACK,
    PT_INTERP, PT_LOAD, PT_NOTE, PT_PHDR, PT_TLS, SHF_ALLOC, SHF_EXECINSTR, SHF_TLS, SHF_WRITE,
    SHT_FINI_ARRAY, SHT_INIT_ARRAY, SHT_NOBITS, SHT_NOTE, SHT_PREINIT_ARRAY, VERSYM_HIDDEN,
    VER_NDX_LAST_RESERVED,
};
use crate::error::Result;
use crate::input::FileRef;
use crate::symbol::Origin;

/// Compute sizes, choose and order the image's chunks, assign addresses
/// and file offsets, build the program headers and bind the marker
/// symbols
pub fn assign_output_layout(ctx: &mut Context) -> Result<()> {
    construct_ehframe(ctx);

    if ctx.is_dynamic() {
        seed_dynstr(ctx);
        crate::chunks::synthetic::finalize_dynsym(ctx);
        fill_verdef(ctx);
        fill_verneed(ctx);
        ctx.dynstr.hdr.sh_size = ctx.dynstr.content.len() as u64;
    }

    compute_symtab(ctx);
    assign_reldyn_offsets(ctx);
    // Membership first: the .dynamic entry count depends on which
    // chunks exist, and sorting only reads names, types and flags.
    build_chunk_list(ctx);
    update_chunk_sizes(ctx);
    assign_section_indices(ctx);

    // The program header count feeds its own chunk size, which shifts
    // every offset; the segmentation itself depends only on chunk order
    // and flags, so one dry run fixes the count.
    ctx.phdr.phdrs = create_phdrs(ctx);
    ctx.phdr.hdr.sh_size = (ctx.phdr.phdrs.len() * ctx.machine.class().phdr_size()) as u64;

    set_osec_offsets(ctx);
    ctx.phdr.phdrs = create_phdrs(ctx);
    set_tls_bounds(ctx);
    fix_synthetic_symbols(ctx);

    // Rebuild .dynamic now that every referenced address is final; the
    // entry set, and so the size, is unchanged.
    if ctx.is_dynamic() {
        ctx.dynamic.entries = dynamic_entries(ctx);
    }
    Ok(())
}

fn seed_dynstr(ctx: &mut Context) {
    let sonames: Vec<String> = ctx
        .dsos
        .iter()
        .filter(|d| d.is_alive())
        .map(|d| d.soname.clone())
        .collect();
    for soname in sonames {
        ctx.dynstr.add(&soname);
    }
    if let Some(soname) = ctx.options.soname.clone() {
        ctx.dynstr.add(&soname);
    }
    if !ctx.options.rpaths.is_empty() {
        let joined = ctx.options.rpaths.join(":");
        ctx.dynstr.add(&joined);
    }
}

/// Reserve each file's region of .rela.dyn: GOT-emitted relocations
/// first, then copy relocations, then the per-file scanning
/// reservations.
fn assign_reldyn_offsets(ctx: &mut Context) {
    let (got_relative, got_irelative, got_symbolic) = ctx.got.count_dynrels(ctx);
    let copyrels = (ctx.dynbss.symbols.len() + ctx.dynbss_relro.symbols.len()) as u64;

    let mut count = got_relative + got_irelative + got_symbolic + copyrels;
    for i in 0..ctx.objs.len() {
        if !ctx.objs[i].is_alive() {
            continue;
        }
        ctx.objs[i].reldyn_offset = count;
        count += ctx.objs[i]
            .num_dynrel
            .load(std::sync::atomic::Ordering::Relaxed);
    }

    let entsize = ctx
        .machine
        .class()
        .rel_size(ctx.machine.is_rela()) as u64;
    ctx.reldyn.hdr.sh_size = count * entsize;
    ctx.reldyn.hdr.sh_entsize = entsize;

    let section_baserels: u64 = ctx
        .objs
        .iter()
        .filter(|f| f.is_alive())
        .flat_map(|f| f.sections.iter().flatten())
        .map(|isec| isec.num_baserel.load(std::sync::atomic::Ordering::Relaxed))
        .sum();
    ctx.reldyn.relcount = got_relative + section_baserels;
    ctx.reldyn.irelcount = got_irelative;
}

fn update_chunk_sizes(ctx: &mut Context) {
    let class = ctx.machine.class();
    let word = ctx.machine.word_size() as u64;
    let relsize = class.rel_size(ctx.machine.is_rela()) as u64;

    ctx.ehdr.hdr.sh_size = class.ehdr_size() as u64;

    ctx.got.hdr.sh_size = u64::from(ctx.got.num_slots()) * word;
    ctx.got.hdr.sh_entsize = word;
    ctx.gotplt.hdr.sh_size = (3 + ctx.plt.symbols.len() as u64) * word;
    ctx.gotplt.hdr.sh_entsize = word;

    if !ctx.plt.symbols.is_empty() {
        ctx.plt.hdr.sh_size = (ctx.machine.plt_header_size()
            + ctx.plt.symbols.len() * ctx.machine.plt_entry_size())
            as u64;
    }
    ctx.pltgot.hdr.sh_size =
        (ctx.pltgot.symbols.len() * ctx.machine.pltgot_entry_size()) as u64;

    ctx.relplt.hdr.sh_size = ctx.plt.symbols.len() as u64 * relsize;
    ctx.relplt.hdr.sh_entsize = relsize;

    if ctx.is_dynamic() {
        ctx.hash.hdr.sh_size = HashSection::size_for(ctx.dynsym.count());
        ctx.hash.hdr.sh_entsize = 4;
        let num_hashed = ctx.dynsym.count() - ctx.dynsym.first_hashed as usize;
        ctx.gnuhash.hdr.sh_size = ctx.gnuhash.size(ctx, num_hashed);

        ctx.versym.hdr.sh_size = (ctx.versym.contents.len() * 2) as u64;
        ctx.verneed.hdr.sh_size = ctx.verneed.contents.len() as u64;
        ctx.verdef.hdr.sh_size = ctx.verdef.contents.len() as u64;

        ctx.dynamic.entries = dynamic_entries(ctx);
        ctx.dynamic.hdr.sh_size = (ctx.dynamic.entries.len() * class.dyn_size()) as u64;
        ctx.dynamic.hdr.sh_entsize = class.dyn_size() as u64;
    }

    if let Some(path) = &ctx.options.dynamic_linker {
        ctx.interp.hdr.sh_size = path.len() as u64 + 1;
    }
    if ctx.options.build_id != crate::context::BuildIdKind::None {
        if let crate::context::BuildIdKind::Hex(bytes) = &ctx.options.build_id {
            ctx.buildid.desc_size = bytes.len();
        }
        ctx.buildid.hdr.sh_size = ctx.buildid.size();
    }

    if ctx.options.eh_frame_hdr && ctx.ehframe.hdr.sh_size > 0 {
        ctx.ehframehdr.hdr.sh_size =
            (crate::chunks::synthetic::EhFrameHdrSection::HEADER_SIZE
                + 8 * ctx.ehframe.fdes.len()) as u64;
    }
}

fn build_chunk_list(ctx: &mut Context) {
    let mut chunks: Vec<ChunkId> = vec![ChunkId::Ehdr, ChunkId::Phdr];

    for osec in &ctx.output_sections {
        if !osec.members.is_empty() {
            chunks.push(ChunkId::Osec(osec.idx));
        }
    }
    for (i, merged) in ctx.merged_sections.iter().enumerate() {
        if merged.hdr.sh_size > 0 {
            chunks.push(ChunkId::Merged(i as u32));
        }
    }

    if ctx.options.dynamic_linker.is_some() {
        chunks.push(ChunkId::Interp);
    }
    if ctx.options.build_id != crate::context::BuildIdKind::None {
        chunks.push(ChunkId::BuildId);
    }
    if ctx.got.num_slots() > 0 {
        chunks.push(ChunkId::Got);
    }
    if ctx.is_dynamic() || !ctx.plt.symbols.is_empty() {
        chunks.push(ChunkId::GotPlt);
    }
    if !ctx.plt.symbols.is_empty() {
        chunks.push(ChunkId::Plt);
        if ctx.is_dynamic() {
            chunks.push(ChunkId::RelPlt);
        }
    }
    if !ctx.pltgot.symbols.is_empty() {
        chunks.push(ChunkId::PltGot);
    }
    if ctx.is_dynamic() {
        chunks.push(ChunkId::RelDyn);
        chunks.push(ChunkId::Dynsym);
        chunks.push(ChunkId::Dynstr);
        chunks.push(ChunkId::Dynamic);
        if ctx.options.hash_style_sysv {
            chunks.push(ChunkId::Hash);
        }
        if ctx.options.hash_style_gnu {
            chunks.push(ChunkId::GnuHash);
        }
        if !ctx.versym.contents.is_empty() {
            chunks.push(ChunkId::Versym);
        }
        if !ctx.verneed.contents.is_empty() {
            chunks.push(ChunkId::Verneed);
        }
        if !ctx.verdef.contents.is_empty() {
            chunks.push(ChunkId::Verdef);
        }
    }
    if !ctx.ehframe.cies.is_empty() || !ctx.ehframe.fdes.is_empty() {
        chunks.push(ChunkId::EhFrame);
        if ctx.options.eh_frame_hdr {
            chunks.push(ChunkId::EhFrameHdr);
        }
    }
    if ctx.dynbss.hdr.sh_size > 0 {
        chunks.push(ChunkId::Copyrel);
    }
    if ctx.dynbss_relro.hdr.sh_size > 0 {
        chunks.push(ChunkId::CopyrelRelro);
    }
    if !ctx.options.strip_all && ctx.symtab.hdr.sh_size > ctx.machine.class().sym_size() as u64 {
        chunks.push(ChunkId::Symtab);
        chunks.push(ChunkId::Strtab);
    }
    chunks.push(ChunkId::Shstrtab);
    chunks.push(ChunkId::Shdr);

    chunks.sort_by(|&a, &b| {
        let ra = section_rank(ctx, a);
        let rb = section_rank(ctx, b);
        ra.cmp(&rb).then_with(|| {
            let ha = ctx.chunk_hdr(a);
            let hb = ctx.chunk_hdr(b);
            (ctx.chunk_name(a), ha.sh_type, ha.sh_flags).cmp(&(
                ctx.chunk_name(b),
                hb.sh_type,
                hb.sh_flags,
            ))
        })
    });

    ctx.chunks = chunks;
}

/// Whether a chunk lands inside PT_GNU_RELRO
pub fn is_relro(ctx: &Context, id: ChunkId) -> bool {
    match id {
        ChunkId::Got | ChunkId::Dynamic | ChunkId::CopyrelRelro => true,
        ChunkId::GotPlt => ctx.options.z_now,
        ChunkId::Osec(_) | ChunkId::Merged(_) => {
            let hdr = ctx.chunk_hdr(id);
            let name = ctx.chunk_name(id);
            matches!(
                hdr.sh_type,
                SHT_INIT_ARRAY | SHT_FINI_ARRAY | SHT_PREINIT_ARRAY
            ) || name == ".data.rel.ro"
                || name == ".ctors"
                || name == ".dtors"
        }
        _ => false,
    }
}

// Chunk ordering: headers, .interp, notes, read-only data, code, TLS
// data, TLS bss, RELRO data, RELRO bss, writable data, bss, non-alloc,
// section header table.
fn section_rank(ctx: &Context, id: ChunkId) -> u32 {
    match id {
        ChunkId::Ehdr => return 0,
        ChunkId::Phdr => return 1,
        ChunkId::Interp => return 2,
        ChunkId::Shdr => return 1 << 20,
        _ => {}
    }

    let hdr = ctx.chunk_hdr(id);
    if hdr.sh_type == SHT_NOTE {
        return 3;
    }
    if hdr.sh_flags & SHF_ALLOC == 0 {
        return (1 << 20) - 1;
    }

    let writable = hdr.sh_flags & SHF_WRITE != 0;
    let exec = hdr.sh_flags & SHF_EXECINSTR != 0;
    let tls = hdr.sh_flags & SHF_TLS != 0;
    let relro = is_relro(ctx, id);
    let hasbits = hdr.sh_type != SHT_NOBITS;

    ((u32::from(writable) << 9)
        | (u32::from(exec) << 8)
        | (u32::from(!tls) << 7)
        | (u32::from(!relro) << 6)
        | (u32::from(!hasbits) << 5))
        + 4
}

fn assign_section_indices(ctx: &mut Context) {
    let ids = ctx.chunks.clone();
    let mut shndx = 1u32;

    for id in &ids {
        if matches!(id, ChunkId::Ehdr | ChunkId::Phdr | ChunkId::Shdr) {
            continue;
        }
        ctx.set_chunk_shndx(*id, shndx);
        let name = ctx.chunk_name(*id).to_string();
        let off = ctx.shstrtab.add(&name);
        ctx.chunk_hdr_mut(*id).sh_name = off;
        shndx += 1;
    }

    ctx.shstrtab.hdr.sh_size = ctx.shstrtab.content.len() as u64;
    ctx.shdr.hdr.sh_size = u64::from(shndx) * ctx.machine.class().shdr_size() as u64;

    // Cross-section links resolve now that indices exist.
    ctx.dynsym.hdr.sh_link = ctx.dynstr.shndx;
    ctx.symtab.hdr.sh_link = ctx.strtab.shndx;
    ctx.reldyn.hdr.sh_link = ctx.dynsym.shndx;
    ctx.relplt.hdr.sh_link = ctx.dynsym.shndx;
    ctx.relplt.hdr.sh_info = ctx.gotplt.shndx;
    ctx.hash.hdr.sh_link = ctx.dynsym.shndx;
    ctx.gnuhash.hdr.sh_link = ctx.dynsym.shndx;
    ctx.dynamic.hdr.sh_link = ctx.dynstr.shndx;
    ctx.versym.hdr.sh_link = ctx.dynsym.shndx;
    ctx.verneed.hdr.sh_link = ctx.dynstr.shndx;
    ctx.verdef.hdr.sh_link = ctx.dynstr.shndx;
}

fn load_class(hdr: &elf::Shdr) -> u32 {
    let mut class = PF_R;
    if hdr.sh_flags & SHF_WRITE != 0 {
        class |= PF_W;
    }
    if hdr.sh_flags & SHF_EXECINSTR != 0 {
        class |= PF_X;
    }
    class
}

/// Walk the chunk list assigning virtual addresses and file offsets.
/// A chunk opening a new PT_LOAD rounds its address to a page; every
/// allocated chunk keeps `offset mod page == address mod page`.
fn set_osec_offsets(ctx: &mut Context) {
    let page = ctx.machine.page_size();
    let mut fileoff = 0u64;
    let mut vaddr = ctx.image_base();
    let mut prev_class: Option<u32> = None;

    for id in ctx.chunks.clone() {
        let hdr = *ctx.chunk_hdr(id);
        let align = hdr.sh_addralign.max(1);
        let is_bss = hdr.sh_type == SHT_NOBITS;
        let is_tbss = is_bss && hdr.sh_flags & SHF_TLS != 0;

        if hdr.sh_flags & SHF_ALLOC != 0 {
            let class = load_class(&hdr);
            if prev_class != Some(class) {
                vaddr = crate::align_to(vaddr, page);
                prev_class = Some(class);
            }
            vaddr = crate::align_to(vaddr, align);
            fileoff = crate::align_with_skew(fileoff, page, vaddr % page);

            let out = ctx.chunk_hdr_mut(id);
            out.sh_offset = fileoff;
            out.sh_addr = vaddr;

            if !is_bss {
                fileoff += hdr.sh_size;
            }
            if !is_tbss {
                vaddr += hdr.sh_size;
            }
        } else {
            fileoff = crate::align_to(fileoff, align);
            let out = ctx.chunk_hdr_mut(id);
            out.sh_offset = fileoff;
            out.sh_addr = 0;
            if !is_bss {
                fileoff += hdr.sh_size;
            }
        }
    }

    ctx.filesize = fileoff;
}

/// Assemble the program header table from the laid-out chunks
fn create_phdrs(ctx: &Context) -> Vec<Phdr> {
    let page = ctx.machine.page_size();
    let mut phdrs: Vec<Phdr> = Vec::new();

    if ctx.is_dynamic() {
        phdrs.push(Phdr {
            p_type: PT_PHDR,
            p_flags: PF_R,
            p_offset: ctx.phdr.hdr.sh_offset,
            p_vaddr: ctx.phdr.hdr.sh_addr,
            p_paddr: ctx.phdr.hdr.sh_addr,
            p_filesz: ctx.phdr.hdr.sh_size,
            p_memsz: ctx.phdr.hdr.sh_size,
            p_align: 8,
        });
    }
    if ctx.options.dynamic_linker.is_some() {
        phdrs.push(segment_over(ctx, PT_INTERP, PF_R, 1, &[ChunkId::Interp]));
    }

    // PT_LOAD runs: consecutive allocated chunks with one permission
    // class. TBSS overlays and contributes no extent.
    let mut i = 0;
    let alloc: Vec<ChunkId> = ctx
        .chunks
        .iter()
        .copied()
        .filter(|&id| {
            let hdr = ctx.chunk_hdr(id);
            hdr.sh_flags & SHF_ALLOC != 0
                && !(hdr.sh_type == SHT_NOBITS && hdr.sh_flags & SHF_TLS != 0)
        })
        .collect();
    while i < alloc.len() {
        let class = load_class(ctx.chunk_hdr(alloc[i]));
        let begin = i;
        while i < alloc.len() && load_class(ctx.chunk_hdr(alloc[i])) == class {
            i += 1;
        }
        let mut phdr = segment_over(ctx, PT_LOAD, class, page, &alloc[begin..i]);
        phdr.p_align = page;
        phdrs.push(phdr);
    }

    if ctx.is_dynamic() && ctx.dynamic.hdr.sh_size > 0 {
        phdrs.push(segment_over(
            ctx,
            PT_DYNAMIC,
            PF_R | PF_W,
            ctx.machine.word_size() as u64,
            &[ChunkId::Dynamic],
        ));
    }
    if ctx.buildid.hdr.sh_size > 0 {
        phdrs.push(segment_over(ctx, PT_NOTE, PF_R, 4, &[ChunkId::BuildId]));
    }

    let tls: Vec<ChunkId> = ctx
        .chunks
        .iter()
        .copied()
        .filter(|&id| ctx.chunk_hdr(id).sh_flags & SHF_TLS != 0)
        .collect();
    if !tls.is_empty() {
        phdrs.push(segment_over(ctx, PT_TLS, PF_R, 1, &tls));
    }

    if ctx.options.eh_frame_hdr && ctx.ehframehdr.hdr.sh_size > 0 {
        phdrs.push(segment_over(
            ctx,
            PT_GNU_EH_FRAME,
            PF_R,
            4,
            &[ChunkId::EhFrameHdr],
        ));
    }

    phdrs.push(Phdr {
        p_type: PT_GNU_STACK,
        p_flags: PF_R | PF_W,
        ..Phdr::default()
    });

    if ctx.options.z_relro {
        let relro: Vec<ChunkId> = ctx
            .chunks
            .iter()
            .copied()
            .filter(|&id| is_relro(ctx, id))
            .collect();
        if !relro.is_empty() {
            phdrs.push(segment_over(ctx, PT_GNU_RELRO, PF_R, 1, &relro));
        }
    }

    phdrs
}

fn segment_over(ctx: &Context, p_type: u32, p_flags: u32, align: u64, ids: &[ChunkId]) -> Phdr {
    let mut phdr = Phdr {
        p_type,
        p_flags,
        p_align: align,
        ..Phdr::default()
    };
    let mut first = true;
    let mut max_align = align;

    for &id in ids {
        let hdr = ctx.chunk_hdr(id);
        if first {
            phdr.p_offset = hdr.sh_offset;
            phdr.p_vaddr = hdr.sh_addr;
            phdr.p_paddr = hdr.sh_addr;
            first = false;
        }
        if hdr.sh_type != SHT_NOBITS {
            phdr.p_filesz = hdr.sh_offset + hdr.sh_size - phdr.p_offset;
        }
        phdr.p_memsz = hdr.sh_addr + hdr.sh_size - phdr.p_vaddr;
        max_align = max_align.max(hdr.sh_addralign);
    }
    if p_type == PT_TLS {
        phdr.p_align = max_align;
    }
    phdr
}

fn set_tls_bounds(ctx: &mut Context) {
    if let Some(tls) = ctx.phdr.phdrs.iter().find(|p| p.p_type == PT_TLS) {
        ctx.tls_begin = tls.p_vaddr;
        ctx.tls_end = crate::align_to(tls.p_vaddr + tls.p_memsz, tls.p_align.max(1));
    }
}

/// Size .symtab and .strtab: per-file counts are computed in parallel,
/// a prefix sum assigns each file its slice, and the null entry plus
/// all locals precede all globals.
fn compute_symtab(ctx: &mut Context) {
    if ctx.options.strip_all {
        return;
    }

    let shared: &Context = ctx;
    let counts: Vec<(u64, u64, u64)> = shared
        .objs
        .par_iter()
        .map(|file| {
            if !file.is_alive() {
                return (0, 0, 0);
            }
            let this = FileRef::Obj(file.id);
            let mut locals = 0u64;
            let mut globals = 0u64;
            let mut strings = 0u64;

            for i in 1..file.first_global.min(file.symbols.len()) {
                let sym = &file.symbols[i];
                if !sym.write_to_symtab.load(std::sync::atomic::Ordering::Relaxed) {
                    continue;
                }
                if shared.options.gc_sections && !sym.is_alive(shared) {
                    sym.write_to_symtab
                        .store(false, std::sync::atomic::Ordering::Relaxed);
                    continue;
                }
                locals += 1;
                strings += sym.name().len() as u64 + 1;
            }

            for i in file.globals() {
                let sym = &file.symbols[i];
                let owned = crate::lock(&sym.repr).file == Some(this);
                if owned
                    && sym.get_type(shared) != elf::STT_SECTION
                    && sym.is_alive(shared)
                {
                    sym.write_to_symtab
                        .store(true, std::sync::atomic::Ordering::Relaxed);
                    globals += 1;
                    strings += sym.name().len() as u64 + 1;
                }
            }
            (locals, globals, strings)
        })
        .collect();

    let entsize = ctx.machine.class().sym_size() as u64;
    let total_locals: u64 = counts.iter().map(|c| c.0).sum();

    let mut local_idx = 1u64;
    let mut global_idx = 1 + total_locals;
    let mut strtab_off = 1u64;
    for (file, (locals, globals, strings)) in ctx.objs.iter_mut().zip(&counts) {
        file.num_local_symtab = *locals;
        file.num_global_symtab = *globals;
        file.strtab_size = *strings;
        file.local_symtab_offset = local_idx * entsize;
        file.global_symtab_offset = global_idx * entsize;
        file.strtab_offset = strtab_off;
        local_idx += locals;
        global_idx += globals;
        strtab_off += strings;
    }

    ctx.symtab.hdr.sh_size = global_idx * entsize;
    ctx.symtab.hdr.sh_entsize = entsize;
    ctx.symtab.hdr.sh_info = (1 + total_locals) as u32;
    ctx.strtab.hdr.sh_size = strtab_off;
}

/// Deduplicate CIEs across all files and schedule live frame records
/// for output
fn construct_ehframe(ctx: &mut Context) {
    struct Slot {
        file: u32,
        idx: u32,
        key: Vec<u8>,
        size: u64,
    }

    let mut cie_slots: Vec<Slot> = Vec::new();
    let mut fde_slots: Vec<(u32, u32, u64)> = Vec::new();

    for file in &ctx.objs {
        if !file.is_alive() {
            continue;
        }
        for (idx, cie) in file.cies.iter().enumerate() {
            let Some(isec) = file.sections.get(cie.isec as usize).and_then(Option::as_ref)
            else {
                continue;
            };
            // Identity: record bytes plus each relocation's shape and
            // referenced symbol.
            let size = cie.size(&isec.contents);
            let mut key = isec.contents
                [cie.input_offset as usize..(cie.input_offset as u64 + size) as usize]
                .to_vec();
            for rel in &isec.rels[cie.rel_begin as usize..cie.rel_end as usize] {
                key.extend_from_slice(&(rel.r_offset - u64::from(cie.input_offset)).to_le_bytes());
                key.extend_from_slice(&rel.r_type.to_le_bytes());
                let sym_id = file
                    .symbols
                    .get(rel.r_sym as usize)
                    .map(|s| Arc::as_ptr(s) as usize)
                    .unwrap_or(0);
                key.extend_from_slice(&sym_id.to_le_bytes());
                key.extend_from_slice(&isec.get_addend(rel).to_le_bytes());
            }
            cie_slots.push(Slot {
                file: file.id,
                idx: idx as u32,
                key,
                size,
            });
        }

        for (idx, fde) in file.fdes.iter().enumerate() {
            let Some(isec) = file.sections.get(fde.isec as usize).and_then(Option::as_ref)
            else {
                continue;
            };
            // An FDE is live iff the code it covers survived.
            let covered_alive = file
                .elf_syms
                .get(isec.rels[fde.rel_begin as usize].r_sym as usize)
                .and_then(|esym| {
                    file.section_idx_of(esym, isec.rels[fde.rel_begin as usize].r_sym as usize)
                })
                .and_then(|si| file.sections.get(si).and_then(Option::as_ref))
                .map(|target| target.is_alive())
                .unwrap_or(false);
            if covered_alive {
                fde_slots.push((file.id, idx as u32, fde.size(&isec.contents)));
            }
        }
    }

    let mut offset = 0u64;
    let mut leaders: FxHashMap<Vec<u8>, u32> = FxHashMap::default();
    let mut assignments: Vec<(u32, u32, u32, bool)> = Vec::new();
    let mut cie_refs: Vec<FrameRef> = Vec::new();

    for slot in cie_slots {
        match leaders.get(&slot.key) {
            Some(&leader_off) => {
                assignments.push((slot.file, slot.idx, leader_off, false));
            }
            None => {
                leaders.insert(slot.key, offset as u32);
                assignments.push((slot.file, slot.idx, offset as u32, true));
                cie_refs.push(FrameRef {
                    file: slot.file,
                    idx: slot.idx,
                });
                offset += slot.size;
            }
        }
    }

    let mut fde_refs: Vec<FrameRef> = Vec::new();
    let mut fde_assignments: Vec<(u32, u32, u32)> = Vec::new();
    for (file, idx, size) in fde_slots {
        fde_assignments.push((file, idx, offset as u32));
        fde_refs.push(FrameRef { file, idx });
        offset += size;
    }

    for (file, idx, off, leader) in assignments {
        let cie = &mut ctx.objs[file as usize].cies[idx as usize];
        cie.output_offset = off;
        cie.is_leader = leader;
    }
    for (file, idx, off) in fde_assignments {
        ctx.objs[file as usize].fdes[idx as usize].output_offset = off;
    }

    if offset > 0 {
        // Null length record terminates the section.
        ctx.ehframe.hdr.sh_size = offset + 4;
    }
    ctx.ehframe.cies = cie_refs;
    ctx.ehframe.fdes = fde_refs;
}

/// Build .gnu.version_d from the command-line version definitions
fn fill_verdef(ctx: &mut Context) {
    if ctx.options.version_definitions.is_empty() {
        return;
    }

    ctx.versym.contents = vec![1; ctx.dynsym.count()];
    ctx.versym.contents[0] = 0;

    let base_name = ctx
        .options
        .soname
        .clone()
        .unwrap_or_else(|| ctx.options.output.clone());

    let mut records: Vec<(String, u16, u16)> = vec![(base_name, 1, elf::VER_FLG_BASE)];
    for (i, name) in ctx.options.version_definitions.clone().iter().enumerate() {
        records.push((name.clone(), VER_NDX_LAST_RESERVED + 1 + i as u16, 0));
    }

    let mut contents = Vec::new();
    for (i, (name, idx, flags)) in records.iter().enumerate() {
        let is_last = i + 1 == records.len();
        let name_off = ctx.dynstr.add(name);
        let mut buf = [0u8; elf::Verdef::SIZE + elf::Verdaux::SIZE];
        elf::Verdef {
            vd_version: 1,
            vd_flags: *flags,
            vd_ndx: *idx,
            vd_cnt: 1,
            vd_hash: elf::elf_hash(name.as_bytes()),
            vd_aux: elf::Verdef::SIZE as u32,
            vd_next: if is_last {
                0
            } else {
                (elf::Verdef::SIZE + elf::Verdaux::SIZE) as u32
            },
        }
        .write_to(&mut buf);
        elf::Verdaux {
            vda_name: name_off,
            vda_next: 0,
        }
        .write_to(&mut buf[elf::Verdef::SIZE..]);
        contents.extend_from_slice(&buf);
    }

    ctx.verdef.contents = contents;
    ctx.verdef.hdr.sh_info = records.len() as u32;

    // Every exported symbol advertises its assigned version.
    let dynsyms = ctx.dynsym.symbols.clone();
    for sym in &dynsyms {
        let ver = crate::lock(&sym.repr).ver_idx;
        let idx = sym.get_dynsym_idx(ctx) as usize;
        if idx != 0 && idx < ctx.versym.contents.len() {
            ctx.versym.contents[idx] = ver;
        }
    }
}

/// Build .gnu.version_r from the versioned symbols imported from each
/// DSO
fn fill_verneed(ctx: &mut Context) {
    if ctx.dynsym.symbols.is_empty() {
        return;
    }

    // Versioned imports, grouped by providing DSO.
    let mut syms: Vec<(u32, u16, Arc<crate::symbol::Symbol>)> = Vec::new();
    for sym in &ctx.dynsym.symbols {
        let repr = crate::lock(&sym.repr);
        if let Some(FileRef::Dso(dso)) = repr.file {
            let ver = repr.ver_idx & !VERSYM_HIDDEN;
            if ver > VER_NDX_LAST_RESERVED {
                syms.push((dso, ver, Arc::clone(sym)));
            }
        }
    }
    if syms.is_empty() {
        return;
    }
    syms.sort_by(|a, b| {
        (&ctx.dsos[a.0 as usize].soname, a.1).cmp(&(&ctx.dsos[b.0 as usize].soname, b.1))
    });

    if ctx.versym.contents.is_empty() {
        ctx.versym.contents = vec![1; ctx.dynsym.count()];
        ctx.versym.contents[0] = 0;
    }

    let mut veridx =
        VER_NDX_LAST_RESERVED + ctx.options.version_definitions.len() as u16;

    // Group records: (soname offset, [(hash, idx, name offset)]).
    let mut groups: Vec<(u32, Vec<(u32, u16, u32)>)> = Vec::new();
    let mut last: Option<(u32, u16)> = None;

    for (dso, ver, sym) in &syms {
        let verstr = ctx.dsos[*dso as usize]
            .version_strings
            .get(*ver as usize)
            .cloned()
            .unwrap_or_default();

        if last.map(|(d, _)| d) != Some(*dso) {
            let soname = ctx.dsos[*dso as usize].soname.clone();
            let off = ctx.dynstr.add(&soname);
            groups.push((off, Vec::new()));
            last = None;
        }
        if last != Some((*dso, *ver)) {
            veridx += 1;
            let name_off = ctx.dynstr.add(&verstr);
            if let Some(group) = groups.last_mut() {
                group
                    .1
                    .push((elf::elf_hash(verstr.as_bytes()), veridx, name_off));
            }
            last = Some((*dso, *ver));
        }

        let idx = sym.get_dynsym_idx(ctx) as usize;
        if idx != 0 && idx < ctx.versym.contents.len() {
            ctx.versym.contents[idx] = veridx;
        }
    }

    let mut contents = Vec::new();
    for (gi, (soname_off, entries)) in groups.iter().enumerate() {
        let group_size = elf::Verneed::SIZE + entries.len() * elf::Vernaux::SIZE;
        let mut buf = vec![0u8; group_size];
        elf::Verneed {
            vn_version: 1,
            vn_cnt: entries.len() as u16,
            vn_file: *soname_off,
            vn_aux: elf::Verneed::SIZE as u32,
            vn_next: if gi + 1 == groups.len() {
                0
            } else {
                group_size as u32
            },
        }
        .write_to(&mut buf);

        for (ei, (hash, idx, name_off)) in entries.iter().enumerate() {
            elf::Vernaux {
                vna_hash: *hash,
                vna_flags: 0,
                vna_other: *idx,
                vna_name: *name_off,
                vna_next: if ei + 1 == entries.len() {
                    0
                } else {
                    elf::Vernaux::SIZE as u32
                },
            }
            .write_to(&mut buf[elf::Verneed::SIZE + ei * elf::Vernaux::SIZE..]);
        }
        contents.extend_from_slice(&buf);
    }

    ctx.verneed.contents = contents;
    ctx.verneed.hdr.sh_info = groups.len() as u32;
}

/// Assemble the .dynamic entries. Address-valued entries read chunk
/// headers, so the final values exist only after layout; the entry
/// count is stable either way, which is what sizing needs.
pub fn dynamic_entries(ctx: &Context) -> Vec<elf::Dyn> {
    let mut v: Vec<elf::Dyn> = Vec::new();
    let mut push = |tag: u64, val: u64| v.push(elf::Dyn { d_tag: tag, d_val: val });

    for dso in &ctx.dsos {
        if dso.is_alive() {
            push(elf::DT_NEEDED, u64::from(ctx.dynstr.find(&dso.soname)));
        }
    }
    if !ctx.options.rpaths.is_empty() {
        let joined = ctx.options.rpaths.join(":");
        push(elf::DT_RUNPATH, u64::from(ctx.dynstr.find(&joined)));
    }
    if let Some(soname) = &ctx.options.soname {
        push(elf::DT_SONAME, u64::from(ctx.dynstr.find(soname)));
    }

    if let Some(addr) = defined_addr(ctx, "_init") {
        push(elf::DT_INIT, addr);
    }
    if let Some(addr) = defined_addr(ctx, "_fini") {
        push(elf::DT_FINI, addr);
    }

    for id in &ctx.chunks {
        let hdr = ctx.chunk_hdr(*id);
        match hdr.sh_type {
            SHT_INIT_ARRAY => {
                push(elf::DT_INIT_ARRAY, hdr.sh_addr);
                push(elf::DT_INIT_ARRAYSZ, hdr.sh_size);
            }
            SHT_FINI_ARRAY => {
                push(elf::DT_FINI_ARRAY, hdr.sh_addr);
                push(elf::DT_FINI_ARRAYSZ, hdr.sh_size);
            }
            SHT_PREINIT_ARRAY => {
                push(elf::DT_PREINIT_ARRAY, hdr.sh_addr);
                push(elf::DT_PREINIT_ARRAYSZ, hdr.sh_size);
            }
            _ => {}
        }
    }

    if ctx.options.hash_style_sysv {
        push(elf::DT_HASH, ctx.hash.hdr.sh_addr);
    }
    if ctx.options.hash_style_gnu {
        push(elf::DT_GNU_HASH, ctx.gnuhash.hdr.sh_addr);
    }
    push(elf::DT_STRTAB, ctx.dynstr.hdr.sh_addr);
    push(elf::DT_STRSZ, ctx.dynstr.hdr.sh_size);
    push(elf::DT_SYMTAB, ctx.dynsym.hdr.sh_addr);
    push(elf::DT_SYMENT, ctx.machine.class().sym_size() as u64);

    if !ctx.plt.symbols.is_empty() {
        push(elf::DT_PLTGOT, ctx.gotplt.hdr.sh_addr);
        push(elf::DT_PLTRELSZ, ctx.relplt.hdr.sh_size);
        push(
            elf::DT_PLTREL,
            if ctx.machine.is_rela() {
                elf::DT_RELA
            } else {
                elf::DT_REL
            },
        );
        push(elf::DT_JMPREL, ctx.relplt.hdr.sh_addr);
    }

    if ctx.machine.is_rela() {
        push(elf::DT_RELA, ctx.reldyn.hdr.sh_addr);
        push(elf::DT_RELASZ, ctx.reldyn.hdr.sh_size);
        push(elf::DT_RELAENT, ctx.machine.class().rel_size(true) as u64);
        if ctx.reldyn.relcount > 0 {
            push(elf::DT_RELACOUNT, ctx.reldyn.relcount);
        }
    } else {
        push(elf::DT_REL, ctx.reldyn.hdr.sh_addr);
        push(elf::DT_RELSZ, ctx.reldyn.hdr.sh_size);
        push(elf::DT_RELENT, ctx.machine.class().rel_size(false) as u64);
        if ctx.reldyn.relcount > 0 {
            push(elf::DT_RELCOUNT, ctx.reldyn.relcount);
        }
    }

    if ctx.verneed.hdr.sh_size > 0 {
        push(elf::DT_VERNEED, ctx.verneed.hdr.sh_addr);
        push(elf::DT_VERNEEDNUM, u64::from(ctx.verneed.hdr.sh_info));
    }
    if ctx.verdef.hdr.sh_size > 0 {
        push(elf::DT_VERDEF, ctx.verdef.hdr.sh_addr);
        push(elf::DT_VERDEFNUM, u64::from(ctx.verdef.hdr.sh_info));
    }
    if ctx.versym.hdr.sh_size > 0 {
        push(elf::DT_VERSYM, ctx.versym.hdr.sh_addr);
    }

    if ctx.options.z_now {
        push(elf::DT_FLAGS, elf::DF_BIND_NOW);
        push(elf::DT_FLAGS_1, elf::DF_1_NOW);
    } else if ctx.link_mode() == crate::context::LinkMode::Pie {
        push(elf::DT_FLAGS_1, elf::DF_1_PIE);
    }

    if !ctx.is_shared() {
        push(elf::DT_DEBUG, 0);
    }
    push(elf::DT_NULL, 0);
    v
}

fn defined_addr(ctx: &Context, name: &str) -> Option<u64> {
    let sym = ctx.get_symbol(name)?;
    let repr = crate::lock(&sym.repr);
    match repr.file {
        Some(FileRef::Obj(idx)) if idx != 0 => {}
        _ => return None,
    }
    drop(repr);
    Some(sym.get_addr(ctx))
}

fn define_marker(ctx: &Context, name: &str, value: u64, shndx: u32) {
    let Some(sym) = ctx.get_symbol(name) else {
        return;
    };
    let mut repr = crate::lock(&sym.repr);
    if repr.file != Some(FileRef::Obj(0)) {
        return;
    }
    repr.value = value;
    repr.shndx = shndx;
    repr.origin = Origin::None;
}

/// Bind the linker-provided marker symbols to their final addresses
fn fix_synthetic_symbols(ctx: &mut Context) {
    let entsize = ctx
        .machine
        .class()
        .rel_size(ctx.machine.is_rela()) as u64;

    // __bss_start
    for id in &ctx.chunks {
        if let ChunkId::Osec(i) = id {
            let osec = &ctx.output_sections[*i as usize];
            if osec.name == ".bss" {
                define_marker(ctx, "__bss_start", osec.hdr.sh_addr, osec.shndx);
                break;
            }
        }
    }

    // The image start.
    let base = ctx.ehdr.hdr.sh_addr;
    define_marker(ctx, "__ehdr_start", base, 1);
    define_marker(ctx, "__executable_start", base, 1);

    // Bounds of the ifunc slice of .rela.dyn.
    let iplt_start = ctx.reldyn.hdr.sh_addr + ctx.reldyn.relcount * entsize;
    let iplt_end = iplt_start + ctx.reldyn.irelcount * entsize;
    let (start_name, end_name) = if ctx.machine.is_rela() {
        ("__rela_iplt_start", "__rela_iplt_end")
    } else {
        ("__rel_iplt_start", "__rel_iplt_end")
    };
    define_marker(ctx, start_name, iplt_start, ctx.reldyn.shndx);
    define_marker(ctx, end_name, iplt_end, ctx.reldyn.shndx);

    // Array bounds.
    for id in ctx.chunks.clone() {
        let hdr = *ctx.chunk_hdr(id);
        let shndx = match id {
            ChunkId::Osec(i) => ctx.output_sections[i as usize].shndx,
            _ => continue,
        };
        match hdr.sh_type {
            SHT_INIT_ARRAY => {
                define_marker(ctx, "__init_array_start", hdr.sh_addr, shndx);
                define_marker(ctx, "__init_array_end", hdr.sh_addr + hdr.sh_size, shndx);
            }
            SHT_FINI_ARRAY => {
                define_marker(ctx, "__fini_array_start", hdr.sh_addr, shndx);
                define_marker(ctx, "__fini_array_end", hdr.sh_addr + hdr.sh_size, shndx);
            }
            SHT_PREINIT_ARRAY => {
                define_marker(ctx, "__preinit_array_start", hdr.sh_addr, shndx);
                define_marker(ctx, "__preinit_array_end", hdr.sh_addr + hdr.sh_size, shndx);
            }
            _ => {}
        }
    }

    // _end, _etext, _edata: the last matching chunk wins.
    let mut end = (0u64, 0u32);
    let mut etext = (0u64, 0u32);
    let mut edata = (0u64, 0u32);
    for id in &ctx.chunks {
        if matches!(id, ChunkId::Ehdr | ChunkId::Phdr | ChunkId::Shdr) {
            continue;
        }
        let hdr = ctx.chunk_hdr(*id);
        let shndx = match id {
            ChunkId::Osec(i) => ctx.output_sections[*i as usize].shndx,
            ChunkId::Merged(i) => ctx.merged_sections[*i as usize].shndx,
            _ => 1,
        };
        if hdr.sh_flags & SHF_ALLOC != 0 {
            end = (hdr.sh_addr + hdr.sh_size, shndx);
            if hdr.sh_type != SHT_NOBITS {
                edata = (hdr.sh_addr + hdr.sh_size, shndx);
            }
        }
        if hdr.sh_flags & SHF_EXECINSTR != 0 {
            etext = (hdr.sh_addr + hdr.sh_size, shndx);
        }
    }
    for name in ["_end", "end"] {
        define_marker(ctx, name, end.0, end.1);
    }
    for name in ["_etext", "etext"] {
        define_marker(ctx, name, etext.0, etext.1);
    }
    for name in ["_edata", "edata"] {
        define_marker(ctx, name, edata.0, edata.1);
    }

    define_marker(ctx, "_DYNAMIC", ctx.dynamic.hdr.sh_addr, ctx.dynamic.shndx);
    define_marker(
        ctx,
        "_GLOBAL_OFFSET_TABLE_",
        ctx.gotplt.hdr.sh_addr,
        ctx.gotplt.shndx,
    );
    define_marker(
        ctx,
        "__GNU_EH_FRAME_HDR",
        ctx.ehframehdr.hdr.sh_addr,
        ctx.ehframehdr.shndx,
    );

    // __start_X / __stop_X over C-identifier-named output sections.
    for id in ctx.chunks.clone() {
        let (name, hdr, shndx) = match id {
            ChunkId::Osec(i) => {
                let osec = &ctx.output_sections[i as usize];
                (osec.name.clone(), osec.hdr, osec.shndx)
            }
            ChunkId::Merged(i) => {
                let merged = &ctx.merged_sections[i as usize];
                (merged.name.clone(), merged.hdr, merged.shndx)
            }
            _ => continue,
        };
        if crate::is_c_identifier(&name) {
            define_marker(ctx, &format!("__start_{name}"), hdr.sh_addr, shndx);
            define_marker(
                ctx,
                &format!("__stop_{name}"),
                hdr.sh_addr + hdr.sh_size,
                shndx,
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arch::Machine;
    use crate::context::Options;

    #[test]
    fn test_section_rank_global_order() {
        let ctx = Context::new(Options::builder().build(), Machine::X86_64);

        // Headers first, section table last.
        assert_eq!(section_rank(&ctx, ChunkId::Ehdr), 0);
        assert_eq!(section_rank(&ctx, ChunkId::Phdr), 1);
        assert_eq!(section_rank(&ctx, ChunkId::Interp), 2);
        assert_eq!(section_rank(&ctx, ChunkId::Shdr), 1 << 20);

        // Read-only data before code before RELRO before plain data.
        let got = section_rank(&ctx, ChunkId::Got); // writable relro
        let plt = section_rank(&ctx, ChunkId::Plt); // readonly exec
        let dynsym = section_rank(&ctx, ChunkId::Dynsym); // readonly data
        let copyrel = section_rank(&ctx, ChunkId::Copyrel); // writable bss
        assert!(dynsym < plt);
        assert!(plt < got);
        assert!(got < copyrel);

        // Non-alloc (symtab) after everything allocated.
        let symtab = section_rank(&ctx, ChunkId::Symtab);
        assert!(copyrel < symtab);
        assert!(symtab < section_rank(&ctx, ChunkId::Shdr));
    }

    #[test]
    fn test_load_class_groups_permissions() {
        use crate::elf::Shdr;
        let ro = Shdr {
            sh_flags: SHF_ALLOC,
            ..Shdr::default()
        };
        let rx = Shdr {
            sh_flags: SHF_ALLOC | SHF_EXECINSTR,
            ..Shdr::default()
        };
        let rw = Shdr {
            sh_flags: SHF_ALLOC | SHF_WRITE,
            ..Shdr::default()
        };
        assert_eq!(load_class(&ro), PF_R);
        assert_eq!(load_class(&rx), PF_R | PF_X);
        assert_eq!(load_class(&rw), PF_R | PF_W);
    }
}
