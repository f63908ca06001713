//! Output image assembly
//!
//! The laid-out image is materialized into one buffer. Every chunk gets
//! a disjoint `&mut` slice carved out up front, `.rela.dyn` is further
//! carved into the GOT region, the copy-relocation region and each
//! section's reservation, and all writes then run in parallel with no
//! synchronization. A short serial tail sorts `.rela.dyn` (RELATIVE
//! entries first, as DT_RELACOUNT promises) and stamps the build id.

use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHasher};

use crate::chunks::ChunkId;
use crate::context::{BuildIdKind, Context, LinkMode};
use crate::elf::{self, Rel, SHT_NOBITS};
use crate::error::Result;
use crate::input::SectionId;
use crate::scan::DynrelWriter;

struct Carver<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Carver<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Hand out the slice at `offset` of length `len`. Offsets must
    /// arrive in ascending, non-overlapping order.
    fn take(&mut self, offset: usize, len: usize) -> &'a mut [u8] {
        debug_assert!(offset >= self.pos);
        let rest = std::mem::take(&mut self.buf);
        let (_, rest) = rest.split_at_mut(offset - self.pos);
        let (out, rest) = rest.split_at_mut(len);
        self.buf = rest;
        self.pos = offset + len;
        out
    }
}

enum Job<'a> {
    Ehdr(&'a mut [u8]),
    Phdr(&'a mut [u8]),
    Shdr(&'a mut [u8]),
    Chunk(ChunkId, &'a mut [u8]),
    Got {
        out: &'a mut [u8],
        dynrel: &'a mut [u8],
    },
    CopyRels(&'a mut [u8]),
    Member {
        sid: SectionId,
        out: &'a mut [u8],
        dynrel: Option<&'a mut [u8]>,
    },
    Merged(u32, &'a mut [u8]),
    FileSymtab {
        file: u32,
        locals: &'a mut [u8],
        globals: &'a mut [u8],
        strtab: &'a mut [u8],
    },
    EhFrame(&'a mut [u8]),
    EhFrameHdr(&'a mut [u8]),
}

/// Write the whole image and return it
pub fn write_output(ctx: &mut Context) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; ctx.filesize as usize];
    {
        let shared: &Context = ctx;
        let jobs = build_jobs(shared, &mut buf);
        jobs.into_par_iter().for_each(|job| run_job(shared, job));
    }
    sort_reldyn(ctx, &mut buf);
    stamp_build_id(ctx, &mut buf);
    Ok(buf)
}

fn build_jobs<'a>(ctx: &'a Context, buf: &'a mut [u8]) -> Vec<Job<'a>> {
    let entsize = ctx.machine.class().rel_size(ctx.machine.is_rela());
    let mut carver = Carver::new(buf);
    let mut jobs: Vec<Job<'a>> = Vec::new();

    // Deferred pairings filled while carving: chunk order is file
    // order, so related slices may be carved far apart.
    let mut got_out: Option<&'a mut [u8]> = None;
    let mut got_dynrel: Option<&'a mut [u8]> = None;
    let mut dynrel_map: FxHashMap<(u32, u32), &'a mut [u8]> = FxHashMap::default();
    let mut strtab_map: FxHashMap<u32, &'a mut [u8]> = FxHashMap::default();

    for &id in &ctx.chunks {
        let hdr = ctx.chunk_hdr(id);
        if hdr.sh_type == SHT_NOBITS || hdr.sh_size == 0 {
            continue;
        }
        let offset = hdr.sh_offset as usize;
        let size = hdr.sh_size as usize;

        match id {
            ChunkId::Ehdr => jobs.push(Job::Ehdr(carver.take(offset, size))),
            ChunkId::Phdr => jobs.push(Job::Phdr(carver.take(offset, size))),
            ChunkId::Shdr => jobs.push(Job::Shdr(carver.take(offset, size))),
            ChunkId::RelDyn => {
                // Sub-carve: GOT region, copy relocations, per-section
                // reservations in file order.
                let mut sub = Carver::new(carver.take(offset, size));
                let (rel, irel, symbolic) = ctx.got.count_dynrels(ctx);
                let got_len = ((rel + irel + symbolic) as usize) * entsize;
                if got_len > 0 {
                    got_dynrel = Some(sub.take(0, got_len));
                }

                let copy_len =
                    (ctx.dynbss.symbols.len() + ctx.dynbss_relro.symbols.len()) * entsize;
                if copy_len > 0 {
                    jobs.push(Job::CopyRels(sub.take(got_len, copy_len)));
                }

                for file in &ctx.objs {
                    if !file.is_alive() {
                        continue;
                    }
                    for isec in file.sections.iter().flatten() {
                        let n = isec.num_dynrel.load(std::sync::atomic::Ordering::Relaxed);
                        if n == 0 || !isec.is_alive() {
                            continue;
                        }
                        let at = (file.reldyn_offset
                            + isec.reldyn_offset.load(std::sync::atomic::Ordering::Relaxed))
                            as usize
                            * entsize;
                        dynrel_map
                            .insert((isec.file, isec.index), sub.take(at, n as usize * entsize));
                    }
                }
            }
            ChunkId::Osec(osec_idx) => {
                let mut sub = Carver::new(carver.take(offset, size));
                let osec = &ctx.output_sections[osec_idx as usize];
                for sid in &osec.members {
                    let Some(isec) = ctx.isec(*sid) else { continue };
                    if isec.shdr.sh_type == SHT_NOBITS || isec.shdr.sh_size == 0 {
                        continue;
                    }
                    let out = sub.take(isec.offset() as usize, isec.shdr.sh_size as usize);
                    jobs.push(Job::Member {
                        sid: *sid,
                        out,
                        dynrel: None,
                    });
                }
            }
            ChunkId::Merged(idx) => jobs.push(Job::Merged(idx, carver.take(offset, size))),
            ChunkId::Got => got_out = Some(carver.take(offset, size)),
            ChunkId::EhFrame => jobs.push(Job::EhFrame(carver.take(offset, size))),
            ChunkId::EhFrameHdr => jobs.push(Job::EhFrameHdr(carver.take(offset, size))),
            ChunkId::Symtab => {
                let mut sub = Carver::new(carver.take(offset, size));
                let sym_entsize = ctx.machine.class().sym_size();
                let mut locals: FxHashMap<u32, &'a mut [u8]> = FxHashMap::default();
                for file in &ctx.objs {
                    if file.num_local_symtab > 0 {
                        locals.insert(
                            file.id,
                            sub.take(
                                file.local_symtab_offset as usize,
                                file.num_local_symtab as usize * sym_entsize,
                            ),
                        );
                    }
                }
                for file in &ctx.objs {
                    if file.num_local_symtab == 0 && file.num_global_symtab == 0 {
                        continue;
                    }
                    let globals = if file.num_global_symtab > 0 {
                        sub.take(
                            file.global_symtab_offset as usize,
                            file.num_global_symtab as usize * sym_entsize,
                        )
                    } else {
                        &mut [][..]
                    };
                    jobs.push(Job::FileSymtab {
                        file: file.id,
                        locals: locals.remove(&file.id).unwrap_or(&mut [][..]),
                        globals,
                        strtab: &mut [][..], // paired below
                    });
                }
            }
            ChunkId::Strtab => {
                let mut sub = Carver::new(carver.take(offset, size));
                for file in &ctx.objs {
                    if file.strtab_size > 0 {
                        strtab_map.insert(
                            file.id,
                            sub.take(file.strtab_offset as usize, file.strtab_size as usize),
                        );
                    }
                }
            }
            _ => jobs.push(Job::Chunk(id, carver.take(offset, size))),
        }
    }

    // Pair member jobs with their .rela.dyn reservations and symtab
    // jobs with their string slices.
    for job in jobs.iter_mut() {
        match job {
            Job::Member { sid, dynrel, .. } => {
                if let Some(slice) = dynrel_map.remove(&(sid.file, sid.index)) {
                    *dynrel = Some(slice);
                }
            }
            Job::FileSymtab { file, strtab, .. } => {
                if let Some(slice) = strtab_map.remove(file) {
                    *strtab = slice;
                }
            }
            _ => {}
        }
    }

    if let Some(out) = got_out {
        // A static link has no .rela.dyn; the GOT still needs its
        // link-time slot values.
        jobs.push(Job::Got {
            out,
            dynrel: got_dynrel.unwrap_or(&mut [][..]),
        });
    }

    jobs
}

fn run_job(ctx: &Context, job: Job<'_>) {
    match job {
        Job::Ehdr(out) => write_ehdr(ctx, out),
        Job::Phdr(out) => {
            let size = ctx.machine.class().phdr_size();
            for (i, phdr) in ctx.phdr.phdrs.iter().enumerate() {
                phdr.write_to(ctx.machine.class(), &mut out[i * size..]);
            }
        }
        Job::Shdr(out) => write_shdr_table(ctx, out),
        Job::Chunk(id, out) => write_chunk(ctx, id, out),
        Job::Got { out, dynrel } => {
            let mut writer = DynrelWriter::new(
                ctx,
                if dynrel.is_empty() {
                    None
                } else {
                    Some(dynrel)
                },
            );
            ctx.got.copy_buf(ctx, out, &mut writer);
        }
        Job::CopyRels(out) => write_copy_relocs(ctx, out),
        Job::Member { sid, out, dynrel } => {
            if let Some(isec) = ctx.isec(sid) {
                isec.copy_and_relocate(ctx, out, dynrel);
            }
        }
        Job::Merged(idx, out) => {
            for frag in &ctx.merged_sections[idx as usize].fragments {
                let off = frag.offset() as usize;
                out[off..off + frag.data.len()].copy_from_slice(&frag.data);
            }
        }
        Job::FileSymtab {
            file,
            locals,
            globals,
            strtab,
        } => write_file_symtab(ctx, file, locals, globals, strtab),
        Job::EhFrame(out) => write_ehframe(ctx, out),
        Job::EhFrameHdr(out) => write_ehframe_hdr(ctx, out),
    }
}

fn write_ehdr(ctx: &Context, out: &mut [u8]) {
    let entry = ctx
        .get_symbol(&ctx.options.entry)
        .filter(|sym| crate::lock(&sym.repr).file.is_some())
        .map(|sym| sym.get_addr(ctx))
        .unwrap_or_else(|| {
            if ctx.link_mode() != LinkMode::Dso {
                log::warn!("entry symbol {} is not defined", ctx.options.entry);
            }
            0
        });

    elf::Ehdr {
        e_type: match ctx.link_mode() {
            LinkMode::Pde => elf::ET_EXEC,
            LinkMode::Pie | LinkMode::Dso => elf::ET_DYN,
        },
        e_machine: ctx.machine.e_machine(),
        e_entry: entry,
        e_phoff: ctx.phdr.hdr.sh_offset,
        e_shoff: ctx.shdr.hdr.sh_offset,
        e_flags: 0,
        e_phnum: ctx.phdr.phdrs.len() as u16,
        e_shnum: (ctx.shdr.hdr.sh_size / ctx.machine.class().shdr_size() as u64) as u16,
        e_shstrndx: ctx.shstrtab.shndx as u16,
    }
    .write_to(ctx.machine.class(), out);
}

fn write_shdr_table(ctx: &Context, out: &mut [u8]) {
    let class = ctx.machine.class();
    let entsize = class.shdr_size();
    // Entry 0 stays null.
    let mut i = 1;
    for &id in &ctx.chunks {
        if matches!(id, ChunkId::Ehdr | ChunkId::Phdr | ChunkId::Shdr) {
            continue;
        }
        ctx.chunk_hdr(id).write_to(class, &mut out[i * entsize..]);
        i += 1;
    }
}

fn write_chunk(ctx: &Context, id: ChunkId, out: &mut [u8]) {
    match id {
        ChunkId::GotPlt => ctx.gotplt.copy_buf(ctx, out),
        ChunkId::Plt => crate::arch::write_plt(ctx, out),
        ChunkId::PltGot => crate::arch::write_pltgot(ctx, out),
        ChunkId::RelPlt => ctx.relplt.copy_buf(ctx, out),
        ChunkId::Dynsym => crate::chunks::synthetic::write_dynsym(ctx, out),
        ChunkId::Dynstr => out[..ctx.dynstr.content.len()].copy_from_slice(&ctx.dynstr.content),
        ChunkId::Shstrtab => {
            out[..ctx.shstrtab.content.len()].copy_from_slice(&ctx.shstrtab.content)
        }
        ChunkId::Dynamic => ctx.dynamic.copy_buf(ctx, out),
        ChunkId::Hash => ctx.hash.copy_buf(ctx, out),
        ChunkId::GnuHash => ctx.gnuhash.copy_buf(ctx, out),
        ChunkId::Interp => {
            if let Some(path) = &ctx.options.dynamic_linker {
                out[..path.len()].copy_from_slice(path.as_bytes());
            }
        }
        ChunkId::BuildId => ctx.buildid.copy_buf(out),
        ChunkId::Versym => ctx.versym.copy_buf(out),
        ChunkId::Verneed => out[..ctx.verneed.contents.len()].copy_from_slice(&ctx.verneed.contents),
        ChunkId::Verdef => out[..ctx.verdef.contents.len()].copy_from_slice(&ctx.verdef.contents),
        _ => {}
    }
}

fn write_copy_relocs(ctx: &Context, out: &mut [u8]) {
    let mut writer = DynrelWriter::new(ctx, Some(out));
    for sym in ctx
        .dynbss
        .symbols
        .iter()
        .chain(ctx.dynbss_relro.symbols.iter())
    {
        writer.push(Rel {
            r_offset: sym.get_addr(ctx),
            r_type: ctx.machine.r_copy(),
            r_sym: sym.get_dynsym_idx(ctx),
            r_addend: 0,
        });
    }
}

fn write_file_symtab(
    ctx: &Context,
    file_idx: u32,
    locals: &mut [u8],
    globals: &mut [u8],
    strtab: &mut [u8],
) {
    let class = ctx.machine.class();
    let entsize = class.sym_size();
    let file = &ctx.objs[file_idx as usize];
    let this = crate::input::FileRef::Obj(file_idx);

    let mut strtab_pos = 0usize;
    let strtab_base = file.strtab_offset;
    let mut local_pos = 0usize;
    let mut global_pos = 0usize;

    let mut write_one = |sym: &crate::symbol::Symbol, out: &mut [u8], pos: &mut usize| {
        let repr_esym = sym.esym(ctx);
        let name = sym.name();

        let mut esym = elf::Sym {
            st_name: (strtab_base + strtab_pos as u64) as u32,
            st_info: repr_esym.st_info,
            st_other: repr_esym.st_other,
            st_shndx: elf::SHN_UNDEF,
            st_value: 0,
            st_size: repr_esym.st_size,
        };

        let addr = sym.get_addr(ctx);
        esym.st_value = if repr_esym.typ() == elf::STT_TLS {
            addr.wrapping_sub(ctx.tls_begin)
        } else {
            addr
        };
        esym.st_shndx = match crate::chunks::synthetic::output_shndx(ctx, sym) {
            Some(shndx) => shndx,
            None if repr_esym.is_undef() => elf::SHN_UNDEF,
            None => elf::SHN_ABS,
        };

        esym.write_to(class, &mut out[*pos..]);
        *pos += entsize;

        strtab[strtab_pos..strtab_pos + name.len()].copy_from_slice(name.as_bytes());
        strtab_pos += name.len() + 1;
    };

    for i in 1..file.first_global.min(file.symbols.len()) {
        let sym = &file.symbols[i];
        if sym.write_to_symtab.load(std::sync::atomic::Ordering::Relaxed) {
            write_one(sym, locals, &mut local_pos);
        }
    }
    for i in file.globals() {
        let sym = &file.symbols[i];
        if sym.write_to_symtab.load(std::sync::atomic::Ordering::Relaxed)
            && crate::lock(&sym.repr).file == Some(this)
        {
            write_one(sym, globals, &mut global_pos);
        }
    }
}

fn write_ehframe(ctx: &Context, out: &mut [u8]) {
    let base_addr = ctx.ehframe.hdr.sh_addr;

    for cie_ref in &ctx.ehframe.cies {
        let file = &ctx.objs[cie_ref.file as usize];
        let cie = &file.cies[cie_ref.idx as usize];
        let Some(isec) = file.sections.get(cie.isec as usize).and_then(Option::as_ref) else {
            continue;
        };
        let size = cie.size(&isec.contents) as usize;
        let src = &isec.contents[cie.input_offset as usize..cie.input_offset as usize + size];
        let dst = cie.output_offset as usize;
        out[dst..dst + size].copy_from_slice(src);

        for rel in &isec.rels[cie.rel_begin as usize..cie.rel_end as usize] {
            apply_frame_reloc(ctx, file, isec, rel, cie.input_offset, dst as u64, out, base_addr);
        }
    }

    for fde_ref in &ctx.ehframe.fdes {
        let file = &ctx.objs[fde_ref.file as usize];
        let fde = &file.fdes[fde_ref.idx as usize];
        let Some(isec) = file.sections.get(fde.isec as usize).and_then(Option::as_ref) else {
            continue;
        };
        let size = fde.size(&isec.contents) as usize;
        let src = &isec.contents[fde.input_offset as usize..fde.input_offset as usize + size];
        let dst = fde.output_offset as usize;
        out[dst..dst + size].copy_from_slice(src);

        // Re-point the CIE back-offset at the deduplicated copy.
        let cie_out = file.cies[fde.cie_idx as usize].output_offset;
        elf::put_u32(out, dst + 4, fde.output_offset + 4 - cie_out);

        for rel in &isec.rels[fde.rel_begin as usize..fde.rel_end as usize] {
            apply_frame_reloc(ctx, file, isec, rel, fde.input_offset, dst as u64, out, base_addr);
        }
    }
    // The trailing null record is already zero.
}

#[allow(clippy::too_many_arguments)]
fn apply_frame_reloc(
    ctx: &Context,
    file: &crate::input::ObjectFile,
    isec: &crate::input::section::InputSection,
    rel: &Rel,
    record_input_offset: u32,
    record_output_offset: u64,
    out: &mut [u8],
    base_addr: u64,
) {
    let Some(sym) = file.symbols.get(rel.r_sym as usize) else {
        return;
    };
    let val = (sym.get_addr(ctx) as i64 + isec.get_addend(rel)) as u64;
    let loc = (record_output_offset + rel.r_offset - u64::from(record_input_offset)) as usize;
    let vaddr = base_addr + loc as u64;
    crate::arch::apply_ehframe_reloc(ctx, rel.r_type, out, loc, vaddr, val);
}

fn write_ehframe_hdr(ctx: &Context, out: &mut [u8]) {
    let hdr_addr = ctx.ehframehdr.hdr.sh_addr;
    let frame_addr = ctx.ehframe.hdr.sh_addr;

    out[0] = 1; // version
    out[1] = 0x1b; // eh_frame_ptr: sdata4 pcrel
    out[2] = 0x03; // fde_count: udata4
    out[3] = 0x3b; // table: sdata4 datarel
    elf::put_u32(out, 4, (frame_addr as i64 - hdr_addr as i64 - 4) as u32);
    elf::put_u32(out, 8, ctx.ehframe.fdes.len() as u32);

    // (function address, FDE address) pairs, sorted by function address
    // so the unwinder can binary-search.
    let mut entries: Vec<(i64, i64)> = Vec::with_capacity(ctx.ehframe.fdes.len());
    for fde_ref in &ctx.ehframe.fdes {
        let file = &ctx.objs[fde_ref.file as usize];
        let fde = &file.fdes[fde_ref.idx as usize];
        let Some(isec) = file.sections.get(fde.isec as usize).and_then(Option::as_ref) else {
            continue;
        };
        let rel = &isec.rels[fde.rel_begin as usize];
        let initial = file
            .symbols
            .get(rel.r_sym as usize)
            .map(|sym| sym.get_addr(ctx) as i64 + isec.get_addend(rel))
            .unwrap_or(0);
        let fde_addr = frame_addr as i64 + i64::from(fde.output_offset);
        entries.push((initial - hdr_addr as i64, fde_addr - hdr_addr as i64));
    }
    entries.sort_unstable();

    for (i, (initial, fde)) in entries.iter().enumerate() {
        let off = crate::chunks::synthetic::EhFrameHdrSection::HEADER_SIZE + i * 8;
        elf::put_u32(out, off, *initial as u32);
        elf::put_u32(out, off + 4, *fde as u32);
    }
}

/// Sort the .rela.dyn region: RELATIVE entries first (DT_RELACOUNT
/// counts them), IRELATIVE next (the iplt marker symbols bound them),
/// the rest by location
fn sort_reldyn(ctx: &Context, buf: &mut [u8]) {
    if ctx.reldyn.hdr.sh_size == 0 {
        return;
    }
    let class = ctx.machine.class();
    let is_rela = ctx.machine.is_rela();
    let entsize = class.rel_size(is_rela);
    let start = ctx.reldyn.hdr.sh_offset as usize;
    let end = start + ctx.reldyn.hdr.sh_size as usize;
    let region = &mut buf[start..end];

    let mut entries: Vec<Rel> = region
        .chunks_exact(entsize)
        .filter_map(|chunk| Rel::parse(class, is_rela, chunk))
        .collect();

    let r_relative = ctx.machine.r_relative();
    let r_irelative = ctx.machine.r_irelative();
    entries.sort_by_key(|rel| {
        let group = if rel.r_type == r_relative {
            0
        } else if rel.r_type == r_irelative {
            1
        } else {
            2
        };
        (group, rel.r_offset)
    });

    for (i, rel) in entries.iter().enumerate() {
        rel.write_to(class, is_rela, &mut region[i * entsize..]);
    }
}

fn stamp_build_id(ctx: &Context, buf: &mut [u8]) {
    let desc_off = ctx.buildid.hdr.sh_offset as usize + elf::Nhdr::SIZE + 4;
    match &ctx.options.build_id {
        BuildIdKind::None => {}
        BuildIdKind::Hex(bytes) => {
            buf[desc_off..desc_off + bytes.len()].copy_from_slice(bytes);
        }
        BuildIdKind::Fast => {
            // Digest the image with the note's descriptor still zero,
            // then patch it in.
            use std::hash::Hasher;
            let mid = buf.len() / 2;
            let mut h1 = FxHasher::default();
            h1.write(&buf[..mid]);
            let mut h2 = FxHasher::default();
            h2.write(&buf[mid..]);
            let digest: Vec<u8> = h1
                .finish()
                .to_le_bytes()
                .iter()
                .chain(h2.finish().to_le_bytes().iter())
                .copied()
                .collect();
            let n = digest.len().min(ctx.buildid.desc_size);
            buf[desc_off..desc_off + n].copy_from_slice(&digest[..n]);
        }
    }
}

/// Write the image to its output path with the executable bit set for
/// executables
pub fn write_file(ctx: &Context, image: &[u8]) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let path = &ctx.options.output;
    std::fs::write(path, image).map_err(|e| crate::error::Error::Io {
        path: path.clone(),
        kind: e.kind(),
    })?;

    if ctx.link_mode() != LinkMode::Dso {
        let perms = std::fs::Permissions::from_mode(0o755);
        std::fs::set_permissions(path, perms).map_err(|e| crate::error::Error::Io {
            path: path.clone(),
            kind: e.kind(),
        })?;
    }
    Ok(())
}
