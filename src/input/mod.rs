//! Input-file model
//!
//! Loads the command line's files (objects, archives, shared objects)
//! into the context, parses them in parallel, assigns the file priority
//! order that resolution ties break on, and synthesizes the internal
//! file that defines the linker-provided marker symbols.

use std::collections::BTreeSet;

use rayon::prelude::*;

use crate::archive;
use crate::context::Context;
use crate::elf::{self, Sym};
use crate::error::{Error, Result};

pub mod ehframe;
pub mod object;
pub mod section;
pub mod shared;

pub use object::ObjectFile;
pub use shared::SharedFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Which file list a file lives in
pub enum FileRef {
    /// Index into the object list; index 0 is the internal file
    Obj(u32),
    /// Index into the shared-object list
    Dso(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Stable name of one input section slot
pub struct SectionId {
    /// Owning object index
    pub file: u32,
    /// Section index within the file
    pub index: u32,
}

#[derive(Debug)]
/// A comdat signature record; files compete for ownership by priority
pub struct ComdatGroup {
    owner: std::sync::atomic::AtomicU32,
}

impl Default for ComdatGroup {
    fn default() -> Self {
        Self {
            owner: std::sync::atomic::AtomicU32::new(u32::MAX),
        }
    }
}

impl ComdatGroup {
    /// Compete for ownership; the lowest priority wins regardless of
    /// arrival order
    pub fn claim(&self, priority: u32) {
        self.owner
            .fetch_min(priority, std::sync::atomic::Ordering::Relaxed);
    }

    /// The winning file's priority
    pub fn owner(&self) -> u32 {
        self.owner.load(std::sync::atomic::Ordering::Relaxed)
    }
}

struct RawInput {
    name: String,
    archive_name: String,
    is_in_lib: bool,
    data: Vec<u8>,
}

/// Load, classify and parse every input path, then assign priorities and
/// create the internal file. Objects inside archives start dead; the
/// resolver's reachability phase pulls needed members in.
pub fn read_input_files(ctx: &mut Context, paths: &[String]) -> Result<()> {
    let mut raw_objs: Vec<RawInput> = Vec::new();
    let mut raw_dsos: Vec<RawInput> = Vec::new();

    for path in paths {
        let data = std::fs::read(path).map_err(|e| Error::Io {
            path: path.clone(),
            kind: e.kind(),
        })?;

        if archive::is_archive(&data) {
            for member in archive::read_archive_members(path, &data)? {
                raw_objs.push(RawInput {
                    name: member.name,
                    archive_name: path.clone(),
                    is_in_lib: true,
                    data: member.data,
                });
            }
            continue;
        }
        if archive::is_thin_archive(&data) {
            for member in archive::read_thin_archive_members(path, &data)? {
                raw_objs.push(RawInput {
                    name: member.name,
                    archive_name: path.clone(),
                    is_in_lib: true,
                    data: member.data,
                });
            }
            continue;
        }

        if data.len() < 18 || data[..4] != elf::ELF_MAGIC {
            return Err(Error::UnsupportedFileType { path: path.clone() });
        }
        let e_type = elf::u16le(&data, 16).unwrap_or(0);
        match e_type {
            elf::ET_REL => raw_objs.push(RawInput {
                name: path.clone(),
                archive_name: String::new(),
                is_in_lib: false,
                data,
            }),
            elf::ET_DYN => raw_dsos.push(RawInput {
                name: path.clone(),
                archive_name: String::new(),
                is_in_lib: false,
                data,
            }),
            _ => return Err(Error::UnsupportedFileType { path: path.clone() }),
        }
    }

    log::info!(
        "parsing {} object(s) and {} shared object(s)",
        raw_objs.len(),
        raw_dsos.len()
    );

    let shared: &Context = ctx;
    let objs: Result<Vec<ObjectFile>> = raw_objs
        .par_iter()
        .enumerate()
        .map(|(i, raw)| {
            ObjectFile::parse(
                shared,
                (i + 1) as u32,
                raw.name.clone(),
                raw.archive_name.clone(),
                raw.is_in_lib,
                &raw.data,
            )
        })
        .collect();

    let dsos: Result<Vec<SharedFile>> = raw_dsos
        .par_iter()
        .enumerate()
        .map(|(i, raw)| SharedFile::parse(shared, i as u32, raw.name.clone(), &raw.data))
        .collect();

    ctx.objs = Vec::with_capacity(raw_objs.len() + 1);
    ctx.objs.push(ObjectFile::internal(0));
    ctx.objs.extend(objs?);
    ctx.dsos = dsos?;

    set_file_priority(ctx);
    create_internal_file(ctx);
    Ok(())
}

/// Assign the total order resolution ties break on. Priority 1 is
/// reserved for the internal file; objects given directly on the command
/// line rank before archive members, which rank before shared objects.
fn set_file_priority(ctx: &mut Context) {
    let mut priority = 2u32;
    for file in ctx.objs.iter_mut().skip(1) {
        if !file.is_in_lib {
            file.priority = priority;
            priority += 1;
        }
    }
    for file in ctx.objs.iter_mut().skip(1) {
        if file.is_in_lib {
            file.priority = priority;
            priority += 1;
        }
    }
    for file in ctx.dsos.iter_mut() {
        file.priority = priority;
        priority += 1;
    }
}

/// Populate the internal file with linker-synthesized symbols: layout
/// markers, iplt bounds, and `__start_`/`__stop_` pairs for every
/// C-identifier-named section present in the inputs.
fn create_internal_file(ctx: &mut Context) {
    let mut names: Vec<(String, u8)> = vec![
        ("__ehdr_start".to_string(), elf::STB_GLOBAL),
        ("__executable_start".to_string(), elf::STB_GLOBAL),
        ("__init_array_start".to_string(), elf::STB_GLOBAL),
        ("__init_array_end".to_string(), elf::STB_GLOBAL),
        ("__fini_array_start".to_string(), elf::STB_GLOBAL),
        ("__fini_array_end".to_string(), elf::STB_GLOBAL),
        ("__preinit_array_start".to_string(), elf::STB_GLOBAL),
        ("__preinit_array_end".to_string(), elf::STB_GLOBAL),
        ("_DYNAMIC".to_string(), elf::STB_GLOBAL),
        ("_GLOBAL_OFFSET_TABLE_".to_string(), elf::STB_GLOBAL),
        ("__bss_start".to_string(), elf::STB_GLOBAL),
        ("_end".to_string(), elf::STB_GLOBAL),
        ("_etext".to_string(), elf::STB_GLOBAL),
        ("_edata".to_string(), elf::STB_GLOBAL),
        ("end".to_string(), elf::STB_WEAK),
        ("etext".to_string(), elf::STB_WEAK),
        ("edata".to_string(), elf::STB_WEAK),
    ];

    if ctx.machine.is_rela() {
        names.push(("__rela_iplt_start".to_string(), elf::STB_GLOBAL));
        names.push(("__rela_iplt_end".to_string(), elf::STB_GLOBAL));
    } else {
        names.push(("__rel_iplt_start".to_string(), elf::STB_GLOBAL));
        names.push(("__rel_iplt_end".to_string(), elf::STB_GLOBAL));
    }
    if ctx.options.eh_frame_hdr {
        names.push(("__GNU_EH_FRAME_HDR".to_string(), elf::STB_GLOBAL));
    }

    // __start_X / __stop_X for C-identifier-named sections, collected
    // in name order so symbol table indices are deterministic.
    let mut sect_names: BTreeSet<String> = BTreeSet::new();
    for file in ctx.objs.iter().skip(1) {
        for isec in file.sections.iter().flatten() {
            let canonical = crate::chunks::canonical_name(&isec.name);
            if crate::is_c_identifier(canonical) {
                sect_names.insert(canonical.to_string());
            }
        }
    }
    for name in sect_names {
        names.push((format!("__start_{name}"), elf::STB_GLOBAL));
        names.push((format!("__stop_{name}"), elf::STB_GLOBAL));
    }

    let mut elf_syms = vec![Sym::default()];
    let mut symbols = vec![std::sync::Arc::new(crate::symbol::Symbol::new(""))];
    for (name, bind) in &names {
        elf_syms.push(Sym {
            st_name: 0,
            st_info: Sym::info(*bind, elf::STT_NOTYPE),
            st_other: elf::STV_HIDDEN,
            st_shndx: elf::SHN_ABS,
            st_value: 0,
            st_size: 0,
        });
        symbols.push(ctx.intern(name));
    }

    let internal = &mut ctx.objs[0];
    internal.priority = 1;
    internal.first_global = 1;
    internal.elf_syms = elf_syms;
    let num_globals = symbols.len() - 1;
    internal.symbols = symbols;
    internal.symvers = vec![None; num_globals];
    internal.set_alive();
}

/// Parse every `.eh_frame` section into CIE and FDE records and retire
/// the sections themselves; the synthetic frame builder re-emits live
/// records later.
pub fn parse_ehframe_sections(ctx: &mut Context) -> Result<()> {
    let machine = ctx.machine;
    ctx.objs.par_iter_mut().try_for_each(|file| -> Result<()> {
        if !file.is_alive() {
            return Ok(());
        }
        for i in 0..file.sections.len() {
            let is_ehframe = matches!(
                &file.sections[i],
                Some(isec) if isec.is_alive() && isec.name == ".eh_frame"
            );
            if !is_ehframe {
                continue;
            }
            ehframe::read_ehframe(file, i, machine)?;
            if let Some(isec) = file.sections[i].as_mut() {
                isec.is_ehframe = true;
                isec.kill();
            }
        }
        Ok(())
    })
}
