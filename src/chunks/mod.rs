//! Output chunks
//!
//! Everything that occupies space in the output image is a chunk: the
//! ELF header, the program and section header tables, regular output
//! sections binned from input sections, merged string sections, and the
//! synthetic sections of `synthetic`. Chunks are addressed by [ChunkId];
//! the context resolves an id to its header and name so layout can walk
//! one ordered list.

use std::sync::RwLock;

use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::context::Context;
use crate::elf::{Shdr, SHF_COMPRESSED, SHF_GROUP};
use crate::input::SectionId;

pub mod synthetic;

/// Input-section name prefixes that collapse into one output section.
/// Longer prefixes come first so `.data.rel.ro.x` does not land in
/// `.data`.
const CANONICAL_PREFIXES: &[&str] = &[
    ".data.rel.ro.",
    ".gcc_except_table.",
    ".bss.rel.ro.",
    ".init_array.",
    ".fini_array.",
    ".rodata.",
    ".ctors.",
    ".dtors.",
    ".tdata.",
    ".text.",
    ".data.",
    ".tbss.",
    ".bss.",
];

/// Collapse a section-name suffix: `.text.foo` becomes `.text`
pub fn canonical_name(name: &str) -> &str {
    for prefix in CANONICAL_PREFIXES {
        if name.starts_with(prefix) {
            return &prefix[..prefix.len() - 1];
        }
    }
    name
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Every chunk the image can contain
pub enum ChunkId {
    /// The ELF file header
    Ehdr,
    /// The program header table
    Phdr,
    /// The section header table
    Shdr,
    /// A regular output section, by index
    Osec(u32),
    /// A merged string/record section, by index
    Merged(u32),
    /// .got
    Got,
    /// .got.plt
    GotPlt,
    /// .plt
    Plt,
    /// .plt.got
    PltGot,
    /// .rela.dyn (or .rel.dyn)
    RelDyn,
    /// .rela.plt (or .rel.plt)
    RelPlt,
    /// .dynsym
    Dynsym,
    /// .dynstr
    Dynstr,
    /// .dynamic
    Dynamic,
    /// .hash
    Hash,
    /// .gnu.hash
    GnuHash,
    /// .interp
    Interp,
    /// .note.gnu.build-id
    BuildId,
    /// .eh_frame
    EhFrame,
    /// .eh_frame_hdr
    EhFrameHdr,
    /// .copyrel
    Copyrel,
    /// .copyrel.rel.ro
    CopyrelRelro,
    /// .gnu.version
    Versym,
    /// .gnu.version_r
    Verneed,
    /// .gnu.version_d
    Verdef,
    /// .symtab
    Symtab,
    /// .strtab
    Strtab,
    /// .shstrtab
    Shstrtab,
}

#[derive(Debug)]
/// A regular output section holding binned input sections
pub struct OutputSection {
    /// Output section name
    pub name: String,
    /// Output header
    pub hdr: Shdr,
    /// This section's index in the frozen list
    pub idx: u32,
    /// Members in file-priority order
    pub members: Vec<SectionId>,
    /// Output section header index
    pub shndx: u32,
}

#[derive(Debug, Default)]
/// Registry assigning output-section ids during parallel parsing.
/// Lookup of an existing key takes the shared lock; creating a section
/// escalates to the exclusive one.
pub struct OutputSectionRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    keys: FxHashMap<(String, u64, u32), u32>,
    entries: Vec<(String, u32, u64)>,
}

impl OutputSectionRegistry {
    /// Get or create the output section for `(name, type, flags)`
    pub fn get_or_create(&self, name: &str, sh_type: u32, sh_flags: u64) -> u32 {
        let name = canonical_name(name);
        let flags = sh_flags & !SHF_GROUP & !SHF_COMPRESSED;
        let key = (name.to_string(), flags, sh_type);

        if let Some(&idx) = crate::read_lock(&self.inner).keys.get(&key) {
            return idx;
        }

        let mut inner = crate::write_lock(&self.inner);
        if let Some(&idx) = inner.keys.get(&key) {
            return idx;
        }
        let idx = inner.entries.len() as u32;
        inner.entries.push((key.0.clone(), sh_type, flags));
        inner.keys.insert(key, idx);
        idx
    }

    /// Materialize the registered sections in creation order
    pub fn freeze(&self) -> Vec<OutputSection> {
        crate::read_lock(&self.inner)
            .entries
            .iter()
            .enumerate()
            .map(|(idx, (name, sh_type, sh_flags))| OutputSection {
                name: name.clone(),
                hdr: Shdr {
                    sh_type: *sh_type,
                    sh_flags: *sh_flags,
                    sh_addralign: 1,
                    ..Shdr::default()
                },
                idx: idx as u32,
                members: Vec::new(),
                shndx: 0,
            })
            .collect()
    }
}

/// Build each output section's member list. Workers collect members
/// per file slice into local vectors which are concatenated in slice
/// order, so member order is file order regardless of scheduling.
pub fn bin_sections(ctx: &mut Context) {
    ctx.output_sections = ctx.osec_registry.freeze();
    let num_osec = ctx.output_sections.len();
    if num_osec == 0 {
        return;
    }

    let unit = ctx.objs.len().div_ceil(128).max(1);
    let slices: Vec<&[crate::input::ObjectFile]> = ctx.objs.chunks(unit).collect();

    let groups: Vec<Vec<Vec<SectionId>>> = slices
        .par_iter()
        .map(|slice| {
            let mut group: Vec<Vec<SectionId>> = vec![Vec::new(); num_osec];
            for file in *slice {
                if !file.is_alive() {
                    continue;
                }
                for isec in file.sections.iter().flatten() {
                    if isec.is_alive() && isec.osec != crate::symbol::NONE_IDX {
                        group[isec.osec as usize].push(SectionId {
                            file: isec.file,
                            index: isec.index,
                        });
                    }
                }
            }
            group
        })
        .collect();

    ctx.output_sections
        .par_iter_mut()
        .for_each(|osec| {
            let total: usize = groups.iter().map(|g| g[osec.idx as usize].len()).sum();
            osec.members.reserve(total);
            for group in &groups {
                osec.members.extend_from_slice(&group[osec.idx as usize]);
            }
        });
}

/// Assign each member its offset inside its output section and compute
/// section sizes. Large member lists are laid out slice-by-slice in
/// parallel and folded with a prefix sum.
pub fn compute_section_sizes(ctx: &mut Context) {
    let objs = &ctx.objs;

    ctx.output_sections.par_iter_mut().for_each(|osec| {
        if osec.members.is_empty() {
            return;
        }

        let isec_of = |sid: &SectionId| {
            objs[sid.file as usize].sections[sid.index as usize]
                .as_ref()
        };

        let slices: Vec<&[SectionId]> = osec.members.chunks(10_000).collect();
        let mut sizes = vec![0u64; slices.len()];
        let mut aligns = vec![1u64; slices.len()];

        slices
            .par_iter()
            .zip(sizes.par_iter_mut().zip(aligns.par_iter_mut()))
            .for_each(|(slice, (size, align))| {
                let mut off = 0u64;
                for sid in *slice {
                    let Some(isec) = isec_of(sid) else { continue };
                    off = crate::align_to(off, isec.shdr.sh_addralign);
                    isec.set_offset(off);
                    off += isec.shdr.sh_size;
                    *align = (*align).max(isec.shdr.sh_addralign);
                }
                *size = off;
            });

        let align = aligns.iter().copied().max().unwrap_or(1);
        let mut starts = vec![0u64; slices.len()];
        for i in 1..slices.len() {
            starts[i] = crate::align_to(starts[i - 1] + sizes[i - 1], align);
        }

        slices
            .par_iter()
            .zip(starts.par_iter())
            .skip(1)
            .for_each(|(slice, start)| {
                for sid in *slice {
                    if let Some(isec) = isec_of(sid) {
                        isec.add_offset(*start);
                    }
                }
            });

        osec.hdr.sh_size = starts.last().copied().unwrap_or(0) + sizes.last().copied().unwrap_or(0);
        osec.hdr.sh_addralign = align;
    });
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_canonical_name_collapses_suffixes() {
        assert_eq!(canonical_name(".text.foo"), ".text");
        assert_eq!(canonical_name(".text"), ".text");
        assert_eq!(canonical_name(".data.rel.ro.bar"), ".data.rel.ro");
        assert_eq!(canonical_name(".data.x"), ".data");
        assert_eq!(canonical_name(".bss.abc"), ".bss");
        assert_eq!(canonical_name(".mysection"), ".mysection");
        assert_eq!(canonical_name(".rodata.str1.1"), ".rodata");
    }

    #[test]
    fn test_registry_is_keyed_on_name_flags_type() {
        use crate::elf::{SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHT_NOBITS, SHT_PROGBITS};

        let registry = OutputSectionRegistry::default();
        let text = registry.get_or_create(".text.f", SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR);
        let text2 = registry.get_or_create(".text.g", SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR);
        assert_eq!(text, text2);

        // Same name, different type or flags: distinct sections.
        let bss = registry.get_or_create(".bss.x", SHT_NOBITS, SHF_ALLOC | SHF_WRITE);
        assert_ne!(text, bss);

        let frozen = registry.freeze();
        assert_eq!(frozen.len(), 2);
        assert_eq!(frozen[text as usize].name, ".text");
        assert_eq!(frozen[bss as usize].name, ".bss");
    }

    #[test]
    fn test_group_flag_is_ignored_in_key() {
        use crate::elf::{SHF_ALLOC, SHT_PROGBITS};

        let registry = OutputSectionRegistry::default();
        let a = registry.get_or_create(".rodata", SHT_PROGBITS, SHF_ALLOC | SHF_GROUP);
        let b = registry.get_or_create(".rodata", SHT_PROGBITS, SHF_ALLOC);
        assert_eq!(a, b);
    }
}
