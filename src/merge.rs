//! Mergeable-section splitting and deduplication
//!
//! Sections carrying SHF_MERGE are cut into fragments (null-terminated
//! strings or fixed-size records), interned per output section so equal
//! bytes collapse to one canonical fragment, and every relocation or
//! symbol that pointed into the original section is redirected to a
//! fragment plus offset. The original section is then dead; its bytes
//! survive only through fragments that stay alive.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::context::Context;
use crate::elf::{
    Shdr, SHF_COMPRESSED, SHF_GROUP, SHF_MERGE, SHF_STRINGS, SHT_PROGBITS, STT_SECTION,
};
use crate::error::{Error, Result};
use crate::input::FileRef;
use crate::input::section::FragmentRef;
use crate::symbol::Origin;

/// Alignment is stored in 16 bits; anything larger is rejected
const MAX_FRAGMENT_ALIGN: u64 = u16::MAX as u64;

#[derive(Debug)]
/// An interned piece of a mergeable section
pub struct SectionFragment {
    /// Index of the owning merged output section
    pub parent: u32,
    /// The fragment bytes
    pub data: Box<[u8]>,
    offset: AtomicU64,
    alignment: AtomicU16,
    alive: AtomicBool,
}

impl SectionFragment {
    fn new(parent: u32, data: &[u8]) -> Self {
        Self {
            parent,
            data: data.into(),
            offset: AtomicU64::new(0),
            alignment: AtomicU16::new(1),
            alive: AtomicBool::new(false),
        }
    }

    /// Raise the alignment requirement to at least `align`
    pub fn update_alignment(&self, align: u16) {
        self.alignment.fetch_max(align.max(1), Ordering::Relaxed);
    }

    /// Current alignment requirement
    pub fn alignment(&self) -> u16 {
        self.alignment.load(Ordering::Relaxed)
    }

    /// Whether any live reference keeps this fragment in the output
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Keep the fragment in the output
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    /// Offset inside the merged output section, valid after offsets were
    /// assigned
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Relaxed)
    }

    /// Final virtual address
    pub fn get_addr(&self, ctx: &Context) -> u64 {
        ctx.merged_sections[self.parent as usize].hdr.sh_addr + self.offset()
    }
}

#[derive(Debug)]
/// The shared fragment interner backing one merged output section
pub struct MergedCore {
    /// Index this merged section will occupy after the freeze
    pub id: u32,
    map: crate::interner::ConcurrentMap<SectionFragment>,
}

impl MergedCore {
    /// Intern a fragment, merging alignment constraints
    pub fn insert(&self, data: &[u8], align: u64) -> Arc<SectionFragment> {
        let id = self.id;
        let (frag, _) = self.map.insert_with(data, || SectionFragment::new(id, data));
        frag.update_alignment(align.min(MAX_FRAGMENT_ALIGN) as u16);
        frag
    }
}

#[derive(Debug)]
/// A merged output section after the registry freeze
pub struct MergedSection {
    /// Output section name
    pub name: String,
    /// Output header; address and offset are filled in by layout
    pub hdr: Shdr,
    /// Live fragments in their assigned order
    pub fragments: Vec<Arc<SectionFragment>>,
    /// Output section header index
    pub shndx: u32,
    core: Arc<MergedCore>,
}

impl MergedSection {
    /// Assign fragment offsets and compute the section size. Fragments
    /// are ordered by content so equal inputs produce identical output.
    pub fn assign_offsets(&mut self) {
        let mut frags: Vec<Arc<SectionFragment>> = Vec::new();
        self.core.map.for_each(|_, frag| {
            if frag.is_alive() {
                frags.push(Arc::clone(frag));
            }
        });
        frags.sort_by(|a, b| a.data.cmp(&b.data));

        let mut offset = 0u64;
        let mut align = 1u64;
        for frag in &frags {
            let frag_align = u64::from(frag.alignment());
            offset = crate::align_to(offset, frag_align);
            frag.offset.store(offset, Ordering::Relaxed);
            offset += frag.data.len() as u64;
            align = align.max(frag_align);
        }

        self.hdr.sh_size = offset;
        self.hdr.sh_addralign = align;
        self.fragments = frags;
    }
}

#[derive(Debug, Default)]
/// Registry handing out merged-section interners during the parallel
/// splitting phase; frozen into `Context::merged_sections` afterwards
pub struct MergedSectionRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    keys: FxHashMap<(String, u32, u64), u32>,
    entries: Vec<RegistryEntry>,
}

#[derive(Debug)]
struct RegistryEntry {
    name: String,
    sh_type: u32,
    sh_flags: u64,
    sh_entsize: u64,
    core: Arc<MergedCore>,
}

impl MergedSectionRegistry {
    /// Get or create the interner for `(name, type, flags)`; lookups of
    /// existing sections take the shared lock only
    pub fn get_instance(
        &self,
        name: &str,
        sh_type: u32,
        sh_flags: u64,
        sh_entsize: u64,
    ) -> Arc<MergedCore> {
        let name = crate::chunks::canonical_name(name);
        let flags = sh_flags & !SHF_GROUP & !SHF_COMPRESSED;
        let key = (name.to_string(), sh_type, flags);

        if let Some(&idx) = crate::read_lock(&self.inner).keys.get(&key) {
            return Arc::clone(&crate::read_lock(&self.inner).entries[idx as usize].core);
        }

        let mut inner = crate::write_lock(&self.inner);
        if let Some(&idx) = inner.keys.get(&key) {
            return Arc::clone(&inner.entries[idx as usize].core);
        }
        let id = inner.entries.len() as u32;
        let core = Arc::new(MergedCore {
            id,
            map: crate::interner::ConcurrentMap::new(),
        });
        inner.entries.push(RegistryEntry {
            name: key.0.clone(),
            sh_type,
            sh_flags: flags,
            sh_entsize,
            core: Arc::clone(&core),
        });
        inner.keys.insert(key, id);
        core
    }

    /// Section flags of a registered merged section, available before
    /// the freeze (the garbage collector asks whether a fragment's
    /// parent is allocated)
    pub fn entry_flags(&self, id: u32) -> u64 {
        crate::read_lock(&self.inner)
            .entries
            .get(id as usize)
            .map(|e| e.sh_flags)
            .unwrap_or(0)
    }

    /// Turn the registry into the frozen merged-section list
    pub fn freeze(&self) -> Vec<MergedSection> {
        let inner = crate::read_lock(&self.inner);
        inner
            .entries
            .iter()
            .map(|entry| MergedSection {
                name: entry.name.clone(),
                hdr: Shdr {
                    sh_type: entry.sh_type,
                    sh_flags: entry.sh_flags,
                    sh_entsize: entry.sh_entsize,
                    sh_addralign: 1,
                    ..Shdr::default()
                },
                fragments: Vec::new(),
                shndx: 0,
                core: Arc::clone(&entry.core),
            })
            .collect()
    }
}

/// Per-section split result kept while redirections are computed
struct SplitSection {
    fragments: Vec<Arc<SectionFragment>>,
    offsets: Vec<u32>,
}

fn find_null(data: &[u8], entsize: usize) -> Option<usize> {
    if entsize == 1 {
        return data.iter().position(|&b| b == 0);
    }
    let mut pos = 0;
    while pos + entsize <= data.len() {
        if data[pos..pos + entsize].iter().all(|&b| b == 0) {
            return Some(pos);
        }
        pos += entsize;
    }
    None
}

/// Cut one mergeable section into interned fragments
fn split_section(
    core: &MergedCore,
    isec: &crate::input::section::InputSection,
    file_name: &str,
) -> Result<SplitSection> {
    let mut rec = SplitSection {
        fragments: Vec::new(),
        offsets: Vec::new(),
    };

    if isec.shdr.sh_addralign > MAX_FRAGMENT_ALIGN {
        return Err(Error::AlignmentTooLarge {
            path: file_name.to_string(),
            section: isec.name.clone(),
        });
    }

    let entsize = (isec.shdr.sh_entsize.max(1)) as usize;
    let align = isec.shdr.sh_addralign;
    let mut data: &[u8] = &isec.contents;
    let mut pos = 0usize;

    if isec.shdr.sh_flags & SHF_STRINGS != 0 {
        while !data.is_empty() {
            let end = find_null(data, entsize).ok_or_else(|| Error::StringNotTerminated {
                path: file_name.to_string(),
                section: isec.name.clone(),
            })?;
            let substr = &data[..end + entsize];
            rec.fragments.push(core.insert(substr, align));
            rec.offsets.push(pos as u32);
            pos += substr.len();
            data = &data[substr.len()..];
        }
    } else {
        if data.len() % entsize != 0 {
            return Err(Error::BadEntitySize {
                path: file_name.to_string(),
                section: isec.name.clone(),
            });
        }
        while !data.is_empty() {
            let substr = &data[..entsize];
            rec.fragments.push(core.insert(substr, align));
            rec.offsets.push(pos as u32);
            pos += entsize;
            data = &data[entsize..];
        }
    }

    Ok(rec)
}

/// Largest fragment origin less than or equal to `offset`
fn lookup(splits: &SplitSection, offset: i64) -> Option<(usize, i64)> {
    if offset < 0 {
        return None;
    }
    let pos = splits.offsets.partition_point(|&o| i64::from(o) <= offset);
    if pos == 0 {
        return None;
    }
    Some((pos - 1, offset - i64::from(splits.offsets[pos - 1])))
}

/// Split every live SHF_MERGE section, intern its pieces and redirect
/// relocations and symbols into the canonical fragments
pub fn split_mergeable_sections(ctx: &mut Context) -> Result<()> {
    let registry = &ctx.merged_registry;
    let objs = &mut ctx.objs;

    objs.par_iter_mut().try_for_each(|file| -> Result<()> {
        if !file.is_alive() {
            return Ok(());
        }

        let mut splits: Vec<Option<SplitSection>> = Vec::new();
        splits.resize_with(file.sections.len(), || None);

        for i in 0..file.sections.len() {
            let Some(isec) = &file.sections[i] else {
                continue;
            };
            if !isec.is_alive() || isec.shdr.sh_flags & SHF_MERGE == 0 {
                continue;
            }
            let core = registry.get_instance(
                &isec.name,
                isec.shdr.sh_type,
                isec.shdr.sh_flags,
                isec.shdr.sh_entsize,
            );
            let rec = split_section(&core, isec, &file.name)?;
            file.fragments.extend(rec.fragments.iter().cloned());
            splits[i] = Some(rec);
            isec.kill();
        }

        if splits.iter().all(Option::is_none) {
            return Ok(());
        }

        // Redirect relocations whose target is a section symbol of a
        // split section.
        let elf_syms = file.elf_syms.clone();
        let shndx_of = |sym_idx: usize| -> Option<usize> {
            let esym = elf_syms.get(sym_idx)?;
            if esym.is_abs() || esym.is_common() || esym.is_undef() {
                return None;
            }
            Some(esym.st_shndx as usize)
        };

        for sect_idx in 0..file.sections.len() {
            let Some(isec) = &file.sections[sect_idx] else {
                continue;
            };
            if !isec.is_alive() || isec.rels.is_empty() {
                continue;
            }

            let mut refs: Vec<FragmentRef> = Vec::new();
            for (rel_idx, rel) in isec.rels.iter().enumerate() {
                let Some(esym) = elf_syms.get(rel.r_sym as usize) else {
                    continue;
                };
                if esym.typ() != STT_SECTION {
                    continue;
                }
                let Some(shndx) = shndx_of(rel.r_sym as usize) else {
                    continue;
                };
                let Some(split) = splits.get(shndx).and_then(Option::as_ref) else {
                    continue;
                };

                let offset = esym.st_value as i64 + isec.get_addend(rel);
                let (idx, addend) =
                    lookup(split, offset).ok_or_else(|| Error::BadFragmentRelocation {
                        path: file.name.clone(),
                        index: rel.r_sym,
                    })?;
                refs.push(FragmentRef {
                    rel_idx: rel_idx as u32,
                    frag: Arc::clone(&split.fragments[idx]),
                    addend,
                });
            }

            if !refs.is_empty() {
                // fragment_ref() binary-searches this list.
                if let Some(isec) = file.sections[sect_idx].as_mut() {
                    isec.rel_fragments = refs;
                }
            }
        }

        // Redirect symbols defined inside split sections, if this file
        // still owns them.
        let this = FileRef::Obj(file.id);
        for (i, esym) in elf_syms.iter().enumerate() {
            if esym.is_abs() || esym.is_common() || esym.is_undef() {
                continue;
            }
            let Some(split) = splits
                .get(esym.st_shndx as usize)
                .and_then(Option::as_ref)
            else {
                continue;
            };

            let sym = &file.symbols[i];
            let mut repr = crate::lock(&sym.repr);
            if repr.file != Some(this) || repr.sym_idx != i as u32 {
                continue;
            }
            let (idx, addend) = lookup(split, esym.st_value as i64).ok_or_else(|| {
                Error::BadFragmentSymbol {
                    path: file.name.clone(),
                    value: esym.st_value,
                }
            })?;
            repr.origin = Origin::Fragment(Arc::clone(&split.fragments[idx]));
            repr.value = addend as u64;
        }

        Ok(())
    })
}

/// Mark referenced fragments alive, add the linker identification string
/// to .comment, freeze the registry and lay the fragments out
pub fn compute_merged_section_sizes(ctx: &mut Context) {
    if !ctx.options.gc_sections {
        ctx.objs.par_iter().for_each(|file| {
            for frag in &file.fragments {
                frag.mark_alive();
            }
        });
    }

    add_comment_string(ctx, concat!("linker: elfld ", env!("CARGO_PKG_VERSION")));

    ctx.merged_sections = ctx.merged_registry.freeze();
    ctx.merged_sections
        .par_iter_mut()
        .for_each(MergedSection::assign_offsets);
}

fn add_comment_string(ctx: &Context, text: &str) {
    let core = ctx
        .merged_registry
        .get_instance(".comment", SHT_PROGBITS, SHF_MERGE | SHF_STRINGS, 1);
    let mut bytes = text.as_bytes().to_vec();
    bytes.push(0);
    core.insert(&bytes, 1).mark_alive();
}

#[cfg(test)]
mod test {
    use super::*;

    fn core() -> Arc<MergedCore> {
        Arc::new(MergedCore {
            id: 0,
            map: crate::interner::ConcurrentMap::new(),
        })
    }

    fn string_section(bytes: &[u8], entsize: u64) -> crate::input::section::InputSection {
        crate::input::section::InputSection::new(
            0,
            1,
            ".rodata.str1.1".to_string(),
            Shdr {
                sh_type: SHT_PROGBITS,
                sh_flags: crate::elf::SHF_ALLOC | SHF_MERGE | SHF_STRINGS,
                sh_entsize: entsize,
                sh_addralign: 1,
                sh_size: bytes.len() as u64,
                ..Shdr::default()
            },
            bytes.into(),
        )
    }

    #[test]
    fn test_split_deduplicates_strings() {
        let core = core();
        let isec = string_section(b"hi\0world\0hi\0", 1);
        let rec = split_section(&core, &isec, "a.o").unwrap_or_else(|_| unreachable!());

        assert_eq!(rec.offsets, vec![0, 3, 9]);
        assert_eq!(rec.fragments.len(), 3);
        // First and third strings are the same fragment.
        assert!(Arc::ptr_eq(&rec.fragments[0], &rec.fragments[2]));
        assert!(!Arc::ptr_eq(&rec.fragments[0], &rec.fragments[1]));
    }

    #[test]
    fn test_split_single_null_string() {
        let core = core();
        let isec = string_section(b"\0", 1);
        let rec = split_section(&core, &isec, "a.o").unwrap_or_else(|_| unreachable!());
        assert_eq!(rec.fragments.len(), 1);
        assert_eq!(&*rec.fragments[0].data, b"\0");
    }

    #[test]
    fn test_split_unterminated_string_fails() {
        let core = core();
        let isec = string_section(b"hi\0oops", 1);
        assert!(matches!(
            split_section(&core, &isec, "a.o"),
            Err(Error::StringNotTerminated { .. })
        ));
    }

    #[test]
    fn test_split_fixed_records() {
        let core = core();
        let mut isec = string_section(b"aaaabbbbaaaa", 4);
        isec.shdr.sh_flags = crate::elf::SHF_ALLOC | SHF_MERGE;
        let rec = split_section(&core, &isec, "a.o").unwrap_or_else(|_| unreachable!());
        assert_eq!(rec.fragments.len(), 3);
        assert!(Arc::ptr_eq(&rec.fragments[0], &rec.fragments[2]));

        let mut bad = string_section(b"aaaabb", 4);
        bad.shdr.sh_flags = crate::elf::SHF_ALLOC | SHF_MERGE;
        assert!(matches!(
            split_section(&core, &bad, "a.o"),
            Err(Error::BadEntitySize { .. })
        ));
    }

    #[test]
    fn test_lookup_picks_greatest_origin() {
        let core = core();
        let isec = string_section(b"hi\0world\0hi\0", 1);
        let rec = split_section(&core, &isec, "a.o").unwrap_or_else(|_| unreachable!());

        // addend 3 lands at the start of "world"; addend 9 at the second
        // "hi", which interned to the first fragment.
        let (idx, addend) = lookup(&rec, 3).unwrap_or_else(|| unreachable!());
        assert_eq!((idx, addend), (1, 0));
        let (idx, addend) = lookup(&rec, 9).unwrap_or_else(|| unreachable!());
        assert_eq!(idx, 2);
        assert_eq!(addend, 0);
        assert!(Arc::ptr_eq(&rec.fragments[idx], &rec.fragments[0]));

        let (idx, addend) = lookup(&rec, 5).unwrap_or_else(|| unreachable!());
        assert_eq!((idx, addend), (1, 2));
    }

    #[test]
    fn test_assign_offsets_is_deterministic() {
        let registry = MergedSectionRegistry::default();
        let core = registry.get_instance(".rodata.str1.1", SHT_PROGBITS, SHF_MERGE | SHF_STRINGS, 1);
        core.insert(b"world\0", 1).mark_alive();
        core.insert(b"hi\0", 1).mark_alive();
        core.insert(b"dead\0", 1); // never marked alive

        let mut sections = registry.freeze();
        sections[0].assign_offsets();

        let names: Vec<&[u8]> = sections[0].fragments.iter().map(|f| &*f.data).collect();
        assert_eq!(names, vec![b"hi\0".as_slice(), b"world\0".as_slice()]);
        assert_eq!(sections[0].hdr.sh_size, 9);
        assert_eq!(sections[0].fragments[0].offset(), 0);
        assert_eq!(sections[0].fragments[1].offset(), 3);
    }
}
