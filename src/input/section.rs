//! Input sections
//!
//! An [InputSection] is one contiguous byte range pulled out of an input
//! file, carrying its (possibly decompressed) contents, its relocations
//! and the bookkeeping the later phases attach: the output section it was
//! binned into, its offset there, liveness bits, and the slice of
//! `.rela.dyn` it reserved during scanning.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::context::Context;
use crate::elf::{Rel, Shdr, SHT_NOBITS};
use crate::merge::SectionFragment;
use crate::scan::RelAction;
use crate::symbol::NONE_IDX;

#[derive(Debug, Clone)]
/// A relocation redirected into a merged-section fragment
pub struct FragmentRef {
    /// Index of the relocation this redirection applies to
    pub rel_idx: u32,
    /// The canonical fragment
    pub frag: Arc<SectionFragment>,
    /// Addend relative to the fragment origin
    pub addend: i64,
}

#[derive(Debug)]
/// A section read from an input object
pub struct InputSection {
    /// Owning object's index in the context
    pub file: u32,
    /// Section index within the owning file
    pub index: u32,
    /// Section name
    pub name: String,
    /// Header copy; decompression updates size, flags and alignment
    pub shdr: Shdr,
    /// Section bytes, decompressed if the input was compressed
    pub contents: Box<[u8]>,
    /// Parsed relocations targeting this section
    pub rels: Vec<Rel>,
    /// Per-relocation classifier filled by the scanner (alloc only);
    /// encoded [RelAction] values, written concurrently by the owning
    /// file's scan worker
    pub rel_actions: Box<[AtomicU8]>,
    /// Relocations redirected into merged fragments, by relocation index
    pub rel_fragments: Vec<FragmentRef>,
    /// Output section id after binning
    pub osec: u32,
    /// Whether the relocations came from a RELA section
    pub is_rela: bool,
    /// This is an .eh_frame section consumed by the frame builder
    pub is_ehframe: bool,
    /// Index of this section's first reserved entry inside its file's
    /// .rela.dyn region
    pub reldyn_offset: AtomicU64,
    /// Dynamic relocations this section will emit
    pub num_dynrel: AtomicU64,
    /// How many of those are R_*_RELATIVE
    pub num_baserel: AtomicU64,
    /// Range of this section's FDEs in the owning file's FDE list
    pub fde_begin: u32,
    /// End of the FDE range
    pub fde_end: u32,
    offset: AtomicU64,
    alive: AtomicBool,
    visited: AtomicBool,
}

impl InputSection {
    /// Create a section; liveness starts as given (archive members start
    /// dead until reachability pulls them in, but section-level liveness
    /// is per-section and starts true)
    pub fn new(file: u32, index: u32, name: String, shdr: Shdr, contents: Box<[u8]>) -> Self {
        Self {
            file,
            index,
            name,
            shdr,
            contents,
            rels: Vec::new(),
            rel_actions: Box::new([]),
            rel_fragments: Vec::new(),
            osec: NONE_IDX,
            is_rela: true,
            is_ehframe: false,
            reldyn_offset: AtomicU64::new(0),
            num_dynrel: AtomicU64::new(0),
            num_baserel: AtomicU64::new(0),
            fde_begin: NONE_IDX,
            fde_end: NONE_IDX,
            offset: AtomicU64::new(0),
            alive: AtomicBool::new(true),
            visited: AtomicBool::new(false),
        }
    }

    /// Whether the section still participates in the link
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Remove the section from the link; its storage stays valid
    pub fn kill(&self) {
        self.alive.store(false, Ordering::Relaxed);
    }

    /// Garbage-collector mark bit; returns whether this call set it
    pub fn mark_visited(&self) -> bool {
        !self.visited.swap(true, Ordering::Relaxed)
    }

    /// Whether the garbage collector reached this section
    pub fn is_visited(&self) -> bool {
        self.visited.load(Ordering::Relaxed)
    }

    /// Offset inside the output section, valid after sizing
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Relaxed)
    }

    /// Assign the offset inside the output section
    pub fn set_offset(&self, offset: u64) {
        self.offset.store(offset, Ordering::Relaxed);
    }

    /// Add a delta to the assigned offset (parallel prefix-sum fold)
    pub fn add_offset(&self, delta: u64) {
        self.offset.fetch_add(delta, Ordering::Relaxed);
    }

    /// Final virtual address of the section start
    pub fn get_addr(&self, ctx: &Context) -> u64 {
        ctx.output_sections[self.osec as usize].hdr.sh_addr + self.offset()
    }

    /// The effective addend of a relocation: explicit for RELA inputs,
    /// read from the patched location for REL inputs
    pub fn get_addend(&self, rel: &Rel) -> i64 {
        if self.is_rela {
            rel.r_addend
        } else {
            crate::elf::i32le(&self.contents, rel.r_offset as usize)
                .map(i64::from)
                .unwrap_or(0)
        }
    }

    /// The fragment redirection for relocation `rel_idx`, if any
    pub fn fragment_ref(&self, rel_idx: u32) -> Option<&FragmentRef> {
        self.rel_fragments
            .binary_search_by_key(&rel_idx, |r| r.rel_idx)
            .ok()
            .map(|pos| &self.rel_fragments[pos])
    }

    /// The scanner's classification of relocation `rel_idx`
    pub fn rel_action(&self, rel_idx: usize) -> RelAction {
        self.rel_actions
            .get(rel_idx)
            .map(|a| RelAction::from_u8(a.load(Ordering::Relaxed)))
            .unwrap_or(RelAction::Plain)
    }

    /// Record the scanner's classification of relocation `rel_idx`
    pub fn set_rel_action(&self, rel_idx: usize, action: RelAction) {
        if let Some(slot) = self.rel_actions.get(rel_idx) {
            slot.store(action as u8, Ordering::Relaxed);
        }
    }

    /// Record one pending dynamic relocation, `R_*_RELATIVE` or symbolic
    pub fn add_dynrel(&self, is_baserel: bool) {
        self.num_dynrel.fetch_add(1, Ordering::Relaxed);
        if is_baserel {
            self.num_baserel.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Copy the section into its output location and apply relocations.
    /// `dynrel` is this section's pre-reserved slice of `.rela.dyn`.
    pub fn copy_and_relocate(&self, ctx: &Context, out: &mut [u8], dynrel: Option<&mut [u8]>) {
        if self.shdr.sh_type == SHT_NOBITS || self.contents.is_empty() && out.is_empty() {
            return;
        }
        out[..self.contents.len()].copy_from_slice(&self.contents);

        if self.rels.is_empty() {
            return;
        }
        let mut writer = crate::scan::DynrelWriter::new(ctx, dynrel);
        if self.shdr.sh_flags & crate::elf::SHF_ALLOC != 0 {
            crate::arch::apply_reloc_alloc(ctx, self, out, &mut writer);
        } else {
            crate::arch::apply_reloc_nonalloc(ctx, self, out);
        }
    }

    /// Display name used in diagnostics
    pub fn display(&self, ctx: &Context) -> String {
        format!(
            "{}:({})",
            ctx.objs[self.file as usize].display_name(),
            self.name
        )
    }
}
