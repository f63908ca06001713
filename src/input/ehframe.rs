//! .eh_frame parsing
//!
//! The linker is one of the few consumers that must actually understand
//! .eh_frame: records for dead functions have to be dropped, identical
//! CIEs merged, and a binary-searchable .eh_frame_hdr built over the
//! survivors. This module parses each input .eh_frame into CIE and FDE
//! records and ties every FDE to the code section it covers.

use crate::arch::Machine;
use crate::elf::u32le;
use crate::error::{Error, Result};
use crate::input::object::ObjectFile;
use crate::symbol::NONE_IDX;

#[derive(Debug, Clone)]
/// A Common Information Entry
pub struct CieRecord {
    /// Index of the .eh_frame section this record came from
    pub isec: u32,
    /// Byte offset of the record inside that section
    pub input_offset: u32,
    /// Range of this record's relocations in the section's array
    pub rel_begin: u32,
    /// End of the relocation range
    pub rel_end: u32,
    /// Assigned offset in the output .eh_frame; leaders only
    pub output_offset: u32,
    /// Whether this CIE survived deduplication
    pub is_leader: bool,
    /// For follower CIEs, the (file, cie) the leader lives in
    pub leader: Option<(u32, u32)>,
}

#[derive(Debug, Clone)]
/// A Frame Description Entry
pub struct FdeRecord {
    /// Index of the .eh_frame section this record came from
    pub isec: u32,
    /// Byte offset of the record inside that section
    pub input_offset: u32,
    /// Range of this record's relocations in the section's array
    pub rel_begin: u32,
    /// End of the relocation range
    pub rel_end: u32,
    /// Index of the paired CIE in the owning file's list
    pub cie_idx: u32,
    /// Assigned offset in the output .eh_frame
    pub output_offset: u32,
}

impl CieRecord {
    /// Total record size including the length prefix
    pub fn size(&self, contents: &[u8]) -> u64 {
        u64::from(u32le(contents, self.input_offset as usize).unwrap_or(0)) + 4
    }
}

impl FdeRecord {
    /// Total record size including the length prefix
    pub fn size(&self, contents: &[u8]) -> u64 {
        u64::from(u32le(contents, self.input_offset as usize).unwrap_or(0)) + 4
    }
}

/// Parse one .eh_frame section of `file` into its record lists.
///
/// Requirements checked here: relocations are sorted by offset, every
/// FDE's first relocation patches the function pointer at offset 8, and
/// every FDE's back-pointer names a CIE seen in the same section.
pub fn read_ehframe(file: &mut ObjectFile, isec_idx: usize, machine: Machine) -> Result<()> {
    let Some(isec) = &file.sections[isec_idx] else {
        return Ok(());
    };
    let path = file.display_name();
    let section = isec.name.clone();
    let contents = &isec.contents;
    let rels = &isec.rels;

    for i in 1..rels.len() {
        if rels[i].r_type != machine.r_none() && rels[i].r_offset <= rels[i - 1].r_offset {
            return Err(Error::BadRelocationOrder {
                path,
                section,
            });
        }
    }

    let cies_begin = file.cies.len();
    let mut cies: Vec<CieRecord> = Vec::new();
    let mut fdes: Vec<FdeRecord> = Vec::new();

    let mut pos = 0usize;
    let mut rel_idx = 0usize;

    while pos < contents.len() {
        let size = u32le(contents, pos).ok_or_else(|| Error::EhFrameGarbage {
            path: path.clone(),
            section: section.clone(),
        })? as usize;

        if size == 0 {
            if contents.len() - pos != 4 {
                return Err(Error::EhFrameGarbage { path, section });
            }
            break;
        }

        let begin_offset = pos;
        let end_offset = pos + size + 4;
        let id = u32le(contents, pos + 4).ok_or_else(|| Error::EhFrameGarbage {
            path: path.clone(),
            section: section.clone(),
        })?;
        pos = end_offset;

        let rel_begin = rel_idx;
        while rel_idx < rels.len() && (rels[rel_idx].r_offset as usize) < end_offset {
            rel_idx += 1;
        }

        if id == 0 {
            cies.push(CieRecord {
                isec: isec_idx as u32,
                input_offset: begin_offset as u32,
                rel_begin: rel_begin as u32,
                rel_end: rel_idx as u32,
                output_offset: NONE_IDX,
                is_leader: false,
                leader: None,
            });
        } else {
            if rel_begin == rel_idx {
                // An FDE with no relocation describes nothing reachable;
                // `ld -r` outputs produce these.
                continue;
            }
            if rels[rel_begin].r_offset as usize - begin_offset != 8 {
                return Err(Error::BadFdeRelocation { path, section });
            }
            fdes.push(FdeRecord {
                isec: isec_idx as u32,
                input_offset: begin_offset as u32,
                rel_begin: rel_begin as u32,
                rel_end: rel_idx as u32,
                cie_idx: NONE_IDX,
                output_offset: NONE_IDX,
            });
        }
    }

    // Pair each FDE with its CIE through the back-offset at +4.
    for fde in &mut fdes {
        let cie_offset =
            crate::elf::i32le(contents, fde.input_offset as usize + 4).unwrap_or(0) as i64;
        let target = i64::from(fde.input_offset) + 4 - cie_offset;
        let found = cies
            .iter()
            .position(|cie| i64::from(cie.input_offset) == target)
            .ok_or_else(|| Error::BadFdePointer {
                path: path.clone(),
                section: section.clone(),
            })?;
        fde.cie_idx = (cies_begin + found) as u32;
    }

    // Group FDEs by the code section they describe, which is named by
    // the section of their first relocation's symbol.
    let covered = |fde: &FdeRecord| -> Option<usize> {
        let esym = file.elf_syms.get(rels[fde.rel_begin as usize].r_sym as usize)?;
        file.section_idx_of(esym, rels[fde.rel_begin as usize].r_sym as usize)
    };
    fdes.sort_by_key(|fde| covered(fde).unwrap_or(usize::MAX));

    let fdes_begin = file.fdes.len();
    let mut ranges: Vec<(usize, u32, u32)> = Vec::new();
    let mut i = 0;
    while i < fdes.len() {
        let Some(sect) = covered(&fdes[i]) else {
            i += 1;
            continue;
        };
        let begin = i;
        while i < fdes.len() && covered(&fdes[i]) == Some(sect) {
            i += 1;
        }
        ranges.push((
            sect,
            (fdes_begin + begin) as u32,
            (fdes_begin + i) as u32,
        ));
    }

    file.cies.extend(cies);
    file.fdes.extend(fdes);
    for (sect, begin, end) in ranges {
        if let Some(target) = file.sections.get_mut(sect).and_then(Option::as_mut) {
            target.fde_begin = begin;
            target.fde_end = end;
        }
    }
    Ok(())
}
