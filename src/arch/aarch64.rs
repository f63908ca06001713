//! aarch64 back-end
//!
//! AArch64 instruction fields are bit-packed rather than byte-aligned:
//! page-relative ADRP immediates split across two fields, load/store
//! offsets scale by the access size, and branches carry 26-bit word
//! displacements. The helpers at the top mirror those encodings; the
//! policy tables mirror the x86-64 shape with the page-relative rows the
//! psABI requires.

use crate::context::Context;
use crate::elf::{Rel, SHF_ALLOC, STT_GNU_IFUNC};
use crate::error::Result;
use crate::input::object::ObjectFile;
use crate::input::section::InputSection;
use crate::scan::{dispatch, report_undef, Action, ActionTable, DynrelWriter, RelAction};
use crate::symbol::Needs;

/// No-op
pub const R_AARCH64_NONE: u32 = 0;
/// Direct 64-bit
pub const R_AARCH64_ABS64: u32 = 257;
/// Direct 32-bit
pub const R_AARCH64_ABS32: u32 = 258;
/// PC-relative 32-bit
pub const R_AARCH64_PREL32: u32 = 261;
/// MOVZ/MOVK bits 0-15
pub const R_AARCH64_MOVW_UABS_G0_NC: u32 = 264;
/// MOVZ/MOVK bits 16-31
pub const R_AARCH64_MOVW_UABS_G1_NC: u32 = 266;
/// MOVZ/MOVK bits 32-47
pub const R_AARCH64_MOVW_UABS_G2_NC: u32 = 268;
/// MOVZ/MOVK bits 48-63
pub const R_AARCH64_MOVW_UABS_G3: u32 = 269;
/// ADRP page of the symbol
pub const R_AARCH64_ADR_PREL_PG_HI21: u32 = 275;
/// ADD low 12 bits
pub const R_AARCH64_ADD_ABS_LO12_NC: u32 = 277;
/// LDRB/STRB low 12 bits
pub const R_AARCH64_LDST8_ABS_LO12_NC: u32 = 278;
/// 26-bit call
pub const R_AARCH64_CALL26: u32 = 283;
/// 26-bit jump
pub const R_AARCH64_JUMP26: u32 = 282;
/// LDR/STR 32-bit low 12 bits
pub const R_AARCH64_LDST32_ABS_LO12_NC: u32 = 285;
/// LDR/STR 64-bit low 12 bits
pub const R_AARCH64_LDST64_ABS_LO12_NC: u32 = 286;
/// ADRP page of a GOT slot
pub const R_AARCH64_ADR_GOT_PAGE: u32 = 311;
/// LDR of a GOT slot, low 12 bits
pub const R_AARCH64_LD64_GOT_LO12_NC: u32 = 312;
/// GOT-page-relative GOT slot load
pub const R_AARCH64_LD64_GOTPAGE_LO15: u32 = 313;
/// ADRP page of an initial-exec TLS GOT slot
pub const R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21: u32 = 541;
/// LDR of an initial-exec TLS GOT slot
pub const R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC: u32 = 542;
/// Local-exec thread-pointer offset, high 12 bits
pub const R_AARCH64_TLSLE_ADD_TPREL_HI12: u32 = 549;
/// Local-exec thread-pointer offset, low 12 bits
pub const R_AARCH64_TLSLE_ADD_TPREL_LO12_NC: u32 = 550;
/// ADRP page of a TLS descriptor
pub const R_AARCH64_TLSDESC_ADR_PAGE21: u32 = 562;
/// LDR of a TLS descriptor
pub const R_AARCH64_TLSDESC_LD64_LO12: u32 = 563;
/// ADD of a TLS descriptor
pub const R_AARCH64_TLSDESC_ADD_LO12: u32 = 564;
/// Marker on the TLS descriptor call
pub const R_AARCH64_TLSDESC_CALL: u32 = 569;
/// Copy relocation
pub const R_AARCH64_COPY: u32 = 1024;
/// GOT entry filled by the loader
pub const R_AARCH64_GLOB_DAT: u32 = 1025;
/// Lazy PLT slot
pub const R_AARCH64_JUMP_SLOT: u32 = 1026;
/// Base-relative fixup
pub const R_AARCH64_RELATIVE: u32 = 1027;
/// TLS module id
pub const R_AARCH64_TLS_DTPMOD64: u32 = 1028;
/// TLS block offset
pub const R_AARCH64_TLS_DTPOFF64: u32 = 1029;
/// Thread-pointer offset
pub const R_AARCH64_TLS_TPREL64: u32 = 1030;
/// TLS descriptor pair
pub const R_AARCH64_TLSDESC: u32 = 1031;
/// Ifunc resolver fixup
pub const R_AARCH64_IRELATIVE: u32 = 1032;

fn extract(val: u64, hi: u64, lo: u64) -> u64 {
    (val >> lo) & ((1u64 << (hi - lo + 1)) - 1)
}

fn page(val: u64) -> u64 {
    val & !0xfff
}

fn read32(base: &[u8], loc: usize) -> u32 {
    crate::elf::u32le(base, loc).unwrap_or(0)
}

fn or32(base: &mut [u8], loc: usize, bits: u32) {
    let cur = read32(base, loc);
    crate::elf::put_u32(base, loc, cur | bits);
}

/// Patch an ADRP-style split 21-bit page immediate
fn write_adr(base: &mut [u8], loc: usize, val: u64) {
    let hi = ((val & 0x1ffffc) << 3) as u32;
    let lo = ((val & 3) << 29) as u32;
    let cur = read32(base, loc);
    crate::elf::put_u32(base, loc, (cur & 0x9f00_001f) | hi | lo);
}

/// Classify this section's relocations
pub fn scan_section(ctx: &Context, file: &ObjectFile, isec: &InputSection) -> Result<()> {
    debug_assert!(isec.shdr.sh_flags & SHF_ALLOC != 0);

    for (idx, rel) in isec.rels.iter().enumerate() {
        if rel.r_type == R_AARCH64_NONE {
            continue;
        }
        let Some(sym) = file.symbols.get(rel.r_sym as usize) else {
            continue;
        };
        if crate::lock(&sym.repr).file.is_none() {
            report_undef(ctx, file, sym);
            continue;
        }

        if sym.get_type(ctx) == STT_GNU_IFUNC {
            sym.add_flags(Needs::GOT | Needs::PLT);
        }

        match rel.r_type {
            R_AARCH64_ABS64 => {
                const TABLE: ActionTable = [
                    // Absolute      Local            Imported data   Imported code
                    [Action::None, Action::Baserel, Action::Dynrel, Action::Dynrel], // DSO
                    [Action::None, Action::Baserel, Action::Dynrel, Action::Dynrel], // PIE
                    [Action::None, Action::None, Action::Dynrel, Action::Dynrel],    // PDE
                ];
                dispatch(ctx, file, isec, &TABLE, idx, rel, sym)?;
            }
            R_AARCH64_ABS32 | R_AARCH64_MOVW_UABS_G0_NC | R_AARCH64_MOVW_UABS_G1_NC
            | R_AARCH64_MOVW_UABS_G2_NC | R_AARCH64_MOVW_UABS_G3 => {
                const TABLE: ActionTable = [
                    // Absolute      Local          Imported data  Imported code
                    [Action::None, Action::Error, Action::Error, Action::Error], // DSO
                    [Action::None, Action::Error, Action::Error, Action::Error], // PIE
                    [Action::None, Action::None, Action::Copyrel, Action::Plt],  // PDE
                ];
                dispatch(ctx, file, isec, &TABLE, idx, rel, sym)?;
            }
            R_AARCH64_ADR_PREL_PG_HI21 => {
                const TABLE: ActionTable = [
                    // Absolute      Local         Imported data   Imported code
                    [Action::None, Action::None, Action::Error, Action::Error], // DSO
                    [Action::None, Action::None, Action::Error, Action::Plt],   // PIE
                    [Action::None, Action::None, Action::Copyrel, Action::Plt], // PDE
                ];
                dispatch(ctx, file, isec, &TABLE, idx, rel, sym)?;
            }
            R_AARCH64_ADR_GOT_PAGE | R_AARCH64_LD64_GOT_LO12_NC | R_AARCH64_LD64_GOTPAGE_LO15 => {
                sym.add_flags(Needs::GOT);
            }
            R_AARCH64_CALL26 | R_AARCH64_JUMP26 => {
                if sym.is_imported() {
                    sym.add_flags(Needs::PLT);
                }
            }
            R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21 | R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC => {
                sym.add_flags(Needs::GOTTP);
            }
            R_AARCH64_TLSDESC_ADR_PAGE21 | R_AARCH64_TLSDESC_LD64_LO12
            | R_AARCH64_TLSDESC_ADD_LO12 => {
                sym.add_flags(Needs::TLSDESC);
            }
            R_AARCH64_ADD_ABS_LO12_NC
            | R_AARCH64_LDST8_ABS_LO12_NC
            | R_AARCH64_LDST32_ABS_LO12_NC
            | R_AARCH64_LDST64_ABS_LO12_NC
            | R_AARCH64_PREL32
            | R_AARCH64_TLSLE_ADD_TPREL_HI12
            | R_AARCH64_TLSLE_ADD_TPREL_LO12_NC
            | R_AARCH64_TLSDESC_CALL => {}
            _ => {
                ctx.diags.error(format!(
                    "{}: unknown relocation: {}",
                    isec.display(ctx),
                    rel.r_type
                ));
            }
        }
    }
    Ok(())
}

/// Apply relocations to a mapped section
pub fn apply_reloc_alloc(ctx: &Context, isec: &InputSection, base: &mut [u8], dynrel: &mut DynrelWriter) {
    let file = &ctx.objs[isec.file as usize];
    let section_addr = isec.get_addr(ctx);
    let got_base = ctx.got.hdr.sh_addr;

    for (idx, rel) in isec.rels.iter().enumerate() {
        if rel.r_type == R_AARCH64_NONE {
            continue;
        }
        let Some(sym) = file.symbols.get(rel.r_sym as usize) else {
            continue;
        };

        let frag = isec.fragment_ref(idx as u32);
        let s = match frag {
            Some(f) => f.frag.get_addr(ctx),
            None => sym.get_addr(ctx),
        };
        let a = match frag {
            Some(f) => f.addend,
            None => rel.r_addend,
        };
        let sa = (s as i64 + a) as u64;
        let p = section_addr + rel.r_offset;
        let g = sym.get_got_addr(ctx) - got_base;
        let loc = rel.r_offset as usize;

        let overflow = |val: i64, lo: i64, hi: i64| {
            ctx.diags.error(format!(
                "{}: relocation {} against {} out of range: {} is not in [{}, {})",
                isec.display(ctx),
                rel.r_type,
                sym.name(),
                val,
                lo,
                hi
            ));
        };

        match isec.rel_action(idx) {
            RelAction::Baserel => {
                dynrel.push(Rel {
                    r_offset: p,
                    r_type: R_AARCH64_RELATIVE,
                    r_sym: 0,
                    r_addend: sa as i64,
                });
                crate::elf::put_u64(base, loc, sa);
                continue;
            }
            RelAction::Dynrel => {
                dynrel.push(Rel {
                    r_offset: p,
                    r_type: R_AARCH64_ABS64,
                    r_sym: sym.get_dynsym_idx(ctx),
                    r_addend: a,
                });
                crate::elf::put_u64(base, loc, a as u64);
                continue;
            }
            RelAction::Plain => {}
        }

        match rel.r_type {
            R_AARCH64_ABS64 => crate::elf::put_u64(base, loc, sa),
            R_AARCH64_ABS32 => {
                let val = sa as i64;
                if !(-(1i64 << 31)..1i64 << 32).contains(&val) {
                    overflow(val, -(1 << 31), 1 << 32);
                }
                crate::elf::put_u32(base, loc, val as u32);
            }
            R_AARCH64_LDST8_ABS_LO12_NC => or32(base, loc, (extract(sa, 11, 0) << 10) as u32),
            R_AARCH64_LDST32_ABS_LO12_NC => or32(base, loc, (extract(sa, 11, 2) << 10) as u32),
            R_AARCH64_LDST64_ABS_LO12_NC => or32(base, loc, (extract(sa, 11, 3) << 10) as u32),
            R_AARCH64_ADD_ABS_LO12_NC => or32(base, loc, (extract(sa, 11, 0) << 10) as u32),
            R_AARCH64_MOVW_UABS_G0_NC => or32(base, loc, (extract(sa, 15, 0) << 5) as u32),
            R_AARCH64_MOVW_UABS_G1_NC => or32(base, loc, (extract(sa, 31, 16) << 5) as u32),
            R_AARCH64_MOVW_UABS_G2_NC => or32(base, loc, (extract(sa, 47, 32) << 5) as u32),
            R_AARCH64_MOVW_UABS_G3 => or32(base, loc, (extract(sa, 63, 48) << 5) as u32),
            R_AARCH64_ADR_GOT_PAGE => {
                let val = page(got_base + g + a as u64) as i64 - page(p) as i64;
                write_adr(base, loc, extract((val >> 12) as u64, 20, 0));
            }
            R_AARCH64_ADR_PREL_PG_HI21 => {
                let val = page(sa) as i64 - page(p) as i64;
                if !(-(1i64 << 32)..1i64 << 32).contains(&val) {
                    overflow(val, -(1 << 32), 1 << 32);
                }
                write_adr(base, loc, extract((val >> 12) as u64, 20, 0));
            }
            R_AARCH64_CALL26 | R_AARCH64_JUMP26 => {
                if sym.is_undef_weak(ctx) {
                    // Branch to the next instruction.
                    or32(base, loc, 1);
                } else {
                    let val = sa as i64 - p as i64;
                    if !(-(1i64 << 27)..1i64 << 27).contains(&val) {
                        overflow(val, -(1 << 27), 1 << 27);
                    }
                    or32(base, loc, ((val >> 2) & 0x3ff_ffff) as u32);
                }
            }
            R_AARCH64_PREL32 => {
                let val = sa as i64 - p as i64;
                if !(-(1i64 << 31)..1i64 << 32).contains(&val) {
                    overflow(val, -(1 << 31), 1 << 32);
                }
                crate::elf::put_u32(base, loc, val as u32);
            }
            R_AARCH64_LD64_GOT_LO12_NC => {
                or32(base, loc, (extract(got_base + g + a as u64, 11, 3) << 10) as u32);
            }
            R_AARCH64_LD64_GOTPAGE_LO15 => {
                let val = got_base + g + a as u64 - page(got_base);
                or32(base, loc, (extract(val, 14, 3) << 10) as u32);
            }
            R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21 => {
                let slot = sym.get_gottp_addr(ctx) + a as u64;
                write_adr(base, loc, (page(slot) as i64 - page(p) as i64) as u64 >> 12);
            }
            R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC => {
                let slot = sym.get_gottp_addr(ctx) + a as u64;
                or32(base, loc, (extract(slot, 11, 3) << 10) as u32);
            }
            R_AARCH64_TLSLE_ADD_TPREL_HI12 => {
                let val = (sa as i64 - ctx.tls_begin as i64 + 16) as u64;
                or32(base, loc, (extract(val, 23, 12) << 10) as u32);
            }
            R_AARCH64_TLSLE_ADD_TPREL_LO12_NC => {
                let val = (sa as i64 - ctx.tls_begin as i64 + 16) as u64;
                or32(base, loc, (extract(val, 11, 0) << 10) as u32);
            }
            R_AARCH64_TLSDESC_ADR_PAGE21 => {
                let desc = sym.get_tlsdesc_addr(ctx) + a as u64;
                write_adr(base, loc, (page(desc) as i64 - page(p) as i64) as u64 >> 12);
            }
            R_AARCH64_TLSDESC_LD64_LO12 => {
                let desc = sym.get_tlsdesc_addr(ctx) + a as u64;
                or32(base, loc, (extract(desc, 11, 3) << 10) as u32);
            }
            R_AARCH64_TLSDESC_ADD_LO12 => {
                let desc = sym.get_tlsdesc_addr(ctx) + a as u64;
                or32(base, loc, (extract(desc, 11, 0) << 10) as u32);
            }
            R_AARCH64_TLSDESC_CALL => {}
            _ => {}
        }
    }
}

/// Apply the absolute-only subset used for unmapped (debug) sections
pub fn apply_reloc_nonalloc(ctx: &Context, isec: &InputSection, base: &mut [u8]) {
    let file = &ctx.objs[isec.file as usize];

    for (idx, rel) in isec.rels.iter().enumerate() {
        if rel.r_type == R_AARCH64_NONE {
            continue;
        }
        let Some(sym) = file.symbols.get(rel.r_sym as usize) else {
            continue;
        };
        if crate::lock(&sym.repr).file.is_none() {
            report_undef(ctx, file, sym);
            continue;
        }

        let frag = isec.fragment_ref(idx as u32);
        let s = match frag {
            Some(f) => f.frag.get_addr(ctx),
            None => sym.get_addr(ctx),
        };
        let a = match frag {
            Some(f) => f.addend,
            None => rel.r_addend,
        };
        let loc = rel.r_offset as usize;

        match rel.r_type {
            R_AARCH64_ABS64 => crate::elf::put_u64(base, loc, (s as i64 + a) as u64),
            R_AARCH64_ABS32 => crate::elf::put_u32(base, loc, (s as i64 + a) as u32),
            _ => ctx.diags.error(format!(
                "{}: invalid relocation for non-allocated sections: {}",
                isec.display(ctx),
                rel.r_type
            )),
        }
    }
}

/// Fill .plt
pub fn write_plt(ctx: &Context, buf: &mut [u8]) {
    const PLT0: [u8; 32] = [
        0xf0, 0x7b, 0xbf, 0xa9, // stp  x16, x30, [sp,#-16]!
        0x10, 0x00, 0x00, 0x90, // adrp x16, .got.plt[2]
        0x11, 0x02, 0x40, 0xf9, // ldr  x17, [x16, .got.plt[2]]
        0x10, 0x02, 0x00, 0x91, // add  x16, x16, .got.plt[2]
        0x20, 0x02, 0x1f, 0xd6, // br   x17
        0x1f, 0x20, 0x03, 0xd5, // nop
        0x1f, 0x20, 0x03, 0xd5, // nop
        0x1f, 0x20, 0x03, 0xd5, // nop
    ];

    let gotplt = ctx.gotplt.hdr.sh_addr + 16;
    let plt = ctx.plt.hdr.sh_addr;

    buf[..32].copy_from_slice(&PLT0);
    write_adr(
        buf,
        4,
        ((page(gotplt) as i64 - page(plt + 4) as i64) >> 12) as u64,
    );
    or32(buf, 8, (extract(gotplt, 11, 3) << 10) as u32);
    or32(buf, 12, ((gotplt & 0xfff) << 10) as u32);

    const ENTRY: [u8; 16] = [
        0x10, 0x00, 0x00, 0x90, // adrp x16, .got.plt[n]
        0x11, 0x02, 0x40, 0xf9, // ldr  x17, [x16, .got.plt[n]]
        0x10, 0x02, 0x00, 0x91, // add  x16, x16, .got.plt[n]
        0x20, 0x02, 0x1f, 0xd6, // br   x17
    ];
    for (idx, sym) in ctx.plt.symbols.iter().enumerate() {
        let off = 32 + idx * 16;
        let gotplt = sym.get_gotplt_addr(ctx);
        let ent_addr = plt + off as u64;

        buf[off..off + 16].copy_from_slice(&ENTRY);
        write_adr(
            buf,
            off,
            ((page(gotplt) as i64 - page(ent_addr) as i64) >> 12) as u64,
        );
        or32(buf, off + 4, (extract(gotplt, 11, 3) << 10) as u32);
        or32(buf, off + 8, ((gotplt & 0xfff) << 10) as u32);
    }
}

/// Fill .plt.got
pub fn write_pltgot(ctx: &Context, buf: &mut [u8]) {
    const ENTRY: [u8; 16] = [
        0x10, 0x00, 0x00, 0x90, // adrp x16, GOT[n]
        0x11, 0x02, 0x40, 0xf9, // ldr  x17, [x16, GOT[n]]
        0x10, 0x02, 0x00, 0x91, // add  x16, x16, GOT[n]
        0x20, 0x02, 0x1f, 0xd6, // br   x17
    ];
    for (idx, sym) in ctx.pltgot.symbols.iter().enumerate() {
        let off = idx * 16;
        let got = sym.get_got_addr(ctx);
        let ent_addr = ctx.pltgot.hdr.sh_addr + off as u64;

        buf[off..off + 16].copy_from_slice(&ENTRY);
        write_adr(
            buf,
            off,
            ((page(got) as i64 - page(ent_addr) as i64) >> 12) as u64,
        );
        or32(buf, off + 4, (extract(got, 11, 3) << 10) as u32);
        or32(buf, off + 8, ((got & 0xfff) << 10) as u32);
    }
}

/// The absolute/PC-relative subset .eh_frame records may carry
pub fn apply_ehframe_reloc(r_type: u32, base: &mut [u8], loc: usize, vaddr: u64, val: u64) {
    match r_type {
        R_AARCH64_NONE => {}
        R_AARCH64_ABS64 => crate::elf::put_u64(base, loc, val),
        R_AARCH64_PREL32 => {
            crate::elf::put_u32(base, loc, (val as i64 - vaddr as i64) as u32)
        }
        _ => {}
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_extract() {
        assert_eq!(extract(0xabcd, 15, 0), 0xabcd);
        assert_eq!(extract(0xabcd, 11, 3), 0x179);
        assert_eq!(extract(0xffff_ffff, 31, 16), 0xffff);
    }

    #[test]
    fn test_page() {
        assert_eq!(page(0x40_1234), 0x40_1000);
        assert_eq!(page(0x40_0fff), 0x40_0000);
    }

    #[test]
    fn test_write_adr_splits_immediate() {
        // adrp x16, 0 with a +1-page displacement: immlo = 1, immhi = 0.
        let mut buf = vec![0x10, 0x00, 0x00, 0x90];
        write_adr(&mut buf, 0, 1);
        let insn = read32(&buf, 0);
        assert_eq!((insn >> 29) & 3, 1);
        assert_eq!((insn >> 5) & 0x7ffff, 0);
        // Register and opcode bits survive.
        assert_eq!(insn & 0x9f00_001f, 0x9000_0010);
    }
}
