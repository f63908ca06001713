//! i386 back-end
//!
//! The 32-bit x86 target uses REL-format relocations: addends live in
//! the patched locations, so the applicator adds to what is already
//! there instead of overwriting it. Dynamic relocations are REL-format
//! too, which is why base-relative fixups leave the link-time value in
//! place for the loader to bias.

use crate::context::Context;
use crate::elf::{Rel, SHF_ALLOC, STT_GNU_IFUNC};
use crate::error::Result;
use crate::input::object::ObjectFile;
use crate::input::section::InputSection;
use crate::scan::{dispatch, report_undef, Action, ActionTable, DynrelWriter, RelAction};
use crate::symbol::Needs;

/// No-op
pub const R_386_NONE: u32 = 0;
/// Direct 32-bit
pub const R_386_32: u32 = 1;
/// PC-relative 32-bit
pub const R_386_PC32: u32 = 2;
/// 32-bit GOT entry offset
pub const R_386_GOT32: u32 = 3;
/// PC-relative 32-bit to a PLT entry
pub const R_386_PLT32: u32 = 4;
/// Copy relocation
pub const R_386_COPY: u32 = 5;
/// GOT entry filled by the loader
pub const R_386_GLOB_DAT: u32 = 6;
/// Lazy PLT slot
pub const R_386_JMP_SLOT: u32 = 7;
/// Base-relative fixup
pub const R_386_RELATIVE: u32 = 8;
/// Offset from GOT base
pub const R_386_GOTOFF: u32 = 9;
/// PC-relative 32-bit to the GOT base
pub const R_386_GOTPC: u32 = 10;
/// Thread-pointer offset set by the loader
pub const R_386_TLS_TPOFF: u32 = 14;
/// Absolute address of an initial-exec GOT slot
pub const R_386_TLS_IE: u32 = 15;
/// GOT-relative address of an initial-exec GOT slot
pub const R_386_TLS_GOTIE: u32 = 16;
/// Local-exec thread-pointer offset
pub const R_386_TLS_LE: u32 = 17;
/// General-dynamic TLS sequence
pub const R_386_TLS_GD: u32 = 18;
/// Local-dynamic TLS sequence
pub const R_386_TLS_LDM: u32 = 19;
/// Direct 16-bit
pub const R_386_16: u32 = 20;
/// PC-relative 16-bit
pub const R_386_PC16: u32 = 21;
/// Direct 8-bit
pub const R_386_8: u32 = 22;
/// PC-relative 8-bit
pub const R_386_PC8: u32 = 23;
/// TLS module id
pub const R_386_TLS_DTPMOD32: u32 = 35;
/// TLS block offset
pub const R_386_TLS_DTPOFF32: u32 = 36;
/// TLS descriptor pair
pub const R_386_TLS_DESC: u32 = 41;
/// Ifunc resolver fixup
pub const R_386_IRELATIVE: u32 = 42;
/// Relaxable GOT load
pub const R_386_GOT32X: u32 = 43;
/// Symbol size
pub const R_386_SIZE32: u32 = 38;

/// Classify this section's relocations
pub fn scan_section(ctx: &Context, file: &ObjectFile, isec: &InputSection) -> Result<()> {
    debug_assert!(isec.shdr.sh_flags & SHF_ALLOC != 0);

    for (idx, rel) in isec.rels.iter().enumerate() {
        if rel.r_type == R_386_NONE {
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
            R_386_8 | R_386_16 => {
                const TABLE: ActionTable = [
                    // Absolute      Local          Imported data  Imported code
                    [Action::None, Action::Error, Action::Error, Action::Error], // DSO
                    [Action::None, Action::Error, Action::Error, Action::Error], // PIE
                    [Action::None, Action::None, Action::Copyrel, Action::Plt],  // PDE
                ];
                dispatch(ctx, file, isec, &TABLE, idx, rel, sym)?;
            }
            R_386_32 => {
                const TABLE: ActionTable = [
                    // Absolute      Local            Imported data   Imported code
                    [Action::None, Action::Baserel, Action::Dynrel, Action::Dynrel], // DSO
                    [Action::None, Action::Baserel, Action::Dynrel, Action::Dynrel], // PIE
                    [Action::None, Action::None, Action::Copyrel, Action::Plt],      // PDE
                ];
                dispatch(ctx, file, isec, &TABLE, idx, rel, sym)?;
            }
            R_386_PC8 | R_386_PC16 => {
                const TABLE: ActionTable = [
                    // Absolute       Local         Imported data   Imported code
                    [Action::Error, Action::None, Action::Error, Action::Error], // DSO
                    [Action::Error, Action::None, Action::Copyrel, Action::Plt], // PIE
                    [Action::None, Action::None, Action::Copyrel, Action::Plt],  // PDE
                ];
                dispatch(ctx, file, isec, &TABLE, idx, rel, sym)?;
            }
            R_386_PC32 => {
                const TABLE: ActionTable = [
                    // Absolute         Local         Imported data   Imported code
                    [Action::Baserel, Action::None, Action::Error, Action::Error], // DSO
                    [Action::Baserel, Action::None, Action::Copyrel, Action::Plt], // PIE
                    [Action::None, Action::None, Action::Copyrel, Action::Plt],    // PDE
                ];
                dispatch(ctx, file, isec, &TABLE, idx, rel, sym)?;
            }
            R_386_GOT32 | R_386_GOT32X | R_386_GOTPC => {
                sym.add_flags(Needs::GOT);
            }
            R_386_GOTOFF => {}
            R_386_PLT32 => {
                if sym.is_imported() {
                    sym.add_flags(Needs::PLT);
                }
            }
            R_386_TLS_IE | R_386_TLS_GOTIE => {
                sym.add_flags(Needs::GOTTP);
            }
            R_386_TLS_LE | R_386_SIZE32 => {}
            R_386_TLS_GD | R_386_TLS_LDM | R_386_TLS_DTPOFF32 | R_386_TLS_DESC => {
                ctx.diags.error(format!(
                    "{}: TLS relocation {} is not supported on i386",
                    isec.display(ctx),
                    rel.r_type
                ));
            }
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

// REL-format inputs keep their addends in the patched words, so plain
// application reads, adds and writes back.
fn add32(base: &mut [u8], loc: usize, val: i64) {
    let cur = crate::elf::u32le(base, loc).unwrap_or(0);
    crate::elf::put_u32(base, loc, cur.wrapping_add(val as u32));
}

fn add16(base: &mut [u8], loc: usize, val: i64) {
    let cur = crate::elf::u16le(base, loc).unwrap_or(0);
    crate::elf::put_u16(base, loc, cur.wrapping_add(val as u16));
}

fn add8(base: &mut [u8], loc: usize, val: i64) {
    base[loc] = base[loc].wrapping_add(val as u8);
}

fn write_val(r_type: u32, base: &mut [u8], loc: usize, val: i64) {
    match r_type {
        R_386_8 | R_386_PC8 => add8(base, loc, val),
        R_386_16 | R_386_PC16 => add16(base, loc, val),
        _ => add32(base, loc, val),
    }
}

/// Apply relocations to a mapped section
pub fn apply_reloc_alloc(ctx: &Context, isec: &InputSection, base: &mut [u8], dynrel: &mut DynrelWriter) {
    let file = &ctx.objs[isec.file as usize];
    let section_addr = isec.get_addr(ctx);
    let got_base = ctx.got.hdr.sh_addr as i64;

    for (idx, rel) in isec.rels.iter().enumerate() {
        if rel.r_type == R_386_NONE {
            continue;
        }
        let Some(sym) = file.symbols.get(rel.r_sym as usize) else {
            continue;
        };

        let frag = isec.fragment_ref(idx as u32);
        let s = match frag {
            Some(f) => f.frag.get_addr(ctx) as i64,
            None => sym.get_addr(ctx) as i64,
        };
        // REL addends live in the section bytes already; only fragment
        // redirections carry an explicit one.
        let a = frag.map(|f| f.addend).unwrap_or(0);
        let p = (section_addr + rel.r_offset) as i64;
        let g = sym.get_got_addr(ctx) as i64 - got_base;
        let loc = rel.r_offset as usize;

        match isec.rel_action(idx) {
            RelAction::Baserel => {
                dynrel.push(Rel {
                    r_offset: p as u64,
                    r_type: R_386_RELATIVE,
                    r_sym: 0,
                    r_addend: 0,
                });
                add32(base, loc, s + a);
                continue;
            }
            RelAction::Dynrel => {
                dynrel.push(Rel {
                    r_offset: p as u64,
                    r_type: R_386_32,
                    r_sym: sym.get_dynsym_idx(ctx),
                    r_addend: 0,
                });
                add32(base, loc, a);
                continue;
            }
            RelAction::Plain => {}
        }

        match rel.r_type {
            R_386_8 | R_386_16 | R_386_32 => write_val(rel.r_type, base, loc, s + a),
            R_386_PC8 | R_386_PC16 | R_386_PC32 => write_val(rel.r_type, base, loc, s + a - p),
            R_386_PLT32 => {
                if sym.is_undef_weak(ctx) {
                    // An unresolved weak call becomes a branch to the
                    // next instruction.
                    crate::elf::put_u32(base, loc, 0);
                } else {
                    add32(base, loc, s + a - p);
                }
            }
            R_386_GOT32 | R_386_GOT32X => add32(base, loc, g + a),
            R_386_GOTOFF => add32(base, loc, s + a - got_base),
            R_386_GOTPC => add32(base, loc, got_base + a - p),
            R_386_TLS_IE => add32(base, loc, sym.get_gottp_addr(ctx) as i64 + a),
            R_386_TLS_GOTIE => add32(base, loc, sym.get_gottp_addr(ctx) as i64 + a - got_base),
            R_386_TLS_LE => add32(base, loc, s + a - ctx.tls_end as i64),
            R_386_SIZE32 => add32(base, loc, sym.esym(ctx).st_size as i64 + a),
            _ => {}
        }
    }
}

/// Apply the absolute-only subset used for unmapped (debug) sections
pub fn apply_reloc_nonalloc(ctx: &Context, isec: &InputSection, base: &mut [u8]) {
    let file = &ctx.objs[isec.file as usize];

    for (idx, rel) in isec.rels.iter().enumerate() {
        if rel.r_type == R_386_NONE {
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
            Some(f) => f.frag.get_addr(ctx) as i64,
            None => sym.get_addr(ctx) as i64,
        };
        let a = frag.map(|f| f.addend).unwrap_or(0);
        let loc = rel.r_offset as usize;

        match rel.r_type {
            R_386_8 | R_386_16 | R_386_32 | R_386_PC8 | R_386_PC16 | R_386_PC32 => {
                write_val(rel.r_type, base, loc, s + a);
            }
            R_386_SIZE32 => add32(base, loc, sym.esym(ctx).st_size as i64 + a),
            _ => ctx.diags.error(format!(
                "{}: invalid relocation for non-allocated sections: {}",
                isec.display(ctx),
                rel.r_type
            )),
        }
    }
}

/// Fill .plt. Position-independent output addresses .got.plt through
/// %ebx; static executables use absolute slot addresses.
pub fn write_plt(ctx: &Context, buf: &mut [u8]) {
    let gotplt = ctx.gotplt.hdr.sh_addr;
    let plt = ctx.plt.hdr.sh_addr;
    let pic = ctx.is_pic();

    if pic {
        const PLT0: [u8; 16] = [
            0xff, 0xb3, 0x04, 0, 0, 0, // pushl 4(%ebx)
            0xff, 0xa3, 0x08, 0, 0, 0, // jmp *8(%ebx)
            0x90, 0x90, 0x90, 0x90, // nop
        ];
        buf[..16].copy_from_slice(&PLT0);
    } else {
        const PLT0: [u8; 16] = [
            0xff, 0x35, 0, 0, 0, 0, // pushl GOTPLT+4
            0xff, 0x25, 0, 0, 0, 0, // jmp *(GOTPLT+8)
            0x90, 0x90, 0x90, 0x90, // nop
        ];
        buf[..16].copy_from_slice(&PLT0);
        crate::elf::put_u32(buf, 2, gotplt as u32 + 4);
        crate::elf::put_u32(buf, 8, gotplt as u32 + 8);
    }

    for (idx, sym) in ctx.plt.symbols.iter().enumerate() {
        let off = 16 + idx * 16;
        let ent_addr = plt + off as u64;

        if pic {
            const ENTRY: [u8; 16] = [
                0xff, 0xa3, 0, 0, 0, 0, // jmp *foo@GOT(%ebx)
                0x68, 0, 0, 0, 0, // pushl $reloc_offset
                0xe9, 0, 0, 0, 0, // jmp .PLT0@PC
            ];
            buf[off..off + 16].copy_from_slice(&ENTRY);
            crate::elf::put_u32(
                buf,
                off + 2,
                (sym.get_gotplt_addr(ctx) as i64 - gotplt as i64) as u32,
            );
        } else {
            const ENTRY: [u8; 16] = [
                0xff, 0x25, 0, 0, 0, 0, // jmp *foo@GOT
                0x68, 0, 0, 0, 0, // pushl $reloc_offset
                0xe9, 0, 0, 0, 0, // jmp .PLT0@PC
            ];
            buf[off..off + 16].copy_from_slice(&ENTRY);
            crate::elf::put_u32(buf, off + 2, sym.get_gotplt_addr(ctx) as u32);
        }

        let relsize = ctx.machine.class().rel_size(false);
        crate::elf::put_u32(buf, off + 7, (idx * relsize) as u32);
        crate::elf::put_u32(buf, off + 12, (plt as i64 - ent_addr as i64 - 16) as u32);
    }
}

/// Fill .plt.got
pub fn write_pltgot(ctx: &Context, buf: &mut [u8]) {
    let pic = ctx.is_pic();
    let got = ctx.got.hdr.sh_addr;

    for (idx, sym) in ctx.pltgot.symbols.iter().enumerate() {
        let off = idx * 16;
        if pic {
            const ENTRY: [u8; 16] = [
                0xff, 0xa3, 0, 0, 0, 0, // jmp *foo@GOT(%ebx)
                0x66, 0x90, 0x66, 0x90, 0x66, 0x90, 0x66, 0x90, 0x66, 0x90,
            ];
            buf[off..off + 16].copy_from_slice(&ENTRY);
            crate::elf::put_u32(
                buf,
                off + 2,
                (sym.get_got_addr(ctx) as i64 - got as i64) as u32,
            );
        } else {
            const ENTRY: [u8; 16] = [
                0xff, 0x25, 0, 0, 0, 0, // jmp *foo@GOT
                0x66, 0x90, 0x66, 0x90, 0x66, 0x90, 0x66, 0x90, 0x66, 0x90,
            ];
            buf[off..off + 16].copy_from_slice(&ENTRY);
            crate::elf::put_u32(buf, off + 2, sym.get_got_addr(ctx) as u32);
        }
    }
}

/// The absolute/PC-relative subset .eh_frame records may carry
pub fn apply_ehframe_reloc(r_type: u32, base: &mut [u8], loc: usize, vaddr: u64, val: u64) {
    match r_type {
        R_386_NONE => {}
        R_386_32 => add32(base, loc, val as i64),
        R_386_PC32 => add32(base, loc, val as i64 - vaddr as i64),
        _ => {}
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_rel_addends_accumulate_in_place() {
        let mut buf = vec![0u8; 8];
        crate::elf::put_u32(&mut buf, 0, 0xfffffffc); // stored addend -4
        add32(&mut buf, 0, 0x1000);
        assert_eq!(crate::elf::u32le(&buf, 0), Some(0xffc));
    }

    #[test]
    fn test_write_val_widths() {
        let mut buf = vec![0u8; 8];
        buf[0] = 1;
        write_val(R_386_8, &mut buf, 0, 2);
        assert_eq!(buf[0], 3);

        crate::elf::put_u16(&mut buf, 2, 10);
        write_val(R_386_16, &mut buf, 2, 20);
        assert_eq!(crate::elf::u16le(&buf, 2), Some(30));
    }
}
