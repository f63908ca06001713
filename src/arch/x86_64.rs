//! x86-64 back-end
//!
//! Policy tables, relocation application, PLT stub templates and the
//! GOT-indirect instruction relaxations defined by the x86-64 psABI.

use std::sync::Arc;

use crate::context::Context;
use crate::elf::{Rel, SHF_ALLOC, STT_GNU_IFUNC};
use crate::error::{Error, Result};
use crate::input::object::ObjectFile;
use crate::input::section::InputSection;
use crate::scan::{dispatch, report_undef, Action, ActionTable, DynrelWriter, RelAction};
use crate::symbol::{Needs, Symbol};

/// No-op
pub const R_X86_64_NONE: u32 = 0;
/// Direct 64-bit
pub const R_X86_64_64: u32 = 1;
/// PC-relative 32-bit signed
pub const R_X86_64_PC32: u32 = 2;
/// 32-bit GOT entry offset
pub const R_X86_64_GOT32: u32 = 3;
/// PC-relative 32-bit to a PLT entry
pub const R_X86_64_PLT32: u32 = 4;
/// Copy relocation
pub const R_X86_64_COPY: u32 = 5;
/// GOT entry filled by the loader
pub const R_X86_64_GLOB_DAT: u32 = 6;
/// Lazy PLT slot
pub const R_X86_64_JUMP_SLOT: u32 = 7;
/// Base-relative fixup
pub const R_X86_64_RELATIVE: u32 = 8;
/// PC-relative 32-bit to a GOT slot
pub const R_X86_64_GOTPCREL: u32 = 9;
/// Direct 32-bit zero-extended
pub const R_X86_64_32: u32 = 10;
/// Direct 32-bit sign-extended
pub const R_X86_64_32S: u32 = 11;
/// Direct 16-bit
pub const R_X86_64_16: u32 = 12;
/// PC-relative 16-bit
pub const R_X86_64_PC16: u32 = 13;
/// Direct 8-bit
pub const R_X86_64_8: u32 = 14;
/// PC-relative 8-bit
pub const R_X86_64_PC8: u32 = 15;
/// TLS module id
pub const R_X86_64_DTPMOD64: u32 = 16;
/// TLS block offset, 64-bit
pub const R_X86_64_DTPOFF64: u32 = 17;
/// Thread-pointer offset, 64-bit
pub const R_X86_64_TPOFF64: u32 = 18;
/// General-dynamic TLS sequence
pub const R_X86_64_TLSGD: u32 = 19;
/// Local-dynamic TLS sequence
pub const R_X86_64_TLSLD: u32 = 20;
/// TLS block offset, 32-bit
pub const R_X86_64_DTPOFF32: u32 = 21;
/// PC-relative 32-bit to a thread-pointer GOT slot
pub const R_X86_64_GOTTPOFF: u32 = 22;
/// Thread-pointer offset, 32-bit
pub const R_X86_64_TPOFF32: u32 = 23;
/// PC-relative 64-bit
pub const R_X86_64_PC64: u32 = 24;
/// Offset from GOT base, 64-bit
pub const R_X86_64_GOTOFF64: u32 = 25;
/// PC-relative 32-bit to the GOT base
pub const R_X86_64_GOTPC32: u32 = 26;
/// 64-bit GOT entry offset
pub const R_X86_64_GOT64: u32 = 27;
/// PC-relative 64-bit to a GOT slot
pub const R_X86_64_GOTPCREL64: u32 = 28;
/// PC-relative 64-bit to the GOT base
pub const R_X86_64_GOTPC64: u32 = 29;
/// Symbol size, 32-bit
pub const R_X86_64_SIZE32: u32 = 32;
/// Symbol size, 64-bit
pub const R_X86_64_SIZE64: u32 = 33;
/// PC-relative 32-bit to a TLS descriptor
pub const R_X86_64_GOTPC32_TLSDESC: u32 = 34;
/// Marker on the TLS descriptor call
pub const R_X86_64_TLSDESC_CALL: u32 = 35;
/// TLS descriptor pair
pub const R_X86_64_TLSDESC: u32 = 36;
/// Ifunc resolver fixup
pub const R_X86_64_IRELATIVE: u32 = 37;
/// Relaxable GOT load
pub const R_X86_64_GOTPCRELX: u32 = 41;
/// Relaxable REX-prefixed GOT load
pub const R_X86_64_REX_GOTPCRELX: u32 = 42;

/// `call/jmp *sym@GOT(%rip)` forms that relax to direct branches
fn relax_gotpcrelx(loc: &[u8]) -> Option<[u8; 2]> {
    match loc {
        [0xff, 0x15] => Some([0x90, 0xe8]), // call *0(%rip) -> call 0
        [0xff, 0x25] => Some([0x90, 0xe9]), // jmp  *0(%rip) -> jmp  0
        _ => None,
    }
}

/// `mov sym@GOT(%rip), reg` forms that relax to `lea`
fn relax_rex_gotpcrelx(loc: &[u8]) -> Option<[u8; 3]> {
    match loc {
        [0x48, 0x8b, modrm @ 0x05..=0x3d] if (modrm - 5) % 8 == 0 => Some([0x48, 0x8d, *modrm]),
        [0x4c, 0x8b, modrm @ 0x05..=0x3d] if (modrm - 5) % 8 == 0 => Some([0x4c, 0x8d, *modrm]),
        _ => None,
    }
}

/// `mov sym@GOTTPOFF(%rip), reg` forms that relax to `mov $imm, reg`
fn relax_gottpoff(loc: &[u8]) -> Option<[u8; 3]> {
    match loc {
        [0x48, 0x8b, modrm @ 0x05..=0x3d] if (modrm - 5) % 8 == 0 => {
            Some([0x48, 0xc7, 0xc0 + (modrm - 5) / 8])
        }
        [0x4c, 0x8b, modrm @ 0x05..=0x3d] if (modrm - 5) % 8 == 0 => {
            Some([0x49, 0xc7, 0xc0 + (modrm - 5) / 8])
        }
        _ => None,
    }
}

fn prefix(contents: &[u8], offset: usize, len: usize) -> &[u8] {
    offset
        .checked_sub(len)
        .and_then(|start| contents.get(start..offset))
        .unwrap_or(&[])
}

/// Classify this section's relocations (see the module docs of `scan`)
pub fn scan_section(ctx: &Context, file: &ObjectFile, isec: &InputSection) -> Result<()> {
    debug_assert!(isec.shdr.sh_flags & SHF_ALLOC != 0);

    let rels = &isec.rels;
    let mut i = 0;
    while i < rels.len() {
        let rel = &rels[i];
        let idx = i;
        i += 1;
        if rel.r_type == R_X86_64_NONE {
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

        let loc = rel.r_offset as usize;

        match rel.r_type {
            R_X86_64_8 | R_X86_64_16 | R_X86_64_32 | R_X86_64_32S => {
                // The dynamic loader has no narrow relocation types, so
                // these must be link-time constants.
                const TABLE: ActionTable = [
                    // Absolute      Local          Imported data  Imported code
                    [Action::None, Action::Error, Action::Error, Action::Error], // DSO
                    [Action::None, Action::Error, Action::Error, Action::Error], // PIE
                    [Action::None, Action::None, Action::Copyrel, Action::Plt],  // PDE
                ];
                dispatch(ctx, file, isec, &TABLE, idx, rel, sym)?;
            }
            R_X86_64_64 => {
                const TABLE: ActionTable = [
                    // Absolute      Local            Imported data   Imported code
                    [Action::None, Action::Baserel, Action::Dynrel, Action::Dynrel], // DSO
                    [Action::None, Action::Baserel, Action::Dynrel, Action::Dynrel], // PIE
                    [Action::None, Action::None, Action::Dynrel, Action::Dynrel],    // PDE
                ];
                dispatch(ctx, file, isec, &TABLE, idx, rel, sym)?;
            }
            R_X86_64_PC8 | R_X86_64_PC16 | R_X86_64_PC32 => {
                const TABLE: ActionTable = [
                    // Absolute       Local         Imported data   Imported code
                    [Action::Error, Action::None, Action::Error, Action::Error], // DSO
                    [Action::Error, Action::None, Action::Copyrel, Action::Plt], // PIE
                    [Action::None, Action::None, Action::Copyrel, Action::Plt],  // PDE
                ];
                dispatch(ctx, file, isec, &TABLE, idx, rel, sym)?;
            }
            R_X86_64_PC64 => {
                const TABLE: ActionTable = [
                    // Absolute         Local         Imported data   Imported code
                    [Action::Baserel, Action::None, Action::Error, Action::Error], // DSO
                    [Action::Baserel, Action::None, Action::Copyrel, Action::Plt], // PIE
                    [Action::None, Action::None, Action::Copyrel, Action::Plt],    // PDE
                ];
                dispatch(ctx, file, isec, &TABLE, idx, rel, sym)?;
            }
            R_X86_64_GOT32 | R_X86_64_GOT64 | R_X86_64_GOTPC32 | R_X86_64_GOTPC64
            | R_X86_64_GOTOFF64 | R_X86_64_GOTPCREL | R_X86_64_GOTPCREL64 => {
                sym.add_flags(Needs::GOT);
            }
            R_X86_64_GOTPCRELX => {
                if rel.r_addend != -4 {
                    return Err(bad_sequence(file, isec, "bad r_addend for R_X86_64_GOTPCRELX"));
                }
                let can_relax = ctx.options.relax
                    && !sym.is_imported()
                    && sym.is_relative(ctx)
                    && relax_gotpcrelx(prefix(&isec.contents, loc, 2)).is_some();
                if !can_relax {
                    sym.add_flags(Needs::GOT);
                }
            }
            R_X86_64_REX_GOTPCRELX => {
                if rel.r_addend != -4 {
                    return Err(bad_sequence(
                        file,
                        isec,
                        "bad r_addend for R_X86_64_REX_GOTPCRELX",
                    ));
                }
                let can_relax = ctx.options.relax
                    && !sym.is_imported()
                    && sym.is_relative(ctx)
                    && relax_rex_gotpcrelx(prefix(&isec.contents, loc, 3)).is_some();
                if !can_relax {
                    sym.add_flags(Needs::GOT);
                }
            }
            R_X86_64_PLT32 => {
                if sym.is_imported() {
                    sym.add_flags(Needs::PLT);
                }
            }
            R_X86_64_TLSGD => {
                if i == rels.len() {
                    return Err(bad_sequence(
                        file,
                        isec,
                        "TLSGD reloc must be followed by PLT32 or GOTPCREL",
                    ));
                }
                if ctx.options.relax && !ctx.is_shared() && !sym.is_imported() {
                    // The whole call sequence is rewritten to LE; the
                    // trailing call relocation disappears with it.
                    i += 1;
                } else {
                    sym.add_flags(Needs::TLSGD);
                }
            }
            R_X86_64_TLSLD => {
                if i == rels.len() {
                    return Err(bad_sequence(
                        file,
                        isec,
                        "TLSLD reloc must be followed by PLT32 or GOTPCREL",
                    ));
                }
                if sym.is_imported() {
                    return Err(bad_sequence(file, isec, "TLSLD reloc refers external symbol"));
                }
                if ctx.options.relax && !ctx.is_shared() {
                    i += 1;
                } else {
                    sym.add_flags(Needs::TLSLD);
                }
            }
            R_X86_64_DTPOFF32 | R_X86_64_DTPOFF64 => {
                if sym.is_imported() {
                    return Err(bad_sequence(file, isec, "DTPOFF reloc refers external symbol"));
                }
            }
            R_X86_64_GOTTPOFF => {
                ctx.has_gottp_rel
                    .store(true, std::sync::atomic::Ordering::Relaxed);
                let can_relax = ctx.options.relax
                    && !ctx.is_shared()
                    && !sym.is_imported()
                    && relax_gottpoff(prefix(&isec.contents, loc, 3)).is_some();
                if !can_relax {
                    sym.add_flags(Needs::GOTTP);
                }
            }
            R_X86_64_GOTPC32_TLSDESC => {
                if prefix(&isec.contents, loc, 3) != [0x48, 0x8d, 0x05] {
                    return Err(bad_sequence(
                        file,
                        isec,
                        "GOTPC32_TLSDESC relocation is used against an invalid code sequence",
                    ));
                }
                if !(ctx.relax_tlsdesc() && !sym.is_imported()) {
                    sym.add_flags(Needs::TLSDESC);
                }
            }
            R_X86_64_TPOFF32 | R_X86_64_TPOFF64 | R_X86_64_SIZE32 | R_X86_64_SIZE64
            | R_X86_64_TLSDESC_CALL => {}
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

fn bad_sequence(file: &ObjectFile, isec: &InputSection, message: &str) -> Error {
    Error::BadRelocationSequence {
        file: file.display_name(),
        section: isec.name.clone(),
        message: message.to_string(),
    }
}

struct Checked<'a, 'b> {
    ctx: &'a Context,
    isec: &'a InputSection,
    sym: &'a Arc<Symbol>,
    rel: &'a Rel,
    /// The section's output bytes; relax arms patch opcodes through it
    base: &'b mut [u8],
}

impl Checked<'_, '_> {
    fn overflow(&self, val: i64, lo: i64, hi: i64) {
        self.ctx.diags.error(format!(
            "{}: relocation {} against {} out of range: {} is not in [{}, {})",
            self.isec.display(self.ctx),
            self.rel.r_type,
            self.sym.name(),
            val,
            lo,
            hi
        ));
    }

    fn loc(&mut self) -> usize {
        self.rel.r_offset as usize
    }

    fn write8(&mut self, val: i64) {
        if !(0..1 << 8).contains(&val) {
            self.overflow(val, 0, 1 << 8);
        }
        let loc = self.loc();
        self.base[loc] = val as u8;
    }

    fn write8s(&mut self, val: i64) {
        if !(-(1 << 7)..1 << 7).contains(&val) {
            self.overflow(val, -(1 << 7), 1 << 7);
        }
        let loc = self.loc();
        self.base[loc] = val as u8;
    }

    fn write16(&mut self, val: i64) {
        if !(0..1 << 16).contains(&val) {
            self.overflow(val, 0, 1 << 16);
        }
        let loc = self.loc();
        crate::elf::put_u16(self.base, loc, val as u16);
    }

    fn write16s(&mut self, val: i64) {
        if !(-(1 << 15)..1 << 15).contains(&val) {
            self.overflow(val, -(1 << 15), 1 << 15);
        }
        let loc = self.loc();
        crate::elf::put_u16(self.base, loc, val as u16);
    }

    fn write32(&mut self, val: i64) {
        if !(0..1 << 32).contains(&val) {
            self.overflow(val, 0, 1 << 32);
        }
        let loc = self.loc();
        crate::elf::put_u32(self.base, loc, val as u32);
    }

    fn write32s(&mut self, val: i64) {
        if !(-(1 << 31)..1 << 31).contains(&val) {
            self.overflow(val, -(1 << 31), 1 << 31);
        }
        let loc = self.loc();
        crate::elf::put_u32(self.base, loc, val as u32);
    }

    fn write64(&mut self, val: i64) {
        let loc = self.loc();
        crate::elf::put_u64(self.base, loc, val as u64);
    }
}

/// Apply relocations to a mapped section (see `InputSection::copy_and_relocate`)
pub fn apply_reloc_alloc(ctx: &Context, isec: &InputSection, base: &mut [u8], dynrel: &mut DynrelWriter) {
    let file = &ctx.objs[isec.file as usize];
    let section_addr = isec.get_addr(ctx);
    let got_base = ctx.got.hdr.sh_addr;

    let mut i = 0;
    while i < isec.rels.len() {
        let rel = &isec.rels[i];
        let idx = i;
        i += 1;
        if rel.r_type == R_X86_64_NONE {
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
        let a = match frag {
            Some(f) => f.addend,
            None => rel.r_addend,
        };
        let p = (section_addr + rel.r_offset) as i64;
        let g = sym.get_got_addr(ctx) as i64 - got_base as i64;
        let got = got_base as i64;
        let loc = rel.r_offset as usize;

        let mut w = Checked {
            ctx,
            isec,
            sym,
            rel,
            base: &mut *base,
        };

        match isec.rel_action(idx) {
            RelAction::Baserel => {
                dynrel.push(Rel {
                    r_offset: p as u64,
                    r_type: R_X86_64_RELATIVE,
                    r_sym: 0,
                    r_addend: s + a,
                });
                w.write64(s + a);
                continue;
            }
            RelAction::Dynrel => {
                dynrel.push(Rel {
                    r_offset: p as u64,
                    r_type: R_X86_64_64,
                    r_sym: sym.get_dynsym_idx(ctx),
                    r_addend: a,
                });
                w.write64(a);
                continue;
            }
            RelAction::Plain => {}
        }

        match rel.r_type {
            R_X86_64_8 => w.write8(s + a),
            R_X86_64_16 => w.write16(s + a),
            R_X86_64_32 => w.write32(s + a),
            R_X86_64_32S => w.write32s(s + a),
            R_X86_64_64 => w.write64(s + a),
            R_X86_64_PC8 => w.write8s(s + a - p),
            R_X86_64_PC16 => w.write16s(s + a - p),
            R_X86_64_PC32 => w.write32s(s + a - p),
            R_X86_64_PC64 => w.write64(s + a - p),
            R_X86_64_PLT32 => {
                // An unresolved weak call degrades to a jump over its
                // own displacement, i.e. a no-op.
                if sym.is_undef_weak(ctx) {
                    w.write32s(0);
                } else {
                    w.write32s(s + a - p);
                }
            }
            R_X86_64_GOT32 => w.write32s(g + a),
            R_X86_64_GOT64 => w.write64(g + a),
            R_X86_64_GOTOFF64 => w.write64(s + a - got),
            R_X86_64_GOTPC32 => w.write32s(got + a - p),
            R_X86_64_GOTPC64 => w.write64(got + a - p),
            R_X86_64_GOTPCREL => w.write32s(g + got + a - p),
            R_X86_64_GOTPCREL64 => w.write64(g + got + a - p),
            R_X86_64_GOTPCRELX => {
                if sym.got_idx(ctx).is_none() {
                    if let Some(insn) = relax_gotpcrelx(prefix(w.base, loc, 2)) {
                        w.base[loc - 2..loc].copy_from_slice(&insn);
                    }
                    w.write32s(s + a - p);
                } else {
                    w.write32s(g + got + a - p);
                }
            }
            R_X86_64_REX_GOTPCRELX => {
                if sym.got_idx(ctx).is_none() {
                    if let Some(insn) = relax_rex_gotpcrelx(prefix(w.base, loc, 3)) {
                        w.base[loc - 3..loc].copy_from_slice(&insn);
                    }
                    w.write32s(s + a - p);
                } else {
                    w.write32s(g + got + a - p);
                }
            }
            R_X86_64_TLSGD => {
                if sym.tlsgd_idx(ctx).is_none() {
                    // Relax GD to LE: the __tls_get_addr call becomes a
                    // thread-pointer load plus an add.
                    const INSN: [u8; 16] = [
                        0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0, // mov %fs:0, %rax
                        0x48, 0x8d, 0x80, 0, 0, 0, 0, // lea 0(%rax), %rax
                    ];
                    w.base[loc - 4..loc + 12].copy_from_slice(&INSN);
                    let val = s - ctx.tls_end as i64 + a + 4;
                    if !(-(1i64 << 31)..1i64 << 31).contains(&val) {
                        w.overflow(val, -(1 << 31), 1 << 31);
                    }
                    crate::elf::put_u32(w.base, loc + 8, val as u32);
                    i += 1;
                } else {
                    w.write32s(sym.get_tlsgd_addr(ctx) as i64 + a - p);
                }
            }
            R_X86_64_TLSLD => {
                if ctx.got.tlsld_idx().is_none() {
                    // Relax LD to LE.
                    const INSN: [u8; 12] = [
                        0x66, 0x66, 0x66, // padding
                        0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0, // mov %fs:0, %rax
                    ];
                    w.base[loc - 3..loc + 9].copy_from_slice(&INSN);
                    i += 1;
                } else {
                    w.write32s(ctx.got.tlsld_addr(ctx) as i64 + a - p);
                }
            }
            R_X86_64_DTPOFF32 => {
                if ctx.options.relax && !ctx.is_shared() {
                    w.write32s(s + a - ctx.tls_end as i64);
                } else {
                    w.write32s(s + a - ctx.tls_begin as i64);
                }
            }
            R_X86_64_DTPOFF64 => {
                if ctx.options.relax && !ctx.is_shared() {
                    w.write64(s + a - ctx.tls_end as i64);
                } else {
                    w.write64(s + a - ctx.tls_begin as i64);
                }
            }
            R_X86_64_TPOFF32 => w.write32s(s + a - ctx.tls_end as i64),
            R_X86_64_TPOFF64 => w.write64(s + a - ctx.tls_end as i64),
            R_X86_64_GOTTPOFF => {
                if sym.gottp_idx(ctx).is_none() {
                    if let Some(insn) = relax_gottpoff(prefix(w.base, loc, 3)) {
                        w.base[loc - 3..loc].copy_from_slice(&insn);
                    }
                    w.write32s(s + a - ctx.tls_end as i64 + 4);
                } else {
                    w.write32s(sym.get_gottp_addr(ctx) as i64 + a - p);
                }
            }
            R_X86_64_GOTPC32_TLSDESC => {
                if sym.tlsdesc_idx(ctx).is_none() {
                    // lea sym@tlsdesc(%rip), %rax -> mov $imm, %rax
                    const INSN: [u8; 3] = [0x48, 0xc7, 0xc0];
                    w.base[loc - 3..loc].copy_from_slice(&INSN);
                    w.write32s(s + a - ctx.tls_end as i64 + 4);
                } else {
                    w.write32s(sym.get_tlsdesc_addr(ctx) as i64 + a - p);
                }
            }
            R_X86_64_TLSDESC_CALL => {
                if ctx.relax_tlsdesc() && !sym.is_imported() {
                    // call *(%rax) -> nop
                    w.base[loc] = 0x66;
                    w.base[loc + 1] = 0x90;
                }
            }
            R_X86_64_SIZE32 => {
                let size = sym.esym(ctx).st_size as i64;
                w.write32(size + a);
            }
            R_X86_64_SIZE64 => {
                let size = sym.esym(ctx).st_size as i64;
                w.write64(size + a);
            }
            _ => {}
        }
    }
}

/// Apply the absolute-only subset used for unmapped (debug) sections
pub fn apply_reloc_nonalloc(ctx: &Context, isec: &InputSection, base: &mut [u8]) {
    let file = &ctx.objs[isec.file as usize];

    for (idx, rel) in isec.rels.iter().enumerate() {
        if rel.r_type == R_X86_64_NONE {
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
        let a = match frag {
            Some(f) => f.addend,
            None => rel.r_addend,
        };

        let mut w = Checked {
            ctx,
            isec,
            sym,
            rel,
            base: &mut *base,
        };

        match rel.r_type {
            R_X86_64_8 => w.write8(s + a),
            R_X86_64_16 => w.write16(s + a),
            R_X86_64_32 => w.write32(s + a),
            R_X86_64_32S => w.write32s(s + a),
            R_X86_64_64 => w.write64(s + a),
            R_X86_64_DTPOFF32 => w.write32s(s + a - ctx.tls_begin as i64),
            R_X86_64_DTPOFF64 => w.write64(s + a - ctx.tls_begin as i64),
            R_X86_64_SIZE32 => {
                let size = sym.esym(ctx).st_size as i64;
                w.write32(size + a);
            }
            R_X86_64_SIZE64 => {
                let size = sym.esym(ctx).st_size as i64;
                w.write64(size + a);
            }
            _ => ctx.diags.error(format!(
                "{}: invalid relocation for non-allocated sections: {}",
                isec.display(ctx),
                rel.r_type
            )),
        }
    }
}

/// Fill .plt: the resolver trampoline followed by one lazy stub per
/// symbol
pub fn write_plt(ctx: &Context, buf: &mut [u8]) {
    const PLT0: [u8; 16] = [
        0xff, 0x35, 0, 0, 0, 0, // pushq GOTPLT+8(%rip)
        0xff, 0x25, 0, 0, 0, 0, // jmp *GOTPLT+16(%rip)
        0x0f, 0x1f, 0x40, 0x00, // nop
    ];
    let plt = ctx.plt.hdr.sh_addr;
    let gotplt = ctx.gotplt.hdr.sh_addr;

    buf[..16].copy_from_slice(&PLT0);
    crate::elf::put_u32(buf, 2, (gotplt as i64 - plt as i64 + 2) as u32);
    crate::elf::put_u32(buf, 8, (gotplt as i64 - plt as i64 + 4) as u32);

    const ENTRY: [u8; 16] = [
        0xff, 0x25, 0, 0, 0, 0, // jmp   *foo@GOTPLT
        0x68, 0, 0, 0, 0, // push  $index_in_relplt
        0xe9, 0, 0, 0, 0, // jmp   PLT[0]
    ];
    for (idx, sym) in ctx.plt.symbols.iter().enumerate() {
        let off = 16 + idx * 16;
        let ent_addr = plt + off as u64;
        buf[off..off + 16].copy_from_slice(&ENTRY);
        crate::elf::put_u32(
            buf,
            off + 2,
            (sym.get_gotplt_addr(ctx) as i64 - ent_addr as i64 - 6) as u32,
        );
        crate::elf::put_u32(buf, off + 7, idx as u32);
        crate::elf::put_u32(buf, off + 12, (plt as i64 - ent_addr as i64 - 16) as u32);
    }
}

/// Fill .plt.got: eager stubs jumping through already-assigned GOT slots
pub fn write_pltgot(ctx: &Context, buf: &mut [u8]) {
    const ENTRY: [u8; 8] = [
        0xff, 0x25, 0, 0, 0, 0, // jmp   *foo@GOT
        0x66, 0x90, // nop
    ];
    for (idx, sym) in ctx.pltgot.symbols.iter().enumerate() {
        let off = idx * 8;
        let ent_addr = ctx.pltgot.hdr.sh_addr + off as u64;
        buf[off..off + 8].copy_from_slice(&ENTRY);
        crate::elf::put_u32(
            buf,
            off + 2,
            (sym.get_got_addr(ctx) as i64 - ent_addr as i64 - 6) as u32,
        );
    }
}

/// The absolute/PC-relative subset .eh_frame records may carry
pub fn apply_ehframe_reloc(r_type: u32, base: &mut [u8], loc: usize, vaddr: u64, val: u64) {
    match r_type {
        R_X86_64_NONE => {}
        R_X86_64_32 => crate::elf::put_u32(base, loc, val as u32),
        R_X86_64_64 => crate::elf::put_u64(base, loc, val),
        R_X86_64_PC32 => crate::elf::put_u32(base, loc, (val as i64 - vaddr as i64) as u32),
        R_X86_64_PC64 => crate::elf::put_u64(base, loc, (val as i64 - vaddr as i64) as u64),
        _ => {}
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_relax_rex_gotpcrelx_rewrites_mov_to_lea() {
        // mov 0(%rip), %rax
        assert_eq!(
            relax_rex_gotpcrelx(&[0x48, 0x8b, 0x05]),
            Some([0x48, 0x8d, 0x05])
        );
        // mov 0(%rip), %r15
        assert_eq!(
            relax_rex_gotpcrelx(&[0x4c, 0x8b, 0x3d]),
            Some([0x4c, 0x8d, 0x3d])
        );
        // Not a GOT load.
        assert_eq!(relax_rex_gotpcrelx(&[0x48, 0x8d, 0x05]), None);
    }

    #[test]
    fn test_relax_gotpcrelx_rewrites_indirect_branches() {
        assert_eq!(relax_gotpcrelx(&[0xff, 0x15]), Some([0x90, 0xe8]));
        assert_eq!(relax_gotpcrelx(&[0xff, 0x25]), Some([0x90, 0xe9]));
        assert_eq!(relax_gotpcrelx(&[0x48, 0x8b]), None);
    }

    #[test]
    fn test_relax_gottpoff_rewrites_to_immediate() {
        // mov 0(%rip), %rcx -> mov $imm, %rcx
        assert_eq!(
            relax_gottpoff(&[0x48, 0x8b, 0x0d]),
            Some([0x48, 0xc7, 0xc1])
        );
        // mov 0(%rip), %r8 -> mov $imm, %r8
        assert_eq!(
            relax_gottpoff(&[0x4c, 0x8b, 0x05]),
            Some([0x49, 0xc7, 0xc0])
        );
    }
}
