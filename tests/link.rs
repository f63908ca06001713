//! End-to-end link scenarios over hand-assembled object files
//!
//! Each test builds one or more relocatable objects byte-by-byte with
//! the crate's own record writers, links them through the full
//! pipeline, and checks the resulting context and image.

use std::sync::atomic::AtomicUsize;

use elfld::arch::Machine;
use elfld::context::{Context, LinkMode, Options};
use elfld::elf::{self, Class, Rel, Shdr, Sym};
use elfld::symbol::Needs;

#[derive(Clone)]
struct SectSpec {
    name: String,
    sh_type: u32,
    sh_flags: u64,
    sh_addralign: u64,
    sh_entsize: u64,
    data: Vec<u8>,
    rels: Vec<Rel>,
}

#[derive(Default)]
struct ObjBuilder {
    sections: Vec<SectSpec>,
    locals: Vec<(String, Sym)>,
    globals: Vec<(String, Sym)>,
    groups: Vec<(u32, Vec<u32>)>, // (signature symbol index, member shndx)
}

impl ObjBuilder {
    fn new() -> Self {
        Self::default()
    }

    /// Add a section; returns the section header index symbols refer to
    fn section(
        &mut self,
        name: &str,
        sh_type: u32,
        sh_flags: u64,
        align: u64,
        entsize: u64,
        data: &[u8],
    ) -> u16 {
        self.sections.push(SectSpec {
            name: name.to_string(),
            sh_type,
            sh_flags,
            sh_addralign: align,
            sh_entsize: entsize,
            data: data.to_vec(),
            rels: Vec::new(),
        });
        self.sections.len() as u16
    }

    fn rel(&mut self, shndx: u16, rel: Rel) {
        self.sections[shndx as usize - 1].rels.push(rel);
    }

    /// Add a local symbol; returns its symbol table index
    fn local(&mut self, name: &str, sym: Sym) -> u32 {
        assert!(self.globals.is_empty());
        self.locals.push((name.to_string(), sym));
        self.locals.len() as u32
    }

    /// Add a global symbol; returns its symbol table index
    fn global(&mut self, name: &str, sym: Sym) -> u32 {
        self.globals.push((name.to_string(), sym));
        (self.locals.len() + self.globals.len()) as u32
    }

    fn group(&mut self, signature_sym: u32, members: Vec<u16>) {
        self.groups
            .push((signature_sym, members.iter().map(|&m| m as u32).collect()));
    }

    fn build(&self, machine: Machine) -> Vec<u8> {
        let class = machine.class();
        let is_rela = machine.is_rela();

        // Section plan: null, user sections, rela sections, groups,
        // symtab, strtab, shstrtab.
        let num_user = self.sections.len();
        let mut rela_of: Vec<Option<usize>> = vec![None; num_user];
        let mut next = 1 + num_user;
        for (i, sect) in self.sections.iter().enumerate() {
            if !sect.rels.is_empty() {
                rela_of[i] = Some(next);
                next += 1;
            }
        }
        let group_base = next;
        next += self.groups.len();
        let symtab_idx = next;
        let strtab_idx = next + 1;
        let shstrtab_idx = next + 2;
        let num_sections = next + 3;

        // String tables.
        let mut strtab: Vec<u8> = vec![0];
        let mut sym_name = |table: &mut Vec<u8>, name: &str| -> u32 {
            if name.is_empty() {
                return 0;
            }
            let off = table.len() as u32;
            table.extend_from_slice(name.as_bytes());
            table.push(0);
            off
        };

        let mut syms: Vec<Sym> = vec![Sym::default()];
        for (name, sym) in self.locals.iter().chain(self.globals.iter()) {
            let mut s = *sym;
            s.st_name = sym_name(&mut strtab, name);
            syms.push(s);
        }
        let first_global = 1 + self.locals.len();

        let mut shstrtab: Vec<u8> = vec![0];
        let mut shdrs: Vec<(Shdr, Vec<u8>)> = vec![(Shdr::default(), Vec::new())];

        let mut add_shdr = |shstrtab: &mut Vec<u8>, name: &str, mut hdr: Shdr, data: Vec<u8>| {
            hdr.sh_name = {
                let off = shstrtab.len() as u32;
                shstrtab.extend_from_slice(name.as_bytes());
                shstrtab.push(0);
                off
            };
            hdr.sh_size = data.len() as u64;
            (hdr, data)
        };

        for sect in &self.sections {
            shdrs.push(add_shdr(
                &mut shstrtab,
                &sect.name,
                Shdr {
                    sh_type: sect.sh_type,
                    sh_flags: sect.sh_flags,
                    sh_addralign: sect.sh_addralign,
                    sh_entsize: sect.sh_entsize,
                    ..Shdr::default()
                },
                sect.data.clone(),
            ));
        }
        for (i, sect) in self.sections.iter().enumerate() {
            if sect.rels.is_empty() {
                continue;
            }
            let entsize = class.rel_size(is_rela);
            let mut data = vec![0u8; sect.rels.len() * entsize];
            for (r, rel) in sect.rels.iter().enumerate() {
                rel.write_to(class, is_rela, &mut data[r * entsize..]);
            }
            shdrs.push(add_shdr(
                &mut shstrtab,
                &format!(".rela{}", sect.name),
                Shdr {
                    sh_type: if is_rela { elf::SHT_RELA } else { elf::SHT_REL },
                    sh_link: symtab_idx as u32,
                    sh_info: (i + 1) as u32,
                    sh_entsize: entsize as u64,
                    sh_addralign: 8,
                    ..Shdr::default()
                },
                data,
            ));
        }
        for (sig, members) in &self.groups {
            let mut data = elf::GRP_COMDAT.to_le_bytes().to_vec();
            for member in members {
                data.extend_from_slice(&member.to_le_bytes());
            }
            shdrs.push(add_shdr(
                &mut shstrtab,
                ".group",
                Shdr {
                    sh_type: elf::SHT_GROUP,
                    sh_link: symtab_idx as u32,
                    sh_info: *sig,
                    sh_entsize: 4,
                    sh_addralign: 4,
                    ..Shdr::default()
                },
                data,
            ));
        }

        let sym_entsize = class.sym_size();
        let mut symtab_data = vec![0u8; syms.len() * sym_entsize];
        for (i, sym) in syms.iter().enumerate() {
            sym.write_to(class, &mut symtab_data[i * sym_entsize..]);
        }
        shdrs.push(add_shdr(
            &mut shstrtab,
            ".symtab",
            Shdr {
                sh_type: elf::SHT_SYMTAB,
                sh_link: strtab_idx as u32,
                sh_info: first_global as u32,
                sh_entsize: sym_entsize as u64,
                sh_addralign: 8,
                ..Shdr::default()
            },
            symtab_data,
        ));
        shdrs.push(add_shdr(
            &mut shstrtab,
            ".strtab",
            Shdr {
                sh_type: elf::SHT_STRTAB,
                sh_addralign: 1,
                ..Shdr::default()
            },
            strtab,
        ));
        let shstrtab_copy = {
            let off = shstrtab.len() as u32;
            shstrtab.extend_from_slice(b".shstrtab\0");
            let mut data = shstrtab.clone();
            // Name offset points into the table itself.
            let hdr = Shdr {
                sh_name: off,
                sh_type: elf::SHT_STRTAB,
                sh_addralign: 1,
                sh_size: data.len() as u64,
                ..Shdr::default()
            };
            data.shrink_to_fit();
            (hdr, data)
        };
        shdrs.push(shstrtab_copy);

        assert_eq!(shdrs.len(), num_sections);
        assert_eq!(group_base + self.groups.len(), symtab_idx);
        let _ = shstrtab_idx;

        // Serialize: ELF header, section bodies, section header table.
        let mut body_off = class.ehdr_size();
        for (hdr, data) in shdrs.iter_mut() {
            if hdr.sh_type != elf::SHT_NULL && !data.is_empty() {
                body_off = (body_off + 7) & !7;
                hdr.sh_offset = body_off as u64;
                body_off += data.len();
            }
        }
        let shoff = (body_off + 7) & !7;

        let mut out = vec![0u8; shoff + shdrs.len() * class.shdr_size()];
        elf::Ehdr {
            e_type: elf::ET_REL,
            e_machine: machine.e_machine(),
            e_shoff: shoff as u64,
            e_shnum: shdrs.len() as u16,
            e_shstrndx: (shdrs.len() - 1) as u16,
            ..elf::Ehdr::default()
        }
        .write_to(class, &mut out);

        for (hdr, data) in &shdrs {
            if !data.is_empty() {
                let off = hdr.sh_offset as usize;
                out[off..off + data.len()].copy_from_slice(data);
            }
            // Header written below.
        }
        for (i, (hdr, _)) in shdrs.iter().enumerate() {
            hdr.write_to(class, &mut out[shoff + i * class.shdr_size()..]);
        }
        out
    }
}

/// A minimal shared object exporting the given function symbols
fn build_dso(machine: Machine, funcs: &[&str]) -> Vec<u8> {
    let class = machine.class();
    let sym_entsize = class.sym_size();

    let mut dynstr: Vec<u8> = vec![0];
    let mut syms: Vec<Sym> = vec![Sym::default()];
    for (i, name) in funcs.iter().enumerate() {
        let off = dynstr.len() as u32;
        dynstr.extend_from_slice(name.as_bytes());
        dynstr.push(0);
        syms.push(Sym {
            st_name: off,
            st_info: Sym::info(elf::STB_GLOBAL, elf::STT_FUNC),
            st_shndx: 1,
            st_value: 0x1000 + 0x10 * i as u64,
            st_size: 16,
            ..Sym::default()
        });
    }
    let mut dynsym = vec![0u8; syms.len() * sym_entsize];
    for (i, sym) in syms.iter().enumerate() {
        sym.write_to(class, &mut dynsym[i * sym_entsize..]);
    }

    let shstrtab = b"\0.text\0.dynsym\0.dynstr\0.shstrtab\0".to_vec();
    let ehdr_size = class.ehdr_size();
    let text_off = ehdr_size;
    let dynsym_off = (text_off + 16 + 7) & !7;
    let dynstr_off = dynsym_off + dynsym.len();
    let shstr_off = dynstr_off + dynstr.len();
    let shoff = (shstr_off + shstrtab.len() + 7) & !7;

    let shdrs = [
        Shdr::default(),
        Shdr {
            sh_name: 1,
            sh_type: elf::SHT_PROGBITS,
            sh_flags: elf::SHF_ALLOC | elf::SHF_EXECINSTR,
            sh_addr: 0x1000,
            sh_offset: text_off as u64,
            sh_size: 16,
            sh_addralign: 16,
            ..Shdr::default()
        },
        Shdr {
            sh_name: 7,
            sh_type: elf::SHT_DYNSYM,
            sh_offset: dynsym_off as u64,
            sh_size: dynsym.len() as u64,
            sh_link: 3,
            sh_info: 1,
            sh_entsize: sym_entsize as u64,
            sh_addralign: 8,
            ..Shdr::default()
        },
        Shdr {
            sh_name: 15,
            sh_type: elf::SHT_STRTAB,
            sh_offset: dynstr_off as u64,
            sh_size: dynstr.len() as u64,
            sh_addralign: 1,
            ..Shdr::default()
        },
        Shdr {
            sh_name: 23,
            sh_type: elf::SHT_STRTAB,
            sh_offset: shstr_off as u64,
            sh_size: shstrtab.len() as u64,
            sh_addralign: 1,
            ..Shdr::default()
        },
    ];

    let mut out = vec![0u8; shoff + shdrs.len() * class.shdr_size()];
    elf::Ehdr {
        e_type: elf::ET_DYN,
        e_machine: machine.e_machine(),
        e_shoff: shoff as u64,
        e_shnum: shdrs.len() as u16,
        e_shstrndx: 4,
        ..elf::Ehdr::default()
    }
    .write_to(class, &mut out);
    out[dynsym_off..dynsym_off + dynsym.len()].copy_from_slice(&dynsym);
    out[dynstr_off..dynstr_off + dynstr.len()].copy_from_slice(&dynstr);
    out[shstr_off..shstr_off + shstrtab.len()].copy_from_slice(&shstrtab);
    for (i, hdr) in shdrs.iter().enumerate() {
        hdr.write_to(class, &mut out[shoff + i * class.shdr_size()..]);
    }
    out
}

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn write_temp(name: &str, data: &[u8]) -> String {
    let n = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!(
        "elfld-test-{}-{}-{}",
        std::process::id(),
        n,
        name
    ));
    std::fs::write(&path, data).expect("write temp input");
    path.display().to_string()
}

fn start_obj() -> ObjBuilder {
    let mut builder = ObjBuilder::new();
    let text = builder.section(
        ".text",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        16,
        0,
        &[0xc3; 16],
    );
    builder.global(
        "_start",
        Sym {
            st_info: Sym::info(elf::STB_GLOBAL, elf::STT_FUNC),
            st_shndx: text,
            st_value: 0,
            st_size: 16,
            ..Sym::default()
        },
    );
    builder
}

fn link_files(options: Options, machine: Machine, inputs: &[(&str, Vec<u8>)]) -> (Context, Vec<u8>) {
    let paths: Vec<String> = inputs
        .iter()
        .map(|(name, data)| write_temp(name, data))
        .collect();

    let mut ctx = Context::new(options, machine);
    elfld::input::read_input_files(&mut ctx, &paths).expect("inputs parse");
    let image = elfld::link(&mut ctx).expect("link succeeds");

    for path in paths {
        let _ = std::fs::remove_file(path);
    }
    (ctx, image)
}

#[test]
fn s1_comdat_groups_keep_one_copy() {
    let make_tu = |filler: u8| -> ObjBuilder {
        let mut builder = start_obj();
        let text_foo = builder.section(
            ".text.foo",
            elf::SHT_PROGBITS,
            elf::SHF_ALLOC | elf::SHF_EXECINSTR | elf::SHF_GROUP,
            16,
            0,
            &[filler; 32],
        );
        let rodata_foo = builder.section(
            ".rodata.foo.str1",
            elf::SHT_PROGBITS,
            elf::SHF_ALLOC | elf::SHF_GROUP,
            8,
            0,
            &[filler; 8],
        );
        let sig = builder.global(
            "foo_group",
            Sym {
                st_info: Sym::info(elf::STB_GLOBAL, elf::STT_NOTYPE),
                st_shndx: elf::SHN_UNDEF,
                ..Sym::default()
            },
        );
        builder.global(
            "foo",
            Sym {
                st_info: Sym::info(elf::STB_GLOBAL, elf::STT_FUNC),
                st_shndx: text_foo,
                st_value: 0,
                st_size: 32,
                ..Sym::default()
            },
        );
        builder.group(sig, vec![text_foo, rodata_foo]);
        builder
    };

    // Identical inline function emitted by two translation units. The
    // second TU has no _start.
    let a = make_tu(0xaa);
    let mut b = ObjBuilder::new();
    {
        let text_foo = b.section(
            ".text.foo",
            elf::SHT_PROGBITS,
            elf::SHF_ALLOC | elf::SHF_EXECINSTR | elf::SHF_GROUP,
            16,
            0,
            &[0xbb; 32],
        );
        let rodata_foo = b.section(
            ".rodata.foo.str1",
            elf::SHT_PROGBITS,
            elf::SHF_ALLOC | elf::SHF_GROUP,
            8,
            0,
            &[0xbb; 8],
        );
        let sig = b.global(
            "foo_group",
            Sym {
                st_info: Sym::info(elf::STB_GLOBAL, elf::STT_NOTYPE),
                st_shndx: elf::SHN_UNDEF,
                ..Sym::default()
            },
        );
        b.global(
            "foo",
            Sym {
                st_info: Sym::info(elf::STB_GLOBAL, elf::STT_FUNC),
                st_shndx: text_foo,
                st_value: 0,
                st_size: 32,
                ..Sym::default()
            },
        );
        b.group(sig, vec![text_foo, rodata_foo]);
    }

    let machine = Machine::X86_64;
    let (ctx, _image) = link_files(
        Options::builder().build(),
        machine,
        &[
            ("a.o", a.build(machine)),
            ("b.o", b.build(machine)),
        ],
    );

    // a.o has priority 2; it wins the group.
    let group = ctx.comdat_groups.get(b"foo_group").expect("group interned");
    assert_eq!(group.owner(), 2);

    // b.o's member sections are dead, and .text contains exactly one
    // copy of .text.foo plus a.o's .text.
    let b_file = &ctx.objs[2];
    for isec in b_file.sections.iter().flatten() {
        if isec.name == ".text.foo" || isec.name == ".rodata.foo.str1" {
            assert!(!isec.is_alive(), "loser comdat member must be dead");
        }
    }

    let text = ctx
        .output_sections
        .iter()
        .find(|o| o.name == ".text")
        .expect(".text exists");
    let foo_members = text
        .members
        .iter()
        .filter(|sid| {
            ctx.isec(**sid)
                .map(|isec| isec.name == ".text.foo")
                .unwrap_or(false)
        })
        .count();
    assert_eq!(foo_members, 1);
}

#[test]
fn s2_common_symbols_merge_to_largest() {
    let mut a = start_obj();
    a.global(
        "x",
        Sym {
            st_info: Sym::info(elf::STB_GLOBAL, elf::STT_OBJECT),
            st_shndx: elf::SHN_COMMON,
            st_value: 4, // alignment request
            st_size: 4,
            ..Sym::default()
        },
    );
    let mut b = ObjBuilder::new();
    b.global(
        "x",
        Sym {
            st_info: Sym::info(elf::STB_GLOBAL, elf::STT_OBJECT),
            st_shndx: elf::SHN_COMMON,
            st_value: 8,
            st_size: 8,
            ..Sym::default()
        },
    );

    let machine = Machine::X86_64;
    let (ctx, _image) = link_files(
        Options::builder().build(),
        machine,
        &[("a.o", a.build(machine)), ("b.o", b.build(machine))],
    );

    let common = ctx
        .output_sections
        .iter()
        .find(|o| o.name == ".common")
        .expect(".common exists");
    assert_eq!(common.hdr.sh_type, elf::SHT_NOBITS);
    assert_eq!(common.hdr.sh_flags, elf::SHF_ALLOC | elf::SHF_WRITE);
    assert_eq!(common.hdr.sh_size, 8);
    assert_eq!(common.hdr.sh_addralign, 8);

    // The more demanding declaration (b.o, file index 2) provides the
    // storage.
    let sym = ctx.get_symbol("x").expect("x interned");
    let owner = {
        let repr = sym.repr.lock().unwrap();
        repr.file
    };
    assert_eq!(owner, Some(elfld::input::FileRef::Obj(2)));
}

#[test]
fn s3_pie_imports_printf_through_plt() {
    let machine = Machine::X86_64;

    let mut main = ObjBuilder::new();
    let text = main.section(
        ".text",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        16,
        0,
        &[
            0xe8, 0, 0, 0, 0, // call printf
            0xc3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        ],
    );
    main.global(
        "_start",
        Sym {
            st_info: Sym::info(elf::STB_GLOBAL, elf::STT_FUNC),
            st_shndx: text,
            st_value: 0,
            st_size: 16,
            ..Sym::default()
        },
    );
    let printf = main.global(
        "printf",
        Sym {
            st_info: Sym::info(elf::STB_GLOBAL, elf::STT_NOTYPE),
            st_shndx: elf::SHN_UNDEF,
            ..Sym::default()
        },
    );
    main.rel(
        text,
        Rel {
            r_offset: 1,
            r_type: elfld::arch::x86_64::R_X86_64_PLT32,
            r_sym: printf,
            r_addend: -4,
        },
    );

    let dso = build_dso(machine, &["printf"]);

    let (ctx, image) = link_files(
        Options::builder()
            .mode(LinkMode::Pie)
            .dynamic_linker("/lib64/ld-linux-x86-64.so.2".to_string())
            .build(),
        machine,
        &[("main.o", main.build(machine)), ("libc.so", dso)],
    );

    let printf = ctx.get_symbol("printf").expect("printf interned");
    assert!(printf.flags().contains(Needs::PLT));

    // Header stub plus one entry; three reserved slots plus one.
    assert_eq!(ctx.plt.symbols.len(), 1);
    assert_eq!(ctx.plt.hdr.sh_size, 32);
    assert_eq!(ctx.gotplt.hdr.sh_size, 4 * 8);
    assert_eq!(ctx.relplt.hdr.sh_size, 24);

    // .rela.plt holds one JUMP_SLOT against printf.
    let off = ctx.relplt.hdr.sh_offset as usize;
    let rel = Rel::parse(Class::Elf64, true, &image[off..]).expect("relplt entry");
    assert_eq!(rel.r_type, elfld::arch::x86_64::R_X86_64_JUMP_SLOT);
    assert_eq!(rel.r_sym, printf.get_dynsym_idx(&ctx));

    // The call displacement points at printf's PLT entry.
    let text_chunk = ctx
        .output_sections
        .iter()
        .find(|o| o.name == ".text")
        .expect(".text exists");
    let call_disp = elf::i32le(&image, text_chunk.hdr.sh_offset as usize + 1).unwrap();
    let call_target = (text_chunk.hdr.sh_addr as i64 + 1 + 4 + i64::from(call_disp)) as u64;
    assert_eq!(call_target, printf.get_plt_addr(&ctx));
}

#[test]
fn s4_merged_strings_deduplicate_and_redirect() {
    let machine = Machine::X86_64;

    let mut obj = ObjBuilder::new();
    let text = obj.section(
        ".text",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        16,
        0,
        &[0xc3; 16],
    );
    let strs = obj.section(
        ".rodata.str1.1",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_MERGE | elf::SHF_STRINGS,
        1,
        1,
        b"hi\0world\0hi\0",
    );
    let data = obj.section(
        ".data",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_WRITE,
        8,
        0,
        &[0u8; 16],
    );
    let sect_sym = obj.local(
        ".rodata.str1.1",
        Sym {
            st_info: Sym::info(elf::STB_LOCAL, elf::STT_SECTION),
            st_shndx: strs,
            ..Sym::default()
        },
    );
    obj.global(
        "_start",
        Sym {
            st_info: Sym::info(elf::STB_GLOBAL, elf::STT_FUNC),
            st_shndx: text,
            st_value: 0,
            st_size: 16,
            ..Sym::default()
        },
    );
    obj.rel(
        data,
        Rel {
            r_offset: 0,
            r_type: elfld::arch::x86_64::R_X86_64_64,
            r_sym: sect_sym,
            r_addend: 3,
        },
    );
    obj.rel(
        data,
        Rel {
            r_offset: 8,
            r_type: elfld::arch::x86_64::R_X86_64_64,
            r_sym: sect_sym,
            r_addend: 9,
        },
    );

    let (ctx, image) = link_files(
        Options::builder().build(),
        machine,
        &[("strings.o", obj.build(machine))],
    );

    let merged = ctx
        .merged_sections
        .iter()
        .find(|m| m.name == ".rodata")
        .expect("merged .rodata exists");
    // "hi\0" and "world\0" only.
    assert_eq!(merged.fragments.len(), 2);

    let frag_addr = |needle: &[u8]| -> u64 {
        merged
            .fragments
            .iter()
            .find(|f| &*f.data == needle)
            .map(|f| merged.hdr.sh_addr + f.offset())
            .expect("fragment exists")
    };

    let data_chunk = ctx
        .output_sections
        .iter()
        .find(|o| o.name == ".data")
        .expect(".data exists");
    let p0 = elf::u64le(&image, data_chunk.hdr.sh_offset as usize).unwrap();
    let p1 = elf::u64le(&image, data_chunk.hdr.sh_offset as usize + 8).unwrap();

    // addend 3 lands on "world"; addend 9 on the deduplicated "hi".
    assert_eq!(p0, frag_addr(b"world\0"));
    assert_eq!(p1, frag_addr(b"hi\0"));
}

#[test]
fn s5_rex_gotpcrelx_relaxes_mov_to_lea() {
    let machine = Machine::X86_64;

    let mut obj = ObjBuilder::new();
    let text = obj.section(
        ".text",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        16,
        0,
        &[
            0x48, 0x8b, 0x05, 0, 0, 0, 0, // mov rel@GOTPCREL(%rip), %rax
            0xc3, 0, 0, 0, 0, 0, 0, 0, 0,
        ],
    );
    let data = obj.section(
        ".data",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_WRITE,
        8,
        0,
        &[0u8; 8],
    );
    obj.global(
        "_start",
        Sym {
            st_info: Sym::info(elf::STB_GLOBAL, elf::STT_FUNC),
            st_shndx: text,
            st_value: 0,
            st_size: 8,
            ..Sym::default()
        },
    );
    let rel_sym = obj.global(
        "rel",
        Sym {
            st_info: Sym::info(elf::STB_GLOBAL, elf::STT_OBJECT),
            st_shndx: data,
            st_value: 0,
            st_size: 8,
            ..Sym::default()
        },
    );
    obj.rel(
        text,
        Rel {
            r_offset: 3,
            r_type: elfld::arch::x86_64::R_X86_64_REX_GOTPCRELX,
            r_sym: rel_sym,
            r_addend: -4,
        },
    );

    let (ctx, image) = link_files(
        Options::builder().build(),
        machine,
        &[("relax.o", obj.build(machine))],
    );

    // No GOT slot was allocated.
    let rel = ctx.get_symbol("rel").expect("rel interned");
    assert!(rel.got_idx(&ctx).is_none());
    assert_eq!(ctx.got.num_slots(), 0);

    // The load became a lea with a PC-relative displacement to rel.
    let text_chunk = ctx
        .output_sections
        .iter()
        .find(|o| o.name == ".text")
        .expect(".text exists");
    let off = text_chunk.hdr.sh_offset as usize;
    assert_eq!(&image[off..off + 3], &[0x48, 0x8d, 0x05]);
    let disp = elf::i32le(&image, off + 3).unwrap();
    let target = (text_chunk.hdr.sh_addr as i64 + 3 + 4 + i64::from(disp)) as u64;
    assert_eq!(target, rel.get_addr(&ctx));
}

#[test]
fn s6_layout_congruence_and_ordering() {
    let machine = Machine::X86_64;

    let mut obj = start_obj();
    obj.section(
        ".rodata",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC,
        8,
        0,
        &[1u8; 120],
    );
    obj.section(
        ".data",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_WRITE,
        16,
        0,
        &[2u8; 312],
    );
    obj.section(".bss", elf::SHT_NOBITS, elf::SHF_ALLOC | elf::SHF_WRITE, 8, 0, &[0u8; 40]);

    let (ctx, image) = link_files(
        Options::builder().image_base(0x40_0000).build(),
        machine,
        &[("layout.o", obj.build(machine))],
    );

    // The image loads at the requested base.
    assert_eq!(ctx.chunks[0], elfld::chunks::ChunkId::Ehdr);
    assert_eq!(ctx.chunk_hdr(elfld::chunks::ChunkId::Ehdr).sh_addr, 0x40_0000);

    let mut prev_offset = 0u64;
    let mut prev_vaddr_end = 0u64;
    for &id in &ctx.chunks {
        let hdr = ctx.chunk_hdr(id);
        assert!(hdr.sh_offset >= prev_offset, "file offsets are monotonic");
        if hdr.sh_type != elf::SHT_NOBITS {
            prev_offset = hdr.sh_offset + hdr.sh_size;
        }
        if hdr.sh_flags & elf::SHF_ALLOC != 0 {
            // The PT_LOAD congruence rule.
            assert_eq!(
                hdr.sh_offset % 4096,
                hdr.sh_addr % 4096,
                "offset and address must be congruent modulo the page size"
            );
            assert!(hdr.sh_addr >= prev_vaddr_end);
            if hdr.sh_flags & elf::SHF_TLS == 0 {
                prev_vaddr_end = hdr.sh_addr + hdr.sh_size;
            }
        }
    }

    // Round trip: the emitted header describes the emitted tables.
    let ehdr = elf::Ehdr::parse(Class::Elf64, &image).expect("ehdr parses");
    assert_eq!(ehdr.e_type, elf::ET_EXEC);
    assert_eq!(ehdr.e_machine, elf::EM_X86_64);
    let shoff = ehdr.e_shoff as usize;
    for i in 0..ehdr.e_shnum as usize {
        let shdr = Shdr::parse(Class::Elf64, &image[shoff + i * 64..]).expect("shdr parses");
        if shdr.sh_type != elf::SHT_NULL && shdr.sh_type != elf::SHT_NOBITS {
            assert!(shdr.sh_offset + shdr.sh_size <= image.len() as u64);
        }
    }
}

#[test]
fn relink_is_deterministic() {
    let machine = Machine::X86_64;
    let build = || {
        let mut obj = start_obj();
        obj.section(
            ".data",
            elf::SHT_PROGBITS,
            elf::SHF_ALLOC | elf::SHF_WRITE,
            8,
            0,
            &[7u8; 64],
        );
        obj.build(machine)
    };

    let (_, first) = link_files(Options::builder().build(), machine, &[("d.o", build())]);
    let (_, second) = link_files(Options::builder().build(), machine, &[("d.o", build())]);
    assert_eq!(first, second);
}

#[test]
fn undefined_symbol_is_reported() {
    let machine = Machine::X86_64;

    let mut obj = start_obj();
    let missing = obj.global(
        "missing",
        Sym {
            st_info: Sym::info(elf::STB_GLOBAL, elf::STT_NOTYPE),
            st_shndx: elf::SHN_UNDEF,
            ..Sym::default()
        },
    );
    obj.rel(
        1,
        Rel {
            r_offset: 1,
            r_type: elfld::arch::x86_64::R_X86_64_PC32,
            r_sym: missing,
            r_addend: -4,
        },
    );

    let path = write_temp("undef.o", &obj.build(machine));
    let mut ctx = Context::new(Options::builder().build(), machine);
    elfld::input::read_input_files(&mut ctx, &[path.clone()]).expect("inputs parse");
    let result = elfld::link(&mut ctx);
    let _ = std::fs::remove_file(path);

    assert!(matches!(result, Err(elfld::Error::LinkFailed { .. })));
}
