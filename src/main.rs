//! Command-line driver
//!
//! A thin shell over the library: every flag maps onto one field of
//! [elfld::Options]. Library lookup (`-l`, `-L`) happens here; the
//! library itself only ever sees resolved paths.

use clap::Parser;

use elfld::arch::Machine;
use elfld::context::{BuildIdKind, LinkMode};
use elfld::{Context, Options};

#[derive(Parser, Debug)]
#[command(name = "elfld", about = "A parallel ELF linker", version)]
struct Opt {
    /// Output file
    #[arg(short = 'o', long = "output", default_value = "a.out")]
    output: String,

    /// Target emulation (elf_x86_64, elf_i386, aarch64linux)
    #[arg(short = 'm')]
    emulation: Option<String>,

    /// Produce a shared object
    #[arg(long)]
    shared: bool,

    /// Produce a position-independent executable
    #[arg(long)]
    pie: bool,

    /// Entry-point symbol
    #[arg(short = 'e', long, default_value = "_start")]
    entry: String,

    /// Base address for position-dependent executables
    #[arg(long, value_parser = parse_hex, default_value = "0x400000")]
    image_base: u64,

    /// Library search directory (repeatable)
    #[arg(short = 'L', action = clap::ArgAction::Append)]
    search_dirs: Vec<String>,

    /// Link against a library (repeatable)
    #[arg(short = 'l', action = clap::ArgAction::Append)]
    libraries: Vec<String>,

    /// Keep DT_NEEDED only for referenced shared objects
    #[arg(long)]
    as_needed: bool,

    /// Disable GOT and TLS instruction relaxation
    #[arg(long)]
    no_relax: bool,

    /// -z keywords (now, relro, norelro)
    #[arg(short = 'z', action = clap::ArgAction::Append)]
    z: Vec<String>,

    /// Remove unreferenced sections
    #[arg(long)]
    gc_sections: bool,

    /// Log sections removed by --gc-sections
    #[arg(long)]
    print_gc_sections: bool,

    /// Omit all symbol information
    #[arg(short = 's', long)]
    strip_all: bool,

    /// Omit debug sections
    #[arg(short = 'S', long)]
    strip_debug: bool,

    /// Omit local symbols
    #[arg(short = 'x', long)]
    discard_all: bool,

    /// Omit assembler-generated local labels
    #[arg(short = 'X', long)]
    discard_locals: bool,

    /// Export all defined globals to the dynamic symbol table
    #[arg(short = 'E', long)]
    export_dynamic: bool,

    /// Bind defined symbols locally in a shared object
    #[arg(long = "Bsymbolic")]
    bsymbolic: bool,

    /// Bind defined functions locally in a shared object
    #[arg(long = "Bsymbolic-functions")]
    bsymbolic_functions: bool,

    /// DT_SONAME of a shared object
    #[arg(long)]
    soname: Option<String>,

    /// DT_RUNPATH entry (repeatable)
    #[arg(long = "rpath", action = clap::ArgAction::Append)]
    rpaths: Vec<String>,

    /// Program interpreter for dynamic executables
    #[arg(short = 'I', long)]
    dynamic_linker: Option<String>,

    /// Hash table style: sysv, gnu or both
    #[arg(long, default_value = "gnu")]
    hash_style: String,

    /// Build-id policy: none, fast or 0x<hex>
    #[arg(long, default_value = "none")]
    build_id: String,

    /// Worker threads (0 = hardware parallelism)
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Force a symbol undefined and keep its defining member (repeatable)
    #[arg(short = 'u', long = "undefined", action = clap::ArgAction::Append)]
    undefined: Vec<String>,

    /// Hide symbols from the named archives ("ALL" for every archive)
    #[arg(long = "exclude-libs", action = clap::ArgAction::Append)]
    exclude_libs: Vec<String>,

    /// Trace resolution of a symbol (repeatable)
    #[arg(short = 'y', long = "trace-symbol", action = clap::ArgAction::Append)]
    trace_symbols: Vec<String>,

    /// Warn about mismatched common symbols
    #[arg(long)]
    warn_common: bool,

    /// Treat warnings as errors
    #[arg(long)]
    fatal_warnings: bool,

    /// Do not create .eh_frame_hdr
    #[arg(long)]
    no_eh_frame_hdr: bool,

    /// Input files
    inputs: Vec<String>,
}

fn parse_hex(s: &str) -> Result<u64, String> {
    let trimmed = s.trim_start_matches("0x");
    u64::from_str_radix(trimmed, 16)
        .or_else(|_| s.parse())
        .map_err(|_| format!("invalid address: {s}"))
}

fn find_library(name: &str, search_dirs: &[String]) -> Option<String> {
    for dir in search_dirs {
        let so = format!("{dir}/lib{name}.so");
        if std::path::Path::new(&so).is_file() {
            return Some(so);
        }
    }
    for dir in search_dirs {
        let ar = format!("{dir}/lib{name}.a");
        if std::path::Path::new(&ar).is_file() {
            return Some(ar);
        }
    }
    None
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let opt = Opt::parse();

    let machine = match opt.emulation.as_deref() {
        None | Some("elf_x86_64") => Machine::X86_64,
        Some("elf_i386") => Machine::I386,
        Some("aarch64linux") | Some("aarch64elf") => Machine::Aarch64,
        Some(other) => {
            eprintln!("elfld: unknown emulation: {other}");
            std::process::exit(1);
        }
    };

    let mode = if opt.shared {
        LinkMode::Dso
    } else if opt.pie {
        LinkMode::Pie
    } else {
        LinkMode::Pde
    };

    let build_id = if opt.build_id == "none" {
        BuildIdKind::None
    } else if opt.build_id == "fast" || opt.build_id == "uuid" {
        BuildIdKind::Fast
    } else if let Some(hex) = opt.build_id.strip_prefix("0x") {
        match (0..hex.len() / 2)
            .map(|i| u8::from_str_radix(&hex[2 * i..2 * i + 2], 16))
            .collect::<Result<Vec<u8>, _>>()
        {
            Ok(bytes) => BuildIdKind::Hex(bytes),
            Err(_) => {
                eprintln!("elfld: invalid build-id: {}", opt.build_id);
                std::process::exit(1);
            }
        }
    } else {
        eprintln!("elfld: invalid build-id: {}", opt.build_id);
        std::process::exit(1);
    };

    let mut paths: Vec<String> = opt.inputs.clone();
    for lib in &opt.libraries {
        match find_library(lib, &opt.search_dirs) {
            Some(path) => paths.push(path),
            None => {
                eprintln!("elfld: library not found: -l{lib}");
                std::process::exit(1);
            }
        }
    }
    if paths.is_empty() {
        eprintln!("elfld: no input files");
        std::process::exit(1);
    }

    // The linker does not scale past a moderate number of threads; cap
    // the pool accordingly.
    let parallelism = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let threads = if opt.threads == 0 {
        parallelism.min(32)
    } else {
        opt.threads.min(32)
    };
    let _ = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global();

    let options = Options::builder()
        .output(opt.output)
        .mode(mode)
        .entry(opt.entry)
        .image_base(opt.image_base)
        .relax(!opt.no_relax)
        .z_now(opt.z.iter().any(|z| z == "now"))
        .z_relro(!opt.z.iter().any(|z| z == "norelro"))
        .gc_sections(opt.gc_sections)
        .print_gc_sections(opt.print_gc_sections)
        .strip_all(opt.strip_all)
        .strip_debug(opt.strip_debug)
        .discard_all(opt.discard_all)
        .discard_locals(opt.discard_locals)
        .export_dynamic(opt.export_dynamic)
        .bsymbolic(opt.bsymbolic)
        .bsymbolic_functions(opt.bsymbolic_functions)
        .rpaths(opt.rpaths)
        .hash_style_sysv(opt.hash_style == "sysv" || opt.hash_style == "both")
        .hash_style_gnu(opt.hash_style == "gnu" || opt.hash_style == "both")
        .build_id(build_id)
        .threads(threads)
        .as_needed(opt.as_needed)
        .undefined(opt.undefined)
        .exclude_libs(opt.exclude_libs)
        .trace_symbols(opt.trace_symbols)
        .warn_common(opt.warn_common)
        .fatal_warnings(opt.fatal_warnings)
        .eh_frame_hdr(!opt.no_eh_frame_hdr)
        .build();

    let mut options = options;
    if let Some(soname) = opt.soname {
        options.soname = Some(soname);
    }
    if let Some(interp) = opt.dynamic_linker {
        options.dynamic_linker = Some(interp);
    }

    let mut ctx = Context::new(options, machine);

    if let Err(e) = elfld::input::read_input_files(&mut ctx, &paths) {
        eprintln!("elfld: {e}");
        std::process::exit(1);
    }

    let image = match elfld::link(&mut ctx) {
        Ok(image) => image,
        Err(e) => {
            eprintln!("elfld: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = elfld::writer::write_file(&ctx, &image) {
        eprintln!("elfld: {e}");
        std::process::exit(1);
    }
}
