//! A parallel linker for ELF objects and shared libraries
//!
//! The crate consumes relocatable objects, static archives and shared
//! objects, resolves symbols across them, lays out an output image and
//! applies relocations, producing an executable, a position-independent
//! executable or a shared object for x86-64, i386 or aarch64.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![warn(missing_docs)]

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub mod arch;
pub mod archive;
pub mod chunks;
pub mod compress;
pub mod context;
pub mod elf;
pub mod error;
pub mod gc;
pub mod input;
pub mod interner;
pub mod layout;
pub mod merge;
pub mod resolve;
pub mod scan;
pub mod symbol;
pub mod writer;

pub use context::{Context, LinkMode, Options};
pub use error::{Error, Result};

/// Round `val` up to the next multiple of `align`. `align` must be zero
/// (meaning no alignment) or a power of two.
pub fn align_to(val: u64, align: u64) -> u64 {
    if align == 0 {
        return val;
    }
    debug_assert!(align.is_power_of_two());
    (val + align - 1) & !(align - 1)
}

/// Returns the smallest value `n` such that `n >= val` and
/// `n % align == skew`.
pub fn align_with_skew(val: u64, align: u64, skew: u64) -> u64 {
    align_to(val + align - skew, align) - align + skew
}

/// Next power of two greater than or equal to `val`, with 0 and 1 both
/// mapping to 1.
pub fn next_power_of_two(val: u64) -> u64 {
    if val <= 1 {
        1
    } else {
        1 << (64 - (val - 1).leading_zeros())
    }
}

/// Whether `name` is usable as a C identifier, which decides whether a
/// section gets `__start_`/`__stop_` boundary symbols.
pub fn is_c_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Lock a mutex, recovering the guard if another thread panicked while
/// holding it. Poisoning is not a state the linker distinguishes.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read_lock<T>(rwlock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(rwlock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Run the whole link pipeline over a fully populated context and return
/// the output image.
///
/// Phases run strictly in order; each drains its worker pool before the
/// next begins. The structure mirrors the data flow: resolve symbols,
/// eliminate comdats, convert commons, split mergeable sections, collect
/// garbage, scan relocations, build synthetic sections, bin and size
/// output sections, lay out the image, then write.
pub fn link(ctx: &mut Context) -> Result<Vec<u8>> {
    resolve::resolve_symbols(ctx)?;
    resolve::eliminate_comdats(ctx);
    resolve::convert_common_symbols(ctx);
    merge::split_mergeable_sections(ctx)?;
    input::parse_ehframe_sections(ctx)?;

    if ctx.options.gc_sections {
        gc::gc_sections(ctx);
    }

    merge::compute_merged_section_sizes(ctx);
    resolve::convert_undefined_weak_symbols(ctx);
    resolve::check_duplicate_symbols(ctx)?;
    resolve::compute_import_export(ctx);
    resolve::parse_symbol_versions(ctx)?;

    scan::scan_relocations(ctx)?;

    chunks::bin_sections(ctx);
    chunks::compute_section_sizes(ctx);

    layout::assign_output_layout(ctx)?;

    let buf = writer::write_output(ctx)?;
    ctx.diags.checkpoint()?;
    Ok(buf)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_align_to() {
        assert_eq!(align_to(0, 8), 0);
        assert_eq!(align_to(1, 8), 8);
        assert_eq!(align_to(8, 8), 8);
        assert_eq!(align_to(9, 16), 16);
        assert_eq!(align_to(17, 0), 17);
    }

    #[test]
    fn test_align_with_skew() {
        // File offsets must be congruent to virtual addresses modulo the
        // page size.
        assert_eq!(align_with_skew(0, 0x1000, 0x234), 0x234);
        assert_eq!(align_with_skew(0x234, 0x1000, 0x234), 0x234);
        assert_eq!(align_with_skew(0x235, 0x1000, 0x234), 0x1234);
        assert_eq!(align_with_skew(0x1000, 0x1000, 0), 0x1000);
    }

    #[test]
    fn test_next_power_of_two() {
        assert_eq!(next_power_of_two(0), 1);
        assert_eq!(next_power_of_two(1), 1);
        assert_eq!(next_power_of_two(2), 2);
        assert_eq!(next_power_of_two(3), 4);
        assert_eq!(next_power_of_two(2048), 2048);
        assert_eq!(next_power_of_two(2049), 4096);
    }

    #[test]
    fn test_is_c_identifier() {
        assert!(is_c_identifier("__bss_start"));
        assert!(is_c_identifier("foo123"));
        assert!(!is_c_identifier(".text"));
        assert!(!is_c_identifier("1foo"));
        assert!(!is_c_identifier(""));
    }
}
