//! Error definitions and the shared diagnostics channel
//!
//! Fatal conditions abort the link by propagating an [Error] up through
//! the pass functions. Recoverable conditions (undefined symbols,
//! duplicate definitions, out-of-range relocations) are recorded on the
//! [Diagnostics] channel so a single run surfaces all of them; phase
//! boundaries call [Diagnostics::checkpoint] and refuse to continue once
//! any were recorded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
/// Error type for conditions that abort the link immediately
pub enum Error {
    #[error("{path}: An I/O error occurred: {kind}")]
    /// An input or output file could not be read or written
    Io {
        /// Path of the file being accessed
        path: String,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
    },
    #[error("{path}: not an ELF file")]
    /// The file does not start with the ELF magic
    NotAnElf {
        /// Path of the offending file
        path: String,
    },
    #[error("{path}: file is too small")]
    /// The file ends before a required header
    FileTooSmall {
        /// Path of the offending file
        path: String,
    },
    #[error("{path}: unsupported ELF class {value}")]
    /// Neither ELFCLASS32 nor ELFCLASS64
    UnsupportedClass {
        /// Path of the offending file
        path: String,
        /// The e_ident[EI_CLASS] byte
        value: u8,
    },
    #[error("{path}: unsupported data encoding {value}")]
    /// Anything other than little-endian input
    UnsupportedEncoding {
        /// Path of the offending file
        path: String,
        /// The e_ident[EI_DATA] byte
        value: u8,
    },
    #[error("{path}: unsupported machine type {value}")]
    /// The e_machine field does not match a supported target
    UnsupportedMachine {
        /// Path of the offending file
        path: String,
        /// The e_machine value
        value: u16,
    },
    #[error("{path}: incompatible machine type for this link (expected {expected})")]
    /// An input was produced for a different target than the link
    MachineMismatch {
        /// Path of the offending file
        path: String,
        /// Name of the target being linked
        expected: &'static str,
    },
    #[error("{path}: e_shoff or e_shnum corrupted")]
    /// The section-header table runs past the end of the file
    CorruptSectionTable {
        /// Path of the offending file
        path: String,
    },
    #[error("{path}: section {section} is truncated")]
    /// A section body runs past the end of the file
    TruncatedSection {
        /// Path of the offending file
        path: String,
        /// Name or index of the section
        section: String,
    },
    #[error("{path}: invalid symbol index")]
    /// A symbol reference is outside the symbol table
    InvalidSymbolIndex {
        /// Path of the offending file
        path: String,
    },
    #[error("{path}: empty SHT_GROUP")]
    /// A section group with no members
    EmptyGroup {
        /// Path of the offending file
        path: String,
    },
    #[error("{path}: unsupported SHT_GROUP format")]
    /// A section group whose first word is not GRP_COMDAT
    UnsupportedGroupFormat {
        /// Path of the offending file
        path: String,
    },
    #[error("{path}: {section}: corrupted compressed section")]
    /// A compressed section too small for its compression header
    CorruptCompressedSection {
        /// Path of the offending file
        path: String,
        /// Name of the section
        section: String,
    },
    #[error("{path}: {section}: unsupported compression type {ch_type:#x}")]
    /// A compression type other than ZLIB
    UnsupportedCompressionType {
        /// Path of the offending file
        path: String,
        /// Name of the section
        section: String,
        /// The ch_type value found
        ch_type: u32,
    },
    #[error("{path}: {section}: uncompress failed")]
    /// The ZLIB stream could not be inflated
    DecompressFailed {
        /// Path of the offending file
        path: String,
        /// Name of the section
        section: String,
    },
    #[error("{path}: {section}: uncompress: invalid size")]
    /// The inflated size differs from the declared size
    DecompressSizeMismatch {
        /// Path of the offending file
        path: String,
        /// Name of the section
        section: String,
    },
    #[error("{path}: {section}: string is not null terminated")]
    /// A mergeable string section without a terminator
    StringNotTerminated {
        /// Path of the offending file
        path: String,
        /// Name of the section
        section: String,
    },
    #[error("{path}: {section}: section size is not multiple of sh_entsize")]
    /// A fixed-entry mergeable section of invalid size
    BadEntitySize {
        /// Path of the offending file
        path: String,
        /// Name of the section
        section: String,
    },
    #[error("{path}: {section}: alignment too large")]
    /// A mergeable section aligned beyond what fragments can record
    AlignmentTooLarge {
        /// Path of the offending file
        path: String,
        /// Name of the section
        section: String,
    },
    #[error("{path}: {section}: relocation offsets must increase monotonically")]
    /// Out-of-order relocations in an .eh_frame section
    BadRelocationOrder {
        /// Path of the offending file
        path: String,
        /// Name of the section
        section: String,
    },
    #[error("{path}: {section}: garbage at end of section")]
    /// Trailing bytes after the .eh_frame terminator
    EhFrameGarbage {
        /// Path of the offending file
        path: String,
        /// Name of the section
        section: String,
    },
    #[error("{path}: {section}: FDE's first relocation should have offset 8")]
    /// A frame-description entry not anchored at its function pointer
    BadFdeRelocation {
        /// Path of the offending file
        path: String,
        /// Name of the section
        section: String,
    },
    #[error("{path}: {section}: bad FDE pointer")]
    /// An FDE whose CIE back-pointer names no CIE
    BadFdePointer {
        /// Path of the offending file
        path: String,
        /// Name of the section
        section: String,
    },
    #[error("{path}: bad relocation against mergeable section at index {index}")]
    /// A relocation into a mergeable section before its first fragment
    BadFragmentRelocation {
        /// Path of the offending file
        path: String,
        /// Index of the relocation symbol
        index: u32,
    },
    #[error("{path}: bad symbol value {value:#x} in mergeable section")]
    /// A symbol pointing before the first fragment of a split section
    BadFragmentSymbol {
        /// Path of the offending file
        path: String,
        /// The symbol value
        value: u64,
    },
    #[error("{path}: common local symbol?")]
    /// A local symbol with the reserved COMMON section index
    CommonLocalSymbol {
        /// Path of the offending file
        path: String,
    },
    #[error("{file}: {section}: unknown relocation type {r_type}")]
    /// A relocation type the back-end does not recognize
    UnknownRelocation {
        /// Display name of the input file
        file: String,
        /// Name of the relocated section
        section: String,
        /// The raw relocation type
        r_type: u32,
    },
    #[error("{file}: {section}: relocation {r_type} against {symbol} can not be used under this output kind; recompile with -fPIC")]
    /// A policy-table ERROR cell: the relocation is unrepresentable in
    /// the requested link mode
    UnrepresentableRelocation {
        /// Display name of the input file
        file: String,
        /// Name of the relocated section
        section: String,
        /// The raw relocation type
        r_type: u32,
        /// Name of the referenced symbol
        symbol: String,
    },
    #[error("{file}: {section}: {message}")]
    /// A relocation applied against an instruction sequence it cannot
    /// describe (bad addend, missing companion relocation, wrong opcode)
    BadRelocationSequence {
        /// Display name of the input file
        file: String,
        /// Name of the relocated section
        section: String,
        /// Description of the violated requirement
        message: String,
    },
    #[error("{path}: corrupted archive")]
    /// An `ar` file with a malformed member header
    ArchiveCorrupt {
        /// Path of the archive
        path: String,
    },
    #[error("{path}: filename is not stored as a long filename")]
    /// A thin archive member without a long-name table reference
    ArchiveLongName {
        /// Path of the archive
        path: String,
    },
    #[error("{path}: unknown file type")]
    /// Neither an object, an archive nor a shared object
    UnsupportedFileType {
        /// Path of the offending file
        path: String,
    },
    #[error("link failed with {count} error(s)")]
    /// One or more recoverable errors were recorded; no output was
    /// produced
    LinkFailed {
        /// Number of recorded diagnostics
        count: usize,
    },
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Default)]
/// Thread-safe channel collecting recoverable diagnostics
///
/// Errors recorded here do not stop the current phase; they make the
/// next [checkpoint](Diagnostics::checkpoint) fail so the user sees every
/// problem from one run. Warnings never fail a checkpoint unless
/// `fatal_warnings` is set.
pub struct Diagnostics {
    errors: Mutex<Vec<String>>,
    has_error: AtomicBool,
    fatal_warnings: bool,
}

impl Diagnostics {
    /// Create a channel; `fatal_warnings` promotes warnings to errors
    pub fn new(fatal_warnings: bool) -> Self {
        Self {
            errors: Mutex::new(Vec::new()),
            has_error: AtomicBool::new(false),
            fatal_warnings,
        }
    }

    /// Record a recoverable error and keep going
    pub fn error(&self, message: String) {
        log::error!("{message}");
        self.has_error.store(true, Ordering::Relaxed);
        crate::lock(&self.errors).push(message);
    }

    /// Record a warning
    pub fn warn(&self, message: String) {
        log::warn!("{message}");
        if self.fatal_warnings {
            self.has_error.store(true, Ordering::Relaxed);
            crate::lock(&self.errors).push(message);
        }
    }

    /// Whether any error has been recorded so far
    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::Relaxed)
    }

    /// Fail if any error has been recorded since the channel was created
    pub fn checkpoint(&self) -> Result<()> {
        if self.has_error() {
            return Err(Error::LinkFailed {
                count: crate::lock(&self.errors).len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_checkpoint_passes_when_clean() {
        let diags = Diagnostics::new(false);
        assert!(diags.checkpoint().is_ok());
        diags.warn("common symbol collision".to_string());
        assert!(diags.checkpoint().is_ok());
    }

    #[test]
    fn test_checkpoint_fails_after_error() {
        let diags = Diagnostics::new(false);
        diags.error("undefined symbol: foo".to_string());
        diags.error("undefined symbol: bar".to_string());
        assert_eq!(diags.checkpoint(), Err(Error::LinkFailed { count: 2 }));
    }

    #[test]
    fn test_fatal_warnings_promote() {
        let diags = Diagnostics::new(true);
        diags.warn("multiple common symbols: x".to_string());
        assert!(diags.checkpoint().is_err());
    }
}
