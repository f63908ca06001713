//! Decompression of compressed input sections
//!
//! Two encodings exist in the wild: the modern SHF_COMPRESSED flag with a
//! compression header in front of the payload, and the legacy `.zdebug`
//! convention of a "ZLIB" magic followed by the big-endian uncompressed
//! size. Both carry ZLIB streams; anything else is rejected.

use std::io::Read;

use flate2::read::ZlibDecoder;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::elf::{Chdr, Class, Shdr, SHF_COMPRESSED};
use crate::error::{Error, Result};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[non_exhaustive]
/// The compression algorithm named by a compression header
pub enum CompressionType {
    /// No compression
    None = 0,
    /// ZLIB deflate stream
    Zlib = 1,
    /// Zstandard stream
    Zstd = 2,
}

fn inflate(path: &str, section: &str, data: &[u8], expected_size: u64) -> Result<Box<[u8]>> {
    let mut out = Vec::with_capacity(expected_size as usize);
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|_| Error::DecompressFailed {
            path: path.to_string(),
            section: section.to_string(),
        })?;
    if out.len() as u64 != expected_size {
        return Err(Error::DecompressSizeMismatch {
            path: path.to_string(),
            section: section.to_string(),
        });
    }
    Ok(out.into_boxed_slice())
}

/// Decompress a section if it is compressed.
///
/// Returns the replacement contents and an updated header (size,
/// alignment and flags reflect the uncompressed data), or `None` when
/// the section is stored plainly.
pub fn decompress_section(
    class: Class,
    path: &str,
    name: &str,
    shdr: &Shdr,
    raw: &[u8],
) -> Result<Option<(Box<[u8]>, Shdr)>> {
    if name.starts_with(".zdebug") {
        // Legacy scheme: 4-byte "ZLIB" magic, 8-byte big-endian size.
        if raw.len() <= 12 || &raw[..4] != b"ZLIB" {
            return Err(Error::CorruptCompressedSection {
                path: path.to_string(),
                section: name.to_string(),
            });
        }
        let size = u64::from_be_bytes([
            raw[4], raw[5], raw[6], raw[7], raw[8], raw[9], raw[10], raw[11],
        ]);
        let contents = inflate(path, name, &raw[12..], size)?;
        let mut shdr2 = *shdr;
        shdr2.sh_size = size;
        return Ok(Some((contents, shdr2)));
    }

    if shdr.sh_flags & SHF_COMPRESSED != 0 {
        let chdr = Chdr::parse(class, raw).ok_or_else(|| Error::CorruptCompressedSection {
            path: path.to_string(),
            section: name.to_string(),
        })?;
        if CompressionType::from_u32(chdr.ch_type) != Some(CompressionType::Zlib) {
            return Err(Error::UnsupportedCompressionType {
                path: path.to_string(),
                section: name.to_string(),
                ch_type: chdr.ch_type,
            });
        }
        let contents = inflate(path, name, &raw[class.chdr_size()..], chdr.ch_size)?;
        let mut shdr2 = *shdr;
        shdr2.sh_flags &= !SHF_COMPRESSED;
        shdr2.sh_size = chdr.ch_size;
        shdr2.sh_addralign = chdr.ch_addralign.max(1);
        return Ok(Some((contents, shdr2)));
    }

    Ok(None)
}

#[cfg(test)]
mod test {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        let _ = enc.write_all(data);
        enc.finish().unwrap_or_default()
    }

    #[test]
    fn test_plain_section_passes_through() {
        let shdr = Shdr::default();
        let result = decompress_section(Class::Elf64, "a.o", ".text", &shdr, b"\x90\x90");
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn test_zdebug_roundtrip() {
        let payload = b"debug line data, longer than the compressed form";
        let mut raw = b"ZLIB".to_vec();
        raw.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        raw.extend_from_slice(&deflate(payload));

        let shdr = Shdr {
            sh_size: raw.len() as u64,
            ..Shdr::default()
        };
        let (contents, shdr2) =
            match decompress_section(Class::Elf64, "a.o", ".zdebug_info", &shdr, &raw) {
                Ok(Some(pair)) => pair,
                _ => unreachable!(),
            };
        assert_eq!(&*contents, payload);
        assert_eq!(shdr2.sh_size, payload.len() as u64);
    }

    #[test]
    fn test_shf_compressed_clears_flag() {
        let payload = vec![7u8; 256];
        let mut raw = vec![0u8; 24];
        // ch_type = ZLIB, ch_size, ch_addralign in the 64-bit layout.
        raw[..4].copy_from_slice(&crate::elf::ELFCOMPRESS_ZLIB.to_le_bytes());
        raw[8..16].copy_from_slice(&(payload.len() as u64).to_le_bytes());
        raw[16..24].copy_from_slice(&8u64.to_le_bytes());
        raw.extend_from_slice(&deflate(&payload));

        let shdr = Shdr {
            sh_flags: SHF_COMPRESSED,
            sh_size: raw.len() as u64,
            sh_addralign: 1,
            ..Shdr::default()
        };
        let (contents, shdr2) =
            match decompress_section(Class::Elf64, "a.o", ".debug_info", &shdr, &raw) {
                Ok(Some(pair)) => pair,
                _ => unreachable!(),
            };
        assert_eq!(contents.len(), 256);
        assert_eq!(shdr2.sh_flags & SHF_COMPRESSED, 0);
        assert_eq!(shdr2.sh_addralign, 8);
    }

    #[test]
    fn test_truncated_zdebug_is_rejected() {
        let shdr = Shdr::default();
        let result = decompress_section(Class::Elf64, "a.o", ".zdebug_info", &shdr, b"ZLIB\0");
        assert!(matches!(
            result,
            Err(Error::CorruptCompressedSection { .. })
        ));
    }
}
