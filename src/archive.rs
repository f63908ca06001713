//! Static archive reading
//!
//! Supports the SysV `ar` format: the `!<arch>\n` global header, 60-byte
//! member headers, the `//` long-filename table and `/N` references into
//! it. Thin archives (`!<thin>\n`) store no member bodies; their members
//! are read from files relative to the archive's directory.

use std::path::Path;

use crate::error::{Error, Result};

/// Global header of a regular archive
pub const ARMAG: &[u8; 8] = b"!<arch>\n";
/// Global header of a thin archive
pub const ARMAG_THIN: &[u8; 8] = b"!<thin>\n";

const HDR_SIZE: usize = 60;

#[derive(Debug)]
/// One extracted archive member
pub struct ArchiveMember {
    /// Member name as stored in the archive
    pub name: String,
    /// Member contents
    pub data: Vec<u8>,
}

/// Whether the buffer looks like a regular archive
pub fn is_archive(data: &[u8]) -> bool {
    data.starts_with(ARMAG)
}

/// Whether the buffer looks like a thin archive
pub fn is_thin_archive(data: &[u8]) -> bool {
    data.starts_with(ARMAG_THIN)
}

struct ArHdr<'a> {
    name: &'a [u8],
    size: usize,
}

fn parse_hdr<'a>(path: &str, data: &'a [u8]) -> Result<ArHdr<'a>> {
    let corrupt = || Error::ArchiveCorrupt {
        path: path.to_string(),
    };
    let hdr = data.get(..HDR_SIZE).ok_or_else(corrupt)?;
    if &hdr[58..60] != b"`\n" {
        return Err(corrupt());
    }
    let size_str = std::str::from_utf8(&hdr[48..58]).map_err(|_| corrupt())?;
    let size = size_str
        .trim_end()
        .parse::<usize>()
        .map_err(|_| corrupt())?;
    Ok(ArHdr {
        name: &hdr[0..16],
        size,
    })
}

fn long_name(path: &str, strtab: &[u8], name_field: &[u8]) -> Result<String> {
    let corrupt = || Error::ArchiveCorrupt {
        path: path.to_string(),
    };
    let off_str = std::str::from_utf8(&name_field[1..]).map_err(|_| corrupt())?;
    let off = off_str.trim_end().parse::<usize>().map_err(|_| corrupt())?;
    let rest = strtab.get(off..).ok_or_else(corrupt)?;
    let end = rest
        .windows(2)
        .position(|w| w == b"/\n")
        .ok_or_else(corrupt)?;
    String::from_utf8(rest[..end].to_vec()).map_err(|_| corrupt())
}

fn short_name(path: &str, name_field: &[u8]) -> Result<String> {
    let end = name_field
        .iter()
        .position(|&b| b == b'/')
        .ok_or_else(|| Error::ArchiveCorrupt {
            path: path.to_string(),
        })?;
    String::from_utf8(name_field[..end].to_vec()).map_err(|_| Error::ArchiveCorrupt {
        path: path.to_string(),
    })
}

/// Extract every object member of a regular archive
pub fn read_archive_members(path: &str, data: &[u8]) -> Result<Vec<ArchiveMember>> {
    let mut pos = ARMAG.len();
    let mut strtab: &[u8] = &[];
    let mut members = Vec::new();

    // Member headers start on even offsets; bodies are padded with a
    // newline when their size is odd.
    while pos + 2 <= data.len() {
        let hdr = parse_hdr(path, &data[pos..])?;
        let body_start = pos + HDR_SIZE;
        let body = data
            .get(body_start..body_start + hdr.size)
            .ok_or_else(|| Error::ArchiveCorrupt {
                path: path.to_string(),
            })?;
        pos = body_start + hdr.size;
        pos += pos & 1;

        if hdr.name.starts_with(b"// ") {
            strtab = body;
            continue;
        }
        // "/" is the symbol index, "__.SYMDEF" its BSD spelling.
        if hdr.name.starts_with(b"/ ") || hdr.name.starts_with(b"__.SYMDEF") {
            continue;
        }

        let name = if hdr.name[0] == b'/' {
            long_name(path, strtab, hdr.name)?
        } else {
            short_name(path, hdr.name)?
        };

        members.push(ArchiveMember {
            name,
            data: body.to_vec(),
        });
    }
    Ok(members)
}

/// Extract every member of a thin archive by reading the referenced
/// files relative to the archive's directory
pub fn read_thin_archive_members(path: &str, data: &[u8]) -> Result<Vec<ArchiveMember>> {
    let mut pos = ARMAG_THIN.len();
    let mut strtab: &[u8] = &[];
    let mut members = Vec::new();
    let basedir = Path::new(path).parent().unwrap_or_else(|| Path::new("."));

    while pos + 2 <= data.len() {
        let hdr = parse_hdr(path, &data[pos..])?;
        let body_start = pos + HDR_SIZE;

        if hdr.name.starts_with(b"// ") {
            strtab = data
                .get(body_start..body_start + hdr.size)
                .ok_or_else(|| Error::ArchiveCorrupt {
                    path: path.to_string(),
                })?;
            pos = body_start + hdr.size;
            pos += pos & 1;
            continue;
        }
        if hdr.name.starts_with(b"/ ") {
            pos = body_start + hdr.size;
            pos += pos & 1;
            continue;
        }

        // Thin archives store member bodies externally, so only the
        // header advances the cursor.
        pos = body_start;

        let name = if hdr.name[0] == b'/' {
            long_name(path, strtab, hdr.name)?
        } else {
            return Err(Error::ArchiveLongName {
                path: path.to_string(),
            });
        };

        let member_path = basedir.join(&name);
        let contents = std::fs::read(&member_path).map_err(|e| Error::Io {
            path: member_path.display().to_string(),
            kind: e.kind(),
        })?;
        members.push(ArchiveMember {
            name,
            data: contents,
        });
    }
    Ok(members)
}

#[cfg(test)]
mod test {
    use super::*;

    fn member_hdr(name: &str, size: usize) -> Vec<u8> {
        let mut hdr = vec![b' '; HDR_SIZE];
        hdr[..name.len()].copy_from_slice(name.as_bytes());
        let size_str = size.to_string();
        hdr[48..48 + size_str.len()].copy_from_slice(size_str.as_bytes());
        hdr[58..60].copy_from_slice(b"`\n");
        hdr
    }

    #[test]
    fn test_empty_archive() {
        let members = read_archive_members("libempty.a", ARMAG).unwrap_or_default();
        assert!(members.is_empty());
    }

    #[test]
    fn test_short_and_long_names() {
        let mut ar = ARMAG.to_vec();

        // Long-name table holding "verylongmembername.o".
        let strtab = b"verylongmembername.o/\n";
        ar.extend_from_slice(&member_hdr("// ", strtab.len()));
        ar.extend_from_slice(strtab);

        ar.extend_from_slice(&member_hdr("a.o/", 3));
        ar.extend_from_slice(b"AAA\n"); // odd size gets a pad byte

        ar.extend_from_slice(&member_hdr("/0", 4));
        ar.extend_from_slice(b"BBBB");

        let members = match read_archive_members("lib.a", &ar) {
            Ok(m) => m,
            Err(_) => unreachable!(),
        };
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].name, "a.o");
        assert_eq!(members[0].data, b"AAA");
        assert_eq!(members[1].name, "verylongmembername.o");
        assert_eq!(members[1].data, b"BBBB");
    }

    #[test]
    fn test_symbol_index_is_skipped() {
        let mut ar = ARMAG.to_vec();
        ar.extend_from_slice(&member_hdr("/ ", 8));
        ar.extend_from_slice(&[0u8; 8]);
        ar.extend_from_slice(&member_hdr("b.o/", 2));
        ar.extend_from_slice(b"XY");

        let members = match read_archive_members("lib.a", &ar) {
            Ok(m) => m,
            Err(_) => unreachable!(),
        };
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "b.o");
    }

    #[test]
    fn test_truncated_member_is_rejected() {
        let mut ar = ARMAG.to_vec();
        ar.extend_from_slice(&member_hdr("a.o/", 100));
        ar.extend_from_slice(b"short");
        assert!(matches!(
            read_archive_members("lib.a", &ar),
            Err(Error::ArchiveCorrupt { .. })
        ));
    }
}
