//! Minimal tape-archive encoder
//!
//! Produces ustar streams containing regular files only. Directories are never
//! emitted, so every destination directory must already exist in the sandbox.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::types::{ArchiveError, SourceFile};

pub const BLOCK_SIZE: usize = 512;

/// Largest value an 11-digit octal field can hold (8 GiB - 1)
pub const MAX_OCTAL_11: u64 = 0o77777777777;

const NAME_FIELD: std::ops::Range<usize> = 0..100;
const MODE_FIELD: std::ops::Range<usize> = 100..108;
const UID_FIELD: std::ops::Range<usize> = 108..116;
const GID_FIELD: std::ops::Range<usize> = 116..124;
const SIZE_FIELD: std::ops::Range<usize> = 124..136;
const MTIME_FIELD: std::ops::Range<usize> = 136..148;
const CHECKSUM_FIELD: std::ops::Range<usize> = 148..156;
const TYPEFLAG_OFFSET: usize = 156;
const MAGIC_FIELD: std::ops::Range<usize> = 257..263;
const VERSION_FIELD: std::ops::Range<usize> = 263..265;

const REGULAR_FILE: u8 = b'0';

/// Sink for named files that produces a byte stream the engine can extract
pub trait ArchiveWriter {
    fn write(&mut self, path: &str, content: &[u8], mode: u32, mtime: u64)
        -> Result<(), ArchiveError>;

    fn finish(self) -> Bytes
    where
        Self: Sized;
}

/// In-memory ustar writer
#[derive(Debug, Default)]
pub struct TarArchive {
    buf: Vec<u8>,
    paths: HashSet<String>,
}

impl TarArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Archive `files` in order, stamped with the current time
    pub fn from_files(files: &[SourceFile]) -> Result<Bytes, ArchiveError> {
        let mtime = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let mut archive = Self::new();
        for file in files {
            archive.write(&file.path, &file.content, file.mode, mtime)?;
        }
        Ok(archive.finish())
    }

    fn validate_path(&self, path: &str) -> Result<(), ArchiveError> {
        if path.is_empty()
            || path.starts_with('/')
            || path.contains('\\')
            || path.contains('\0')
            || path
                .split('/')
                .any(|part| part.is_empty() || part == "." || part == "..")
        {
            return Err(ArchiveError::InvalidPath(path.to_string()));
        }

        if path.len() > NAME_FIELD.len() {
            return Err(ArchiveError::NameTooLong {
                path: path.to_string(),
                len: path.len(),
            });
        }

        if self.paths.contains(path) {
            return Err(ArchiveError::DuplicatePath(path.to_string()));
        }

        Ok(())
    }
}

impl ArchiveWriter for TarArchive {
    fn write(
        &mut self,
        path: &str,
        content: &[u8],
        mode: u32,
        mtime: u64,
    ) -> Result<(), ArchiveError> {
        self.validate_path(path)?;

        let size = content.len() as u64;
        check_size(path, size)?;
        if mtime > MAX_OCTAL_11 {
            return Err(ArchiveError::InvalidMtime(mtime));
        }

        let header = encode_header(path, u64::from(mode & 0o7777), size, mtime);
        self.buf.extend_from_slice(&header);
        self.buf.extend_from_slice(content);
        self.buf.resize(self.buf.len() + padding(content.len()), 0);
        self.paths.insert(path.to_string());

        Ok(())
    }

    fn finish(mut self) -> Bytes {
        self.buf.resize(self.buf.len() + 2 * BLOCK_SIZE, 0);
        Bytes::from(self.buf)
    }
}

/// The size field holds at most 11 octal digits
fn check_size(path: &str, size: u64) -> Result<(), ArchiveError> {
    if size > MAX_OCTAL_11 {
        return Err(ArchiveError::ContentTooLarge {
            path: path.to_string(),
            size,
        });
    }
    Ok(())
}

/// Zero bytes needed to round `len` up to a whole block
fn padding(len: usize) -> usize {
    (BLOCK_SIZE - len % BLOCK_SIZE) % BLOCK_SIZE
}

fn encode_header(path: &str, mode: u64, size: u64, mtime: u64) -> [u8; BLOCK_SIZE] {
    let mut header = [0u8; BLOCK_SIZE];

    header[..path.len()].copy_from_slice(path.as_bytes());
    write_octal(&mut header[MODE_FIELD], mode);
    write_octal(&mut header[UID_FIELD], 0);
    write_octal(&mut header[GID_FIELD], 0);
    write_octal(&mut header[SIZE_FIELD], size);
    write_octal(&mut header[MTIME_FIELD], mtime);
    header[TYPEFLAG_OFFSET] = REGULAR_FILE;
    header[MAGIC_FIELD].copy_from_slice(b"ustar\0");
    header[VERSION_FIELD].copy_from_slice(b"00");

    let checksum = header_checksum(&header);
    // Six digits, NUL, space
    let field = format!("{:06o}\0 ", checksum);
    header[CHECKSUM_FIELD].copy_from_slice(field.as_bytes());

    header
}

/// Zero-padded octal digits filling all but the last byte, which stays NUL.
/// Callers guarantee the value fits.
fn write_octal(field: &mut [u8], value: u64) {
    let digits = format!("{:0width$o}", value, width = field.len() - 1);
    field[..digits.len()].copy_from_slice(digits.as_bytes());
    field[digits.len()] = 0;
}

/// Sum of all header bytes with the checksum field counted as spaces
pub fn header_checksum(header: &[u8; BLOCK_SIZE]) -> u32 {
    header
        .iter()
        .enumerate()
        .map(|(i, &b)| {
            if CHECKSUM_FIELD.contains(&i) {
                u32::from(b' ')
            } else {
                u32::from(b)
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_header(archive: &Bytes) -> [u8; BLOCK_SIZE] {
        let mut header = [0u8; BLOCK_SIZE];
        header.copy_from_slice(&archive[..BLOCK_SIZE]);
        header
    }

    fn parse_octal(field: &[u8]) -> u64 {
        let text: String = field
            .iter()
            .take_while(|&&b| b != 0 && b != b' ')
            .map(|&b| b as char)
            .collect();
        u64::from_str_radix(&text, 8).unwrap()
    }

    #[test]
    fn test_empty_archive_is_two_zero_blocks() {
        let bytes = TarArchive::new().finish();
        assert_eq!(bytes.len(), 2 * BLOCK_SIZE);
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_content_padded_to_block_boundary() {
        let mut archive = TarArchive::new();
        archive.write("a.txt", b"hello", 0o644, 0).unwrap();
        archive.write("b.txt", &[7u8; 512], 0o644, 0).unwrap();
        let bytes = archive.finish();

        // header + 1 block, header + 1 block, 2 end blocks
        assert_eq!(bytes.len(), 6 * BLOCK_SIZE);
        assert_eq!(&bytes[BLOCK_SIZE..BLOCK_SIZE + 5], b"hello");
        assert!(bytes[BLOCK_SIZE + 5..2 * BLOCK_SIZE].iter().all(|&b| b == 0));
        assert_eq!(&bytes[2 * BLOCK_SIZE..2 * BLOCK_SIZE + 5], b"b.txt");
    }

    #[test]
    fn test_header_fields_and_checksum() {
        let mut archive = TarArchive::new();
        archive
            .write("src/Program.cs", b"class P {}", 0o100755, 1_700_000_000)
            .unwrap();
        let header = first_header(&archive.finish());

        assert_eq!(&header[..14], b"src/Program.cs");
        assert_eq!(parse_octal(&header[MODE_FIELD]), 0o755);
        assert_eq!(parse_octal(&header[SIZE_FIELD]), 10);
        assert_eq!(parse_octal(&header[MTIME_FIELD]), 1_700_000_000);
        assert_eq!(header[TYPEFLAG_OFFSET], REGULAR_FILE);
        assert_eq!(
            parse_octal(&header[CHECKSUM_FIELD]),
            u64::from(header_checksum(&header))
        );
    }

    #[test]
    fn test_long_name_rejected() {
        let mut archive = TarArchive::new();
        let name = "x".repeat(101);
        assert_eq!(
            archive.write(&name, b"", 0o644, 0),
            Err(ArchiveError::NameTooLong {
                path: name.clone(),
                len: 101
            })
        );
        assert!(archive.write(&"y".repeat(100), b"", 0o644, 0).is_ok());
    }

    #[test]
    fn test_invalid_paths_rejected() {
        let mut archive = TarArchive::new();
        for path in ["", "/etc/passwd", "a//b", "../escape", "dir\\file", "./a"] {
            assert!(
                matches!(
                    archive.write(path, b"x", 0o644, 0),
                    Err(ArchiveError::InvalidPath(_))
                ),
                "path {:?} should be rejected",
                path
            );
        }
    }

    #[test]
    fn test_duplicate_path_rejected() {
        let mut archive = TarArchive::new();
        archive.write("Program.cs", b"one", 0o644, 0).unwrap();
        assert_eq!(
            archive.write("Program.cs", b"two", 0o644, 0),
            Err(ArchiveError::DuplicatePath("Program.cs".to_string()))
        );
    }

    #[test]
    fn test_mtime_overflow_rejected() {
        let mut archive = TarArchive::new();
        assert_eq!(
            archive.write("a", b"", 0o644, MAX_OCTAL_11 + 1),
            Err(ArchiveError::InvalidMtime(MAX_OCTAL_11 + 1))
        );
    }

    #[test]
    fn test_size_beyond_octal_field_rejected() {
        assert!(check_size("big.bin", MAX_OCTAL_11).is_ok());
        assert_eq!(
            check_size("big.bin", MAX_OCTAL_11 + 1),
            Err(ArchiveError::ContentTooLarge {
                path: "big.bin".to_string(),
                size: MAX_OCTAL_11 + 1,
            })
        );
    }
}
