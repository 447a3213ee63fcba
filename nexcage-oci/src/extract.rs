//! Type-aware rootfs archive extraction.
//!
//! Streams `.tar`, `.tar.gz`, and `.tar.zst` archives into a staging root.
//! Every entry's path is normalized and checked against the staging root
//! before unpacking; escapes are rejected rather than clamped.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Component, Path};

use flate2::read::GzDecoder;

use crate::{Error, Result};

/// Rootfs archive formats, detected by filename suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ArchiveFormat {
    /// Uncompressed tar.
    Tar,
    /// Gzip-compressed tar.
    TarGz,
    /// Zstandard-compressed tar.
    TarZst,
}

impl ArchiveFormat {
    /// Detects the format from the file name, or `None` for other suffixes.
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        if name.ends_with(".tar.zst") {
            Some(Self::TarZst)
        } else if name.ends_with(".tar.gz") {
            Some(Self::TarGz)
        } else if name.ends_with(".tar") {
            Some(Self::Tar)
        } else {
            None
        }
    }
}

/// Extracts `archive` into `dest`, creating `dest` if needed.
pub fn unpack(archive: &Path, format: ArchiveFormat, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let file = BufReader::new(File::open(archive)?);
    match format {
        ArchiveFormat::Tar => unpack_stream(file, dest),
        ArchiveFormat::TarGz => unpack_stream(GzDecoder::new(file), dest),
        ArchiveFormat::TarZst => unpack_stream(zstd::Decoder::new(file)?, dest),
    }
}

/// Extracts a single tar stream, rejecting entries that escape `dest`.
fn unpack_stream(reader: impl Read, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    for raw_entry in archive.entries()? {
        let mut entry = raw_entry?;
        let rel = entry.path()?.into_owned();
        reject_escape(&rel)?;
        entry.unpack_in(dest)?;
    }
    Ok(())
}

/// Fails when the normalized relative path would leave the extraction root.
fn reject_escape(rel: &Path) -> Result<()> {
    let mut depth: i32 = 0;
    for component in rel.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                return Err(Error::PathEscape {
                    path: rel.to_path_buf(),
                });
            }
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(Error::PathEscape {
                        path: rel.to_path_buf(),
                    });
                }
            }
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn sample_tar() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, "bin/sh", &b"hello"[..])
            .unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn detect_by_suffix() {
        assert_eq!(
            ArchiveFormat::detect(Path::new("r.tar")),
            Some(ArchiveFormat::Tar)
        );
        assert_eq!(
            ArchiveFormat::detect(Path::new("r.tar.gz")),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(
            ArchiveFormat::detect(Path::new("r.tar.zst")),
            Some(ArchiveFormat::TarZst)
        );
        assert_eq!(ArchiveFormat::detect(Path::new("r.zip")), None);
        assert_eq!(ArchiveFormat::detect(Path::new("rootfs")), None);
    }

    #[test]
    fn unpack_plain_tar() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("r.tar");
        std::fs::write(&archive, sample_tar()).unwrap();

        let dest = tmp.path().join("out");
        unpack(&archive, ArchiveFormat::Tar, &dest).unwrap();
        assert_eq!(std::fs::read(dest.join("bin/sh")).unwrap(), b"hello");
    }

    #[test]
    fn unpack_gzip_tar() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("r.tar.gz");
        let mut enc =
            flate2::write::GzEncoder::new(File::create(&archive).unwrap(), Default::default());
        enc.write_all(&sample_tar()).unwrap();
        enc.finish().unwrap();

        let dest = tmp.path().join("out");
        unpack(&archive, ArchiveFormat::TarGz, &dest).unwrap();
        assert!(dest.join("bin/sh").is_file());
    }

    #[test]
    fn unpack_zstd_tar() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("r.tar.zst");
        let mut enc = zstd::Encoder::new(File::create(&archive).unwrap(), 0).unwrap();
        enc.write_all(&sample_tar()).unwrap();
        enc.finish().unwrap();

        let dest = tmp.path().join("out");
        unpack(&archive, ArchiveFormat::TarZst, &dest).unwrap();
        assert!(dest.join("bin/sh").is_file());
    }

    #[test]
    fn escape_rejection() {
        assert!(reject_escape(Path::new("usr/bin/env")).is_ok());
        assert!(reject_escape(Path::new("a/../b")).is_ok());
        assert!(reject_escape(Path::new("../evil")).is_err());
        assert!(reject_escape(Path::new("a/../../evil")).is_err());
        assert!(reject_escape(Path::new("/etc/passwd")).is_err());
    }
}
