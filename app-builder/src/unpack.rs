use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::Path;

use flate2::read::GzDecoder;

/// Errors are split by who is at fault: a malformed archive is the
/// client's, anything touching the filesystem is the pipeline's.
#[derive(Debug, thiserror::Error)]
pub enum UnpackError {
    #[error("malformed source archive: {0}")]
    Malformed(io::Error),

    #[error("failed to write source tree: {0}")]
    Io(#[from] io::Error),
}

/// Unpacks a gzip-compressed tar stream into the build directory.
///
/// Entries land flat: only the base name of each recorded path is joined to
/// the build directory. Directories are created with the recorded mode;
/// regular files are opened write-only with the recorded mode. Other entry
/// types are not part of a source tree and are skipped.
pub fn unpack_source<R: Read>(data: R, build_dir: &Path) -> Result<(), UnpackError> {
    fs::create_dir_all(build_dir)?;

    let gz = GzDecoder::new(data);
    let mut archive = tar::Archive::new(gz);
    for entry in archive.entries().map_err(UnpackError::Malformed)? {
        let mut entry = entry.map_err(UnpackError::Malformed)?;
        let header = entry.header();
        let mode = header.mode().map_err(UnpackError::Malformed)?;
        let entry_type = header.entry_type();
        let path = entry.path().map_err(UnpackError::Malformed)?.into_owned();

        let Some(name) = path.file_name() else {
            continue;
        };
        let target = build_dir.join(name);

        if entry_type.is_dir() {
            let mut builder = fs::DirBuilder::new();
            builder.mode(mode);
            match builder.create(&target) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(UnpackError::Io(e)),
            }
        } else if entry_type.is_file() {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .mode(mode)
                .open(&target)?;
            io::copy(&mut entry, &mut file)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compression, write::GzEncoder};
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use tar::{EntryType, Header};

    struct ArchiveBuilder {
        inner: tar::Builder<Vec<u8>>,
    }

    impl ArchiveBuilder {
        fn new() -> Self {
            Self {
                inner: tar::Builder::new(Vec::new()),
            }
        }

        fn file(mut self, path: &str, mode: u32, contents: &[u8]) -> Self {
            let mut header = Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(mode);
            header.set_cksum();
            self.inner.append_data(&mut header, path, contents).unwrap();
            self
        }

        fn dir(mut self, path: &str, mode: u32) -> Self {
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::dir());
            header.set_size(0);
            header.set_mode(mode);
            header.set_cksum();
            self.inner
                .append_data(&mut header, path, std::io::empty())
                .unwrap();
            self
        }

        fn gzipped(self) -> Vec<u8> {
            let tarball = self.inner.into_inner().unwrap();
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&tarball).unwrap();
            encoder.finish().unwrap()
        }
    }

    fn file_mode(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn nested_entries_land_flat_in_the_build_dir() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ArchiveBuilder::new()
            .file("README.md", 0o644, b"hello")
            .file("src/main.py", 0o644, b"print('hi')")
            .gzipped();

        unpack_source(&archive[..], dir.path()).unwrap();

        assert_eq!(fs::read(dir.path().join("README.md")).unwrap(), b"hello");
        // The recorded directory structure is not preserved.
        assert_eq!(
            fs::read(dir.path().join("main.py")).unwrap(),
            b"print('hi')"
        );
        assert!(!dir.path().join("src").exists());
    }

    #[test]
    fn recorded_modes_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ArchiveBuilder::new()
            .dir("scripts", 0o755)
            .file("run.sh", 0o755, b"#!/bin/sh\n")
            .file("secret.env", 0o600, b"TOKEN=1")
            .gzipped();

        unpack_source(&archive[..], dir.path()).unwrap();

        assert_eq!(file_mode(&dir.path().join("scripts")), 0o755);
        assert_eq!(file_mode(&dir.path().join("run.sh")), 0o755);
        assert_eq!(file_mode(&dir.path().join("secret.env")), 0o600);
    }

    #[test]
    fn existing_directories_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ArchiveBuilder::new()
            .dir("pkg", 0o755)
            .dir("pkg", 0o755)
            .gzipped();
        unpack_source(&archive[..], dir.path()).unwrap();
        assert!(dir.path().join("pkg").is_dir());
    }

    #[test]
    fn garbage_input_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let err = unpack_source(&b"definitely not gzip"[..], dir.path()).unwrap_err();
        assert!(matches!(err, UnpackError::Malformed(_)));
    }

    #[test]
    fn truncated_archive_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ArchiveBuilder::new()
            .file("README.md", 0o644, b"hello")
            .gzipped();
        // Re-compress a truncated tar stream so the gzip framing is valid
        // but the tar content is not.
        let mut decoder = GzDecoder::new(&archive[..]);
        let mut tarball = Vec::new();
        decoder.read_to_end(&mut tarball).unwrap();
        tarball.truncate(100);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tarball).unwrap();
        let truncated = encoder.finish().unwrap();

        let err = unpack_source(&truncated[..], dir.path()).unwrap_err();
        assert!(matches!(err, UnpackError::Malformed(_)));
    }
}
