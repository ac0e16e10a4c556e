use flate2::read::GzDecoder;
use log::debug;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::errors::{JobError, JobResult};

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const TAR_MAGIC: &[u8] = b"ustar";
const TAR_MAGIC_OFFSET: usize = 257;

/// Enough of the file to find any of the magic numbers.
pub const HEADER_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleKind {
    /// A flatpak single-file bundle, i.e. a static delta superblock.
    Delta,
    Tar,
    TarGz,
}

/// Classifies a bundle from the first bytes of the file.
///
/// Static delta bundles have no magic number, but always contain NUL
/// bytes early on, which is how they are told apart from stray text
/// uploads.
pub fn classify(header: &[u8]) -> Option<BundleKind> {
    if header.starts_with(GZIP_MAGIC) {
        Some(BundleKind::TarGz)
    } else if header.len() >= TAR_MAGIC_OFFSET + TAR_MAGIC.len()
        && &header[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len()] == TAR_MAGIC
    {
        Some(BundleKind::Tar)
    } else if header.contains(&0) {
        Some(BundleKind::Delta)
    } else {
        None
    }
}

fn read_header(path: &Path) -> io::Result<Vec<u8>> {
    let mut header = Vec::with_capacity(HEADER_SIZE);
    File::open(path)?
        .take(HEADER_SIZE as u64)
        .read_to_end(&mut header)?;
    Ok(header)
}

pub fn detect(path: &Path) -> JobResult<BundleKind> {
    let header = read_header(path)?;
    let kind = classify(&header).ok_or_else(|| {
        JobError::UnrecognizedBundle(format!(
            "{} is not a bundle",
            path.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        ))
    })?;
    debug!("Detected {:?} bundle in {:?}", kind, path);
    Ok(kind)
}

fn unpack<R: Read>(reader: R, dest: &Path) -> JobResult<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(false);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.to_path_buf();
        // unpack_in refuses anything escaping dest, report that rather than skipping
        if !entry.unpack_in(dest)? {
            return Err(JobError::UnrecognizedBundle(format!(
                "Archive entry {:?} is outside the archive root",
                entry_path
            )));
        }
    }
    Ok(())
}

/// Extracts a tar or gzipped tar bundle into `dest`.
pub fn extract_archive(path: &Path, kind: BundleKind, dest: &Path) -> JobResult<()> {
    let file = File::open(path)?;
    match kind {
        BundleKind::Tar => unpack(file, dest),
        BundleKind::TarGz => unpack(GzDecoder::new(file), dest),
        BundleKind::Delta => Err(JobError::new("Static delta bundles can't be extracted")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs;

    fn tar_with(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(b""), None);
        assert_eq!(classify(b"just some text\n"), None);
        assert_eq!(classify(&[0x1f, 0x8b, 0x08, 0x00]), Some(BundleKind::TarGz));
        assert_eq!(classify(b"ref\0\0app/org.test/x86_64/stable\0"), Some(BundleKind::Delta));

        let tar = tar_with(&[("repo/config", "[core]\n")]);
        assert_eq!(classify(&tar[..HEADER_SIZE]), Some(BundleKind::Tar));
    }

    #[test]
    fn test_detect_and_extract() {
        let dir = tempfile::tempdir().unwrap();
        let files = [
            ("repo/config", "[core]\nrepo_version=1\n"),
            ("repo/refs/heads/app/org.test.Hello/x86_64/stable", "abcd\n"),
        ];

        let tar_path = dir.path().join("upload.tar");
        fs::write(&tar_path, tar_with(&files)).unwrap();
        assert_eq!(detect(&tar_path).unwrap(), BundleKind::Tar);

        let tgz_path = dir.path().join("upload.tgz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        std::io::Write::write_all(&mut encoder, &tar_with(&files)).unwrap();
        fs::write(&tgz_path, encoder.finish().unwrap()).unwrap();
        assert_eq!(detect(&tgz_path).unwrap(), BundleKind::TarGz);

        for (path, kind) in [(&tar_path, BundleKind::Tar), (&tgz_path, BundleKind::TarGz)] {
            let dest = tempfile::tempdir().unwrap();
            extract_archive(path, kind, dest.path()).unwrap();
            assert_eq!(
                fs::read_to_string(dest.path().join("repo/config")).unwrap(),
                "[core]\nrepo_version=1\n"
            );
            assert!(dest.path().join("repo/refs/heads/app/org.test.Hello/x86_64/stable").is_file());
        }

        let text_path = dir.path().join("notes.txt");
        fs::write(&text_path, "hello").unwrap();
        assert!(matches!(detect(&text_path), Err(JobError::UnrecognizedBundle(_))));
    }

    #[test]
    fn test_extract_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();

        // Builder refuses to write ".." paths, so patch the name in by hand
        let mut header = tar::Header::new_gnu();
        let contents = b"evil";
        header.as_old_mut().name[..13].copy_from_slice(b"../escaped.tx");
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        let mut builder = tar::Builder::new(Vec::new());
        builder.append(&header, &contents[..]).unwrap();
        let tar_path = dir.path().join("evil.tar");
        fs::write(&tar_path, builder.into_inner().unwrap()).unwrap();

        let dest = dir.path().join("dest");
        fs::create_dir(&dest).unwrap();
        assert!(matches!(
            extract_archive(&tar_path, BundleKind::Tar, &dest),
            Err(JobError::UnrecognizedBundle(_))
        ));
        assert!(!dir.path().join("escaped.tx").exists());
    }
}
