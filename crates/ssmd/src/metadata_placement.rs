//! Filesystem-backed [`OverrideMetadataSink`]: atomically writes
//! `details.json`/`cover.jpg` into a canonical title's preferred override
//! directory (supplementary; spec.md Section 1).

use ssm_core::metadata_sink::{cover_jpg_path, details_json_path};
use ssm_core::OverrideMetadataSink;
use std::io;
use std::path::PathBuf;

pub struct FilesystemMetadataSink {
    preferred_override_root: PathBuf,
}

impl FilesystemMetadataSink {
    pub fn new(preferred_override_root: PathBuf) -> Self {
        Self { preferred_override_root }
    }
}

impl OverrideMetadataSink for FilesystemMetadataSink {
    fn write_details_json(&self, canonical_title: &str, contents: &[u8]) -> io::Result<()> {
        write_atomically(&details_json_path(&self.preferred_override_root, canonical_title), contents)
    }

    fn write_cover_jpg(&self, canonical_title: &str, contents: &[u8]) -> io::Result<()> {
        write_atomically(&cover_jpg_path(&self.preferred_override_root, canonical_title), contents)
    }
}

fn write_atomically(path: &std::path::Path, contents: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    use std::io::Write as _;
    tmp.write_all(contents)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_details_json_under_title_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FilesystemMetadataSink::new(dir.path().to_path_buf());
        sink.write_details_json("My Title", b"{\"ok\":true}").unwrap();

        let path = dir.path().join("My Title/details.json");
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"ok\":true}");
    }

    #[test]
    fn writes_cover_jpg_under_title_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FilesystemMetadataSink::new(dir.path().to_path_buf());
        sink.write_cover_jpg("My Title", b"\xff\xd8\xff").unwrap();

        let path = dir.path().join("My Title/cover.jpg");
        assert_eq!(std::fs::read(&path).unwrap(), b"\xff\xd8\xff");
    }

    #[test]
    fn rewrite_replaces_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FilesystemMetadataSink::new(dir.path().to_path_buf());
        sink.write_details_json("My Title", b"first").unwrap();
        sink.write_details_json("My Title", b"second").unwrap();

        let path = dir.path().join("My Title/details.json");
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }
}
