use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use log::{debug, warn};
use crate::error::{PipelineError, Result};

/// Get the path of the concat manifest for a unit of work keyed by `key` (a date or merged range)
pub fn manifest_path(output_dir: &Path, key: &str) -> PathBuf {
    output_dir.join(format!("{}_filelist.txt", key))
}

/// Render one manifest line for an absolute path.
///
/// The concat demuxer reads single-quoted strings; an embedded quote is written as `'\''`.
pub fn manifest_line(path: &Path) -> String {
    let text = path.to_string_lossy();
    format!("file '{}'", text.replace('\'', r"'\''"))
}

/// A concat list on disk, removed when released or dropped.
///
/// Removal is best-effort: a failure is logged and never reported to the caller.
#[derive(Debug)]
pub struct ConcatManifest {
    path: PathBuf,
    entries: usize,
    released: bool,
}

impl ConcatManifest {
    /// Write the manifest for `paths`, in the given order, and flush it to disk
    pub fn write<P: AsRef<Path>>(manifest_path: &Path, paths: &[P]) -> Result<Self> {
        let mut body = String::new();
        for path in paths {
            body.push_str(&manifest_line(path.as_ref()));
            body.push('\n');
        }

        let mut file = fs::File::create(manifest_path)
            .map_err(|e| PipelineError::io(manifest_path, e))?;
        persist(manifest_path, &mut file, body.as_bytes())?;
        if let Err(e) = file.sync_all() {
            discard(manifest_path);
            return Err(PipelineError::io(manifest_path, e));
        }

        debug!("Wrote concat manifest {} ({} entries)", manifest_path.display(), paths.len());

        Ok(Self {
            path: manifest_path.to_path_buf(),
            entries: paths.len(),
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Delete the manifest. Returns whether the file is gone; failures are only logged.
    pub fn release(&mut self) -> bool {
        if self.released {
            return true;
        }
        self.released = true;

        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Removed concat manifest {}", self.path.display());
                true
            }
            Err(e) => {
                warn!("Could not remove concat manifest {}: {}", self.path.display(), e);
                false
            }
        }
    }
}

/// Write `body` to the freshly created `path`, removing the file again if the write fails
fn persist<W: Write>(path: &Path, out: &mut W, body: &[u8]) -> Result<()> {
    if let Err(e) = out.write_all(body).and_then(|_| out.flush()) {
        discard(path);
        return Err(PipelineError::io(path, e));
    }
    Ok(())
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!("Could not remove incomplete concat manifest {}: {}", path.display(), e);
    }
}

impl Drop for ConcatManifest {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_manifest_lines_preserve_order() {
        let dir = tempfile::tempdir().unwrap();
        let list = manifest_path(dir.path(), "20240101");
        let paths = vec![
            PathBuf::from("/cam/2024010109/0900.mp4"),
            PathBuf::from("/cam/2024010108/0800.mp4"),
        ];

        let manifest = ConcatManifest::write(&list, &paths).unwrap();
        assert_eq!(manifest.len(), 2);

        let content = fs::read_to_string(&list).unwrap();
        assert_eq!(
            content,
            "file '/cam/2024010109/0900.mp4'\nfile '/cam/2024010108/0800.mp4'\n"
        );
    }

    #[test]
    fn test_manifest_path_is_keyed() {
        assert_eq!(
            manifest_path(Path::new("/out"), "20240101_Accelerate_To_20240102_Accelerate"),
            PathBuf::from("/out/20240101_Accelerate_To_20240102_Accelerate_filelist.txt")
        );
    }

    #[test]
    fn test_single_quote_is_escaped() {
        assert_eq!(
            manifest_line(Path::new("/cam/it's/a.mp4")),
            r"file '/cam/it'\''s/a.mp4'"
        );
    }

    #[test]
    fn test_release_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let list = manifest_path(dir.path(), "20240101");
        let mut manifest = ConcatManifest::write(&list, &[PathBuf::from("/a.mp4")]).unwrap();
        assert!(list.exists());
        assert!(manifest.release());
        assert!(!list.exists());
        // A second release is a no-op
        assert!(manifest.release());
    }

    #[test]
    fn test_drop_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let list = manifest_path(dir.path(), "20240102");
        {
            let _manifest = ConcatManifest::write(&list, &[PathBuf::from("/a.mp4")]).unwrap();
            assert!(list.exists());
        }
        assert!(!list.exists());
    }

    #[test]
    fn test_release_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let list = manifest_path(dir.path(), "20240103");
        let mut manifest = ConcatManifest::write(&list, &[PathBuf::from("/a.mp4")]).unwrap();
        fs::remove_file(&list).unwrap();
        assert!(!manifest.release());
    }

    #[test]
    fn test_write_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("missing").join("x_filelist.txt");
        let result = ConcatManifest::write(&list, &[PathBuf::from("/a.mp4")]);
        assert!(matches!(result, Err(PipelineError::Io { .. })));
    }

    struct FullDisk;

    impl Write for FullDisk {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("no space left on device"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_write_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let list = manifest_path(dir.path(), "20240104");
        fs::write(&list, "file '/a.mp4'\nfi").unwrap();

        let result = persist(&list, &mut FullDisk, b"file '/a.mp4'\n");
        assert!(matches!(result, Err(PipelineError::Io { .. })));
        assert!(!list.exists());
    }

    #[test]
    fn test_successful_write_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let list = manifest_path(dir.path(), "20240105");
        let mut file = fs::File::create(&list).unwrap();
        persist(&list, &mut file, b"file '/a.mp4'\n").unwrap();
        assert_eq!(fs::read_to_string(&list).unwrap(), "file '/a.mp4'\n");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        /// The manifest lists exactly the given paths, one per line, in the given order.
        #[test]
        fn test_manifest_order_matches_input(
            names in prop::collection::vec("[0-9]{4}\\.mp4", 1..20),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let list = manifest_path(dir.path(), "20240101");
            let paths: Vec<PathBuf> = names.iter().map(|n| dir.path().join(n)).collect();

            let _manifest = ConcatManifest::write(&list, &paths).unwrap();
            let content = fs::read_to_string(&list).unwrap();
            let lines: Vec<&str> = content.lines().collect();

            prop_assert_eq!(lines.len(), paths.len());
            for (line, path) in lines.iter().zip(&paths) {
                prop_assert_eq!(line.to_string(), format!("file '{}'", path.display()));
            }
        }
    }
}
