use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use log::{debug, info, warn};
use regex::Regex;
use serde::Serialize;
use walkdir::WalkDir;
use crate::error::{PipelineError, Result};

/// Extension of camera segments and of every file the pipeline writes
pub const SEGMENT_EXTENSION: &str = "mp4";

/// Suffix appended to the stem of an accelerated file
pub const ACCELERATED_SUFFIX: &str = "_Accelerate";

/// File-name patterns the pipeline recognises, all anchored and case-sensitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamePattern {
    /// Camera hour directory, `YYYYMMDDHH`
    HourDirectory,
    /// Daily merged output, `YYYYMMDD.mp4`
    DailyMerged,
    /// Accelerated daily output, `YYYYMMDD_Accelerate.mp4`
    Accelerated,
}

impl NamePattern {
    fn regex(self) -> &'static Regex {
        static HOUR: OnceLock<Regex> = OnceLock::new();
        static DAILY: OnceLock<Regex> = OnceLock::new();
        static ACCELERATED: OnceLock<Regex> = OnceLock::new();

        let (cell, pattern) = match self {
            NamePattern::HourDirectory => (&HOUR, r"^[0-9]{10}$"),
            NamePattern::DailyMerged => (&DAILY, r"^[0-9]{8}\.mp4$"),
            NamePattern::Accelerated => (&ACCELERATED, r"^[0-9]{8}_Accelerate\.mp4$"),
        };
        cell.get_or_init(|| Regex::new(pattern).expect("file-name pattern is a valid regex"))
    }

    pub fn matches(self, name: &str) -> bool {
        self.regex().is_match(name)
    }

    /// Human-readable form used in skip messages
    pub fn describe(self) -> &'static str {
        match self {
            NamePattern::HourDirectory => "YYYYMMDDHH",
            NamePattern::DailyMerged => "YYYYMMDD.mp4",
            NamePattern::Accelerated => "YYYYMMDD_Accelerate.mp4",
        }
    }
}

/// A discovered video file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFile {
    /// Absolute path
    pub path: PathBuf,
    /// File stem, which carries the timestamp in the camera's fixed-width naming
    pub key: String,
    /// Size in bytes at discovery time
    pub bytes: u64,
}

impl SourceFile {
    fn from_path(path: PathBuf) -> Self {
        let key = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let bytes = match std::fs::metadata(&path) {
            Ok(m) => m.len(),
            Err(e) => {
                warn!("Failed to stat {}: {}", path.display(), e);
                0
            }
        };
        Self { path, key, bytes }
    }
}

/// Segments of one calendar day, in chronological order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DateGroup {
    /// `YYYYMMDD`
    pub date: String,
    /// Hour directories that contributed to this group, ascending
    pub hours: Vec<PathBuf>,
    pub files: Vec<SourceFile>,
}

impl DateGroup {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.bytes).sum()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }
}

fn absolute_root(root: &Path) -> Result<PathBuf> {
    if !root.is_dir() {
        return Err(PipelineError::Configuration(format!(
            "directory not found: {}",
            root.display()
        )));
    }
    std::path::absolute(root).map_err(|e| PipelineError::Discovery {
        path: root.to_path_buf(),
        source: e,
    })
}

/// Immediate children of `dir` as (name, path, is_dir), unreadable entries skipped
fn list_children(dir: &Path) -> Result<Vec<(String, PathBuf, bool)>> {
    let mut children = Vec::new();
    let walker = WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(true);

    for entry in walker.into_iter() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) if e.depth() == 0 => {
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory walk failed"));
                return Err(PipelineError::Discovery {
                    path: dir.to_path_buf(),
                    source,
                });
            }
            Err(e) => {
                warn!("Error reading directory entry: {}", e);
                continue;
            }
        };

        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            debug!("Skipping non UTF-8 entry: {}", entry.path().display());
            continue;
        };
        let is_dir = entry.file_type().is_dir();
        children.push((name, entry.into_path(), is_dir));
    }

    children.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(children)
}

/// Group the camera's hour directories by calendar date.
///
/// Every `YYYYMMDDHH` directory directly under `root` contributes its `*.mp4` files; groups come
/// back in ascending date order and files within a group in ascending name order. A group whose
/// hour directories hold no segments is still returned, with no files.
pub fn discover_date_groups(root: &Path) -> Result<Vec<DateGroup>> {
    let root = absolute_root(root)?;
    info!("Scanning camera directory: {}", root.display());

    let mut by_date: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    let mut ignored = 0usize;

    for (name, path, is_dir) in list_children(&root)? {
        if is_dir && NamePattern::HourDirectory.matches(&name) {
            by_date.entry(name[..8].to_string()).or_default().push(path);
        } else {
            ignored += 1;
        }
    }
    if ignored > 0 {
        debug!("Ignored {} entries not matching {}", ignored, NamePattern::HourDirectory.describe());
    }

    let mut groups = Vec::with_capacity(by_date.len());
    for (date, hours) in by_date {
        let mut files: Vec<SourceFile> = hours.iter().flat_map(|hour| hour_segments(hour)).collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));

        debug!("Date {}: {} hour directories, {} segments", date, hours.len(), files.len());
        groups.push(DateGroup { date, hours, files });
    }

    info!("Found {} dates under {}", groups.len(), root.display());
    Ok(groups)
}

/// `*.mp4` segments of one hour directory; an unreadable directory contributes none
fn hour_segments(hour: &Path) -> Vec<SourceFile> {
    match list_children(hour) {
        Ok(children) => children
            .into_iter()
            .filter(|(name, _, is_dir)| !is_dir && name.ends_with(".mp4"))
            .map(|(_, path, _)| SourceFile::from_path(path))
            .collect(),
        Err(e) => {
            warn!("Skipping unreadable hour directory {}: {}", hour.display(), e);
            Vec::new()
        }
    }
}

/// Files directly under `root` whose names match `pattern`, in ascending name order
pub fn discover_files(root: &Path, pattern: NamePattern) -> Result<Vec<SourceFile>> {
    let root = absolute_root(root)?;

    let files: Vec<SourceFile> = list_children(&root)?
        .into_iter()
        .filter(|(name, _, is_dir)| !is_dir && pattern.matches(name))
        .map(|(_, path, _)| SourceFile::from_path(path))
        .collect();

    info!("Found {} files matching {} in {}", files.len(), pattern.describe(), root.display());
    Ok(files)
}

/// Output name for accelerating `daily`: `<stem>_Accelerate.mp4`
pub fn accelerated_name(daily: &SourceFile) -> String {
    format!("{}{}.{}", daily.key, ACCELERATED_SUFFIX, SEGMENT_EXTENSION)
}

/// Stem of the combined output: `<first-stem>_To_<last-stem>`
pub fn merged_range_key(first: &SourceFile, last: &SourceFile) -> String {
    format!("{}_To_{}", first.key, last.key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use proptest::prelude::*;

    fn touch(path: &Path, bytes: usize) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, vec![0u8; bytes]).unwrap();
    }

    fn source(key: &str) -> SourceFile {
        SourceFile {
            path: PathBuf::from(format!("/out/{key}.mp4")),
            key: key.to_string(),
            bytes: 0,
        }
    }

    #[test]
    fn test_patterns_are_anchored() {
        assert!(NamePattern::HourDirectory.matches("2024010108"));
        assert!(!NamePattern::HourDirectory.matches("202401010"));
        assert!(!NamePattern::HourDirectory.matches("20240101080"));
        assert!(!NamePattern::HourDirectory.matches("x2024010108"));

        assert!(NamePattern::DailyMerged.matches("20240101.mp4"));
        assert!(!NamePattern::DailyMerged.matches("20240101.MP4"));
        assert!(!NamePattern::DailyMerged.matches("20240101_Accelerate.mp4"));
        assert!(!NamePattern::DailyMerged.matches("20240101.mp4.part"));

        assert!(NamePattern::Accelerated.matches("20240101_Accelerate.mp4"));
        assert!(!NamePattern::Accelerated.matches("20240101_accelerate.mp4"));
        assert!(!NamePattern::Accelerated.matches("20240101_Accelerate_To_20240102_Accelerate.mp4"));
    }

    #[test]
    fn test_date_groups_collect_hours_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("2024010209/00M00S.mp4"), 3);
        touch(&root.join("2024010108/10M00S.mp4"), 5);
        touch(&root.join("2024010108/00M00S.mp4"), 7);
        touch(&root.join("2024010109/00M00S.mp4"), 11);
        touch(&root.join("2024010109/notes.txt"), 1);
        touch(&root.join("misc/00M00S.mp4"), 1);
        touch(&root.join("2024010110.mp4"), 1);
        fs::create_dir_all(root.join("2024010300")).unwrap();

        let groups = discover_date_groups(root).unwrap();
        let dates: Vec<&str> = groups.iter().map(|g| g.date.as_str()).collect();
        assert_eq!(dates, vec!["20240101", "20240102", "20240103"]);

        let first = &groups[0];
        assert_eq!(first.hours.len(), 2);
        let names: Vec<String> = first
            .files
            .iter()
            .map(|f| f.path.strip_prefix(root).unwrap().display().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["2024010108/00M00S.mp4", "2024010108/10M00S.mp4", "2024010109/00M00S.mp4"]
        );
        assert_eq!(first.total_bytes(), 23);
        assert!(first.files.iter().all(|f| f.path.is_absolute()));
        assert_eq!(first.files[0].key, "00M00S");

        assert_eq!(groups[1].files.len(), 1);
        assert!(groups[2].files.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_hour_directory_is_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        assert!(hour_segments(&dir.path().join("2024010108")).is_empty());

        touch(&dir.path().join("2024010108/00M00S.mp4"), 1);
        touch(&dir.path().join("2024010109/00M00S.mp4"), 1);
        let locked = dir.path().join("2024010109");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        let still_readable = fs::read_dir(&locked).is_ok();

        let result = discover_date_groups(dir.path());
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        let groups = result.unwrap();
        assert_eq!(groups.len(), 1);
        // Privileged users can read the locked directory anyway
        let expected = if still_readable { 2 } else { 1 };
        assert_eq!(groups[0].files.len(), expected);
    }

    #[test]
    fn test_no_hour_directories_is_empty_not_error() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("readme.txt"), 1);
        assert!(discover_date_groups(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_missing_root_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = discover_files(&dir.path().join("missing"), NamePattern::DailyMerged);
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn test_flat_discovery_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("20240103.mp4"), 1);
        touch(&root.join("20240101.mp4"), 1);
        touch(&root.join("20240101_Accelerate.mp4"), 1);
        touch(&root.join("20240102_Accelerate.mp4"), 1);
        touch(&root.join("20240101_filelist.txt"), 1);
        fs::create_dir_all(root.join("20240102.mp4")).unwrap();

        let daily = discover_files(root, NamePattern::DailyMerged).unwrap();
        let keys: Vec<&str> = daily.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, vec!["20240101", "20240103"]);

        let accelerated = discover_files(root, NamePattern::Accelerated).unwrap();
        let keys: Vec<&str> = accelerated.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, vec!["20240101_Accelerate", "20240102_Accelerate"]);
    }

    #[test]
    fn test_output_names() {
        assert_eq!(accelerated_name(&source("20240101")), "20240101_Accelerate.mp4");
        assert_eq!(
            merged_range_key(&source("20240101_Accelerate"), &source("20240102_Accelerate")),
            "20240101_Accelerate_To_20240102_Accelerate"
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(30))]

        /// Hour directories are partitioned exactly by their first eight characters, with no
        /// segment leaking into another date, and dates come back ascending.
        #[test]
        fn test_grouping_partitions_by_date(
            hours in prop::collection::btree_set((1u32..=3, 1u32..=28, 0u32..24), 1..12),
        ) {
            let dir = tempfile::tempdir().unwrap();
            for (month, day, hour) in &hours {
                let name = format!("2024{:02}{:02}{:02}", month, day, hour);
                touch(&dir.path().join(&name).join(format!("{name}.mp4")), 1);
            }

            let groups = discover_date_groups(dir.path()).unwrap();

            let dates: Vec<String> = groups.iter().map(|g| g.date.clone()).collect();
            let mut sorted = dates.clone();
            sorted.sort();
            sorted.dedup();
            prop_assert_eq!(&dates, &sorted);

            let total: usize = groups.iter().map(|g| g.files.len()).sum();
            prop_assert_eq!(total, hours.len());

            for group in &groups {
                for file in &group.files {
                    prop_assert!(file.key.starts_with(&group.date));
                }
                let keys: Vec<&String> = group.files.iter().map(|f| &f.key).collect();
                let mut ordered = keys.clone();
                ordered.sort();
                prop_assert_eq!(keys, ordered);
            }
        }
    }
}
