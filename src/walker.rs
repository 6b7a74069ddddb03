//! Local directory traversal (C2, §4.2). Grounded in the teacher's
//! `fs/walker.rs`, generalized from substring excludes to glob matching and
//! from "throw on first error" to per-entry error collection.

use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use walkdir::{DirEntry, WalkDir};

#[derive(Debug, Clone)]
pub struct WalkOptions {
    pub include_hidden: bool,
    pub follow_symlinks: bool,
    pub max_depth: Option<usize>,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            include_hidden: false,
            follow_symlinks: false,
            max_depth: None,
            include_patterns: Vec::new(),
            exclude_patterns: vec![".git".into(), "node_modules".into(), ".DS_Store".into()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: PathBuf,
    pub relative_path: PathBuf,
    pub size: u64,
    pub mtime: i64,
    pub is_directory: bool,
    pub is_symlink: bool,
    pub depth: usize,
}

#[derive(Debug, Clone)]
pub struct WalkError {
    pub path: PathBuf,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct WalkResult {
    pub files: Vec<FileInfo>,
    pub errors: Vec<WalkError>,
    pub total_size: u64,
}

fn compile(patterns: &[String]) -> Vec<GlobMatcher> {
    patterns
        .iter()
        .filter_map(|p| {
            GlobBuilder::new(p)
                .case_insensitive(true)
                .build()
                .ok()
                .map(|g| g.compile_matcher())
        })
        .collect()
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

fn should_skip(entry: &DirEntry, includes: &[GlobMatcher], excludes: &[GlobMatcher], include_hidden: bool) -> bool {
    if !include_hidden && is_hidden(entry) && entry.depth() > 0 {
        return true;
    }
    let name = entry.file_name().to_string_lossy();
    if excludes.iter().any(|m| m.is_match(name.as_ref())) {
        return true;
    }
    if !includes.is_empty() && !includes.iter().any(|m| m.is_match(name.as_ref())) {
        return true;
    }
    false
}

fn file_info_from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<FileInfo>> {
    let raw_metadata = entry.metadata()?;
    let path = entry.path().to_path_buf();
    let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
    let is_symlink = raw_metadata.is_symlink();

    let (size, is_dir, mtime) = if is_symlink {
        match std::fs::metadata(&path) {
            Ok(resolved) => {
                if resolved.is_dir() {
                    return Ok(None);
                }
                (resolved.len(), false, mtime_secs(&resolved))
            }
            Err(_) => return Ok(None),
        }
    } else {
        (raw_metadata.len(), raw_metadata.is_dir(), mtime_secs(&raw_metadata))
    };

    Ok(Some(FileInfo {
        path,
        relative_path,
        size: if is_dir { 0 } else { size },
        mtime,
        is_directory: is_dir,
        is_symlink,
        depth: entry.depth(),
    }))
}

fn mtime_secs(meta: &std::fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    meta.mtime()
}

/// Walk a directory tree, collecting both files (size>0) and directories
/// (size=0), with per-entry failures pushed into `errors` rather than
/// aborting the whole walk.
pub fn walk(root: &Path, options: &WalkOptions) -> WalkResult {
    let includes = compile(&options.include_patterns);
    let excludes = compile(&options.exclude_patterns);

    let mut result = WalkResult::default();
    let mut walker = WalkDir::new(root).follow_links(options.follow_symlinks);
    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                result.errors.push(WalkError {
                    path: e.path().map(Path::to_path_buf).unwrap_or_default(),
                    message: e.to_string(),
                });
                continue;
            }
        };

        if entry.depth() == 0 {
            continue;
        }

        if should_skip(&entry, &includes, &excludes, options.include_hidden) {
            continue;
        }

        match file_info_from_entry(&entry, root) {
            Ok(Some(info)) => {
                result.total_size += info.size;
                result.files.push(info);
            }
            Ok(None) => {}
            Err(e) => result.errors.push(WalkError {
                path: entry.path().to_path_buf(),
                message: e.to_string(),
            }),
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn walk_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        let result = walk(temp_dir.path(), &WalkOptions::default());
        assert_eq!(result.files.len(), 0);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn walk_collects_files_and_dirs() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("subdir")).unwrap();
        fs::write(temp_dir.path().join("file1.txt"), b"content1").unwrap();
        fs::write(temp_dir.path().join("subdir/file2.txt"), b"content2").unwrap();

        let result = walk(temp_dir.path(), &WalkOptions::default());
        let dirs = result.files.iter().filter(|f| f.is_directory).count();
        let files = result.files.iter().filter(|f| !f.is_directory).count();
        assert_eq!(dirs, 1);
        assert_eq!(files, 2);
        assert_eq!(result.total_size, 16);
    }

    #[test]
    fn exclude_glob_patterns() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("keep.txt"), b"keep").unwrap();
        fs::write(temp_dir.path().join("skip.tmp"), b"skip").unwrap();

        let options = WalkOptions {
            exclude_patterns: vec!["*.tmp".into()],
            ..Default::default()
        };
        let result = walk(temp_dir.path(), &options);
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0].relative_path.to_str().unwrap(), "keep.txt");
    }

    #[test]
    fn hidden_entries_excluded_by_default() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(".hidden"), b"x").unwrap();
        fs::write(temp_dir.path().join("visible.txt"), b"x").unwrap();

        let result = walk(temp_dir.path(), &WalkOptions::default());
        assert_eq!(result.files.len(), 1);

        let options = WalkOptions { include_hidden: true, ..Default::default() };
        let result = walk(temp_dir.path(), &options);
        assert_eq!(result.files.len(), 2);
    }
}
