//! Directory traversal for volume archiving.
//!
//! The source tree is live: entries may disappear between being listed and
//! being read. Such entries are reported as vanished rather than failing the
//! walk.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// File-name substrings to skip (a skipped directory skips its subtree)
    pub exclude_patterns: Vec<String>,
}

/// Kind of entry discovered during walking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// An entry discovered during walking
#[derive(Debug, Clone)]
pub struct TreeEntry {
    /// Full path to the entry
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    pub kind: EntryKind,
}

impl TreeEntry {
    fn from_entry(entry: &DirEntry, root: &Path) -> Self {
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let file_type = entry.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };

        Self {
            path,
            relative_path,
            kind,
        }
    }
}

/// What the walker hands to the callback
#[derive(Debug)]
pub enum WalkEvent<'a> {
    Entry(&'a TreeEntry),
    /// Listed by the parent directory but gone before it could be read
    Vanished(PathBuf),
}

/// Walk a directory tree, calling `callback` for every entry below `root`
/// (the root itself is not reported). Parents are reported before children.
///
/// A callback error stops the walk and is returned.
pub fn walk_tree<F>(root: &Path, options: &WalkOptions, mut callback: F) -> std::io::Result<()>
where
    F: FnMut(WalkEvent<'_>) -> std::io::Result<()>,
{
    let walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !should_exclude(e, &options.exclude_patterns));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf);
                let err = std::io::Error::from(e);
                match (err.kind(), path) {
                    // A missing root is an error, not a vanished entry
                    (ErrorKind::NotFound, Some(path)) if path != root => {
                        callback(WalkEvent::Vanished(path))?;
                        continue;
                    }
                    _ => return Err(err),
                }
            }
        };

        let tree_entry = TreeEntry::from_entry(&entry, root);
        callback(WalkEvent::Entry(&tree_entry))?;
    }

    Ok(())
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    if entry.depth() == 0 {
        return false;
    }
    let file_name = entry.file_name().to_string_lossy();

    patterns.iter().any(|pattern| file_name.contains(pattern.as_str()))
}
