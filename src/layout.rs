//! On-disk artifact layout for a job.
//!
//! ```text
//! <job.logdir>/
//!   sysinfo/{pre,post,profile}/<safe_name>
//!   test-results/<task_fs_name>/
//!     debug.log
//!     stdout
//!     stderr
//!     whiteboard
//!     <relative file paths written via type=file>
//! ```
//!
//! All names derived from runner-controlled input go through
//! [`string_to_safe_path`] or [`safe_relative_path`] before touching the
//! filesystem.

use std::path::{Component, Path, PathBuf};

use crate::identifier::{IdentifierError, TestId};

/// Maximum length, in bytes, of a single path component.
pub const FS_NAME_MAX: usize = 255;

/// Characters that are not allowed on FAT and/or ext filesystems.
pub const FS_UNSAFE_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*', ';'];

pub const TEST_RESULTS_DIR: &str = "test-results";
pub const SYSINFO_DIR: &str = "sysinfo";
pub const DEBUG_LOG: &str = "debug.log";
pub const STDOUT_FILE: &str = "stdout";
pub const STDERR_FILE: &str = "stderr";
pub const WHITEBOARD_FILE: &str = "whiteboard";
pub const RESULTS_JSON: &str = "results.json";
pub const RESULTS_XML: &str = "results.xml";

/// Result type for layout operations.
pub type LayoutResult<T> = Result<T, LayoutError>;

/// Errors raised when a path would leave its sandbox or cannot be named.
#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    #[error("path '{0}' contains a '..' component")]
    Traversal(String),

    #[error("path is empty")]
    EmptyPath,

    #[error("path component '{0}' exceeds 255 bytes")]
    ComponentTooLong(String),

    #[error("path '{0}' contains a NUL byte")]
    InvalidChar(String),

    #[error("refusing to write through symlink {}", .0.display())]
    SymlinkedParent(PathBuf),

    #[error(transparent)]
    Identifier(#[from] IdentifierError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Replaces every filesystem-unsafe or control character with `_`.
pub fn replace_unsafe_chars(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if FS_UNSAFE_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// Truncates `input` to at most `max_bytes`, never splitting a character.
pub fn truncate_to_bytes(input: &str, max_bytes: usize) -> &str {
    if input.len() <= max_bytes {
        return input;
    }
    let mut end = max_bytes;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    &input[..end]
}

/// Converts an arbitrary string into a boring, safe file name.
///
/// Unsafe characters become `_`, a leading `.` becomes `_` so the result is
/// never hidden (nor `.`/`..`), and the result is clamped to
/// [`FS_NAME_MAX`] bytes.
pub fn string_to_safe_path(input: &str) -> String {
    let mut safe = replace_unsafe_chars(input);
    if safe.starts_with('.') {
        safe.replace_range(..1, "_");
    }
    if safe.is_empty() {
        safe.push('_');
    }
    truncate_to_bytes(&safe, FS_NAME_MAX).to_string()
}

/// Resolves a runner-supplied relative path under `base`.
///
/// Leading slashes are treated as relative, `.` components are dropped, and
/// `..` components are rejected. Existing symlinks anywhere between `base`
/// and the target are rejected as well, so the returned path can never
/// point outside `base`.
pub fn safe_relative_path(base: &Path, relative: &str) -> LayoutResult<PathBuf> {
    if relative.contains('\0') {
        return Err(LayoutError::InvalidChar(relative.to_string()));
    }

    let mut target = base.to_path_buf();
    let mut depth = 0;
    for component in Path::new(relative.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => {
                if part.len() > FS_NAME_MAX {
                    return Err(LayoutError::ComponentTooLong(
                        part.to_string_lossy().into_owned(),
                    ));
                }
                target.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => return Err(LayoutError::Traversal(relative.to_string())),
            Component::RootDir | Component::Prefix(_) => {}
        }
    }
    if depth == 0 {
        return Err(LayoutError::EmptyPath);
    }

    reject_symlinks(base, &target)?;
    Ok(target)
}

/// Fails if any existing entry from `base` (exclusive) to `target`
/// (inclusive) is a symlink.
fn reject_symlinks(base: &Path, target: &Path) -> LayoutResult<()> {
    let Ok(relative) = target.strip_prefix(base) else {
        return Err(LayoutError::Traversal(target.display().to_string()));
    };
    let mut current = base.to_path_buf();
    for component in relative.components() {
        current.push(component);
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(LayoutError::SymlinkedParent(current));
            }
            Ok(_) => {}
            // Nothing below a missing entry can exist yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// The `pre`, `post` and `profile` directories of one sysinfo run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysInfoDirs {
    pub basedir: PathBuf,
    pub pre_dir: PathBuf,
    pub post_dir: PathBuf,
    pub profile_dir: PathBuf,
}

impl SysInfoDirs {
    pub fn new(basedir: impl Into<PathBuf>) -> Self {
        let basedir = basedir.into();
        Self {
            pre_dir: basedir.join("pre"),
            post_dir: basedir.join("post"),
            profile_dir: basedir.join("profile"),
            basedir,
        }
    }

    /// Creates all directories of the set.
    pub async fn create(&self) -> std::io::Result<()> {
        for dir in [&self.pre_dir, &self.post_dir, &self.profile_dir] {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }
}

/// Directory conventions rooted at a job's log directory.
#[derive(Debug, Clone)]
pub struct JobLayout {
    logdir: PathBuf,
}

impl JobLayout {
    pub fn new(logdir: impl Into<PathBuf>) -> Self {
        Self {
            logdir: logdir.into(),
        }
    }

    pub fn logdir(&self) -> &Path {
        &self.logdir
    }

    pub fn test_results_path(&self) -> PathBuf {
        self.logdir.join(TEST_RESULTS_DIR)
    }

    /// Job-scope sysinfo directories.
    pub fn sysinfo_dirs(&self) -> SysInfoDirs {
        SysInfoDirs::new(self.logdir.join(SYSINFO_DIR))
    }

    /// Directory holding the artifacts of the task identified by `id`.
    pub fn task_path(&self, id: &TestId) -> LayoutResult<PathBuf> {
        Ok(self.test_results_path().join(id.filesystem_name()?))
    }

    /// Creates the job root and its `test-results` directory.
    pub async fn create(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.test_results_path()).await
    }
}

/// Per-test sysinfo directories live inside the task directory.
pub fn task_sysinfo_dirs(task_path: &Path) -> SysInfoDirs {
    SysInfoDirs::new(task_path.join(SYSINFO_DIR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_safe_path_replaces_unsafe_chars() {
        assert_eq!(string_to_safe_path("cat /proc/cpuinfo"), "cat _proc_cpuinfo");
        assert_eq!(string_to_safe_path("a<b>c:d\"e|f?g*h;i"), "a_b_c_d_e_f_g_h_i");
    }

    #[test]
    fn test_safe_path_unhides_and_clamps() {
        assert_eq!(string_to_safe_path(".bashrc"), "_bashrc");
        assert_eq!(string_to_safe_path(".."), "_.");
        assert_eq!(string_to_safe_path(&"x".repeat(300)).len(), FS_NAME_MAX);
        assert_eq!(string_to_safe_path(""), "_");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_to_bytes("héllo", 2), "h");
        assert_eq!(truncate_to_bytes("héllo", 3), "hé");
        assert_eq!(truncate_to_bytes("abc", 10), "abc");
    }

    #[test]
    fn test_relative_path_stays_under_base() {
        let dir = TempDir::new().unwrap();
        let path = safe_relative_path(dir.path(), "data/output.txt").unwrap();
        assert_eq!(path, dir.path().join("data").join("output.txt"));

        let path = safe_relative_path(dir.path(), "/abs/./file").unwrap();
        assert_eq!(path, dir.path().join("abs").join("file"));
    }

    #[test]
    fn test_relative_path_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let err = safe_relative_path(dir.path(), "../../etc/shadow").unwrap_err();
        assert!(matches!(err, LayoutError::Traversal(_)));

        let err = safe_relative_path(dir.path(), "a/../../b").unwrap_err();
        assert!(matches!(err, LayoutError::Traversal(_)));
    }

    #[test]
    fn test_relative_path_rejects_empty() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            safe_relative_path(dir.path(), "/"),
            Err(LayoutError::EmptyPath)
        ));
        assert!(matches!(
            safe_relative_path(dir.path(), "./."),
            Err(LayoutError::EmptyPath)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_relative_path_rejects_symlinked_parent() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let err = safe_relative_path(dir.path(), "link/file").unwrap_err();
        assert!(matches!(err, LayoutError::SymlinkedParent(_)));
    }

    #[test]
    fn test_job_layout_paths() {
        let layout = JobLayout::new("/tmp/job");
        let id = TestId::new(1, "a/b");
        assert_eq!(
            layout.task_path(&id).unwrap(),
            PathBuf::from("/tmp/job/test-results/1-a_b")
        );
        let dirs = layout.sysinfo_dirs();
        assert_eq!(dirs.pre_dir, PathBuf::from("/tmp/job/sysinfo/pre"));
        assert_eq!(dirs.post_dir, PathBuf::from("/tmp/job/sysinfo/post"));
        assert_eq!(dirs.profile_dir, PathBuf::from("/tmp/job/sysinfo/profile"));
    }
}
