//! File operations dispatched as remote shell commands
//!
//! There is no persistent remote agent: every operation below is a
//! freshly quoted POSIX command string, run the same way a regular
//! [`crate::exec::ExecRequest`] would be, over whatever connection the
//! caller's Runtime already holds.

use crate::error::FilesystemError;
use crate::exec::posix_quote;
use std::time::SystemTime;

/// A file or directory kind, as reported by `stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// A regular file
    Regular,
    /// A directory
    Directory,
    /// A symlink (only seen via operations that don't follow links)
    Symlink,
    /// Anything else (device node, socket, fifo, ...)
    Other,
}

/// A `stat` snapshot
#[derive(Debug, Clone)]
pub struct FileStat {
    /// Size in bytes
    pub size: u64,
    /// Last-modified time
    pub mod_time: SystemTime,
    /// POSIX permission bits (e.g. `0o644`)
    pub mode: u32,
    /// The entry's kind
    pub kind: FileKind,
}

/// One entry returned by [`list_command`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name (not a full path)
    pub name: String,
    /// The entry's kind
    pub kind: FileKind,
}

/// Marker embedded between `stat -c` fields so the single-line output
/// can be split unambiguously even if a filename (not the field we
/// parse here) contained odd characters.
const STAT_FORMAT: &str = "%s|%Y|%f|%F";

/// Build the command that reads a file's entire contents to stdout
pub fn read_command(path: &str) -> String {
    format!("cat -- {}", posix_quote(path))
}

/// Build the shell script implementing the atomic write algorithm:
/// resolve symlinks, preserve the existing mode (or default to 0644),
/// write to a sibling temp file, chmod, then rename — with
/// best-effort temp-file cleanup on any failure after the temp
/// file is created.
pub fn atomic_write_command(path: &str, unique_suffix: &str) -> String {
    let path = posix_quote(path);
    let suffix = posix_quote(unique_suffix);
    format!(
        "real=$(readlink -f -- {path} 2>/dev/null || printf '%s' {path}); \
         if [ -e \"$real\" ]; then mode=$(stat -c '%a' -- \"$real\" 2>/dev/null || echo 644); else mode=644; fi; \
         dir=$(dirname -- \"$real\"); base=$(basename -- \"$real\"); \
         tmp=\"$dir/$base.tmp.{suffix}\"; \
         cat > \"$tmp\" && chmod \"$mode\" \"$tmp\" && mv -f -- \"$tmp\" \"$real\"; \
         status=$?; \
         if [ $status -ne 0 ]; then rm -f -- \"$tmp\"; fi; \
         exit $status"
    )
}

/// Build the command that stats a path, following symlinks
pub fn stat_command(path: &str) -> String {
    format!("stat -L -c '{STAT_FORMAT}' -- {}", posix_quote(path))
}

/// Parse one line of `stat -c '%s|%Y|%f|%F'` output into a [`FileStat`]
pub fn parse_stat_line(line: &str) -> Option<FileStat> {
    let mut parts = line.trim().splitn(4, '|');
    let size: u64 = parts.next()?.parse().ok()?;
    let mtime_secs: i64 = parts.next()?.parse().ok()?;
    let raw_mode = parts.next()?;
    let kind_str = parts.next()?;

    let mode = u32::from_str_radix(raw_mode, 16).ok()? & 0o7777;
    let kind = match kind_str {
        "regular file" | "regular empty file" => FileKind::Regular,
        "directory" => FileKind::Directory,
        "symbolic link" => FileKind::Symlink,
        _ => FileKind::Other,
    };
    let mod_time = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(mtime_secs.max(0) as u64);

    Some(FileStat {
        size,
        mod_time,
        mode,
        kind,
    })
}

/// Build the command that creates a directory
pub fn mkdir_command(path: &str, recursive: bool) -> String {
    if recursive {
        format!("mkdir -p -- {}", posix_quote(path))
    } else {
        format!("mkdir -- {}", posix_quote(path))
    }
}

/// Build the command that removes a file or directory tree
pub fn remove_command(path: &str, recursive: bool) -> String {
    if recursive {
        format!("rm -rf -- {}", posix_quote(path))
    } else {
        format!("rm -- {} 2>/dev/null || rmdir -- {}", posix_quote(path), posix_quote(path))
    }
}

/// Build the command that lists one directory's entries with their
/// kind, one `name\tkind` pair per line
pub fn list_command(path: &str) -> String {
    format!(
        "for e in {}/.* {}/*; do \
           [ -e \"$e\" ] || [ -L \"$e\" ] || continue; \
           n=$(basename -- \"$e\"); \
           [ \"$n\" = '.' ] && continue; [ \"$n\" = '..' ] && continue; \
           if [ -d \"$e\" ]; then k=directory; elif [ -L \"$e\" ]; then k=symlink; \
           elif [ -f \"$e\" ]; then k=regular; else k=other; fi; \
           printf '%s\\t%s\\n' \"$n\" \"$k\"; \
         done 2>/dev/null",
        posix_quote(path),
        posix_quote(path)
    )
}

/// Parse one `name\tkind` line from [`list_command`]'s output
pub fn parse_list_line(line: &str) -> Option<DirEntry> {
    let (name, kind) = line.rsplit_once('\t')?;
    let kind = match kind.trim() {
        "directory" => FileKind::Directory,
        "symlink" => FileKind::Symlink,
        "regular" => FileKind::Regular,
        _ => FileKind::Other,
    };
    Some(DirEntry {
        name: name.to_string(),
        kind,
    })
}

/// Classify a failed file-operation's stderr text into a
/// [`FilesystemError`]. Shell tools don't give structured errors, so
/// this is a best-effort text match on well-known GNU coreutils/BusyBox
/// phrasing rather than relying on structured exit codes.
pub fn classify_fs_error(path: &str, stderr: &str) -> FilesystemError {
    let lower = stderr.to_lowercase();
    if lower.contains("no such file or directory") {
        FilesystemError::NotFound(path.to_string())
    } else if lower.contains("permission denied") {
        FilesystemError::PermissionDenied(path.to_string())
    } else if lower.contains("file exists") {
        FilesystemError::Exists(path.to_string())
    } else if lower.contains("no space left on device") {
        FilesystemError::NoSpace(path.to_string())
    } else if lower.contains("is a directory") {
        FilesystemError::IsADirectory(path.to_string())
    } else if lower.contains("not a directory") {
        FilesystemError::NotADirectory(path.to_string())
    } else {
        FilesystemError::NotFound(path.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_command_quotes_path() {
        assert_eq!(read_command("a b"), "cat -- 'a b'");
    }

    #[test]
    fn mkdir_recursive_uses_dash_p() {
        assert!(mkdir_command("/a/b", true).contains("-p"));
        assert!(!mkdir_command("/a/b", false).contains("-p"));
    }

    #[test]
    fn atomic_write_command_includes_rename_and_cleanup() {
        let cmd = atomic_write_command("/etc/foo", "abc123");
        assert!(cmd.contains("mv -f"));
        assert!(cmd.contains("chmod"));
        assert!(cmd.contains("rm -f"));
        assert!(cmd.contains(".tmp.'abc123'"));
    }

    #[test]
    fn parse_stat_line_parses_regular_file() {
        let stat = parse_stat_line("1024|1700000000|81a4|regular file").unwrap();
        assert_eq!(stat.size, 1024);
        assert_eq!(stat.mode, 0o644);
        assert_eq!(stat.kind, FileKind::Regular);
    }

    #[test]
    fn parse_stat_line_parses_directory() {
        let stat = parse_stat_line("4096|1700000000|41ed|directory").unwrap();
        assert_eq!(stat.mode, 0o755);
        assert_eq!(stat.kind, FileKind::Directory);
    }

    #[test]
    fn parse_stat_line_rejects_malformed_input() {
        assert!(parse_stat_line("not-a-stat-line").is_none());
    }

    #[test]
    fn parse_list_line_splits_name_and_kind() {
        let entry = parse_list_line("notes.txt\tregular").unwrap();
        assert_eq!(entry.name, "notes.txt");
        assert_eq!(entry.kind, FileKind::Regular);
    }

    #[test]
    fn list_command_skips_unmatched_glob_literals() {
        // On an empty directory neither `.*` nor `*` expands, so the
        // loop body must guard on existence before classifying `$e` —
        // otherwise the literal glob pattern itself gets reported as a
        // bogus `other`-kind entry.
        let cmd = list_command("/empty");
        assert!(cmd.contains("[ -e \"$e\" ] || [ -L \"$e\" ] || continue"));
    }

    #[test]
    fn classify_fs_error_matches_known_phrases() {
        assert!(matches!(
            classify_fs_error("/x", "cat: /x: No such file or directory"),
            FilesystemError::NotFound(_)
        ));
        assert!(matches!(
            classify_fs_error("/x", "mkdir: /x: Permission denied"),
            FilesystemError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_fs_error("/x", "mkdir: /x: File exists"),
            FilesystemError::Exists(_)
        ));
    }
}
