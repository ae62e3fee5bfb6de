use std::ffi::{OsStr, OsString};
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use globset::{Glob, GlobMatcher};
use regex::bytes::Regex;
use tracing::debug;
use walkdir::WalkDir;

use crate::spec::{CopyTreeError, EnumCopyPatternMode};

////////////////////////////////////////////////////////////////////////////////
// #region PatternMatching

#[derive(Debug, Clone)]
pub(crate) enum TypeCopyPatternSeq {
    Literal(Vec<OsString>),
    Glob(Vec<GlobMatcher>),
    Regex(Vec<Regex>),
}

/// Compiled exclusion list, matched against entry basenames.
#[derive(Debug, Clone, Default)]
pub(crate) struct SpecCopyExclusion {
    patterns: Option<TypeCopyPatternSeq>,
}

impl SpecCopyExclusion {
    pub(crate) fn from_raw(
        patterns_exclude: Option<&[String]>,
        rule_pattern: EnumCopyPatternMode,
    ) -> Result<Self, CopyTreeError> {
        Ok(Self {
            patterns: _compile(patterns_exclude, rule_pattern)?,
        })
    }

    /// Names are compared as raw bytes; non-UTF-8 names are never mangled.
    pub(crate) fn is_excluded(&self, name: &OsStr) -> bool {
        match &self.patterns {
            None => false,
            Some(TypeCopyPatternSeq::Literal(v)) => v.iter().any(|p| p == name),
            Some(TypeCopyPatternSeq::Glob(v)) => v.iter().any(|p| p.is_match(Path::new(name))),
            Some(TypeCopyPatternSeq::Regex(v)) => v.iter().any(|p| p.is_match(name.as_bytes())),
        }
    }
}

fn _compile(
    patterns: Option<&[String]>,
    rule_pattern: EnumCopyPatternMode,
) -> Result<Option<TypeCopyPatternSeq>, CopyTreeError> {
    let Some(patterns) = patterns else {
        return Ok(None);
    };
    if patterns.is_empty() {
        return Ok(None);
    }

    match rule_pattern {
        EnumCopyPatternMode::Literal => Ok(Some(TypeCopyPatternSeq::Literal(
            patterns.iter().map(OsString::from).collect(),
        ))),
        EnumCopyPatternMode::Glob => {
            let mut l_glob = Vec::with_capacity(patterns.len());
            for pattern in patterns {
                let matcher = Glob::new(pattern)
                    .map_err(|e| {
                        CopyTreeError::InvalidPattern(format!("Invalid exclude pattern: {e}"))
                    })?
                    .compile_matcher();
                l_glob.push(matcher);
            }
            Ok(Some(TypeCopyPatternSeq::Glob(l_glob)))
        }
        EnumCopyPatternMode::Regex => {
            let mut l_regex = Vec::with_capacity(patterns.len());
            for pattern in patterns {
                let regex = Regex::new(pattern).map_err(|e| {
                    CopyTreeError::InvalidPattern(format!("Invalid exclude pattern: {e}"))
                })?;
                l_regex.push(regex);
            }
            Ok(Some(TypeCopyPatternSeq::Regex(l_regex)))
        }
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region FilesystemHelpers

/// Recreate the symlink at `path_src` as `path_dst`, same target text.
pub(crate) fn create_symbolic_link(path_src: &Path, path_dst: &Path) -> io::Result<()> {
    let target = fs::read_link(path_src)?;
    std::os::unix::fs::symlink(&target, path_dst)
}

/// Copy permission bits and access/modification times.
///
/// With `if_follow == false` only the link's own timestamps are touched;
/// most platforms cannot change the mode of a symlink.
pub(crate) fn copy_stat(path_src: &Path, path_dst: &Path, if_follow: bool) -> io::Result<()> {
    use filetime::{FileTime, set_file_times, set_symlink_file_times};

    let stat_src = if if_follow {
        fs::metadata(path_src)?
    } else {
        fs::symlink_metadata(path_src)?
    };
    let file_time_access = FileTime::from_last_access_time(&stat_src);
    let file_time_modify = FileTime::from_last_modification_time(&stat_src);

    if !if_follow && stat_src.file_type().is_symlink() {
        return set_symlink_file_times(path_dst, file_time_access, file_time_modify);
    }
    fs::set_permissions(path_dst, stat_src.permissions())?;
    set_file_times(path_dst, file_time_access, file_time_modify)
}

/// Number of non-directory entries anywhere below `path_dir`.
///
/// Symlinks to directories are neither counted nor descended into.
/// Unreadable subtrees are skipped.
pub fn count_files<P: AsRef<Path>>(path_dir: P) -> u64 {
    let mut n_files = 0_u64;
    for entry_res in WalkDir::new(path_dir.as_ref()).min_depth(1) {
        let entry = match entry_res {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "skipping unreadable entry while counting");
                continue;
            }
        };
        let file_type = entry.file_type();
        if file_type.is_dir() || (file_type.is_symlink() && entry.path().is_dir()) {
            continue;
        }
        n_files += 1;
    }
    n_files
}

// #endregion
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::{PermissionsExt, symlink};

    use filetime::FileTime;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn literal_exclusion_is_exact() {
        let exclusion =
            SpecCopyExclusion::from_raw(Some(&["skip".to_string()]), EnumCopyPatternMode::Literal)
                .expect("compile");
        assert!(exclusion.is_excluded(OsStr::new("skip")));
        assert!(!exclusion.is_excluded(OsStr::new("skip.txt")));
        assert!(!exclusion.is_excluded(OsStr::new("noskip")));
    }

    #[test]
    fn glob_and_regex_exclusion() {
        let glob =
            SpecCopyExclusion::from_raw(Some(&["*.tmp".to_string()]), EnumCopyPatternMode::Glob)
                .expect("compile");
        assert!(glob.is_excluded(OsStr::new("a.tmp")));
        assert!(!glob.is_excluded(OsStr::new("a.txt")));

        let regex = SpecCopyExclusion::from_raw(
            Some(&[r"^\.snap\d+$".to_string()]),
            EnumCopyPatternMode::Regex,
        )
        .expect("compile");
        assert!(regex.is_excluded(OsStr::new(".snap01")));
        assert!(!regex.is_excluded(OsStr::new("snap01")));
    }

    #[test]
    fn exclusion_compares_raw_bytes() {
        let raw_name = OsStr::from_bytes(b"bad\xffname");
        let lossy_name = raw_name.to_string_lossy().to_string();

        let literal =
            SpecCopyExclusion::from_raw(Some(&[lossy_name]), EnumCopyPatternMode::Literal)
                .expect("compile");
        assert!(!literal.is_excluded(raw_name));

        let glob =
            SpecCopyExclusion::from_raw(Some(&["bad*".to_string()]), EnumCopyPatternMode::Glob)
                .expect("compile");
        assert!(glob.is_excluded(raw_name));

        let regex = SpecCopyExclusion::from_raw(
            Some(&[r"(?-u)^bad\xFFname$".to_string()]),
            EnumCopyPatternMode::Regex,
        )
        .expect("compile");
        assert!(regex.is_excluded(raw_name));
        assert!(!regex.is_excluded(OsStr::new("bad\u{fffd}name")));
    }

    #[test]
    fn empty_or_missing_exclusion_matches_nothing() {
        let none = SpecCopyExclusion::from_raw(None, EnumCopyPatternMode::Glob).expect("compile");
        assert!(!none.is_excluded(OsStr::new("anything")));
        let empty =
            SpecCopyExclusion::from_raw(Some(&[]), EnumCopyPatternMode::Regex).expect("compile");
        assert!(!empty.is_excluded(OsStr::new("anything")));
    }

    #[test]
    fn invalid_patterns_rejected() {
        let err = SpecCopyExclusion::from_raw(Some(&["[".to_string()]), EnumCopyPatternMode::Glob)
            .expect_err("bad glob");
        assert!(matches!(err, CopyTreeError::InvalidPattern(_)));
        let err = SpecCopyExclusion::from_raw(Some(&["(".to_string()]), EnumCopyPatternMode::Regex)
            .expect_err("bad regex");
        assert!(matches!(err, CopyTreeError::InvalidPattern(_)));
    }

    #[test]
    fn copy_stat_copies_mode_and_times() {
        let tmp = TempDir::new().expect("temp dir");
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        fs::write(&src, "a").expect("write src");
        fs::write(&dst, "b").expect("write dst");
        fs::set_permissions(&src, fs::Permissions::from_mode(0o640)).expect("chmod");
        filetime::set_file_times(
            &src,
            FileTime::from_unix_time(1_700_000_010, 0),
            FileTime::from_unix_time(1_700_000_020, 0),
        )
        .expect("set times");

        copy_stat(&src, &dst, true).expect("copy stat");

        let stat_dst = fs::metadata(&dst).expect("stat dst");
        assert_eq!(stat_dst.permissions().mode() & 0o777, 0o640);
        assert_eq!(
            FileTime::from_last_modification_time(&stat_dst),
            FileTime::from_unix_time(1_700_000_020, 0)
        );
    }

    #[test]
    fn copy_stat_on_symlink_touches_link_only() {
        let tmp = TempDir::new().expect("temp dir");
        let target = tmp.path().join("target");
        fs::write(&target, "t").expect("write target");
        let link_src = tmp.path().join("link_src");
        let link_dst = tmp.path().join("link_dst");
        symlink(&target, &link_src).expect("symlink src");
        symlink(&target, &link_dst).expect("symlink dst");
        filetime::set_symlink_file_times(
            &link_src,
            FileTime::from_unix_time(1_600_000_000, 0),
            FileTime::from_unix_time(1_600_000_000, 0),
        )
        .expect("set link times");
        let mtime_target = FileTime::from_last_modification_time(
            &fs::metadata(&target).expect("stat target"),
        );

        copy_stat(&link_src, &link_dst, false).expect("copy stat");

        let stat_link = fs::symlink_metadata(&link_dst).expect("lstat");
        assert_eq!(
            FileTime::from_last_modification_time(&stat_link),
            FileTime::from_unix_time(1_600_000_000, 0)
        );
        assert_eq!(
            FileTime::from_last_modification_time(&fs::metadata(&target).expect("stat target")),
            mtime_target
        );
    }

    #[test]
    fn create_symbolic_link_keeps_target_text() {
        let tmp = TempDir::new().expect("temp dir");
        let link_src = tmp.path().join("l1");
        let link_dst = tmp.path().join("l2");
        symlink("../relative/target", &link_src).expect("symlink");

        create_symbolic_link(&link_src, &link_dst).expect("copy link");
        assert_eq!(
            fs::read_link(&link_dst).expect("readlink"),
            Path::new("../relative/target")
        );
    }

    #[test]
    fn count_files_skips_directories_and_dir_links() {
        let tmp = TempDir::new().expect("temp dir");
        let root = tmp.path();
        fs::create_dir_all(root.join("a/b")).expect("mkdir");
        fs::write(root.join("top.txt"), "x").expect("write");
        fs::write(root.join("a/one.txt"), "x").expect("write");
        fs::write(root.join("a/b/two.txt"), "x").expect("write");
        symlink(root.join("a/one.txt"), root.join("file_link")).expect("symlink file");
        symlink(root.join("a"), root.join("dir_link")).expect("symlink dir");

        assert_eq!(count_files(root), 4);
        assert_eq!(count_files(root.join("missing")), 0);
    }
}
