//! Copy specification models, callback hooks and error types.

use std::error::Error as StdError;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::report::ReportCopy;

////////////////////////////////////////////////////////////////////////////////
// #region EnumsInit

/// Symlink handling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnumCopySymlinkStrategy {
    /// Follow the link and copy the target bytes/entries.
    #[default]
    Dereference,
    /// Create a symbolic link at destination (do not copy target bytes).
    CopySymlinks,
}

impl EnumCopySymlinkStrategy {
    /// Whether attribute and metadata calls should follow symlinks.
    pub fn follows_links(self) -> bool {
        self == Self::Dereference
    }
}

/// Which extended-attribute namespaces to copy for regular files.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EnumCopyXattrPolicy {
    /// Do not copy extended attributes.
    #[default]
    Disabled,
    /// Copy every namespace known to the attribute service.
    AllNamespaces,
    /// Copy only the named namespaces, in the given order.
    Namespaces(Vec<String>),
}

/// Pattern matching mode for exclusion entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnumCopyPatternMode {
    /// Exact basename match.
    #[default]
    Literal,
    /// Shell-like wildcards (`*`, `?`, character classes).
    Glob,
    /// Regular expression pattern.
    Regex,
}

/// Decision returned by a bad-entry handler that did not abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnumBadEntryVerdict {
    /// Skip the entry silently.
    #[default]
    Skip,
    /// Keep going, but record an `UnsupportedFileType` failure for the entry.
    Report,
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region OptionsAndHooks

/// Input options for `copy_tree`.
#[derive(Debug, Clone, Default)]
pub struct SpecCopyOptions {
    /// Names (or patterns, see `rule_pattern`) skipped at every directory level.
    pub patterns_exclude: Option<Vec<String>>,
    /// Interpretation of `patterns_exclude`.
    pub rule_pattern: EnumCopyPatternMode,
    /// Symlink handling behavior.
    pub rule_symlink: EnumCopySymlinkStrategy,
    /// Extended attribute namespaces to copy.
    pub rule_xattr: EnumCopyXattrPolicy,
    /// Also copy timestamps onto preserved symlinks themselves.
    pub if_copy_symlink_metadata: bool,
}

/// Raised by a callback to abort the whole traversal.
///
/// The wrapped error is carried out of `copy_tree` untouched, so a binding
/// layer can downcast and re-raise its own exception type.
#[derive(Debug, Error)]
#[error("copy aborted by callback: {source}")]
pub struct CallbackAbort {
    source: Box<dyn StdError + Send + Sync + 'static>,
}

impl CallbackAbort {
    pub fn new<E>(error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self {
            source: error.into(),
        }
    }

    pub fn into_inner(self) -> Box<dyn StdError + Send + Sync + 'static> {
        self.source
    }
}

/// Called once per regular file, before its content is transferred.
pub type FnCopyProgress<'a> = Box<dyn Fn(&Path, &Path) -> Result<(), CallbackAbort> + 'a>;
/// `(owner, namespace, name)`; `false` skips that one attribute.
pub type FnXattrFilter<'a> =
    Box<dyn Fn(&Path, &str, &OsStr) -> Result<bool, CallbackAbort> + 'a>;
/// `(owner, namespace, name, error)`; `true` suppresses the error.
///
/// `name` is `None` when listing the namespace failed.
pub type FnXattrError<'a> = Box<
    dyn Fn(&Path, &str, Option<&OsStr>, &io::Error) -> Result<bool, CallbackAbort> + 'a,
>;
/// Receives every entry-level failure as it is discovered.
pub type FnCopyError<'a> = Box<dyn Fn(&SpecCopyError) -> Result<(), CallbackAbort> + 'a>;
/// Receives the path of an entry that is neither file, directory nor symlink.
pub type FnBadEntry<'a> = Box<dyn Fn(&Path) -> Result<EnumBadEntryVerdict, CallbackAbort> + 'a>;

/// Optional caller callbacks. Every field defaults to "no callback".
#[derive(Default)]
pub struct SpecCopyHooks<'a> {
    pub fn_progress: Option<FnCopyProgress<'a>>,
    pub fn_xattr_filter: Option<FnXattrFilter<'a>>,
    pub fn_xattr_error: Option<FnXattrError<'a>>,
    /// When set, failures go here and `copy_tree` does not return `Partial`.
    pub fn_error: Option<FnCopyError<'a>>,
    pub fn_bad_entry: Option<FnBadEntry<'a>>,
}

impl fmt::Debug for SpecCopyHooks<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpecCopyHooks")
            .field("fn_progress", &self.fn_progress.is_some())
            .field("fn_xattr_filter", &self.fn_xattr_filter.is_some())
            .field("fn_xattr_error", &self.fn_xattr_error.is_some())
            .field("fn_error", &self.fn_error.is_some())
            .field("fn_bad_entry", &self.fn_bad_entry.is_some())
            .finish()
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region StructsAndErrors

/// Why one entry failed to copy.
#[derive(Debug, Error)]
pub enum EnumCopyFailure {
    /// Entry is not a regular file, directory or symlink.
    #[error("unsupported file type: {path:?}")]
    UnsupportedFileType { path: PathBuf },
    /// Open/read/write/seek/truncate/link failure while transferring the entry.
    #[error("failed to {op}: {source}")]
    ContentIo {
        op: &'static str,
        source: io::Error,
    },
    #[error("failed to list extended attributes in namespace `{namespace}`: {source}")]
    AttributeList { namespace: String, source: io::Error },
    #[error("failed to read extended attribute {name:?} in namespace `{namespace}`: {source}")]
    AttributeGet {
        namespace: String,
        name: OsString,
        source: io::Error,
    },
    #[error("failed to write extended attribute {name:?} in namespace `{namespace}`: {source}")]
    AttributeSet {
        namespace: String,
        name: OsString,
        source: io::Error,
    },
    /// Timestamps or mode bits could not be copied.
    #[error("failed to copy metadata: {source}")]
    MetadataPropagation { source: io::Error },
}

impl EnumCopyFailure {
    /// OS error number of the underlying failure, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::UnsupportedFileType { .. } => Some(libc::EPERM),
            Self::ContentIo { source, .. }
            | Self::AttributeList { source, .. }
            | Self::AttributeGet { source, .. }
            | Self::AttributeSet { source, .. }
            | Self::MetadataPropagation { source } => source.raw_os_error(),
        }
    }
}

/// One copy failure: `(source, destination, reason)`.
#[derive(Debug)]
pub struct SpecCopyError {
    pub path_src: PathBuf,
    pub path_dst: PathBuf,
    pub failure: EnumCopyFailure,
}

impl fmt::Display for SpecCopyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}: {}",
            self.path_src.display(),
            self.path_dst.display(),
            self.failure
        )
    }
}

/// Top-level `copy_tree` failure.
#[derive(Debug, Error)]
pub enum CopyTreeError {
    /// The traversal finished but some entries failed.
    #[error("{} entries failed during tree copy", .errors.len())]
    Partial {
        errors: Vec<SpecCopyError>,
        report: ReportCopy,
    },
    /// Unsupported entry met with no bad-entry handler installed.
    #[error("unsupported file type: {path:?}")]
    UnsupportedFileType { path: PathBuf },
    /// A caller callback aborted the traversal.
    #[error(transparent)]
    Callback(#[from] CallbackAbort),
    /// The source root could not be inspected.
    #[error("failed to inspect source {path:?}: {source}")]
    InspectSource { path: PathBuf, source: io::Error },
    #[error("unknown extended attribute namespace `{0}`")]
    UnknownXattrNamespace(String),
    /// Invalid exclusion pattern.
    #[error("{0}")]
    InvalidPattern(String),
}

impl CopyTreeError {
    /// Per-entry failures carried by a `Partial` error; empty otherwise.
    pub fn entry_errors(&self) -> &[SpecCopyError] {
        match self {
            Self::Partial { errors, .. } => errors,
            _ => &[],
        }
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
