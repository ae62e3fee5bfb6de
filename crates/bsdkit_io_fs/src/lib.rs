//! `bsdkit_io_fs` v1:
//! Rust-side recursive tree copy with sparse files and extended attributes.
//!
//! Architecture mirrors Python `bsd.copy`:
//! - `copy`    : traversal and copy orchestration
//! - `sparse`  : hole-skipping content transfer
//! - `extattr` : extended attribute namespaces and propagation
//! - `spec`    : enums/options/hooks/errors
//! - `report`  : run-time report model and error aggregation
//! - `util`    : shared helper functions

pub mod copy;
pub mod extattr;
pub mod report;
pub mod sparse;
pub mod spec;
mod util;

pub use copy::{SpecCopyServices, copy_tree, copy_tree_with};
pub use extattr::{SpecXattrNamespace, SystemXattrService, XattrService, resolve_namespaces};
pub use report::{ErrorAggregator, ReportCopy, ReportCopyBuilder};
pub use sparse::{
    CHUNK_SIZE_MAX, EnumProbeOutcome, SparseProbe, SpecTransferStats, SystemSparseProbe,
    copy_file_sparse,
};
pub use spec::{
    CallbackAbort, CopyTreeError, EnumBadEntryVerdict, EnumCopyFailure, EnumCopyPatternMode,
    EnumCopySymlinkStrategy, EnumCopyXattrPolicy, FnBadEntry, FnCopyError, FnCopyProgress,
    FnXattrError, FnXattrFilter, SpecCopyError, SpecCopyHooks, SpecCopyOptions,
};
pub use util::count_files;
