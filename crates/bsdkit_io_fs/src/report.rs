//! Copy report models, mutable report builder and per-level error aggregation.

use std::collections::BTreeMap;
use std::fmt;

use tracing::warn;

use crate::spec::{CopyTreeError, FnCopyError, SpecCopyError};

/// Aggregate counters for one `copy_tree` run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReportCopy {
    /// Regular files whose content was transferred.
    pub cnt_files: u64,
    /// Directories descended into.
    pub cnt_dirs: u64,
    /// Symlinks recreated at destination.
    pub cnt_symlinks: u64,
    /// Unsupported entries skipped by the bad-entry handler.
    pub cnt_skipped: u64,
    /// Entries dropped by exclusion patterns.
    pub cnt_excluded: u64,
    /// Entry-level failures, including ones delivered to an error handler.
    pub cnt_errors: u64,
    /// Bytes actually read and written.
    pub n_bytes_data: u64,
    /// Logical size of all transferred files.
    pub n_bytes_total: u64,
}

impl ReportCopy {
    /// Bytes left as holes in destination files.
    pub fn hole_bytes(&self) -> u64 {
        self.n_bytes_total.saturating_sub(self.n_bytes_data)
    }

    /// Machine-readable counters.
    pub fn to_dict(&self) -> BTreeMap<String, u64> {
        let mut dict_counts = BTreeMap::new();
        dict_counts.insert("cnt_files".to_string(), self.cnt_files);
        dict_counts.insert("cnt_dirs".to_string(), self.cnt_dirs);
        dict_counts.insert("cnt_symlinks".to_string(), self.cnt_symlinks);
        dict_counts.insert("cnt_skipped".to_string(), self.cnt_skipped);
        dict_counts.insert("cnt_excluded".to_string(), self.cnt_excluded);
        dict_counts.insert("cnt_errors".to_string(), self.cnt_errors);
        dict_counts.insert("n_bytes_data".to_string(), self.n_bytes_data);
        dict_counts.insert("n_bytes_holes".to_string(), self.hole_bytes());
        dict_counts
    }

    /// Human-readable one-line summary.
    pub fn format(&self, prefix: &str) -> String {
        let dict_counts = self.to_dict();
        format!(
            "{prefix} files={} dirs={} symlinks={} skipped={} excluded={} errors={} bytes={} holes={}",
            dict_counts["cnt_files"],
            dict_counts["cnt_dirs"],
            dict_counts["cnt_symlinks"],
            dict_counts["cnt_skipped"],
            dict_counts["cnt_excluded"],
            dict_counts["cnt_errors"],
            dict_counts["n_bytes_data"],
            dict_counts["n_bytes_holes"]
        )
    }
}

impl fmt::Display for ReportCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format("[COPYTREE]"))
    }
}

/// Mutable accumulator for one directory level.
#[derive(Debug, Default, Clone)]
pub struct ReportCopyBuilder {
    report: ReportCopy,
}

impl ReportCopyBuilder {
    pub fn add_file(&mut self, n_bytes_data: u64, n_bytes_total: u64) {
        self.report.cnt_files += 1;
        self.report.n_bytes_data += n_bytes_data;
        self.report.n_bytes_total += n_bytes_total;
    }

    pub fn add_dir(&mut self) {
        self.report.cnt_dirs += 1;
    }

    pub fn add_symlink(&mut self) {
        self.report.cnt_symlinks += 1;
    }

    pub fn add_skipped(&mut self) {
        self.report.cnt_skipped += 1;
    }

    pub fn add_excluded(&mut self, n: u64) {
        self.report.cnt_excluded += n;
    }

    pub fn add_error(&mut self) {
        self.report.cnt_errors += 1;
    }

    /// Fold a finished child level into this one.
    pub fn merge(&mut self, child: ReportCopy) {
        let r = &mut self.report;
        r.cnt_files += child.cnt_files;
        r.cnt_dirs += child.cnt_dirs;
        r.cnt_symlinks += child.cnt_symlinks;
        r.cnt_skipped += child.cnt_skipped;
        r.cnt_excluded += child.cnt_excluded;
        r.cnt_errors += child.cnt_errors;
        r.n_bytes_data += child.n_bytes_data;
        r.n_bytes_total += child.n_bytes_total;
    }

    /// Finalize builder into immutable report.
    pub fn build(self) -> ReportCopy {
        self.report
    }
}

/// Flat list of failures for one traversal level.
///
/// With an error handler installed every record is delivered immediately and
/// nothing is kept; otherwise records are kept in discovery order and handed
/// to the parent level through [`ErrorAggregator::into_records`].
pub struct ErrorAggregator<'h, 'a> {
    fn_error: Option<&'h FnCopyError<'a>>,
    l_errors: Vec<SpecCopyError>,
}

impl<'h, 'a> ErrorAggregator<'h, 'a> {
    pub fn new(fn_error: Option<&'h FnCopyError<'a>>) -> Self {
        Self {
            fn_error,
            l_errors: Vec::new(),
        }
    }

    /// Record one failure. Fails only when the error handler aborts.
    pub fn record(&mut self, spec_error: SpecCopyError) -> Result<(), CopyTreeError> {
        warn!(
            src = %spec_error.path_src.display(),
            dst = %spec_error.path_dst.display(),
            error = %spec_error.failure,
            "copy entry failed"
        );
        match self.fn_error {
            Some(fn_error) => fn_error(&spec_error).map_err(CopyTreeError::from),
            None => {
                self.l_errors.push(spec_error);
                Ok(())
            }
        }
    }

    /// Append records already collected by a child level.
    pub fn merge(&mut self, l_child_errors: Vec<SpecCopyError>) {
        self.l_errors.extend(l_child_errors);
    }

    pub fn is_empty(&self) -> bool {
        self.l_errors.is_empty()
    }

    pub fn into_records(self) -> Vec<SpecCopyError> {
        self.l_errors
    }
}
