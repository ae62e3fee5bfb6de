//! Filesystem tree traversal and copy orchestration.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use tracing::{debug, warn};

use crate::extattr::{
    EnumXattrStop, SpecXattrNamespace, SystemXattrService, XattrService, copy_xattrs,
    resolve_namespaces,
};
use crate::report::{ErrorAggregator, ReportCopy, ReportCopyBuilder};
use crate::sparse::{SparseProbe, SystemSparseProbe, copy_file_sparse, resolve_destination_file};
use crate::spec::{
    CopyTreeError, EnumBadEntryVerdict, EnumCopyFailure, SpecCopyError, SpecCopyHooks,
    SpecCopyOptions,
};
use crate::util::{SpecCopyExclusion, copy_stat, create_symbolic_link};

/// Collaborators used by the walker.
#[derive(Clone, Copy)]
pub struct SpecCopyServices<'a> {
    pub xattr: &'a dyn XattrService,
    pub sparse: &'a dyn SparseProbe,
}

impl SpecCopyServices<'static> {
    /// Host attribute store and host sparse probing.
    pub fn system() -> Self {
        Self {
            xattr: &SystemXattrService,
            sparse: &SystemSparseProbe,
        }
    }
}

struct SpecCopyContext<'c, 'a> {
    spec_cp_options: &'c SpecCopyOptions,
    spec_cp_hooks: &'c SpecCopyHooks<'a>,
    spec_cp_services: &'c SpecCopyServices<'c>,
    spec_cp_exclusion: SpecCopyExclusion,
    l_namespaces: Vec<SpecXattrNamespace>,
}

/// Counters and failures owned by one directory level.
struct SpecLevelState<'c, 'a> {
    builder_cp_report: ReportCopyBuilder,
    agg_errors: ErrorAggregator<'c, 'a>,
}

impl<'c, 'a> SpecLevelState<'c, 'a> {
    fn new(ctx: &SpecCopyContext<'c, 'a>) -> Self {
        Self {
            builder_cp_report: ReportCopyBuilder::default(),
            agg_errors: ErrorAggregator::new(ctx.spec_cp_hooks.fn_error.as_ref()),
        }
    }

    fn fail(
        &mut self,
        path_src: &Path,
        path_dst: &Path,
        failure: EnumCopyFailure,
    ) -> Result<(), CopyTreeError> {
        self.builder_cp_report.add_error();
        self.agg_errors.record(SpecCopyError {
            path_src: path_src.to_path_buf(),
            path_dst: path_dst.to_path_buf(),
            failure,
        })
    }

    fn absorb(&mut self, child: SpecLevelState<'c, 'a>) {
        self.builder_cp_report.merge(child.builder_cp_report.build());
        self.agg_errors.merge(child.agg_errors.into_records());
    }
}

/// Copy `src` to `dst` using the host services.
///
/// See [`copy_tree_with`].
pub fn copy_tree<P, Q>(
    src: P,
    dst: Q,
    spec_cp_options: &SpecCopyOptions,
    spec_cp_hooks: &SpecCopyHooks<'_>,
) -> Result<ReportCopy, CopyTreeError>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    copy_tree_with(
        src,
        dst,
        spec_cp_options,
        spec_cp_hooks,
        &SpecCopyServices::system(),
    )
}

/// Copy the tree rooted at `src` to `dst`.
///
/// `src` may be a directory, a regular file, or (with
/// [`EnumCopySymlinkStrategy::CopySymlinks`](crate::EnumCopySymlinkStrategy))
/// a symlink. Directory entries become `dst/<name>`; `dst` and missing
/// parents are created. A regular-file source is written to `dst`, or to
/// `dst/<basename>` when `dst` is an existing directory.
///
/// Per-entry failures never stop siblings. Without an error handler they are
/// returned together as [`CopyTreeError::Partial`] once the walk is done;
/// with one, each failure goes to the handler and the call returns `Ok`.
///
/// The walk stops early only when a callback aborts, or when an unsupported
/// entry is met without a bad-entry handler.
pub fn copy_tree_with<P, Q>(
    src: P,
    dst: Q,
    spec_cp_options: &SpecCopyOptions,
    spec_cp_hooks: &SpecCopyHooks<'_>,
    spec_cp_services: &SpecCopyServices<'_>,
) -> Result<ReportCopy, CopyTreeError>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    let path_src = src.as_ref();
    let path_dst = dst.as_ref();

    let spec_cp_exclusion = SpecCopyExclusion::from_raw(
        spec_cp_options.patterns_exclude.as_deref(),
        spec_cp_options.rule_pattern,
    )?;
    let l_namespaces = resolve_namespaces(spec_cp_services.xattr, &spec_cp_options.rule_xattr)?;

    let ctx = SpecCopyContext {
        spec_cp_options,
        spec_cp_hooks,
        spec_cp_services,
        spec_cp_exclusion,
        l_namespaces,
    };

    let inspect_err = |source| CopyTreeError::InspectSource {
        path: path_src.to_path_buf(),
        source,
    };
    let stat_src_link = fs::symlink_metadata(path_src).map_err(inspect_err)?;
    let b_is_symlink = stat_src_link.file_type().is_symlink();

    let mut state = SpecLevelState::new(&ctx);
    if b_is_symlink && !spec_cp_options.rule_symlink.follows_links() {
        copy_symlink_entry(&ctx, path_src, path_dst, &mut state)?;
    } else {
        let stat_src = if b_is_symlink {
            fs::metadata(path_src).map_err(inspect_err)?
        } else {
            stat_src_link
        };
        if stat_src.is_dir() {
            let mut l_chain = vec![(stat_src.dev(), stat_src.ino())];
            copy_directory_level(&ctx, path_src, path_dst, &mut state, &mut l_chain)?;
        } else if stat_src.is_file() {
            copy_file_entry(&ctx, path_src, path_dst, &mut state)?;
        } else {
            handle_bad_entry(&ctx, path_src, path_dst, &mut state)?;
        }
    }

    let SpecLevelState {
        builder_cp_report,
        agg_errors,
    } = state;
    let report = builder_cp_report.build();
    debug!(
        src = %path_src.display(),
        dst = %path_dst.display(),
        report = %report,
        "tree copy finished"
    );
    if agg_errors.is_empty() {
        Ok(report)
    } else {
        Err(CopyTreeError::Partial {
            errors: agg_errors.into_records(),
            report,
        })
    }
}

/// Create `path_dst` and copy every non-excluded entry of `path_src` into it.
///
/// Returns whether the destination directory exists afterwards.
fn copy_directory_level<'c, 'a>(
    ctx: &SpecCopyContext<'c, 'a>,
    path_src: &Path,
    path_dst: &Path,
    state: &mut SpecLevelState<'c, 'a>,
    l_chain: &mut Vec<(u64, u64)>,
) -> Result<bool, CopyTreeError> {
    if let Err(e) = fs::create_dir_all(path_dst) {
        state.fail(
            path_src,
            path_dst,
            EnumCopyFailure::ContentIo {
                op: "create directory",
                source: e,
            },
        )?;
        return Ok(false);
    }

    let iter_entries = match fs::read_dir(path_src) {
        Ok(v) => v,
        Err(e) => {
            state.fail(
                path_src,
                path_dst,
                EnumCopyFailure::ContentIo {
                    op: "read directory",
                    source: e,
                },
            )?;
            return Ok(true);
        }
    };

    let mut l_names: Vec<OsString> = Vec::new();
    for entry_res in iter_entries {
        match entry_res {
            Ok(entry) => l_names.push(entry.file_name()),
            Err(e) => state.fail(
                path_src,
                path_dst,
                EnumCopyFailure::ContentIo {
                    op: "read directory",
                    source: e,
                },
            )?,
        }
    }
    l_names.sort();

    for name in l_names {
        let path_entry_src = path_src.join(&name);
        if ctx.spec_cp_exclusion.is_excluded(&name) {
            debug!(src = %path_entry_src.display(), "entry excluded");
            state.builder_cp_report.add_excluded(1);
            continue;
        }
        let path_entry_dst = path_dst.join(&name);
        copy_entry(ctx, &path_entry_src, &path_entry_dst, state, l_chain)?;
    }
    Ok(true)
}

/// Classify one directory entry and dispatch it.
fn copy_entry<'c, 'a>(
    ctx: &SpecCopyContext<'c, 'a>,
    path_src: &Path,
    path_dst: &Path,
    state: &mut SpecLevelState<'c, 'a>,
    l_chain: &mut Vec<(u64, u64)>,
) -> Result<(), CopyTreeError> {
    let inspect_failure = |source| EnumCopyFailure::ContentIo {
        op: "inspect",
        source,
    };
    let stat_link = match fs::symlink_metadata(path_src) {
        Ok(v) => v,
        Err(e) => return state.fail(path_src, path_dst, inspect_failure(e)),
    };
    let b_is_symlink = stat_link.file_type().is_symlink();
    if b_is_symlink && !ctx.spec_cp_options.rule_symlink.follows_links() {
        return copy_symlink_entry(ctx, path_src, path_dst, state);
    }

    let stat_entry = if b_is_symlink {
        match fs::metadata(path_src) {
            Ok(v) => v,
            Err(e) => return state.fail(path_src, path_dst, inspect_failure(e)),
        }
    } else {
        stat_link
    };

    if stat_entry.is_dir() {
        let tuple_dir_id = (stat_entry.dev(), stat_entry.ino());
        if l_chain.contains(&tuple_dir_id) {
            warn!(src = %path_src.display(), "symlink loop detected, recording failure");
            let e = io::Error::from_raw_os_error(libc::ELOOP);
            return state.fail(path_src, path_dst, inspect_failure(e));
        }
        debug!(src = %path_src.display(), dst = %path_dst.display(), "descending into directory");

        let mut state_child = SpecLevelState::new(ctx);
        l_chain.push(tuple_dir_id);
        let res_level = copy_directory_level(ctx, path_src, path_dst, &mut state_child, l_chain);
        l_chain.pop();
        let b_created = res_level?;

        if b_created {
            state_child.builder_cp_report.add_dir();
        }
        state.absorb(state_child);
        if b_created && let Err(e) = copy_stat(path_src, path_dst, true) {
            state.fail(
                path_src,
                path_dst,
                EnumCopyFailure::MetadataPropagation { source: e },
            )?;
        }
        Ok(())
    } else if stat_entry.is_file() {
        copy_file_entry(ctx, path_src, path_dst, state)
    } else {
        handle_bad_entry(ctx, path_src, path_dst, state)
    }
}

fn copy_symlink_entry<'c, 'a>(
    ctx: &SpecCopyContext<'c, 'a>,
    path_src: &Path,
    path_dst: &Path,
    state: &mut SpecLevelState<'c, 'a>,
) -> Result<(), CopyTreeError> {
    debug!(src = %path_src.display(), dst = %path_dst.display(), "recreating symlink");
    if let Err(e) = create_symbolic_link(path_src, path_dst) {
        return state.fail(
            path_src,
            path_dst,
            EnumCopyFailure::ContentIo {
                op: "create symlink",
                source: e,
            },
        );
    }
    state.builder_cp_report.add_symlink();

    if ctx.spec_cp_options.if_copy_symlink_metadata
        && let Err(e) = copy_stat(path_src, path_dst, false)
    {
        state.fail(
            path_src,
            path_dst,
            EnumCopyFailure::MetadataPropagation { source: e },
        )?;
    }
    Ok(())
}

/// Content, then extended attributes, then mode and times.
///
/// A failing step records one failure and skips the remaining steps.
fn copy_file_entry<'c, 'a>(
    ctx: &SpecCopyContext<'c, 'a>,
    path_src: &Path,
    path_dst: &Path,
    state: &mut SpecLevelState<'c, 'a>,
) -> Result<(), CopyTreeError> {
    if let Some(fn_progress) = &ctx.spec_cp_hooks.fn_progress {
        fn_progress(path_src, path_dst)?;
    }

    let path_dst_file = resolve_destination_file(path_src, path_dst);
    let stats_transfer =
        match copy_file_sparse(path_src, &path_dst_file, ctx.spec_cp_services.sparse) {
            Ok(v) => v,
            Err(failure) => return state.fail(path_src, &path_dst_file, failure),
        };
    state
        .builder_cp_report
        .add_file(stats_transfer.n_bytes_data, stats_transfer.n_bytes_total);

    if !ctx.l_namespaces.is_empty() {
        match copy_xattrs(
            path_src,
            &path_dst_file,
            &ctx.l_namespaces,
            ctx.spec_cp_options.rule_symlink.follows_links(),
            ctx.spec_cp_services.xattr,
            ctx.spec_cp_hooks,
        ) {
            Ok(stats_xattr) => debug!(
                src = %path_src.display(),
                n_copied = stats_xattr.n_copied,
                n_filtered = stats_xattr.n_filtered,
                n_suppressed = stats_xattr.n_suppressed,
                "extended attributes copied"
            ),
            Err(EnumXattrStop::Aborted(abort)) => return Err(abort.into()),
            Err(EnumXattrStop::Failed(failure)) => {
                return state.fail(path_src, &path_dst_file, failure);
            }
        }
    }

    if let Err(e) = copy_stat(path_src, &path_dst_file, true) {
        state.fail(
            path_src,
            &path_dst_file,
            EnumCopyFailure::MetadataPropagation { source: e },
        )?;
    }
    Ok(())
}

/// Entry that is neither file, directory nor symlink.
fn handle_bad_entry<'c, 'a>(
    ctx: &SpecCopyContext<'c, 'a>,
    path_src: &Path,
    path_dst: &Path,
    state: &mut SpecLevelState<'c, 'a>,
) -> Result<(), CopyTreeError> {
    let Some(fn_bad_entry) = &ctx.spec_cp_hooks.fn_bad_entry else {
        return Err(CopyTreeError::UnsupportedFileType {
            path: path_src.to_path_buf(),
        });
    };
    match fn_bad_entry(path_src)? {
        EnumBadEntryVerdict::Skip => {
            debug!(src = %path_src.display(), "unsupported entry skipped");
            state.builder_cp_report.add_skipped();
            Ok(())
        }
        EnumBadEntryVerdict::Report => state.fail(
            path_src,
            path_dst,
            EnumCopyFailure::UnsupportedFileType {
                path: path_src.to_path_buf(),
            },
        ),
    }
}
