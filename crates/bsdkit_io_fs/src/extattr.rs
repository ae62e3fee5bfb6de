//! Extended attribute namespaces and attribute propagation.

use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;

use tracing::debug;

use crate::spec::{
    CallbackAbort, CopyTreeError, EnumCopyFailure, EnumCopyXattrPolicy, SpecCopyHooks,
};

////////////////////////////////////////////////////////////////////////////////
// #region Service

/// One attribute namespace known to an [`XattrService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecXattrNamespace {
    pub name: String,
    pub id: i32,
}

/// Extended attribute access, scoped by namespace.
///
/// Attribute names passed in and out are relative to the namespace
/// (`"comment"`, not `"user.comment"`).
pub trait XattrService {
    /// Every namespace this service can address, in a stable order.
    fn namespaces(&self) -> Vec<SpecXattrNamespace>;
    fn list(
        &self,
        path: &Path,
        namespace: &SpecXattrNamespace,
        if_follow: bool,
    ) -> io::Result<Vec<OsString>>;
    fn get(
        &self,
        path: &Path,
        namespace: &SpecXattrNamespace,
        name: &OsStr,
        if_follow: bool,
    ) -> io::Result<Vec<u8>>;
    fn set(
        &self,
        path: &Path,
        namespace: &SpecXattrNamespace,
        name: &OsStr,
        value: &[u8],
        if_follow: bool,
    ) -> io::Result<()>;
}

/// Host attributes through the `xattr` crate.
///
/// Namespaces map onto the `<namespace>.` name prefix used by Linux and
/// FreeBSD. macOS has no namespaces; everything lives under `user`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemXattrService;

#[cfg(target_os = "linux")]
const L_SYSTEM_NAMESPACES: &[(&str, i32)] =
    &[("user", 1), ("system", 2), ("trusted", 3), ("security", 4)];
#[cfg(target_os = "freebsd")]
const L_SYSTEM_NAMESPACES: &[(&str, i32)] = &[("user", 1), ("system", 2)];
#[cfg(target_os = "macos")]
const L_SYSTEM_NAMESPACES: &[(&str, i32)] = &[("user", 1)];
#[cfg(not(any(target_os = "linux", target_os = "freebsd", target_os = "macos")))]
const L_SYSTEM_NAMESPACES: &[(&str, i32)] = &[];

impl SystemXattrService {
    fn prefix(namespace: &SpecXattrNamespace) -> Vec<u8> {
        if cfg!(target_os = "macos") {
            return Vec::new();
        }
        format!("{}.", namespace.name).into_bytes()
    }

    fn full_name(namespace: &SpecXattrNamespace, name: &OsStr) -> OsString {
        let mut raw = Self::prefix(namespace);
        raw.extend_from_slice(name.as_bytes());
        OsString::from_vec(raw)
    }
}

impl XattrService for SystemXattrService {
    fn namespaces(&self) -> Vec<SpecXattrNamespace> {
        L_SYSTEM_NAMESPACES
            .iter()
            .map(|(name, id)| SpecXattrNamespace {
                name: (*name).to_string(),
                id: *id,
            })
            .collect()
    }

    fn list(
        &self,
        path: &Path,
        namespace: &SpecXattrNamespace,
        if_follow: bool,
    ) -> io::Result<Vec<OsString>> {
        let iter_names = if if_follow {
            xattr::list_deref(path)?
        } else {
            xattr::list(path)?
        };
        let prefix = Self::prefix(namespace);
        Ok(iter_names
            .filter_map(|full| {
                full.as_bytes()
                    .strip_prefix(prefix.as_slice())
                    .filter(|rest| !rest.is_empty())
                    .map(|rest| OsStr::from_bytes(rest).to_os_string())
            })
            .collect())
    }

    fn get(
        &self,
        path: &Path,
        namespace: &SpecXattrNamespace,
        name: &OsStr,
        if_follow: bool,
    ) -> io::Result<Vec<u8>> {
        let full = Self::full_name(namespace, name);
        let value = if if_follow {
            xattr::get_deref(path, &full)?
        } else {
            xattr::get(path, &full)?
        };
        value.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("extended attribute {full:?} disappeared"),
            )
        })
    }

    fn set(
        &self,
        path: &Path,
        namespace: &SpecXattrNamespace,
        name: &OsStr,
        value: &[u8],
        if_follow: bool,
    ) -> io::Result<()> {
        let full = Self::full_name(namespace, name);
        if if_follow {
            xattr::set_deref(path, &full, value)
        } else {
            xattr::set(path, &full, value)
        }
    }
}

/// Namespaces selected by `policy`, in registry order for `AllNamespaces`
/// and in caller order for an explicit list.
pub fn resolve_namespaces(
    service: &dyn XattrService,
    policy: &EnumCopyXattrPolicy,
) -> Result<Vec<SpecXattrNamespace>, CopyTreeError> {
    match policy {
        EnumCopyXattrPolicy::Disabled => Ok(Vec::new()),
        EnumCopyXattrPolicy::AllNamespaces => Ok(service.namespaces()),
        EnumCopyXattrPolicy::Namespaces(l_names) => {
            let l_known = service.namespaces();
            l_names
                .iter()
                .map(|name| {
                    l_known
                        .iter()
                        .find(|ns| &ns.name == name)
                        .cloned()
                        .ok_or_else(|| CopyTreeError::UnknownXattrNamespace(name.clone()))
                })
                .collect()
        }
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Propagation

/// Why attribute propagation stopped for one file.
#[derive(Debug)]
pub(crate) enum EnumXattrStop {
    /// The entry failed; siblings continue.
    Failed(EnumCopyFailure),
    /// A callback aborted the traversal.
    Aborted(CallbackAbort),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SpecXattrStats {
    pub(crate) n_copied: u64,
    pub(crate) n_filtered: u64,
    pub(crate) n_suppressed: u64,
}

/// Ask the xattr error callback whether `err` may be ignored.
fn recover(
    hooks: &SpecCopyHooks<'_>,
    path_src: &Path,
    namespace: &SpecXattrNamespace,
    name: Option<&OsStr>,
    err: io::Error,
    stats: &mut SpecXattrStats,
    to_failure: impl FnOnce(io::Error) -> EnumCopyFailure,
) -> Result<(), EnumXattrStop> {
    let b_suppress = match &hooks.fn_xattr_error {
        Some(fn_xattr_error) => fn_xattr_error(path_src, namespace.name.as_str(), name, &err)
            .map_err(EnumXattrStop::Aborted)?,
        None => false,
    };
    if !b_suppress {
        return Err(EnumXattrStop::Failed(to_failure(err)));
    }
    debug!(
        src = %path_src.display(),
        namespace = %namespace.name,
        error = %err,
        "extended attribute error suppressed"
    );
    stats.n_suppressed += 1;
    Ok(())
}

/// Copy attributes of `path_src` in each of `l_namespaces` onto `path_dst`.
pub(crate) fn copy_xattrs(
    path_src: &Path,
    path_dst: &Path,
    l_namespaces: &[SpecXattrNamespace],
    if_follow: bool,
    service: &dyn XattrService,
    hooks: &SpecCopyHooks<'_>,
) -> Result<SpecXattrStats, EnumXattrStop> {
    let mut stats = SpecXattrStats::default();

    for namespace in l_namespaces {
        let l_names = match service.list(path_src, namespace, if_follow) {
            Ok(v) => v,
            Err(e) => {
                recover(hooks, path_src, namespace, None, e, &mut stats, |source| {
                    EnumCopyFailure::AttributeList {
                        namespace: namespace.name.clone(),
                        source,
                    }
                })?;
                continue;
            }
        };

        for name in &l_names {
            if let Some(fn_xattr_filter) = &hooks.fn_xattr_filter
                && !fn_xattr_filter(path_src, namespace.name.as_str(), name.as_os_str())
                    .map_err(EnumXattrStop::Aborted)?
            {
                stats.n_filtered += 1;
                continue;
            }

            let value = match service.get(path_src, namespace, name, if_follow) {
                Ok(v) => v,
                Err(e) => {
                    recover(
                        hooks,
                        path_src,
                        namespace,
                        Some(name.as_os_str()),
                        e,
                        &mut stats,
                        |source| EnumCopyFailure::AttributeGet {
                            namespace: namespace.name.clone(),
                            name: name.clone(),
                            source,
                        },
                    )?;
                    continue;
                }
            };

            match service.set(path_dst, namespace, name, &value, if_follow) {
                Ok(()) => stats.n_copied += 1,
                Err(e) => {
                    recover(
                        hooks,
                        path_src,
                        namespace,
                        Some(name.as_os_str()),
                        e,
                        &mut stats,
                        |source| EnumCopyFailure::AttributeSet {
                            namespace: namespace.name.clone(),
                            name: name.clone(),
                            source,
                        },
                    )?;
                }
            }
        }
    }

    Ok(stats)
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
