use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};

use bsdkit_io_fs::{
    CallbackAbort, CopyTreeError as CopyTreeFailure, EnumBadEntryVerdict, EnumCopyFailure,
    EnumCopyPatternMode, EnumCopySymlinkStrategy, EnumCopyXattrPolicy, FnBadEntry, FnCopyError,
    FnCopyProgress, FnXattrError, FnXattrFilter, SpecCopyError, SpecCopyHooks, SpecCopyOptions,
    copy_tree, count_files,
};
use pyo3::create_exception;
use pyo3::exceptions::{PyOSError, PyRuntimeError, PyTypeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyBool, PyList, PyString};

const N_BRIDGE_ABI_VERSION: u64 = 1;
const C_BRIDGE_CONTRACT_VERSION: &str = "bsdkit.copy.copytree.v1";
const C_BRIDGE_TRANSPORT: &str = "rust_native";

create_exception!(
    _bsdkit_io_fs_rs,
    CopyTreeError,
    PyOSError,
    "Raised once after a tree copy when entries failed; args[0] lists (src, dst, reason)."
);

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// `OSError(errno, message, filename)`; Python picks the matching subclass.
fn new_os_error(errno: Option<i32>, message: String, filename: Option<String>) -> PyErr {
    match (errno, filename) {
        (Some(n), Some(f)) => PyOSError::new_err((n, message, f)),
        (Some(n), None) => PyOSError::new_err((n, message)),
        (None, _) => PyOSError::new_err(message),
    }
}

fn is_literal_false(value: &Bound<'_, PyAny>) -> bool {
    value
        .downcast::<PyBool>()
        .is_ok_and(|b| !b.is_true())
}

/// `xattr` accepts a bool, one namespace name, or a list of names.
fn parse_rule_xattr(value: Option<&Bound<'_, PyAny>>) -> PyResult<EnumCopyXattrPolicy> {
    let Some(value) = value.filter(|v| !v.is_none()) else {
        return Ok(EnumCopyXattrPolicy::Disabled);
    };
    if let Ok(b) = value.downcast::<PyBool>() {
        return Ok(if b.is_true() {
            EnumCopyXattrPolicy::AllNamespaces
        } else {
            EnumCopyXattrPolicy::Disabled
        });
    }
    if let Ok(s) = value.downcast::<PyString>() {
        return Ok(EnumCopyXattrPolicy::Namespaces(vec![s.to_str()?.to_string()]));
    }
    if value.downcast::<PyList>().is_ok() {
        return Ok(EnumCopyXattrPolicy::Namespaces(value.extract()?));
    }
    Err(PyTypeError::new_err(format!(
        "Invalid xattr argument of type `{}`. Expected bool, str or list of str",
        value.get_type().name()?
    )))
}

/// `exclude` takes any iterable of names (list, tuple, set, frozenset, ...).
fn parse_patterns_exclude(value: Option<&Bound<'_, PyAny>>) -> PyResult<Option<Vec<String>>> {
    let Some(value) = value.filter(|v| !v.is_none()) else {
        return Ok(None);
    };
    if value.downcast::<PyString>().is_ok() {
        return Err(PyTypeError::new_err(
            "Invalid exclude argument: expected an iterable of names, not a single str",
        ));
    }
    let mut l_names = Vec::new();
    for item in value.try_iter()? {
        l_names.push(item?.extract::<String>()?);
    }
    Ok(Some(l_names))
}

fn make_progress<'a>(callback: &'a Bound<'_, PyAny>) -> FnCopyProgress<'a> {
    Box::new(move |path_src: &Path, path_dst: &Path| {
        callback
            .call1((path_text(path_src), path_text(path_dst)))
            .map(|_| ())
            .map_err(CallbackAbort::new)
    })
}

fn make_xattr_filter<'a>(callback: &'a Bound<'_, PyAny>) -> FnXattrFilter<'a> {
    Box::new(move |path_src: &Path, namespace: &str, name: &OsStr| {
        let res = callback
            .call1((path_text(path_src), namespace, name.to_string_lossy().into_owned()))
            .map_err(CallbackAbort::new)?;
        Ok(!is_literal_false(&res))
    })
}

fn make_xattr_error<'a>(callback: &'a Bound<'_, PyAny>) -> FnXattrError<'a> {
    Box::new(
        move |path_src: &Path, namespace: &str, name: Option<&OsStr>, err: &io::Error| {
            let py = callback.py();
            let exc = new_os_error(err.raw_os_error(), err.to_string(), Some(path_text(path_src)))
                .into_value(py);
            let res = callback
                .call1((
                    path_text(path_src),
                    namespace,
                    name.map(|n| n.to_string_lossy().into_owned()),
                    exc,
                ))
                .map_err(CallbackAbort::new)?;
            Ok(!is_literal_false(&res))
        },
    )
}

fn make_error_handler<'a>(callback: &'a Bound<'_, PyAny>) -> FnCopyError<'a> {
    Box::new(move |spec_error: &SpecCopyError| {
        let py = callback.py();
        let exc = new_os_error(
            spec_error.failure.raw_os_error(),
            spec_error.failure.to_string(),
            Some(path_text(&spec_error.path_src)),
        )
        .into_value(py);
        callback
            .call1((
                path_text(&spec_error.path_src),
                path_text(&spec_error.path_dst),
                exc,
            ))
            .map(|_| ())
            .map_err(CallbackAbort::new)
    })
}

fn make_bad_entry<'a>(callback: &'a Bound<'_, PyAny>) -> FnBadEntry<'a> {
    Box::new(move |path_src: &Path| {
        callback
            .call1((path_text(path_src),))
            .map(|_| EnumBadEntryVerdict::Skip)
            .map_err(CallbackAbort::new)
    })
}

fn map_copy_tree_error(exception: CopyTreeFailure) -> PyErr {
    match exception {
        CopyTreeFailure::Partial { errors, .. } => {
            let l_triples: Vec<(String, String, String)> = errors
                .iter()
                .map(|e| {
                    (
                        path_text(&e.path_src),
                        path_text(&e.path_dst),
                        e.failure.to_string(),
                    )
                })
                .collect();
            CopyTreeError::new_err((l_triples,))
        }
        CopyTreeFailure::UnsupportedFileType { path } => {
            let c_path = path_text(&path);
            let failure = EnumCopyFailure::UnsupportedFileType { path };
            new_os_error(failure.raw_os_error(), failure.to_string(), Some(c_path))
        }
        CopyTreeFailure::Callback(abort) => match abort.into_inner().downcast::<PyErr>() {
            Ok(py_err) => *py_err,
            Err(other) => PyRuntimeError::new_err(other.to_string()),
        },
        CopyTreeFailure::InspectSource { path, source } => {
            new_os_error(source.raw_os_error(), source.to_string(), Some(path_text(&path)))
        }
        CopyTreeFailure::UnknownXattrNamespace(name) => PyValueError::new_err(format!(
            "Unknown extended attribute namespace: `{name}`"
        )),
        CopyTreeFailure::InvalidPattern(message) => PyValueError::new_err(message),
    }
}

#[pyfunction(name = "copytree")]
#[pyo3(signature = (
    src,
    dst,
    symlinks = false,
    progress_callback = None,
    xattr = None,
    xattr_filter = None,
    xattr_error_callback = None,
    exclude = None,
    error_cb = None,
    badfile_cb = None
))]
#[allow(clippy::too_many_arguments)]
fn copytree_py<'py>(
    py: Python<'py>,
    src: PathBuf,
    dst: PathBuf,
    symlinks: bool,
    progress_callback: Option<Bound<'py, PyAny>>,
    xattr: Option<Bound<'py, PyAny>>,
    xattr_filter: Option<Bound<'py, PyAny>>,
    xattr_error_callback: Option<Bound<'py, PyAny>>,
    exclude: Option<Bound<'py, PyAny>>,
    error_cb: Option<Bound<'py, PyAny>>,
    badfile_cb: Option<Bound<'py, PyAny>>,
) -> PyResult<()> {
    let spec_cp_options = SpecCopyOptions {
        patterns_exclude: parse_patterns_exclude(exclude.as_ref())?,
        rule_pattern: EnumCopyPatternMode::Literal,
        rule_symlink: if symlinks {
            EnumCopySymlinkStrategy::CopySymlinks
        } else {
            EnumCopySymlinkStrategy::Dereference
        },
        rule_xattr: parse_rule_xattr(xattr.as_ref())?,
        if_copy_symlink_metadata: false,
    };

    let spec_cp_hooks = SpecCopyHooks {
        fn_progress: progress_callback.as_ref().map(make_progress),
        fn_xattr_filter: xattr_filter.as_ref().map(make_xattr_filter),
        fn_xattr_error: xattr_error_callback.as_ref().map(make_xattr_error),
        fn_error: error_cb.as_ref().map(make_error_handler),
        fn_bad_entry: badfile_cb.as_ref().map(make_bad_entry),
    };

    // Callbacks need the GIL; a plain copy can release it.
    let b_has_callbacks = spec_cp_hooks.fn_progress.is_some()
        || spec_cp_hooks.fn_xattr_filter.is_some()
        || spec_cp_hooks.fn_xattr_error.is_some()
        || spec_cp_hooks.fn_error.is_some()
        || spec_cp_hooks.fn_bad_entry.is_some();
    let res_copy = if b_has_callbacks {
        copy_tree(&src, &dst, &spec_cp_options, &spec_cp_hooks)
    } else {
        drop(spec_cp_hooks);
        py.allow_threads(|| copy_tree(&src, &dst, &spec_cp_options, &SpecCopyHooks::default()))
    };
    res_copy.map(|_| ()).map_err(map_copy_tree_error)
}

#[pyfunction(name = "count_files")]
fn count_files_py(py: Python<'_>, directory: PathBuf) -> u64 {
    py.allow_threads(|| count_files(&directory))
}

#[pymodule]
fn _bsdkit_io_fs_rs(module: &Bound<'_, PyModule>) -> PyResult<()> {
    module.add("CopyTreeError", module.py().get_type::<CopyTreeError>())?;
    module.add_function(wrap_pyfunction!(copytree_py, module)?)?;
    module.add_function(wrap_pyfunction!(count_files_py, module)?)?;
    module.add("__bridge_abi__", N_BRIDGE_ABI_VERSION)?;
    module.add("__bridge_contract__", C_BRIDGE_CONTRACT_VERSION)?;
    module.add("__bridge_transport__", C_BRIDGE_TRANSPORT)?;
    Ok(())
}
