//! Sparse-aware content transfer for regular files.
//!
//! Data regions are discovered with `SEEK_DATA`/`SEEK_HOLE` probing and only
//! those byte ranges are copied. Holes are never written: the destination is
//! sized with a final `set_len`, so the filesystem leaves them unallocated.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::spec::EnumCopyFailure;

/// Upper bound for a single read/write call.
pub const CHUNK_SIZE_MAX: u64 = 1024 * 1024;

/// Result of one sparse probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumProbeOutcome {
    /// Next data (or hole) starts at this offset.
    Offset(u64),
    /// No data (or hole) remains after the probed offset.
    Exhausted,
    /// The filesystem cannot answer hole queries.
    Unsupported,
}

/// Sparse-region probing over an open file.
pub trait SparseProbe {
    /// Offset of the first data byte at or after `offset`.
    fn seek_data(&self, file: &File, offset: u64) -> io::Result<EnumProbeOutcome>;
    /// Offset of the first hole byte at or after `offset`.
    fn seek_hole(&self, file: &File, offset: u64) -> io::Result<EnumProbeOutcome>;
}

/// `lseek(2)` based probe.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSparseProbe;

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
impl SystemSparseProbe {
    fn probe(file: &File, offset: u64, whence: libc::c_int) -> io::Result<EnumProbeOutcome> {
        use std::os::unix::io::AsRawFd;

        let Ok(off) = libc::off_t::try_from(offset) else {
            return Ok(EnumProbeOutcome::Exhausted);
        };
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let ret = unsafe { libc::lseek(file.as_raw_fd(), off, whence) };
        if ret >= 0 {
            return Ok(EnumProbeOutcome::Offset(ret as u64));
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENXIO) => Ok(EnumProbeOutcome::Exhausted),
            Some(libc::ENOTTY) | Some(libc::EINVAL) | Some(libc::EOPNOTSUPP) => {
                Ok(EnumProbeOutcome::Unsupported)
            }
            _ => Err(err),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
impl SparseProbe for SystemSparseProbe {
    fn seek_data(&self, file: &File, offset: u64) -> io::Result<EnumProbeOutcome> {
        Self::probe(file, offset, libc::SEEK_DATA)
    }

    fn seek_hole(&self, file: &File, offset: u64) -> io::Result<EnumProbeOutcome> {
        Self::probe(file, offset, libc::SEEK_HOLE)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
impl SparseProbe for SystemSparseProbe {
    fn seek_data(&self, _file: &File, _offset: u64) -> io::Result<EnumProbeOutcome> {
        Ok(EnumProbeOutcome::Unsupported)
    }

    fn seek_hole(&self, _file: &File, _offset: u64) -> io::Result<EnumProbeOutcome> {
        Ok(EnumProbeOutcome::Unsupported)
    }
}

/// Bytes moved by one file transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpecTransferStats {
    /// Bytes read from data regions and written out.
    pub n_bytes_data: u64,
    /// Final logical length of the destination.
    pub n_bytes_total: u64,
}

/// Effective destination file: `dst/basename(src)` when `dst` is a directory.
pub fn resolve_destination_file(path_src: &Path, path_dst: &Path) -> PathBuf {
    if path_dst.is_dir()
        && let Some(name) = path_src.file_name()
    {
        return path_dst.join(name);
    }
    path_dst.to_path_buf()
}

fn content_err(op: &'static str) -> impl FnOnce(io::Error) -> EnumCopyFailure {
    move |source| EnumCopyFailure::ContentIo { op, source }
}

/// Copy the bytes of `path_src` into `path_dst`, skipping holes.
///
/// `path_dst` is created or truncated. Both files are closed on return,
/// whatever the outcome.
pub fn copy_file_sparse(
    path_src: &Path,
    path_dst: &Path,
    probe: &dyn SparseProbe,
) -> Result<SpecTransferStats, EnumCopyFailure> {
    let mut file_src = File::open(path_src).map_err(content_err("open source"))?;
    let end_pos = file_src
        .metadata()
        .map_err(content_err("stat source"))?
        .len();
    let mut file_dst = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path_dst)
        .map_err(content_err("open destination"))?;

    let mut buf = vec![0_u8; CHUNK_SIZE_MAX.min(end_pos) as usize];
    let mut n_bytes_data = 0_u64;
    let mut cur_pos = 0_u64;
    while cur_pos < end_pos {
        let start_pos = match probe
            .seek_data(&file_src, cur_pos)
            .map_err(content_err("probe data region"))?
        {
            EnumProbeOutcome::Offset(pos) => pos.clamp(cur_pos, end_pos),
            EnumProbeOutcome::Exhausted => end_pos,
            EnumProbeOutcome::Unsupported => cur_pos,
        };
        let mut next_pos = if start_pos < end_pos {
            match probe
                .seek_hole(&file_src, start_pos)
                .map_err(content_err("probe hole region"))?
            {
                EnumProbeOutcome::Offset(pos) => pos.min(end_pos),
                EnumProbeOutcome::Exhausted | EnumProbeOutcome::Unsupported => end_pos,
            }
        } else {
            end_pos
        };
        if next_pos <= start_pos {
            next_pos = end_pos;
        }
        trace!(start_pos, next_pos, "copying data region");

        let mut pos = start_pos;
        while pos < next_pos {
            let n_want = (next_pos - pos).min(CHUNK_SIZE_MAX) as usize;
            file_src
                .seek(SeekFrom::Start(pos))
                .map_err(content_err("seek source"))?;
            let n_read = read_full(&mut file_src, &mut buf[..n_want]).map_err(content_err("read"))?;
            if n_read == 0 {
                // Source shrank under us; the final set_len restores the length.
                break;
            }
            file_dst
                .seek(SeekFrom::Start(pos))
                .map_err(content_err("seek destination"))?;
            file_dst
                .write_all(&buf[..n_read])
                .map_err(content_err("write"))?;
            pos += n_read as u64;
            n_bytes_data += n_read as u64;
        }
        cur_pos = next_pos;
    }

    file_dst
        .set_len(end_pos)
        .map_err(content_err("truncate destination"))?;
    debug!(
        src = %path_src.display(),
        dst = %path_dst.display(),
        n_bytes_data,
        n_bytes_total = end_pos,
        "file content copied"
    );
    Ok(SpecTransferStats {
        n_bytes_data,
        n_bytes_total: end_pos,
    })
}

fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut n_filled = 0;
    while n_filled < buf.len() {
        match file.read(&mut buf[n_filled..]) {
            Ok(0) => break,
            Ok(n) => n_filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(n_filled)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::{Seek, SeekFrom, Write};

    use tempfile::TempDir;

    use super::*;

    /// Probe answering from a fixed list of `[start, end)` data regions.
    struct ScriptedProbe {
        l_regions: Vec<(u64, u64)>,
    }

    impl SparseProbe for ScriptedProbe {
        fn seek_data(&self, _file: &File, offset: u64) -> io::Result<EnumProbeOutcome> {
            Ok(self
                .l_regions
                .iter()
                .find(|(_, end)| *end > offset)
                .map(|(start, _)| EnumProbeOutcome::Offset((*start).max(offset)))
                .unwrap_or(EnumProbeOutcome::Exhausted))
        }

        fn seek_hole(&self, _file: &File, offset: u64) -> io::Result<EnumProbeOutcome> {
            Ok(self
                .l_regions
                .iter()
                .find(|(start, end)| *start <= offset && offset < *end)
                .map(|(_, end)| EnumProbeOutcome::Offset(*end))
                .unwrap_or(EnumProbeOutcome::Offset(offset)))
        }
    }

    struct UnsupportedProbe;

    impl SparseProbe for UnsupportedProbe {
        fn seek_data(&self, _file: &File, _offset: u64) -> io::Result<EnumProbeOutcome> {
            Ok(EnumProbeOutcome::Unsupported)
        }

        fn seek_hole(&self, _file: &File, _offset: u64) -> io::Result<EnumProbeOutcome> {
            Ok(EnumProbeOutcome::Unsupported)
        }
    }

    struct FailingProbe;

    impl SparseProbe for FailingProbe {
        fn seek_data(&self, _file: &File, _offset: u64) -> io::Result<EnumProbeOutcome> {
            Err(io::Error::from_raw_os_error(libc::EIO))
        }

        fn seek_hole(&self, _file: &File, _offset: u64) -> io::Result<EnumProbeOutcome> {
            Err(io::Error::from_raw_os_error(libc::EIO))
        }
    }

    #[test]
    fn scripted_holes_are_not_written() {
        let tmp = TempDir::new().expect("temp dir");
        let src = tmp.path().join("src.bin");
        let dst = tmp.path().join("dst.bin");
        fs::write(&src, b"AAAABBBBCCCC").expect("write src");

        let probe = ScriptedProbe {
            l_regions: vec![(0, 4), (8, 12)],
        };
        let stats = copy_file_sparse(&src, &dst, &probe).expect("copy");

        assert_eq!(stats.n_bytes_data, 8);
        assert_eq!(stats.n_bytes_total, 12);
        assert_eq!(fs::read(&dst).expect("read dst"), b"AAAA\0\0\0\0CCCC");
    }

    #[test]
    fn trailing_hole_restores_length() {
        let tmp = TempDir::new().expect("temp dir");
        let src = tmp.path().join("src.bin");
        let dst = tmp.path().join("dst.bin");
        fs::write(&src, vec![7_u8; 64]).expect("write src");

        let probe = ScriptedProbe {
            l_regions: vec![(0, 16)],
        };
        let stats = copy_file_sparse(&src, &dst, &probe).expect("copy");

        assert_eq!(stats.n_bytes_data, 16);
        let raw = fs::read(&dst).expect("read dst");
        assert_eq!(raw.len(), 64);
        assert!(raw[..16].iter().all(|b| *b == 7));
        assert!(raw[16..].iter().all(|b| *b == 0));
    }

    #[test]
    fn file_without_data_regions_is_all_hole() {
        let tmp = TempDir::new().expect("temp dir");
        let src = tmp.path().join("src.bin");
        let dst = tmp.path().join("dst.bin");
        fs::write(&src, vec![1_u8; 32]).expect("write src");

        let probe = ScriptedProbe { l_regions: vec![] };
        let stats = copy_file_sparse(&src, &dst, &probe).expect("copy");

        assert_eq!(stats.n_bytes_data, 0);
        assert_eq!(fs::read(&dst).expect("read dst"), vec![0_u8; 32]);
    }

    #[test]
    fn unsupported_probe_falls_back_to_dense_copy() {
        let tmp = TempDir::new().expect("temp dir");
        let src = tmp.path().join("src.bin");
        let dst = tmp.path().join("dst.bin");
        let raw: Vec<u8> = (0..(CHUNK_SIZE_MAX as usize * 2 + 123))
            .map(|i| (i % 251) as u8)
            .collect();
        fs::write(&src, &raw).expect("write src");

        let stats = copy_file_sparse(&src, &dst, &UnsupportedProbe).expect("copy");

        assert_eq!(stats.n_bytes_data, raw.len() as u64);
        assert_eq!(fs::read(&dst).expect("read dst"), raw);
    }

    #[test]
    fn probe_failure_is_content_error() {
        let tmp = TempDir::new().expect("temp dir");
        let src = tmp.path().join("src.bin");
        let dst = tmp.path().join("dst.bin");
        fs::write(&src, b"data").expect("write src");

        let err = copy_file_sparse(&src, &dst, &FailingProbe).expect_err("probe fails");
        assert!(matches!(
            err,
            EnumCopyFailure::ContentIo {
                op: "probe data region",
                ..
            }
        ));
    }

    #[test]
    fn destination_is_truncated_before_copy() {
        let tmp = TempDir::new().expect("temp dir");
        let src = tmp.path().join("src.bin");
        let dst = tmp.path().join("dst.bin");
        fs::write(&src, b"new").expect("write src");
        fs::write(&dst, b"much longer old content").expect("write dst");

        copy_file_sparse(&src, &dst, &SystemSparseProbe).expect("copy");
        assert_eq!(fs::read(&dst).expect("read dst"), b"new");
    }

    #[test]
    fn missing_source_reports_open_failure() {
        let tmp = TempDir::new().expect("temp dir");
        let err = copy_file_sparse(
            &tmp.path().join("missing"),
            &tmp.path().join("dst"),
            &SystemSparseProbe,
        )
        .expect_err("missing source");
        assert!(matches!(
            err,
            EnumCopyFailure::ContentIo {
                op: "open source",
                ..
            }
        ));
        assert!(!tmp.path().join("dst").exists());
    }

    #[test]
    fn system_probe_preserves_sparse_file_content() {
        let tmp = TempDir::new().expect("temp dir");
        let src = tmp.path().join("sparse.bin");
        let dst = tmp.path().join("copy.bin");

        let n_data = 4096_u64;
        let n_hole = 8 * CHUNK_SIZE_MAX;
        {
            let mut file = File::create(&src).expect("create src");
            file.write_all(&vec![0xAB_u8; n_data as usize]).expect("write data");
            file.set_len(n_data + n_hole).expect("extend with hole");
        }

        let stats = copy_file_sparse(&src, &dst, &SystemSparseProbe).expect("copy");
        assert_eq!(stats.n_bytes_total, n_data + n_hole);
        assert!(stats.n_bytes_data >= n_data);

        let raw_src = fs::read(&src).expect("read src");
        let raw_dst = fs::read(&dst).expect("read dst");
        assert_eq!(raw_dst.len() as u64, n_data + n_hole);
        assert_eq!(raw_src, raw_dst);
    }

    #[test]
    fn system_probe_handles_leading_hole() {
        let tmp = TempDir::new().expect("temp dir");
        let src = tmp.path().join("sparse.bin");
        let dst = tmp.path().join("copy.bin");
        {
            let mut file = File::create(&src).expect("create src");
            file.seek(SeekFrom::Start(3 * CHUNK_SIZE_MAX)).expect("seek");
            file.write_all(b"tail").expect("write tail");
        }

        copy_file_sparse(&src, &dst, &SystemSparseProbe).expect("copy");
        assert_eq!(
            fs::read(&src).expect("read src"),
            fs::read(&dst).expect("read dst")
        );
    }

    #[test]
    fn destination_directory_gets_source_basename() {
        let tmp = TempDir::new().expect("temp dir");
        let dir = tmp.path().join("out");
        fs::create_dir(&dir).expect("mkdir");
        let src = tmp.path().join("a.txt");

        assert_eq!(resolve_destination_file(&src, &dir), dir.join("a.txt"));
        assert_eq!(
            resolve_destination_file(&src, &tmp.path().join("b.txt")),
            tmp.path().join("b.txt")
        );
    }
}
