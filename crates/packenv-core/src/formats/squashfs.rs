use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::{NamedTempFile, TempPath};
use tracing::debug;

use super::dir::DirSink;
use super::ArchiveSink;
use crate::config::SquashfsCodec;
use crate::error::{PackError, Result};

/// SquashFS has no incremental writer; entries are staged on disk and
/// `mksquashfs` batch-compresses the finished tree at finalize time.
pub struct SquashfsSink {
    staging: DirSink,
    temp: Option<TempPath>,
    output: PathBuf,
    codec: SquashfsCodec,
    n_threads: usize,
    tool: PathBuf,
}

impl SquashfsSink {
    pub fn create(output: &Path, codec: SquashfsCodec, n_threads: usize) -> Result<Self> {
        let tool = which::which("mksquashfs").map_err(|_| PackError::FormatUnavailable {
            format: "squashfs",
            tool: "mksquashfs".to_string(),
        })?;
        let parent = output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let temp = NamedTempFile::new_in(parent)
            .map_err(|err| PackError::io("failed to create temp archive", err))?;
        let (_, temp_path) = temp.into_parts();
        Ok(Self {
            staging: DirSink::staging_only()?,
            temp: Some(temp_path),
            output: output.to_path_buf(),
            codec,
            n_threads,
            tool,
        })
    }
}

impl ArchiveSink for SquashfsSink {
    fn add_directory(&mut self, arcname: &str, mode: u32, mtime: u64) -> Result<()> {
        self.staging.add_dir(arcname, mode, mtime)
    }

    fn add_regular(
        &mut self,
        arcname: &str,
        mode: u32,
        mtime: u64,
        _size: u64,
        content: &mut dyn Read,
    ) -> Result<()> {
        self.staging.add_file(arcname, mode, mtime, content)
    }

    fn add_symlink(&mut self, arcname: &str, _mode: u32, _mtime: u64, target: &str) -> Result<()> {
        self.staging.add_link(arcname, target)
    }

    fn finalize(mut self: Box<Self>) -> Result<()> {
        let temp = self.temp.take().expect("temp path present until finalize");
        let mut command = Command::new(&self.tool);
        command
            .arg(self.staging.staging_path())
            .arg(&*temp)
            .args(["-noappend", "-quiet", "-all-root"])
            .arg("-processors")
            .arg(self.n_threads.max(1).to_string());
        match self.codec {
            SquashfsCodec::None => {
                command.args(["-noI", "-noD", "-noF", "-noX"]);
            }
            SquashfsCodec::Zstd => {
                command.args(["-comp", "zstd"]);
            }
            SquashfsCodec::Xz => {
                command.args(["-comp", "xz"]);
            }
        }
        debug!(?command, "running mksquashfs");
        let output = command
            .output()
            .map_err(|err| PackError::io("failed to run mksquashfs", err))?;
        if !output.status.success() {
            return Err(PackError::io(
                format!(
                    "mksquashfs failed (exit {:?}): {}",
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                std::io::Error::other("mksquashfs error"),
            ));
        }
        temp.persist(&self.output).map_err(|err| {
            PackError::io(
                format!("failed to move archive into {}", self.output.display()),
                err.error,
            )
        })?;
        Ok(())
    }

    fn abort(self: Box<Self>) {}
}
