use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use super::ArchiveSink;
use crate::error::{PackError, Result};

/// "no-archive" sink: materializes the rewritten tree directly on disk.
/// Entries land in a staging directory next to the destination; finalize is
/// one rename.
pub struct DirSink {
    staging: Option<TempDir>,
    output: PathBuf,
}

impl DirSink {
    pub fn create(output: &Path) -> Result<Self> {
        let parent = output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let staging = tempfile::Builder::new()
            .prefix(".packenv-")
            .tempdir_in(parent)
            .map_err(|err| PackError::io("failed to create staging directory", err))?;
        Ok(Self {
            staging: Some(staging),
            output: output.to_path_buf(),
        })
    }

    /// Staging sink for formats (SquashFS) that batch-compress a finished
    /// tree; the staging directory outlives `finish` and is cleaned up by the
    /// wrapping sink.
    pub(crate) fn staging_only() -> Result<Self> {
        let staging = tempfile::Builder::new()
            .prefix(".packenv-stage-")
            .tempdir()
            .map_err(|err| PackError::io("failed to create staging directory", err))?;
        Ok(Self {
            staging: Some(staging),
            output: PathBuf::new(),
        })
    }

    pub(crate) fn staging_path(&self) -> &Path {
        self.staging.as_ref().expect("staging alive").path()
    }

    fn entry_path(&self, arcname: &str) -> PathBuf {
        self.staging_path().join(arcname)
    }

    fn entry_err(arcname: &str, err: io::Error) -> PackError {
        PackError::io(format!("failed to stage {arcname}"), err)
    }

    pub(crate) fn add_dir(&mut self, arcname: &str, mode: u32, _mtime: u64) -> Result<()> {
        let path = self.entry_path(arcname);
        fs::create_dir_all(&path).map_err(|err| Self::entry_err(arcname, err))?;
        set_mode(&path, mode).map_err(|err| Self::entry_err(arcname, err))?;
        Ok(())
    }

    pub(crate) fn add_file(
        &mut self,
        arcname: &str,
        mode: u32,
        _mtime: u64,
        content: &mut dyn Read,
    ) -> Result<()> {
        let path = self.entry_path(arcname);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| Self::entry_err(arcname, err))?;
        }
        let mut file = File::create(&path).map_err(|err| Self::entry_err(arcname, err))?;
        io::copy(content, &mut file).map_err(|err| Self::entry_err(arcname, err))?;
        set_mode(&path, mode).map_err(|err| Self::entry_err(arcname, err))?;
        Ok(())
    }

    pub(crate) fn add_link(&mut self, arcname: &str, target: &str) -> Result<()> {
        let path = self.entry_path(arcname);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| Self::entry_err(arcname, err))?;
        }
        make_symlink(target, &path).map_err(|err| Self::entry_err(arcname, err))?;
        Ok(())
    }

    pub(crate) fn finish(mut self) -> Result<()> {
        let staging = self.staging.take().expect("staging alive").into_path();
        fs::rename(&staging, &self.output).map_err(|err| {
            let _ = fs::remove_dir_all(&staging);
            PackError::io(
                format!("failed to move tree into {}", self.output.display()),
                err,
            )
        })?;
        Ok(())
    }
}

impl ArchiveSink for DirSink {
    fn add_directory(&mut self, arcname: &str, mode: u32, mtime: u64) -> Result<()> {
        self.add_dir(arcname, mode, mtime)
    }

    fn add_regular(
        &mut self,
        arcname: &str,
        mode: u32,
        mtime: u64,
        _size: u64,
        content: &mut dyn Read,
    ) -> Result<()> {
        self.add_file(arcname, mode, mtime, content)
    }

    fn add_symlink(&mut self, arcname: &str, _mode: u32, _mtime: u64, target: &str) -> Result<()> {
        self.add_link(arcname, target)
    }

    fn finalize(self: Box<Self>) -> Result<()> {
        (*self).finish()
    }

    fn abort(self: Box<Self>) {
        // TempDir removes the staged tree on drop.
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &str, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn make_symlink(_target: &str, _link: &Path) -> io::Result<()> {
    Err(io::Error::other("symlinks unsupported on this platform"))
}
