use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use flate2::{Compression, GzBuilder};
use tar::{Builder, EntryType, Header};
use tempfile::{NamedTempFile, TempPath};

use super::pargz::ParallelGzWriter;
use super::ArchiveSink;
use crate::config::ArchiveFormat;
use crate::error::{PackError, Result};

/// Compressing writer that knows how to close its own stream.
pub(crate) trait FinishWrite: Write + Send {
    fn finish(self: Box<Self>) -> io::Result<()>;
}

struct Plain(File);
impl Write for Plain {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}
impl FinishWrite for Plain {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.0.flush()
    }
}

struct Gz(flate2::write::GzEncoder<File>);
impl Write for Gz {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}
impl FinishWrite for Gz {
    fn finish(self: Box<Self>) -> io::Result<()> {
        self.0.finish().map(drop)
    }
}

struct ParGz(ParallelGzWriter<File>);
impl Write for ParGz {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}
impl FinishWrite for ParGz {
    fn finish(self: Box<Self>) -> io::Result<()> {
        self.0.finish().map(drop)
    }
}

struct Bz2(bzip2::write::BzEncoder<File>);
impl Write for Bz2 {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}
impl FinishWrite for Bz2 {
    fn finish(self: Box<Self>) -> io::Result<()> {
        self.0.finish().map(drop)
    }
}

struct Xz(xz2::write::XzEncoder<File>);
impl Write for Xz {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}
impl FinishWrite for Xz {
    fn finish(self: Box<Self>) -> io::Result<()> {
        self.0.finish().map(drop)
    }
}

struct Zst(zstd::stream::write::Encoder<'static, File>);
impl Write for Zst {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}
impl FinishWrite for Zst {
    fn finish(self: Box<Self>) -> io::Result<()> {
        self.0.finish().map(drop)
    }
}

pub struct TarSink {
    builder: Builder<Box<dyn FinishWrite>>,
    temp: Option<TempPath>,
    output: PathBuf,
    reproducible: bool,
}

impl TarSink {
    pub fn create(
        output: &Path,
        format: ArchiveFormat,
        level: u32,
        n_threads: usize,
        reproducible: bool,
    ) -> Result<Self> {
        let parent = output.parent().filter(|p| !p.as_os_str().is_empty());
        let temp = NamedTempFile::new_in(parent.unwrap_or_else(|| Path::new(".")))
            .map_err(|err| PackError::io("failed to create temp archive", err))?;
        let (file, temp_path) = temp.into_parts();
        let level = level.min(9);

        let writer: Box<dyn FinishWrite> = match format {
            ArchiveFormat::Tar => Box::new(Plain(file)),
            ArchiveFormat::TarGz | ArchiveFormat::Parcel => {
                if n_threads > 1 {
                    Box::new(ParGz(
                        ParallelGzWriter::new(file, level, n_threads)
                            .map_err(|err| PackError::io("failed to start gzip writer", err))?,
                    ))
                } else {
                    Box::new(Gz(GzBuilder::new()
                        .mtime(0)
                        .write(file, Compression::new(level))))
                }
            }
            ArchiveFormat::TarBz2 => Box::new(Bz2(bzip2::write::BzEncoder::new(
                file,
                bzip2::Compression::new(level.clamp(1, 9)),
            ))),
            ArchiveFormat::TarXz => Box::new(Xz(xz2::write::XzEncoder::new(file, level))),
            ArchiveFormat::TarZst => {
                let mut encoder = zstd::stream::write::Encoder::new(file, level as i32)
                    .map_err(|err| PackError::io("failed to start zstd writer", err))?;
                if n_threads > 1 {
                    encoder
                        .multithread(n_threads as u32)
                        .map_err(|err| PackError::io("failed to start zstd workers", err))?;
                }
                Box::new(Zst(encoder))
            }
            other => {
                return Err(PackError::InvalidConfig(format!(
                    "{other:?} is not a tar format"
                )))
            }
        };

        let mut builder = Builder::new(writer);
        builder.follow_symlinks(false);
        Ok(Self {
            builder,
            temp: Some(temp_path),
            output: output.to_path_buf(),
            reproducible,
        })
    }

    fn header(&self, mode: u32, mtime: u64) -> Header {
        let mut header = Header::new_gnu();
        header.set_mode(mode);
        header.set_uid(0);
        header.set_gid(0);
        let _ = header.set_username("");
        let _ = header.set_groupname("");
        header.set_mtime(if self.reproducible { 0 } else { mtime });
        header
    }

    fn entry_err(&self, arcname: &str, err: io::Error) -> PackError {
        PackError::io(format!("failed to add {arcname} to {}", self.output.display()), err)
    }

    pub(crate) fn add_dir(&mut self, arcname: &str, mode: u32, mtime: u64) -> Result<()> {
        let mut header = self.header(mode, mtime);
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        self.builder
            .append_data(&mut header, Path::new(arcname), io::empty())
            .map_err(|err| self.entry_err(arcname, err))
    }

    pub(crate) fn add_file(
        &mut self,
        arcname: &str,
        mode: u32,
        mtime: u64,
        size: u64,
        content: &mut dyn Read,
    ) -> Result<()> {
        let mut header = self.header(mode, mtime);
        header.set_entry_type(EntryType::Regular);
        header.set_size(size);
        self.builder
            .append_data(&mut header, Path::new(arcname), content)
            .map_err(|err| self.entry_err(arcname, err))
    }

    pub(crate) fn add_link(
        &mut self,
        arcname: &str,
        mode: u32,
        mtime: u64,
        target: &str,
    ) -> Result<()> {
        let mut header = self.header(mode, mtime);
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        self.builder
            .append_link(&mut header, Path::new(arcname), Path::new(target))
            .map_err(|err| self.entry_err(arcname, err))
    }

    pub(crate) fn finish(mut self) -> Result<()> {
        let writer = self
            .builder
            .into_inner()
            .map_err(|err| PackError::io("failed to finish tar stream", err))?;
        writer
            .finish()
            .map_err(|err| PackError::io("failed to flush compressed stream", err))?;
        let temp = self.temp.take().expect("temp path present until finalize");
        temp.persist(&self.output).map_err(|err| {
            PackError::io(
                format!("failed to move archive into {}", self.output.display()),
                err.error,
            )
        })?;
        Ok(())
    }
}

impl ArchiveSink for TarSink {
    fn add_directory(&mut self, arcname: &str, mode: u32, mtime: u64) -> Result<()> {
        self.add_dir(arcname, mode, mtime)
    }

    fn add_regular(
        &mut self,
        arcname: &str,
        mode: u32,
        mtime: u64,
        size: u64,
        content: &mut dyn Read,
    ) -> Result<()> {
        self.add_file(arcname, mode, mtime, size, content)
    }

    fn add_symlink(&mut self, arcname: &str, mode: u32, mtime: u64, target: &str) -> Result<()> {
        self.add_link(arcname, mode, mtime, target)
    }

    fn finalize(self: Box<Self>) -> Result<()> {
        (*self).finish()
    }

    fn abort(self: Box<Self>) {
        // TempPath removes the partial archive on drop.
    }
}
