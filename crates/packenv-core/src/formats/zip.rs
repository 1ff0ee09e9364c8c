use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tempfile::{NamedTempFile, TempPath};
use zip::write::FileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use super::ArchiveSink;
use crate::error::{PackError, Result};

/// Entries at or past this size need ZIP64 extensions.
const ZIP64_THRESHOLD: u64 = 0xFFFF_FFFF;
const NAME_LIMIT: usize = u16::MAX as usize;

pub struct ZipSink {
    writer: ZipWriter<File>,
    temp: Option<TempPath>,
    output: PathBuf,
    level: u32,
    reproducible: bool,
    zip_64: bool,
}

impl ZipSink {
    pub fn create(output: &Path, level: u32, reproducible: bool, zip_64: bool) -> Result<Self> {
        let parent = output.parent().filter(|p| !p.as_os_str().is_empty());
        let temp = NamedTempFile::new_in(parent.unwrap_or_else(|| Path::new(".")))
            .map_err(|err| PackError::io("failed to create temp archive", err))?;
        let (file, temp_path) = temp.into_parts();
        Ok(Self {
            writer: ZipWriter::new(file),
            temp: Some(temp_path),
            output: output.to_path_buf(),
            level: level.min(9),
            reproducible,
            zip_64,
        })
    }

    fn options(&self, mode: u32, mtime: u64, size: u64) -> FileOptions {
        let options = FileOptions::default()
            .unix_permissions(mode)
            .last_modified_time(self.timestamp(mtime))
            .large_file(size >= ZIP64_THRESHOLD);
        if self.level == 0 {
            options.compression_method(CompressionMethod::Stored)
        } else {
            options
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(self.level as i32))
        }
    }

    /// Zip timestamps have 2-second granularity; reproducible output pins
    /// them to the DOS epoch (1980-01-01).
    fn timestamp(&self, mtime: u64) -> DateTime {
        if self.reproducible {
            return DateTime::default();
        }
        let Ok(when) = time::OffsetDateTime::from_unix_timestamp(mtime as i64) else {
            return DateTime::default();
        };
        DateTime::from_date_and_time(
            when.year().clamp(1980, 2107) as u16,
            u8::from(when.month()),
            when.day(),
            when.hour(),
            when.minute(),
            when.second(),
        )
        .unwrap_or_default()
    }

    fn check_entry(&self, arcname: &str, size: u64) -> Result<()> {
        if arcname.len() > NAME_LIMIT {
            return Err(PackError::PathTooLongForFormat {
                path: arcname.to_string(),
                format: "zip",
                limit: NAME_LIMIT,
            });
        }
        if size >= ZIP64_THRESHOLD && !self.zip_64 {
            return Err(PackError::PathTooLongForFormat {
                path: arcname.to_string(),
                format: "zip (ZIP64 disabled)",
                limit: ZIP64_THRESHOLD as usize,
            });
        }
        Ok(())
    }

    fn entry_err(&self, arcname: &str, err: zip::result::ZipError) -> PackError {
        PackError::io(
            format!("failed to add {arcname} to {}", self.output.display()),
            match err {
                zip::result::ZipError::Io(io_err) => io_err,
                other => io::Error::other(other),
            },
        )
    }
}

impl ArchiveSink for ZipSink {
    fn add_directory(&mut self, arcname: &str, mode: u32, mtime: u64) -> Result<()> {
        self.check_entry(arcname, 0)?;
        let options = self.options(mode, mtime, 0);
        self.writer
            .add_directory(arcname, options)
            .map_err(|err| self.entry_err(arcname, err))
    }

    fn add_regular(
        &mut self,
        arcname: &str,
        mode: u32,
        mtime: u64,
        size: u64,
        content: &mut dyn Read,
    ) -> Result<()> {
        self.check_entry(arcname, size)?;
        let options = self.options(mode, mtime, size);
        self.writer
            .start_file(arcname, options)
            .map_err(|err| self.entry_err(arcname, err))?;
        io::copy(content, &mut self.writer).map_err(|err| {
            PackError::io(
                format!("failed to write {arcname} into {}", self.output.display()),
                err,
            )
        })?;
        Ok(())
    }

    fn add_symlink(&mut self, arcname: &str, mode: u32, mtime: u64, target: &str) -> Result<()> {
        self.check_entry(arcname, 0)?;
        let options = self.options(mode, mtime, 0);
        self.writer
            .add_symlink(arcname, target, options)
            .map_err(|err| self.entry_err(arcname, err))
    }

    fn finalize(self: Box<Self>) -> Result<()> {
        let mut this = *self;
        this.writer.finish().map_err(|err| {
            PackError::io(
                format!("failed to finish {}", this.output.display()),
                match err {
                    zip::result::ZipError::Io(io_err) => io_err,
                    other => io::Error::other(other),
                },
            )
        })?;
        let temp = this.temp.take().expect("temp path present until finalize");
        temp.persist(&this.output).map_err(|err| {
            PackError::io(
                format!("failed to move archive into {}", this.output.display()),
                err.error,
            )
        })?;
        Ok(())
    }

    fn abort(self: Box<Self>) {}
}
