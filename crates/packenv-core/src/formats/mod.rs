//! Archive sinks.
//!
//! Every container format implements [`ArchiveSink`]: a uniform, ordered
//! stream of directory/regular/symlink entries, finalized exactly once with
//! an atomic rename from a temp file. `abort` drops any partial output.

use std::io::Read;
use std::path::Path;

use crate::config::{ArchiveFormat, SquashfsCodec};
use crate::error::{PackError, Result};

mod dir;
mod pargz;
mod parcel;
mod squashfs;
mod tar;
mod zip;

pub use dir::DirSink;
pub use parcel::{parcel_defines_script, parcel_json, ParcelSink};
pub use squashfs::SquashfsSink;
pub use tar::TarSink;
pub use zip::ZipSink;

pub trait ArchiveSink: Send {
    fn add_directory(&mut self, arcname: &str, mode: u32, mtime: u64) -> Result<()>;

    fn add_regular(
        &mut self,
        arcname: &str,
        mode: u32,
        mtime: u64,
        size: u64,
        content: &mut dyn Read,
    ) -> Result<()>;

    fn add_symlink(&mut self, arcname: &str, mode: u32, mtime: u64, target: &str) -> Result<()>;

    /// Flush, close, and atomically move the temp output into place.
    fn finalize(self: Box<Self>) -> Result<()>;

    /// Drop the temp output. Safe to call after a partial write.
    fn abort(self: Box<Self>);
}

/// Synthetic `meta/` payloads a parcel sink injects at finalize time.
pub struct ParcelPayload {
    pub arcroot: String,
    pub parcel_json: Vec<u8>,
    pub defines_script: Vec<u8>,
}

pub struct SinkOptions {
    pub compress_level: u32,
    pub n_threads: usize,
    pub reproducible: bool,
    pub zip_64: bool,
    pub squashfs_codec: SquashfsCodec,
    pub parcel: Option<ParcelPayload>,
}

pub fn open_sink(
    format: ArchiveFormat,
    output: &Path,
    opts: SinkOptions,
) -> Result<Box<dyn ArchiveSink>> {
    match format {
        ArchiveFormat::Tar
        | ArchiveFormat::TarGz
        | ArchiveFormat::TarBz2
        | ArchiveFormat::TarXz
        | ArchiveFormat::TarZst => Ok(Box::new(TarSink::create(
            output,
            format,
            opts.compress_level,
            opts.n_threads,
            opts.reproducible,
        )?)),
        ArchiveFormat::Zip => Ok(Box::new(ZipSink::create(
            output,
            opts.compress_level,
            opts.reproducible,
            opts.zip_64,
        )?)),
        ArchiveFormat::Squashfs => Ok(Box::new(SquashfsSink::create(
            output,
            opts.squashfs_codec,
            opts.n_threads,
        )?)),
        ArchiveFormat::NoArchive => Ok(Box::new(DirSink::create(output)?)),
        ArchiveFormat::Parcel => {
            let payload = opts.parcel.ok_or_else(|| {
                PackError::InvalidConfig("parcel output requires parcel metadata".to_string())
            })?;
            Ok(Box::new(ParcelSink::create(
                output,
                opts.compress_level,
                opts.n_threads,
                opts.reproducible,
                payload,
            )?))
        }
    }
}
