use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::error::{PackError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
    TarBz2,
    TarXz,
    TarZst,
    Squashfs,
    Parcel,
    NoArchive,
}

impl ArchiveFormat {
    /// Infer a format from the output extension (`.tgz`-style aliases
    /// included).
    pub fn infer(output: &Path) -> Result<Self> {
        let name = output.file_name().unwrap_or_default().to_string_lossy();
        let inferred = if name.ends_with(".parcel") {
            ArchiveFormat::Parcel
        } else if name.ends_with(".zip") {
            ArchiveFormat::Zip
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            ArchiveFormat::TarGz
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
            ArchiveFormat::TarBz2
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            ArchiveFormat::TarXz
        } else if name.ends_with(".tar.zst") {
            ArchiveFormat::TarZst
        } else if name.ends_with(".tar") {
            ArchiveFormat::Tar
        } else if name.ends_with(".squashfs") {
            ArchiveFormat::Squashfs
        } else {
            return Err(PackError::InvalidConfig(format!(
                "cannot infer an archive format from {name:?}"
            )));
        };
        Ok(inferred)
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::TarBz2 => "tar.bz2",
            ArchiveFormat::TarXz => "tar.xz",
            ArchiveFormat::TarZst => "tar.zst",
            ArchiveFormat::Squashfs => "squashfs",
            ArchiveFormat::Parcel => "parcel",
            ArchiveFormat::NoArchive => "",
        }
    }

    /// Reproducible output (zeroed timestamps, fixed ownership) is the
    /// default where the container can honor it cheaply.
    pub fn reproducible_by_default(&self) -> bool {
        matches!(
            self,
            ArchiveFormat::Tar | ArchiveFormat::TarGz | ArchiveFormat::TarZst
        )
    }
}

/// SquashFS data codec, chosen explicitly rather than derived from the
/// numeric compression level (the historical level->codec mapping drifted
/// between releases).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SquashfsCodec {
    None,
    #[default]
    Zstd,
    Xz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Exclude,
    Include,
}

#[derive(Debug, Clone, Default)]
pub struct ParcelOptions {
    pub root: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub distribution: Option<String>,
}

pub const DEFAULT_PARCEL_ROOT: &str = "/opt/cloudera/parcels";
pub const DEFAULT_PARCEL_DISTRO: &str = "el7";

#[derive(Clone)]
pub struct PackOptions {
    /// Environment location; exactly one of `prefix`/`name` must be set.
    pub prefix: Option<PathBuf>,
    pub name: Option<String>,
    pub output: Option<PathBuf>,
    /// `None` infers from the output extension (default `tar.gz`).
    pub format: Option<ArchiveFormat>,
    /// 0-9, interpreted per sink.
    pub compress_level: u32,
    /// `-1` = all cores, `0`/`1` = serial.
    pub n_threads: i32,
    /// Directory all entries are stored under inside the archive.
    pub arcroot: String,
    /// Target prefix written into text rewrites; defaults to the neutral
    /// placeholder.
    pub dest_prefix: Option<String>,
    pub ignore_editable_packages: bool,
    pub ignore_missing_files: bool,
    /// Also include unmanaged files under conda's own bookkeeping
    /// directories.
    pub unmanaged: bool,
    pub force: bool,
    pub zip_symlinks: bool,
    pub zip_64: bool,
    /// Ship text files unchanged and defer their rewrite to the runner.
    pub defer_text: bool,
    pub allow_cross_prefix: bool,
    /// Drop (with a warning) entries whose paths overflow the format instead
    /// of failing.
    pub ignore_long_paths: bool,
    pub squashfs_codec: SquashfsCodec,
    pub parcel: ParcelOptions,
    /// Ordered include/exclude glob filters, applied after classification.
    pub filters: Vec<(FilterKind, String)>,
    /// `None` = per-format default.
    pub reproducible: Option<bool>,
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            prefix: None,
            name: None,
            output: None,
            format: None,
            compress_level: 4,
            n_threads: 1,
            arcroot: String::new(),
            dest_prefix: None,
            ignore_editable_packages: false,
            ignore_missing_files: false,
            unmanaged: false,
            force: false,
            zip_symlinks: false,
            zip_64: true,
            defer_text: false,
            allow_cross_prefix: false,
            ignore_long_paths: false,
            squashfs_codec: SquashfsCodec::default(),
            parcel: ParcelOptions::default(),
            filters: Vec::new(),
            reproducible: None,
            cancel: None,
        }
    }
}

impl std::fmt::Debug for PackOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackOptions")
            .field("prefix", &self.prefix)
            .field("name", &self.name)
            .field("output", &self.output)
            .field("format", &self.format)
            .field("compress_level", &self.compress_level)
            .field("n_threads", &self.n_threads)
            .field("arcroot", &self.arcroot)
            .field("dest_prefix", &self.dest_prefix)
            .finish_non_exhaustive()
    }
}

impl PackOptions {
    pub(crate) fn resolved_threads(&self) -> usize {
        match self.n_threads {
            -1 => std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1),
            n if n <= 1 => 1,
            n => n as usize,
        }
    }
}
