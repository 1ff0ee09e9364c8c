use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Everything that can stop a pack run.
///
/// Variants map one-to-one onto the failure modes a caller can react to;
/// anything downgradable (missing managed files, over-long paths) carries its
/// own `ignore_*` switch on [`crate::PackOptions`] and surfaces as a warning
/// on the report instead when the switch is set.
#[derive(Debug, Error)]
pub enum PackError {
    #[error("environment path {0:?} does not exist")]
    MissingEnvironment(PathBuf),

    #[error("{0:?} is not a conda environment (no conda-meta/ directory)")]
    NotAnEnvironment(PathBuf),

    #[error(
        "package {name} {version} has no entry in the package cache ({cache_dir:?}); \
         re-download it or pass --ignore-missing-files to treat its files as unmanaged"
    )]
    MissingPackageCache {
        name: String,
        version: String,
        cache_dir: PathBuf,
    },

    #[error("both {first} and {second} claim ownership of {path}")]
    ConflictingOwnership {
        path: String,
        first: String,
        second: String,
    },

    #[error(
        "files managed by the following packages are missing from disk \
         (pip/conda clobbering is the usual cause):\n{listing}"
    )]
    MissingManagedFiles { listing: String },

    #[error(
        "destination prefix {dest:?} ({dest_len} bytes) is longer than the \
         binary placeholder in {path} ({placeholder_len} bytes); pick a shorter \
         destination"
    )]
    DestinationPrefixTooLong {
        dest: String,
        dest_len: usize,
        path: String,
        placeholder_len: usize,
    },

    #[error(
        "{path} was installed for prefix {placeholder:?}, not {prefix:?}; \
         pass --allow-cross-prefix to pack it anyway"
    )]
    CrossPrefixInstall {
        path: String,
        placeholder: String,
        prefix: String,
    },

    #[error("output {0:?} already exists (use --force to overwrite)")]
    OutputExists(PathBuf),

    #[error("cannot write {format} archives: {tool} not found on PATH")]
    FormatUnavailable { format: &'static str, tool: String },

    #[error("entry path {path} exceeds the {limit}-byte limit of the {format} format")]
    PathTooLongForFormat {
        path: String,
        format: &'static str,
        limit: usize,
    },

    #[error(
        "cannot pack an environment with editable packages installed \
         (e.g. from `pip install -e`); found:\n{listing}\n\
         pass --ignore-editable-packages to skip this check"
    )]
    EditablePackages { listing: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("while packing {path}: {source}")]
    Worker {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("pack cancelled")]
    Cancelled,

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl PackError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        PackError::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, PackError>;
