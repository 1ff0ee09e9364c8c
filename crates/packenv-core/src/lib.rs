//! packenv-core: turn an installed conda environment into a relocatable
//! archive.
//!
//! The analyzer enumerates and classifies every file under the prefix,
//! rewrites textual prefix references while streaming into the chosen
//! archive container, and records binary references for the bundled
//! `conda-unpack` runner to patch after extraction.

#![deny(clippy::all)]

pub mod config;
pub mod error;
pub mod formats;
pub mod inventory;
pub mod pack;
pub mod pipeline;
pub mod prefixes;
pub mod progress;
pub mod rewrite;
pub mod unpack;
pub mod walk;

pub use config::{ArchiveFormat, FilterKind, PackOptions, ParcelOptions, SquashfsCodec};
pub use error::{PackError, Result};
pub use inventory::{CondaMetaOracle, Package, PackageOracle, PrefixKind};
pub use pack::{pack, PackReport};
pub use prefixes::NEUTRAL_PLACEHOLDER;
pub use progress::{NullProgress, ProgressSink};
