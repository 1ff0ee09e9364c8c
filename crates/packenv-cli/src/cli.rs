use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};
use packenv_core::{ArchiveFormat, FilterKind, PackOptions, ParcelOptions, SquashfsCodec};

pub const ABOUT: &str = "Pack a conda environment into a relocatable archive";

#[derive(Parser, Debug)]
#[command(
    name = "packenv",
    author,
    version,
    about = ABOUT,
    after_help = "Examples:\n    \
        packenv -p ./envs/analytics -o analytics.tar.gz\n    \
        packenv -n analytics --format zip --dest-prefix /srv/analytics\n    \
        packenv -p ./envs/analytics --format parcel --parcel-version 2026.08.01"
)]
#[allow(clippy::struct_excessive_bools)]
pub struct PackenvCli {
    #[arg(short, long, help = "Path to the environment to pack", conflicts_with = "name")]
    pub prefix: Option<PathBuf>,
    #[arg(short, long, help = "Name of the environment to pack (resolved via conda)")]
    pub name: Option<String>,
    #[arg(short, long, help = "Output path; the extension selects the format")]
    pub output: Option<PathBuf>,
    #[arg(long, value_enum, help = "Archive format (default: inferred from the output path)")]
    pub format: Option<FormatArg>,
    #[arg(
        long,
        default_value_t = 4,
        value_parser = clap::value_parser!(u32).range(0..=9),
        help = "Compression level, 0-9 (0 stores entries uncompressed where supported)"
    )]
    pub compress_level: u32,
    #[arg(
        short = 'j',
        long,
        default_value_t = 1,
        allow_negative_numbers = true,
        help = "Worker threads; -1 uses all cores, 0/1 runs serially"
    )]
    pub n_threads: i32,
    #[arg(long, default_value = "", help = "Directory all entries are stored under inside the archive")]
    pub arcroot: String,
    #[arg(long, help = "Rewrite prefixes to this path instead of the neutral placeholder")]
    pub dest_prefix: Option<String>,
    #[arg(long, help = "Skip the editable-packages check")]
    pub ignore_editable_packages: bool,
    #[arg(long, help = "Warn instead of failing when managed files are missing from disk")]
    pub ignore_missing_files: bool,
    #[arg(long, help = "Also pack unmanaged files under conda's bookkeeping directories")]
    pub unmanaged: bool,
    #[arg(short, long, help = "Overwrite existing output and create missing parent directories")]
    pub force: bool,
    #[arg(long, help = "Store symlinks in zip output (not every unzip supports them)")]
    pub zip_symlinks: bool,
    #[arg(long, help = "Disable ZIP64 extensions (limits entries to 4 GiB)")]
    pub no_zip_64: bool,
    #[arg(long, help = "Ship text files unchanged and defer their rewrite to conda-unpack")]
    pub defer_text: bool,
    #[arg(long, help = "Pack files recorded for a different install prefix")]
    pub allow_cross_prefix: bool,
    #[arg(long, help = "Drop entries whose paths overflow the format instead of failing")]
    pub ignore_long_paths: bool,
    #[arg(long, value_enum, default_value = "zstd", help = "SquashFS data codec")]
    pub squashfs_codec: CodecArg,
    #[arg(long, help = "(parcel) Directory the cluster unpacks parcels into")]
    pub parcel_root: Option<String>,
    #[arg(long, help = "(parcel) Parcel name; defaults to the environment name")]
    pub parcel_name: Option<String>,
    #[arg(long, help = "(parcel) Parcel version; defaults to today's date")]
    pub parcel_version: Option<String>,
    #[arg(long, help = "(parcel) Target distribution tag")]
    pub parcel_distribution: Option<String>,
    #[arg(long, value_name = "PATTERN", help = "Exclude files matching a glob (repeatable)")]
    pub exclude: Vec<String>,
    #[arg(
        long,
        value_name = "PATTERN",
        help = "Re-include previously excluded files matching a glob (repeatable)"
    )]
    pub include: Vec<String>,
    #[arg(long, conflicts_with = "no_reproducible", help = "Force reproducible output metadata")]
    pub reproducible: bool,
    #[arg(long, help = "Keep source timestamps instead of normalizing them")]
    pub no_reproducible: bool,
    #[arg(short, long, help = "Suppress progress and the final summary")]
    pub quiet: bool,
    #[arg(short, long, action = ArgAction::Count, help = "Increase logging (-vv reaches trace)")]
    pub verbose: u8,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatArg {
    Infer,
    Zip,
    Tar,
    #[value(name = "tar.gz")]
    TarGz,
    #[value(name = "tar.bz2")]
    TarBz2,
    #[value(name = "tar.xz")]
    TarXz,
    #[value(name = "tar.zst")]
    TarZst,
    Squashfs,
    Parcel,
    NoArchive,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecArg {
    None,
    Zstd,
    Xz,
}

impl PackenvCli {
    pub fn to_options(&self) -> PackOptions {
        let format = self.format.and_then(|format| match format {
            FormatArg::Infer => None,
            FormatArg::Zip => Some(ArchiveFormat::Zip),
            FormatArg::Tar => Some(ArchiveFormat::Tar),
            FormatArg::TarGz => Some(ArchiveFormat::TarGz),
            FormatArg::TarBz2 => Some(ArchiveFormat::TarBz2),
            FormatArg::TarXz => Some(ArchiveFormat::TarXz),
            FormatArg::TarZst => Some(ArchiveFormat::TarZst),
            FormatArg::Squashfs => Some(ArchiveFormat::Squashfs),
            FormatArg::Parcel => Some(ArchiveFormat::Parcel),
            FormatArg::NoArchive => Some(ArchiveFormat::NoArchive),
        });
        let mut filters: Vec<(FilterKind, String)> = Vec::new();
        filters.extend(
            self.exclude
                .iter()
                .map(|p| (FilterKind::Exclude, p.clone())),
        );
        filters.extend(
            self.include
                .iter()
                .map(|p| (FilterKind::Include, p.clone())),
        );
        PackOptions {
            prefix: self.prefix.clone(),
            name: self.name.clone(),
            output: self.output.clone(),
            format,
            compress_level: self.compress_level,
            n_threads: self.n_threads,
            arcroot: self.arcroot.clone(),
            dest_prefix: self.dest_prefix.clone(),
            ignore_editable_packages: self.ignore_editable_packages,
            ignore_missing_files: self.ignore_missing_files,
            unmanaged: self.unmanaged,
            force: self.force,
            zip_symlinks: self.zip_symlinks,
            zip_64: !self.no_zip_64,
            defer_text: self.defer_text,
            allow_cross_prefix: self.allow_cross_prefix,
            ignore_long_paths: self.ignore_long_paths,
            squashfs_codec: match self.squashfs_codec {
                CodecArg::None => SquashfsCodec::None,
                CodecArg::Zstd => SquashfsCodec::Zstd,
                CodecArg::Xz => SquashfsCodec::Xz,
            },
            parcel: ParcelOptions {
                root: self.parcel_root.clone(),
                name: self.parcel_name.clone(),
                version: self.parcel_version.clone(),
                distribution: self.parcel_distribution.clone(),
            },
            filters,
            reproducible: if self.reproducible {
                Some(true)
            } else if self.no_reproducible {
                Some(false)
            } else {
                None
            },
            cancel: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_aliases_parse() {
        let cli =
            PackenvCli::try_parse_from(["packenv", "-p", "env", "--format", "tar.gz"]).unwrap();
        assert_eq!(cli.format, Some(FormatArg::TarGz));
        let opts = cli.to_options();
        assert_eq!(opts.format, Some(ArchiveFormat::TarGz));
    }

    #[test]
    fn prefix_and_name_conflict() {
        assert!(PackenvCli::try_parse_from(["packenv", "-p", "env", "-n", "env"]).is_err());
    }

    #[test]
    fn filters_keep_exclude_before_include() {
        let cli = PackenvCli::try_parse_from([
            "packenv",
            "-p",
            "env",
            "--exclude",
            "*.pyx",
            "--include",
            "lib/keep.pyx",
        ])
        .unwrap();
        let opts = cli.to_options();
        assert_eq!(
            opts.filters,
            vec![
                (FilterKind::Exclude, "*.pyx".to_string()),
                (FilterKind::Include, "lib/keep.pyx".to_string()),
            ]
        );
    }

    #[test]
    fn compress_level_is_bounded() {
        assert!(PackenvCli::try_parse_from(["packenv", "-p", "env", "--compress-level", "12"])
            .is_err());
    }
}
