//! End-to-end pack orchestration: resolve the environment, build the
//! inventory, walk and classify, validate the destination policy, then
//! stream everything through the chosen sink.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use time::OffsetDateTime;
use tracing::{debug, info};

use crate::config::{
    ArchiveFormat, PackOptions, DEFAULT_PARCEL_DISTRO, DEFAULT_PARCEL_ROOT,
};
use crate::error::{PackError, Result};
use crate::formats::{self, ParcelPayload, SinkOptions};
use crate::inventory::{load_inventory, Inventory, PackageOracle};
use crate::pipeline::{stream_entries, PipelineContext};
use crate::prefixes::{canonical_prefix, NEUTRAL_PLACEHOLDER};
use crate::progress::ProgressSink;
use crate::rewrite::RewritePlan;
use crate::unpack;
use crate::walk::{check_editable_packages, walk_environment, FileRecord};

const ZIP_NAME_LIMIT: usize = u16::MAX as usize;

#[derive(Debug)]
pub struct PackReport {
    pub output: PathBuf,
    pub files: usize,
    pub warnings: Vec<String>,
}

struct ResolvedTarget {
    format: ArchiveFormat,
    output: PathBuf,
    arcroot: String,
    dest_prefix: String,
    dest_is_placeholder: bool,
    parcel: Option<ResolvedParcel>,
}

struct ResolvedParcel {
    name: String,
    version: String,
    distribution: String,
    root: String,
}

/// Pack the environment described by `opts` and return where the archive
/// landed.
pub fn pack(
    opts: &PackOptions,
    oracle: &dyn PackageOracle,
    progress: &dyn ProgressSink,
) -> Result<PackReport> {
    let prefix = resolve_prefix(opts, oracle)?;
    let env_name = prefix
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "environment".to_string());
    if !prefix.join("conda-meta").is_dir() {
        return Err(PackError::NotAnEnvironment(prefix));
    }

    let target = resolve_target(opts, &env_name)?;
    check_output(&target, opts)?;

    let mut warnings = Vec::new();
    let inventory = load_inventory(&prefix, oracle, opts.ignore_missing_files, &mut warnings)?;
    if !opts.ignore_editable_packages {
        if let Some(site_packages) = inventory.site_packages.as_deref() {
            check_editable_packages(&prefix, site_packages)?;
        }
    }

    let mut records = walk_environment(&prefix, &inventory, opts, &mut warnings)?;
    info!(
        prefix = %prefix.display(),
        output = %target.output.display(),
        files = records.len(),
        "packing environment"
    );

    let plan = RewritePlan {
        source_prefix: prefix.to_string_lossy().into_owned(),
        dest_prefix: target.dest_prefix.clone(),
        dest_is_placeholder: target.dest_is_placeholder,
        defer_text: opts.defer_text,
    };
    // Fail on an oversized destination before any output exists.
    plan.check_dest_length(&records)?;
    if target.format == ArchiveFormat::Zip {
        check_zip_paths(&mut records, &target.arcroot, opts, &mut warnings)?;
    }

    let reproducible = opts
        .reproducible
        .unwrap_or_else(|| target.format.reproducible_by_default());
    let parcel_payload = target.parcel.as_ref().map(|parcel| ParcelPayload {
        arcroot: target.arcroot.clone(),
        parcel_json: formats::parcel_json(
            &parcel.name,
            &parcel.version,
            &parcel.distribution,
            &inventory.packages,
        ),
        defines_script: formats::parcel_defines_script(
            &parcel.name,
            &parcel.version,
            &parcel.root,
        ),
    });

    let mut sink = formats::open_sink(
        target.format,
        &target.output,
        SinkOptions {
            compress_level: opts.compress_level,
            n_threads: opts.resolved_threads(),
            reproducible,
            zip_64: opts.zip_64,
            squashfs_codec: opts.squashfs_codec,
            parcel: parcel_payload,
        },
    )?;

    let ctx = PipelineContext {
        source_root: &prefix,
        arcroot: &target.arcroot,
        plan: &plan,
        n_threads: opts.resolved_threads(),
        materialize_symlinks: target.format == ArchiveFormat::Zip && !opts.zip_symlinks,
        cancel: opts.cancel.as_deref(),
    };

    let has_managed_activate = records
        .iter()
        .any(|r| r.relative_path == "bin/activate" || r.relative_path == "bin/deactivate");
    let result = stream_entries(records, &ctx, sink.as_mut(), progress);
    let mut streamed = match result {
        Ok(streamed) => streamed,
        Err(err) => {
            sink.abort();
            return Err(err);
        }
    };
    warnings.append(&mut streamed.warnings);

    if let Err(err) = append_synthetic_entries(
        sink.as_mut(),
        &ctx,
        &plan,
        &inventory,
        &streamed.deferred,
        target.parcel.is_some(),
        has_managed_activate,
        &mut streamed.files,
    ) {
        sink.abort();
        return Err(err);
    }

    if opts
        .cancel
        .as_deref()
        .map(|flag| flag.load(Ordering::Relaxed))
        .unwrap_or(false)
    {
        sink.abort();
        return Err(PackError::Cancelled);
    }

    sink.finalize()?;
    debug!(files = streamed.files, "archive finalized");
    Ok(PackReport {
        output: target.output,
        files: streamed.files,
        warnings,
    })
}

fn resolve_prefix(opts: &PackOptions, oracle: &dyn PackageOracle) -> Result<PathBuf> {
    match (&opts.prefix, &opts.name) {
        (Some(_), Some(_)) => Err(PackError::InvalidConfig(
            "cannot specify both a prefix and an environment name".to_string(),
        )),
        (Some(prefix), None) => canonical_prefix(prefix),
        (None, Some(name)) => canonical_prefix(&oracle.prefix_for_name(name)?),
        (None, None) => Err(PackError::InvalidConfig(
            "either a prefix or an environment name is required".to_string(),
        )),
    }
}

fn resolve_target(opts: &PackOptions, env_name: &str) -> Result<ResolvedTarget> {
    let format = match (opts.format, &opts.output) {
        (Some(format), _) => format,
        (None, Some(output)) => ArchiveFormat::infer(output)?,
        (None, None) => ArchiveFormat::TarGz,
    };

    if format == ArchiveFormat::Parcel {
        return resolve_parcel_target(opts, env_name);
    }

    let output = match &opts.output {
        Some(output) => output.clone(),
        None => {
            if format == ArchiveFormat::NoArchive {
                PathBuf::from(env_name)
            } else {
                PathBuf::from(format!("{env_name}.{}", format.extension()))
            }
        }
    };
    let (dest_prefix, dest_is_placeholder) = match &opts.dest_prefix {
        Some(dest) => (dest.clone(), false),
        None => (NEUTRAL_PLACEHOLDER.to_string(), true),
    };
    Ok(ResolvedTarget {
        format,
        output,
        arcroot: opts.arcroot.trim_matches('/').to_string(),
        dest_prefix,
        dest_is_placeholder,
        parcel: None,
    })
}

/// Parcels own their layout: name/version/distro drive the file name, the
/// archive root, and the destination prefix; user overrides of `arcroot` and
/// `dest_prefix` are configuration errors (checked before the walk).
fn resolve_parcel_target(opts: &PackOptions, env_name: &str) -> Result<ResolvedTarget> {
    if opts.dest_prefix.is_some() || !opts.arcroot.is_empty() {
        return Err(PackError::InvalidConfig(
            "parcels fix their own arcroot and destination prefix; \
             remove --arcroot/--dest-prefix"
                .to_string(),
        ));
    }
    let name = opts
        .parcel
        .name
        .clone()
        .unwrap_or_else(|| env_name.to_string());
    let version = opts
        .parcel
        .version
        .clone()
        .unwrap_or_else(|| {
            let today = OffsetDateTime::now_utc().date();
            format!(
                "{:04}.{:02}.{:02}",
                today.year(),
                u8::from(today.month()),
                today.day()
            )
        });
    let distribution = opts
        .parcel
        .distribution
        .clone()
        .unwrap_or_else(|| DEFAULT_PARCEL_DISTRO.to_string());
    let root = opts
        .parcel
        .root
        .clone()
        .unwrap_or_else(|| DEFAULT_PARCEL_ROOT.to_string());
    if name.contains('-') {
        return Err(PackError::InvalidConfig(format!(
            "parcel names may not contain dashes: {name:?}"
        )));
    }
    if distribution.contains('-') {
        return Err(PackError::InvalidConfig(format!(
            "parcel distributions may not contain dashes: {distribution:?}"
        )));
    }
    let arcroot = format!("{name}-{version}");
    let output = match &opts.output {
        Some(output) => output.clone(),
        None => PathBuf::from(format!("{arcroot}-{distribution}.parcel")),
    };
    Ok(ResolvedTarget {
        format: ArchiveFormat::Parcel,
        output,
        dest_prefix: format!("{root}/{arcroot}"),
        dest_is_placeholder: false,
        arcroot,
        parcel: Some(ResolvedParcel {
            name,
            version,
            distribution,
            root,
        }),
    })
}

fn check_output(target: &ResolvedTarget, opts: &PackOptions) -> Result<()> {
    let output = &target.output;
    if output.exists() {
        if !opts.force {
            return Err(PackError::OutputExists(output.clone()));
        }
        if target.format == ArchiveFormat::NoArchive {
            // The staging rename cannot replace a populated directory.
            let removed = if output.is_dir() {
                fs::remove_dir_all(output)
            } else {
                fs::remove_file(output)
            };
            removed.map_err(|err| {
                PackError::io(format!("failed to clear {}", output.display()), err)
            })?;
        }
    } else if opts.force {
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                PackError::io(format!("failed to create {}", parent.display()), err)
            })?;
        }
    }
    Ok(())
}

fn check_zip_paths(
    records: &mut Vec<FileRecord>,
    arcroot: &str,
    opts: &PackOptions,
    warnings: &mut Vec<String>,
) -> Result<()> {
    let extra = if arcroot.is_empty() {
        0
    } else {
        arcroot.len() + 1
    };
    let mut over: Vec<String> = Vec::new();
    records.retain(|record| {
        if record.relative_path.len() + extra <= ZIP_NAME_LIMIT {
            return true;
        }
        over.push(record.relative_path.clone());
        false
    });
    if over.is_empty() {
        return Ok(());
    }
    if opts.ignore_long_paths {
        for path in over {
            warnings.push(format!("{path}: path too long for zip; dropped"));
        }
        return Ok(());
    }
    Err(PackError::PathTooLongForFormat {
        path: over.remove(0),
        format: "zip",
        limit: ZIP_NAME_LIMIT,
    })
}

#[allow(clippy::too_many_arguments)]
fn append_synthetic_entries(
    sink: &mut dyn crate::formats::ArchiveSink,
    ctx: &PipelineContext<'_>,
    plan: &RewritePlan,
    inventory: &Inventory,
    deferred: &[(String, crate::rewrite::DeferredRewrite)],
    is_parcel: bool,
    has_managed_activate: bool,
    files: &mut usize,
) -> Result<()> {
    let mut entries = Vec::new();
    if !is_parcel && !inventory.has_package("conda") && !has_managed_activate {
        entries.extend(unpack::activation_entries());
    }
    let manifest = unpack::manifest_bytes(&plan.source_prefix, &plan.dest_prefix, deferred);
    entries.extend(unpack::runner_entries(manifest));

    for entry in entries {
        let arcname = if ctx.arcroot.is_empty() {
            entry.relative_path.to_string()
        } else {
            format!("{}/{}", ctx.arcroot, entry.relative_path)
        };
        let size = entry.bytes.len() as u64;
        sink.add_regular(
            &arcname,
            entry.mode,
            0,
            size,
            &mut std::io::Cursor::new(entry.bytes),
        )?;
        *files += 1;
    }
    Ok(())
}
