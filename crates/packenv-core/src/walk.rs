//! Environment walker and per-file classifier.
//!
//! Produces the canonical, deterministic stream of file records the pipeline
//! consumes: depth-first over the prefix, siblings in lexicographic order,
//! directories ahead of their contents. Each record carries its ownership
//! classification and prefix disposition.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use glob::Pattern;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::{FilterKind, PackOptions};
use crate::error::{PackError, Result};
use crate::inventory::{Inventory, PrefixKind};
use crate::prefixes::{self, contains, looks_like_text, posix_rel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Managed,
    Unmanaged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Symlink,
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixAction {
    None,
    Text,
    Binary,
}

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub relative_path: String,
    pub source_kind: SourceKind,
    pub file_kind: FileKind,
    pub mode: u32,
    pub mtime: u64,
    pub size: u64,
    pub prefix_action: PrefixAction,
    /// Exact byte string embedded in the file; `None` means the source
    /// prefix itself.
    pub placeholder: Option<String>,
    pub package: Option<String>,
    /// Archive-ready symlink target (already relativized when it pointed
    /// into the prefix).
    pub link_target: Option<String>,
    /// `conda-meta/*.json` records get their local cache paths blanked.
    pub launder_meta: bool,
    /// Inventory checksum, verified opportunistically by the workers.
    pub sha256: Option<String>,
}

/// Names conda materializes under the root of larger installations; never
/// part of a packable environment.
const TOP_LEVEL_IGNORE: &[&str] = &[
    "pkgs",
    "envs",
    "conda-bld",
    ".conda_lock",
    "users",
    "conda-recipes",
    ".index",
    ".unionfs",
    ".nonadmin",
    "python.app",
    "Launcher.app",
];

/// Activation shims older condas copy into child environments.
const STALE_BIN_SHIMS: &[&str] = &["bin/conda", "bin/activate", "bin/deactivate"];

const SNIFF_WINDOW: usize = 64 * 1024;

fn excluded_by_policy(rel: &str) -> bool {
    if rel.ends_with(".pyc") || rel.ends_with(".pyo") || rel.ends_with(".egg-link") {
        return true;
    }
    if rel == "conda-meta/history" {
        return true;
    }
    // Anything else under conda-meta/ that is not a package record is
    // install-time droppings (locks, partial writes, logs).
    if let Some(rest) = rel.strip_prefix("conda-meta/") {
        if !rest.ends_with(".json") {
            return true;
        }
    }
    false
}

/// Abort when site-packages carries `.pth` entries resolving outside the
/// prefix (editable installs cannot be relocated).
pub fn check_editable_packages(prefix: &Path, site_packages: &str) -> Result<()> {
    let dir = prefix.join(site_packages);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(()),
    };
    let mut outside = BTreeSet::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map(|e| e == "pth") != Some(true) {
            continue;
        }
        let Ok(body) = fs::read_to_string(&path) else {
            continue;
        };
        for line in body.lines() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') || line.starts_with("import") {
                continue;
            }
            let location = dir.join(line);
            let resolved = location
                .canonicalize()
                .unwrap_or_else(|_| normalize(&location));
            if !resolved.starts_with(prefix) {
                outside.insert(line.to_string());
            }
        }
    }
    if outside.is_empty() {
        return Ok(());
    }
    let listing = outside
        .iter()
        .map(|p| format!("- {p}"))
        .collect::<Vec<_>>()
        .join("\n");
    Err(PackError::EditablePackages { listing })
}

/// Walk `prefix`, reconcile against the inventory, classify, and apply the
/// exclusion policy. The returned records are in canonical archive order.
pub fn walk_environment(
    prefix: &Path,
    inventory: &Inventory,
    opts: &PackOptions,
    warnings: &mut Vec<String>,
) -> Result<Vec<FileRecord>> {
    let prefix_str = posix_path(prefix);
    let prefix_bytes = prefix_str.as_bytes();

    let mut records = Vec::new();
    let mut seen = BTreeSet::new();

    let walker = WalkDir::new(prefix)
        .follow_links(false)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            if entry.depth() == 1 && TOP_LEVEL_IGNORE.contains(&name.as_ref()) {
                return false;
            }
            if name == "__pycache__" || name.ends_with('~') || name.eq_ignore_ascii_case(".ds_store")
            {
                return false;
            }
            true
        });

    for entry in walker {
        let entry = entry.map_err(|err| {
            PackError::io(
                format!("failed to walk {}", prefix.display()),
                err.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("walk error")),
            )
        })?;
        if entry.depth() == 0 {
            continue;
        }
        let rel = posix_rel(entry.path().strip_prefix(prefix).expect("entry under prefix"));
        let metadata = entry.metadata().map_err(|err| {
            PackError::io(
                format!("failed to stat {}", entry.path().display()),
                err.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("stat error")),
            )
        })?;
        let file_type = metadata.file_type();
        let file_kind = if file_type.is_symlink() {
            FileKind::Symlink
        } else if file_type.is_dir() {
            FileKind::Directory
        } else {
            FileKind::Regular
        };

        if file_kind == FileKind::Directory {
            records.push(FileRecord {
                relative_path: rel,
                source_kind: SourceKind::Unmanaged,
                file_kind,
                mode: unix_mode(&metadata).unwrap_or(0o755),
                mtime: mtime_of(&metadata),
                size: 0,
                prefix_action: PrefixAction::None,
                placeholder: None,
                package: None,
                link_target: None,
                launder_meta: false,
                sha256: None,
            });
            continue;
        }

        let meta = inventory.files.get(&rel);
        if meta.is_some() {
            seen.insert(rel.clone());
        }
        if excluded_by_policy(&rel) {
            debug!(path = %rel, "dropped by exclusion policy");
            continue;
        }

        let (source_kind, mut placeholder, mut prefix_action, package, sha256, launder_meta) =
            match meta {
                Some(meta) => {
                    let action = match meta.prefix_kind {
                        Some(PrefixKind::Text) => PrefixAction::Text,
                        Some(PrefixKind::Binary) => PrefixAction::Binary,
                        None => PrefixAction::None,
                    };
                    (
                        SourceKind::Managed,
                        meta.placeholder.clone(),
                        action,
                        Some(meta.package.clone()),
                        meta.sha256.clone(),
                        rel.starts_with("conda-meta/") && rel.ends_with(".json"),
                    )
                }
                None => {
                    if rel.starts_with("conda-meta/") && !opts.unmanaged {
                        debug!(path = %rel, "unmanaged bookkeeping entry skipped");
                        continue;
                    }
                    if STALE_BIN_SHIMS.contains(&rel.as_str()) {
                        debug!(path = %rel, "stale activation shim skipped");
                        continue;
                    }
                    (SourceKind::Unmanaged, None, PrefixAction::None, None, None, false)
                }
            };

        // Cross-prefix detection: a manifest placeholder that is neither the
        // environment prefix means the file was linked for somewhere else.
        if let Some(ph) = placeholder.as_deref() {
            if prefix_action != PrefixAction::None && ph != prefix_str {
                if !opts.allow_cross_prefix {
                    return Err(PackError::CrossPrefixInstall {
                        path: rel,
                        placeholder: ph.to_string(),
                        prefix: prefix_str.clone(),
                    });
                }
                debug!(path = %rel, placeholder = %ph, "cross-prefix file kept");
            }
        }

        let mut link_target = None;
        if file_kind == FileKind::Symlink {
            let target = fs::read_link(entry.path()).map_err(|err| {
                PackError::io(format!("failed to read link {}", entry.path().display()), err)
            })?;
            link_target = Some(archive_link_target(&rel, &target, prefix));
            prefix_action = PrefixAction::None;
        } else if source_kind == SourceKind::Unmanaged && file_kind == FileKind::Regular {
            if let Some((action, ph)) =
                sniff_unmanaged(entry.path(), metadata.len(), prefix_bytes)?
            {
                prefix_action = action;
                placeholder = ph;
            }
        }

        records.push(FileRecord {
            relative_path: rel,
            source_kind,
            file_kind,
            mode: unix_mode(&metadata).unwrap_or(if file_kind == FileKind::Symlink {
                0o777
            } else {
                0o644
            }),
            mtime: mtime_of(&metadata),
            size: if file_kind == FileKind::Regular {
                metadata.len()
            } else {
                0
            },
            prefix_action,
            placeholder,
            package,
            link_target,
            launder_meta,
            sha256,
        });
    }

    reconcile_missing(inventory, &seen, opts, warnings)?;
    apply_filters(&mut records, &opts.filters, warnings)?;
    Ok(records)
}

/// Head-sniff (then full scan on demand) an unmanaged file for the source
/// prefix; text/binary is decided by whether the head decodes as UTF-8.
fn sniff_unmanaged(
    path: &Path,
    len: u64,
    prefix_bytes: &[u8],
) -> Result<Option<(PrefixAction, Option<String>)>> {
    use std::io::Read;

    let mut file = fs::File::open(path)
        .map_err(|err| PackError::io(format!("failed to open {}", path.display()), err))?;
    let mut head = Vec::with_capacity(SNIFF_WINDOW.min(len as usize));
    (&mut file)
        .take(SNIFF_WINDOW as u64)
        .read_to_end(&mut head)
        .map_err(|err| PackError::io(format!("failed to read {}", path.display()), err))?;

    let is_text = looks_like_text(&head);
    let mut hit = contains(&head, prefix_bytes);
    if !hit && len as usize > head.len() {
        let mut rest = Vec::new();
        file.read_to_end(&mut rest)
            .map_err(|err| PackError::io(format!("failed to read {}", path.display()), err))?;
        // Rescan across the window boundary as well.
        let overlap = head.len().saturating_sub(prefix_bytes.len());
        let mut tail = head[overlap..].to_vec();
        tail.extend_from_slice(&rest);
        hit = contains(&tail, prefix_bytes);
    }
    if !hit {
        return Ok(None);
    }
    let action = if is_text {
        PrefixAction::Text
    } else {
        PrefixAction::Binary
    };
    Ok(Some((action, None)))
}

/// Absolute targets inside the prefix become relative to the link's archive
/// location; anything else is preserved verbatim.
fn archive_link_target(link_rel: &str, target: &Path, prefix: &Path) -> String {
    if target.is_absolute() {
        if let Ok(inside) = target.strip_prefix(prefix) {
            return prefixes::relative_symlink_target(link_rel, &posix_rel(inside));
        }
    }
    posix_path(target)
}

fn reconcile_missing(
    inventory: &Inventory,
    seen: &BTreeSet<String>,
    opts: &PackOptions,
    warnings: &mut Vec<String>,
) -> Result<()> {
    let mut missing: Vec<&String> = Vec::new();
    for (path, _meta) in &inventory.files {
        if !seen.contains(path) && !excluded_by_policy(path) {
            missing.push(path);
        }
    }
    if missing.is_empty() {
        return Ok(());
    }
    if opts.ignore_missing_files {
        for path in &missing {
            warn!(%path, "managed file missing from disk; skipped");
            warnings.push(format!("managed file missing from disk: {path}"));
        }
        return Ok(());
    }
    let mut listing: Vec<String> = Vec::new();
    for path in missing.iter().take(20) {
        let owner = inventory
            .files
            .get(path.as_str())
            .map(|m| m.package.as_str())
            .unwrap_or("?");
        listing.push(format!("- {path} ({owner})"));
    }
    if missing.len() > 20 {
        listing.push(format!("+ {} others", missing.len() - 20));
    }
    Err(PackError::MissingManagedFiles {
        listing: listing.join("\n"),
    })
}

fn apply_filters(
    records: &mut Vec<FileRecord>,
    filters: &[(FilterKind, String)],
    warnings: &mut Vec<String>,
) -> Result<()> {
    if filters.is_empty() {
        return Ok(());
    }
    let compiled: Vec<(FilterKind, Pattern)> = filters
        .iter()
        .map(|(kind, pattern)| {
            Pattern::new(pattern)
                .map(|p| (*kind, p))
                .map_err(|err| PackError::InvalidConfig(format!("bad filter {pattern:?}: {err}")))
        })
        .collect::<Result<_>>()?;

    let mut dropped = 0usize;
    let mut included: Vec<bool> = records.iter().map(|_| true).collect();
    for (kind, pattern) in &compiled {
        for (record, flag) in records.iter().zip(included.iter_mut()) {
            if record.file_kind == FileKind::Directory {
                continue;
            }
            if pattern.matches(&record.relative_path) {
                *flag = *kind == FilterKind::Include;
            }
        }
    }
    let mut keep = included.iter();
    records.retain(|_| {
        let kept = *keep.next().expect("flag per record");
        if !kept {
            dropped += 1;
        }
        kept
    });
    if dropped > 0 {
        warnings.push(format!("{dropped} file(s) excluded by filters"));
    }
    Ok(())
}

fn posix_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Lexically collapse `.`/`..` components (for paths that do not exist yet).
fn normalize(path: &Path) -> std::path::PathBuf {
    use std::path::Component;
    let mut out = std::path::PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

#[cfg(unix)]
fn unix_mode(metadata: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn unix_mode(_metadata: &fs::Metadata) -> Option<u32> {
    None
}

fn mtime_of(metadata: &fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::FileMeta;
    use std::collections::BTreeMap;

    fn empty_inventory() -> Inventory {
        Inventory {
            files: BTreeMap::new(),
            packages: Vec::new(),
            site_packages: None,
        }
    }

    fn inventory_with(entries: &[(&str, Option<PrefixKind>, Option<&str>)]) -> Inventory {
        let mut files = BTreeMap::new();
        for (path, kind, placeholder) in entries {
            files.insert(
                path.to_string(),
                FileMeta {
                    package: "pkg".to_string(),
                    prefix_kind: *kind,
                    placeholder: placeholder.map(str::to_string),
                    sha256: None,
                    size: None,
                },
            );
        }
        Inventory {
            files,
            packages: Vec::new(),
            site_packages: None,
        }
    }

    #[test]
    fn records_follow_canonical_order() {
        let temp = tempfile::tempdir().unwrap();
        let prefix = temp.path();
        fs::create_dir_all(prefix.join("lib/sub")).unwrap();
        fs::create_dir_all(prefix.join("bin")).unwrap();
        fs::write(prefix.join("bin/tool"), b"x").unwrap();
        fs::write(prefix.join("lib/a.txt"), b"x").unwrap();
        fs::write(prefix.join("lib/sub/b.txt"), b"x").unwrap();

        let mut warnings = Vec::new();
        let records = walk_environment(
            prefix,
            &empty_inventory(),
            &PackOptions::default(),
            &mut warnings,
        )
        .unwrap();
        let paths: Vec<&str> = records.iter().map(|r| r.relative_path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["bin", "bin/tool", "lib", "lib/a.txt", "lib/sub", "lib/sub/b.txt"]
        );
    }

    #[test]
    fn unmanaged_text_with_prefix_hit_is_classified_text() {
        let temp = tempfile::tempdir().unwrap();
        let prefix = temp.path();
        fs::create_dir_all(prefix.join("bin")).unwrap();
        let body = format!("#!/bin/sh\nexec {}/lib/python \"$@\"\n", prefix.display());
        fs::write(prefix.join("bin/my_script"), body).unwrap();

        let mut warnings = Vec::new();
        let records = walk_environment(
            prefix,
            &empty_inventory(),
            &PackOptions::default(),
            &mut warnings,
        )
        .unwrap();
        let record = records
            .iter()
            .find(|r| r.relative_path == "bin/my_script")
            .unwrap();
        assert_eq!(record.source_kind, SourceKind::Unmanaged);
        assert_eq!(record.prefix_action, PrefixAction::Text);
        assert_eq!(record.placeholder, None);
    }

    #[test]
    fn unmanaged_binary_with_prefix_hit_is_classified_binary() {
        let temp = tempfile::tempdir().unwrap();
        let prefix = temp.path();
        fs::create_dir_all(prefix.join("lib")).unwrap();
        let mut body = vec![0u8, 0x7f, b'E', b'L', b'F', 0xff];
        body.extend_from_slice(prefix.to_string_lossy().as_bytes());
        body.push(0);
        fs::write(prefix.join("lib/blob.so"), body).unwrap();

        let mut warnings = Vec::new();
        let records = walk_environment(
            prefix,
            &empty_inventory(),
            &PackOptions::default(),
            &mut warnings,
        )
        .unwrap();
        let record = records
            .iter()
            .find(|r| r.relative_path == "lib/blob.so")
            .unwrap();
        assert_eq!(record.prefix_action, PrefixAction::Binary);
    }

    #[test]
    fn missing_managed_file_is_fatal_by_default() {
        let temp = tempfile::tempdir().unwrap();
        let inventory = inventory_with(&[("lib/vanished.py", None, None)]);
        let mut warnings = Vec::new();
        let err = walk_environment(
            temp.path(),
            &inventory,
            &PackOptions::default(),
            &mut warnings,
        )
        .unwrap_err();
        assert!(matches!(err, PackError::MissingManagedFiles { .. }));

        let mut opts = PackOptions::default();
        opts.ignore_missing_files = true;
        let records = walk_environment(temp.path(), &inventory, &opts, &mut warnings).unwrap();
        assert!(records.is_empty());
        assert!(warnings.iter().any(|w| w.contains("lib/vanished.py")));
    }

    #[test]
    fn cross_prefix_placeholder_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let prefix = temp.path();
        fs::create_dir_all(prefix.join("bin")).unwrap();
        fs::write(prefix.join("bin/tool"), b"#!/bin/sh\n").unwrap();
        let inventory = inventory_with(&[(
            "bin/tool",
            Some(PrefixKind::Text),
            Some("/somewhere/else/entirely"),
        )]);

        let mut warnings = Vec::new();
        let err =
            walk_environment(prefix, &inventory, &PackOptions::default(), &mut warnings)
                .unwrap_err();
        assert!(matches!(err, PackError::CrossPrefixInstall { .. }));

        let mut opts = PackOptions::default();
        opts.allow_cross_prefix = true;
        let records = walk_environment(prefix, &inventory, &opts, &mut warnings).unwrap();
        let record = records.iter().find(|r| r.relative_path == "bin/tool").unwrap();
        assert_eq!(record.placeholder.as_deref(), Some("/somewhere/else/entirely"));
    }

    #[test]
    fn pycache_and_history_are_dropped() {
        let temp = tempfile::tempdir().unwrap();
        let prefix = temp.path();
        fs::create_dir_all(prefix.join("lib/__pycache__")).unwrap();
        fs::create_dir_all(prefix.join("conda-meta")).unwrap();
        fs::write(prefix.join("lib/__pycache__/mod.cpython-311.pyc"), b"x").unwrap();
        fs::write(prefix.join("lib/straggler.pyc"), b"x").unwrap();
        fs::write(prefix.join("conda-meta/history"), b"==> log <==\n").unwrap();

        let mut warnings = Vec::new();
        let records = walk_environment(
            prefix,
            &empty_inventory(),
            &PackOptions::default(),
            &mut warnings,
        )
        .unwrap();
        let paths: Vec<&str> = records.iter().map(|r| r.relative_path.as_str()).collect();
        assert!(paths.contains(&"lib"));
        assert!(paths.contains(&"conda-meta"));
        assert!(!paths.iter().any(|p| p.contains("pycache")));
        assert!(!paths.contains(&"lib/straggler.pyc"));
        assert!(!paths.contains(&"conda-meta/history"));
    }

    #[test]
    fn symlink_into_prefix_is_relativized() {
        let temp = tempfile::tempdir().unwrap();
        let prefix = temp.path();
        fs::create_dir_all(prefix.join("bin")).unwrap();
        fs::create_dir_all(prefix.join("lib")).unwrap();
        fs::write(prefix.join("lib/libz.so.1.2"), b"elf").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(
            prefix.join("lib/libz.so.1.2"),
            prefix.join("bin/libz-link"),
        )
        .unwrap();
        #[cfg(not(unix))]
        return;

        let mut warnings = Vec::new();
        let records = walk_environment(
            prefix,
            &empty_inventory(),
            &PackOptions::default(),
            &mut warnings,
        )
        .unwrap();
        let link = records
            .iter()
            .find(|r| r.relative_path == "bin/libz-link")
            .unwrap();
        assert_eq!(link.file_kind, FileKind::Symlink);
        assert_eq!(link.link_target.as_deref(), Some("../lib/libz.so.1.2"));
    }

    #[test]
    fn exclude_and_include_filters_compose() {
        let temp = tempfile::tempdir().unwrap();
        let prefix = temp.path();
        fs::create_dir_all(prefix.join("lib")).unwrap();
        fs::write(prefix.join("lib/keep.pyx"), b"x").unwrap();
        fs::write(prefix.join("lib/drop.pyx"), b"x").unwrap();
        fs::write(prefix.join("lib/other.py"), b"x").unwrap();

        let mut opts = PackOptions::default();
        opts.filters = vec![
            (FilterKind::Exclude, "*.pyx".to_string()),
            (FilterKind::Include, "lib/keep.pyx".to_string()),
        ];
        let mut warnings = Vec::new();
        let records =
            walk_environment(prefix, &empty_inventory(), &opts, &mut warnings).unwrap();
        let paths: Vec<&str> = records.iter().map(|r| r.relative_path.as_str()).collect();
        assert!(paths.contains(&"lib/keep.pyx"));
        assert!(!paths.contains(&"lib/drop.pyx"));
        assert!(paths.contains(&"lib/other.py"));
    }
}
