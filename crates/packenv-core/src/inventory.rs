//! Package inventory: who owns which file, and how its prefix is embedded.
//!
//! The oracle lists installed packages from `conda-meta/`; each package's
//! authoritative manifest (per-file prefix placeholders and text/binary
//! classification) lives in the package cache it was linked from. Both are
//! read-only inputs; the resulting [`Inventory`] is immutable once built.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{PackError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrefixKind {
    Text,
    Binary,
}

#[derive(Debug, Clone)]
pub struct Package {
    pub name: String,
    pub version: String,
    pub build: String,
    /// Extracted package directory inside the package cache.
    pub cache_dir: PathBuf,
    /// Files the environment's own metadata claims for this package.
    pub files: Vec<String>,
    /// `conda-meta/<record>.json` that announced the package.
    pub meta_record: String,
}

/// Supplies the installed-package list for a prefix. The default
/// implementation reads `conda-meta/`; tests may substitute their own.
pub trait PackageOracle {
    fn list_packages(&self, prefix: &Path) -> Result<Vec<Package>>;

    /// Resolve an environment name to its prefix.
    fn prefix_for_name(&self, name: &str) -> Result<PathBuf>;
}

#[derive(Debug, Default)]
pub struct CondaMetaOracle;

#[derive(Debug, Deserialize)]
struct CondaMetaRecord {
    name: String,
    version: String,
    #[serde(default)]
    build: String,
    #[serde(default)]
    files: Vec<String>,
    link: Option<LinkRecord>,
}

#[derive(Debug, Deserialize)]
struct LinkRecord {
    source: Option<String>,
}

impl PackageOracle for CondaMetaOracle {
    fn list_packages(&self, prefix: &Path) -> Result<Vec<Package>> {
        let meta_dir = prefix.join("conda-meta");
        let mut names: Vec<String> = Vec::new();
        let entries = fs::read_dir(&meta_dir)
            .map_err(|err| PackError::io(format!("failed to read {}", meta_dir.display()), err))?;
        for entry in entries {
            let entry = entry.map_err(|err| {
                PackError::io(format!("failed to read {}", meta_dir.display()), err)
            })?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.ends_with(".json") {
                names.push(file_name);
            }
        }
        names.sort();

        let mut packages = Vec::with_capacity(names.len());
        for file_name in names {
            let path = meta_dir.join(&file_name);
            let raw = fs::read(&path)
                .map_err(|err| PackError::io(format!("failed to read {}", path.display()), err))?;
            let record: CondaMetaRecord = serde_json::from_slice(&raw)
                .map_err(|err| PackError::Json { path: path.clone(), source: err })?;
            let cache_dir = record
                .link
                .as_ref()
                .and_then(|link| link.source.as_deref())
                .map(PathBuf::from)
                .unwrap_or_default();
            packages.push(Package {
                name: record.name,
                version: record.version,
                build: record.build,
                cache_dir,
                files: record.files,
                meta_record: file_name,
            });
        }
        Ok(packages)
    }

    fn prefix_for_name(&self, name: &str) -> Result<PathBuf> {
        let conda = std::env::var("CONDA_EXE").unwrap_or_else(|_| "conda".to_string());
        let output = Command::new(&conda)
            .args(["info", "--json"])
            .output()
            .map_err(|err| PackError::io(format!("failed to run {conda} info --json"), err))?;
        if !output.status.success() {
            return Err(PackError::InvalidConfig(format!(
                "`{conda} info --json` failed; is conda on PATH?"
            )));
        }
        let info: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|err| PackError::Json { path: PathBuf::from(&conda), source: err })?;
        let envs = info["envs"].as_array().cloned().unwrap_or_default();
        for env in &envs {
            if let Some(path) = env.as_str() {
                let path = PathBuf::from(path);
                if path.file_name().map(|f| f.to_string_lossy() == name) == Some(true) {
                    return Ok(path);
                }
            }
        }
        Err(PackError::InvalidConfig(format!(
            "environment name {name:?} does not exist"
        )))
    }
}

/// Per-file manifest data carried through walking and archiving.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub package: String,
    pub prefix_kind: Option<PrefixKind>,
    /// The exact byte string embedded in the file at install time; `None`
    /// means the file embeds the environment prefix itself.
    pub placeholder: Option<String>,
    pub sha256: Option<String>,
    pub size: Option<u64>,
}

#[derive(Debug)]
pub struct Inventory {
    /// `relative_path -> meta`, ordered (BTreeMap) so iteration matches the
    /// canonical archive order.
    pub files: BTreeMap<String, FileMeta>,
    pub packages: Vec<Package>,
    /// `lib/pythonX.Y/site-packages`, when the env carries a python.
    pub site_packages: Option<String>,
}

impl Inventory {
    pub fn has_package(&self, name: &str) -> bool {
        self.packages.iter().any(|p| p.name == name)
    }
}

#[derive(Debug, Deserialize)]
struct PathsJson {
    paths: Vec<PathsEntry>,
}

#[derive(Debug, Deserialize)]
struct PathsEntry {
    #[serde(rename = "_path")]
    path: String,
    #[serde(default)]
    file_mode: Option<PrefixKind>,
    #[serde(default)]
    prefix_placeholder: Option<String>,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    size_in_bytes: Option<u64>,
}

/// Build the inventory for `prefix` from the oracle's package list.
///
/// `ignore_missing_cache` demotes an absent package-cache entry from fatal to
/// a warning; the package's files then surface as unmanaged during the walk.
pub fn load_inventory(
    prefix: &Path,
    oracle: &dyn PackageOracle,
    ignore_missing_cache: bool,
    warnings: &mut Vec<String>,
) -> Result<Inventory> {
    let packages = oracle.list_packages(prefix)?;
    let site_packages = find_site_packages(&packages);

    let mut files: BTreeMap<String, FileMeta> = BTreeMap::new();
    for package in &packages {
        let metas = match load_package_manifest(package, site_packages.as_deref()) {
            Ok(metas) => metas,
            Err(err @ PackError::MissingPackageCache { .. }) => {
                if !ignore_missing_cache {
                    return Err(err);
                }
                warn!(package = %package.name, "package cache entry missing; files demoted to unmanaged");
                warnings.push(format!(
                    "package {} {} has no cache entry; its files are packed as unmanaged",
                    package.name, package.version
                ));
                continue;
            }
            Err(err) => return Err(err),
        };
        for (path, meta) in metas {
            if let Some(existing) = files.get(&path) {
                return Err(PackError::ConflictingOwnership {
                    path,
                    first: existing.package.clone(),
                    second: package.name.clone(),
                });
            }
            files.insert(path, meta);
        }
        // The conda-meta record itself travels with its package and gets its
        // local cache paths blanked at pack time.
        files.insert(
            format!("conda-meta/{}", package.meta_record),
            FileMeta {
                package: package.name.clone(),
                prefix_kind: None,
                placeholder: None,
                sha256: None,
                size: None,
            },
        );
    }

    debug!(
        packages = packages.len(),
        files = files.len(),
        "inventory loaded"
    );
    Ok(Inventory {
        files,
        packages,
        site_packages,
    })
}

fn load_package_manifest(
    package: &Package,
    site_packages: Option<&str>,
) -> Result<Vec<(String, FileMeta)>> {
    let info = package.cache_dir.join("info");
    if package.cache_dir.as_os_str().is_empty() || !info.is_dir() {
        return Err(PackError::MissingPackageCache {
            name: package.name.clone(),
            version: package.version.clone(),
            cache_dir: package.cache_dir.clone(),
        });
    }
    let noarch_python = read_noarch_type(&package.cache_dir).as_deref() == Some("python");
    let remap = |path: &str| remap_noarch(path, noarch_python, site_packages);

    let paths_json = info.join("paths.json");
    let mut out = Vec::new();
    if paths_json.is_file() {
        let raw = fs::read(&paths_json).map_err(|err| {
            PackError::io(format!("failed to read {}", paths_json.display()), err)
        })?;
        let parsed: PathsJson = serde_json::from_slice(&raw)
            .map_err(|err| PackError::Json { path: paths_json, source: err })?;
        for entry in parsed.paths {
            out.push((
                remap(&entry.path),
                FileMeta {
                    package: package.name.clone(),
                    prefix_kind: entry.file_mode,
                    placeholder: entry.prefix_placeholder,
                    sha256: entry.sha256,
                    size: entry.size_in_bytes,
                },
            ));
        }
    } else {
        let files_path = info.join("files");
        let raw = fs::read_to_string(&files_path).map_err(|err| {
            PackError::io(format!("failed to read {}", files_path.display()), err)
        })?;
        let has_prefix = read_has_prefix(&info.join("has_prefix"))?;
        for line in raw.lines() {
            let path = line.trim();
            if path.is_empty() {
                continue;
            }
            let (placeholder, kind) = match has_prefix.get(path) {
                Some((placeholder, kind)) => (placeholder.clone(), Some(*kind)),
                None => (None, None),
            };
            out.push((
                remap(path),
                FileMeta {
                    package: package.name.clone(),
                    prefix_kind: kind,
                    placeholder,
                    sha256: None,
                    size: None,
                },
            ));
        }
    }
    Ok(out)
}

fn remap_noarch(path: &str, noarch_python: bool, site_packages: Option<&str>) -> String {
    if !noarch_python {
        return path.to_string();
    }
    if let Some(rest) = path.strip_prefix("site-packages/") {
        if let Some(site) = site_packages {
            return format!("{site}/{rest}");
        }
    }
    if let Some(rest) = path.strip_prefix("python-scripts/") {
        return format!("bin/{rest}");
    }
    path.to_string()
}

fn read_noarch_type(cache_dir: &Path) -> Option<String> {
    for name in ["link.json", "package_metadata.json"] {
        let path = cache_dir.join("info").join(name);
        let Ok(raw) = fs::read(&path) else { continue };
        let Ok(value) = serde_json::from_slice::<serde_json::Value>(&raw) else {
            continue;
        };
        return value["noarch"]["type"].as_str().map(str::to_string);
    }
    None
}

/// Parse `info/has_prefix`: each line is either a bare path (text entry with
/// the default placeholder) or `placeholder mode path`, with optional shell
/// quoting around any field.
fn read_has_prefix(
    path: &Path,
) -> Result<BTreeMap<String, (Option<String>, PrefixKind)>> {
    let mut out = BTreeMap::new();
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(err) => {
            return Err(PackError::io(
                format!("failed to read {}", path.display()),
                err,
            ))
        }
    };
    for line in raw.lines() {
        let fields = split_quoted(line);
        match fields.len() {
            0 => {}
            1 => {
                out.insert(fields[0].clone(), (None, PrefixKind::Text));
            }
            3 => {
                let kind = match fields[1].as_str() {
                    "binary" => PrefixKind::Binary,
                    _ => PrefixKind::Text,
                };
                out.insert(fields[2].clone(), (Some(fields[0].clone()), kind));
            }
            _ => {
                return Err(PackError::InvalidConfig(format!(
                    "malformed has_prefix line in {}: {line:?}",
                    path.display()
                )))
            }
        }
    }
    Ok(out)
}

fn split_quoted(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for ch in line.chars() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '"') | (None, '\'') => quote = Some(ch),
            (None, c) if c.is_whitespace() => {
                if !current.is_empty() {
                    fields.push(std::mem::take(&mut current));
                }
            }
            (None, c) => current.push(c),
        }
    }
    if !current.is_empty() {
        fields.push(current);
    }
    fields
}

/// `lib/pythonX.Y/site-packages` derived from the installed python package.
fn find_site_packages(packages: &[Package]) -> Option<String> {
    let python = packages.iter().find(|p| p.name == "python")?;
    let mut parts = python.version.split('.');
    let major = parts.next()?;
    let minor = parts.next()?;
    Some(format!("lib/python{major}.{minor}/site-packages"))
}
