use std::io::{Cursor, Read};
use std::path::Path;

use serde_json::json;

use super::tar::TarSink;
use super::{ArchiveSink, ParcelPayload};
use crate::config::ArchiveFormat;
use crate::error::Result;
use crate::inventory::Package;

/// Gzip-tar with the two parcel metadata entries (`meta/parcel.json`,
/// `meta/conda_env.sh`) injected at finalize time. Naming and destination
/// prefix are enforced by the caller before the walk begins.
pub struct ParcelSink {
    inner: TarSink,
    payload: ParcelPayload,
}

impl ParcelSink {
    pub fn create(
        output: &Path,
        level: u32,
        n_threads: usize,
        reproducible: bool,
        payload: ParcelPayload,
    ) -> Result<Self> {
        let inner = TarSink::create(output, ArchiveFormat::TarGz, level, n_threads, reproducible)?;
        Ok(Self { inner, payload })
    }
}

impl ArchiveSink for ParcelSink {
    fn add_directory(&mut self, arcname: &str, mode: u32, mtime: u64) -> Result<()> {
        self.inner.add_dir(arcname, mode, mtime)
    }

    fn add_regular(
        &mut self,
        arcname: &str,
        mode: u32,
        mtime: u64,
        size: u64,
        content: &mut dyn Read,
    ) -> Result<()> {
        self.inner.add_file(arcname, mode, mtime, size, content)
    }

    fn add_symlink(&mut self, arcname: &str, mode: u32, mtime: u64, target: &str) -> Result<()> {
        self.inner.add_link(arcname, mode, mtime, target)
    }

    fn finalize(self: Box<Self>) -> Result<()> {
        let mut this = *self;
        let meta_dir = format!("{}/meta", this.payload.arcroot);
        this.inner.add_dir(&meta_dir, 0o755, 0)?;
        let json = std::mem::take(&mut this.payload.parcel_json);
        this.inner.add_file(
            &format!("{meta_dir}/parcel.json"),
            0o644,
            0,
            json.len() as u64,
            &mut Cursor::new(json),
        )?;
        let script = std::mem::take(&mut this.payload.defines_script);
        this.inner.add_file(
            &format!("{meta_dir}/conda_env.sh"),
            0o755,
            0,
            script.len() as u64,
            &mut Cursor::new(script),
        )?;
        this.inner.finish()
    }

    fn abort(self: Box<Self>) {}
}

/// Parcel manifest consumed by the cluster manager; package entries come
/// from the environment inventory.
pub fn parcel_json(name: &str, version: &str, distro: &str, packages: &[Package]) -> Vec<u8> {
    let packages: Vec<_> = packages
        .iter()
        .map(|p| {
            json!({
                "name": p.name,
                "version": format!("{}-{}", p.version, p.build),
            })
        })
        .collect();
    let value = json!({
        "components": [{
            "name": name,
            "pkg_version": version,
            "version": version,
        }],
        "extraVersionInfo": {
            "baseVersion": version,
            "fullVersion": format!("{version}-{distro}"),
            "patchCount": "0",
        },
        "groups": [],
        "name": name,
        "packages": packages,
        "provides": ["spark-plugin"],
        "schema_version": 1,
        "scripts": {
            "defines": "conda_env.sh",
        },
        "setActiveSymlink": true,
        "users": {},
        "version": version,
    });
    let mut out = serde_json::to_vec_pretty(&value).expect("static json serializes");
    out.push(b'\n');
    out
}

/// The `defines` hook sourced by the cluster agent when the parcel
/// activates.
pub fn parcel_defines_script(name: &str, version: &str, root: &str) -> Vec<u8> {
    format!(
        "#!/bin/sh\n\
         PARCELS_ROOT=\"${{PARCELS_ROOT:-{root}}}\"\n\
         CONDA_ENV_ROOT=\"$PARCELS_ROOT/{name}-{version}\"\n\
         export CONDA_ENV_ROOT\n\
         export PATH=\"$CONDA_ENV_ROOT/bin:$PATH\"\n"
    )
    .into_bytes()
}
