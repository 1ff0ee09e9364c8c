#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// A synthetic conda environment: one managed package (`foo`) whose cache
/// manifest declares a text-prefix script, a binary-prefix shared object,
/// and a plain data file, all materialized under the prefix.
pub struct TestEnv {
    pub temp: TempDir,
    pub prefix: PathBuf,
    pub prefix_str: String,
    pub cache_dir: PathBuf,
}

pub fn build_env() -> TestEnv {
    let temp = tempfile::Builder::new()
        .prefix("packenv-test")
        .tempdir()
        .expect("tempdir");
    // Canonicalize up front so manifest placeholders match what the packer
    // resolves the prefix to. The extra path segment keeps the placeholder
    // comfortably longer than any destination the tests rewrite to, the way
    // real build placeholders are.
    let root = temp.path().canonicalize().expect("canonical temp root");
    let prefix = root.join("envs-fixture-0123456789abcdef0123456789").join("env");
    let cache_dir = root.join("cache").join("foo-1.0-0");
    let prefix_str = prefix.to_string_lossy().into_owned();

    let info = cache_dir.join("info");
    fs::create_dir_all(&info).expect("cache info dir");
    let paths_json = serde_json::json!({
        "paths": [
            {
                "_path": "bin/activate-foo",
                "file_mode": "text",
                "prefix_placeholder": prefix_str,
                "path_type": "hardlink"
            },
            {
                "_path": "lib/libfoo.so",
                "file_mode": "binary",
                "prefix_placeholder": prefix_str,
                "path_type": "hardlink"
            },
            {"_path": "share/data.txt", "path_type": "hardlink"}
        ]
    });
    fs::write(
        info.join("paths.json"),
        serde_json::to_vec_pretty(&paths_json).unwrap(),
    )
    .unwrap();

    let meta = prefix.join("conda-meta");
    fs::create_dir_all(&meta).unwrap();
    let record = serde_json::json!({
        "name": "foo",
        "version": "1.0",
        "build": "0",
        "files": ["bin/activate-foo", "lib/libfoo.so", "share/data.txt"],
        "link": {"source": cache_dir.to_string_lossy(), "type": 1},
        "extracted_package_dir": cache_dir.to_string_lossy(),
        "package_tarball_full_path": format!("{}.conda", cache_dir.to_string_lossy()),
    });
    fs::write(
        meta.join("foo-1.0-0.json"),
        serde_json::to_vec_pretty(&record).unwrap(),
    )
    .unwrap();

    fs::create_dir_all(prefix.join("bin")).unwrap();
    fs::create_dir_all(prefix.join("lib")).unwrap();
    fs::create_dir_all(prefix.join("share")).unwrap();
    fs::write(
        prefix.join("bin/activate-foo"),
        format!("export FOO_HOME={prefix_str}\nexport PATH={prefix_str}/bin:$PATH\n"),
    )
    .unwrap();
    fs::write(prefix.join("lib/libfoo.so"), binary_body(&prefix_str)).unwrap();
    fs::write(prefix.join("share/data.txt"), "plain data\n").unwrap();

    TestEnv {
        temp,
        prefix,
        prefix_str,
        cache_dir,
    }
}

/// Fake shared object embedding the prefix as a NUL-terminated string.
pub fn binary_body(prefix: &str) -> Vec<u8> {
    let mut body = b"\x7fELF\x02\x01\x01\x00\xde\xad\xbe\xefrpath=".to_vec();
    body.extend_from_slice(prefix.as_bytes());
    body.extend_from_slice(b"/lib\0trailing-binary-data");
    body
}

#[derive(Debug)]
pub struct TarEntry {
    pub name: String,
    pub mode: u32,
    pub is_symlink: bool,
    pub link_target: Option<String>,
    pub content: Vec<u8>,
}

pub fn read_targz(path: &Path) -> Vec<TarEntry> {
    let file = fs::File::open(path).expect("open archive");
    read_tar_entries(flate2::read::GzDecoder::new(file))
}

pub fn read_tar_zst(path: &Path) -> Vec<TarEntry> {
    let file = fs::File::open(path).expect("open archive");
    read_tar_entries(zstd::stream::read::Decoder::new(file).expect("zstd stream"))
}

fn read_tar_entries<R: std::io::Read>(reader: R) -> Vec<TarEntry> {
    use std::io::Read;

    let mut archive = tar::Archive::new(reader);
    archive
        .entries()
        .expect("tar entries")
        .map(|entry| {
            let mut entry = entry.expect("tar entry");
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mode = entry.header().mode().unwrap();
            let is_symlink = entry.header().entry_type().is_symlink();
            let link_target = entry
                .link_name()
                .unwrap()
                .map(|t| t.to_string_lossy().into_owned());
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            TarEntry {
                name,
                mode,
                is_symlink,
                link_target,
                content,
            }
        })
        .collect()
}

pub fn find<'a>(entries: &'a [TarEntry], name: &str) -> &'a TarEntry {
    entries
        .iter()
        .find(|e| e.name == name)
        .unwrap_or_else(|| {
            let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
            panic!("no entry {name:?} in archive; have {names:?}")
        })
}

pub fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty()
        && haystack.len() >= needle.len()
        && haystack.windows(needle.len()).any(|w| w == needle)
}
