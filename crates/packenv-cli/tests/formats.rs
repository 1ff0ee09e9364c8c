use std::io::Read;

use assert_cmd::cargo::cargo_bin_cmd;

mod common;

use common::{binary_body, build_env, find, read_tar_zst, read_targz};

#[test]
fn zip_output_rewrites_and_materializes_symlinks() {
    let env = build_env();
    std::os::unix::fs::symlink(
        env.prefix.join("lib/libfoo.so"),
        env.prefix.join("lib/libfoo-alias.so"),
    )
    .unwrap();
    let out = env.temp.path().join("out.zip");

    cargo_bin_cmd!("packenv")
        .arg("-p")
        .arg(&env.prefix)
        .arg("-o")
        .arg(&out)
        .args(["--dest-prefix", "/srv/app"])
        .assert()
        .success();

    let mut archive = zip::ZipArchive::new(std::fs::File::open(&out).unwrap()).unwrap();
    let mut activate = String::new();
    archive
        .by_name("bin/activate-foo")
        .unwrap()
        .read_to_string(&mut activate)
        .unwrap();
    assert!(activate.contains("/srv/app/bin"));
    assert!(!activate.contains(&env.prefix_str));

    // Symlinks are materialized as copies by default.
    let mut alias = Vec::new();
    archive
        .by_name("lib/libfoo-alias.so")
        .unwrap()
        .read_to_end(&mut alias)
        .unwrap();
    assert_eq!(alias, binary_body(&env.prefix_str));

    assert!(archive.by_name("conda-meta/conda-pack.json").is_ok());
    assert!(archive.by_name("bin/conda-unpack").is_ok());
}

#[test]
fn tar_zst_round_trips() {
    let env = build_env();
    let out = env.temp.path().join("out.tar.zst");

    cargo_bin_cmd!("packenv")
        .arg("-p")
        .arg(&env.prefix)
        .arg("-o")
        .arg(&out)
        .args(["--dest-prefix", "/srv/app", "-j", "2"])
        .assert()
        .success();

    let entries = read_tar_zst(&out);
    let lib = find(&entries, "lib/libfoo.so");
    assert_eq!(lib.content, binary_body(&env.prefix_str));
    find(&entries, "conda-meta/conda-pack.json");
}

#[test]
fn no_archive_clones_the_rewritten_tree() {
    let env = build_env();
    let out = env.temp.path().join("cloned");

    cargo_bin_cmd!("packenv")
        .arg("-p")
        .arg(&env.prefix)
        .arg("-o")
        .arg(&out)
        .args(["--format", "no-archive", "--dest-prefix", "/srv/app"])
        .assert()
        .success();

    let activate = std::fs::read_to_string(out.join("bin/activate-foo")).unwrap();
    assert!(activate.contains("/srv/app/bin"));
    assert_eq!(
        std::fs::read(out.join("lib/libfoo.so")).unwrap(),
        binary_body(&env.prefix_str)
    );
    assert!(out.join("bin/conda-unpack").is_file());
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(out.join("bin/conda-unpack"))
            .unwrap()
            .permissions()
            .mode();
        assert_ne!(mode & 0o111, 0);
    }
}

#[test]
fn parcel_layout_is_enforced() {
    let env = build_env();
    let out = env.temp.path().join("analytics-2026.08.01-el7.parcel");

    cargo_bin_cmd!("packenv")
        .arg("-p")
        .arg(&env.prefix)
        .arg("-o")
        .arg(&out)
        .args([
            "--format",
            "parcel",
            "--parcel-name",
            "analytics",
            "--parcel-version",
            "2026.08.01",
        ])
        .assert()
        .success();

    let entries = read_targz(&out);
    assert!(entries
        .iter()
        .all(|e| e.name.starts_with("analytics-2026.08.01/")));

    let parcel_json = find(&entries, "analytics-2026.08.01/meta/parcel.json");
    let value: serde_json::Value = serde_json::from_slice(&parcel_json.content).unwrap();
    assert_eq!(value["name"], "analytics");
    assert_eq!(value["packages"][0]["name"], "foo");
    find(&entries, "analytics-2026.08.01/meta/conda_env.sh");

    // Text prefixes point at the parcel destination.
    let activate = find(&entries, "analytics-2026.08.01/bin/activate-foo");
    let text = String::from_utf8(activate.content.clone()).unwrap();
    assert!(text.contains("/opt/cloudera/parcels/analytics-2026.08.01/bin"));
}

#[test]
fn gzip_level_changes_output_size() {
    let env = build_env();
    // Compressible payload so the level matters.
    let big: String = (0..8000)
        .map(|i| format!("entry {i}: the quick brown fox jumps over the lazy dog\n"))
        .collect();
    std::fs::write(env.prefix.join("share/big.txt"), big).unwrap();
    let fast = env.temp.path().join("fast.tar.gz");
    let small = env.temp.path().join("small.tar.gz");

    for (out, level) in [(&fast, "1"), (&small, "9")] {
        cargo_bin_cmd!("packenv")
            .arg("-p")
            .arg(&env.prefix)
            .arg("-o")
            .arg(out)
            .args(["--compress-level", level])
            .assert()
            .success();
    }
    let fast_len = std::fs::metadata(&fast).unwrap().len();
    let small_len = std::fs::metadata(&small).unwrap().len();
    assert!(small_len < fast_len, "level 9 ({small_len}) should beat level 1 ({fast_len})");
}
