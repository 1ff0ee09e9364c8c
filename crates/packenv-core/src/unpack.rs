//! Deferred-rewrite manifest and the bundled on-target runner.
//!
//! Every archive carries `conda-meta/conda-pack.json` (what still needs
//! rewriting, and from which placeholders) plus `bin/conda-unpack`, a
//! dependency-free Python script that applies the text and binary policies
//! against its own extraction root.

use serde::Serialize;

use crate::inventory::PrefixKind;
use crate::rewrite::DeferredRewrite;

pub const MANIFEST_PATH: &str = "conda-meta/conda-pack.json";
pub const RUNNER_PATH: &str = "bin/conda-unpack";

#[derive(Debug, Serialize)]
pub struct UnpackManifest<'a> {
    pub prefix_placeholder: &'a str,
    pub destination_prefix: &'a str,
    pub files: Vec<ManifestEntry<'a>>,
}

/// Each file carries the single exact string it embeds; the runner rewrites
/// a file with its own placeholder only, never the archive-wide ones.
#[derive(Debug, Serialize)]
pub struct ManifestEntry<'a> {
    pub path: &'a str,
    pub placeholder: &'a str,
    pub mode: PrefixKind,
}

pub fn manifest_bytes(
    prefix_placeholder: &str,
    destination_prefix: &str,
    deferred: &[(String, DeferredRewrite)],
) -> Vec<u8> {
    let manifest = UnpackManifest {
        prefix_placeholder,
        destination_prefix,
        files: deferred
            .iter()
            .map(|(path, rewrite)| ManifestEntry {
                path,
                placeholder: &rewrite.placeholder,
                mode: rewrite.mode,
            })
            .collect(),
    };
    let mut out = serde_json::to_vec_pretty(&manifest).expect("manifest serializes");
    out.push(b'\n');
    out
}

/// A generated file injected into the archive after the environment tree.
#[derive(Debug, Clone)]
pub struct SyntheticEntry {
    pub relative_path: &'static str,
    pub mode: u32,
    pub bytes: Vec<u8>,
}

pub fn runner_entries(manifest: Vec<u8>) -> Vec<SyntheticEntry> {
    vec![
        SyntheticEntry {
            relative_path: RUNNER_PATH,
            mode: 0o755,
            bytes: RUNNER_SCRIPT.as_bytes().to_vec(),
        },
        SyntheticEntry {
            relative_path: MANIFEST_PATH,
            mode: 0o644,
            bytes: manifest,
        },
    ]
}

/// POSIX activation hooks, added unless the environment ships its own conda.
pub fn activation_entries() -> Vec<SyntheticEntry> {
    vec![
        SyntheticEntry {
            relative_path: "bin/activate",
            mode: 0o755,
            bytes: ACTIVATE_SCRIPT.as_bytes().to_vec(),
        },
        SyntheticEntry {
            relative_path: "bin/deactivate",
            mode: 0o755,
            bytes: DEACTIVATE_SCRIPT.as_bytes().to_vec(),
        },
    ]
}

const RUNNER_SCRIPT: &str = r#"#!/usr/bin/env python
"""Finish unpacking the environment after unarchiving.

Rewrites the prefix records listed in conda-meta/conda-pack.json against the
directory this script was extracted into. Each record names the one string
its file embeds: text records get a plain byte substitution, binary records
a length-preserving, NUL-padded rewrite.
"""
import json
import os
import sys


def text_replace(data, placeholder, new_prefix):
    return data.replace(placeholder, new_prefix)


def binary_replace(data, placeholder, new_prefix):
    out = bytearray()
    pos = 0
    while True:
        hit = data.find(placeholder, pos)
        if hit < 0:
            break
        padding = len(placeholder) - len(new_prefix)
        if padding < 0:
            raise ValueError(
                "new prefix %r is longer than the %d-byte placeholder; "
                "unpack into a shorter path" % (new_prefix, len(placeholder)))
        end = data.find(b"\0", hit)
        if end < 0:
            end = len(data)
        out += data[pos:hit]
        out += new_prefix
        out += data[hit + len(placeholder):end]
        out += b"\0" * padding
        pos = end
    out += data[pos:]
    return bytes(out)


def update_file(path, placeholder, new_prefix, mode):
    if not os.path.isfile(path) or os.path.islink(path):
        return
    with open(path, "rb") as handle:
        original = handle.read()
    if mode == "binary":
        data = binary_replace(original, placeholder, new_prefix)
    else:
        data = text_replace(original, placeholder, new_prefix)
    if data != original:
        with open(path, "wb") as handle:
            handle.write(data)


def main():
    script_dir = os.path.dirname(os.path.abspath(__file__))
    new_prefix = os.path.dirname(script_dir)
    meta_path = os.path.join(new_prefix, "conda-meta", "conda-pack.json")
    with open(meta_path) as handle:
        meta = json.load(handle)
    new_bytes = new_prefix.encode("utf-8")
    for record in meta.get("files", []):
        placeholder = record.get("placeholder") or meta.get("prefix_placeholder")
        if not placeholder or placeholder == new_prefix:
            continue
        update_file(os.path.join(new_prefix, record["path"]),
                    placeholder.encode("utf-8"), new_bytes, record["mode"])
    return 0


if __name__ == "__main__":
    sys.exit(main())
"#;

const ACTIVATE_SCRIPT: &str = r#"#!/bin/sh
# Source this script to activate the environment: . <env>/bin/activate
_script="${BASH_SOURCE:-$0}"
_bin_dir=$(CDPATH= cd -- "$(dirname -- "$_script")" && pwd)
CONDA_PREFIX=$(dirname "$_bin_dir")
export CONDA_PREFIX
_OLD_PACK_PATH="$PATH"
export _OLD_PACK_PATH
PATH="$_bin_dir:$PATH"
export PATH
unset _script _bin_dir
"#;

const DEACTIVATE_SCRIPT: &str = r#"#!/bin/sh
# Source this script to undo bin/activate.
if [ -n "${_OLD_PACK_PATH:-}" ]; then
    PATH="$_OLD_PACK_PATH"
    export PATH
    unset _OLD_PACK_PATH
fi
unset CONDA_PREFIX
"#;
