//! Per-file transform applied by the pipeline workers.
//!
//! Text-prefix files are rewritten in-stream to the destination prefix;
//! binary-prefix files ship byte-identical and pick up a deferred-rewrite
//! record for the on-target runner. `conda-meta/*.json` records get their
//! machine-local cache paths blanked.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{PackError, Result};
use crate::inventory::PrefixKind;
use crate::prefixes::{self, TextRewriter};
use crate::walk::{FileRecord, PrefixAction};

pub struct RewritePlan {
    pub source_prefix: String,
    pub dest_prefix: String,
    /// The destination is the neutral placeholder, so even rewritten text
    /// files still need on-target cleanup.
    pub dest_is_placeholder: bool,
    /// Ship text files unchanged and leave all rewriting to the runner.
    pub defer_text: bool,
}

pub enum Payload {
    Inline(Vec<u8>),
    /// Untouched source file, handed over as the worker's open handle so the
    /// writer streams exactly what was inspected.
    OnDisk { file: File, size: u64 },
}

impl Payload {
    pub fn size(&self) -> u64 {
        match self {
            Payload::Inline(bytes) => bytes.len() as u64,
            Payload::OnDisk { size, .. } => *size,
        }
    }
}

/// One entry for the on-target runner: the exact byte string this file
/// embeds after packing, and the policy to rewrite it with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredRewrite {
    pub placeholder: String,
    pub mode: PrefixKind,
}

pub struct Transformed {
    pub payload: Payload,
    pub deferred: Option<DeferredRewrite>,
    pub warning: Option<String>,
}

/// `bin/python`, `bin/python3`, `bin/python3.11`: the runner must never
/// patch the interpreter it may be running under.
fn is_interpreter(rel: &str) -> bool {
    rel.strip_prefix("bin/python")
        .map(|rest| rest.chars().all(|c| c.is_ascii_digit() || c == '.'))
        .unwrap_or(false)
}

impl RewritePlan {
    /// Exact byte string this record embeds for its prefix.
    pub fn placeholder_for<'a>(&'a self, record: &'a FileRecord) -> &'a str {
        record
            .placeholder
            .as_deref()
            .unwrap_or(&self.source_prefix)
    }

    /// An explicit destination must fit every binary placeholder it will
    /// later overwrite; checked before any output is opened.
    pub fn check_dest_length(&self, records: &[FileRecord]) -> Result<()> {
        if self.dest_is_placeholder {
            return Ok(());
        }
        for record in records {
            if record.prefix_action != PrefixAction::Binary {
                continue;
            }
            let placeholder = self.placeholder_for(record);
            if self.dest_prefix.len() > placeholder.len() {
                return Err(PackError::DestinationPrefixTooLong {
                    dest: self.dest_prefix.clone(),
                    dest_len: self.dest_prefix.len(),
                    path: record.relative_path.clone(),
                    placeholder_len: placeholder.len(),
                });
            }
        }
        Ok(())
    }

    pub fn transform(&self, source_root: &Path, record: &FileRecord) -> Result<Transformed> {
        let source = source_root.join(&record.relative_path);
        let worker_err = |err: std::io::Error| PackError::Worker {
            path: record.relative_path.clone(),
            source: err,
        };

        if record.launder_meta {
            let raw = std::fs::read(&source).map_err(worker_err)?;
            let bytes = launder_conda_meta(&raw).map_err(|err| PackError::Json {
                path: source.clone(),
                source: err,
            })?;
            return Ok(Transformed {
                payload: Payload::Inline(bytes),
                deferred: None,
                warning: None,
            });
        }

        match record.prefix_action {
            PrefixAction::Text if !self.defer_text => {
                let raw = std::fs::read(&source).map_err(worker_err)?;
                let warning = self.verify_checksum(record, &raw);
                let placeholder = self.placeholder_for(record).as_bytes().to_vec();

                if record.relative_path.starts_with("bin/") {
                    if let Some(fixed) = prefixes::rewrite_shebang(&raw, &placeholder) {
                        debug!(path = %record.relative_path, "shebang neutralized");
                        return Ok(Transformed {
                            payload: Payload::Inline(fixed),
                            deferred: None,
                            warning,
                        });
                    }
                }

                let mut rewriter = TextRewriter::new(
                    std::io::Cursor::new(raw),
                    &placeholder,
                    self.dest_prefix.as_bytes(),
                );
                let mut out = Vec::new();
                rewriter.read_to_end(&mut out).map_err(worker_err)?;
                // The file now embeds the neutral placeholder; that is what
                // the runner must look for on the target.
                let deferred = (self.dest_is_placeholder
                    && !is_interpreter(&record.relative_path))
                .then(|| DeferredRewrite {
                    placeholder: self.dest_prefix.clone(),
                    mode: PrefixKind::Text,
                });
                Ok(Transformed {
                    payload: Payload::Inline(out),
                    deferred,
                    warning,
                })
            }
            PrefixAction::Text => {
                // Deferred text: ship unchanged, let the runner rewrite.
                let (payload, warning) = self.open_passthrough(record, &source)?;
                let deferred = (!is_interpreter(&record.relative_path)).then(|| {
                    DeferredRewrite {
                        placeholder: self.placeholder_for(record).to_string(),
                        mode: PrefixKind::Text,
                    }
                });
                Ok(Transformed {
                    payload,
                    deferred,
                    warning,
                })
            }
            PrefixAction::Binary => {
                let (payload, warning) = self.open_passthrough(record, &source)?;
                let deferred = (!is_interpreter(&record.relative_path)).then(|| {
                    DeferredRewrite {
                        placeholder: self.placeholder_for(record).to_string(),
                        mode: PrefixKind::Binary,
                    }
                });
                Ok(Transformed {
                    payload,
                    deferred,
                    warning,
                })
            }
            PrefixAction::None => {
                let (payload, warning) = self.open_passthrough(record, &source)?;
                Ok(Transformed {
                    payload,
                    deferred: None,
                    warning,
                })
            }
        }
    }

    fn open_passthrough(
        &self,
        record: &FileRecord,
        source: &Path,
    ) -> Result<(Payload, Option<String>)> {
        let worker_err = |err: std::io::Error| PackError::Worker {
            path: record.relative_path.clone(),
            source: err,
        };
        let mut file = File::open(source).map_err(worker_err)?;
        let size = file.metadata().map_err(worker_err)?.len();
        let mut warning = None;
        if let Some(expected) = record.sha256.as_deref() {
            let mut hasher = Sha256::new();
            let mut buf = [0u8; 128 * 1024];
            loop {
                let n = file.read(&mut buf).map_err(worker_err)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            let actual = hex::encode(hasher.finalize());
            if actual != expected {
                warning = Some(format!(
                    "{}: content differs from the package manifest (sha256 mismatch)",
                    record.relative_path
                ));
            }
            file.seek(SeekFrom::Start(0)).map_err(worker_err)?;
        }
        Ok((Payload::OnDisk { file, size }, warning))
    }

    fn verify_checksum(&self, record: &FileRecord, raw: &[u8]) -> Option<String> {
        let expected = record.sha256.as_deref()?;
        let actual = hex::encode(Sha256::digest(raw));
        (actual != expected).then(|| {
            format!(
                "{}: content differs from the package manifest (sha256 mismatch)",
                record.relative_path
            )
        })
    }
}

/// Blank the machine-local paths conda records at install time; they are
/// meaningless (and leaky) on the target host. Keys come out sorted.
fn launder_conda_meta(raw: &[u8]) -> serde_json::Result<Vec<u8>> {
    let mut value: Value = serde_json::from_slice(raw)?;
    if let Some(map) = value.as_object_mut() {
        for field in ["extracted_package_dir", "package_tarball_full_path"] {
            if map.contains_key(field) {
                map.insert(field.to_string(), Value::String(String::new()));
            }
        }
        if let Some(link) = map.get_mut("link").and_then(Value::as_object_mut) {
            if link.contains_key("source") {
                link.insert("source".to_string(), Value::String(String::new()));
            }
        }
    }
    let mut out = serde_json::to_vec_pretty(&value)?;
    out.push(b'\n');
    Ok(out)
}
