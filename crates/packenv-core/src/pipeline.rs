//! Single-writer, multi-worker archiving pipeline.
//!
//! The driver feeds records into a bounded job queue in canonical order and
//! keeps one rendezvous slot per in-flight record; draining the slots in
//! submission order guarantees the sink sees entries in canonical order no
//! matter when workers finish. Workers never touch the sink.

use std::collections::VecDeque;
use std::fs::File;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::error::{PackError, Result};
use crate::formats::ArchiveSink;
use crate::progress::ProgressSink;
use crate::rewrite::{DeferredRewrite, Payload, RewritePlan, Transformed};
use crate::walk::{FileKind, FileRecord};

pub struct PipelineContext<'a> {
    pub source_root: &'a Path,
    pub arcroot: &'a str,
    pub plan: &'a RewritePlan,
    pub n_threads: usize,
    /// Replace symlink entries with a copy of their target (zip without
    /// symlink extensions).
    pub materialize_symlinks: bool,
    pub cancel: Option<&'a AtomicBool>,
}

#[derive(Debug, Default)]
pub struct PipelineOutput {
    pub files: usize,
    /// `(relative_path, rewrite)` entries for the deferred-rewrite manifest.
    pub deferred: Vec<(String, DeferredRewrite)>,
    pub warnings: Vec<String>,
}

struct Job {
    record: FileRecord,
    result_tx: SyncSender<Result<Transformed>>,
}

impl PipelineContext<'_> {
    fn cancelled(&self) -> bool {
        self.cancel
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    fn arcname(&self, rel: &str) -> String {
        if self.arcroot.is_empty() {
            rel.to_string()
        } else {
            format!("{}/{rel}", self.arcroot)
        }
    }
}

pub fn stream_entries(
    records: Vec<FileRecord>,
    ctx: &PipelineContext<'_>,
    sink: &mut dyn ArchiveSink,
    progress: &dyn ProgressSink,
) -> Result<PipelineOutput> {
    progress.begin(records.len());
    let mut out = PipelineOutput::default();
    if ctx.n_threads <= 1 {
        for record in records {
            if ctx.cancelled() {
                return Err(PackError::Cancelled);
            }
            let transformed = transform_record(ctx, &record)?;
            write_entry(ctx, sink, &record, transformed, &mut out)?;
            progress.advance(&record.relative_path);
        }
        progress.finish();
        return Ok(out);
    }

    std::thread::scope(|scope| -> Result<()> {
        let (job_tx, job_rx) = sync_channel::<Job>(ctx.n_threads);
        let job_rx = Arc::new(Mutex::new(job_rx));
        for _ in 0..ctx.n_threads {
            let job_rx = Arc::clone(&job_rx);
            scope.spawn(move || loop {
                let job = { job_rx.lock().expect("pipeline job lock").recv() };
                let Ok(Job { record, result_tx }) = job else {
                    break;
                };
                let result = transform_record_inner(ctx.plan, ctx.source_root, &record);
                let _ = result_tx.send(result);
            });
        }

        let mut pending: VecDeque<(FileRecord, Receiver<Result<Transformed>>)> =
            VecDeque::with_capacity(ctx.n_threads + 2);
        for record in records {
            if ctx.cancelled() {
                return Err(PackError::Cancelled);
            }
            while pending.len() >= ctx.n_threads + 2 {
                drain_front(ctx, sink, &mut pending, &mut out, progress)?;
            }
            let (result_tx, result_rx) = sync_channel(1);
            job_tx
                .send(Job {
                    record: record.clone(),
                    result_tx,
                })
                .map_err(|_| worker_died(&record.relative_path))?;
            pending.push_back((record, result_rx));
        }
        drop(job_tx);
        while !pending.is_empty() {
            drain_front(ctx, sink, &mut pending, &mut out, progress)?;
        }
        Ok(())
    })?;

    progress.finish();
    Ok(out)
}

fn drain_front(
    ctx: &PipelineContext<'_>,
    sink: &mut dyn ArchiveSink,
    pending: &mut VecDeque<(FileRecord, Receiver<Result<Transformed>>)>,
    out: &mut PipelineOutput,
    progress: &dyn ProgressSink,
) -> Result<()> {
    let (record, result_rx) = pending.pop_front().expect("pending entry");
    let transformed = result_rx
        .recv()
        .map_err(|_| worker_died(&record.relative_path))??;
    if ctx.cancelled() {
        return Err(PackError::Cancelled);
    }
    write_entry(ctx, sink, &record, transformed, out)?;
    progress.advance(&record.relative_path);
    Ok(())
}

fn worker_died(path: &str) -> PackError {
    PackError::Worker {
        path: path.to_string(),
        source: std::io::Error::other("pipeline worker stopped unexpectedly"),
    }
}

fn transform_record(ctx: &PipelineContext<'_>, record: &FileRecord) -> Result<Transformed> {
    transform_record_inner(ctx.plan, ctx.source_root, record)
}

fn transform_record_inner(
    plan: &RewritePlan,
    source_root: &Path,
    record: &FileRecord,
) -> Result<Transformed> {
    if record.file_kind == FileKind::Regular {
        plan.transform(source_root, record)
    } else {
        Ok(Transformed {
            payload: Payload::Inline(Vec::new()),
            deferred: None,
            warning: None,
        })
    }
}

fn write_entry(
    ctx: &PipelineContext<'_>,
    sink: &mut dyn ArchiveSink,
    record: &FileRecord,
    transformed: Transformed,
    out: &mut PipelineOutput,
) -> Result<()> {
    let arcname = ctx.arcname(&record.relative_path);
    match record.file_kind {
        FileKind::Directory => sink.add_directory(&arcname, record.mode, record.mtime)?,
        FileKind::Symlink => {
            let target = record.link_target.as_deref().unwrap_or_default();
            if ctx.materialize_symlinks {
                materialize_symlink(ctx, sink, record, &arcname, out)?;
            } else {
                sink.add_symlink(&arcname, record.mode, record.mtime, target)?;
            }
        }
        FileKind::Regular => {
            match transformed.payload {
                Payload::Inline(bytes) => {
                    let size = bytes.len() as u64;
                    sink.add_regular(
                        &arcname,
                        record.mode,
                        record.mtime,
                        size,
                        &mut Cursor::new(bytes),
                    )?;
                }
                Payload::OnDisk { mut file, size } => {
                    sink.add_regular(&arcname, record.mode, record.mtime, size, &mut file)?;
                }
            }
            out.files += 1;
            if let Some(rewrite) = transformed.deferred {
                out.deferred.push((record.relative_path.clone(), rewrite));
            }
            if let Some(warning) = transformed.warning {
                warn!("{warning}");
                out.warnings.push(warning);
            }
        }
    }
    Ok(())
}

/// Zip fallback: the standard has no symlinks, so store a copy of the target
/// (file or directory entry); dangling links are skipped with a warning.
fn materialize_symlink(
    ctx: &PipelineContext<'_>,
    sink: &mut dyn ArchiveSink,
    record: &FileRecord,
    arcname: &str,
    out: &mut PipelineOutput,
) -> Result<()> {
    let source = ctx.source_root.join(&record.relative_path);
    match std::fs::metadata(&source) {
        Ok(meta) if meta.is_file() => {
            let mut file = File::open(&source).map_err(|err| PackError::Worker {
                path: record.relative_path.clone(),
                source: err,
            })?;
            let mode = file_mode(&meta);
            sink.add_regular(arcname, mode, record.mtime, meta.len(), &mut file)?;
            out.files += 1;
            Ok(())
        }
        Ok(_) => sink.add_directory(arcname, 0o755, record.mtime),
        Err(_) => {
            let warning = format!(
                "{}: dangling symlink dropped from zip output",
                record.relative_path
            );
            warn!("{warning}");
            out.warnings.push(warning);
            Ok(())
        }
    }
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0o644
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArchiveFormat;
    use crate::formats::TarSink;
    use crate::prefixes::NEUTRAL_PLACEHOLDER;
    use crate::walk::SourceKind;
    use std::sync::atomic::AtomicBool;

    fn plan(prefix: &str) -> RewritePlan {
        RewritePlan {
            source_prefix: prefix.to_string(),
            dest_prefix: NEUTRAL_PLACEHOLDER.to_string(),
            dest_is_placeholder: true,
            defer_text: false,
        }
    }

    fn regular(rel: &str, size: u64) -> FileRecord {
        FileRecord {
            relative_path: rel.to_string(),
            source_kind: SourceKind::Unmanaged,
            file_kind: FileKind::Regular,
            mode: 0o644,
            mtime: 0,
            size,
            prefix_action: crate::walk::PrefixAction::None,
            placeholder: None,
            package: None,
            link_target: None,
            launder_meta: false,
            sha256: None,
        }
    }

    fn dir(rel: &str) -> FileRecord {
        FileRecord {
            file_kind: FileKind::Directory,
            ..regular(rel, 0)
        }
    }

    fn archive_names(path: &Path) -> Vec<String> {
        let mut archive = tar::Archive::new(File::open(path).unwrap());
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn parallel_run_preserves_canonical_order() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("env");
        std::fs::create_dir_all(src.join("lib")).unwrap();
        let mut records = vec![dir("lib")];
        for i in 0..40 {
            let rel = format!("lib/f{i:02}");
            // Vary sizes so completion order differs from submission order.
            let body = vec![b'x'; ((40 - i) * 4096) as usize];
            std::fs::write(src.join(&rel), &body).unwrap();
            records.push(regular(&rel, body.len() as u64));
        }

        let out_path = temp.path().join("ordered.tar");
        let mut sink: Box<dyn ArchiveSink> = Box::new(
            TarSink::create(&out_path, ArchiveFormat::Tar, 0, 1, true).unwrap(),
        );
        let plan = plan(&src.to_string_lossy());
        let ctx = PipelineContext {
            source_root: &src,
            arcroot: "env",
            plan: &plan,
            n_threads: 4,
            materialize_symlinks: false,
            cancel: None,
        };
        let expected: Vec<String> = records
            .iter()
            .map(|r| format!("env/{}", r.relative_path))
            .collect();
        let result =
            stream_entries(records, &ctx, sink.as_mut(), &crate::progress::NullProgress).unwrap();
        sink.finalize().unwrap();
        assert_eq!(result.files, 40);
        assert_eq!(archive_names(&out_path), expected);
    }

    #[test]
    fn pre_set_cancel_flag_stops_before_writing() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("env");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("file"), b"x").unwrap();

        let out_path = temp.path().join("cancelled.tar");
        let mut sink: Box<dyn ArchiveSink> = Box::new(
            TarSink::create(&out_path, ArchiveFormat::Tar, 0, 1, true).unwrap(),
        );
        let plan = plan(&src.to_string_lossy());
        let cancel = AtomicBool::new(true);
        let ctx = PipelineContext {
            source_root: &src,
            arcroot: "",
            plan: &plan,
            n_threads: 2,
            materialize_symlinks: false,
            cancel: Some(&cancel),
        };
        let err = stream_entries(
            vec![regular("file", 1)],
            &ctx,
            sink.as_mut(),
            &crate::progress::NullProgress,
        )
        .unwrap_err();
        assert!(matches!(err, PackError::Cancelled));
        sink.abort();
        assert!(!out_path.exists());
    }

    #[test]
    fn missing_source_file_surfaces_as_worker_error() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("env");
        std::fs::create_dir_all(&src).unwrap();

        let out_path = temp.path().join("broken.tar");
        let mut sink: Box<dyn ArchiveSink> = Box::new(
            TarSink::create(&out_path, ArchiveFormat::Tar, 0, 1, true).unwrap(),
        );
        let plan = plan(&src.to_string_lossy());
        let ctx = PipelineContext {
            source_root: &src,
            arcroot: "",
            plan: &plan,
            n_threads: 3,
            materialize_symlinks: false,
            cancel: None,
        };
        let err = stream_entries(
            vec![regular("vanished", 1)],
            &ctx,
            sink.as_mut(),
            &crate::progress::NullProgress,
        )
        .unwrap_err();
        assert!(matches!(err, PackError::Worker { .. }));
    }
}
