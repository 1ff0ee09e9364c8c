//! Byte-exact prefix matching and rewriting.
//!
//! Placeholders are matched as plain byte substrings (ASCII/UTF-8), never as
//! patterns. Text rewrites happen at pack time; binary rewrites are recorded
//! and applied on the target by the bundled runner, which must preserve file
//! length (see [`binary_replace`] for the exact padding rule it follows).

use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::error::{PackError, Result};

/// Default destination prefix baked into archives when the caller does not
/// supply one. Split so the literal never appears verbatim inside packenv's
/// own binaries.
pub const NEUTRAL_PLACEHOLDER: &str = concat!("/opt/packenv0packenv1", "packenv2");

/// First position of `needle` in `haystack` at or after `from`.
pub(crate) fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() || from > haystack.len() - needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle, 0).is_some()
}

/// Replace every occurrence of `placeholder` with `new_prefix`.
pub fn text_replace(data: &[u8], placeholder: &[u8], new_prefix: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut pos = 0;
    while let Some(hit) = find(data, placeholder, pos) {
        out.extend_from_slice(&data[pos..hit]);
        out.extend_from_slice(new_prefix);
        pos = hit + placeholder.len();
    }
    out.extend_from_slice(&data[pos..]);
    out
}

/// Length-preserving replacement of `placeholder` inside NUL-terminated
/// C strings.
///
/// For each occurrence, the region from the match up to the terminating NUL
/// is rewritten as `new_prefix` + the original tail, right-padded with NULs
/// back to the original length. The output is always exactly as long as the
/// input; a destination longer than the placeholder is an error.
pub fn binary_replace(data: &[u8], placeholder: &[u8], new_prefix: &[u8]) -> Result<Vec<u8>> {
    if new_prefix.len() > placeholder.len() {
        return Err(PackError::DestinationPrefixTooLong {
            dest: String::from_utf8_lossy(new_prefix).into_owned(),
            dest_len: new_prefix.len(),
            path: String::new(),
            placeholder_len: placeholder.len(),
        });
    }
    let mut out = Vec::with_capacity(data.len());
    let mut pos = 0;
    while let Some(hit) = find(data, placeholder, pos) {
        let terminator = data[hit..]
            .iter()
            .position(|&b| b == 0)
            .map_or(data.len(), |p| p + hit);
        out.extend_from_slice(&data[pos..hit]);
        out.extend_from_slice(new_prefix);
        out.extend_from_slice(&data[hit + placeholder.len()..terminator]);
        out.resize(out.len() + (placeholder.len() - new_prefix.len()), 0);
        pos = terminator;
    }
    out.extend_from_slice(&data[pos..]);
    debug_assert_eq!(out.len(), data.len());
    Ok(out)
}

/// Streaming text rewriter over any reader.
///
/// Keeps a carry of `placeholder.len() - 1` bytes between refills so matches
/// straddling a chunk boundary are still seen. Newlines and all other bytes
/// pass through untouched.
pub struct TextRewriter<R> {
    inner: R,
    placeholder: Vec<u8>,
    replacement: Vec<u8>,
    pending: Vec<u8>,
    pending_pos: usize,
    carry: Vec<u8>,
    eof: bool,
}

const REWRITE_CHUNK: usize = 64 * 1024;

impl<R: Read> TextRewriter<R> {
    pub fn new(inner: R, placeholder: &[u8], replacement: &[u8]) -> Self {
        Self {
            inner,
            placeholder: placeholder.to_vec(),
            replacement: replacement.to_vec(),
            pending: Vec::new(),
            pending_pos: 0,
            carry: Vec::new(),
            eof: false,
        }
    }

    fn refill(&mut self) -> io::Result<()> {
        let mut buf = std::mem::take(&mut self.carry);
        let carried = buf.len();
        buf.resize(carried + REWRITE_CHUNK, 0);
        let mut filled = carried;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..])?;
            if n == 0 {
                self.eof = true;
                break;
            }
            filled += n;
        }
        buf.truncate(filled);

        let mut out = Vec::with_capacity(buf.len());
        let mut pos = 0;
        while let Some(hit) = find(&buf, &self.placeholder, pos) {
            out.extend_from_slice(&buf[pos..hit]);
            out.extend_from_slice(&self.replacement);
            pos = hit + self.placeholder.len();
        }
        if self.eof {
            out.extend_from_slice(&buf[pos..]);
            self.carry = Vec::new();
        } else {
            // Everything before the cut is match-free and safe to emit; only
            // the last placeholder-1 bytes can still begin a match completed
            // by the next chunk.
            let cut = pos.max(buf.len().saturating_sub(self.placeholder.len() - 1));
            out.extend_from_slice(&buf[pos..cut]);
            self.carry = buf[cut..].to_vec();
        }
        self.pending = out;
        self.pending_pos = 0;
        Ok(())
    }
}

impl<R: Read> Read for TextRewriter<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pending_pos < self.pending.len() {
                let n = (self.pending.len() - self.pending_pos).min(buf.len());
                buf[..n].copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
                self.pending_pos += n;
                return Ok(n);
            }
            if self.eof && self.carry.is_empty() {
                return Ok(0);
            }
            self.refill()?;
        }
    }
}

/// Whether a buffer decodes as UTF-8, tolerating a multi-byte character
/// chopped at the end of a sniffing window.
pub fn looks_like_text(data: &[u8]) -> bool {
    match std::str::from_utf8(data) {
        Ok(_) => true,
        Err(err) => err.error_len().is_none() && data.len() - err.valid_up_to() < 4,
    }
}

/// Rewrite a `#!<prefix>/...` shebang to `#!/usr/bin/env <program>`.
///
/// Only fires when the prefix occurs exactly once in the file (otherwise a
/// deferred record is still needed and the rewrite would hide it).
pub fn rewrite_shebang(data: &[u8], prefix: &[u8]) -> Option<Vec<u8>> {
    if !data.starts_with(b"#!") {
        return None;
    }
    let line_end = data.iter().position(|&b| b == b'\n').unwrap_or(data.len());
    let line = &data[..line_end];
    let mut exec_start = 2;
    while exec_start < line.len() && line[exec_start] == b' ' {
        exec_start += 1;
    }
    let exec_end = line[exec_start..]
        .iter()
        .position(|&b| b == b' ' || b == b'\t' || b == b'\r')
        .map_or(line.len(), |p| p + exec_start);
    let executable = &line[exec_start..exec_end];
    if !executable.starts_with(prefix) {
        return None;
    }
    let occurrences = {
        let mut count = 0;
        let mut pos = 0;
        while let Some(hit) = find(data, prefix, pos) {
            count += 1;
            pos = hit + prefix.len();
        }
        count
    };
    if occurrences != 1 {
        return None;
    }
    let program = executable.rsplit(|&b| b == b'/').next()?;
    let options = &line[exec_end..];
    let mut out = Vec::with_capacity(data.len());
    out.extend_from_slice(b"#!/usr/bin/env ");
    out.extend_from_slice(program);
    out.extend_from_slice(options);
    out.extend_from_slice(&data[line_end..]);
    Some(out)
}

/// Archive-relative target for a symlink at `link` pointing at `target`
/// (both prefix-relative, POSIX separators). I.e. `bin/python` ->
/// `lib/libpython.so` yields `../lib/libpython.so`.
pub fn relative_symlink_target(link: &str, target: &str) -> String {
    let link_dir: Vec<&str> = match link.rsplit_once('/') {
        Some((dir, _)) => dir.split('/').collect(),
        None => Vec::new(),
    };
    let target_parts: Vec<&str> = target.split('/').collect();
    let common = link_dir
        .iter()
        .zip(target_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut parts: Vec<&str> = Vec::new();
    for _ in common..link_dir.len() {
        parts.push("..");
    }
    parts.extend(&target_parts[common..]);
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

/// Canonical absolute form of the environment prefix.
pub fn canonical_prefix(path: &Path) -> Result<PathBuf> {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|err| PackError::io("failed to resolve current directory", err))?
            .join(path)
    };
    abs.canonicalize()
        .map_err(|_| PackError::MissingEnvironment(abs))
}

/// POSIX-style relative path for archive entry names.
pub fn posix_rel(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn text_replace_hits_every_occurrence() {
        let data = b"/opt/env/bin:/opt/env/lib and /opt/envx";
        let out = text_replace(data, b"/opt/env", b"/srv/app");
        assert_eq!(&out[..], &b"/srv/app/bin:/srv/app/lib and /srv/appx"[..]);
    }

    #[test]
    fn binary_replace_preserves_length_and_pads() {
        let data = b"ld\0/opt/env_build/lib\0rest";
        let out = binary_replace(data, b"/opt/env_build", b"/srv/app").unwrap();
        assert_eq!(out.len(), data.len());
        assert_eq!(&out[..3], b"ld\0");
        assert_eq!(&out[3..15], b"/srv/app/lib");
        assert!(out[15..21].iter().all(|&b| b == 0));
        assert_eq!(&out[22..], b"rest");
    }

    #[test]
    fn binary_replace_rejects_longer_destination() {
        let err = binary_replace(b"x/opt/e\0", b"/opt/e", b"/a/much/longer/prefix");
        assert!(matches!(
            err,
            Err(PackError::DestinationPrefixTooLong { .. })
        ));
    }

    #[test]
    fn binary_replace_without_terminator_pads_to_end() {
        let data = b"tail /opt/env_build/share";
        let out = binary_replace(data, b"/opt/env_build", b"/srv").unwrap();
        assert_eq!(out.len(), data.len());
        assert_eq!(&out[..15], b"tail /srv/share");
        assert!(out[15..].iter().all(|&b| b == 0));
    }

    #[test]
    fn rewriter_catches_match_straddling_chunks() {
        let placeholder = b"/opt/env_build";
        let mut data = vec![b'a'; REWRITE_CHUNK - 5];
        data.extend_from_slice(placeholder);
        data.extend_from_slice(b" tail");
        let mut rewriter = TextRewriter::new(Cursor::new(data.clone()), placeholder, b"/srv/app");
        let mut out = Vec::new();
        rewriter.read_to_end(&mut out).unwrap();
        let expected = text_replace(&data, placeholder, b"/srv/app");
        assert_eq!(out, expected);
    }

    #[test]
    fn rewriter_handles_back_to_back_matches() {
        let data = b"/p/p/p".repeat(40_000);
        let mut rewriter = TextRewriter::new(Cursor::new(data.clone()), b"/p", b"/longer");
        let mut out = Vec::new();
        rewriter.read_to_end(&mut out).unwrap();
        assert_eq!(out, text_replace(&data, b"/p", b"/longer"));
    }

    #[test]
    fn shebang_rewrite_targets_env_interpreter() {
        let data = b"#!/opt/env_build/bin/python3 -u\nprint('hi')\n";
        let out = rewrite_shebang(data, b"/opt/env_build").unwrap();
        assert_eq!(&out[..], &b"#!/usr/bin/env python3 -u\nprint('hi')\n"[..]);
    }

    #[test]
    fn shebang_rewrite_declines_on_second_occurrence() {
        let data = b"#!/opt/env_build/bin/python\nX='/opt/env_build'\n";
        assert!(rewrite_shebang(data, b"/opt/env_build").is_none());
    }

    #[test]
    fn shebang_rewrite_ignores_foreign_interpreters() {
        assert!(rewrite_shebang(b"#!/usr/bin/sh\n", b"/opt/env_build").is_none());
    }

    #[test]
    fn relative_targets_walk_up_and_down() {
        assert_eq!(
            relative_symlink_target("bin/python", "lib/libpython.so"),
            "../lib/libpython.so"
        );
        assert_eq!(relative_symlink_target("a", "b"), "b");
        assert_eq!(
            relative_symlink_target("lib/a/x", "lib/b/y"),
            "../b/y"
        );
        assert_eq!(relative_symlink_target("lib/x", "lib/y"), "y");
    }

    #[test]
    fn text_sniff_tolerates_chopped_utf8() {
        assert!(looks_like_text(b"hello world"));
        let mut chopped = "caf\u{e9}".as_bytes().to_vec();
        chopped.pop();
        assert!(looks_like_text(&chopped));
        assert!(!looks_like_text(&[0x00, 0xff, 0x13, 0x37]));
    }
}
