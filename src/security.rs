#![forbid(unsafe_code)]

//! Input hygiene shared by the grabtube binaries: refusing to run as root,
//! turning untrusted video titles into file names, and validating URLs and
//! path segments that arrive over HTTP.

use std::path::{Component, Path};

use anyhow::{Result, bail};
use nix::unistd::Uid;
use url::Url;

/// Longest file stem produced by [`sanitize_title`], in UTF-8 bytes. Leaves
/// room under the usual 255-byte name limit for the digest suffix, the
/// extension and the extractor's temporary suffixes.
pub const MAX_STEM_BYTES: usize = 200;

const FALLBACK_STEM: &str = "download";

/// Fails fast when a binary is started as root. Downloads and history records
/// are written by the service account, never by root.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} must not be run as root; use a dedicated service account");
    }
    Ok(())
}

/// Strips characters that are illegal in file names on common platforms,
/// collapses whitespace and caps the byte length on a character boundary.
/// Never returns an empty string.
pub fn sanitize_title(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_matches('.').trim();
    let capped = truncate_bytes(trimmed, MAX_STEM_BYTES).trim_end();
    if capped.is_empty() {
        FALLBACK_STEM.to_string()
    } else {
        capped.to_string()
    }
}

fn truncate_bytes(value: &str, max_bytes: usize) -> &str {
    if value.len() <= max_bytes {
        return value;
    }
    let end = value
        .char_indices()
        .map(|(index, c)| index + c.len_utf8())
        .take_while(|end| *end <= max_bytes)
        .last()
        .unwrap_or(0);
    &value[..end]
}

/// True when `value` is a single plain path component (no separators, no
/// `..`, not empty).
pub fn is_safe_path_segment(value: &str) -> bool {
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !value.contains('/')
        && !value.contains('\\')
}

/// Accepts only absolute `http`/`https` URLs with a host.
pub fn validate_video_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("no URL provided");
    }
    let parsed = Url::parse(trimmed).map_err(|err| anyhow::anyhow!("invalid URL: {err}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        bail!("unsupported URL scheme: {}", parsed.scheme());
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        bail!("URL has no host");
    }
    Ok(parsed)
}
