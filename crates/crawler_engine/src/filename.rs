use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

const MAX_STEM_LEN: usize = 80;

/// Windows-safe file name for a downloaded image: `{stem}--{short_hash(url)}.{ext}`.
///
/// The stem comes from `hint` when given, otherwise from the last path segment of `url`.
pub fn safe_image_filename(hint: Option<&str>, url: &str) -> String {
    let raw = hint
        .map(str::to_string)
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| last_segment(url));
    let (stem, ext) = split_extension(&raw);
    let stem = sanitize(stem);
    let hash = short_hash(url);
    match ext.map(sanitize_extension).filter(|e| !e.is_empty()) {
        Some(ext) => format!("{stem}--{hash}.{ext}"),
        None => format!("{stem}--{hash}"),
    }
}

/// Returns `dir/name`, or `dir/{stem}-{n}.{ext}` for the first `n` that is free.
pub fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = split_extension(name);
    (1u32..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{stem}-{n}.{ext}")),
            None => dir.join(format!("{stem}-{n}")),
        })
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

fn last_segment(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .map(|segment| {
            url::form_urlencoded::parse(format!("s={segment}").as_bytes())
                .next()
                .map(|(_, value)| value.into_owned())
                .unwrap_or(segment)
        })
        .filter(|segment| !segment.is_empty())
        .unwrap_or_else(|| "image".to_string())
}

fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() && ext.len() <= 5 => {
            (stem, Some(ext))
        }
        _ => (name, None),
    }
}

fn sanitize(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .map(|c| if is_forbidden(c) { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim_matches(&['_', ' ', '.'][..]);

    let mut compacted = String::with_capacity(cleaned.len());
    let mut prev_underscore = false;
    for c in cleaned.chars() {
        if c == '_' && prev_underscore {
            continue;
        }
        prev_underscore = c == '_';
        compacted.push(c);
    }
    if compacted.is_empty() {
        compacted.push_str("image");
    }
    if compacted.len() > MAX_STEM_LEN {
        let mut cut = MAX_STEM_LEN;
        while !compacted.is_char_boundary(cut) {
            cut -= 1;
        }
        compacted.truncate(cut);
    }
    if is_reserved_windows_name(&compacted) {
        compacted.push('_');
    }
    compacted
}

fn sanitize_extension(ext: &str) -> String {
    ext.chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_ascii_lowercase()
}

fn is_forbidden(c: char) -> bool {
    matches!(c,
        '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\0'..='\u{1F}'
    )
}

fn is_reserved_windows_name(name: &str) -> bool {
    const RESERVED: &[&str] = &[
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
        "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    RESERVED.iter().any(|r| r.eq_ignore_ascii_case(name))
}

fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex = String::with_capacity(8);
    for byte in digest.iter().take(4) {
        use std::fmt::Write;
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}
