//! Privacy screen for free-text telemetry fields.
//!
//! Runs on every string field before normalization. A hit rejects the whole
//! sample. The error names the field and the kind of pattern that matched,
//! never the content.

use std::fmt;
use std::net::Ipv6Addr;

const MEDIA_EXTENSIONS: &[&str] = &[
    ".mp4", ".mkv", ".mov", ".webm", ".avi", ".ts", ".m4v", ".y4m",
];
const MIN_HEX_RUN: usize = 16;
const MIN_DECIMAL_RUN: usize = 8;
/// Eight four-digit groups and seven colons. Dotted IPv4 tails are left to
/// `contains_ipv4`.
const MAX_IPV6_LEN: usize = 39;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternKind {
    Path,
    DriveLetter,
    IpAddress,
    Email,
    Uuid,
    MacAddress,
    OpaqueToken,
    MediaFileName,
}

impl PatternKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::DriveLetter => "drive_letter",
            Self::IpAddress => "ip_address",
            Self::Email => "email",
            Self::Uuid => "uuid",
            Self::MacAddress => "mac_address",
            Self::OpaqueToken => "opaque_token",
            Self::MediaFileName => "media_file_name",
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("field {field} matched {kind} pattern")]
pub struct PrivacyViolation {
    pub field: &'static str,
    pub kind: PatternKind,
}

/// Screen one field value.
pub fn screen(field: &'static str, value: &str) -> Result<(), PrivacyViolation> {
    match detect(value) {
        Some(kind) => Err(PrivacyViolation { field, kind }),
        None => Ok(()),
    }
}

/// First identifying pattern found in `value`, if any.
pub fn detect(value: &str) -> Option<PatternKind> {
    if value.contains('/') || value.contains('\\') {
        return Some(PatternKind::Path);
    }
    if value.contains('@') {
        return Some(PatternKind::Email);
    }
    let bytes = value.as_bytes();
    if contains_uuid(bytes) {
        return Some(PatternKind::Uuid);
    }
    if contains_mac(bytes) {
        return Some(PatternKind::MacAddress);
    }
    if contains_opaque_run(bytes) {
        return Some(PatternKind::OpaqueToken);
    }
    if contains_ipv4(value) || contains_ipv6(bytes) {
        return Some(PatternKind::IpAddress);
    }
    for token in value.split_whitespace() {
        let token = token.trim_matches(|c: char| matches!(c, ',' | ';' | '(' | ')' | '"' | '\''));
        if token.is_empty() {
            continue;
        }
        if has_drive_prefix(token) {
            return Some(PatternKind::DriveLetter);
        }
        if has_media_extension(token) {
            return Some(PatternKind::MediaFileName);
        }
    }
    None
}

fn has_drive_prefix(token: &str) -> bool {
    let b = token.as_bytes();
    b.len() >= 2 && b[0].is_ascii_alphabetic() && b[1] == b':'
}

/// Four dot-separated octets anywhere in the input, whatever surrounds
/// them (`ip=10.0.0.1`, `nvenc-192.168.1.20`).
fn contains_ipv4(value: &str) -> bool {
    value
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .any(|run| {
            let parts: Vec<&str> = run.split('.').collect();
            parts.windows(4).any(|w| w.iter().all(|p| is_octet(p)))
        })
}

fn is_octet(part: &str) -> bool {
    (1..=3).contains(&part.len())
        && part.bytes().all(|b| b.is_ascii_digit())
        && part.parse::<u8>().is_ok()
}

/// Any substring of a hex/colon run that parses as an IPv6 address with at
/// least two colons. A `%zone` suffix ends the run, so it never shields the
/// address in front of it.
fn contains_ipv6(b: &[u8]) -> bool {
    let is_run = |c: &u8| c.is_ascii_hexdigit() || *c == b':';
    let mut start = 0;
    while start < b.len() {
        if !is_run(&b[start]) {
            start += 1;
            continue;
        }
        let end = b[start..]
            .iter()
            .position(|c| !is_run(c))
            .map_or(b.len(), |n| start + n);
        if ipv6_within(&b[start..end]) {
            return true;
        }
        start = end;
    }
    false
}

fn ipv6_within(run: &[u8]) -> bool {
    if run.iter().filter(|c| **c == b':').count() < 2 {
        return false;
    }
    (0..run.len()).any(|from| {
        let longest = run.len().min(from + MAX_IPV6_LEN);
        (from + 2..=longest).rev().any(|to| {
            let candidate = &run[from..to];
            candidate.iter().filter(|c| **c == b':').count() >= 2
                && std::str::from_utf8(candidate)
                    .ok()
                    .and_then(|s| s.parse::<Ipv6Addr>().ok())
                    .is_some()
        })
    })
}

fn has_media_extension(token: &str) -> bool {
    let lowered = token.to_ascii_lowercase();
    MEDIA_EXTENSIONS
        .iter()
        .any(|ext| lowered.len() > ext.len() && lowered.ends_with(ext))
}

/// 8-4-4-4-12 hex groups anywhere in the input.
fn contains_uuid(b: &[u8]) -> bool {
    const GROUPS: [usize; 5] = [8, 4, 4, 4, 12];
    const LEN: usize = 36;
    if b.len() < LEN {
        return false;
    }
    (0..=b.len() - LEN).any(|start| {
        let mut i = start;
        for (n, group) in GROUPS.iter().enumerate() {
            if !b[i..i + group].iter().all(u8::is_ascii_hexdigit) {
                return false;
            }
            i += group;
            if n < GROUPS.len() - 1 {
                if b[i] != b'-' {
                    return false;
                }
                i += 1;
            }
        }
        true
    })
}

/// Six hex pairs joined by a consistent `:` or `-`.
fn contains_mac(b: &[u8]) -> bool {
    const LEN: usize = 17;
    if b.len() < LEN {
        return false;
    }
    (0..=b.len() - LEN).any(|start| {
        let w = &b[start..start + LEN];
        let sep = w[2];
        if sep != b':' && sep != b'-' {
            return false;
        }
        (0..6).all(|pair| {
            let at = pair * 3;
            w[at].is_ascii_hexdigit()
                && w[at + 1].is_ascii_hexdigit()
                && (pair == 5 || w[at + 2] == sep)
        })
    })
}

fn contains_opaque_run(b: &[u8]) -> bool {
    let mut hex_run = 0usize;
    let mut dec_run = 0usize;
    for &c in b {
        hex_run = if c.is_ascii_hexdigit() { hex_run + 1 } else { 0 };
        dec_run = if c.is_ascii_digit() { dec_run + 1 } else { 0 };
        if hex_run >= MIN_HEX_RUN || dec_run >= MIN_DECIMAL_RUN {
            return true;
        }
    }
    false
}
