//! Application name normalization and remote reference validation

use crate::error::{HostError, HostResult};
use url::Url;

/// Longest canonical application name
pub const MAX_NAME_LEN: usize = 50;

/// Canonicalize a human-chosen application name.
///
/// Lower-cases, maps every character outside `[a-z0-9-]` to `-`, collapses
/// runs of `-`, trims `-` from both ends and truncates to [`MAX_NAME_LEN`].
/// The result may be empty; use [`validate_app_name`] when that matters.
pub fn normalize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars().flat_map(char::to_lowercase) {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }

    let trimmed = out.trim_matches('-');
    let truncated = if trimmed.len() > MAX_NAME_LEN {
        // ASCII only at this point
        &trimmed[..MAX_NAME_LEN]
    } else {
        trimmed
    };
    truncated.trim_end_matches('-').to_string()
}

/// Normalize and reject names that collapse to nothing
pub fn validate_app_name(raw: &str) -> HostResult<String> {
    let name = normalize(raw);
    if name.is_empty() {
        return Err(HostError::invalid(format!(
            "invalid application name \"{}\": must contain at least one letter or digit",
            raw.trim()
        )));
    }
    Ok(name)
}

/// Check that a remote source reference has the `https://<host>/<owner>/<repo>[/]` shape
pub fn validate_remote_ref(reference: &str) -> HostResult<Url> {
    let reference = reference.trim();
    let bad = |why: &str| {
        HostError::invalid(format!(
            "invalid repository URL \"{}\": {}; expected https://<host>/<owner>/<repo>",
            reference, why
        ))
    };

    let url = Url::parse(reference).map_err(|e| bad(&e.to_string()))?;

    if url.scheme() != "https" {
        return Err(bad("only https is supported"));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(bad("missing host"));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(bad("credentials are not allowed"));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(bad("query strings and fragments are not allowed"));
    }

    let mut segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.collect())
        .unwrap_or_default();
    // Allow a single trailing slash
    if segments.last() == Some(&"") {
        segments.pop();
    }

    match segments.as_slice() {
        [owner, repo] if is_owner(owner) && is_repo(repo) => Ok(url),
        [_, _] => Err(bad("owner or repository contains invalid characters")),
        _ => Err(bad("path must be exactly /<owner>/<repo>")),
    }
}

fn is_owner(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_repo(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}
