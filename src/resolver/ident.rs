//! Canonical identity for incoming references.
//!
//! Batch input mixes watch-page URLs, short links, bare video ids, and feed
//! item guids. Everything is reduced to a single canonical id so duplicate
//! detection can compare apples to apples.

use thiserror::Error;
use url::Url;

use crate::models::{AcquisitionTarget, TargetKind};

#[derive(Debug, Error)]
pub enum IdentError {
    #[error("unparseable reference '{reference}': {message}")]
    Malformed { reference: String, message: String },
}

/// Hosts that serve the watch-page form with a `v` query parameter.
const WATCH_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
];

/// Reduces a raw reference to an [`AcquisitionTarget`] with a canonical id.
///
/// Video URLs collapse to `yt:<video-id>` regardless of host variant or
/// extra query parameters. Other http(s) URLs normalize to `url:<trimmed>`.
/// Non-URL references are treated as feed item guids and keyed `guid:<raw>`.
pub fn canonicalize(raw: &str) -> Result<AcquisitionTarget, IdentError> {
    let trimmed = raw.trim();

    if trimmed.is_empty() {
        return Err(IdentError::Malformed {
            reference: raw.to_string(),
            message: "empty reference".to_string(),
        });
    }

    if !trimmed.contains("://") {
        // Bare video ids still canonicalize as videos; anything else is an
        // opaque feed item guid.
        if is_plain_video_id(trimmed) {
            return Ok(AcquisitionTarget::new(
                raw,
                format!("yt:{trimmed}"),
                TargetKind::Video,
            ));
        }
        return Ok(AcquisitionTarget::new(
            raw,
            format!("guid:{trimmed}"),
            TargetKind::FeedEpisode,
        ));
    }

    let url = Url::parse(trimmed).map_err(|e| IdentError::Malformed {
        reference: raw.to_string(),
        message: e.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(IdentError::Malformed {
                reference: raw.to_string(),
                message: format!("unsupported scheme '{other}'"),
            });
        }
    }

    let host = url.host_str().unwrap_or_default().to_lowercase();

    if let Some(video_id) = extract_video_id(&url, &host) {
        return Ok(AcquisitionTarget::new(
            raw,
            format!("yt:{video_id}"),
            TargetKind::Video,
        ));
    }

    // Some other platform URL: strip fragment and trailing slash so trivial
    // variants of the same page collide.
    let mut normalized = url;
    normalized.set_fragment(None);
    let mut text = normalized.to_string();
    while text.ends_with('/') {
        text.pop();
    }
    Ok(AcquisitionTarget::new(
        raw,
        format!("url:{text}"),
        TargetKind::Video,
    ))
}

fn extract_video_id(url: &Url, host: &str) -> Option<String> {
    if WATCH_HOSTS.contains(&host) {
        let path = url.path();
        if path == "/watch" {
            return url
                .query_pairs()
                .find(|(k, _)| k == "v")
                .map(|(_, v)| v.into_owned());
        }
        for prefix in ["/shorts/", "/live/", "/embed/", "/v/"] {
            if let Some(rest) = path.strip_prefix(prefix) {
                let id = rest.split('/').next().unwrap_or_default();
                if !id.is_empty() {
                    return Some(id.to_string());
                }
            }
        }
        return None;
    }

    if host == "youtu.be" {
        let id = url.path().trim_start_matches('/');
        let id = id.split('/').next().unwrap_or_default();
        if !id.is_empty() {
            return Some(id.to_string());
        }
    }

    None
}

fn is_plain_video_id(s: &str) -> bool {
    s.len() == 11
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_url_variants_share_one_canonical_id() {
        let refs = [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtube.com/watch?v=dQw4w9WgXcQ&t=42s",
            "https://youtu.be/dQw4w9WgXcQ",
            "https://m.youtube.com/watch?v=dQw4w9WgXcQ",
            "dQw4w9WgXcQ",
        ];
        for r in refs {
            let t = canonicalize(r).unwrap();
            assert_eq!(t.canonical_id, "yt:dQw4w9WgXcQ", "from {r}");
            assert_eq!(t.kind, TargetKind::Video);
        }
    }

    #[test]
    fn shorts_and_live_paths_resolve() {
        let t = canonicalize("https://www.youtube.com/shorts/abc123XYZ_-").unwrap();
        assert_eq!(t.canonical_id, "yt:abc123XYZ_-");
        let t = canonicalize("https://www.youtube.com/live/abc123XYZ_-").unwrap();
        assert_eq!(t.canonical_id, "yt:abc123XYZ_-");
    }

    #[test]
    fn other_urls_normalize_with_url_prefix() {
        let t = canonicalize("https://example.com/episodes/42/#frag").unwrap();
        assert_eq!(t.canonical_id, "url:https://example.com/episodes/42");
        assert_eq!(t.kind, TargetKind::Video);
    }

    #[test]
    fn opaque_reference_is_a_feed_guid() {
        let t = canonicalize("tag:feed.example.org,2026:ep-101").unwrap();
        assert_eq!(t.canonical_id, "guid:tag:feed.example.org,2026:ep-101");
        assert_eq!(t.kind, TargetKind::FeedEpisode);
    }

    #[test]
    fn malformed_url_is_rejected() {
        assert!(canonicalize("https://").is_err());
        assert!(canonicalize("ftp://example.com/a").is_err());
        assert!(canonicalize("   ").is_err());
    }
}
