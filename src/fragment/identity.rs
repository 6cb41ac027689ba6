//! Stable media identity.
//!
//! Re-ingestion of the same media — reposted attachments, re-fetched
//! history — must land on the same identity so persisted rows stay
//! idempotent. Priority order, first match wins: platform-native asset id,
//! known-CDN path, normalized-URL hash, text keyed by provenance, and a
//! provenance hash as the absolute fallback.

use crate::fragment::Fragment;
use crate::message::Provenance;
use sha2::{Digest, Sha256};
use url::Url;

/// Hosts whose paths already identify the asset; query strings there carry
/// expiring signatures and must not participate in identity.
const CDN_HOSTS: [&str; 2] = ["cdn.discordapp.com", "media.discordapp.net"];

/// Deterministic identity for a fragment.
pub fn stable_media_id(fragment: &Fragment, provenance: &Provenance, source_idx: usize) -> String {
    if let Fragment::Youtube { video_id, url, .. } = fragment {
        let native = video_id
            .clone()
            .filter(|v| !v.is_empty())
            .or_else(|| youtube_video_id(url));
        if let Some(v) = native {
            return format!("yt:{v}");
        }
    }

    if let Some(raw) = fragment.url() {
        if let Ok(url) = Url::parse(raw) {
            if let Some(path) = cdn_path(&url) {
                return format!("cdn:{path}");
            }
            return format!("url:{}", sha256_hex(&normalize_url(&url)));
        }
    }

    if matches!(fragment, Fragment::Text { .. }) {
        return format!(
            "{}:{source_idx}:{}",
            provenance.message_id,
            fragment.kind()
        );
    }

    let blob = format!(
        "{}:{}:{}:{}:{source_idx}:{}",
        provenance.server_id,
        provenance.channel_id,
        provenance.message_id,
        provenance.author_id,
        fragment.kind()
    );
    format!("prov:{}", sha256_hex(&blob))
}

/// Extract the video id from the URL shapes YouTube hands out:
/// `watch?v=`, `youtu.be/`, `/shorts/`, `/embed/`.
pub fn youtube_video_id(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);

    let id = match host {
        "youtu.be" => url.path_segments()?.next().map(str::to_string),
        "youtube.com" | "m.youtube.com" | "music.youtube.com" => {
            let mut segments = url.path_segments()?;
            match segments.next() {
                Some("watch") => url
                    .query_pairs()
                    .find(|(k, _)| k == "v")
                    .map(|(_, v)| v.into_owned()),
                Some("shorts") | Some("embed") => segments.next().map(str::to_string),
                _ => None,
            }
        }
        _ => None,
    };

    id.filter(|v| !v.is_empty())
}

fn cdn_path(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    if !CDN_HOSTS.contains(&host.as_str()) {
        return None;
    }
    Some(format!("{host}{}", collapse_slashes(url.path())))
}

/// Canonical form for hashing: scheme and host lowercased, duplicate path
/// slashes collapsed, query pairs sorted, fragment dropped.
fn normalize_url(url: &Url) -> String {
    let scheme = url.scheme().to_ascii_lowercase();
    let host = url.host_str().unwrap_or("").to_ascii_lowercase();
    let path = collapse_slashes(url.path());

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    let mut out = format!("{scheme}://{host}{path}");
    if !pairs.is_empty() {
        out.push('?');
        for (i, (k, v)) in pairs.iter().enumerate() {
            if i > 0 {
                out.push('&');
            }
            out.push_str(k);
            out.push('=');
            out.push_str(v);
        }
    }
    out
}

fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(c);
    }
    out
}

fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)
}
