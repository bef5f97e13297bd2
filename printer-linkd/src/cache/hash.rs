use std::net::IpAddr;
use serde::Serialize;
use sha2::{Sha256, Digest};
use chrono::{DateTime, Utc};
use shared::types::DnsCacheEntry;

#[derive(Serialize)]
struct HashView<'a> {
    hostname: &'a str,
    addresses: &'a [IpAddr],
    valid_until: &'a DateTime<Utc>,
}

/// Computes a SHA-256 hash of the cache content.
/// Entries are sorted by hostname so map iteration order does not matter.
pub fn compute_hash<'a>(entries: impl IntoIterator<Item = &'a DnsCacheEntry>) -> String {
    let mut views: Vec<HashView<'_>> = entries
        .into_iter()
        .map(|e| HashView {
            hostname: &e.hostname,
            addresses: &e.addresses,
            valid_until: &e.valid_until,
        })
        .collect();
    views.sort_by(|a, b| a.hostname.cmp(b.hostname));

    let mut hasher = Sha256::new();
    for view in &views {
        // HashView only holds strings, addresses and timestamps
        if let Ok(json) = serde_json::to_vec(view) {
            hasher.update(&json);
        }
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
