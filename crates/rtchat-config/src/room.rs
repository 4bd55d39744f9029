// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Room derivation.
//!
//! Peers meet on a broker topic `base + separator + room`. When no room is
//! configured, one is derived from the host environment so that instances
//! started in the same place find each other without coordination.

/// Reduce a location path to a topic-safe room fragment.
///
/// The query string, the application's own `rtchat` mount fragment, and
/// `index.html`/`.html` suffixes are dropped; everything that is not
/// alphanumeric is stripped.
pub fn sanitize_path(path: &str) -> String {
    let path = path.split('?').next().unwrap_or_default();
    let path = path.replace("rtchat", "");
    let path = path.strip_suffix("index.html").unwrap_or(&path);
    let path = path.strip_suffix(".html").unwrap_or(path);
    path.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

/// Derive the room from a host name and location path.
///
/// Away from localhost the host name prefixes the sanitized path, so two
/// deployments of the same page on different hosts land in different rooms.
/// Locally the sanitized path alone is used, with `default` as the fallback.
pub fn derive_room(host: &str, path: &str) -> String {
    let fragment = sanitize_path(path);
    let local = host.is_empty() || host == "localhost" || host == "127.0.0.1" || host == "::1";
    if !local {
        return format!("{host}{fragment}");
    }
    if fragment.is_empty() {
        "default".into()
    } else {
        fragment
    }
}

/// Room for this machine when the configuration names none.
pub fn default_room() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    derive_room(&host, "")
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_drops_query_and_html() {
        assert_eq!(sanitize_path("/rtchat/?session=1"), "");
        assert_eq!(sanitize_path("/lobby/index.html"), "lobby");
        assert_eq!(sanitize_path("/team/red.html"), "teamred");
        assert_eq!(sanitize_path("/a-b_c/"), "abc");
    }

    #[test]
    fn derive_room_prefixes_remote_host() {
        assert_eq!(derive_room("example.com", "/lobby/"), "example.comlobby");
        assert_eq!(derive_room("example.com", ""), "example.com");
    }

    #[test]
    fn derive_room_falls_back_to_default_locally() {
        assert_eq!(derive_room("localhost", ""), "default");
        assert_eq!(derive_room("127.0.0.1", "/?x=1"), "default");
        assert_eq!(derive_room("localhost", "/lobby"), "lobby");
        assert_eq!(derive_room("", ""), "default");
    }
}
