//! Relay URL normalization.
//!
//! Every relay is keyed by its normalized URL, so `wss://Relay.Example/` and
//! `relay.example` end up sharing one connection.

/// Normalize a relay URL, returning `None` for anything that is not a
/// websocket endpoint.
pub fn normalize_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let (scheme, rest) = match raw.split_once("://") {
        Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
        None => ("wss".to_string(), raw),
    };
    let scheme = match scheme.as_str() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        _ => return None,
    };

    let (host, path) = match rest.find(['/', '?', '#']) {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };
    if host.is_empty() || host.contains(char::is_whitespace) {
        return None;
    }
    let host = host.to_ascii_lowercase();

    let path = path.trim_end_matches('/');
    Some(format!("{scheme}://{host}{path}"))
}

/// Normalize a list, dropping invalid entries and duplicates while keeping order.
pub fn normalize_all<I, S>(urls: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for url in urls {
        if let Some(url) = normalize_url(url.as_ref()) {
            if !out.contains(&url) {
                out.push(url);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adds_scheme_and_lowercases_host() {
        assert_eq!(
            normalize_url("Relay.Damus.IO").as_deref(),
            Some("wss://relay.damus.io")
        );
        assert_eq!(
            normalize_url("WSS://nos.lol/").as_deref(),
            Some("wss://nos.lol")
        );
    }

    #[test]
    fn maps_http_schemes() {
        assert_eq!(
            normalize_url("https://relay.example.com/nostr/").as_deref(),
            Some("wss://relay.example.com/nostr")
        );
        assert_eq!(
            normalize_url("http://127.0.0.1:7777").as_deref(),
            Some("ws://127.0.0.1:7777")
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(normalize_url(""), None);
        assert_eq!(normalize_url("ftp://relay.example.com"), None);
        assert_eq!(normalize_url("wss://"), None);
    }

    #[test]
    fn normalize_all_dedups() {
        let urls = normalize_all(["wss://nos.lol", "nos.lol/", "bad://x", "relay.damus.io"]);
        assert_eq!(urls, vec!["wss://nos.lol", "wss://relay.damus.io"]);
    }
}
