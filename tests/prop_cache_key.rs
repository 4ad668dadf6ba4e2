// Property: cache keys are stable under session tokens, collapse hosts to
// their last two labels, and never escape the cache root.

use proptest::prelude::*;
use url_cache_proxy::{parse_target, KeyTransformer, PathKeyTransformer};

fn key_for(url: &str) -> String {
    let url = parse_target(url).expect("generated URL should parse");
    PathKeyTransformer::default()
        .transform(&url)
        .expect("generated URL should have a key")
        .to_string()
}

fn host_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-z][a-z0-9]{0,7}", 2..5)
}

fn path_strategy() -> impl Strategy<Value = Vec<String>> {
    // at most 6 characters, so a segment can never be the literal "session"
    prop::collection::vec("[a-z0-9._-]{0,5}[a-z0-9]", 0..5)
}

fn port_strategy() -> impl Strategy<Value = Option<u16>> {
    prop::option::of(1u16..=65535)
}

fn build_url(labels: &[String], port: Option<u16>, segments: &[String]) -> String {
    let host = labels.join(".");
    let authority = match port {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    };
    format!("http://{}/{}", authority, segments.join("/"))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// URLs differing only in a /session/<token> segment share a key.
    #[test]
    fn prop_session_token_does_not_change_key(
        labels in host_strategy(),
        port in port_strategy(),
        segments in path_strategy(),
        token_a in "[A-Za-z0-9]{1,24}",
        token_b in "[A-Za-z0-9]{1,24}",
        position in 0usize..5,
    ) {
        let at = position.min(segments.len());

        let mut with_a = segments.clone();
        with_a.splice(at..at, ["session".to_string(), token_a.clone()]);
        let mut with_b = segments.clone();
        with_b.splice(at..at, ["session".to_string(), token_b.clone()]);

        let plain = key_for(&build_url(&labels, port, &segments));
        let key_a = key_for(&build_url(&labels, port, &with_a));
        let key_b = key_for(&build_url(&labels, port, &with_b));

        prop_assert_eq!(&key_a, &key_b);
        prop_assert_eq!(&key_a, &plain);
    }

    /// Every session pair is removed, not just the first one.
    #[test]
    fn prop_all_session_segments_removed(
        labels in host_strategy(),
        segments in prop::collection::vec("[a-z0-9]{1,6}", 1..5),
        tokens in prop::collection::vec("[A-Za-z0-9]{1,12}", 1..4),
    ) {
        let mut with_sessions = Vec::new();
        for (i, segment) in segments.iter().enumerate() {
            if let Some(token) = tokens.get(i) {
                with_sessions.push("session".to_string());
                with_sessions.push(token.clone());
            }
            with_sessions.push(segment.clone());
        }

        let key = key_for(&build_url(&labels, None, &with_sessions));
        prop_assert_eq!(key, key_for(&build_url(&labels, None, &segments)));
    }

    /// The host key is the last two labels, whatever the port.
    #[test]
    fn prop_host_key_is_last_two_labels(
        labels in host_strategy(),
        port in port_strategy(),
    ) {
        let expected = labels[labels.len() - 2..].join(".");
        let key = key_for(&build_url(&labels, port, &["file.json".to_string()]));
        prop_assert_eq!(key, format!("{}/file.json", expected));
        prop_assert_eq!(PathKeyTransformer::host_key(&labels.join(".")), expected);
    }

    /// No derived key can climb out of the cache root.
    #[test]
    fn prop_key_never_escapes_root(
        labels in host_strategy(),
        segments in prop::collection::vec(
            prop_oneof![
                Just("..".to_string()),
                Just(".".to_string()),
                Just("%2e%2e".to_string()),
                Just("".to_string()),
                "[a-z0-9]{1,6}",
            ],
            0..8,
        ),
    ) {
        let key = key_for(&build_url(&labels, None, &segments));
        prop_assert!(!key.starts_with('/'));
        prop_assert!(!key.split('/').any(|s| s == ".." || s == "."));
        let host_key = labels[labels.len() - 2..].join(".");
        let host_prefix = format!("{}/", host_key);
        prop_assert!(key == host_key || key.starts_with(&host_prefix));
    }
}
