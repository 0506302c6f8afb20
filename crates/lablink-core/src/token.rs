//! Bearer token extraction.
//!
//! Tokens are opaque strings. The HTTP API reads them from the
//! `Authorization` header; the WebSocket attach may also carry them in the
//! `token` query parameter because browsers cannot set headers on upgrades.

/// Extract the token from an `Authorization` header value.
///
/// Both `Bearer <token>` and a bare token are accepted. Empty values yield `None`.
pub fn bearer_from_header(value: &str) -> Option<&str> {
    let value = value.trim_start();
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .unwrap_or(value)
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Tokens an `Authorization` header value may carry, most literal first.
///
/// The raw value comes first so that a token which itself starts with
/// `Bearer ` or has surrounding spaces still matches byte for byte. The
/// scheme-stripped form follows only when it differs.
pub fn header_candidates<'a>(value: &'a str) -> impl Iterator<Item = &'a str> {
    let stripped = bearer_from_header(value).filter(|token| *token != value);
    std::iter::once(value)
        .filter(|raw| !raw.is_empty())
        .chain(stripped)
}

/// Extract the `token` parameter from a raw (still percent-encoded) query string.
pub fn bearer_from_query(query: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_with_and_without_scheme() {
        assert_eq!(bearer_from_header("Bearer abc"), Some("abc"));
        assert_eq!(bearer_from_header("bearer abc"), Some("abc"));
        assert_eq!(bearer_from_header("abc"), Some("abc"));
        assert_eq!(bearer_from_header("  "), None);
        assert_eq!(bearer_from_header("Bearer "), None);
    }

    #[test]
    fn raw_header_is_tried_first() {
        fn all(value: &str) -> Vec<&str> {
            header_candidates(value).collect()
        }
        assert_eq!(all("Bearer abc"), vec!["Bearer abc", "abc"]);
        assert_eq!(all(" padded "), vec![" padded ", "padded"]);
        assert_eq!(all("abc"), vec!["abc"]);
        assert!(all("").is_empty());
        assert_eq!(all("  "), vec!["  "]);
    }

    #[test]
    fn query_token_is_decoded() {
        assert_eq!(bearer_from_query("token=a%2Bb%3D"), Some("a+b=".to_string()));
        assert_eq!(
            bearer_from_query("foo=1&token=xyz&bar=2"),
            Some("xyz".to_string())
        );
        assert_eq!(bearer_from_query("foo=1"), None);
        assert_eq!(bearer_from_query("token="), None);
    }
}
