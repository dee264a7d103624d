//! Canonicalization helpers for URLs, domains and contact values.
//!
//! Everything that ends up in a dedupe key or a unique index funnels
//! through here so that the same logical entity always hashes to the
//! same row, no matter which ingest path discovered it.

use regex::Regex;
use sha1::{Digest, Sha1};
use std::sync::LazyLock;
use url::Url;

static SCHEME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*://").unwrap());

static MULTI_SLASH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/{2,}").unwrap());

static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

// Close enough to RFC 5321 for outbound validation purposes; the SMTP
// server on the other end has the final say anyway.
static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^[A-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Z0-9](?:[A-Z0-9-]{0,61}[A-Z0-9])?(?:\.[A-Z0-9](?:[A-Z0-9-]{0,61}[A-Z0-9])?)+$",
    )
    .unwrap()
});

const EMAIL_STRIP_CHARS: &[char] = &['<', '>', '[', ']', '(', ')', '"', '\'', ' ', '\t', '\r', '\n'];

/// Bring a URL into canonical form: lowercased scheme and host, no
/// `www.` prefix, no default port, no fragment, repeated slashes
/// collapsed, trailing slash only when the path is empty.
/// Returns an empty string when the input cannot be interpreted
/// as a URL at all.
pub fn normalize_url(raw: &str) -> String {
    let value = raw.trim();
    if value.is_empty() {
        return String::new();
    }

    let with_scheme;
    let candidate = if SCHEME_RE.is_match(value) {
        value
    } else {
        with_scheme = format!("https://{value}");
        &with_scheme
    };

    let parsed = match Url::parse(candidate) {
        Ok(url) => url,
        Err(_) => return String::new(),
    };

    let Some(host) = parsed.host_str() else {
        return String::new();
    };

    let host = host.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    if host.is_empty() {
        return String::new();
    }

    // `Url::port` is None when the port is the default for the scheme
    let authority = match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    };

    let path = MULTI_SLASH_RE.replace_all(parsed.path(), "/");
    let path = path.trim_end_matches('/');
    let path = if path.is_empty() { "/" } else { path };

    let mut normalized = format!("{}://{authority}{path}", parsed.scheme());
    if let Some(query) = parsed.query() {
        if !query.is_empty() {
            normalized.push('?');
            normalized.push_str(query);
        }
    }
    normalized
}

/// Extract and normalize the domain portion of a URL or bare hostname:
/// lowercased, `www.` stripped, non-ASCII labels punycode encoded.
/// A port survives only when it is not the default for the scheme.
pub fn normalize_domain(value: &str) -> String {
    let candidate = value.trim();
    if candidate.is_empty() {
        return String::new();
    }

    let mut domain = if candidate.contains('/') || SCHEME_RE.is_match(candidate) {
        let normalized = normalize_url(candidate);
        match Url::parse(&normalized) {
            Ok(url) => {
                let host = url.host_str().unwrap_or("").to_string();
                match url.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host,
                }
            }
            Err(_) => return String::new(),
        }
    } else {
        candidate.to_string()
    };

    domain = domain.to_lowercase();
    if let Some(stripped) = domain.strip_prefix("www.") {
        domain = stripped.to_string();
    }

    let (host, port) = match domain.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => (host.to_string(), Some(port.to_string())),
        _ => (domain.clone(), None),
    };

    let encoded = idna::domain_to_ascii(&host).unwrap_or(host);

    match port {
        Some(port) => format!("{encoded}:{port}"),
        None => encoded,
    }
}

/// Deterministic clustering key for a company: SHA-1 of the canonical
/// domain when one is known, otherwise of the lowercased trimmed name.
/// Two rows sharing a domain therefore always share a key, regardless
/// of how their names were spelled in the SERP.
pub fn build_company_dedupe_key(name: &str, domain: &str) -> String {
    let canonical_domain = normalize_domain(domain);
    let payload = if canonical_domain.is_empty() {
        name.trim().to_lowercase()
    } else {
        canonical_domain
    };

    let mut hasher = Sha1::new();
    hasher.update(payload.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Collapse whitespace runs in a snippet down to single spaces.
pub fn clean_snippet(text: &str) -> String {
    WHITESPACE_RE.replace_all(text, " ").trim().to_string()
}

/// Normalize an email address scraped from a page or a sheet cell:
/// drops a `mailto:` prefix, a `?subject=...` tail, angle brackets and
/// display names, stray whitespace and zero-width characters, then
/// lowercases the rest.
pub fn clean_email(value: &str) -> String {
    let raw = value.trim();
    if raw.is_empty() {
        return String::new();
    }

    let mut candidate = raw.to_string();
    if candidate.to_lowercase().starts_with("mailto:") {
        candidate = candidate.splitn(2, ':').nth(1).unwrap_or("").to_string();
    }
    if let Some((head, _)) = candidate.split_once('?') {
        candidate = head.to_string();
    }

    // display-name form: `Some Body <some@body.example>`
    if let (Some(open), Some(close)) = (candidate.find('<'), candidate.rfind('>')) {
        if open < close {
            candidate = candidate[open + 1..close].to_string();
        }
    }

    candidate
        .trim_matches(EMAIL_STRIP_CHARS)
        .replace(' ', "")
        .replace('\u{200b}', "")
        .to_lowercase()
}

/// Validate a (possibly raw) email address after cleaning it.
pub fn is_valid_email(value: &str) -> bool {
    let candidate = clean_email(value);
    if candidate.is_empty() || !candidate.contains('@') {
        return false;
    }
    EMAIL_RE.is_match(&candidate)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn url_adds_scheme_and_trims_path() {
        k9::assert_equal!(normalize_url("example.com"), "https://example.com/");
        k9::assert_equal!(normalize_url("HTTP://WWW.test.ru/path//"), "http://test.ru/path");
    }

    #[test]
    fn url_is_idempotent() {
        for input in [
            "example.com",
            "HTTP://WWW.test.ru/path//",
            "https://shop.example.com:8443/a//b/?q=1#frag",
            "",
        ] {
            let once = normalize_url(input);
            assert_eq!(normalize_url(&once), once, "for input {input:?}");
        }
    }

    #[test]
    fn url_preserves_query_drops_fragment() {
        assert_eq!(
            normalize_url("https://example.com/page?utm=1#section"),
            "https://example.com/page?utm=1"
        );
    }

    #[test]
    fn url_keeps_non_default_port() {
        assert_eq!(normalize_url("https://example.com:8443/x"), "https://example.com:8443/x");
        assert_eq!(normalize_url("https://example.com:443/x"), "https://example.com/x");
    }

    #[test]
    fn empty_url_is_empty() {
        assert_eq!(normalize_url(""), "");
        assert_eq!(normalize_url("   "), "");
    }

    #[test]
    fn domain_handles_punycode() {
        k9::assert_equal!(normalize_domain("https://WWW.Example.com/ru"), "example.com");
        k9::assert_equal!(normalize_domain("тест.рф"), "xn--e1aybc.xn--p1ai");
    }

    #[test]
    fn domain_strips_www_and_lowers() {
        assert_eq!(normalize_domain("WWW.Shop.Example.COM"), "shop.example.com");
    }

    #[test]
    fn dedupe_key_ignores_name_when_domain_known() {
        let key1 = build_company_dedupe_key("Test", "example.com");
        let key2 = build_company_dedupe_key("Другое имя", "example.com");
        assert_eq!(key1, key2);
    }

    #[test]
    fn dedupe_key_falls_back_to_name() {
        let key1 = build_company_dedupe_key("  Acme Widgets ", "");
        let key2 = build_company_dedupe_key("acme widgets", "");
        assert_eq!(key1, key2);
        assert_ne!(key1, build_company_dedupe_key("other co", ""));
    }

    #[test]
    fn snippet_compacts_whitespace() {
        assert_eq!(clean_snippet("  Привет\nмир  "), "Привет мир");
    }

    #[test]
    fn email_cleaning() {
        assert_eq!(clean_email("mailto:Sales@Example.com?subject=hi"), "sales@example.com");
        assert_eq!(clean_email("Ivan Petrov <ivan@example.ru>"), "ivan@example.ru");
        assert_eq!(clean_email(" <info@example.com> "), "info@example.com");
        assert_eq!(clean_email(""), "");
    }

    #[test]
    fn email_validation() {
        assert!(is_valid_email("lead@yandex.ru"));
        assert!(is_valid_email("mailto:Lead@Yandex.ru"));
        assert!(!is_valid_email(""));
        assert!(!is_valid_email("not-an-email"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("user@"));
    }
}
