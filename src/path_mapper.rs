//! URL canonicalization and the URL → directory mapping.
//!
//! A node for `http://www.example.com/issue1/index.html` lives in the
//! directory `<au root>/www.example.com/http/issue1/index.html`: host first,
//! then protocol, then one directory per path segment. Repository-internal
//! files all start with [`ESCAPE_CHAR`], which is escaped wherever it shows up
//! in a URL, so the two can never collide.

use std::path::{Path, PathBuf};

use tracing::trace;
use url::Url;

use crate::error::{RepoError, RepoResult};
use crate::types::{AU_URL, CanonicalUrl};

/// Leading character of every repository sentinel file.
pub const ESCAPE_CHAR: char = '#';

// Stands in for '/' inside an escaped query string.
const ENCODED_SEPARATOR_CHAR: char = 's';

const SPECIAL_SCHEMES: &[&str] = &["http", "https", "ftp", "ws", "wss", "file"];

/// Normalize `url` into the form used as a node key.
///
/// Dot segments are resolved, but a `..` that would climb above the host
/// root is rejected rather than clamped.
pub fn canonicalize(url: &str) -> RepoResult<CanonicalUrl> {
    // the url parser drops these anywhere, so drop them before checking dots
    let url: String = url
        .trim()
        .chars()
        .filter(|c| !matches!(c, '\t' | '\n' | '\r'))
        .collect();
    let url = url.as_str();
    if url.is_empty() {
        return Err(RepoError::MalformedInput("empty url".into()));
    }
    if url
        .get(..AU_URL.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(AU_URL))
    {
        return Ok(CanonicalUrl::au_url());
    }

    let (scheme, prefix, rest) = split_authority(url)?;
    let rest = rest.split_once('#').map_or(rest, |(r, _)| r);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };

    let mut path = normalize_encoding_case(path);
    if is_special(&scheme) && path.contains('\\') {
        path = path.replace('\\', "/");
    }
    if needs_traversal_check(&path) {
        path = remove_dot_segments(&path)?;
    }
    // "a/?q" and "a?q" are the same node
    while path.len() > 1 && path.ends_with('/') {
        path.pop();
    }

    let mut rebuilt = String::with_capacity(url.len());
    rebuilt.push_str(prefix);
    rebuilt.push_str(&path);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        rebuilt.push('?');
        rebuilt.push_str(&normalize_encoding_case(query));
    }

    let mut parsed = Url::parse(&rebuilt)
        .map_err(|e| RepoError::MalformedInput(format!("{url}: {e}")))?;
    if parsed.cannot_be_a_base() {
        return Err(RepoError::MalformedInput(format!("{url}: not hierarchical")));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| RepoError::MalformedInput(format!("{url}: no host")))?;
    if is_dot_host(host) {
        return Err(RepoError::MalformedInput(format!("{url}: illegal host")));
    }
    if host.chars().any(|c| c.is_ascii_uppercase()) {
        let lower = host.to_ascii_lowercase();
        parsed
            .set_host(Some(&lower))
            .map_err(|e| RepoError::MalformedInput(format!("{url}: {e}")))?;
    }
    parsed.set_fragment(None);

    let mut canonical: String = parsed.into();
    // "dir" and "dir/" are the same node
    if canonical.ends_with('/') {
        canonical.pop();
    }
    trace!(%url, %canonical, "canonicalized");
    Ok(CanonicalUrl::new_unchecked(canonical))
}

/// Splits `scheme://authority` off the front of `url`.
fn split_authority(url: &str) -> RepoResult<(String, &str, &str)> {
    let scheme_end = url
        .find("://")
        .ok_or_else(|| RepoError::MalformedInput(format!("{url}: not a hierarchical url")))?;
    let scheme = &url[..scheme_end];
    let valid_scheme = scheme
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic())
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if !valid_scheme {
        return Err(RepoError::MalformedInput(format!("{url}: bad scheme")));
    }
    let scheme = scheme.to_ascii_lowercase();
    let authority_start = scheme_end + 3;
    let special = is_special(&scheme);
    let authority_end = url[authority_start..]
        .find(|c: char| c == '/' || c == '?' || c == '#' || (special && c == '\\'))
        .map_or(url.len(), |i| authority_start + i);
    Ok((scheme, &url[..authority_end], &url[authority_end..]))
}

/// A host that would map to `.` or `..` as a directory name.
fn is_dot_host(host: &str) -> bool {
    host.is_empty() || is_dot(host) || is_dot_dot(host)
}

fn is_special(scheme: &str) -> bool {
    SPECIAL_SCHEMES.contains(&scheme)
}

fn is_dot(segment: &str) -> bool {
    segment == "." || segment.eq_ignore_ascii_case("%2e")
}

fn is_dot_dot(segment: &str) -> bool {
    let lower = segment.to_ascii_lowercase();
    matches!(lower.as_str(), ".." | ".%2e" | "%2e." | "%2e%2e")
}

/// Only paths with dot or empty segments go through the traversal check.
fn needs_traversal_check(path: &str) -> bool {
    path.contains("//") || path.split('/').any(|seg| is_dot(seg) || is_dot_dot(seg))
}

fn remove_dot_segments(path: &str) -> RepoResult<String> {
    let mut names: Vec<&str> = Vec::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if is_dot(segment) {
            continue;
        }
        if is_dot_dot(segment) {
            if names.pop().is_none() {
                return Err(RepoError::MalformedInput(format!(
                    "illegal dir traversal: {path}"
                )));
            }
            continue;
        }
        names.push(segment);
    }
    let mut normalized = String::with_capacity(path.len());
    normalized.push('/');
    normalized.push_str(&names.join("/"));
    if path.ends_with('/') && !names.is_empty() {
        normalized.push('/');
    }
    Ok(normalized)
}

/// Upper-cases the hex digits of percent escapes (`%2f` → `%2F`).
fn normalize_encoding_case(s: &str) -> String {
    if !s.contains('%') {
        return s.to_string();
    }
    let mut bytes = s.as_bytes().to_vec();
    let mut i = 0;
    while i + 2 < bytes.len() {
        if bytes[i] == b'%' && bytes[i + 1].is_ascii_hexdigit() && bytes[i + 2].is_ascii_hexdigit() {
            bytes[i + 1] = bytes[i + 1].to_ascii_uppercase();
            bytes[i + 2] = bytes[i + 2].to_ascii_uppercase();
            i += 3;
        } else {
            i += 1;
        }
    }
    // only ASCII bytes were touched
    String::from_utf8(bytes).unwrap_or_else(|_| s.to_string())
}

fn escape_segment(segment: &str) -> String {
    segment.replace(ESCAPE_CHAR, "##")
}

fn escape_query(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len());
    for c in query.chars() {
        match c {
            ESCAPE_CHAR => escaped.push_str("##"),
            '/' => {
                escaped.push(ESCAPE_CHAR);
                escaped.push(ENCODED_SEPARATOR_CHAR);
            }
            c => escaped.push(c),
        }
    }
    escaped
}

/// Inverts the escaping applied by [`map_url_to_location`] to one directory
/// name.
pub fn unescape(name: &str) -> String {
    if !name.contains(ESCAPE_CHAR) {
        return name.to_string();
    }
    let mut out = String::with_capacity(name.len());
    let mut chars = name.chars();
    while let Some(c) = chars.next() {
        if c != ESCAPE_CHAR {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(ENCODED_SEPARATOR_CHAR) => out.push('/'),
            Some(other) => out.push(other),
            None => out.push(ESCAPE_CHAR),
        }
    }
    out
}

/// True for names the repository reserves for its own files.
pub fn is_sentinel_name(name: &str) -> bool {
    name.starts_with(ESCAPE_CHAR) && !name.starts_with("##")
}

/// Map a canonical URL to its node directory below the AU root `root`.
pub fn map_url_to_location(root: &Path, url: &CanonicalUrl) -> RepoResult<PathBuf> {
    if url.is_au_url() {
        return Ok(root.to_path_buf());
    }
    let parsed = Url::parse(url.as_str())
        .map_err(|e| RepoError::MalformedInput(format!("{url}: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| RepoError::MalformedInput(format!("{url}: no host")))?;
    if is_dot_host(host) {
        return Err(RepoError::MalformedInput(format!(
            "{url}: host maps outside the au root"
        )));
    }

    let mut host_dir = host.to_ascii_lowercase();
    if let Some(port) = parsed.port() {
        host_dir.push(':');
        host_dir.push_str(&port.to_string());
    }

    let mut segments = Vec::new();
    for segment in parsed.path().split('/').filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." {
            return Err(RepoError::MalformedInput(format!(
                "{url}: dot segment in canonical url"
            )));
        }
        segments.push(escape_segment(segment));
    }
    if let Some(query) = parsed.query() {
        let query = format!("?{}", escape_query(query));
        match segments.last_mut() {
            Some(last) => last.push_str(&query),
            None => segments.push(query),
        }
    }

    let mut location = root.join(escape_segment(&host_dir));
    location.push(parsed.scheme());
    for segment in segments {
        location.push(segment);
    }
    Ok(location)
}

/// The URL one path segment up, or `None` when the parent is the AU root.
pub fn parent_url(url: &CanonicalUrl) -> Option<CanonicalUrl> {
    if url.is_au_url() {
        return None;
    }
    let parsed = Url::parse(url.as_str()).ok()?;
    let path = parsed.path().trim_end_matches('/');
    let parent_path = match path.rfind('/') {
        Some(idx) => &path[..idx],
        // a bare "?query" child hangs off the host-level node
        None if parsed.query().is_some() => "",
        None => return None,
    };
    let mut parent = parsed.clone();
    parent.set_query(None);
    parent.set_path(parent_path);
    let mut parent: String = parent.into();
    if parent.ends_with('/') {
        parent.pop();
    }
    Some(CanonicalUrl::new_unchecked(parent))
}

/// Rebuilds the URL of the child stored in directory `dir_name`.
pub fn child_url(parent: &CanonicalUrl, dir_name: &str) -> String {
    let child = unescape(dir_name);
    let mut url = String::with_capacity(parent.as_str().len() + child.len() + 1);
    url.push_str(parent.as_str());
    if !parent.as_str().ends_with('/') {
        url.push('/');
    }
    url.push_str(&child);
    url
}

/// The synthetic `protocol://host` URL of an AU root child.
pub fn host_url(host_dir: &str, protocol_dir: &str) -> String {
    format!("{}://{}", unescape(protocol_dir), unescape(host_dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("http://x.org/a/b.html", "http://x.org/a/b.html")]
    #[case("HTTP://X.Org/a/b.html", "http://x.org/a/b.html")]
    #[case("http://x.org/a/b/", "http://x.org/a/b")]
    #[case("http://x.org/", "http://x.org")]
    #[case("http://x.org", "http://x.org")]
    #[case("http://x.org:80/a", "http://x.org/a")]
    #[case("http://x.org:8080/a", "http://x.org:8080/a")]
    #[case("http://x.org/a/./b/../c", "http://x.org/a/c")]
    #[case("http://x.org/a//b", "http://x.org/a/b")]
    #[case("http://x.org/a?q=1&r=2", "http://x.org/a?q=1&r=2")]
    #[case("http://x.org/a?", "http://x.org/a")]
    #[case("http://x.org/a#frag", "http://x.org/a")]
    #[case("http://x.org/a%2fb", "http://x.org/a%2Fb")]
    #[case("  http://x.org/a  ", "http://x.org/a")]
    #[case("lockssau:", "LOCKSSAU:")]
    #[case("http://x.org/a/?q", "http://x.org/a?q")]
    #[case("http://x.org/a//?q", "http://x.org/a?q")]
    fn test_canonicalize(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(canonicalize(input).unwrap().as_str(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("not a url")]
    #[case("mailto:someone@x.org")]
    #[case("http://x.org/..")]
    #[case("http://x.org/a/../../etc/passwd")]
    #[case("http://x.org/%2e%2e/etc")]
    #[case("http://x.org/a\\..\\..\\b")]
    #[case("1ttp://x.org/a")]
    #[case("http://../a")]
    #[case("http://./a")]
    #[case("http://%2e%2e/a")]
    #[case("http://x.org/.\t./.\t./etc")]
    #[case("http://x.org/a/.\r\n./../etc")]
    fn test_canonicalize_rejects(#[case] input: &str) {
        assert!(matches!(
            canonicalize(input),
            Err(RepoError::MalformedInput(_))
        ));
    }

    #[rstest]
    #[case("http://x.org/a/./b/../c/")]
    #[case("HTTP://X.ORG:80/%7euser/x%2fy?A=%2f")]
    #[case("http://x.org/?q")]
    #[case("https://x.org/a b")]
    #[case("ftp://Files.X.org/pub//dir/")]
    fn test_canonicalize_idempotent(#[case] input: &str) {
        let once = canonicalize(input).unwrap();
        let twice = canonicalize(once.as_str()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_map_rejects_dot_hosts() {
        let root = Path::new("/repo/cache/a");
        for raw in ["http://../a", "http://./a", "http://%2e%2e/a"] {
            let url = CanonicalUrl::new_unchecked(raw.to_string());
            assert!(matches!(
                map_url_to_location(root, &url),
                Err(RepoError::MalformedInput(_))
            ));
        }
    }

    #[test]
    fn test_map_url_to_location() {
        let root = Path::new("/repo/");
        let url = canonicalize("http://x.org/a/b.html").unwrap();
        assert_eq!(
            map_url_to_location(root, &url).unwrap(),
            PathBuf::from("/repo/x.org/http/a/b.html")
        );

        let url = canonicalize("http://X.org:8080/a?b=c/d").unwrap();
        assert_eq!(
            map_url_to_location(root, &url).unwrap(),
            PathBuf::from("/repo/x.org:8080/http/a?b=c#sd")
        );

        let url = canonicalize("http://x.org/?q").unwrap();
        assert_eq!(
            map_url_to_location(root, &url).unwrap(),
            PathBuf::from("/repo/x.org/http/?q")
        );

        assert_eq!(
            map_url_to_location(root, &CanonicalUrl::au_url()).unwrap(),
            PathBuf::from("/repo/")
        );
    }

    #[test]
    fn test_escaping_round_trips_through_child_url() {
        let parent = canonicalize("http://x.org/a").unwrap();
        let child = canonicalize("http://x.org/a/b?c=d/e").unwrap();
        let location = map_url_to_location(Path::new("/r"), &child).unwrap();
        let name = location.file_name().unwrap().to_str().unwrap();
        assert!(!is_sentinel_name(name));
        assert_eq!(child_url(&parent, name), child.as_str());
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape("plain"), "plain");
        assert_eq!(unescape("a##b"), "a#b");
        assert_eq!(unescape("q=#s#s"), "q=//");
    }

    #[test]
    fn test_parent_url() {
        let url = canonicalize("http://x.org/a/b/c.html").unwrap();
        let parent = parent_url(&url).unwrap();
        assert_eq!(parent.as_str(), "http://x.org/a/b");
        let parent = parent_url(&parent_url(&parent).unwrap()).unwrap();
        assert_eq!(parent.as_str(), "http://x.org");
        assert!(parent_url(&parent).is_none());

        let url = canonicalize("http://x.org/a?x=/y").unwrap();
        assert_eq!(parent_url(&url).unwrap().as_str(), "http://x.org");
        let url = canonicalize("http://x.org/?q").unwrap();
        assert_eq!(parent_url(&url).unwrap().as_str(), "http://x.org");
    }

    #[test]
    fn test_host_url() {
        assert_eq!(host_url("x.org:8080", "http"), "http://x.org:8080");
    }
}
