//! Link discovery and URL normalization.

use indexmap::IndexSet;
use regex::Regex;
use url::Url;

/// Canonical form of a crawlable URL, or `None` if it is not http(s).
///
/// Drops the fragment and trailing slashes; the query is kept because
/// paginated catalogue pages differ only by query.
pub fn normalize_url(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    normalize(&url)
}

fn normalize(url: &Url) -> Option<String> {
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    let mut normalized = url.clone();
    normalized.set_fragment(None);

    let mut path = normalized.path().to_owned();
    while path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    normalized.set_path(&path);

    let mut out = normalized.to_string();
    // Url always renders the root path as "/"
    if normalized.path() == "/" && normalized.query().is_none() {
        out.pop();
    }
    Some(out)
}

/// Resolve a link target against the page it appears on.
pub fn resolve_link(base: &Url, target: &str) -> Option<String> {
    let target = target.trim_matches(|c: char| c.is_whitespace() || "\"'<>()".contains(c));
    if target.is_empty() {
        return None;
    }
    base.join(target).ok().as_ref().and_then(normalize)
}

/// Raw regex matches in `content`, in order of appearance.
pub fn raw_matches<'a>(content: &'a str, regexp: &Regex) -> Vec<&'a str> {
    regexp.find_iter(content).map(|m| m.as_str()).collect()
}

/// Links matched by `regexp`, resolved against `page_url`, normalized and
/// deduplicated in order of appearance.
pub fn extract_links(content: &str, page_url: &str, regexp: &Regex) -> Vec<String> {
    let Ok(base) = Url::parse(page_url) else {
        return Vec::new();
    };
    let links: IndexSet<String> = raw_matches(content, regexp)
        .into_iter()
        .filter_map(|target| resolve_link(&base, target))
        .collect();
    links.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_drops_fragment_and_trailing_slash() {
        assert_eq!(
            normalize_url("https://A.edu/courses/#top").as_deref(),
            Some("https://a.edu/courses")
        );
        assert_eq!(normalize_url("https://a.edu/").as_deref(), Some("https://a.edu"));
    }

    #[test]
    fn test_normalize_keeps_query() {
        assert_eq!(
            normalize_url("https://a.edu/courses?page=2").as_deref(),
            Some("https://a.edu/courses?page=2")
        );
    }

    #[test]
    fn test_normalize_rejects_non_http() {
        assert!(normalize_url("mailto:registrar@a.edu").is_none());
        assert!(normalize_url("javascript:void(0)").is_none());
        assert!(normalize_url("/relative").is_none());
    }

    #[test]
    fn test_extract_links_resolves_and_dedups() {
        let content = "[BIO 101](/course/101) [BIO 102](/course/102/) [again](/course/101#x)";
        let regexp = Regex::new(r"/course/\d+/?(#\w+)?").unwrap();
        let links = extract_links(content, "https://a.edu/courses", &regexp);
        assert_eq!(
            links,
            vec!["https://a.edu/course/101", "https://a.edu/course/102"]
        );
    }

    #[test]
    fn test_extract_links_with_absolute_matches() {
        let content = "(https://a.edu/c/1) (https://b.edu/c/2)";
        let regexp = Regex::new(r"https://[a-z.]+/c/\d+").unwrap();
        let links = extract_links(content, "https://a.edu", &regexp);
        assert_eq!(links.len(), 2);
    }
}
