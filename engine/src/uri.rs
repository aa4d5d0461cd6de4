//! URI string helpers.

/// `scheme://host[:port]` of an absolute URI.
pub fn origin(uri: &str) -> Option<&str> {
    let scheme_end = uri.find("://")? + 3;
    let host_end = uri[scheme_end..]
        .find(['/', '?', '#'])
        .map(|i| scheme_end + i)
        .unwrap_or(uri.len());
    Some(&uri[..host_end])
}

/// Append a path segment to a base URI.
pub fn join(base: &str, segment: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        segment.trim_start_matches('/')
    )
}

/// Resolve a reference found in data against a base URI.
///
/// - anything containing `//` is already absolute
/// - `/path` is rooted at the base's origin, or kept as is when the base
///   has none
/// - everything else is appended to the base
pub fn resolve(base: &str, reference: &str) -> String {
    if reference.contains("//") {
        reference.to_string()
    } else if reference.starts_with('/') {
        match origin(base) {
            Some(origin) => format!("{}{}", origin, reference),
            None => reference.to_string(),
        }
    } else {
        join(base, reference)
    }
}

/// Last non-empty path segment, ignoring any query or fragment.
pub fn last_segment(uri: &str) -> &str {
    let path = uri.split(['?', '#']).next().unwrap_or("");
    let path = match origin(path) {
        Some(origin) => &path[origin.len()..],
        None => path,
    };
    path.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}

/// True if a string looks like a reference to a resource.
pub fn is_reference(value: &str) -> bool {
    value.starts_with('/') || value.contains("//")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origins() {
        assert_eq!(origin("https://api.test/users/1"), Some("https://api.test"));
        assert_eq!(origin("http://localhost:8080"), Some("http://localhost:8080"));
        assert_eq!(origin("/users"), None);
    }

    #[test]
    fn joins() {
        assert_eq!(join("/users/", "/1"), "/users/1");
        assert_eq!(join("https://api.test/users", "2"), "https://api.test/users/2");
    }

    #[test]
    fn resolves() {
        let base = "https://api.test/items/1";
        assert_eq!(resolve(base, "//cdn.test/x"), "//cdn.test/x");
        assert_eq!(resolve(base, "/tags"), "https://api.test/tags");
        assert_eq!(resolve(base, "children"), "https://api.test/items/1/children");
        assert_eq!(resolve("/items/1", "/tags"), "/tags");
    }

    #[test]
    fn last_segments() {
        assert_eq!(last_segment("https://api.test/users/42"), "42");
        assert_eq!(last_segment("/users/42/?full=1"), "42");
        assert_eq!(last_segment("https://api.test"), "");
        assert_eq!(last_segment("https://api.test/"), "");
        assert_eq!(last_segment("abc"), "abc");
    }

    #[test]
    fn references() {
        assert!(is_reference("/users"));
        assert!(is_reference("https://x.test"));
        assert!(!is_reference("plain text"));
    }
}
