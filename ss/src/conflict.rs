//! Glob pattern conflict detection
//!
//! Two patterns conflict when they could match a common concrete path. The
//! rule here deliberately over-approximates: each pattern reduces to its
//! directory prefix up to the first wildcard, and prefix containment in
//! either direction is a conflict. Safety over parallelism.

/// Characters that start glob syntax
const WILDCARDS: &[char] = &['*', '?', '['];

/// Directory prefix of a pattern up to its first wildcard.
///
/// A pattern without wildcards is its own prefix. `"src/api/*.rs"` reduces
/// to `"src/api"`, `"*.rs"` reduces to `""`.
pub fn wildcard_prefix(pattern: &str) -> &str {
    match pattern.find(WILDCARDS) {
        None => pattern.trim_end_matches('/'),
        Some(idx) => {
            let literal = &pattern[..idx];
            match literal.rfind('/') {
                Some(slash) => &literal[..slash],
                None => "",
            }
        }
    }
}

/// True when `prefix` names `path` or a directory above it.
fn is_path_prefix(prefix: &str, path: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    path == prefix || (path.len() > prefix.len() && path.starts_with(prefix) && path.as_bytes()[prefix.len()] == b'/')
}

/// Matches every file in the tree
fn is_match_all(pattern: &str) -> bool {
    pattern == "*" || pattern == "**"
}

/// Conservative conflict test between two glob patterns.
///
/// Conflicts iff the patterns are textually equal, either is `*`/`**`, or
/// the wildcard prefix of one is a path-prefix of the other's.
pub fn patterns_conflict(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    if is_match_all(a) || is_match_all(b) {
        return true;
    }
    let pa = wildcard_prefix(a);
    let pb = wildcard_prefix(b);
    is_path_prefix(pa, pb) || is_path_prefix(pb, pa)
}

/// True when any pattern in `candidate` conflicts with any in `held`.
///
/// An empty candidate set conflicts with nothing: a task that predicted no
/// files locks nothing and runs maximally parallel.
pub fn sets_conflict(candidate: &[String], held: &[String]) -> bool {
    candidate
        .iter()
        .any(|c| held.iter().any(|h| patterns_conflict(c, h)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_wildcard_prefix() {
        assert_eq!(wildcard_prefix("src/api/*.rs"), "src/api");
        assert_eq!(wildcard_prefix("src/**"), "src");
        assert_eq!(wildcard_prefix("a/*"), "a");
        assert_eq!(wildcard_prefix("*.rs"), "");
        assert_eq!(wildcard_prefix("**"), "");
        assert_eq!(wildcard_prefix("src/x.txt"), "src/x.txt");
        assert_eq!(wildcard_prefix("docs/"), "docs");
        assert_eq!(wildcard_prefix("src/ma[in].rs"), "src");
    }

    #[test]
    fn test_equal_patterns_conflict() {
        assert!(patterns_conflict("src/x.txt", "src/x.txt"));
        assert!(patterns_conflict("a/*", "a/*"));
    }

    #[test]
    fn test_match_all_conflicts_with_everything() {
        assert!(patterns_conflict("*", "deep/nested/path.rs"));
        assert!(patterns_conflict("**", "a/*"));
        assert!(patterns_conflict("src/lib.rs", "*"));
    }

    #[test]
    fn test_prefix_containment_conflicts() {
        // a/* covers a/b/c
        assert!(patterns_conflict("a/*", "a/b/c"));
        assert!(patterns_conflict("a/b/c", "a/*"));
        // src/** covers src/api/*.rs
        assert!(patterns_conflict("src/**", "src/api/*.rs"));
    }

    #[test]
    fn test_disjoint_directories_do_not_conflict() {
        assert!(!patterns_conflict("a/*", "b/*"));
        assert!(!patterns_conflict("src/api/*.rs", "src/ui/*.rs"));
        assert!(!patterns_conflict("docs/readme.md", "src/lib.rs"));
    }

    #[test]
    fn test_sibling_names_are_not_prefixes() {
        // "a" is not a path-prefix of "ab/c"
        assert!(!patterns_conflict("a/*", "ab/c"));
    }

    #[test]
    fn test_bare_wildcard_prefix_conflicts_broadly() {
        // "*.rs" has an empty prefix, which sits above every path
        assert!(patterns_conflict("*.rs", "src/lib.rs"));
        assert!(patterns_conflict("*.rs", "*.md"));
    }

    #[test]
    fn test_empty_candidate_set_conflicts_with_nothing() {
        let held = vec!["*".to_string(), "src/**".to_string()];
        assert!(!sets_conflict(&[], &held));
    }

    #[test]
    fn test_sets_conflict_any_pair() {
        let a = vec!["a/*".to_string(), "b/*".to_string()];
        let b = vec!["c/*".to_string(), "b/x.txt".to_string()];
        assert!(sets_conflict(&a, &b));

        let c = vec!["c/*".to_string(), "d/*".to_string()];
        assert!(!sets_conflict(&a, &c));
    }

    fn pattern_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("*".to_string()),
            Just("**".to_string()),
            "[a-c]{1,3}(/[a-c]{1,3}){0,3}",
            "[a-c]{1,3}(/[a-c]{1,3}){0,2}/\\*",
        ]
    }

    proptest! {
        #[test]
        fn prop_conflict_is_symmetric(a in pattern_strategy(), b in pattern_strategy()) {
            prop_assert_eq!(patterns_conflict(&a, &b), patterns_conflict(&b, &a));
        }

        #[test]
        fn prop_pattern_conflicts_with_itself(a in pattern_strategy()) {
            prop_assert!(patterns_conflict(&a, &a));
        }

        #[test]
        fn prop_match_all_conflicts(a in pattern_strategy()) {
            prop_assert!(patterns_conflict("*", &a));
            prop_assert!(patterns_conflict("**", &a));
        }

        #[test]
        fn prop_directory_covers_children(dir in "[a-c]{1,3}", child in "[a-c]{1,3}") {
            let parent = format!("{dir}/*");
            let nested = format!("{dir}/{child}/deep.rs");
            prop_assert!(patterns_conflict(&parent, &nested));
        }
    }
}
