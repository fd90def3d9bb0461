//! Keyword digest of a task's text
//!
//! The digest goes into the worker's commit message and drives the
//! resume-by-commit check: a commit whose subject contains the digest means
//! the task's work already exists.

/// Minimum token length to count as a keyword
const MIN_TOKEN_LEN: usize = 4;

/// Keywords retained in the digest
const MAX_TOKENS: usize = 5;

/// First five >=4-letter tokens of the text, lowercased, hyphen-joined.
///
/// `"Implement the OAuth token refresh flow"` digests to
/// `"implement-oauth-token-refresh-flow"`.
pub fn keyword_digest(text: &str) -> String {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() >= MIN_TOKEN_LEN)
        .take(MAX_TOKENS)
        .map(|token| token.to_lowercase())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_takes_first_five_long_tokens() {
        assert_eq!(
            keyword_digest("Implement the OAuth token refresh flow for user sessions"),
            "implement-oauth-token-refresh-flow"
        );
    }

    #[test]
    fn test_digest_skips_short_tokens() {
        assert_eq!(keyword_digest("fix a bug in the app db and API layer"), "layer");
    }

    #[test]
    fn test_digest_is_stable() {
        let text = "Create user authentication module with password hashing";
        assert_eq!(keyword_digest(text), keyword_digest(text));
    }

    #[test]
    fn test_digest_of_punctuation_heavy_text() {
        assert_eq!(
            keyword_digest("Add `parse_config()` (YAML!) support, with defaults."),
            "parse-config-yaml-support-with"
        );
    }

    #[test]
    fn test_digest_empty_text() {
        assert_eq!(keyword_digest(""), "");
        assert_eq!(keyword_digest("a an it"), "");
    }
}
