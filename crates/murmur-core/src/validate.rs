//! Input validation and page-size normalization.
//!
//! Everything here runs before any store access. Lengths are counted in
//! Unicode scalar values, not bytes.

use std::sync::LazyLock;

use murmur_types::NewPost;
use regex::Regex;
use validator::ValidateEmail;

use crate::error::SocialError;

/// Maximum post and comment length after trimming.
pub const MAX_CONTENT_CHARS: usize = 480;

/// Maximum spoiler label length after trimming.
pub const MAX_SPOILER_CHARS: usize = 64;

/// Page size used when the caller asks for zero items.
pub const DEFAULT_PAGE_SIZE: i64 = 10;

/// Largest page size served.
pub const MAX_PAGE_SIZE: i64 = 20;

/// Matches `users.username`: a letter, then up to 17 letters, digits, `_` or `-`.
static USERNAME_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_-]{0,17}$").ok());

/// A post that passed validation, trimmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidPost {
    /// Trimmed body, 1 to 480 characters.
    pub content: String,
    /// Trimmed spoiler label, 1 to 64 characters.
    pub spoiler_of: Option<String>,
    /// Not-safe-for-work flag.
    pub nsfw: bool,
}

/// Check a username against the allowed pattern.
pub fn username(raw: &str) -> Result<&str, SocialError> {
    let trimmed = raw.trim();
    let valid = USERNAME_RE
        .as_ref()
        .is_some_and(|re| re.is_match(trimmed));
    if valid {
        Ok(trimmed)
    } else {
        Err(SocialError::validation("invalid username"))
    }
}

/// Check an email address.
pub fn email(raw: &str) -> Result<&str, SocialError> {
    let trimmed = raw.trim();
    if trimmed.validate_email() {
        Ok(trimmed)
    } else {
        Err(SocialError::validation("invalid email address"))
    }
}

/// Trim and bound post or comment content.
pub fn content(raw: &str) -> Result<&str, SocialError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SocialError::validation("content is required"));
    }
    if trimmed.chars().count() > MAX_CONTENT_CHARS {
        return Err(SocialError::validation(format!(
            "content exceeds {MAX_CONTENT_CHARS} characters"
        )));
    }
    Ok(trimmed)
}

/// Validate a new post.
pub fn post(input: &NewPost) -> Result<ValidPost, SocialError> {
    let content = content(&input.content)?.to_owned();
    let spoiler_of = match input.spoiler_of.as_deref().map(str::trim) {
        None => None,
        Some(s) if s.is_empty() || s.chars().count() > MAX_SPOILER_CHARS => {
            return Err(SocialError::validation("invalid spoiler"));
        }
        Some(s) => Some(s.to_owned()),
    };
    Ok(ValidPost {
        content,
        spoiler_of,
        nsfw: input.nsfw,
    })
}

/// Normalize a requested page size: 0 means the default, otherwise clamp to 1..=20.
pub const fn page_size(requested: i64) -> i64 {
    if requested == 0 {
        DEFAULT_PAGE_SIZE
    } else if requested < 1 {
        1
    } else if requested > MAX_PAGE_SIZE {
        MAX_PAGE_SIZE
    } else {
        requested
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]
mod tests {
    use super::*;

    fn new_post(content: &str) -> NewPost {
        NewPost {
            content: content.to_owned(),
            ..NewPost::default()
        }
    }

    #[test]
    fn content_bounds() {
        let at_limit = "a".repeat(MAX_CONTENT_CHARS);
        assert!(post(&new_post(&at_limit)).is_ok());

        let over = "a".repeat(MAX_CONTENT_CHARS + 1);
        assert!(matches!(post(&new_post(&over)), Err(SocialError::Validation(_))));

        assert!(matches!(post(&new_post("   \n\t")), Err(SocialError::Validation(_))));
    }

    #[test]
    fn content_is_counted_in_characters() {
        let multibyte = "é".repeat(MAX_CONTENT_CHARS);
        assert!(content(&multibyte).is_ok());
    }

    #[test]
    fn content_is_trimmed() {
        let valid = post(&new_post("  hello  ")).unwrap();
        assert_eq!(valid.content, "hello");
    }

    #[test]
    fn spoiler_must_be_non_blank_and_short() {
        let mut input = new_post("hello");
        input.spoiler_of = Some(String::from("   "));
        assert!(post(&input).is_err());

        input.spoiler_of = Some("s".repeat(MAX_SPOILER_CHARS + 1));
        assert!(post(&input).is_err());

        input.spoiler_of = Some(String::from(" season 2 "));
        assert_eq!(post(&input).unwrap().spoiler_of.as_deref(), Some("season 2"));
    }

    #[test]
    fn username_pattern() {
        assert_eq!(username(" ana_b-1 ").unwrap(), "ana_b-1");
        assert!(username("a").is_ok());
        assert!(username(&format!("a{}", "b".repeat(17))).is_ok());
        assert!(username(&format!("a{}", "b".repeat(18))).is_err());
        assert!(username("1ana").is_err());
        assert!(username("ana bob").is_err());
        assert!(username("").is_err());
    }

    #[test]
    fn email_check() {
        assert_eq!(email(" ana@example.com ").unwrap(), "ana@example.com");
        assert!(email("not-an-email").is_err());
    }

    #[test]
    fn page_size_normalization() {
        assert_eq!(page_size(0), 10);
        assert_eq!(page_size(-5), 1);
        assert_eq!(page_size(1), 1);
        assert_eq!(page_size(7), 7);
        assert_eq!(page_size(20), 20);
        assert_eq!(page_size(21), 20);
    }
}
