//! Input validation for profile URLs, usernames and snapshot subjects.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::error::{Error, Result};

pub const SITE_DOMAIN: &str = "letterboxd.com";
pub const SITE_BASE_URL: &str = "https://letterboxd.com";

const MIN_USERNAME_LEN: usize = 2;
const MAX_USERNAME_LEN: usize = 30;
const MAX_SUBJECT_LEN: usize = 128;

static USERNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("valid username regex"));
static SUBJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid subject regex"));

/// Check a site username. Returns the trimmed username.
pub fn validate_username(username: &str) -> Result<&str> {
    let username = username.trim();
    let invalid = |reason: &str| Error::InvalidSubject {
        subject: username.to_string(),
        reason: reason.to_string(),
    };

    if username.is_empty() {
        return Err(invalid("username cannot be empty"));
    }
    if username.len() < MIN_USERNAME_LEN {
        return Err(invalid("username too short (min 2 characters)"));
    }
    if username.len() > MAX_USERNAME_LEN {
        return Err(invalid("username too long (max 30 characters)"));
    }
    if !USERNAME_RE.is_match(username) {
        return Err(invalid(
            "username can only contain letters, numbers, and underscores",
        ));
    }
    Ok(username)
}

/// Check a snapshot subject id. Subjects become file-name components, so
/// only ASCII letters, digits, `_` and `-` are allowed.
pub fn validate_subject(subject: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidSubject {
        subject: subject.to_string(),
        reason: reason.to_string(),
    };

    if subject.is_empty() {
        return Err(invalid("subject cannot be empty"));
    }
    if subject.len() > MAX_SUBJECT_LEN {
        return Err(invalid("subject too long"));
    }
    if !SUBJECT_RE.is_match(subject) {
        return Err(invalid(
            "subject can only contain letters, numbers, '_' and '-'",
        ));
    }
    Ok(())
}

/// Extract the username from a profile URL such as
/// `https://letterboxd.com/alice/films/`. A missing scheme is tolerated.
pub fn parse_profile_url(input: &str) -> Result<String> {
    let trimmed = input.trim();
    let invalid = |reason: String| Error::InvalidUrl {
        url: input.to_string(),
        reason,
    };

    if trimmed.is_empty() {
        return Err(invalid("URL cannot be empty".to_string()));
    }

    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    let url = Url::parse(&with_scheme).map_err(|e| invalid(format!("failed to parse URL: {}", e)))?;

    let host = url.host_str().unwrap_or_default().to_lowercase();
    let domain = host.strip_prefix("www.").unwrap_or(&host);
    if domain != SITE_DOMAIN {
        return Err(invalid(format!("not a Letterboxd URL (domain: {})", domain)));
    }

    let username = url
        .path_segments()
        .and_then(|mut segments| segments.find(|s| !s.is_empty()))
        .ok_or_else(|| invalid("no username found in URL".to_string()))?;

    validate_username(username)
        .map(str::to_string)
        .map_err(|e| invalid(e.to_string()))
}

/// Turn a username or profile URL into the canonical profile URL.
pub fn normalize_profile_url(input: &str) -> Result<String> {
    let trimmed = input.trim();
    let username = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        parse_profile_url(trimmed)?
    } else {
        validate_username(trimmed)
            .map_err(|e| Error::InvalidUrl {
                url: input.to_string(),
                reason: e.to_string(),
            })?
            .to_string()
    };
    Ok(profile_url(&username))
}

pub fn profile_url(username: &str) -> String {
    format!("{}/{}/", SITE_BASE_URL, username)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_username() {
        assert_eq!(validate_username("  film_buff_99 ").unwrap(), "film_buff_99");
        assert!(validate_username("").is_err());
        assert!(validate_username("a").is_err());
        assert!(validate_username(&"x".repeat(31)).is_err());
        assert!(validate_username("bad-name").is_err());
    }

    #[test]
    fn test_validate_subject() {
        assert!(validate_subject("alice").is_ok());
        assert!(validate_subject("list-top-100_2024").is_ok());
        assert!(validate_subject("").is_err());
        assert!(validate_subject("a/b").is_err());
        assert!(validate_subject("..").is_err());
    }

    #[test]
    fn test_parse_profile_url() {
        assert_eq!(parse_profile_url("https://letterboxd.com/alice/").unwrap(), "alice");
        assert_eq!(parse_profile_url("https://www.letterboxd.com/alice").unwrap(), "alice");
        assert_eq!(parse_profile_url("letterboxd.com/alice/films/").unwrap(), "alice");
        assert_eq!(parse_profile_url("http://LETTERBOXD.com/bob_1/").unwrap(), "bob_1");
    }

    #[test]
    fn test_parse_profile_url_rejects() {
        assert!(matches!(
            parse_profile_url("https://example.com/alice/"),
            Err(Error::InvalidUrl { .. })
        ));
        assert!(parse_profile_url("https://letterboxd.com/").is_err());
        assert!(parse_profile_url("https://letterboxd.com/a-b/").is_err());
        assert!(parse_profile_url("   ").is_err());
    }

    #[test]
    fn test_normalize_profile_url() {
        assert_eq!(
            normalize_profile_url("alice").unwrap(),
            "https://letterboxd.com/alice/"
        );
        assert_eq!(
            normalize_profile_url("https://www.letterboxd.com/alice/watchlist/").unwrap(),
            "https://letterboxd.com/alice/"
        );
        assert!(normalize_profile_url("not valid!").is_err());
    }
}
