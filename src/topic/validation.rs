//! Topic name and filter validation, and filter matching
//!
//! - `/` separates levels; empty levels are legal
//! - `+` matches exactly one level and must occupy the whole level
//! - `#` matches the remaining zero or more levels and must be the last level
//! - topics starting with `$` are not matched by a leading `+` or `#`

/// Maximum topic length in bytes (u16 length prefix)
const MAX_TOPIC_LEN: usize = 65_535;

/// Validate a topic name as used in PUBLISH
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err("topic name exceeds maximum length");
    }
    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }
    if topic.contains(|c| c == '+' || c == '#') {
        return Err("topic name cannot contain wildcards");
    }
    Ok(())
}

/// Validate a topic filter as used in SUBSCRIBE and UNSUBSCRIBE
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }
    if filter.len() > MAX_TOPIC_LEN {
        return Err("topic filter exceeds maximum length");
    }
    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        match level {
            "#" if levels.peek().is_some() => {
                return Err("multi-level wildcard must be the last level")
            }
            "#" | "+" => {}
            l if l.contains('#') => return Err("multi-level wildcard must occupy entire level"),
            l if l.contains('+') => return Err("single-level wildcard must occupy entire level"),
            _ => {}
        }
    }
    Ok(())
}

/// Whether `filter` matches `topic`
///
/// Both arguments are assumed valid; see [`validate_topic_filter`] and
/// [`validate_topic_name`].
pub fn matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');

    for filter_level in filter.split('/') {
        if filter_level == "#" {
            return true;
        }
        match topic_levels.next() {
            Some(level) if filter_level == "+" || filter_level == level => {}
            _ => return false,
        }
    }

    topic_levels.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("test").is_ok());
        assert!(validate_topic_name("test/topic").is_ok());
        assert!(validate_topic_name("/test/topic").is_ok());
        assert!(validate_topic_name("test/topic/").is_ok());
        assert!(validate_topic_name("$SYS/uptime").is_ok());

        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("test+topic").is_err());
        assert!(validate_topic_name("test/#").is_err());
        assert!(validate_topic_name("a\0b").is_err());
    }

    #[test]
    fn test_validate_topic_filter() {
        for ok in ["test", "+", "#", "test/+", "test/#", "+/test", "+/+/+", "a//b", "/", "$SYS/#"] {
            assert!(validate_topic_filter(ok).is_ok(), "{}", ok);
        }
        for bad in ["", "test+", "test#", "test/#/more", "+test", "#/a", "a/b#"] {
            assert!(validate_topic_filter(bad).is_err(), "{}", bad);
        }
    }

    #[test_case("a/+/c", "a/b/c", true; "plus matches one level")]
    #[test_case("a/+/c", "a/b/d", false; "plus fixed tail differs")]
    #[test_case("a/+/c", "a//c", true; "plus matches empty level")]
    #[test_case("a/+/c", "a/b/c/d", false; "plus does not span levels")]
    #[test_case("a/#", "a", true; "hash matches parent")]
    #[test_case("a/#", "a/b/c", true; "hash matches many levels")]
    #[test_case("a/#", "b/a", false; "hash needs prefix")]
    #[test_case("+/b", "$SYS/b", false; "leading plus skips dollar topic")]
    #[test_case("#", "$SYS/foo", false; "leading hash skips dollar topic")]
    #[test_case("$SYS/#", "$SYS/foo", true; "explicit dollar prefix")]
    #[test_case("$SYS/+", "$SYS/foo", true; "dollar prefix with plus")]
    #[test_case("#", "a/b", true; "hash matches everything")]
    #[test_case("+", "a/b", false; "plus alone is one level")]
    #[test_case("+/+", "/a", true; "leading empty level")]
    #[test_case("a/b", "a/b", true; "exact")]
    #[test_case("a/b", "a/b/", false; "trailing empty level")]
    #[test_case("a/b/", "a/b/", true; "trailing empty level exact")]
    fn test_matches(filter: &str, topic: &str, expected: bool) {
        assert_eq!(matches(filter, topic), expected);
    }
}
