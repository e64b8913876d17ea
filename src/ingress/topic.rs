//! MQTT topic filters
//!
//! - `+` matches exactly one level
//! - `#` (last level only) matches the parent level and everything below it,
//!   so `sensors/#` matches `sensors`, `sensors/temp` and `sensors/a/b`
//! - topics starting with `$` are not matched by a leading wildcard

/// Why a filter was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicFilterError {
    Empty,
    /// `#` somewhere other than the whole last level
    MisplacedMultiLevel,
    /// `+` sharing a level with other characters
    MisplacedSingleLevel,
    NulCharacter,
}

impl std::fmt::Display for TopicFilterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopicFilterError::Empty => write!(f, "topic filter is empty"),
            TopicFilterError::MisplacedMultiLevel => {
                write!(f, "'#' must be the whole last level of a topic filter")
            }
            TopicFilterError::MisplacedSingleLevel => {
                write!(f, "'+' must occupy a whole level of a topic filter")
            }
            TopicFilterError::NulCharacter => write!(f, "topic filter contains NUL"),
        }
    }
}

impl std::error::Error for TopicFilterError {}

/// Check that `filter` is a valid MQTT subscription filter
pub fn validate_filter(filter: &str) -> Result<(), TopicFilterError> {
    if filter.is_empty() {
        return Err(TopicFilterError::Empty);
    }
    if filter.contains('\0') {
        return Err(TopicFilterError::NulCharacter);
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != last) {
            return Err(TopicFilterError::MisplacedMultiLevel);
        }
        if level.contains('+') && *level != "+" {
            return Err(TopicFilterError::MisplacedSingleLevel);
        }
    }
    Ok(())
}

/// Does `topic` match the (already validated) `filter`?
pub fn matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            // `a/#` also matches `a`
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts() {
        for filter in ["sensores/#", "#", "+", "a/+/c", "+/+/#", "sensors/temp", "a//b"] {
            assert_eq!(validate_filter(filter), Ok(()), "{}", filter);
        }
    }

    #[test]
    fn test_validate_rejects() {
        assert_eq!(validate_filter(""), Err(TopicFilterError::Empty));
        assert_eq!(
            validate_filter("a/#/b"),
            Err(TopicFilterError::MisplacedMultiLevel)
        );
        assert_eq!(
            validate_filter("a/b#"),
            Err(TopicFilterError::MisplacedMultiLevel)
        );
        assert_eq!(
            validate_filter("a/b+/c"),
            Err(TopicFilterError::MisplacedSingleLevel)
        );
        assert_eq!(validate_filter("a\0b"), Err(TopicFilterError::NulCharacter));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(matches("sensores/#", "sensores"));
        assert!(matches("sensores/#", "sensores/temperatura"));
        assert!(matches("sensores/#", "sensores/sala/humedad"));
        assert!(!matches("sensores/#", "actuators/valve"));
        assert!(!matches("sensores/#", "sensoresX/temp"));
        assert!(matches("#", "anything/at/all"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(matches("sensors/+/temp", "sensors/room1/temp"));
        assert!(!matches("sensors/+/temp", "sensors/room1/sub/temp"));
        assert!(!matches("sensors/+", "sensors"));
        assert!(matches("sensors/+", "sensors/"));
    }

    #[test]
    fn test_exact_match() {
        assert!(matches("sensors/temp", "sensors/temp"));
        assert!(!matches("sensors/temp", "sensors/temp/x"));
        assert!(!matches("sensors/temp/x", "sensors/temp"));
    }

    #[test]
    fn test_dollar_topics_hidden_from_leading_wildcards() {
        assert!(!matches("#", "$SYS/broker/uptime"));
        assert!(!matches("+/broker/uptime", "$SYS/broker/uptime"));
        assert!(matches("$SYS/#", "$SYS/broker/uptime"));
    }
}
