//! Topic validation and wildcard matching
//!
//! Topics are slash separated (`a/b/c`). Patterns may additionally use `+`
//! for exactly one segment and `#` as the last segment for any number of
//! trailing segments, including none. Matching is case-sensitive.
//!
//! Literal topics may contain empty levels, as MQTT allows; `+` matches an
//! empty level like any other. Patterns must not contain empty segments.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("Topic is empty")]
    Empty,

    #[error("Empty segment at position {position} in '{topic}'")]
    EmptySegment { topic: String, position: usize },

    #[error("Wildcard not allowed in literal topic '{0}'")]
    WildcardInTopic(String),

    #[error("Wildcard must occupy a whole segment in '{0}'")]
    PartialWildcard(String),

    #[error("'#' is only valid as the last segment in '{0}'")]
    MisplacedMultiLevel(String),
}

/// A literal publish destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    /// Empty levels (`/a`, `a//b`, `a/`) are valid topic levels and kept as is.
    pub fn parse(raw: &str) -> Result<Self, TopicError> {
        if segments(raw)?.any(|segment| segment.contains(['+', '#'])) {
            return Err(TopicError::WildcardInTopic(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    SingleLevel,
    MultiLevel,
}

/// A subscription filter, validated once at subscribe time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    pub fn parse(raw: &str) -> Result<Self, TopicError> {
        let parts: Vec<&str> = segments(raw)?.collect();
        let last = parts.len() - 1;
        let mut parsed = Vec::with_capacity(parts.len());

        for (position, part) in parts.into_iter().enumerate() {
            let segment = match part {
                "" => {
                    return Err(TopicError::EmptySegment {
                        topic: raw.to_string(),
                        position,
                    })
                }
                "+" => Segment::SingleLevel,
                "#" if position == last => Segment::MultiLevel,
                "#" => return Err(TopicError::MisplacedMultiLevel(raw.to_string())),
                literal if literal.contains(['+', '#']) => {
                    return Err(TopicError::PartialWildcard(raw.to_string()))
                }
                literal => Segment::Literal(literal.to_string()),
            };
            parsed.push(segment);
        }

        Ok(Self {
            raw: raw.to_string(),
            segments: parsed,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, topic: &Topic) -> bool {
        let mut levels = topic.as_str().split('/');

        for segment in &self.segments {
            match segment {
                Segment::MultiLevel => return true,
                Segment::SingleLevel => {
                    if levels.next().is_none() {
                        return false;
                    }
                }
                Segment::Literal(expected) => match levels.next() {
                    Some(level) if level == expected => {}
                    _ => return false,
                },
            }
        }

        levels.next().is_none()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// String-level matcher. Malformed input never matches.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    match (TopicPattern::parse(pattern), Topic::parse(topic)) {
        (Ok(pattern), Ok(topic)) => pattern.matches(&topic),
        _ => false,
    }
}

fn segments(raw: &str) -> Result<std::str::Split<'_, char>, TopicError> {
    if raw.is_empty() {
        return Err(TopicError::Empty);
    }
    Ok(raw.split('/'))
}
