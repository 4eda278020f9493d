use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const URL_SCHEME: &str = "i4x://";

/// Structured identifier of a content item: `i4x://{org}/{course}/{category}/{name}`.
///
/// The URL form is what client payloads carry and what children lists store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Location {
    pub org: String,
    pub course: String,
    pub category: String,
    pub name: String,
}

/// Error returned when a location URL cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidLocation {
    raw: String,
}

impl InvalidLocation {
    fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }
}

impl fmt::Display for InvalidLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid location: `{}`", self.raw)
    }
}

impl std::error::Error for InvalidLocation {}

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

impl Location {
    pub fn new(org: &str, course: &str, category: &str, name: &str) -> Result<Self, InvalidLocation> {
        let location = Self {
            org: org.to_string(),
            course: course.to_string(),
            category: category.to_string(),
            name: name.to_string(),
        };
        if [org, course, category, name].iter().all(|s| valid_segment(s)) {
            Ok(location)
        } else {
            Err(InvalidLocation::new(location.url()))
        }
    }

    pub fn parse(url: &str) -> Result<Self, InvalidLocation> {
        let rest = url
            .strip_prefix(URL_SCHEME)
            .ok_or_else(|| InvalidLocation::new(url))?;

        let mut segments = rest.split('/');
        let (Some(org), Some(course), Some(category), Some(name), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(InvalidLocation::new(url));
        };

        Self::new(org, course, category, name).map_err(|_| InvalidLocation::new(url))
    }

    /// Canonical URL form, used as the store key and in children lists.
    pub fn url(&self) -> String {
        format!(
            "{URL_SCHEME}{}/{}/{}/{}",
            self.org, self.course, self.category, self.name
        )
    }

    /// A sibling location in the same course with a different category and name.
    pub fn replace(&self, category: &str, name: &str) -> Result<Self, InvalidLocation> {
        Self::new(&self.org, &self.course, category, name)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

impl FromStr for Location {
    type Err = InvalidLocation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Location {
    type Error = InvalidLocation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Location> for String {
    fn from(location: Location) -> Self {
        location.url()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_through_url() {
        let url = "i4x://acme/Certs101/video/welcome";
        let location = Location::parse(url).unwrap();
        assert_eq!(location.org, "acme");
        assert_eq!(location.course, "Certs101");
        assert_eq!(location.category, "video");
        assert_eq!(location.name, "welcome");
        assert_eq!(location.url(), url);
    }

    #[test]
    fn parse_rejects_missing_scheme() {
        assert!(Location::parse("acme/Certs101/video/welcome").is_err());
    }

    #[test]
    fn parse_rejects_wrong_segment_count() {
        assert!(Location::parse("i4x://acme/Certs101/video").is_err());
        assert!(Location::parse("i4x://acme/Certs101/video/welcome/extra").is_err());
    }

    #[test]
    fn parse_rejects_empty_or_bad_segments() {
        assert!(Location::parse("i4x://acme//video/welcome").is_err());
        assert!(Location::parse("i4x://acme/Certs101/video/has space").is_err());
    }

    #[test]
    fn replace_switches_category_and_name() {
        let parent = Location::parse("i4x://acme/Certs101/chapter/week1").unwrap();
        let child = parent.replace("video", "abc123").unwrap();
        assert_eq!(child.url(), "i4x://acme/Certs101/video/abc123");
    }

    #[test]
    fn serde_uses_url_form() {
        let location = Location::parse("i4x://acme/Certs101/video/welcome").unwrap();
        let json = serde_json::to_string(&location).unwrap();
        assert_eq!(json, "\"i4x://acme/Certs101/video/welcome\"");
        let back: Location = serde_json::from_str(&json).unwrap();
        assert_eq!(back, location);
    }
}
