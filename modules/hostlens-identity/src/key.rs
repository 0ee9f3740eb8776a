//! Best-effort natural key built from a thread's visible metadata.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use hostlens_common::ParseResult;

/// Attribute names a thread-row parser is expected to produce.
pub mod fields {
    pub const SUBJECT: &str = "subject";
    pub const TIME_STRING: &str = "time_string";
    pub const PEOPLE: &str = "people";
}

static RE_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());
static RE_WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static RE_SPACE_BEFORE_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+([,;])").unwrap());

/// Subject, displayed time and people fragment, each normalized.
///
/// Two threads with the same visible metadata produce the same key; that
/// collision is what the identity cache records as ambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadMetadataKey {
    subject: String,
    time_string: String,
    people: String,
}

impl ThreadMetadataKey {
    pub fn new(subject: &str, time_string: &str, people: &str) -> Self {
        Self {
            subject: normalize_text(subject),
            time_string: normalize_text(time_string),
            people: normalize_people(people),
        }
    }

    /// Key from a row's parse. Subject and time are required; a missing
    /// people fragment is treated as empty.
    pub fn from_parsed(parsed: &ParseResult) -> Option<Self> {
        let subject = parsed.text(fields::SUBJECT)?;
        let time_string = parsed.text(fields::TIME_STRING)?;
        let people = parsed.text(fields::PEOPLE).unwrap_or_default();
        Some(Self::new(subject, time_string, people))
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn time_string(&self) -> &str {
        &self.time_string
    }

    pub fn people(&self) -> &str {
        &self.people
    }
}

impl fmt::Display for ThreadMetadataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} | {} | {}", self.subject, self.time_string, self.people)
    }
}

/// Trim and collapse internal whitespace runs to one space.
pub fn normalize_text(text: &str) -> String {
    RE_WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

/// People fragments arrive either as display text or as markup with quoted
/// names; strip both down to the bare names. A separator never keeps the
/// whitespace a closing tag left in front of it.
pub fn normalize_people(fragment: &str) -> String {
    let untagged = RE_TAG.replace_all(fragment, " ");
    let unquoted: String = untagged
        .chars()
        .filter(|c| !matches!(c, '"' | '\u{201c}' | '\u{201d}'))
        .collect();
    let collapsed = normalize_text(&unquoted);
    RE_SPACE_BEFORE_SEPARATOR
        .replace_all(&collapsed, "$1")
        .into_owned()
}
