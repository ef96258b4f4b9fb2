//! Label taxonomy for PII redaction
//!
//! The closed set of tags the model is told to use when it replaces a span
//! with `[LABEL]`, plus the entity shape the model returns.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// One tag of the closed taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LabelTag {
    GivenName1,
    GivenName2,
    LastName1,
    LastName2,
    LastName3,
    Title,
    Tel,
    Email,
    Username,
    SocialNumber,
    IdCard,
    DriverLicense,
    Passport,
    Street,
    Building,
    City,
    State,
    Postcode,
    Country,
    SecAddress,
    GeoCoord,
    Sex,
    Bod,
    Pass,
    Ip,
    Date,
    Time,
}

/// Taxonomy grouping used when rendering the label list into instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelGroup {
    Names,
    Contact,
    Ids,
    Location,
    Personal,
    Digital,
    Time,
}

impl LabelGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelGroup::Names => "Names",
            LabelGroup::Contact => "Contact",
            LabelGroup::Ids => "IDs",
            LabelGroup::Location => "Location",
            LabelGroup::Personal => "Personal",
            LabelGroup::Digital => "Digital",
            LabelGroup::Time => "Time",
        }
    }

    pub fn all() -> [LabelGroup; 7] {
        [
            LabelGroup::Names,
            LabelGroup::Contact,
            LabelGroup::Ids,
            LabelGroup::Location,
            LabelGroup::Personal,
            LabelGroup::Digital,
            LabelGroup::Time,
        ]
    }
}

impl LabelTag {
    pub const ALL: [LabelTag; 27] = [
        LabelTag::GivenName1,
        LabelTag::GivenName2,
        LabelTag::LastName1,
        LabelTag::LastName2,
        LabelTag::LastName3,
        LabelTag::Title,
        LabelTag::Tel,
        LabelTag::Email,
        LabelTag::Username,
        LabelTag::SocialNumber,
        LabelTag::IdCard,
        LabelTag::DriverLicense,
        LabelTag::Passport,
        LabelTag::Street,
        LabelTag::Building,
        LabelTag::City,
        LabelTag::State,
        LabelTag::Postcode,
        LabelTag::Country,
        LabelTag::SecAddress,
        LabelTag::GeoCoord,
        LabelTag::Sex,
        LabelTag::Bod,
        LabelTag::Pass,
        LabelTag::Ip,
        LabelTag::Date,
        LabelTag::Time,
    ];

    /// The literal tag as it appears inside `[...]`.
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelTag::GivenName1 => "GIVENNAME1",
            LabelTag::GivenName2 => "GIVENNAME2",
            LabelTag::LastName1 => "LASTNAME1",
            LabelTag::LastName2 => "LASTNAME2",
            LabelTag::LastName3 => "LASTNAME3",
            LabelTag::Title => "TITLE",
            LabelTag::Tel => "TEL",
            LabelTag::Email => "EMAIL",
            LabelTag::Username => "USERNAME",
            LabelTag::SocialNumber => "SOCIALNUMBER",
            LabelTag::IdCard => "IDCARD",
            LabelTag::DriverLicense => "DRIVERLICENSE",
            LabelTag::Passport => "PASSPORT",
            LabelTag::Street => "STREET",
            LabelTag::Building => "BUILDING",
            LabelTag::City => "CITY",
            LabelTag::State => "STATE",
            LabelTag::Postcode => "POSTCODE",
            LabelTag::Country => "COUNTRY",
            LabelTag::SecAddress => "SECADDRESS",
            LabelTag::GeoCoord => "GEOCOORD",
            LabelTag::Sex => "SEX",
            LabelTag::Bod => "BOD",
            LabelTag::Pass => "PASS",
            LabelTag::Ip => "IP",
            LabelTag::Date => "DATE",
            LabelTag::Time => "TIME",
        }
    }

    pub fn parse(tag: &str) -> Option<LabelTag> {
        LabelTag::ALL.iter().copied().find(|t| t.as_str() == tag)
    }

    pub fn group(&self) -> LabelGroup {
        match self {
            LabelTag::GivenName1
            | LabelTag::GivenName2
            | LabelTag::LastName1
            | LabelTag::LastName2
            | LabelTag::LastName3
            | LabelTag::Title => LabelGroup::Names,
            LabelTag::Tel | LabelTag::Email | LabelTag::Username => LabelGroup::Contact,
            LabelTag::SocialNumber
            | LabelTag::IdCard
            | LabelTag::DriverLicense
            | LabelTag::Passport => LabelGroup::Ids,
            LabelTag::Street
            | LabelTag::Building
            | LabelTag::City
            | LabelTag::State
            | LabelTag::Postcode
            | LabelTag::Country
            | LabelTag::SecAddress
            | LabelTag::GeoCoord => LabelGroup::Location,
            LabelTag::Sex | LabelTag::Bod | LabelTag::Pass => LabelGroup::Personal,
            LabelTag::Ip => LabelGroup::Digital,
            LabelTag::Date | LabelTag::Time => LabelGroup::Time,
        }
    }

    /// Bracketed token used in redacted text, e.g. `[TEL]`.
    pub fn token(&self) -> String {
        format!("[{}]", self.as_str())
    }
}

impl std::fmt::Display for LabelTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Render the taxonomy as one line per group: `Names: GIVENNAME1, ...`.
pub fn taxonomy_lines() -> String {
    LabelGroup::all()
        .iter()
        .map(|group| {
            let tags = LabelTag::ALL
                .iter()
                .filter(|t| t.group() == *group)
                .map(LabelTag::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            format!("{}: {}", group.as_str(), tags)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// A single PII span reported by the model.
///
/// `label` stays a free string: the model may invent tags, and that is a
/// scoring concern rather than a parse failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PiiEntity {
    pub value: String,
    pub label: String,
}

impl PiiEntity {
    pub fn new(value: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: label.into(),
        }
    }

    pub fn tag(&self) -> Option<LabelTag> {
        LabelTag::parse(&self.label)
    }

    pub fn is_well_formed(&self) -> bool {
        self.tag().is_some()
    }
}

fn label_token_regex() -> &'static Regex {
    static LABEL_TOKEN: OnceLock<Regex> = OnceLock::new();
    LABEL_TOKEN.get_or_init(|| Regex::new(r"\[([A-Z]+[0-9]*)\]").expect("label token regex"))
}

/// Extract every `[LABEL]` token in order of appearance.
///
/// Tags are not checked against the taxonomy.
pub fn extract_labels(text: &str) -> Vec<String> {
    label_token_regex()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Multiset view of a label list.
pub fn label_counts<S: AsRef<str>>(labels: &[S]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for label in labels {
        *counts.entry(label.as_ref().to_string()).or_insert(0) += 1;
    }
    counts
}
