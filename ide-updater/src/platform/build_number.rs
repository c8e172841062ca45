use crate::error::UpdaterError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

const SNAPSHOT: &str = "SNAPSHOT";
const SNAPSHOT_VALUE: u32 = u32::MAX;

/// A build number such as `IU-241.14494.240`.
///
/// The product code prefix is informational only: equality, hashing and
/// ordering look at the numeric components alone.
#[derive(Debug, Clone)]
pub struct BuildNumber {
    product_code: Option<String>,
    components: Vec<u32>,
}

impl BuildNumber {
    pub fn parse(value: &str) -> Result<Self, UpdaterError> {
        value.parse()
    }

    /// The major ("baseline") version, e.g. `241` for `241.14494.240`.
    pub fn baseline(&self) -> u32 {
        self.components.first().copied().unwrap_or(0)
    }

    pub fn as_string_without_product_code(&self) -> String {
        self.components
            .iter()
            .map(|c| {
                if *c == SNAPSHOT_VALUE {
                    SNAPSHOT.to_owned()
                } else {
                    c.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl FromStr for BuildNumber {
    type Err = UpdaterError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let invalid = || UpdaterError::InvalidBuildNumber(value.to_owned());

        let (product_code, number) = match value.split_once('-') {
            Some((code, rest)) if !code.is_empty() && code.chars().all(|c| c.is_ascii_alphabetic()) => {
                (Some(code.to_owned()), rest)
            }
            Some(_) => return Err(invalid()),
            None => (None, value),
        };

        if number.is_empty() {
            return Err(invalid());
        }

        let components = number
            .split('.')
            .map(|part| match part {
                SNAPSHOT | "*" => Ok(SNAPSHOT_VALUE),
                _ => part.parse::<u32>().map_err(|_| invalid()),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            product_code,
            components,
        })
    }
}

impl fmt::Display for BuildNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = &self.product_code {
            write!(f, "{}-", code)?;
        }
        f.write_str(&self.as_string_without_product_code())
    }
}

impl PartialEq for BuildNumber {
    fn eq(&self, other: &Self) -> bool {
        self.components == other.components
    }
}

impl Eq for BuildNumber {}

impl Hash for BuildNumber {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.components.hash(state);
    }
}

impl PartialOrd for BuildNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BuildNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        // Component-wise, a longer number wins when one is a prefix of the other.
        self.components.cmp(&other.components)
    }
}

impl Serialize for BuildNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BuildNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// An inclusive build range. A missing bound is open on that side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRange {
    pub since: Option<BuildNumber>,
    pub until: Option<BuildNumber>,
}

impl BuildRange {
    pub fn new(since: Option<BuildNumber>, until: Option<BuildNumber>) -> Self {
        Self { since, until }
    }

    pub fn contains(&self, build: &BuildNumber) -> bool {
        self.since.as_ref().is_none_or(|since| since <= build)
            && self.until.as_ref().is_none_or(|until| build <= until)
    }
}
