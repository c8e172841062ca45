use crate::platform::build_number::{BuildNumber, BuildRange};
use chrono::NaiveDate;
use std::fmt;
use std::str::FromStr;

/// The whole update metadata document, possibly describing several products.
#[derive(Debug, Clone, Default)]
pub struct UpdatesInfo {
    pub products: Vec<Product>,
}

impl UpdatesInfo {
    pub fn product(&self, code: &str) -> Option<&Product> {
        self.products
            .iter()
            .find(|product| product.codes.iter().any(|c| c == code))
    }
}

#[derive(Debug, Clone)]
pub struct Product {
    pub name: String,
    pub codes: Vec<String>,
    pub channels: Vec<Channel>,
    /// Whether update requests for this product must not carry a machine id.
    pub disable_machine_id: bool,
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub id: String,
    pub status: ChannelStatus,
    pub licensing: ChannelLicensing,
    pub eval_days: Option<u32>,
    pub url: Option<String>,
    pub builds: Vec<Build>,
}

/// Release tiers, ordered from least to most stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChannelStatus {
    Eap,
    Milestone,
    Beta,
    Release,
}

impl ChannelStatus {
    /// Unknown codes are treated as release channels.
    pub fn from_code(code: &str) -> Self {
        code.parse().unwrap_or(Self::Release)
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::Eap => "eap",
            Self::Milestone => "milestone",
            Self::Beta => "beta",
            Self::Release => "release",
        }
    }
}

impl FromStr for ChannelStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "eap" => Ok(Self::Eap),
            "milestone" => Ok(Self::Milestone),
            "beta" => Ok(Self::Beta),
            "release" => Ok(Self::Release),
            other => Err(format!("unknown channel status: {}", other)),
        }
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLicensing {
    Eap,
    Release,
}

impl ChannelLicensing {
    pub fn from_code(code: &str) -> Self {
        if code.eq_ignore_ascii_case("eap") {
            Self::Eap
        } else {
            Self::Release
        }
    }
}

#[derive(Debug, Clone)]
pub struct Build {
    pub number: BuildNumber,
    pub api_version: BuildNumber,
    pub version: String,
    pub release_date: Option<NaiveDate>,
    pub target: BuildRange,
    pub message: Option<String>,
    pub buttons: Vec<Button>,
    pub patches: Vec<Patch>,
}

impl Build {
    pub fn download_url(&self) -> Option<&str> {
        self.buttons
            .iter()
            .find(|button| button.download)
            .map(|button| button.url.as_str())
    }

    pub fn blog_url(&self) -> Option<&str> {
        self.buttons
            .iter()
            .find(|button| !button.download && button.name.eq_ignore_ascii_case("blog"))
            .map(|button| button.url.as_str())
    }

    pub fn patch_from(&self, from: &BuildNumber, os: TargetOs) -> Option<&Patch> {
        self.patches
            .iter()
            .find(|patch| patch.from == *from && patch.is_available_for(os))
    }
}

#[derive(Debug, Clone)]
pub struct Button {
    pub name: String,
    pub url: String,
    pub download: bool,
}

#[derive(Debug, Clone)]
pub struct Patch {
    pub from: BuildNumber,
    pub size: Option<String>,
    pub exclusions: Vec<TargetOs>,
}

impl Patch {
    pub fn is_available_for(&self, os: TargetOs) -> bool {
        !self.exclusions.contains(&os)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetOs {
    Windows,
    Mac,
    Unix,
}

impl TargetOs {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::Mac
        } else {
            Self::Unix
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_lowercase().as_str() {
            "win" | "windows" => Some(Self::Windows),
            "mac" | "macos" => Some(Self::Mac),
            "unix" | "linux" => Some(Self::Unix),
            _ => None,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::Windows => "win",
            Self::Mac => "mac",
            Self::Unix => "unix",
        }
    }
}
