use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The closed set of platforms the engine knows how to apply on.
///
/// Anything the router cannot place lands on `Unknown`, which is served by
/// the generic best-effort strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformId {
    Greenhouse,
    Lever,
    Ashby,
    #[serde(rename = "linkedin")]
    LinkedIn,
    Indeed,
    Workday,
    Taleo,
    Unknown,
}

/// How a platform's application flow is reached, which drives scheduling order
/// and the time budget of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Form reachable straight from the job URL.
    DirectApply,
    /// In-platform search/click sequence before the form.
    NativeFlow,
    /// Several sequential form pages, often iframe-embedded.
    ComplexMultiStep,
}

impl PlatformId {
    pub const ALL: [PlatformId; 8] = [
        PlatformId::Greenhouse,
        PlatformId::Lever,
        PlatformId::Ashby,
        PlatformId::LinkedIn,
        PlatformId::Indeed,
        PlatformId::Workday,
        PlatformId::Taleo,
        PlatformId::Unknown,
    ];

    pub fn category(self) -> Category {
        match self {
            PlatformId::Greenhouse | PlatformId::Lever | PlatformId::Ashby => Category::DirectApply,
            PlatformId::LinkedIn | PlatformId::Indeed => Category::NativeFlow,
            PlatformId::Workday | PlatformId::Taleo | PlatformId::Unknown => {
                Category::ComplexMultiStep
            }
        }
    }

    /// Dispatch priority within the whole campaign. Lower runs first.
    pub fn priority(self) -> u32 {
        match self {
            PlatformId::Greenhouse => 1,
            PlatformId::Lever => 2,
            PlatformId::Ashby => 3,
            PlatformId::Indeed => 10,
            PlatformId::LinkedIn => 11,
            PlatformId::Workday => 20,
            PlatformId::Taleo => 21,
            PlatformId::Unknown => 99,
        }
    }

    /// Maximum number of advance/review transitions before an attempt is
    /// failed with "step limit exceeded".
    pub fn max_steps(self) -> u32 {
        match self.category() {
            Category::DirectApply => 3,
            Category::NativeFlow => 10,
            Category::ComplexMultiStep => 15,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlatformId::Greenhouse => "greenhouse",
            PlatformId::Lever => "lever",
            PlatformId::Ashby => "ashby",
            PlatformId::LinkedIn => "linkedin",
            PlatformId::Indeed => "indeed",
            PlatformId::Workday => "workday",
            PlatformId::Taleo => "taleo",
            PlatformId::Unknown => "unknown",
        }
    }
}

impl Category {
    /// Scheduling rank: direct-apply before native-flow before complex forms.
    pub fn rank(self) -> u8 {
        match self {
            Category::DirectApply => 0,
            Category::NativeFlow => 1,
            Category::ComplexMultiStep => 2,
        }
    }

    /// Wall-clock budget for one attempt of this category.
    pub fn timeout_budget(self) -> Duration {
        match self {
            Category::DirectApply => Duration::from_secs(90),
            Category::NativeFlow => Duration::from_secs(180),
            Category::ComplexMultiStep => Duration::from_secs(300),
        }
    }
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::DirectApply => write!(f, "DIRECT_APPLY"),
            Category::NativeFlow => write!(f, "NATIVE_FLOW"),
            Category::ComplexMultiStep => write!(f, "COMPLEX_MULTI_STEP"),
        }
    }
}

impl FromStr for PlatformId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        PlatformId::ALL
            .into_iter()
            .find(|p| p.as_str() == lower)
            .ok_or_else(|| format!("unknown platform '{s}'"))
    }
}
