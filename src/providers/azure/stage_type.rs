use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PipeLensError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageType {
    Tests,
    Build,
    Deploy,
    Security,
    Other,
}

// Checked in order; the first keyword found in the lowercased name wins.
const KEYWORDS: [(&str, StageType); 4] = [
    ("test", StageType::Tests),
    ("build", StageType::Build),
    ("deploy", StageType::Deploy),
    ("secure", StageType::Security),
];

impl StageType {
    pub fn classify(stage_name: &str) -> Self {
        let lower = stage_name.to_lowercase();
        KEYWORDS
            .iter()
            .find(|(keyword, _)| lower.contains(keyword))
            .map_or(Self::Other, |&(_, stage_type)| stage_type)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tests => "tests",
            Self::Build => "build",
            Self::Deploy => "deploy",
            Self::Security => "security",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for StageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageType {
    type Err = PipeLensError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tests" | "test" => Ok(Self::Tests),
            "build" => Ok(Self::Build),
            "deploy" => Ok(Self::Deploy),
            "security" => Ok(Self::Security),
            "other" => Ok(Self::Other),
            other => Err(PipeLensError::Config(format!(
                "Unknown stage type '{other}' (expected tests, build, deploy, security or other)"
            ))),
        }
    }
}
