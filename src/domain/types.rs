use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::error::{ControlError, ControlResult};

/// Priority class of loads.
///
/// Variants are declared from most to least important; the derived `Ord` follows
/// that order, so iterating a `BTreeMap<LoadTier, _>` visits critical first.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LoadTier {
    Critical,
    Medium,
    Low,
}

impl LoadTier {
    /// Tiers the optimizer may throttle or shed, most important first.
    pub const SHEDDABLE: [LoadTier; 2] = [LoadTier::Medium, LoadTier::Low];

    /// Map a device priority level onto a tier.
    ///
    /// Levels 0 and 1 are critical, 2 is medium, anything higher is low.
    pub fn from_priority(level: u8) -> Self {
        match level {
            0 | 1 => LoadTier::Critical,
            2 => LoadTier::Medium,
            _ => LoadTier::Low,
        }
    }

    pub fn is_sheddable(self) -> bool {
        !matches!(self, LoadTier::Critical)
    }
}

/// Strategy that issued a device command
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum StrategyKind {
    #[serde(rename = "direct")]
    #[strum(to_string = "direct")]
    Direct,
    #[serde(rename = "increment")]
    #[strum(to_string = "increment", serialize = "incremental")]
    Incremental,
    #[serde(rename = "shed")]
    #[strum(to_string = "shed", serialize = "shedding")]
    Shed,
    #[serde(rename = "lpc")]
    #[strum(to_string = "lpc", serialize = "load_priority")]
    LoadPriority,
}

impl StrategyKind {
    /// Parse an operator-supplied kind, rejecting anything unsupported.
    pub fn parse(kind: &str) -> ControlResult<Self> {
        kind.trim()
            .parse()
            .map_err(|_| ControlError::UnknownStrategyKind(kind.to_string()))
    }
}
