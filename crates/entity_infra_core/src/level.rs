//! The cumulative permission scale.
//!
//! Holding a level implies every level below it, so checks are a single
//! `>=` comparison.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Value reported when a principal has no grant of any kind.
pub const NO_ACCESS: i16 = -1;

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
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[repr(u8)]
pub enum PermissionLevel {
    View = 0,
    Comment = 1,
    Contribute = 2,
    Edit = 3,
    Share = 4,
    Delete = 5,
    Create = 6,
    Owner = 7,
}

impl PermissionLevel {
    pub const MAX: PermissionLevel = PermissionLevel::Owner;

    pub fn value(self) -> i16 {
        self as i16
    }

    pub fn from_value(value: i16) -> Option<Self> {
        Some(match value {
            0 => Self::View,
            1 => Self::Comment,
            2 => Self::Contribute,
            3 => Self::Edit,
            4 => Self::Share,
            5 => Self::Delete,
            6 => Self::Create,
            7 => Self::Owner,
            _ => return None,
        })
    }

    /// Parses either the numeric form ("3") or the name ("EDIT", "edit").
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        match raw.parse::<i16>() {
            Ok(value) => Self::from_value(value),
            Err(_) => raw.parse().ok(),
        }
    }

    pub fn satisfies(self, required: PermissionLevel) -> bool {
        self >= required
    }
}

/// Numeric form of an effective level, `-1` when absent.
pub fn level_value(level: Option<PermissionLevel>) -> i16 {
    level.map_or(NO_ACCESS, PermissionLevel::value)
}
