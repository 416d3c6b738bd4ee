use std::collections::HashSet;

use bevy::prelude::*;


/// Message kinds reported with the one-shot policy. Each kind logs once until
/// the condition that raised it goes away and [`OnceLog::clear`] is called.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    PartialEq,
)]
pub enum LogKind {
    MissingAttribute(SplatAttribute),
    InvalidShOrder,
    TextureAllocation,
    DrawFailure,
    MissingCamera,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    PartialEq,
)]
pub enum SplatAttribute {
    Color,
    Opacity,
    Scale,
    Orientation,
}

impl SplatAttribute {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Color => "Cd",
            Self::Opacity => "opacity",
            Self::Scale => "scale",
            Self::Orientation => "orient",
        }
    }
}


#[derive(Debug, Default)]
pub struct OnceLog {
    logged: HashSet<LogKind>,
}

impl OnceLog {
    /// Returns true when the message was emitted.
    pub fn warn(&mut self, kind: LogKind, message: &str) -> bool {
        if !self.logged.insert(kind) {
            return false;
        }

        warn!(?kind, "{message}");
        true
    }

    pub fn clear(&mut self, kind: LogKind) {
        self.logged.remove(&kind);
    }

    pub fn is_logged(&self, kind: LogKind) -> bool {
        self.logged.contains(&kind)
    }
}
