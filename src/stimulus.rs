//! Stimulus types and request validation.
//!
//! Validation happens entirely locally; a request that fails here never
//! reaches the network.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

/// Intensity used when a request doesn't specify one.
pub const DEFAULT_INTENSITY: u32 = 127;

/// Pattern sent when a pattern request has no elements.
pub const DEFAULT_PATTERN: &str = "beep-vibrate";

/// Valid intensities for regular stimuli.
pub const INTENSITY_RANGE: RangeInclusive<u32> = 1..=255;

/// Valid tones for the legacy beep call.
pub const BEEP_TONE_RANGE: RangeInclusive<u32> = 1..=4;

/// A stimulus call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stimulus {
    Beep,
    /// Legacy beep where the intensity selects one of four tones
    BeepTone,
    Vibration,
    Shock,
    Pattern,
}

impl Stimulus {
    /// Route segment under `/api/v1/stimuli/`.
    pub fn route(&self) -> &'static str {
        match self {
            Stimulus::Beep | Stimulus::BeepTone => "beep",
            Stimulus::Vibration => "vibration",
            Stimulus::Shock => "shock",
            Stimulus::Pattern => "pattern",
        }
    }

    pub fn intensity_range(&self) -> RangeInclusive<u32> {
        match self {
            Stimulus::BeepTone => BEEP_TONE_RANGE,
            _ => INTENSITY_RANGE,
        }
    }
}

impl fmt::Display for Stimulus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.route())
    }
}

/// One element of a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StimulusKind {
    Beep,
    Vibrate,
    Shock,
}

impl StimulusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StimulusKind::Beep => "beep",
            StimulusKind::Vibrate => "vibrate",
            StimulusKind::Shock => "shock",
        }
    }
}

impl FromStr for StimulusKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "beep" => Ok(StimulusKind::Beep),
            "vibrate" => Ok(StimulusKind::Vibrate),
            // "zap" is the legacy name for shock
            "shock" | "zap" => Ok(StimulusKind::Shock),
            other => Err(ValidationError::UnknownPatternStimulus(other.to_string())),
        }
    }
}

impl fmt::Display for StimulusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Join pattern elements into the route form, e.g. `beep-shock-vibrate`.
///
/// An empty pattern becomes [`DEFAULT_PATTERN`].
pub fn pattern_route<S: AsRef<str>>(names: &[S]) -> Result<String, ValidationError> {
    if names.is_empty() {
        return Ok(DEFAULT_PATTERN.to_string());
    }
    let kinds = names
        .iter()
        .map(|name| name.as_ref().parse::<StimulusKind>())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(kinds
        .iter()
        .map(StimulusKind::as_str)
        .collect::<Vec<_>>()
        .join("-"))
}

/// Parameters of a single stimulus call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StimulusRequest {
    pub intensity: u32,
    /// Reason sent with the stimulus; the client's default message if `None`
    pub message: Option<String>,
    /// Pattern repetitions
    pub count: u32,
    /// Pattern element names (`beep`, `vibrate`, `shock` or `zap`)
    pub pattern: Vec<String>,
    /// Use this token instead of the client's stored one
    pub token: Option<String>,
}

impl Default for StimulusRequest {
    fn default() -> Self {
        Self {
            intensity: DEFAULT_INTENSITY,
            message: None,
            count: 1,
            pattern: Vec::new(),
            token: None,
        }
    }
}

impl StimulusRequest {
    pub fn new(intensity: u32) -> Self {
        Self {
            intensity,
            ..Self::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn with_pattern<I, S>(mut self, pattern: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pattern = pattern.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Check intensity, pattern and count, in that order, and build the
    /// API path for `stimulus`.
    pub fn stimulus_path(&self, stimulus: Stimulus) -> Result<String, ValidationError> {
        let range = stimulus.intensity_range();
        if !range.contains(&self.intensity) {
            return Err(ValidationError::IntensityOutOfRange {
                intensity: self.intensity,
                min: *range.start(),
                max: *range.end(),
            });
        }

        if stimulus != Stimulus::Pattern {
            return Ok(format!(
                "/api/v1/stimuli/{}/{}",
                stimulus.route(),
                self.intensity
            ));
        }

        let pattern = pattern_route(&self.pattern)?;
        if self.count < 1 {
            return Err(ValidationError::CountTooLow(self.count));
        }
        Ok(format!(
            "/api/v1/stimuli/pattern/{pattern}/{}/{}",
            self.intensity, self.count
        ))
    }
}

/// A request rejected before reaching the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    IntensityOutOfRange { intensity: u32, min: u32, max: u32 },
    UnknownPatternStimulus(String),
    CountTooLow(u32),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::IntensityOutOfRange { min, max, .. } => {
                write!(f, "Intensity must be between {min}-{max}!")
            }
            ValidationError::UnknownPatternStimulus(name) => {
                write!(f, "Invalid pattern stimuli type of: {name}")
            }
            ValidationError::CountTooLow(_) => {
                write!(f, "Count must be greater than or equal to 1!")
            }
        }
    }
}

impl std::error::Error for ValidationError {}
