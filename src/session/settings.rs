//! Generation settings: parsing, clamping, and user feedback
//!
//! Settings arrive as optional form fields on `/chat` and `/generate`.
//! A zero value means "use the server default"; non-zero values are
//! clamped into the supported ranges and every clamp produces a note
//! the UI shows alongside the settings update.

use serde::{Deserialize, Serialize};

/// Minimum accepted step count (for non-default values).
pub const MIN_STEPS: u32 = 1;
/// Maximum accepted step count.
pub const MAX_STEPS: u32 = 100;
/// Maximum accepted guidance scale.
pub const MAX_CFG: f32 = 20.0;
/// Seed value meaning "pick a random seed".
pub const RANDOM_SEED: i64 = -1;

/// Per-session generation parameters.
///
/// Zero-valued fields mean "use server defaults"; a settings message is
/// injected into the LLM context only when at least one field is
/// non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GenerationSettings {
    /// Diffusion steps, 0 = default, otherwise [1, 100]
    pub steps: u32,
    /// Guidance scale, 0.0 = default, otherwise (0.0, 20.0]
    pub cfg: f32,
    /// Seed, -1 = random, 0 = default, positive = fixed
    pub seed: i64,
}

impl GenerationSettings {
    /// True when any field is non-zero (and should reach the model).
    pub fn is_customized(&self) -> bool {
        self.steps != 0 || self.cfg != 0.0 || self.seed != 0
    }

    /// Resolves zero fields against server defaults.
    pub fn effective(&self, default_steps: u32, default_cfg: f32) -> (u32, f32, i64) {
        let steps = if self.steps == 0 {
            default_steps
        } else {
            self.steps
        };
        let cfg = if self.cfg == 0.0 { default_cfg } else { self.cfg };
        (steps, cfg, self.seed)
    }
}

/// Outcome of parsing and clamping form fields.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClampResult {
    /// The accepted settings
    pub settings: GenerationSettings,
    /// User-visible notes, one per adjustment made
    pub notes: Vec<String>,
}

impl ClampResult {
    /// True when any field was adjusted.
    pub fn clamped(&self) -> bool {
        !self.notes.is_empty()
    }
}

/// Parses optional form fields into clamped settings.
///
/// Missing or empty fields stay at their zero ("default") value.
/// Unparseable fields also fall back to zero, with a note. Out-of-range
/// values are clamped, with a note.
pub fn parse_and_clamp(
    steps: Option<&str>,
    cfg: Option<&str>,
    seed: Option<&str>,
) -> ClampResult {
    let mut result = ClampResult::default();

    if let Some(raw) = steps.map(str::trim).filter(|s| !s.is_empty()) {
        match raw.parse::<i64>() {
            Ok(0) => {}
            Ok(value) if value < MIN_STEPS as i64 => {
                result.settings.steps = MIN_STEPS;
                result
                    .notes
                    .push(format!("steps raised to the minimum of {}", MIN_STEPS));
            }
            Ok(value) if value > MAX_STEPS as i64 => {
                result.settings.steps = MAX_STEPS;
                result
                    .notes
                    .push(format!("steps capped at {}", MAX_STEPS));
            }
            Ok(value) => result.settings.steps = value as u32,
            Err(_) => result
                .notes
                .push(format!("ignored unreadable steps value \"{}\"", raw)),
        }
    }

    if let Some(raw) = cfg.map(str::trim).filter(|s| !s.is_empty()) {
        match raw.parse::<f32>() {
            Ok(value) if value == 0.0 => {}
            Ok(value) if !value.is_finite() || value < 0.0 => {
                result
                    .notes
                    .push(format!("ignored out-of-range cfg value \"{}\"", raw));
            }
            Ok(value) if value > MAX_CFG => {
                result.settings.cfg = MAX_CFG;
                result
                    .notes
                    .push(format!("cfg capped at {:.1}", MAX_CFG));
            }
            Ok(value) => result.settings.cfg = value,
            Err(_) => result
                .notes
                .push(format!("ignored unreadable cfg value \"{}\"", raw)),
        }
    }

    if let Some(raw) = seed.map(str::trim).filter(|s| !s.is_empty()) {
        match raw.parse::<i64>() {
            Ok(value) if value < RANDOM_SEED => {
                result.settings.seed = RANDOM_SEED;
                result
                    .notes
                    .push("negative seeds mean random; using -1".to_string());
            }
            Ok(value) => result.settings.seed = value,
            Err(_) => result
                .notes
                .push(format!("ignored unreadable seed value \"{}\"", raw)),
        }
    }

    result
}
