//! Viewer-controlled render parameters and sparse updates.

use serde::{Deserialize, Deserializer};

use super::backend::MAX_TEXTURE_DIMENSION;
use crate::util::{Error, Result};

/// Default tone-mapping key ("middle grey").
pub const DEFAULT_KEY_VALUE: f32 = 0.18;

/// Camera, exposure and budget parameters for one render generation.
///
/// Owned by the session; each tick renders from a copied snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderParameters {
    /// Camera yaw (radians).
    pub theta: f32,
    /// Camera pitch (radians).
    pub phi: f32,
    /// Horizontal pan offset.
    pub move_x: f32,
    /// Vertical pan offset.
    pub move_y: f32,
    /// Tone-mapping exposure key.
    pub key_value: f32,
    /// Target cumulative samples per pixel, 0 = unbounded.
    pub max_spp: u32,
    /// Requested frame size in pixels.
    pub width: u32,
    pub height: u32,
}

impl RenderParameters {
    /// Initial parameters for a session rendering at the given size.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            theta: 0.0,
            phi: 0.0,
            move_x: 0.0,
            move_y: 0.0,
            key_value: DEFAULT_KEY_VALUE,
            max_spp: 0,
            width,
            height,
        }
    }

    /// Finite sample target, if the client set one.
    pub fn target_spp(&self) -> Option<u32> {
        (self.max_spp > 0).then_some(self.max_spp)
    }

    /// Merge the fields present in `update`; absent fields keep their value.
    pub fn merge(&mut self, update: &ParameterUpdate) {
        if let Some(v) = update.theta {
            self.theta = v;
        }
        if let Some(v) = update.phi {
            self.phi = v;
        }
        if let Some(v) = update.move_x {
            self.move_x = v;
        }
        if let Some(v) = update.move_y {
            self.move_y = v;
        }
        if let Some(v) = update.key_value {
            self.key_value = v;
        }
        if let Some(v) = update.max_spp {
            self.max_spp = v;
        }
        if let Some(v) = update.width {
            self.width = v;
        }
        if let Some(v) = update.height {
            self.height = v;
        }
    }
}

/// Sparse parameter update decoded from one client message.
///
/// Unknown keys are ignored; every known key is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterUpdate {
    pub theta: Option<f32>,
    pub phi: Option<f32>,
    pub move_x: Option<f32>,
    pub move_y: Option<f32>,
    pub key_value: Option<f32>,
    #[serde(default, deserialize_with = "lenient_spp")]
    pub max_spp: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl ParameterUpdate {
    /// Decode a JSON object message.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| Error::MalformedMessage(e.to_string()))?;
        if !value.is_object() {
            return Err(Error::MalformedMessage("expected a JSON object".into()));
        }
        let update = Self::deserialize(value)
            .map_err(|e| Error::MalformedMessage(e.to_string()))?;
        update.validate()?;
        Ok(update)
    }

    fn validate(&self) -> Result<()> {
        for v in [self.width, self.height].into_iter().flatten() {
            if v == 0 || v > MAX_TEXTURE_DIMENSION {
                return Err(Error::MalformedMessage(format!(
                    "frame dimension {v} outside 1..={MAX_TEXTURE_DIMENSION}"
                )));
            }
        }
        let floats = [self.theta, self.phi, self.move_x, self.move_y, self.key_value];
        if floats.iter().flatten().any(|v| !v.is_finite()) {
            return Err(Error::MalformedMessage("non-finite parameter".into()));
        }
        Ok(())
    }

    /// Whether the update changes the frame size.
    pub fn resizes(&self) -> bool {
        self.width.is_some() || self.height.is_some()
    }
}

/// `maxSpp` arrives either as a number or as the text of a form field.
fn lenient_spp<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Spp {
        Int(u64),
        Float(f64),
        Text(String),
    }

    let value = Option::<Spp>::deserialize(deserializer)?;
    let spp = match value {
        None => return Ok(None),
        Some(Spp::Int(n)) => n,
        Some(Spp::Float(f)) if f >= 0.0 && f.fract() == 0.0 => f as u64,
        Some(Spp::Float(f)) => return Err(D::Error::custom(format!("invalid maxSpp {f}"))),
        Some(Spp::Text(s)) if s.trim().is_empty() => 0,
        Some(Spp::Text(s)) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| D::Error::custom(format!("invalid maxSpp {s:?}")))?,
    };
    u32::try_from(spp)
        .map(Some)
        .map_err(|_| D::Error::custom("maxSpp out of range"))
}
