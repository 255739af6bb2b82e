//! Runtime parameters.
//!
//! Readers take a consistent snapshot with [`ParamStore::snapshot`]; writers
//! validate every entry of an update before anything is applied, then notify
//! subscribers of each value that actually changed.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::capture::Resolution;
use crate::color_area::Color;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamName {
    CenterX,
    CenterY,
    ColorR,
    ColorG,
    ColorB,
    MarkerWidth,
    MarkerHeight,
    MarkerShape,
    Tolerance,
    Port,
    Width,
    Height,
}

impl ParamName {
    pub const ALL: [ParamName; 12] = [
        ParamName::CenterX,
        ParamName::CenterY,
        ParamName::ColorR,
        ParamName::ColorG,
        ParamName::ColorB,
        ParamName::MarkerWidth,
        ParamName::MarkerHeight,
        ParamName::MarkerShape,
        ParamName::Tolerance,
        ParamName::Port,
        ParamName::Width,
        ParamName::Height,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ParamName::CenterX => "CenterX",
            ParamName::CenterY => "CenterY",
            ParamName::ColorR => "ColorR",
            ParamName::ColorG => "ColorG",
            ParamName::ColorB => "ColorB",
            ParamName::MarkerWidth => "MarkerWidth",
            ParamName::MarkerHeight => "MarkerHeight",
            ParamName::MarkerShape => "MarkerShape",
            ParamName::Tolerance => "Tolerance",
            ParamName::Port => "Port",
            ParamName::Width => "Width",
            ParamName::Height => "Height",
        }
    }

    /// Reported by the application, not settable from outside.
    pub fn is_read_only(self) -> bool {
        matches!(self, ParamName::Width | ParamName::Height)
    }

    /// Changes that require the color evaluator to be rebuilt.
    pub fn affects_evaluator(self) -> bool {
        !matches!(self, ParamName::Port | ParamName::Width | ParamName::Height)
    }

    fn range(self) -> (f64, f64, bool) {
        // (min, max, integral)
        match self {
            ParamName::ColorR | ParamName::ColorG | ParamName::ColorB => (0.0, 255.0, false),
            ParamName::Tolerance => (0.0, 255.0, true),
            ParamName::MarkerShape => (0.0, 1.0, true),
            ParamName::Port => (1024.0, 65535.0, true),
            _ => (0.0, 65535.0, true),
        }
    }
}

impl fmt::Display for ParamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParamName {
    type Err = ParamError;

    /// Accepts plain (`CenterX`) and qualified (`root.ColorChecker.CenterX`) names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let short = s.rsplit('.').next().unwrap_or(s);
        ParamName::ALL
            .into_iter()
            .find(|name| name.as_str().eq_ignore_ascii_case(short))
            .ok_or_else(|| ParamError::Unknown(s.to_string()))
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ParamError {
    #[error("unknown parameter `{0}`")]
    Unknown(String),
    #[error("parameter {0} is read-only")]
    ReadOnly(ParamName),
    #[error("value {value} for {name} is outside {min}..={max}")]
    OutOfRange {
        name: ParamName,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("parameter {name} expects an integer, got {value}")]
    NotAnInteger { name: ParamName, value: f64 },
    #[error("invalid value `{value}` for {name}")]
    Malformed { name: String, value: String },
}

/// Current values of every runtime parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all(serialize = "PascalCase"))]
pub struct Params {
    pub center_x: u32,
    pub center_y: u32,
    pub color_r: f64,
    pub color_g: f64,
    pub color_b: f64,
    pub marker_width: u32,
    pub marker_height: u32,
    /// 0 = ellipse, 1 = rectangle.
    pub marker_shape: u32,
    pub tolerance: u8,
    pub port: u16,
    pub width: u32,
    pub height: u32,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            center_x: 320,
            center_y: 240,
            color_r: 0.0,
            color_g: 0.0,
            color_b: 0.0,
            marker_width: 100,
            marker_height: 100,
            marker_shape: 0,
            tolerance: 30,
            port: 4840,
            width: 0,
            height: 0,
        }
    }
}

impl Params {
    pub fn color(&self) -> Color {
        Color::new(self.color_r, self.color_g, self.color_b)
    }

    pub fn get(&self, name: ParamName) -> f64 {
        match name {
            ParamName::CenterX => f64::from(self.center_x),
            ParamName::CenterY => f64::from(self.center_y),
            ParamName::ColorR => self.color_r,
            ParamName::ColorG => self.color_g,
            ParamName::ColorB => self.color_b,
            ParamName::MarkerWidth => f64::from(self.marker_width),
            ParamName::MarkerHeight => f64::from(self.marker_height),
            ParamName::MarkerShape => f64::from(self.marker_shape),
            ParamName::Tolerance => f64::from(self.tolerance),
            ParamName::Port => f64::from(self.port),
            ParamName::Width => f64::from(self.width),
            ParamName::Height => f64::from(self.height),
        }
    }

    // Callers validate first; the casts below cannot truncate.
    fn set(&mut self, name: ParamName, value: f64) {
        match name {
            ParamName::CenterX => self.center_x = value as u32,
            ParamName::CenterY => self.center_y = value as u32,
            ParamName::ColorR => self.color_r = value,
            ParamName::ColorG => self.color_g = value,
            ParamName::ColorB => self.color_b = value,
            ParamName::MarkerWidth => self.marker_width = value as u32,
            ParamName::MarkerHeight => self.marker_height = value as u32,
            ParamName::MarkerShape => self.marker_shape = value as u32,
            ParamName::Tolerance => self.tolerance = value as u8,
            ParamName::Port => self.port = value as u16,
            ParamName::Width => self.width = value as u32,
            ParamName::Height => self.height = value as u32,
        }
    }
}

/// Check a value against the parameter's range and kind.
pub fn validate(name: ParamName, value: f64) -> Result<f64, ParamError> {
    let (min, max, integral) = name.range();
    if !value.is_finite() || value < min || value > max {
        return Err(ParamError::OutOfRange {
            name,
            value,
            min,
            max,
        });
    }
    if integral && value.fract() != 0.0 {
        return Err(ParamError::NotAnInteger { name, value });
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamChange {
    pub name: ParamName,
    pub value: f64,
}

pub struct ParamStore {
    current: ArcSwap<Params>,
    subscribers: Mutex<Vec<flume::Sender<ParamChange>>>,
}

impl ParamStore {
    pub fn new(initial: Params) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn snapshot(&self) -> Arc<Params> {
        self.current.load_full()
    }

    pub fn get(&self, name: ParamName) -> f64 {
        self.current.load().get(name)
    }

    /// Receive every future change. Dropped receivers are pruned lazily.
    pub fn subscribe(&self) -> flume::Receiver<ParamChange> {
        let (tx, rx) = flume::unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Validate a batch of externally supplied values, then apply all of them.
    ///
    /// Nothing is applied if any entry is rejected. Returns the changes that
    /// altered a value.
    pub fn update<'a, I>(&self, updates: I) -> Result<Vec<ParamChange>, ParamError>
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let mut validated = Vec::new();
        for (raw, value) in updates {
            let name: ParamName = raw.parse()?;
            if name.is_read_only() {
                return Err(ParamError::ReadOnly(name));
            }
            validated.push((name, validate(name, value)?));
        }
        Ok(self.apply(&validated))
    }

    /// Like [`update`](Self::update) for a single textual value.
    pub fn set_str(&self, name: &str, value: &str) -> Result<Vec<ParamChange>, ParamError> {
        let parsed: f64 = value.trim().parse().map_err(|_| ParamError::Malformed {
            name: name.to_string(),
            value: value.to_string(),
        })?;
        self.update([(name, parsed)])
    }

    /// Store the chosen stream size in the read-only `Width`/`Height`.
    pub fn report_resolution(&self, resolution: Resolution) {
        info!("Reporting stream resolution {}", resolution);
        self.apply(&[
            (ParamName::Width, f64::from(resolution.width)),
            (ParamName::Height, f64::from(resolution.height)),
        ]);
    }

    /// Adopt a picked reference color.
    ///
    /// Subscribers are not notified; the picker already rebuilt its state.
    pub fn record_picked_color(&self, color: Color) {
        self.current.rcu(|current| {
            let mut next = Params::clone(current);
            next.color_r = color.r;
            next.color_g = color.g;
            next.color_b = color.b;
            next
        });
        info!("New reference color (R, G, B) = {}", color);
    }

    fn apply(&self, validated: &[(ParamName, f64)]) -> Vec<ParamChange> {
        let mut changes = Vec::new();
        self.current.rcu(|current| {
            changes.clear();
            let mut next = Params::clone(current);
            for &(name, value) in validated {
                if next.get(name) != value {
                    next.set(name, value);
                    changes.push(ParamChange { name, value });
                }
            }
            next
        });

        if !changes.is_empty() {
            let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            for change in &changes {
                debug!("Parameter {} changed to {}", change.name, change.value);
                subscribers.retain(|tx| tx.send(*change).is_ok());
            }
        }
        changes
    }
}

impl Default for ParamStore {
    fn default() -> Self {
        Self::new(Params::default())
    }
}
