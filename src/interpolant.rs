//! Interpolation kernels used to turn a discrete PSF grid into a continuous
//! profile.
//!
//! Kernels are named the way they appear in configuration files:
//! `Nearest`, `Linear`, `Cubic`, `Lanczos(n)`.

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::PsfError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolant {
    Nearest,
    Linear,
    /// Keys cubic convolution kernel (a = -0.5)
    Cubic,
    /// Lanczos kernel of order n, support [-n, n]
    Lanczos(u32),
}

impl Default for Interpolant {
    fn default() -> Self {
        Interpolant::Lanczos(7)
    }
}

fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-12 {
        1.0
    } else {
        let px = PI * x;
        px.sin() / px
    }
}

impl Interpolant {
    /// Kernel value at offset `x` (in grid units).
    pub fn xval(&self, x: f64) -> f64 {
        let ax = x.abs();
        match *self {
            Interpolant::Nearest => {
                if ax < 0.5 {
                    1.0
                } else if ax == 0.5 {
                    0.5
                } else {
                    0.0
                }
            }
            Interpolant::Linear => {
                if ax < 1.0 {
                    1.0 - ax
                } else {
                    0.0
                }
            }
            Interpolant::Cubic => {
                let a = -0.5;
                if ax <= 1.0 {
                    ((a + 2.0) * ax - (a + 3.0)) * ax * ax + 1.0
                } else if ax < 2.0 {
                    ((a * ax - 5.0 * a) * ax + 8.0 * a) * ax - 4.0 * a
                } else {
                    0.0
                }
            }
            Interpolant::Lanczos(n) => {
                let n = n as f64;
                if ax < n {
                    sinc(x) * sinc(x / n)
                } else {
                    0.0
                }
            }
        }
    }

    /// Half-width of the kernel support in grid units.
    pub fn xrange(&self) -> f64 {
        match *self {
            Interpolant::Nearest => 0.5,
            Interpolant::Linear => 1.0,
            Interpolant::Cubic => 2.0,
            Interpolant::Lanczos(n) => n as f64,
        }
    }
}

impl fmt::Display for Interpolant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interpolant::Nearest => write!(f, "Nearest"),
            Interpolant::Linear => write!(f, "Linear"),
            Interpolant::Cubic => write!(f, "Cubic"),
            Interpolant::Lanczos(n) => write!(f, "Lanczos({})", n),
        }
    }
}

impl FromStr for Interpolant {
    type Err = PsfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let re = Regex::new(r"^\s*([A-Za-z]+)\s*(?:\(\s*(\d+)\s*\))?\s*$")
            .map_err(|e| PsfError::Config(e.to_string()))?;
        let caps = re
            .captures(s)
            .ok_or_else(|| PsfError::Config(format!("Unknown interpolant: {}", s)))?;
        let name = caps[1].to_lowercase();
        let order = caps.get(2).map(|m| m.as_str().parse::<u32>());

        match (name.as_str(), order) {
            ("nearest", None) => Ok(Interpolant::Nearest),
            ("linear", None) => Ok(Interpolant::Linear),
            ("cubic", None) => Ok(Interpolant::Cubic),
            ("lanczos", None) => Ok(Interpolant::Lanczos(3)),
            ("lanczos", Some(Ok(n))) if n > 0 => Ok(Interpolant::Lanczos(n)),
            _ => Err(PsfError::Config(format!("Unknown interpolant: {}", s))),
        }
    }
}

impl Serialize for Interpolant {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Interpolant {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_interpolants() {
        assert_eq!("Lanczos(7)".parse::<Interpolant>().unwrap(), Interpolant::Lanczos(7));
        assert_eq!(" lanczos( 5 ) ".parse::<Interpolant>().unwrap(), Interpolant::Lanczos(5));
        assert_eq!("Linear".parse::<Interpolant>().unwrap(), Interpolant::Linear);
        assert_eq!("Cubic".parse::<Interpolant>().unwrap(), Interpolant::Cubic);
        assert!("Lanczos(0)".parse::<Interpolant>().is_err());
        assert!("Quintic(2)".parse::<Interpolant>().is_err());
    }

    #[test]
    fn test_display_round_trips() {
        for interp in [
            Interpolant::Nearest,
            Interpolant::Linear,
            Interpolant::Cubic,
            Interpolant::Lanczos(4),
        ] {
            assert_eq!(interp.to_string().parse::<Interpolant>().unwrap(), interp);
        }
    }

    #[test]
    fn test_kernels_interpolate_at_integers() {
        for interp in [Interpolant::Linear, Interpolant::Cubic, Interpolant::Lanczos(3)] {
            assert!((interp.xval(0.0) - 1.0).abs() < 1e-12, "{}", interp);
            for k in 1..4 {
                assert!(interp.xval(k as f64).abs() < 1e-12, "{} at {}", interp, k);
                assert!(interp.xval(-(k as f64)).abs() < 1e-12, "{} at -{}", interp, k);
            }
            assert_eq!(interp.xval(interp.xrange() + 0.1), 0.0);
        }
    }

    #[test]
    fn test_linear_partition_of_unity() {
        let interp = Interpolant::Linear;
        let x = 0.3;
        let total: f64 = (-2..=2).map(|k| interp.xval(x - k as f64)).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }
}
