//! Titer measurements on the log2 scale used for distance arithmetic.
//!
//! A titer records the cross-reactivity between one antigen and one serum.
//! Besides exact ("regular") measurements, serological assays produce
//! thresholded values (`<10`, `>1280`), ambiguous readings (`~40`) and cells
//! that were never measured (`*`). Only regular and less-than titers (and,
//! by policy, dodgy ones) participate in distance construction; the rest are
//! carried through the data model so tables round-trip faithfully.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// A single antigen-serum measurement. Immutable value type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Titer {
    /// Exact measurement, e.g. `40`
    Regular(f64),
    /// Below the assay detection limit, e.g. `<10`
    LessThan(f64),
    /// Above the assay saturation limit, e.g. `>1280`
    MoreThan(f64),
    /// Ambiguous reading, e.g. `~40`; treated as regular only by policy
    Dodgy(f64),
    /// Not measured (`*`)
    DontCare,
    /// Unparseable or structurally invalid cell
    Invalid,
}

impl Titer {
    /// Raw numeric value; `NaN` for don't-care and invalid titers.
    pub fn value(&self) -> f64 {
        match self {
            Titer::Regular(v) | Titer::LessThan(v) | Titer::MoreThan(v) | Titer::Dodgy(v) => *v,
            Titer::DontCare | Titer::Invalid => f64::NAN,
        }
    }

    /// Value on the log2 scale relative to a base titer of 10, i.e.
    /// `log2(value / 10)`. A titer of 10 maps to 0.0, 40 to 2.0.
    pub fn logged(&self) -> f64 {
        (self.value() / 10.0).log2()
    }

    /// Whether this titer carries a usable numeric value.
    pub fn is_set(&self) -> bool {
        !matches!(self, Titer::DontCare | Titer::Invalid)
    }

    pub fn is_regular(&self) -> bool {
        matches!(self, Titer::Regular(_))
    }

    pub fn is_less_than(&self) -> bool {
        matches!(self, Titer::LessThan(_))
    }

    pub fn is_dodgy(&self) -> bool {
        matches!(self, Titer::Dodgy(_))
    }
}

impl From<&str> for Titer {
    /// Lenient parsing: unrecognized text becomes [`Titer::Invalid`] rather
    /// than an error, because invalid cells are a modeled state of real
    /// tables, not a failure of this crate.
    fn from(source: &str) -> Self {
        let trimmed = source.trim();
        match trimmed {
            "" | "*" => return Titer::DontCare,
            _ => {}
        }
        let (constructor, rest): (fn(f64) -> Titer, &str) =
            if let Some(rest) = trimmed.strip_prefix('<') {
                (Titer::LessThan, rest)
            } else if let Some(rest) = trimmed.strip_prefix('>') {
                (Titer::MoreThan, rest)
            } else if let Some(rest) = trimmed.strip_prefix('~') {
                (Titer::Dodgy, rest)
            } else {
                (Titer::Regular, trimmed)
            };
        match rest.parse::<f64>() {
            Ok(value) if value > 0.0 => constructor(value),
            _ => Titer::Invalid,
        }
    }
}

impl FromStr for Titer {
    type Err = Infallible;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(source))
    }
}

impl fmt::Display for Titer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Titer::Regular(v) => write!(f, "{v}"),
            Titer::LessThan(v) => write!(f, "<{v}"),
            Titer::MoreThan(v) => write!(f, ">{v}"),
            Titer::Dodgy(v) => write!(f, "~{v}"),
            Titer::DontCare => write!(f, "*"),
            Titer::Invalid => write!(f, "?"),
        }
    }
}
