use serde::{Deserialize, Serialize};
use validator::Validate;

/// SoC band over which a sheddable tier ramps from fully served to fully shed.
///
/// Bounds are fractions of battery capacity. Above `upper` the tier may draw its
/// full load; between the bounds its ceiling falls linearly; below `lower` it is shed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Validate)]
pub struct SocBand {
    #[validate(range(min = 0.0, max = 1.0))]
    pub lower: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub upper: f64,
}

impl SocBand {
    pub const MEDIUM_DEFAULT: SocBand = SocBand {
        lower: 0.65,
        upper: 0.75,
    };
    pub const LOW_DEFAULT: SocBand = SocBand {
        lower: 0.70,
        upper: 0.80,
    };

    /// Absolute ramp line for a given capacity (kWh) and tier max load (kW)
    pub fn ramp(&self, capacity_kwh: f64, max_load_kw: f64) -> Ramp {
        let lower_kwh = self.lower * capacity_kwh;
        let upper_kwh = self.upper * capacity_kwh;
        let slope = max_load_kw / (upper_kwh - lower_kwh);
        Ramp {
            lower_kwh,
            upper_kwh,
            slope,
            intercept: -slope * lower_kwh,
        }
    }
}

/// `power <= slope * soc + intercept`, valid between `lower_kwh` and `upper_kwh`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ramp {
    pub lower_kwh: f64,
    pub upper_kwh: f64,
    pub slope: f64,
    pub intercept: f64,
}

impl Ramp {
    pub fn ceiling_at(&self, soc_kwh: f64) -> f64 {
        self.slope * soc_kwh + self.intercept
    }
}

/// How lower tiers are kept behind higher ones
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PriorityOrdering {
    /// `P_low <= P_medium` in kW
    Absolute,
    /// `P_low / max_low <= P_medium / max_medium`: the lower tier never receives a
    /// larger share of its own max load than the tier above it.
    /// Select `absolute` to compare raw kW instead.
    #[default]
    Normalized,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_band_ramps() {
        let ramp = SocBand::MEDIUM_DEFAULT.ramp(100.0, 2.0);
        assert!((ramp.slope - 0.2).abs() < 1e-12);
        assert!((ramp.intercept + 13.0).abs() < 1e-9);
        assert!(ramp.ceiling_at(65.0).abs() < 1e-9);
        assert!((ramp.ceiling_at(75.0) - 2.0).abs() < 1e-9);

        let ramp = SocBand::LOW_DEFAULT.ramp(100.0, 3.0);
        assert!((ramp.slope - 0.3).abs() < 1e-12);
        assert!((ramp.intercept + 21.0).abs() < 1e-9);
    }
}
