//! Battery telemetry normalization.
//! Converts raw readings (percentage, half-percentage, voltage, millivolt,
//! enum state) into a 0-100% value using chemistry discharge curves.

use crate::error::{Result, TuyaZigError};
use log::warn;
use std::sync::LazyLock;

/// Battery chemistry families with known discharge behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BatteryChemistry {
    /// Li-MnO2 coin cell, 220 mAh class (buttons, small sensors)
    #[default]
    Cr2032,
    /// Li-MnO2 coin cell, 620 mAh class (motion sensors)
    Cr2450,
    /// Zn-MnO2 primary cell, 1.5 V nominal (AA/AAA)
    Alkaline,
    /// Li-MnO2 photo cell, 3.0 V nominal (CR123A class)
    LithiumPrimary,
    /// Rechargeable Li-ion, 3.7 V nominal
    LiIon,
    /// Rechargeable Li-polymer, 3.7 V nominal
    LiPo,
    /// Rechargeable LiFePO4, 3.2 V nominal, flat plateau
    LiFePo4,
    /// Rechargeable NiMH, 1.2 V nominal
    NiMh,
    /// Unrecognized pack; falls back to the coin-cell curve
    Unknown,
}

impl BatteryChemistry {
    pub fn name(&self) -> &'static str {
        match self {
            BatteryChemistry::Cr2032 => "CR2032",
            BatteryChemistry::Cr2450 => "CR2450",
            BatteryChemistry::Alkaline => "Alkaline",
            BatteryChemistry::LithiumPrimary => "Lithium primary",
            BatteryChemistry::LiIon => "Li-ion",
            BatteryChemistry::LiPo => "Li-polymer",
            BatteryChemistry::LiFePo4 => "LiFePO4",
            BatteryChemistry::NiMh => "NiMH",
            BatteryChemistry::Unknown => "Unknown",
        }
    }

    /// The empirical discharge curve for this chemistry.
    pub fn curve(&self) -> &'static DischargeCurve {
        let curves = &*CURVES;
        match self {
            BatteryChemistry::Cr2032 | BatteryChemistry::Unknown => &curves.cr2032,
            BatteryChemistry::Cr2450 => &curves.cr2450,
            BatteryChemistry::Alkaline => &curves.alkaline,
            BatteryChemistry::LithiumPrimary => &curves.lithium_primary,
            BatteryChemistry::LiIon => &curves.li_ion,
            BatteryChemistry::LiPo => &curves.li_po,
            BatteryChemistry::LiFePo4 => &curves.life_po4,
            BatteryChemistry::NiMh => &curves.nimh,
        }
    }
}

/// Ordered voltage-to-percentage control points, strictly descending by
/// voltage.
#[derive(Debug, Clone)]
pub struct DischargeCurve {
    points: Vec<(f64, u8)>,
}

impl DischargeCurve {
    /// Build a curve, enforcing the structural invariants: at least two
    /// points, strictly descending voltage, non-increasing percentage.
    pub fn new(name: &'static str, points: Vec<(f64, u8)>) -> Result<Self> {
        if points.len() < 2 {
            return Err(TuyaZigError::InvalidCurve(name, "fewer than 2 points".into()));
        }
        for pair in points.windows(2) {
            if pair[1].0 >= pair[0].0 {
                return Err(TuyaZigError::InvalidCurve(
                    name,
                    format!("voltage not strictly descending at {:.2}V", pair[1].0),
                ));
            }
            if pair[1].1 > pair[0].1 {
                return Err(TuyaZigError::InvalidCurve(
                    name,
                    format!("percentage increases below {:.2}V", pair[0].0),
                ));
            }
        }
        Ok(Self { points })
    }

    /// Piecewise-linear interpolation. Voltage above the highest control
    /// point clamps to 100, below the lowest clamps to 0.
    pub fn interpolate(&self, voltage: f64) -> f64 {
        let highest = self.points[0];
        let lowest = self.points[self.points.len() - 1];
        if voltage >= highest.0 {
            return 100.0;
        }
        if voltage <= lowest.0 {
            return 0.0;
        }

        for pair in self.points.windows(2) {
            let (high_v, high_p) = pair[0];
            let (low_v, low_p) = pair[1];
            if voltage >= low_v && voltage <= high_v {
                let span = high_v - low_v;
                let ratio = (voltage - low_v) / span;
                return f64::from(low_p) + ratio * f64::from(high_p - low_p);
            }
        }

        // Unreachable given the bound checks above, but never panic here.
        0.0
    }
}

/// How a raw battery reading should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryAlgorithm {
    /// Value is already a percentage (optionally scaled)
    Direct,
    /// Value is a percentage at half scale; multiply by 2
    Mult2,
    /// ZCL half-percent convention (0-200); divide by 2
    Div2,
    /// Linear interpolation between the configured voltage bounds
    VoltageLinear,
    /// Piecewise interpolation across the chemistry discharge curve
    VoltageCurve,
    /// Millivolt reading; divide by 1000 then apply the curve
    Millivolt,
    /// Three-state charge indicator (low / medium / high)
    Enum3,
    /// Four-state charge indicator
    Enum4,
}

/// Optional parameters for [`calculate`].
#[derive(Debug, Clone, Default)]
pub struct BatteryCalcOptions {
    pub chemistry: BatteryChemistry,
    /// Lower bound for `VoltageLinear`, volts
    pub voltage_min: Option<f64>,
    /// Upper bound for `VoltageLinear`, volts
    pub voltage_max: Option<f64>,
    /// Multiplier applied by `Direct` before clamping
    pub scale: Option<f64>,
}

const ENUM3_TABLE: [u8; 3] = [10, 50, 100];
const ENUM4_TABLE: [u8; 4] = [25, 50, 75, 100];

/// Default `VoltageLinear` bounds when the caller supplies none
/// (coin-cell operating range).
const LINEAR_DEFAULT_MIN: f64 = 2.0;
const LINEAR_DEFAULT_MAX: f64 = 3.0;

/// Convert a raw battery reading into a percentage.
///
/// Returns `None` for non-finite input or an out-of-table enum state;
/// callers skip the attribute write instead of propagating garbage.
pub fn calculate(
    raw: f64,
    algorithm: BatteryAlgorithm,
    options: &BatteryCalcOptions,
) -> Option<u8> {
    if !raw.is_finite() {
        return None;
    }

    let pct = match algorithm {
        BatteryAlgorithm::Direct => raw * options.scale.unwrap_or(1.0),
        BatteryAlgorithm::Mult2 => raw * 2.0,
        BatteryAlgorithm::Div2 => raw / 2.0,
        BatteryAlgorithm::VoltageLinear => {
            let min = options.voltage_min.unwrap_or(LINEAR_DEFAULT_MIN);
            let max = options.voltage_max.unwrap_or(LINEAR_DEFAULT_MAX);
            if max <= min {
                warn!("Degenerate voltage bounds [{min}, {max}], skipping reading");
                return None;
            }
            (raw - min) / (max - min) * 100.0
        }
        BatteryAlgorithm::VoltageCurve => options.chemistry.curve().interpolate(raw),
        BatteryAlgorithm::Millivolt => options.chemistry.curve().interpolate(raw / 1000.0),
        BatteryAlgorithm::Enum3 => {
            return lookup_enum(raw, &ENUM3_TABLE);
        }
        BatteryAlgorithm::Enum4 => {
            return lookup_enum(raw, &ENUM4_TABLE);
        }
    };

    Some(pct.clamp(0.0, 100.0).round() as u8)
}

fn lookup_enum(raw: f64, table: &[u8]) -> Option<u8> {
    if raw < 0.0 || raw.fract() != 0.0 {
        return None;
    }
    let index = raw as usize;
    match table.get(index) {
        Some(pct) => Some(*pct),
        None => {
            warn!("Battery enum state {index} outside {}-state table", table.len());
            None
        }
    }
}

/// Coarse health classification of a computed percentage.
pub fn battery_status(percentage: u8) -> &'static str {
    match percentage {
        81..=u8::MAX => "good",
        51..=80 => "medium",
        21..=50 => "low",
        11..=20 => "critical",
        _ => "dead",
    }
}

struct CurveSet {
    cr2032: DischargeCurve,
    cr2450: DischargeCurve,
    alkaline: DischargeCurve,
    lithium_primary: DischargeCurve,
    li_ion: DischargeCurve,
    li_po: DischargeCurve,
    life_po4: DischargeCurve,
    nimh: DischargeCurve,
}

/// Curve tables are literal data validated once at first access. A failed
/// validation here is a programming error in the tables themselves.
static CURVES: LazyLock<CurveSet> = LazyLock::new(|| CurveSet {
    cr2032: DischargeCurve::new(
        "CR2032",
        vec![
            (3.30, 100), (3.10, 98), (3.00, 95), (2.95, 90), (2.90, 85),
            (2.85, 75), (2.80, 65), (2.75, 50), (2.70, 40), (2.60, 25),
            (2.50, 15), (2.40, 8), (2.30, 4), (2.20, 2), (2.00, 0),
        ],
    )
    .unwrap_or_else(|e| panic!("{e}")),
    cr2450: DischargeCurve::new(
        "CR2450",
        vec![
            (3.30, 100), (3.10, 98), (3.00, 95), (2.95, 90), (2.90, 85),
            (2.85, 75), (2.80, 65), (2.75, 50), (2.70, 40), (2.60, 25),
            (2.50, 15), (2.40, 8), (2.30, 4), (2.00, 0),
        ],
    )
    .unwrap_or_else(|e| panic!("{e}")),
    alkaline: DischargeCurve::new(
        "Alkaline",
        vec![
            (1.65, 100), (1.55, 95), (1.50, 90), (1.45, 80), (1.40, 70),
            (1.35, 60), (1.30, 50), (1.25, 40), (1.20, 30), (1.15, 20),
            (1.10, 12), (1.05, 6), (1.00, 3), (0.90, 0),
        ],
    )
    .unwrap_or_else(|e| panic!("{e}")),
    lithium_primary: DischargeCurve::new(
        "Lithium primary",
        vec![
            (3.30, 100), (3.15, 95), (3.00, 90), (2.90, 80), (2.80, 65),
            (2.70, 45), (2.60, 25), (2.50, 12), (2.40, 5), (2.00, 0),
        ],
    )
    .unwrap_or_else(|e| panic!("{e}")),
    li_ion: DischargeCurve::new(
        "Li-ion",
        vec![
            (4.20, 100), (4.15, 98), (4.10, 95), (4.00, 88), (3.90, 78),
            (3.80, 65), (3.70, 50), (3.60, 35), (3.50, 22), (3.40, 12),
            (3.30, 5), (3.00, 2), (2.80, 0),
        ],
    )
    .unwrap_or_else(|e| panic!("{e}")),
    li_po: DischargeCurve::new(
        "Li-polymer",
        vec![
            (4.20, 100), (4.15, 97), (4.10, 93), (4.00, 85), (3.90, 73),
            (3.80, 58), (3.70, 42), (3.60, 28), (3.50, 16), (3.40, 8),
            (3.30, 3), (3.00, 0),
        ],
    )
    .unwrap_or_else(|e| panic!("{e}")),
    life_po4: DischargeCurve::new(
        "LiFePO4",
        vec![
            (3.60, 100), (3.40, 97), (3.33, 90), (3.30, 70), (3.28, 50),
            (3.25, 30), (3.20, 15), (3.10, 8), (3.00, 4), (2.50, 0),
        ],
    )
    .unwrap_or_else(|e| panic!("{e}")),
    nimh: DischargeCurve::new(
        "NiMH",
        vec![
            (1.45, 100), (1.35, 95), (1.30, 85), (1.25, 70), (1.22, 55),
            (1.20, 40), (1.18, 25), (1.15, 15), (1.10, 8), (1.00, 3),
            (0.90, 0),
        ],
    )
    .unwrap_or_else(|e| panic!("{e}")),
});

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(chemistry: BatteryChemistry) -> BatteryCalcOptions {
        BatteryCalcOptions { chemistry, ..Default::default() }
    }

    #[test]
    fn every_chemistry_curve_validates() {
        let all = [
            BatteryChemistry::Cr2032,
            BatteryChemistry::Cr2450,
            BatteryChemistry::Alkaline,
            BatteryChemistry::LithiumPrimary,
            BatteryChemistry::LiIon,
            BatteryChemistry::LiPo,
            BatteryChemistry::LiFePo4,
            BatteryChemistry::NiMh,
            BatteryChemistry::Unknown,
        ];
        for chem in all {
            assert!(chem.curve().points.len() >= 2, "{}", chem.name());
        }
    }

    #[test]
    fn curve_rejects_bad_tables() {
        assert!(DischargeCurve::new("one-point", vec![(3.0, 100)]).is_err());
        assert!(DischargeCurve::new("ascending", vec![(2.0, 0), (3.0, 100)]).is_err());
        assert!(DischargeCurve::new("non-monotone", vec![(3.0, 50), (2.5, 80)]).is_err());
    }

    #[test]
    fn cr2032_interpolates_between_neighboring_points() {
        // 2.80V -> 65%, 2.70V -> 40% on the CR2032 table; 2.75V must land
        // strictly between those percentages.
        let pct = calculate(2.75, BatteryAlgorithm::VoltageCurve, &opts(BatteryChemistry::Cr2032))
            .expect("finite input");
        assert!(pct > 40 && pct < 65, "got {pct}");
    }

    #[test]
    fn voltage_curve_is_monotonic_and_clamped() {
        let options = opts(BatteryChemistry::LiIon);
        let mut last = 0;
        let mut v = 2.5;
        while v <= 4.4 {
            let pct = calculate(v, BatteryAlgorithm::VoltageCurve, &options).unwrap();
            assert!(pct >= last, "dip at {v:.2}V: {pct} < {last}");
            last = pct;
            v += 0.01;
        }
        assert_eq!(calculate(9.9, BatteryAlgorithm::VoltageCurve, &options), Some(100));
        assert_eq!(calculate(0.1, BatteryAlgorithm::VoltageCurve, &options), Some(0));
    }

    #[test]
    fn millivolt_matches_voltage_curve() {
        let options = opts(BatteryChemistry::Cr2450);
        assert_eq!(
            calculate(2850.0, BatteryAlgorithm::Millivolt, &options),
            calculate(2.85, BatteryAlgorithm::VoltageCurve, &options),
        );
    }

    #[test]
    fn zcl_half_percent_conventions() {
        let options = BatteryCalcOptions::default();
        assert_eq!(calculate(200.0, BatteryAlgorithm::Div2, &options), Some(100));
        assert_eq!(calculate(97.0, BatteryAlgorithm::Div2, &options), Some(49));
        assert_eq!(calculate(40.0, BatteryAlgorithm::Mult2, &options), Some(80));
        // Overflowing raw values clamp instead of wrapping.
        assert_eq!(calculate(80.0, BatteryAlgorithm::Mult2, &options), Some(100));
    }

    #[test]
    fn direct_applies_optional_scale_and_clamps() {
        let mut options = BatteryCalcOptions::default();
        assert_eq!(calculate(73.0, BatteryAlgorithm::Direct, &options), Some(73));
        options.scale = Some(10.0);
        assert_eq!(calculate(7.3, BatteryAlgorithm::Direct, &options), Some(73));
        assert_eq!(calculate(-5.0, BatteryAlgorithm::Direct, &options), Some(0));
        assert_eq!(calculate(150.0, BatteryAlgorithm::Direct, &options), Some(100));
    }

    #[test]
    fn voltage_linear_between_bounds() {
        let options = BatteryCalcOptions {
            voltage_min: Some(2.5),
            voltage_max: Some(3.0),
            ..Default::default()
        };
        assert_eq!(calculate(2.75, BatteryAlgorithm::VoltageLinear, &options), Some(50));
        assert_eq!(calculate(3.2, BatteryAlgorithm::VoltageLinear, &options), Some(100));
        assert_eq!(calculate(2.0, BatteryAlgorithm::VoltageLinear, &options), Some(0));
    }

    #[test]
    fn degenerate_linear_bounds_yield_none() {
        let options = BatteryCalcOptions {
            voltage_min: Some(3.0),
            voltage_max: Some(3.0),
            ..Default::default()
        };
        assert_eq!(calculate(2.9, BatteryAlgorithm::VoltageLinear, &options), None);
    }

    #[test]
    fn enum_states_use_fixed_tables() {
        let options = BatteryCalcOptions::default();
        assert_eq!(calculate(0.0, BatteryAlgorithm::Enum3, &options), Some(10));
        assert_eq!(calculate(1.0, BatteryAlgorithm::Enum3, &options), Some(50));
        assert_eq!(calculate(2.0, BatteryAlgorithm::Enum3, &options), Some(100));
        assert_eq!(calculate(3.0, BatteryAlgorithm::Enum3, &options), None);
        assert_eq!(calculate(3.0, BatteryAlgorithm::Enum4, &options), Some(100));
        assert_eq!(calculate(1.5, BatteryAlgorithm::Enum4, &options), None);
    }

    #[test]
    fn non_finite_input_yields_none() {
        let options = BatteryCalcOptions::default();
        assert_eq!(calculate(f64::NAN, BatteryAlgorithm::Direct, &options), None);
        assert_eq!(calculate(f64::INFINITY, BatteryAlgorithm::VoltageCurve, &options), None);
    }

    #[test]
    fn status_classification() {
        assert_eq!(battery_status(100), "good");
        assert_eq!(battery_status(60), "medium");
        assert_eq!(battery_status(30), "low");
        assert_eq!(battery_status(15), "critical");
        assert_eq!(battery_status(5), "dead");
    }
}
