//! # Battery State Model
//!
//! Physical model of a single storage battery used to bound and inform the
//! allocation optimizer:
//! - temperature-dependent charge/discharge efficiency
//! - Peukert capacity derating on discharge
//! - minimum SoC (depth-of-discharge) floor
//! - cycle-based aging that permanently shrinks usable capacity
//!
//! The model is a plain state machine with no I/O. Exactly one component owns it
//! (the simulated storage, or the real device behind the state provider).

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use validator::Validate;

use crate::error::{ControlError, ControlResult};

/// Reference temperature for efficiency derating (°C)
const REFERENCE_TEMP_C: f64 = 25.0;
/// Efficiency lost per °C away from the reference temperature
const TEMP_EFFICIENCY_COEFFICIENT: f64 = 0.005;
/// Efficiency never drops below this value
const MIN_EFFICIENCY: f64 = 0.8;
/// State of health never drops below this value
const MIN_STATE_OF_HEALTH: f64 = 0.8;
/// Capacity fade per sqrt(cycle)
const FADE_PER_SQRT_CYCLE: f64 = 0.002;
/// Internal resistance at full charge (Ω)
const R_FULL_OHM: f64 = 0.005;
/// Internal resistance at empty (Ω)
const R_EMPTY_OHM: f64 = 0.05;

/// Battery health classification derived from state of health
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Warning,
    Critical,
}

/// Static battery parameters, supplied by configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BatteryParams {
    /// Nominal capacity (kWh)
    #[validate(range(min = 0.001))]
    pub capacity_kwh: f64,
    /// Maximum discharge power (kW)
    #[validate(range(min = 0.0))]
    pub max_discharge_kw: f64,
    /// Nominal pack voltage (V)
    #[validate(range(min = 0.0))]
    pub voltage_nominal: f64,
    /// Peukert exponent, 1.0 disables the effect
    #[validate(range(min = 1.0, max = 2.0))]
    pub peukert_exponent: f64,
    #[validate(range(min = 0.01, max = 1.0))]
    pub charge_efficiency: f64,
    #[validate(range(min = 0.01, max = 1.0))]
    pub discharge_efficiency: f64,
    /// Initial SoC as a fraction of actual capacity
    #[validate(range(min = 0.0, max = 1.0))]
    pub initial_soc: f64,
    #[validate(range(min = 0.8, max = 1.0))]
    pub state_of_health: f64,
    pub temperature_c: f64,
    /// Discharge floor as a percentage of actual capacity
    #[validate(range(min = 0.0, max = 80.0))]
    pub min_soc_percent: f64,
}

impl Default for BatteryParams {
    fn default() -> Self {
        Self {
            capacity_kwh: 100.0,
            max_discharge_kw: 10.0,
            voltage_nominal: 48.0,
            peukert_exponent: 1.05,
            charge_efficiency: 0.95,
            discharge_efficiency: 0.95,
            initial_soc: 1.0,
            state_of_health: 1.0,
            temperature_c: 25.0,
            min_soc_percent: 20.0,
        }
    }
}

/// Serializable view of the model, for status reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatterySnapshot {
    pub soc_wh: f64,
    pub soc_percent: f64,
    pub min_soc_wh: f64,
    pub capacity_wh_actual: f64,
    pub state_of_health: f64,
    pub health: HealthStatus,
    pub cycle_count: f64,
    pub voltage_v: f64,
    pub internal_resistance_ohm: f64,
    pub temperature_c: f64,
    pub charge_efficiency: f64,
    pub discharge_efficiency: f64,
}

#[derive(Debug, Clone)]
pub struct BatteryModel {
    params: BatteryParams,
    capacity_wh_nominal: f64,
    capacity_wh_actual: f64,
    state_of_health: f64,
    soc_wh: f64,
    min_soc_wh: f64,
    charge_efficiency: f64,
    discharge_efficiency: f64,
    temperature_c: f64,
    cycle_count: f64,
}

impl BatteryModel {
    pub fn new(params: BatteryParams) -> ControlResult<Self> {
        params.validate()?;
        if !params.temperature_c.is_finite() {
            return Err(ControlError::InvalidConfig(format!(
                "battery temperature is not finite: {}",
                params.temperature_c
            )));
        }
        if params.initial_soc * 100.0 < params.min_soc_percent {
            return Err(ControlError::InvalidConfig(format!(
                "initial SoC {:.1}% is below the {:.1}% floor",
                params.initial_soc * 100.0,
                params.min_soc_percent
            )));
        }

        let capacity_wh_nominal = params.capacity_kwh * 1000.0;
        let capacity_wh_actual = capacity_wh_nominal * params.state_of_health;

        Ok(Self {
            capacity_wh_nominal,
            capacity_wh_actual,
            state_of_health: params.state_of_health,
            soc_wh: params.initial_soc * capacity_wh_actual,
            min_soc_wh: params.min_soc_percent / 100.0 * capacity_wh_actual,
            charge_efficiency: params.charge_efficiency,
            discharge_efficiency: params.discharge_efficiency,
            temperature_c: params.temperature_c,
            cycle_count: equivalent_cycles(params.state_of_health),
            params,
        })
    }

    /// Draw `power_demand_w` for `duration_h` hours.
    ///
    /// SoC is debited by the energy drawn; the returned value is the power delivered
    /// to the loads after discharge losses. Returns 0 without touching state when no
    /// energy is available above the SoC floor.
    pub fn discharge(&mut self, power_demand_w: f64, duration_h: f64) -> f64 {
        if !valid_request(power_demand_w, duration_h) {
            warn!(power_demand_w, duration_h, "ignoring invalid discharge request");
            return 0.0;
        }
        self.adjust_efficiencies_for_temperature();

        let effective_capacity_wh =
            self.capacity_wh_actual / duration_h.powf(self.params.peukert_exponent - 1.0);
        let energy_available_wh = (self.soc_wh - self.min_soc_wh).min(effective_capacity_wh);
        if energy_available_wh <= 0.0 {
            debug!(soc_wh = self.soc_wh, "battery at discharge floor");
            return 0.0;
        }

        let mut drawn_w = power_demand_w.min(self.params.max_discharge_kw * 1000.0);
        let mut energy_drawn_wh = drawn_w * duration_h;
        if energy_drawn_wh > energy_available_wh {
            energy_drawn_wh = energy_available_wh;
            drawn_w = energy_drawn_wh / duration_h;
        }

        self.soc_wh = (self.soc_wh - energy_drawn_wh).max(self.min_soc_wh);
        self.update_cycle_count(energy_drawn_wh);

        drawn_w * self.discharge_efficiency
    }

    /// Offer `power_available_w` for `duration_h` hours.
    ///
    /// Returns the power actually taken from the source. A full battery takes
    /// nothing and is left untouched.
    pub fn charge(&mut self, power_available_w: f64, duration_h: f64) -> f64 {
        if !valid_request(power_available_w, duration_h) {
            warn!(power_available_w, duration_h, "ignoring invalid charge request");
            return 0.0;
        }
        self.adjust_efficiencies_for_temperature();

        let energy_needed_wh = self.capacity_wh_actual - self.soc_wh;
        if energy_needed_wh <= 0.0 {
            debug!(soc_wh = self.soc_wh, "battery full");
            return 0.0;
        }

        let mut accepted_w = power_available_w;
        let mut energy_added_wh = power_available_w * self.charge_efficiency * duration_h;
        if energy_added_wh > energy_needed_wh {
            energy_added_wh = energy_needed_wh;
            accepted_w = energy_added_wh / duration_h / self.charge_efficiency;
        }

        self.soc_wh = (self.soc_wh + energy_added_wh).min(self.capacity_wh_actual);
        self.update_cycle_count(energy_added_wh);

        accepted_w
    }

    pub fn params(&self) -> &BatteryParams {
        &self.params
    }

    pub fn soc_wh(&self) -> f64 {
        self.soc_wh
    }

    pub fn soc_kwh(&self) -> f64 {
        self.soc_wh / 1000.0
    }

    pub fn min_soc_wh(&self) -> f64 {
        self.min_soc_wh
    }

    pub fn capacity_wh_actual(&self) -> f64 {
        self.capacity_wh_actual
    }

    pub fn capacity_kwh_actual(&self) -> f64 {
        self.capacity_wh_actual / 1000.0
    }

    pub fn state_of_health(&self) -> f64 {
        self.state_of_health
    }

    pub fn cycle_count(&self) -> f64 {
        self.cycle_count
    }

    pub fn charge_efficiency(&self) -> f64 {
        self.charge_efficiency
    }

    pub fn discharge_efficiency(&self) -> f64 {
        self.discharge_efficiency
    }

    pub fn temperature_c(&self) -> f64 {
        self.temperature_c
    }

    pub fn max_discharge_kw(&self) -> f64 {
        self.params.max_discharge_kw
    }

    /// Cell temperature changes take effect on the next charge/discharge call.
    pub fn set_temperature(&mut self, temperature_c: f64) {
        if temperature_c.is_finite() {
            self.temperature_c = temperature_c;
        }
    }

    pub fn soc_percent(&self) -> f64 {
        self.soc_wh / self.capacity_wh_actual * 100.0
    }

    /// Open-circuit voltage from a cubic fit in SoC%
    pub fn voltage(&self) -> f64 {
        let soc = self.soc_percent();
        -0.0001 * soc.powi(3) + 0.01 * soc.powi(2) - 0.1 * soc + self.params.voltage_nominal
    }

    /// Internal resistance (Ω), rising linearly as the battery empties
    pub fn internal_resistance(&self) -> f64 {
        let soc_fraction = self.soc_percent() / 100.0;
        R_FULL_OHM + (1.0 - soc_fraction) * (R_EMPTY_OHM - R_FULL_OHM)
    }

    pub fn health_status(&self) -> HealthStatus {
        if self.state_of_health >= 0.95 {
            HealthStatus::Healthy
        } else if self.state_of_health >= 0.9 {
            HealthStatus::Degraded
        } else if self.state_of_health > MIN_STATE_OF_HEALTH {
            HealthStatus::Warning
        } else {
            HealthStatus::Critical
        }
    }

    pub fn snapshot(&self) -> BatterySnapshot {
        BatterySnapshot {
            soc_wh: self.soc_wh,
            soc_percent: self.soc_percent(),
            min_soc_wh: self.min_soc_wh,
            capacity_wh_actual: self.capacity_wh_actual,
            state_of_health: self.state_of_health,
            health: self.health_status(),
            cycle_count: self.cycle_count,
            voltage_v: self.voltage(),
            internal_resistance_ohm: self.internal_resistance(),
            temperature_c: self.temperature_c,
            charge_efficiency: self.charge_efficiency,
            discharge_efficiency: self.discharge_efficiency,
        }
    }

    fn adjust_efficiencies_for_temperature(&mut self) {
        let loss = (self.temperature_c - REFERENCE_TEMP_C).abs() * TEMP_EFFICIENCY_COEFFICIENT;
        self.charge_efficiency = derate(self.params.charge_efficiency, loss);
        self.discharge_efficiency = derate(self.params.discharge_efficiency, loss);
    }

    fn update_cycle_count(&mut self, energy_changed_wh: f64) {
        let delta_soc = energy_changed_wh.abs() / self.capacity_wh_actual;
        // charge and discharge each count as half a cycle
        self.cycle_count += delta_soc / 2.0;

        let capacity_loss = FADE_PER_SQRT_CYCLE * self.cycle_count.sqrt();
        // health only fades
        self.state_of_health = (1.0 - capacity_loss)
            .max(MIN_STATE_OF_HEALTH)
            .min(self.state_of_health);
        self.capacity_wh_actual = self.capacity_wh_nominal * self.state_of_health;
        // energy above the faded capacity is lost
        self.soc_wh = self.soc_wh.min(self.capacity_wh_actual);
    }
}

/// Cycle count at which the fade curve reaches `state_of_health`.
fn equivalent_cycles(state_of_health: f64) -> f64 {
    ((1.0 - state_of_health) / FADE_PER_SQRT_CYCLE).powi(2)
}

fn derate(initial: f64, loss: f64) -> f64 {
    // initial may itself sit below the floor; never raise it
    (initial - loss).clamp(MIN_EFFICIENCY.min(initial), initial)
}

fn valid_request(power_w: f64, duration_h: f64) -> bool {
    power_w.is_finite() && duration_h.is_finite() && power_w > 0.0 && duration_h > 0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn params() -> BatteryParams {
        BatteryParams {
            capacity_kwh: 10.0,
            max_discharge_kw: 5.0,
            voltage_nominal: 48.0,
            peukert_exponent: 1.0,
            charge_efficiency: 0.95,
            discharge_efficiency: 0.9,
            initial_soc: 0.5,
            state_of_health: 1.0,
            temperature_c: 25.0,
            min_soc_percent: 20.0,
        }
    }

    #[test]
    fn test_discharge_debits_demand_and_delivers_after_losses() {
        let mut battery = BatteryModel::new(params()).unwrap();
        let before = battery.soc_wh();

        let delivered = battery.discharge(1000.0, 1.0);

        assert!((before - battery.soc_wh() - 1000.0).abs() < 1e-9);
        assert!((delivered - 900.0).abs() < 1e-9);
        assert!(battery.cycle_count() > 0.0);
    }

    #[test]
    fn test_charge_credits_after_losses_and_returns_source_power() {
        let mut battery = BatteryModel::new(params()).unwrap();
        let before = battery.soc_wh();

        let accepted = battery.charge(1000.0, 1.0);

        assert!((battery.soc_wh() - before - 950.0).abs() < 1e-9);
        assert!((accepted - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_discharge_capped_by_max_power() {
        let mut battery = BatteryModel::new(params()).unwrap();
        let before = battery.soc_wh();

        let delivered = battery.discharge(8000.0, 0.25);

        assert!((before - battery.soc_wh() - 5000.0 * 0.25).abs() < 1e-9);
        assert!((delivered - 5000.0 * 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_discharge_stops_at_floor() {
        let mut battery = BatteryModel::new(params()).unwrap();

        // 5 kWh stored, 2 kWh floor => 3 kWh available
        let delivered = battery.discharge(5000.0, 1.0);
        assert!((battery.soc_wh() - battery.min_soc_wh()).abs() < 1e-6);
        assert!((delivered - 3000.0 * 0.9).abs() < 1e-6);

        let cycles = battery.cycle_count();
        assert_eq!(battery.discharge(1000.0, 1.0), 0.0);
        assert_eq!(battery.cycle_count(), cycles);
    }

    #[test]
    fn test_charge_stops_at_capacity() {
        let mut battery = BatteryModel::new(BatteryParams {
            initial_soc: 0.9,
            ..params()
        })
        .unwrap();

        let accepted = battery.charge(5000.0, 1.0);
        assert!(accepted < 5000.0);
        assert!((battery.soc_wh() - battery.capacity_wh_actual()).abs() < 1e-6);
        assert_eq!(battery.charge(5000.0, 1.0), 0.0);
    }

    #[test]
    fn test_peukert_derates_long_discharge() {
        let mut battery = BatteryModel::new(BatteryParams {
            peukert_exponent: 1.5,
            initial_soc: 1.0,
            min_soc_percent: 0.0,
            ..params()
        })
        .unwrap();

        // 10 kWh / 16^0.5 = 2.5 kWh usable over 16 h
        let delivered = battery.discharge(1000.0, 16.0);
        assert!((delivered - 2500.0 / 16.0 * 0.9).abs() < 1e-6);
    }

    #[rstest]
    #[case(25.0, 0.95)]
    #[case(35.0, 0.90)]
    #[case(15.0, 0.90)]
    #[case(-20.0, 0.8)]
    fn test_temperature_derates_efficiency(#[case] temperature_c: f64, #[case] expected: f64) {
        let mut battery = BatteryModel::new(BatteryParams {
            charge_efficiency: 0.95,
            temperature_c,
            ..params()
        })
        .unwrap();
        battery.charge(100.0, 0.1);
        assert!((battery.charge_efficiency() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_voltage_and_resistance_curves() {
        let battery = BatteryModel::new(BatteryParams {
            initial_soc: 1.0,
            ..params()
        })
        .unwrap();
        // -100 + 100 - 10 + 48
        assert!((battery.voltage() - 38.0).abs() < 1e-9);
        assert!((battery.internal_resistance() - 0.005).abs() < 1e-12);

        let half = BatteryModel::new(params()).unwrap();
        assert!((half.internal_resistance() - 0.0275).abs() < 1e-12);
    }

    #[test]
    fn test_aging_follows_sqrt_cycles() {
        let mut battery = BatteryModel::new(BatteryParams {
            min_soc_percent: 0.0,
            ..params()
        })
        .unwrap();
        for _ in 0..50 {
            battery.discharge(4000.0, 1.0);
            battery.charge(5000.0, 1.0);
        }
        let expected = (1.0 - 0.002 * battery.cycle_count().sqrt()).max(0.8);
        assert!((battery.state_of_health() - expected).abs() < 1e-12);
        assert!((battery.capacity_wh_actual() - 10_000.0 * expected).abs() < 1e-6);
    }

    #[test]
    fn test_aged_battery_starts_on_fade_curve() {
        let mut battery = BatteryModel::new(BatteryParams {
            state_of_health: 0.9,
            ..params()
        })
        .unwrap();
        assert!((battery.cycle_count() - 2500.0).abs() < 1e-6);
        let before = battery.capacity_wh_actual();

        battery.discharge(1000.0, 1.0);

        assert!(battery.capacity_wh_actual() <= before);
        assert!(battery.state_of_health() <= 0.9);
        assert!(battery.state_of_health() > 0.899);
    }

    #[test]
    fn test_rejects_initial_soc_below_floor() {
        let result = BatteryModel::new(BatteryParams {
            initial_soc: 0.1,
            ..params()
        });
        assert!(matches!(result, Err(ControlError::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_requests_do_not_mutate() {
        let mut battery = BatteryModel::new(params()).unwrap();
        let before = battery.soc_wh();
        assert_eq!(battery.discharge(-5.0, 1.0), 0.0);
        assert_eq!(battery.charge(100.0, 0.0), 0.0);
        assert_eq!(battery.discharge(f64::NAN, 1.0), 0.0);
        assert_eq!(battery.soc_wh(), before);
    }

    proptest! {
        #[test]
        fn prop_soc_stays_within_bounds(
            ops in prop::collection::vec((any::<bool>(), 0.0f64..20_000.0, 0.01f64..4.0), 1..200),
            temperature_c in -20.0f64..60.0,
        ) {
            let mut battery = BatteryModel::new(BatteryParams {
                temperature_c,
                peukert_exponent: 1.1,
                ..params()
            }).unwrap();
            for (is_charge, power_w, duration_h) in ops {
                if is_charge {
                    battery.charge(power_w, duration_h);
                } else {
                    battery.discharge(power_w, duration_h);
                }
                prop_assert!(battery.soc_wh() >= battery.min_soc_wh() - 1e-9);
                prop_assert!(battery.soc_wh() <= battery.capacity_wh_actual() + 1e-9);
            }
        }

        #[test]
        fn prop_capacity_never_increases(
            ops in prop::collection::vec((any::<bool>(), 0.0f64..20_000.0, 0.01f64..4.0), 1..200),
            state_of_health in 0.8f64..=1.0,
        ) {
            let mut battery = BatteryModel::new(BatteryParams {
                state_of_health,
                ..params()
            }).unwrap();
            let mut previous = battery.capacity_wh_actual();
            for (is_charge, power_w, duration_h) in ops {
                if is_charge {
                    battery.charge(power_w, duration_h);
                } else {
                    battery.discharge(power_w, duration_h);
                }
                prop_assert!(battery.capacity_wh_actual() <= previous);
                prop_assert!(battery.state_of_health() >= 0.8);
                previous = battery.capacity_wh_actual();
            }
        }
    }
}
