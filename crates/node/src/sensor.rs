//! Environmental sensor source plus a stateful greenhouse-air simulator for
//! local development.
//!
//! The simulator models:
//! - Diurnal outdoor temperature swing
//! - Solar gain heating the closed greenhouse above outdoor temperature
//! - Vent cooling (the inside relaxes toward outdoor air while open)
//! - First-order thermal lag, random walk and per-reading noise
//! - Occasional bad samples (NaN / bus errors) in the flaky scenario

use greenhouse_common::{SensorFault, SensorReading, VentState};

/// Anything that yields environmental samples.
pub trait Sensor {
    fn sample(&mut self) -> Result<SensorReading, SensorFault>;

    /// Tell the source where the vent is. Real sensors ignore this; the
    /// simulator uses it to close the loop.
    fn observe_vent(&mut self, _vent: VentState) {}
}

#[cfg(feature = "sim")]
pub use sim::{Scenario, SimSensor};

#[cfg(feature = "sim")]
mod sim {
    use super::*;
    use std::fmt;
    use std::time::Instant;

    /// Approximate a sample from N(0,1) using the Irwin-Hall method.
    fn approx_std_normal() -> f64 {
        let mut sum: f64 = 0.0;
        for _ in 0..12 {
            sum += fastrand::f64();
        }
        sum - 6.0
    }

    fn gaussian(mean: f64, sigma: f64) -> f64 {
        mean + sigma * approx_std_normal()
    }

    // -----------------------------------------------------------------------
    // Scenario presets
    // -----------------------------------------------------------------------

    /// Pre-configured simulation profiles selectable via `SIM_SCENARIO`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Scenario {
        /// Clear day, strong solar gain. The vent cycles around midday.
        Sunny,
        /// Overcast and mild. Rarely crosses the default threshold.
        Mild,
        /// Sunny, plus ~5% bad samples. Exercises fault handling.
        Flaky,
        /// Heat wave: inside temperature stays above threshold for hours.
        Hot,
    }

    impl Scenario {
        pub fn from_str_lossy(s: &str) -> Self {
            match s.to_ascii_lowercase().as_str() {
                "mild" => Self::Mild,
                "flaky" => Self::Flaky,
                "hot" => Self::Hot,
                _ => Self::Sunny, // default
            }
        }
    }

    impl fmt::Display for Scenario {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::Sunny => write!(f, "sunny"),
                Self::Mild => write!(f, "mild"),
                Self::Flaky => write!(f, "flaky"),
                Self::Hot => write!(f, "hot"),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Simulator
    // -----------------------------------------------------------------------

    pub struct SimSensor {
        started: Instant,
        /// Current inside air temperature (°C).
        inside: f64,
        humidity: f64,
        pressure: f64,

        outdoor_mean: f64,
        outdoor_swing: f64,
        solar_gain: f64,
        noise_sigma: f64,
        fault_prob: f32,

        /// Fraction of the gap to the equilibrium closed per sample.
        lag: f64,
        /// How strongly an open vent pulls inside toward outdoor air.
        vent_cooling: f64,
        diurnal_period_s: f64,
        /// Simulated seconds already elapsed at start (0 = sunrise).
        day_offset_s: f64,

        vent: VentState,
    }

    impl SimSensor {
        /// `diurnal_period_s` is the length of a simulated day; use a few
        /// minutes for fast iteration or 86400 for real time.
        pub fn new(scenario: Scenario, diurnal_period_s: f64) -> Self {
            let (outdoor_mean, outdoor_swing, solar_gain, noise_sigma, fault_prob) = match scenario
            {
                Scenario::Sunny => (18.0, 6.0, 9.0, 0.15, 0.0_f32),
                Scenario::Mild => (14.0, 3.0, 4.0, 0.1, 0.0),
                Scenario::Flaky => (18.0, 6.0, 9.0, 0.3, 0.05),
                Scenario::Hot => (28.0, 5.0, 10.0, 0.15, 0.0),
            };

            Self {
                started: Instant::now(),
                inside: outdoor_mean,
                humidity: 65.0,
                pressure: 1013.0,
                outdoor_mean,
                outdoor_swing,
                solar_gain,
                noise_sigma,
                fault_prob,
                lag: 0.08,
                vent_cooling: 0.85,
                diurnal_period_s,
                day_offset_s: 0.0,
                vent: VentState::Closed,
            }
        }

        /// Sun elevation proxy in `[0, 1]`, peaking mid "day".
        fn daylight(&self) -> f64 {
            let t = self.day_offset_s + self.started.elapsed().as_secs_f64();
            let phase = 2.0 * std::f64::consts::PI * t / self.diurnal_period_s;
            phase.sin().max(0.0)
        }

        fn vent_openness(&self) -> f64 {
            match self.vent {
                VentState::Closed => 0.0,
                VentState::Opening | VentState::Closing => 0.5,
                VentState::Open => 1.0,
            }
        }

        fn step(&mut self) {
            let sun = self.daylight();
            let outdoor = self.outdoor_mean + self.outdoor_swing * (2.0 * sun - 1.0);
            let gain = self.solar_gain * sun * (1.0 - self.vent_cooling * self.vent_openness());
            let equilibrium = outdoor + gain;

            self.inside += self.lag * (equilibrium - self.inside) + gaussian(0.0, 0.05);
            // Warmer air holds more water: relative humidity drops as it heats.
            self.humidity = (80.0 - 1.2 * (self.inside - self.outdoor_mean)
                + gaussian(0.0, 0.5))
            .clamp(20.0, 99.0);
            self.pressure += gaussian(0.0, 0.05) + 0.01 * (1013.0 - self.pressure);
        }
    }

    impl Sensor for SimSensor {
        fn sample(&mut self) -> Result<SensorReading, SensorFault> {
            self.step();

            let timestamp_ms = self.started.elapsed().as_millis() as u32;

            if fastrand::f32() < self.fault_prob {
                // Half the faults look like a NaN conversion, half like a
                // bus error.
                if fastrand::bool() {
                    return Ok(SensorReading {
                        temperature_c: f32::NAN,
                        humidity_pct: self.humidity as f32,
                        pressure_hpa: self.pressure as f32,
                        timestamp_ms,
                    });
                }
                return Err(SensorFault::Bus("simulated i2c nack".into()));
            }

            Ok(SensorReading {
                temperature_c: (self.inside + gaussian(0.0, self.noise_sigma)) as f32,
                humidity_pct: self.humidity as f32,
                pressure_hpa: self.pressure as f32,
                timestamp_ms,
            })
        }

        fn observe_vent(&mut self, vent: VentState) {
            self.vent = vent;
        }
    }

    // =======================================================================
    // Tests
    // =======================================================================

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn stable_scenarios_produce_valid_readings() {
            for scenario in [Scenario::Sunny, Scenario::Mild, Scenario::Hot] {
                let mut sim = SimSensor::new(scenario, 600.0);
                for _ in 0..500 {
                    let r = sim.sample().unwrap();
                    r.validate().unwrap();
                }
            }
        }

        #[test]
        fn open_vent_cools_a_sunny_greenhouse() {
            fn settle(sim: &mut SimSensor, n: usize) -> f64 {
                for _ in 0..n {
                    let _ = sim.sample();
                }
                sim.inside
            }

            // A very long "day" keeps the sun roughly constant over the test;
            // start both at midday so solar gain is at its peak.
            let period = 1.0e9;
            let mut closed = SimSensor::new(Scenario::Hot, period);
            let mut open = SimSensor::new(Scenario::Hot, period);
            closed.day_offset_s = period / 4.0;
            open.day_offset_s = period / 4.0;
            open.observe_vent(VentState::Open);

            let t_closed = settle(&mut closed, 200);
            let t_open = settle(&mut open, 200);
            assert!(
                t_open < t_closed,
                "open vent should be cooler: open={t_open:.1} closed={t_closed:.1}"
            );
        }

        #[test]
        fn flaky_scenario_eventually_faults() {
            let mut sim = SimSensor::new(Scenario::Flaky, 600.0);
            let faults = (0..2000)
                .filter(|_| match sim.sample() {
                    Ok(r) => r.validate().is_err(),
                    Err(_) => true,
                })
                .count();
            assert!(faults > 0, "flaky scenario should produce faults");
        }

        #[test]
        fn scenario_from_str_lossy() {
            assert_eq!(Scenario::from_str_lossy("mild"), Scenario::Mild);
            assert_eq!(Scenario::from_str_lossy("FLAKY"), Scenario::Flaky);
            assert_eq!(Scenario::from_str_lossy("Hot"), Scenario::Hot);
            assert_eq!(Scenario::from_str_lossy("unknown"), Scenario::Sunny);
            assert_eq!(Scenario::from_str_lossy(""), Scenario::Sunny);
        }

        #[test]
        fn scenario_display() {
            assert_eq!(Scenario::Sunny.to_string(), "sunny");
            assert_eq!(Scenario::Flaky.to_string(), "flaky");
        }
    }
}
