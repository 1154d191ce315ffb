/// PID filter for active power set-points
///
/// Smooths a controller's target before it becomes an EQ constraint. The
/// filter runs once per cycle, so there is no time delta: the integral is a
/// plain sum of errors and the derivative a plain difference.
///
/// Output = p * error + i * Σ(previous errors) + d * (error - last error)
use serde::{Deserialize, Serialize};
use validator::Validate;

/// PID parameters as configured under `[power.pid]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
pub struct PidSettings {
    #[serde(default)]
    pub enabled: bool,
    #[validate(range(min = 0.0))]
    pub p: f64,
    #[validate(range(min = 0.0))]
    pub i: f64,
    #[validate(range(min = 0.0))]
    pub d: f64,
}

impl Default for PidSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            p: 0.3,
            i: 0.3,
            d: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PidFilter {
    /// Proportional gain
    p: f64,
    /// Integral gain
    i: f64,
    /// Derivative gain
    d: f64,

    /// Sum of all errors so far
    error_sum: f64,
    /// Error of the previous call; `None` before the first call
    last_error: Option<f64>,

    /// Output limits
    lower_limit: Option<f64>,
    upper_limit: Option<f64>,
}

impl PidFilter {
    pub fn new(p: f64, i: f64, d: f64) -> Self {
        Self {
            p,
            i,
            d,
            error_sum: 0.0,
            last_error: None,
            lower_limit: None,
            upper_limit: None,
        }
    }

    pub fn from_settings(settings: &PidSettings) -> Self {
        Self::new(settings.p, settings.i, settings.d)
    }

    /// Sets the output limits. An upper limit below the lower limit is raised
    /// to the lower limit.
    pub fn set_limits(&mut self, lower: Option<f64>, upper: Option<f64>) {
        self.lower_limit = lower;
        self.upper_limit = match (lower, upper) {
            (Some(lo), Some(hi)) if hi < lo => Some(lo),
            _ => upper,
        };
    }

    /// Forgets the integral and derivative history.
    pub fn reset(&mut self) {
        self.error_sum = 0.0;
        self.last_error = None;
    }

    /// Filters `target` given the currently measured `input`.
    pub fn apply(&mut self, input: f64, target: f64) -> f64 {
        let target = self.clamp(target);
        let error = target - input;

        // bumpless start: the integral term reproduces the current input
        let last_error = match self.last_error {
            Some(last) => last,
            None => {
                if self.i > 0.0 {
                    self.error_sum = input / self.i;
                }
                error
            }
        };

        let output = self.p * error + self.i * self.error_sum + self.d * (error - last_error);

        self.error_sum = self.anti_windup(self.error_sum + error);
        self.last_error = Some(error);

        self.clamp(output)
    }

    pub fn error_sum(&self) -> f64 {
        self.error_sum
    }

    fn anti_windup(&self, error_sum: f64) -> f64 {
        if self.i <= 0.0 {
            return error_sum;
        }
        let bound = [self.lower_limit, self.upper_limit]
            .into_iter()
            .flatten()
            .map(f64::abs)
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))));
        match bound {
            Some(bound) => {
                let limit = bound / self.i;
                error_sum.clamp(-limit, limit)
            }
            None => error_sum,
        }
    }

    fn clamp(&self, value: f64) -> f64 {
        let value = match self.upper_limit {
            Some(hi) => value.min(hi),
            None => value,
        };
        match self.lower_limit {
            Some(lo) => value.max(lo),
            None => value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> PidFilter {
        let mut pid = PidFilter::new(0.3, 0.3, 0.1);
        pid.set_limits(Some(-50000.0), Some(50000.0));
        pid
    }

    #[test]
    fn test_step_response_sequence() {
        let mut pid = filter();
        let mut value = 0.0;
        let mut outputs = Vec::new();
        for _ in 0..5 {
            value = pid.apply(value, 10000.0);
            outputs.push(value.round());
        }
        assert_eq!(outputs, vec![3000.0, 4800.0, 6480.0, 7548.0, 8345.0]);
    }

    #[test]
    fn test_converges_to_target() {
        let mut pid = filter();
        let mut value = 0.0;
        for _ in 0..100 {
            value = pid.apply(value, 10000.0);
        }
        assert!((value - 10000.0).abs() < 1.0, "value {}", value);
    }

    #[test]
    fn test_bumpless_start_holds_current_input() {
        let mut pid = PidFilter::new(0.3, 0.3, 0.1);
        assert!((pid.apply(4000.0, 4000.0) - 4000.0).abs() < 1e-9);
    }

    #[test]
    fn test_output_clamping() {
        let mut pid = PidFilter::new(1.0, 0.0, 0.0);
        pid.set_limits(Some(-50.0), Some(50.0));
        assert_eq!(pid.apply(0.0, 200.0), 50.0);
        assert_eq!(pid.apply(0.0, -200.0), -50.0);
    }

    #[test]
    fn test_inverted_limits_collapse_to_lower() {
        let mut pid = PidFilter::new(1.0, 0.0, 0.0);
        pid.set_limits(Some(100.0), Some(-100.0));
        assert_eq!(pid.apply(0.0, 500.0), 100.0);
        assert_eq!(pid.apply(0.0, -500.0), 100.0);
    }

    #[test]
    fn test_integral_windup_protection() {
        let mut pid = PidFilter::new(0.0, 1.0, 0.0);
        pid.set_limits(Some(-10.0), Some(10.0));
        for _ in 0..100 {
            let _ = pid.apply(0.0, 100.0);
        }
        assert!(pid.error_sum().abs() <= 10.0);
    }

    #[test]
    fn test_reset() {
        let mut pid = filter();
        let _ = pid.apply(0.0, 1000.0);
        assert!(pid.error_sum() != 0.0);
        pid.reset();
        assert_eq!(pid.error_sum(), 0.0);
        assert_eq!(pid.apply(0.0, 1000.0).round(), 300.0);
    }
}
