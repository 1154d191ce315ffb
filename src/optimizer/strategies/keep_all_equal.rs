use super::{clamp, EPSILON};

const BISECTION_STEPS: usize = 200;

/// Gives every device the same utilization ratio `P/Smax`.
///
/// Finds the common ratio `r` with `Σ clamp(r·Smaxᵢ, lowerᵢ, upperᵢ) = total`
/// by bisection. Devices that hit a bound keep it and the ratio of the others
/// rises until the total is met. This is the minimizer of
/// `Σ (Pᵢ/Smaxᵢ − r)²` under box bounds. Devices without a rating take the
/// point of their bounds closest to zero.
pub fn keep_all_equal(total: f64, bounds: &[(f64, f64)], max_apparent_power: &[f64]) -> Vec<f64> {
    let rated: Vec<bool> = max_apparent_power.iter().map(|s| *s > EPSILON).collect();
    let at_ratio = |ratio: f64| -> Vec<f64> {
        bounds
            .iter()
            .zip(max_apparent_power)
            .zip(&rated)
            .map(|(((lower, upper), smax), rated)| {
                let wanted = if *rated { ratio * smax } else { 0.0 };
                clamp(wanted, *lower, *upper)
            })
            .collect()
    };

    let (mut low, mut high) = ratio_range(bounds, max_apparent_power, &rated);
    let delivered = |ratio: f64| at_ratio(ratio).iter().sum::<f64>();
    if total <= delivered(low) {
        return at_ratio(low);
    }
    if total >= delivered(high) {
        return at_ratio(high);
    }
    for _ in 0..BISECTION_STEPS {
        let mid = 0.5 * (low + high);
        if delivered(mid) < total {
            low = mid;
        } else {
            high = mid;
        }
        if high - low < 1e-12 {
            break;
        }
    }
    at_ratio(0.5 * (low + high))
}

/// Ratios beyond which every rated device is pinned to a bound.
fn ratio_range(bounds: &[(f64, f64)], max_apparent_power: &[f64], rated: &[bool]) -> (f64, f64) {
    let ratios = bounds
        .iter()
        .zip(max_apparent_power)
        .zip(rated)
        .filter(|(_, rated)| **rated)
        .flat_map(|(((lower, upper), smax), _)| [lower / smax, upper / smax]);
    let (low, high) = ratios.fold((0.0_f64, 0.0_f64), |(lo, hi), r| (lo.min(r), hi.max(r)));
    (low, high)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_equal_ratio_for_different_ratings() {
        let bounds = [(-10000.0, 10000.0), (-30000.0, 30000.0)];
        let smax = [10000.0, 30000.0];
        let alloc = keep_all_equal(20000.0, &bounds, &smax);
        assert!((alloc[0] - 5000.0).abs() < 1e-3, "{:?}", alloc);
        assert!((alloc[1] - 15000.0).abs() < 1e-3, "{:?}", alloc);
    }

    #[test]
    fn test_clipped_device_keeps_bound() {
        // the first device may only discharge 1000 W
        let bounds = [(-10000.0, 1000.0), (-10000.0, 10000.0)];
        let smax = [10000.0, 10000.0];
        let alloc = keep_all_equal(9000.0, &bounds, &smax);
        assert!((alloc[0] - 1000.0).abs() < 1e-3);
        assert!((alloc[1] - 8000.0).abs() < 1e-3);
    }

    #[test]
    fn test_saturates_when_total_exceeds_capacity() {
        let bounds = [(-1000.0, 1000.0), (-2000.0, 2000.0)];
        let smax = [1000.0, 2000.0];
        assert_eq!(keep_all_equal(-1e6, &bounds, &smax), vec![-1000.0, -2000.0]);
    }

    #[test]
    fn test_unrated_device_stays_at_zero() {
        let bounds = [(0.0, 0.0), (-2000.0, 2000.0)];
        let smax = [0.0, 2000.0];
        let alloc = keep_all_equal(1500.0, &bounds, &smax);
        assert_eq!(alloc[0], 0.0);
        assert!((alloc[1] - 1500.0).abs() < 1e-3);
    }

    proptest! {
        #[test]
        fn prop_respects_bounds_and_meets_reachable_totals(
            ratings in proptest::collection::vec(1000.0f64..100_000.0, 1..8),
            fraction in -1.0f64..1.0,
        ) {
            let bounds: Vec<_> = ratings.iter().map(|s| (-s, 0.5 * s)).collect();
            let reachable = if fraction < 0.0 {
                -fraction * bounds.iter().map(|b| b.0).sum::<f64>()
            } else {
                fraction * bounds.iter().map(|b| b.1).sum::<f64>()
            };
            let alloc = keep_all_equal(reachable, &bounds, &ratings);
            for (a, (lo, hi)) in alloc.iter().zip(&bounds) {
                prop_assert!(*a >= lo - 1e-6 && *a <= hi + 1e-6);
            }
            prop_assert!((alloc.iter().sum::<f64>() - reachable).abs() < 1e-3);
        }
    }
}
