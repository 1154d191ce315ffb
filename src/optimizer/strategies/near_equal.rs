use super::{clamp, EPSILON};

/// SoC assumed for devices that do not report one.
pub(crate) const UNKNOWN_SOC: f64 = 50.0;

/// Even split of `total`, clipped to each device's bounds.
///
/// Whatever clipped devices could not take is handed to the remaining
/// devices in proportion to their headroom, repeating until the total is met
/// or every device sits at a bound.
pub fn keep_all_near_equal(total: f64, bounds: &[(f64, f64)]) -> Vec<f64> {
    if bounds.is_empty() {
        return Vec::new();
    }
    let share = total / bounds.len() as f64;
    let alloc = bounds.iter().map(|(lo, hi)| clamp(share, *lo, *hi)).collect();
    spread_residual(total, alloc, bounds)
}

/// Clamps `alloc` into `bounds` and hands the difference to `total` to the
/// devices with headroom, in proportion to that headroom.
pub(crate) fn spread_residual(total: f64, mut alloc: Vec<f64>, bounds: &[(f64, f64)]) -> Vec<f64> {
    for (a, (lo, hi)) in alloc.iter_mut().zip(bounds) {
        *a = clamp(*a, *lo, *hi);
    }
    for _ in 0..bounds.len() {
        let residual = total - alloc.iter().sum::<f64>();
        if residual.abs() <= EPSILON {
            break;
        }
        let headroom: Vec<f64> = alloc
            .iter()
            .zip(bounds)
            .map(|(a, (lo, hi))| {
                let room = if residual > 0.0 { hi - a } else { a - lo };
                room.max(0.0)
            })
            .collect();
        let total_headroom: f64 = headroom.iter().sum();
        if total_headroom <= EPSILON {
            break;
        }
        let fraction = (residual.abs() / total_headroom).min(1.0);
        for ((a, room), (lo, hi)) in alloc.iter_mut().zip(&headroom).zip(bounds) {
            *a = clamp(*a + residual.signum() * room * fraction, *lo, *hi);
        }
    }
    alloc
}

/// SoC-weighted split for long-run balancing.
///
/// On discharge each device is weighted by its SoC, on charge by `100 − SoC`,
/// so full batteries give more and empty batteries take more. Devices whose
/// weighted share falls outside their bounds are pinned to the bound and the
/// rest is re-weighted among the others.
pub fn keep_all_near_equal_soc(total: f64, bounds: &[(f64, f64)], soc: &[Option<f64>]) -> Vec<f64> {
    let weights: Vec<f64> = (0..bounds.len())
        .map(|i| {
            let soc = soc.get(i).copied().flatten().unwrap_or(UNKNOWN_SOC).clamp(0.0, 100.0);
            if total >= 0.0 {
                soc
            } else {
                100.0 - soc
            }
        })
        .collect();

    let mut alloc = vec![0.0; bounds.len()];
    let mut free: Vec<usize> = (0..bounds.len()).collect();
    let mut remaining = total;
    while !free.is_empty() {
        let weight_sum: f64 = free.iter().map(|i| weights[*i]).sum();
        let tentative = |i: usize| {
            if weight_sum > EPSILON {
                remaining * weights[i] / weight_sum
            } else {
                remaining / free.len() as f64
            }
        };
        let clipped: Vec<usize> = free
            .iter()
            .copied()
            .filter(|i| {
                let (lo, hi) = bounds[*i];
                let t = tentative(*i);
                t < lo - EPSILON || t > hi + EPSILON
            })
            .collect();

        if clipped.is_empty() {
            for i in &free {
                alloc[*i] = tentative(*i);
            }
            break;
        }
        let mut taken = 0.0;
        for i in &clipped {
            let (lo, hi) = bounds[*i];
            alloc[*i] = clamp(tentative(*i), lo, hi);
            taken += alloc[*i];
        }
        remaining -= taken;
        free.retain(|i| !clipped.contains(i));
    }
    alloc
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn assert_close(actual: &[f64], expected: &[f64], tolerance: f64) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() <= tolerance, "got {:?}, expected {:?}", actual, expected);
        }
    }

    #[rstest]
    #[case(-8000.0, 4)]
    #[case(12000.0, 3)]
    #[case(0.0, 5)]
    fn test_identical_units_share_evenly(#[case] total: f64, #[case] n: usize) {
        let bounds = vec![(-50000.0, 50000.0); n];
        let alloc = keep_all_near_equal(total, &bounds);
        assert!(alloc.iter().all(|a| (a - total / n as f64).abs() < 1e-9));
    }

    #[test]
    fn test_clipped_excess_goes_to_headroom() {
        let bounds = [(-1000.0, 1000.0), (-5000.0, 5000.0), (-5000.0, 2000.0)];
        let alloc = keep_all_near_equal(7000.0, &bounds);
        // even share 2333.3; the first device takes 1000, the rest by headroom
        assert_close(&alloc, &[1000.0, 4000.0, 2000.0], 1e-6);
    }

    #[test]
    fn test_everything_clipped() {
        let bounds = [(-1000.0, 1000.0), (-2000.0, 2000.0)];
        assert_eq!(keep_all_near_equal(-9000.0, &bounds), vec![-1000.0, -2000.0]);
    }

    #[test]
    fn test_soc_weighted_charge_of_eight_units() {
        let soc: Vec<_> = [9.0, 9.0, 8.0, 13.0, 9.0, 17.0, 7.0, 17.0].into_iter().map(Some).collect();
        let bounds = vec![(-92000.0, 92000.0); 8];
        let alloc = keep_all_near_equal_soc(-8000.0, &bounds, &soc);
        assert_close(
            &alloc,
            &[-1023.9, -1023.9, -1035.2, -978.9, -1023.9, -933.9, -1046.4, -933.9],
            0.1,
        );
        assert!((alloc.iter().sum::<f64>() + 8000.0).abs() < 1e-6);
    }

    #[test]
    fn test_soc_weighted_charge_saturates_limited_unit() {
        // SoC 76/64, the second unit can only charge 10590 W
        let bounds = [(-70800.0, 67260.0), (-10590.0, 92000.0)];
        let soc = [Some(76.0), Some(64.0)];
        let alloc = keep_all_near_equal_soc(-40000.0, &bounds, &soc);
        assert_close(&alloc, &[-29410.0, -10590.0], 1e-6);
    }

    #[test]
    fn test_soc_weighted_discharge_prefers_fuller_unit() {
        let bounds = [(-50000.0, 50000.0); 2];
        let soc = [Some(76.0), Some(64.0)];
        let alloc = keep_all_near_equal_soc(50000.0, &bounds, &soc);
        assert!(alloc[0] > alloc[1]);
        assert_close(&alloc, &[50000.0 * 76.0 / 140.0, 50000.0 * 64.0 / 140.0], 1e-6);
    }

    #[test]
    fn test_soc_weighted_equal_soc_is_even() {
        let bounds = [(-50000.0, 50000.0); 2];
        let soc = [Some(50.0), Some(50.0)];
        assert_close(&keep_all_near_equal_soc(-50000.0, &bounds, &soc), &[-25000.0, -25000.0], 1e-9);
    }

    #[test]
    fn test_soc_weighted_empty_units_fall_back_to_even_split() {
        let bounds = [(-5000.0, 5000.0); 2];
        let soc = [Some(0.0), Some(0.0)];
        assert_close(&keep_all_near_equal_soc(4000.0, &bounds, &soc), &[2000.0, 2000.0], 1e-9);
    }

    #[test]
    fn test_soc_weighted_discharge_beyond_capacity_is_capped() {
        let bounds = [(-92000.0, 92000.0); 3];
        let soc = [Some(90.0), Some(80.0), Some(70.0)];
        let alloc = keep_all_near_equal_soc(270000.0, &bounds, &soc);
        // the fullest units hit their limit first
        assert_eq!(alloc[0], 92000.0);
        assert_eq!(alloc[1], 92000.0);
        assert!((alloc[2] - 86000.0).abs() < 1e-6);
    }

    proptest! {
        #[test]
        fn prop_soc_split_stays_within_bounds(
            socs in proptest::collection::vec(0.0f64..100.0, 1..10),
            total in -200_000.0f64..200_000.0,
        ) {
            let bounds: Vec<_> = (0..socs.len()).map(|i| (-10000.0 * (i + 1) as f64, 8000.0 * (i + 1) as f64)).collect();
            let soc: Vec<_> = socs.iter().copied().map(Some).collect();
            let alloc = keep_all_near_equal_soc(total, &bounds, &soc);
            for (a, (lo, hi)) in alloc.iter().zip(&bounds) {
                prop_assert!(*a >= lo - 1e-6 && *a <= hi + 1e-6);
            }
            let min: f64 = bounds.iter().map(|b| b.0).sum();
            let max: f64 = bounds.iter().map(|b| b.1).sum();
            let expected = total.clamp(min, max);
            prop_assert!((alloc.iter().sum::<f64>() - expected).abs() < 1e-3);
        }

        #[test]
        fn prop_even_split_meets_reachable_total(
            uppers in proptest::collection::vec(100.0f64..50_000.0, 1..10),
            fraction in 0.0f64..1.0,
        ) {
            let bounds: Vec<_> = uppers.iter().map(|u| (-u, *u)).collect();
            let total = fraction * uppers.iter().sum::<f64>();
            let alloc = keep_all_near_equal(total, &bounds);
            prop_assert!((alloc.iter().sum::<f64>() - total).abs() < 1e-3);
        }
    }
}
