use super::near_equal::{keep_all_near_equal, spread_residual, UNKNOWN_SOC};
use super::EPSILON;

/// Operating point that loads devices in SoC order: on charge the emptiest
/// device fills first, on discharge the fullest. Devices with the same SoC
/// share their tier evenly.
pub fn soc_preferred_extreme(total: f64, bounds: &[(f64, f64)], soc: &[Option<f64>]) -> Vec<f64> {
    if total.abs() <= EPSILON {
        return keep_all_near_equal(0.0, bounds);
    }
    let soc_of = |i: usize| soc.get(i).copied().flatten().unwrap_or(UNKNOWN_SOC);
    let mut order: Vec<usize> = (0..bounds.len()).collect();
    if total > 0.0 {
        order.sort_by(|a, b| soc_of(*b).total_cmp(&soc_of(*a)));
    } else {
        order.sort_by(|a, b| soc_of(*a).total_cmp(&soc_of(*b)));
    }

    let mut alloc = vec![0.0; bounds.len()];
    let mut remaining = total;
    let mut start = 0;
    while start < order.len() {
        let tier_soc = soc_of(order[start]);
        let end = order[start..]
            .iter()
            .position(|i| (soc_of(*i) - tier_soc).abs() > EPSILON)
            .map_or(order.len(), |offset| start + offset);
        let tier = &order[start..end];
        let tier_bounds: Vec<(f64, f64)> = tier.iter().map(|i| bounds[*i]).collect();
        let capacity: f64 = if total > 0.0 {
            tier_bounds.iter().map(|b| b.1.max(0.0)).sum()
        } else {
            tier_bounds.iter().map(|b| b.0.min(0.0)).sum()
        };
        let take = if total > 0.0 {
            remaining.min(capacity)
        } else {
            remaining.max(capacity)
        };
        for (i, value) in tier.iter().zip(keep_all_near_equal(take, &tier_bounds)) {
            alloc[*i] = value;
            remaining -= value;
        }
        start = end;
    }
    alloc
}

/// Steps from the last operating point toward [`soc_preferred_extreme`].
///
/// Both points are turned into per-device weights (magnitude in the
/// direction of `total`, scaled so the largest weight is 1). Each weight
/// moves `rate` of the way toward its target weight and `total` is split in
/// proportion to the result. Without a usable last point the extreme point is
/// returned as is.
pub fn move_towards_target(
    total: f64,
    bounds: &[(f64, f64)],
    soc: &[Option<f64>],
    last: Option<&[f64]>,
    rate: f64,
) -> Vec<f64> {
    let target = soc_preferred_extreme(total, bounds, soc);
    let Some(last) = last.filter(|l| l.len() == bounds.len()) else {
        return target;
    };
    if total.abs() <= EPSILON {
        return target;
    }

    let direction = total.signum();
    let (Some(from), Some(to)) = (
        unit_weights(last.iter().map(|l| l * direction)),
        unit_weights(target.iter().map(|t| t * direction)),
    ) else {
        return target;
    };
    let rate = rate.clamp(0.0, 1.0);
    let weights: Vec<f64> = from.iter().zip(&to).map(|(f, t)| f + (t - f) * rate).collect();
    let sum: f64 = weights.iter().sum();
    if sum <= EPSILON {
        return target;
    }
    let alloc = weights.iter().map(|w| total * w / sum).collect();
    spread_residual(total, alloc, bounds)
}

/// Negative parts are dropped and the rest scaled so the largest is 1.
/// `None` when nothing is left.
fn unit_weights(values: impl Iterator<Item = f64>) -> Option<Vec<f64>> {
    let weights: Vec<f64> = values.map(|v| v.max(0.0)).collect();
    let max = weights.iter().copied().fold(0.0, f64::max);
    (max > EPSILON).then(|| weights.iter().map(|w| w / max).collect())
}
