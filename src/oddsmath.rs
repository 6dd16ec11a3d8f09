//! American-odds arithmetic and the small stats kernel (median, population
//! standard deviation) the consensus and CLV engines share.

/// Converts American odds to implied probability.
///
/// Negative odds (favorite): `p = -odds / (-odds + 100)`.
/// Positive odds (underdog): `p = 100 / (odds + 100)`.
pub fn implied_probability(american_odds: f64) -> f64 {
    if american_odds < 0.0 {
        -american_odds / (-american_odds + 100.0)
    } else {
        100.0 / (american_odds + 100.0)
    }
}

/// Inverse of [`implied_probability`]. Clamps `p` away from 0/1 to avoid
/// producing an infinite or zero line.
pub fn probability_to_american(p: f64) -> f64 {
    let p = p.clamp(0.0001, 0.9999);
    if p >= 0.5 {
        -(p / (1.0 - p)) * 100.0
    } else {
        ((1.0 - p) / p) * 100.0
    }
}

/// Median of a slice of `f64`. Returns `None` for an empty slice.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}

/// Population standard deviation (`pstdev`), matching the spec's use of
/// `statistics.pstdev` rather than the sample variant. Returns `None` for
/// fewer than 2 values (pstdev of a single point is 0, but dispersion over
/// a single book isn't meaningful here).
pub fn pstdev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    Some(variance.sqrt())
}

/// Snaps a line to the nearest 0.5 grid point, used when enumerating
/// integer/half-point thresholds crossed between two observed lines.
pub fn round_to_half(value: f64) -> f64 {
    (value * 2.0).round() / 2.0
}

/// Snaps a probability to the nearest 0.025 grid point, used when
/// enumerating exchange probability thresholds crossed between two
/// observed quotes.
pub fn round_to_probability_grid(value: f64) -> f64 {
    (value * 40.0).round() / 40.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn favorite_odds_convert_to_probability() {
        assert_relative_eq!(implied_probability(-110.0), 0.5238, epsilon = 0.0001);
    }

    #[test]
    fn underdog_odds_convert_to_probability() {
        assert_relative_eq!(implied_probability(120.0), 0.4545, epsilon = 0.0001);
    }

    #[test]
    fn probability_round_trips_through_american_odds() {
        let p = implied_probability(-150.0);
        let odds = probability_to_american(p);
        assert_relative_eq!(odds, -150.0, epsilon = 0.5);
    }

    #[test]
    fn median_of_even_count_averages_middle_two() {
        assert_eq!(median(&[1.0, 2.0, 3.0, 4.0]), Some(2.5));
    }

    #[test]
    fn pstdev_of_single_value_is_none() {
        assert_eq!(pstdev(&[5.0]), None);
    }

    #[test]
    fn grid_rounding_snaps_to_nearest_step() {
        assert_eq!(round_to_half(-3.24), -3.0);
        assert_eq!(round_to_half(-3.26), -3.5);
        assert_eq!(round_to_probability_grid(0.5623), 0.55);
    }
}
