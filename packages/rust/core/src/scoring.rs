//! Confidence scoring for a successful repair.

use std::collections::BTreeMap;

use leadgarage_shared::Record;

/// Points per repaired field before the multiplier.
const POINTS_PER_FIELD: u32 = 20;

/// The proposed fields whose value differs from the record's current value.
///
/// A spoke result that changes nothing is not a repair.
pub fn changed_fields(
    original: &Record,
    proposed: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    proposed
        .iter()
        .filter(|(name, value)| original.fields.get(*name) != Some(*value))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Score a repair: `floor(min(n * 20, 100) * multiplier)`, clamped to `[0, 100]`,
/// where `n` is the number of repaired fields.
pub fn score(repaired: &BTreeMap<String, String>, multiplier: f64) -> u8 {
    if repaired.is_empty() {
        return 0;
    }
    let count = u32::try_from(repaired.len()).unwrap_or(u32::MAX);
    let base = count.saturating_mul(POINTS_PER_FIELD).min(100);
    let scaled = (f64::from(base) * multiplier.clamp(0.0, 1.0)).floor();
    scaled.clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadgarage_shared::RecordType;

    fn repaired(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn person() -> Record {
        Record::new(
            RecordType::Person,
            repaired(&[("title", "CFO"), ("first_name", "John")]),
        )
    }

    #[test]
    fn one_field_at_085() {
        assert_eq!(score(&repaired(&[("email", "j.smith@acme.com")]), 0.85), 17);
    }

    #[test]
    fn empty_repair_scores_zero() {
        assert_eq!(score(&BTreeMap::new(), 1.0), 0);
    }

    #[test]
    fn caps_at_one_hundred() {
        let many = repaired(&[
            ("a", "1"),
            ("b", "2"),
            ("c", "3"),
            ("d", "4"),
            ("e", "5"),
            ("f", "6"),
        ]);
        assert_eq!(score(&many, 1.0), 100);
        assert_eq!(score(&many, 0.7), 70);
    }

    #[test]
    fn multiplier_bounds() {
        let one = repaired(&[("email", "j@acme.com")]);
        assert_eq!(score(&one, 0.0), 0);
        assert_eq!(score(&one, 1.0), 20);
    }

    #[test]
    fn unchanged_values_are_not_repairs() {
        let proposed = repaired(&[("title", "CFO"), ("email", "j@acme.com")]);
        assert_eq!(
            changed_fields(&person(), &proposed),
            repaired(&[("email", "j@acme.com")])
        );
        assert!(changed_fields(&person(), &repaired(&[("title", "CFO")])).is_empty());
    }
}
