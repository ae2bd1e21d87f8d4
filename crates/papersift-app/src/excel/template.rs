//! Template-mode column projection: a deterministic union of field names
//! across a set of completed documents.

use std::collections::BTreeMap;

/// Order the union of field names by `(first_seen asc, frequency desc,
/// name asc)`. Fields that appear early and often surface first, and the
/// result is a pure function of the input sequence.
pub fn template_columns<I, S>(field_sets: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: IntoIterator<Item = S>,
    S: Into<String>,
{
    #[derive(Debug)]
    struct Stats {
        first_seen: usize,
        frequency: usize,
    }

    let mut stats: BTreeMap<String, Stats> = BTreeMap::new();
    for (position, set) in field_sets.into_iter().enumerate() {
        for name in set {
            let name = name.into();
            stats
                .entry(name)
                .and_modify(|entry| entry.frequency += 1)
                .or_insert(Stats {
                    first_seen: position,
                    frequency: 1,
                });
        }
    }

    let mut columns: Vec<(String, Stats)> = stats.into_iter().collect();
    columns.sort_by(|(name_a, a), (name_b, b)| {
        a.first_seen
            .cmp(&b.first_seen)
            .then(b.frequency.cmp(&a.frequency))
            .then(name_a.cmp(name_b))
    });
    columns.into_iter().map(|(name, _)| name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_scenario_ordering() {
        // A {invoice_number, total}, B {invoice_number, date, total},
        // C {name, total} -> invoice_number, total, date, name.
        let columns = template_columns([
            vec!["invoice_number", "total"],
            vec!["invoice_number", "date", "total"],
            vec!["name", "total"],
        ]);
        assert_eq!(columns, vec!["invoice_number", "total", "date", "name"]);
    }

    #[test]
    fn frequency_breaks_first_seen_ties() {
        let columns = template_columns([
            vec!["alpha", "beta"],
            vec!["beta"],
            vec!["beta", "alpha"],
            vec!["beta"],
        ]);
        // Both first seen at position 0; beta appears in 4 sets, alpha in 2.
        assert_eq!(columns, vec!["beta", "alpha"]);
    }

    #[test]
    fn name_breaks_full_ties() {
        let columns = template_columns([vec!["zeta", "eta"]]);
        assert_eq!(columns, vec!["eta", "zeta"]);
    }

    #[test]
    fn projection_is_input_order_dependent_but_deterministic() {
        let forward = template_columns([vec!["a"], vec!["b"]]);
        let backward = template_columns([vec!["b"], vec!["a"]]);
        assert_eq!(forward, vec!["a", "b"]);
        assert_eq!(backward, vec!["b", "a"]);
    }

    #[test]
    fn empty_input_yields_no_columns() {
        let columns = template_columns(Vec::<Vec<String>>::new());
        assert!(columns.is_empty());
    }

    #[test]
    fn higher_frequency_wins_regardless_of_in_set_order() {
        // y: first_seen 0, frequency 2; x: first_seen 0, frequency 1 -> y first.
        assert_eq!(template_columns([vec!["x", "y"], vec!["y"]]), vec!["y", "x"]);
        assert_eq!(template_columns([vec!["y", "x"], vec!["y"]]), vec!["y", "x"]);
    }
}
