use std::cmp::Ordering;

/// Orders registry panel versions by dotted components.
///
/// Components made only of ASCII digits compare numerically (so `1.6 < 1.26`
/// and `0.0001 < 999.999`). Other components compare lexicographically and
/// always sort after numeric ones, which keeps the order transitive. Empty
/// and missing trailing components count as `0`, so `1` and `1.0` compare
/// equal.
#[must_use]
pub fn compare_versions(lhs: &str, rhs: &str) -> Ordering {
    let mut left = lhs.trim().split('.');
    let mut right = rhs.trim().split('.');

    loop {
        let ordering = match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(l), None) => compare_component(l, "0"),
            (None, Some(r)) => compare_component("0", r),
            (Some(l), Some(r)) => compare_component(l, r),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
}

fn compare_component(lhs: &str, rhs: &str) -> Ordering {
    let lhs = if lhs.is_empty() { "0" } else { lhs };
    let rhs = if rhs.is_empty() { "0" } else { rhs };
    match (is_numeric(lhs), is_numeric(rhs)) {
        (true, true) => {
            // Digit strings of any length: strip leading zeros, then longer is larger.
            let l = lhs.trim_start_matches('0');
            let r = rhs.trim_start_matches('0');
            l.len().cmp(&r.len()).then_with(|| l.cmp(r))
        }
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => lhs.cmp(rhs),
    }
}

fn is_numeric(component: &str) -> bool {
    !component.is_empty() && component.bytes().all(|byte| byte.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn numeric_components_beat_string_ordering() {
        assert_eq!(compare_versions("1.6", "1.26"), Ordering::Less);
        assert_eq!(compare_versions("0.0001", "999.999"), Ordering::Less);
        assert_eq!(compare_versions("1.112", "9.9999"), Ordering::Less);
        assert_eq!(compare_versions("9.9999", "1.112"), Ordering::Greater);
        assert_eq!(compare_versions("2.0", "1.26"), Ordering::Greater);
    }

    #[test]
    fn trailing_zero_components_are_equal() {
        assert_eq!(compare_versions("1", "1.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.0.0", "1"), Ordering::Equal);
        assert_eq!(compare_versions("1.01", "1.1"), Ordering::Equal);
    }

    #[test]
    fn non_numeric_components_fall_back_to_lexicographic() {
        assert_eq!(compare_versions("1.beta", "1.alpha"), Ordering::Greater);
        assert_eq!(compare_versions("1.2rc", "1.2"), Ordering::Greater);
        assert_eq!(compare_versions("", ""), Ordering::Equal);
        assert_eq!(compare_versions("..", "1"), Ordering::Less);
    }

    #[test]
    fn mixed_components_rank_numeric_before_text() {
        assert_eq!(compare_versions("9", "10"), Ordering::Less);
        assert_eq!(compare_versions("10", "1x"), Ordering::Less);
        assert_eq!(compare_versions("9", "1x"), Ordering::Less);
        assert_eq!(compare_versions("1.99", "1.a"), Ordering::Less);
    }

    #[test]
    fn huge_components_do_not_overflow() {
        let big = "123456789012345678901234567890";
        assert_eq!(
            compare_versions(&format!("1.{big}"), "1.99999999999999999999"),
            Ordering::Greater
        );
    }

    proptest! {
        #[test]
        fn two_part_versions_order_like_integer_pairs(a in 0_u32..5000, b in 0_u32..5000, c in 0_u32..5000, d in 0_u32..5000) {
            let lhs = format!("{a}.{b}");
            let rhs = format!("{c}.{d}");
            prop_assert_eq!(compare_versions(&lhs, &rhs), (a, b).cmp(&(c, d)));
        }

        #[test]
        fn comparison_is_antisymmetric_for_any_input(lhs in "[0-9a-z.]{0,12}", rhs in "[0-9a-z.]{0,12}") {
            prop_assert_eq!(compare_versions(&lhs, &rhs), compare_versions(&rhs, &lhs).reverse());
        }

        #[test]
        fn comparison_is_transitive(
            a in "[0-9a-z]{0,3}(\\.[0-9a-z]{0,3}){0,2}",
            b in "[0-9a-z]{0,3}(\\.[0-9a-z]{0,3}){0,2}",
            c in "[0-9a-z]{0,3}(\\.[0-9a-z]{0,3}){0,2}"
        ) {
            let values = [a.as_str(), b.as_str(), c.as_str()];
            for (i, j, k) in [(0, 1, 2), (0, 2, 1), (1, 0, 2), (1, 2, 0), (2, 0, 1), (2, 1, 0)] {
                let (x, y, z) = (values[i], values[j], values[k]);
                if compare_versions(x, y) != Ordering::Greater && compare_versions(y, z) != Ordering::Greater {
                    prop_assert_ne!(compare_versions(x, z), Ordering::Greater);
                }
            }
        }

        #[test]
        fn comparison_is_reflexive(raw in "\\PC{0,16}") {
            prop_assert_eq!(compare_versions(&raw, &raw), Ordering::Equal);
        }
    }
}
