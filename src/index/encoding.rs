//! Wire encoding for the sorted-set path index.
//!
//! Members have the form `<depth>:<path>:<leaf>` where `<depth>` is a
//! fixed-width decimal string, so lexicographic order equals numeric
//! order and a tree-shaped namespace becomes a set of range scans.

/// Sentinel the sorted-set protocol treats as strictly greater than any
/// printable ASCII. Written literally, backslash included.
const UPPER_SENTINEL: &str = "\\xff";

/// Encodes a node depth as a fixed-width big-endian decimal string.
/// Four digits; paths deeper than 9999 nodes do not occur in practice.
pub fn depth_prefix(depth: usize) -> String {
    format!("{depth:04}")
}

/// Encodes one index member.
pub fn encode_member(depth: usize, path: &str, leaf: bool) -> String {
    format!("{}:{}:{}", depth_prefix(depth), path, leaf)
}

/// Decodes an index member into `(path, leaf)`. An unparseable leaf
/// field decodes as false; a member without both separators is rejected.
pub fn decode_member(member: &str) -> Option<(&str, bool)> {
    let mut parts = member.splitn(3, ':');
    let _depth = parts.next()?;
    let path = parts.next()?;
    let leaf = parts.next()?.parse::<bool>().unwrap_or(false);
    Some((path, leaf))
}

/// Builds the inclusive lower range bound for a literal prefix at the
/// given depth. Exact lookups append `:` to force a whole-path boundary.
pub fn range_lower(depth: usize, prefix: &str, exact: bool) -> String {
    let mut lower = format!("[{}:{}", depth_prefix(depth), prefix);
    if exact {
        lower.push(':');
    }
    lower
}

/// Builds the upper range bound for a lower bound.
///
/// A trailing `.` or `:` is escaped with a literal backslash before the
/// sentinel so the bound sorts immediately after every member sharing
/// the prefix; otherwise the sentinel is appended directly.
pub fn range_upper(lower: &str) -> String {
    match lower.chars().last() {
        Some(last @ ('.' | ':')) => {
            format!("{}\\{}{}", &lower[..lower.len() - 1], last, UPPER_SENTINEL)
        }
        _ => format!("{lower}{UPPER_SENTINEL}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_prefix_is_fixed_width() {
        assert_eq!(depth_prefix(1), "0001");
        assert_eq!(depth_prefix(42), "0042");
        assert_eq!(depth_prefix(9999), "9999");
    }

    #[test]
    fn test_depth_prefix_sorts_numerically() {
        let depths: Vec<String> = [1, 2, 9, 10, 99, 100].iter().map(|&d| depth_prefix(d)).collect();
        let mut sorted = depths.clone();
        sorted.sort();
        assert_eq!(depths, sorted);
    }

    #[test]
    fn test_member_round_trip() {
        for (depth, path, leaf) in [
            (1, "a", false),
            (3, "a.b.c", true),
            (5, "sys.host-1.cpu_user.total.rate", false),
        ] {
            let member = encode_member(depth, path, leaf);
            let (decoded_path, decoded_leaf) = decode_member(&member).expect("decodes");
            assert_eq!(decoded_path, path);
            assert_eq!(decoded_leaf, leaf);
        }
    }

    #[test]
    fn test_decode_member_unparseable_leaf_is_false() {
        assert_eq!(decode_member("0002:a.b:maybe"), Some(("a.b", false)));
    }

    #[test]
    fn test_decode_member_rejects_missing_fields() {
        assert!(decode_member("0002:a.b").is_none());
        assert!(decode_member("").is_none());
    }

    #[test]
    fn test_range_lower_exact_appends_separator() {
        assert_eq!(range_lower(3, "a.b.c", true), "[0003:a.b.c:");
        assert_eq!(range_lower(5, "a.b.c.d.", false), "[0005:a.b.c.d.");
    }

    #[test]
    fn test_range_upper_escapes_trailing_terminators() {
        assert_eq!(range_upper("[0005:a.b.c.d."), "[0005:a.b.c.d\\.\\xff");
        assert_eq!(range_upper("[0003:a.b.c:"), "[0003:a.b.c\\:\\xff");
        assert_eq!(range_upper("[0002:a.b"), "[0002:a.b\\xff");
    }

    /// Every member with the queried depth and prefix must sort inside
    /// [lower, upper]; members at other depths must not.
    #[test]
    fn test_range_bounds_cover_prefix_at_depth() {
        let members = [
            encode_member(4, "a.b.c.d", false),
            encode_member(5, "a.b.c.d.e", true),
            encode_member(5, "a.b.c.d.f", true),
            encode_member(5, "a.b.x.y.z", true),
            encode_member(6, "a.b.c.d.e.f", true),
        ];

        let lower = range_lower(5, "a.b.c.d.", false);
        let upper = range_upper(&lower);

        // Strip the inclusive-range marker for raw comparison.
        let lo = &lower[1..];
        let hi = &upper[1..];

        let in_range: Vec<&str> = members
            .iter()
            .map(String::as_str)
            .filter(|m| *m >= lo && *m <= hi)
            .collect();

        assert_eq!(in_range, vec!["0005:a.b.c.d.e:true", "0005:a.b.c.d.f:true"]);
    }
}
