use crate::models::Record;

/// Separator between composite key segments. A control character keeps the
/// joined key collision-free against ordinary cell values.
pub const KEY_SEPARATOR: char = '\u{1F}';

/// Build the composite lookup key for a record: trimmed primary value plus
/// each trimmed additional value, joined with [`KEY_SEPARATOR`].
///
/// Returns `None` when the primary column is absent or blank — the record
/// has no usable key and is routed to its side's only-bucket by the caller.
/// Missing additional columns contribute an empty segment instead.
pub fn composite_key(record: &Record, primary: &str, additional: &[String]) -> Option<String> {
    let head = record.get(primary)?.trim();
    if head.is_empty() {
        return None;
    }
    let mut key = String::with_capacity(head.len() + additional.len() * 8);
    key.push_str(head);
    for col in additional {
        key.push(KEY_SEPARATOR);
        key.push_str(record.get(col).unwrap_or("").trim());
    }
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(pairs: &[(&str, &str)]) -> Record {
        Record::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn primary_only() {
        let r = rec(&[("id", " A1 ")]);
        assert_eq!(composite_key(&r, "id", &[]), Some("A1".into()));
    }

    #[test]
    fn additional_segments_in_order() {
        let r = rec(&[("id", "A1"), ("ccy", "USD"), ("branch", "02")]);
        let key = composite_key(&r, "id", &["ccy".into(), "branch".into()]).unwrap();
        assert_eq!(key, format!("A1{sep}USD{sep}02", sep = KEY_SEPARATOR));
    }

    #[test]
    fn missing_primary_is_undefined() {
        let r = rec(&[("other", "x")]);
        assert_eq!(composite_key(&r, "id", &[]), None);
        let blank = rec(&[("id", "   ")]);
        assert_eq!(composite_key(&blank, "id", &[]), None);
    }

    #[test]
    fn missing_additional_becomes_empty_segment() {
        let r = rec(&[("id", "A1")]);
        let key = composite_key(&r, "id", &["ccy".into()]).unwrap();
        assert_eq!(key, format!("A1{}", KEY_SEPARATOR));
    }

    #[test]
    fn no_case_folding() {
        let a = rec(&[("id", "abc")]);
        let b = rec(&[("id", "ABC")]);
        assert_ne!(
            composite_key(&a, "id", &[]),
            composite_key(&b, "id", &[])
        );
    }
}
