/// Field-level equality with a numeric tolerance.
///
/// Strings that compare equal are equal, full stop. Otherwise both sides
/// are parsed as decimal numbers; if both parse, they are equal when their
/// absolute difference is within `tolerance`. A pair where either side is
/// non-numeric falls back to the (already failed) string comparison.
pub fn values_equal(a: &str, b: &str, tolerance: f64) -> bool {
    if a == b {
        return true;
    }
    match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
        (Ok(x), Ok(y)) => (x - y).abs() <= tolerance,
        _ => false,
    }
}
