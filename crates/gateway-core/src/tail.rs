/// Last `max` characters of `s`.
///
/// Inputs are pre-sliced to the trailing `max * 4` bytes (adjusted forward
/// to a char boundary) so pathological multi-megabyte logs never get fully
/// counted char by char.
pub fn tail_chars(s: &str, max: usize) -> String {
    if max == 0 || s.is_empty() {
        return String::new();
    }

    let mut start = s.len().saturating_sub(max.saturating_mul(4));
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    let sliced = &s[start..];

    let count = sliced.chars().count();
    if count <= max {
        return sliced.to_string();
    }
    sliced.chars().skip(count - max).collect()
}
