/// Returns the exclusive upper bound of the key range covered by `prefix`.
///
/// Every string that starts with `prefix` sorts (byte-wise) in
/// `[prefix, successor)`, and nothing else does. Returns `None` when the
/// range is unbounded above, which happens for the empty prefix and for
/// prefixes made only of `char::MAX`.
pub fn prefix_successor(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        if let Some(next) = next_char(last) {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

fn next_char(c: char) -> Option<char> {
    match c {
        char::MAX => None,
        // skip the surrogate gap
        '\u{D7FF}' => Some('\u{E000}'),
        _ => char::from_u32(c as u32 + 1),
    }
}
