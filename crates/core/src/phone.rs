//! Caller phone number normalization

/// Normalize to E.164 where the digit count allows it.
///
/// Ten digits are treated as a North American number (`+1` prefix); longer
/// numbers already carry a country code. Anything shorter is returned trimmed.
pub fn normalize_phone_number(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    match digits.len() {
        10 => format!("+1{}", digits),
        n if n > 10 => format!("+{}", digits),
        _ => raw.trim().to_string(),
    }
}
