/// Reduce a raw spreadsheet cell to a canonical 8-digit CEP.
///
/// Strips every non-digit character and accepts the remainder only if exactly
/// 8 digits are left. Anything else (empty cells, truncated codes, stray
/// text) yields `None` and is silently excluded from the batch.
pub fn normalize_cep(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.len() == 8 {
        Some(digits)
    } else {
        None
    }
}
