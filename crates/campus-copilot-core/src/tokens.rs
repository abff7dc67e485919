//! Token estimation.
//!
//! Budgets throughout the pipeline (context blocks, session windows, chunk
//! sizes) are expressed in tokens. The estimate is a 4 chars/token heuristic
//! counted over Unicode scalar values, rounded up, so it never reports zero
//! tokens for non-empty text.

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token count of `text`.
///
/// ```rust
/// use campus_copilot_core::tokens::estimate_tokens;
///
/// assert_eq!(estimate_tokens(""), 0);
/// assert_eq!(estimate_tokens("abc"), 1);
/// assert_eq!(estimate_tokens("abcdefgh"), 2);
/// ```
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    chars.div_ceil(CHARS_PER_TOKEN)
}

/// Convert a token budget to an approximate character budget.
pub fn tokens_to_chars(tokens: usize) -> usize {
    tokens.saturating_mul(CHARS_PER_TOKEN)
}
