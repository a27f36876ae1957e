//! Utility modules.

pub mod retry;
pub mod text;

pub use retry::{Backoff, RetryConfig, RetryResult, Retryable, with_retry};
pub use text::{
    CHARS_PER_TOKEN, char_budget, estimate_tokens, normalize_text, preview, truncate_chars,
};
