//! Secret wrapper for sensitive values

use std::fmt;
use zeroize::Zeroize;

/// Characters of a credential shown before the ellipsis in a preview.
const PREVIEW_PREFIX: usize = 10;
/// Characters of a credential shown after the ellipsis in a preview.
const PREVIEW_SUFFIX: usize = 4;

/// Sensitive value - redacted in Debug/Display/logs
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    /// Create a new secret value
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    /// Prefix/suffix preview for logs and status views, e.g. `AIzaSyA1b2...wxyz`.
    ///
    /// Values too short to hide a meaningful middle section only show a
    /// quarter of their characters so the preview never reconstructs the key.
    pub fn preview(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= (PREVIEW_PREFIX + PREVIEW_SUFFIX) * 2 {
            let shown: String = chars.iter().take(chars.len() / 4).collect();
            return format!("{shown}...");
        }
        let head: String = chars[..PREVIEW_PREFIX].iter().collect();
        let tail: String = chars[chars.len() - PREVIEW_SUFFIX..].iter().collect();
        format!("{head}...{tail}")
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl From<String> for Secret<String> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Secret<String> {
    fn from(value: &str) -> Self {
        Self::new(value.to_owned())
    }
}
