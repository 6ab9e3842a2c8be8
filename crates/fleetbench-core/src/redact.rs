//! Secret redaction for logs and persisted artifacts.

use std::borrow::Cow;

/// Environment variables whose values never leave the process unmasked.
pub const SECRET_ENV_VARS: &[&str] = &[
    "HF_TOKEN",
    "HUGGING_FACE_HUB_TOKEN",
    "CLOUDRIFT_API_KEY",
    "GCP_SERVICE_ACCOUNT",
    "GOOGLE_APPLICATION_CREDENTIALS",
];

/// Values shorter than this are left alone to avoid masking common words.
const MIN_SECRET_LEN: usize = 8;

const MASK: &str = "***";

/// Replaces known secret values with `***`.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    /// Longest first, so a secret containing another is masked whole.
    secrets: Vec<String>,
}

impl Redactor {
    /// Collect secrets from [`SECRET_ENV_VARS`].
    pub fn from_env() -> Self {
        Self::from_values(
            SECRET_ENV_VARS
                .iter()
                .filter_map(|var| std::env::var(var).ok()),
        )
    }

    /// Build from explicit secret values.
    pub fn from_values<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut secrets: Vec<String> = values
            .into_iter()
            .map(Into::into)
            .filter(|v| v.len() >= MIN_SECRET_LEN)
            .collect();
        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        secrets.dedup();
        Self { secrets }
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Mask every known secret in `text`.
    pub fn redact<'a>(&self, text: &'a str) -> Cow<'a, str> {
        if !self.secrets.iter().any(|s| text.contains(s.as_str())) {
            return Cow::Borrowed(text);
        }
        let mut out = text.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), MASK);
            }
        }
        Cow::Owned(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_known_values() {
        let r = Redactor::from_values(["hf_abcdefghijkl"]);
        assert_eq!(
            r.redact("token=hf_abcdefghijkl done"),
            "token=*** done"
        );
    }

    #[test]
    fn test_short_values_ignored() {
        let r = Redactor::from_values(["short"]);
        assert!(r.is_empty());
        assert_eq!(r.redact("short text"), "short text");
    }

    #[test]
    fn test_longest_secret_wins() {
        let r = Redactor::from_values(["secret-value", "secret-value-extended"]);
        assert_eq!(r.redact("x secret-value-extended y"), "x *** y");
    }

    #[test]
    fn test_no_secret_borrows() {
        let r = Redactor::from_values(["abcdefghij"]);
        assert!(matches!(r.redact("nothing here"), Cow::Borrowed(_)));
    }
}
