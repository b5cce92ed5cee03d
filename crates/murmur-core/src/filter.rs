//! Room message moderation: length cap plus regex redaction.

use regex::Regex;

use crate::config::BadWord;

/// Applies the configured text rules to room message bodies.
#[derive(Debug, Clone)]
pub struct Moderator {
    max_len: usize,
    rules: Vec<(Regex, String)>,
}

impl Moderator {
    /// Compile the redaction rules.
    ///
    /// # Errors
    ///
    /// Returns an error if a pattern is not a valid regular expression.
    pub fn new(max_len: usize, bad_words: &[BadWord]) -> Result<Self, regex::Error> {
        let rules = bad_words
            .iter()
            .map(|w| Ok((Regex::new(&w.pattern)?, w.replacement.clone())))
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { max_len, rules })
    }

    /// Truncate to the maximum length, then apply every rule in order.
    #[must_use]
    pub fn apply(&self, body: &str) -> String {
        let mut text = if self.max_len > 0 {
            body.chars().take(self.max_len).collect()
        } else {
            body.to_string()
        };

        for (pattern, replacement) in &self.rules {
            text = pattern
                .replace_all(&text, regex::NoExpand(replacement))
                .into_owned();
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_bad_words;

    #[test]
    fn test_default_rules() {
        let moderator = Moderator::new(0, &default_bad_words()).unwrap();

        assert_eq!(moderator.apply("what the fuuuck"), "what the f***");
        assert_eq!(
            moderator.apply("see http://example.com now"),
            "see --link-hide-- now"
        );
        assert_eq!(
            moderator.apply("join telegram.me/chan"),
            "join --telegram-hide--"
        );
        assert_eq!(moderator.apply("plain"), "plain");
    }

    #[test]
    fn test_truncate_by_chars() {
        let moderator = Moderator::new(3, &[]).unwrap();
        assert_eq!(moderator.apply("héllo"), "hél");
        assert_eq!(moderator.apply("hi"), "hi");
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(Moderator::new(0, &[BadWord::new("(", "x")]).is_err());
    }
}
