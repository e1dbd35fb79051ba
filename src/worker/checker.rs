//! Answer checking: compares a test case's captured stdout against its
//! expected answer. A byte-oriented, trimmed-line default with a regex
//! escape hatch per problem config, since judge answers are files rather
//! than a single form field.

use regex::RegexBuilder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckerKind {
    /// Trimmed, line-wise whitespace-insensitive comparison (the default).
    Trimmed,
    /// Byte-exact comparison, no trimming.
    Exact,
    /// `pattern` is applied against the trimmed output as a regex.
    Regex,
}

#[derive(Debug, Clone)]
pub struct CheckerConfig {
    pub kind: CheckerKind,
    pub case_insensitive: bool,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            kind: CheckerKind::Trimmed,
            case_insensitive: false,
        }
    }
}

/// `true` means Accepted for this case.
pub fn check_output(config: &CheckerConfig, output: &[u8], expected: &[u8]) -> Result<bool, String> {
    match config.kind {
        CheckerKind::Exact => Ok(output == expected),
        CheckerKind::Trimmed => {
            let output = trimmed_lines(output);
            let expected = trimmed_lines(expected);
            if config.case_insensitive {
                Ok(output.to_lowercase() == expected.to_lowercase())
            } else {
                Ok(output == expected)
            }
        }
        CheckerKind::Regex => {
            let pattern =
                String::from_utf8(expected.to_vec()).map_err(|e| format!("expected pattern isn't valid utf8: {e}"))?;
            let output = String::from_utf8_lossy(output);
            let re = RegexBuilder::new(pattern.trim())
                .case_insensitive(config.case_insensitive)
                .build()
                .map_err(|e| format!("couldn't build checker regex: {e}"))?;
            Ok(re.is_match(output.trim()))
        }
    }
}

/// Each line right-trimmed, blank trailing lines dropped, joined with `\n`.
fn trimmed_lines(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.lines()
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
        .trim_end()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trimmed_ignores_trailing_whitespace_and_blank_lines() {
        let config = CheckerConfig::default();
        assert!(check_output(&config, b"42  \n\n", b"42").unwrap());
    }

    #[test]
    fn exact_is_byte_sensitive() {
        let config = CheckerConfig {
            kind: CheckerKind::Exact,
            case_insensitive: false,
        };
        assert!(!check_output(&config, b"42\n", b"42").unwrap());
        assert!(check_output(&config, b"42", b"42").unwrap());
    }

    #[test]
    fn regex_matches_trimmed_output() {
        let config = CheckerConfig {
            kind: CheckerKind::Regex,
            case_insensitive: true,
        };
        assert!(check_output(&config, b"  Hello World  \n", b"^hello").unwrap());
    }

    #[test]
    fn case_insensitive_trimmed_compares_folded() {
        let config = CheckerConfig {
            kind: CheckerKind::Trimmed,
            case_insensitive: true,
        };
        assert!(check_output(&config, b"YES", b"yes").unwrap());
        assert!(!check_output(&config, b"YES", b"no").unwrap());
    }
}
