//! Scrape values out of captured tool output.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::ExtractionFailure;

/// A `0x`-prefixed, 32-byte hex token not embedded in a longer hex run.
static TX_HASH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^0-9A-Za-z])(0x[0-9a-fA-F]{64})(?:$|[^0-9a-fA-F])").expect("valid regex")
});

/// What to look for in a step's output.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// A transaction hash: `0x` followed by exactly 64 hex digits.
    TxHash,
    /// A custom expression. The first capture group is returned when the
    /// expression has one, otherwise the whole match.
    Regex(Regex),
}

impl Pattern {
    /// Build a custom pattern.
    pub fn regex(expr: &str) -> Result<Self, regex::Error> {
        Regex::new(expr).map(Pattern::Regex)
    }
}

/// Return the first match of `pattern` in `text`, by position.
pub fn extract(text: &str, pattern: &Pattern) -> Result<String, ExtractionFailure> {
    let found = match pattern {
        Pattern::TxHash => TX_HASH
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string()),
        Pattern::Regex(re) => re.captures(text).and_then(|caps| {
            caps.get(1)
                .or_else(|| caps.get(0))
                .map(|m| m.as_str().to_string())
        }),
    };

    found.ok_or_else(ExtractionFailure::not_found)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH_A: &str = "0xa1b2c3d4e5f60718293a4b5c6d7e8f90a1b2c3d4e5f60718293a4b5c6d7e8f90";
    const HASH_B: &str = "0x0000000000000000000000000000000000000000000000000000000000000001";

    #[test]
    fn test_single_hash() {
        let output = format!("Deploying rollup...\nTransaction Hash: {HASH_A}\nDone.");
        assert_eq!(extract(&output, &Pattern::TxHash).unwrap(), HASH_A);
    }

    #[test]
    fn test_first_match_wins() {
        let output = format!("Hash: {HASH_B}\nanother: {HASH_A}");
        assert_eq!(extract(&output, &Pattern::TxHash).unwrap(), HASH_B);

        let output = format!("{HASH_A} {HASH_B}");
        assert_eq!(extract(&output, &Pattern::TxHash).unwrap(), HASH_A);
    }

    #[test]
    fn test_no_match() {
        let err = extract("address 0x1234 deployed", &Pattern::TxHash).unwrap_err();
        assert_eq!(err.reason, "pattern not found");
        assert!(extract("", &Pattern::TxHash).is_err());
    }

    #[test]
    fn test_rejects_longer_hex_runs() {
        // 65 hex digits is not a hash.
        let too_long = format!("{HASH_A}f");
        assert!(extract(&too_long, &Pattern::TxHash).is_err());

        let with_follower = format!("{too_long}\nHash: {HASH_B}.");
        assert_eq!(extract(&with_follower, &Pattern::TxHash).unwrap(), HASH_B);
    }

    #[test]
    fn test_custom_pattern() {
        let pattern = Pattern::regex(r"Rollup address: (0x[0-9a-fA-F]{40})").unwrap();
        let output = "Rollup address: 0x5FbDB2315678afecb367f032d93F642f64180aa3\n";
        assert_eq!(
            extract(output, &pattern).unwrap(),
            "0x5FbDB2315678afecb367f032d93F642f64180aa3"
        );

        let whole = Pattern::regex(r"v\d+\.\d+\.\d+").unwrap();
        assert_eq!(extract("op-deployer v0.5.0-rc.2", &whole).unwrap(), "v0.5.0");
    }
}
