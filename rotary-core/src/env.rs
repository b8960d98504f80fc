//! Small helpers for reading optional environment variables.

use std::str::FromStr;

use anyhow::{Context, Result};

/// Parse `var` from the environment, falling back to `default` when unset.
/// A set-but-unparsable value is an error, not a silent fallback.
pub fn parse_var_with_err<T>(var: &str, default: impl Into<T>) -> Result<T>
where
    T: FromStr,
    <T as FromStr>::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(var) {
        Ok(val) => val
            .parse::<T>()
            .with_context(|| format!("failed to parse env var {var}={val}")),
        Err(_) => Ok(default.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_var_uses_default() {
        let got: String = parse_var_with_err("ROTARY_TEST_UNSET_VAR", "fallback").unwrap();
        assert_eq!(got, "fallback");
    }

    #[test]
    fn set_var_parses() {
        std::env::set_var("ROTARY_TEST_SET_VAR", "17");
        let got: u32 = parse_var_with_err("ROTARY_TEST_SET_VAR", 3u32).unwrap();
        assert_eq!(got, 17);
        std::env::remove_var("ROTARY_TEST_SET_VAR");
    }
}
