use anyhow::{anyhow, Result};
use regex::Regex;
use std::env;
use std::sync::OnceLock;

fn pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-(.*?))?\}").expect("envsubst pattern")
    })
}

/// Expand `${VAR}` and `${VAR:-default}` references in raw config text.
/// A reference without a default to an unset variable is an error.
pub fn expand_env(input: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in pattern().captures_iter(input) {
        let whole = caps.get(0).expect("match 0");
        out.push_str(&input[last..whole.start()]);
        let key = caps.get(1).expect("var name").as_str();
        match env::var(key) {
            Ok(value) => out.push_str(&value),
            Err(_) => match caps.get(2) {
                Some(default) => out.push_str(default.as_str()),
                None => return Err(anyhow!("missing environment variable: {}", key)),
            },
        }
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(expand_env("listen: 127.0.0.1:16789").unwrap(), "listen: 127.0.0.1:16789");
    }

    #[test]
    fn set_variable_expands() {
        env::set_var("TAPX_TEST_SESSION", "checkout-run");
        assert_eq!(expand_env("name: ${TAPX_TEST_SESSION}").unwrap(), "name: checkout-run");
        env::remove_var("TAPX_TEST_SESSION");
    }

    #[test]
    fn default_applies_when_unset() {
        env::remove_var("TAPX_TEST_MODE");
        assert_eq!(expand_env("mode: ${TAPX_TEST_MODE:-record}").unwrap(), "mode: record");
    }

    #[test]
    fn missing_variable_without_default_fails() {
        env::remove_var("TAPX_TEST_ABSENT");
        assert!(expand_env("${TAPX_TEST_ABSENT}").is_err());
    }

    #[test]
    fn surrounding_text_is_preserved() {
        env::set_var("TAPX_TEST_PORT", "5432");
        assert_eq!(
            expand_env("target: 10.0.0.4:${TAPX_TEST_PORT}/db").unwrap(),
            "target: 10.0.0.4:5432/db"
        );
        env::remove_var("TAPX_TEST_PORT");
    }
}
