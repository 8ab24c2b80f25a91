use std::{env, fmt::Display, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }

    pub fn from_env() -> Self {
        match env::var("ENVIRONMENT")
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
            .as_str()
        {
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        }
    }
}

/// Read `key` from the environment and parse it.
///
/// Unset or blank variables resolve to `None`. A value that is set but does
/// not parse is an error naming the variable, so typos surface at startup
/// instead of silently falling back to a default.
pub fn env_parse<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{key}={raw:?} is invalid: {e}")),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(anyhow::anyhow!("{key} is not valid unicode: {e}")),
    }
}

/// Parse a boolean flag the way launch files write them.
pub fn env_flag(key: &str) -> anyhow::Result<Option<bool>> {
    let Some(raw) = env_parse::<String>(key)? else {
        return Ok(None);
    };
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        other => anyhow::bail!("{key}={other:?} is not a boolean"),
    }
}
