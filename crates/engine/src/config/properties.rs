//! Key/value property source.
//!
//! Keys use the dotted form (`email.host`, `contentstorage.fs.rootFolder`).
//! A key missing from the explicit map falls back to its environment-variable
//! form: upper-cased, with `.` and `-` replaced by `_` (`EMAIL_HOST`,
//! `CONTENTSTORAGE_FS_ROOTFOLDER`).

use std::collections::BTreeMap;
use std::str::FromStr;

use super::ConfigError;

#[derive(Debug, Clone, Default)]
pub struct EngineProperties {
    values: BTreeMap<String, String>,
    env: BTreeMap<String, String>,
}

impl EngineProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Properties backed by the process environment.
    pub fn from_env() -> Self {
        Self::from_env_vars(std::env::vars())
    }

    /// Properties backed by the given environment-style variables.
    pub fn from_env_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: BTreeMap::new(),
            env: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn from_map<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: values.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            env: BTreeMap::new(),
        }
    }

    /// Set an explicit value; explicit values win over the environment.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .or_else(|| self.env.get(&env_name(key)))
            .map(String::as_str)
    }

    /// Value if present and non-blank.
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.trim().is_empty())
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn require(&self, key: &str) -> Result<&str, ConfigError> {
        self.get_non_empty(key)
            .ok_or_else(|| ConfigError::MissingProperty(key.to_string()))
    }

    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get_non_empty(key)
            .map(|raw| {
                raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidProperty {
                    key: key.to_string(),
                    value: raw.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    pub fn get_parsed_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.get_parsed(key)?.unwrap_or(default))
    }

    pub fn require_parsed<T>(&self, key: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get_parsed(key)?
            .ok_or_else(|| ConfigError::MissingProperty(key.to_string()))
    }

    /// Booleans accept `true`/`false` in any case.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        self.get_non_empty(key)
            .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                _ => Err(ConfigError::InvalidProperty {
                    key: key.to_string(),
                    value: raw.to_string(),
                    reason: "expected true or false".to_string(),
                }),
            })
            .transpose()
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        Ok(self.get_bool(key)?.unwrap_or(default))
    }
}

/// `email.useCredentials` -> `EMAIL_USECREDENTIALS`
pub fn env_name(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '.' | '-' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_names() {
        assert_eq!(env_name("email.host"), "EMAIL_HOST");
        assert_eq!(
            env_name("flowforge.async-executor.core-pool-size"),
            "FLOWFORGE_ASYNC_EXECUTOR_CORE_POOL_SIZE"
        );
        assert_eq!(env_name("contentstorage.fs.rootFolder"), "CONTENTSTORAGE_FS_ROOTFOLDER");
    }

    #[test]
    fn explicit_values_win_over_environment() {
        let props = EngineProperties::from_env_vars([("EMAIL_HOST", "env.example.com")]);
        assert_eq!(props.get("email.host"), Some("env.example.com"));

        let props = props.with("email.host", "map.example.com");
        assert_eq!(props.get("email.host"), Some("map.example.com"));
    }

    #[test]
    fn typed_getters() {
        let props = EngineProperties::from_map([
            ("port", "2525"),
            ("bad", "x25"),
            ("flag", "TRUE"),
            ("blank", "  "),
        ]);

        assert_eq!(props.get_parsed::<u16>("port").unwrap(), Some(2525));
        assert_eq!(props.get_parsed_or::<u16>("missing", 25).unwrap(), 25);
        assert!(matches!(
            props.get_parsed::<u16>("bad"),
            Err(ConfigError::InvalidProperty { .. })
        ));
        assert_eq!(props.get_bool("flag").unwrap(), Some(true));
        assert!(props.get_bool("port").is_err());
        assert_eq!(props.get_non_empty("blank"), None);
        assert!(matches!(props.require("blank"), Err(ConfigError::MissingProperty(_))));
        assert!(matches!(
            props.require_parsed::<u16>("missing"),
            Err(ConfigError::MissingProperty(_))
        ));
    }
}
