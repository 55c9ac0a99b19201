use crate::error::AppError;
use config::{Config as Cfg, Environment, File};
use serde::de::DeserializeOwned;

/// Load a configuration struct from an optional `configuration.*` file in the
/// working directory, overridden by `APP__`-prefixed environment variables
/// (`APP__DATABASE__URL` sets `database.url`).
pub fn load<T: DeserializeOwned>() -> Result<T, AppError> {
    dotenvy::dotenv().ok();

    let config = Cfg::builder()
        .add_source(File::with_name("configuration").required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    Ok(config.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serial_test::serial;

    #[derive(Debug, Deserialize)]
    struct Sample {
        #[serde(default)]
        section: SampleSection,
    }

    #[derive(Debug, Default, Deserialize)]
    struct SampleSection {
        #[serde(default)]
        name: Option<String>,
    }

    #[test]
    #[serial]
    fn environment_overrides_nested_keys() {
        unsafe { std::env::set_var("APP__SECTION__NAME", "from-env") };
        let loaded: Sample = load().unwrap();
        unsafe { std::env::remove_var("APP__SECTION__NAME") };
        assert_eq!(loaded.section.name.as_deref(), Some("from-env"));
    }

    #[test]
    #[serial]
    fn missing_sources_fall_back_to_defaults() {
        let loaded: Sample = load().unwrap();
        assert!(loaded.section.name.is_none());
    }
}
