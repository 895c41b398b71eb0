use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

use super::error::ConfigError;

/// Shared behavior of the YAML configurations used by each tool.
///
/// Configs are serializable and deserializable to YAML using serde and serde_yaml. The
/// `Default` value of a config is the template written by `cryoem_tools new`.
pub trait YamlConfig: Serialize + DeserializeOwned + Default {
    /// Read the configuration in a YAML file and validate it.
    /// Returns the config if successful
    fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;
        let config = serde_yaml::from_str::<Self>(&yaml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default configuration to a YAML file
    fn write_template(config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(&Self::default())?;
        std::fs::write(config_path, yaml_str)?;
        Ok(())
    }

    /// Check the values of the config. Called after every read.
    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }
}

/// Expand a leading `~` to the user's home directory. Any other path is returned as is.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

/// Fail with an [`ConfigError::InvalidValue`] unless `value` is strictly positive
pub fn require_positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field,
            reason: format!("must be positive, got {value}"),
        })
    }
}

/// Fail with an [`ConfigError::InvalidValue`] unless `low < high`
pub fn require_ordered(field: &'static str, low: f64, high: f64) -> Result<(), ConfigError> {
    if low < high {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field,
            reason: format!("lower bound {low} must be below upper bound {high}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        pixel_size: f64,
        label: String,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                pixel_size: 1.0,
                label: String::from("_EER.eer"),
            }
        }
    }

    impl YamlConfig for Sample {
        fn validate(&self) -> Result<(), ConfigError> {
            require_positive("pixel_size", self.pixel_size)
        }
    }

    #[test]
    fn template_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.yaml");
        Sample::write_template(&path).unwrap();
        assert_eq!(Sample::read_config_file(&path).unwrap(), Sample::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.yaml");
        std::fs::write(&path, "pixel_size: -2.0\nlabel: x\n").unwrap();
        assert!(matches!(
            Sample::read_config_file(&path),
            Err(ConfigError::InvalidValue {
                field: "pixel_size",
                ..
            })
        ));
    }

    #[test]
    fn missing_file() {
        assert!(matches!(
            Sample::read_config_file(Path::new("/nonexistent/sample.yaml")),
            Err(ConfigError::BadFilePath(_))
        ));
    }

    #[test]
    fn home_is_expanded() {
        let plain = Path::new("/data/set");
        assert_eq!(expand_home(plain), plain.to_path_buf());
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(
                expand_home(Path::new("~/movies")),
                PathBuf::from(home).join("movies")
            );
        }
    }
}
