use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(Debug, thiserror::Error)]
pub enum FileFormatError {
    #[error("Failed to get file extension for '{0}'")]
    MissingFileExtension(PathBuf),
    #[error("Unsupported file extension for file: {0}")]
    UnsupportedFileExtension(PathBuf),
    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("YAML serialization failed: {0}")]
    Yaml(#[from] serde_yml::Error),
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

pub type FileFormatResult<T> = Result<T, FileFormatError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SerdeFormat {
    Yaml,
    Json,
}

impl SerdeFormat {
    pub fn from_path(path: &Path) -> FileFormatResult<Self> {
        let ext = path
            .extension()
            .and_then(|os_str| os_str.to_str())
            .ok_or_else(|| FileFormatError::MissingFileExtension(path.to_path_buf()))?;

        if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") {
            Ok(Self::Yaml)
        } else if ext.eq_ignore_ascii_case("json") {
            Ok(Self::Json)
        } else {
            Err(FileFormatError::UnsupportedFileExtension(
                path.to_path_buf(),
            ))
        }
    }
}

pub fn serialize<T: Serialize>(value: &T, format: SerdeFormat) -> FileFormatResult<String> {
    match format {
        SerdeFormat::Yaml => Ok(serde_yml::to_string(value)?),
        SerdeFormat::Json => Ok(serde_json::to_string_pretty(value)?),
    }
}

pub fn deserialize<T: DeserializeOwned>(text: &str, format: SerdeFormat) -> FileFormatResult<T> {
    match format {
        SerdeFormat::Yaml => Ok(serde_yml::from_str(text)?),
        SerdeFormat::Json => Ok(serde_json::from_str(text)?),
    }
}

/// Reads `path` and deserializes it with the format implied by its extension.
pub fn load_file<T: DeserializeOwned>(path: &Path) -> FileFormatResult<T> {
    let format = SerdeFormat::from_path(path)?;
    let text = std::fs::read_to_string(path).map_err(|source| FileFormatError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    deserialize(&text, format)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Sample {
        name: String,
        weight: f64,
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(
            SerdeFormat::from_path(Path::new("cfg.YML")).unwrap(),
            SerdeFormat::Yaml
        );
        assert_eq!(
            SerdeFormat::from_path(Path::new("a/b/cfg.json")).unwrap(),
            SerdeFormat::Json
        );
        assert!(matches!(
            SerdeFormat::from_path(Path::new("cfg")),
            Err(FileFormatError::MissingFileExtension(_))
        ));
        assert!(matches!(
            SerdeFormat::from_path(Path::new("cfg.toml")),
            Err(FileFormatError::UnsupportedFileExtension(_))
        ));
    }

    #[test]
    fn test_yaml_text_deserializes() {
        let sample: Sample = deserialize("name: sample\nweight: 2.5\n", SerdeFormat::Yaml).unwrap();
        assert_eq!(
            sample,
            Sample {
                name: "sample".into(),
                weight: 2.5
            }
        );
    }

    #[test]
    fn test_load_missing_file_reports_path() {
        let path = std::env::temp_dir().join("common_file_format_missing_42.json");
        let err = load_file::<Sample>(&path).unwrap_err();
        assert!(err.to_string().contains("common_file_format_missing_42.json"));
    }

    #[test]
    fn test_load_json_file() {
        let path = std::env::temp_dir().join(format!(
            "common_file_format_{}.json",
            std::process::id()
        ));
        let text = serialize(
            &Sample {
                name: "disk".into(),
                weight: 1.0,
            },
            SerdeFormat::Json,
        )
        .unwrap();
        std::fs::write(&path, text).unwrap();
        let loaded: Sample = load_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded.name, "disk");
    }
}
