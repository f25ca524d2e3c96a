//! Configuration file loading.

use crate::config::{resolve_config, Config};
use crate::error::Result;
use std::path::Path;

/// Load configuration from a YAML file.
///
/// Reads the file, parses the YAML, and runs semantic validation over
/// every service and node entry. Registration-level checks (duplicate
/// names, duplicate endpoints) happen later, when a
/// [`crate::server::Server`] ingests the config.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    resolve_config(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_minimal_config() {
        let file = write_temp(
            r#"
services:
  - protocol: tcp
    host: 0.0.0.0
    port: 9000
    nodes:
      - protocol: tcp
        host: 127.0.0.1
        port: 9100
"#,
        );

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.services.len(), 1);
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_config("/nonexistent/path/doforward.conf");
        assert!(matches!(result.unwrap_err(), Error::Network(_)));
    }

    #[test]
    fn test_load_invalid_yaml() {
        let file = write_temp("services: [}{");
        assert!(matches!(load_config(file.path()).unwrap_err(), Error::Parse(_)));
    }

    #[test]
    fn test_load_semantically_invalid() {
        let file = write_temp(
            r#"
services:
  - protocol: tcp
    host: 0.0.0.0
"#,
        );
        let err = load_config(file.path()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("port"));
    }
}
