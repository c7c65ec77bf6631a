use anyhow::{bail, Result};
use serde::de::DeserializeOwned;

pub(crate) fn parse<T: DeserializeOwned>(extension: &str, raw: &[u8]) -> Result<T> {
    match extension.to_ascii_lowercase().as_str() {
        "json" => match serde_json::from_slice::<T>(raw) {
            Ok(t) => Ok(t),
            Err(e) => bail!(e),
        },
        "toml" => {
            let content = std::str::from_utf8(raw)?;
            match toml::from_str(content) {
                Ok(t) => Ok(t),
                Err(e) => bail!(e),
            }
        }
        other => bail!("no parser available for config format {}", other),
    }
}
