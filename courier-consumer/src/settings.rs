use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{drain::DrainSettings, errors::ConsumerError, policy::AcknowledgeMode};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerSettings {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub workflow: Option<String>,
    #[serde(default)]
    pub mode: AcknowledgeMode,
    /// Unacknowledged deliveries allowed on the channel; zero means unlimited.
    #[serde(default)]
    pub prefetch: u16,
    #[serde(default)]
    pub requeue_on_nack: bool,
    #[serde(default = "default_drain_poll_interval_ms")]
    pub drain_poll_interval_ms: u64,
    #[serde(default = "default_drain_max_polls")]
    pub drain_max_polls: u32,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            workflow: None,
            mode: AcknowledgeMode::default(),
            prefetch: 0,
            requeue_on_nack: false,
            drain_poll_interval_ms: default_drain_poll_interval_ms(),
            drain_max_polls: default_drain_max_polls(),
        }
    }
}

impl ConsumerSettings {
    pub fn drain_settings(&self) -> DrainSettings {
        DrainSettings {
            poll_interval: Duration::from_millis(self.drain_poll_interval_ms),
            max_polls: self.drain_max_polls,
        }
    }

    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.name.trim().is_empty() {
            return Err(ConsumerError::InvalidSettings(
                "consumer name must not be empty".into(),
            ));
        }
        if self.drain_poll_interval_ms == 0 {
            return Err(ConsumerError::InvalidSettings(
                "drain_poll_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Read and validate settings from a JSON file.
pub fn load_settings(path: &Path) -> Result<ConsumerSettings, ConsumerError> {
    let data = fs::read_to_string(path).map_err(|source| ConsumerError::SettingsIo {
        path: path.to_path_buf(),
        source,
    })?;
    let settings: ConsumerSettings =
        serde_json::from_str(&data).map_err(|source| ConsumerError::SettingsParse {
            path: path.to_path_buf(),
            source,
        })?;
    settings.validate()?;
    Ok(settings)
}

fn default_name() -> String {
    "courier-consumer".to_string()
}

fn default_drain_poll_interval_ms() -> u64 {
    1000
}

fn default_drain_max_polls() -> u32 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_uses_defaults() {
        let settings: ConsumerSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, ConsumerSettings::default());
        assert_eq!(settings.drain_settings(), DrainSettings::default());
        assert_eq!(settings.drain_settings().ceiling(), Duration::from_secs(300));
    }

    #[test]
    fn reads_file_and_rejects_zero_interval() {
        let dir = std::env::temp_dir().join(format!("courier-settings-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let good = dir.join("good.json");
        fs::write(
            &good,
            r#"{"name": "billing", "workflow": "invoices", "mode": "failure-aware", "prefetch": 8}"#,
        )
        .unwrap();
        let settings = load_settings(&good).unwrap();
        assert_eq!(settings.mode, AcknowledgeMode::FailureAware);
        assert_eq!(settings.workflow.as_deref(), Some("invoices"));
        assert_eq!(settings.prefetch, 8);

        let bad = dir.join("bad.json");
        fs::write(&bad, r#"{"drain_poll_interval_ms": 0}"#).unwrap();
        assert!(matches!(
            load_settings(&bad),
            Err(ConsumerError::InvalidSettings(_))
        ));

        assert!(matches!(
            load_settings(&dir.join("missing.json")),
            Err(ConsumerError::SettingsIo { .. })
        ));
        let _ = fs::remove_dir_all(&dir);
    }
}
