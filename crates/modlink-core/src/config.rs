use crate::error::{ModlinkError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// The only runtime kind this crate knows how to drive.
pub const RUNTIME_TYPE: &str = "rust-stdio";

// ---------------------------------------------------------------------------
// RuntimeSettings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Default timeout for correlated calls to the host.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Quiet window before buffered feedback values are flushed.
    #[serde(default = "default_feedback_debounce_ms")]
    pub feedback_debounce_ms: u64,
    /// Upper bound on how long a value may sit in the buffer during a burst.
    #[serde(default = "default_feedback_max_wait_ms")]
    pub feedback_max_wait_ms: u64,
}

fn default_call_timeout_ms() -> u64 {
    5000
}

fn default_feedback_debounce_ms() -> u64 {
    10
}

fn default_feedback_max_wait_ms() -> u64 {
    50
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            feedback_debounce_ms: default_feedback_debounce_ms(),
            feedback_max_wait_ms: default_feedback_max_wait_ms(),
        }
    }
}

impl RuntimeSettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn feedback_debounce(&self) -> Duration {
        Duration::from_millis(self.feedback_debounce_ms)
    }

    pub fn feedback_max_wait(&self) -> Duration {
        Duration::from_millis(self.feedback_max_wait_ms.max(self.feedback_debounce_ms))
    }
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRuntime {
    #[serde(rename = "type")]
    pub kind: String,
    /// Protocol version the module was built against.
    pub api: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub runtime: ManifestRuntime,
    #[serde(default)]
    pub settings: RuntimeSettings,
}

impl Manifest {
    /// Read a manifest from disk. `.yaml`/`.yml` files are parsed as YAML,
    /// everything else as JSON.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ModlinkError::Manifest(format!(
                "file not found: {}",
                path.display()
            )));
        }
        let data = std::fs::read_to_string(path)?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let manifest: Manifest = if is_yaml {
            serde_yaml::from_str(&data)?
        } else {
            serde_json::from_str(&data)?
        };
        Ok(manifest)
    }

    /// Check that this runtime can drive the module described here.
    pub fn validate(&self, api_version: &str) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(ModlinkError::Manifest("missing module id".into()));
        }
        if self.runtime.kind != RUNTIME_TYPE {
            return Err(ModlinkError::Manifest(format!(
                "unsupported runtime type '{}', expected '{RUNTIME_TYPE}'",
                self.runtime.kind
            )));
        }
        let wanted = major_version(&self.runtime.api)?;
        let have = major_version(api_version)?;
        if wanted != have {
            return Err(ModlinkError::Manifest(format!(
                "module targets api {} but runtime speaks {api_version}",
                self.runtime.api
            )));
        }
        Ok(())
    }
}

fn major_version(version: &str) -> Result<u64> {
    version
        .trim()
        .trim_start_matches('v')
        .split('.')
        .next()
        .and_then(|major| major.parse().ok())
        .ok_or_else(|| ModlinkError::Manifest(format!("invalid version '{version}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MANIFEST_JSON: &str = r#"{
        "id": "acme-mixer",
        "name": "Acme Mixer",
        "version": "0.3.1",
        "runtime": {"type": "rust-stdio", "api": "1.0.0"}
    }"#;

    fn write_temp(suffix: &str, content: &str) -> NamedTempFile {
        let mut f = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loads_json_manifest_with_default_settings() {
        let f = write_temp(".json", MANIFEST_JSON);
        let manifest = Manifest::load(f.path()).unwrap();
        assert_eq!(manifest.id, "acme-mixer");
        assert_eq!(manifest.settings, RuntimeSettings::default());
        manifest.validate("1.2.0").unwrap();
    }

    #[test]
    fn loads_yaml_manifest_with_settings_override() {
        let yaml = "id: acme\nname: Acme\nversion: 1.0.0\nruntime:\n  type: rust-stdio\n  api: 1.4.0\nsettings:\n  call_timeout_ms: 250\n";
        let f = write_temp(".yaml", yaml);
        let manifest = Manifest::load(f.path()).unwrap();
        assert_eq!(manifest.settings.call_timeout(), Duration::from_millis(250));
        assert_eq!(manifest.settings.feedback_debounce_ms, 10);
    }

    #[test]
    fn rejects_foreign_runtime_type() {
        let f = write_temp(".json", &MANIFEST_JSON.replace("rust-stdio", "node22"));
        let err = Manifest::load(f.path()).unwrap().validate("1.0.0").unwrap_err();
        assert!(err.to_string().contains("unsupported runtime type"));
    }

    #[test]
    fn rejects_major_version_mismatch() {
        let f = write_temp(".json", MANIFEST_JSON);
        let err = Manifest::load(f.path()).unwrap().validate("2.0.0").unwrap_err();
        assert!(matches!(err, ModlinkError::Manifest(_)));
    }

    #[test]
    fn missing_file_is_a_manifest_error() {
        let err = Manifest::load(Path::new("/nonexistent/manifest.json")).unwrap_err();
        assert!(matches!(err, ModlinkError::Manifest(_)));
    }

    #[test]
    fn max_wait_never_below_debounce() {
        let settings = RuntimeSettings {
            feedback_debounce_ms: 40,
            feedback_max_wait_ms: 5,
            ..Default::default()
        };
        assert_eq!(settings.feedback_max_wait(), Duration::from_millis(40));
    }
}
