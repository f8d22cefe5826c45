//! Engine configuration: environment, persisted settings overrides, the
//! report-family registry and portal credentials.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regrec_core::table::validate_prefix;
use regrec_core::ReportFamily;
use regrec_storage::{BasicAuth, HttpClientConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every default the engine uses, in one place.
pub mod defaults {
    pub const DB_PATH: &str = "bmi_data.db";
    pub const ARTIFACTS_DIR: &str = "./artifacts";
    pub const REPORTS_DIR: &str = "./reports";
    pub const PORTAL_URL: &str = "https://bmi-login.inet.bundesbank.de/bmi/MeldungList.do?value(action)=aktion.gruppe.3&value(nformat)=0";
    pub const AUTH_FILE: &str = "auth.yml";
    pub const IMPORT_CUT_DATE: &str = "20250101";
    pub const WAREHOUSE_FIXTURES: &str = "./fixtures/warehouse";
    pub const WAREHOUSE_SQL_DIR: &str = "./sql";
    pub const USER_AGENT: &str = "regrec/0.1";
    pub const HTTP_TIMEOUT_SECS: u64 = 60;
    pub const ACCEPT_INVALID_CERTS: bool = false;
    pub const WEB_PORT: u16 = 8000;
    /// Format of `last_updated` values (UTC).
    pub use regrec_core::value::TIMESTAMP_FORMAT;
}

/// Keys of the persisted `settings` table.
pub mod setting_keys {
    pub const IMPORT_CUT_DATE: &str = "import_cut_date";
    pub const AUTH_FILE_PATH: &str = "auth_file_path";
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown report family `{0}`")]
    UnknownFamily(String),
    #[error("invalid report family `{name}`: {reason}")]
    InvalidFamily { name: String, reason: String },
    #[error("family registry {path}: {reason}")]
    Registry { path: PathBuf, reason: String },
    #[error("credentials {path}: {reason}")]
    Credentials { path: PathBuf, reason: String },
    #[error("invalid setting {key}=`{value}`: {reason}")]
    InvalidSetting {
        key: String,
        value: String,
        reason: String,
    },
}

/// Where accepted/rejected import records come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarehouseConfig {
    /// `<dir>/<family>/{accepted,rejected}.json`
    Fixtures(PathBuf),
    Postgres { url: String, sql_dir: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyRegistry {
    pub families: Vec<ReportFamily>,
}

impl FamilyRegistry {
    pub fn builtin() -> Self {
        let family = |name: &str, prefix: &str, subject_area: &str| ReportFamily {
            name: name.to_string(),
            table_prefix: prefix.to_string(),
            subject_area: subject_area.to_string(),
            accepted_key_column: "datei_id".to_string(),
            rejected_key_column: "import_datei_id".to_string(),
            extra_required_columns: vec!["abweisen_check_befund_check_beschreibung_kurz".to_string()],
        };
        Self {
            families: vec![family("wpi", "BMI", "14"), family("emiso", "BMI_EMISO_", "17")],
        }
    }

    pub fn from_yaml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let registry: Self = serde_yaml::from_str(text).map_err(|e| ConfigError::Registry {
            path: origin.to_path_buf(),
            reason: e.to_string(),
        })?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Registry {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_yaml_str(&text, path)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = Vec::new();
        for family in &self.families {
            validate_prefix(&family.table_prefix).map_err(|e| ConfigError::InvalidFamily {
                name: family.name.clone(),
                reason: e.to_string(),
            })?;
            if seen.contains(&family.name.as_str()) {
                return Err(ConfigError::InvalidFamily {
                    name: family.name.clone(),
                    reason: "declared twice".to_string(),
                });
            }
            seen.push(family.name.as_str());
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ReportFamily> {
        self.families.iter().find(|f| f.name == name)
    }

    pub fn require(&self, name: &str) -> Result<&ReportFamily, ConfigError> {
        self.get(name)
            .ok_or_else(|| ConfigError::UnknownFamily(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.families.iter().map(|f| f.name.as_str()).collect()
    }
}

#[derive(Debug, Deserialize)]
struct CredentialsFile {
    credentials: CredentialsSection,
}

#[derive(Debug, Deserialize)]
struct CredentialsSection {
    username: String,
    password: String,
}

/// Read `credentials: {username, password}` from a YAML file.
pub fn load_credentials(path: &Path) -> Result<BasicAuth, ConfigError> {
    let fail = |reason: String| ConfigError::Credentials {
        path: path.to_path_buf(),
        reason,
    };
    let text = std::fs::read_to_string(path).map_err(|e| fail(e.to_string()))?;
    let file: CredentialsFile = serde_yaml::from_str(&text).map_err(|e| fail(e.to_string()))?;
    if file.credentials.username.trim().is_empty() {
        return Err(fail("username is empty".to_string()));
    }
    Ok(BasicAuth {
        username: file.credentials.username,
        password: file.credentials.password,
    })
}

/// `YYYYMMDD`, as substituted into warehouse queries.
pub fn validate_import_cut_date(value: &str) -> Result<(), ConfigError> {
    let parses = value.len() == 8
        && chrono::NaiveDate::parse_from_str(value, "%Y%m%d").is_ok();
    if parses {
        Ok(())
    } else {
        Err(ConfigError::InvalidSetting {
            key: setting_keys::IMPORT_CUT_DATE.to_string(),
            value: value.to_string(),
            reason: "expected YYYYMMDD".to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub portal_url: String,
    pub auth_file: PathBuf,
    pub import_cut_date: String,
    pub warehouse: WarehouseConfig,
    pub families: FamilyRegistry,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub accept_invalid_certs: bool,
    pub web_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(defaults::DB_PATH),
            artifacts_dir: PathBuf::from(defaults::ARTIFACTS_DIR),
            reports_dir: PathBuf::from(defaults::REPORTS_DIR),
            portal_url: defaults::PORTAL_URL.to_string(),
            auth_file: PathBuf::from(defaults::AUTH_FILE),
            import_cut_date: defaults::IMPORT_CUT_DATE.to_string(),
            warehouse: WarehouseConfig::Fixtures(PathBuf::from(defaults::WAREHOUSE_FIXTURES)),
            families: FamilyRegistry::builtin(),
            user_agent: defaults::USER_AGENT.to_string(),
            http_timeout_secs: defaults::HTTP_TIMEOUT_SECS,
            accept_invalid_certs: defaults::ACCEPT_INVALID_CERTS,
            web_port: defaults::WEB_PORT,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys fall back to [`defaults`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let base = Self::default();
        let path = |key: &str, fallback: PathBuf| lookup(key).map(PathBuf::from).unwrap_or(fallback);

        let sql_dir = path("REGREC_WAREHOUSE_SQL_DIR", PathBuf::from(defaults::WAREHOUSE_SQL_DIR));
        let warehouse = match lookup("REGREC_WAREHOUSE_URL") {
            Some(url) if !url.trim().is_empty() => WarehouseConfig::Postgres { url, sql_dir },
            _ => WarehouseConfig::Fixtures(path(
                "REGREC_WAREHOUSE_FIXTURES",
                PathBuf::from(defaults::WAREHOUSE_FIXTURES),
            )),
        };
        let families = match lookup("REGREC_FAMILIES_FILE") {
            Some(file) => FamilyRegistry::load(Path::new(&file))?,
            None => base.families,
        };
        let import_cut_date =
            lookup("REGREC_IMPORT_CUT_DATE").unwrap_or(base.import_cut_date);
        validate_import_cut_date(&import_cut_date)?;

        Ok(Self {
            db_path: path("REGREC_DB_PATH", base.db_path),
            artifacts_dir: path("REGREC_ARTIFACTS_DIR", base.artifacts_dir),
            reports_dir: path("REGREC_REPORTS_DIR", base.reports_dir),
            portal_url: lookup("REGREC_PORTAL_URL").unwrap_or(base.portal_url),
            auth_file: path("REGREC_AUTH_FILE", base.auth_file),
            import_cut_date,
            warehouse,
            families,
            user_agent: lookup("REGREC_USER_AGENT").unwrap_or(base.user_agent),
            http_timeout_secs: lookup("REGREC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(base.http_timeout_secs),
            accept_invalid_certs: lookup("REGREC_ACCEPT_INVALID_CERTS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(base.accept_invalid_certs),
            web_port: lookup("REGREC_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(base.web_port),
        })
    }

    /// Seed values for the persisted settings table.
    pub fn settings_defaults(&self) -> Vec<(&'static str, String)> {
        vec![
            (setting_keys::IMPORT_CUT_DATE, self.import_cut_date.clone()),
            (
                setting_keys::AUTH_FILE_PATH,
                self.auth_file.display().to_string(),
            ),
        ]
    }

    /// Apply persisted settings. Blank values keep the current value.
    pub fn with_settings(mut self, settings: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let value = |key: &str| {
            settings
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };
        if let Some(cut) = value(setting_keys::IMPORT_CUT_DATE) {
            validate_import_cut_date(cut)?;
            self.import_cut_date = cut.to_string();
        }
        if let Some(auth) = value(setting_keys::AUTH_FILE_PATH) {
            self.auth_file = PathBuf::from(auth);
        }
        Ok(self)
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            accept_invalid_certs: self.accept_invalid_certs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn unset_keys_fall_back_to_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.db_path, PathBuf::from(defaults::DB_PATH));
        assert_eq!(config.import_cut_date, defaults::IMPORT_CUT_DATE);
        assert_eq!(
            config.warehouse,
            WarehouseConfig::Fixtures(PathBuf::from(defaults::WAREHOUSE_FIXTURES))
        );
        assert_eq!(config.families.names(), vec!["wpi", "emiso"]);
        assert_eq!(config.http_config().timeout, Duration::from_secs(60));
    }

    #[test]
    fn warehouse_url_selects_postgres() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("REGREC_WAREHOUSE_URL", "postgres://wh/imports"),
            ("REGREC_WAREHOUSE_SQL_DIR", "/etc/regrec/sql"),
            ("REGREC_WEB_PORT", "9100"),
        ]))
        .unwrap();
        assert_eq!(
            config.warehouse,
            WarehouseConfig::Postgres {
                url: "postgres://wh/imports".into(),
                sql_dir: PathBuf::from("/etc/regrec/sql"),
            }
        );
        assert_eq!(config.web_port, 9100);
    }

    #[test]
    fn bad_cut_date_is_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[("REGREC_IMPORT_CUT_DATE", "2025-01-01")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSetting { .. }));
    }

    #[test]
    fn settings_override_and_blank_values_are_ignored() {
        let mut settings = BTreeMap::new();
        settings.insert(setting_keys::IMPORT_CUT_DATE.to_string(), "20240601".to_string());
        settings.insert(setting_keys::AUTH_FILE_PATH.to_string(), "  ".to_string());
        let config = EngineConfig::default().with_settings(&settings).unwrap();
        assert_eq!(config.import_cut_date, "20240601");
        assert_eq!(config.auth_file, PathBuf::from(defaults::AUTH_FILE));
    }

    #[test]
    fn credentials_load_from_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("auth.yml");
        std::fs::write(&path, "credentials:\n  username: melder\n  password: geheim\n").unwrap();
        let auth = load_credentials(&path).unwrap();
        assert_eq!(auth.username, "melder");
        assert_eq!(auth.password, "geheim");

        let missing = load_credentials(&dir.path().join("nope.yml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Credentials { .. }));
    }

    #[test]
    fn registry_rejects_unsafe_prefix() {
        let yaml = "families:\n  - name: wpi\n    table_prefix: \"BMI; DROP\"\n    subject_area: \"14\"\n";
        let err = FamilyRegistry::from_yaml_str(yaml, Path::new("families.yml")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFamily { .. }));

        let yaml = "families:\n  - name: wpi\n    table_prefix: BMI\n    subject_area: \"14\"\n";
        let registry = FamilyRegistry::from_yaml_str(yaml, Path::new("families.yml")).unwrap();
        let wpi = registry.require("wpi").unwrap();
        assert_eq!(wpi.accepted_key_column, "datei_id");
        assert!(registry.require("emiso").is_err());
    }

    #[test]
    fn pass_timestamps_read_back_as_timestamps() {
        let ts = chrono::NaiveDate::from_ymd_opt(2025, 1, 31)
            .unwrap()
            .and_hms_opt(23, 5, 0)
            .unwrap();
        let stamp = ts.format(defaults::TIMESTAMP_FORMAT).to_string();
        assert_eq!(stamp, "2025-01-31 23:05:00");
        assert_eq!(
            regrec_core::normalize(&regrec_core::ScalarValue::Timestamp(ts)),
            Some(stamp)
        );
    }
}
