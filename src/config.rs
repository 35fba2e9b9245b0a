// ⚙️ Configuration - config.json with defaults
// A missing file is created with defaults; a corrupt one is set aside and
// replaced. Loading happens before logging is up, so the outcome is returned
// as a ConfigOrigin for the caller to log.

use crate::error::{LedgerError, Result, ValidationError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const DEFAULT_CONFIG_FILE: &str = "config.json";

fn default_company_name() -> String {
    "XX农业有限公司".to_string()
}

fn default_phone_number() -> String {
    "000-0000-0000".to_string()
}

fn default_footer_text() -> String {
    "本结算单仅供内部参考，最终结算以实际为准。".to_string()
}

fn default_export_dir() -> PathBuf {
    PathBuf::from("结算单")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("produce_ledger.db")
}

fn default_server_addr() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_page_size() -> u32 {
    50
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("db_backups")
}

/// Application settings. Unknown keys are ignored and absent keys take
/// their defaults, so older config files keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_company_name")]
    pub company_name: String,
    #[serde(default = "default_phone_number")]
    pub phone_number: String,
    #[serde(default = "default_footer_text")]
    pub footer_text: String,
    #[serde(default = "default_export_dir", alias = "excel_output_dir")]
    pub export_dir: PathBuf,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            company_name: default_company_name(),
            phone_number: default_phone_number(),
            footer_text: default_footer_text(),
            export_dir: default_export_dir(),
            database_path: default_database_path(),
            server_addr: default_server_addr(),
            page_size: default_page_size(),
            log_dir: default_log_dir(),
            backup_dir: default_backup_dir(),
        }
    }
}

/// How `load_or_init` came by its config
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigOrigin {
    Loaded,
    /// Loaded, but page_size was 0 and fell back to the default
    Repaired,
    Created,
    /// The file did not parse; it was moved to `backup` and defaults written
    Reset { reason: String, backup: PathBuf },
}

impl ConfigOrigin {
    pub fn log(&self, path: &Path) {
        match self {
            ConfigOrigin::Loaded => debug!(path = %path.display(), "config loaded"),
            ConfigOrigin::Repaired => {
                warn!(path = %path.display(), "page_size 0 in config, using {}", default_page_size())
            }
            ConfigOrigin::Created => info!(path = %path.display(), "created default config"),
            ConfigOrigin::Reset { reason, backup } => warn!(
                path = %path.display(),
                backup = %backup.display(),
                %reason,
                "config unreadable, reset to defaults"
            ),
        }
    }
}

/// Fields an administrator may change from the UI or the API.
/// Absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub company_name: Option<String>,
    pub phone_number: Option<String>,
    pub footer_text: Option<String>,
    pub export_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Load `path`, writing defaults when it is missing or unparseable
    pub fn load_or_init(path: &Path) -> Result<(Self, ConfigOrigin)> {
        if !path.exists() {
            let config = AppConfig::default();
            config.save(path)?;
            return Ok((config, ConfigOrigin::Created));
        }

        let parsed = fs::read_to_string(path)
            .map_err(LedgerError::from)
            .and_then(|text| serde_json::from_str::<AppConfig>(&text).map_err(LedgerError::from));

        match parsed {
            Ok(mut config) if config.page_size == 0 => {
                config.page_size = default_page_size();
                Ok((config, ConfigOrigin::Repaired))
            }
            Ok(config) => Ok((config, ConfigOrigin::Loaded)),
            Err(e) => {
                let mut name = path.file_name().unwrap_or_default().to_os_string();
                name.push(".corrupt");
                let backup = path.with_file_name(name);
                fs::rename(path, &backup).map_err(|io| {
                    LedgerError::Config(format!("cannot move aside {}: {}", path.display(), io))
                })?;

                let config = AppConfig::default();
                config.save(path)?;
                Ok((
                    config,
                    ConfigOrigin::Reset {
                        reason: e.to_string(),
                        backup,
                    },
                ))
            }
        }
    }

    /// Apply an admin edit; nothing changes unless every field is valid
    pub fn apply(&mut self, update: ConfigUpdate) -> std::result::Result<(), ValidationError> {
        let mut next = self.clone();
        if let Some(name) = update.company_name {
            let name = name.trim();
            if name.is_empty() {
                return Err(ValidationError::new("company_name", "公司名称不能为空"));
            }
            next.company_name = name.to_string();
        }
        if let Some(phone) = update.phone_number {
            next.phone_number = phone.trim().to_string();
        }
        if let Some(footer) = update.footer_text {
            next.footer_text = footer.trim().to_string();
        }
        if let Some(dir) = update.export_dir {
            if dir.as_os_str().is_empty() {
                return Err(ValidationError::new("export_dir", "导出目录不能为空"));
            }
            next.export_dir = dir;
        }
        *self = next;
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).map_err(|e| {
            LedgerError::Config(format!("cannot write {}: {}", path.display(), e))
        })
    }
}
