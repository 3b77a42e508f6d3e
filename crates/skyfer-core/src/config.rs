use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Engine configuration loaded from `~/.config/skyfer/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Minimum acceptable streaming rate in bytes/sec.
    /// 0 disables the watchdog entirely, -1 selects the built-in default.
    pub min_streaming_rate: i64,
    /// Whether streaming downloads may flip to the alternative port (8080)
    /// after a failed attempt, to get past broken middleboxes.
    pub auto_down_port: bool,
    /// First retry delay for downloads, in deciseconds.
    pub get_retry_base_ds: u64,
    /// First retry delay for uploads, in deciseconds.
    pub put_retry_base_ds: u64,
    /// Upper bound on any retry delay, in deciseconds.
    pub retry_cap_ds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_streaming_rate: -1,
            auto_down_port: true,
            get_retry_base_ds: 16,
            put_retry_base_ds: 16,
            retry_cap_ds: 2560,
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("skyfer")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<EngineConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = EngineConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: EngineConfig = toml::from_str(&data)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.min_streaming_rate, -1);
        assert!(cfg.auto_down_port);
        assert_eq!(cfg.get_retry_base_ds, 16);
        assert_eq!(cfg.retry_cap_ds, 2560);
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = EngineConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: EngineConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.min_streaming_rate, cfg.min_streaming_rate);
        assert_eq!(parsed.auto_down_port, cfg.auto_down_port);
        assert_eq!(parsed.put_retry_base_ds, cfg.put_retry_base_ds);
    }

    #[test]
    fn config_toml_custom_values() {
        let toml = r#"
            min_streaming_rate = 65536
            auto_down_port = false
            get_retry_base_ds = 8
            put_retry_base_ds = 32
            retry_cap_ds = 1200
        "#;
        let cfg: EngineConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.min_streaming_rate, 65536);
        assert!(!cfg.auto_down_port);
        assert_eq!(cfg.get_retry_base_ds, 8);
        assert_eq!(cfg.retry_cap_ds, 1200);
    }
}
