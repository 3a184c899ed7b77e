use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use core_types::RunMode;
use freq_table::PickerConfig;
use plan_builder::RiskConfig;
use serde::{Deserialize, Serialize};
use tag_classifier::ClassifierConfig;
use timeline_gate::Cutovers;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    pub intraday: PathBuf,
    pub masters: PathBuf,
    pub journal: PathBuf,
    pub state: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            intraday: PathBuf::from("data/intraday"),
            masters: PathBuf::from("data/masters"),
            journal: PathBuf::from("data/journal"),
            state: PathBuf::from("data/state"),
        }
    }
}

impl PathsConfig {
    fn rebase(&mut self, root: &Path) {
        for path in [
            &mut self.intraday,
            &mut self.masters,
            &mut self.journal,
            &mut self.state,
        ] {
            if path.is_relative() {
                *path = root.join(&path);
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Paper evaluation cadence for live/paper modes, seconds.
    pub cycle_seconds: u64,
    pub replay_seed: u64,
    /// Replay pacing factor; `None` drains as fast as the engine consumes.
    pub replay_speed: Option<f64>,
    pub enable_agg5: bool,
    pub live_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_seconds: 2,
            replay_seed: 7,
            replay_speed: None,
            enable_agg5: true,
            live_channel_capacity: 16_384,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub symbols: Vec<String>,
    pub paths: PathsConfig,
    pub risk: RiskConfig,
    pub cutovers: Cutovers,
    pub picker: PickerConfig,
    pub classifier: ClassifierConfig,
    pub engine: EngineConfig,
    pub http: HttpConfig,
    /// Session date to replay in SIM mode; defaults to the latest date in
    /// the intraday files.
    pub trading_day: Option<NaiveDate>,
    #[serde(skip)]
    pub mode: RunMode,
    #[serde(skip)]
    pub reset_state: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            paths: PathsConfig::default(),
            risk: RiskConfig::default(),
            cutovers: Cutovers::default(),
            picker: PickerConfig::default(),
            classifier: ClassifierConfig::default(),
            engine: EngineConfig::default(),
            http: HttpConfig::default(),
            trading_day: None,
            mode: RunMode::Paper,
            reset_state: false,
        }
    }
}

pub fn config_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("PROBEDGE_CONFIG").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/probedge.yaml"))
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut cfg: AppConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(raw) = std::env::var("MODE") {
            self.mode = raw.parse().context("parse MODE")?;
        }
        if let Ok(root) = std::env::var("DATA_DIR") {
            if !root.trim().is_empty() {
                self.paths.rebase(Path::new(root.trim()));
            }
        }
        if let Ok(raw) = std::env::var("ENABLE_AGG5") {
            self.engine.enable_agg5 = !matches!(raw.trim(), "0" | "false" | "FALSE");
        }
        if let Ok(raw) = std::env::var("RESET_STATE") {
            self.reset_state = matches!(raw.trim(), "1" | "true" | "TRUE");
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            anyhow::bail!("symbols list is empty");
        }
        if self.risk.daily_rs <= 0.0 || self.risk.per_trade_rs <= 0.0 {
            anyhow::bail!("risk budgets must be positive");
        }
        if self.engine.cycle_seconds == 0 {
            anyhow::bail!("engine.cycle_seconds must be at least 1");
        }
        Ok(())
    }

    pub fn state_file(&self) -> PathBuf {
        self.paths.state.join("live_state.json")
    }

    pub fn journal_file(&self, date: NaiveDate) -> PathBuf {
        self.paths.journal.join(format!("fills_{date}.jsonl"))
    }

    /// Redacted view for the read-only config endpoint.
    pub fn public_view(&self) -> serde_json::Value {
        serde_json::json!({
            "mode": self.mode,
            "symbols": self.symbols,
            "risk": self.risk,
            "cutovers": self.cutovers,
            "picker": self.picker,
            "engine": { "cycle_seconds": self.engine.cycle_seconds, "enable_agg5": self.engine.enable_agg5 },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_with_partial_sections_fills_defaults() {
        let raw = "
symbols: [ALPHA, BETA]
risk:
  daily_rs: 20000
cutovers:
  pdc: \"09:25:00\"
";
        let cfg: AppConfig = serde_yaml::from_str(raw).expect("parse");
        assert_eq!(cfg.symbols.len(), 2);
        assert_eq!(cfg.risk.daily_rs, 20_000.0);
        // untouched defaults survive partial overrides
        assert_eq!(cfg.risk.per_trade_rs, 1_000.0);
        assert_eq!(cfg.picker.nmin_l3, 8);
        assert_eq!(cfg.engine.cycle_seconds, 2);
        assert_eq!(
            cfg.cutovers.ot,
            chrono::NaiveTime::from_hms_opt(9, 40, 1).unwrap()
        );
    }

    #[test]
    fn empty_universe_is_rejected() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn journal_and_state_paths_are_derived() {
        let mut cfg = AppConfig::default();
        cfg.symbols.push("ALPHA".to_string());
        let date = NaiveDate::from_ymd_opt(2025, 8, 1).unwrap();
        assert!(cfg
            .journal_file(date)
            .to_string_lossy()
            .ends_with("fills_2025-08-01.jsonl"));
        assert!(cfg.state_file().to_string_lossy().ends_with("live_state.json"));
    }
}
