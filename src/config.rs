use serde::Deserialize;

use crate::types::SeverityBands;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    pub audit: AuditConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

// ============================================================
// Temporal Graph Config
// ============================================================

#[derive(Debug, Deserialize, Clone)]
pub struct GraphConfig {
    /// Enables `snapshot`; snapshots are written under `snapshot_dir`.
    #[serde(default)]
    pub persistent: bool,
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: String,
    /// Snapshot file replayed into the graph at startup.
    pub restore_from: Option<String>,
    /// Must stay false in production.
    #[serde(default)]
    pub allow_clear: bool,
    #[serde(default = "default_max_paths")]
    pub max_paths: usize,
    #[serde(default = "default_max_path_branches")]
    pub max_path_branches: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            persistent: false,
            snapshot_dir: default_snapshot_dir(),
            restore_from: None,
            allow_clear: false,
            max_paths: default_max_paths(),
            max_path_branches: default_max_path_branches(),
        }
    }
}

fn default_snapshot_dir() -> String {
    "./snapshots".to_string()
}

fn default_max_paths() -> usize {
    100
}

fn default_max_path_branches() -> usize {
    10_000
}

// ============================================================
// Detection Config
// ============================================================

#[derive(Debug, Deserialize, Clone)]
pub struct DetectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Lookback of the window handed to the statistical detectors.
    #[serde(default = "default_day_secs")]
    pub window_secs: u64,
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    #[serde(default = "default_max_window_transactions")]
    pub max_window_transactions: usize,
    #[serde(default)]
    pub zscore: ZScoreConfig,
    #[serde(default)]
    pub iqr: IqrConfig,
    #[serde(default)]
    pub patterns: PatternConfig,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval_secs(),
            window_secs: default_day_secs(),
            run_timeout_secs: default_run_timeout_secs(),
            max_window_transactions: default_max_window_transactions(),
            zscore: ZScoreConfig::default(),
            iqr: IqrConfig::default(),
            patterns: PatternConfig::default(),
        }
    }
}

fn default_interval_secs() -> u64 {
    60
}

fn default_day_secs() -> u64 {
    86_400
}

fn default_hour_secs() -> u64 {
    3_600
}

fn default_run_timeout_secs() -> u64 {
    30
}

fn default_max_window_transactions() -> usize {
    10_000
}

fn default_min_data_points() -> usize {
    30
}

fn default_ratio_bands() -> SeverityBands {
    SeverityBands::new(2.0, 5.0, 10.0)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ZScoreConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_zscore_threshold")]
    pub threshold: f64,
    #[serde(default = "default_day_secs")]
    pub window_secs: u64,
    #[serde(default = "default_min_data_points")]
    pub min_data_points: usize,
    /// Also evaluate each sender against its own baseline.
    #[serde(default)]
    pub per_address: bool,
    /// Cut points over |z|.
    #[serde(default = "default_zscore_bands")]
    pub bands: SeverityBands,
}

impl Default for ZScoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_zscore_threshold(),
            window_secs: default_day_secs(),
            min_data_points: default_min_data_points(),
            per_address: false,
            bands: default_zscore_bands(),
        }
    }
}

fn default_zscore_threshold() -> f64 {
    3.0
}

fn default_zscore_bands() -> SeverityBands {
    SeverityBands::new(4.0, 6.0, 10.0)
}

#[derive(Debug, Deserialize, Clone)]
pub struct IqrConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_iqr_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_day_secs")]
    pub window_secs: u64,
    #[serde(default = "default_min_data_points")]
    pub min_data_points: usize,
    #[serde(default)]
    pub per_address: bool,
    /// Cut points over the distance beyond the violated bound, in IQRs.
    #[serde(default = "default_iqr_bands")]
    pub bands: SeverityBands,
}

impl Default for IqrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            multiplier: default_iqr_multiplier(),
            window_secs: default_day_secs(),
            min_data_points: default_min_data_points(),
            per_address: false,
            bands: default_iqr_bands(),
        }
    }
}

fn default_iqr_multiplier() -> f64 {
    1.5
}

fn default_iqr_bands() -> SeverityBands {
    SeverityBands::new(3.0, 5.0, 10.0)
}

#[derive(Debug, Deserialize, Clone)]
pub struct PatternConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub circulation: CirculationConfig,
    #[serde(default)]
    pub fan_out: FanConfig,
    #[serde(default)]
    pub fan_in: FanConfig,
    #[serde(default)]
    pub dormant: DormantConfig,
    #[serde(default)]
    pub velocity: VelocityConfig,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            circulation: CirculationConfig::default(),
            fan_out: FanConfig::default(),
            fan_in: FanConfig::default(),
            dormant: DormantConfig::default(),
            velocity: VelocityConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CirculationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_day_secs")]
    pub window_secs: u64,
    #[serde(default = "default_circulation_depth")]
    pub max_depth: usize,
    #[serde(default = "default_circulation_min_hops")]
    pub min_hops: usize,
    /// Minimum cumulative amount moved around the cycle.
    #[serde(default = "default_circulation_min_amount")]
    pub min_amount: f64,
    #[serde(default = "default_ratio_bands")]
    pub bands: SeverityBands,
}

impl Default for CirculationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: default_day_secs(),
            max_depth: default_circulation_depth(),
            min_hops: default_circulation_min_hops(),
            min_amount: default_circulation_min_amount(),
            bands: default_ratio_bands(),
        }
    }
}

fn default_circulation_depth() -> usize {
    4
}

fn default_circulation_min_hops() -> usize {
    2
}

fn default_circulation_min_amount() -> f64 {
    10_000.0
}

/// Shared by fan-out (distinct recipients) and fan-in (distinct senders).
#[derive(Debug, Deserialize, Clone)]
pub struct FanConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_hour_secs")]
    pub window_secs: u64,
    #[serde(default = "default_fan_threshold")]
    pub threshold: usize,
    #[serde(default = "default_ratio_bands")]
    pub bands: SeverityBands,
}

impl Default for FanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: default_hour_secs(),
            threshold: default_fan_threshold(),
            bands: default_ratio_bands(),
        }
    }
}

fn default_fan_threshold() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct DormantConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_hour_secs")]
    pub window_secs: u64,
    #[serde(default = "default_dormancy_secs")]
    pub dormancy_secs: u64,
    /// Reactivating amount, relative to the historical mean, that escalates severity.
    #[serde(default = "default_amount_multiplier")]
    pub amount_multiplier: f64,
    /// Cut points over gap / dormancy_secs.
    #[serde(default = "default_dormant_bands")]
    pub bands: SeverityBands,
}

impl Default for DormantConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: default_hour_secs(),
            dormancy_secs: default_dormancy_secs(),
            amount_multiplier: default_amount_multiplier(),
            bands: default_dormant_bands(),
        }
    }
}

fn default_dormancy_secs() -> u64 {
    30 * 86_400
}

fn default_amount_multiplier() -> f64 {
    10.0
}

fn default_dormant_bands() -> SeverityBands {
    SeverityBands::new(2.0, 4.0, 8.0)
}

#[derive(Debug, Deserialize, Clone)]
pub struct VelocityConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_hour_secs")]
    pub window_secs: u64,
    #[serde(default = "default_velocity_max")]
    pub max_transactions: usize,
    #[serde(default = "default_ratio_bands")]
    pub bands: SeverityBands,
}

impl Default for VelocityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: default_hour_secs(),
            max_transactions: default_velocity_max(),
            bands: default_ratio_bands(),
        }
    }
}

fn default_velocity_max() -> usize {
    100
}

// ============================================================
// Audit & Logging Config
// ============================================================

#[derive(Debug, Deserialize, Clone)]
pub struct AuditConfig {
    /// HMAC key for the audit hash chain.
    pub hmac_key: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    pub fn load(path: &str) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("Failed to read config file '{}': {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| eyre::eyre!("Failed to parse config file '{}': {}", path, e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> eyre::Result<()> {
        if self.audit.hmac_key.trim().is_empty() {
            return Err(eyre::eyre!("audit.hmac_key is required"));
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(eyre::eyre!(
                "logging.format must be 'pretty' or 'json', got '{}'",
                self.logging.format
            ));
        }
        self.detection.validate()
    }
}

impl DetectionConfig {
    pub fn validate(&self) -> eyre::Result<()> {
        if self.interval_secs == 0 || self.run_timeout_secs == 0 {
            return Err(eyre::eyre!(
                "detection.interval_secs and detection.run_timeout_secs must be positive"
            ));
        }
        if self.zscore.threshold <= 0.0 {
            return Err(eyre::eyre!("detection.zscore.threshold must be positive"));
        }
        if self.iqr.multiplier <= 0.0 {
            return Err(eyre::eyre!("detection.iqr.multiplier must be positive"));
        }
        if self.zscore.min_data_points < 2 || self.iqr.min_data_points < 2 {
            return Err(eyre::eyre!("min_data_points must be at least 2"));
        }

        let patterns = &self.patterns;
        if patterns.fan_out.threshold == 0
            || patterns.fan_in.threshold == 0
            || patterns.velocity.max_transactions == 0
        {
            return Err(eyre::eyre!("pattern thresholds must be positive"));
        }
        if patterns.circulation.max_depth < patterns.circulation.min_hops {
            return Err(eyre::eyre!(
                "detection.patterns.circulation.max_depth must be >= min_hops"
            ));
        }
        if patterns.dormant.dormancy_secs == 0 {
            return Err(eyre::eyre!(
                "detection.patterns.dormant.dormancy_secs must be positive"
            ));
        }

        let bands = [
            ("zscore", &self.zscore.bands),
            ("iqr", &self.iqr.bands),
            ("circulation", &patterns.circulation.bands),
            ("fan_out", &patterns.fan_out.bands),
            ("fan_in", &patterns.fan_in.bands),
            ("dormant", &patterns.dormant.bands),
            ("velocity", &patterns.velocity.bands),
        ];
        for (name, b) in bands {
            if !b.is_increasing() {
                return Err(eyre::eyre!(
                    "Severity bands for '{}' must be strictly increasing, got {:?}",
                    name,
                    b
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
[database]
url = "postgres://localhost/test"
max_connections = 5

[audit]
hmac_key = "secret"

[detection.zscore]
threshold = 2.5

[detection.patterns.velocity]
max_transactions = 50
bands = { medium = 1.5, high = 3.0, critical = 6.0 }
"#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.detection.zscore.threshold, 2.5);
        assert_eq!(config.detection.zscore.min_data_points, 30); // default
        assert_eq!(config.detection.iqr.multiplier, 1.5); // default
        assert_eq!(config.detection.patterns.velocity.max_transactions, 50);
        assert_eq!(config.detection.patterns.velocity.bands.high, 3.0);
        assert_eq!(config.detection.patterns.fan_out.threshold, 20); // default
        assert!(!config.graph.persistent);
        assert!(!config.graph.allow_clear);
        assert_eq!(config.logging.format, "pretty");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_graph_restore_from() {
        let toml_str = r#"
[database]
url = "postgres://localhost/test"

[audit]
hmac_key = "secret"

[graph]
persistent = true
snapshot_dir = "/var/lib/stablerisk/snapshots"
restore_from = "/var/lib/stablerisk/snapshots/nightly.json"
"#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(
            config.graph.restore_from.as_deref(),
            Some("/var/lib/stablerisk/snapshots/nightly.json")
        );
        assert_eq!(config.graph.snapshot_dir, "/var/lib/stablerisk/snapshots");
        assert!(GraphConfig::default().restore_from.is_none());
    }

    fn base_config() -> Config {
        Config {
            database: DatabaseConfig {
                url: "postgres://localhost/test".to_string(),
                max_connections: 5,
            },
            graph: GraphConfig::default(),
            detection: DetectionConfig::default(),
            audit: AuditConfig {
                hmac_key: "secret".to_string(),
            },
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn test_validate_empty_hmac_key() {
        let mut config = base_config();
        config.audit.hmac_key = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_non_increasing_bands() {
        let mut config = base_config();
        config.detection.iqr.bands = SeverityBands::new(5.0, 3.0, 10.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bad_thresholds() {
        let mut config = base_config();
        config.detection.zscore.threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.detection.zscore.min_data_points = 1;
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.detection.patterns.circulation.max_depth = 1;
        assert!(config.validate().is_err());
    }
}
