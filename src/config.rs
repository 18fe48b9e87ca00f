use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// 单据存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub backend: StoreBackend,
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Postgres,
            url: "postgres://localhost/invoice_match".to_string(),
            max_connections: 20,
        }
    }
}

/// 文件存储: 上传原件与匹配报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub upload_dir: PathBuf,
    pub report_dir: PathBuf,
    pub max_upload_mb: u64,
    /// 单次存储读写的超时 (秒)
    pub timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("./uploads"),
            report_dir: PathBuf::from("./reports"),
            max_upload_mb: 25,
            timeout_secs: 10,
        }
    }
}

impl StorageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn max_upload_bytes(&self) -> usize {
        (self.max_upload_mb as usize) * 1024 * 1024
    }
}

/// 明细相似度权重
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityWeights {
    pub description: f64,
    pub quantity: f64,
    pub unit_price: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            description: 0.5,
            quantity: 0.25,
            unit_price: 0.25,
        }
    }
}

impl SimilarityWeights {
    pub fn total(&self) -> f64 {
        self.description + self.quantity + self.unit_price
    }
}

/// 单号别名
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumberAlias {
    pub from: String,
    pub to: String,
}

/// 匹配引擎参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// 明细配对最低相似度 (严格大于才配对)
    pub min_similarity: f64,
    /// 描述/SKU 文本相似度下限 (严格大于才可配对)，数量与单价再接近也不能单独促成配对
    pub min_text_similarity: f64,
    /// 金额类字段的相对容差 (相对两值中较大者)
    pub monetary_tolerance: f64,
    /// 数量字段的相对容差
    pub quantity_tolerance: f64,
    /// 单据日期允许相差的天数
    pub date_window_days: u32,
    pub weights: SimilarityWeights,
    /// 单号别名: 不同系统编号 -> 统一编号
    pub document_number_aliases: Vec<NumberAlias>,
    /// 日期格式，按顺序尝试，首个成功者生效
    pub date_formats: Vec<String>,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            min_similarity: 0.55,
            min_text_similarity: 0.3,
            monetary_tolerance: 0.01,
            quantity_tolerance: 0.01,
            date_window_days: 30,
            weights: SimilarityWeights::default(),
            document_number_aliases: Vec::new(),
            date_formats: default_date_formats(),
        }
    }
}

fn default_date_formats() -> Vec<String> {
    [
        "%Y-%m-%d",
        "%Y/%m/%d",
        "%d/%m/%Y",
        "%d-%m-%Y",
        "%d.%m.%Y",
        "%m/%d/%Y",
        "%Y%m%d",
        "%d %b %Y",
        "%d %B %Y",
        "%b %d, %Y",
        "%B %d, %Y",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl MatchingConfig {
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("min_similarity", self.min_similarity),
            ("min_text_similarity", self.min_text_similarity),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("matching.{name} must be within [0, 1], got {value}"));
            }
        }
        for (name, value) in [
            ("monetary_tolerance", self.monetary_tolerance),
            ("quantity_tolerance", self.quantity_tolerance),
        ] {
            if !(0.0..1.0).contains(&value) {
                return Err(format!("matching.{name} must be within [0, 1), got {value}"));
            }
        }
        let w = &self.weights;
        if w.description < 0.0 || w.quantity < 0.0 || w.unit_price < 0.0 || w.total() <= 0.0 {
            return Err("matching.weights must be non-negative with a positive sum".to_string());
        }
        if self.date_formats.is_empty() {
            return Err("matching.date_formats must not be empty".to_string());
        }
        Ok(())
    }

    /// 单号 -> 别名表映射后的统一编号
    pub fn alias_lookup(&self) -> HashMap<String, String> {
        self.document_number_aliases
            .iter()
            .map(|a| (a.from.trim().to_string(), a.to.trim().to_string()))
            .collect()
    }
}

impl AppConfig {
    /// 加载配置: 默认值 -> config/invoice-match.* -> APP__ 前缀环境变量
    /// 兼容旧变量 SERVER_HOST / SERVER_PORT / DATABASE_URL
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/invoice-match")
    }

    pub fn load_from(file_stem: &str) -> Result<Self, ConfigError> {
        let port = std::env::var("SERVER_PORT")
            .ok()
            .and_then(|p| p.parse::<i64>().ok());

        let config: AppConfig = Config::builder()
            .add_source(Config::try_from(&AppConfig::default())?)
            .add_source(File::with_name(file_stem).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .set_override_option("server.host", std::env::var("SERVER_HOST").ok())?
            .set_override_option("server.port", port)?
            .set_override_option("database.url", std::env::var("DATABASE_URL").ok())?
            .build()?
            .try_deserialize()?;

        config.matching.validate().map_err(ConfigError::Message)?;
        Ok(config)
    }
}
