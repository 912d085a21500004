use anyhow::{anyhow, Result};
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::{fmt::time::UtcTime, EnvFilter};

const DEFAULT_FILTER: &str = "info,tower_http=info";

/**
 * \brief 初始化全局日志：RUST_LOG 控制过滤，时间戳为 RFC3339 UTC。
 */
pub fn init() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::new(Rfc3339))
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("init logging failed: {}", e))
}

/**
 * \brief 记录常规事件。
 */
pub fn log_event(category: &str, message: &str) {
    tracing::info!(category, "{}", message);
}

/**
 * \brief 记录错误事件。
 */
pub fn log_error(category: &str, message: &str) {
    tracing::error!(category, "{}", message);
}

/**
 * \brief 凭据脱敏：只保留前 `keep` 个字符。
 */
pub fn mask(value: Option<&str>, keep: usize) -> String {
    match value {
        Some(v) if !v.is_empty() => {
            let prefix: String = v.chars().take(keep).collect();
            format!("{}...", prefix)
        }
        _ => "NOT SET".to_string(),
    }
}
