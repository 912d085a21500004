use std::collections::HashMap;

use anyhow::{Context, Result};

use crate::secrets::{env_var_to_secret_name, SecretResolver, KNOWN_SECRETS};
use crate::telemetry;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_E2B_API_URL: &str = "https://api.e2b.dev";
pub const DEFAULT_E2B_DOMAIN: &str = "e2b.app";

/**
 * \brief 启动时解析好的 API Key，按环境变量名索引。
 */
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    values: HashMap<String, String>,
}

impl ApiKeys {
    pub fn get(&self, env_var: &str) -> Option<&str> {
        self.values.get(env_var).map(|s| s.as_str())
    }

    pub fn with(mut self, env_var: &str, value: &str) -> Self {
        self.values.insert(env_var.to_string(), value.to_string());
        self
    }
}

/**
 * \brief 沙箱服务端点配置。
 */
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub api_key: Option<String>,
    /** \brief 控制面地址，创建沙箱 */
    pub api_url: String,
    /** \brief 沙箱主机域名，`{port}-{sandbox_id}.{domain}` */
    pub domain: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: DEFAULT_E2B_API_URL.to_string(),
            domain: DEFAULT_E2B_DOMAIN.to_string(),
        }
    }
}

/**
 * \brief 进程级配置，启动时构建一次，之后只读。
 */
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub keys: ApiKeys,
    pub sandbox: SandboxConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            keys: ApiKeys::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl AppConfig {
    /**
     * \brief 加载 .env（若存在）、环境变量与 Secret Manager。
     */
    pub async fn load() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            telemetry::log_event("config", &format!("loaded {}", path.display()));
        }
        let resolver = SecretResolver::from_env();
        Self::from_resolver(&resolver).await
    }

    pub async fn from_resolver(resolver: &SecretResolver) -> Result<Self> {
        let port = match resolver.env_var("PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("invalid PORT value: {}", raw))?,
            None => DEFAULT_PORT,
        };

        let mut keys = ApiKeys::default();
        for env_var in KNOWN_SECRETS {
            if let Some(v) = resolver.get(&env_var_to_secret_name(env_var)).await {
                keys = keys.with(env_var, &v);
            }
        }
        if resolver.uses_secret_manager() {
            telemetry::log_event("config", "credentials resolved via Secret Manager");
        }

        let sandbox = SandboxConfig {
            api_key: keys.get("E2B_API_KEY").map(|s| s.to_string()),
            api_url: resolver
                .env_var("E2B_API_URL")
                .unwrap_or_else(|| DEFAULT_E2B_API_URL.to_string()),
            domain: resolver
                .env_var("E2B_DOMAIN")
                .unwrap_or_else(|| DEFAULT_E2B_DOMAIN.to_string()),
        };

        Ok(Self {
            port,
            keys,
            sandbox,
        })
    }

    /**
     * \brief 启动日志：只打印脱敏后的关键凭据。
     */
    pub fn log_summary(&self) {
        telemetry::log_event(
            "config",
            &format!(
                "E2B_API_KEY={} OPENAI_API_KEY={} ANTHROPIC_API_KEY={} port={}",
                telemetry::mask(self.keys.get("E2B_API_KEY"), 15),
                telemetry::mask(self.keys.get("OPENAI_API_KEY"), 10),
                telemetry::mask(self.keys.get("ANTHROPIC_API_KEY"), 10),
                self.port
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(pairs: &[(&str, &str)]) -> SecretResolver {
        SecretResolver::with_env(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_load_from_env_snapshot() {
        let r = resolver(&[
            ("PORT", "9001"),
            ("OPENAI_API_KEY", "sk-1"),
            ("E2B_API_KEY", "e2b-1"),
            ("E2B_DOMAIN", "sandbox.local"),
        ]);
        let cfg = AppConfig::from_resolver(&r).await.expect("load config");
        assert_eq!(cfg.port, 9001);
        assert_eq!(cfg.keys.get("OPENAI_API_KEY"), Some("sk-1"));
        assert_eq!(cfg.keys.get("GROQ_API_KEY"), None);
        assert_eq!(cfg.sandbox.api_key.as_deref(), Some("e2b-1"));
        assert_eq!(cfg.sandbox.domain, "sandbox.local");
        assert_eq!(cfg.sandbox.api_url, DEFAULT_E2B_API_URL);
    }

    #[tokio::test]
    async fn test_defaults_and_bad_port() {
        let cfg = AppConfig::from_resolver(&resolver(&[]))
            .await
            .expect("load config");
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert!(cfg.sandbox.api_key.is_none());

        assert!(AppConfig::from_resolver(&resolver(&[("PORT", "http")]))
            .await
            .is_err());
    }
}
