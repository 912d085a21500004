use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::telemetry;

/** \brief 密钥名前缀：`agentic-app-platform-e2b-api-key` <-> `E2B_API_KEY`。 */
pub const APP_PREFIX: &str = "agentic-app-platform";

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const SECRET_MANAGER_BASE: &str = "https://secretmanager.googleapis.com/v1";

/**
 * \brief 启动时需要解析的全部凭据（以环境变量名表示）。
 */
pub const KNOWN_SECRETS: [&str; 8] = [
    "E2B_API_KEY",
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "GROQ_API_KEY",
    "TOGETHER_API_KEY",
    "FIREWORKS_API_KEY",
    "XAI_API_KEY",
    "DEEPSEEK_API_KEY",
];

/**
 * \brief 密钥名转换为环境变量名：去掉应用前缀，大写，`-` 换成 `_`。
 */
pub fn secret_name_to_env_var(secret_name: &str) -> String {
    let prefix = format!("{}-", APP_PREFIX);
    let key = secret_name.strip_prefix(&prefix).unwrap_or(secret_name);
    key.to_ascii_uppercase().replace('-', "_")
}

pub fn env_var_to_secret_name(env_var: &str) -> String {
    format!(
        "{}-{}",
        APP_PREFIX,
        env_var.to_ascii_lowercase().replace('_', "-")
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Backend {
    /** \brief 仅读取环境变量 */
    Env,
    /** \brief 优先 GCP Secret Manager，失败时回退环境变量 */
    SecretManager { project_id: String },
}

#[derive(Deserialize)]
struct AccessTokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct SecretVersionResponse {
    payload: SecretPayload,
}

#[derive(Deserialize)]
struct SecretPayload {
    data: String,
}

/**
 * \brief 逻辑密钥名 -> 值；每个 key 只解析一次并缓存到进程结束。
 */
pub struct SecretResolver {
    backend: Backend,
    env: HashMap<String, String>,
    http: reqwest::Client,
    cache: RwLock<HashMap<String, Option<String>>>,
}

impl SecretResolver {
    /**
     * \brief 以当前进程环境构建；存在 PROJECT_ID 时启用 Secret Manager。
     */
    pub fn from_env() -> Self {
        Self::with_env(std::env::vars().collect())
    }

    pub fn with_env(env: HashMap<String, String>) -> Self {
        let backend = match env.get("PROJECT_ID").filter(|v| !v.is_empty()) {
            Some(project_id) => Backend::SecretManager {
                project_id: project_id.clone(),
            },
            None => Backend::Env,
        };
        Self {
            backend,
            env,
            http: reqwest::Client::new(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn uses_secret_manager(&self) -> bool {
        matches!(self.backend, Backend::SecretManager { .. })
    }

    /**
     * \brief 直接读取启动时的环境快照。
     */
    pub fn env_var(&self, name: &str) -> Option<String> {
        self.env.get(name).filter(|v| !v.is_empty()).cloned()
    }

    /**
     * \brief 解析密钥，结果（包括未找到）会被缓存。
     */
    pub async fn get(&self, secret_name: &str) -> Option<String> {
        if let Some(hit) = self.cache.read().await.get(secret_name) {
            return hit.clone();
        }
        let value = self.resolve(secret_name).await;
        self.cache
            .write()
            .await
            .entry(secret_name.to_string())
            .or_insert(value)
            .clone()
    }

    async fn resolve(&self, secret_name: &str) -> Option<String> {
        let env_var = secret_name_to_env_var(secret_name);
        match &self.backend {
            Backend::Env => self.env_var(&env_var),
            Backend::SecretManager { project_id } => {
                match self.fetch_secret(project_id, secret_name).await {
                    Ok(value) => Some(value),
                    Err(e) => {
                        telemetry::log_error(
                            "secrets",
                            &format!(
                                "could not fetch secret '{}' from Secret Manager: {:#}",
                                secret_name, e
                            ),
                        );
                        self.env_var(&env_var)
                    }
                }
            }
        }
    }

    async fn fetch_secret(&self, project_id: &str, secret_name: &str) -> Result<String> {
        let token: AccessTokenResponse = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .context("metadata server unreachable")?
            .error_for_status()?
            .json()
            .await?;

        let url = format!(
            "{}/projects/{}/secrets/{}/versions/latest:access",
            SECRET_MANAGER_BASE, project_id, secret_name
        );
        let resp = self
            .http
            .get(url)
            .bearer_auth(&token.access_token)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("secret access failed: {} -> {}", status, text));
        }
        let version: SecretVersionResponse = resp.json().await?;
        let raw = BASE64
            .decode(version.payload.data.as_bytes())
            .context("secret payload is not base64")?;
        String::from_utf8(raw).context("secret payload is not utf-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_secret_name_mapping() {
        assert_eq!(
            secret_name_to_env_var("agentic-app-platform-e2b-api-key"),
            "E2B_API_KEY"
        );
        assert_eq!(
            secret_name_to_env_var("agentic-app-platform-openai-api-key"),
            "OPENAI_API_KEY"
        );
        assert_eq!(secret_name_to_env_var("other-key"), "OTHER_KEY");
        for name in KNOWN_SECRETS {
            assert_eq!(secret_name_to_env_var(&env_var_to_secret_name(name)), name);
        }
    }

    #[test]
    fn test_backend_selected_by_project_id() {
        assert!(!SecretResolver::with_env(env(&[])).uses_secret_manager());
        assert!(!SecretResolver::with_env(env(&[("PROJECT_ID", "")])).uses_secret_manager());
        assert!(SecretResolver::with_env(env(&[("PROJECT_ID", "p-1")])).uses_secret_manager());
    }

    #[tokio::test]
    async fn test_env_lookup_is_cached() {
        let resolver = SecretResolver::with_env(env(&[("GROQ_API_KEY", "gsk-1")]));
        let name = env_var_to_secret_name("GROQ_API_KEY");
        assert_eq!(resolver.get(&name).await.as_deref(), Some("gsk-1"));
        assert_eq!(resolver.get(&name).await.as_deref(), Some("gsk-1"));
        assert_eq!(resolver.cache.read().await.len(), 1);
        assert_eq!(
            resolver.get(&env_var_to_secret_name("XAI_API_KEY")).await,
            None
        );
    }
}
