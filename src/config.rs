//! Carga y gestión de configuración de la aplicación (API del catastro + reintentos).

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::reintentos::BackoffPolicy;

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub catastro_api_url: String,
    pub catastro_api_token: Option<String>,
    pub catastro_timeout_secs: u64,
    pub server_addr: String,

    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    pub retry_jitter_ms: u64,
    pub retry_max_attempts: u32,

    pub shared_cache_ttl_ms: u64,
    /// Tope de sesiones abiertas a la vez.
    pub max_sesiones: usize,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|clave| env::var(clave).ok())
    }

    /// Igual que [`AppConfig::from_env`], pero leyendo de una función arbitraria.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let catastro_api_url =
            lookup("CATASTRO_API_URL").ok_or_else(|| anyhow!("Falta CATASTRO_API_URL en el entorno"))?;
        let catastro_api_token = lookup("CATASTRO_API_TOKEN").filter(|t| !t.trim().is_empty());

        let server_addr = lookup("SERVER_ADDR").unwrap_or_else(|| "127.0.0.1:3322".to_string());

        Ok(Self {
            catastro_api_url,
            catastro_api_token,
            catastro_timeout_secs: numero(&lookup, "CATASTRO_TIMEOUT_SECS", 30)?,
            server_addr,
            retry_base_ms: numero(&lookup, "RETRY_BASE_MS", 1000)?,
            retry_cap_ms: numero(&lookup, "RETRY_CAP_MS", 10_000)?,
            retry_jitter_ms: numero(&lookup, "RETRY_JITTER_MS", 1000)?,
            retry_max_attempts: numero(&lookup, "RETRY_MAX_ATTEMPTS", 3)?,
            shared_cache_ttl_ms: numero(&lookup, "SHARED_CACHE_TTL_MS", 2000)?,
            max_sesiones: numero(&lookup, "MAX_SESIONES", 256)?,
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.retry_base_ms),
            cap: Duration::from_millis(self.retry_cap_ms),
            jitter_max: Duration::from_millis(self.retry_jitter_ms),
            max_attempts: self.retry_max_attempts.max(1),
        }
    }

    pub fn shared_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.shared_cache_ttl_ms)
    }
}

fn numero<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, clave: &str, defecto: T) -> Result<T> {
    match lookup(clave) {
        Some(valor) => valor
            .trim()
            .parse()
            .map_err(|_| anyhow!("Valor inválido para {clave}: '{valor}'")),
        None => Ok(defecto),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn desde(pares: &[(&str, &str)]) -> Result<AppConfig> {
        let mapa: HashMap<String, String> = pares
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|clave| mapa.get(clave).cloned())
    }

    #[test]
    fn defaults_match_backoff_policy() {
        let cfg = desde(&[("CATASTRO_API_URL", "https://catastro.example")]).unwrap();
        assert_eq!(cfg.backoff(), BackoffPolicy::default());
        assert_eq!(cfg.shared_cache_ttl(), Duration::from_millis(2000));
        assert_eq!(cfg.server_addr, "127.0.0.1:3322");
        assert_eq!(cfg.max_sesiones, 256);
        assert!(cfg.catastro_api_token.is_none());
    }

    #[test]
    fn missing_url_is_an_error() {
        let err = desde(&[]).unwrap_err();
        assert!(err.to_string().contains("CATASTRO_API_URL"));
    }

    #[test]
    fn invalid_number_is_reported() {
        let err = desde(&[
            ("CATASTRO_API_URL", "https://catastro.example"),
            ("RETRY_MAX_ATTEMPTS", "tres"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("RETRY_MAX_ATTEMPTS"));
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = desde(&[
            ("CATASTRO_API_URL", "https://catastro.example"),
            ("CATASTRO_API_TOKEN", "secreto"),
            ("RETRY_BASE_MS", "250"),
            ("RETRY_MAX_ATTEMPTS", "5"),
        ])
        .unwrap();
        assert_eq!(cfg.catastro_api_token.as_deref(), Some("secreto"));
        assert_eq!(cfg.backoff().base, Duration::from_millis(250));
        assert_eq!(cfg.backoff().max_attempts, 5);
    }
}
