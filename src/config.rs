use std::env;

use anyhow::{anyhow, Result};

#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub max_bytes: Option<u64>,
    pub keep: usize,
    pub compress: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub rate_limit: u32,
    pub rate_window_secs: u64,
    pub counter_store_url: Option<String>,
    pub counter_store_key: Option<String>,
    pub reasoner_url: Option<String>,
    pub reasoner_api_key: Option<String>,
    pub reasoner_model: String,
    pub reasoner_timeout_ms: u64,
    pub notify_url: Option<String>,
    pub notify_token: Option<String>,
    pub log_file: Option<String>,
    pub rotation: RotationConfig,
    pub log_stdout: bool,
    pub max_request_bytes: Option<usize>,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            rate_limit: 10,
            rate_window_secs: 60,
            counter_store_url: None,
            counter_store_key: None,
            reasoner_url: None,
            reasoner_api_key: None,
            reasoner_model: "gpt-4o-mini".to_string(),
            reasoner_timeout_ms: 8000,
            notify_url: None,
            notify_token: None,
            log_file: None,
            rotation: RotationConfig {
                max_bytes: None,
                keep: 1,
                compress: false,
            },
            log_stdout: false,
            max_request_bytes: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = AppConfig::default();

        let rate_limit = parse_optional_u64("SCANWISE_RATE_LIMIT")?
            .map(|v| v as u32)
            .unwrap_or(defaults.rate_limit);
        if rate_limit == 0 {
            return Err(anyhow!("SCANWISE_RATE_LIMIT must be at least 1"));
        }
        let rate_window_secs = parse_optional_u64("SCANWISE_RATE_WINDOW_SECS")?
            .unwrap_or(defaults.rate_window_secs);
        if rate_window_secs == 0 {
            return Err(anyhow!("SCANWISE_RATE_WINDOW_SECS must be at least 1"));
        }

        let counter_store_url = non_empty_var("SCANWISE_COUNTER_STORE_URL");
        let counter_store_key = non_empty_var("SCANWISE_COUNTER_STORE_KEY");

        let reasoner_url = non_empty_var("SCANWISE_REASONER_URL");
        let reasoner_api_key = non_empty_var("SCANWISE_REASONER_API_KEY");
        let reasoner_model =
            non_empty_var("SCANWISE_REASONER_MODEL").unwrap_or(defaults.reasoner_model);
        let reasoner_timeout_ms = parse_optional_u64("SCANWISE_REASONER_TIMEOUT_MS")?
            .unwrap_or(defaults.reasoner_timeout_ms);

        let notify_url = non_empty_var("SCANWISE_NOTIFY_URL");
        let notify_token = non_empty_var("SCANWISE_NOTIFY_TOKEN");

        let log_file = env::var("LOG_FILE").ok();
        let rotation = RotationConfig {
            max_bytes: parse_optional_u64("LOG_MAX_BYTES")?,
            keep: parse_optional_u64("LOG_ROTATE_KEEP")?.unwrap_or(1) as usize,
            compress: parse_bool_env("LOG_ROTATE_COMPRESS")?.unwrap_or(false),
        };

        let log_stdout = parse_bool_env("SCANWISE_LOG_STDOUT")?.unwrap_or(false);
        let max_request_bytes =
            parse_optional_u64("SCANWISE_MAX_REQUEST_BYTES")?.map(|v| v as usize);

        Ok(AppConfig {
            rate_limit,
            rate_window_secs,
            counter_store_url,
            counter_store_key,
            reasoner_url,
            reasoner_api_key,
            reasoner_model,
            reasoner_timeout_ms,
            notify_url,
            notify_token,
            log_file,
            rotation,
            log_stdout,
            max_request_bytes,
        })
    }
}

fn non_empty_var(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
