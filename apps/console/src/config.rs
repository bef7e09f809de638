use std::{collections::HashMap, fs};

use client_core::scanner;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_url: String,
    pub session_id: Option<String>,
    pub scan_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".into(),
            session_id: None,
            scan_interval_ms: scanner::DEFAULT_SCAN_INTERVAL_MS,
        }
    }
}

/// Defaults, overlaid by `console.toml`, overlaid by environment variables.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("console.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("server_url") {
                settings.server_url = v.clone();
            }
            if let Some(v) = file_cfg.get("session_id") {
                settings.session_id = Some(v.clone());
            }
            if let Some(v) = file_cfg.get("scan_interval_ms") {
                if let Ok(parsed) = v.parse::<u64>() {
                    settings.scan_interval_ms = parsed;
                }
            }
        }
    }

    if let Ok(v) = std::env::var("SWARM_SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("SWARM_SESSION_ID") {
        settings.session_id = Some(v);
    }
    if let Ok(v) = std::env::var("SWARM_SCAN_INTERVAL_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.scan_interval_ms = parsed;
        }
    }

    settings
}
