use std::{env, time::Duration};

pub const DEFAULT_UPSTREAM_BASE: &str = "https://api.tavily.com";
pub const DEFAULT_DB_PATH: &str = "./server/data/app.db";
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(150);

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub database_path: String,
    pub upstream_base: String,
    pub upstream_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let listen_addr = match getenv("LISTEN_ADDR") {
            Some(addr) => addr,
            None => {
                let port = getenv("PORT").unwrap_or_else(|| "8080".to_owned());
                format!("0.0.0.0:{port}")
            }
        };

        let database_path = getenv("DB_PATH")
            .or_else(|| getenv("DATABASE_PATH"))
            .unwrap_or_else(|| DEFAULT_DB_PATH.to_owned());

        let upstream_base =
            getenv("TAVILY_BASE_URL").unwrap_or_else(|| DEFAULT_UPSTREAM_BASE.to_owned());

        let upstream_timeout = getenv("UPSTREAM_TIMEOUT")
            .and_then(|raw| parse_duration(&raw))
            .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT);

        Self {
            listen_addr,
            database_path,
            upstream_base,
            upstream_timeout,
        }
    }
}

fn getenv(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

/// Accepts either a bare integer (seconds) or a duration string with an
/// `ms`/`s`/`m`/`h` suffix, e.g. `150s`, `2m`, `500ms`.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let (value, unit) = raw.split_at(raw.find(|c: char| c.is_ascii_alphabetic())?);
    let value = value.trim().parse::<f64>().ok()?;
    if value < 0.0 {
        return None;
    }
    let millis = match unit.trim() {
        "ms" => value,
        "s" => value * 1_000.0,
        "m" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        _ => return None,
    };
    Some(Duration::from_millis(millis as u64))
}
