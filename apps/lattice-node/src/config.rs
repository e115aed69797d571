use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Signer key material; generated when the environment does not carry one.
    pub private_key: Option<Vec<u8>>,
    /// Accepted for parity with managed deployments; no sink is wired here.
    pub telemetry_connection_string: Option<String>,
    /// Latency threshold for console colouring.
    pub max_latency: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(9850),
            private_key: env::var("PRIVATE_KEY").ok().and_then(|k| decode_hex(&k)),
            telemetry_connection_string: env::var("APPLICATION_INSIGHTS_CONNECTION_STRING").ok(),
            max_latency: env::var("LATTICE_MAX_LATENCY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_millis(500)),
        }
    }
}

fn decode_hex(input: &str) -> Option<Vec<u8>> {
    let cleaned = input.trim().trim_start_matches("0x");
    if cleaned.is_empty() || cleaned.len() % 2 != 0 {
        return None;
    }
    (0..cleaned.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&cleaned[i..i + 2], 16).ok())
        .collect()
}
