use std::path::PathBuf;

use crate::model::RebookPolicy;

#[derive(Debug)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
    /// Exactly one of the TLS variables was set.
    PartialTls,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "invalid value for {var}: {value:?}"),
            ConfigError::PartialTls => write!(
                f,
                "both SLOTKEEPER_TLS_CERT and SLOTKEEPER_TLS_KEY must be set, or neither"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub principals: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub rebook_policy: RebookPolicy,
    pub tls: Option<(String, String)>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            principals: PathBuf::from("./principals.json"),
            max_connections: 256,
            compact_threshold: 1000,
            rebook_policy: RebookPolicy::Never,
            tls: None,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(bind) = lookup("SLOTKEEPER_BIND") {
            config.bind = bind;
        }
        if let Some(port) = parse(&lookup, "SLOTKEEPER_PORT")? {
            config.port = port;
        }
        if let Some(dir) = lookup("SLOTKEEPER_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(file) = lookup("SLOTKEEPER_PRINCIPALS") {
            config.principals = PathBuf::from(file);
        }
        if let Some(max) = parse(&lookup, "SLOTKEEPER_MAX_CONNECTIONS")? {
            config.max_connections = max;
        }
        if let Some(threshold) = parse(&lookup, "SLOTKEEPER_COMPACT_THRESHOLD")? {
            config.compact_threshold = threshold;
        }
        if let Some(policy) = lookup("SLOTKEEPER_REBOOK_POLICY") {
            config.rebook_policy = match policy.as_str() {
                "never" => RebookPolicy::Never,
                "after_cancel" => RebookPolicy::AfterCancel,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: "SLOTKEEPER_REBOOK_POLICY",
                        value: policy,
                    });
                }
            };
        }
        config.tls = match (lookup("SLOTKEEPER_TLS_CERT"), lookup("SLOTKEEPER_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => return Err(ConfigError::PartialTls),
        };
        config.metrics_port = parse(&lookup, "SLOTKEEPER_METRICS_PORT")?;
        Ok(config)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotkeeper.wal")
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|var| map.get(var).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let c = config(&[]).unwrap();
        assert_eq!(c, Config::default());
        assert_eq!(c.addr(), "0.0.0.0:5433");
        assert_eq!(c.wal_path(), PathBuf::from("./data/slotkeeper.wal"));
    }

    #[test]
    fn overrides_apply() {
        let c = config(&[
            ("SLOTKEEPER_PORT", "6000"),
            ("SLOTKEEPER_DATA_DIR", "/var/lib/slotkeeper"),
            ("SLOTKEEPER_MAX_CONNECTIONS", "8"),
            ("SLOTKEEPER_REBOOK_POLICY", "after_cancel"),
            ("SLOTKEEPER_TLS_CERT", "cert.pem"),
            ("SLOTKEEPER_TLS_KEY", "key.pem"),
            ("SLOTKEEPER_METRICS_PORT", "9100"),
        ])
        .unwrap();
        assert_eq!(c.port, 6000);
        assert_eq!(c.max_connections, 8);
        assert_eq!(c.rebook_policy, RebookPolicy::AfterCancel);
        assert_eq!(c.tls, Some(("cert.pem".into(), "key.pem".into())));
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.wal_path(), PathBuf::from("/var/lib/slotkeeper/slotkeeper.wal"));
    }

    #[test]
    fn bad_values_are_errors() {
        assert!(matches!(
            config(&[("SLOTKEEPER_PORT", "not-a-port")]),
            Err(ConfigError::Invalid { var: "SLOTKEEPER_PORT", .. })
        ));
        assert!(matches!(
            config(&[("SLOTKEEPER_REBOOK_POLICY", "sometimes")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            config(&[("SLOTKEEPER_TLS_CERT", "cert.pem")]),
            Err(ConfigError::PartialTls)
        ));
    }
}
