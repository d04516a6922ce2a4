use super::BrokerConfig;
use crate::{RelayError, Result};
use config::{Config, Environment};

impl BrokerConfig {
    /// Load configuration from `RELAYMQ_*` environment variables, layered
    /// over the built-in defaults and validated before use.
    ///
    /// Recognized variables mirror the config fields one to one:
    /// `RELAYMQ_NAME`, `RELAYMQ_HOST`, `RELAYMQ_PORT`,
    /// `RELAYMQ_SOCKET_PATH`, `RELAYMQ_MAX_CONNECTIONS`, and
    /// `RELAYMQ_MAX_FRAME_SIZE`. Unset variables keep their defaults, so a
    /// partial environment is always enough. Numeric variables arrive as
    /// strings and are parsed into the field types.
    pub fn from_env() -> Result<Self> {
        let defaults = Config::try_from(&BrokerConfig::default())
            .map_err(|e| RelayError::Config(e.to_string()))?;
        let layered = Config::builder()
            .add_source(defaults)
            .add_source(Environment::with_prefix("RELAYMQ").try_parsing(true))
            .build()
            .map_err(|e| RelayError::Config(e.to_string()))?;

        let config: BrokerConfig = layered
            .try_deserialize()
            .map_err(|e| RelayError::Config(e.to_string()))?;
        config.validate().map_err(RelayError::Config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Single test body: the RELAYMQ_* process environment must only be
    // touched from one thread at a time.
    #[test]
    fn environment_layers_over_defaults_and_is_validated() {
        let clean = BrokerConfig::from_env().expect("defaults alone load");
        assert_eq!(clean.name, BrokerConfig::default().name);
        assert_eq!(clean.port, BrokerConfig::default().port);
        assert!(clean.socket_path.is_none());

        std::env::set_var("RELAYMQ_NAME", "hub");
        std::env::set_var("RELAYMQ_PORT", "7273");
        std::env::set_var("RELAYMQ_MAX_CONNECTIONS", "64");
        let loaded = BrokerConfig::from_env().expect("partial environment loads");
        assert_eq!(loaded.name, "hub");
        assert_eq!(loaded.port, 7273);
        assert_eq!(loaded.max_connections, 64);
        // Untouched fields keep their defaults.
        assert_eq!(loaded.host, BrokerConfig::default().host);
        assert_eq!(loaded.max_frame_size, BrokerConfig::default().max_frame_size);

        // Out-of-bounds values are rejected by validation, not passed on.
        std::env::set_var("RELAYMQ_MAX_CONNECTIONS", "0");
        assert!(BrokerConfig::from_env().is_err());

        std::env::remove_var("RELAYMQ_NAME");
        std::env::remove_var("RELAYMQ_PORT");
        std::env::remove_var("RELAYMQ_MAX_CONNECTIONS");
    }
}
