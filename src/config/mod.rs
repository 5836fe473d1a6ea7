mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, DispatchSettings, LogSettings, PublishSettings, Settings,
};

/// Loads the configuration from the default file and environment variables.
///
/// Environment variables use the `TOPICBUS_` prefix and `__` between nested
/// keys, e.g. `TOPICBUS_BROKER__URL` or `TOPICBUS_DISPATCH__WORKERS`.
/// Anything left unspecified falls back to `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("TOPICBUS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    // Merge with defaults
    let default = Settings::default();
    let broker = partial.broker;
    let dispatch = partial.dispatch;

    Ok(Settings {
        broker: BrokerSettings {
            url: broker
                .as_ref()
                .and_then(|b| b.url.clone())
                .unwrap_or(default.broker.url),
            exchange: broker
                .as_ref()
                .and_then(|b| b.exchange.clone())
                .unwrap_or(default.broker.exchange),
            queue: broker
                .as_ref()
                .and_then(|b| b.queue.clone())
                .unwrap_or(default.broker.queue),
            max_attempts: broker
                .as_ref()
                .and_then(|b| b.max_attempts)
                .unwrap_or(default.broker.max_attempts),
        },
        dispatch: DispatchSettings {
            workers: dispatch
                .as_ref()
                .and_then(|d| d.workers)
                .unwrap_or(default.dispatch.workers),
            capacity: dispatch
                .as_ref()
                .and_then(|d| d.capacity)
                .unwrap_or(default.dispatch.capacity),
        },
        publish: PublishSettings {
            timeout_ms: partial
                .publish
                .and_then(|p| p.timeout_ms)
                .unwrap_or(default.publish.timeout_ms),
        },
        log: LogSettings {
            level: partial
                .log
                .and_then(|l| l.level)
                .unwrap_or(default.log.level),
        },
    })
}

#[cfg(test)]
mod tests;
