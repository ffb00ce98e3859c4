//! Type-safe configuration loader using the `config` crate, generalizing
//! the teacher's `Settings::new()` env-override layering to the
//! hierarchical `frontend`/`backend`/`metrics`/`graylog` tree described in
//! spec.md section 6.

use std::collections::HashMap;
use std::env;

use clap::Parser;
use config::{Config, ConfigError, File};
use serde::Deserialize;

use crate::resource_registry::{ResourceFamily, ResourceRegistry, ResourceRegistryBuilder};
use crate::stream_registry::{resolve_stream, StreamRegistry, ThresholdDefaults};

/// CLI surface from spec.md section 6: `-n` dry-run, `-c <path>` config
/// file, `-p <pattern>` stream-subscription filter.
#[derive(Parser, Debug, Clone)]
#[command(name = "logjam-importer", about = "Request-telemetry aggregation importer")]
pub struct Args {
    /// Don't perform any writes to the document store.
    #[arg(short = 'n', long = "dry-run")]
    pub dry_run: bool,

    /// Path to the config file.
    #[arg(short = 'c', long = "config", default_value = "logjam.conf", env = "LOGJAM_CONFIG")]
    pub config_path: String,

    /// Subscribe only to streams whose key contains this substring.
    #[arg(short = 'p', long = "pattern", default_value = "")]
    pub pattern: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct FrontendConfig {
    #[serde(default)]
    pub endpoints: HashMap<String, HashMap<String, String>>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct StreamOverride {
    pub import_threshold: Option<i64>,
    pub ignored_request_uri: Option<String>,
    #[serde(default)]
    pub modules: HashMap<String, i64>,
    /// Which `backend/databases/*` shard URI index this stream pins to.
    #[serde(default)]
    pub db: usize,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct DefaultsConfig {
    pub import_threshold: Option<i64>,
    pub ignored_request_uri: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct BackendConfig {
    #[serde(default)]
    pub databases: Vec<String>,
    #[serde(default)]
    pub streams: HashMap<String, StreamOverride>,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub applications: HashMap<String, DefaultsConfig>,
    #[serde(default)]
    pub environments: HashMap<String, DefaultsConfig>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    #[serde(default)]
    pub time: Vec<String>,
    #[serde(default)]
    pub call: Vec<String>,
    #[serde(default)]
    pub memory: Vec<String>,
    #[serde(default)]
    pub heap: Vec<String>,
    #[serde(default)]
    pub frontend: Vec<String>,
    #[serde(default)]
    pub dom: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct GraylogConfig {
    pub endpoint: Option<String>,
    #[serde(default = "default_sndhwm")]
    pub sndhwm: i32,
}

fn default_sndhwm() -> i32 {
    10_000
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub frontend: FrontendConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub graylog: GraylogConfig,
    /// HTTP bind address for the `/metrics` and `/healthz` endpoints.
    #[serde(default = "default_server_bind")]
    pub server_bind: String,
    /// Direct-push ingress port (spec.md section 4.1, default 9605).
    #[serde(default = "default_push_port")]
    pub push_port: u16,
    /// Live-stream egress endpoint (spec.md section 6, default 9607).
    #[serde(default = "default_live_stream_addr")]
    pub live_stream_addr: String,
    /// Optional debug duplication PUB-equivalent endpoint (`tcp://*:9651`).
    pub debug_pub_addr: Option<String>,
    /// Streams this process subscribes to; empty means "subscribe to all".
    #[serde(default)]
    pub stream_subscriptions: Vec<String>,
}

fn default_server_bind() -> String {
    "0.0.0.0:9100".to_string()
}

fn default_push_port() -> u16 {
    9605
}

fn default_live_stream_addr() -> String {
    "127.0.0.1:9607".to_string()
}

impl Settings {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let cfg = Config::builder()
            .add_source(File::with_name(path).required(false))
            .build()?;
        let mut settings: Settings = cfg.try_deserialize()?;

        if let Ok(bind) = env::var("APP__SERVER_BIND") {
            settings.server_bind = bind;
        }
        if let Ok(uris) = env::var("APP__DATABASES") {
            settings.backend.databases = uris.split(',').map(str::to_string).collect();
        }

        Ok(settings)
    }

    pub fn database_uris(&self) -> Vec<String> {
        if self.backend.databases.is_empty() {
            vec![DEFAULT_MONGO_URI.to_string()]
        } else {
            self.backend.databases.clone()
        }
    }

    pub fn build_resource_registry(&self) -> Result<ResourceRegistry, ConfigError> {
        let m = &self.metrics;
        let builder = ResourceRegistryBuilder::default();
        let builder = add_family(builder, ResourceFamily::Time, &m.time)?;
        let builder = add_family(builder, ResourceFamily::Call, &m.call)?;
        let builder = add_family(builder, ResourceFamily::Memory, &m.memory)?;
        let builder = add_family(builder, ResourceFamily::Heap, &m.heap)?;
        let builder = add_family(builder, ResourceFamily::Frontend, &m.frontend)?;
        let builder = add_family(builder, ResourceFamily::Dom, &m.dom)?;
        Ok(builder.build())
    }

    /// Layers stream -> environment-default -> application-default ->
    /// global-default per spec.md section 3, producing one descriptor per
    /// configured stream key.
    pub fn build_stream_registry(&self) -> StreamRegistry {
        let global = ThresholdDefaults {
            import_threshold_ms: self.backend.defaults.import_threshold.unwrap_or(0),
            ignored_request_prefix: self.backend.defaults.ignored_request_uri.clone(),
            module_thresholds: Default::default(),
        };

        let mut streams = Vec::new();
        for (key, stream_override) in &self.backend.streams {
            let Some((app, env)) = key.split_once('-') else {
                continue;
            };
            let app_default = self
                .backend
                .applications
                .get(app)
                .map(|d| threshold_defaults_from(d));
            let env_default = self
                .backend
                .environments
                .get(env)
                .map(|d| threshold_defaults_from(d));
            let stream_defaults = ThresholdDefaults {
                import_threshold_ms: stream_override.import_threshold.unwrap_or(0),
                ignored_request_prefix: stream_override.ignored_request_uri.clone(),
                module_thresholds: stream_override.modules.clone(),
            };

            streams.push(resolve_stream(
                app,
                env,
                stream_override.db,
                &global,
                app_default.as_ref(),
                env_default.as_ref(),
                Some(&stream_defaults),
            ));
        }
        StreamRegistry::new(streams)
    }
}

fn threshold_defaults_from(d: &DefaultsConfig) -> ThresholdDefaults {
    ThresholdDefaults {
        import_threshold_ms: d.import_threshold.unwrap_or(0),
        ignored_request_prefix: d.ignored_request_uri.clone(),
        module_thresholds: Default::default(),
    }
}

fn add_family(
    builder: ResourceRegistryBuilder,
    family: ResourceFamily,
    names: &[String],
) -> Result<ResourceRegistryBuilder, ConfigError> {
    builder
        .add_family(family, names)
        .map_err(|e| ConfigError::Message(e.to_string()))
}

const DEFAULT_MONGO_URI: &str = "mongodb://127.0.0.1:27017/";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_override_layers_correctly() {
        let mut settings = Settings::default();
        settings.backend.defaults.import_threshold = Some(100);
        settings
            .backend
            .applications
            .insert("shop".into(), DefaultsConfig { import_threshold: Some(200), ignored_request_uri: None });
        settings.backend.streams.insert(
            "shop-production".into(),
            StreamOverride {
                import_threshold: Some(500),
                ignored_request_uri: Some("/health".into()),
                modules: Default::default(),
                db: 0,
            },
        );

        let registry = settings.build_stream_registry();
        let desc = registry.get("shop-production").unwrap();
        assert_eq!(desc.import_threshold_ms, 500);
        assert_eq!(desc.ignored_request_prefix.as_deref(), Some("/health"));
    }

    #[test]
    fn resource_registry_builds_from_metrics_section() {
        let mut settings = Settings::default();
        settings.metrics.time = vec!["total_time".into(), "db_time".into()];
        settings.metrics.memory = vec!["allocated_objects".into(), "allocated_bytes".into()];
        let registry = settings.build_resource_registry().unwrap();
        assert_eq!(registry.len(), 4);
        assert!(registry.allocated_objects_index().is_some());
    }
}
