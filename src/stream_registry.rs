//! Stream descriptors, keyed by `"<app>-<env>"`, built once at startup from
//! a layered config lookup (stream -> environment-default ->
//! application-default -> global-default), per spec.md section 3.
//!
//! Grounded on `stream_info_t` and `setup_stream_info` in
//! `logjam-importer.c`: a read-only struct with a resolved
//! `import_threshold`, per-module threshold overrides, and an
//! `ignored_request_prefix`, shared by reference across every parser.

use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    pub key: String,
    pub app: String,
    pub env: String,
    pub db_shard_index: usize,
    pub import_threshold_ms: i64,
    pub module_thresholds: HashMap<String, i64>,
    pub ignored_request_prefix: Option<String>,
}

impl StreamDescriptor {
    /// Per-module override if `module` (without the leading `::`) has one,
    /// else the stream's own `import_threshold_ms`.
    pub fn threshold_for_module(&self, module: &str) -> i64 {
        let bare = module.strip_prefix("::").unwrap_or(module);
        self.module_thresholds
            .get(bare)
            .copied()
            .unwrap_or(self.import_threshold_ms)
    }

    pub fn is_ignored(&self, url: &str) -> bool {
        self.ignored_request_prefix
            .as_deref()
            .is_some_and(|prefix| url.starts_with(prefix))
    }
}

#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: HashMap<String, Arc<StreamDescriptor>>,
}

impl StreamRegistry {
    pub fn new(streams: Vec<StreamDescriptor>) -> Self {
        let streams = streams
            .into_iter()
            .map(|s| (s.key.clone(), Arc::new(s)))
            .collect();
        Self { streams }
    }

    /// Cheap clone of the shared descriptor; every worker holds this `Arc`
    /// for the lifetime of the process (spec.md section 9, "Back-references").
    pub fn get(&self, key: &str) -> Option<Arc<StreamDescriptor>> {
        self.streams.get(key).cloned()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.streams.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<StreamDescriptor>> {
        self.streams.values()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Strips the legacy `request-stream-` prefix used by older publishers
    /// before looking up the descriptor (spec.md section 4.1/4.2).
    pub fn resolve<'a>(&self, stream: &'a str) -> Option<(&'a str, Arc<StreamDescriptor>)> {
        let bare = stream.strip_prefix("request-stream-").unwrap_or(stream);
        self.get(bare).map(|d| (bare, d))
    }
}

/// Defaults resolved from the layered config tree before a stream override
/// is applied: global -> per-application -> per-environment.
#[derive(Debug, Clone, Default)]
pub struct ThresholdDefaults {
    pub import_threshold_ms: i64,
    pub ignored_request_prefix: Option<String>,
    pub module_thresholds: HashMap<String, i64>,
}

/// Builds one `StreamDescriptor` from the most-specific-first layering
/// described in spec.md section 3: stream overrides win over
/// environment-default, which wins over application-default, which wins
/// over global-default.
pub fn resolve_stream(
    app: &str,
    env: &str,
    db_shard_index: usize,
    global: &ThresholdDefaults,
    app_default: Option<&ThresholdDefaults>,
    env_default: Option<&ThresholdDefaults>,
    stream_override: Option<&ThresholdDefaults>,
) -> StreamDescriptor {
    let mut import_threshold_ms = global.import_threshold_ms;
    let mut ignored_request_prefix = global.ignored_request_prefix.clone();
    let mut module_thresholds = global.module_thresholds.clone();

    for layer in [app_default, env_default, stream_override].into_iter().flatten() {
        if layer.import_threshold_ms != 0 {
            import_threshold_ms = layer.import_threshold_ms;
        }
        if layer.ignored_request_prefix.is_some() {
            ignored_request_prefix = layer.ignored_request_prefix.clone();
        }
        for (k, v) in &layer.module_thresholds {
            module_thresholds.insert(k.clone(), *v);
        }
    }

    StreamDescriptor {
        key: format!("{app}-{env}"),
        app: app.to_string(),
        env: env.to_string(),
        db_shard_index,
        import_threshold_ms,
        module_thresholds,
        ignored_request_prefix,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layered_lookup_prefers_most_specific() {
        let global = ThresholdDefaults {
            import_threshold_ms: 100,
            ignored_request_prefix: None,
            module_thresholds: HashMap::new(),
        };
        let app_default = ThresholdDefaults {
            import_threshold_ms: 200,
            ..Default::default()
        };
        let env_default = ThresholdDefaults {
            import_threshold_ms: 300,
            ..Default::default()
        };
        let stream_override = ThresholdDefaults {
            ignored_request_prefix: Some("/health".into()),
            ..Default::default()
        };

        let desc = resolve_stream(
            "shop",
            "production",
            0,
            &global,
            Some(&app_default),
            Some(&env_default),
            Some(&stream_override),
        );

        // stream_override doesn't set import_threshold_ms (0), so the
        // next-most-specific layer that does (env_default) wins.
        assert_eq!(desc.import_threshold_ms, 300);
        assert_eq!(desc.ignored_request_prefix.as_deref(), Some("/health"));
        assert_eq!(desc.key, "shop-production");
    }

    #[test]
    fn module_threshold_override_and_fallback() {
        let mut module_thresholds = HashMap::new();
        module_thresholds.insert("Orders".to_string(), 50);
        let desc = StreamDescriptor {
            key: "shop-production".into(),
            app: "shop".into(),
            env: "production".into(),
            db_shard_index: 0,
            import_threshold_ms: 500,
            module_thresholds,
            ignored_request_prefix: None,
        };
        assert_eq!(desc.threshold_for_module("::Orders"), 50);
        assert_eq!(desc.threshold_for_module("::Payments"), 500);
    }

    #[test]
    fn legacy_prefix_strip_resolves() {
        let reg = StreamRegistry::new(vec![StreamDescriptor {
            key: "shop-production".into(),
            app: "shop".into(),
            env: "production".into(),
            db_shard_index: 0,
            import_threshold_ms: 500,
            module_thresholds: HashMap::new(),
            ignored_request_prefix: None,
        }]);
        let (bare, desc) = reg.resolve("request-stream-shop-production").unwrap();
        assert_eq!(bare, "shop-production");
        assert_eq!(desc.app, "shop");
        assert!(reg.resolve("unknown-stream").is_none());
    }

    #[test]
    fn ignored_prefix_matches() {
        let desc = StreamDescriptor {
            key: "shop-production".into(),
            app: "shop".into(),
            env: "production".into(),
            db_shard_index: 0,
            import_threshold_ms: 500,
            module_thresholds: HashMap::new(),
            ignored_request_prefix: Some("/health".into()),
        };
        assert!(desc.is_ignored("/health/live"));
        assert!(!desc.is_ignored("/orders/1"));
    }
}
