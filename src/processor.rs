//! Per-parser, per-database aggregation scratchpad (`processor_state_t` in
//! the original source) and the database-naming / quantile-bucketing rules
//! from spec.md section 3.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::NaiveDateTime;

use crate::increments::Increments;
use crate::resource_registry::{ResourceId, ResourceRegistry};
use crate::stream_registry::StreamDescriptor;

pub const ALL_PAGES: &str = "all_pages";

/// Bucketing step (in resource units) and one-letter "kind" tag for the
/// quant key, per spec.md section 3 "Quantile bucketing".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantKind {
    Time,
    Memory,
}

impl QuantKind {
    pub fn tag(self) -> char {
        match self {
            QuantKind::Time => 't',
            QuantKind::Memory => 'm',
        }
    }
}

/// Which quant family (if any) a resource belongs to, and its bucket step.
pub fn quant_family(registry: &ResourceRegistry, id: ResourceId) -> Option<(QuantKind, f64)> {
    if registry.is_time_resource(id) {
        return Some((QuantKind::Time, 100.0));
    }
    if Some(id) == registry.allocated_objects_index() {
        return Some((QuantKind::Memory, 10_000.0));
    }
    if Some(id) == registry.allocated_bytes_index() {
        return Some((QuantKind::Memory, 100_000.0));
    }
    None
}

/// `(ceil(floor(value/d))+1) * d`, per spec.md section 3.
pub fn quant_bucket(value: f64, step: f64) -> u64 {
    let bucket = (((value / step).floor()).ceil() + 1.0) * step;
    bucket as u64
}

/// Builds `logjam-<app>-<env>-<YYYY-MM-DD>` from a stream and a parsed
/// `started_at` date.
pub fn database_name(app: &str, env: &str, date: &str) -> String {
    format!("logjam-{app}-{env}-{date}")
}

/// Accepts `started_at` with a `T` or space separator, extracts the
/// `YYYY-MM-DD` date, and rejects malformed or excessively drifted
/// timestamps (more than 3600s from `now`), per spec.md section 3/4.2.
pub fn parse_started_at(raw: &str, now: chrono::DateTime<chrono::Utc>) -> Option<(String, NaiveDateTime)> {
    const MAX_DRIFT_SECS: i64 = 3600;

    let normalized = if raw.len() > 10 && raw.as_bytes()[10] == b' ' {
        let mut s = raw.to_string();
        s.replace_range(10..11, "T");
        s
    } else {
        raw.to_string()
    };

    let parsed = NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()?;

    let drift = (now.naive_utc() - parsed).num_seconds().abs();
    if drift > MAX_DRIFT_SECS {
        return None;
    }

    let date = raw.get(0..10)?.to_string();
    Some((date, parsed))
}

/// `minute = 60*HH + MM`, read from positions 11..16 of `started_at`
/// (spec.md section 4.2.e); callers pass the already-validated raw string.
pub fn minute_of_day(started_at: &str) -> Option<u16> {
    let bytes = started_at.as_bytes();
    if bytes.len() < 16 {
        return None;
    }
    let hh: u16 = started_at.get(11..13)?.parse().ok()?;
    let mm: u16 = started_at.get(14..16)?.parse().ok()?;
    let minute = 60 * hh + mm;
    if minute > 1439 {
        return None;
    }
    Some(minute)
}

#[derive(Debug, Default)]
pub struct ProcessorState {
    pub db_name: String,
    pub stream: Option<Arc<StreamDescriptor>>,
    pub request_count: u64,
    pub modules: HashSet<String>,
    pub totals: HashMap<String, Increments>,
    /// Key: `"<minute>-<namespace>"`.
    pub minutes: HashMap<String, Increments>,
    /// Key: `"<kind>-<quant>-<namespace>"`, value: per-resource counts.
    pub quants: HashMap<String, Vec<u64>>,
}

impl ProcessorState {
    pub fn new(db_name: String, stream: Arc<StreamDescriptor>) -> Self {
        Self {
            db_name,
            stream: Some(stream),
            ..Default::default()
        }
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.modules
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(ALL_PAGES))
    }

    pub fn add_total(&mut self, registry: &ResourceRegistry, namespace: &str, inc: &Increments) {
        self.totals
            .entry(namespace.to_string())
            .or_insert_with(|| Increments::new(registry))
            .merge(inc);
    }

    pub fn add_minute(
        &mut self,
        registry: &ResourceRegistry,
        minute: u16,
        namespace: &str,
        inc: &Increments,
    ) {
        let key = format!("{minute}-{namespace}");
        self.minutes
            .entry(key)
            .or_insert_with(|| Increments::new(registry))
            .merge(inc);
    }

    /// Bumps the quant bucket for every resource with a positive value in
    /// `inc.metrics`, under both `namespace` and the `all_pages` sentinel
    /// (spec.md section 3, `processor_add_quants` in the original source).
    pub fn add_quants(&mut self, registry: &ResourceRegistry, namespace: &str, inc: &Increments) {
        for id in registry.iter() {
            let val = inc.metrics[id].sum;
            if val <= 0.0 {
                continue;
            }
            let Some((kind, step)) = quant_family(registry, id) else {
                continue;
            };
            let bucket = quant_bucket(val, step);
            for ns in [namespace, ALL_PAGES] {
                let key = format!("{}-{}-{}", kind.tag(), bucket, ns);
                let counts = self
                    .quants
                    .entry(key)
                    .or_insert_with(|| vec![0u64; registry.len()]);
                if counts.len() <= id {
                    counts.resize(id + 1, 0);
                }
                counts[id] += 1;
            }
        }
    }

    /// Merges `other` into `self` element-wise: `request_count`, `modules`,
    /// `totals`, `minutes`, `quants` (spec.md section 4.3 step 2).
    pub fn merge(&mut self, registry: &ResourceRegistry, other: ProcessorState) {
        self.request_count += other.request_count;
        self.modules.extend(other.modules);
        for (ns, inc) in other.totals {
            self.totals
                .entry(ns)
                .or_insert_with(|| Increments::new(registry))
                .merge(&inc);
        }
        for (key, inc) in other.minutes {
            self.minutes
                .entry(key)
                .or_insert_with(|| Increments::new(registry))
                .merge(&inc);
        }
        for (key, counts) in other.quants {
            let entry = self
                .quants
                .entry(key)
                .or_insert_with(|| vec![0u64; registry.len()]);
            if entry.len() < counts.len() {
                entry.resize(counts.len(), 0);
            }
            for (i, c) in counts.into_iter().enumerate() {
                entry[i] += c;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_registry::{ResourceFamily, ResourceRegistry};
    use chrono::TimeZone;

    #[test]
    fn database_name_format() {
        assert_eq!(
            database_name("shop", "production", "2024-06-01"),
            "logjam-shop-production-2024-06-01"
        );
    }

    #[test]
    fn parses_t_and_space_separators() {
        let now = chrono::Utc.with_ymd_and_hms(2024, 6, 1, 12, 34, 56).unwrap();
        let (date_t, _) = parse_started_at("2024-06-01T12:34:56", now).unwrap();
        let (date_space, _) = parse_started_at("2024-06-01 12:34:56", now).unwrap();
        assert_eq!(date_t, "2024-06-01");
        assert_eq!(date_space, "2024-06-01");
    }

    #[test]
    fn rejects_excessive_drift() {
        let now = chrono::Utc.with_ymd_and_hms(2024, 6, 1, 14, 34, 56).unwrap();
        assert!(parse_started_at("2024-06-01 12:34:56", now).is_none());
    }

    #[test]
    fn minute_calc_scenario_754() {
        // 12:34 -> 60*12+34 = 754, matches scenario 1 in spec.md section 8.
        assert_eq!(minute_of_day("2024-06-01T12:34:56"), Some(754));
    }

    #[test]
    fn quant_bucket_3100_for_3000ms() {
        assert_eq!(quant_bucket(3000.0, 100.0), 3100);
    }

    fn registry() -> ResourceRegistry {
        ResourceRegistry::builder()
            .add_family(ResourceFamily::Time, &["total_time".into()])
            .unwrap()
            .add_family(
                ResourceFamily::Memory,
                &["allocated_objects".into(), "allocated_bytes".into()],
            )
            .unwrap()
            .build()
    }

    #[test]
    fn all_pages_backend_count_equals_sum_of_pages() {
        let reg = registry();
        let mut state = ProcessorState {
            db_name: "logjam-shop-production-2024-06-01".into(),
            ..Default::default()
        };
        let mut inc1 = Increments::new(&reg);
        inc1.backend_count = 1;
        let mut inc2 = Increments::new(&reg);
        inc2.backend_count = 2;
        state.add_total(&reg, "Orders#show", &inc1);
        state.add_total(&reg, "Orders#index", &inc2);
        let mut total = Increments::new(&reg);
        total.merge(&inc1);
        total.merge(&inc2);
        state.add_total(&reg, ALL_PAGES, &total);

        let sum: i64 = state
            .totals
            .iter()
            .filter(|(k, _)| *k != ALL_PAGES)
            .map(|(_, v)| v.backend_count)
            .sum();
        assert_eq!(sum, state.totals[ALL_PAGES].backend_count);
    }

    #[test]
    fn quants_bump_namespace_and_all_pages() {
        let reg = registry();
        let mut state = ProcessorState::default();
        let mut inc = Increments::new(&reg);
        inc.add_metric(0, 3000.0);
        state.add_quants(&reg, "Orders#show", &inc);
        assert!(state.quants.contains_key("t-3100-Orders#show"));
        assert!(state.quants.contains_key("t-3100-all_pages"));
    }
}
