//! The per-bucket accumulator (`increments_t` in the original source):
//! counts, per-resource sum/sum-of-squares, and a free-form `others` map
//! for category counters (response codes, severities, apdex buckets,
//! exception names, caller info).

use std::collections::HashMap;

use crate::resource_registry::{ResourceId, ResourceRegistry};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Metric {
    pub sum: f64,
    pub sum_of_squares: f64,
}

impl Metric {
    fn add_value(&mut self, value: f64) {
        self.sum += value;
        self.sum_of_squares += value * value;
    }

    fn merge(&mut self, other: &Metric) {
        self.sum += other.sum;
        self.sum_of_squares += other.sum_of_squares;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OtherValue {
    Int(i64),
    Float(f64),
}

impl OtherValue {
    fn merge(self, other: OtherValue) -> OtherValue {
        match (self, other) {
            (OtherValue::Int(a), OtherValue::Int(b)) => OtherValue::Int(a + b),
            (a, b) => OtherValue::Float(a.as_f64() + b.as_f64()),
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            OtherValue::Int(v) => v as f64,
            OtherValue::Float(v) => v,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Increments {
    pub backend_count: i64,
    pub page_count: i64,
    pub ajax_count: i64,
    pub metrics: Vec<Metric>,
    pub others: HashMap<String, OtherValue>,
}

impl Increments {
    pub fn new(registry: &ResourceRegistry) -> Self {
        Self {
            backend_count: 0,
            page_count: 0,
            ajax_count: 0,
            metrics: vec![Metric::default(); registry.len()],
            others: HashMap::new(),
        }
    }

    pub fn add_metric(&mut self, id: ResourceId, value: f64) {
        // Invariant: negative sums are never stored.
        if value < 0.0 {
            return;
        }
        self.metrics[id].add_value(value);
    }

    pub fn incr_other(&mut self, key: impl Into<String>, by: i64) {
        self.others
            .entry(key.into())
            .and_modify(|v| *v = (*v).merge(OtherValue::Int(by)))
            .or_insert(OtherValue::Int(by));
    }

    pub fn merge(&mut self, other: &Increments) {
        self.backend_count += other.backend_count;
        self.page_count += other.page_count;
        self.ajax_count += other.ajax_count;
        if self.metrics.len() < other.metrics.len() {
            self.metrics.resize(other.metrics.len(), Metric::default());
        }
        for (i, m) in other.metrics.iter().enumerate() {
            self.metrics[i].merge(m);
        }
        for (k, v) in &other.others {
            self.others
                .entry(k.clone())
                .and_modify(|existing| *existing = (*existing).merge(*v))
                .or_insert(*v);
        }
    }

    /// Non-zero metric sums only, keyed by resource name, for live-stream
    /// publication (spec.md section 4.3 step 3).
    pub fn non_zero_metric_sums<'a>(
        &'a self,
        registry: &'a ResourceRegistry,
    ) -> impl Iterator<Item = (&'a str, f64)> + 'a {
        self.metrics
            .iter()
            .enumerate()
            .filter(|(_, m)| m.sum != 0.0)
            .map(move |(id, m)| (registry.name_of(id), m.sum))
    }
}

pub fn response_code_key(code: i32) -> String {
    format!("response.{code}")
}

pub fn severity_key(severity: i32) -> String {
    format!("severity.{severity}")
}

/// Apdex bucketing per spec.md section 4.2.j: frustrated if
/// `total_time>=2000` or `response_code>=500`; happy+satisfied if `<100`;
/// satisfied if `<500`; tolerating if `<2000`.
pub fn fill_apdex(increments: &mut Increments, total_time: f64, response_code: i32) {
    if total_time >= 2000.0 || response_code >= 500 {
        increments.incr_other("apdex.frustrated", 1);
    } else if total_time < 100.0 {
        increments.incr_other("apdex.happy", 1);
        increments.incr_other("apdex.satisfied", 1);
    } else if total_time < 500.0 {
        increments.incr_other("apdex.satisfied", 1);
    } else if total_time < 2000.0 {
        increments.incr_other("apdex.tolerating", 1);
    }
}

/// Frontend apdex variant (fapdex), reserved per spec.md section 4.2
/// frontend/ajax notes: computed but never aggregated while those paths
/// stay dispatch-only.
pub fn fill_frontend_apdex(increments: &mut Increments, total_time: f64) {
    if total_time < 100.0 {
        increments.incr_other("fapdex.happy", 1);
        increments.incr_other("fapdex.satisfied", 1);
    } else if total_time < 500.0 {
        increments.incr_other("fapdex.satisfied", 1);
    } else if total_time < 2000.0 {
        increments.incr_other("fapdex.tolerating", 1);
    } else {
        increments.incr_other("fapdex.frustrated", 1);
    }
}

/// Rewrites `.` and `$` to `_` so a value is safe to embed in an `others`
/// key that will reach `$inc` unescaped (`copy_replace_dots_and_dollars` in
/// the original source).
fn replace_dots_and_dollars(s: &str) -> String {
    s.chars().map(|c| if c == '.' || c == '$' { '_' } else { c }).collect()
}

/// Rewrites `.` and `$` to `_` in an exception class name, then returns the
/// `exceptions.<name>` key (spec.md section 4.2.j).
pub fn exception_key(class_name: &str) -> String {
    format!("exceptions.{}", replace_dots_and_dollars(class_name))
}

pub fn caller_key(caller_app: &str, caller_action: &str) -> String {
    format!(
        "callers.{}-{}",
        replace_dots_and_dollars(caller_app),
        replace_dots_and_dollars(caller_action)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_registry::{ResourceFamily, ResourceRegistry};

    fn registry() -> ResourceRegistry {
        ResourceRegistry::builder()
            .add_family(ResourceFamily::Time, &["total_time".into()])
            .unwrap()
            .build()
    }

    #[test]
    fn negative_sums_never_stored() {
        let reg = registry();
        let mut inc = Increments::new(&reg);
        inc.add_metric(0, -5.0);
        assert_eq!(inc.metrics[0].sum, 0.0);
    }

    #[test]
    fn merge_combines_counts_and_metrics() {
        let reg = registry();
        let mut a = Increments::new(&reg);
        a.backend_count = 1;
        a.add_metric(0, 100.0);
        a.incr_other("response.200", 1);

        let mut b = Increments::new(&reg);
        b.backend_count = 2;
        b.add_metric(0, 50.0);
        b.incr_other("response.200", 1);

        a.merge(&b);
        assert_eq!(a.backend_count, 3);
        assert_eq!(a.metrics[0].sum, 150.0);
        assert_eq!(a.metrics[0].sum_of_squares, 100.0 * 100.0 + 50.0 * 50.0);
        assert_eq!(a.others.get("response.200"), Some(&OtherValue::Int(2)));
    }

    #[test]
    fn apdex_binning_matches_scenarios() {
        let reg = registry();

        let mut happy = Increments::new(&reg);
        fill_apdex(&mut happy, 50.0, 200);
        assert_eq!(happy.others.get("apdex.happy"), Some(&OtherValue::Int(1)));
        assert_eq!(
            happy.others.get("apdex.satisfied"),
            Some(&OtherValue::Int(1))
        );

        let mut tolerating = Increments::new(&reg);
        fill_apdex(&mut tolerating, 1800.0, 200);
        assert_eq!(
            tolerating.others.get("apdex.tolerating"),
            Some(&OtherValue::Int(1))
        );

        let mut frustrated = Increments::new(&reg);
        fill_apdex(&mut frustrated, 2500.0, 200);
        assert_eq!(
            frustrated.others.get("apdex.frustrated"),
            Some(&OtherValue::Int(1))
        );
    }

    #[test]
    fn exception_key_replaces_dots_and_dollars() {
        assert_eq!(
            exception_key("Foo.Bar$Baz"),
            "exceptions.Foo_Bar_Baz".to_string()
        );
    }
}
