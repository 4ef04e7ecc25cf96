//! Metric domains for the fan-out engine, registered the way `ServerMetrics`
//! groups counters by subsystem: a handful of named counters and gauges
//! rather than one undifferentiated firehose.

#[derive(Debug, Default)]
pub struct EngineMetrics;

impl EngineMetrics {
    pub fn record_push(&self, database_id: &str, records: usize) {
        metrics::counter!(
            "txfanout_records_pushed_total",
            records as u64,
            "database_id" => database_id.to_string(),
        );
    }

    pub fn record_rollback(&self, database_id: &str, records: usize) {
        metrics::counter!(
            "txfanout_rollback_records_total",
            records as u64,
            "database_id" => database_id.to_string(),
        );
    }

    pub fn record_rate_limited(&self, kind: &'static str) {
        metrics::counter!("txfanout_rate_limited_total", 1, "kind" => kind);
    }

    pub fn record_bundle_trigger(&self, database_id: &str) {
        metrics::counter!(
            "txfanout_bundle_triggers_total",
            1,
            "database_id" => database_id.to_string(),
        );
    }

    pub fn set_open_connections(&self, count: u64) {
        metrics::gauge!("txfanout_open_connections", count as f64);
    }
}
