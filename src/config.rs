//! Engine tunables, laid out the way `RunConfig` flattens into the binary's
//! top-level CLI config: one `clap::Parser` struct, every field overridable
//! by an environment variable for container deployments.

use clap::Parser;

#[derive(Debug, Clone, Parser)]
pub struct EngineConfig {
    /// Requests allowed per connection before the token bucket is exhausted.
    #[clap(
        long = "request-bucket-capacity",
        env = "TXFANOUT_REQUEST_BUCKET_CAPACITY",
        default_value = "25"
    )]
    pub request_bucket_capacity: u32,

    /// Tokens restored to the request bucket per elapsed second.
    #[clap(
        long = "request-bucket-refill",
        env = "TXFANOUT_REQUEST_BUCKET_REFILL",
        default_value = "1"
    )]
    pub request_bucket_refill: u32,

    /// File-storage requests allowed per connection before denial.
    #[clap(
        long = "file-bucket-capacity",
        env = "TXFANOUT_FILE_BUCKET_CAPACITY",
        default_value = "200"
    )]
    pub file_bucket_capacity: u32,

    /// Tokens restored to the file-storage bucket per elapsed second.
    #[clap(
        long = "file-bucket-refill",
        env = "TXFANOUT_FILE_BUCKET_REFILL",
        default_value = "200"
    )]
    pub file_bucket_refill: u32,

    /// Age, in seconds, a detected sequence gap must exceed before it is
    /// treated as permanent and rolled back.
    #[clap(
        long = "gap-threshold-secs",
        env = "TXFANOUT_GAP_THRESHOLD_SECS",
        default_value = "10"
    )]
    pub gap_threshold_secs: i64,

    /// Cumulative transaction-log bytes per database connection before a
    /// fresh snapshot bundle is requested.
    #[clap(
        long = "snapshot-bytes-threshold",
        env = "TXFANOUT_SNAPSHOT_BYTES_THRESHOLD",
        default_value = "51200"
    )]
    pub snapshot_bytes_threshold: u64,

    /// Sliding TTL, in seconds, for the per-user file-ID cache.
    #[clap(
        long = "file-id-ttl-secs",
        env = "TXFANOUT_FILE_ID_TTL_SECS",
        default_value = "60"
    )]
    pub file_id_ttl_secs: u64,

    /// Page size used when paginating the durable transaction log.
    #[clap(
        long = "query-page-size",
        env = "TXFANOUT_QUERY_PAGE_SIZE",
        default_value = "100"
    )]
    pub query_page_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_bucket_capacity: 25,
            request_bucket_refill: 1,
            file_bucket_capacity: 200,
            file_bucket_refill: 200,
            gap_threshold_secs: 10,
            snapshot_bytes_threshold: 51_200,
            file_id_ttl_secs: 60,
            query_page_size: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_tunables() {
        let config = EngineConfig::default();
        assert_eq!(config.gap_threshold_secs, 10);
        assert_eq!(config.snapshot_bytes_threshold, 51_200);
        assert_eq!(config.file_id_ttl_secs, 60);
    }
}
