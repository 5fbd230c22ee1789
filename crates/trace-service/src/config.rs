//! Session configuration. Plain `Default`-deriving structs — no
//! text-format config parsing, matching the original's protobuf-config
//! surface but without the text/file front-end, which is out of scope.

use std::time::Duration;

pub const MIN_PAGE_SIZE: u32 = 4 * 1024;
pub const MAX_PAGE_SIZE: u32 = 64 * 1024;
pub const DEFAULT_PAGE_SIZE: u32 = 4 * 1024;
pub const DEFAULT_SHM_SIZE_KB: u32 = 256;
pub const DEFAULT_DATA_SOURCE_STOP_TIMEOUT_MS: u32 = 5_000;
pub const MAX_TRACE_DURATION_MS: u32 = 7 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillPolicy {
    RingBuffer,
    Discard,
}

impl Default for FillPolicy {
    fn default() -> Self {
        Self::RingBuffer
    }
}

#[derive(Debug, Clone, Default)]
pub struct BufferConfig {
    pub size_kb: u32,
    pub fill_policy: FillPolicy,
    pub transfer_on_clone: bool,
    pub clear_before_clone: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DataSourceConfig {
    pub name: String,
    pub target_buffer: u32,
    pub producer_name_filter: Vec<String>,
    pub producer_name_regex_filter: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProducerConfig {
    pub producer_name: String,
    pub shm_size_kb: u32,
    pub page_size_kb: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    StartTracing,
    StopTracing,
    CloneSnapshot,
    HighPriority,
}

#[derive(Debug, Clone)]
pub struct TriggerRule {
    pub name: String,
    pub stop_delay_ms: u32,
    pub max_per_24_h: u32,
    pub skip_probability: f64,
    pub producer_name_regex: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TriggerConfig {
    pub trigger_mode: Option<TriggerMode>,
    pub trigger_timeout_ms: u32,
    pub triggers: Vec<TriggerRule>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IncrementalStateConfig {
    pub clear_period_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockdownMode {
    Clear,
    Set,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None,
    Deflate,
}

impl Default for CompressionType {
    fn default() -> Self {
        Self::None
    }
}

#[derive(Debug, Clone, Default)]
pub struct TraceConfig {
    pub buffers: Vec<BufferConfig>,
    pub data_sources: Vec<DataSourceConfig>,
    pub producers: Vec<ProducerConfig>,
    pub duration_ms: u32,
    pub flush_period_ms: u32,
    pub flush_timeout_ms: u32,
    pub data_source_stop_timeout_ms: u32,
    pub deferred_start: bool,
    pub write_into_file: bool,
    pub output_path: Option<String>,
    pub file_write_period_ms: u32,
    pub max_file_size_bytes: Option<u64>,
    pub trigger_config: TriggerConfig,
    pub incremental_state_config: IncrementalStateConfig,
    pub session_semaphores: Vec<(String, u32)>,
    pub lockdown_mode: Option<LockdownMode>,
    pub unique_session_name: Option<String>,
    pub trace_uuid_lsb: u64,
    pub trace_uuid_msb: u64,
    pub bugreport_score: i32,
    pub bugreport_filename: Option<String>,
    pub compression_type: CompressionType,
    pub smb_scraping_enabled: bool,
    /// Output-side field allowlist and string redaction applied when the
    /// consumer reads buffers back; `None` retains everything unfiltered.
    pub trace_filter: Option<crate::filter::TraceFilter>,
}

impl TraceConfig {
    #[must_use]
    pub fn flush_period(&self) -> Option<Duration> {
        (self.flush_period_ms > 0).then(|| Duration::from_millis(u64::from(self.flush_period_ms)))
    }

    /// Validates the parts that can fail the
    /// whole session atomically before any allocation happens.
    pub fn validate(&self) -> Result<(), crate::error::ServiceError> {
        use crate::error::ServiceError;
        if self.buffers.is_empty() {
            return Err(ServiceError::InvalidConfig("at least one buffer is required".into()));
        }
        if self.buffers.iter().any(|b| b.size_kb == 0) {
            return Err(ServiceError::InvalidConfig("buffer size_kb must be non-zero".into()));
        }
        if self.duration_ms as u64 >= u64::from(MAX_TRACE_DURATION_MS) {
            return Err(ServiceError::DurationTooLong(self.duration_ms));
        }
        Ok(())
    }
}

/// Resolves producer SMB/page size as `config value > producer hint >
/// default`, clamped and snapped to a valid power-of-two-of-4KiB page size;
/// invalid combinations fall back to defaults entirely.
#[must_use]
pub fn resolve_page_size(config_value_kb: u32, producer_hint_kb: u32) -> u32 {
    let candidate = if config_value_kb > 0 {
        config_value_kb * 1024
    } else if producer_hint_kb > 0 {
        producer_hint_kb * 1024
    } else {
        DEFAULT_PAGE_SIZE
    };
    if candidate < MIN_PAGE_SIZE || candidate > MAX_PAGE_SIZE || candidate % MIN_PAGE_SIZE != 0 {
        return DEFAULT_PAGE_SIZE;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_page_size_falls_back_to_default() {
        assert_eq!(resolve_page_size(3, 0), DEFAULT_PAGE_SIZE);
        assert_eq!(resolve_page_size(128, 0), DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn config_value_takes_priority_over_producer_hint() {
        assert_eq!(resolve_page_size(8, 16), 8 * 1024);
    }

    #[test]
    fn producer_hint_used_when_config_absent() {
        assert_eq!(resolve_page_size(0, 16), 16 * 1024);
    }

    #[test]
    fn empty_buffers_fails_validation() {
        let cfg = TraceConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn duration_at_or_above_max_fails_validation() {
        let mut cfg = TraceConfig { buffers: vec![BufferConfig { size_kb: 1024, ..Default::default() }], ..Default::default() };
        cfg.duration_ms = MAX_TRACE_DURATION_MS;
        assert!(matches!(cfg.validate(), Err(crate::error::ServiceError::DurationTooLong(_))));
    }
}
