//! Layered, validated startup configuration for a [`crate::channel::Channel`].
//!
//! `ChannelConfig` is built once via [`ChannelConfigBuilder`] and shared
//! (read-only, behind an `Arc`) by every component that needs it. Validation
//! happens at `build()` time so misconfiguration fails fast rather than
//! surfacing as a confusing runtime fault on the first call.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{RelayError, RetCode, Result};

/// Which concurrency mode the dispatcher should use to process inbound
/// messages. Only the two modes in scope for this core are representable;
/// `DataflowX1`/`DataflowX2` from the design notes are explicitly reserved
/// and have no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherMode {
    /// Inbound messages are processed inline on the Rx task.
    NoQueue,
    /// One worker task drains a bounded queue, preserving arrival order.
    PagedQueueX1,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub rx_segment_size: usize,
    pub tx_segment_size: usize,
    pub login_timeout: Duration,
    pub logout_timeout: Duration,
    pub tx_pipeline_grace_period: Duration,
    pub stream_page_size: usize,
    pub stream_window: usize,
    pub dispatcher_mode: DispatcherMode,
    pub dispatcher_queue_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfigBuilder::new()
            .build()
            .expect("default configuration is always valid")
    }
}

impl ChannelConfig {
    pub fn builder() -> ChannelConfigBuilder {
        ChannelConfigBuilder::new()
    }
}

/// Builder for [`ChannelConfig`]. Every setter is infallible; `build()` is
/// where constraints between fields (and basic non-zero checks) are
/// enforced, returning `InvalidChannelState` on violation.
#[derive(Debug, Clone)]
pub struct ChannelConfigBuilder {
    rx_segment_size: usize,
    tx_segment_size: usize,
    login_timeout: Duration,
    logout_timeout: Duration,
    tx_pipeline_grace_period: Duration,
    stream_page_size: usize,
    stream_window: usize,
    dispatcher_mode: DispatcherMode,
    dispatcher_queue_capacity: usize,
}

const DEFAULT_SEGMENT_SIZE: usize = 64 * 1024;
const DEFAULT_PAGE_SIZE: usize = 200;
const DEFAULT_WINDOW: usize = 2;
const DEFAULT_QUEUE_CAPACITY: usize = 256;

impl ChannelConfigBuilder {
    pub fn new() -> Self {
        Self {
            rx_segment_size: DEFAULT_SEGMENT_SIZE,
            tx_segment_size: DEFAULT_SEGMENT_SIZE,
            login_timeout: Duration::from_secs(10),
            logout_timeout: Duration::from_secs(10),
            tx_pipeline_grace_period: Duration::from_secs(5),
            stream_page_size: DEFAULT_PAGE_SIZE,
            stream_window: DEFAULT_WINDOW,
            dispatcher_mode: DispatcherMode::PagedQueueX1,
            dispatcher_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn rx_segment_size(mut self, size: usize) -> Self {
        self.rx_segment_size = size;
        self
    }

    pub fn tx_segment_size(mut self, size: usize) -> Self {
        self.tx_segment_size = size;
        self
    }

    pub fn login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }

    pub fn logout_timeout(mut self, timeout: Duration) -> Self {
        self.logout_timeout = timeout;
        self
    }

    pub fn tx_pipeline_grace_period(mut self, grace: Duration) -> Self {
        self.tx_pipeline_grace_period = grace;
        self
    }

    pub fn stream_page_size(mut self, size: usize) -> Self {
        self.stream_page_size = size;
        self
    }

    pub fn stream_window(mut self, window: usize) -> Self {
        self.stream_window = window;
        self
    }

    pub fn dispatcher_mode(mut self, mode: DispatcherMode) -> Self {
        self.dispatcher_mode = mode;
        self
    }

    pub fn dispatcher_queue_capacity(mut self, capacity: usize) -> Self {
        self.dispatcher_queue_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<ChannelConfig> {
        if self.rx_segment_size == 0 || self.tx_segment_size == 0 {
            return Err(RelayError::new(
                RetCode::InvalidChannelState,
                "segment size must be non-zero",
            ));
        }
        if self.stream_page_size == 0 {
            return Err(RelayError::new(
                RetCode::InvalidChannelState,
                "stream page size must be non-zero",
            ));
        }
        if self.stream_window == 0 {
            return Err(RelayError::new(
                RetCode::InvalidChannelState,
                "stream window must be at least 1",
            ));
        }
        if self.dispatcher_mode == DispatcherMode::PagedQueueX1 && self.dispatcher_queue_capacity == 0
        {
            return Err(RelayError::new(
                RetCode::InvalidChannelState,
                "paged dispatcher queue capacity must be non-zero",
            ));
        }
        Ok(ChannelConfig {
            rx_segment_size: self.rx_segment_size,
            tx_segment_size: self.tx_segment_size,
            login_timeout: self.login_timeout,
            logout_timeout: self.logout_timeout,
            tx_pipeline_grace_period: self.tx_pipeline_grace_period,
            stream_page_size: self.stream_page_size,
            stream_window: self.stream_window,
            dispatcher_mode: self.dispatcher_mode,
            dispatcher_queue_capacity: self.dispatcher_queue_capacity,
        })
    }

    pub fn build_shared(self) -> Result<Arc<ChannelConfig>> {
        self.build().map(Arc::new)
    }
}

impl Default for ChannelConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_budget() {
        let cfg = ChannelConfig::default();
        assert_eq!(cfg.rx_segment_size, 64 * 1024);
        assert_eq!(cfg.stream_page_size, 200);
        assert_eq!(cfg.stream_window, 2);
    }

    #[test]
    fn zero_segment_size_is_rejected() {
        let err = ChannelConfigBuilder::new()
            .tx_segment_size(0)
            .build()
            .unwrap_err();
        assert_eq!(err.code(), RetCode::InvalidChannelState);
    }

    #[test]
    fn zero_window_is_rejected() {
        let err = ChannelConfigBuilder::new()
            .stream_window(0)
            .build()
            .unwrap_err();
        assert_eq!(err.code(), RetCode::InvalidChannelState);
    }
}
