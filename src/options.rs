//! Per-socket and per-driver option surfaces.
//!
//! These are plain builder-style structs, in the same spirit as this
//! crate's [`EpollOpt`](crate::driver::reactor::Trigger)-like readiness
//! sets: every field defaults to a documented constant and is overridden
//! fluently.

use std::time::Duration;

/// The socket's underlying transport.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Transport {
    TcpIpv4,
    TcpIpv6,
    UdpIpv4,
    UdpIpv6,
    LocalStream,
    LocalDatagram,
}

/// Readiness trigger mode for a reactor registration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// Level-triggered: a poll round reports the event again as long as
    /// the underlying condition still holds.
    Level,
    /// Edge-triggered: a poll round reports the event only once per state
    /// change; the caller must drain until `WouldBlock`.
    Edge,
}

impl Default for Trigger {
    fn default() -> Trigger {
        Trigger::Level
    }
}

/// Queue watermark pair. `low <= high` is enforced by [`new`](Self::new);
/// violating it is a programmer error, not a recoverable condition.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Watermarks {
    low: usize,
    high: usize,
}

impl Watermarks {
    pub fn new(low: usize, high: usize) -> Watermarks {
        assert!(low <= high, "low watermark must not exceed high watermark");
        Watermarks { low, high }
    }

    pub fn low(&self) -> usize {
        self.low
    }

    pub fn high(&self) -> usize {
        self.high
    }
}

impl Default for Watermarks {
    /// 64 KiB high watermark, one quarter of that as low watermark,
    /// matching the default socket buffer sizing order of magnitude.
    fn default() -> Watermarks {
        Watermarks::new(16 * 1024, 64 * 1024)
    }
}

/// Per-socket options (§6 "Options surface").
#[derive(Clone, Debug)]
pub struct SocketOptions {
    transport: Transport,
    source_endpoint: Option<std::net::SocketAddr>,
    reuse_address: bool,
    backlog: u32,
    keep_alive: bool,
    keep_half_open: bool,
    send_buffer_size: Option<usize>,
    receive_buffer_size: Option<usize>,
    read_watermarks: Watermarks,
    write_watermarks: Watermarks,
    accept_watermarks: Watermarks,
    zero_copy_threshold: Option<usize>,
    timestamp_outgoing_data: bool,
    timestamp_incoming_data: bool,
    one_shot: bool,
    trigger: Trigger,
    auto_attach: bool,
    auto_detach: bool,
}

impl SocketOptions {
    pub fn new(transport: Transport) -> SocketOptions {
        SocketOptions {
            transport,
            source_endpoint: None,
            reuse_address: false,
            backlog: 128,
            keep_alive: false,
            keep_half_open: false,
            send_buffer_size: None,
            receive_buffer_size: None,
            read_watermarks: Watermarks::default(),
            write_watermarks: Watermarks::default(),
            accept_watermarks: Watermarks::new(0, 16),
            zero_copy_threshold: None,
            timestamp_outgoing_data: false,
            timestamp_incoming_data: false,
            one_shot: false,
            trigger: Trigger::default(),
            auto_attach: true,
            auto_detach: true,
        }
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn source_endpoint(mut self, addr: std::net::SocketAddr) -> SocketOptions {
        self.source_endpoint = Some(addr);
        self
    }

    pub fn get_source_endpoint(&self) -> Option<std::net::SocketAddr> {
        self.source_endpoint
    }

    pub fn reuse_address(mut self, yes: bool) -> SocketOptions {
        self.reuse_address = yes;
        self
    }

    pub fn is_reuse_address(&self) -> bool {
        self.reuse_address
    }

    pub fn backlog(mut self, n: u32) -> SocketOptions {
        self.backlog = n;
        self
    }

    pub fn get_backlog(&self) -> u32 {
        self.backlog
    }

    pub fn keep_alive(mut self, yes: bool) -> SocketOptions {
        self.keep_alive = yes;
        self
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn keep_half_open(mut self, yes: bool) -> SocketOptions {
        self.keep_half_open = yes;
        self
    }

    pub fn is_keep_half_open(&self) -> bool {
        self.keep_half_open
    }

    pub fn send_buffer_size(mut self, bytes: usize) -> SocketOptions {
        self.send_buffer_size = Some(bytes);
        self
    }

    pub fn get_send_buffer_size(&self) -> Option<usize> {
        self.send_buffer_size
    }

    pub fn receive_buffer_size(mut self, bytes: usize) -> SocketOptions {
        self.receive_buffer_size = Some(bytes);
        self
    }

    pub fn get_receive_buffer_size(&self) -> Option<usize> {
        self.receive_buffer_size
    }

    pub fn read_watermarks(mut self, low: usize, high: usize) -> SocketOptions {
        self.read_watermarks = Watermarks::new(low, high);
        self
    }

    pub fn get_read_watermarks(&self) -> Watermarks {
        self.read_watermarks
    }

    pub fn write_watermarks(mut self, low: usize, high: usize) -> SocketOptions {
        self.write_watermarks = Watermarks::new(low, high);
        self
    }

    pub fn get_write_watermarks(&self) -> Watermarks {
        self.write_watermarks
    }

    pub fn accept_watermarks(mut self, low: usize, high: usize) -> SocketOptions {
        self.accept_watermarks = Watermarks::new(low, high);
        self
    }

    pub fn get_accept_watermarks(&self) -> Watermarks {
        self.accept_watermarks
    }

    pub fn zero_copy_threshold(mut self, bytes: usize) -> SocketOptions {
        self.zero_copy_threshold = Some(bytes);
        self
    }

    pub fn get_zero_copy_threshold(&self) -> Option<usize> {
        self.zero_copy_threshold
    }

    pub fn timestamp_outgoing_data(mut self, yes: bool) -> SocketOptions {
        self.timestamp_outgoing_data = yes;
        self
    }

    pub fn is_timestamp_outgoing_data(&self) -> bool {
        self.timestamp_outgoing_data
    }

    pub fn timestamp_incoming_data(mut self, yes: bool) -> SocketOptions {
        self.timestamp_incoming_data = yes;
        self
    }

    pub fn is_timestamp_incoming_data(&self) -> bool {
        self.timestamp_incoming_data
    }

    pub fn one_shot(mut self, yes: bool) -> SocketOptions {
        self.one_shot = yes;
        self
    }

    pub fn is_one_shot(&self) -> bool {
        self.one_shot
    }

    pub fn trigger(mut self, trigger: Trigger) -> SocketOptions {
        self.trigger = trigger;
        self
    }

    pub fn get_trigger(&self) -> Trigger {
        self.trigger
    }

    pub fn auto_attach(mut self, yes: bool) -> SocketOptions {
        self.auto_attach = yes;
        self
    }

    pub fn is_auto_attach(&self) -> bool {
        self.auto_attach
    }

    pub fn auto_detach(mut self, yes: bool) -> SocketOptions {
        self.auto_detach = yes;
        self
    }

    pub fn is_auto_detach(&self) -> bool {
        self.auto_detach
    }
}

/// Driver-wide configuration shared by [`ReactorConfig`] and
/// [`ProactorConfig`].
#[derive(Clone, Debug)]
pub struct DriverConfig {
    driver_name: String,
    min_threads: usize,
    max_threads: usize,
    dynamic_load_balancing: bool,
}

impl DriverConfig {
    pub fn new(driver_name: impl Into<String>) -> DriverConfig {
        DriverConfig {
            driver_name: driver_name.into(),
            min_threads: 1,
            max_threads: 1,
            dynamic_load_balancing: false,
        }
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    pub fn min_threads(mut self, n: usize) -> DriverConfig {
        self.min_threads = n.max(1);
        self
    }

    pub fn get_min_threads(&self) -> usize {
        self.min_threads
    }

    pub fn max_threads(mut self, n: usize) -> DriverConfig {
        self.max_threads = n.max(self.min_threads);
        self
    }

    pub fn get_max_threads(&self) -> usize {
        self.max_threads
    }

    pub fn dynamic_load_balancing(mut self, yes: bool) -> DriverConfig {
        self.dynamic_load_balancing = yes;
        self
    }

    pub fn is_dynamic_load_balancing(&self) -> bool {
        self.dynamic_load_balancing
    }
}

/// Reactor-specific config: currently just the shared [`DriverConfig`],
/// kept as a distinct type so reactor- and proactor-only knobs can diverge
/// without disturbing callers.
#[derive(Clone, Debug)]
pub struct ReactorConfig(pub DriverConfig);

/// Proactor-specific config.
#[derive(Clone, Debug)]
pub struct ProactorConfig(pub DriverConfig);

/// A connect/receive/send deadline expressed relative to "now".
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Deadline(pub Duration);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "low watermark")]
    fn watermarks_reject_low_above_high() {
        Watermarks::new(10, 5);
    }

    #[test]
    fn socket_options_builder_chains() {
        let opts = SocketOptions::new(Transport::TcpIpv4)
            .reuse_address(true)
            .backlog(256)
            .read_watermarks(4, 8)
            .one_shot(true);

        assert!(opts.is_reuse_address());
        assert_eq!(opts.get_backlog(), 256);
        assert_eq!(opts.get_read_watermarks(), Watermarks::new(4, 8));
        assert!(opts.is_one_shot());
    }

    #[test]
    fn driver_config_clamps_max_to_min() {
        let cfg = DriverConfig::new("test").min_threads(4).max_threads(1);
        assert_eq!(cfg.get_max_threads(), 4);
    }
}
