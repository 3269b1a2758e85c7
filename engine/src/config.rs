use std::net::IpAddr;

use crate::error::Error;

/// IP family for the listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    /// Plain IPv4 listener.
    V4,
    /// IPv6 listener with `IPV6_V6ONLY` off, accepting both families.
    DualStack,
}

/// Per-reactor configuration.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Number of SQ entries. CQ is sized at 4x this.
    pub sq_entries: u32,
    /// Enable SQPOLL mode (kernel-side submission polling).
    pub sqpoll: bool,
    /// SQPOLL idle timeout in milliseconds.
    pub sqpoll_idle_ms: u32,
    /// Pin the SQPOLL kernel thread to this CPU. Only meaningful with sqpoll.
    pub sqpoll_cpu: Option<u32>,
    /// Size of each receive buffer in bytes.
    pub recv_buffer_size: u32,
    /// Number of buffers in the provided buffer ring (must be a power of two).
    pub buffer_ring_entries: u16,
    /// Maximum CQEs dispatched per loop iteration.
    pub completion_batch: usize,
    /// Maximum concurrent connections per reactor.
    pub max_connections: u32,
    /// Bounded submit-and-wait timeout in nanoseconds.
    pub wait_timeout_ns: u64,
    /// Let the kernel deliver several receives into one buffer at
    /// increasing offsets (kernel 6.12+). Buffers are republished only
    /// once every outstanding reference is returned and the kernel has
    /// issued the terminating completion.
    pub incremental_buffers: bool,
    /// Per-connection write slab capacity in bytes.
    pub write_slab_size: u32,
    /// Capacity of each connection's inbound ring (must be a power of two).
    pub inbound_ring_entries: u32,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            sq_entries: 256,
            sqpoll: false,
            sqpoll_idle_ms: 1000,
            sqpoll_cpu: None,
            recv_buffer_size: 16384,
            buffer_ring_entries: 256,
            completion_batch: 4096,
            max_connections: 16384,
            wait_timeout_ns: 500_000,
            incremental_buffers: false,
            write_slab_size: 16384,
            inbound_ring_entries: 1024,
        }
    }
}

impl ReactorConfig {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if !self.buffer_ring_entries.is_power_of_two() {
            return Err(Error::Config(
                "buffer_ring_entries must be a power of two".into(),
            ));
        }
        if !self.inbound_ring_entries.is_power_of_two() {
            return Err(Error::Config(
                "inbound_ring_entries must be a power of two".into(),
            ));
        }
        if self.sq_entries == 0 || !self.sq_entries.is_power_of_two() {
            return Err(Error::Config("sq_entries must be a power of two".into()));
        }
        if self.recv_buffer_size == 0 {
            return Err(Error::Config("recv_buffer_size must be non-zero".into()));
        }
        if self.completion_batch == 0 {
            return Err(Error::Config("completion_batch must be non-zero".into()));
        }
        if self.write_slab_size == 0 {
            return Err(Error::Config("write_slab_size must be non-zero".into()));
        }
        Ok(())
    }
}

/// Acceptor configuration.
#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    /// Number of SQ entries for the acceptor ring.
    pub sq_entries: u32,
    /// Enable SQPOLL mode for the acceptor ring.
    pub sqpoll: bool,
    /// SQPOLL idle timeout in milliseconds.
    pub sqpoll_idle_ms: u32,
    /// Pin the SQPOLL kernel thread to this CPU.
    pub sqpoll_cpu: Option<u32>,
    /// Maximum accept completions handled per iteration.
    pub accept_batch: usize,
    /// Bounded wait timeout in nanoseconds. Accept bursts are infrequent,
    /// so this defaults much longer than the reactor timeout.
    pub wait_timeout_ns: u64,
    /// IP family selector for the listener.
    pub family: IpFamily,
    /// Set TCP_NODELAY on accepted descriptors.
    pub tcp_nodelay: bool,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            sq_entries: 64,
            sqpoll: false,
            sqpoll_idle_ms: 1000,
            sqpoll_cpu: None,
            accept_batch: 256,
            wait_timeout_ns: 100_000_000,
            family: IpFamily::V4,
            tcp_nodelay: true,
        }
    }
}

impl AcceptorConfig {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.sq_entries == 0 || !self.sq_entries.is_power_of_two() {
            return Err(Error::Config("sq_entries must be a power of two".into()));
        }
        if self.accept_batch == 0 {
            return Err(Error::Config("accept_batch must be non-zero".into()));
        }
        Ok(())
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bind address.
    pub addr: IpAddr,
    /// Bind port. 0 picks an ephemeral port, reported by `local_addr()`.
    pub port: u16,
    /// TCP listen backlog.
    pub backlog: i32,
    /// Number of reactor threads.
    pub reactors: usize,
    /// Acceptor configuration.
    pub acceptor: AcceptorConfig,
    /// Per-reactor configurations. Entry `i` configures reactor `i`; if
    /// fewer entries than `reactors` are given, the last entry (or the
    /// default) is replicated.
    pub reactor: Vec<ReactorConfig>,
    /// Pin reactor threads to consecutive CPU cores.
    pub pin_to_core: bool,
    /// First core index used when pinning.
    pub core_offset: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            addr: IpAddr::from([127, 0, 0, 1]),
            port: 0,
            backlog: 1024,
            reactors: 1,
            acceptor: AcceptorConfig::default(),
            reactor: vec![ReactorConfig::default()],
            pin_to_core: false,
            core_offset: 0,
        }
    }
}

impl EngineConfig {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.reactors == 0 {
            return Err(Error::Config("at least one reactor is required".into()));
        }
        if self.backlog <= 0 {
            return Err(Error::Config("backlog must be positive".into()));
        }
        if self.acceptor.family == IpFamily::V4 && !self.addr.is_ipv4() {
            return Err(Error::Config("V4 family requires an IPv4 bind address".into()));
        }
        if self.acceptor.family == IpFamily::DualStack && !self.addr.is_ipv6() {
            return Err(Error::Config(
                "DualStack family requires an IPv6 bind address".into(),
            ));
        }
        self.acceptor.validate()?;
        for rc in &self.reactor {
            rc.validate()?;
        }
        Ok(())
    }

    /// Resolve the configuration for reactor `i`.
    pub(crate) fn reactor_config(&self, i: usize) -> ReactorConfig {
        match self.reactor.get(i) {
            Some(rc) => rc.clone(),
            None => self
                .reactor
                .last()
                .cloned()
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_ring() {
        let mut config = EngineConfig::default();
        config.reactor[0].buffer_ring_entries = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_family_address_mismatch() {
        let mut config = EngineConfig::default();
        config.acceptor.family = IpFamily::DualStack;
        assert!(config.validate().is_err());
    }

    #[test]
    fn replicates_last_reactor_config() {
        let mut config = EngineConfig::default();
        config.reactors = 4;
        config.reactor[0].recv_buffer_size = 4096;
        assert_eq!(config.reactor_config(3).recv_buffer_size, 4096);
    }
}
