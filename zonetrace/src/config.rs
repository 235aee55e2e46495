//! Profiler configuration
//!
//! A plain struct with defaults. [`Config::from_env`] layers `ZONETRACE_*`
//! environment overrides on top so deployed binaries can be reconfigured
//! without a rebuild.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use log::warn;
use zonetrace_common::DEFAULT_PORT;

use crate::frame::DEFAULT_FRAME_TARGET;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// TCP port collectors connect to; 0 picks a free one
    pub port: u16,
    pub broadcast_port: u16,
    /// Announce ourselves over UDP while waiting for a collector
    pub broadcast: bool,
    pub broadcast_interval: Duration,
    /// Bind 127.0.0.1 instead of every interface
    pub only_localhost: bool,
    /// At shutdown, wait for a collector to take the remaining data
    pub no_exit: bool,
    /// Skip the startup check that the clock never goes backwards
    pub no_invariant_check: bool,
    /// Only record while a collector is attached
    pub on_demand: bool,
    /// Let collectors fetch source files referenced by source locations
    pub code_transfer: bool,
    /// Uncompressed bytes per frame before it is sent
    pub frame_target_size: usize,
    /// Items drained from the thread queue per worker iteration
    pub batch_limit: usize,
    /// Queries answered per worker iteration
    pub query_quota: usize,
    /// Worker nap when there is nothing to do
    pub idle_sleep: Duration,
    pub keep_alive_interval: Duration,
    /// How long shutdown waits for the collector to acknowledge the end
    pub shutdown_timeout: Duration,
    /// Queue blocks reserved up front
    pub initial_blocks: usize,
    /// Name reported in the welcome and broadcast; the executable name when unset
    pub program_name: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            broadcast_port: DEFAULT_PORT,
            broadcast: true,
            broadcast_interval: Duration::from_secs(3),
            only_localhost: false,
            no_exit: false,
            no_invariant_check: false,
            on_demand: false,
            code_transfer: true,
            frame_target_size: DEFAULT_FRAME_TARGET,
            batch_limit: 8 * 1024,
            query_quota: 32,
            idle_sleep: Duration::from_millis(10),
            keep_alive_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
            initial_blocks: 16,
            program_name: None,
        }
    }
}

impl Config {
    /// Defaults with `ZONETRACE_*` overrides from the process environment
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Apply overrides from `lookup`; malformed values are logged and skipped
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = parse_var(&lookup, "ZONETRACE_PORT") {
            self.port = port;
        }
        if let Some(port) = parse_var(&lookup, "ZONETRACE_BROADCAST_PORT") {
            self.broadcast_port = port;
        }
        if flag_var(&lookup, "ZONETRACE_NO_BROADCAST") {
            self.broadcast = false;
        }
        if flag_var(&lookup, "ZONETRACE_ONLY_LOCALHOST") {
            self.only_localhost = true;
        }
        if flag_var(&lookup, "ZONETRACE_NO_EXIT") {
            self.no_exit = true;
        }
        if flag_var(&lookup, "ZONETRACE_NO_INVARIANT_CHECK") {
            self.no_invariant_check = true;
        }
        if flag_var(&lookup, "ZONETRACE_ON_DEMAND") {
            self.on_demand = true;
        }
    }

    /// Address the listener binds to
    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        let ip = if self.only_localhost { Ipv4Addr::LOCALHOST } else { Ipv4Addr::UNSPECIFIED };
        SocketAddr::new(IpAddr::V4(ip), self.port)
    }

    /// Settings for tests and tools: localhost, a free port, no broadcast
    #[must_use]
    pub fn local_ephemeral() -> Self {
        Self { port: 0, broadcast: false, only_localhost: true, ..Self::default() }
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {key}={raw:?}: not a valid value");
            None
        }
    }
}

/// Set-ness flag: any value except "0"/"false"/"" turns it on
fn flag_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    lookup(key).is_some_and(|v| !matches!(v.trim(), "" | "0" | "false"))
}
