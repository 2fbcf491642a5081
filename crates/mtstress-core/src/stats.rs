//! Per-context connection and session-cache statistics.

use std::fmt;

use crate::session::Role;

/// Counters a session context keeps across all of its sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    /// Session handles allocated
    pub sessions: u64,
    /// Client connections started
    pub connects: u64,
    /// Client connections whose handshake finished
    pub connects_good: u64,
    /// Server connections started
    pub accepts: u64,
    /// Server connections whose handshake finished
    pub accepts_good: u64,
    /// Offered sessions found in the cache
    pub cache_hits: u64,
    /// Offered sessions missing from the cache
    pub cache_misses: u64,
    /// Sessions currently held in the cache
    pub cache_items: u64,
}

impl ContextStats {
    /// Count a connection started in `role`.
    pub fn record_start(&mut self, role: Role) {
        match role {
            Role::Client => self.connects += 1,
            Role::Server => self.accepts += 1,
        }
    }

    /// Count a handshake finished in `role`.
    pub fn record_finished(&mut self, role: Role) {
        match role {
            Role::Client => self.connects_good += 1,
            Role::Server => self.accepts_good += 1,
        }
    }
}

impl fmt::Display for ContextStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>6} items in the session cache", self.cache_items)?;
        writeln!(f, "{:>6} client connects", self.connects)?;
        writeln!(f, "{:>6} client connects that finished", self.connects_good)?;
        writeln!(f, "{:>6} server accepts", self.accepts)?;
        writeln!(f, "{:>6} server accepts that finished", self.accepts_good)?;
        writeln!(f, "{:>6} session cache hits", self.cache_hits)?;
        write!(f, "{:>6} session cache misses", self.cache_misses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_count_separately() {
        let mut stats = ContextStats::default();
        stats.record_start(Role::Client);
        stats.record_start(Role::Server);
        stats.record_start(Role::Server);
        stats.record_finished(Role::Server);

        assert_eq!(stats.connects, 1);
        assert_eq!(stats.accepts, 2);
        assert_eq!(stats.accepts_good, 1);
        assert_eq!(stats.connects_good, 0);
    }

    #[test]
    fn display_lists_every_counter() {
        let stats = ContextStats { cache_hits: 3, ..Default::default() };
        let text = stats.to_string();
        assert_eq!(text.lines().count(), 7);
        assert!(text.contains("     3 session cache hits"));
    }
}
