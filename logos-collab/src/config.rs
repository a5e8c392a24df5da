//! Engine configuration.
//!
//! Every component takes its own small config struct so it can be built in
//! isolation; [`CollabConfig`] bundles them for the session coordinator.

use std::time::Duration;

/// Presence registry settings.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// A session without a heartbeat for this long is dead. Default: 5 minutes.
    pub session_ttl: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(5 * 60),
        }
    }
}

/// Layer lock settings.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Leaked locks from crashed sessions expire after this. Default: 10 minutes.
    pub lock_ttl: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(10 * 60),
        }
    }
}

/// Update log retention.
#[derive(Debug, Clone)]
pub struct UpdateLogConfig {
    /// Maximum retained events per document. Default: 100.
    pub max_events: usize,
    /// Events older than this are trimmed. Default: 1 hour.
    pub event_ttl: Duration,
}

impl Default for UpdateLogConfig {
    fn default() -> Self {
        Self {
            max_events: 100,
            event_ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// Auto-save debounce settings.
#[derive(Debug, Clone)]
pub struct AutoSaveConfig {
    /// Quiet period after the last edit before saving. Default: 30s.
    pub debounce: Duration,
    /// Upper bound for flushing pending saves on shutdown. Default: 10s.
    pub shutdown_deadline: Duration,
}

impl Default for AutoSaveConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(30),
            shutdown_deadline: Duration::from_secs(10),
        }
    }
}

/// Version controller settings.
#[derive(Debug, Clone)]
pub struct VersionConfig {
    /// Attempts at claiming the next version number before reporting contention.
    pub max_assign_attempts: u32,
    /// Page size for version listings when the caller gives none.
    pub default_list_limit: usize,
}

impl Default for VersionConfig {
    fn default() -> Self {
        Self {
            max_assign_attempts: 8,
            default_list_limit: 50,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    pub presence: PresenceConfig,
    pub locks: LockConfig,
    pub update_log: UpdateLogConfig,
    pub auto_save: AutoSaveConfig,
    pub versions: VersionConfig,
    /// Interval of the background sweep for expired sessions and locks.
    pub sweep_interval: Duration,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            presence: PresenceConfig::default(),
            locks: LockConfig::default(),
            update_log: UpdateLogConfig::default(),
            auto_save: AutoSaveConfig::default(),
            versions: VersionConfig::default(),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl CollabConfig {
    /// Config for testing (short timers, small windows).
    pub fn for_testing() -> Self {
        Self {
            presence: PresenceConfig {
                session_ttl: Duration::from_secs(5),
            },
            locks: LockConfig {
                lock_ttl: Duration::from_secs(10),
            },
            update_log: UpdateLogConfig {
                max_events: 10,
                event_ttl: Duration::from_secs(60),
            },
            auto_save: AutoSaveConfig {
                debounce: Duration::from_millis(200),
                shutdown_deadline: Duration::from_secs(1),
            },
            versions: VersionConfig::default(),
            sweep_interval: Duration::from_millis(100),
        }
    }
}
