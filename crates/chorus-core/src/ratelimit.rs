//! Per-identity, per-action sliding window rate limiting.
//!
//! Only accepted actions are recorded, so a burst of denied attempts does not
//! extend the window. Logs are kept in memory and are lost on restart.

use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Rate-limited action types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    SendMessage,
    UploadFile,
    JoinRoom,
    CreateRoom,
}

impl Action {
    pub const ALL: [Action; 4] = [
        Action::SendMessage,
        Action::UploadFile,
        Action::JoinRoom,
        Action::CreateRoom,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Action::SendMessage => "sendMessage",
            Action::UploadFile => "uploadFile",
            Action::JoinRoom => "joinRoom",
            Action::CreateRoom => "createRoom",
        }
    }

    /// Parse the configuration name of an action.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Action::ALL.into_iter().find(|a| a.as_str() == name)
    }

    /// Default policy for this action.
    #[must_use]
    pub const fn default_policy(self) -> RateLimitPolicy {
        let limit = match self {
            Action::SendMessage => 30,
            Action::UploadFile => 5,
            Action::JoinRoom => 10,
            Action::CreateRoom => 2,
        };
        RateLimitPolicy {
            limit,
            window: Duration::from_secs(60),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// At most `limit` actions within any trailing `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub limit: usize,
    pub window: Duration,
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Denied; the oldest recorded action leaves the window after `retry_after`.
    Denied { retry_after: Duration },
}

impl RateDecision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

/// A rate limiter keyed by identity and action.
pub trait RateLimiter: Send + Sync {
    /// Check and, if allowed, record an action for `key`.
    fn check(&self, key: &str, action: Action) -> RateDecision;

    /// Drop state that no longer affects any decision.
    ///
    /// Returns the number of keys removed.
    fn sweep(&self) -> usize {
        0
    }
}

/// Sliding window limiter backed by a timestamp log per key.
pub struct SlidingWindowLimiter {
    policies: HashMap<Action, RateLimitPolicy>,
    logs: DashMap<(String, Action), VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    /// Create a limiter with the default policy table.
    #[must_use]
    pub fn new() -> Self {
        Self::with_policies(HashMap::new())
    }

    /// Create a limiter, overriding defaults with the given policies.
    #[must_use]
    pub fn with_policies(overrides: HashMap<Action, RateLimitPolicy>) -> Self {
        let mut policies: HashMap<Action, RateLimitPolicy> = Action::ALL
            .into_iter()
            .map(|a| (a, a.default_policy()))
            .collect();
        policies.extend(overrides);
        Self {
            policies,
            logs: DashMap::new(),
        }
    }

    /// The policy applied to an action.
    #[must_use]
    pub fn policy(&self, action: Action) -> RateLimitPolicy {
        self.policies
            .get(&action)
            .copied()
            .unwrap_or_else(|| action.default_policy())
    }

    /// Check an action at an explicit instant.
    pub fn check_at(&self, key: &str, action: Action, now: Instant) -> RateDecision {
        let policy = self.policy(action);
        let mut log = self.logs.entry((key.to_string(), action)).or_default();

        prune(&mut log, now, policy.window);

        if log.len() >= policy.limit {
            let retry_after = log
                .front()
                .map(|oldest| policy.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(policy.window);
            debug!(key = %key, action = %action, "Rate limit exceeded");
            return RateDecision::Denied { retry_after };
        }

        log.push_back(now);
        trace!(key = %key, action = %action, recent = log.len(), "Action recorded");
        RateDecision::Allowed
    }

    /// Sweep at an explicit instant.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.logs.len();
        self.logs.retain(|(_, action), log| {
            let window = self.policy(*action).window;
            prune(log, now, window);
            !log.is_empty()
        });
        let removed = before.saturating_sub(self.logs.len());
        if removed > 0 {
            debug!(removed, remaining = self.logs.len(), "Swept rate limit state");
        }
        removed
    }

    /// Number of tracked (identity, action) keys.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.logs.len()
    }
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn check(&self, key: &str, action: Action) -> RateDecision {
        self.check_at(key, action, Instant::now())
    }

    fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }
}

fn prune(log: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = log.front() {
        if now.duration_since(*oldest) >= window {
            log.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policies() {
        let limiter = SlidingWindowLimiter::new();
        assert_eq!(limiter.policy(Action::SendMessage).limit, 30);
        assert_eq!(limiter.policy(Action::UploadFile).limit, 5);
        assert_eq!(limiter.policy(Action::JoinRoom).limit, 10);
        assert_eq!(limiter.policy(Action::CreateRoom).limit, 2);
        assert_eq!(limiter.policy(Action::CreateRoom).window, Duration::from_secs(60));
    }

    #[test]
    fn test_limit_plus_one_is_denied_exactly_once() {
        let limiter = SlidingWindowLimiter::new();
        let start = Instant::now();

        let decisions: Vec<_> = (0..11)
            .map(|i| limiter.check_at("u-1", Action::JoinRoom, start + Duration::from_millis(i)))
            .collect();

        let denied = decisions.iter().filter(|d| !d.is_allowed()).count();
        assert_eq!(denied, 1);
        assert!(!decisions[10].is_allowed());

        // After the window elapses the next action succeeds.
        let later = start + Duration::from_secs(60) + Duration::from_millis(10);
        assert!(limiter.check_at("u-1", Action::JoinRoom, later).is_allowed());
    }

    #[test]
    fn test_denied_checks_are_not_recorded() {
        let mut overrides = HashMap::new();
        overrides.insert(
            Action::SendMessage,
            RateLimitPolicy {
                limit: 1,
                window: Duration::from_secs(10),
            },
        );
        let limiter = SlidingWindowLimiter::with_policies(overrides);
        let start = Instant::now();

        assert!(limiter.check_at("u", Action::SendMessage, start).is_allowed());
        for i in 1..5 {
            assert!(!limiter
                .check_at("u", Action::SendMessage, start + Duration::from_secs(i))
                .is_allowed());
        }
        // Only the first action counts, so the window ends 10s after it.
        assert!(limiter
            .check_at("u", Action::SendMessage, start + Duration::from_secs(10))
            .is_allowed());
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = SlidingWindowLimiter::new();
        let now = Instant::now();

        assert!(limiter.check_at("a", Action::CreateRoom, now).is_allowed());
        assert!(limiter.check_at("a", Action::CreateRoom, now).is_allowed());
        assert!(!limiter.check_at("a", Action::CreateRoom, now).is_allowed());
        assert!(limiter.check_at("b", Action::CreateRoom, now).is_allowed());
        assert!(limiter.check_at("a", Action::SendMessage, now).is_allowed());
    }

    #[test]
    fn test_retry_after() {
        let limiter = SlidingWindowLimiter::new();
        let start = Instant::now();
        limiter.check_at("u", Action::CreateRoom, start);
        limiter.check_at("u", Action::CreateRoom, start);

        match limiter.check_at("u", Action::CreateRoom, start + Duration::from_secs(20)) {
            RateDecision::Denied { retry_after } => assert_eq!(retry_after, Duration::from_secs(40)),
            RateDecision::Allowed => panic!("expected denial"),
        }
    }

    #[test]
    fn test_sweep_drops_idle_keys() {
        let limiter = SlidingWindowLimiter::new();
        let start = Instant::now();
        limiter.check_at("a", Action::SendMessage, start);
        limiter.check_at("b", Action::SendMessage, start + Duration::from_secs(30));
        assert_eq!(limiter.tracked_keys(), 2);

        assert_eq!(limiter.sweep_at(start + Duration::from_secs(61)), 1);
        assert_eq!(limiter.tracked_keys(), 1);
    }
}
