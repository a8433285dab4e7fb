//! 重投递策略
//!
//! 默认无上限重新入队；`DeadLetter` 在同一消息失败次数达到上限后拒绝且不重新入队，
//! 由队列的 `x-dead-letter-exchange` 转入死信队列。
//!
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RedeliveryPolicy {
    #[default]
    Unbounded,
    DeadLetter { max_attempts: u32 },
}

impl RedeliveryPolicy {
    pub fn uses_dead_letter(&self) -> bool {
        matches!(self, Self::DeadLetter { .. })
    }
}

/// 失败后的处理决定
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Resolution {
    Requeue,
    DeadLetter,
}

/// 按消息标识统计失败次数（仅在本订阅者内存中）
#[derive(Debug, Default)]
pub(crate) struct FailureTracker {
    failures: HashMap<String, u32>,
}

impl FailureTracker {
    /// 消息标识：优先 message_id，否则取载荷摘要
    pub(crate) fn key(message_id: Option<&str>, payload: &[u8]) -> String {
        match message_id {
            Some(id) => id.to_string(),
            None => {
                let mut hasher = DefaultHasher::new();
                payload.hash(&mut hasher);
                format!("payload:{:016x}", hasher.finish())
            }
        }
    }

    pub(crate) fn on_failure(&mut self, policy: RedeliveryPolicy, key: &str) -> Resolution {
        let RedeliveryPolicy::DeadLetter { max_attempts } = policy else {
            return Resolution::Requeue;
        };

        let count = self.failures.entry(key.to_string()).or_default();
        *count += 1;
        if *count >= max_attempts.max(1) {
            self.failures.remove(key);
            Resolution::DeadLetter
        } else {
            Resolution::Requeue
        }
    }

    pub(crate) fn on_success(&mut self, key: &str) {
        self.failures.remove(key);
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> usize {
        self.failures.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_always_requeues() {
        let mut tracker = FailureTracker::default();
        for _ in 0..100 {
            assert_eq!(
                tracker.on_failure(RedeliveryPolicy::Unbounded, "m"),
                Resolution::Requeue
            );
        }
        assert_eq!(tracker.tracked(), 0);
    }

    #[test]
    fn ceiling_dead_letters_on_last_attempt() {
        let policy = RedeliveryPolicy::DeadLetter { max_attempts: 3 };
        let mut tracker = FailureTracker::default();
        assert_eq!(tracker.on_failure(policy, "m"), Resolution::Requeue);
        assert_eq!(tracker.on_failure(policy, "m"), Resolution::Requeue);
        assert_eq!(tracker.on_failure(policy, "m"), Resolution::DeadLetter);
        assert_eq!(tracker.tracked(), 0);
    }

    #[test]
    fn success_resets_count() {
        let policy = RedeliveryPolicy::DeadLetter { max_attempts: 2 };
        let mut tracker = FailureTracker::default();
        tracker.on_failure(policy, "m");
        tracker.on_success("m");
        assert_eq!(tracker.on_failure(policy, "m"), Resolution::Requeue);
    }

    #[test]
    fn key_falls_back_to_payload_digest() {
        let a = FailureTracker::key(None, b"abc");
        assert_eq!(a, FailureTracker::key(None, b"abc"));
        assert_ne!(a, FailureTracker::key(None, b"abd"));
        assert_eq!(FailureTracker::key(Some("id-1"), b"abc"), "id-1");
    }
}
