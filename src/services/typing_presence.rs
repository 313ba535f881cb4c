//! Ephemeral typing signals.
//!
//! Sender side: every keystroke calls `set_typing(.., true)`; a stop signal is produced
//! automatically once `ttl` passes without a keystroke. Receiver side: each signal
//! expires after `ttl` unless refreshed, so a peer that vanishes without a stop
//! signal drops out of the typing set on its own.

use crate::models::TypingSignal;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

pub const DEFAULT_TYPING_TTL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy)]
struct LocalTyping {
    conversation_id: Uuid,
    last_keystroke: Instant,
    last_emitted: Instant,
}

#[derive(Debug)]
pub struct TypingPresence {
    viewer: Uuid,
    ttl: Duration,
    local: Option<LocalTyping>,
    /// (conversation, user) -> expiry
    remote: HashMap<(Uuid, Uuid), Instant>,
}

impl TypingPresence {
    pub fn new(viewer: Uuid, ttl: Duration) -> Self {
        Self {
            viewer,
            ttl,
            local: None,
            remote: HashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record local input. Returns the signal to broadcast, if any.
    ///
    /// While typing continues the start signal is re-sent every half TTL so receivers
    /// keep the indicator alive.
    pub fn set_typing(&mut self, conversation_id: Uuid, is_typing: bool, now: Instant) -> Option<TypingSignal> {
        if !is_typing {
            return match self.local.map(|l| l.conversation_id) {
                Some(current) if current == conversation_id => {
                    self.local = None;
                    Some(self.signal(conversation_id, false))
                }
                _ => None,
            };
        }

        match self.local.as_mut() {
            Some(local) if local.conversation_id == conversation_id => {
                local.last_keystroke = now;
                if now.duration_since(local.last_emitted) >= self.ttl / 2 {
                    local.last_emitted = now;
                    Some(self.signal(conversation_id, true))
                } else {
                    None
                }
            }
            _ => {
                self.local = Some(LocalTyping {
                    conversation_id,
                    last_keystroke: now,
                    last_emitted: now,
                });
                Some(self.signal(conversation_id, true))
            }
        }
    }

    /// Auto-stop after `ttl` without a keystroke
    pub fn poll_local(&mut self, now: Instant) -> Option<TypingSignal> {
        let local = self.local?;
        if now.duration_since(local.last_keystroke) >= self.ttl {
            self.local = None;
            return Some(self.signal(local.conversation_id, false));
        }
        None
    }

    pub fn is_typing_locally(&self) -> bool {
        self.local.is_some()
    }

    /// Apply a peer's signal; the viewer's own echoes are ignored
    pub fn receive(&mut self, signal: TypingSignal, now: Instant) {
        if signal.user_id == self.viewer {
            return;
        }
        let key = (signal.conversation_id, signal.user_id);
        if signal.is_typing {
            self.remote.insert(key, now + self.ttl);
        } else {
            self.remote.remove(&key);
        }
    }

    /// A new message from `user_id` means they stopped typing
    pub fn clear_user(&mut self, conversation_id: Uuid, user_id: Uuid) {
        self.remote.remove(&(conversation_id, user_id));
    }

    /// Users currently typing in `conversation_id`, sorted for stable rendering
    pub fn typing_users(&self, conversation_id: Uuid, now: Instant) -> Vec<Uuid> {
        let mut users: Vec<Uuid> = self
            .remote
            .iter()
            .filter(|((conv, _), expiry)| *conv == conversation_id && **expiry > now)
            .map(|((_, user), _)| *user)
            .collect();
        users.sort();
        users
    }

    /// Drop expired peers. Returns true when the visible set changed.
    pub fn prune(&mut self, now: Instant) -> bool {
        let before = self.remote.len();
        self.remote.retain(|_, expiry| *expiry > now);
        before != self.remote.len()
    }

    /// Earliest instant at which `poll_local` or `prune` has work
    pub fn next_deadline(&self) -> Option<Instant> {
        let local = self.local.map(|l| l.last_keystroke + self.ttl);
        let remote = self.remote.values().min().copied();
        match (local, remote) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Forget everything (conversation switch). Returns a stop signal if we were typing.
    pub fn clear(&mut self) -> Option<TypingSignal> {
        self.remote.clear();
        self.local
            .take()
            .map(|local| self.signal(local.conversation_id, false))
    }

    fn signal(&self, conversation_id: Uuid, is_typing: bool) -> TypingSignal {
        TypingSignal {
            conversation_id,
            user_id: self.viewer,
            is_typing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_keystroke_emits_then_debounces() {
        let me = Uuid::new_v4();
        let conv = Uuid::new_v4();
        let mut typing = TypingPresence::new(me, DEFAULT_TYPING_TTL);
        let t0 = Instant::now();

        let start = typing.set_typing(conv, true, t0).unwrap();
        assert!(start.is_typing);
        assert!(typing.set_typing(conv, true, t0 + Duration::from_millis(200)).is_none());
        // refresh after half the ttl
        assert!(typing.set_typing(conv, true, t0 + Duration::from_millis(1600)).is_some());
    }

    #[test]
    fn test_auto_stop_three_seconds_after_last_keystroke() {
        let me = Uuid::new_v4();
        let conv = Uuid::new_v4();
        let mut typing = TypingPresence::new(me, DEFAULT_TYPING_TTL);
        let t0 = Instant::now();
        typing.set_typing(conv, true, t0);
        typing.set_typing(conv, true, t0 + Duration::from_secs(2));

        assert!(typing.poll_local(t0 + Duration::from_secs(4)).is_none());
        let stop = typing.poll_local(t0 + Duration::from_secs(5)).unwrap();
        assert!(!stop.is_typing);
        assert!(!typing.is_typing_locally());
    }

    #[test]
    fn test_explicit_stop_emits_once() {
        let me = Uuid::new_v4();
        let conv = Uuid::new_v4();
        let mut typing = TypingPresence::new(me, DEFAULT_TYPING_TTL);
        let t0 = Instant::now();
        typing.set_typing(conv, true, t0);
        assert!(typing.set_typing(conv, false, t0).is_some());
        assert!(typing.set_typing(conv, false, t0).is_none());
        assert!(typing.poll_local(t0 + Duration::from_secs(10)).is_none());
    }

    #[test]
    fn test_peer_without_stop_expires() {
        let me = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let conv = Uuid::new_v4();
        let mut typing = TypingPresence::new(me, DEFAULT_TYPING_TTL);
        let t0 = Instant::now();
        typing.receive(
            TypingSignal { conversation_id: conv, user_id: peer, is_typing: true },
            t0,
        );
        assert_eq!(typing.typing_users(conv, t0 + Duration::from_secs(1)), vec![peer]);
        assert!(typing.typing_users(conv, t0 + Duration::from_secs(3)).is_empty());
        assert!(typing.prune(t0 + Duration::from_secs(3)));
        assert_eq!(typing.next_deadline(), None);
    }

    #[test]
    fn test_refresh_extends_and_own_echo_ignored() {
        let me = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let conv = Uuid::new_v4();
        let mut typing = TypingPresence::new(me, DEFAULT_TYPING_TTL);
        let t0 = Instant::now();
        let start = TypingSignal { conversation_id: conv, user_id: peer, is_typing: true };
        typing.receive(start, t0);
        typing.receive(start, t0 + Duration::from_secs(2));
        assert_eq!(typing.typing_users(conv, t0 + Duration::from_secs(4)), vec![peer]);

        typing.receive(TypingSignal { user_id: me, ..start }, t0);
        assert_eq!(typing.typing_users(conv, t0 + Duration::from_secs(4)).len(), 1);
    }

    #[test]
    fn test_clear_forgets_peers_and_stops_local() {
        let me = Uuid::new_v4();
        let conv = Uuid::new_v4();
        let mut typing = TypingPresence::new(me, DEFAULT_TYPING_TTL);
        let t0 = Instant::now();
        typing.set_typing(conv, true, t0);
        typing.receive(
            TypingSignal { conversation_id: conv, user_id: Uuid::new_v4(), is_typing: true },
            t0,
        );
        let stop = typing.clear().unwrap();
        assert!(!stop.is_typing);
        assert!(typing.typing_users(conv, t0).is_empty());
    }
}
