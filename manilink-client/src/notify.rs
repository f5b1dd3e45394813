use std::{
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use manilink_core::{DEFAULT_NOTIFICATION_AUTO_CLOSE_MS, NotificationPhase};
use tracing::debug;

/// Identity-keyed status messages. Writes to an identity replace whatever
/// that identity currently shows.
pub trait NotificationChannel: Send + Sync {
    fn open(&self, identity: &str, phase: NotificationPhase, message: &str);

    /// Same as `open` when nothing is showing for `identity`.
    fn update(&self, identity: &str, phase: NotificationPhase, message: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRecord {
    pub identity: String,
    pub phase: NotificationPhase,
    pub message: String,
}

#[derive(Debug)]
struct Slot {
    record: NotificationRecord,
    expires_at: Option<Instant>,
}

type Observer = Box<dyn Fn(&NotificationRecord) + Send + Sync>;

/// In-memory notification set with auto-dismiss for non-loading phases.
pub struct NotificationBoard {
    auto_close: Duration,
    slots: Mutex<Vec<Slot>>,
    observer: Option<Observer>,
}

impl std::fmt::Debug for NotificationBoard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBoard")
            .field("auto_close", &self.auto_close)
            .field("slots", &self.slots)
            .finish_non_exhaustive()
    }
}

impl Default for NotificationBoard {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_NOTIFICATION_AUTO_CLOSE_MS))
    }
}

impl NotificationBoard {
    pub fn new(auto_close: Duration) -> Self {
        Self {
            auto_close,
            slots: Mutex::new(Vec::new()),
            observer: None,
        }
    }

    /// `observer` sees every write, e.g. to render it.
    pub fn with_observer(
        mut self,
        observer: impl Fn(&NotificationRecord) + Send + Sync + 'static,
    ) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Currently visible records, oldest identity first.
    pub fn visible(&self) -> Vec<NotificationRecord> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        prune_expired(&mut slots, Instant::now());
        slots.iter().map(|slot| slot.record.clone()).collect()
    }

    pub fn get(&self, identity: &str) -> Option<NotificationRecord> {
        self.visible()
            .into_iter()
            .find(|record| record.identity == identity)
    }

    fn upsert(&self, identity: &str, phase: NotificationPhase, message: &str) {
        let now = Instant::now();
        let record = NotificationRecord {
            identity: identity.to_owned(),
            phase,
            message: message.to_owned(),
        };
        let expires_at = phase.auto_closes().then(|| now + self.auto_close);

        {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            prune_expired(&mut slots, now);
            match slots.iter_mut().find(|slot| slot.record.identity == identity) {
                Some(slot) => {
                    slot.record = record.clone();
                    slot.expires_at = expires_at;
                }
                None => slots.push(Slot {
                    record: record.clone(),
                    expires_at,
                }),
            }
        }

        debug!(identity, %phase, "{}", message);
        if let Some(observer) = &self.observer {
            observer(&record);
        }
    }
}

fn prune_expired(slots: &mut Vec<Slot>, now: Instant) {
    slots.retain(|slot| slot.expires_at.is_none_or(|at| at > now));
}

impl NotificationChannel for NotificationBoard {
    fn open(&self, identity: &str, phase: NotificationPhase, message: &str) {
        self.upsert(identity, phase, message);
    }

    fn update(&self, identity: &str, phase: NotificationPhase, message: &str) {
        self.upsert(identity, phase, message);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn reopening_replaces_in_place() {
        let board = NotificationBoard::default();
        board.open("gen", NotificationPhase::Loading, "Generating manifest URL...");
        board.open("other", NotificationPhase::Info, "hello");
        board.open("gen", NotificationPhase::Error, "boom");

        let visible = board.visible();
        assert_eq!(visible.len(), 2);
        assert_eq!(visible[0].identity, "gen");
        assert_eq!(visible[0].phase, NotificationPhase::Error);
        assert_eq!(visible[0].message, "boom");
    }

    #[test]
    fn update_without_open_behaves_like_open() {
        let board = NotificationBoard::default();
        board.update("fresh", NotificationPhase::Success, "done");
        assert_eq!(
            board.get("fresh").map(|r| r.phase),
            Some(NotificationPhase::Success)
        );
    }

    #[test]
    fn terminal_phases_auto_dismiss_but_loading_stays() {
        let board = NotificationBoard::new(Duration::ZERO);
        board.open("busy", NotificationPhase::Loading, "working");
        board.open("done", NotificationPhase::Success, "ok");
        board.open("failed", NotificationPhase::Error, "nope");

        let visible = board.visible();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].identity, "busy");

        board.update("busy", NotificationPhase::Success, "finished");
        assert!(board.visible().is_empty());
    }

    #[test]
    fn observer_sees_every_write() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let board = NotificationBoard::default().with_observer(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        board.open("a", NotificationPhase::Loading, "1");
        board.update("a", NotificationPhase::Success, "2");
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
