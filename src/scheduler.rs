use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

/// The kinds of timed work a connection registers with the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// retransmit the SYN while connecting
    ConnectSyn,
    /// periodic keepalive and connection-liveness check
    Keepalive,
    /// scheduled data write
    WriteData,
    /// check for unacked data that needs resending
    AckTimeout,
    /// deferred wakeup of the write path after the producer supplied data
    WriteWakeup,
    /// final FIN retransmission after close
    ClosedCleanup,
    /// release the connection's routing slot
    Teardown,
}

/// Implemented by whoever wants timer callbacks. The scheduler holds targets weakly - a
///  dropped target silently retires its events.
#[async_trait]
pub trait TimerTarget: Send + Sync + 'static {
    async fn on_timer(self: Arc<Self>, kind: TimerKind);
}

/// A registered unit of timed work. `fire_at == None` means the event is parked: it stays
///  registered but will not fire until rescheduled.
pub struct TimerEvent {
    kind: TimerKind,
    target: Weak<dyn TimerTarget>,
    fire_at: Mutex<Option<Instant>>,
    cancelled: AtomicBool,
}

impl TimerEvent {
    pub fn new(kind: TimerKind, target: Weak<dyn TimerTarget>, fire_at: Option<Instant>) -> Arc<TimerEvent> {
        Arc::new(TimerEvent {
            kind,
            target,
            fire_at: Mutex::new(fire_at),
            cancelled: AtomicBool::new(false),
        })
    }

    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    pub fn fire_at(&self) -> Option<Instant> {
        if self.is_cancelled() {
            return None;
        }
        *self.fire_at.lock().unwrap()
    }

    /// Permanently retires the event. The scheduler prunes it on its next scan.
    pub fn unregister(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// A single timer loop serving all connections of one multiplexed socket.
///
/// All protocol timing funnels through here: the loop sleeps until the earliest armed
///  event, fires exactly one callback, and rescans. Registering or rescheduling an event
///  never blocks on the loop - the event list is guarded by a plain mutex and the loop is
///  nudged through a [Notify].
///
/// Before a callback is invoked its event is parked, so a handler that wants to run again
///  must reschedule itself.
pub struct Scheduler {
    events: Mutex<Vec<Arc<TimerEvent>>>,
    notify: Notify,
}

impl Scheduler {
    pub fn new() -> Arc<Scheduler> {
        Arc::new(Scheduler {
            events: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    pub fn spawn_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_loop().await;
        })
    }

    pub fn register(&self, event: Arc<TimerEvent>) {
        trace!("registering {:?} event", event.kind());
        self.events.lock().unwrap().push(event);
        self.notify.notify_one();
    }

    /// Re-arms (or parks, with `None`) an already registered event.
    pub fn reschedule(&self, event: &TimerEvent, fire_at: Option<Instant>) {
        *event.fire_at.lock().unwrap() = fire_at;
        self.notify.notify_one();
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            match self.next_armed_event() {
                None => self.notify.notified().await,
                Some((fire_at, event)) => {
                    tokio::select! {
                        _ = sleep_until(fire_at) => {
                            self.fire(event).await;
                        }
                        _ = self.notify.notified() => {
                            // something changed, rescan
                        }
                    }
                }
            }
        }
    }

    async fn fire(&self, event: Arc<TimerEvent>) {
        // the schedule may have moved underneath the sleep
        let still_due = match event.fire_at() {
            Some(at) => at <= Instant::now(),
            None => false,
        };
        if !still_due {
            return;
        }

        // park first: the callback reschedules if it wants to run again
        *event.fire_at.lock().unwrap() = None;

        match event.target.upgrade() {
            Some(target) => {
                trace!("firing {:?} event", event.kind());
                target.on_timer(event.kind()).await;
            }
            None => {
                debug!("dropping {:?} event whose target is gone", event.kind());
                event.unregister();
            }
        }
    }

    /// The armed event with the earliest deadline, pruning retired events on the way.
    fn next_armed_event(&self) -> Option<(Instant, Arc<TimerEvent>)> {
        let mut events = self.events.lock().unwrap();
        events.retain(|e| !e.is_cancelled() && e.target.strong_count() > 0);

        let mut earliest: Option<(Instant, Arc<TimerEvent>)> = None;
        for event in events.iter() {
            if let Some(at) = event.fire_at() {
                match &earliest {
                    Some((earliest_at, _)) if *earliest_at <= at => {}
                    _ => earliest = Some((at, event.clone())),
                }
            }
        }
        earliest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct RecordingTarget {
        fired: Mutex<Vec<(TimerKind, Instant)>>,
    }

    impl RecordingTarget {
        fn new() -> Arc<RecordingTarget> {
            Arc::new(RecordingTarget {
                fired: Mutex::new(Vec::new()),
            })
        }

        fn fired(&self) -> Vec<(TimerKind, Instant)> {
            self.fired.lock().unwrap().clone()
        }

        fn as_target(self: &Arc<Self>) -> Weak<dyn TimerTarget> {
            let weak: Weak<RecordingTarget> = Arc::downgrade(self);
            weak
        }
    }

    #[async_trait]
    impl TimerTarget for RecordingTarget {
        async fn on_timer(self: Arc<Self>, kind: TimerKind) {
            self.fired.lock().unwrap().push((kind, Instant::now()));
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_fires_in_deadline_order() {
        let scheduler = Scheduler::new();
        scheduler.spawn_loop();
        let target = RecordingTarget::new();

        let now = Instant::now();
        scheduler.register(TimerEvent::new(
            TimerKind::Keepalive, target.as_target(), Some(now + Duration::from_millis(300))));
        scheduler.register(TimerEvent::new(
            TimerKind::WriteData, target.as_target(), Some(now + Duration::from_millis(100))));

        tokio::time::sleep(Duration::from_millis(500)).await;

        let fired = target.fired();
        assert_eq!(2, fired.len());
        assert_eq!(TimerKind::WriteData, fired[0].0);
        assert_eq!(TimerKind::Keepalive, fired[1].0);
        assert!(fired[0].1 >= now + Duration::from_millis(100));
        assert!(fired[1].1 >= now + Duration::from_millis(300));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_reschedule_earlier_wakes_the_loop() {
        let scheduler = Scheduler::new();
        scheduler.spawn_loop();
        let target = RecordingTarget::new();

        let now = Instant::now();
        let event = TimerEvent::new(
            TimerKind::AckTimeout, target.as_target(), Some(now + Duration::from_secs(60)));
        scheduler.register(event.clone());

        scheduler.reschedule(&event, Some(now + Duration::from_millis(50)));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(1, target.fired().len());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_fired_event_is_parked_not_repeated() {
        let scheduler = Scheduler::new();
        scheduler.spawn_loop();
        let target = RecordingTarget::new();

        let event = TimerEvent::new(
            TimerKind::WriteWakeup, target.as_target(),
            Some(Instant::now() + Duration::from_millis(10)));
        scheduler.register(event.clone());

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(1, target.fired().len());
        assert_eq!(None, event.fire_at());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_unregistered_event_does_not_fire() {
        let scheduler = Scheduler::new();
        scheduler.spawn_loop();
        let target = RecordingTarget::new();

        let event = TimerEvent::new(
            TimerKind::Keepalive, target.as_target(),
            Some(Instant::now() + Duration::from_millis(100)));
        scheduler.register(event.clone());
        event.unregister();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(target.fired().is_empty());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_dropped_target_is_pruned() {
        let scheduler = Scheduler::new();
        scheduler.spawn_loop();

        let target = RecordingTarget::new();
        scheduler.register(TimerEvent::new(
            TimerKind::Teardown, target.as_target(),
            Some(Instant::now() + Duration::from_millis(100))));
        drop(target);

        // must not panic or spin; the event is silently discarded
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(scheduler.events.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_parked_event_fires_after_rearming() {
        let scheduler = Scheduler::new();
        scheduler.spawn_loop();
        let target = RecordingTarget::new();

        let event = TimerEvent::new(TimerKind::WriteWakeup, target.as_target(), None);
        scheduler.register(event.clone());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(target.fired().is_empty());

        scheduler.reschedule(&event, Some(Instant::now() + Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(1, target.fired().len());
    }
}
