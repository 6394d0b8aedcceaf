use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Stop,
}

pub type TickFn = Box<dyn FnMut() -> TickOutcome + Send + 'static>;

/// Periodic timer context driving a countdown.
///
/// `start` replaces any running schedule; after `on_tick` returns
/// [`TickOutcome::Stop`] the ticker must not call it again.
pub trait Ticker: Send + Sync {
    fn start(&self, period: Duration, on_tick: TickFn);

    fn stop(&self);
}

/// Creates one ticker per engine at panel construction.
pub trait TickerFactory {
    fn create(&self, tag: &str) -> Result<Box<dyn Ticker>, crate::PanelError>;
}

/// Holder for the installed tick callback, shared between the owner and the
/// timer context.
///
/// The callback is taken out of the slot while it runs so it may call back
/// into `install`/`clear` without deadlocking; a schedule change made during
/// the call wins over the callback being put back.
#[derive(Clone, Default)]
pub struct TickSlot {
    inner: Arc<Mutex<SlotInner>>,
}

#[derive(Default)]
struct SlotInner {
    on_tick: Option<TickFn>,
    armed: bool,
    epoch: u64,
}

impl TickSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, on_tick: TickFn) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.epoch = inner.epoch.wrapping_add(1);
            inner.on_tick = Some(on_tick);
            inner.armed = true;
        }
    }

    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.epoch = inner.epoch.wrapping_add(1);
            inner.on_tick = None;
            inner.armed = false;
        }
    }

    pub fn is_armed(&self) -> bool {
        self.inner.lock().map(|inner| inner.armed).unwrap_or(false)
    }

    /// Runs the installed callback once; `None` when nothing is armed.
    pub fn fire(&self) -> Option<TickOutcome> {
        let (mut on_tick, epoch) = {
            let mut inner = self.inner.lock().ok()?;
            let on_tick = inner.on_tick.take()?;
            (on_tick, inner.epoch)
        };

        let outcome = on_tick();

        if let Ok(mut inner) = self.inner.lock() {
            if inner.epoch == epoch {
                match outcome {
                    TickOutcome::Continue => inner.on_tick = Some(on_tick),
                    TickOutcome::Stop => inner.armed = false,
                }
            }
        }
        Some(outcome)
    }
}

/// Ticker fired by hand, for tests and step-through simulation.
#[derive(Clone, Default)]
pub struct ManualTicker {
    slot: TickSlot,
    period: Arc<Mutex<Option<Duration>>>,
    starts: Arc<Mutex<u32>>,
}

impl ManualTicker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.slot.is_armed()
    }

    pub fn period(&self) -> Option<Duration> {
        if !self.is_running() {
            return None;
        }
        self.period.lock().ok().and_then(|period| *period)
    }

    pub fn start_count(&self) -> u32 {
        self.starts.lock().map(|starts| *starts).unwrap_or(0)
    }

    /// Fires one tick; returns false when nothing was scheduled.
    pub fn fire(&self) -> bool {
        self.slot.fire().is_some()
    }

    pub fn fire_n(&self, count: usize) -> usize {
        (0..count).take_while(|_| self.fire()).count()
    }
}

impl Ticker for ManualTicker {
    fn start(&self, period: Duration, on_tick: TickFn) {
        if let Ok(mut current) = self.period.lock() {
            *current = Some(period);
        }
        if let Ok(mut starts) = self.starts.lock() {
            *starts += 1;
        }
        self.slot.install(on_tick);
    }

    fn stop(&self) {
        self.slot.clear();
    }
}

/// Hands out [`ManualTicker`]s and keeps a handle to each for the caller.
#[derive(Clone, Default)]
pub struct ManualTickerFactory {
    created: Arc<Mutex<Vec<ManualTicker>>>,
}

impl ManualTickerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticker(&self, index: usize) -> Option<ManualTicker> {
        self.created.lock().ok()?.get(index).cloned()
    }
}

impl TickerFactory for ManualTickerFactory {
    fn create(&self, _tag: &str) -> Result<Box<dyn Ticker>, crate::PanelError> {
        let ticker = ManualTicker::new();
        self.created
            .lock()
            .map_err(|_| crate::PanelError::ResourceExhausted("ticker registry poisoned".into()))?
            .push(ticker.clone());
        Ok(Box::new(ticker))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn counting(counter: Arc<AtomicU32>, stop_at: u32) -> TickFn {
        Box::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) + 1 == stop_at {
                TickOutcome::Stop
            } else {
                TickOutcome::Continue
            }
        })
    }

    #[test]
    fn fire_without_schedule_is_noop() {
        let ticker = ManualTicker::new();
        assert!(!ticker.fire());
        assert!(!ticker.is_running());
    }

    #[test]
    fn stop_outcome_ends_schedule() {
        let ticker = ManualTicker::new();
        let count = Arc::new(AtomicU32::new(0));
        ticker.start(Duration::from_secs(1), counting(count.clone(), 3));

        assert_eq!(ticker.fire_n(10), 3);
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(!ticker.is_running());
        assert_eq!(ticker.period(), None);
    }

    #[test]
    fn restart_replaces_previous_callback() {
        let ticker = ManualTicker::new();
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));

        ticker.start(Duration::from_secs(1), counting(first.clone(), u32::MAX));
        ticker.fire();
        ticker.start(Duration::from_secs(1), counting(second.clone(), u32::MAX));
        ticker.fire_n(2);

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
        assert_eq!(ticker.start_count(), 2);
    }

    #[test]
    fn clear_from_inside_callback_wins() {
        let slot = TickSlot::new();
        let handle = slot.clone();
        slot.install(Box::new(move || {
            handle.clear();
            TickOutcome::Continue
        }));

        assert_eq!(slot.fire(), Some(TickOutcome::Continue));
        assert!(!slot.is_armed());
        assert_eq!(slot.fire(), None);
    }
}
