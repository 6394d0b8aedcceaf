use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};

use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    error::PanelError,
    hardware::RelayHardware,
    ticker::{TickOutcome, Ticker},
    view::{RelayPresenter, RelayView},
};

/// Single state-change subscriber, invoked from the presentation context.
pub type StateChangeFn = Arc<dyn Fn(&RelayEngine, bool) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayMode {
    Off,
    OnTimed,
    OnUntimed,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub name: String,
    pub tag: String,
    pub duration_secs: u32,
    pub tick_period: Duration,
}

impl EngineOptions {
    pub fn new(name: impl Into<String>, tag: impl Into<String>, duration_secs: u32) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
            duration_secs: duration_secs.max(1),
            tick_period: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Click,
    LongPress,
    Programmatic,
    Toggle,
}

impl Origin {
    fn actuates(self) -> bool {
        !matches!(self, Self::Toggle)
    }

    fn timed(self) -> bool {
        !matches!(self, Self::LongPress)
    }
}

#[derive(Debug)]
struct Core {
    on: bool,
    time_remaining: u32,
    countdown_running: bool,
    generation: u64,
    suppress_next_toggle: bool,
    expiry_pending_notify: bool,
    alive: bool,
}

/// One relay's state, countdown and notification logic.
///
/// Every transition runs under the engine's own lock, so click, long-press,
/// programmatic calls and countdown expiry never interleave. Presenter and
/// subscriber are called after that lock is released, but inside the
/// presentation lock, which also covers the snapshot they are given: views
/// reach the presenter in commit order. The timer context never takes the
/// presentation lock.
///
/// A subscriber may read any engine but must not drive transitions on the
/// engine notifying it.
pub struct RelayEngine {
    name: String,
    tag: String,
    duration_secs: u32,
    tick_period: Duration,
    hardware: Option<Arc<dyn RelayHardware>>,
    ticker: Box<dyn Ticker>,
    presenter: Arc<dyn RelayPresenter>,
    core: Mutex<Core>,
    update_due: AtomicBool,
    presentation: Mutex<()>,
    subscriber: Mutex<Option<StateChangeFn>>,
    weak_self: Weak<RelayEngine>,
}

impl RelayEngine {
    pub fn new(
        options: EngineOptions,
        hardware: Option<Arc<dyn RelayHardware>>,
        ticker: Box<dyn Ticker>,
        presenter: Arc<dyn RelayPresenter>,
    ) -> Arc<Self> {
        let initial_on = hardware.as_ref().is_some_and(|hw| hw.state());
        let engine = Arc::new_cyclic(|weak_self| Self {
            name: options.name,
            tag: options.tag,
            duration_secs: options.duration_secs.max(1),
            tick_period: options.tick_period,
            hardware,
            ticker,
            presenter,
            core: Mutex::new(Core {
                on: initial_on,
                time_remaining: 0,
                countdown_running: false,
                generation: 0,
                suppress_next_toggle: false,
                expiry_pending_notify: false,
                alive: true,
            }),
            update_due: AtomicBool::new(false),
            presentation: Mutex::new(()),
            subscriber: Mutex::new(None),
            weak_self: weak_self.clone(),
        });

        engine.presenter.render(&engine.view());
        info!(
            "[{}] relay engine created (hardware: {})",
            engine.tag,
            if engine.hardware.is_some() { "bound" } else { "none" }
        );
        engine
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn duration_secs(&self) -> u32 {
        self.duration_secs
    }

    pub fn has_hardware(&self) -> bool {
        self.hardware.is_some()
    }

    pub fn is_alive(&self) -> bool {
        self.core().alive
    }

    pub fn get_state(&self) -> bool {
        self.core().on
    }

    pub fn time_remaining(&self) -> u32 {
        self.core().time_remaining
    }

    pub fn timer_active(&self) -> bool {
        self.time_remaining() > 0
    }

    pub fn mode(&self) -> RelayMode {
        let core = self.core();
        Self::mode_of(&core)
    }

    pub fn view(&self) -> RelayView {
        let core = self.core();
        self.view_of(&core)
    }

    pub fn set_state_change_subscriber(&self, subscriber: Option<StateChangeFn>) {
        *self
            .subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = subscriber;
    }

    /// Programmatic transition used by the remote API and the master button.
    /// Returns whether this call changed the state.
    pub fn set_state(&self, desired: bool) -> bool {
        self.transition(Origin::Programmatic, |core| {
            (core.on != desired).then_some(desired)
        })
    }

    /// Flips the state with countdown handling but without driving hardware.
    pub fn toggle(&self) {
        self.transition(Origin::Toggle, |core| Some(!core.on));
    }

    /// Touch click. Swallowed once after a long-press turned the relay on.
    pub fn click(&self) {
        let tag = &self.tag;
        self.transition(Origin::Click, |core| {
            if core.suppress_next_toggle {
                core.suppress_next_toggle = false;
                info!("[{tag}] ignoring click after long press");
                return None;
            }
            Some(!core.on)
        });
    }

    /// Touch long-press: turns the relay on without a countdown.
    pub fn long_press(&self) {
        self.transition(Origin::LongPress, |core| {
            if core.on {
                return None;
            }
            core.suppress_next_toggle = true;
            Some(true)
        });
    }

    pub fn read_current(&self) -> Result<f32, PanelError> {
        let hardware = self
            .hardware
            .as_ref()
            .ok_or(PanelError::NotConfigured("no relay hardware bound"))?;
        match hardware.read_current() {
            Some(reading) => Ok(reading?),
            None => Err(PanelError::NotConfigured("no current sense channel")),
        }
    }

    /// Presentation-context poll: redraws if the timer context flagged a
    /// change, and delivers a deferred expiry notification.
    pub fn refresh_if_due(&self) -> bool {
        if !self.update_due.swap(false, Ordering::AcqRel) {
            return false;
        }

        let _presenting = self.presentation();
        let (view, expired) = {
            let mut core = self.core();
            if !core.alive {
                return false;
            }
            let expired = std::mem::take(&mut core.expiry_pending_notify);
            (self.view_of(&core), expired)
        };

        self.presenter.render(&view);
        if expired {
            self.notify(false);
        }
        true
    }

    /// Stops the countdown, then releases presentation resources. Further
    /// operations on this engine are ignored.
    pub fn destroy(&self) {
        let _presenting = self.presentation();
        {
            let mut core = self.core();
            if !core.alive {
                return;
            }
            self.stop_countdown(&mut core);
            core.alive = false;
        }
        self.set_state_change_subscriber(None);
        self.presenter.release();
        info!("[{}] relay engine destroyed", self.tag);
    }

    fn transition<F>(&self, origin: Origin, decide: F) -> bool
    where
        F: FnOnce(&mut Core) -> Option<bool>,
    {
        let _presenting = self.presentation();
        let (new_state, view) = {
            let mut core = self.core();
            if !core.alive {
                warn!("[{}] {origin:?} on destroyed relay ignored", self.tag);
                return false;
            }
            let Some(desired) = decide(&mut *core) else {
                return false;
            };
            let was_on = core.on;
            core.on = desired;

            if origin.actuates() {
                self.actuate(desired);
            }

            if desired && !was_on && origin.timed() {
                self.start_countdown(&mut core);
            } else if !desired && was_on {
                self.stop_countdown(&mut core);
            }
            (desired, self.view_of(&core))
        };

        self.presenter.render(&view);
        self.notify(new_state);
        info!(
            "[{}] {origin:?}: relay {}{}",
            self.tag,
            if new_state { "ON" } else { "OFF" },
            if new_state && !origin.timed() { " (no timer)" } else { "" }
        );
        true
    }

    fn start_countdown(&self, core: &mut Core) {
        core.generation = core.generation.wrapping_add(1);
        core.time_remaining = self.duration_secs;
        core.countdown_running = true;
        core.expiry_pending_notify = false;

        let generation = core.generation;
        let engine = self.weak_self.clone();
        self.ticker.start(
            self.tick_period,
            Box::new(move || match engine.upgrade() {
                Some(engine) => engine.on_tick(generation),
                None => TickOutcome::Stop,
            }),
        );
        debug!("[{}] countdown started: {}s", self.tag, self.duration_secs);
    }

    fn stop_countdown(&self, core: &mut Core) {
        core.generation = core.generation.wrapping_add(1);
        core.time_remaining = 0;
        if core.countdown_running {
            core.countdown_running = false;
            self.ticker.stop();
            debug!("[{}] countdown cancelled", self.tag);
        }
    }

    /// Timer-context tick. Touches engine data, hardware and the update flag
    /// only.
    fn on_tick(&self, generation: u64) -> TickOutcome {
        let mut core = self.core();
        if !core.alive || !core.countdown_running || core.generation != generation {
            return TickOutcome::Stop;
        }

        core.time_remaining = core.time_remaining.saturating_sub(1);
        self.update_due.store(true, Ordering::Release);

        if core.time_remaining > 0 {
            return TickOutcome::Continue;
        }

        core.on = false;
        core.countdown_running = false;
        core.expiry_pending_notify = true;
        self.actuate(false);
        info!("[{}] timer expired, relay OFF", self.tag);
        TickOutcome::Stop
    }

    fn actuate(&self, on: bool) {
        let Some(hardware) = self.hardware.as_ref() else {
            return;
        };
        if let Err(err) = hardware.set_state(on) {
            warn!("[{}] relay hardware write failed: {err}", self.tag);
        }
    }

    fn notify(&self, new_state: bool) {
        let subscriber = self
            .subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(subscriber) = subscriber {
            subscriber(self, new_state);
        }
    }

    fn view_of(&self, core: &Core) -> RelayView {
        RelayView::build(&self.name, core.on, core.time_remaining, self.duration_secs)
    }

    fn mode_of(core: &Core) -> RelayMode {
        match (core.on, core.time_remaining > 0) {
            (false, _) => RelayMode::Off,
            (true, true) => RelayMode::OnTimed,
            (true, false) => RelayMode::OnUntimed,
        }
    }

    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn presentation(&self) -> MutexGuard<'_, ()> {
        self.presentation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RelayEngine {
    fn drop(&mut self) {
        self.ticker.stop();
    }
}

impl std::fmt::Debug for RelayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayEngine")
            .field("name", &self.name)
            .field("tag", &self.tag)
            .field("duration_secs", &self.duration_secs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        sync::{atomic::AtomicU32, mpsc},
        thread,
    };

    use super::*;
    use crate::{
        hardware::SimulatedRelay,
        ticker::ManualTicker,
        view::{ProgressBand, RelayView},
    };

    /// Holds the next render open until the test lets it through.
    #[derive(Default)]
    pub(crate) struct RenderGate {
        armed: Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
    }

    impl RenderGate {
        /// Returns (entered, release).
        pub fn arm(&self) -> (mpsc::Receiver<()>, mpsc::Sender<()>) {
            let (entered_tx, entered_rx) = mpsc::channel();
            let (release_tx, release_rx) = mpsc::channel();
            *self.armed.lock().unwrap() = Some((entered_tx, release_rx));
            (entered_rx, release_tx)
        }

        pub fn pass(&self) {
            let armed = self.armed.lock().unwrap().take();
            if let Some((entered, release)) = armed {
                entered.send(()).unwrap();
                release.recv().unwrap();
            }
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingPresenter {
        pub views: Mutex<Vec<RelayView>>,
        pub released: AtomicBool,
        pub gate: RenderGate,
    }

    impl RecordingPresenter {
        pub fn last(&self) -> Option<RelayView> {
            self.views.lock().unwrap().last().cloned()
        }

        pub fn count(&self) -> usize {
            self.views.lock().unwrap().len()
        }
    }

    impl RelayPresenter for RecordingPresenter {
        fn render(&self, view: &RelayView) {
            self.gate.pass();
            self.views.lock().unwrap().push(view.clone());
        }

        fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) struct Rig {
        pub engine: Arc<RelayEngine>,
        pub ticker: ManualTicker,
        pub hardware: Arc<SimulatedRelay>,
        pub presenter: Arc<RecordingPresenter>,
    }

    pub(crate) fn rig(name: &str, duration_secs: u32) -> Rig {
        let ticker = ManualTicker::new();
        let hardware = Arc::new(SimulatedRelay::new());
        let presenter = Arc::new(RecordingPresenter::default());
        let engine = RelayEngine::new(
            EngineOptions::new(name, format!("{name}_ui"), duration_secs),
            Some(hardware.clone() as Arc<dyn RelayHardware>),
            Box::new(ticker.clone()),
            presenter.clone(),
        );
        Rig {
            engine,
            ticker,
            hardware,
            presenter,
        }
    }

    fn counting_subscriber(engine: &RelayEngine) -> Arc<AtomicU32> {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        engine.set_state_change_subscriber(Some(Arc::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        })));
        calls
    }

    #[test]
    fn starts_off_and_renders_initial_view() {
        let rig = rig("Relay 1", 10);
        assert!(!rig.engine.get_state());
        assert_eq!(rig.engine.mode(), RelayMode::Off);
        assert_eq!(rig.presenter.count(), 1);
        assert_eq!(rig.presenter.last().unwrap().label_text, "Relay 1 OFF");
        assert!(!rig.ticker.is_running());
    }

    #[test]
    fn initial_state_follows_hardware() {
        let hardware = Arc::new(SimulatedRelay::new());
        hardware.set_state(true).unwrap();
        let engine = RelayEngine::new(
            EngineOptions::new("Relay 1", "relay_1_ui", 10),
            Some(hardware as Arc<dyn RelayHardware>),
            Box::new(ManualTicker::new()),
            Arc::new(crate::view::NullPresenter),
        );
        assert!(engine.get_state());
        assert_eq!(engine.mode(), RelayMode::OnUntimed);
    }

    #[test]
    fn repeated_set_state_does_not_restart_countdown() {
        let rig = rig("Relay 1", 10);
        rig.engine.set_state(true);
        rig.ticker.fire_n(4);
        assert_eq!(rig.engine.time_remaining(), 6);

        rig.engine.set_state(true);

        assert_eq!(rig.engine.time_remaining(), 6);
        assert_eq!(rig.ticker.start_count(), 1);
        assert_eq!(rig.hardware.history(), vec![true]);
    }

    #[test]
    fn click_on_starts_full_countdown() {
        let rig = rig("Relay 1", 10);
        rig.engine.click();

        assert!(rig.engine.get_state());
        assert_eq!(rig.engine.time_remaining(), 10);
        assert!(rig.engine.timer_active());
        assert_eq!(rig.engine.mode(), RelayMode::OnTimed);
        assert_eq!(rig.ticker.period(), Some(Duration::from_secs(1)));
        assert_eq!(rig.hardware.history(), vec![true]);
    }

    #[test]
    fn long_press_on_has_no_countdown() {
        let rig = rig("Relay 1", 10);
        rig.engine.long_press();

        assert!(rig.engine.get_state());
        assert_eq!(rig.engine.time_remaining(), 0);
        assert_eq!(rig.engine.mode(), RelayMode::OnUntimed);
        assert!(!rig.ticker.is_running());
        assert_eq!(rig.hardware.history(), vec![true]);
        assert_eq!(rig.presenter.last().unwrap().countdown, None);
    }

    #[test]
    fn click_after_long_press_is_swallowed_once() {
        let rig = rig("Relay 1", 10);
        let calls = counting_subscriber(&rig.engine);
        rig.engine.long_press();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        rig.engine.click();
        assert!(rig.engine.get_state());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        rig.engine.click();
        assert!(!rig.engine.get_state());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(rig.hardware.history(), vec![true, false]);
    }

    #[test]
    fn long_press_while_on_does_nothing() {
        let rig = rig("Relay 1", 10);
        rig.engine.click();
        rig.engine.long_press();

        assert_eq!(rig.engine.time_remaining(), 10);
        rig.engine.click();
        assert!(!rig.engine.get_state());
    }

    #[test]
    fn countdown_expiry_turns_relay_off() {
        let rig = rig("Relay 1", 3);
        rig.engine.click();

        assert_eq!(rig.ticker.fire_n(10), 3);

        assert!(!rig.engine.get_state());
        assert_eq!(rig.engine.time_remaining(), 0);
        assert!(!rig.ticker.is_running());
        assert_eq!(rig.hardware.history(), vec![true, false]);
        assert!(!rig.ticker.fire());
        assert_eq!(rig.engine.time_remaining(), 0);
    }

    #[test]
    fn tick_defers_presentation_to_refresh_poll() {
        let rig = rig("Relay 1", 10);
        rig.engine.click();
        let renders = rig.presenter.count();

        rig.ticker.fire();
        assert_eq!(rig.presenter.count(), renders);

        assert!(rig.engine.refresh_if_due());
        assert_eq!(rig.presenter.count(), renders + 1);
        assert_eq!(
            rig.presenter.last().unwrap().countdown.unwrap().text,
            "00:09"
        );
        assert!(!rig.engine.refresh_if_due());
    }

    #[test]
    fn expiry_notifies_subscriber_from_refresh_poll() {
        let rig = rig("Relay 1", 1);
        rig.engine.click();
        let calls = counting_subscriber(&rig.engine);

        rig.ticker.fire();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        rig.engine.refresh_if_due();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(rig.presenter.last().unwrap().label_text, "Relay 1 OFF");
    }

    #[test]
    fn turning_off_cancels_countdown() {
        let rig = rig("Relay 1", 10);
        rig.engine.set_state(true);
        rig.ticker.fire_n(2);
        rig.engine.set_state(false);

        assert_eq!(rig.engine.time_remaining(), 0);
        assert!(!rig.ticker.is_running());
        assert_eq!(rig.hardware.history(), vec![true, false]);
    }

    #[test]
    fn new_countdown_supersedes_stale_tick() {
        let rig = rig("Relay 1", 10);
        rig.engine.click();
        rig.ticker.fire_n(5);
        rig.engine.click();
        rig.engine.click();

        assert_eq!(rig.engine.time_remaining(), 10);
        assert_eq!(rig.ticker.start_count(), 2);
        rig.ticker.fire();
        assert_eq!(rig.engine.time_remaining(), 9);
    }

    #[test]
    fn toggle_skips_hardware_but_runs_countdown() {
        let rig = rig("Relay 1", 10);
        rig.engine.toggle();

        assert!(rig.engine.get_state());
        assert_eq!(rig.engine.time_remaining(), 10);
        assert_eq!(rig.hardware.actuation_count(), 0);

        rig.engine.toggle();
        assert!(!rig.engine.get_state());
        assert_eq!(rig.engine.time_remaining(), 0);
        assert_eq!(rig.hardware.actuation_count(), 0);
    }

    #[test]
    fn hardware_failure_keeps_committed_state() {
        let rig = rig("Relay 1", 10);
        rig.hardware.set_failing(true);
        rig.engine.click();

        assert!(rig.engine.get_state());
        assert!(!rig.hardware.state());
    }

    #[test]
    fn engine_without_hardware_still_counts_down() {
        let ticker = ManualTicker::new();
        let engine = RelayEngine::new(
            EngineOptions::new("Relay 2", "relay_2_ui", 2),
            None,
            Box::new(ticker.clone()),
            Arc::new(crate::view::NullPresenter),
        );
        engine.set_state(true);
        assert_eq!(engine.time_remaining(), 2);
        assert!(matches!(
            engine.read_current(),
            Err(PanelError::NotConfigured(_))
        ));

        ticker.fire_n(2);
        assert!(!engine.get_state());
    }

    #[test]
    fn subscriber_is_replaced_not_stacked() {
        let rig = rig("Relay 1", 10);
        let first = counting_subscriber(&rig.engine);
        let second = counting_subscriber(&rig.engine);
        rig.engine.click();

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        rig.engine.set_state_change_subscriber(None);
        rig.engine.click();
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscriber_may_read_engine_state() {
        let rig = rig("Relay 1", 10);
        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = observed.clone();
        rig.engine
            .set_state_change_subscriber(Some(Arc::new(move |engine, state| {
                sink.lock()
                    .unwrap()
                    .push((engine.get_state(), state, engine.time_remaining()));
            })));

        rig.engine.click();
        assert_eq!(*observed.lock().unwrap(), vec![(true, true, 10)]);
    }

    #[test]
    fn destroyed_engine_ignores_operations() {
        let rig = rig("Relay 1", 10);
        rig.engine.click();
        rig.engine.destroy();

        assert!(!rig.engine.is_alive());
        assert!(!rig.ticker.is_running());
        assert!(rig.presenter.released.load(Ordering::SeqCst));

        rig.engine.set_state(false);
        rig.engine.click();
        assert!(rig.engine.get_state());
        assert_eq!(rig.hardware.history(), vec![true]);
        assert!(!rig.ticker.fire());
    }

    #[test]
    fn seven_ticks_leave_amber_band() {
        let rig = rig("Relay 1", 10);
        rig.engine.click();
        rig.ticker.fire_n(7);
        rig.engine.refresh_if_due();

        let countdown = rig.presenter.last().unwrap().countdown.unwrap();
        assert_eq!(rig.engine.time_remaining(), 3);
        assert_eq!(countdown.progress_percent, 70);
        assert_eq!(countdown.band, ProgressBand::Amber);
    }

    #[test]
    fn late_refresh_render_cannot_overwrite_newer_state() {
        let rig = rig("Relay 1", 10);
        rig.engine.click();
        rig.ticker.fire();

        let (entered, release) = rig.presenter.gate.arm();
        thread::scope(|scope| {
            let refresh = scope.spawn(|| rig.engine.refresh_if_due());
            entered.recv().unwrap();

            let turn_off = scope.spawn(|| rig.engine.set_state(false));
            thread::sleep(Duration::from_millis(20));
            release.send(()).unwrap();

            assert!(refresh.join().unwrap());
            assert!(turn_off.join().unwrap());
        });

        let last = rig.presenter.last().unwrap();
        assert!(!rig.engine.get_state());
        assert_eq!(last.label_text, "Relay 1 OFF");
        assert_eq!(last.countdown, None);
    }

    #[test]
    fn concurrent_ticks_and_clicks_keep_countdown_consistent() {
        fn consistent(engine: &RelayEngine) -> bool {
            let core = engine.core();
            core.time_remaining == 0 || core.on
        }

        let rig = rig("Relay 1", 3);

        thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..2_000 {
                    rig.ticker.fire();
                    assert!(consistent(&rig.engine));
                }
            });
            scope.spawn(|| {
                for round in 0..2_000 {
                    if round % 3 == 0 {
                        rig.engine.set_state(false);
                    } else {
                        rig.engine.click();
                    }
                    assert!(consistent(&rig.engine));
                }
            });
            scope.spawn(|| {
                for _ in 0..2_000 {
                    rig.engine.refresh_if_due();
                }
            });
        });

        assert!(consistent(&rig.engine));
        let last_written = rig.hardware.history().last().copied().unwrap_or(false);
        assert_eq!(last_written, rig.engine.get_state());
        rig.engine.refresh_if_due();
        assert_eq!(rig.presenter.last().unwrap(), rig.engine.view());
    }
}
