use std::sync::{Arc, Mutex, PoisonError, Weak};

use log::{info, warn};

use crate::{
    relay::RelayEngine,
    view::{MasterPresenter, MasterView},
};

/// Derived "any relay on" view over a set of engines it does not own.
pub struct MasterAggregator {
    members: Mutex<Vec<Weak<RelayEngine>>>,
    presenter: Arc<dyn MasterPresenter>,
    presentation: Mutex<()>,
}

impl MasterAggregator {
    pub fn new(presenter: Arc<dyn MasterPresenter>) -> Arc<Self> {
        let master = Arc::new(Self {
            members: Mutex::new(Vec::new()),
            presenter,
            presentation: Mutex::new(()),
        });
        master.presenter.render(&MasterView::build(false));
        master
    }

    pub fn set_members(&self, members: &[Arc<RelayEngine>]) {
        *self.lock_members() = members.iter().map(Arc::downgrade).collect();
        info!("master: observing {} relays", members.len());
        self.refresh();
    }

    /// Registers this aggregator as the state-change subscriber of every
    /// current member.
    pub fn observe_members(self: &Arc<Self>) {
        let weak_master = Arc::downgrade(self);
        for engine in self.live_members() {
            let master = weak_master.clone();
            engine.set_state_change_subscriber(Some(Arc::new(move |_, _| {
                if let Some(master) = master.upgrade() {
                    master.refresh();
                }
            })));
        }
    }

    pub fn member_count(&self) -> usize {
        self.lock_members().len()
    }

    pub fn compute_aggregate(&self) -> bool {
        self.live_members().iter().any(|engine| engine.get_state())
    }

    pub fn view(&self) -> MasterView {
        MasterView::build(self.compute_aggregate())
    }

    /// Recomputes and renders the master view. The aggregate is read inside
    /// the render lock, so a refresh racing a member change cannot leave an
    /// older view on screen.
    pub fn refresh(&self) {
        let _presenting = self
            .presentation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.presenter.render(&self.view());
    }

    /// "All off": turns off every live member that is on. Returns how many
    /// relays were switched.
    pub fn click(&self) -> usize {
        let members = self.live_members();
        if members.is_empty() {
            warn!("master: no relays to control");
            return 0;
        }

        let switched = members
            .iter()
            .filter(|engine| engine.set_state(false))
            .count();
        info!("master: turned off {switched} relays");

        self.refresh();
        switched
    }

    fn live_members(&self) -> Vec<Arc<RelayEngine>> {
        self.lock_members()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|engine| engine.is_alive())
            .collect()
    }

    fn lock_members(&self) -> std::sync::MutexGuard<'_, Vec<Weak<RelayEngine>>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        relay::tests::{rig, RenderGate, Rig},
        view::Rgb,
    };

    #[derive(Default)]
    struct RecordingMaster {
        views: Mutex<Vec<MasterView>>,
        gate: RenderGate,
    }

    impl RecordingMaster {
        fn last(&self) -> MasterView {
            self.views.lock().unwrap().last().cloned().unwrap()
        }
    }

    impl MasterPresenter for RecordingMaster {
        fn render(&self, view: &MasterView) {
            self.gate.pass();
            self.views.lock().unwrap().push(view.clone());
        }
    }

    fn panel(count: usize) -> (Vec<Rig>, Arc<MasterAggregator>, Arc<RecordingMaster>) {
        let rigs: Vec<Rig> = (1..=count)
            .map(|index| rig(&format!("Relay {index}"), 10))
            .collect();
        let presenter = Arc::new(RecordingMaster::default());
        let master = MasterAggregator::new(presenter.clone());
        let engines: Vec<_> = rigs.iter().map(|rig| rig.engine.clone()).collect();
        master.set_members(&engines);
        master.observe_members();
        (rigs, master, presenter)
    }

    #[test]
    fn aggregate_is_any_member_on() {
        let (rigs, master, presenter) = panel(3);
        assert!(!master.compute_aggregate());

        rigs[1].engine.long_press();
        assert!(master.compute_aggregate());
        assert_eq!(presenter.last(), MasterView::build(true));

        rigs[1].engine.set_state(false);
        assert!(!master.compute_aggregate());
        assert_eq!(presenter.last().label_text, "Master OFF");
    }

    #[test]
    fn click_turns_every_member_off() {
        let (rigs, master, presenter) = panel(3);
        rigs[0].engine.click();
        rigs[2].engine.long_press();

        assert_eq!(master.click(), 2);

        for rig in &rigs {
            assert!(!rig.engine.get_state());
            assert_eq!(rig.engine.time_remaining(), 0);
        }
        assert!(!rigs[0].ticker.is_running());
        assert_eq!(rigs[1].hardware.actuation_count(), 0);
        assert_eq!(presenter.last().primary_color, Rgb::BUTTON_OFF);
    }

    #[test]
    fn click_with_no_members_is_not_fatal() {
        let master = MasterAggregator::new(Arc::new(RecordingMaster::default()));
        assert_eq!(master.member_count(), 0);
        assert_eq!(master.click(), 0);
        assert!(!master.compute_aggregate());
    }

    #[test]
    fn dropped_and_destroyed_members_are_ignored() {
        let (mut rigs, master, _presenter) = panel(3);
        rigs[0].engine.long_press();
        rigs[1].engine.long_press();
        rigs[1].engine.destroy();

        let dropped = rigs.remove(0);
        drop(dropped);

        assert_eq!(master.member_count(), 3);
        assert!(!master.compute_aggregate());
        assert_eq!(master.click(), 0);
    }

    #[test]
    fn master_converges_after_countdown_expiry() {
        let (rigs, master, presenter) = panel(2);
        rigs[0].engine.click();
        rigs[1].engine.long_press();

        rigs[0].ticker.fire_n(10);
        assert!(!rigs[0].engine.get_state());
        assert_eq!(presenter.last().label_text, "Master ON");

        master.click();
        assert!(!rigs[1].engine.get_state());
        assert_eq!(presenter.last().label_text, "Master OFF");
    }

    #[test]
    fn expiry_of_last_member_republishes_off() {
        let (rigs, _master, presenter) = panel(2);
        rigs[0].engine.click();
        assert_eq!(presenter.last().label_text, "Master ON");

        rigs[0].ticker.fire_n(10);
        rigs[0].engine.refresh_if_due();

        assert_eq!(presenter.last().label_text, "Master OFF");
    }

    #[test]
    fn replacing_members_drops_old_set() {
        let (rigs, master, _presenter) = panel(2);
        rigs[0].engine.long_press();
        master.set_members(&[rigs[1].engine.clone()]);

        assert_eq!(master.member_count(), 1);
        assert!(!master.compute_aggregate());
    }

    #[test]
    fn stale_master_render_is_followed_by_current_view() {
        let (rigs, master, presenter) = panel(2);
        rigs[0].engine.long_press();
        assert_eq!(presenter.last().label_text, "Master ON");

        let (entered, release) = presenter.gate.arm();
        thread::scope(|scope| {
            let refresh = scope.spawn(|| master.refresh());
            entered.recv().unwrap();

            let turn_off = scope.spawn(|| rigs[0].engine.set_state(false));
            thread::sleep(Duration::from_millis(20));
            release.send(()).unwrap();

            refresh.join().unwrap();
            assert!(turn_off.join().unwrap());
        });

        assert!(!master.compute_aggregate());
        assert_eq!(presenter.last().label_text, "Master OFF");
    }

    #[test]
    fn click_counts_only_relays_it_switched() {
        let (rigs, master, _presenter) = panel(3);
        rigs[0].engine.click();
        rigs[1].engine.click();
        rigs[1].ticker.fire_n(10);

        assert_eq!(master.click(), 1);
        assert_eq!(rigs[0].hardware.history(), vec![true, false]);
    }
}
