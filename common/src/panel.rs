//! The relay screen: one engine per configured relay plus the master
//! aggregator observing all of them.

use std::{sync::Arc, time::Duration};

use log::{info, warn};

use crate::{
    config::{PanelConfig, RelayConfig},
    error::PanelError,
    hardware::RelayHardware,
    master::MasterAggregator,
    relay::{EngineOptions, RelayEngine},
    ticker::TickerFactory,
    types::{PanelStatus, RelayStatus},
    view::{MasterPresenter, NullPresenter, RelayPresenter},
};

/// Supplies the widgets backing each engine and the master button.
pub trait PresenterFactory {
    fn relay(&self, index: usize, config: &RelayConfig) -> Arc<dyn RelayPresenter>;

    fn master(&self) -> Arc<dyn MasterPresenter>;
}

impl PresenterFactory for NullPresenter {
    fn relay(&self, _index: usize, _config: &RelayConfig) -> Arc<dyn RelayPresenter> {
        Arc::new(NullPresenter)
    }

    fn master(&self) -> Arc<dyn MasterPresenter> {
        Arc::new(NullPresenter)
    }
}

pub struct RelayPanel {
    engines: Vec<Arc<RelayEngine>>,
    master: Arc<MasterAggregator>,
    refresh_interval: Duration,
}

impl RelayPanel {
    /// Builds every engine, then the master, then wires the master in as
    /// each engine's subscriber.
    ///
    /// A relay whose hardware fails to initialize keeps working without it.
    pub fn build<H>(
        config: &PanelConfig,
        mut hardware: H,
        tickers: &dyn TickerFactory,
        presenters: &dyn PresenterFactory,
    ) -> Result<Self, PanelError>
    where
        H: FnMut(usize, &RelayConfig) -> Result<Option<Arc<dyn RelayHardware>>, PanelError>,
    {
        let mut config = config.clone();
        config.sanitize();
        config.validate()?;

        let mut engines = Vec::with_capacity(config.relays.len());
        for (index, relay) in config.relays.iter().enumerate() {
            let bound = match hardware(index, relay) {
                Ok(bound) => bound,
                Err(err) => {
                    warn!("[{}] hardware init failed, running without: {err}", relay.tag);
                    None
                }
            };

            let mut options = EngineOptions::new(
                relay.name.clone(),
                relay.tag.clone(),
                config.timer.duration_secs,
            );
            options.tick_period = Duration::from_millis(config.timer.tick_period_ms);

            engines.push(RelayEngine::new(
                options,
                bound,
                tickers.create(&relay.tag)?,
                presenters.relay(index, relay),
            ));
        }

        let master = MasterAggregator::new(presenters.master());
        master.set_members(&engines);
        master.observe_members();

        info!(
            "relay panel ready: {} relays, {}s timer",
            engines.len(),
            config.timer.duration_secs
        );
        Ok(Self {
            engines,
            master,
            refresh_interval: Duration::from_millis(config.timer.refresh_interval_ms),
        })
    }

    /// Looks up a relay by its 1-based id.
    pub fn relay(&self, id: u32) -> Result<&Arc<RelayEngine>, PanelError> {
        usize::try_from(id)
            .ok()
            .and_then(|id| id.checked_sub(1))
            .and_then(|index| self.engines.get(index))
            .ok_or_else(|| {
                PanelError::InvalidArgument(format!(
                    "relay id {id} out of range 1..={}",
                    self.engines.len()
                ))
            })
    }

    pub fn relays(&self) -> &[Arc<RelayEngine>] {
        &self.engines
    }

    pub fn master(&self) -> &Arc<MasterAggregator> {
        &self.master
    }

    pub fn relay_count(&self) -> usize {
        self.engines.len()
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Periodic presentation poll. Returns how many engines redrew.
    pub fn refresh_due(&self) -> usize {
        self.engines
            .iter()
            .filter(|engine| engine.refresh_if_due())
            .count()
    }

    pub fn snapshot(&self) -> PanelStatus {
        let relays: Vec<RelayStatus> = self
            .engines
            .iter()
            .zip(1u32..)
            .map(|(engine, id)| RelayStatus {
                id,
                name: engine.name().to_string(),
                state: engine.get_state(),
                mode: engine.mode(),
                time_remaining: engine.time_remaining(),
                timer_active: engine.timer_active(),
                duration_secs: engine.duration_secs(),
                has_hardware: engine.has_hardware(),
                current_amps: engine.read_current().ok(),
            })
            .collect();

        PanelStatus {
            relays_on: relays.iter().filter(|relay| relay.state).count(),
            master_on: self.master.compute_aggregate(),
            relays,
        }
    }

    pub fn shutdown(&self) {
        for engine in &self.engines {
            engine.destroy();
        }
        self.master.refresh();
        info!("relay panel shut down");
    }
}
