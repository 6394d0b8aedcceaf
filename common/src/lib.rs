pub mod api;
pub mod config;
pub mod error;
pub mod hardware;
pub mod master;
pub mod ota;
pub mod panel;
pub mod relay;
pub mod ticker;
pub mod types;
pub mod view;

pub use config::{CurrentSenseConfig, NetworkConfig, PanelConfig, RelayConfig, TimerConfig};
pub use error::{HardwareError, PanelError};
pub use hardware::{Acs712, RelayHardware, SimulatedRelay};
pub use master::MasterAggregator;
pub use panel::{PresenterFactory, RelayPanel};
pub use relay::{EngineOptions, RelayEngine, RelayMode, StateChangeFn};
pub use ticker::{
    ManualTicker, ManualTickerFactory, TickFn, TickOutcome, TickSlot, Ticker, TickerFactory,
};
pub use types::{ErrorResponse, PanelStatus, RelayStateResponse, RelayStatus};
pub use view::{MasterPresenter, MasterView, NullPresenter, RelayPresenter, RelayView};
