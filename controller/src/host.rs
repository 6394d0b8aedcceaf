use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tokio::{net::TcpListener, runtime::Handle, task::JoinHandle};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use relay_panel_common::{
    api::{self, RelayApiError, RelayCommand},
    ota::OtaPullRequest,
    ErrorResponse, MasterPresenter, MasterView, PanelConfig, PanelError, PresenterFactory,
    RelayConfig, RelayHardware, RelayPanel, RelayPresenter, RelayView, SimulatedRelay, TickFn,
    TickOutcome, Ticker, TickerFactory,
};

const HOST_HTTP_PORT: u16 = 8080;

#[derive(Clone)]
struct AppState {
    panel: Option<Arc<RelayPanel>>,
}

/// Countdown ticker backed by a tokio interval task.
struct TokioTicker {
    runtime: Handle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TokioTicker {
    fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            task: Mutex::new(None),
        }
    }

    fn replace_task(&self, next: Option<JoinHandle<()>>) {
        let mut task = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = std::mem::replace(&mut *task, next) {
            previous.abort();
        }
    }
}

impl Ticker for TokioTicker {
    fn start(&self, period: Duration, mut on_tick: TickFn) {
        let task = self.runtime.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            loop {
                interval.tick().await;
                if on_tick() == TickOutcome::Stop {
                    break;
                }
            }
        });
        self.replace_task(Some(task));
    }

    fn stop(&self) {
        self.replace_task(None);
    }
}

struct TokioTickerFactory {
    runtime: Handle,
}

impl TickerFactory for TokioTickerFactory {
    fn create(&self, _tag: &str) -> Result<Box<dyn Ticker>, PanelError> {
        Ok(Box::new(TokioTicker::new(self.runtime.clone())))
    }
}

/// Headless presenter: the host has no screen, so views go to the log.
struct LogPresenter {
    tag: String,
}

impl RelayPresenter for LogPresenter {
    fn render(&self, view: &RelayView) {
        match &view.countdown {
            Some(countdown) => debug!(
                tag = %self.tag,
                label = %view.label_text,
                remaining = %countdown.text,
                progress = countdown.progress_percent,
                band = ?countdown.band,
                "relay view"
            ),
            None => debug!(tag = %self.tag, label = %view.label_text, "relay view"),
        }
    }

    fn release(&self) {
        debug!(tag = %self.tag, "relay view released");
    }
}

impl MasterPresenter for LogPresenter {
    fn render(&self, view: &MasterView) {
        info!(label = view.label_text, "master view");
    }
}

struct LogPresenters;

impl PresenterFactory for LogPresenters {
    fn relay(&self, _index: usize, config: &RelayConfig) -> Arc<dyn RelayPresenter> {
        Arc::new(LogPresenter {
            tag: config.tag.clone(),
        })
    }

    fn master(&self) -> Arc<dyn MasterPresenter> {
        Arc::new(LogPresenter {
            tag: "master_button_ui".to_string(),
        })
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = load_config().await.unwrap_or_else(|err| {
        warn!("failed to load panel config: {err:#}");
        host_default_config()
    });
    let config = apply_env_overrides(config);

    let tickers = TokioTickerFactory {
        runtime: Handle::current(),
    };
    let panel = RelayPanel::build(&config, simulated_hardware, &tickers, &LogPresenters)
        .context("failed to build relay panel")?;
    let panel = Arc::new(panel);

    spawn_refresh_loop(panel.clone());

    let app = router(AppState {
        panel: Some(panel.clone()),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.network.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("relay panel listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    panel.shutdown();
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/relay/{id}",
            get(handle_get_relay).post(handle_post_relay),
        )
        .route("/api/status", get(handle_get_status))
        .route("/api/ota", post(handle_post_ota))
        .route("/update", post(handle_post_update))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn simulated_hardware(
    _index: usize,
    relay: &RelayConfig,
) -> Result<Option<Arc<dyn RelayHardware>>, PanelError> {
    if !relay.has_hardware() {
        return Ok(None);
    }
    let hardware = match relay.adc_channel {
        Some(_) => SimulatedRelay::with_current_sensor(0.35),
        None => SimulatedRelay::new(),
    };
    info!(
        "simulated relay on gpio {} for {}",
        relay.gpio_pin.unwrap_or(-1),
        relay.name
    );
    Ok(Some(Arc::new(hardware)))
}

fn spawn_refresh_loop(panel: Arc<RelayPanel>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(panel.refresh_interval());
        loop {
            interval.tick().await;
            panel.refresh_due();
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn load_config() -> anyhow::Result<PanelConfig> {
    let path = std::env::var("RELAY_PANEL_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./relay-panel.json"));
    load_config_from(&path).await
}

async fn load_config_from(path: &std::path::Path) -> anyhow::Result<PanelConfig> {
    match tokio::fs::read(path).await {
        Ok(raw) => serde_json::from_slice::<PanelConfig>(&raw)
            .with_context(|| format!("invalid panel config in {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(host_default_config()),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn host_default_config() -> PanelConfig {
    let mut config = PanelConfig::default();
    // Port 80 is the device default; the host binds an unprivileged port.
    config.network.http_port = HOST_HTTP_PORT;
    config
}

fn apply_env_overrides(config: PanelConfig) -> PanelConfig {
    apply_overrides(config, |key| std::env::var(key).ok())
}

fn apply_overrides<F>(mut config: PanelConfig, lookup: F) -> PanelConfig
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(secs) = lookup("RELAY_TIMER_SECS").and_then(|value| value.parse::<u32>().ok()) {
        config.timer.duration_secs = secs;
    }
    if let Some(port) = lookup("CONTROLLER_HTTP_PORT").and_then(|value| value.parse::<u16>().ok())
    {
        config.network.http_port = port;
    }
    config
}

async fn handle_get_relay(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let result = api::parse_id(&id).and_then(|id| api::get_relay(state.panel.as_deref(), id));
    match result {
        Ok(response) => Json(response).into_response(),
        Err(err) => api_error_response(&err),
    }
}

async fn handle_post_relay(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> axum::response::Response {
    let result = api::parse_id(&id).and_then(|id| {
        let command = RelayCommand::parse(&body)?;
        api::post_relay(state.panel.as_deref(), id, command)
    });
    match result {
        Ok(response) => Json(response).into_response(),
        Err(err) => api_error_response(&err),
    }
}

async fn handle_get_status(State(state): State<AppState>) -> axum::response::Response {
    match state.panel.as_deref() {
        Some(panel) => Json(panel.snapshot()).into_response(),
        None => api_error_response(&RelayApiError::NotInitialized),
    }
}

async fn handle_post_ota(body: Bytes) -> axum::response::Response {
    match OtaPullRequest::parse(&body).and_then(|request| request.firmware_url()) {
        Ok(url) => {
            info!("ignoring OTA request for {url}: no OTA partition on host");
            error_response(
                StatusCode::NOT_IMPLEMENTED,
                "Firmware download is only available in ESP32 builds",
            )
        }
        Err(err) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

async fn handle_post_update() -> impl IntoResponse {
    error_response(
        StatusCode::NOT_IMPLEMENTED,
        "Firmware upload is only available in ESP32 builds",
    )
}

fn api_error_response(err: &RelayApiError) -> axum::response::Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    error_response(status, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (status, Json(ErrorResponse::new(message))).into_response()
}
