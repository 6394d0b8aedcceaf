use core::convert::TryInto;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock, PoisonError, Weak,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{gpio::AnyOutputPin, modem::Modem, prelude::Peripherals},
    http::{
        client::{
            Configuration as HttpClientConfiguration, EspHttpConnection as HttpClientConnection,
        },
        server::{Configuration as HttpConfiguration, EspHttpServer},
    },
    log::EspLogger,
    nvs::EspDefaultNvsPartition,
    ota::{EspOta, EspOtaUpdate},
    timer::{EspTaskTimerService, EspTimer},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};

use relay_panel_common::{
    api::{self, RelayApiError, RelayCommand},
    ota::{self, OtaPullRequest, UploadFilter},
    Acs712, CurrentSenseConfig, ErrorResponse, HardwareError, MasterPresenter, MasterView,
    NetworkConfig, PanelConfig, PanelError, PresenterFactory, RelayConfig, RelayHardware,
    RelayPanel, RelayPresenter, RelayView, TickFn, TickSlot, Ticker, TickerFactory,
};

const MAX_HTTP_BODY: usize = 512;
const OTA_CHUNK_SIZE: usize = 4096;
const OTA_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const ADC_FULL_SCALE_MV: f32 = 3_300.0;
const ADC_MAX_RAW: f32 = 4_095.0;
const RELAY_API_PREFIX: &str = "/api/relay/";

const UPLOAD_HTML: &str = r#"<!doctype html>
<html>
<head>
  <meta charset="utf-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1" />
  <title>Relay Panel Firmware Update</title>
  <style>
    body { font-family: sans-serif; max-width: 480px; margin: 40px auto; padding: 0 16px; }
    button { padding: 8px 16px; }
    #status { margin-top: 16px; }
    .err { color: #b00020; }
  </style>
</head>
<body>
  <h1>Firmware Update</h1>
  <form id="upload">
    <input type="file" id="firmware" name="firmware" accept=".bin" required />
    <button type="submit">Upload</button>
  </form>
  <div id="status"></div>
  <script>
    const q = (id) => document.getElementById(id);
    q('upload').addEventListener('submit', async (event) => {
      event.preventDefault();
      const file = q('firmware').files[0];
      if (!file) { return; }
      q('status').className = '';
      q('status').textContent = 'Uploading ' + file.size + ' bytes...';
      try {
        const res = await fetch('/update', { method: 'POST', body: file });
        const text = await res.text();
        if (!res.ok) { throw new Error(text); }
        q('status').textContent = text;
      } catch (err) {
        q('status').className = 'err';
        q('status').textContent = err.message;
      }
    });
  </script>
</body>
</html>
"#;

type SharedPanel = Arc<OnceLock<Arc<RelayPanel>>>;

/// ADC1 oneshot unit shared by every relay's current-sense channel.
struct Adc1 {
    handle: esp_idf_svc::sys::adc_oneshot_unit_handle_t,
    lock: Mutex<()>,
}

// SAFETY: the unit handle is created once at boot and never freed; reads
// are serialized through `lock`.
unsafe impl Send for Adc1 {}
unsafe impl Sync for Adc1 {}

impl Adc1 {
    fn new() -> anyhow::Result<Self> {
        let mut handle: esp_idf_svc::sys::adc_oneshot_unit_handle_t = core::ptr::null_mut();
        let unit_cfg = esp_idf_svc::sys::adc_oneshot_unit_init_cfg_t {
            unit_id: esp_idf_svc::sys::adc_unit_t_ADC_UNIT_1,
            ulp_mode: esp_idf_svc::sys::adc_ulp_mode_t_ADC_ULP_MODE_DISABLE,
            ..Default::default()
        };
        let rc = unsafe { esp_idf_svc::sys::adc_oneshot_new_unit(&unit_cfg, &mut handle) };
        if rc != esp_idf_svc::sys::ESP_OK {
            return Err(anyhow!("adc_oneshot_new_unit failed with code {rc}"));
        }
        Ok(Self {
            handle,
            lock: Mutex::new(()),
        })
    }

    fn configure(&self, channel: u8) -> Result<(), HardwareError> {
        let chan_cfg = esp_idf_svc::sys::adc_oneshot_chan_cfg_t {
            atten: esp_idf_svc::sys::adc_atten_t_ADC_ATTEN_DB_12,
            bitwidth: esp_idf_svc::sys::adc_bitwidth_t_ADC_BITWIDTH_12,
        };
        let rc = unsafe {
            esp_idf_svc::sys::adc_oneshot_config_channel(self.handle, u32::from(channel), &chan_cfg)
        };
        if rc != esp_idf_svc::sys::ESP_OK {
            return Err(HardwareError::Adc(format!(
                "channel {channel} config failed with code {rc}"
            )));
        }
        Ok(())
    }

    fn read_mv(&self, channel: u8) -> Result<f32, HardwareError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut raw: i32 = 0;
        let rc = unsafe {
            esp_idf_svc::sys::adc_oneshot_read(self.handle, u32::from(channel), &mut raw)
        };
        if rc != esp_idf_svc::sys::ESP_OK {
            return Err(HardwareError::Adc(format!(
                "channel {channel} read failed with code {rc}"
            )));
        }
        Ok(raw.max(0) as f32 * ADC_FULL_SCALE_MV / ADC_MAX_RAW)
    }
}

struct CurrentSense {
    adc: Arc<Adc1>,
    channel: u8,
    sensor: Acs712,
}

impl CurrentSense {
    fn read_amps(&self) -> Result<f32, HardwareError> {
        let samples = (0..self.sensor.samples())
            .map(|_| self.adc.read_mv(self.channel))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.sensor.amps_from_samples(&samples))
    }
}

/// Relay coil on a GPIO, with an optional indicator LED and ACS712 channel.
struct GpioRelay {
    pin: i32,
    active_low: bool,
    output: Mutex<PinDriver<'static, AnyOutputPin, Output>>,
    led: Option<Mutex<PinDriver<'static, AnyOutputPin, Output>>>,
    on: AtomicBool,
    current: Option<CurrentSense>,
}

impl GpioRelay {
    fn new(
        relay: &RelayConfig,
        adc: Option<&Arc<Adc1>>,
        current_sense: CurrentSenseConfig,
    ) -> Result<Option<Self>, PanelError> {
        let Some(pin) = relay.gpio_pin.filter(|_| relay.has_hardware()) else {
            return Ok(None);
        };

        let output = open_output(pin)?;
        let led = match relay.led_pin {
            Some(led_pin) => match open_output(led_pin) {
                Ok(driver) => Some(Mutex::new(driver)),
                Err(err) => {
                    warn!("[{}] indicator LED unavailable: {err}", relay.tag);
                    None
                }
            },
            None => None,
        };

        let current = match (relay.adc_channel, adc) {
            (Some(channel), Some(adc)) => match adc.configure(channel) {
                Ok(()) => Some(CurrentSense {
                    adc: adc.clone(),
                    channel,
                    sensor: Acs712::new(current_sense),
                }),
                Err(err) => {
                    warn!("[{}] current sensing disabled: {err}", relay.tag);
                    None
                }
            },
            _ => None,
        };

        let relay_hw = Self {
            pin,
            active_low: relay.active_low,
            output: Mutex::new(output),
            led,
            on: AtomicBool::new(false),
            current,
        };
        relay_hw.set_state(false)?;
        info!(
            "[{}] relay on GPIO{pin} ({}{})",
            relay.tag,
            if relay.active_low { "active-low" } else { "active-high" },
            if relay_hw.current.is_some() { ", current sense" } else { "" }
        );
        Ok(Some(relay_hw))
    }
}

impl RelayHardware for GpioRelay {
    fn set_state(&self, on: bool) -> Result<(), HardwareError> {
        let high = on != self.active_low;
        {
            let mut output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
            let result = if high { output.set_high() } else { output.set_low() };
            result.map_err(|err| HardwareError::Gpio {
                pin: self.pin,
                reason: format!("{err:?}"),
            })?;
        }
        self.on.store(on, Ordering::SeqCst);

        if let Some(led) = &self.led {
            let mut led = led.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = if on { led.set_high() } else { led.set_low() };
        }
        Ok(())
    }

    fn state(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }

    fn read_current(&self) -> Option<Result<f32, HardwareError>> {
        self.current.as_ref().map(CurrentSense::read_amps)
    }
}

impl Drop for GpioRelay {
    fn drop(&mut self) {
        if let Err(err) = self.set_state(false) {
            warn!("failed to release relay on GPIO{}: {err}", self.pin);
        }
    }
}

fn open_output(pin: i32) -> Result<PinDriver<'static, AnyOutputPin, Output>, PanelError> {
    unsafe { PinDriver::output(AnyOutputPin::new(pin)) }.map_err(|err| {
        PanelError::Hardware(HardwareError::Gpio {
            pin,
            reason: format!("{err:?}"),
        })
    })
}

/// One persistent esp_timer per engine. Schedule changes swap the callback
/// in the slot; the timer cancels itself once nothing is armed.
struct EspTicker {
    shared: Arc<EspTickerShared>,
}

struct EspTickerShared {
    tag: String,
    slot: TickSlot,
    timer: Mutex<Option<EspTimer<'static>>>,
}

impl EspTickerShared {
    fn on_fire(&self) {
        self.slot.fire();
        let timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.slot.is_armed() {
            if let Some(timer) = timer.as_ref() {
                let _ = timer.cancel();
            }
        }
    }
}

impl Ticker for EspTicker {
    fn start(&self, period: Duration, on_tick: TickFn) {
        let timer = self
            .shared
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.shared.slot.install(on_tick);
        if let Some(timer) = timer.as_ref() {
            if let Err(err) = timer.every(period) {
                warn!("[{}] failed to arm countdown timer: {err:?}", self.shared.tag);
                self.shared.slot.clear();
            }
        }
    }

    fn stop(&self) {
        let timer = self
            .shared
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.shared.slot.clear();
        if let Some(timer) = timer.as_ref() {
            let _ = timer.cancel();
        }
    }
}

struct EspTickerFactory {
    service: EspTaskTimerService,
}

impl TickerFactory for EspTickerFactory {
    fn create(&self, tag: &str) -> Result<Box<dyn Ticker>, PanelError> {
        let shared = Arc::new(EspTickerShared {
            tag: tag.to_string(),
            slot: TickSlot::new(),
            timer: Mutex::new(None),
        });
        let weak: Weak<EspTickerShared> = Arc::downgrade(&shared);
        let timer = self
            .service
            .timer(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_fire();
                }
            })
            .map_err(|err| {
                PanelError::ResourceExhausted(format!("countdown timer for {tag}: {err:?}"))
            })?;
        *shared.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(timer);
        Ok(Box::new(EspTicker { shared }))
    }
}

/// Presenter used until a display driver is attached: views go to the log.
struct LogPresenter {
    tag: String,
}

impl RelayPresenter for LogPresenter {
    fn render(&self, view: &RelayView) {
        match &view.countdown {
            Some(countdown) => debug!(
                "[{}] {} {} ({}%)",
                self.tag, view.label_text, countdown.text, countdown.progress_percent
            ),
            None => debug!("[{}] {}", self.tag, view.label_text),
        }
    }
}

impl MasterPresenter for LogPresenter {
    fn render(&self, view: &MasterView) {
        info!("[{}] {}", self.tag, view.label_text);
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

#[derive(Debug, Serialize)]
struct UploadResult {
    success: bool,
    bytes: u64,
    sha256: String,
}

#[derive(Debug, Serialize)]
struct OtaAccepted {
    success: bool,
    accepted: bool,
    url: String,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut config = PanelConfig::default();
    ensure_wifi_defaults(&mut config.network);
    config.sanitize();

    let Peripherals { modem, .. } = Peripherals::take()?;

    let wifi = match connect_wifi(modem, sys_loop, nvs_partition, &config.network) {
        Ok(wifi) => Some(wifi),
        Err(err) => {
            warn!("wifi unavailable, running panel offline: {err:#}");
            None
        }
    };

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let panel: SharedPanel = Arc::new(OnceLock::new());
    let server = match wifi {
        Some(_) => Some(create_http_server(panel.clone(), config.network.http_port)?),
        None => None,
    };

    let adc = if config.relays.iter().any(|relay| relay.adc_channel.is_some()) {
        match Adc1::new() {
            Ok(adc) => Some(Arc::new(adc)),
            Err(err) => {
                warn!("ADC1 init failed, current sensing disabled: {err:#}");
                None
            }
        }
    } else {
        None
    };

    let tickers = EspTickerFactory {
        service: EspTaskTimerService::new().context("failed to start timer service")?,
    };
    let current_sense = config.current_sense;
    let built = RelayPanel::build(
        &config,
        |_, relay| {
            Ok(GpioRelay::new(relay, adc.as_ref(), current_sense)?
                .map(|hw| Arc::new(hw) as Arc<dyn RelayHardware>))
        },
        &tickers,
        &LogPresenters,
    )
    .context("failed to build relay panel")?;
    let refresh_interval = built.refresh_interval();
    let built = Arc::new(built);
    if panel.set(built.clone()).is_err() {
        return Err(anyhow!("relay panel initialized twice"));
    }

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;
    let _tickers = tickers;

    info!("relay panel running");
    loop {
        built.refresh_due();
        feed_watchdog();
        thread::sleep(refresh_interval);
    }
}

fn ensure_wifi_defaults(network: &mut NetworkConfig) {
    if network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            network.wifi_ssid = ssid.to_string();
        }
    }

    if network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            network.wifi_pass = pass.to_string();
        }
    }
}

fn create_http_server(panel: SharedPanel, port: u16) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        http_port: port,
        stack_size: 16 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;
    let ota_busy = Arc::new(AtomicBool::new(false));

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_ok_response()?.write_all(UPLOAD_HTML.as_bytes())?;
        Ok(())
    })?;

    {
        let panel = panel.clone();
        server.fn_handler("/api/relay/*", Method::Get, move |req| {
            let result = relay_id(req.uri())
                .and_then(|id| api::get_relay(panel.get().map(Arc::as_ref), id));
            match result {
                Ok(response) => write_json(req, &response),
                Err(err) => write_api_error(req, &err),
            }
        })?;
    }

    {
        let panel = panel.clone();
        server.fn_handler("/api/relay/*", Method::Post, move |mut req| {
            let id = match relay_id(req.uri()) {
                Ok(id) => id,
                Err(err) => return write_api_error(req, &err),
            };
            let command = match read_request_body(&mut req) {
                Ok(body) => RelayCommand::parse(&body),
                Err(err) => {
                    warn!("relay api body read failed: {err:#}");
                    Err(RelayApiError::InvalidBody)
                }
            };
            let result = command
                .and_then(|command| api::post_relay(panel.get().map(Arc::as_ref), id, command));
            match result {
                Ok(response) => write_json(req, &response),
                Err(err) => write_api_error(req, &err),
            }
        })?;
    }

    {
        let panel = panel.clone();
        server.fn_handler("/api/status", Method::Get, move |req| match panel.get() {
            Some(panel) => write_json(req, &panel.snapshot()),
            None => write_api_error(req, &RelayApiError::NotInitialized),
        })?;
    }

    {
        let ota_busy = ota_busy.clone();
        server.fn_handler("/update", Method::Post, move |mut req| {
            if ota_busy.swap(true, Ordering::AcqRel) {
                return write_error(req, 409, "OTA update already in progress");
            }
            let filter = UploadFilter::from_content_type(req.header("Content-Type"));
            match receive_firmware(&mut req, filter) {
                Ok(result) => {
                    info!(
                        "firmware upload complete: {} bytes, sha256 {}",
                        result.bytes, result.sha256
                    );
                    write_json(req, &result)?;
                    schedule_restart();
                    Ok(())
                }
                Err(err) => {
                    ota_busy.store(false, Ordering::Release);
                    warn!("firmware upload failed: {err:#}");
                    write_error(req, 500, &err.to_string())
                }
            }
        })?;
    }

    server.fn_handler("/api/ota", Method::Post, move |mut req| {
        let target = read_request_body(&mut req).and_then(|body| {
            let request = OtaPullRequest::parse(&body)?;
            let url = request.firmware_url()?;
            Ok((url, request.sha256))
        });
        let (url, expected_sha256) = match target {
            Ok(target) => target,
            Err(err) => return write_error(req, 400, &err.to_string()),
        };

        if ota_busy.swap(true, Ordering::AcqRel) {
            return write_error(req, 409, "OTA update already in progress");
        }
        if let Err(err) = spawn_ota_pull(url.clone(), expected_sha256, ota_busy.clone()) {
            ota_busy.store(false, Ordering::Release);
            return write_error(req, 500, &format!("{err:#}"));
        }
        write_json(
            req,
            &OtaAccepted {
                success: true,
                accepted: true,
                url,
            },
        )
    })?;

    info!("http server started on port {port}");
    Ok(server)
}

fn relay_id(uri: &str) -> Result<u32, RelayApiError> {
    let path = uri.split('?').next().unwrap_or_default();
    let raw = path
        .strip_prefix(RELAY_API_PREFIX)
        .ok_or(RelayApiError::InvalidId)?;
    api::parse_id(raw)
}

fn receive_firmware(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    mut filter: UploadFilter,
) -> anyhow::Result<UploadResult> {
    let content_length = req.content_len().unwrap_or(0);
    if content_length == 0 {
        return Err(anyhow!("No content"));
    }
    if filter.is_multipart() {
        info!("multipart firmware upload, {content_length} bytes");
    }

    let mut ota = EspOta::new().map_err(|err| anyhow!("failed to acquire OTA: {err:?}"))?;
    let mut writer = FirmwareWriter::begin(&mut ota)?;
    let mut received = 0_u64;
    let mut chunk = [0_u8; OTA_CHUNK_SIZE];

    while received < content_length {
        let read = req
            .read(&mut chunk)
            .map_err(|err| anyhow!("receive failed: {err:?}"))?;
        if read == 0 {
            break;
        }
        received = received.saturating_add(read as u64);
        writer.write(&filter.push(&chunk[..read])?)?;
    }
    writer.write(&filter.finish()?)?;

    writer.finish(None)
}

/// Fetches an image over HTTP(S) into the inactive OTA slot.
fn download_firmware(url: &str, expected_sha256: Option<&str>) -> anyhow::Result<UploadResult> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(OTA_DOWNLOAD_TIMEOUT),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(HttpClientConnection::new(&http_conf)?);
    let request = client.request(Method::Get, url, &[])?;
    let mut response = request.submit().map_err(|err| anyhow!("{err:?}"))?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(anyhow!("firmware download failed with HTTP {status}"));
    }
    let content_length = response
        .header("Content-Length")
        .and_then(|value| value.trim().parse::<u64>().ok());

    let mut ota = EspOta::new().map_err(|err| anyhow!("failed to acquire OTA: {err:?}"))?;
    let mut writer = FirmwareWriter::begin(&mut ota)?;
    let mut chunk = [0_u8; OTA_CHUNK_SIZE];
    loop {
        let read = response
            .read(&mut chunk)
            .map_err(|err| anyhow!("download failed: {err:?}"))?;
        if read == 0 {
            break;
        }
        writer.write(&chunk[..read])?;
    }

    if let Some(expected) = content_length.filter(|&expected| expected != writer.written) {
        return Err(anyhow!(
            "incomplete download: {} of {expected} bytes",
            writer.written
        ));
    }
    writer.finish(expected_sha256)
}

fn spawn_ota_pull(
    url: String,
    expected_sha256: Option<String>,
    busy: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("ota-pull".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            info!("starting OTA update from {url}");
            match download_firmware(&url, expected_sha256.as_deref()) {
                Ok(result) => {
                    info!(
                        "OTA download complete: {} bytes, sha256 {}",
                        result.bytes, result.sha256
                    );
                    schedule_restart();
                }
                Err(err) => {
                    warn!("OTA update from {url} failed: {err:#}");
                    busy.store(false, Ordering::Release);
                }
            }
        })
        .context("failed to spawn OTA download thread")?;
    Ok(())
}

/// Streams image bytes into an OTA slot, hashing as it goes. Dropping it
/// before [`FirmwareWriter::finish`] aborts the update.
struct FirmwareWriter<'a> {
    update: EspOtaUpdate<'a>,
    hasher: Sha256,
    written: u64,
}

impl<'a> FirmwareWriter<'a> {
    fn begin(ota: &'a mut EspOta) -> anyhow::Result<Self> {
        let update = ota
            .initiate_update()
            .map_err(|err| anyhow!("failed to initiate OTA update: {err:?}"))?;
        Ok(Self {
            update,
            hasher: Sha256::new(),
            written: 0,
        })
    }

    fn write(&mut self, image: &[u8]) -> anyhow::Result<()> {
        if image.is_empty() {
            return Ok(());
        }
        self.update
            .write(image)
            .map_err(|err| anyhow!("failed writing OTA data: {err:?}"))?;
        self.hasher.update(image);
        self.written = self.written.saturating_add(image.len() as u64);
        Ok(())
    }

    fn finish(self, expected_sha256: Option<&str>) -> anyhow::Result<UploadResult> {
        if self.written == 0 {
            return Err(anyhow!("firmware image is empty"));
        }

        let digest = self.hasher.finalize();
        let mut digest_hex = String::with_capacity(64);
        for byte in digest {
            use core::fmt::Write as _;
            let _ = write!(&mut digest_hex, "{byte:02x}");
        }

        if let Some(expected) = expected_sha256 {
            if !ota::digest_matches(expected, &digest_hex) {
                return Err(anyhow!(
                    "sha256 mismatch (expected {}, got {digest_hex})",
                    expected.trim()
                ));
            }
        }

        self.update
            .complete()
            .map_err(|err| anyhow!("image validation failed: {err:?}"))?;

        Ok(UploadResult {
            success: true,
            bytes: self.written,
            sha256: digest_hex,
        })
    }
}

fn schedule_restart() {
    let spawned = thread::Builder::new()
        .name("ota-restart".into())
        .stack_size(4 * 1024)
        .spawn(|| {
            thread::sleep(Duration::from_millis(1_000));
            unsafe { esp_idf_svc::sys::esp_restart() };
        });
    if let Err(err) = spawned {
        warn!("failed to schedule restart: {err}");
    }
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_api_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    err: &RelayApiError,
) -> anyhow::Result<()> {
    write_error(req, err.status_code(), &err.to_string())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(&ErrorResponse::new(message))?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    if network.wifi_ssid.trim().is_empty() {
        return Err(anyhow!("wifi credentials missing"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        let _ = wifi.stop();
        return Err(err).context("all wifi connect attempts failed");
    }

    if let Ok(ip_info) = wifi.wifi().sta_netif().get_ip_info() {
        info!("relay api at http://{}/api/relay/<id>", ip_info.ip);
    }
    drop(wifi);
    Ok(esp_wifi)
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}
