use core::convert::TryInto;
use std::{
    sync::{
        mpsc::{self, Receiver, Sender, SyncSender},
        OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyIOPin, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    mdns::EspMdns,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use irbridge_common::{
    credentials::KEY_LABEL, ApiRequest, ApiResponse, BootReport, Bootstrap, BootstrapState,
    BridgeConfig, Clock, CredentialStore, CredentialsUpdate, DeviceContext, DeviceIdentity,
    IrHardwareConfig, JoinOutcome, KeyValueStore, LinkError, LinkStatus, NetworkCredentials,
    NetworkMode, NetworkStatus, RelayOutcome, StationLink, StoreError, Transition,
};

use crate::ir::IrTransceiver;

const NVS_NAMESPACE: &str = "irbridge";
const NVS_VALUE_BUFFER: usize = 512;
const MAX_HTTP_BODY: usize = 1024;
const HTTP_PORT: u16 = 80;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const CONTROL_TICK_MS: u64 = 10;
const REPLY_TIMEOUT_MS: u64 = 5_000;
const OVERRIDE_SETTLE_MS: u64 = 20;

const CAPTIVE_PORTAL_PATHS: [&str; 7] = [
    "/",
    "/generate_204",
    "/gen_204",
    "/hotspot-detect.html",
    "/connecttest.txt",
    "/ncsi.txt",
    "/fwlink",
];

const INDEX_HTML: &str = include_str!("../web/index.html");

type HttpRequest<'r, 'c> = Request<&'r mut EspHttpConnection<'c>>;

/// An API call waiting for the control loop, with the slot for its answer.
struct PendingRequest {
    request: ApiRequest,
    reply: SyncSender<ApiResponse>,
}

struct NvsStore {
    nvs: EspNvs<NvsDefault>,
}

impl NvsStore {
    fn new(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)
            .with_context(|| format!("failed to open NVS namespace `{NVS_NAMESPACE}`"))?;
        Ok(Self { nvs })
    }
}

impl KeyValueStore for NvsStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut buffer = vec![0_u8; NVS_VALUE_BUFFER];
        self.nvs
            .get_str(key, &mut buffer)
            .map(|value| value.map(str::to_string))
            .map_err(|err| StoreError::Backend(err.to_string()))
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.nvs
            .set_str(key, value)
            .map_err(|err| StoreError::Backend(err.to_string()))
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.nvs
            .remove(key)
            .map(|_| ())
            .map_err(|err| StoreError::Backend(err.to_string()))
    }
}

struct WifiLink<'w, 'd> {
    wifi: &'w mut BlockingWifi<&'d mut EspWifi<'static>>,
}

impl StationLink for WifiLink<'_, '_> {
    fn begin_join(&mut self, credentials: &NetworkCredentials) -> Result<(), LinkError> {
        let auth_method = if credentials.passphrase.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        let config = Configuration::Client(ClientConfiguration {
            ssid: credentials
                .ssid
                .trim()
                .try_into()
                .map_err(|_| LinkError::Configuration("wifi ssid too long".to_string()))?,
            password: credentials
                .passphrase
                .as_str()
                .try_into()
                .map_err(|_| LinkError::Configuration("wifi password too long".to_string()))?,
            auth_method,
            ..Default::default()
        });

        let driver = |err: esp_idf_svc::sys::EspError| LinkError::Driver(err.to_string());
        self.wifi.set_configuration(&config).map_err(driver)?;
        self.wifi.start().map_err(driver)?;
        info!("wifi started, connecting to `{}`", credentials.ssid.trim());
        self.wifi.wifi_mut().connect().map_err(driver)
    }

    fn poll(&mut self) -> LinkStatus {
        match (self.wifi.is_connected(), self.wifi.is_up()) {
            (Ok(true), Ok(true)) => LinkStatus::Connected,
            _ => LinkStatus::Pending,
        }
    }
}

struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn sleep_ms(&self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let config = BridgeConfig::default();
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut store = CredentialStore::new(NvsStore::new(nvs_partition.clone())?);
    seed_build_time_credentials(&mut store);
    let credentials = store.load();
    let ir_config = store.load_ir_config().unwrap_or_else(|err| {
        warn!("failed to load IR hardware config from NVS: {err:#}");
        IrHardwareConfig::default()
    });

    let hardware_id = read_hardware_id();
    let identity = DeviceIdentity::derive(hardware_id, &credentials.device_label);
    info!(
        "device {} (label `{}`), stored ssid `{}`",
        identity.hardware_suffix,
        identity.sanitized_label,
        credentials.ssid.trim()
    );

    let override_asserted = read_override_input(ir_config.override_pin);
    if override_asserted {
        warn!("provisioning override held on GPIO{}", ir_config.override_pin);
    }

    let Peripherals { modem, rmt, .. } = Peripherals::take()?;
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let report = Bootstrap::new(&config).run(
        override_asserted,
        &credentials,
        &mut WifiLink { wifi: &mut wifi },
        &SystemClock,
    );
    log_boot_report(&report);

    let network = match report.provisioning {
        Some(reason) => {
            let ap_ssid = identity.provisioning_ssid();
            start_provisioning_ap(&mut wifi, &ap_ssid)?;
            let ip = wifi
                .wifi()
                .ap_netif()
                .get_ip_info()
                .map(|info| info.ip.to_string())
                .ok();
            NetworkStatus::provisioning(ap_ssid, ip, reason)
        }
        None => {
            disable_wifi_power_save();
            let ip = wifi
                .wifi()
                .sta_netif()
                .get_ip_info()
                .map(|info| info.ip.to_string())
                .ok();
            NetworkStatus::station(credentials.ssid.trim(), ip)
        }
    };
    info!(
        "serving in {} mode on `{}` ({})",
        network.mode.as_str(),
        network.ssid,
        network.ip.as_deref().unwrap_or("no ip")
    );

    let _mdns = match network.mode {
        NetworkMode::Station => match start_mdns(&identity.host_name) {
            Ok(mdns) => {
                info!("advertising {}.local", identity.host_name);
                Some(mdns)
            }
            Err(err) => {
                warn!("mDNS unavailable: {err:#}");
                None
            }
        },
        NetworkMode::Provisioning => None,
    };

    let transceiver = IrTransceiver::new(rmt, &ir_config);
    info!(
        "IR tx {} (GPIO{} / RMT{} @ {}kHz), rx {} (GPIO{} / RMT{})",
        if transceiver.tx_ready() { "ready" } else { "disabled" },
        ir_config.tx_pin,
        ir_config.tx_rmt_channel,
        ir_config.carrier_khz,
        if transceiver.rx_ready() { "ready" } else { "disabled" },
        ir_config.rx_pin,
        ir_config.rx_rmt_channel,
    );

    let provisioning = network.mode == NetworkMode::Provisioning;
    let context = DeviceContext::new(config, hardware_id, store, network, monotonic_ms());

    let (requests_tx, requests_rx) = mpsc::channel();
    let _server = create_http_server(requests_tx, provisioning)?;
    info!("HTTP server listening on port {HTTP_PORT}");

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    // Keeps wifi, mDNS and the server alive for the program lifetime.
    run_control_loop(context, transceiver, requests_rx)
}

fn seed_build_time_credentials(store: &mut CredentialStore<NvsStore>) {
    // Only on a factory-fresh namespace, so a later forget still lands in
    // provisioning mode.
    match store.backend().get(KEY_LABEL) {
        Ok(None) => {}
        Ok(Some(_)) => return,
        Err(err) => {
            warn!("failed to check NVS for first boot: {err:#}");
            return;
        }
    }

    let Some(ssid) = option_env!("WIFI_SSID").filter(|ssid| !ssid.trim().is_empty()) else {
        return;
    };
    let pass = option_env!("WIFI_PASS").unwrap_or_default();
    match store.save(ssid, pass, "") {
        Ok(()) => info!("seeded build-time wifi credentials for `{ssid}`"),
        Err(err) => warn!("failed to seed build-time wifi credentials: {err:#}"),
    }
}

fn log_boot_report(report: &BootReport) {
    let states: Vec<&str> = report
        .visited
        .iter()
        .map(|state| match state {
            BootstrapState::ProvisioningMode => "provisioning",
            BootstrapState::ConnectingMode => "connecting",
            BootstrapState::ConnectedMode => "connected",
            BootstrapState::ConnectFailed => "connect-failed",
        })
        .collect();
    info!("bootstrap: {}", states.join(" -> "));

    match &report.join {
        Some(JoinOutcome::Connected { elapsed_ms }) => {
            info!("wifi joined after {elapsed_ms} ms")
        }
        Some(JoinOutcome::Failed(failure)) => {
            warn!("wifi join failed: {failure:?}")
        }
        None => {}
    }
    if let Some(reason) = report.provisioning {
        warn!("entering provisioning mode: {}", reason.as_str());
    }
}

fn run_control_loop(
    mut context: DeviceContext<NvsStore>,
    mut transceiver: IrTransceiver,
    requests: Receiver<PendingRequest>,
) -> anyhow::Result<()> {
    if let Err(err) = add_current_task_to_watchdog() {
        warn!("failed to register control loop with watchdog: {err:#}");
    }

    let mut reboot_scheduled = false;
    loop {
        feed_watchdog();
        let now_ms = monotonic_ms();

        while let Ok(pending) = requests.try_recv() {
            let handled = context.handle(pending.request, now_ms, &mut transceiver);
            if pending.reply.send(handled.response).is_err() {
                warn!("API caller went away before its reply");
            }
            if let Some(Transition::Reboot { delay_ms }) = handled.transition {
                if !reboot_scheduled {
                    reboot_scheduled = true;
                    schedule_reboot(delay_ms);
                }
            }
        }

        match context.poll_ir(&mut transceiver, now_ms) {
            Some(RelayOutcome::Relayed(protocol)) => info!("relayed {} frame", protocol.as_str()),
            Some(RelayOutcome::Failed(err)) => warn!("relay transmit failed: {err}"),
            Some(RelayOutcome::SkippedCooldown) => info!("suppressed echo inside cooldown"),
            Some(_) | None => {}
        }

        thread::sleep(Duration::from_millis(CONTROL_TICK_MS));
    }
}

fn schedule_reboot(delay_ms: u64) {
    info!("rebooting in {delay_ms} ms");
    let spawned = thread::Builder::new()
        .name("reboot".into())
        .spawn(move || {
            thread::sleep(Duration::from_millis(delay_ms));
            unsafe { esp_idf_svc::sys::esp_restart() };
        });
    if let Err(err) = spawned {
        warn!("failed to spawn reboot thread ({err}); restarting now");
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
}

fn create_http_server(
    requests: Sender<PendingRequest>,
    provisioning: bool,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        http_port: HTTP_PORT,
        stack_size: 16 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    let pages: &[&str] = if provisioning {
        &CAPTIVE_PORTAL_PATHS
    } else {
        &CAPTIVE_PORTAL_PATHS[..1]
    };
    for path in pages {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(INDEX_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    {
        let requests = requests.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            write_response(req, dispatch(&requests, ApiRequest::Status))
        })?;
    }

    {
        let requests = requests.clone();
        server.fn_handler("/api/send", Method::Post, move |req| {
            let uri = req.uri().to_string();
            let request = ApiRequest::Transmit {
                address: query_param(&uri, "address"),
                command: query_param(&uri, "command"),
                repeats: query_param(&uri, "repeats"),
            };
            write_response(req, dispatch(&requests, request))
        })?;
    }

    {
        let requests = requests.clone();
        server.fn_handler("/api/relay", Method::Post, move |req| {
            let enabled = query_param(req.uri(), "enabled");
            write_response(req, dispatch(&requests, ApiRequest::SetRelay { enabled }))
        })?;
    }

    {
        let requests = requests.clone();
        server.fn_handler::<anyhow::Error, _>("/api/wifi", Method::Post, move |mut req| {
            let uri = req.uri().to_string();
            let Some(body) = read_request_body(&mut req)? else {
                return write_response(req, ApiResponse::error(413, "request body too large", None));
            };

            let update = if body.is_empty() {
                CredentialsUpdate::from_params(|key| query_param(&uri, key))
            } else {
                match serde_json::from_slice::<CredentialsUpdate>(&body) {
                    Ok(update) => update,
                    Err(err) => {
                        let message = format!("invalid credentials payload: {err}");
                        return write_response(req, ApiResponse::error(400, message, None));
                    }
                }
            };
            write_response(req, dispatch(&requests, ApiRequest::SetCredentials(update)))
        })?;
    }

    {
        let requests = requests.clone();
        server.fn_handler("/api/wifi/forget", Method::Post, move |req| {
            write_response(req, dispatch(&requests, ApiRequest::ForgetCredentials))
        })?;
    }

    server.fn_handler("/api/restart", Method::Post, move |req| {
        write_response(req, dispatch(&requests, ApiRequest::Restart))
    })?;

    Ok(server)
}

fn dispatch(requests: &Sender<PendingRequest>, request: ApiRequest) -> ApiResponse {
    let (reply, answer) = mpsc::sync_channel(1);
    if requests.send(PendingRequest { request, reply }).is_err() {
        return ApiResponse::error(503, "control loop unavailable", None);
    }
    answer
        .recv_timeout(Duration::from_millis(REPLY_TIMEOUT_MS))
        .unwrap_or_else(|_| ApiResponse::error(503, "control loop did not answer", None))
}

/// `Ok(None)` when the declared body exceeds the cap.
fn read_request_body(req: &mut HttpRequest<'_, '_>) -> anyhow::Result<Option<Vec<u8>>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Ok(None);
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)
            .map_err(|err| anyhow!("failed to read request body: {err:?}"))?;
    }
    Ok(Some(body))
}

fn write_response(req: HttpRequest<'_, '_>, response: ApiResponse) -> anyhow::Result<()> {
    let body = serde_json::to_vec(&response.body)?;
    req.into_response(
        response.status,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn query_param(uri: &str, key: &str) -> Option<String> {
    let query = uri.split_once('?')?.1;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        let name = parts.next()?;
        let value = parts.next().unwrap_or_default();
        if name == key {
            return Some(percent_decode(&value.replace('+', " ")));
        }
    }

    None
}

fn percent_decode(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        let escaped = (bytes[index] == b'%')
            .then(|| text.get(index + 1..index + 3))
            .flatten()
            .and_then(|hex| u8::from_str_radix(hex, 16).ok());
        match escaped {
            Some(byte) => {
                decoded.push(byte);
                index += 3;
            }
            None => {
                decoded.push(bytes[index]);
                index += 1;
            }
        }
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

fn start_provisioning_ap(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    ssid: &str,
) -> anyhow::Result<()> {
    let _ = wifi.disconnect();
    let _ = wifi.stop();

    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: ssid
            .try_into()
            .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
        auth_method: AuthMethod::None,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start().context("failed to start provisioning AP")?;
    wifi.wait_netif_up()
        .context("provisioning AP netif did not come up")?;
    info!("provisioning AP `{ssid}` started (open)");
    Ok(())
}

fn start_mdns(host_name: &str) -> anyhow::Result<EspMdns> {
    let mut mdns = EspMdns::take().context("failed to take mDNS responder")?;
    mdns.set_hostname(host_name)?;
    mdns.set_instance_name(host_name)?;
    mdns.add_service(None, "_http", "_tcp", HTTP_PORT, &[])?;
    Ok(mdns)
}

fn read_hardware_id() -> u64 {
    let mut mac = [0_u8; 6];
    let rc = unsafe { esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr()) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to read factory MAC: esp_err_t={rc}");
    }
    mac.iter()
        .fold(0_u64, |id, byte| (id << 8) | u64::from(*byte))
}

/// Active low; sampled once at boot.
fn read_override_input(pin: i32) -> bool {
    let driver = unsafe { PinDriver::input(AnyIOPin::new(pin)) };
    match driver {
        Ok(mut input) => {
            if let Err(err) = input.set_pull(Pull::Up) {
                warn!("failed to enable pull-up on GPIO{pin}: {err}");
            }
            thread::sleep(Duration::from_millis(OVERRIDE_SETTLE_MS));
            input.is_low()
        }
        Err(err) => {
            warn!("override input unavailable on GPIO{pin}: {err}");
            false
        }
    }
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

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
