use std::{
    collections::{HashMap, VecDeque},
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::OnceLock,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
};
use tracing::{info, warn};

use irbridge_common::{
    command::{parse_byte_param, parse_with_default},
    nec, ApiRequest, ApiResponse, Bootstrap, BridgeConfig, Clock, CredentialStore,
    CredentialsUpdate, DeviceContext, DeviceIdentity, IrFrame, IrReceiver, IrTransmitter,
    KeyValueStore, LinkError, LinkStatus, NecAddress, NecDecoder, NetworkCredentials,
    NetworkStatus, RawPulses, RelayOutcome, StationLink, StoreError, TransmitError, Transition,
    ValidationError,
};

const INDEX_HTML: &str = include_str!("../web/index.html");
const MAX_HTTP_BODY: usize = 1024;
const CONTROL_TICK_MS: u64 = 10;
const SIMULATED_JOIN_POLLS: u32 = 4;
const SIMULATED_AP_IP: &str = "192.168.71.1";
const DEFAULT_HARDWARE_ID: u64 = 0x24_0A_C4_A1_B2_C3;

const CAPTIVE_PORTAL_PATHS: [&str; 6] = [
    "/generate_204",
    "/gen_204",
    "/hotspot-detect.html",
    "/connecttest.txt",
    "/ncsi.txt",
    "/fwlink",
];

/// Environment knobs standing in for the hardware.
#[derive(Debug, Clone)]
struct HostSettings {
    data_dir: PathBuf,
    http_port: u16,
    force_provisioning: bool,
    hardware_id: u64,
    join_ok: bool,
}

impl HostSettings {
    fn from_env() -> Self {
        Self {
            data_dir: std::env::var("IRBRIDGE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./.irbridge")),
            http_port: std::env::var("IRBRIDGE_HTTP_PORT")
                .ok()
                .and_then(|value| value.parse::<u16>().ok())
                .unwrap_or(8080),
            force_provisioning: env_flag("IRBRIDGE_FORCE_PROVISIONING").unwrap_or(false),
            hardware_id: std::env::var("IRBRIDGE_HARDWARE_ID")
                .ok()
                .and_then(|value| {
                    let hex = value.trim().trim_start_matches("0x").trim_start_matches("0X");
                    u64::from_str_radix(hex, 16).ok()
                })
                .unwrap_or(DEFAULT_HARDWARE_ID),
            join_ok: env_flag("IRBRIDGE_JOIN_OK").unwrap_or(true),
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!("ignoring unrecognised {name}=`{value}`");
            None
        }
    }
}

/// One JSON file per key, replaced through a temp file and rename.
#[derive(Debug, Clone)]
struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match std::fs::read_to_string(self.path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Backend(err.to_string())),
        }
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let backend = |err: std::io::Error| StoreError::Backend(err.to_string());
        std::fs::create_dir_all(&self.dir).map_err(backend)?;
        let path = self.path(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value).map_err(backend)?;
        std::fs::rename(&tmp, &path).map_err(backend)
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        match std::fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Backend(err.to_string())),
        }
    }
}

struct SimulatedLink {
    succeed: bool,
    polls_left: u32,
}

impl StationLink for SimulatedLink {
    fn begin_join(&mut self, credentials: &NetworkCredentials) -> Result<(), LinkError> {
        info!("simulated join to `{}`", credentials.ssid.trim());
        Ok(())
    }

    fn poll(&mut self) -> LinkStatus {
        if self.polls_left > 0 {
            self.polls_left -= 1;
            LinkStatus::Pending
        } else if self.succeed {
            LinkStatus::Connected
        } else {
            LinkStatus::Failed
        }
    }
}

struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn sleep_ms(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// Transceiver stand-in. Every transmit is heard again by the receiver, the
/// way a real LED bleeds into its neighbouring photodiode.
struct SimulatedPort {
    injected: mpsc::UnboundedReceiver<RawPulses>,
    echo: VecDeque<RawPulses>,
    decoder: NecDecoder,
}

impl IrReceiver for SimulatedPort {
    fn poll_frame(&mut self) -> Option<IrFrame> {
        let raw = self
            .echo
            .pop_front()
            .or_else(|| self.injected.try_recv().ok())?;
        Some(self.decoder.decode(raw))
    }

    fn resume(&mut self) {}
}

impl IrTransmitter for SimulatedPort {
    fn send_nec(
        &mut self,
        address: NecAddress,
        command: u8,
        repeats: u8,
    ) -> Result<(), TransmitError> {
        info!(
            "IR TX NEC address=0x{:02X} command=0x{command:02X} repeats={repeats}",
            address.value()
        );
        self.echo
            .push_back(nec::encode(address, command, repeats).into_iter().collect());
        Ok(())
    }

    fn send_raw(&mut self, pulses_us: &[u32]) -> Result<(), TransmitError> {
        info!("IR TX raw {} pulses", pulses_us.len());
        self.echo.push_back(pulses_us.iter().copied().collect());
        Ok(())
    }
}

struct PendingRequest {
    request: ApiRequest,
    reply: oneshot::Sender<ApiResponse>,
}

#[derive(Clone)]
struct AppState {
    requests: mpsc::Sender<PendingRequest>,
    injector: mpsc::UnboundedSender<RawPulses>,
}

#[derive(Debug, Serialize)]
struct InjectReply {
    queued: bool,
    pulses: usize,
}

enum BootExit {
    Reboot,
    Shutdown,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = HostSettings::from_env();
    info!(
        "simulating device {:012X} with data in {}",
        settings.hardware_id,
        settings.data_dir.display()
    );

    loop {
        match boot(&settings).await? {
            BootExit::Reboot => info!("rebooting from persisted state"),
            BootExit::Shutdown => return Ok(()),
        }
    }
}

/// One power cycle: everything is rebuilt from storage and torn down at the
/// end.
async fn boot(settings: &HostSettings) -> anyhow::Result<BootExit> {
    let config = BridgeConfig::default();
    let mut store = CredentialStore::new(FileStore::new(settings.data_dir.clone()));
    let credentials = store.load();
    let identity = DeviceIdentity::derive(settings.hardware_id, &credentials.device_label);

    let bootstrap = Bootstrap::new(&config);
    let override_asserted = settings.force_provisioning;
    let mut link = SimulatedLink {
        succeed: settings.join_ok,
        polls_left: SIMULATED_JOIN_POLLS,
    };
    let join_credentials = credentials.clone();
    let report = tokio::task::spawn_blocking(move || {
        bootstrap.run(override_asserted, &join_credentials, &mut link, &SystemClock)
    })
    .await
    .context("bootstrap task panicked")?;
    info!("bootstrap: {:?}", report.visited);

    let network = match report.provisioning {
        Some(reason) => {
            warn!(
                "provisioning AP `{}` ({})",
                identity.provisioning_ssid(),
                reason.as_str()
            );
            NetworkStatus::provisioning(
                identity.provisioning_ssid(),
                Some(SIMULATED_AP_IP.to_string()),
                reason,
            )
        }
        None => {
            info!(
                "joined `{}`, advertising {}.local",
                credentials.ssid.trim(),
                identity.host_name
            );
            NetworkStatus::station(credentials.ssid.trim(), Some("127.0.0.1".to_string()))
        }
    };
    let provisioning = report.provisioning.is_some();

    let (injector, injected) = mpsc::unbounded_channel();
    let port = SimulatedPort {
        injected,
        echo: VecDeque::new(),
        decoder: NecDecoder::new(),
    };
    let context = DeviceContext::new(
        config,
        settings.hardware_id,
        store,
        network,
        monotonic_ms(),
    );

    let (requests, requests_rx) = mpsc::channel(32);
    let app = router(AppState { requests, injector }, provisioning);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind bridge server at {addr}"))?;
    info!("bridge listening on http://{addr}");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    let exit = tokio::select! {
        exit = control_loop(context, port, requests_rx) => exit,
        _ = tokio::signal::ctrl_c() => BootExit::Shutdown,
    };

    let _ = shutdown_tx.send(());
    server
        .await
        .context("bridge server task panicked")?
        .context("bridge server failed")?;
    Ok(exit)
}

fn router(state: AppState, provisioning: bool) -> Router {
    let mut app = Router::new()
        .route("/", get(handle_index))
        .route("/api/status", get(handle_status))
        .route("/api/send", post(handle_send))
        .route("/api/relay", post(handle_relay))
        .route("/api/wifi", post(handle_set_wifi))
        .route("/api/wifi/forget", post(handle_forget_wifi))
        .route("/api/restart", post(handle_restart))
        .route("/api/simulate/ir", post(handle_simulate_ir));

    if provisioning {
        for path in CAPTIVE_PORTAL_PATHS {
            app = app.route(path, get(handle_index));
        }
    }

    app.layer(DefaultBodyLimit::max(MAX_HTTP_BODY))
        .with_state(state)
}

/// Owns the device context for the whole boot. Runs until a reboot comes due.
async fn control_loop(
    mut context: DeviceContext<FileStore>,
    mut port: SimulatedPort,
    mut requests: mpsc::Receiver<PendingRequest>,
) -> BootExit {
    let mut tick = tokio::time::interval(Duration::from_millis(CONTROL_TICK_MS));
    let mut reboot_at: Option<u64> = None;

    loop {
        tick.tick().await;
        let now_ms = monotonic_ms();

        while let Ok(pending) = requests.try_recv() {
            let handled = context.handle(pending.request, now_ms, &mut port);
            if pending.reply.send(handled.response).is_err() {
                warn!("API caller went away before its reply");
            }
            if let Some(Transition::Reboot { delay_ms }) = handled.transition {
                if reboot_at.is_none() {
                    info!("rebooting in {delay_ms} ms");
                    reboot_at = Some(now_ms + delay_ms);
                }
            }
        }

        match context.poll_ir(&mut port, now_ms) {
            Some(RelayOutcome::Relayed(protocol)) => info!("relayed {} frame", protocol.as_str()),
            Some(RelayOutcome::Failed(err)) => warn!("relay transmit failed: {err}"),
            Some(RelayOutcome::SkippedCooldown) => info!("suppressed echo inside cooldown"),
            Some(_) | None => {}
        }

        if reboot_at.is_some_and(|at| now_ms >= at) {
            return BootExit::Reboot;
        }
    }
}

async fn dispatch(state: &AppState, request: ApiRequest) -> axum::response::Response {
    let (reply, answer) = oneshot::channel();
    let response = if state
        .requests
        .send(PendingRequest { request, reply })
        .await
        .is_err()
    {
        ApiResponse::error(503, "control loop unavailable", None)
    } else {
        answer
            .await
            .unwrap_or_else(|_| ApiResponse::error(503, "control loop dropped the request", None))
    };
    api_response(response)
}

fn api_response(response: ApiResponse) -> axum::response::Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(response.body)).into_response()
}

async fn handle_index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    dispatch(&state, ApiRequest::Status).await
}

async fn handle_send(
    State(state): State<AppState>,
    Query(mut params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let request = ApiRequest::Transmit {
        address: params.remove("address"),
        command: params.remove("command"),
        repeats: params.remove("repeats"),
    };
    dispatch(&state, request).await
}

async fn handle_relay(
    State(state): State<AppState>,
    Query(mut params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let enabled = params.remove("enabled");
    dispatch(&state, ApiRequest::SetRelay { enabled }).await
}

async fn handle_set_wifi(
    State(state): State<AppState>,
    Query(mut params): Query<HashMap<String, String>>,
    body: Bytes,
) -> impl IntoResponse {
    let update = if body.is_empty() {
        CredentialsUpdate::from_params(|key| params.remove(key))
    } else {
        match serde_json::from_slice::<CredentialsUpdate>(&body) {
            Ok(update) => update,
            Err(err) => {
                let message = format!("invalid credentials payload: {err}");
                return api_response(ApiResponse::error(400, message, None));
            }
        }
    };
    dispatch(&state, ApiRequest::SetCredentials(update)).await
}

async fn handle_forget_wifi(State(state): State<AppState>) -> impl IntoResponse {
    dispatch(&state, ApiRequest::ForgetCredentials).await
}

async fn handle_restart(State(state): State<AppState>) -> impl IntoResponse {
    dispatch(&state, ApiRequest::Restart).await
}

/// Feeds a synthetic capture to the simulated receiver: an NEC frame from
/// `address`/`command`, or a repeat burst with `repeat=1`. Giving
/// `address_high` sends an extended address with that second byte.
async fn handle_simulate_ir(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let repeat = params
        .get("repeat")
        .is_some_and(|value| matches!(value.as_str(), "1" | "true" | "on"));

    let raw: RawPulses = if repeat {
        [nec::HEADER_MARK_US, nec::REPEAT_SPACE_US, nec::BIT_MARK_US]
            .into_iter()
            .collect()
    } else {
        match simulated_frame(&params) {
            Ok((address, command)) => nec::encode(address, command, 0).into_iter().collect(),
            Err(err) => {
                return api_response(ApiResponse::error(400, err.to_string(), Some(err.field)))
            }
        }
    };

    let pulses = raw.len();
    if state.injector.send(raw).is_err() {
        return api_response(ApiResponse::error(503, "simulated receiver is gone", None));
    }
    Json(InjectReply {
        queued: true,
        pulses,
    })
    .into_response()
}

fn simulated_frame(params: &HashMap<String, String>) -> Result<(NecAddress, u8), ValidationError> {
    let param = |key: &str| params.get(key).map(String::as_str);
    let low = parse_with_default("address", param("address"), 0x01)?;
    let command = parse_with_default("command", param("command"), 0)?;
    let address = match param("address_high") {
        Some(high) => NecAddress::Extended(u16::from_le_bytes([
            low,
            parse_byte_param("address_high", high)?,
        ])),
        None => NecAddress::Standard(low),
    };
    Ok((address, command))
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

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "irbridge-{name}-{}-{}",
            std::process::id(),
            monotonic_ms()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn file_store_round_trips_and_forgets() {
        let dir = scratch_dir("file-store");
        let mut store = FileStore::new(dir.clone());

        assert_eq!(store.get("net").unwrap(), None);
        store.set("net", "{\"ssid\":\"Home\"}").unwrap();
        assert_eq!(store.get("net").unwrap().as_deref(), Some("{\"ssid\":\"Home\"}"));
        assert!(!dir.join("net.json.tmp").exists());

        store.remove("net").unwrap();
        store.remove("net").unwrap();
        assert_eq!(store.get("net").unwrap(), None);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn credentials_survive_a_simulated_reboot() {
        let dir = scratch_dir("reboot");
        CredentialStore::new(FileStore::new(dir.clone()))
            .save("Home", "x", "den")
            .unwrap();

        let loaded = CredentialStore::new(FileStore::new(dir.clone())).load();
        assert_eq!(loaded.ssid, "Home");
        assert_eq!(loaded.passphrase, "x");
        assert_eq!(loaded.device_label, "den");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn simulated_port_hears_its_own_transmit() {
        let (_injector, injected) = mpsc::unbounded_channel();
        let mut port = SimulatedPort {
            injected,
            echo: VecDeque::new(),
            decoder: NecDecoder::new(),
        };

        port.send_nec(NecAddress::Standard(0x01), 0x1B, 0).unwrap();
        let frame = port.poll_frame().unwrap();
        assert_eq!(
            (frame.address, frame.command),
            (NecAddress::Standard(0x01), 0x1B)
        );
        assert!(port.poll_frame().is_none());
    }

    #[test]
    fn injected_extended_frame_keeps_its_address_bytes() {
        let params: HashMap<String, String> =
            [("address", "5"), ("address_high", "0"), ("command", "0x1B")]
                .into_iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect();
        assert_eq!(
            simulated_frame(&params).unwrap(),
            (NecAddress::Extended(0x0005), 0x1B)
        );

        let mut bad = params.clone();
        bad.insert("address_high".to_string(), "0x100".to_string());
        assert_eq!(simulated_frame(&bad).unwrap_err().field, "address_high");
    }

    #[test]
    fn rejected_join_falls_back_after_scripted_polls() {
        let mut link = SimulatedLink {
            succeed: false,
            polls_left: 2,
        };
        assert_eq!(link.poll(), LinkStatus::Pending);
        assert_eq!(link.poll(), LinkStatus::Pending);
        assert_eq!(link.poll(), LinkStatus::Failed);
    }
}
