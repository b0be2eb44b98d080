//! Host runtime. Runs the same boot orchestration and command plane as the
//! device build, with the station radio simulated and the persistent store
//! backed by JSON files. Useful for protocol work against a real broker and
//! backend without flashing hardware.

use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode, Uri},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, net::UdpSocket, sync::oneshot, sync::Notify};
use tracing::{error, info, warn};

use aiot_common::{
    bal::BoardHal,
    board::BoardDescriptor,
    boot::{provisioning_gate, BootDecision, HaltReason, HALT_LOG_INTERVAL_MS},
    broker::{
        bound_payload, validate_topic, BrokerConfig, BrokerStats, QosLevel, SessionState,
        MAX_PAYLOAD_BYTES,
    },
    command::{self, CommandResult},
    config::{format_mac, set_force_config_flag, DeviceIdentity, ServerConfig},
    dns::answer_query,
    drivers::{SimBoard, SoftGpio},
    error::HalError,
    identity::{
        classify_response, LookupDisposition, LookupRequest, LOOKUP_BACKOFF_MS,
        LOOKUP_RETRY_LIMIT, LOOKUP_TIMEOUT_SECS,
    },
    portal::{
        ap_ssid_from_mac, commit_provisioning, current_config, is_portal_host, is_probe_path,
        parse_config_request, PORTAL_HTML, PORTAL_ROOT_URL,
    },
    store::{Store, StoreHandle, StoreMode},
    telemetry::{Heartbeat, SensorReading, TelemetryReport},
    topics,
};

const DEFAULT_MAC: [u8; 6] = [0x24, 0x6F, 0x28, 0xAB, 0xCD, 0xEF];
const PORTAL_DRAIN_MS: u64 = 750;
const DEFAULT_PORTAL_HTTP_PORT: u16 = 8080;
/// Port 53 needs elevated privileges on a workstation.
const DEFAULT_PORTAL_DNS_PORT: u16 = 5353;
const DEFAULT_TELEMETRY_INTERVAL_MS: u64 = 5_000;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;

enum BootOutcome {
    Reboot,
    Halt(HaltReason),
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("firmware starting at {}", chrono::Utc::now().to_rfc3339());

    let store = match init_store() {
        Ok(store) => store,
        Err(reason) => halt_loop(reason),
    };

    // Mirrors holding the boot button on hardware.
    if env_flag("AIOT_FORCE_CONFIG") {
        set_force_config_flag(&store).context("failed to set force_config flag")?;
        info!("force_config flag set from environment");
    }

    let mac = station_mac();
    info!("station mac {}", format_mac(mac));

    // On hardware a reboot restarts the process; here the boot sequence
    // restarts in place.
    loop {
        match boot_once(&store, mac).await? {
            BootOutcome::Reboot => {
                info!("rebooting");
            }
            BootOutcome::Halt(reason) => halt_loop(reason),
        }
    }
}

/// Terminal halt state. Blocking is deliberate; nothing else is scheduled
/// once the boot sequence has given up.
fn halt_loop(reason: HaltReason) -> ! {
    loop {
        error!("{}", reason.log_line());
        thread::sleep(Duration::from_millis(HALT_LOG_INTERVAL_MS));
    }
}

async fn boot_once(store: &FsStore, mac: [u8; 6]) -> anyhow::Result<BootOutcome> {
    match provisioning_gate(store)? {
        BootDecision::Provision(reason) => {
            info!("entering provisioning: {}", reason.as_str());
            run_captive_portal(store, mac).await?;
            Ok(BootOutcome::Reboot)
        }
        BootDecision::Continue {
            credentials,
            server,
        } => {
            let wifi_up = match connect_station(&credentials.ssid) {
                Ok(flag) => flag,
                Err(reason) => return Ok(BootOutcome::Halt(reason)),
            };

            let board = BoardDescriptor::aiot_board_v1();
            let identity = match resolve_identity(&server, &board, mac).await {
                Ok(identity) => identity,
                Err(reason) => return Ok(BootOutcome::Halt(reason)),
            };
            info!(
                "identity resolved: device_id={} device_uuid={}",
                identity.device_id, identity.device_uuid
            );

            run_connected(&server, board, identity, wifi_up).await
        }
    }
}

// ---------------------------------------------------------------------------
// Station (simulated)

fn connect_station(ssid: &str) -> Result<Arc<AtomicBool>, HaltReason> {
    if env_flag("AIOT_WIFI_FAIL") {
        return Err(HaltReason::WifiFailed(format!(
            "simulated association failure for `{ssid}`"
        )));
    }
    info!("station associated with `{ssid}`, ip acquired");
    Ok(Arc::new(AtomicBool::new(true)))
}

fn station_mac() -> [u8; 6] {
    std::env::var("AIOT_MAC")
        .ok()
        .and_then(|value| parse_mac(&value))
        .unwrap_or(DEFAULT_MAC)
}

fn parse_mac(raw: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = raw.split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

// ---------------------------------------------------------------------------
// Captive portal

#[derive(Clone)]
struct PortalContext {
    store: FsStore,
    committed: Arc<Notify>,
}

#[derive(Debug, Serialize)]
struct PortalReply {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn run_captive_portal(store: &FsStore, mac: [u8; 6]) -> anyhow::Result<()> {
    let ap_ssid = ap_ssid_from_mac(mac);
    info!("provisioning access point `{ap_ssid}` (open, channel 1)");

    let dns_port = env_u16("AIOT_PORTAL_DNS_PORT", DEFAULT_PORTAL_DNS_PORT);
    let dns_task = tokio::spawn(dns_hijack_task(dns_port));

    let committed = Arc::new(Notify::new());
    let context = PortalContext {
        store: store.clone(),
        committed: committed.clone(),
    };

    let app = Router::new()
        .route("/", get(portal_index))
        .route("/config/current", get(portal_current))
        .route("/config", post(portal_submit))
        .fallback(portal_fallback)
        .with_state(context);

    let port = env_u16("AIOT_PORTAL_HTTP_PORT", DEFAULT_PORTAL_HTTP_PORT);
    let addr: SocketAddr = format!("0.0.0.0:{port}")
        .parse()
        .context("bad portal listen address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind portal server at {addr}"))?;
    info!("captive portal listening on http://{addr}");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("portal server failed")?;
        }
        _ = committed.notified() => {
            // Let the success response drain before tearing the AP down.
            tokio::time::sleep(Duration::from_millis(PORTAL_DRAIN_MS)).await;
            info!("configuration committed");
        }
    }

    dns_task.abort();
    Ok(())
}

async fn dns_hijack_task(port: u16) {
    let socket = match UdpSocket::bind(("0.0.0.0", port)).await {
        Ok(socket) => socket,
        Err(err) => {
            warn!("dns hijack unavailable on port {port}: {err}");
            return;
        }
    };
    info!("dns hijack answering on udp port {port}");

    let mut buf = [0u8; 512];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                warn!("dns receive error: {err}");
                continue;
            }
        };
        if let Some(response) = answer_query(&buf[..len]) {
            if let Err(err) = socket.send_to(&response, peer).await {
                warn!("dns send error: {err}");
            }
        }
    }
}

async fn portal_index(headers: HeaderMap) -> Response {
    if let Some(redirect) = captive_redirect(&headers) {
        return redirect;
    }
    Html(PORTAL_HTML).into_response()
}

async fn portal_current(State(context): State<PortalContext>) -> impl IntoResponse {
    match current_config(&context.store) {
        Ok(current) => Json(current).into_response(),
        Err(err) => portal_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

async fn portal_submit(
    State(context): State<PortalContext>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());

    let request = match parse_config_request(content_type, &body) {
        Ok(request) => request,
        Err(err) => return portal_error(StatusCode::BAD_REQUEST, &err.message()),
    };

    if let Err(err) = commit_provisioning(&context.store, &request) {
        warn!("provisioning commit failed: {err}");
        return portal_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
    }

    info!(
        "provisioned ssid=`{}` server=`{}`",
        request.ssid, request.server_address
    );
    context.committed.notify_one();

    Json(PortalReply {
        success: true,
        message: Some("configuration saved, device restarting".to_string()),
        error: None,
    })
    .into_response()
}

async fn portal_fallback(headers: HeaderMap, uri: Uri) -> Response {
    if let Some(redirect) = captive_redirect(&headers) {
        return redirect;
    }
    // Connectivity probes and any stray URL both land on the portal form.
    if is_probe_path(uri.path()) {
        info!("redirecting connectivity probe {}", uri.path());
    }
    found("/")
}

/// Captive redirects are plain 302s, never 307/303.
fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

/// A request addressed to a foreign host is bounced to the portal root.
fn captive_redirect(headers: &HeaderMap) -> Option<Response> {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok());
    if is_portal_host(host) {
        None
    } else {
        Some(found(PORTAL_ROOT_URL))
    }
}

fn portal_error(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(PortalReply {
            success: false,
            message: None,
            error: Some(message.to_string()),
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Identity resolution

async fn resolve_identity(
    server: &ServerConfig,
    board: &BoardDescriptor,
    mac: [u8; 6],
) -> Result<DeviceIdentity, HaltReason> {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(LOOKUP_TIMEOUT_SECS))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            return Err(HaltReason::IdentityLookupExhausted(format!(
                "http client construction failed: {err}"
            )));
        }
    };

    let url = server.lookup_url();
    let request = LookupRequest::new(&format_mac(mac), board);
    let mut last_error = String::new();

    for attempt in 1..=LOOKUP_RETRY_LIMIT {
        info!("identity lookup attempt {attempt}/{LOOKUP_RETRY_LIMIT} against {url}");
        match client.post(&url).json(&request).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.bytes().await.unwrap_or_default();
                match classify_response(status, &body, mac) {
                    LookupDisposition::Resolved(identity) => return Ok(identity),
                    LookupDisposition::Terminal(reason) if status == 404 => {
                        warn!("identity lookup terminal: {reason}");
                        return Err(HaltReason::DeviceNotRegistered);
                    }
                    LookupDisposition::Terminal(reason) => {
                        warn!("identity lookup terminal: {reason}");
                        return Err(HaltReason::IdentityLookupExhausted(reason));
                    }
                    LookupDisposition::Retry(reason) => {
                        warn!("identity lookup attempt {attempt} failed: {reason}");
                        last_error = reason;
                    }
                }
            }
            Err(err) => {
                warn!("identity lookup attempt {attempt} transport error: {err}");
                last_error = format!("transport error: {err}");
            }
        }

        if attempt < LOOKUP_RETRY_LIMIT {
            tokio::time::sleep(Duration::from_millis(LOOKUP_BACKOFF_MS)).await;
        }
    }

    Err(HaltReason::IdentityLookupExhausted(last_error))
}

// ---------------------------------------------------------------------------
// Broker session and command plane

#[derive(Clone)]
struct BrokerLink {
    mqtt: AsyncClient,
    wifi_up: Arc<AtomicBool>,
    stats: Arc<Mutex<BrokerStats>>,
}

impl BrokerLink {
    fn check_outbound(&self, topic: &str) -> Result<(), HalError> {
        if !self.wifi_up.load(Ordering::Relaxed) {
            self.record_failure("publish without station ip");
            return Err(HalError::WifiNotConnected(
                "station has no ip address".to_string(),
            ));
        }
        validate_topic(topic)
    }

    fn bound<'a>(&self, topic: &str, payload: &'a [u8]) -> &'a [u8] {
        let (bounded, truncated) = bound_payload(payload);
        if truncated {
            warn!(
                "truncating outbound payload on {} ({} bytes)",
                topic,
                payload.len()
            );
            if let Ok(mut stats) = self.stats.lock() {
                stats.payloads_truncated += 1;
            }
        }
        bounded
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QosLevel,
        retain: bool,
        payload: &[u8],
    ) -> Result<(), HalError> {
        self.check_outbound(topic)?;
        let bounded = self.bound(topic, payload).to_vec();
        match self.mqtt.publish(topic, map_qos(qos), retain, bounded).await {
            Ok(()) => {
                self.record_sent();
                Ok(())
            }
            Err(err) => {
                self.record_failure(err.to_string());
                Err(HalError::TransportError(err.to_string()))
            }
        }
    }

    /// Non-async variant for the board worker thread.
    fn publish_from_worker(
        &self,
        topic: &str,
        qos: QosLevel,
        retain: bool,
        payload: &[u8],
    ) -> Result<(), HalError> {
        self.check_outbound(topic)?;
        let bounded = self.bound(topic, payload).to_vec();
        match self.mqtt.try_publish(topic, map_qos(qos), retain, bounded) {
            Ok(()) => {
                self.record_sent();
                Ok(())
            }
            Err(err) => {
                self.record_failure(err.to_string());
                Err(HalError::TransportError(err.to_string()))
            }
        }
    }

    fn record_sent(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.messages_sent += 1;
        }
    }

    fn record_failure(&self, diagnosis: impl Into<String>) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.record_failure(diagnosis);
        }
    }
}

fn map_qos(qos: QosLevel) -> QoS {
    match qos {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

enum WorkerRequest {
    Dispatch { payload: Vec<u8> },
    ReadSensors { reply: oneshot::Sender<Vec<SensorReading>> },
}

async fn run_connected(
    server: &ServerConfig,
    board: BoardDescriptor,
    identity: DeviceIdentity,
    wifi_up: Arc<AtomicBool>,
) -> anyhow::Result<BootOutcome> {
    let host = std::env::var("AIOT_MQTT_HOST").unwrap_or_else(|_| server.host().to_string());
    let port = env_u16("AIOT_MQTT_PORT", server.mqtt_port);
    let broker_config = BrokerConfig::new(&host, port, &identity.device_id);

    let mut mqtt_options = MqttOptions::new(
        broker_config.client_id.clone(),
        broker_config.host.clone(),
        broker_config.port,
    );
    mqtt_options.set_keep_alive(Duration::from_secs(broker_config.keepalive_secs));
    mqtt_options.set_clean_session(broker_config.clean_session);

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 64);
    let link = BrokerLink {
        mqtt: mqtt.clone(),
        wifi_up,
        stats: Arc::new(Mutex::new(BrokerStats::default())),
    };

    let command_topic = topics::command_topic(&identity.device_uuid);
    let sensor_topic = topics::sensor_topic(&identity.device_uuid);
    let heartbeat_topic = topics::heartbeat_topic(&identity.device_uuid);
    let result_topic = topics::result_topic(&identity.device_uuid);

    let hal = SimBoard::new(board, SoftGpio::new()).context("board bring-up failed")?;
    let worker_tx = spawn_board_worker(hal, link.clone(), result_topic);

    spawn_telemetry_task(link.clone(), worker_tx.clone(), identity.device_id.clone(), sensor_topic);
    spawn_heartbeat_task(link.clone(), heartbeat_topic);

    mqtt.subscribe(command_topic.as_str(), QoS::AtLeastOnce)
        .await
        .context("command topic subscribe failed")?;
    info!(
        "broker session open to {}:{} as `{}`, subscribed to {}",
        broker_config.host, broker_config.port, broker_config.client_id, command_topic
    );

    let mut session = SessionState::Connecting;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                if session == SessionState::Reconnecting {
                    // Clean-session reconnect; subscriptions must be replayed.
                    if let Err(err) = mqtt.try_subscribe(command_topic.as_str(), QoS::AtLeastOnce) {
                        warn!("command topic re-subscribe failed: {err}");
                    }
                    if let Ok(mut stats) = link.stats.lock() {
                        stats.reconnects += 1;
                    }
                }
                session = SessionState::Connected;
                info!("broker connected");
            }
            Ok(Event::Incoming(Incoming::Publish(message))) => {
                if message.payload.len() > MAX_PAYLOAD_BYTES {
                    warn!(
                        "dropping oversized payload on {} ({} bytes)",
                        message.topic,
                        message.payload.len()
                    );
                    link.record_failure("oversized inbound payload");
                    continue;
                }
                if let Ok(mut stats) = link.stats.lock() {
                    stats.messages_received += 1;
                }
                if message.topic == command_topic {
                    if worker_tx
                        .send(WorkerRequest::Dispatch {
                            payload: message.payload.to_vec(),
                        })
                        .is_err()
                    {
                        warn!("board worker is gone; dropping command");
                    }
                } else {
                    warn!("message on unexpected topic {}", message.topic);
                }
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                session = SessionState::Reconnecting;
                warn!("broker sent disconnect");
            }
            Ok(_) => {}
            Err(err) => {
                if session != SessionState::Reconnecting {
                    session = SessionState::Reconnecting;
                    link.record_failure(err.to_string());
                }
                warn!("broker poll error, reconnecting: {err}");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// All BAL calls run on one dedicated thread so relay settling delays and
/// bit-banged sensor timing never stall the broker I/O task, while commands
/// keep their arrival order.
fn spawn_board_worker(
    mut hal: SimBoard<SoftGpio>,
    link: BrokerLink,
    result_topic: String,
) -> std::sync::mpsc::Sender<WorkerRequest> {
    let (tx, rx) = std::sync::mpsc::channel::<WorkerRequest>();

    thread::Builder::new()
        .name("board-worker".into())
        .spawn(move || {
            while let Ok(request) = rx.recv() {
                match request {
                    WorkerRequest::Dispatch { payload } => {
                        dispatch_command(&mut hal, &link, &result_topic, &payload);
                    }
                    WorkerRequest::ReadSensors { reply } => {
                        let _ = reply.send(read_all_sensors(&mut hal));
                    }
                }
            }
        })
        .expect("failed to spawn board worker thread");

    tx
}

fn dispatch_command(
    hal: &mut SimBoard<SoftGpio>,
    link: &BrokerLink,
    result_topic: &str,
    payload: &[u8],
) {
    let command = match command::decode(payload) {
        Ok(command) => command,
        Err(err) => {
            warn!("command rejected: {err}");
            if let Some(result) = CommandResult::from_decode_failure(payload, &err) {
                publish_result(link, result_topic, &result);
            }
            return;
        }
    };

    if let Some(note) = command.clamp_note() {
        warn!("{note}");
    }

    let outcome = command.execute(hal);
    match &outcome {
        Ok(()) => info!("{} {} executed", command.kind(), command.target()),
        Err(err) => warn!("{} {} failed: {err}", command.kind(), command.target()),
    }

    let result = CommandResult::from_outcome(&command, &outcome);
    publish_result(link, result_topic, &result);
}

/// Best effort; a result publish failure never fails the command.
fn publish_result(link: &BrokerLink, result_topic: &str, result: &CommandResult) {
    match serde_json::to_vec(result) {
        Ok(body) => {
            if let Err(err) =
                link.publish_from_worker(result_topic, QosLevel::AtLeastOnce, false, &body)
            {
                warn!("result publish failed: {err}");
            }
        }
        Err(err) => warn!("result serialization failed: {err}"),
    }
}

fn read_all_sensors(hal: &mut SimBoard<SoftGpio>) -> Vec<SensorReading> {
    let now_ms = monotonic_ms();
    let sensors = hal.board_info().sensors.clone();
    let mut readings = Vec::with_capacity(sensors.len());
    for (i, slot) in sensors.iter().enumerate() {
        let index = i + 1;
        match hal.sensor_read(index, now_ms) {
            Ok(value) => readings.push(SensorReading {
                sensor: slot.kind.as_str().to_string(),
                index,
                value,
            }),
            // Partial sensor failure is non-fatal; the reading is skipped.
            Err(err) => warn!("sensor {index} read failed: {err}"),
        }
    }
    readings
}

fn spawn_telemetry_task(
    link: BrokerLink,
    worker_tx: std::sync::mpsc::Sender<WorkerRequest>,
    device_id: String,
    sensor_topic: String,
) {
    let interval_ms = env_u64("AIOT_TELEMETRY_INTERVAL_MS", DEFAULT_TELEMETRY_INTERVAL_MS);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            interval.tick().await;

            let (reply_tx, reply_rx) = oneshot::channel();
            if worker_tx
                .send(WorkerRequest::ReadSensors { reply: reply_tx })
                .is_err()
            {
                warn!("board worker is gone; stopping telemetry");
                return;
            }
            let readings = match reply_rx.await {
                Ok(readings) => readings,
                Err(_) => continue,
            };

            let report = TelemetryReport {
                device_id: device_id.clone(),
                uptime_ms: monotonic_ms(),
                readings,
            };
            match serde_json::to_vec(&report) {
                Ok(body) => {
                    if let Err(err) = link
                        .publish(&sensor_topic, QosLevel::AtLeastOnce, false, &body)
                        .await
                    {
                        warn!("telemetry publish failed: {err}");
                    }
                }
                Err(err) => warn!("telemetry serialization failed: {err}"),
            }
        }
    });
}

fn spawn_heartbeat_task(link: BrokerLink, heartbeat_topic: String) {
    let interval_ms = env_u64("AIOT_HEARTBEAT_INTERVAL_MS", DEFAULT_HEARTBEAT_INTERVAL_MS);
    tokio::spawn(async move {
        let mut heartbeat = Heartbeat::new();
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            interval.tick().await;
            let payload = heartbeat.beat(monotonic_ms());
            match serde_json::to_vec(&payload) {
                Ok(body) => {
                    if let Err(err) = link
                        .publish(&heartbeat_topic, QosLevel::AtLeastOnce, false, &body)
                        .await
                    {
                        warn!("heartbeat publish failed: {err}");
                    }
                }
                Err(err) => warn!("heartbeat serialization failed: {err}"),
            }
        }
    });
}

// ---------------------------------------------------------------------------
// File-backed persistent store

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
enum FileValue {
    Str(String),
    Blob(Vec<u8>),
}

/// `Store` over one JSON file per namespace, standing in for NVS. Commits
/// write to a temp file and rename so a crash never leaves a half-written
/// namespace behind.
#[derive(Clone)]
struct FsStore {
    dir: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl FsStore {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir: Arc::new(dir),
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn from_env() -> Self {
        let dir = std::env::var("AIOT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.aiot"));
        Self::new(dir)
    }

    fn namespace_path(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{namespace}.json"))
    }

    fn load_namespace(&self, namespace: &str) -> Result<HashMap<String, FileValue>, HalError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| HalError::Busy("store lock poisoned".into()))?;
        match std::fs::read(self.namespace_path(namespace)) {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|err| {
                HalError::CorruptConfig(format!("namespace `{namespace}` unreadable: {err}"))
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
            Err(err) => Err(HalError::CorruptConfig(format!(
                "namespace `{namespace}` unreadable: {err}"
            ))),
        }
    }

    fn persist_namespace(
        &self,
        namespace: &str,
        entries: &HashMap<String, FileValue>,
    ) -> Result<(), HalError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| HalError::Busy("store lock poisoned".into()))?;
        std::fs::create_dir_all(self.dir.as_ref())
            .map_err(|err| HalError::TransportError(format!("store dir create failed: {err}")))?;

        let payload = serde_json::to_vec_pretty(entries)
            .map_err(|err| HalError::TransportError(format!("store encode failed: {err}")))?;
        let path = self.namespace_path(namespace);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, payload)
            .map_err(|err| HalError::TransportError(format!("store write failed: {err}")))?;
        std::fs::rename(&tmp, &path)
            .map_err(|err| HalError::TransportError(format!("store rename failed: {err}")))?;
        Ok(())
    }
}

impl Store for FsStore {
    fn open(&self, namespace: &str, mode: StoreMode) -> Result<Box<dyn StoreHandle>, HalError> {
        let entries = self.load_namespace(namespace)?;
        Ok(Box::new(FsHandle {
            store: self.clone(),
            namespace: namespace.to_string(),
            mode,
            entries,
            pending: HashMap::new(),
        }))
    }

    fn wipe(&self) -> Result<(), HalError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| HalError::Busy("store lock poisoned".into()))?;
        match std::fs::read_dir(self.dir.as_ref()) {
            Ok(dir) => {
                for entry in dir.flatten() {
                    let path = entry.path();
                    if path.extension().is_some_and(|ext| ext == "json") {
                        std::fs::remove_file(&path).map_err(|err| {
                            HalError::TransportError(format!("store wipe failed: {err}"))
                        })?;
                    }
                }
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(HalError::TransportError(format!(
                "store wipe failed: {err}"
            ))),
        }
    }
}

struct FsHandle {
    store: FsStore,
    namespace: String,
    mode: StoreMode,
    entries: HashMap<String, FileValue>,
    pending: HashMap<String, Option<FileValue>>,
}

impl FsHandle {
    fn read(&self, key: &str) -> Result<FileValue, HalError> {
        if let Some(pending) = self.pending.get(key) {
            return pending
                .clone()
                .ok_or_else(|| HalError::not_found(format!("key `{key}` erased")));
        }
        self.entries
            .get(key)
            .cloned()
            .ok_or_else(|| HalError::not_found(format!("key `{key}` not set")))
    }

    fn write(&mut self, key: &str, value: Option<FileValue>) -> Result<(), HalError> {
        if self.mode == StoreMode::ReadOnly {
            return Err(HalError::invalid(format!(
                "namespace `{}` opened read-only",
                self.namespace
            )));
        }
        let _ = self.pending.insert(key.to_string(), value);
        Ok(())
    }
}

impl StoreHandle for FsHandle {
    fn get_str(&self, key: &str) -> Result<String, HalError> {
        match self.read(key)? {
            FileValue::Str(value) => Ok(value),
            FileValue::Blob(_) => Err(HalError::invalid(format!("key `{key}` is a blob"))),
        }
    }

    fn get_blob(&self, key: &str) -> Result<Vec<u8>, HalError> {
        match self.read(key)? {
            FileValue::Blob(value) => Ok(value),
            FileValue::Str(_) => Err(HalError::invalid(format!("key `{key}` is a string"))),
        }
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), HalError> {
        self.write(key, Some(FileValue::Str(value.to_string())))
    }

    fn set_blob(&mut self, key: &str, value: &[u8]) -> Result<(), HalError> {
        self.write(key, Some(FileValue::Blob(value.to_vec())))
    }

    fn erase_key(&mut self, key: &str) -> Result<(), HalError> {
        self.write(key, None)
    }

    fn commit(&mut self) -> Result<(), HalError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        for (key, value) in self.pending.drain() {
            match value {
                Some(value) => {
                    let _ = self.entries.insert(key, value);
                }
                None => {
                    let _ = self.entries.remove(&key);
                }
            }
        }
        self.store.persist_namespace(&self.namespace, &self.entries)
    }
}

/// Store bring-up with the one-shot corruption recovery: a corrupt backing
/// file is wiped and the open retried; a second failure halts.
fn init_store() -> Result<FsStore, HaltReason> {
    let store = FsStore::from_env();
    match store.open(aiot_common::config::NS_WIFI, StoreMode::ReadOnly) {
        Ok(_) => Ok(store),
        Err(HalError::CorruptConfig(detail)) => {
            warn!("store corrupt ({detail}); erasing and reformatting");
            if let Err(err) = store.wipe() {
                return Err(HaltReason::StoreCorrupt(err.to_string()));
            }
            match store.open(aiot_common::config::NS_WIFI, StoreMode::ReadOnly) {
                Ok(_) => Ok(store),
                Err(err) => Err(HaltReason::StoreCorrupt(err.to_string())),
            }
        }
        Err(err) => Err(HaltReason::StoreCorrupt(err.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Small helpers

fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|value| value == "1" || value.eq_ignore_ascii_case("true"))
}

fn env_u16(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
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
    use super::*;
    use aiot_common::boot::ProvisionReason;
    use aiot_common::config::{NetworkCredentials, NS_WIFI};
    use pretty_assertions::assert_eq;

    fn scratch_store(tag: &str) -> FsStore {
        let dir = std::env::temp_dir().join(format!(
            "aiot-fsstore-{tag}-{}-{}",
            std::process::id(),
            monotonic_ms()
        ));
        FsStore::new(dir)
    }

    #[test]
    fn mac_parsing() {
        assert_eq!(
            parse_mac("24:6F:28:AB:CD:EF"),
            Some([0x24, 0x6F, 0x28, 0xAB, 0xCD, 0xEF])
        );
        assert_eq!(parse_mac("24:6F:28"), None);
        assert_eq!(parse_mac("zz:6F:28:AB:CD:EF"), None);
        assert_eq!(parse_mac("24:6F:28:AB:CD:EF:01"), None);
    }

    #[test]
    fn foreign_host_is_bounced_to_portal_root() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "connectivitycheck.gstatic.com".parse().unwrap());
        let response = captive_redirect(&headers).unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            PORTAL_ROOT_URL
        );

        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "192.168.4.1".parse().unwrap());
        assert!(captive_redirect(&headers).is_none());
    }

    #[test]
    fn fallback_redirect_is_a_plain_302() {
        let response = found("/");
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get(header::LOCATION).unwrap(), "/");
    }

    #[test]
    fn fs_store_round_trips_credentials() {
        let store = scratch_store("roundtrip");
        let saved = NetworkCredentials {
            ssid: "home".to_string(),
            password: "pw+1".to_string(),
            configured: true,
        };
        saved.save(&store).unwrap();

        // A fresh handle reads what was committed to disk.
        let loaded = NetworkCredentials::load(&store).unwrap();
        assert_eq!(saved, loaded);
        store.wipe().unwrap();
    }

    #[test]
    fn fs_store_pending_writes_need_commit() {
        let store = scratch_store("pending");
        let mut handle = store.open(NS_WIFI, StoreMode::ReadWrite).unwrap();
        handle.set_str("wifi_ssid", "home").unwrap();

        let reader = store.open(NS_WIFI, StoreMode::ReadOnly).unwrap();
        assert!(reader.get_str("wifi_ssid").is_err());

        handle.commit().unwrap();
        let reader = store.open(NS_WIFI, StoreMode::ReadOnly).unwrap();
        assert_eq!(reader.get_str("wifi_ssid").unwrap(), "home");
        store.wipe().unwrap();
    }

    #[test]
    fn corrupt_namespace_reports_and_recovers_by_wipe() {
        let store = scratch_store("corrupt");
        std::fs::create_dir_all(store.dir.as_ref()).unwrap();
        std::fs::write(store.namespace_path(NS_WIFI), b"{not json").unwrap();

        assert!(matches!(
            store.open(NS_WIFI, StoreMode::ReadOnly),
            Err(HalError::CorruptConfig(_))
        ));

        store.wipe().unwrap();
        assert!(store.open(NS_WIFI, StoreMode::ReadOnly).is_ok());
    }

    #[test]
    fn boot_gate_runs_against_fs_store() {
        let store = scratch_store("gate");
        match provisioning_gate(&store).unwrap() {
            BootDecision::Provision(reason) => {
                assert_eq!(reason, ProvisionReason::NotConfigured)
            }
            other => panic!("expected provisioning, got {other:?}"),
        }
        store.wipe().unwrap();
    }
}
