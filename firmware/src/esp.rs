//! ESP32 runtime: the ordered boot sequence over real peripherals. Station
//! bring-up, the provisioning AP with its DNS hijack, NVS-backed storage,
//! identity lookup over the IDF HTTP client and the MQTT command plane.

use std::{
    collections::HashMap,
    net::UdpSocket,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use dht_sensor::dht11;
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{
        AnyIOPin, AnyInputPin, AnyOutputPin, IOPin, Input, InputOutput, InputPin, Output,
        OutputPin, PinDriver, Pull,
    },
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution, LEDC},
    prelude::*,
};
use esp_idf_svc::{
    eventloop::{EspSubscription, EspSystemEventLoop, System},
    hal::{gpio::Pins, modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    netif::IpEvent,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sys::EspError,
    wifi::{BlockingWifi, EspWifi, WifiEvent},
};
use log::{error, info, warn};
use serde::Serialize;

use aiot_common::{
    bal::{self, BoardHal, LED_ONOFF_THRESHOLD},
    board::{BoardDescriptor, SensorKind},
    boot::{provisioning_gate, BootDecision, HaltReason, HALT_LOG_INTERVAL_MS},
    broker::{
        bound_payload, validate_topic, BrokerStats, DEFAULT_CONNECT_TIMEOUT_SECS,
        DEFAULT_KEEPALIVE_SECS, MAX_PAYLOAD_BYTES,
    },
    command::{self, CommandResult},
    config::{format_mac, set_force_config_flag, DeviceIdentity, NetworkCredentials, ServerConfig},
    dns::{answer_query, DNS_PORT},
    error::HalError,
    identity::{
        classify_response, LookupDisposition, LookupRequest, LOOKUP_BACKOFF_MS,
        LOOKUP_RETRY_LIMIT, LOOKUP_TIMEOUT_SECS,
    },
    portal::{
        ap_ssid_from_mac, commit_provisioning, current_config, is_portal_host,
        parse_config_request, AP_CHANNEL, AP_MAX_STATIONS, PORTAL_HTML, PORTAL_ROOT_URL,
        PROBE_PATHS,
    },
    store::{Store, StoreHandle, StoreMode, StoreValue},
    telemetry::{Heartbeat, SensorCache, SensorReading, TelemetryReport},
    topics,
};

const MAX_HTTP_BODY: usize = 4096;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const RESTART_DRAIN_MS: u64 = 1_000;
const TELEMETRY_INTERVAL_MS: u64 = 5_000;
const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
const FORCE_CONFIG_BUTTON_PIN: i32 = 0;
const STATUS_LED_FAST_BLINK_MS: u64 = 200;
const STATUS_LED_SLOW_BLINK_MS: u64 = 900;
const NVS_VALUE_BUF: usize = 256;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let store = match init_store(nvs_partition.clone()) {
        Ok(store) => store,
        Err(reason) => halt_loop(reason),
    };

    let Peripherals {
        modem, pins, ledc, ..
    } = Peripherals::take()?;

    let (board, button) = build_board(pins, ledc)?;
    check_force_config_button(&store, button);

    let mac = station_mac();
    info!("station mac {}", format_mac(mac));

    match provisioning_gate(&store)? {
        BootDecision::Provision(reason) => {
            info!("entering provisioning: {}", reason.as_str());
            // Never returns; provisioning ends with esp_restart from the
            // POST handler.
            run_captive_portal(store, modem, sys_loop, nvs_partition, mac)
        }
        BootDecision::Continue {
            credentials,
            server,
        } => {
            // Link handlers go in before the station starts; StaDisconnected
            // re-dials, DhcpIpAssigned gates outbound publishes.
            let wifi_connected = Arc::new(AtomicBool::new(false));
            let _wifi_events = match subscribe_wifi_events(&sys_loop, wifi_connected.clone()) {
                Ok(subscription) => subscription,
                Err(err) => halt_loop(HaltReason::WifiFailed(err.to_string())),
            };
            let _ip_events = match subscribe_ip_events(&sys_loop, wifi_connected.clone()) {
                Ok(subscription) => subscription,
                Err(err) => halt_loop(HaltReason::WifiFailed(err.to_string())),
            };

            let wifi = match connect_station(modem, sys_loop, nvs_partition, &credentials) {
                Ok(wifi) => wifi,
                Err(reason) => halt_loop(reason),
            };
            wifi_connected.store(true, Ordering::Relaxed);
            disable_wifi_power_save();

            let identity = match resolve_identity(&server, board.board_info(), mac) {
                Ok(identity) => identity,
                Err(reason) => halt_loop(reason),
            };
            info!(
                "identity resolved: device_id={} device_uuid={}",
                identity.device_id, identity.device_uuid
            );

            run_connected(wifi, board, &server, identity, wifi_connected)
        }
    }
}

/// Terminal halt state. The watchdog is fed so the device stays put
/// instead of panic-rebooting into the same failure.
fn halt_loop(reason: HaltReason) -> ! {
    loop {
        error!("{}", reason.log_line());
        feed_watchdog();
        thread::sleep(Duration::from_millis(HALT_LOG_INTERVAL_MS));
    }
}

// ---------------------------------------------------------------------------
// Board bring-up

enum LedOutput {
    Pwm(LedcDriver<'static>),
    Gpio(PinDriver<'static, AnyOutputPin, Output>),
}

enum SensorInput {
    Dht(PinDriver<'static, AnyIOPin, InputOutput>),
    Rain(PinDriver<'static, AnyInputPin, Input>),
}

/// `BoardHal` over the v1 controller board. LEDC channels and timers are
/// assigned in fixed index order: PWM LEDs, then servos, then the
/// general-purpose PWM slots.
struct EspBoard {
    descriptor: BoardDescriptor,
    leds: Vec<LedOutput>,
    relays: Vec<PinDriver<'static, AnyOutputPin, Output>>,
    servos: Vec<LedcDriver<'static>>,
    pwms: Vec<PwmChannel>,
    sensors: Vec<(SensorInput, SensorCache)>,
}

struct PwmChannel {
    driver: LedcDriver<'static>,
    timer_num: u32,
    frequency_hz: u32,
}

fn build_board(
    pins: Pins,
    ledc: LEDC,
) -> anyhow::Result<(EspBoard, PinDriver<'static, AnyInputPin, Input>)> {
    let descriptor = BoardDescriptor::aiot_board_v1();
    descriptor.validate().map_err(|err| anyhow!("{err}"))?;

    // Timer drivers are leaked: LEDC channels hold them for the program
    // lifetime and the board is never torn down.
    // PWM LEDs: pins 48 and 47, 5 kHz, 8 bit.
    let led_timer = &*Box::leak(Box::new(LedcTimerDriver::new(
        ledc.timer0,
        &TimerConfig::default()
            .frequency(5.kHz().into())
            .resolution(Resolution::Bits8),
    )?));
    let leds = vec![
        LedOutput::Pwm(LedcDriver::new(ledc.channel0, led_timer, pins.gpio48)?),
        LedOutput::Pwm(LedcDriver::new(ledc.channel1, led_timer, pins.gpio47)?),
        LedOutput::Gpio(PinDriver::output(pins.gpio21.downgrade_output())?),
        LedOutput::Gpio(PinDriver::output(pins.gpio14.downgrade_output())?),
    ];

    let relays = vec![
        PinDriver::output(pins.gpio10.downgrade_output())?,
        PinDriver::output(pins.gpio11.downgrade_output())?,
    ];

    // Servos share one 50 Hz / 13 bit timer.
    let servo_timer = &*Box::leak(Box::new(LedcTimerDriver::new(
        ledc.timer1,
        &TimerConfig::default()
            .frequency(50.Hz())
            .resolution(Resolution::Bits13),
    )?));
    let servos = vec![
        LedcDriver::new(ledc.channel2, servo_timer, pins.gpio12)?,
        LedcDriver::new(ledc.channel3, servo_timer, pins.gpio13)?,
    ];

    // General-purpose PWM slots each own a timer so frequency changes stay
    // independent.
    let pwm_timer_a = &*Box::leak(Box::new(LedcTimerDriver::new(
        ledc.timer2,
        &TimerConfig::default()
            .frequency(1.kHz().into())
            .resolution(Resolution::Bits10),
    )?));
    let pwm_timer_b = &*Box::leak(Box::new(LedcTimerDriver::new(
        ledc.timer3,
        &TimerConfig::default()
            .frequency(1.kHz().into())
            .resolution(Resolution::Bits10),
    )?));
    let pwms = vec![
        PwmChannel {
            driver: LedcDriver::new(ledc.channel4, pwm_timer_a, pins.gpio4)?,
            timer_num: 2,
            frequency_hz: 1_000,
        },
        PwmChannel {
            driver: LedcDriver::new(ledc.channel5, pwm_timer_b, pins.gpio5)?,
            timer_num: 3,
            frequency_hz: 1_000,
        },
    ];

    let mut dht_pin = PinDriver::input_output_od(pins.gpio6.downgrade())?;
    dht_pin.set_pull(Pull::Up)?;
    dht_pin.set_high()?;
    let rain_pin = PinDriver::input(pins.gpio7.downgrade_input())?;

    let sensors = descriptor
        .sensors
        .iter()
        .map(|slot| SensorCache::new(slot.kind.min_period_ms()))
        .zip([SensorInput::Dht(dht_pin), SensorInput::Rain(rain_pin)])
        .map(|(cache, input)| (input, cache))
        .collect();

    let mut button = PinDriver::input(pins.gpio0.downgrade_input())?;
    button.set_pull(Pull::Up)?;

    Ok((
        EspBoard {
            descriptor,
            leds,
            relays,
            servos,
            pwms,
            sensors,
        },
        button,
    ))
}

/// Boot button held low at power-up forces provisioning on this boot.
fn check_force_config_button(store: &NvsStore, button: PinDriver<'static, AnyInputPin, Input>) {
    if button.is_low() {
        info!("boot button held on GPIO{FORCE_CONFIG_BUTTON_PIN}; forcing provisioning");
        if let Err(err) = set_force_config_flag(store) {
            warn!("failed to persist force_config flag: {err}");
        }
    }
}

impl EspBoard {
    fn drive_led(&mut self, i: usize, duty_fraction: Option<u32>, on: bool) -> Result<(), HalError> {
        let slot = self.descriptor.leds[i].clone();
        match &mut self.leds[i] {
            LedOutput::Pwm(driver) => {
                let full = driver.get_max_duty();
                let logical = duty_fraction
                    .unwrap_or(if on { full } else { 0 })
                    .min(full);
                let duty = if slot.active_high { logical } else { full - logical };
                driver
                    .set_duty(duty)
                    .map_err(|err| HalError::TransportError(format!("ledc set_duty: {err}")))
            }
            LedOutput::Gpio(pin) => {
                let level = on == slot.active_high;
                let result = if level { pin.set_high() } else { pin.set_low() };
                result.map_err(|err| HalError::TransportError(format!("gpio set: {err}")))
            }
        }
    }
}

impl BoardHal for EspBoard {
    fn led_control(&mut self, index: usize, on: bool) -> Result<(), HalError> {
        let i = bal::slot_index(index, self.descriptor.leds.len(), "led")?;
        self.drive_led(i, None, on)
    }

    fn led_brightness(&mut self, index: usize, level: u8) -> Result<(), HalError> {
        let i = bal::slot_index(index, self.descriptor.leds.len(), "led")?;
        let slot = self.descriptor.leds[i].clone();
        if slot.pwm_enabled {
            let duty = bal::led_duty(level, slot.pwm_resolution_bits);
            self.drive_led(i, Some(duty), level > 0)
        } else {
            // Threshold fallback for on/off LEDs.
            self.drive_led(i, None, level >= LED_ONOFF_THRESHOLD)
        }
    }

    fn relay_control(&mut self, index: usize, on: bool) -> Result<(), HalError> {
        let i = bal::slot_index(index, self.descriptor.relays.len(), "relay")?;
        let slot = self.descriptor.relays[i].clone();
        let level = on == slot.active_high;
        let result = if level {
            self.relays[i].set_high()
        } else {
            self.relays[i].set_low()
        };
        result.map_err(|err| HalError::TransportError(format!("relay gpio set: {err}")))?;
        // Let the contacts settle before the caller observes completion.
        thread::sleep(Duration::from_millis(slot.switch_delay_ms));
        Ok(())
    }

    fn servo_set_angle(&mut self, index: usize, angle: f32) -> Result<(), HalError> {
        let i = bal::slot_index(index, self.descriptor.servos.len(), "servo")?;
        if !angle.is_finite() || angle < 0.0 {
            return Err(HalError::invalid(format!("servo angle {angle} invalid")));
        }
        let slot = self.descriptor.servos[i].clone();
        let pulse_us = bal::servo_pulse_us(&slot, angle);
        let duty = bal::servo_duty(pulse_us, slot.pwm_frequency_hz);
        self.servos[i]
            .set_duty(duty)
            .map_err(|err| HalError::TransportError(format!("servo set_duty: {err}")))
    }

    fn pwm_set(
        &mut self,
        channel: usize,
        frequency_hz: u32,
        duty_pct: f32,
    ) -> Result<(), HalError> {
        let i = bal::slot_index(channel, self.descriptor.pwms.len(), "pwm channel")?;
        bal::validate_pwm(frequency_hz, duty_pct)?;

        let slot = &mut self.pwms[i];
        if slot.frequency_hz != frequency_hz {
            let rc = unsafe {
                esp_idf_svc::sys::ledc_set_freq(
                    esp_idf_svc::sys::ledc_mode_t_LEDC_LOW_SPEED_MODE,
                    slot.timer_num,
                    frequency_hz,
                )
            };
            if rc != esp_idf_svc::sys::ESP_OK {
                return Err(HalError::TransportError(format!(
                    "ledc_set_freq failed: esp_err_t={rc}"
                )));
            }
            slot.frequency_hz = frequency_hz;
        }

        let full = slot.driver.get_max_duty();
        let duty = ((duty_pct as f64 / 100.0) * full as f64).round() as u32;
        slot.driver
            .set_duty(duty.min(full))
            .map_err(|err| HalError::TransportError(format!("pwm set_duty: {err}")))
    }

    fn sensor_read(&mut self, id: usize, now_ms: u64) -> Result<f32, HalError> {
        let i = bal::slot_index(id, self.descriptor.sensors.len(), "sensor")?;
        let kind = self.descriptor.sensors[i].kind;
        let (input, cache) = &mut self.sensors[i];
        cache.read_through(now_ms, || sample_sensor(kind, input))
    }

    fn board_info(&self) -> &BoardDescriptor {
        &self.descriptor
    }
}

fn sample_sensor(kind: SensorKind, input: &mut SensorInput) -> Result<f32, HalError> {
    match (kind, input) {
        (SensorKind::TemperatureHumidity, SensorInput::Dht(pin)) => {
            pin.set_high()
                .map_err(|err| HalError::TransportError(format!("dht line: {err}")))?;
            let mut delay = Ets;
            match dht11::blocking::read(&mut delay, pin) {
                Ok(reading) => Ok(reading.temperature as f32),
                Err(err) => Err(HalError::Timeout(format!("dht read failed: {err:?}"))),
            }
        }
        // The rain sensor pulls its line low when wet.
        (SensorKind::Rain, SensorInput::Rain(pin)) => {
            Ok(if pin.is_low() { 100.0 } else { 0.0 })
        }
        _ => Err(HalError::NotSupported(format!(
            "sensor kind {} has no input wired",
            kind.as_str()
        ))),
    }
}

// ---------------------------------------------------------------------------
// NVS-backed persistent store

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

impl NvsStore {
    fn new(partition: EspDefaultNvsPartition) -> Self {
        Self {
            partition,
            lock: Arc::new(Mutex::new(())),
        }
    }
}

impl Store for NvsStore {
    fn open(&self, namespace: &str, mode: StoreMode) -> Result<Box<dyn StoreHandle>, HalError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| HalError::Busy("nvs lock poisoned".into()))?;
        let nvs = EspNvs::new(
            self.partition.clone(),
            namespace,
            mode == StoreMode::ReadWrite,
        )
        .map_err(|err| HalError::CorruptConfig(format!("nvs open `{namespace}`: {err}")))?;
        Ok(Box::new(NvsHandle {
            nvs,
            mode,
            pending: HashMap::new(),
        }))
    }

    fn wipe(&self) -> Result<(), HalError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| HalError::Busy("nvs lock poisoned".into()))?;
        let rc = unsafe { esp_idf_svc::sys::nvs_flash_erase() };
        if rc != esp_idf_svc::sys::ESP_OK {
            return Err(HalError::CorruptConfig(format!(
                "nvs_flash_erase failed: esp_err_t={rc}"
            )));
        }
        let rc = unsafe { esp_idf_svc::sys::nvs_flash_init() };
        if rc != esp_idf_svc::sys::ESP_OK {
            return Err(HalError::CorruptConfig(format!(
                "nvs_flash_init failed: esp_err_t={rc}"
            )));
        }
        Ok(())
    }
}

struct NvsHandle {
    nvs: EspNvs<NvsDefault>,
    mode: StoreMode,
    pending: HashMap<String, Option<StoreValue>>,
}

impl NvsHandle {
    fn write(&mut self, key: &str, value: Option<StoreValue>) -> Result<(), HalError> {
        if self.mode == StoreMode::ReadOnly {
            return Err(HalError::invalid("namespace opened read-only"));
        }
        let _ = self.pending.insert(key.to_string(), value);
        Ok(())
    }
}

impl StoreHandle for NvsHandle {
    fn get_str(&self, key: &str) -> Result<String, HalError> {
        if let Some(pending) = self.pending.get(key) {
            return match pending {
                Some(StoreValue::Str(value)) => Ok(value.clone()),
                Some(StoreValue::Blob(_)) => {
                    Err(HalError::invalid(format!("key `{key}` is a blob")))
                }
                None => Err(HalError::not_found(format!("key `{key}` erased"))),
            };
        }
        let mut buf = vec![0_u8; NVS_VALUE_BUF];
        match self.nvs.get_str(key, &mut buf) {
            Ok(Some(value)) => Ok(value.to_string()),
            Ok(None) => Err(HalError::not_found(format!("key `{key}` not set"))),
            Err(err) => Err(HalError::CorruptConfig(format!("nvs get_str: {err}"))),
        }
    }

    fn get_blob(&self, key: &str) -> Result<Vec<u8>, HalError> {
        if let Some(pending) = self.pending.get(key) {
            return match pending {
                Some(StoreValue::Blob(value)) => Ok(value.clone()),
                Some(StoreValue::Str(_)) => {
                    Err(HalError::invalid(format!("key `{key}` is a string")))
                }
                None => Err(HalError::not_found(format!("key `{key}` erased"))),
            };
        }
        let mut buf = vec![0_u8; NVS_VALUE_BUF];
        match self.nvs.get_blob(key, &mut buf) {
            Ok(Some(value)) => Ok(value.to_vec()),
            Ok(None) => Err(HalError::not_found(format!("key `{key}` not set"))),
            Err(err) => Err(HalError::CorruptConfig(format!("nvs get_blob: {err}"))),
        }
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), HalError> {
        self.write(key, Some(StoreValue::Str(value.to_string())))
    }

    fn set_blob(&mut self, key: &str, value: &[u8]) -> Result<(), HalError> {
        self.write(key, Some(StoreValue::Blob(value.to_vec())))
    }

    fn erase_key(&mut self, key: &str) -> Result<(), HalError> {
        self.write(key, None)
    }

    fn commit(&mut self) -> Result<(), HalError> {
        for (key, value) in self.pending.drain() {
            let result = match value {
                Some(StoreValue::Str(value)) => self.nvs.set_str(&key, &value),
                Some(StoreValue::Blob(value)) => self.nvs.set_blob(&key, &value),
                None => self.nvs.remove(&key).map(|_| ()),
            };
            result.map_err(|err| HalError::CorruptConfig(format!("nvs commit `{key}`: {err}")))?;
        }
        Ok(())
    }
}

/// Store bring-up with the one-shot corruption recovery.
fn init_store(partition: EspDefaultNvsPartition) -> Result<NvsStore, HaltReason> {
    let store = NvsStore::new(partition);
    match store.open(aiot_common::config::NS_WIFI, StoreMode::ReadOnly) {
        Ok(_) => Ok(store),
        Err(HalError::CorruptConfig(detail)) => {
            warn!("nvs corrupt ({detail}); erasing and reformatting");
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
// Captive portal

fn run_captive_portal(
    store: NvsStore,
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    mac: [u8; 6],
) -> ! {
    let result = (|| -> anyhow::Result<()> {
        let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
        let ap_ssid = ap_ssid_from_mac(mac);

        {
            let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;
            wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
                ssid: ap_ssid
                    .as_str()
                    .try_into()
                    .map_err(|_| anyhow!("AP ssid too long"))?,
                auth_method: AuthMethod::None,
                channel: AP_CHANNEL,
                max_connections: AP_MAX_STATIONS as u16,
                ..Default::default()
            }))?;
            wifi.start()?;
            wifi.wait_netif_up()?;
        }
        info!("provisioning AP `{ap_ssid}` up (open, channel {AP_CHANNEL})");

        spawn_dns_hijack();
        let server = create_portal_http_server(store)?;

        // Keep the AP and server alive; the POST handler restarts the chip.
        let _wifi = esp_wifi;
        let _server = server;
        loop {
            feed_watchdog();
            thread::sleep(Duration::from_secs(5));
        }
    })();

    match result {
        // The closure only exits by error; the success path loops forever.
        Ok(()) => unreachable!("portal loop returned"),
        Err(err) => {
            error!("captive portal failed: {err:#}; restarting");
            restart_after(RESTART_DRAIN_MS);
        }
    }
}

fn spawn_dns_hijack() {
    thread::Builder::new()
        .name("dns-hijack".into())
        .stack_size(8 * 1024)
        .spawn(|| {
            let socket = match UdpSocket::bind(("0.0.0.0", DNS_PORT)) {
                Ok(socket) => socket,
                Err(err) => {
                    warn!("dns hijack bind failed: {err}");
                    return;
                }
            };
            info!("dns hijack answering on udp port {DNS_PORT}");
            let mut buf = [0u8; 512];
            loop {
                match socket.recv_from(&mut buf) {
                    Ok((len, peer)) => {
                        if let Some(response) = answer_query(&buf[..len]) {
                            if let Err(err) = socket.send_to(&response, peer) {
                                warn!("dns send error: {err}");
                            }
                        }
                    }
                    Err(err) => warn!("dns receive error: {err}"),
                }
            }
        })
        .expect("failed to spawn dns hijack thread");
}

fn create_portal_http_server(store: NvsStore) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, |req| {
        if !is_portal_host(req.header("Host")) {
            req.into_response(302, Some("Found"), &[("Location", PORTAL_ROOT_URL)])?;
            return Ok(());
        }
        req.into_ok_response()?.write_all(PORTAL_HTML.as_bytes())?;
        Ok(())
    })?;

    // OS connectivity probes are redirected so clients pop the portal.
    for path in PROBE_PATHS {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_response(302, Some("Found"), &[("Location", PORTAL_ROOT_URL)])?;
            Ok(())
        })?;
    }

    {
        let store = store.clone();
        server.fn_handler::<anyhow::Error, _>("/config/current", Method::Get, move |req| {
            match current_config(&store) {
                Ok(current) => write_json(req, &current),
                Err(err) => write_error(req, 500, &err.to_string()),
            }
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/config", Method::Post, move |mut req| {
        let content_type = req.header("Content-Type").map(str::to_string);
        let body = read_request_body(&mut req)?;

        let request = match parse_config_request(content_type.as_deref(), &body) {
            Ok(request) => request,
            Err(err) => return write_error(req, 400, &err.message()),
        };

        if let Err(err) = commit_provisioning(&store, &request) {
            warn!("provisioning commit failed: {err}");
            return write_error(req, 500, &err.to_string());
        }

        info!(
            "provisioned ssid=`{}` server=`{}`; restarting",
            request.ssid, request.server_address
        );
        thread::Builder::new()
            .name("prov-restart".into())
            .spawn(|| restart_after(RESTART_DRAIN_MS))
            .expect("failed to spawn restart thread");

        write_json(
            req,
            &serde_json::json!({
                "success": true,
                "message": "configuration saved, device restarting",
            }),
        )
    })?;

    // Catch-all, registered last: foreign hosts and stray paths both land
    // on the portal root.
    server.fn_handler::<anyhow::Error, _>("/*", Method::Get, |req| {
        req.into_response(302, Some("Found"), &[("Location", PORTAL_ROOT_URL)])?;
        Ok(())
    })?;

    Ok(server)
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

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "success": false, "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn restart_after(drain_ms: u64) -> ! {
    thread::sleep(Duration::from_millis(drain_ms));
    unsafe { esp_idf_svc::sys::esp_restart() };
    unreachable!("esp_restart returned")
}

// ---------------------------------------------------------------------------
// Station

fn connect_station(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    credentials: &NetworkCredentials,
) -> Result<EspWifi<'static>, HaltReason> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))
        .map_err(|err| HaltReason::WifiFailed(err.to_string()))?;

    {
        let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)
            .map_err(|err| HaltReason::WifiFailed(err.to_string()))?;

        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: credentials
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| HaltReason::WifiFailed("ssid too long".to_string()))?,
            password: credentials
                .password
                .as_str()
                .try_into()
                .map_err(|_| HaltReason::WifiFailed("password too long".to_string()))?,
            // Open scan threshold: any encryption level the AP offers is
            // accepted; the stored password still drives the handshake.
            auth_method: AuthMethod::None,
            ..Default::default()
        }))
        .map_err(|err| HaltReason::WifiFailed(err.to_string()))?;

        wifi.start()
            .map_err(|err| HaltReason::WifiFailed(err.to_string()))?;
        info!("wifi started, connecting to `{}`", credentials.ssid);

        let mut last_err = None;
        for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
            info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
            match wifi.connect() {
                Ok(()) => match wifi.wait_netif_up() {
                    Ok(()) => {
                        info!("wifi connected and netif up on attempt {attempt}");
                        last_err = None;
                        break;
                    }
                    Err(err) => {
                        warn!("wifi netif up failed on attempt {attempt}: {err:#}");
                        last_err = Some(err);
                    }
                },
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
            // Stop the radio so no disconnect event re-dials out of the
            // terminal halt.
            let _ = wifi.stop();
            return Err(HaltReason::WifiFailed(format!(
                "all {WIFI_CONNECT_ATTEMPTS} attempts failed: {err}"
            )));
        }
    }

    Ok(esp_wifi)
}

/// The sole reconnect mechanism: a dropped association re-invokes connect
/// from the event handler, no polling task.
fn subscribe_wifi_events(
    sys_loop: &EspSystemEventLoop,
    wifi_connected: Arc<AtomicBool>,
) -> Result<EspSubscription<'static, System>, EspError> {
    sys_loop.subscribe::<WifiEvent, _>(move |event| {
        if let WifiEvent::StaDisconnected(_) = event {
            wifi_connected.store(false, Ordering::Relaxed);
            warn!("wifi station disconnected; re-dialing");
            let rc = unsafe { esp_idf_svc::sys::esp_wifi_connect() };
            if rc != esp_idf_svc::sys::ESP_OK {
                warn!("esp_wifi_connect failed: esp_err_t={rc}");
            }
        }
    })
}

fn subscribe_ip_events(
    sys_loop: &EspSystemEventLoop,
    wifi_connected: Arc<AtomicBool>,
) -> Result<EspSubscription<'static, System>, EspError> {
    sys_loop.subscribe::<IpEvent, _>(move |event| {
        if let IpEvent::DhcpIpAssigned(_) = event {
            wifi_connected.store(true, Ordering::Relaxed);
            info!("station ip acquired");
        }
    })
}

// ---------------------------------------------------------------------------
// Identity resolution

fn resolve_identity(
    server: &ServerConfig,
    board: &BoardDescriptor,
    mac: [u8; 6],
) -> Result<DeviceIdentity, HaltReason> {
    let url = server.lookup_url();
    let request = LookupRequest::new(&format_mac(mac), board);
    let body = serde_json::to_vec(&request)
        .map_err(|err| HaltReason::IdentityLookupExhausted(err.to_string()))?;

    let mut last_error = String::new();
    for attempt in 1..=LOOKUP_RETRY_LIMIT {
        info!("identity lookup attempt {attempt}/{LOOKUP_RETRY_LIMIT} against {url}");
        match lookup_once(&url, &body) {
            Ok((status, response_body)) => {
                match classify_response(status, &response_body, mac) {
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
                warn!("identity lookup attempt {attempt} transport error: {err:#}");
                last_error = format!("transport error: {err}");
            }
        }

        if attempt < LOOKUP_RETRY_LIMIT {
            feed_watchdog();
            thread::sleep(Duration::from_millis(LOOKUP_BACKOFF_MS));
        }
    }

    Err(HaltReason::IdentityLookupExhausted(last_error))
}

fn lookup_once(url: &str, body: &[u8]) -> anyhow::Result<(u16, Vec<u8>)> {
    let connection = EspHttpConnection::new(&HttpClientConfiguration {
        timeout: Some(Duration::from_secs(LOOKUP_TIMEOUT_SECS)),
        ..Default::default()
    })?;
    let mut client = HttpClient::wrap(connection);

    let content_length = body.len().to_string();
    let headers = [
        ("Content-Type", "application/json"),
        ("Content-Length", content_length.as_str()),
    ];
    let mut request = client.post(url, &headers)?;
    request.write_all(body)?;
    let mut response = request.submit()?;
    let status = response.status();

    let mut response_body = Vec::new();
    let mut buf = [0_u8; 512];
    loop {
        let read = response.read(&mut buf)?;
        if read == 0 {
            break;
        }
        response_body.extend_from_slice(&buf[..read]);
        if response_body.len() > MAX_HTTP_BODY {
            break;
        }
    }

    Ok((status, response_body))
}

// ---------------------------------------------------------------------------
// Broker session and command plane

enum WorkerRequest {
    Dispatch { payload: Vec<u8> },
    ReadSensors { reply: mpsc::Sender<Vec<SensorReading>> },
    StatusLed { wifi: bool, mqtt: bool, now_ms: u64 },
}

struct BrokerShared {
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
    wifi_connected: Arc<AtomicBool>,
    stats: Arc<Mutex<BrokerStats>>,
}

impl BrokerShared {
    fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: &[u8],
    ) -> Result<(), HalError> {
        if !self.wifi_connected.load(Ordering::Relaxed) {
            if let Ok(mut stats) = self.stats.lock() {
                stats.record_failure("publish without station ip");
            }
            return Err(HalError::WifiNotConnected(
                "station has no ip address".to_string(),
            ));
        }
        validate_topic(topic)?;

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

        let mut mqtt = self
            .mqtt
            .lock()
            .map_err(|_| HalError::Busy("mqtt lock poisoned".into()))?;
        match mqtt.publish(topic, qos, retain, bounded) {
            Ok(_) => {
                drop(mqtt);
                if let Ok(mut stats) = self.stats.lock() {
                    stats.messages_sent += 1;
                }
                Ok(())
            }
            Err(err) => {
                drop(mqtt);
                if let Ok(mut stats) = self.stats.lock() {
                    stats.record_failure(err.to_string());
                }
                Err(HalError::TransportError(err.to_string()))
            }
        }
    }
}

fn run_connected(
    wifi: EspWifi<'static>,
    board: EspBoard,
    server: &ServerConfig,
    identity: DeviceIdentity,
    wifi_connected: Arc<AtomicBool>,
) -> ! {
    let result = (|| -> anyhow::Result<()> {
        let command_topic = topics::command_topic(&identity.device_uuid);
        let sensor_topic = topics::sensor_topic(&identity.device_uuid);
        let heartbeat_topic = topics::heartbeat_topic(&identity.device_uuid);
        let result_topic = topics::result_topic(&identity.device_uuid);

        let mqtt_connected = Arc::new(AtomicBool::new(false));

        let url = format!("mqtt://{}:{}", server.host(), server.mqtt_port);
        let conf = MqttClientConfiguration {
            client_id: Some(identity.device_id.as_str()),
            keep_alive_interval: Some(Duration::from_secs(DEFAULT_KEEPALIVE_SECS)),
            network_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            disable_clean_session: false,
            ..Default::default()
        };
        let (mqtt_client, mqtt_conn) = EspMqttClient::new(url.as_str(), &conf)?;
        let mqtt_client = Arc::new(Mutex::new(mqtt_client));

        let shared = Arc::new(BrokerShared {
            mqtt: mqtt_client.clone(),
            wifi_connected: wifi_connected.clone(),
            stats: Arc::new(Mutex::new(BrokerStats::default())),
        });

        subscribe_command_topic(&mqtt_client, &command_topic)?;
        info!("broker session open to {url}, subscribed to {command_topic}");

        let worker_tx = spawn_board_worker(board, shared.clone(), result_topic);
        spawn_mqtt_receiver(
            mqtt_conn,
            mqtt_client.clone(),
            mqtt_connected.clone(),
            shared.clone(),
            worker_tx.clone(),
            command_topic,
        );
        spawn_telemetry_thread(
            shared.clone(),
            worker_tx.clone(),
            identity.device_id.clone(),
            sensor_topic,
        );
        spawn_heartbeat_thread(shared, heartbeat_topic);

        add_current_task_to_watchdog()?;

        // Keep the station alive for the program lifetime.
        let _wifi = wifi;
        loop {
            feed_watchdog();
            let _ = worker_tx.send(WorkerRequest::StatusLed {
                wifi: wifi_connected.load(Ordering::Relaxed),
                mqtt: mqtt_connected.load(Ordering::Relaxed),
                now_ms: monotonic_ms(),
            });
            thread::sleep(Duration::from_millis(500));
        }
    })();

    match result {
        Ok(()) => unreachable!("connected loop returned"),
        Err(err) => {
            error!("command plane failed: {err:#}; restarting");
            restart_after(RESTART_DRAIN_MS);
        }
    }
}

fn subscribe_command_topic(
    mqtt: &Arc<Mutex<EspMqttClient<'static>>>,
    topic: &str,
) -> anyhow::Result<()> {
    let mut mqtt = mqtt
        .lock()
        .map_err(|_| anyhow!("mqtt lock poisoned"))?;
    mqtt.subscribe(topic, QoS::AtLeastOnce)?;
    Ok(())
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
    mqtt_connected: Arc<AtomicBool>,
    shared: Arc<BrokerShared>,
    worker_tx: mpsc::Sender<WorkerRequest>,
    command_topic: String,
) {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => {
                    mqtt_connected.store(true, Ordering::Relaxed);

                    if let EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } = event.payload()
                    {
                        // Only full payloads are processed.
                        if !matches!(details, Details::Complete) {
                            continue;
                        }

                        if data.len() > MAX_PAYLOAD_BYTES {
                            warn!(
                                "dropping oversized payload on topic {} ({} bytes)",
                                topic,
                                data.len()
                            );
                            if let Ok(mut stats) = shared.stats.lock() {
                                stats.record_failure("oversized inbound payload");
                            }
                            continue;
                        }

                        if topic != command_topic {
                            continue;
                        }

                        if let Ok(mut stats) = shared.stats.lock() {
                            stats.messages_received += 1;
                        }
                        if worker_tx
                            .send(WorkerRequest::Dispatch {
                                payload: data.to_vec(),
                            })
                            .is_err()
                        {
                            warn!("board worker is gone; stopping mqtt receiver");
                            return;
                        }
                    }
                }
                Err(err) => {
                    mqtt_connected.store(false, Ordering::Relaxed);
                    warn!("mqtt receive loop error: {err:?}");
                    if let Ok(mut stats) = shared.stats.lock() {
                        stats.reconnects += 1;
                    }
                    thread::sleep(Duration::from_secs(2));
                    if let Err(sub_err) = subscribe_command_topic(&mqtt, &command_topic) {
                        warn!("mqtt re-subscribe failed: {sub_err:#}");
                    }
                }
            }
        })
        .expect("failed to spawn mqtt receiver thread");
}

fn spawn_board_worker(
    mut board: EspBoard,
    shared: Arc<BrokerShared>,
    result_topic: String,
) -> mpsc::Sender<WorkerRequest> {
    let (tx, rx) = mpsc::channel::<WorkerRequest>();

    thread::Builder::new()
        .name("board-worker".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            let mut status_lit = false;
            while let Ok(request) = rx.recv() {
                match request {
                    WorkerRequest::Dispatch { payload } => {
                        dispatch_command(&mut board, &shared, &result_topic, &payload);
                    }
                    WorkerRequest::ReadSensors { reply } => {
                        let _ = reply.send(read_all_sensors(&mut board));
                    }
                    WorkerRequest::StatusLed { wifi, mqtt, now_ms } => {
                        update_status_led(&mut board, wifi, mqtt, now_ms, &mut status_lit);
                    }
                }
            }
        })
        .expect("failed to spawn board worker thread");

    tx
}

fn dispatch_command(
    board: &mut EspBoard,
    shared: &BrokerShared,
    result_topic: &str,
    payload: &[u8],
) {
    let command = match command::decode(payload) {
        Ok(command) => command,
        Err(err) => {
            warn!("command rejected: {err}");
            if let Some(result) = CommandResult::from_decode_failure(payload, &err) {
                publish_result(shared, result_topic, &result);
            }
            return;
        }
    };

    if let Some(note) = command.clamp_note() {
        warn!("{note}");
    }

    let outcome = command.execute(board);
    match &outcome {
        Ok(()) => info!("{} {} executed", command.kind(), command.target()),
        Err(err) => warn!("{} {} failed: {err}", command.kind(), command.target()),
    }

    let result = CommandResult::from_outcome(&command, &outcome);
    publish_result(shared, result_topic, &result);
}

/// Best effort; a result publish failure never fails the command.
fn publish_result(shared: &BrokerShared, result_topic: &str, result: &CommandResult) {
    match serde_json::to_vec(result) {
        Ok(body) => {
            if let Err(err) = shared.publish(result_topic, QoS::AtLeastOnce, false, &body) {
                warn!("result publish failed: {err}");
            }
        }
        Err(err) => warn!("result serialization failed: {err}"),
    }
}

fn read_all_sensors(board: &mut EspBoard) -> Vec<SensorReading> {
    let now_ms = monotonic_ms();
    let sensors = board.board_info().sensors.clone();
    let mut readings = Vec::with_capacity(sensors.len());
    for (i, slot) in sensors.iter().enumerate() {
        let index = i + 1;
        match board.sensor_read(index, now_ms) {
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

/// Status is shown on LED slot 1: fast blink without wifi, slow blink
/// without broker, solid when fully connected.
fn update_status_led(
    board: &mut EspBoard,
    wifi_connected: bool,
    mqtt_connected: bool,
    now_ms: u64,
    lit: &mut bool,
) {
    let desired_on = if !wifi_connected {
        ((now_ms / STATUS_LED_FAST_BLINK_MS) % 2) == 0
    } else if !mqtt_connected {
        ((now_ms / STATUS_LED_SLOW_BLINK_MS) % 2) == 0
    } else {
        true
    };

    if desired_on == *lit {
        return;
    }
    if let Err(err) = board.led_control(1, desired_on) {
        warn!("status led update failed: {err}");
    } else {
        *lit = desired_on;
    }
}

fn spawn_telemetry_thread(
    shared: Arc<BrokerShared>,
    worker_tx: mpsc::Sender<WorkerRequest>,
    device_id: String,
    sensor_topic: String,
) {
    thread::Builder::new()
        .name("telemetry".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            thread::sleep(Duration::from_millis(TELEMETRY_INTERVAL_MS));

            let (reply_tx, reply_rx) = mpsc::channel();
            if worker_tx
                .send(WorkerRequest::ReadSensors { reply: reply_tx })
                .is_err()
            {
                warn!("board worker is gone; stopping telemetry");
                return;
            }
            let readings = match reply_rx.recv() {
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
                    if let Err(err) = shared.publish(&sensor_topic, QoS::AtLeastOnce, false, &body)
                    {
                        warn!("telemetry publish failed: {err}");
                    }
                }
                Err(err) => warn!("telemetry serialization failed: {err}"),
            }
        })
        .expect("failed to spawn telemetry thread");
}

fn spawn_heartbeat_thread(shared: Arc<BrokerShared>, heartbeat_topic: String) {
    thread::Builder::new()
        .name("heartbeat".into())
        .stack_size(6 * 1024)
        .spawn(move || {
            let mut heartbeat = Heartbeat::new();
            loop {
                thread::sleep(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
                let payload = heartbeat.beat(monotonic_ms());
                match serde_json::to_vec(&payload) {
                    Ok(body) => {
                        if let Err(err) =
                            shared.publish(&heartbeat_topic, QoS::AtLeastOnce, false, &body)
                        {
                            warn!("heartbeat publish failed: {err}");
                        }
                    }
                    Err(err) => warn!("heartbeat serialization failed: {err}"),
                }
            }
        })
        .expect("failed to spawn heartbeat thread");
}

// ---------------------------------------------------------------------------
// IDF plumbing

fn station_mac() -> [u8; 6] {
    let mut mac = [0u8; 6];
    let rc = unsafe {
        esp_idf_svc::sys::esp_read_mac(
            mac.as_mut_ptr(),
            esp_idf_svc::sys::esp_mac_type_t_ESP_MAC_WIFI_STA,
        )
    };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("esp_read_mac failed: esp_err_t={rc}");
    }
    mac
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
