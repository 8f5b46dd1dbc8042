use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use chrono::Utc;
use embedded_hal::delay::DelayNs;
use embedded_svc::{http::Method, io::Write};
use esp_idf_hal::delay::FreeRtos;
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    nvs::EspDefaultNvsPartition,
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use garage_common::{
    board::{
        add_current_task_to_watchdog, build_setting, disable_wifi_power_save, feed_watchdog,
        init_watchdog, is_client_disconnect, last_reset_cause, ChipThermometer, EspPeerTransport,
        EspRadio, EspReset, GpioRelay, PrimarySensor,
    },
    door::run_actuation,
    status::handle_run,
    supervisor::{fail_safe_reboot, SERVICE_LOOP_YIELD_MS},
    ActuationQueue, ConnectionSupervisor, DeviceId, DeviceReport, DeviceTarget, FatalError,
    LocalEnvironment, NodeConfig, RemoteStatusClient, RemoteStatusRecord, StatusAggregator,
    FIRMWARE_VERSION,
    NOT_FOUND_BODY, PARAM_DEVICE_ID, ROUTE_API_RUN, ROUTE_API_STATUS, ROUTE_RUN, STATIC_ASSETS,
    query_param,
};

const DOOR_RELAY_PIN: i32 = 22;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
// 2024-01-01; anything earlier means SNTP has not set the clock yet.
const MIN_SYNCED_EPOCH_SECS: i64 = 1_704_067_200;

const INDEX_HTML: &str = include_str!("../web/index.html");
const SCRIPTS_JS: &str = include_str!("../web/scripts.js");
const MANIFEST_JSON: &str = include_str!("../web/manifest.json");

type HttpRequest<'r, 'c> = Request<&'r mut EspHttpConnection<'c>>;

struct HubNode {
    environment: LocalEnvironment<ChipThermometer, PrimarySensor>,
    relay: GpioRelay,
    peers: RemoteStatusClient<EspPeerTransport>,
}

#[derive(Clone)]
struct SharedState {
    node: Arc<Mutex<HubNode>>,
    config: Arc<NodeConfig>,
    ip: Arc<str>,
    actuation: Arc<ActuationQueue>,
}

impl SharedState {
    fn node(&self) -> MutexGuard<'_, HubNode> {
        self.node.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub fn run() -> anyhow::Result<()> {
    let outcome = start();
    if let Err(err) = &outcome {
        let cause: &(dyn std::error::Error + 'static) = err.as_ref();
        fail_safe_reboot(&mut FreeRtos, &mut EspReset, &FatalError::from_startup_error(cause));
    }
    outcome
}

fn start() -> anyhow::Result<()> {
    let (config, problems) = NodeConfig::load(build_setting);
    if !problems.is_empty() {
        warn!("{} setting(s) fell back to defaults", problems.len());
    }

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals {
        modem, temp_sensor, ..
    } = Peripherals::take()?;

    let wifi = BlockingWifi::wrap(
        EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?,
        sys_loop,
    )?;
    let mut supervisor = ConnectionSupervisor::new(EspRadio::new(wifi), FreeRtos);
    supervisor.recover_radio(last_reset_cause());

    let ip = supervisor.connect(config.wifi.as_ref())?;
    disable_wifi_power_save();

    let _sntp = match EspSntp::new_default() {
        Ok(sntp) => {
            info!("SNTP initialized");
            Some(sntp)
        }
        Err(err) => {
            warn!("SNTP unavailable ({err}); UTC reported as 0");
            None
        }
    };

    let reference = ChipThermometer::new(temp_sensor).context("chip temperature sensor")?;
    let sensor = PrimarySensor::from_config(&config.sensor1).unwrap_or_else(|err| {
        warn!("{err}; reporting chip temperature only");
        None
    });
    let node = HubNode {
        environment: LocalEnvironment::new(reference, sensor, &config.sensor1),
        relay: GpioRelay::new(DOOR_RELAY_PIN).context("door relay")?,
        peers: RemoteStatusClient::new(EspPeerTransport),
    };

    let state = SharedState {
        node: Arc::new(Mutex::new(node)),
        config: Arc::new(config),
        ip: Arc::from(ip.to_string()),
        actuation: Arc::new(ActuationQueue::new()),
    };

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    let _server = create_http_server(state.clone())?;
    info!("hub serving on http://{ip}/ (firmware {FIRMWARE_VERSION})");

    service_loop(state, supervisor)
}

fn service_loop(state: SharedState, mut supervisor: ConnectionSupervisor<EspRadio, FreeRtos>) -> ! {
    if let Err(err) = add_current_task_to_watchdog() {
        warn!("service loop not watched: {err}");
    }

    loop {
        feed_watchdog();

        if let Err(err) = supervisor.check_link() {
            supervisor.fail_safe_reboot(&mut EspReset, &err);
        }

        if state.actuation.take() {
            let mut node = state.node();
            info!("door actuation started");
            if let Err(err) = run_actuation(&mut node.relay, &mut FreeRtos) {
                warn!("door actuation step failed: {err}");
            }
        }

        FreeRtos.delay_ms(SERVICE_LOOP_YIELD_MS as u32);
    }
}

// Disconnects mid-response are dropped; anything else is logged and answered with a 500.
fn settle(route: &str, outcome: anyhow::Result<()>) -> anyhow::Result<()> {
    match outcome {
        Err(err) if disconnected(&err) => Ok(()),
        Err(err) => {
            warn!("{route}: {err:#}");
            Err(err)
        }
        ok => ok,
    }
}

fn disconnected(err: &anyhow::Error) -> bool {
    let cause: &(dyn std::error::Error + 'static) = err.as_ref();
    is_client_disconnect(cause)
}

fn create_http_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    let status_state = state.clone();
    server.fn_handler::<anyhow::Error, _>(ROUTE_API_STATUS, Method::Get, move |req| {
        settle(ROUTE_API_STATUS, handle_status(req, &status_state))
    })?;

    for route in [ROUTE_API_RUN, ROUTE_RUN] {
        for method in [Method::Get, Method::Post] {
            let run_state = state.clone();
            server.fn_handler::<anyhow::Error, _>(route, method, move |req| {
                let ack = handle_run(&run_state.actuation);
                let written = req
                    .into_ok_response()
                    .and_then(|mut response| response.write_all(ack.as_bytes()));
                settle(route, written.map_err(Into::into))
            })?;
        }
    }

    for (route, file, content_type) in STATIC_ASSETS {
        server.fn_handler::<anyhow::Error, _>(route, Method::Get, move |req| {
            let outcome = match bundled_asset(file) {
                Some(body) => write_asset(req, content_type, body),
                None => write_not_found(req),
            };
            settle(route, outcome)
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/*", Method::Get, |req| {
        settle("not found", write_not_found(req))
    })?;

    Ok(server)
}

fn write_asset(req: HttpRequest<'_, '_>, content_type: &str, body: &str) -> anyhow::Result<()> {
    req.into_response(200, Some("OK"), &[("Content-Type", content_type)])?
        .write_all(body.as_bytes())?;
    Ok(())
}

fn bundled_asset(file: &str) -> Option<&'static str> {
    match file {
        "index.html" => Some(INDEX_HTML),
        "scripts.js" => Some(SCRIPTS_JS),
        "manifest.json" => Some(MANIFEST_JSON),
        _ => None,
    }
}

fn handle_status(req: HttpRequest<'_, '_>, state: &SharedState) -> anyhow::Result<()> {
    let device = DeviceId::parse(query_param(req.uri(), PARAM_DEVICE_ID).as_deref());
    let aggregator = StatusAggregator::new(&state.config, &state.ip, FIRMWARE_VERSION);

    let report = {
        let mut node = state.node();
        match device.target() {
            DeviceTarget::Local => DeviceReport::local(&node.environment.read(&mut FreeRtos)),
            DeviceTarget::Remote(_) => {
                let address = aggregator.peer_address(&device);
                let record = match address {
                    Some(address) => node.peers.fetch_peer(address),
                    None => RemoteStatusRecord::sentinel(),
                };
                DeviceReport::remote(address, record)
            }
        }
    };

    let snapshot = aggregator.snapshot(&device, report, utc_nanos());
    info!("status {} -> door {}", device.label(), snapshot.state.as_str());
    write_json(req, &snapshot)
}

fn write_json<T: Serialize>(req: HttpRequest<'_, '_>, payload: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_not_found(req: HttpRequest<'_, '_>) -> anyhow::Result<()> {
    req.into_response(404, Some("Not Found"), &[("Content-Type", "text/plain")])?
        .write_all(NOT_FOUND_BODY.as_bytes())?;
    Ok(())
}

fn utc_nanos() -> i64 {
    let now = Utc::now();
    if now.timestamp() < MIN_SYNCED_EPOCH_SECS {
        return 0;
    }
    now.timestamp_nanos_opt().unwrap_or_default()
}

