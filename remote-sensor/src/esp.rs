use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use embedded_hal::delay::DelayNs;
use embedded_svc::{http::Method, io::Write};
use esp_idf_hal::delay::FreeRtos;
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    nvs::EspDefaultNvsPartition,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use garage_common::{
    board::{
        add_current_task_to_watchdog, build_setting, disable_wifi_power_save, feed_watchdog,
        init_watchdog, is_client_disconnect, last_reset_cause, ChipThermometer, EspRadio, EspReset,
        HcSr04, PrimarySensor,
    },
    door::check_door_state,
    supervisor::{fail_safe_reboot, SERVICE_LOOP_YIELD_MS},
    ConnectionSupervisor, FatalError, LocalEnvironment, NodeConfig, RemoteStatusRecord,
    FIRMWARE_VERSION,
    NOT_FOUND_BODY, ROUTE_API_STATUS,
};

const WATCHDOG_TIMEOUT_SEC: u32 = 30;

type HttpRequest<'r, 'c> = Request<&'r mut EspHttpConnection<'c>>;

struct SensorNode {
    environment: LocalEnvironment<ChipThermometer, PrimarySensor>,
    sonar: Option<HcSr04>,
    trigger_distance_cm: f32,
}

impl SensorNode {
    fn status(&mut self) -> RemoteStatusRecord {
        let state = check_door_state(self.sonar.as_mut(), self.trigger_distance_cm, &mut FreeRtos);
        let reading = self.environment.read(&mut FreeRtos);
        RemoteStatusRecord::from_reading(state, &reading, Some(FIRMWARE_VERSION))
    }
}

type SharedNode = Arc<Mutex<SensorNode>>;

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

    let reference = ChipThermometer::new(temp_sensor).context("chip temperature sensor")?;
    let sensor = PrimarySensor::from_config(&config.sensor1).unwrap_or_else(|err| {
        warn!("{err}; reporting chip temperature only");
        None
    });
    let sonar = match config.sonar_pins.as_slice() {
        [trigger, echo] => HcSr04::new(*trigger, *echo)
            .map_err(|err| warn!("{err}; door state unavailable"))
            .ok(),
        pins => {
            warn!("sonar_pins {pins:?} unusable; door state unavailable");
            None
        }
    };
    let node = SensorNode {
        environment: LocalEnvironment::new(reference, sensor, &config.sensor1),
        sonar,
        trigger_distance_cm: config.trigger_distance_cm,
    };
    let node = Arc::new(Mutex::new(node));

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    let _server = create_http_server(node)?;
    info!("remote sensor serving on http://{ip}/ (firmware {FIRMWARE_VERSION})");

    if let Err(err) = add_current_task_to_watchdog() {
        warn!("link monitor not watched: {err}");
    }
    loop {
        feed_watchdog();
        if let Err(err) = supervisor.check_link() {
            supervisor.fail_safe_reboot(&mut EspReset, &err);
        }
        FreeRtos.delay_ms(SERVICE_LOOP_YIELD_MS as u32);
    }
}

fn lock(node: &SharedNode) -> MutexGuard<'_, SensorNode> {
    node.lock().unwrap_or_else(PoisonError::into_inner)
}

fn create_http_server(node: SharedNode) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>(ROUTE_API_STATUS, Method::Get, move |req| {
        settle(ROUTE_API_STATUS, write_status(req, &node))
    })?;

    server.fn_handler::<anyhow::Error, _>("/*", Method::Get, |req| {
        settle("not found", write_not_found(req))
    })?;

    Ok(server)
}

fn write_status(req: HttpRequest<'_, '_>, node: &SharedNode) -> anyhow::Result<()> {
    let record = lock(node).status();
    info!("status -> door {}", record.state.as_str());
    let body = serde_json::to_vec(&record)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
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

fn write_not_found(req: HttpRequest<'_, '_>) -> anyhow::Result<()> {
    req.into_response(404, Some("Not Found"), &[("Content-Type", "text/plain")])?
        .write_all(NOT_FOUND_BODY.as_bytes())?;
    Ok(())
}
