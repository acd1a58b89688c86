use std::{sync::Arc, time::Duration};
use tokio::{sync::RwLock, time::sleep};
use tracing::{info, warn};
use zwack::{
    ble::{AdapterState, Delivery},
    simulator::{Direction, Parameter},
    AttResult, ConnectionEvent, FitnessPeripheral, LoopbackStack, NotificationDispatcher,
    PeripheralConfig, Result, ServiceSelection, SimulatorState,
    FITNESS_MACHINE_CONTROL_POINT_UUID, FITNESS_MACHINE_FEATURE_UUID,
    FITNESS_MACHINE_STATUS_UUID, INDOOR_BIKE_DATA_UUID, SUPPORTED_POWER_RANGE_UUID,
};

const CENTRAL: &str = "C0:FF:EE:00:00:01";

/// Write to the control point the way a training app would
async fn control(peripheral: &FitnessPeripheral, label: &str, data: &[u8]) {
    let ack = peripheral
        .on_write_received(FITNESS_MACHINE_CONTROL_POINT_UUID, data)
        .await;
    if ack == AttResult::Success {
        info!("➡️  {} {:02X?}", label, data);
    } else {
        warn!("➡️  {} rejected: {}", label, ack);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🚴 Zwack Virtual Trainer Example");

    let config = PeripheralConfig {
        services: ServiceSelection::from_variables("ftms")?,
        ..Default::default()
    };
    let simulator = Arc::new(RwLock::new(SimulatorState::new(config.noise)));
    let stack = Arc::new(LoopbackStack::new());
    let peripheral = Arc::new(FitnessPeripheral::new(config, stack.clone())?);

    // Print everything the trainer sends back
    let mut outbound = stack.watch();
    tokio::spawn(async move {
        while let Ok(sent) = outbound.recv().await {
            let arrow = match sent.delivery {
                Delivery::Indicate => "⬅️  indicate",
                Delivery::Notify => "⬅️  notify",
            };
            println!("{arrow} {}: {:02X?}", sent.characteristic, &sent.value[..]);
        }
    });

    peripheral
        .on_connection_event(ConnectionEvent::StateChange(AdapterState::PoweredOn))
        .await;
    peripheral
        .on_connection_event(ConnectionEvent::Accept(CENTRAL.to_string()))
        .await;

    // Discovery reads
    for uuid in [FITNESS_MACHINE_FEATURE_UUID, SUPPORTED_POWER_RANGE_UUID] {
        match peripheral.on_read_request(uuid).await {
            Ok(value) => info!("📖 {}: {:02X?}", uuid, &value[..]),
            Err(e) => warn!("📖 {}: {}", uuid, e),
        }
    }

    peripheral.on_subscribe(INDOOR_BIKE_DATA_UUID).await;
    peripheral.on_subscribe(FITNESS_MACHINE_STATUS_UUID).await;
    peripheral.on_subscribe(FITNESS_MACHINE_CONTROL_POINT_UUID).await;

    let dispatcher = NotificationDispatcher::start(Arc::clone(&peripheral), Arc::clone(&simulator));

    // Refused until control is requested
    control(&peripheral, "Start (no control)", &[0x07]).await;
    control(&peripheral, "Request Control", &[0x00]).await;
    control(&peripheral, "Start", &[0x07]).await;
    sleep(Duration::from_secs(2)).await;

    for watts in [150i16, 200, 250] {
        let [lo, hi] = watts.to_le_bytes();
        control(&peripheral, "Set Target Power", &[0x05, lo, hi]).await;
        sleep(Duration::from_secs(2)).await;
    }

    // 2 m/s headwind, 4% grade, crr 0.004, cw 0.51
    control(
        &peripheral,
        "Set Indoor Bike Simulation",
        &[0x11, 0xD0, 0x07, 0x90, 0x01, 0x28, 0x33],
    )
    .await;

    // The rider spins up
    {
        let mut state = simulator.write().await;
        for _ in 0..3 {
            state.adjust(Parameter::Cadence, Direction::Increase);
        }
        println!("\n{state}\n");
    }
    sleep(Duration::from_secs(2)).await;

    control(&peripheral, "Stop", &[0x08]).await;
    control(&peripheral, "Stop again", &[0x08]).await;
    control(&peripheral, "Reset", &[0x01]).await;

    peripheral
        .on_connection_event(ConnectionEvent::Disconnect(CENTRAL.to_string()))
        .await;
    dispatcher.shutdown().await;

    let session = peripheral.control_session().await;
    info!(
        "🏁 Session over (control: {}, running: {})",
        session.has_control, session.is_running
    );
    Ok(())
}
