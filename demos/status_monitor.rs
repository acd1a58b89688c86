use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast::error::RecvError, RwLock},
    time::{interval, Instant},
};
use tracing::{info, warn};
use zwack::{
    ble::AdapterState,
    protocol::{
        decode_cycling_power_measurement, decode_indoor_bike_data, CyclingPowerSample,
        IndoorBikeSample,
    },
    ConnectionEvent, FitnessPeripheral, LoopbackStack, NotificationDispatcher, PeripheralConfig,
    Result, ServiceSelection, SimulatorState, CYCLING_POWER_MEASUREMENT_UUID,
    INDOOR_BIKE_DATA_UUID,
};

/// Cadence from two crank samples, the way a head unit derives it
fn crank_cadence(previous: (u16, u16), current: (u16, u16)) -> Option<f64> {
    let revs = current.0.wrapping_sub(previous.0);
    let ticks = current.1.wrapping_sub(previous.1);
    if revs == 0 || ticks == 0 {
        return None;
    }
    Some(f64::from(revs) * 60.0 * 1024.0 / f64::from(ticks))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("📊 Zwack Status Monitor Example");

    let config = PeripheralConfig {
        services: ServiceSelection::from_variables("ftms,csp,power,cadence,speed")?,
        ..Default::default()
    };
    let simulator = Arc::new(RwLock::new(SimulatorState::new(config.noise)));
    // values are only read through watch()
    let stack = Arc::new(LoopbackStack::with_history(0));
    let peripheral = Arc::new(FitnessPeripheral::new(config, stack.clone())?);

    peripheral
        .on_connection_event(ConnectionEvent::StateChange(AdapterState::PoweredOn))
        .await;
    peripheral
        .on_connection_event(ConnectionEvent::Accept("00:11:22:33:44:55".to_string()))
        .await;
    peripheral.on_subscribe(INDOOR_BIKE_DATA_UUID).await;
    peripheral.on_subscribe(CYCLING_POWER_MEASUREMENT_UUID).await;

    let mut notifications = stack.watch();
    let dispatcher = NotificationDispatcher::start(Arc::clone(&peripheral), simulator);

    info!("🔍 Monitoring notifications, press Ctrl+C to stop");

    let mut monitor_interval = interval(Duration::from_secs(2));
    let start_time = Instant::now();
    let mut bike: Option<IndoorBikeSample> = None;
    let mut power: Option<CyclingPowerSample> = None;
    let mut last_crank: Option<(u16, u16)> = None;
    let mut derived_cadence: Option<f64> = None;
    let mut max_watts = 0i16;
    let mut received = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            outbound = notifications.recv() => {
                let outbound = match outbound {
                    Ok(outbound) => outbound,
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Monitor missed {} notification(s)", missed);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                received += 1;

                if outbound.characteristic == INDOOR_BIKE_DATA_UUID {
                    match decode_indoor_bike_data(&outbound.value) {
                        Ok(sample) => bike = Some(sample),
                        Err(e) => warn!("❌ Bad indoor bike data: {}", e),
                    }
                } else if outbound.characteristic == CYCLING_POWER_MEASUREMENT_UUID {
                    match decode_cycling_power_measurement(&outbound.value) {
                        Ok(sample) => {
                            max_watts = max_watts.max(sample.watts);
                            if let Some(crank) = sample.crank {
                                if let Some(previous) = last_crank {
                                    derived_cadence = crank_cadence(previous, crank).or(derived_cadence);
                                }
                                last_crank = Some(crank);
                            }
                            power = Some(sample);
                        }
                        Err(e) => warn!("❌ Bad cycling power measurement: {}", e),
                    }
                }
            }
            _ = monitor_interval.tick() => {
                let elapsed = start_time.elapsed();
                let minutes = elapsed.as_secs() / 60;
                let seconds = elapsed.as_secs() % 60;

                println!("\n📊 Status Update ({minutes:02}:{seconds:02})");
                println!("┌─────────────────────────────────────────┐");
                if let Some(bike) = bike {
                    println!(
                        "│ FTMS  Power: {:5} W  Cadence: {:5.1} rpm │",
                        bike.watts.unwrap_or_default(),
                        bike.cadence_rpm.unwrap_or_default()
                    );
                    println!(
                        "│ FTMS  Speed: {:5.1} km/h                 │",
                        bike.speed_kmh.unwrap_or_default()
                    );
                }
                if let Some(power) = power {
                    println!("│ CPS   Power: {:5} W                    │", power.watts);
                    if let Some((wheel_revs, _)) = power.wheel {
                        println!("│ CPS   Wheel revolutions: {wheel_revs:8}       │");
                    }
                    if let Some(cadence) = derived_cadence {
                        println!("│ CPS   Derived cadence: {cadence:5.1} rpm        │");
                    }
                }
                println!("└─────────────────────────────────────────┘");
                println!("📈 {received} notification(s), max power {max_watts} W");
            }
        }
    }

    info!("🔌 Stopping...");
    peripheral
        .on_connection_event(ConnectionEvent::Disconnect("00:11:22:33:44:55".to_string()))
        .await;
    dispatcher.shutdown().await;

    println!("\n📊 Final Summary:");
    println!(
        "  Duration: {:02}:{:02}",
        start_time.elapsed().as_secs() / 60,
        start_time.elapsed().as_secs() % 60
    );
    println!("  Notifications: {received}");
    println!("  Max Power: {max_watts} W");

    info!("🎉 Status monitoring completed!");
    Ok(())
}
