pub mod addons;
pub mod bus;
pub mod config;
pub mod mqtt;
pub mod structure;
pub mod supervisor;

use crate::addons::homeassistant::HomeAssistantDiscovery;
use crate::addons::{AddonSubscriber, StructureRecorder};
use crate::bus::EventBus;
use crate::config::AppConfig;
use crate::structure::StructureCell;
use crate::supervisor::TaskGroup;
use color_eyre::Result;
use mqtt::mqtt_handler::{ConnectionState, MQTTHandle, MQTTStatus};
use mqtt::publisher::{MqttBridge, MqttPublisher};
use mqtt::transport::{BrokerConnector, RumqttConnector};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, Registry};

type LevelHandle = reload::Handle<LevelFilter, Registry>;

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = setup()?;

    let config = AppConfig::load().await?;
    log_level.reload(LevelFilter::from_level(config.log_level()?))?;
    config.validate()?;
    info!(
        "Starting loxone2mqtt for broker {}:{}",
        config.mqtt.broker, config.mqtt.port
    );

    let bus = EventBus::new();
    let connector: Arc<dyn BrokerConnector> =
        Arc::new(RumqttConnector::from_config(&config.mqtt).await?);
    let handle = MQTTHandle::new(connector.clone(), bus.clone(), &config.mqtt);
    let status = handle.status();

    // Outbound batches from the controller
    let publisher = MqttPublisher::new(connector, handle.status_sender());
    bus.subscribe(
        &config.bridge.outbound_topic,
        Arc::new(MqttBridge::new(publisher)),
    )?;

    let structure = Arc::new(StructureCell::new());
    bus.subscribe(
        &config.bridge.outbound_topic,
        Arc::new(AddonSubscriber::new(StructureRecorder::new(
            config.bridge.structure_topic.clone(),
            structure,
        ))),
    )?;

    if config.bridge.homeassistant_discovery {
        info!("Home Assistant discovery enabled");
        bus.subscribe(
            &config.bridge.outbound_topic,
            Arc::new(AddonSubscriber::new(HomeAssistantDiscovery::new(
                bus.clone(),
                config.bridge.structure_topic.clone(),
                config.bridge.discovery_topic.clone(),
            ))),
        )?;
    }

    let mut group = TaskGroup::new();
    let shutdown = group.shutdown_token();
    group.spawn("event-bus", run_bus(bus, shutdown.clone()));
    group.spawn("mqtt-listener", run_listener(handle, shutdown.clone()));
    group.spawn("mqtt-status", log_status(status, shutdown));

    match group.wait().await {
        Ok(()) => {
            info!("loxone2mqtt stopped");
            Ok(())
        }
        Err(e) => {
            error!("loxone2mqtt stopped with a fatal error: {:#}", e);
            Err(e)
        }
    }
}

async fn run_bus(bus: EventBus, shutdown: CancellationToken) -> Result<()> {
    bus.run(shutdown).await?;
    Ok(())
}

async fn run_listener(handle: MQTTHandle, shutdown: CancellationToken) -> Result<()> {
    handle.connect_and_listen(shutdown).await?;
    Ok(())
}

/// Logs connection state changes as they happen.
async fn log_status(
    mut status: watch::Receiver<MQTTStatus>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut last = ConnectionState::default();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            changed = status.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
        }

        let current = status.borrow_and_update().clone();
        if current.connection_state == last {
            continue;
        }
        match current.connection_state {
            ConnectionState::Connected => info!(
                "MQTT connected ({} received, {} sent so far)",
                current.messages_received, current.messages_sent
            ),
            ConnectionState::Reconnecting => warn!(
                "MQTT reconnecting (attempt {})",
                current.reconnect_attempts
            ),
            ConnectionState::Failed => error!(
                "MQTT adapter failed: {}",
                current
                    .error_messages
                    .last()
                    .map(String::as_str)
                    .unwrap_or("no error recorded")
            ),
            ref other => info!("MQTT state: {:?}", other),
        }
        last = current.connection_state;
    }
}

/// Installs error reporting and logging. Logging starts at INFO so config
/// loading is visible; the returned handle applies the configured level.
fn setup() -> Result<LevelHandle> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;

    let (subscriber, level) = logging(std::io::stdout);
    subscriber.init();
    Ok(level)
}

fn logging<W>(make_writer: W) -> (impl Subscriber + Send + Sync + 'static, LevelHandle)
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let (filter, level) = reload::Layer::new(LevelFilter::INFO);
    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_target(false)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(make_writer)
            .pretty(),
    );
    (subscriber, level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_config_warnings_are_logged_before_level_is_applied() {
        let captured = Captured::default();
        let writer = captured.clone();
        let (subscriber, level) = logging(move || writer.clone());

        tracing::subscriber::with_default(subscriber, || {
            warn!("Config file not found, using defaults");
            level.reload(LevelFilter::ERROR).unwrap();
            warn!("suppressed once the configured level is applied");
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Config file not found, using defaults"));
        assert!(!output.contains("suppressed once the configured level is applied"));
    }
}
