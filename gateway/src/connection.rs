//! Sessions per port, port probing and failover.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use optiondesk_broker::{
    Connector, ErrorKind, MarketDataType, Transport, TransportError, TransportEvent,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::account::now_ms;
use crate::config::ConnectionConfig;
use crate::error::GatewayError;
use crate::resilience::rpc;
use crate::scheduler::{Channel, Scheduler};

/// Paper or live, judged from the port alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectedMode {
    Paper,
    Live,
    Unknown,
}

/// TWS and IB Gateway default ports: 7497/4002 paper, 7496/4001 live.
pub fn classify_port(port: u16) -> DetectedMode {
    match port {
        7497 | 4002 => DetectedMode::Paper,
        7496 | 4001 => DetectedMode::Live,
        _ => DetectedMode::Unknown,
    }
}

/// Probe order: active port, configured port, then candidates. No repeats.
pub fn candidate_ports(active: Option<u16>, configured: u16, candidates: &[u16]) -> Vec<u16> {
    let mut ports = Vec::with_capacity(candidates.len() + 2);
    for port in active.into_iter().chain([configured]).chain(candidates.iter().copied()) {
        if !ports.contains(&port) {
            ports.push(port);
        }
    }
    ports
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityStatus {
    pub enabled: bool,
    pub host: String,
    pub port: Option<u16>,
    pub client_id: i32,
    pub reachable: bool,
    pub latency_ms: Option<u64>,
    pub detected_mode: DetectedMode,
    pub probed_ports: Vec<u16>,
    pub message: String,
    /// Unix milliseconds.
    pub checked_at: i64,
}

impl ConnectivityStatus {
    pub fn disabled(config: &ConnectionConfig) -> Self {
        Self {
            enabled: false,
            host: config.host.clone(),
            port: None,
            client_id: config.client_id,
            reachable: false,
            latency_ms: None,
            detected_mode: DetectedMode::Unknown,
            probed_ports: Vec::new(),
            message: "broker integration disabled".to_string(),
            checked_at: now_ms(),
        }
    }

    pub fn unreachable(config: &ConnectionConfig, probed_ports: Vec<u16>, message: String) -> Self {
        Self {
            enabled: config.enabled,
            host: config.host.clone(),
            port: None,
            client_id: config.client_id,
            reachable: false,
            latency_ms: None,
            detected_mode: DetectedMode::Unknown,
            probed_ports,
            message,
            checked_at: now_ms(),
        }
    }

    /// Status reported while a cooldown is open, without probing.
    pub fn cooling_down(config: &ConnectionConfig, reason: &str) -> Self {
        Self::unreachable(config, Vec::new(), format!("cooling down: {reason}"))
    }
}

/// Receives every event pushed by any session.
pub trait EventSink: Send + Sync {
    fn on_event(&self, port: u16, event: TransportEvent);
}

/// One transport on one port.
pub struct Session {
    pub port: u16,
    transport: Arc<dyn Transport>,
    applied_type: Mutex<Option<MarketDataType>>,
    account_subscribed: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Switch the session's market data type if it differs from `data_type`.
    pub async fn ensure_market_data_type(
        &self,
        data_type: MarketDataType,
    ) -> Result<(), TransportError> {
        if *self.applied_type.lock() == Some(data_type) {
            return Ok(());
        }
        self.transport.set_market_data_type(data_type).await?;
        *self.applied_type.lock() = Some(data_type);
        Ok(())
    }

    pub fn applied_market_data_type(&self) -> Option<MarketDataType> {
        *self.applied_type.lock()
    }

    pub fn account_subscribed(&self) -> bool {
        self.account_subscribed.load(Ordering::Acquire)
    }

    pub fn set_account_subscribed(&self, subscribed: bool) {
        self.account_subscribed.store(subscribed, Ordering::Release);
    }

    async fn close(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.transport.disconnect().await;
    }
}

/// Sessions keyed by port, plus the active port.
pub struct SessionPool {
    connector: Arc<dyn Connector>,
    sink: Arc<dyn EventSink>,
    sessions: Mutex<FxHashMap<u16, Arc<Session>>>,
    active_port: Mutex<Option<u16>>,
    connecting: tokio::sync::Mutex<()>,
}

impl SessionPool {
    pub fn new(connector: Arc<dyn Connector>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            connector,
            sink,
            sessions: Mutex::new(FxHashMap::default()),
            active_port: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
        }
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn get(&self, port: u16) -> Option<Arc<Session>> {
        self.sessions.lock().get(&port).cloned()
    }

    pub fn active_port(&self) -> Option<u16> {
        *self.active_port.lock()
    }

    pub fn set_active_port(&self, port: Option<u16>) {
        *self.active_port.lock() = port;
    }

    /// Session on the active port, if there is one.
    pub fn active(&self) -> Option<Arc<Session>> {
        self.active_port().and_then(|port| self.get(port))
    }

    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.sessions.lock().keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// The session on `port`, connecting one if needed.
    pub async fn session(
        &self,
        config: &ConnectionConfig,
        port: u16,
    ) -> Result<Arc<Session>, GatewayError> {
        if let Some(session) = self.get(port) {
            return Ok(session);
        }
        let _connecting = self.connecting.lock().await;
        // Another caller may have connected while this one waited.
        if let Some(session) = self.get(port) {
            return Ok(session);
        }

        let transport = rpc(
            config.rpc_timeout(),
            "connect",
            self.connector.connect(&config.host, port, config.client_id),
        )
        .await?;

        let mut events = transport.events();
        let sink = Arc::clone(&self.sink);
        let pump = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => sink.on_event(port, event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!("session on port {port} dropped {missed} events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let session = Arc::new(Session {
            port,
            transport,
            applied_type: Mutex::new(None),
            account_subscribed: AtomicBool::new(false),
            pump: Mutex::new(Some(pump)),
        });
        self.sessions.lock().insert(port, Arc::clone(&session));
        info!("connected to {}:{port} as client {}", config.host, config.client_id);
        Ok(session)
    }

    /// Disconnect and forget the session on `port`.
    pub async fn drop_session(&self, port: u16) {
        let removed = self.sessions.lock().remove(&port);
        {
            let mut active = self.active_port.lock();
            if *active == Some(port) {
                *active = None;
            }
        }
        if let Some(session) = removed {
            debug!("dropping session on port {port}");
            session.close().await;
        }
    }

    /// Drop every session except the one on `keep`.
    pub async fn prune_except(&self, keep: u16) {
        let pruned: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock();
            let ports: Vec<u16> = sessions.keys().copied().filter(|p| *p != keep).collect();
            ports.iter().filter_map(|p| sessions.remove(p)).collect()
        };
        for session in pruned {
            debug!("pruning session on port {}", session.port);
            session.close().await;
        }
    }

    pub async fn drop_all(&self) {
        let all: Vec<Arc<Session>> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        self.set_active_port(None);
        for session in all {
            session.close().await;
        }
    }
}

/// Port failover plus the cached connectivity status.
pub struct ConnectionManager {
    pool: SessionPool,
    status: Mutex<Option<(Instant, ConnectivityStatus)>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            pool: SessionPool::new(connector, sink),
            status: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    /// The cached status if it is younger than `ttl`.
    pub fn cached_status(&self, ttl: std::time::Duration) -> Option<ConnectivityStatus> {
        self.status
            .lock()
            .as_ref()
            .filter(|(at, _)| at.elapsed() < ttl)
            .map(|(_, status)| status.clone())
    }

    pub fn last_status(&self) -> Option<ConnectivityStatus> {
        self.status.lock().as_ref().map(|(_, status)| status.clone())
    }

    pub fn store_status(&self, status: ConnectivityStatus) {
        *self.status.lock() = Some((Instant::now(), status));
    }

    pub fn invalidate(&self) {
        *self.status.lock() = None;
    }

    /// Walk the candidate ports until one answers an echo.
    ///
    /// On success the port becomes active and sessions on other ports are
    /// pruned. When every port fails and every failure was a timeout, all
    /// sessions are dropped.
    pub async fn probe(&self, config: &ConnectionConfig, scheduler: &Scheduler) -> ConnectivityStatus {
        if !config.enabled {
            return ConnectivityStatus::disabled(config);
        }
        let ports = candidate_ports(self.pool.active_port(), config.port, &config.candidate_ports);
        let mut failures = Vec::with_capacity(ports.len());
        let mut all_timeouts = true;

        for &port in &ports {
            let started = Instant::now();
            match self.probe_port(config, scheduler, port).await {
                Ok(server_time) => {
                    let latency = started.elapsed();
                    self.pool.set_active_port(Some(port));
                    self.pool.prune_except(port).await;
                    let mode = classify_port(port);
                    debug!("port {port} answered (server time {server_time}, {mode:?})");
                    return ConnectivityStatus {
                        enabled: true,
                        host: config.host.clone(),
                        port: Some(port),
                        client_id: config.client_id,
                        reachable: true,
                        latency_ms: Some(latency.as_millis() as u64),
                        detected_mode: mode,
                        probed_ports: ports.clone(),
                        message: format!("connected on port {port}"),
                        checked_at: now_ms(),
                    };
                }
                Err(err) => {
                    if !err.is_timeout() {
                        all_timeouts = false;
                    }
                    if err.kind() == Some(ErrorKind::Disconnected) {
                        self.pool.drop_session(port).await;
                    }
                    debug!("port {port} failed: {err}");
                    failures.push(format!("{port}: {err}"));
                }
            }
        }

        if all_timeouts {
            self.pool.drop_all().await;
        }
        self.pool.set_active_port(None);
        ConnectivityStatus::unreachable(
            config,
            ports,
            format!("no reachable port ({})", failures.join("; ")),
        )
    }

    async fn probe_port(
        &self,
        config: &ConnectionConfig,
        scheduler: &Scheduler,
        port: u16,
    ) -> Result<i64, GatewayError> {
        self.pool
            .connector()
            .probe_tcp(&config.host, port, config.tcp_probe_timeout())
            .await?;
        // No breaker or retry here: the next candidate port is the retry, and
        // the caller opens the cooldown when every port fails.
        let session = self.pool.session(config, port).await?;
        let transport = Arc::clone(session.transport());
        scheduler
            .enqueue(Channel::Connectivity, "current_time", || {
                rpc(config.rpc_timeout(), "current_time", async move {
                    transport.current_time().await
                })
            })
            .await?
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use optiondesk_broker::OrderStatusEvent;
    use optiondesk_broker::mock::{MockConnector, MockTransport, TcpBehavior};

    use super::*;
    use crate::scheduler::SchedulerSettings;

    #[derive(Default)]
    struct Collect(Mutex<Vec<(u16, TransportEvent)>>);

    impl EventSink for Collect {
        fn on_event(&self, port: u16, event: TransportEvent) {
            self.0.lock().push((port, event));
        }
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(SchedulerSettings {
            max_concurrent: 2,
            global_min_interval: Duration::ZERO,
            channel_intervals: [Duration::ZERO; Channel::COUNT],
            queue_max: 16,
        })
    }

    fn config(port: u16, candidates: Vec<u16>) -> ConnectionConfig {
        ConnectionConfig {
            port,
            candidate_ports: candidates,
            ..ConnectionConfig::default()
        }
    }

    #[test]
    fn ports_are_classified() {
        assert_eq!(classify_port(7497), DetectedMode::Paper);
        assert_eq!(classify_port(4002), DetectedMode::Paper);
        assert_eq!(classify_port(7496), DetectedMode::Live);
        assert_eq!(classify_port(4001), DetectedMode::Live);
        assert_eq!(classify_port(5000), DetectedMode::Unknown);
    }

    #[test]
    fn candidates_are_ordered_and_unique() {
        assert_eq!(
            candidate_ports(Some(4002), 7497, &[7497, 4002, 7496]),
            vec![4002, 7497, 7496]
        );
        assert_eq!(candidate_ports(None, 7497, &[]), vec![7497]);
    }

    #[tokio::test(start_paused = true)]
    async fn fails_over_to_next_port() {
        let transport = MockTransport::builder().build();
        let connector = MockConnector::new()
            .with_dead_port(7497, TcpBehavior::Refuse)
            .with_port(4002, Arc::clone(&transport));
        let manager = ConnectionManager::new(Arc::new(connector), Arc::new(Collect::default()));
        let scheduler = scheduler();

        let status = manager.probe(&config(7497, vec![7497, 4002]), &scheduler).await;
        assert!(status.reachable, "{}", status.message);
        assert_eq!(status.port, Some(4002));
        assert_eq!(status.detected_mode, DetectedMode::Paper);
        assert_eq!(status.probed_ports, vec![7497, 4002]);
        assert_eq!(manager.pool().active_port(), Some(4002));
        assert_eq!(transport.call_count("current_time"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn all_timeouts_drop_every_session() {
        let transport = MockTransport::builder().build();
        let connector = Arc::new(MockConnector::new().with_port(4002, Arc::clone(&transport)));
        let manager = ConnectionManager::new(
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::new(Collect::default()),
        );
        let scheduler = scheduler();
        let cfg = config(4002, vec![]);
        assert!(manager.probe(&cfg, &scheduler).await.reachable);
        assert_eq!(manager.pool().ports(), vec![4002]);

        connector.set_tcp(4002, TcpBehavior::Hang);
        let status = manager.probe(&cfg, &scheduler).await;
        assert!(!status.reachable);
        assert!(status.message.contains("timed out"));
        assert!(manager.pool().ports().is_empty());
        assert_eq!(manager.pool().active_port(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_does_not_probe() {
        let connector = MockConnector::new();
        let manager = ConnectionManager::new(Arc::new(connector), Arc::new(Collect::default()));
        let cfg = ConnectionConfig {
            enabled: false,
            ..ConnectionConfig::default()
        };
        let status = manager.probe(&cfg, &scheduler()).await;
        assert!(!status.enabled);
        assert!(!status.reachable);
        assert!(manager.pool().ports().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pump_forwards_events() {
        let transport = MockTransport::builder().build();
        let connector = MockConnector::new().with_port(4002, Arc::clone(&transport));
        let sink = Arc::new(Collect::default());
        let pool = SessionPool::new(Arc::new(connector), Arc::clone(&sink) as Arc<dyn EventSink>);

        let session = pool.session(&config(4002, vec![]), 4002).await.unwrap();
        assert_eq!(session.port, 4002);
        transport.emit(TransportEvent::OrderStatus(OrderStatusEvent {
            order_id: 5,
            ..Default::default()
        }));
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(sink.0.lock().len(), 1);

        pool.drop_session(4002).await;
        assert!(pool.get(4002).is_none());
        assert!(!transport.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn market_data_type_is_applied_once() {
        let transport = MockTransport::builder().build();
        let connector = MockConnector::new().with_port(4002, Arc::clone(&transport));
        let pool = SessionPool::new(Arc::new(connector), Arc::new(Collect::default()));
        let session = pool.session(&config(4002, vec![]), 4002).await.unwrap();

        session.ensure_market_data_type(MarketDataType::Delayed).await.unwrap();
        session.ensure_market_data_type(MarketDataType::Delayed).await.unwrap();
        assert_eq!(transport.data_type_history(), vec![MarketDataType::Delayed]);
        assert_eq!(session.applied_market_data_type(), Some(MarketDataType::Delayed));
    }
}
