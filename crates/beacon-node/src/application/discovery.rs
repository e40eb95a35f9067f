//! The discovery runtime.
//!
//! [`Discovery`] wires the pure pieces from `beacon_core` to a
//! [`DatagramTransport`] and three tokio tasks:
//!
//! ```text
//!             ┌──────────── heartbeat (every hello_interval) ──► hello ─┐
//!  Membership ┤                                                         ├─► Outbound ─► transport
//!  (+ channel ├──────────── health check (every check_interval) ─► sweep│
//!   registry) │                                                         │
//!             └◄── dispatch ◄── Inbound ◄── receive loop ◄──────────────┘
//! ```
//!
//! # Single-writer discipline
//!
//! The node table, self record, and channel registry live together behind
//! one `tokio::sync::Mutex`.  Every mutation (hello handling, sweeps,
//! promote/demote/advertise, join/leave) takes that lock, so a reader such
//! as [`Discovery::nodes`] can never observe a half-merged record.  Events
//! are published while the lock is held so subscribers see them in the order
//! the state changed.  Datagrams are sent after the lock is released.
//!
//! # Timers (for beginners)
//!
//! `tokio::time::interval_at(now + period, period)` yields its first tick one
//! period after start, then every period.  Under `#[tokio::test(start_paused
//! = true)]` the clock only moves when every task is idle, which makes the
//! election scenarios in `tests/` deterministic.
//!
//! The reassembly buffer lives inside the receive task, which wakes either
//! for the next datagram or for the earliest partial-block deadline.
//!
//! # Lifecycle
//!
//! [`Discovery::stop`] cancels only the two timers.  The receive task keeps
//! running, so a stopped node still tracks its peers and serves joined
//! channels; it just stops announcing itself.  The receive task ends when the
//! handle is dropped or the transport closes.

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use beacon_core::domain::membership::is_reserved;
use beacon_core::protocol::envelope::local_host_name;
use beacon_core::{
    Delivery, HelloPayload, Identity, Inbound, Membership, MembershipEvent, Node, Origin,
    Outbound, Outcome, PipelineConfig, PipelineError, SelfRecord, HELLO_EVENT,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::application::channels::{ChannelHandler, ChannelMessage, ChannelRegistry};
use crate::infrastructure::network::udp::UdpTransport;
use crate::infrastructure::network::{DatagramTransport, TransportError};
use crate::infrastructure::storage::config::{ConfigError, DiscoveryConfig};

/// Capacity of the event broadcast channel.  Slow subscribers that fall
/// further behind than this observe `RecvError::Lagged`.
const EVENT_CAPACITY: usize = 256;

/// Pause after a failed `recv` before polling the socket again.
const RECV_BACKOFF: Duration = Duration::from_millis(100);

/// Error type for discovery operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The configuration is invalid; no instance was created.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// `join`, `leave`, or `send` was called with a reserved event name.
    #[error("'{0}' is a reserved event name")]
    ReservedName(String),

    /// The transport could not be created or queried.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// An outbound message could not be encoded, or the pipeline could not
    /// be built.
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Something subscribers may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// This instance became master.
    Promotion(SelfRecord),
    /// This instance stopped being master.
    Demotion(SelfRecord),
    /// A peer was heard for the first time.
    Added(Node),
    /// A peer went silent for longer than the node timeout.
    Removed(Node),
    /// A peer claimed mastership for the first time.
    Master(Node),
    /// A datagram or message was dropped.  Only published when
    /// `ignore_data_errors` is off.
    DataError(PipelineError),
    /// The transport failed to send or receive.
    SocketError(String),
}

impl From<MembershipEvent> for DiscoveryEvent {
    fn from(event: MembershipEvent) -> Self {
        match event {
            MembershipEvent::Promotion(me) => DiscoveryEvent::Promotion(me),
            MembershipEvent::Demotion(me) => DiscoveryEvent::Demotion(me),
            MembershipEvent::Added(node) => DiscoveryEvent::Added(node),
            MembershipEvent::Removed(node) => DiscoveryEvent::Removed(node),
            MembershipEvent::Master(node) => DiscoveryEvent::Master(node),
        }
    }
}

// ── Shared state ──────────────────────────────────────────────────────────────

#[derive(Debug)]
struct State {
    membership: Membership,
    channels: ChannelRegistry,
}

/// Everything the background tasks and the public handle share.
struct Shared {
    transport: Arc<dyn DatagramTransport>,
    outbound: Outbound,
    pipeline: PipelineConfig,
    hello_interval: Duration,
    check_interval: Duration,
    ignore_data_errors: bool,
    state: Mutex<State>,
    events: broadcast::Sender<DiscoveryEvent>,
}

/// The runtime clock.  Read through tokio so paused-time tests control it.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

fn ensure_not_reserved(name: &str) -> Result<(), DiscoveryError> {
    if is_reserved(name) {
        return Err(DiscoveryError::ReservedName(name.to_string()));
    }
    Ok(())
}

impl Shared {
    fn instance_id(&self) -> &str {
        &self.outbound.identity().instance_id
    }

    fn publish(&self, event: DiscoveryEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn data_error(&self, error: PipelineError) {
        if self.ignore_data_errors {
            debug!("dropped: {error}");
        } else {
            warn!("{error}");
            self.publish(DiscoveryEvent::DataError(error));
        }
    }

    /// Applies `f` to the membership under the state lock, publishes the
    /// resulting events, and announces if asked to.
    async fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut Membership) -> Outcome,
    {
        let hello = {
            let mut state = self.state.lock().await;
            let outcome = f(&mut state.membership);
            for event in outcome.events {
                self.publish(event.into());
            }
            outcome.announce.then(|| state.membership.hello())
        };
        if let Some(hello) = hello {
            self.send_hello(hello).await;
        }
    }

    /// Encodes and sends one message.  Socket failures are published and
    /// abandon the rest of the message; only encode failures are returned.
    async fn transmit(&self, event: &str, data: Value) -> Result<(), PipelineError> {
        let datagrams = self.outbound.encode(event, data)?;
        trace!("sending '{event}' in {} datagram(s)", datagrams.len());
        for datagram in datagrams {
            if let Err(e) = self.transport.send(datagram).await {
                warn!("failed to send '{event}': {e}");
                self.publish(DiscoveryEvent::SocketError(e.to_string()));
                break;
            }
        }
        Ok(())
    }

    async fn send_hello(&self, hello: HelloPayload) {
        let result = match serde_json::to_value(&hello) {
            Ok(data) => self.transmit(HELLO_EVENT, data).await,
            Err(e) => Err(PipelineError::Encode(e.to_string())),
        };
        if let Err(e) = result {
            self.data_error(e);
        }
    }

    async fn announce(&self) {
        let hello = self.state.lock().await.membership.hello();
        self.send_hello(hello).await;
    }

    /// Routes a decoded envelope to the membership engine or to channel
    /// handlers.
    async fn dispatch(&self, delivery: Delivery) {
        let Delivery { envelope, source } = delivery;

        if envelope.event == HELLO_EVENT {
            // Our own hello never reaches the node table, whatever the
            // ignore mode.
            if envelope.iid == self.instance_id() {
                return;
            }
            let hello: HelloPayload = match serde_json::from_value(envelope.data) {
                Ok(hello) => hello,
                Err(e) => {
                    self.data_error(PipelineError::Decode(format!(
                        "hello from {source}: {e}"
                    )));
                    return;
                }
            };
            let origin = Origin {
                instance_id: envelope.iid,
                process_id: envelope.pid,
                host_name: envelope.host_name,
                source,
            };
            let seen = now();
            self.update(|membership| membership.handle_hello(&origin, &hello, seen))
                .await;
            return;
        }

        let handlers = self.state.lock().await.channels.handlers(&envelope.event);
        if handlers.is_empty() {
            trace!("no handlers for '{}' from {source}", envelope.event);
            return;
        }
        let message = ChannelMessage::from_envelope(envelope, source);
        for handler in handlers {
            handler(message.clone());
        }
    }
}

// ── Background tasks ──────────────────────────────────────────────────────────

fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn heartbeat_loop(shared: Arc<Shared>) {
    let mut ticker = ticker(shared.hello_interval);
    loop {
        ticker.tick().await;
        shared.announce().await;
    }
}

async fn health_loop(shared: Arc<Shared>) {
    let mut ticker = ticker(shared.check_interval);
    loop {
        ticker.tick().await;
        let at = now();
        shared.update(|membership| membership.sweep(at)).await;
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

async fn receive_loop(shared: Arc<Shared>, mut inbound: Inbound) {
    loop {
        for error in inbound.expire(now()) {
            shared.data_error(error);
        }

        let received = tokio::select! {
            result = shared.transport.recv() => result,
            () = sleep_until(inbound.next_deadline()) => continue,
        };

        match received {
            Ok((datagram, source)) => match inbound.ingest(&datagram, source, now()) {
                Ok(Some(delivery)) => shared.dispatch(delivery).await,
                Ok(None) => {}
                Err(e) => shared.data_error(e),
            },
            Err(TransportError::Closed) => {
                info!("transport closed; receive loop stopped");
                break;
            }
            Err(e) => {
                warn!("receive failed: {e}");
                shared.publish(DiscoveryEvent::SocketError(e.to_string()));
                tokio::time::sleep(RECV_BACKOFF).await;
            }
        }
    }
}

/// The two engine timers.  The receive task is tracked separately because
/// it outlives [`Discovery::stop`].
struct Timers {
    heartbeat: JoinHandle<()>,
    health: JoinHandle<()>,
}

impl Timers {
    fn abort(self) {
        self.heartbeat.abort();
        self.health.abort();
    }
}

// ── Public handle ─────────────────────────────────────────────────────────────

/// A discovery instance: one node on the segment.
///
/// Created stopped.  [`start`](Self::start) spawns the timers (and, the
/// first time, the receive task) on the current tokio runtime;
/// [`stop`](Self::stop) cancels the timers.  Dropping the handle aborts
/// everything.
pub struct Discovery {
    shared: Arc<Shared>,
    timers: StdMutex<Option<Timers>>,
    receive: StdMutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Discovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Discovery")
            .field("instance_id", &self.shared.instance_id())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Discovery {
    /// Creates a stopped instance on top of `transport`.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::Config`] if `config` fails validation (including the
    /// interval ordering), [`DiscoveryError::Transport`] if the transport
    /// cannot report its local address.
    pub fn new(
        config: DiscoveryConfig,
        transport: Arc<dyn DatagramTransport>,
    ) -> Result<Self, DiscoveryError> {
        config.validate()?;

        let identity = Identity::generate(config.host_name.clone().unwrap_or_else(local_host_name));
        let local = transport.local_addr()?;
        let me = SelfRecord {
            id: identity.instance_id.clone(),
            process_id: identity.process_id.clone(),
            host_name: identity.host_name.clone(),
            address: local.ip().to_string(),
            port: local.port(),
            is_master: false,
            is_master_eligible: true,
            weight: config.weight.unwrap_or_else(rand::random::<f64>),
            info: None,
        };
        let membership =
            Membership::new(config.election_settings(), me).map_err(ConfigError::from)?;

        let pipeline = config.pipeline_config();
        let outbound = Outbound::new(&pipeline, identity)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        info!(
            "discovery instance {} on {local} (weight {})",
            outbound.identity().instance_id,
            membership.me().weight
        );

        Ok(Self {
            shared: Arc::new(Shared {
                transport,
                outbound,
                pipeline,
                hello_interval: config.hello_interval(),
                check_interval: config.election_settings().check_interval,
                ignore_data_errors: config.ignore_data_errors,
                state: Mutex::new(State {
                    membership,
                    channels: ChannelRegistry::default(),
                }),
                events,
            }),
            timers: StdMutex::new(None),
            receive: StdMutex::new(None),
        })
    }

    /// Binds a UDP socket as described by `config` and creates a stopped
    /// instance on it.
    ///
    /// # Errors
    ///
    /// As [`Discovery::new`], plus [`DiscoveryError::Transport`] if the
    /// socket cannot be bound or configured.
    pub async fn bind(config: DiscoveryConfig) -> Result<Self, DiscoveryError> {
        config.validate()?;
        let transport =
            UdpTransport::bind(config.bind_address()?, config.port, config.udp_mode()?).await?;
        Self::new(config, Arc::new(transport))
    }

    /// Spawns the heartbeat and health-check timers, plus the receive task
    /// on first start.  A no-op when already running.  Must be called from
    /// within a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::Pipeline`] if the inbound pipeline cannot be built.
    pub fn start(&self) -> Result<(), DiscoveryError> {
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        if timers.is_some() {
            return Ok(());
        }

        let mut receive = self.receive.lock().unwrap_or_else(PoisonError::into_inner);
        if receive.is_none() {
            let inbound =
                Inbound::new(&self.shared.pipeline, self.shared.outbound.identity().clone())?;
            *receive = Some(tokio::spawn(receive_loop(Arc::clone(&self.shared), inbound)));
        }

        *timers = Some(Timers {
            heartbeat: tokio::spawn(heartbeat_loop(Arc::clone(&self.shared))),
            health: tokio::spawn(health_loop(Arc::clone(&self.shared))),
        });
        info!("discovery {} started", self.shared.instance_id());
        Ok(())
    }

    /// Cancels the heartbeat and health-check timers.  Inbound hellos and
    /// channel messages are still processed.  Idempotent; a no-op before
    /// [`start`](Self::start).
    pub fn stop(&self) {
        let timers = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timers) = timers {
            timers.abort();
            info!("discovery {} stopped", self.shared.instance_id());
        }
    }

    /// Whether the timers are running.
    pub fn is_running(&self) -> bool {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// This instance's id, as carried in the `iid` of every envelope.
    pub fn instance_id(&self) -> &str {
        self.shared.instance_id()
    }

    /// Receives every [`DiscoveryEvent`] published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.shared.events.subscribe()
    }

    // ── Election ──────────────────────────────────────────────────────────────

    /// Becomes master and announces it immediately.
    pub async fn promote(&self) {
        self.shared.update(Membership::promote).await;
    }

    /// Stops being master and announces it immediately.  A permanent
    /// demotion also gives up eligibility for good.
    pub async fn demote(&self, permanent: bool) {
        self.shared
            .update(|membership| membership.demote(permanent))
            .await;
    }

    /// Sets the payload carried in `info` by every subsequent hello.
    /// `Value::Null` clears it.
    pub async fn advertise(&self, info: Value) {
        self.shared.state.lock().await.membership.advertise(Some(info));
    }

    /// Broadcasts a hello now instead of waiting for the next heartbeat.
    pub async fn hello(&self) {
        self.shared.announce().await;
    }

    /// Snapshot of the self record.
    pub async fn me(&self) -> SelfRecord {
        self.shared.state.lock().await.membership.me().clone()
    }

    /// Snapshot of the node table.
    pub async fn nodes(&self) -> Vec<Node> {
        self.shared.state.lock().await.membership.nodes()
    }

    /// Calls `f` for each node in a snapshot of the table.  The lock is not
    /// held while `f` runs.
    pub async fn each_node<F>(&self, mut f: F)
    where
        F: FnMut(&Node),
    {
        for node in self.nodes().await {
            f(&node);
        }
    }

    // ── Channels ──────────────────────────────────────────────────────────────

    /// Subscribes `handler` to channel `name`.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::ReservedName`] for membership event names.
    pub async fn join<F>(&self, name: &str, handler: F) -> Result<(), DiscoveryError>
    where
        F: Fn(ChannelMessage) + Send + Sync + 'static,
    {
        ensure_not_reserved(name)?;
        let handler: ChannelHandler = Arc::new(handler);
        if self.shared.state.lock().await.channels.join(name, handler) {
            debug!("joined channel '{name}'");
        }
        Ok(())
    }

    /// Removes every handler for channel `name`.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::ReservedName`] for membership event names.
    pub async fn leave(&self, name: &str) -> Result<(), DiscoveryError> {
        ensure_not_reserved(name)?;
        if self.shared.state.lock().await.channels.leave(name) {
            debug!("left channel '{name}'");
        }
        Ok(())
    }

    /// Broadcasts `data` on channel `name`.
    ///
    /// Socket failures are published as [`DiscoveryEvent::SocketError`].
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::ReservedName`] for membership event names, and
    /// [`DiscoveryError::Pipeline`] for encode failures when
    /// `ignore_data_errors` is off.
    pub async fn send(&self, name: &str, data: Value) -> Result<(), DiscoveryError> {
        ensure_not_reserved(name)?;
        match self.shared.transmit(name, data).await {
            Ok(()) => Ok(()),
            Err(e) if self.shared.ignore_data_errors => {
                debug!("dropped outbound '{name}': {e}");
                Ok(())
            }
            Err(e) => Err(DiscoveryError::Pipeline(e)),
        }
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop();
        let receive = self
            .receive
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(receive) = receive {
            receive.abort();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::network::MockDatagramTransport;
    use beacon_core::protocol::wrap::MAGIC;
    use serde_json::json;
    use std::io;
    use tokio_test::{assert_err, assert_ok};

    fn mock_transport() -> MockDatagramTransport {
        let mut mock = MockDatagramTransport::new();
        mock.expect_local_addr()
            .returning(|| Ok("127.0.0.1:12345".parse().unwrap()));
        mock
    }

    fn config() -> DiscoveryConfig {
        DiscoveryConfig {
            weight: Some(0.42),
            host_name: Some("test-host".to_string()),
            ..DiscoveryConfig::default()
        }
    }

    fn discovery(mock: MockDatagramTransport) -> Discovery {
        Discovery::new(config(), Arc::new(mock)).expect("construct")
    }

    // ── Construction ──────────────────────────────────────────────────────────

    #[test]
    fn test_new_rejects_node_timeout_below_check_interval() {
        // Arrange
        let cfg = DiscoveryConfig {
            check_interval_ms: 3000,
            node_timeout_ms: 2000,
            ..config()
        };

        // Act
        let result = Discovery::new(cfg, Arc::new(mock_transport()));

        // Assert
        assert!(matches!(result, Err(DiscoveryError::Config(_))));
    }

    #[tokio::test]
    async fn test_new_initialises_self_record() {
        // Arrange / Act
        let d = discovery(mock_transport());
        let me = d.me().await;

        // Assert
        assert_eq!(me.id, d.instance_id());
        assert_eq!(me.host_name, "test-host");
        assert_eq!(me.weight, 0.42);
        assert_eq!(me.port, 12345);
        assert!(!me.is_master);
        assert!(me.is_master_eligible);
        assert!(me.info.is_none());
        assert!(d.nodes().await.is_empty());
    }

    #[test]
    fn test_default_weight_is_in_unit_interval() {
        let cfg = DiscoveryConfig {
            weight: None,
            ..config()
        };
        let d = Discovery::new(cfg, Arc::new(mock_transport())).unwrap();

        let weight = tokio_test::block_on(d.me()).weight;

        assert!((0.0..1.0).contains(&weight));
    }

    // ── Reserved names ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_reserved_names_are_rejected_without_sending() {
        // Arrange
        let mut mock = mock_transport();
        mock.expect_send().times(0);
        let d = discovery(mock);

        // Act / Assert
        for name in ["hello", "promotion", "demotion", "added", "removed", "master"] {
            assert!(matches!(
                d.send(name, json!({})).await,
                Err(DiscoveryError::ReservedName(ref n)) if n == name
            ));
            assert_err!(d.join(name, |_| {}).await);
            assert_err!(d.leave(name).await);
        }
    }

    // ── Outbound traffic ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_send_emits_wrapped_datagram() {
        // Arrange
        let mut mock = mock_transport();
        mock.expect_send()
            .withf(|datagram| datagram.starts_with(&MAGIC))
            .times(1)
            .returning(|_| Ok(()));
        let d = discovery(mock);

        // Act / Assert
        assert_ok!(d.send("jobs", json!({"id": 7})).await);
    }

    #[tokio::test]
    async fn test_large_send_emits_one_datagram_per_fragment() {
        // Arrange
        let mut mock = mock_transport();
        mock.expect_send()
            .withf(|datagram| datagram.len() <= 1500)
            .times(3..)
            .returning(|_| Ok(()));
        let d = discovery(mock);

        // Act / Assert
        assert_ok!(d.send("blob", json!("x".repeat(4000))).await);
    }

    #[tokio::test]
    async fn test_promote_publishes_and_announces() {
        // Arrange
        let mut mock = mock_transport();
        mock.expect_send().times(1).returning(|_| Ok(()));
        let d = discovery(mock);
        let mut events = d.subscribe();

        // Act
        d.promote().await;

        // Assert
        assert!(d.me().await.is_master);
        match events.try_recv() {
            Ok(DiscoveryEvent::Promotion(me)) => assert!(me.is_master),
            other => panic!("expected promotion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_permanent_demote_clears_eligibility() {
        let mut mock = mock_transport();
        mock.expect_send().times(2).returning(|_| Ok(()));
        let d = discovery(mock);

        d.promote().await;
        d.demote(true).await;

        let me = d.me().await;
        assert!(!me.is_master);
        assert!(!me.is_master_eligible);
    }

    #[tokio::test]
    async fn test_advertise_sets_and_clears_info() {
        let d = discovery(mock_transport());

        d.advertise(json!({"http": 8080})).await;
        assert_eq!(d.me().await.info, Some(json!({"http": 8080})));

        d.advertise(Value::Null).await;
        assert_eq!(d.me().await.info, None);
    }

    #[tokio::test]
    async fn test_socket_failure_is_published_not_returned() {
        // Arrange
        let mut mock = mock_transport();
        mock.expect_send().times(1).returning(|_| {
            Err(TransportError::Send {
                dest: "255.255.255.255:12345".parse().unwrap(),
                source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
            })
        });
        let d = discovery(mock);
        let mut events = d.subscribe();

        // Act
        let result = d.send("jobs", json!(1)).await;

        // Assert
        assert_ok!(result);
        assert!(matches!(events.try_recv(), Ok(DiscoveryEvent::SocketError(_))));
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        // Arrange: the receive loop ends as soon as the mock reports closed.
        let mut mock = mock_transport();
        mock.expect_recv().returning(|| Err(TransportError::Closed));
        mock.expect_send().returning(|_| Ok(()));
        let d = discovery(mock);

        // Act / Assert
        d.stop();
        assert!(!d.is_running());

        assert_ok!(d.start());
        assert_ok!(d.start());
        assert!(d.is_running());

        d.stop();
        d.stop();
        assert!(!d.is_running());

        assert_ok!(d.start());
        assert!(d.is_running());
    }

    #[tokio::test]
    async fn test_recv_error_is_published_as_socket_error() {
        // Arrange: one failure, then closed.
        let mut mock = mock_transport();
        let mut seq = mockall::Sequence::new();
        mock.expect_recv()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(TransportError::Recv(io::Error::new(io::ErrorKind::Other, "boom"))));
        mock.expect_recv()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(TransportError::Closed));
        mock.expect_send().returning(|_| Ok(()));
        let d = discovery(mock);
        let mut events = d.subscribe();

        // Act
        d.start().unwrap();
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event within timeout");

        // Assert
        assert!(matches!(event, Ok(DiscoveryEvent::SocketError(_))));
        d.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_recv_failure_backs_off() {
        // Arrange: the socket fails on every read.
        let mut mock = mock_transport();
        mock.expect_recv().returning(|| {
            Err(TransportError::Recv(io::Error::new(
                io::ErrorKind::Other,
                "interface down",
            )))
        });
        mock.expect_send().returning(|_| Ok(()));
        let d = discovery(mock);
        let mut events = d.subscribe();

        // Act
        d.start().unwrap();
        tokio::time::sleep(Duration::from_millis(950)).await;
        d.stop();

        // Assert: one failure per backoff period, not a hot loop.
        let mut failures = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, DiscoveryEvent::SocketError(_)) {
                failures += 1;
            }
        }
        assert!((1..=10).contains(&failures), "got {failures} socket errors");
    }
}
