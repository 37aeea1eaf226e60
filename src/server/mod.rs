use crate::config::ServerConfig;
use crate::error::{ControlError, ControlResult, ErrorCode};
use crate::protocol::{
    Ack, Body, CreateSubscriptionService, DropFromSubscriptionService, Event, EventKind, Message,
    RegisterSubscriptionService, RegisterSubscriptionServiceResponse, RegisterWorkers,
    RegisterWorkersResponse, StreamId, check_unique_repeated,
};
use crate::transport::{EventWriter, ServerEvent, StreamAcceptor, tcp};
use crate::utils::{LiveFlag, StopToken, pin_to_core};
use crossbeam::channel::{self as cbchan, RecvTimeoutError};
use signal_hook::consts::TERM_SIGNALS;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub mod registry;
pub mod subscription;
pub mod tagged;

use registry::Registry;
use subscription::SubscriptionService;
use tagged::TaggedService;

/// Upper bound on one scheduler wait so stop tokens and signal flags
/// are observed promptly even with a long update period.
const LOOP_TICK: Duration = Duration::from_millis(100);

/// Control-plane server.
///
/// A single event-loop thread owns all membership state: the client
/// registry, every subscription service and the UCX address set.
/// Transports deliver envelopes into one queue; handlers run serially
/// to completion, which stands in for a global state lock. The same
/// loop paces subscription update diffusion,
/// either on the periodic deadline or immediately after a handler
/// requests a coalesced tick.
pub struct Server {
    queue_tx: cbchan::Sender<ServerEvent>,
    acceptor: StreamAcceptor,
    stop: StopToken,
    live: LiveFlag,
    join: Option<JoinHandle<()>>,
    tcp: Option<tcp::TcpAcceptorHandle>,
}

impl Server {
    pub fn spawn(cfg: ServerConfig) -> anyhow::Result<Self> {
        let (queue_tx, queue_rx) = cbchan::unbounded::<ServerEvent>();
        let stop = StopToken::new_root();
        let live = LiveFlag::new(false);

        let term_flag = if cfg.install_signal_handler {
            let flag = Arc::new(AtomicBool::new(false));
            for sig in TERM_SIGNALS {
                signal_hook::flag::register(*sig, flag.clone())?;
            }
            Some(flag)
        } else {
            None
        };

        let acceptor = StreamAcceptor::new(
            queue_tx.clone(),
            stop.child(),
            cfg.stream_buffer(),
            cfg.write_patience(),
        );

        let tcp = match cfg.listen_addr.as_deref() {
            Some(addr) => Some(tcp::spawn_acceptor(addr, acceptor.clone(), stop.child())?),
            None => None,
        };

        // the loop gets the root token: a fatal shutdown raised from
        // inside must also stop the acceptors
        let loop_stop = stop.clone();
        let loop_live = live.clone();
        let join = thread::spawn(move || {
            if let Some(core_id) = cfg.core_id {
                match pin_to_core(core_id) {
                    Ok(()) => tracing::info!("[ControlPlaneServer] pinned to core {core_id}"),
                    Err(e) => tracing::warn!("[ControlPlaneServer] cannot pin core: {e}"),
                }
            }
            let mut state = ServerState::new(&cfg, loop_stop);
            state.run(queue_rx, loop_live, term_flag);
        });

        Ok(Self {
            queue_tx,
            acceptor,
            stop,
            live,
            join: Some(join),
            tcp,
        })
    }

    /// Factory for in-process client streams; cloned freely.
    pub fn acceptor(&self) -> StreamAcceptor {
        self.acceptor.clone()
    }

    /// Bound address of the TCP acceptor, when one was configured.
    pub fn tcp_local_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().map(|t| t.local_addr())
    }

    /// Block until the event loop is serving (or `timeout` elapses).
    pub fn await_live(&self, timeout: Duration) -> bool {
        self.live.wait_up(timeout)
    }

    /// Ask the scheduler for a coalesced update tick.
    pub fn request_update(&self) {
        let _ = self.queue_tx.send(ServerEvent::RequestUpdate);
    }

    /// Orderly stop: refuse new streams, drain the queue, diffuse any
    /// pending updates, drop every stream, exit.
    pub fn stop(&self) {
        self.stop.stop();
        let _ = self.queue_tx.send(ServerEvent::Wake);
    }

    /// Immediate stop: the queue is discarded and in-flight writes are
    /// abandoned.
    pub fn kill(&self) {
        self.stop.kill();
        let _ = self.queue_tx.send(ServerEvent::Wake);
    }

    /// Wait for the event loop (and the TCP runner, if any) to end.
    pub fn join(mut self) -> anyhow::Result<()> {
        if let Some(join) = self.join.take()
            && join.join().is_err()
        {
            anyhow::bail!("control plane event loop panicked");
        }
        if let Some(tcp) = self.tcp.take() {
            tcp.join()?;
        }
        Ok(())
    }

    /// `stop` + `join`.
    pub fn shutdown(self) -> anyhow::Result<()> {
        self.stop();
        self.join()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop.stop();
        let _ = self.queue_tx.send(ServerEvent::Wake);
    }
}

/// All mutable control-plane state. Lives on the event-loop thread and
/// never escapes it.
struct ServerState {
    stop: StopToken,
    registry: Registry,
    services: BTreeMap<String, SubscriptionService>,
    max_streams: usize,
    max_drain: usize,
    update_period: Duration,
    update_requested: bool,
    /// Streams whose diffusion writes failed; cascaded next iteration.
    cleanup: Vec<StreamId>,
    fatal: Option<String>,
}

impl ServerState {
    fn new(cfg: &ServerConfig, stop: StopToken) -> Self {
        Self {
            stop,
            registry: Registry::new(),
            services: BTreeMap::new(),
            max_streams: cfg.max_streams(),
            max_drain: cfg.max_events_drain(),
            update_period: cfg.update_period(),
            update_requested: false,
            cleanup: Vec::new(),
            fatal: None,
        }
    }

    fn run(
        &mut self,
        queue_rx: cbchan::Receiver<ServerEvent>,
        live: LiveFlag,
        term_flag: Option<Arc<AtomicBool>>,
    ) {
        live.up();
        tracing::info!("[ControlPlaneServer] event loop started");
        let mut next_update = Instant::now() + self.update_period;

        loop {
            if let Some(flag) = &term_flag
                && flag.load(Ordering::Relaxed)
            {
                tracing::warn!("[ControlPlaneServer] termination signal received");
                self.stop.stop();
            }
            if self.stop.is_killed() {
                break;
            }
            if self.stop.is_stopped() {
                self.drain_and_stop(&queue_rx);
                break;
            }

            for stream_id in std::mem::take(&mut self.cleanup) {
                self.drop_stream(stream_id);
            }

            let wait = if self.update_requested {
                Duration::ZERO
            } else {
                next_update
                    .saturating_duration_since(Instant::now())
                    .min(LOOP_TICK)
            };
            match queue_rx.recv_timeout(wait) {
                Ok(event) => {
                    self.handle(event);
                    let mut handled = 1;
                    while handled < self.max_drain && !self.stop.is_killed() {
                        match queue_rx.try_recv() {
                            Ok(event) => {
                                self.handle(event);
                                handled += 1;
                            }
                            Err(_) => break,
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::error!("[ControlPlaneServer] event queue disconnected");
                    break;
                }
            }

            if let Some(message) = self.fatal.take() {
                self.fatal_shutdown(&message);
                break;
            }

            if self.update_requested || Instant::now() >= next_update {
                self.issue_updates();
                self.update_requested = false;
                next_update = Instant::now() + self.update_period;
            }
        }

        live.down();
        tracing::info!("[ControlPlaneServer] event loop stopped");
    }

    /// Orderly-stop tail: handle what is already queued, diffuse any
    /// pending updates, then drop every stream.
    fn drain_and_stop(&mut self, queue_rx: &cbchan::Receiver<ServerEvent>) {
        tracing::info!("[ControlPlaneServer] stopping; draining event queue");
        while let Ok(event) = queue_rx.try_recv() {
            if self.stop.is_killed() {
                return;
            }
            self.handle(event);
        }
        self.issue_updates();
        for stream_id in self.registry.stream_ids() {
            self.drop_stream(stream_id);
        }
    }

    fn handle(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Connected { stream_id, writer } => {
                self.handle_connected(stream_id, writer);
            }
            ServerEvent::Inbound { stream_id, event } => match event.kind {
                EventKind::Request => self.handle_request(stream_id, event),
                EventKind::Disconnect => self.drop_stream(stream_id),
                kind => tracing::warn!(
                    "[ControlPlaneServer] unexpected {kind:?} envelope from stream {stream_id}"
                ),
            },
            ServerEvent::RequestUpdate => self.update_requested = true,
            ServerEvent::Wake => {}
        }
    }

    fn handle_connected(&mut self, stream_id: StreamId, writer: EventWriter) {
        if self.stop.is_stopped() {
            let _ = writer.try_write(Event::error(
                0,
                ErrorCode::InstanceError,
                "server is stopping",
            ));
            return;
        }
        if self.registry.stream_count() >= self.max_streams {
            tracing::warn!(
                "[ControlPlaneServer] rejecting stream {stream_id}: {} concurrent streams reached",
                self.max_streams
            );
            let _ = writer.try_write(Event::error(
                0,
                ErrorCode::InstanceError,
                "max concurrent streams reached",
            ));
            return;
        }
        tracing::debug!("[ControlPlaneServer] stream {stream_id} connected");
        self.registry.add_stream(stream_id, writer);
    }

    fn handle_request(&mut self, stream_id: StreamId, event: Event) {
        let tag = event.tag;
        let result = match event.body {
            Body::Message(msg) => match msg {
                Message::RegisterWorkers(req) => self
                    .unary_register_workers(stream_id, req)
                    .map(Message::RegisterWorkersResponse),
                Message::CreateSubscriptionService(req) => self
                    .unary_create_subscription_service(req)
                    .map(Message::Ack),
                Message::RegisterSubscriptionService(req) => self
                    .unary_register_subscription_service(stream_id, req)
                    .map(Message::RegisterSubscriptionServiceResponse),
                Message::DropFromSubscriptionService(req) => self
                    .unary_drop_from_subscription_service(stream_id, req)
                    .map(Message::Ack),
                other => Err(ControlError::instance(format!(
                    "unable to dispatch request; unexpected message type {}",
                    other.kind_name()
                ))),
            },
            Body::Error(err) => Err(ControlError::new(err.code, err.message)),
            Body::Empty => Err(ControlError::instance(
                "unable to dispatch request; empty payload",
            )),
        };
        self.unary_response(stream_id, tag, result);
    }

    /// Echo the request tag back with either the typed response or an
    /// error body. A failed write is fatal for the stream, not for the
    /// server.
    fn unary_response(&mut self, stream_id: StreamId, tag: u64, result: ControlResult<Message>) {
        let envelope = match result {
            Ok(msg) => Event::response(tag, msg),
            Err(err) => {
                tracing::debug!("[ControlPlaneServer] request on stream {stream_id} failed: {err}");
                if err.is_fatal() {
                    self.fatal = Some(err.message.clone());
                }
                Event::error(tag, err.code, err.message)
            }
        };

        let Some(writer) = self.registry.stream_writer(stream_id) else {
            tracing::warn!(
                "[ControlPlaneServer] no writer for stream {stream_id}; response dropped"
            );
            return;
        };
        if let Err(err) = writer.write(envelope, &self.stop) {
            tracing::warn!(
                "[ControlPlaneServer] response write to stream {stream_id} failed: {err}; dropping stream"
            );
            self.drop_stream(stream_id);
        }
    }

    fn unary_register_workers(
        &mut self,
        stream_id: StreamId,
        req: RegisterWorkers,
    ) -> ControlResult<RegisterWorkersResponse> {
        if req.ucx_worker_addresses.is_empty() {
            return Err(ControlError::instance("no ucx worker addresses in request"));
        }
        check_unique_repeated(&req.ucx_worker_addresses)?;
        let instance_ids = self
            .registry
            .register_workers(stream_id, &req.ucx_worker_addresses)?;
        tracing::info!(
            "[ControlPlaneServer] stream {stream_id} registered {} worker(s)",
            instance_ids.len()
        );
        Ok(RegisterWorkersResponse {
            machine_id: stream_id,
            instance_ids,
        })
    }

    fn unary_create_subscription_service(
        &mut self,
        req: CreateSubscriptionService,
    ) -> ControlResult<Ack> {
        let roles = check_unique_repeated(&req.roles)?;
        match self.services.get(&req.service_name) {
            Some(existing) => {
                if existing.compare_roles(&roles) {
                    tracing::debug!(
                        "[ControlPlaneServer] subscription service {:?} already exists",
                        req.service_name
                    );
                    Ok(Ack)
                } else {
                    Err(ControlError::new(
                        ErrorCode::ServiceMismatch,
                        format!(
                            "subscription service {:?} already exists with a different role set",
                            req.service_name
                        ),
                    ))
                }
            }
            None => {
                let service = SubscriptionService::new(req.service_name.clone(), &roles)?;
                tracing::info!(
                    "[ControlPlaneServer] created subscription service {:?} with roles {:?}",
                    req.service_name,
                    roles
                );
                self.services.insert(req.service_name, service);
                Ok(Ack)
            }
        }
    }

    fn unary_register_subscription_service(
        &mut self,
        stream_id: StreamId,
        req: RegisterSubscriptionService,
    ) -> ControlResult<RegisterSubscriptionServiceResponse> {
        self.registry.validate_instance(req.instance_id, stream_id)?;
        let subscribe_to = check_unique_repeated(&req.subscribe_to_roles)?;
        let service = self.services.get_mut(&req.service_name).ok_or_else(|| {
            ControlError::instance(format!(
                "unknown subscription service {:?}",
                req.service_name
            ))
        })?;
        let tag = service.register_instance(req.instance_id, &req.role, &subscribe_to)?;
        Ok(RegisterSubscriptionServiceResponse {
            service_name: req.service_name,
            role: req.role,
            tag,
            instance_id: req.instance_id,
        })
    }

    fn unary_drop_from_subscription_service(
        &mut self,
        stream_id: StreamId,
        req: DropFromSubscriptionService,
    ) -> ControlResult<Ack> {
        self.registry.validate_instance(req.instance_id, stream_id)?;
        let service = self.services.get_mut(&req.service_name).ok_or_else(|| {
            ControlError::instance(format!(
                "unknown subscription service {:?}",
                req.service_name
            ))
        })?;
        if !service.tagged().valid_tag(req.tag)
            || service.tagged().owner_of(req.tag) != Some(req.instance_id)
        {
            return Err(ControlError::instance(format!(
                "tag {} is not registered to instance {} in service {:?}",
                req.tag, req.instance_id, req.service_name
            )));
        }
        service.drop_tag(req.tag);
        self.update_requested = true;
        Ok(Ack)
    }

    /// Canonical cleanup path: services first, registry last. All
    /// in-memory on one thread, so it cannot partially fail.
    fn drop_stream(&mut self, stream_id: StreamId) {
        let instance_ids = self.registry.instances_of_stream(stream_id);
        if instance_ids.is_empty() && !self.registry.has_stream(stream_id) {
            return;
        }
        tracing::info!(
            "[ControlPlaneServer] dropping stream {stream_id} ({} instance(s))",
            instance_ids.len()
        );
        for instance_id in &instance_ids {
            for service in self.services.values_mut() {
                service.drop_instance(*instance_id);
            }
        }
        for instance_id in instance_ids {
            self.registry.remove_instance(instance_id);
        }
        self.registry.remove_stream(stream_id);
        self.update_requested = true;
    }

    /// Walk every service; dirty roles diffuse, clean roles are no-ops.
    fn issue_updates(&mut self) {
        let mut failed = Vec::new();
        for service in self.services.values_mut() {
            service.issue_update(&mut self.registry, &self.stop, &mut failed);
        }
        failed.sort_unstable();
        failed.dedup();
        self.cleanup.extend(failed);
    }

    /// Hard-failure path: tell every stream, then drop them all.
    fn fatal_shutdown(&mut self, message: &str) {
        tracing::error!("[ControlPlaneServer] fatal: {message}; shutting down");
        for stream_id in self.registry.stream_ids() {
            if let Some(writer) = self.registry.stream_writer(stream_id) {
                let _ = writer.try_write(Event::error(0, ErrorCode::InstanceError, message));
            }
        }
        for stream_id in self.registry.stream_ids() {
            self.drop_stream(stream_id);
        }
        self.stop.stop();
    }
}
