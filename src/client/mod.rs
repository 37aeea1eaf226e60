use crate::error::{ControlError, ControlResult, RecvError, TryRecvError};
use crate::protocol::{
    Ack, Body, CreateSubscriptionService, DropFromSubscriptionService, Event, EventKind,
    FromMessage, InstanceId, Message, RegisterSubscriptionService,
    RegisterSubscriptionServiceResponse, RegisterWorkers, RegisterWorkersResponse,
    SubscriptionServiceUpdate, Tag, unpack,
};
use crate::transport::EventDuplex;
use ahash::AHashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Thin client over one control-plane event stream.
///
/// Requests are numbered with a per-stream tag counter and block until
/// the correlated response (or error) arrives. Server-initiated
/// updates observed while waiting are parked in an inbox; stale
/// updates are deduplicated by per-role nonce, which is where the
/// strict-monotonicity guarantee becomes visible to the worker.
pub struct ControlPlaneClient<S: EventDuplex> {
    stream: S,
    next_tag: Tag,
    timeout: Duration,
    updates: VecDeque<SubscriptionServiceUpdate>,
    seen_nonces: AHashMap<(String, String), u64>,
}

impl<S: EventDuplex> ControlPlaneClient<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            next_tag: 1,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            updates: VecDeque::new(),
            seen_nonces: AHashMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register_workers(
        &mut self,
        ucx_worker_addresses: Vec<String>,
    ) -> ControlResult<RegisterWorkersResponse> {
        self.request(Message::RegisterWorkers(RegisterWorkers {
            ucx_worker_addresses,
        }))
    }

    pub fn create_subscription_service(
        &mut self,
        service_name: &str,
        roles: Vec<String>,
    ) -> ControlResult<Ack> {
        self.request(Message::CreateSubscriptionService(CreateSubscriptionService {
            service_name: service_name.to_string(),
            roles,
        }))
    }

    pub fn register_subscription_service(
        &mut self,
        service_name: &str,
        instance_id: InstanceId,
        role: &str,
        subscribe_to_roles: Vec<String>,
    ) -> ControlResult<RegisterSubscriptionServiceResponse> {
        self.request(Message::RegisterSubscriptionService(
            RegisterSubscriptionService {
                service_name: service_name.to_string(),
                instance_id,
                role: role.to_string(),
                subscribe_to_roles,
            },
        ))
    }

    pub fn drop_from_subscription_service(
        &mut self,
        service_name: &str,
        instance_id: InstanceId,
        tag: Tag,
    ) -> ControlResult<Ack> {
        self.request(Message::DropFromSubscriptionService(
            DropFromSubscriptionService {
                service_name: service_name.to_string(),
                instance_id,
                tag,
            },
        ))
    }

    /// Pop the next parked update, first absorbing anything readable
    /// without blocking.
    pub fn poll_update(&mut self) -> Option<SubscriptionServiceUpdate> {
        loop {
            match self.stream.try_recv() {
                Ok(event) => self.absorb(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        self.updates.pop_front()
    }

    /// Block up to `timeout` for the next update.
    pub fn wait_update(&mut self, timeout: Duration) -> Option<SubscriptionServiceUpdate> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(update) = self.poll_update() {
                return Some(update);
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return None;
            };
            match self.stream.recv_timeout(remaining) {
                Ok(event) => self.absorb(event),
                Err(RecvError::Timeout) | Err(RecvError::Disconnected) => return None,
            }
        }
    }

    /// Tear the stream down, telling the server to run its cascade.
    pub fn disconnect(self) {
        self.stream.disconnect();
    }

    fn request<T: FromMessage>(&mut self, msg: Message) -> ControlResult<T> {
        let tag = self.next_tag;
        self.next_tag += 1;

        self.stream
            .send(Event::request(tag, msg))
            .map_err(|e| ControlError::instance(format!("stream send failed: {e}")))?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(ControlError::instance(format!(
                    "timed out waiting for response to tag {tag}"
                )));
            };
            match self.stream.recv_timeout(remaining) {
                Ok(event) => match event.kind {
                    EventKind::Update => self.absorb(event),
                    EventKind::Response | EventKind::Error if event.tag == tag => {
                        return unpack(event);
                    }
                    // stale reply to an earlier timed-out request, or noise
                    kind => tracing::debug!(
                        "[ControlPlaneClient] ignoring {kind:?} envelope with tag {}",
                        event.tag
                    ),
                },
                Err(RecvError::Timeout) => continue,
                Err(RecvError::Disconnected) => {
                    return Err(ControlError::instance("stream disconnected"));
                }
            }
        }
    }

    /// Park an update, dropping replays whose nonce does not advance
    /// the (service, role) cursor.
    fn absorb(&mut self, event: Event) {
        match event.kind {
            EventKind::Update => {
                if let Body::Message(Message::SubscriptionServiceUpdate(update)) = event.body {
                    let key = (update.service_name.clone(), update.role.clone());
                    if let Some(&last) = self.seen_nonces.get(&key)
                        && update.nonce <= last
                    {
                        tracing::debug!(
                            "[ControlPlaneClient] dropping stale update {}/{} nonce {} (seen {})",
                            update.service_name,
                            update.role,
                            update.nonce,
                            last
                        );
                        return;
                    }
                    self.seen_nonces.insert(key, update.nonce);
                    self.updates.push_back(update);
                }
            }
            EventKind::Error => {
                if let Body::Error(err) = &event.body {
                    tracing::warn!(
                        "[ControlPlaneClient] unsolicited error from server: {} ({})",
                        err.message,
                        err.code
                    );
                }
            }
            kind => tracing::debug!("[ControlPlaneClient] ignoring {kind:?} envelope"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WriteError;
    use crate::protocol::UpdateEntry;

    /// Canned duplex: events queued here come back from `recv`.
    struct FakeStream {
        inbox: VecDeque<Event>,
    }

    impl EventDuplex for FakeStream {
        fn send(&mut self, _event: Event) -> Result<(), WriteError> {
            Ok(())
        }

        fn try_recv(&mut self) -> Result<Event, TryRecvError> {
            self.inbox.pop_front().ok_or(TryRecvError::Empty)
        }

        fn recv_timeout(&mut self, _timeout: Duration) -> Result<Event, RecvError> {
            self.inbox.pop_front().ok_or(RecvError::Timeout)
        }

        fn disconnect(self) {}
    }

    fn update(nonce: u64) -> Event {
        Event::update(
            nonce,
            Message::SubscriptionServiceUpdate(SubscriptionServiceUpdate {
                service_name: "demo".into(),
                role: "sub".into(),
                nonce,
                entries: vec![UpdateEntry {
                    tag: 1,
                    instance_id: 1,
                }],
            }),
        )
    }

    #[test]
    fn stale_updates_are_dropped_by_nonce() {
        let stream = FakeStream {
            inbox: VecDeque::from([update(2), update(1), update(3)]),
        };
        let mut client = ControlPlaneClient::new(stream);

        assert_eq!(client.poll_update().map(|u| u.nonce), Some(2));
        // nonce 1 is a replay and must not surface
        assert_eq!(client.poll_update().map(|u| u.nonce), Some(3));
        assert_eq!(client.poll_update(), None);
    }

    #[test]
    fn updates_while_waiting_for_response_are_parked() {
        let stream = FakeStream {
            inbox: VecDeque::from([update(1), Event::response(1, Message::Ack(Ack))]),
        };
        let mut client = ControlPlaneClient::new(stream);

        let ack: Ack = client.request(Message::Ack(Ack)).expect("response arrives");
        assert_eq!(ack, Ack);
        assert_eq!(client.poll_update().map(|u| u.nonce), Some(1));
    }
}
