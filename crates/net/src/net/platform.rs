//! Platform networking layer behind the builtin driver.
//!
//! A platform hands out its own connection ids and carries two logical
//! channels per connection. [`SimPlatform`] is an in-process relay with
//! configurable loss and latency on the unreliable channel.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub type NativeId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformChannel {
    Ordered,
    Unreliable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    Connected(NativeId),
    Disconnected(NativeId),
    Data {
        id: NativeId,
        channel: PlatformChannel,
        payload: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("ordered channel is full")]
    WouldBlock,
    #[error("unknown platform connection {0}")]
    UnknownConnection(NativeId),
    #[error("port {0} is already in use")]
    AddressInUse(u16),
    #[error("nothing is listening on port {0}")]
    Unreachable(u16),
}

/// Connection-oriented networking supplied by the hosting platform.
pub trait NetworkPlatform {
    fn listen(&mut self, port: u16) -> Result<(), PlatformError>;

    fn connect(&mut self, host: &str, port: u16) -> Result<NativeId, PlatformError>;

    fn send(
        &mut self,
        id: NativeId,
        channel: PlatformChannel,
        payload: &[u8],
    ) -> Result<(), PlatformError>;

    /// Closes one connection; the remote side observes `Disconnected`.
    fn close(&mut self, id: NativeId);

    fn poll(&mut self) -> Option<PlatformEvent>;

    fn shutdown(&mut self);
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketLossSimulation {
    pub enabled: bool,
    pub loss_percent: f32,
    pub min_latency_ms: u32,
    pub max_latency_ms: u32,
    pub jitter_ms: u32,
}

impl PacketLossSimulation {
    pub fn should_drop(&self) -> bool {
        if !self.enabled || self.loss_percent <= 0.0 {
            return false;
        }
        rand::random::<f32>() * 100.0 < self.loss_percent
    }

    pub fn delay_ms(&self) -> u32 {
        if !self.enabled || self.max_latency_ms == 0 {
            return 0;
        }
        let base = self.min_latency_ms;
        let range = self.max_latency_ms.saturating_sub(self.min_latency_ms);
        let jitter = if self.jitter_ms > 0 {
            (rand::random::<f32>() * self.jitter_ms as f32) as u32
        } else {
            0
        };
        base + (rand::random::<f32>() * range as f32) as u32 + jitter
    }
}

#[derive(Debug)]
struct DelayedDatagram {
    release_time: Instant,
    event: PlatformEvent,
}

impl PartialEq for DelayedDatagram {
    fn eq(&self, other: &Self) -> bool {
        self.release_time == other.release_time
    }
}

impl Eq for DelayedDatagram {}

impl PartialOrd for DelayedDatagram {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedDatagram {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap
        other.release_time.cmp(&self.release_time)
    }
}

type EndpointKey = usize;

#[derive(Debug, Default)]
struct Inbox {
    events: VecDeque<PlatformEvent>,
    delayed: BinaryHeap<DelayedDatagram>,
    ordered_pending: HashMap<NativeId, usize>,
    closed: bool,
}

#[derive(Debug, Clone, Copy)]
struct Route {
    owner: EndpointKey,
    remote: EndpointKey,
    remote_id: NativeId,
}

#[derive(Debug)]
struct Hub {
    queue_capacity: usize,
    simulation: PacketLossSimulation,
    inboxes: Vec<Inbox>,
    listeners: HashMap<u16, EndpointKey>,
    routes: HashMap<NativeId, Route>,
    next_id: NativeId,
}

impl Hub {
    fn allocate_id(&mut self) -> NativeId {
        self.next_id += 1;
        self.next_id
    }

    fn route(&self, owner: EndpointKey, id: NativeId) -> Result<Route, PlatformError> {
        self.routes
            .get(&id)
            .copied()
            .filter(|route| route.owner == owner)
            .ok_or(PlatformError::UnknownConnection(id))
    }

    fn close(&mut self, owner: EndpointKey, id: NativeId) {
        let Ok(route) = self.route(owner, id) else {
            return;
        };
        self.routes.remove(&id);
        self.routes.remove(&route.remote_id);
        self.inboxes[owner].ordered_pending.remove(&id);

        let remote = &mut self.inboxes[route.remote];
        remote.ordered_pending.remove(&route.remote_id);
        if !remote.closed {
            remote
                .events
                .push_back(PlatformEvent::Disconnected(route.remote_id));
        }
    }
}

/// Shared relay that endpoints created by [`SimPlatform::endpoint`] talk through.
#[derive(Debug, Clone)]
pub struct SimPlatform {
    hub: Rc<RefCell<Hub>>,
}

impl SimPlatform {
    pub fn new(queue_capacity: usize, simulation: PacketLossSimulation) -> Self {
        Self {
            hub: Rc::new(RefCell::new(Hub {
                queue_capacity,
                simulation,
                inboxes: Vec::new(),
                listeners: HashMap::new(),
                routes: HashMap::new(),
                next_id: 0,
            })),
        }
    }

    pub fn endpoint(&self) -> SimEndpoint {
        let mut hub = self.hub.borrow_mut();
        hub.inboxes.push(Inbox::default());
        SimEndpoint {
            hub: Rc::clone(&self.hub),
            key: hub.inboxes.len() - 1,
        }
    }

    pub fn set_simulation(&self, simulation: PacketLossSimulation) {
        self.hub.borrow_mut().simulation = simulation;
    }
}

#[derive(Debug)]
pub struct SimEndpoint {
    hub: Rc<RefCell<Hub>>,
    key: EndpointKey,
}

impl NetworkPlatform for SimEndpoint {
    fn listen(&mut self, port: u16) -> Result<(), PlatformError> {
        let mut hub = self.hub.borrow_mut();
        if hub.listeners.get(&port).is_some_and(|&owner| owner != self.key) {
            return Err(PlatformError::AddressInUse(port));
        }
        hub.inboxes[self.key].closed = false;
        hub.listeners.insert(port, self.key);
        Ok(())
    }

    fn connect(&mut self, _host: &str, port: u16) -> Result<NativeId, PlatformError> {
        let mut hub = self.hub.borrow_mut();
        let listener = *hub
            .listeners
            .get(&port)
            .ok_or(PlatformError::Unreachable(port))?;

        let local_id = hub.allocate_id();
        let remote_id = hub.allocate_id();
        hub.routes.insert(
            local_id,
            Route {
                owner: self.key,
                remote: listener,
                remote_id,
            },
        );
        hub.routes.insert(
            remote_id,
            Route {
                owner: listener,
                remote: self.key,
                remote_id: local_id,
            },
        );

        hub.inboxes[self.key].closed = false;
        hub.inboxes[listener]
            .events
            .push_back(PlatformEvent::Connected(remote_id));
        hub.inboxes[self.key]
            .events
            .push_back(PlatformEvent::Connected(local_id));
        Ok(local_id)
    }

    fn send(
        &mut self,
        id: NativeId,
        channel: PlatformChannel,
        payload: &[u8],
    ) -> Result<(), PlatformError> {
        let mut hub = self.hub.borrow_mut();
        let route = hub.route(self.key, id)?;
        let capacity = hub.queue_capacity;

        match channel {
            PlatformChannel::Ordered => {
                let inbox = &mut hub.inboxes[route.remote];
                let pending = inbox.ordered_pending.entry(route.remote_id).or_default();
                if *pending >= capacity {
                    return Err(PlatformError::WouldBlock);
                }
                *pending += 1;
                inbox.events.push_back(PlatformEvent::Data {
                    id: route.remote_id,
                    channel,
                    payload: payload.to_vec(),
                });
            }
            PlatformChannel::Unreliable => {
                if hub.simulation.should_drop() {
                    log::trace!("simulated loss of datagram on {}", id);
                    return Ok(());
                }
                let delay = Duration::from_millis(hub.simulation.delay_ms() as u64);
                let event = PlatformEvent::Data {
                    id: route.remote_id,
                    channel,
                    payload: payload.to_vec(),
                };
                let inbox = &mut hub.inboxes[route.remote];
                if delay.is_zero() {
                    inbox.events.push_back(event);
                } else {
                    inbox.delayed.push(DelayedDatagram {
                        release_time: Instant::now() + delay,
                        event,
                    });
                }
            }
        }
        Ok(())
    }

    fn close(&mut self, id: NativeId) {
        self.hub.borrow_mut().close(self.key, id);
    }

    fn poll(&mut self) -> Option<PlatformEvent> {
        let mut hub = self.hub.borrow_mut();
        let inbox = &mut hub.inboxes[self.key];

        let now = Instant::now();
        while inbox
            .delayed
            .peek()
            .is_some_and(|delayed| delayed.release_time <= now)
        {
            if let Some(delayed) = inbox.delayed.pop() {
                inbox.events.push_back(delayed.event);
            }
        }

        let event = inbox.events.pop_front()?;
        if let PlatformEvent::Data {
            id,
            channel: PlatformChannel::Ordered,
            ..
        } = &event
        {
            if let Some(pending) = inbox.ordered_pending.get_mut(id) {
                *pending = pending.saturating_sub(1);
            }
        }
        Some(event)
    }

    fn shutdown(&mut self) {
        let mut hub = self.hub.borrow_mut();
        let key = self.key;
        hub.listeners.retain(|_, owner| *owner != key);

        let owned: Vec<NativeId> = hub
            .routes
            .iter()
            .filter(|(_, route)| route.owner == key)
            .map(|(&id, _)| id)
            .collect();
        for id in owned {
            hub.close(key, id);
        }

        let inbox = &mut hub.inboxes[key];
        inbox.events.clear();
        inbox.delayed.clear();
        inbox.ordered_pending.clear();
        inbox.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform() -> SimPlatform {
        SimPlatform::new(2, PacketLossSimulation::default())
    }

    #[test]
    fn test_connect_requires_listener() {
        let platform = platform();
        let mut client = platform.endpoint();

        assert_eq!(client.connect("sim", 9), Err(PlatformError::Unreachable(9)));
    }

    #[test]
    fn test_connect_and_exchange() {
        let platform = platform();
        let mut host = platform.endpoint();
        let mut client = platform.endpoint();
        host.listen(9).unwrap();

        let client_id = client.connect("sim", 9).unwrap();
        let Some(PlatformEvent::Connected(host_id)) = host.poll() else {
            panic!("host should see the connection");
        };
        assert_eq!(client.poll(), Some(PlatformEvent::Connected(client_id)));

        client.send(client_id, PlatformChannel::Ordered, b"hi").unwrap();
        assert_eq!(
            host.poll(),
            Some(PlatformEvent::Data {
                id: host_id,
                channel: PlatformChannel::Ordered,
                payload: b"hi".to_vec(),
            })
        );

        host.close(host_id);
        assert_eq!(client.poll(), Some(PlatformEvent::Disconnected(client_id)));
        assert_eq!(
            client.send(client_id, PlatformChannel::Ordered, b"late"),
            Err(PlatformError::UnknownConnection(client_id))
        );
    }

    #[test]
    fn test_ordered_queue_backpressure() {
        let platform = platform();
        let mut host = platform.endpoint();
        let mut client = platform.endpoint();
        host.listen(9).unwrap();
        let client_id = client.connect("sim", 9).unwrap();

        client.send(client_id, PlatformChannel::Ordered, b"1").unwrap();
        client.send(client_id, PlatformChannel::Ordered, b"2").unwrap();
        assert_eq!(
            client.send(client_id, PlatformChannel::Ordered, b"3"),
            Err(PlatformError::WouldBlock)
        );

        // Unreliable traffic is not subject to the ordered queue bound.
        client.send(client_id, PlatformChannel::Unreliable, b"u").unwrap();
    }

    #[test]
    fn test_full_loss_drops_unreliable_only() {
        let platform = platform();
        platform.set_simulation(PacketLossSimulation {
            enabled: true,
            loss_percent: 100.0,
            ..Default::default()
        });
        let mut host = platform.endpoint();
        let mut client = platform.endpoint();
        host.listen(9).unwrap();
        let client_id = client.connect("sim", 9).unwrap();
        assert!(matches!(host.poll(), Some(PlatformEvent::Connected(_))));

        client.send(client_id, PlatformChannel::Unreliable, b"lost").unwrap();
        client.send(client_id, PlatformChannel::Ordered, b"kept").unwrap();

        assert!(matches!(
            host.poll(),
            Some(PlatformEvent::Data { channel: PlatformChannel::Ordered, .. })
        ));
        assert_eq!(host.poll(), None);
    }
}
