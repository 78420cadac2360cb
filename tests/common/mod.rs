// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the broker seam, with knobs to make it
//! unreachable, nack publishes or drop every connection.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use resilient_amqp::{
    backoff::Backoff,
    broker::{BrokerChannel, BrokerConnection, Connector, DeliveryStream, RawDelivery},
    errors::AmqpError,
    queue::QueueDefinition,
    supervisor::ConnectionSupervisor,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::{mpsc, watch};

pub const BACKOFF: Duration = Duration::from_millis(2000);

type Flag = Arc<watch::Sender<bool>>;
type DeliverySender = mpsc::UnboundedSender<Result<RawDelivery, AmqpError>>;

struct Subscription {
    channel: u64,
    queue: String,
    tx: DeliverySender,
}

struct Unacked {
    channel: u64,
    queue: String,
    data: Vec<u8>,
}

#[derive(Default)]
struct BrokerState {
    unreachable: bool,
    connect_attempts: usize,
    nack_next: usize,
    drop_on_next_publish: bool,
    next_id: u64,
    next_tag: u64,
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    connections: HashMap<u64, Flag>,
    channels: HashMap<u64, (u64, Flag)>,
    opened_channels: usize,
    prefetch: HashMap<u64, u16>,
    subscriptions: Vec<Subscription>,
    unacked: HashMap<u64, Unacked>,
    confirmed: Vec<Vec<u8>>,
    acks: Vec<u64>,
    rejects: Vec<(u64, bool)>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn in_flight(&self, channel: u64) -> usize {
        self.unacked.values().filter(|u| u.channel == channel).count()
    }

    fn dispatch(&mut self) {
        let mut i = 0;
        while i < self.subscriptions.len() {
            let channel = self.subscriptions[i].channel;
            let queue = self.subscriptions[i].queue.clone();
            let limit = self.prefetch.get(&channel).copied().unwrap_or(0) as usize;

            loop {
                if limit != 0 && self.in_flight(channel) >= limit {
                    break;
                }
                let Some(data) = self.queues.get_mut(&queue).and_then(|q| q.pop_front()) else {
                    break;
                };

                self.next_tag += 1;
                let tag = self.next_tag;
                let delivery = RawDelivery {
                    delivery_tag: tag,
                    data: data.clone(),
                };

                if self.subscriptions[i].tx.send(Ok(delivery)).is_err() {
                    self.queues
                        .entry(queue.clone())
                        .or_default()
                        .push_front(data);
                    break;
                }

                self.unacked.insert(
                    tag,
                    Unacked {
                        channel,
                        queue: queue.clone(),
                        data,
                    },
                );
            }

            i += 1;
        }
    }

    fn close_channel(&mut self, channel: u64) {
        if let Some((_, flag)) = self.channels.remove(&channel) {
            flag.send_replace(true);
        }

        self.subscriptions.retain(|s| s.channel != channel);
        self.prefetch.remove(&channel);

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        // Requeue in delivery order at the head of each queue.
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(u) = self.unacked.remove(&tag) {
                self.queues.entry(u.queue).or_default().push_front(u.data);
            }
        }

        self.dispatch();
    }

    fn close_connection(&mut self, conn: u64) {
        if let Some(flag) = self.connections.remove(&conn) {
            flag.send_replace(true);
        }

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, (owner, _))| *owner == conn)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }
    }

    fn drop_all(&mut self) {
        let conns: Vec<u64> = self.connections.keys().copied().collect();
        for conn in conns {
            self.close_connection(conn);
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    pub fn supervisor(&self) -> Arc<ConnectionSupervisor> {
        ConnectionSupervisor::with_connector(Arc::new(self.clone()), Backoff::new(BACKOFF))
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state().unreachable = !reachable;
    }

    /// Closes every open connection, as a broker restart would.
    pub fn drop_connections(&self) {
        self.state().drop_all();
    }

    /// Closes the channels subscribed to `queue`; their connections stay up.
    pub fn close_consumer_channels(&self, queue: &str) {
        let mut state = self.state();
        let channels: Vec<u64> = state
            .subscriptions
            .iter()
            .filter(|s| s.queue == queue)
            .map(|s| s.channel)
            .collect();
        for channel in channels {
            state.close_channel(channel);
        }
    }

    pub fn nack_next(&self, count: usize) {
        self.state().nack_next = count;
    }

    /// The next publish loses the connection before it is confirmed.
    pub fn drop_on_next_publish(&self) {
        self.state().drop_on_next_publish = true;
    }

    pub fn enqueue(&self, queue: &str, payload: &[u8]) {
        let mut state = self.state();
        state
            .queues
            .entry(queue.to_owned())
            .or_default()
            .push_back(payload.to_vec());
        state.dispatch();
    }

    pub fn connect_attempts(&self) -> usize {
        self.state().connect_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.state().connections.len()
    }

    pub fn opened_channels(&self) -> usize {
        self.state().opened_channels
    }

    pub fn confirmed(&self) -> Vec<String> {
        self.state()
            .confirmed
            .iter()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect()
    }

    pub fn ready(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.len())
    }

    pub fn unacked(&self) -> usize {
        self.state().unacked.len()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.state().acks.clone()
    }

    pub fn rejects(&self) -> Vec<(u64, bool)> {
        self.state().rejects.clone()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut state = self.state();
        state.connect_attempts += 1;

        if state.unreachable {
            return Err(AmqpError::ConnectionError);
        }

        let id = state.next_id();
        let flag: Flag = Arc::new(watch::Sender::new(false));
        state.connections.insert(id, flag.clone());

        Ok(Arc::new(MemoryConnection {
            id,
            broker: self.clone(),
            closed: flag,
        }))
    }
}

pub struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
    closed: Flag,
}

impl MemoryConnection {
    fn open(&self, confirm: bool) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut state = self.broker.state();
        if *self.closed.borrow() {
            return Err(AmqpError::ChannelError);
        }

        let id = state.next_id();
        let flag: Flag = Arc::new(watch::Sender::new(false));
        state.channels.insert(id, (self.id, flag.clone()));
        state.opened_channels += 1;

        Ok(Arc::new(MemoryChannel {
            id,
            confirm,
            broker: self.broker.clone(),
            closed: flag,
            conn_closed: self.closed.clone(),
        }))
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.open(false)
    }

    async fn create_confirm_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.open(true)
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.state().close_connection(self.id);
        Ok(())
    }
}

pub struct MemoryChannel {
    id: u64,
    confirm: bool,
    broker: MemoryBroker,
    closed: Flag,
    conn_closed: Flag,
}

impl MemoryChannel {
    fn check_open(&self) -> Result<(), AmqpError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(AmqpError::NotConnected)
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn assert_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.check_open()?;
        let mut state = self.broker.state();
        state.queues.entry(def.name().to_owned()).or_default();
        if let Some(dlq) = def.dlq_name() {
            state.queues.entry(dlq.to_owned()).or_default();
        }
        Ok(())
    }

    async fn prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.check_open()?;
        self.broker.state().prefetch.insert(self.id, count);
        Ok(())
    }

    async fn publish_confirmed(&self, queue: &str, payload: &[u8]) -> Result<(), AmqpError> {
        self.check_open()?;
        assert!(self.confirm, "publish on a channel without confirms");

        let mut state = self.broker.state();
        if state.drop_on_next_publish {
            state.drop_on_next_publish = false;
            state.drop_all();
            return Err(AmqpError::PublishingError);
        }
        if state.nack_next > 0 {
            state.nack_next -= 1;
            return Err(AmqpError::PublishNacked);
        }
        let Some(q) = state.queues.get_mut(queue) else {
            return Err(AmqpError::PublishingError);
        };

        q.push_back(payload.to_vec());
        state.confirmed.push(payload.to_vec());
        state.dispatch();
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        self.check_open()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.broker.state();
        state.subscriptions.push(Subscription {
            channel: self.id,
            queue: queue.to_owned(),
            tx,
        });
        state.dispatch();

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.check_open()?;
        let mut state = self.broker.state();
        match state.unacked.get(&delivery_tag) {
            Some(u) if u.channel == self.id => {
                state.unacked.remove(&delivery_tag);
                state.acks.push(delivery_tag);
                state.dispatch();
                Ok(())
            }
            _ => Err(AmqpError::AckMessageError),
        }
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.check_open()?;
        let mut state = self.broker.state();
        match state.unacked.get(&delivery_tag) {
            Some(u) if u.channel == self.id => {
                if let Some(u) = state.unacked.remove(&delivery_tag) {
                    if requeue {
                        state.queues.entry(u.queue).or_default().push_front(u.data);
                    }
                }
                state.rejects.push((delivery_tag, requeue));
                state.dispatch();
                Ok(())
            }
            _ => Err(AmqpError::RejectMessageError),
        }
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow() && !*self.conn_closed.borrow()
    }

    async fn closed(&self) {
        let mut own = self.closed.subscribe();
        let mut conn = self.conn_closed.subscribe();
        tokio::select! {
            _ = own.wait_for(|closed| *closed) => {}
            _ = conn.wait_for(|closed| *closed) => {}
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.state().close_channel(self.id);
        Ok(())
    }
}

/// Polls `cond` until it holds, failing the test after a generous delay.
pub async fn eventually<F: Fn() -> bool>(cond: F) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}
