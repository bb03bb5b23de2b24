//! # Publish and Subscribe streams
//!
//! Both streams are authorized up front and then bound to the set of topics the
//! caller's project is allowed to use (see [`allowed_topics`]).
//!
//! A publish stream runs two cooperating tasks: a receiver that reads requests from
//! the client and a sender that validates each event, hands it to the dispatcher and
//! replies with an ack or a nack. Because the sender commits events one at a time,
//! acks are returned in the order the events were received. When the client closes
//! its side the sender drains what is in flight and the stream ends with a
//! `CloseStream` summary.
//!
//! A subscribe stream is registered with the dispatcher after the client sends its
//! `Subscription`. Each event is written to the client and the next one is only sent
//! once the client has acked or nacked it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ensign_api::v1beta1::{
    nack, publisher_reply, publisher_request, subscribe_reply, subscribe_request, Ack,
    CloseStream, Deduplication, EventWrapper, Nack, OpenStream, Publisher, PublisherReply,
    PublisherRequest, StreamReady, SubscribeReply, SubscribeRequest,
};
use ensign_api::{NameGroup, EVENT_MAX_DATA_SIZE};
use ensign_store::MetaStore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};
use ulid::Ulid;

use crate::auth::{permissions, Claims};
use crate::context::{Context, UNAUTHORIZED};
use crate::server::Node;
use crate::streams::{Inbound, Outbound, OUTBOUND_BUFFER};

pub const NO_TOPICS: &str = "no topics available";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Publisher,
    Subscriber,
}

impl StreamType {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamType::Publisher => "publisher",
            StreamType::Subscriber => "subscriber",
        }
    }
}

/// Resolve the topics the claims' project may stream to or from, as a group of
/// topic names and ids.
pub async fn allowed_topics(
    meta: &dyn MetaStore,
    claims: &Claims,
    stype: StreamType,
) -> Result<(Ulid, NameGroup), Status> {
    let project_id = claims.parse_project_id().map_err(|err| {
        tracing::warn!(error = %err, project_id = %claims.project_id, "could not parse project id from claims");
        Status::unauthenticated(UNAUTHORIZED)
    })?;

    let open_failed = || Status::internal(format!("could not open {} stream", stype.as_str()));

    let topic_ids = meta.allowed_topics(project_id).await.map_err(|err| {
        tracing::error!(report = true, error = %err, project_id = %project_id, "could not fetch project topics");
        open_failed()
    })?;

    let mut group = NameGroup::new();
    for topic_id in topic_ids {
        let name = meta.topic_name(topic_id).await.map_err(|err| {
            tracing::error!(report = true, error = %err, topic_id = %topic_id, "could not get topic name from id");
            open_failed()
        })?;

        group.add(&name, topic_id).map_err(|err| {
            tracing::error!(report = true, error = %err, topic_id = %topic_id, topic = %name, "could not add topic to name group");
            open_failed()
        })?;
    }

    if group.is_empty() {
        tracing::warn!(stream = stype.as_str(), "stream opened with no topics");
        return Err(Status::failed_precondition(NO_TOPICS));
    }
    Ok((project_id, group))
}

/// Restrict a group to the topics named (by name or id) in a client filter; an empty
/// filter keeps every topic.
fn filter_topics(group: &NameGroup, filter: &[String]) -> NameGroup {
    if filter.is_empty() {
        return group.clone();
    }

    let mut filtered = NameGroup::new();
    for query in filter {
        if let Some((name, id)) = group.lookup(query) {
            // Listing a topic twice is harmless.
            let _ = filtered.add(name, id);
        }
    }
    filtered
}

fn topic_map(group: &NameGroup) -> HashMap<String, Vec<u8>> {
    group
        .iter()
        .map(|(name, id)| (name.to_string(), id.to_bytes().to_vec()))
        .collect()
}

/// Stream cancellations and client hang ups end a stream without an error.
fn stream_closed(err: &Status) -> bool {
    err.code() == Code::Cancelled
}

struct OnlineGauge(&'static str);

impl OnlineGauge {
    fn enter(name: &'static str) -> Self {
        metrics::gauge!(name).increment(1.0);
        Self(name)
    }
}

impl Drop for OnlineGauge {
    fn drop(&mut self) {
        metrics::gauge!(self.0).decrement(1.0);
    }
}

enum Pending {
    Open(OpenStream),
    Event(EventWrapper),
}

/// Per topic state a publisher needs to accept an event.
#[derive(Debug, Clone, Default)]
struct TopicPolicy {
    readonly: bool,
    deduplication: Option<Deduplication>,
}

#[derive(Debug, Default)]
struct PublishStats {
    events: u64,
    topics: HashSet<Ulid>,
    acks: u64,
    nacks: u64,
}

pub async fn publish(
    node: Arc<Node>,
    ctx: Context,
    inbound: Inbound<PublisherRequest>,
    outbound: Outbound<PublisherReply>,
) -> Result<(), Status> {
    let _online = OnlineGauge::enter("ensign_online_publishers");

    let claims = ctx.authorize(&[permissions::PUBLISHER]).map_err(|err| {
        tracing::warn!(stream = "publisher", "unauthorized publisher stream");
        err
    })?;
    let (_, topics) = allowed_topics(node.meta.as_ref(), claims, StreamType::Publisher).await?;
    let policies = load_policies(node.meta.as_ref(), &topics).await?;

    let publisher = Publisher {
        publisher_id: claims.sub.clone(),
        ipaddr: ctx.remote_addr().map(|addr| addr.to_string()).unwrap_or_default(),
        client_id: String::new(),
        user_agent: ctx.user_agent(),
    };

    let cancel = ctx.cancel_token().child_token();
    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
    let receiver = tokio::spawn(receive_publications(inbound, tx, cancel.clone()));

    let mut sender = PublishSender {
        node: node.clone(),
        outbound: outbound.clone(),
        topics,
        policies,
        publisher,
        stats: PublishStats::default(),
    };
    let sent = sender.run(rx).await;
    if sent.is_err() {
        cancel.cancel();
    }

    let received = match receiver.await {
        Ok(result) => result,
        Err(err) => {
            tracing::error!(report = true, error = %err, "publish receiver task failed");
            Err(Status::internal("publish stream terminated unexpectedly"))
        }
    };

    sender.close().await;

    // The receiver error, if any, is the cause of a sender failure.
    received.and(sent)
}

async fn load_policies(
    meta: &dyn MetaStore,
    topics: &NameGroup,
) -> Result<HashMap<Ulid, TopicPolicy>, Status> {
    let mut policies = HashMap::with_capacity(topics.len());
    for topic_id in topics.ids() {
        let topic = meta.retrieve_topic(topic_id).await.map_err(|err| {
            tracing::error!(report = true, error = %err, topic_id = %topic_id, "could not retrieve topic");
            Status::internal("could not open publisher stream")
        })?;

        let deduplication = topic.deduplication.filter(|policy| {
            policy.strategy() != ensign_api::v1beta1::deduplication::Strategy::None
        });
        policies.insert(
            topic_id,
            TopicPolicy {
                readonly: topic.readonly,
                deduplication,
            },
        );
    }
    Ok(policies)
}

/// Read requests from the client until it closes the stream, the stream is cancelled
/// or the client violates the protocol.
async fn receive_publications(
    mut inbound: Inbound<PublisherRequest>,
    events: mpsc::Sender<Pending>,
    cancel: CancellationToken,
) -> Result<(), Status> {
    let mut first = true;
    let mut opened = false;

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("publish stream context closed");
                return Ok(());
            }
            msg = inbound.recv() => msg,
        };

        let req = match msg {
            None => {
                tracing::info!("publish stream closed");
                return Ok(());
            }
            Some(Err(err)) if stream_closed(&err) => {
                tracing::info!("publish stream closed");
                return Ok(());
            }
            Some(Err(err)) => {
                tracing::warn!(error = %err, "publish stream crashed");
                return Err(Status::aborted("could not recv event from client"));
            }
            Some(Ok(req)) => req,
        };

        let pending = match req.embed {
            Some(publisher_request::Embed::Event(event)) => Pending::Event(event),
            Some(publisher_request::Embed::OpenStream(open)) => {
                if opened {
                    tracing::warn!("multiple open stream messages received");
                    return Err(Status::aborted("cannot send multiple open stream messages"));
                }
                if !first {
                    tracing::warn!("open stream message received after events");
                    return Err(Status::failed_precondition(
                        "open stream message must be sent before any events",
                    ));
                }
                opened = true;
                Pending::Open(open)
            }
            None => {
                tracing::warn!("empty publisher request");
                return Err(Status::failed_precondition("unhandled publisher request message"));
            }
        };

        first = false;
        if events.send(pending).await.is_err() {
            // The sender stopped, its error is returned by the handler.
            return Ok(());
        }
    }
}

struct PublishSender {
    node: Arc<Node>,
    outbound: Outbound<PublisherReply>,
    topics: NameGroup,
    policies: HashMap<Ulid, TopicPolicy>,
    publisher: Publisher,
    stats: PublishStats,
}

impl PublishSender {
    async fn run(&mut self, mut rx: mpsc::Receiver<Pending>) -> Result<(), Status> {
        while let Some(pending) = rx.recv().await {
            match pending {
                Pending::Open(open) => self.open(open).await?,
                Pending::Event(event) => self.publish(event).await?,
            }
        }
        Ok(())
    }

    async fn open(&mut self, open: OpenStream) -> Result<(), Status> {
        let topics = filter_topics(&self.topics, &open.topics);
        if topics.is_empty() {
            tracing::warn!(topic_filter = open.topics.len(), "publish stream opened with no topics");
            return Err(Status::failed_precondition(NO_TOPICS));
        }
        self.topics = topics;
        self.publisher.client_id = open.client_id;

        let ready = StreamReady {
            client_id: self.publisher.resolve_client_id(),
            server_id: self.node.server_id().to_string(),
            topics: topic_map(&self.topics),
        };
        self.reply(publisher_reply::Embed::Ready(ready)).await
    }

    async fn publish(&mut self, mut event: EventWrapper) -> Result<(), Status> {
        if event.topic_id.is_empty() {
            tracing::warn!("event published without topic id");
            return self.nack(event.local_id, nack::Code::TopicUnknown, "no topic id specified").await;
        }

        let topic_id = match event.parse_topic_id() {
            Ok(topic_id) => topic_id,
            Err(err) => {
                tracing::debug!(error = %err, "could not parse topic id from publisher");
                return self.nack(event.local_id, nack::Code::TopicUnknown, "invalid topic id").await;
            }
        };

        if !self.topics.contains_id(&topic_id) {
            tracing::warn!(topic_id = %topic_id, "event published to topic that is not allowed");
            return self.nack(event.local_id, nack::Code::TopicUnknown, "").await;
        }

        let size = event.data_size();
        if size > EVENT_MAX_DATA_SIZE {
            tracing::warn!(size, "very large event published to topic and rejected");
            return self
                .nack(event.local_id, nack::Code::MaxEventSizeExceeded, "")
                .await;
        }

        let policy = self.policies.get(&topic_id).cloned().unwrap_or_default();
        if policy.readonly {
            tracing::debug!(topic_id = %topic_id, "event published to archived topic");
            return self.nack(event.local_id, nack::Code::TopicArchived, "").await;
        }

        event.publisher = Some(self.publisher.clone());
        let local_id = event.local_id.clone();
        self.stats.events += 1;
        self.stats.topics.insert(topic_id);

        match self.node.pubsub.publish(event, policy.deduplication).await {
            Ok(committed) => {
                let ack = Ack {
                    id: committed.id.to_vec(),
                    committed: Some(committed.committed),
                    local_id,
                };
                self.stats.acks += 1;
                self.reply(publisher_reply::Embed::Ack(ack)).await
            }
            Err(err) => {
                tracing::warn!(error = %err, topic_id = %topic_id, "event could not be committed");
                self.nack(local_id, nack::Code::Unprocessed, "").await
            }
        }
    }

    async fn nack(&mut self, id: Vec<u8>, code: nack::Code, message: &str) -> Result<(), Status> {
        let error = if message.is_empty() {
            code.default_message().to_string()
        } else {
            message.to_string()
        };

        self.stats.nacks += 1;
        let nack = Nack {
            id,
            code: code as i32,
            error,
        };
        self.reply(publisher_reply::Embed::Nack(nack)).await
    }

    async fn reply(&self, embed: publisher_reply::Embed) -> Result<(), Status> {
        self.outbound
            .send(PublisherReply { embed: Some(embed) })
            .await
    }

    async fn close(&self) {
        let close = CloseStream {
            events: self.stats.events,
            topics: self.stats.topics.len() as u64,
            acks: self.stats.acks,
            nacks: self.stats.nacks,
        };

        match self.reply(publisher_reply::Embed::CloseStream(close)).await {
            Ok(()) => tracing::info!(
                events = self.stats.events,
                topics = self.stats.topics.len(),
                acks = self.stats.acks,
                nacks = self.stats.nacks,
                "publisher stream closed"
            ),
            Err(err) => tracing::warn!(error = %err, "could not send close stream message"),
        }
    }
}

pub async fn subscribe(
    node: Arc<Node>,
    ctx: Context,
    mut inbound: Inbound<SubscribeRequest>,
    outbound: Outbound<SubscribeReply>,
) -> Result<(), Status> {
    let claims = ctx.authorize(&[permissions::SUBSCRIBER]).map_err(|err| {
        tracing::warn!(stream = "subscriber", "unauthorized subscriber stream");
        err
    })?;
    let (_, allowed) = allowed_topics(node.meta.as_ref(), claims, StreamType::Subscriber).await?;

    let sub = match inbound.recv().await {
        None => {
            tracing::info!("subscribe stream closed");
            return Ok(());
        }
        Some(Err(err)) if stream_closed(&err) => {
            tracing::info!("subscribe stream closed");
            return Ok(());
        }
        Some(Err(err)) => {
            tracing::warn!(error = %err, "subscribe stream crashed");
            return Err(err);
        }
        Some(Ok(SubscribeRequest {
            embed: Some(subscribe_request::Embed::Subscription(sub)),
        })) => sub,
        Some(Ok(_)) => {
            return Err(Status::failed_precondition(
                "must send subscription to initialize stream",
            ))
        }
    };

    let topics = filter_topics(&allowed, &sub.topics);
    if topics.is_empty() {
        tracing::warn!(topic_filter = sub.topics.len(), "subscribe stream opened with no topics");
        return Err(Status::failed_precondition(NO_TOPICS));
    }

    let (stream_id, events) = node.pubsub.subscribe().await;
    let ready = StreamReady {
        client_id: sub.client_id.clone(),
        server_id: node.server_id().to_string(),
        topics: topic_map(&topics),
    };

    let mut subscriber = Subscriber {
        outbound,
        topics,
        events: 0,
        acks: 0,
        nacks: 0,
    };

    let result = match subscriber.reply(subscribe_reply::Embed::Ready(ready)).await {
        Ok(()) => subscriber.run(&ctx, &mut inbound, events).await,
        Err(err) => Err(err),
    };
    node.pubsub.finish(stream_id).await;

    tracing::info!(
        client_id = %sub.client_id,
        events = subscriber.events,
        acks = subscriber.acks,
        nacks = subscriber.nacks,
        "subscribe stream terminated"
    );

    match result {
        Ok(()) => {
            subscriber.close().await;
            Ok(())
        }
        Err(err) if stream_closed(&err) => Ok(()),
        Err(err) => Err(err),
    }
}

struct Subscriber {
    outbound: Outbound<SubscribeReply>,
    topics: NameGroup,
    events: u64,
    acks: u64,
    nacks: u64,
}

enum Control {
    /// Keep waiting for the outstanding event to be settled.
    Pending,
    /// The outstanding event was acked or nacked.
    Settled,
    /// The client closed its side of the stream.
    Closed,
}

impl Subscriber {
    async fn run(
        &mut self,
        ctx: &Context,
        inbound: &mut Inbound<SubscribeRequest>,
        mut events: mpsc::Receiver<EventWrapper>,
    ) -> Result<(), Status> {
        let cancel = ctx.cancel_token();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return Ok(()),
                },
                msg = inbound.recv() => {
                    // Acks with nothing outstanding are ignored.
                    match self.control(msg, None)? {
                        Control::Closed => return Ok(()),
                        Control::Pending | Control::Settled => continue,
                    }
                }
            };

            match event.parse_topic_id() {
                Ok(topic_id) if self.topics.contains_id(&topic_id) => {}
                Ok(_) => continue,
                Err(err) => {
                    tracing::warn!(error = %err, "could not parse topic id on committed event");
                    continue;
                }
            }

            let event_id = event.id.clone();
            self.reply(subscribe_reply::Embed::Event(event)).await?;
            self.events += 1;

            // Wait for the client to ack or nack the event before sending the next.
            loop {
                let msg = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    msg = inbound.recv() => msg,
                };
                match self.control(msg, Some(&event_id))? {
                    Control::Pending => continue,
                    Control::Settled => break,
                    Control::Closed => return Ok(()),
                }
            }
        }
    }

    fn control(
        &mut self,
        msg: Option<Result<SubscribeRequest, Status>>,
        outstanding: Option<&[u8]>,
    ) -> Result<Control, Status> {
        let req = match msg {
            None => {
                tracing::info!("subscribe stream closed");
                return Ok(Control::Closed);
            }
            Some(Err(err)) if stream_closed(&err) => return Err(err),
            Some(Err(err)) => {
                tracing::warn!(error = %err, "subscribe stream crashed");
                return Err(err);
            }
            Some(Ok(req)) => req,
        };

        match (req.embed, outstanding) {
            (Some(subscribe_request::Embed::Ack(ack)), Some(id)) if ack.id == id => {
                self.acks += 1;
                Ok(Control::Settled)
            }
            (Some(subscribe_request::Embed::Nack(nack)), Some(id)) if nack.id == id => {
                tracing::debug!(code = nack.code, error = %nack.error, "event nacked by subscriber");
                self.nacks += 1;
                Ok(Control::Settled)
            }
            (Some(subscribe_request::Embed::Subscription(_)), _) => {
                tracing::debug!("ignoring subscription sent on an open stream");
                Ok(Control::Pending)
            }
            _ => {
                tracing::trace!("ignoring out of order ack or nack");
                Ok(Control::Pending)
            }
        }
    }

    async fn reply(&self, embed: subscribe_reply::Embed) -> Result<(), Status> {
        self.outbound.send(SubscribeReply { embed: Some(embed) }).await
    }

    async fn close(&self) {
        let close = CloseStream {
            events: self.events,
            topics: self.topics.len() as u64,
            acks: self.acks,
            nacks: self.nacks,
        };
        // The client may already be gone.
        let _ = self.reply(subscribe_reply::Embed::CloseStream(close)).await;
    }
}
