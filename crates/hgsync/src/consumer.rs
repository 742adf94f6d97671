//! Pulse consumer: broker connection, message decode, dispatch.
//!
//! The worker pulls one delivery at a time and processes it to completion
//! before looking at the next, so per-source push ordering is preserved
//! and no clone workspace is ever touched concurrently. Decode failures
//! reject the message (dropped), handler failures requeue it, handler
//! success acks it.
//!
//! Broker futures are driven by a small current-thread tokio runtime;
//! lapin's own reactor threads keep heartbeats flowing while the handler
//! blocks on subprocess work.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::StreamExt;
use hgsync_config::PulseConfig;
use lapin::message::BasicGetMessage;
use lapin::options::{
    BasicConsumeOptions, BasicGetOptions, BasicQosOptions, BasicRejectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::uri::{AMQPScheme, AMQPUri};
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::events::{Event, Push};

/// How long one blocking receive waits before re-checking the stop flag.
const RECEIVE_POLL: Duration = Duration::from_secs(1);

/// Why a message was rejected before reaching the handler.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message body is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("message body is not a JSON object")]
    NotAnObject,
    #[error("missing or empty payload")]
    MissingPayload,
    #[error("payload is not a JSON object")]
    InvalidPayload,
    #[error("payload has no type field")]
    MissingType,
    #[error("unsupported message type {0:?}")]
    UnsupportedType(String),
    #[error("invalid push payload: {0}")]
    InvalidPush(String),
    #[error("push event carries neither branches nor tags")]
    EmptyPush,
}

/// Decode one raw message body into an event.
///
/// The pipeline mirrors the wire contract step by step: bytes must parse
/// as JSON; a JSON string body is unwrapped and parsed again; the result
/// must be an object with a non-empty `payload` object whose `type`
/// selects the event; a push must carry at least one branch or tag.
pub fn decode_message(body: &[u8]) -> Result<Event, DecodeError> {
    let mut value: Value = serde_json::from_slice(body).map_err(DecodeError::InvalidJson)?;
    if let Value::String(inner) = &value {
        debug!("message body is a string, parsing as JSON");
        value = serde_json::from_str(inner).map_err(DecodeError::InvalidJson)?;
    }

    let Value::Object(object) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let payload = match object.get("payload") {
        None => return Err(DecodeError::MissingPayload),
        Some(value) if is_empty_value(value) => return Err(DecodeError::MissingPayload),
        Some(value) => value,
    };
    let Value::Object(payload) = payload else {
        return Err(DecodeError::InvalidPayload);
    };

    let Some(message_type) = payload.get("type").and_then(Value::as_str) else {
        return Err(DecodeError::MissingType);
    };

    match message_type {
        "push" => {
            let push: Push = serde_json::from_value(Value::Object(payload.clone()))
                .map_err(|err| DecodeError::InvalidPush(err.to_string()))?;
            if !push.has_work() {
                return Err(DecodeError::EmptyPush);
            }
            Ok(Event::Push(push))
        }
        other => Err(DecodeError::UnsupportedType(other.to_string())),
    }
}

/// JSON counterpart of the wire contract's "missing or empty" rule.
fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

/// An open broker connection plus the runtime that drives its futures.
pub struct PulseConnection {
    runtime: tokio::runtime::Runtime,
    _connection: Connection,
    channel: Channel,
}

impl PulseConnection {
    /// Connect and open a channel with prefetch 1.
    pub fn connect(config: &PulseConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build broker runtime")?;

        let uri = amqp_uri(config);
        info!(host = %config.host, port = config.port, "connecting to broker");

        let connection = runtime
            .block_on(Connection::connect_uri(uri, ConnectionProperties::default()))
            .context("failed to connect to broker")?;
        let channel = runtime
            .block_on(connection.create_channel())
            .context("failed to open broker channel")?;
        runtime
            .block_on(channel.basic_qos(1, BasicQosOptions::default()))
            .context("failed to set prefetch")?;

        Ok(Self {
            runtime,
            _connection: connection,
            channel,
        })
    }

    /// Declare the topic exchange and the durable, non-exclusive queue,
    /// and bind them. Shared among replicas, so declaration is idempotent.
    pub fn declare(&self, config: &PulseConfig) -> Result<()> {
        self.block_on(self.channel.exchange_declare(
            &config.exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        ))
        .with_context(|| format!("failed to declare exchange {}", config.exchange))?;

        self.block_on(self.channel.queue_declare(
            &config.queue,
            QueueDeclareOptions {
                durable: true,
                exclusive: false,
                auto_delete: false,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        ))
        .with_context(|| format!("failed to declare queue {}", config.queue))?;

        self.block_on(self.channel.queue_bind(
            &config.queue,
            &config.exchange,
            &config.routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        ))
        .with_context(|| {
            format!(
                "failed to bind queue {} to exchange {}",
                config.queue, config.exchange
            )
        })?;

        Ok(())
    }

    /// Receive a single message without joining the consume loop, waiting
    /// at most `timeout`. Used by the dequeue tool.
    pub fn receive_one(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<BasicGetMessage>> {
        let deadline = Instant::now() + timeout;
        loop {
            let message = self
                .block_on(
                    self.channel
                        .basic_get(queue, BasicGetOptions { no_ack: false }),
                )
                .context("basic.get failed")?;
            if message.is_some() {
                return Ok(message);
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(250));
        }
    }

    /// Acknowledge a delivery obtained through [`Self::receive_one`].
    pub fn ack(&self, delivery: &lapin::message::Delivery) -> Result<()> {
        self.block_on(delivery.acker.ack(Default::default()))
            .context("failed to ack message")
            .map(|_| ())
    }

    /// Reject a delivery obtained through [`Self::receive_one`],
    /// optionally returning it to the queue.
    pub fn reject(&self, delivery: &lapin::message::Delivery, requeue: bool) -> Result<()> {
        self.block_on(delivery.acker.reject(BasicRejectOptions { requeue }))
            .context("failed to reject message")
            .map(|_| ())
    }

    /// Drive a broker future to completion on this connection's runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

fn amqp_uri(config: &PulseConfig) -> AMQPUri {
    let mut uri = AMQPUri::default();
    uri.scheme = if config.ssl {
        AMQPScheme::AMQPS
    } else {
        AMQPScheme::AMQP
    };
    uri.authority.userinfo.username = config.userid.clone();
    uri.authority.userinfo.password = config.password.clone();
    uri.authority.host = config.host.clone();
    uri.authority.port = config.port;
    uri.query.heartbeat = Some(config.heartbeat);
    uri
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Acked,
    Rejected,
    Requeued,
}

/// The consume loop: one message at a time, to completion.
pub struct PulseWorker {
    connection: PulseConnection,
    consumer: lapin::Consumer,
    one_shot: bool,
    should_stop: Arc<AtomicBool>,
}

impl PulseWorker {
    /// Declare the queue topology and register the consumer.
    pub fn new(connection: PulseConnection, config: &PulseConfig, one_shot: bool) -> Result<Self> {
        connection.declare(config)?;
        let consumer = connection
            .block_on(connection.channel.basic_consume(
                &config.queue,
                "hgsync",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            ))
            .with_context(|| format!("failed to consume from queue {}", config.queue))?;
        info!(queue = %config.queue, "reading messages");

        Ok(Self {
            connection,
            consumer,
            one_shot,
            should_stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Shared stop flag; setting it lets the loop finish the in-flight
    /// message and exit.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.should_stop)
    }

    /// Block on the consume loop until stopped.
    ///
    /// The handler runs on this thread, outside the async context; a slow
    /// handler delays the next delivery, never overlaps with it.
    pub fn run(mut self, handler: &mut dyn FnMut(Event) -> Result<()>) -> Result<()> {
        loop {
            if self.should_stop.load(Ordering::SeqCst) {
                info!("stop requested, leaving consume loop");
                return Ok(());
            }

            let next = self.connection.runtime.block_on(tokio::time::timeout(
                RECEIVE_POLL,
                self.consumer.next(),
            ));
            let delivery = match next {
                Err(_elapsed) => continue,
                Ok(None) => anyhow::bail!("broker cancelled the consumer"),
                Ok(Some(Err(err))) => {
                    return Err(err).context("broker connection failed");
                }
                Ok(Some(Ok(delivery))) => delivery,
            };

            let outcome = self.handle_delivery(delivery, handler)?;
            debug!(?outcome, "message settled");

            if self.one_shot {
                self.should_stop.store(true, Ordering::SeqCst);
            }
        }
    }

    fn handle_delivery(
        &self,
        delivery: lapin::message::Delivery,
        handler: &mut dyn FnMut(Event) -> Result<()>,
    ) -> Result<MessageOutcome> {
        let event = match decode_message(&delivery.data) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "invalid message, rejecting");
                self.connection
                    .block_on(delivery.acker.reject(BasicRejectOptions { requeue: false }))
                    .context("failed to reject message")?;
                return Ok(MessageOutcome::Rejected);
            }
        };

        info!(repo_url = %event.repo_url(), "received event");
        match handler(event) {
            Ok(()) => {
                self.connection
                    .block_on(delivery.acker.ack(Default::default()))
                    .context("failed to ack message")?;
                Ok(MessageOutcome::Acked)
            }
            Err(err) => {
                error!(error = ?err, "event handler failed, requeueing message");
                self.connection
                    .block_on(delivery.acker.reject(BasicRejectOptions { requeue: true }))
                    .context("failed to requeue message")?;
                Ok(MessageOutcome::Requeued)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_body() -> Vec<u8> {
        serde_json::json!({
            "payload": {
                "type": "push",
                "repo_url": "https://gitforge.example/myrepo",
                "branches": {"esr128": "deadbeef"},
                "tags": {},
                "time": 1721900000,
                "push_id": 42,
                "user": "someone@example.org",
                "push_json_url": "https://gitforge.example/json",
            },
            "_meta": {"exchange": "exchange/hgsync", "routing_key": "#"},
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn decodes_push_message() {
        let event = decode_message(&push_body()).expect("decode");
        let Event::Push(push) = event;
        assert_eq!(push.repo_url, "https://gitforge.example/myrepo");
        assert_eq!(push.branches["esr128"], "deadbeef");
    }

    #[test]
    fn decodes_doubly_encoded_string_body() {
        let inner = String::from_utf8(push_body()).expect("utf8");
        let body = serde_json::to_vec(&inner).expect("encode");

        let event = decode_message(&body).expect("decode");
        let Event::Push(push) = event;
        assert_eq!(push.push_id, 42);
    }

    #[test]
    fn rejects_unparsable_body() {
        let err = decode_message(b"not json").unwrap_err();
        assert!(matches!(err, DecodeError::InvalidJson(_)));
    }

    #[test]
    fn rejects_string_body_that_is_not_json() {
        let body = serde_json::to_vec("not json").expect("encode");
        let err = decode_message(&body).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidJson(_)));
    }

    #[test]
    fn rejects_non_object_body() {
        let err = decode_message(b"[1, 2, 3]").unwrap_err();
        assert!(matches!(err, DecodeError::NotAnObject));
    }

    #[test]
    fn rejects_missing_payload() {
        let err = decode_message(br#"{"_meta": {}}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MissingPayload));
    }

    #[test]
    fn rejects_empty_payload() {
        let err = decode_message(br#"{"payload": {}}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MissingPayload));

        let err = decode_message(br#"{"payload": null}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MissingPayload));
    }

    #[test]
    fn rejects_non_object_payload() {
        let err = decode_message(br#"{"payload": "push"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidPayload));
    }

    #[test]
    fn rejects_payload_without_type() {
        let err = decode_message(br#"{"payload": {"repo_url": "x"}}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MissingType));
    }

    #[test]
    fn rejects_unsupported_type() {
        let err = decode_message(br#"{"payload": {"type": "tag"}}"#).unwrap_err();
        match err {
            DecodeError::UnsupportedType(t) => assert_eq!(t, "tag"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn rejects_push_with_missing_fields() {
        let err = decode_message(br#"{"payload": {"type": "push", "repo_url": "x"}}"#).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidPush(_)));
    }

    #[test]
    fn rejects_push_with_wrong_field_types() {
        let body = serde_json::json!({
            "payload": {
                "type": "push",
                "repo_url": "https://gitforge.example/myrepo",
                "branches": ["main"],
                "tags": {},
                "time": 0,
                "push_id": 1,
                "user": "someone@example.org",
                "push_json_url": "https://gitforge.example/json",
            },
        })
        .to_string()
        .into_bytes();

        let err = decode_message(&body).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidPush(_)));
    }

    #[test]
    fn rejects_push_without_branches_or_tags() {
        let body = serde_json::json!({
            "payload": {
                "type": "push",
                "repo_url": "https://gitforge.example/myrepo",
                "branches": {},
                "tags": {},
                "time": 0,
                "push_id": 1,
                "user": "someone@example.org",
                "push_json_url": "https://gitforge.example/json",
            },
        })
        .to_string()
        .into_bytes();

        let err = decode_message(&body).unwrap_err();
        assert!(matches!(err, DecodeError::EmptyPush));
    }

    #[test]
    fn empty_value_classification_follows_wire_contract() {
        assert!(is_empty_value(&Value::Null));
        assert!(is_empty_value(&serde_json::json!("")));
        assert!(is_empty_value(&serde_json::json!([])));
        assert!(is_empty_value(&serde_json::json!({})));
        assert!(is_empty_value(&serde_json::json!(0)));
        assert!(is_empty_value(&serde_json::json!(false)));
        assert!(!is_empty_value(&serde_json::json!({"type": "push"})));
        assert!(!is_empty_value(&serde_json::json!(1)));
    }

    #[test]
    fn amqp_uri_reflects_config() {
        let config = PulseConfig {
            userid: "hgsync".to_string(),
            host: "pulse.example.org".to_string(),
            port: 5671,
            exchange: "exchange/hgsync/pushes".to_string(),
            routing_key: "#".to_string(),
            queue: "queue/hgsync/pushes".to_string(),
            password: "hunter2".to_string(),
            heartbeat: 10,
            ssl: true,
        };

        let uri = amqp_uri(&config);
        assert!(matches!(uri.scheme, AMQPScheme::AMQPS));
        assert_eq!(uri.authority.host, "pulse.example.org");
        assert_eq!(uri.authority.port, 5671);
        assert_eq!(uri.authority.userinfo.username, "hgsync");
        assert_eq!(uri.query.heartbeat, Some(10));
    }
}
