//! RabbitMQ adapter built on lapin.
//!
//! Publishing uses one confirm-mode channel. Each consumer gets its own
//! channel so prefetch applies per worker.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use relay_common::{FieldValue, Headers};

use crate::{
    BindingSpec, Broker, BrokerError, Confirm, ConfirmListener, Delivery, DeliveryStream,
    ExchangeKind, ExchangeSpec, OutboundMessage, QueueSpec, Result, ReturnListener,
    ReturnedMessage,
};

type Listener<T> = Arc<RwLock<Option<Arc<T>>>>;

pub struct AmqpBroker {
    connection: Connection,
    publish_channel: Channel,
    confirm_listener: Listener<dyn ConfirmListener>,
    return_listener: Listener<dyn ReturnListener>,
}

impl AmqpBroker {
    pub async fn connect(uri: &str) -> Result<Self> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let publish_channel = connection.create_channel().await.map_err(channel_error)?;
        publish_channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(channel_error)?;

        info!("Connected to AMQP broker with publisher confirms enabled");
        Ok(Self {
            connection,
            publish_channel,
            confirm_listener: Arc::new(RwLock::new(None)),
            return_listener: Arc::new(RwLock::new(None)),
        })
    }

    pub async fn close(&self) -> Result<()> {
        self.connection
            .close(200, "shutdown")
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }
}

fn channel_error(e: lapin::Error) -> BrokerError {
    BrokerError::Channel(e.to_string())
}

#[async_trait]
impl Broker for AmqpBroker {
    fn identifier(&self) -> &str {
        "amqp"
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        let kind = match spec.kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        let mut args = FieldTable::default();
        if let Some(alternate) = &spec.alternate_exchange {
            args.insert("alternate-exchange".into(), AMQPValue::LongString(alternate.as_str().into()));
        }
        self.publish_channel
            .exchange_declare(
                &spec.name,
                kind,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                args,
            )
            .await
            .map_err(channel_error)
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        let mut args = FieldTable::default();
        if let Some(exchange) = &spec.dead_letter_exchange {
            args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString(exchange.as_str().into()));
        }
        if let Some(routing_key) = &spec.dead_letter_routing_key {
            args.insert("x-dead-letter-routing-key".into(), AMQPValue::LongString(routing_key.as_str().into()));
        }
        if let Some(ttl) = spec.message_ttl {
            args.insert("x-message-ttl".into(), AMQPValue::LongLongInt(ttl.as_millis() as i64));
        }
        if let Some(max_length) = spec.max_length {
            args.insert("x-max-length".into(), AMQPValue::LongLongInt(max_length as i64));
        }
        self.publish_channel
            .queue_declare(&spec.name, QueueDeclareOptions { durable: true, ..Default::default() }, args)
            .await
            .map(|_| ())
            .map_err(channel_error)
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<()> {
        self.publish_channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)
    }

    fn set_confirm_listener(&self, listener: Arc<dyn ConfirmListener>) {
        *self.confirm_listener.write() = Some(listener);
    }

    fn set_return_listener(&self, listener: Arc<dyn ReturnListener>) {
        *self.return_listener.write() = Some(listener);
    }

    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        let properties = BasicProperties::default()
            .with_message_id(ShortString::from(message.message_id.clone()))
            .with_correlation_id(ShortString::from(message.correlation_id.clone()))
            .with_content_type("application/json".into())
            .with_delivery_mode(2)
            .with_headers(headers_to_table(&message.headers));

        let pending = self
            .publish_channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions { mandatory: message.mandatory, ..Default::default() },
                &message.payload,
                properties,
            )
            .await
            .map_err(channel_error)?;

        let confirm_listener = Arc::clone(&self.confirm_listener);
        let return_listener = Arc::clone(&self.return_listener);
        let message_id = message.message_id;
        let correlation_id = message.correlation_id;
        tokio::spawn(async move {
            let (confirm, returned) = match pending.await {
                Ok(Confirmation::Ack(returned)) => (Confirm::Ack, returned),
                Ok(Confirmation::Nack(returned)) => (
                    Confirm::Nack { reason: "broker sent basic.nack".to_string() },
                    returned,
                ),
                Ok(Confirmation::NotRequested) => (Confirm::Ack, None),
                Err(e) => (Confirm::Nack { reason: e.to_string() }, None),
            };

            if let Some(returned) = returned {
                let listener = return_listener.read().clone();
                if let Some(listener) = listener {
                    listener
                        .on_return(ReturnedMessage {
                            message_id: message_id.clone(),
                            correlation_id: correlation_id.clone(),
                            exchange: returned.delivery.exchange.as_str().to_string(),
                            routing_key: returned.delivery.routing_key.as_str().to_string(),
                            reply_code: returned.reply_code,
                            reply_text: returned.reply_text.as_str().to_string(),
                            payload: returned.delivery.data.clone().into(),
                        })
                        .await;
                }
            }

            let listener = confirm_listener.read().clone();
            match listener {
                Some(listener) => listener.on_confirm(&correlation_id, confirm).await,
                None => debug!(correlation_id = %correlation_id, "Confirm received with no listener"),
            }
        });
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> Result<Box<dyn DeliveryStream>> {
        let channel = self.connection.create_channel().await.map_err(channel_error)?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(channel_error)?;
        let consumer = channel
            .basic_consume(queue, consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(channel_error)?;

        info!(queue = %queue, consumer_tag = %consumer_tag, prefetch, "AMQP consumer started");
        Ok(Box::new(AmqpDeliveryStream {
            channel,
            consumer,
            tag: consumer_tag.to_string(),
        }))
    }
}

struct AmqpDeliveryStream {
    channel: Channel,
    consumer: lapin::Consumer,
    tag: String,
}

#[async_trait]
impl DeliveryStream for AmqpDeliveryStream {
    fn consumer_tag(&self) -> &str {
        &self.tag
    }

    async fn next(&mut self) -> Option<Delivery> {
        match self.consumer.next().await? {
            Ok(delivery) => {
                let headers = delivery
                    .properties
                    .headers()
                    .as_ref()
                    .map(table_to_headers)
                    .unwrap_or_default();
                Some(Delivery {
                    delivery_tag: delivery.delivery_tag,
                    exchange: delivery.exchange.as_str().to_string(),
                    routing_key: delivery.routing_key.as_str().to_string(),
                    message_id: delivery.properties.message_id().as_ref().map(|id| id.as_str().to_string()),
                    payload: delivery.data.into(),
                    headers,
                    redelivered: delivery.redelivered,
                })
            }
            Err(e) => {
                warn!(consumer_tag = %self.tag, error = %e, "AMQP consumer stream failed");
                None
            }
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(channel_error)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { requeue, ..Default::default() })
            .await
            .map_err(channel_error)
    }

    async fn cancel(&self) -> Result<()> {
        self.channel
            .basic_cancel(&self.tag, BasicCancelOptions::default())
            .await
            .map_err(channel_error)?;
        // Unacked deliveries are only released once the channel goes away.
        self.channel
            .close(200, "consumer cancelled")
            .await
            .map_err(channel_error)?;
        debug!(consumer_tag = %self.tag, "AMQP consumer cancelled, channel closed");
        Ok(())
    }
}

// ============================================================================
// Header conversion
// ============================================================================

fn headers_to_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(ShortString::from(key.clone()), to_amqp(value));
    }
    table
}

fn to_amqp(value: &FieldValue) -> AMQPValue {
    match value {
        FieldValue::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        FieldValue::Int(i) => AMQPValue::LongLongInt(*i),
        FieldValue::Bool(b) => AMQPValue::Boolean(*b),
        FieldValue::Array(items) => {
            AMQPValue::FieldArray(FieldArray::from(items.iter().map(to_amqp).collect::<Vec<_>>()))
        }
        FieldValue::Table(table) => AMQPValue::FieldTable(headers_to_table(table)),
    }
}

fn table_to_headers(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| from_amqp(value).map(|v| (key.as_str().to_string(), v)))
        .collect()
}

fn from_amqp(value: &AMQPValue) -> Option<FieldValue> {
    let converted = match value {
        AMQPValue::LongString(s) => FieldValue::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => FieldValue::String(s.as_str().to_string()),
        AMQPValue::Boolean(b) => FieldValue::Bool(*b),
        AMQPValue::ShortShortInt(i) => FieldValue::Int(i64::from(*i)),
        AMQPValue::ShortShortUInt(i) => FieldValue::Int(i64::from(*i)),
        AMQPValue::ShortInt(i) => FieldValue::Int(i64::from(*i)),
        AMQPValue::ShortUInt(i) => FieldValue::Int(i64::from(*i)),
        AMQPValue::LongInt(i) => FieldValue::Int(i64::from(*i)),
        AMQPValue::LongUInt(i) => FieldValue::Int(i64::from(*i)),
        AMQPValue::LongLongInt(i) => FieldValue::Int(*i),
        AMQPValue::Timestamp(t) => FieldValue::Int(*t as i64),
        AMQPValue::FieldArray(items) => {
            FieldValue::Array(items.as_slice().iter().filter_map(from_amqp).collect())
        }
        AMQPValue::FieldTable(table) => FieldValue::Table(table_to_headers(table)),
        _ => return None,
    };
    Some(converted)
}
