//! A thin wrapper around `lapin` implementing exactly the reconnect
//! protocol and delivery lifecycle the consumer loop needs, nothing more.
use std::time::Duration;

use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions,
        BasicConsumeOptions,
        BasicQosOptions,
        BasicRejectOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    Channel,
    Connection,
    ConnectionProperties,
    Consumer,
};

use crate::config::WorkerConfig;

/// One AMQP delivery, opaque outside of `ack`/`reject`.
pub struct Delivery(lapin::message::Delivery);

impl Delivery {
    pub fn data(&self) -> &[u8] {
        &self.0.data
    }
}

pub struct BrokerClient {
    uri: String,
    queue: String,
    prefetch_count: u16,
    // Held for as long as `channel`/`consumer` are in use -- dropping it
    // tears down the connection's IO loop out from under them.
    _connection: Connection,
    channel: Channel,
    consumer: Consumer,
}

impl BrokerClient {
    pub async fn connect(config: &WorkerConfig, prefetch_count: u16) -> anyhow::Result<Self> {
        let uri = config.amqp_uri();
        let (connection, channel, consumer) = open_consumer(&uri, &config.rabbit_queue, prefetch_count).await?;
        Ok(Self {
            uri,
            queue: config.rabbit_queue.clone(),
            prefetch_count,
            _connection: connection,
            channel,
            consumer,
        })
    }

    /// Tear down the current channel and open a fresh connection, retrying
    /// every `retry_delay` until it succeeds. Never returns an error: the
    /// consumer loop is expected to retry forever on broker failures.
    pub async fn reconnect(&mut self, retry_delay: Duration) {
        loop {
            match open_consumer(&self.uri, &self.queue, self.prefetch_count).await {
                Ok((connection, channel, consumer)) => {
                    self._connection = connection;
                    self.channel = channel;
                    self.consumer = consumer;
                    tracing::info!("reconnected to broker at {}", self.uri);
                    return;
                },
                Err(e) => {
                    tracing::warn!("failed to reconnect to broker: {e:#}; retrying in {retry_delay:?}");
                    tokio::time::sleep(retry_delay).await;
                },
            }
        }
    }

    /// Wait up to `timeout` for the next delivery. `Ok(None)` means the
    /// timeout elapsed with no delivery; `Err` means the underlying stream
    /// failed and the caller should reconnect.
    pub async fn recv(&mut self, timeout: Duration) -> anyhow::Result<Option<Delivery>> {
        match tokio::time::timeout(timeout, self.consumer.next()).await {
            Err(_elapsed) => Ok(None),
            Ok(None) => anyhow::bail!("broker consumer stream ended"),
            Ok(Some(Err(e))) => Err(anyhow::Error::from(e).context("broker delivery error")),
            Ok(Some(Ok(delivery))) => Ok(Some(Delivery(delivery))),
        }
    }

    pub async fn ack(&self, delivery: Delivery) -> anyhow::Result<()> {
        delivery.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    pub async fn reject(&self, delivery: Delivery, requeue: bool) -> anyhow::Result<()> {
        delivery.0.reject(BasicRejectOptions { requeue }).await?;
        Ok(())
    }
}

async fn open_consumer(
    uri: &str,
    queue: &str,
    prefetch_count: u16,
) -> anyhow::Result<(Connection, Channel, Consumer)> {
    let connection = Connection::connect(uri, ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                auto_delete: false,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    channel.basic_qos(prefetch_count, BasicQosOptions::default()).await?;
    let consumer = channel
        .basic_consume(
            queue,
            "ts-ingest-worker",
            BasicConsumeOptions {
                no_ack: false,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok((connection, channel, consumer))
}
