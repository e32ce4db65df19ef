use crate::broker::{BrokerClient, InboundMessage};
use crate::config::ClientSettings;
use crate::constants::GROUP_ID_KEY;
use crate::error::{ClientError, ConsumerError, HandlerError, ProducerError};
use crate::properties::{self, Configuration};
use crate::session::{
    ConsumerSession, ConsumerState, OutboundMessage, ProducerSession, ProducerState,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// One producer and one consumer sharing a configuration and a consumer group.
///
/// Build it with [`Client::connect`]; it resolves once the producer is ready.
pub struct Client {
    group_id: String,
    config: Configuration,
    producer: ProducerSession,
    consumer: ConsumerSession,
}

impl Client {
    pub async fn connect(
        group_id: impl Into<String>,
        settings: &ClientSettings,
        broker: Arc<dyn BrokerClient>,
    ) -> Result<Client, ClientError> {
        let group_id = group_id.into();
        let mut config = properties::load(&settings.properties_path)?;
        config.insert(GROUP_ID_KEY, group_id.as_str());
        info!(group = %group_id, path = ?settings.properties_path, "setting up client");

        let producer = ProducerSession::new(Arc::clone(&broker))
            .with_connect_timeout(settings.connect_timeout());
        producer.start(&config).await?;

        let consumer = ConsumerSession::new(broker);
        if let Err(e) = consumer.start(&config) {
            producer.close().await;
            return Err(e.into());
        }

        info!(group = %group_id, "client is ready");
        Ok(Client {
            group_id,
            config,
            producer,
            consumer,
        })
    }

    pub fn produce<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        message: &T,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<(), ProducerError> {
        self.producer.publish(topic, message, scheduled_at)
    }

    pub fn produce_message<T: Serialize>(
        &self,
        message: OutboundMessage<T>,
    ) -> Result<(), ProducerError> {
        self.producer.publish_message(message)
    }

    /// See [`ConsumerSession::activate`].
    pub fn activate_consumer<F>(&self, topic: &str, handler: F) -> Result<(), ConsumerError>
    where
        F: FnMut(Result<&InboundMessage, HandlerError>) -> anyhow::Result<()> + Send + 'static,
    {
        self.consumer.activate(topic, handler)
    }

    /// Closes both sessions. Never fails.
    pub async fn close(&self) {
        info!(group = %self.group_id, "closing client");
        self.producer.close().await;
        self.consumer.close();
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Loaded properties with `group.id` applied.
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn producer_state(&self) -> ProducerState {
        self.producer.state()
    }

    pub fn consumer_state(&self) -> ConsumerState {
        self.consumer.state()
    }
}
