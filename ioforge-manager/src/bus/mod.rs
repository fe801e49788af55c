use async_trait::async_trait;
use futures::StreamExt;
use ioforge_common::config::RedisConfig;
use ioforge_common::events::Event;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("event bus disabled")]
    Disabled,
}

/// Publish/subscribe channel to the agents. The bus is best-effort: loss of
/// an event never terminates an execution, and the core must keep working
/// when no bus is available at all (direct-command mode).
#[async_trait]
pub trait EventBus: Send + Sync {
    fn is_enabled(&self) -> bool;

    async fn publish(&self, channel: &str, event: &Event) -> Result<(), BusError>;

    /// Subscribe to channel patterns; events arrive on the returned receiver
    /// until it is dropped.
    async fn subscribe(&self, patterns: &[String]) -> Result<mpsc::Receiver<Event>, BusError>;
}

pub struct RedisEventBus {
    client: redis::Client,
    connection: redis::aio::MultiplexedConnection,
}

impl RedisEventBus {
    pub async fn connect(config: &RedisConfig) -> Result<Self, BusError> {
        let url = config.url();
        info!("connecting to event bus at {url}");
        let client = redis::Client::open(url)?;
        let mut connection = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut connection).await?;
        info!("connected to event bus");
        Ok(RedisEventBus { client, connection })
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn publish(&self, channel: &str, event: &Event) -> Result<(), BusError> {
        let payload = serde_json::to_string(event)?;
        let mut connection = self.connection.clone();
        let _subscribers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut connection)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, patterns: &[String]) -> Result<mpsc::Receiver<Event>, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for pattern in patterns {
            pubsub.psubscribe(pattern).await?;
        }
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("dropping undecodable bus message: {e}");
                        continue;
                    }
                };
                match serde_json::from_str::<Event>(&payload) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("dropping malformed event: {e}"),
                }
            }
            debug!("bus subscription closed");
        });
        Ok(rx)
    }
}

/// Stand-in when no broker is reachable; publishes vanish and subscriptions
/// yield nothing. The engine then drives agents over remote commands only.
pub struct DisabledEventBus;

#[async_trait]
impl EventBus for DisabledEventBus {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn publish(&self, channel: &str, _event: &Event) -> Result<(), BusError> {
        debug!("event bus disabled, dropping publish to {channel}");
        Ok(())
    }

    async fn subscribe(&self, _patterns: &[String]) -> Result<mpsc::Receiver<Event>, BusError> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use ioforge_common::events::EventKind;

    #[test]
    async fn disabled_bus_swallows_publishes_and_closes_subscriptions() {
        let bus = DisabledEventBus;
        assert!(!bus.is_enabled());
        let event = Event::new(EventKind::ExecutionStop, "manager");
        bus.publish("ctrl:broadcast", &event).await.unwrap();

        let mut rx = bus.subscribe(&["metrics:*".to_string()]).await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
