#![warn(missing_docs)]
//! All the different messages which can be sent/received to/from the control
//! plane services and the io-engine instances over the message bus.
//! This crate owns the bus connection itself (NATS) and the payload envelope;
//! the only messages currently flowing through it are the instance
//! registration heartbeats.

/// Version 0 of the messages
pub mod v0;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use std::{str::FromStr, sync::Arc, time::Duration};

/// Result wrapper for send/receive
pub type BusResult<T> = Result<T, Error>;

/// Common error type for send/receive
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("Failed to serialise payload for channel '{}'", channel))]
    SerializeSend {
        channel: Channel,
        source: serde_json::Error,
    },
    #[snafu(display("Failed to deserialise received payload '{}'", payload))]
    DeserializeReceive {
        payload: String,
        source: serde_json::Error,
    },
    #[snafu(display("Message payload has unexpected message id '{}'", id))]
    WrongMessageId { id: MessageId },
    #[snafu(display("Failed to publish on channel '{}'", channel))]
    Publish {
        channel: Channel,
        source: std::io::Error,
    },
    #[snafu(display("Failed to subscribe on channel '{}'", channel))]
    Subscribe {
        channel: Channel,
        source: std::io::Error,
    },
    #[snafu(display("Invalid message id string '{}'", id))]
    InvalidMessageId { id: String },
}

/// Versioned message bus channels, mapped to NATS subjects
#[derive(Clone, Debug, Eq, PartialEq)]
#[allow(non_camel_case_types)]
pub enum Channel {
    /// Version 0 of the channels
    v0(v0::ChannelVs),
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::v0(channel) => write!(f, "v0/{}", channel),
        }
    }
}

impl Default for Channel {
    fn default() -> Self {
        Channel::v0(v0::ChannelVs::Default)
    }
}

/// Versioned message id, sent within the payload envelope so subscribers can
/// triage a message before fully decoding it
#[derive(Clone, Debug, Eq, PartialEq)]
#[allow(non_camel_case_types)]
pub enum MessageId {
    /// Version 0 of the message ids
    v0(v0::MessageIdVs),
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageId::v0(id) => write!(f, "v0/{}", id),
        }
    }
}

impl FromStr for MessageId {
    type Err = strum::ParseError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        match source.split_once('/') {
            Some(("v0", id)) => Ok(MessageId::v0(v0::MessageIdVs::from_str(id)?)),
            _ => Err(strum::ParseError::VariantNotFound),
        }
    }
}

impl Serialize for MessageId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let string = String::deserialize(deserializer)?;
        MessageId::from_str(&string).map_err(serde::de::Error::custom)
    }
}

/// Identifies the sender of a message, defaulting to the pod/node name
pub type SenderId = String;

/// Payload envelope put on the wire: the message id, the sender and the
/// message data itself
#[derive(Serialize, Deserialize, Debug)]
pub struct SendPayload<T> {
    /// message id
    pub id: MessageId,
    /// sender identifier
    pub sender: SenderId,
    /// actual message data
    pub data: T,
}

/// Preamble of a received payload, just enough to triage by message id
#[derive(Deserialize, Debug)]
pub(crate) struct Preamble {
    pub(crate) id: MessageId,
}

/// Decode the `data` of a received payload as `T`, checking the id first
pub fn decode_payload<T: DeserializeOwned>(expected: MessageId, bytes: &[u8]) -> BusResult<T> {
    let preamble: Preamble = serde_json::from_slice(bytes).context(DeserializeReceiveSnafu {
        payload: String::from_utf8_lossy(bytes).to_string(),
    })?;
    if preamble.id != expected {
        return Err(Error::WrongMessageId { id: preamble.id });
    }
    let payload: SendPayload<T> = serde_json::from_slice(bytes).context(DeserializeReceiveSnafu {
        payload: String::from_utf8_lossy(bytes).to_string(),
    })?;
    Ok(payload.data)
}

/// Main message trait for payloads which can be published on the bus
#[async_trait]
pub trait Message: Serialize + Sized + Sync {
    /// the message id of this message
    fn id(&self) -> MessageId;
    /// the default channel on which this message is sent
    fn channel(&self) -> Channel;

    /// publish the message on its default channel, fire and forget
    async fn publish(&self) -> BusResult<()> {
        let payload = SendPayload {
            id: self.id(),
            sender: sender_name(),
            data: self,
        };
        let channel = self.channel();
        let bytes = serde_json::to_vec(&payload).context(SerializeSendSnafu {
            channel: channel.clone(),
        })?;
        bus().publish(channel, &bytes).await
    }
}

/// each client needs a unique identification
fn sender_name() -> SenderId {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "default".into())
}

/// Use version 0 of the message id and channel
#[macro_export]
macro_rules! impl_channel_id {
    ($I:ident, $C:ident) => {
        fn id(&self) -> $crate::MessageId {
            $crate::MessageId::v0($crate::v0::MessageIdVs::$I)
        }
        fn channel(&self) -> $crate::Channel {
            $crate::Channel::v0($crate::v0::ChannelVs::$C)
        }
    };
}

/// Message bus, the only implementation is currently NATS
#[async_trait]
pub trait Bus: Send + Sync {
    /// publish a message, not guaranteed to be delivered
    async fn publish(&self, channel: Channel, payload: &[u8]) -> BusResult<()>;
    /// subscribe to a channel
    async fn subscribe(&self, channel: Channel) -> BusResult<BusSubscription>;
}

/// Reference counted shared bus handle
pub type DynBus = Arc<dyn Bus>;

/// Subscription to a channel, yielding raw payloads
pub struct BusSubscription {
    subscription: nats::asynk::Subscription,
}

impl BusSubscription {
    /// wait for the next payload on the channel, None when unsubscribed
    pub async fn next(&self) -> Option<Vec<u8>> {
        self.subscription.next().await.map(|message| message.data)
    }
}

/// NATS implementation of the `Bus`
pub struct NatsMessageBus {
    connection: nats::asynk::Connection,
}

impl NatsMessageBus {
    /// Connect to the NATS server, retrying with a backoff until it succeeds.
    /// NATS itself reconnects under the covers once the first connection is
    /// established.
    pub async fn connect(server: &str) -> Self {
        tracing::debug!("Connecting to the nats server {}...", server);
        let mut interval = Duration::from_millis(500);
        loop {
            match nats::asynk::connect(server).await {
                Ok(connection) => {
                    tracing::info!("Successfully connected to the nats server {}", server);
                    return Self { connection };
                }
                Err(error) => {
                    tracing::warn!(
                        "Nats connection to {} failed: {}. Retrying in {:?}...",
                        server,
                        error,
                        interval
                    );
                    tokio::time::sleep(interval).await;
                    interval = (interval * 2).min(Duration::from_secs(10));
                }
            }
        }
    }
}

#[async_trait]
impl Bus for NatsMessageBus {
    async fn publish(&self, channel: Channel, payload: &[u8]) -> BusResult<()> {
        self.connection
            .publish(&channel.to_string(), payload)
            .await
            .context(PublishSnafu { channel })
    }

    async fn subscribe(&self, channel: Channel) -> BusResult<BusSubscription> {
        let subscription = self
            .connection
            .subscribe(&channel.to_string())
            .await
            .context(SubscribeSnafu { channel })?;
        Ok(BusSubscription { subscription })
    }
}

static NATS_MSG_BUS: OnceCell<DynBus> = OnceCell::new();

/// Initialise the process-wide message bus connection to `server`
pub async fn message_bus_init(server: String) {
    let bus = NatsMessageBus::connect(&server).await;
    NATS_MSG_BUS
        .set(Arc::new(bus))
        .ok()
        .expect("The message bus should only be initialised once");
}

/// Get the process-wide message bus, which must have been initialised first
pub fn bus() -> DynBus {
    NATS_MSG_BUS
        .get()
        .expect("Should be initialised before use")
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v0::{MessageIdVs, Register, RegistrationOps};

    #[test]
    fn message_id_round_trip() {
        let id = MessageId::v0(MessageIdVs::Register);
        assert_eq!(id.to_string(), "v0/register");
        assert_eq!(MessageId::from_str("v0/register").unwrap(), id);
        assert!(MessageId::from_str("v1/register").is_err());
        assert!(MessageId::from_str("register").is_err());
    }

    #[test]
    fn registration_envelope() {
        let register = Register {
            id: "node-1".into(),
            grpc_endpoint: "10.1.0.2:10124".to_string(),
        };
        let payload = SendPayload {
            id: MessageId::v0(MessageIdVs::Register),
            sender: "node-1".to_string(),
            data: &register,
        };
        let bytes = serde_json::to_vec(&payload).unwrap();
        match RegistrationOps::try_from(bytes.as_slice()).unwrap() {
            RegistrationOps::Register(received) => {
                assert_eq!(received.id, register.id);
                assert_eq!(received.grpc_endpoint, register.grpc_endpoint);
            }
            _ => panic!("expected a registration"),
        }
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(RegistrationOps::try_from(b"not even json".as_slice()).is_err());
        assert!(RegistrationOps::try_from(br#"{"id":"v0/liveness"}"#.as_slice()).is_err());
        // missing the data fields
        assert!(RegistrationOps::try_from(br#"{"id":"v0/register"}"#.as_slice()).is_err());
    }
}
