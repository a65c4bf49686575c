//! Consumer task that moves Kafka records into a subscriber channel.

use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use stockroom_core::event::SerializedEvent;
use stockroom_core::event_bus::{Delivery, EventBusError};
use tokio::sync::mpsc;

type Item = Result<Delivery, EventBusError>;

/// Decode one record's payload.
pub(crate) fn decode_payload(payload: Option<&[u8]>) -> Result<SerializedEvent, EventBusError> {
    let payload = payload
        .ok_or_else(|| EventBusError::DeserializationFailed("Message has no payload".to_string()))?;
    bincode::deserialize::<SerializedEvent>(payload)
        .map_err(|e| EventBusError::DeserializationFailed(format!("Failed to deserialize event: {e}")))
}

fn commit(consumer: &StreamConsumer, message: &BorrowedMessage<'_>) {
    if let Err(e) = consumer.commit_message(message, CommitMode::Async) {
        tracing::warn!(
            topic = message.topic(),
            partition = message.partition(),
            offset = message.offset(),
            error = %e,
            "Offset commit failed, record may be redelivered"
        );
    }
}

/// Own `consumer` and forward every record to `tx` until the receiver drops.
///
/// Records go out one at a time. The offset is committed once the subscriber
/// acknowledges the delivery. A delivery dropped unacked ends the task, and
/// with it the subscription, so the group resumes from the last committed
/// offset. Records that cannot be decoded are reported and committed.
pub(crate) async fn forward(consumer: StreamConsumer, tx: mpsc::Sender<Item>) {
    let mut stream = consumer.stream();

    while let Some(next) = stream.next().await {
        match next {
            Ok(message) => {
                let event = match decode_payload(message.payload()) {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!(
                            topic = message.topic(),
                            offset = message.offset(),
                            error = %e,
                            "Skipping undecodable record"
                        );
                        if tx.send(Err(e)).await.is_err() {
                            break;
                        }
                        commit(&consumer, &message);
                        continue;
                    }
                };
                tracing::trace!(
                    topic = message.topic(),
                    offset = message.offset(),
                    event_type = %event.event_type,
                    "Received event"
                );

                let (delivery, acked) = Delivery::tracked(event);
                if tx.send(Ok(delivery)).await.is_err() {
                    break;
                }
                if acked.await.is_err() {
                    tracing::warn!(
                        topic = message.topic(),
                        partition = message.partition(),
                        offset = message.offset(),
                        "Event was not acknowledged, closing the subscription for redelivery"
                    );
                    break;
                }
                commit(&consumer, &message);
            }
            Err(e) => {
                let err = EventBusError::TransportError(format!("Failed to receive message: {e}"));
                if tx.send(Err(err)).await.is_err() {
                    break;
                }
            }
        }
    }

    tracing::debug!("Consumer task exiting");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn missing_payload_is_a_decode_error() {
        assert!(matches!(
            decode_payload(None),
            Err(EventBusError::DeserializationFailed(_))
        ));
    }

    #[test]
    fn payload_decodes_into_serialized_event() {
        let event = SerializedEvent::new("UnbookStore.v1".to_string(), vec![7, 8]);
        let bytes = bincode::serialize(&event).unwrap();

        assert_eq!(decode_payload(Some(&bytes)).unwrap(), event);
    }
}
