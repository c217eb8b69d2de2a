//! Application messages
//!
//! An [`ApplicationMessage`] is what clients publish and what subscribers
//! receive, independent of the packet that carried it. Messages are
//! immutable once built and cheap to clone: the topic is an `Arc<str>` and
//! the payload a `Bytes`.

use std::sync::Arc;

use bytes::Bytes;

use crate::protocol::{Properties, ProtocolError, Publish, QoS, Will};
use crate::topic::validate_topic_name;

/// A validated MQTT application message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationMessage {
    topic: Arc<str>,
    payload: Bytes,
    qos: QoS,
    retain: bool,
    /// Message-level v5 properties only
    properties: Properties,
}

impl ApplicationMessage {
    /// Build a message without v5 properties
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<Self, ProtocolError> {
        MessageOptions {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
            ..Default::default()
        }
        .build()
    }

    /// Take the message out of an inbound PUBLISH
    ///
    /// Topic aliases must already be resolved; the alias itself is not kept.
    pub fn from_publish(publish: Publish) -> Result<Self, ProtocolError> {
        validate_topic_name(&publish.topic).map_err(ProtocolError::ProtocolViolation)?;
        Ok(Self {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            properties: message_properties(publish.properties),
        })
    }

    /// Message to publish for a will
    pub fn from_will(will: &Will) -> Result<Self, ProtocolError> {
        validate_topic_name(&will.topic).map_err(ProtocolError::ProtocolViolation)?;
        Ok(Self {
            topic: Arc::from(will.topic.as_str()),
            payload: will.payload.clone(),
            qos: will.qos,
            retain: will.retain,
            properties: message_properties(will.properties.clone()),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn topic_arc(&self) -> &Arc<str> {
        &self.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn retain(&self) -> bool {
        self.retain
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// An empty retained payload clears the retained entry for the topic
    pub fn is_retained_delete(&self) -> bool {
        self.retain && self.payload.is_empty()
    }

    /// Same message with a different retain flag
    pub fn with_retain(&self, retain: bool) -> Self {
        Self {
            retain,
            ..self.clone()
        }
    }

    /// Outbound PUBLISH for this message
    ///
    /// Topic alias and subscription identifiers are scoped to a single
    /// connection and never copied; the caller sets its own.
    pub fn to_publish(&self, qos: QoS, retain: bool, packet_id: Option<u16>) -> Publish {
        Publish {
            dup: false,
            qos,
            retain,
            topic: self.topic.clone(),
            packet_id,
            payload: self.payload.clone(),
            properties: message_properties(self.properties.clone()),
        }
    }
}

/// Keep only the properties that travel with the message
fn message_properties(props: Properties) -> Properties {
    Properties {
        payload_format_indicator: props.payload_format_indicator,
        message_expiry_interval: props.message_expiry_interval,
        content_type: props.content_type,
        response_topic: props.response_topic,
        correlation_data: props.correlation_data,
        user_properties: props.user_properties,
        ..Default::default()
    }
}

/// Plain options for building an [`ApplicationMessage`]
///
/// Validation happens in [`MessageOptions::build`]; an empty topic, a topic
/// with wildcards or an invalid response topic is a protocol violation.
///
/// `topic_alias` and `subscription_identifier` are kept on the message as
/// the publisher supplied them but are not forwarded to subscribers.
#[derive(Debug, Clone, Default)]
pub struct MessageOptions {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub user_properties: Vec<(String, String)>,
    pub message_expiry_interval: Option<u32>,
    pub topic_alias: Option<u16>,
    pub subscription_identifier: Option<u32>,
    pub payload_format_indicator: Option<u8>,
}

impl MessageOptions {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }

    pub fn build(self) -> Result<ApplicationMessage, ProtocolError> {
        validate_topic_name(&self.topic).map_err(ProtocolError::ProtocolViolation)?;

        if let Some(response_topic) = &self.response_topic {
            validate_topic_name(response_topic).map_err(ProtocolError::ProtocolViolation)?;
        }
        if matches!(self.payload_format_indicator, Some(v) if v > 1) {
            return Err(ProtocolError::ProtocolViolation(
                "payload format indicator must be 0 or 1",
            ));
        }
        if self.topic_alias == Some(0) {
            return Err(ProtocolError::ProtocolViolation("topic alias cannot be 0"));
        }
        if self.subscription_identifier == Some(0) {
            return Err(ProtocolError::ProtocolViolation(
                "subscription identifier cannot be 0",
            ));
        }

        let properties = Properties {
            payload_format_indicator: self.payload_format_indicator,
            message_expiry_interval: self.message_expiry_interval,
            content_type: self.content_type,
            response_topic: self.response_topic,
            correlation_data: self.correlation_data,
            user_properties: self.user_properties,
            topic_alias: self.topic_alias,
            subscription_identifiers: self.subscription_identifier.into_iter().collect(),
            ..Default::default()
        };

        Ok(ApplicationMessage {
            topic: Arc::from(self.topic),
            payload: self.payload,
            qos: self.qos,
            retain: self.retain,
            properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_requires_topic() {
        assert_eq!(
            MessageOptions::default().build(),
            Err(ProtocolError::ProtocolViolation("topic name cannot be empty"))
        );
        assert!(ApplicationMessage::new("a/+", "x", QoS::AtMostOnce, false).is_err());
    }

    #[test]
    fn test_build_with_properties() {
        let msg = MessageOptions {
            payload: Bytes::from_static(b"{\"t\":1}"),
            qos: QoS::AtLeastOnce,
            content_type: Some("application/json".into()),
            response_topic: Some("reply/to".into()),
            correlation_data: Some(Bytes::from_static(b"id-1")),
            user_properties: vec![("k".into(), "v".into())],
            message_expiry_interval: Some(10),
            payload_format_indicator: Some(1),
            ..MessageOptions::new("sensors/t1")
        }
        .build()
        .unwrap();

        assert_eq!(msg.topic(), "sensors/t1");
        assert_eq!(msg.qos(), QoS::AtLeastOnce);
        assert_eq!(msg.properties().content_type.as_deref(), Some("application/json"));
        assert_eq!(msg.properties().message_expiry_interval, Some(10));

        let publish = msg.to_publish(QoS::AtMostOnce, false, None);
        assert_eq!(publish.properties.response_topic.as_deref(), Some("reply/to"));
        assert_eq!(&*publish.topic, "sensors/t1");
    }

    #[test]
    fn test_connection_scoped_properties_not_forwarded() {
        let msg = MessageOptions {
            topic_alias: Some(7),
            subscription_identifier: Some(42),
            user_properties: vec![("k".into(), "v".into())],
            ..MessageOptions::new("alerts/fire")
        }
        .build()
        .unwrap();
        assert_eq!(msg.properties().topic_alias, Some(7));
        assert_eq!(msg.properties().subscription_identifiers, vec![42]);

        let publish = msg.to_publish(QoS::AtLeastOnce, false, Some(1));
        assert_eq!(publish.properties.topic_alias, None);
        assert!(publish.properties.subscription_identifiers.is_empty());
        assert_eq!(publish.properties.user_properties, vec![("k".to_string(), "v".to_string())]);
    }

    #[test]
    fn test_build_rejects_bad_properties() {
        let bad_response = MessageOptions {
            response_topic: Some("reply/#".into()),
            ..MessageOptions::new("t")
        };
        assert!(bad_response.build().is_err());

        let bad_format = MessageOptions {
            payload_format_indicator: Some(2),
            ..MessageOptions::new("t")
        };
        assert!(bad_format.build().is_err());
    }

    #[test]
    fn test_from_publish_drops_topic_alias() {
        let mut publish = Publish {
            topic: Arc::from("a/b"),
            payload: Bytes::from_static(b"x"),
            ..Default::default()
        };
        publish.properties.topic_alias = Some(3);
        publish.properties.content_type = Some("text/plain".into());

        let msg = ApplicationMessage::from_publish(publish).unwrap();
        assert_eq!(msg.properties().topic_alias, None);
        assert_eq!(msg.properties().content_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn test_retained_delete() {
        let msg = ApplicationMessage::new("a", Bytes::new(), QoS::AtMostOnce, true).unwrap();
        assert!(msg.is_retained_delete());
        assert!(!msg.with_retain(false).is_retained_delete());
    }
}
