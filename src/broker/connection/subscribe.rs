//! SUBSCRIBE and UNSUBSCRIBE packet handling

use std::sync::Arc;

use tracing::debug;

use super::{Connection, ConnectionError};
use crate::channel::ChannelAdapter;
use crate::protocol::{
    Packet, Properties, ProtocolError, SubAck, Subscribe, UnsubAck, Unsubscribe,
};
use crate::session::Session;
use crate::topic::validate_topic_filter;

/// A malformed filter closes the connection instead of being refused in
/// the ack
fn check_filters<'a>(filters: impl IntoIterator<Item = &'a str>) -> Result<(), ProtocolError> {
    for filter in filters {
        if let Err(reason) = validate_topic_filter(filter) {
            debug!("rejecting topic filter {:?}: {}", filter, reason);
            return Err(ProtocolError::InvalidTopicFilter(filter.to_string()));
        }
    }
    Ok(())
}

impl<C: ChannelAdapter> Connection<C> {
    /// Handle SUBSCRIBE packet
    ///
    /// SUBACK goes out before any retained message the subscription replays.
    pub(crate) async fn handle_subscribe(
        &mut self,
        session: &Arc<Session>,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        check_filters(subscribe.subscriptions.iter().map(|s| s.filter.as_str()))?;

        let identifier = subscribe.properties.subscription_identifiers.first().copied();
        let reason_codes = session.subscribe_with_identifier(
            &subscribe.subscriptions,
            identifier,
            self.broker.retained(),
        );

        for (subscription, reason) in subscribe.subscriptions.iter().zip(&reason_codes) {
            debug!(
                "{} subscribed to {} ({})",
                session.client_id(),
                subscription.filter,
                reason
            );
        }

        let suback = SubAck {
            packet_id: subscribe.packet_id,
            reason_codes,
            properties: Properties::default(),
        };
        self.send(Packet::SubAck(suback)).await?;
        self.flush_outbound(session).await
    }

    /// Handle UNSUBSCRIBE packet
    pub(crate) async fn handle_unsubscribe(
        &mut self,
        session: &Arc<Session>,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        check_filters(unsubscribe.filters.iter().map(|f| f.as_str()))?;

        let reason_codes = session.unsubscribe(&unsubscribe.filters);
        debug!("{} unsubscribed from {:?}", session.client_id(), unsubscribe.filters);

        let unsuback = UnsubAck {
            packet_id: unsubscribe.packet_id,
            reason_codes,
            properties: Properties::default(),
        };
        self.send(Packet::UnsubAck(unsuback)).await
    }
}
