use std::collections::HashMap;

/// Maximum outbound payload size in bytes (Service Bus standard tier)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Application property the requester sets on the last request of a session
pub const FINAL_MESSAGE_PROPERTY: &str = "finalMessage";

/// Value of [`FINAL_MESSAGE_PROPERTY`] that marks the end of a session
pub const FINAL_MESSAGE_VALUE: &str = "yes";

/// A request as delivered by the transport
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundRequest {
    /// Transport-assigned message id, unique per message
    pub id: String,

    /// Opaque payload, treated as text
    pub body: String,

    /// Destination the requester wants the reply on
    pub reply_to: Option<String>,

    /// Caller-supplied correlation id (carried, never used for replies)
    pub correlation_hint: Option<String>,

    /// Application-level properties
    pub application_properties: HashMap<String, String>,

    /// Number of times this message has been delivered (1 on first delivery)
    pub delivery_count: u32,
}

impl InboundRequest {
    pub fn new(id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
            delivery_count: 1,
            ..Default::default()
        }
    }

    /// Set the reply-to destination
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Set the caller-supplied correlation hint
    pub fn with_correlation_hint(mut self, hint: impl Into<String>) -> Self {
        self.correlation_hint = Some(hint.into());
        self
    }

    /// Set an application property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.application_properties.insert(key.into(), value.into());
        self
    }

    /// Set the `finalMessage` property the way requesters do
    pub fn with_final_flag(self, is_final: bool) -> Self {
        let value = if is_final { FINAL_MESSAGE_VALUE } else { "no" };
        self.with_property(FINAL_MESSAGE_PROPERTY, value)
    }

    /// Reply-to destination, treating an empty name as absent
    pub fn reply_destination(&self) -> Option<&str> {
        self.reply_to
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    /// Whether the requester marked this as the last request of the session.
    /// A missing property means the session continues.
    pub fn is_final(&self) -> bool {
        self.application_properties
            .get(FINAL_MESSAGE_PROPERTY)
            .is_some_and(|value| value == FINAL_MESSAGE_VALUE)
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.body.len()
    }
}

/// A reply ready to be published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundResponse {
    /// Reply payload
    pub body: String,

    /// Id of the request this answers
    pub correlation_id: String,

    /// Queue the reply is sent to
    pub destination: String,
}

impl OutboundResponse {
    pub fn new(
        destination: impl Into<String>,
        body: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            body: body.into(),
            correlation_id: correlation_id.into(),
            destination: destination.into(),
        }
    }

    /// Get message size in bytes
    pub fn size(&self) -> usize {
        self.body.len()
    }

    /// Check if message exceeds size limit
    pub fn exceeds_limit(&self, limit: usize) -> bool {
        self.body.len() > limit
    }
}

/// What the transport hands back after a successful send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// Transport-assigned id of the published message
    pub message_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_flag_parsing() {
        let request = InboundRequest::new("m1", "hello").with_final_flag(true);
        assert!(request.is_final());

        let request = InboundRequest::new("m1", "hello").with_final_flag(false);
        assert!(!request.is_final());

        // Missing property is not final
        assert!(!InboundRequest::new("m1", "hello").is_final());

        // Only the exact marker counts
        let request = InboundRequest::new("m1", "hello").with_property(FINAL_MESSAGE_PROPERTY, "YES");
        assert!(!request.is_final());
    }

    #[test]
    fn test_reply_destination_treats_blank_as_absent() {
        assert_eq!(InboundRequest::new("m1", "x").reply_destination(), None);
        assert_eq!(
            InboundRequest::new("m1", "x").with_reply_to("").reply_destination(),
            None
        );
        assert_eq!(
            InboundRequest::new("m1", "x").with_reply_to("  ").reply_destination(),
            None
        );
        assert_eq!(
            InboundRequest::new("m1", "x")
                .with_reply_to("resp-q")
                .reply_destination(),
            Some("resp-q")
        );
    }

    #[test]
    fn test_outbound_size_limit() {
        let response = OutboundResponse::new("resp-q", "hello", "m1");
        assert_eq!(response.size(), 5);
        assert!(response.exceeds_limit(4));
        assert!(!response.exceeds_limit(5));
    }
}
