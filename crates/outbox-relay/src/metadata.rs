//! Capture of request-scoped context into message headers.

use crate::message::MessageHeaders;
use crate::serializer::OutboxEvent;

/// Request-scoped context available while the business transaction runs.
///
/// Implemented by the application (request extensions, task-locals, an auth
/// principal). It is consulted once, when a message is appended; the
/// processor only ever sees the resolved headers.
pub trait AmbientContext {
    fn tenant_id(&self) -> Option<String>;

    fn correlation_id(&self) -> Option<String>;

    fn causation_id(&self) -> Option<String>;

    fn actor_id(&self) -> Option<String>;
}

/// A context with fixed values, for jobs and tests without a request scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticContext {
    pub tenant_id: Option<String>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub actor_id: Option<String>,
}

impl StaticContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn causation(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }
}

impl AmbientContext for StaticContext {
    fn tenant_id(&self) -> Option<String> {
        self.tenant_id.clone()
    }

    fn correlation_id(&self) -> Option<String> {
        self.correlation_id.clone()
    }

    fn causation_id(&self) -> Option<String> {
        self.causation_id.clone()
    }

    fn actor_id(&self) -> Option<String> {
        self.actor_id.clone()
    }
}

/// Builds the headers for a new message.
///
/// Absent context values produce no header rather than an empty one.
#[derive(Debug, Clone)]
pub struct MetadataEnricher {
    content_type: String,
}

impl MetadataEnricher {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
        }
    }

    pub fn enrich<E>(&self, event: &E, ctx: &dyn AmbientContext) -> MessageHeaders
    where
        E: OutboxEvent + ?Sized,
    {
        let mut headers = MessageHeaders::new()
            .with(MessageHeaders::CONTENT_TYPE, self.content_type.as_str())
            .with(MessageHeaders::EVENT_TYPE, event.event_type());

        let captured = [
            (MessageHeaders::TENANT_ID, ctx.tenant_id()),
            (MessageHeaders::CORRELATION_ID, ctx.correlation_id()),
            (MessageHeaders::CAUSATION_ID, ctx.causation_id()),
            (MessageHeaders::ACTOR_ID, ctx.actor_id()),
        ];
        for (key, value) in captured {
            if let Some(value) = value {
                headers.insert(key, value);
            }
        }

        headers
    }
}
