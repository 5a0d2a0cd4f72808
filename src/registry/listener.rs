//! Continuous query callbacks.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::description::ServiceDescription;
use crate::filter::ServiceFilter;

/// Receives the results of a continuous query.
///
/// Callbacks for one query run in order on a task owned by that query,
/// outside the registry's lock and off its discovery dispatch task. They
/// may call back into the registry, `find` included.
#[async_trait]
pub trait QueryListener: Send + Sync + 'static {
    /// A matching service appeared.
    async fn added_service(&self, desc: ServiceDescription);

    /// A previously reported service went away.
    async fn removed_service(&self, desc: ServiceDescription);

    /// A previously reported service changed its properties.
    async fn changed_service(&self, desc: ServiceDescription) {
        let _ = desc;
    }
}

/// One continuous query notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryEvent {
    /// See [`QueryListener::added_service`].
    Added(ServiceDescription),
    /// See [`QueryListener::removed_service`].
    Removed(ServiceDescription),
    /// See [`QueryListener::changed_service`].
    Changed(ServiceDescription),
}

impl QueryEvent {
    /// The description the event is about.
    pub fn description(&self) -> &ServiceDescription {
        match self {
            Self::Added(desc) | Self::Removed(desc) | Self::Changed(desc) => desc,
        }
    }
}

#[async_trait]
impl QueryListener for mpsc::UnboundedSender<QueryEvent> {
    async fn added_service(&self, desc: ServiceDescription) {
        let _ = self.send(QueryEvent::Added(desc));
    }

    async fn removed_service(&self, desc: ServiceDescription) {
        let _ = self.send(QueryEvent::Removed(desc));
    }

    async fn changed_service(&self, desc: ServiceDescription) {
        let _ = self.send(QueryEvent::Changed(desc));
    }
}

/// Continuous query results as a [`Stream`].
///
/// Created by [`ServiceRegistry::start_query_stream`](crate::ServiceRegistry::start_query_stream).
/// Dropping the stream does not stop the query; pass [`filter`](Self::filter)
/// to [`stop_query`](crate::ServiceRegistry::stop_query).
pub struct QueryStream {
    filter: ServiceFilter,
    receiver: UnboundedReceiverStream<QueryEvent>,
}

impl QueryStream {
    pub(crate) fn new(filter: ServiceFilter) -> (Self, mpsc::UnboundedSender<QueryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = Self {
            filter,
            receiver: UnboundedReceiverStream::new(rx),
        };
        (stream, tx)
    }

    /// The filter this stream was started with.
    pub fn filter(&self) -> &ServiceFilter {
        &self.filter
    }

    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<QueryEvent> {
        self.receiver.as_mut().recv().await
    }
}

impl Stream for QueryStream {
    type Item = QueryEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}
