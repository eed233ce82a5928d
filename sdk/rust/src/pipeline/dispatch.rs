//! Terminal stages handing operations to a transport.

use std::sync::Arc;

use futures::future;
use futures::stream::{self, StreamExt};

use super::{Next, Stage, StageFuture};
use crate::operation::{Operation, OperationKind};
use crate::transport::{StatelessTransport, StreamingController};

/// Sends queries and mutations over the stateless transport.
pub struct FetchStage {
    transport: StatelessTransport,
}

impl FetchStage {
    pub fn new(transport: StatelessTransport) -> Self {
        Self { transport }
    }
}

impl Stage for FetchStage {
    fn name(&self) -> &str {
        "fetch"
    }

    fn run(&self, operation: Arc<Operation>, next: Next) -> StageFuture {
        if operation.kind == OperationKind::Subscription {
            return next.run(operation);
        }
        let transport = self.transport.clone();
        // The request starts when the stream is first polled.
        let results = stream::once(async move { transport.send(&operation).await }).boxed();
        Box::pin(future::ready(Ok(results)))
    }
}

/// Routes subscriptions to the streaming controller.
pub struct SubscriptionStage {
    controller: Arc<StreamingController>,
}

impl SubscriptionStage {
    pub fn new(controller: Arc<StreamingController>) -> Self {
        Self { controller }
    }
}

impl Stage for SubscriptionStage {
    fn name(&self) -> &str {
        "subscription"
    }

    fn run(&self, operation: Arc<Operation>, next: Next) -> StageFuture {
        if operation.kind != OperationKind::Subscription {
            return next.run(operation);
        }
        Box::pin(future::ready(Ok(self.controller.subscribe(&operation))))
    }
}
