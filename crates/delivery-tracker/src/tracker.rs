//! Wiring of the tracker components around one store and one configuration.

use crate::ack::{AckMessageProcessor, AckProcessor};
use crate::cache::DataMessageCache;
use crate::configuration::DeliveryTrackerConfiguration;
use crate::handler::MessagesHandler;
use crate::health::HealthIndicator;
use crate::partitions_states::PartitionsStates;
use crate::pipeline::{OutboundPipeline, Publisher};
use crate::processor::DeliveryTrackerProcessor;
use crate::rebalance::TrackerRebalanceListener;
use crate::replayer::MessageReplayer;
use crate::scheduler::ReplayScheduler;
use crate::store::StateStore;
use std::sync::Arc;

/// A fully wired delivery tracker.
///
/// The bus consumer feeds [`handler`](Self::handler), the replay scheduler
/// calls [`replayer`](Self::replayer), ack consumers use the two ack
/// processors, and rebalances go through [`rebalance`](Self::rebalance).
pub struct DeliveryTracker {
    configuration: DeliveryTrackerConfiguration,
    health: HealthIndicator,
    states: Arc<PartitionsStates>,
    cache: Arc<DataMessageCache>,
    handler: MessagesHandler,
    replayer: MessageReplayer,
    ack_messages: AckMessageProcessor,
    acks: AckProcessor,
    rebalance: TrackerRebalanceListener,
}

impl DeliveryTracker {
    pub fn new(
        configuration: DeliveryTrackerConfiguration,
        store: Arc<dyn StateStore>,
        scheduler: Arc<dyn ReplayScheduler>,
        pipeline: Arc<dyn OutboundPipeline>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let health = HealthIndicator::new();
        let states = Arc::new(PartitionsStates::new(
            store.clone(),
            scheduler.clone(),
            configuration.subscribe(),
            health.clone(),
        ));
        let cache = Arc::new(
            DataMessageCache::new(store, configuration.subscribe(), health.clone())
                .with_offsets_listener(states.clone()),
        );
        let processor = Arc::new(DeliveryTrackerProcessor::new(
            states.clone(),
            cache.clone(),
            pipeline.clone(),
            publisher.clone(),
            configuration.subscribe(),
        ));

        Self {
            handler: MessagesHandler::new(processor, states.clone()),
            replayer: MessageReplayer::new(cache.clone(), pipeline, publisher, configuration.subscribe()),
            ack_messages: AckMessageProcessor::new(states.clone()),
            acks: AckProcessor::new(cache.clone(), states.clone(), scheduler),
            rebalance: TrackerRebalanceListener::new(states.clone()),
            configuration,
            health,
            states,
            cache,
        }
    }

    /// Start periodic persistence.
    pub fn start(&self) {
        self.states.start();
    }

    /// Stop periodic persistence without waiting for it.
    pub fn stop(&self) {
        self.states.stop();
    }

    pub fn configuration(&self) -> &DeliveryTrackerConfiguration {
        &self.configuration
    }

    pub fn health(&self) -> &HealthIndicator {
        &self.health
    }

    pub fn states(&self) -> &Arc<PartitionsStates> {
        &self.states
    }

    pub fn cache(&self) -> &Arc<DataMessageCache> {
        &self.cache
    }

    pub fn handler(&self) -> &MessagesHandler {
        &self.handler
    }

    pub fn replayer(&self) -> &MessageReplayer {
        &self.replayer
    }

    pub fn ack_messages(&self) -> &AckMessageProcessor {
        &self.ack_messages
    }

    pub fn acks(&self) -> &AckProcessor {
        &self.acks
    }

    pub fn rebalance(&self) -> &TrackerRebalanceListener {
        &self.rebalance
    }
}
