//! Best-effort push notifications emitted by the round contracts.

use crate::snapshot::{
    Account,
    TicketNumbers,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoundEvent {
    ParticipantJoined { account: Account },
    ResultDistributed,
    NumbersPublished(TicketNumbers),
}

impl RoundEvent {
    pub fn label(&self) -> &'static str {
        match self {
            RoundEvent::ParticipantJoined { .. } => "participant joined",
            RoundEvent::ResultDistributed => "result distributed",
            RoundEvent::NumbersPublished(_) => "numbers published",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    #[error("event stream closed")]
    Closed,
    #[error("{0}")]
    Failed(String),
}

pub trait EventSource: Send + 'static {
    fn next_event(
        &mut self,
    ) -> impl Future<Output = Result<RoundEvent, SubscriptionError>> + Send;
}

pub trait EventSubscriber: Send + Sync + 'static {
    type Source: EventSource;

    fn subscribe(
        &self,
    ) -> impl Future<Output = Result<Self::Source, SubscriptionError>> + Send;
}
