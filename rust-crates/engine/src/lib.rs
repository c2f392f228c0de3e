pub mod action;
pub mod capability;
pub mod clock;
pub mod config;
pub mod countdown;
pub mod engine;
pub mod notifications;
pub mod remote;
pub mod scheduler;
pub mod snapshot;
pub mod snapshot_builder;
pub mod state;

pub mod test_helpers;

pub use action::{
    ActionCoordinator,
    ActionError,
    ActionKind,
    ActionOrigin,
    ActionStatus,
    PendingAction,
    TxOutcome,
    UserAction,
};
pub use capability::{
    CapabilityFlags,
    JoinLabel,
};
pub use config::EngineConfig;
pub use engine::Engine;
pub use snapshot::{
    Account,
    RoundSnapshot,
    Variant,
    Wei,
};
pub use state::{
    EngineEvent,
    EngineView,
};

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error("failed to subscribe to contract events: {0}")]
    Subscription(#[from] notifications::SubscriptionError),
}
