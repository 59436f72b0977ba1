pub mod action;
pub mod actions;
pub mod background;
pub mod config;
pub mod engine;
pub mod error;
pub mod factory;
pub mod group;
pub mod group_manager;
pub mod identification;
pub mod metric;
pub mod metrics;
pub mod processor;

pub use action::{
    AggregateAction, AggregateActionInput, AggregateActionOutput, AggregateActionResponse,
};
pub use background::ConclusionScheduler;
pub use config::{ActionConfig, AggregateProcessorConfig, OutputFormat, ShutdownPolicy};
pub use engine::{AggregateEngine, EventOutcome};
pub use error::AggregateError;
pub use factory::ActionFactory;
pub use group::AggregateGroup;
pub use group_manager::{GroupManager, SharedGroup};
pub use identification::IdentificationKeysHasher;
pub use metrics::{AggregateMetrics, MetricsSnapshot};
pub use processor::AggregateProcessor;
