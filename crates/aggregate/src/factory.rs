//! Build one action instance per group from validated configuration.

use std::sync::Arc;

use tally_core::ExpressionEvaluator;

use crate::action::AggregateAction;
use crate::actions::{
    AppendAction, CountAction, HistogramAction, PercentSamplerAction, PutAllAction,
    RateLimiterAction, RemoveDuplicatesAction, TailSamplerAction,
};
use crate::config::ActionConfig;
use crate::error::AggregateError;

/// Creates fresh action instances for new groups.
///
/// Construction validates the configuration once, so a factory that exists
/// only ever produces valid actions.
#[derive(Clone)]
pub struct ActionFactory {
    config: ActionConfig,
    evaluator: Option<Arc<dyn ExpressionEvaluator>>,
}

impl std::fmt::Debug for ActionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionFactory")
            .field("config", &self.config)
            .field("evaluator", &self.evaluator.is_some())
            .finish()
    }
}

impl ActionFactory {
    pub fn new(
        config: ActionConfig,
        evaluator: Option<Arc<dyn ExpressionEvaluator>>,
    ) -> Result<Self, AggregateError> {
        config.validate().map_err(AggregateError::Configuration)?;
        if let ActionConfig::TailSampler(tail) = &config
            && let Some(condition) = &tail.condition
        {
            let evaluator = evaluator.as_ref().ok_or_else(|| {
                AggregateError::Configuration(
                    "tail_sampler condition requires an expression evaluator".into(),
                )
            })?;
            evaluator.validate(condition)?;
        }
        Ok(Self { config, evaluator })
    }

    pub fn config(&self) -> &ActionConfig {
        &self.config
    }

    pub fn action_name(&self) -> &'static str {
        self.config.name()
    }

    /// A fresh action for a new group.
    pub fn create(&self) -> Result<Box<dyn AggregateAction>, AggregateError> {
        Ok(match &self.config {
            ActionConfig::Append(config) => Box::new(AppendAction::new(config.clone())),
            ActionConfig::PutAll => Box::new(PutAllAction::new()),
            ActionConfig::RemoveDuplicates => Box::new(RemoveDuplicatesAction::new()),
            ActionConfig::Count(config) => Box::new(CountAction::new(config.clone())),
            ActionConfig::Histogram(config) => Box::new(HistogramAction::new(config.clone())),
            ActionConfig::PercentSampler(config) => Box::new(PercentSamplerAction::new(config)),
            ActionConfig::RateLimiter(config) => Box::new(RateLimiterAction::new(config)?),
            ActionConfig::TailSampler(config) => {
                Box::new(TailSamplerAction::new(config, self.evaluator.clone())?)
            }
        })
    }
}
