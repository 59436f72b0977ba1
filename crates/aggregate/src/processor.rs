//! The aggregate processor: batch-level entry point over the engine.
//!
//! A processor computes each event's group key, filters events through the
//! optional `aggregate_when` condition, hands them to the engine and collects
//! everything that should be emitted downstream. Events produced by group
//! conclusion are tagged with `aggregated_events_tag` when configured.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tally_core::{Event, ExpressionEvaluator, GroupKey, TokenBucket};
use tracing::{info, warn};

use crate::config::{AggregateProcessorConfig, ShutdownPolicy};
use crate::engine::{AggregateEngine, EventOutcome};
use crate::error::AggregateError;
use crate::factory::ActionFactory;
use crate::identification::IdentificationKeysHasher;
use crate::metrics::{AggregateMetrics, MetricsSnapshot};

pub struct AggregateProcessor {
    config: AggregateProcessorConfig,
    engine: AggregateEngine,
    hasher: IdentificationKeysHasher,
    evaluator: Option<Arc<dyn ExpressionEvaluator>>,
    metrics: Arc<AggregateMetrics>,
    shutting_down: AtomicBool,
    log_limiter: Mutex<TokenBucket>,
    suppressed_warnings: AtomicU64,
}

impl std::fmt::Debug for AggregateProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateProcessor")
            .field("config", &self.config)
            .field("engine", &self.engine)
            .field("shutting_down", &self.shutting_down)
            .finish_non_exhaustive()
    }
}

impl AggregateProcessor {
    /// Build a processor from validated configuration.
    ///
    /// The evaluator is required when the config uses `aggregate_when` or a
    /// tail sampler condition.
    pub fn new(
        config: AggregateProcessorConfig,
        evaluator: Option<Arc<dyn ExpressionEvaluator>>,
    ) -> Result<Self, AggregateError> {
        config.validate().map_err(AggregateError::Configuration)?;
        if let Some(condition) = &config.aggregate_when {
            let evaluator = evaluator.as_ref().ok_or_else(|| {
                AggregateError::Configuration(
                    "aggregate_when requires an expression evaluator".into(),
                )
            })?;
            evaluator.validate(condition)?;
        }

        let factory = ActionFactory::new(config.action.clone(), evaluator.clone())?;
        let metrics = Arc::new(AggregateMetrics::default());
        let engine = AggregateEngine::new(factory, config.group_duration())
            .with_idle_timeout(config.idle_timeout())
            .with_metrics(Arc::clone(&metrics));
        let log_limiter = TokenBucket::new(config.diagnostic_logs_per_second, Instant::now())?;

        info!(
            action = config.action.name(),
            identification_keys = ?config.identification_keys,
            group_duration_ms = config.group_duration_ms,
            "aggregate processor created"
        );

        Ok(Self {
            hasher: IdentificationKeysHasher::new(config.identification_keys.clone()),
            config,
            engine,
            evaluator,
            metrics,
            shutting_down: AtomicBool::new(false),
            log_limiter: Mutex::new(log_limiter),
            suppressed_warnings: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &AggregateProcessorConfig {
        &self.config
    }

    pub fn engine(&self) -> &AggregateEngine {
        &self.engine
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The group an event would be routed to.
    pub fn group_key_for(&self, event: &Event) -> GroupKey {
        self.hasher.group_key(event)
    }

    /// Process one batch and return the events to emit downstream.
    ///
    /// The result holds forwarded events in input order, then the output of
    /// every group that fell due during the batch.
    pub fn execute(&self, records: Vec<Event>) -> Vec<Event> {
        self.metrics.add_records_in(records.len() as u64);
        let mut out = Vec::with_capacity(records.len());

        for event in records {
            if !self.should_aggregate(&event) {
                self.metrics.increment_events_skipped();
                if self.config.output_unaggregated_events {
                    out.push(event);
                }
                continue;
            }

            let key = self.hasher.group_key(&event);
            let original = self.config.output_unaggregated_events.then(|| event.clone());
            match self.engine.process_event(&key, event) {
                Ok(EventOutcome::Forwarded(forwarded)) => out.push(forwarded),
                Ok(EventOutcome::Absorbed | EventOutcome::Dropped) => out.extend(original),
                Err(e) => {
                    self.warn_throttled(&key, &e);
                    out.extend(original);
                }
            }
        }

        out.extend(self.conclude_due());
        self.metrics.add_records_out(out.len() as u64);
        out
    }

    /// Conclude every group that is due. Once shutdown has been prepared
    /// under the flush policy, every remaining group is force-concluded
    /// instead.
    pub fn conclude_due(&self) -> Vec<Event> {
        let flushing = self.shutting_down.load(Ordering::Acquire)
            && self.config.shutdown_policy == ShutdownPolicy::Flush;
        let mut events = if flushing {
            self.engine.conclude_all(true)
        } else {
            self.engine.conclude_due_groups(Instant::now())
        };
        self.tag_aggregated(&mut events);
        events
    }

    /// Conclude one group immediately.
    pub fn conclude_group(&self, key: &GroupKey) -> Result<Vec<Event>, AggregateError> {
        let mut events = self.engine.conclude_group(key)?;
        self.tag_aggregated(&mut events);
        Ok(events)
    }

    /// Stop waiting for group deadlines: the next conclusion pass flushes
    /// everything.
    pub fn prepare_for_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        info!(
            groups = self.engine.group_count(),
            "aggregate processor preparing for shutdown"
        );
    }

    pub fn is_ready_for_shutdown(&self) -> bool {
        self.engine.group_count() == 0
    }

    /// Apply the shutdown policy to every remaining group and return the
    /// events a flush produced.
    pub fn shutdown(&self) -> Vec<Event> {
        self.shutting_down.store(true, Ordering::Release);
        let events = match self.config.shutdown_policy {
            ShutdownPolicy::Flush => {
                let mut events = self.engine.conclude_all(true);
                self.tag_aggregated(&mut events);
                events
            }
            ShutdownPolicy::Discard if !self.config.action.buffers_events() => {
                // Nothing buffered to lose: release the groups normally.
                self.engine.conclude_all(true)
            }
            ShutdownPolicy::Discard => {
                let discarded = self.engine.discard_all();
                if discarded > 0 {
                    warn!(discarded, "discarded in-flight groups on shutdown");
                }
                Vec::new()
            }
        };
        let suppressed = self.suppressed_warnings.load(Ordering::Relaxed);
        info!(
            policy = %self.config.shutdown_policy,
            emitted = events.len(),
            suppressed_warnings = suppressed,
            "aggregate processor stopped"
        );
        events
    }

    fn should_aggregate(&self, event: &Event) -> bool {
        let (Some(condition), Some(evaluator)) = (&self.config.aggregate_when, &self.evaluator)
        else {
            return true;
        };
        match evaluator.evaluate_conditional(condition, event) {
            Ok(matched) => matched,
            Err(e) => {
                let mut limiter = self.log_limiter.lock();
                if limiter.is_allowed(Instant::now()) {
                    warn!(error = %e, "aggregate_when evaluation failed, skipping event");
                } else {
                    self.suppressed_warnings.fetch_add(1, Ordering::Relaxed);
                }
                false
            }
        }
    }

    fn warn_throttled(&self, key: &GroupKey, error: &AggregateError) {
        let mut limiter = self.log_limiter.lock();
        if limiter.is_allowed(Instant::now()) {
            let suppressed = self.suppressed_warnings.swap(0, Ordering::Relaxed);
            warn!(group = %key, error = %error, suppressed, "failed to handle event");
        } else {
            self.suppressed_warnings.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn tag_aggregated(&self, events: &mut [Event]) {
        if let Some(tag) = &self.config.aggregated_events_tag {
            for event in events {
                event.add_tag(tag.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tally_core::ComparisonEvaluator;

    use super::*;
    use crate::actions::{CountConfig, PercentSamplerConfig};
    use crate::config::{ActionConfig, OutputFormat};

    fn event(value: serde_json::Value) -> Event {
        Event::from_value("log", value).unwrap()
    }

    fn evaluator() -> Option<Arc<dyn ExpressionEvaluator>> {
        Some(Arc::new(ComparisonEvaluator::new()))
    }

    fn count_config() -> AggregateProcessorConfig {
        AggregateProcessorConfig::new(
            vec!["service".into()],
            ActionConfig::Count(CountConfig {
                output_format: OutputFormat::Raw,
                ..CountConfig::default()
            }),
        )
    }

    #[test]
    fn groups_by_identification_keys() {
        let processor = AggregateProcessor::new(count_config(), None).unwrap();
        let batch = vec![
            event(json!({"service": "api"})),
            event(json!({"service": "db"})),
            event(json!({"service": "api"})),
        ];
        assert!(processor.execute(batch).is_empty());
        assert_eq!(processor.engine().group_count(), 2);

        let key = processor.group_key_for(&event(json!({"service": "api"})));
        let events = processor.conclude_group(&key).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get("aggr._count"), Some(&json!(2)));
        assert_eq!(events[0].get("service"), Some(&json!("api")));
    }

    #[test]
    fn aggregate_when_filters_events() {
        let mut config = count_config();
        config.aggregate_when = Some("/status >= 500".into());
        let processor = AggregateProcessor::new(config, evaluator()).unwrap();
        let out = processor.execute(vec![
            event(json!({"service": "api", "status": 200})),
            event(json!({"service": "api", "status": 503})),
        ]);
        assert!(out.is_empty());
        let snapshot = processor.metrics();
        assert_eq!(snapshot.events_skipped, 1);
        assert_eq!(snapshot.handle_events_absorbed, 1);
    }

    #[test]
    fn aggregate_when_requires_evaluator() {
        let mut config = count_config();
        config.aggregate_when = Some("/status >= 500".into());
        let err = AggregateProcessor::new(config, None).unwrap_err();
        assert!(matches!(err, AggregateError::Configuration(_)));
    }

    #[test]
    fn unaggregated_events_pass_through() {
        let mut config = count_config();
        config.output_unaggregated_events = true;
        config.aggregate_when = Some("/status >= 500".into());
        let processor = AggregateProcessor::new(config, evaluator()).unwrap();
        let out = processor.execute(vec![
            event(json!({"service": "api", "status": 200})),
            event(json!({"service": "api", "status": 500})),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get("status"), Some(&json!(200)));
        assert_eq!(out[1].get("status"), Some(&json!(500)));
    }

    #[test]
    fn sampler_output_is_not_duplicated_when_forwarding() {
        let mut config = AggregateProcessorConfig::new(
            vec!["service".into()],
            ActionConfig::PercentSampler(PercentSamplerConfig { percent: 50.0 }),
        );
        config.output_unaggregated_events = true;
        let processor = AggregateProcessor::new(config, None).unwrap();
        let batch = (0..10).map(|i| event(json!({"service": "api", "i": i}))).collect();
        assert_eq!(processor.execute(batch).len(), 10);
    }

    #[test]
    fn shutdown_flush_tags_concluded_events() {
        let mut config = count_config();
        config.aggregated_events_tag = Some("aggregated".into());
        let processor = AggregateProcessor::new(config, None).unwrap();
        processor.execute(vec![event(json!({"service": "api"}))]);
        assert!(!processor.is_ready_for_shutdown());

        let events = processor.shutdown();
        assert_eq!(events.len(), 1);
        assert!(events[0].has_tag("aggregated"));
        assert!(processor.is_ready_for_shutdown());
    }

    #[test]
    fn shutdown_discard_emits_nothing() {
        let mut config = count_config();
        config.shutdown_policy = ShutdownPolicy::Discard;
        let processor = AggregateProcessor::new(config, None).unwrap();
        processor.execute(vec![event(json!({"service": "api"}))]);
        assert!(processor.shutdown().is_empty());
        assert!(processor.is_ready_for_shutdown());
        assert_eq!(processor.metrics().groups_discarded, 1);
    }

    #[test]
    fn discard_only_applies_to_buffering_actions() {
        let mut config =
            AggregateProcessorConfig::new(vec!["service".into()], ActionConfig::RemoveDuplicates);
        config.shutdown_policy = ShutdownPolicy::Discard;
        let processor = AggregateProcessor::new(config, None).unwrap();
        assert_eq!(processor.execute(vec![event(json!({"service": "api"}))]).len(), 1);

        assert!(processor.shutdown().is_empty());
        assert!(processor.is_ready_for_shutdown());
        let metrics = processor.metrics();
        assert_eq!(metrics.groups_discarded, 0);
        assert_eq!(metrics.groups_concluded, 1);
    }

    #[test]
    fn prepared_shutdown_flushes_on_next_pass() {
        let processor = AggregateProcessor::new(count_config(), None).unwrap();
        processor.execute(vec![event(json!({"service": "api"}))]);
        assert!(processor.conclude_due().is_empty());
        processor.prepare_for_shutdown();
        assert_eq!(processor.conclude_due().len(), 1);
        assert!(processor.is_ready_for_shutdown());
    }

    #[test]
    fn handle_failures_are_counted_not_fatal() {
        let config = AggregateProcessorConfig::new(
            vec!["service".into()],
            ActionConfig::Histogram(crate::actions::HistogramConfig::new("latency", vec![10.0])),
        );
        let processor = AggregateProcessor::new(config, None).unwrap();
        let out = processor.execute(vec![
            event(json!({"service": "api", "latency": "slow"})),
            event(json!({"service": "api", "latency": 4})),
        ]);
        assert!(out.is_empty());
        let snapshot = processor.metrics();
        assert_eq!(snapshot.handle_events_failed, 1);
        assert_eq!(snapshot.handle_events_absorbed, 1);
        assert_eq!(snapshot.records_in, 2);
    }
}
