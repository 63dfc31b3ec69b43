//! Prometheus metrics for the HTTP surface.

use std::sync::Arc;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::error::{Error, Result};
use crate::inference::bridge::{Completion, FinishReason};

/// Counters and timings for prompts and embeddings served.
pub struct BridgeMetrics {
    registry: Registry,
    prompts: IntCounterVec,
    tokens: IntCounter,
    in_flight: IntGauge,
    latency: Histogram,
    embeddings: IntCounter,
}

impl BridgeMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let prompts = IntCounterVec::new(
            Opts::new("llmodel_prompts_total", "Prompts finished, by outcome"),
            &["outcome"],
        )
        .map_err(metrics_error)?;
        let tokens = IntCounter::new("llmodel_tokens_total", "Token fragments delivered to clients")
            .map_err(metrics_error)?;
        let in_flight = IntGauge::new("llmodel_prompts_in_flight", "Prompts running or queued")
            .map_err(metrics_error)?;
        let latency = Histogram::with_opts(
            HistogramOpts::new("llmodel_prompt_seconds", "Prompt wall time including queueing")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )
        .map_err(metrics_error)?;
        let embeddings = IntCounter::new("llmodel_embeddings_total", "Embeddings computed")
            .map_err(metrics_error)?;

        registry.register(Box::new(prompts.clone())).map_err(metrics_error)?;
        registry.register(Box::new(tokens.clone())).map_err(metrics_error)?;
        registry.register(Box::new(in_flight.clone())).map_err(metrics_error)?;
        registry.register(Box::new(latency.clone())).map_err(metrics_error)?;
        registry.register(Box::new(embeddings.clone())).map_err(metrics_error)?;

        Ok(Self {
            registry,
            prompts,
            tokens,
            in_flight,
            latency,
            embeddings,
        })
    }

    /// Track one prompt from submission; the returned guard keeps the
    /// in-flight gauge raised until dropped.
    pub fn prompt_started(self: &Arc<Self>) -> PromptTimer {
        self.in_flight.inc();
        PromptTimer {
            metrics: self.clone(),
            timer: Some(self.latency.start_timer()),
        }
    }

    /// Count a prompt that was rejected before it was queued.
    pub fn prompt_rejected(&self) {
        self.prompts.with_label_values(&["rejected"]).inc();
    }

    pub fn tokens_streamed(&self, count: usize) {
        self.tokens.inc_by(count as u64);
    }

    pub fn embedding_computed(&self) {
        self.embeddings.inc();
    }

    pub fn prompts_with_outcome(&self, outcome: &str) -> u64 {
        self.prompts.with_label_values(&[outcome]).get()
    }

    /// Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics are not UTF-8: {e}")))
    }
}

/// In-flight guard returned by [`BridgeMetrics::prompt_started`].
pub struct PromptTimer {
    metrics: Arc<BridgeMetrics>,
    timer: Option<prometheus::HistogramTimer>,
}

impl PromptTimer {
    /// Record the outcome and latency.
    pub fn finish(mut self, outcome: &Result<Completion>) {
        self.metrics
            .prompts
            .with_label_values(&[outcome_label(outcome)])
            .inc();
        if let Some(timer) = self.timer.take() {
            timer.observe_duration();
        }
    }
}

impl Drop for PromptTimer {
    fn drop(&mut self) {
        self.metrics.in_flight.dec();
        // Unfinished timers are discarded, not observed.
        if let Some(timer) = self.timer.take() {
            timer.stop_and_discard();
        }
    }
}

pub fn outcome_label(outcome: &Result<Completion>) -> &'static str {
    match outcome {
        Ok(c) if c.finish_reason == FinishReason::Cancelled => "cancelled",
        Ok(_) => "completed",
        Err(Error::Cancelled) => "cancelled",
        Err(_) => "failed",
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(finish_reason: FinishReason) -> Completion {
        Completion {
            text: "hi".into(),
            completion_tokens: 1,
            finish_reason,
        }
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(outcome_label(&Ok(completion(FinishReason::Stop))), "completed");
        assert_eq!(outcome_label(&Ok(completion(FinishReason::Cancelled))), "cancelled");
        assert_eq!(outcome_label(&Err(Error::Cancelled)), "cancelled");
        assert_eq!(outcome_label(&Err(Error::NotLoaded)), "failed");
    }

    #[test]
    fn test_timer_tracks_in_flight() {
        let metrics = Arc::new(BridgeMetrics::new().unwrap());
        let timer = metrics.prompt_started();
        assert_eq!(metrics.in_flight.get(), 1);
        timer.finish(&Ok(completion(FinishReason::Stop)));
        assert_eq!(metrics.in_flight.get(), 0);
        assert_eq!(metrics.prompts_with_outcome("completed"), 1);
        assert_eq!(metrics.latency.get_sample_count(), 1);
    }

    #[test]
    fn test_render_contains_metric_names() {
        let metrics = BridgeMetrics::new().unwrap();
        metrics.prompt_rejected();
        metrics.tokens_streamed(3);
        let text = metrics.render().unwrap();
        assert!(text.contains("llmodel_prompts_total{outcome=\"rejected\"} 1"));
        assert!(text.contains("llmodel_tokens_total 3"));
    }
}
