use std::sync::Arc;

use crate::error::PipelineError;
use crate::export::health::HealthMetrics;

/// Sink for every error the pipeline encounters.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, err: &PipelineError);
}

/// Reports errors as structured tracing events and counts them by kind.
#[derive(Default)]
pub struct TracingReporter {
    health: Option<Arc<HealthMetrics>>,
}

impl TracingReporter {
    pub fn new(health: Option<Arc<HealthMetrics>>) -> Self {
        Self { health }
    }
}

impl ErrorReporter for TracingReporter {
    fn report(&self, err: &PipelineError) {
        let kind = err.kind();

        if let Some(health) = &self.health {
            health.errors.with_label_values(&[kind.as_str()]).inc();
        }

        if kind.is_fatal() {
            tracing::error!(kind = kind.as_str(), error = %err, "pipeline error");
        } else {
            tracing::warn!(kind = kind.as_str(), error = %err, "pipeline error");
        }
    }
}
