pub mod backoff;
pub mod memory;
pub mod strategy;

use std::future::Future;

use tracing::{info, warn};

use crate::domain::context::RecoveryContext;
use crate::errors::Fault;

pub use backoff::{BackoffStrategy, JitterType, RetryConfig};
pub use memory::{FixedMemoryProbe, MeminfoProbe, MemoryProbe};
pub use strategy::{
    error_pattern_key, AdaptiveRetryStrategy, ApiRetryStrategy, DatabaseRetryStrategy,
    DefaultRetryStrategy, MemoryAwareRetryStrategy, PatternStats, RetryPolicies, RetryStrategy,
};

/// Runs `operation` until it succeeds or `strategy` refuses another attempt.
///
/// Each failure replaces `context.fault`, is reported to the strategy, and
/// bumps `context.retry_count` after the computed delay.
pub async fn retry_with_strategy<T, F, Fut>(
    strategy: &dyn RetryStrategy,
    context: &mut RecoveryContext,
    mut operation: F,
) -> Result<T, Fault>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Fault>>,
{
    loop {
        match operation().await {
            Ok(value) => {
                strategy.record_outcome(context, true);
                if context.retry_count > 0 {
                    info!(
                        event_name = "recovery.retry.succeeded",
                        operation_id = %context.operation_id,
                        operation_type = %context.operation_type,
                        retry_count = context.retry_count,
                        strategy = strategy.name(),
                        "operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(fault) => {
                context.fault = fault;
                strategy.record_outcome(context, false);

                if !strategy.should_retry(context) {
                    warn!(
                        event_name = "recovery.retry.gave_up",
                        operation_id = %context.operation_id,
                        operation_type = %context.operation_type,
                        retry_count = context.retry_count,
                        strategy = strategy.name(),
                        error = %context.fault,
                        "retry not permitted"
                    );
                    return Err(context.fault.clone());
                }

                let delay = strategy.get_retry_delay(context.retry_count);
                info!(
                    event_name = "recovery.retry.scheduled",
                    operation_id = %context.operation_id,
                    operation_type = %context.operation_type,
                    retry_count = context.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    strategy = strategy.name(),
                    "retrying operation"
                );
                tokio::time::sleep(delay).await;
                context.retry_count += 1;
            }
        }
    }
}
