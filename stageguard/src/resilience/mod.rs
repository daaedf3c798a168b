//! Failure isolation: classification, circuit breaking, backoff and the
//! fault-tolerant executor that combines them.

mod backoff;
mod breaker;
mod classifier;
mod executor;
#[cfg(test)]
mod executor_tests;

pub use backoff::{BackoffPolicy, JitterStrategy};
pub use breaker::{
    Admission, BreakerConfig, BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker,
    TrialGuard,
};
pub use classifier::{
    Classification, ClassificationRule, FailureClass, FailureClassifier, FailureKind,
};
pub use executor::{StageExecutor, StageRequest, StageSuccess, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT};
