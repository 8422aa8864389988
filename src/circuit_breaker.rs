use failsafe::backoff::{self, Exponential};
use failsafe::failure_policy::{self, ConsecutiveFailures};
use failsafe::futures::CircuitBreaker;
use failsafe::{Config, StateMachine};
use std::future::Future;
use std::time::Duration;

use crate::errors::AppError;

/// Circuit breaker shared by every dialer call of one client.
pub type DialerBreaker = StateMachine<ConsecutiveFailures<Exponential>, ()>;

/// Consecutive dialer failures before the circuit opens.
pub const DIALER_FAILURE_THRESHOLD: u32 = 3;

/// Creates the breaker guarding the dialer platform.
///
/// # Configuration
///
/// - **Failure threshold**: 3 consecutive failures trigger OPEN state.
/// - **Backoff**: Exponential backoff from 10s to 60s before a trial call.
///
/// While OPEN, calls are rejected without touching the network, so a dead
/// dialer turns the rest of a contact sync into fast per-contact failures.
pub fn create_dialer_circuit_breaker() -> DialerBreaker {
    let backoff_strategy = backoff::exponential(Duration::from_secs(10), Duration::from_secs(60));
    let failure_policy =
        failure_policy::consecutive_failures(DIALER_FAILURE_THRESHOLD, backoff_strategy);

    Config::new().failure_policy(failure_policy).build()
}

/// Runs `call` through the breaker, mapping a rejection to an external error.
pub async fn guarded<T, F>(breaker: &DialerBreaker, call: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    match breaker.call(call).await {
        Ok(value) => Ok(value),
        Err(failsafe::Error::Inner(e)) => Err(e),
        Err(failsafe::Error::Rejected) => {
            tracing::warn!("Dialer circuit open, call rejected");
            Err(AppError::ExternalApiError(
                "Dialer temporarily unavailable (circuit open)".to_string(),
            ))
        }
    }
}
