//! Debug assertion macros for dispatcher/endpoint invariants.
//!
//! Only active in debug builds (`#[cfg(debug_assertions)]`), so there is
//! zero overhead in release builds.

// =============================================================================
// INV-CH-01: Explicit Producer Registration
// =============================================================================

/// Assert that registration was explicit (not via `Clone`).
///
/// **Invariant**: `ProducerEndpointFactory::register() -> Result<ProducerEndpoint>`
///
/// Enforced by API design — `ProducerEndpoint` is not `Clone`. This macro
/// documents the invariant at the call site after a successful register.
macro_rules! debug_assert_explicit_registration {
    ($registered:expr) => {
        debug_assert!($registered, "INV-CH-01 violated: registration should return a unique endpoint")
    };
}

// =============================================================================
// INV-PROD-01: Single Endpoint Per Registered Producer (Compile-Time Enforced)
// =============================================================================

// **Invariant**: every `ProducerEndpoint` is backed by exactly one producer
// registration.
//
// Enforced at compile time via lack of `Clone` on `ProducerEndpoint`. No
// runtime macro needed — cloning one is a compile error.

// =============================================================================
// INV-SHUT-01: Shutdown Observed Before Drain
// =============================================================================

/// Assert that the dispatcher's select loop only breaks out once
/// `ShutdownState::is_shutdown_initiated` is actually set, never on a
/// spurious `Notify` wakeup meant for a blocked sender instead.
///
/// **Invariant**: `select loop breaks -> state.is_shutdown_initiated()`
macro_rules! debug_assert_shutdown_observed {
    ($broke_out:expr, $state_set:expr) => {
        debug_assert!(!$broke_out || $state_set, "INV-SHUT-01 violated: loop exited without the shutdown flag set")
    };
}

pub(crate) use debug_assert_explicit_registration;
pub(crate) use debug_assert_shutdown_observed;
// single-producer-per-endpoint is not exported - compile-time enforced via !Clone
