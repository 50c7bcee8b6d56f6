//! Property tests for the resilience invariants.
//!
//! Random operation sequences against breakers, reliability tracking,
//! routing and backoff; the properties must hold after every step.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use proptest::prelude::*;
use switchboard_events::AgentSpec;
use switchboard_mesh::recovery::BackoffSchedule;
use switchboard_mesh::{
    AgentRegistry, BreakerConfig, CircuitBreaker, CircuitState, MeshConfig, MeshState,
    RegistryConfig,
};
use tokio::time::Instant;

const RECOVERY_TIMEOUT: Duration = Duration::from_millis(1_000);

proptest! {
    #[test]
    fn property_open_breaker_never_admits_before_recovery_timeout(
        ops in prop::collection::vec((any::<bool>(), 0u64..800), 1..200),
    ) {
        let mut breaker = CircuitBreaker::new(BreakerConfig::new(3, RECOVERY_TIMEOUT));
        let mut now = Instant::now();

        for (success, advance_ms) in ops {
            now += Duration::from_millis(advance_ms);

            if breaker.state_at(now) == CircuitState::Open {
                prop_assert!(!breaker.allows(now));
                let failed_at = breaker.last_failure().unwrap();
                prop_assert!(now.duration_since(failed_at) < RECOVERY_TIMEOUT);
            }

            let (admitted, _) = breaker.try_acquire(now);
            if admitted {
                if success {
                    breaker.record_success(now);
                } else {
                    breaker.record_failure(now);
                }
            } else {
                prop_assert_ne!(breaker.state_at(now), CircuitState::Closed);
            }
        }
    }

    #[test]
    fn property_half_open_failure_reopens(
        successes in 0u32..2,
    ) {
        let mut breaker = CircuitBreaker::new(BreakerConfig::new(1, RECOVERY_TIMEOUT));
        let start = Instant::now();
        breaker.record_failure(start);
        let later = start + RECOVERY_TIMEOUT;
        prop_assert_eq!(breaker.state_at(later), CircuitState::HalfOpen);

        for _ in 0..successes {
            breaker.try_acquire(later);
            breaker.record_success(later);
        }
        breaker.try_acquire(later);
        breaker.record_failure(later);

        prop_assert_eq!(breaker.state_at(later), CircuitState::Open);
        prop_assert_eq!(breaker.half_open_successes(), 0);
    }

    #[test]
    fn property_reliability_stays_in_unit_interval(
        seed in 0.0f64..=1.0,
        outcomes in prop::collection::vec((any::<bool>(), 0u64..30_000), 0..300),
    ) {
        let mut registry = AgentRegistry::new(RegistryConfig::default());
        registry
            .register(AgentSpec::new("a", "A").with_reliability(seed), Instant::now())
            .unwrap();

        for (success, response_ms) in outcomes {
            let reliability = registry.record_outcome("a", success, response_ms).unwrap();
            prop_assert!((0.0..=1.0).contains(&reliability));
        }
        let metrics = &registry.get("a").unwrap().metrics;
        prop_assert_eq!(metrics.successes + metrics.failures, metrics.total_communications);
    }

    #[test]
    fn property_route_never_targets_rejecting_breaker(
        failures in prop::collection::vec(0u32..8, 1..6),
        elapsed_ms in 0u64..120_000,
    ) {
        let config = MeshConfig::default();
        let mut state = MeshState::new(&config);
        let start = Instant::now();

        for (i, count) in failures.iter().enumerate() {
            let id = format!("agent-{i}");
            state.register(AgentSpec::new(id.as_str(), id.as_str()).with_capability("x"), start).unwrap();
            for _ in 0..*count {
                state.breakers.record_failure(&id, start);
            }
        }

        let now = start + Duration::from_millis(elapsed_ms);
        match state.find_route("x", &[], now) {
            Some(agent_id) => {
                prop_assert!(state.breakers.allows(agent_id.as_str(), now));
            }
            None => {
                for i in 0..failures.len() {
                    let id = format!("agent-{i}");
                    let admits = state.breakers.allows(&id, now);
                    prop_assert!(!admits, "{} admits but no route was found", id);
                }
            }
        }
    }

    #[test]
    fn property_backoff_delay_comes_from_schedule(
        delays in prop::collection::vec(1u64..60_000, 1..6),
        retry in 1u32..20,
        jitter in 0.0f64..=1.0,
    ) {
        let plain = BackoffSchedule::new(delays.clone());
        let expected = delays
            .get(retry as usize - 1)
            .or_else(|| delays.last())
            .copied()
            .unwrap();
        prop_assert_eq!(plain.delay_for(retry), Duration::from_millis(expected));

        let jittered = BackoffSchedule::new(delays).with_jitter(jitter);
        let delay = jittered.delay_for(retry).as_millis() as f64;
        prop_assert!(delay >= expected as f64);
        prop_assert!(delay <= (expected as f64).mul_add(jitter, expected as f64));
    }
}
