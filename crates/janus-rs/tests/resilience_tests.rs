//! Resilience behaviors: breaker trip timing, rate-limit windows, and
//! health-aware balancing, exercised the way the gateway drives them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use janus_rs::gateway::rate_limit::RateLimitStore;
use janus_rs::models::settings::UpstreamSettings;
use janus_rs::services::circuit_breaker::{
    BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState,
};
use janus_rs::services::load_balancer::{LoadBalancer, RoundRobinBalancer};
use janus_rs::services::upstream::{Upstream, UpstreamPool};

fn upstreams(names: &[&str]) -> UpstreamPool {
    let settings: Vec<UpstreamSettings> = names
        .iter()
        .map(|name| UpstreamSettings {
            host: name.to_string(),
            port: 8080,
            weight: 1,
            max_connections: 8,
        })
        .collect();
    UpstreamPool::new(&settings)
}

#[tokio::test]
async fn breaker_trips_after_threshold_and_fails_fast() {
    let breaker = CircuitBreaker::new(
        "u1:8080".to_string(),
        CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(200),
        },
    );

    for _ in 0..3 {
        let _ = breaker.call(async { Err::<(), _>("connect refused") }).await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // Open circuit: rejection happens without running the operation, fast.
    for _ in 0..2 {
        let started = Instant::now();
        let result = breaker
            .call(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, &str>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen)));
        assert!(started.elapsed() < Duration::from_millis(10));
    }

    // After the reset timeout a single half-open probe is admitted; on
    // success traffic resumes.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let result = breaker.call(async { Ok::<_, &str>("up again") }).await;
    assert!(result.is_ok());
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert!(breaker.call(async { Ok::<_, &str>(()) }).await.is_ok());
}

#[tokio::test]
async fn only_one_probe_runs_in_half_open() {
    let breaker = CircuitBreaker::new(
        "probe".to_string(),
        CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_millis(50),
        },
    );
    let _ = breaker.call(async { Err::<(), _>("down") }).await;
    tokio::time::sleep(Duration::from_millis(80)).await;

    let breaker2 = Arc::clone(&breaker);
    let slow_probe = tokio::spawn(async move {
        breaker2
            .call(async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, &str>(())
            })
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // While the probe is out, everyone else is rejected.
    let result = breaker.call(async { Ok::<_, &str>(()) }).await;
    assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen)));

    assert!(slow_probe.await.unwrap().is_ok());
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[test]
fn registry_isolates_targets() {
    let registry = BreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold: 1,
        reset_timeout: Duration::from_secs(30),
    });
    registry.get("u1:8080").on_failure();
    assert_eq!(registry.get("u1:8080").state(), CircuitState::Open);
    assert_eq!(registry.get("u2:8080").state(), CircuitState::Closed);
}

#[test]
fn fixed_window_counts_match_the_contract() {
    // requests=3, window=1s: five hits inside one window go 3 allowed,
    // 2 rejected with remaining 0.
    let store = RateLimitStore::new(3, 1_000);
    let t0 = 10_000;
    let verdicts: Vec<bool> = (0..5)
        .map(|i| store.check_at("ip:10.0.0.1", t0 + i * 10).allowed)
        .collect();
    assert_eq!(verdicts, vec![true, true, true, false, false]);

    let rejected = store.check_at("ip:10.0.0.1", t0 + 60);
    assert_eq!(rejected.remaining, 0);

    // The next window starts clean.
    assert!(store.check_at("ip:10.0.0.1", t0 + 1_000).allowed);
}

#[test]
fn round_robin_skips_unhealthy_upstreams() {
    let pool = upstreams(&["u1", "u2"]);
    let balancer = RoundRobinBalancer::default();

    let picks: Vec<String> = (0..3)
        .map(|_| balancer.select(&pool.healthy(), None).unwrap().key())
        .collect();
    assert_eq!(picks, vec!["u1:8080", "u2:8080", "u1:8080"]);

    // Three failed probes mark u2 unhealthy; traffic all lands on u1.
    let u2: &Arc<Upstream> = &pool.all()[1];
    for _ in 0..3 {
        u2.record_probe(false, 3, 2);
    }
    let picks: Vec<String> = (0..3)
        .map(|_| balancer.select(&pool.healthy(), None).unwrap().key())
        .collect();
    assert!(picks.iter().all(|k| k == "u1:8080"));

    // Recovery restores rotation.
    u2.record_probe(true, 3, 2);
    u2.record_probe(true, 3, 2);
    assert_eq!(pool.healthy().len(), 2);
}

#[test]
fn no_healthy_upstream_leaves_nothing_to_select() {
    let pool = upstreams(&["u1"]);
    pool.all()[0].set_healthy(false);
    assert!(RoundRobinBalancer::default()
        .select(&pool.healthy(), None)
        .is_none());
}
