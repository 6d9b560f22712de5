//! Health-function tests: threshold boundaries, short-circuit severity,
//! monotonicity under worsening inputs, and aggregation.

use crate::compaction::*;

fn metrics() -> CompactionMetrics {
    CompactionMetrics {
        timestamp: 1_000_000,
        ..Default::default()
    }
}

// ------------------------------------------------------------------------------------------------
// Threshold boundaries (defaults)
// ------------------------------------------------------------------------------------------------

#[test]
fn quiet_namespace_is_healthy() {
    assert_eq!(
        evaluate_health(&metrics(), &DashboardConfig::default()),
        Health::Healthy
    );
}

#[test]
fn any_stuck_window_is_unhealthy() {
    let m = CompactionMetrics {
        windows_stuck: 1,
        ..metrics()
    };
    assert_eq!(
        evaluate_health(&m, &DashboardConfig::default()),
        Health::Unhealthy
    );
}

#[test]
fn pending_thresholds() {
    let config = DashboardConfig::default();
    for (pending, expected) in [
        (0, Health::Healthy),
        (9, Health::Healthy),
        (10, Health::Degraded),
        (49, Health::Degraded),
        (50, Health::Unhealthy),
        (500, Health::Unhealthy),
    ] {
        let m = CompactionMetrics {
            windows_pending: pending,
            ..metrics()
        };
        assert_eq!(evaluate_health(&m, &config), expected, "pending={pending}");
    }
}

#[test]
fn age_thresholds() {
    let config = DashboardConfig::default();
    let hour = 60 * 60 * 1000i64;
    for (age, expected) in [
        (0, Health::Healthy),
        (2 * hour - 1, Health::Healthy),
        (2 * hour, Health::Degraded),
        (6 * hour - 1, Health::Degraded),
        (6 * hour, Health::Unhealthy),
    ] {
        let m = CompactionMetrics {
            oldest_window_age_ms: age,
            ..metrics()
        };
        assert_eq!(evaluate_health(&m, &config), expected, "age={age}");
    }
}

#[test]
fn unhealthy_short_circuits_degraded() {
    // Degraded-range age plus a stuck window: unhealthy wins.
    let m = CompactionMetrics {
        windows_stuck: 2,
        oldest_window_age_ms: 3 * 60 * 60 * 1000,
        windows_pending: 12,
        ..metrics()
    };
    assert_eq!(
        evaluate_health(&m, &DashboardConfig::default()),
        Health::Unhealthy
    );
}

#[test]
fn thresholds_are_overridable() {
    let strict = DashboardConfig {
        pending_degraded: 1,
        pending_unhealthy: 2,
        ..DashboardConfig::default()
    };
    let m = CompactionMetrics {
        windows_pending: 1,
        ..metrics()
    };
    assert_eq!(evaluate_health(&m, &strict), Health::Degraded);
    let m = CompactionMetrics {
        windows_pending: 2,
        ..metrics()
    };
    assert_eq!(evaluate_health(&m, &strict), Health::Unhealthy);
}

// ------------------------------------------------------------------------------------------------
// Monotonicity
// ------------------------------------------------------------------------------------------------

#[test]
fn health_is_monotonic_in_worsening_inputs() {
    let config = DashboardConfig::default();
    let mut previous = Health::Healthy;
    for pending in 0..60u64 {
        let m = CompactionMetrics {
            windows_pending: pending,
            ..metrics()
        };
        let verdict = evaluate_health(&m, &config);
        assert!(verdict >= previous, "worsened input improved health");
        previous = verdict;
    }
}

// ------------------------------------------------------------------------------------------------
// Aggregation
// ------------------------------------------------------------------------------------------------

#[test]
fn aggregate_takes_the_worst() {
    assert_eq!(
        aggregate_health([Health::Healthy, Health::Degraded, Health::Healthy]),
        Health::Degraded
    );
    assert_eq!(
        aggregate_health([Health::Degraded, Health::Unhealthy]),
        Health::Unhealthy
    );
    assert_eq!(
        aggregate_health([Health::Healthy, Health::Healthy]),
        Health::Healthy
    );
}

#[test]
fn aggregate_of_nothing_is_healthy() {
    assert_eq!(
        aggregate_health(std::iter::empty::<Health>()),
        Health::Healthy
    );
}
