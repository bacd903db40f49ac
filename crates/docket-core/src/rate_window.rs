//! Fixed-window counter evaluation.
//!
//! [`evaluate`] is the whole admission decision for one window key. Backends
//! call it while holding the window row exclusively (mutex or
//! `SELECT ... FOR UPDATE`), which linearizes increments per key.

use chrono::{DateTime, Duration, Utc};

use crate::models::{RateDecision, RateLimit, RateLimitWindow, WindowKey};

/// Result of evaluating one request against a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowOutcome {
    /// Window state to persist.
    pub window: RateLimitWindow,
    pub decision: RateDecision,
    /// This request moved the window into a block.
    pub newly_blocked: bool,
}

fn ceil_secs(d: Duration) -> u64 {
    let ms = d.num_milliseconds().max(0) as u64;
    ms.div_ceil(1000).max(1)
}

/// Block length for the `violation`-th violation within the penalty period.
pub fn block_duration(limit: &RateLimit, violation: i32, window_remaining: Duration) -> Duration {
    if limit.block_secs == 0 {
        return window_remaining.max(Duration::seconds(1));
    }
    let secs = match limit.penalty {
        Some(p) => {
            let exp = (violation - 1).clamp(0, 32) as u32;
            u64::from(p.multiplier.max(1))
                .checked_pow(exp)
                .and_then(|f| limit.block_secs.checked_mul(f))
                .unwrap_or(p.max_block_secs)
                .min(p.max_block_secs.max(limit.block_secs))
        }
        None => limit.block_secs,
    };
    Duration::seconds(secs as i64)
}

/// Evaluate one request.
///
/// - Blocked windows deny without counting.
/// - A request at or after `window_start + window_secs` opens a new window
///   with count 1, so it never counts against the prior window.
/// - Exceeding `max_requests` blocks for `block_secs`, escalated by the
///   progressive penalty when violations repeat within its period.
pub fn evaluate(
    existing: Option<&RateLimitWindow>,
    key: &WindowKey,
    limit: &RateLimit,
    now: DateTime<Utc>,
) -> WindowOutcome {
    if let Some(w) = existing {
        if let Some(until) = w.blocked_until.filter(|u| *u > now) {
            return WindowOutcome {
                window: w.clone(),
                decision: RateDecision::Deny {
                    retry_after_secs: ceil_secs(until - now),
                },
                newly_blocked: false,
            };
        }
    }

    let window_len = Duration::seconds(limit.window_secs as i64);
    let mut window = match existing {
        Some(w) if now < w.window_start + window_len => {
            let mut w = w.clone();
            w.request_count += 1;
            w
        }
        Some(w) => RateLimitWindow {
            key: key.clone(),
            window_start: now,
            request_count: 1,
            blocked_until: None,
            violation_count: w.violation_count,
            last_violation_at: w.last_violation_at,
            updated_at: now,
        },
        None => RateLimitWindow {
            key: key.clone(),
            window_start: now,
            request_count: 1,
            blocked_until: None,
            violation_count: 0,
            last_violation_at: None,
            updated_at: now,
        },
    };
    window.updated_at = now;

    if window.request_count <= i64::from(limit.max_requests) {
        let remaining = i64::from(limit.max_requests) - window.request_count;
        return WindowOutcome {
            window,
            decision: RateDecision::Allow {
                remaining: remaining.max(0) as u32,
            },
            newly_blocked: false,
        };
    }

    let within_period = match (limit.penalty, window.last_violation_at) {
        (Some(p), Some(last)) => now - last < Duration::seconds(p.period_secs as i64),
        _ => false,
    };
    window.violation_count = if within_period {
        window.violation_count + 1
    } else {
        1
    };
    window.last_violation_at = Some(now);

    let remaining_in_window = (window.window_start + window_len) - now;
    let block = block_duration(limit, window.violation_count, remaining_in_window);
    window.blocked_until = Some(now + block);

    WindowOutcome {
        decision: RateDecision::Deny {
            retry_after_secs: ceil_secs(block),
        },
        window,
        newly_blocked: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProgressivePenalty;
    use proptest::prelude::*;

    fn limit(max: u32) -> RateLimit {
        RateLimit {
            max_requests: max,
            window_secs: 60,
            block_secs: 120,
            penalty: None,
        }
    }

    fn key() -> WindowKey {
        WindowKey::actor("acme", "alice", "jobs.submit", 60)
    }

    fn run(
        limit: &RateLimit,
        times: impl IntoIterator<Item = DateTime<Utc>>,
    ) -> (Option<RateLimitWindow>, Vec<WindowOutcome>) {
        let mut state: Option<RateLimitWindow> = None;
        let mut outcomes = Vec::new();
        for t in times {
            let out = evaluate(state.as_ref(), &key(), limit, t);
            state = Some(out.window.clone());
            outcomes.push(out);
        }
        (state, outcomes)
    }

    #[test]
    fn test_first_request_opens_window() {
        let now = Utc::now();
        let out = evaluate(None, &key(), &limit(3), now);
        assert_eq!(out.window.request_count, 1);
        assert_eq!(out.window.window_start, now);
        assert_eq!(out.decision, RateDecision::Allow { remaining: 2 });
    }

    #[test]
    fn test_overflow_blocks_and_denies() {
        let now = Utc::now();
        let (state, outs) = run(&limit(2), (0..4).map(|i| now + Duration::seconds(i)));
        assert!(outs[0].decision.is_allowed());
        assert!(outs[1].decision.is_allowed());
        assert!(outs[2].newly_blocked);
        assert_eq!(
            outs[2].decision,
            RateDecision::Deny {
                retry_after_secs: 120
            }
        );
        // Blocked requests do not count and are not new blocks.
        assert!(!outs[3].newly_blocked);
        assert_eq!(state.unwrap().request_count, 3);
    }

    #[test]
    fn test_request_at_boundary_starts_new_window() {
        let now = Utc::now();
        let l = limit(2);
        let (state, _) = run(&l, [now, now + Duration::seconds(30)]);
        let out = evaluate(state.as_ref(), &key(), &l, now + Duration::seconds(60));
        assert_eq!(out.window.request_count, 1);
        assert_eq!(out.window.window_start, now + Duration::seconds(60));
        assert!(out.decision.is_allowed());
    }

    #[test]
    fn test_zero_block_waits_for_window_end() {
        let now = Utc::now();
        let l = RateLimit {
            block_secs: 0,
            ..limit(1)
        };
        let (_, outs) = run(&l, [now, now + Duration::seconds(20)]);
        assert_eq!(
            outs[1].decision,
            RateDecision::Deny {
                retry_after_secs: 40
            }
        );
    }

    #[test]
    fn test_progressive_penalty_escalates_and_caps() {
        let l = RateLimit {
            max_requests: 1,
            window_secs: 10,
            block_secs: 10,
            penalty: Some(ProgressivePenalty {
                multiplier: 2,
                period_secs: 3600,
                max_block_secs: 30,
            }),
        };
        let t0 = Utc::now();
        let mut state: Option<RateLimitWindow> = None;
        let mut blocks = Vec::new();
        let mut t = t0;
        for _ in 0..4 {
            // One allowed request, one violation, then wait out the block.
            let ok = evaluate(state.as_ref(), &key(), &l, t);
            state = Some(ok.window);
            let bad = evaluate(state.as_ref(), &key(), &l, t);
            if let RateDecision::Deny { retry_after_secs } = bad.decision {
                blocks.push(retry_after_secs);
            }
            state = Some(bad.window);
            t += Duration::seconds(31);
        }
        assert_eq!(blocks, vec![10, 20, 30, 30]);
    }

    #[test]
    fn test_violations_outside_period_reset_penalty() {
        let l = RateLimit {
            max_requests: 1,
            window_secs: 10,
            block_secs: 10,
            penalty: Some(ProgressivePenalty {
                multiplier: 2,
                period_secs: 60,
                max_block_secs: 1000,
            }),
        };
        let t0 = Utc::now();
        let first = evaluate(None, &key(), &l, t0);
        let blocked = evaluate(Some(&first.window), &key(), &l, t0);
        assert_eq!(blocked.window.violation_count, 1);
        let t1 = t0 + Duration::seconds(600);
        let again = evaluate(Some(&blocked.window), &key(), &l, t1);
        let blocked = evaluate(Some(&again.window), &key(), &l, t1);
        assert_eq!(blocked.window.violation_count, 1);
        assert_eq!(
            blocked.decision,
            RateDecision::Deny {
                retry_after_secs: 10
            }
        );
    }

    proptest! {
        #[test]
        fn prop_counts_never_leak_across_windows(
            max in 1u32..20,
            gaps in proptest::collection::vec(0i64..30, 1..60),
        ) {
            let l = RateLimit { max_requests: max, window_secs: 60, block_secs: 0, penalty: None };
            let t0 = Utc::now();
            let mut state: Option<RateLimitWindow> = None;
            let mut t = t0;
            for gap in gaps {
                t += Duration::seconds(gap);
                let out = evaluate(state.as_ref(), &key(), &l, t);
                let w = &out.window;
                // The counted window always contains `t`.
                prop_assert!(w.window_start <= t);
                prop_assert!(t < w.window_start + Duration::seconds(60));
                prop_assert!(w.request_count >= 1);
                if out.decision.is_allowed() {
                    prop_assert!(w.request_count <= i64::from(max));
                }
                state = Some(out.window);
            }
        }
    }
}
