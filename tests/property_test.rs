//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for any valid input.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use proptest::prelude::*;

use booking_ingest::auth::signature::{sign, SignedRequest};
use booking_ingest::auth::{SignatureConfig, SignatureError, SignatureVerifier, SIGNATURE_ALGORITHM};
use booking_ingest::domain::TransitionTrigger;
use booking_ingest::infra::memory::InMemoryNonceStore;
use booking_ingest::infra::RetryPolicy;
use booking_ingest::metrics::aggregator::{nearest_rank, LatencySummary};
use booking_ingest::DeadLetterStatus;

const SECRET: &[u8] = b"property-secret";

// ============================================================================
// Custom Strategies
// ============================================================================

fn arb_status() -> impl Strategy<Value = DeadLetterStatus> {
    prop::sample::select(DeadLetterStatus::ALL.to_vec())
}

fn arb_trigger() -> impl Strategy<Value = TransitionTrigger> {
    prop_oneof![
        Just(TransitionTrigger::Operator),
        Just(TransitionTrigger::Replay),
        Just(TransitionTrigger::Processor),
    ]
}

fn arb_body() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..256)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn verifier() -> SignatureVerifier {
    SignatureVerifier::new(
        SignatureConfig::new(SECRET.to_vec(), Duration::from_secs(300)),
        Arc::new(InMemoryNonceStore::new()),
    )
}

// ============================================================================
// Signature integrity
// ============================================================================

proptest! {
    #[test]
    fn prop_body_mutation_invalidates_signature(
        body in arb_body(),
        flip_at in any::<prop::sample::Index>(),
        nonce in "[a-z0-9]{8,32}",
        key in "[A-Za-z0-9_-]{1,64}",
    ) {
        prop_assume!(!body.is_empty());
        let timestamp = Utc::now().to_rfc3339();
        let signature = sign(SECRET, "POST", "/api/v1/ingest/bookings", &timestamp, &nonce, &key, &body).unwrap();

        let mut tampered = body.clone();
        let i = flip_at.index(tampered.len());
        tampered[i] ^= 0x01;

        let request = SignedRequest {
            method: "POST",
            path: "/api/v1/ingest/bookings",
            timestamp: &timestamp,
            nonce: &nonce,
            idempotency_key: &key,
            body: &tampered,
            signature: &signature,
            algorithm: SIGNATURE_ALGORITHM,
        };
        let result = runtime().block_on(verifier().verify(&request));
        prop_assert!(matches!(result, Err(SignatureError::SignatureInvalid)));
    }

    #[test]
    fn prop_nonce_is_single_use(
        body in arb_body(),
        nonce in "[a-z0-9]{8,32}",
    ) {
        let timestamp = Utc::now().to_rfc3339();
        let signature = sign(SECRET, "POST", "/p", &timestamp, &nonce, "k", &body).unwrap();
        let request = SignedRequest {
            method: "POST",
            path: "/p",
            timestamp: &timestamp,
            nonce: &nonce,
            idempotency_key: "k",
            body: &body,
            signature: &signature,
            algorithm: SIGNATURE_ALGORITHM,
        };

        let verifier = verifier();
        let rt = runtime();
        prop_assert!(rt.block_on(verifier.verify(&request)).is_ok());
        prop_assert!(matches!(
            rt.block_on(verifier.verify(&request)),
            Err(SignatureError::NonceReplay)
        ));
    }

    #[test]
    fn prop_changed_nonce_or_timestamp_breaks_signature(
        body in arb_body(),
        nonce in "[a-z0-9]{8,32}",
        skew in 1i64..200,
    ) {
        let now = Utc::now();
        let timestamp = now.to_rfc3339();
        let signature = sign(SECRET, "POST", "/p", &timestamp, &nonce, "k", &body).unwrap();

        let other_nonce = format!("{nonce}x");
        let other_timestamp = (now + chrono::Duration::seconds(skew)).to_rfc3339();
        let rt = runtime();

        for (ts, n) in [(timestamp.as_str(), other_nonce.as_str()), (other_timestamp.as_str(), nonce.as_str())] {
            let request = SignedRequest {
                method: "POST",
                path: "/p",
                timestamp: ts,
                nonce: n,
                idempotency_key: "k",
                body: &body,
                signature: &signature,
                algorithm: SIGNATURE_ALGORITHM,
            };
            prop_assert!(matches!(
                rt.block_on(verifier().verify(&request)),
                Err(SignatureError::SignatureInvalid)
            ));
        }
    }
}

// ============================================================================
// Dead-letter state machine
// ============================================================================

proptest! {
    #[test]
    fn prop_only_documented_edges_are_allowed(
        from in arb_status(),
        to in arb_status(),
        trigger in arb_trigger(),
    ) {
        use DeadLetterStatus::*;
        let documented = matches!(
            (from, to, trigger),
            (Open, Ready, TransitionTrigger::Operator)
                | (Failed, Ready, TransitionTrigger::Operator)
                | (Ready, Replaying, TransitionTrigger::Replay)
                | (Replaying, Succeeded, TransitionTrigger::Processor)
                | (Replaying, Failed, TransitionTrigger::Processor)
        );
        prop_assert_eq!(from.can_transition(to, trigger), documented);
    }

    #[test]
    fn prop_succeeded_is_terminal(to in arb_status(), trigger in arb_trigger()) {
        prop_assert!(!DeadLetterStatus::Succeeded.can_transition(to, trigger));
    }
}

// ============================================================================
// Latency percentiles
// ============================================================================

proptest! {
    #[test]
    fn prop_nearest_rank_is_a_sample(mut samples in prop::collection::vec(0i64..100_000, 1..200)) {
        samples.sort_unstable();
        for p in [50.0, 95.0, 100.0] {
            let value = nearest_rank(&samples, p).unwrap();
            prop_assert!(samples.contains(&value));
        }
    }

    #[test]
    fn prop_percentiles_are_ordered(samples in prop::collection::vec(0i64..100_000, 1..200)) {
        let summary = LatencySummary::from_samples(samples.clone());
        let median = summary.median.unwrap();
        let p95 = summary.p95.unwrap();
        let max = summary.max.unwrap();
        prop_assert!(median <= p95);
        prop_assert!(p95 <= max);
        prop_assert_eq!(max, *samples.iter().max().unwrap());
        prop_assert_eq!(summary.sample_count, samples.len());
    }
}

// ============================================================================
// Retry backoff
// ============================================================================

proptest! {
    #[test]
    fn prop_backoff_never_exceeds_ceiling(
        initial_ms in 1u64..1_000,
        max_ms in 1_000u64..60_000,
        multiplier in 1.0f64..4.0,
        attempt in 0u32..32,
    ) {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier,
            jitter: 0.0,
        };
        let delay = policy.delay_after_attempt(attempt);
        prop_assert!(delay <= Duration::from_millis(max_ms));
    }
}
