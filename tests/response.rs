//! Wire shape of responses and error classification.

use conductor::{FailureStage, OrchestratorError, ProviderOutput, Response};
use serde_json::json;

#[test]
fn success_serializes_to_camel_case() {
    let resp = Response::Success {
        provider_id: "gemini".to_string(),
        data: ProviderOutput::text("hello"),
        latency_ms: 42,
    };
    let value: serde_json::Value = serde_json::from_str(&resp.to_json()).unwrap();
    assert_eq!(
        value,
        json!({
            "success": true,
            "providerId": "gemini",
            "data": {"text": "hello"},
            "latencyMs": 42
        })
    );
}

#[test]
fn success_includes_model_when_known() {
    let resp = Response::Success {
        provider_id: "ollama".to_string(),
        data: ProviderOutput {
            text: "hi".to_string(),
            model: Some("llama3.2".to_string()),
        },
        latency_ms: 0,
    };
    let value = serde_json::to_value(&resp).unwrap();
    assert_eq!(value["data"]["model"], "llama3.2");
}

#[test]
fn failures_report_their_stage_as_provider_id() {
    for (stage, expected) in [
        (FailureStage::Policy, "policy"),
        (FailureStage::None, "none"),
        (FailureStage::All, "all"),
    ] {
        let resp = Response::Failure {
            stage,
            error: "nope".to_string(),
        };
        assert_eq!(resp.provider_id(), expected);
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            value,
            json!({"success": false, "providerId": expected, "error": "nope"})
        );
    }
}

#[test]
fn accessors_match_variant() {
    let ok = Response::Success {
        provider_id: "a".to_string(),
        data: ProviderOutput::text("t"),
        latency_ms: 1,
    };
    assert!(ok.is_success());
    assert_eq!(ok.text(), Some("t"));
    assert_eq!(ok.error(), None);

    let failed = Response::Failure {
        stage: FailureStage::All,
        error: "e".to_string(),
    };
    assert!(!failed.is_success());
    assert_eq!(failed.text(), None);
    assert_eq!(failed.error(), Some("e"));
}

#[test]
fn user_messages_do_not_leak_upstream_bodies() {
    let err = OrchestratorError::Upstream {
        provider: "openrouter".to_string(),
        message: "500: connect to 10.0.0.7:5432 failed".to_string(),
        status: Some(500),
    };
    assert!(!err.user_message().contains("10.0.0.7"));
    assert!(err.to_string().contains("10.0.0.7"));

    let err = OrchestratorError::SchemaParse("expected value at line 1 column 1".to_string());
    assert_eq!(err.user_message(), "failed to parse provider response");
}

#[test]
fn only_provider_faults_count_against_the_circuit() {
    let faults = [
        OrchestratorError::Timeout(100),
        OrchestratorError::RateLimited {
            provider: "a".to_string(),
        },
        OrchestratorError::Declined {
            provider: "a".to_string(),
            message: "filtered".to_string(),
        },
        OrchestratorError::Panicked {
            provider: "a".to_string(),
            message: "boom".to_string(),
        },
        OrchestratorError::Upstream {
            provider: "a".to_string(),
            message: "502".to_string(),
            status: Some(502),
        },
    ];
    for err in &faults {
        assert!(err.counts_against_provider(), "{err} should count");
    }

    let skips = [
        OrchestratorError::CircuitOpen {
            provider: "a".to_string(),
        },
        OrchestratorError::LimiterClosed {
            provider: "a".to_string(),
        },
        OrchestratorError::Saturated {
            provider: "a".to_string(),
        },
    ];
    for err in &skips {
        assert!(!err.counts_against_provider(), "{err} should not count");
    }
}

#[test]
fn saturated_is_reported_without_a_duration() {
    let err = OrchestratorError::Saturated {
        provider: "gemini".to_string(),
    };
    assert_eq!(err.reason(), "saturated");
    assert_eq!(err.provider(), Some("gemini"));
    assert!(!err.to_string().contains("0ms"));
    assert_eq!(err.user_message(), "gemini is at capacity, try again shortly");
}

#[test]
fn provider_is_extracted_from_structured_errors() {
    let err = OrchestratorError::CircuitOpen {
        provider: "hf".to_string(),
    };
    assert_eq!(err.provider(), Some("hf"));
    assert_eq!(err.reason(), "circuit_open");
    assert_eq!(OrchestratorError::Timeout(5).provider(), None);
}

#[test]
fn exhausted_message_carries_attempt_count() {
    let err = OrchestratorError::Exhausted {
        attempts: 2,
        last_error: "request timed out after 20000ms".to_string(),
    };
    assert_eq!(
        err.user_message(),
        "all providers failed after 2 attempt(s): request timed out after 20000ms"
    );
}
