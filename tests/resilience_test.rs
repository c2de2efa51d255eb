use colloquy::client::RetryPolicy;
use colloquy::types::{ChatError, Result};
use std::time::Duration;

#[tokio::test]
async fn test_retry_policy_success() {
    let policy = RetryPolicy::new(3, 1);
    let mut attempts = 0;

    let result: Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            async move { Ok(42) }
        })
        .await;

    match result {
        Ok(val) => assert_eq!(val, 42),
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
    assert_eq!(attempts, 1);
}

/// P7: three 503s, success on the fourth attempt — exactly three retries,
/// and the fourth attempt's result is delivered.
#[tokio::test]
async fn test_server_errors_retried_until_budget() {
    let policy = RetryPolicy::new(3, 1);
    let mut attempts = 0;

    let result: Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            let a = attempts;
            async move {
                if a <= 3 {
                    Err(ChatError::UpstreamServerError(503, "unavailable".into()).into())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

    match result {
        Ok(val) => assert_eq!(val, 42),
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
    assert_eq!(attempts, 4);
}

#[tokio::test]
async fn test_budget_exhaustion_surfaces_last_error() {
    let policy = RetryPolicy::new(3, 1);
    let mut attempts = 0;

    let result: Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            async move { Err(ChatError::UpstreamServerError(503, "still down".into()).into()) }
        })
        .await;

    assert_eq!(attempts, 4);
    match result {
        Err(e) => assert!(matches!(e.inner, ChatError::UpstreamServerError(503, _))),
        Ok(_) => panic!("Expected exhaustion error"),
    }
}

/// P7: a 401 is a configuration problem, not a transient failure.
#[tokio::test]
async fn test_unauthorized_never_retried() {
    let policy = RetryPolicy::new(3, 1);
    let mut attempts = 0;

    let result: Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            async move { Err(ChatError::Unauthorized("bad key".into()).into()) }
        })
        .await;

    assert_eq!(attempts, 1);
    assert!(matches!(result.unwrap_err().inner, ChatError::Unauthorized(_)));
}

#[tokio::test]
async fn test_other_4xx_never_retried() {
    let policy = RetryPolicy::new(3, 1);
    let mut attempts = 0;

    let result: Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            async move { Err(ChatError::UpstreamRejected(404, "no such app".into()).into()) }
        })
        .await;

    assert_eq!(attempts, 1);
    assert!(matches!(
        result.unwrap_err().inner,
        ChatError::UpstreamRejected(404, _)
    ));
}

#[tokio::test]
async fn test_rate_limit_and_timeout_are_retryable() {
    for error in [ChatError::RateLimited("slow".into()), ChatError::Timeout] {
        let policy = RetryPolicy::new(1, 1);
        let mut attempts = 0;
        let mut first = Some(error);

        let result: Result<i32> = policy
            .execute_with_retry(|| {
                attempts += 1;
                let err = first.take();
                async move {
                    match err {
                        Some(e) => Err(e.into()),
                        None => Ok(7),
                    }
                }
            })
            .await;

        assert_eq!(attempts, 2);
        assert_eq!(result.unwrap(), 7);
    }
}

/// Delays grow strictly: the ±25% jitter bands of consecutive retries never
/// overlap.
#[test]
fn test_backoff_strictly_increases() {
    let policy = RetryPolicy::new(3, 1_000);
    for _ in 0..100 {
        let delays: Vec<Duration> = (1..=3).map(|r| policy.backoff_delay(r)).collect();
        assert!(delays[0] < delays[1] && delays[1] < delays[2], "{:?}", delays);
    }
}
