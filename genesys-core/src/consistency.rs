//! Consistency - Waiting for read-back state to reflect a mutation
//!
//! The API is eventually consistent: a read issued right after a create or
//! update may still return the previous representation. After mutating,
//! providers re-read until every attribute the configuration declares
//! matches, or give up after a timeout.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::provider::{ErrorKind, ProviderError, ProviderResult};
use crate::resource::{Resource, State, Value};
use crate::retry::{Attempt, Backoff, RetryError, retry_with_timeout};

/// An attribute whose remote value differs from the configured one
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("mismatch on attribute {key}:\nexpected value: {expected}\nactual value:   {actual}")]
pub struct ConsistencyError {
    pub key: String,
    pub expected: String,
    pub actual: String,
}

impl ConsistencyError {
    fn new(key: &str, expected: &Value, actual: Option<&Value>) -> Self {
        Self {
            key: key.to_string(),
            expected: expected.to_string(),
            actual: actual
                .map(|v| v.to_string())
                .unwrap_or_else(|| "<unset>".to_string()),
        }
    }
}

/// Whether the remote value satisfies the configured one.
///
/// Maps match on the keys the configuration declares; keys the API adds
/// (names, `selfUri`) are ignored. Numbers compare by value, so `3` and
/// `3.0` are equal.
fn values_match(expected: &Value, actual: Option<&Value>) -> bool {
    let Some(actual) = actual else {
        return expected.is_empty_block();
    };
    match (expected, actual) {
        (Value::Map(want), Value::Map(got)) => want
            .iter()
            .all(|(key, value)| values_match(value, got.get(key))),
        (Value::List(want), Value::List(got)) if want.len() == got.len() => want
            .iter()
            .zip(got)
            .all(|(want, got)| values_match(want, Some(got))),
        (Value::Int(i), Value::Float(f)) | (Value::Float(f), Value::Int(i)) => *i as f64 == *f,
        _ => expected == actual || (expected.is_empty_block() && actual.is_empty_block()),
    }
}

/// Compare every attribute declared on `desired` against `actual`.
///
/// Attributes only present remotely (computed fields) are ignored.
pub fn check_consistency(desired: &Resource, actual: &State) -> Result<(), ConsistencyError> {
    if !actual.exists {
        return Err(ConsistencyError {
            key: "id".to_string(),
            expected: "an existing resource".to_string(),
            actual: "not found".to_string(),
        });
    }

    let mut keys: Vec<&String> = desired.attributes.keys().collect();
    keys.sort();

    for key in keys {
        let expected = &desired.attributes[key];
        let remote = actual.attributes.get(key);
        if !values_match(expected, remote) {
            return Err(ConsistencyError::new(key, expected, remote));
        }
    }
    Ok(())
}

/// Re-read a resource until it matches `desired` or `timeout` elapses.
///
/// Read errors are not retried; only mismatches are.
pub async fn wait_for_consistency<F, Fut>(
    timeout: Duration,
    desired: &Resource,
    mut read: F,
) -> ProviderResult<State>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<State>>,
{
    let backoff = Backoff::new(Duration::from_millis(200), Duration::from_secs(5));
    let result = retry_with_timeout(timeout, backoff, || {
        let pending = read();
        async move {
            match pending.await {
                Ok(state) => match check_consistency(desired, &state) {
                    Ok(()) => Attempt::Success(state),
                    Err(mismatch) => Attempt::retry(
                        ProviderError::new(mismatch.to_string())
                            .with_kind(ErrorKind::Consistency)
                            .with_cause(mismatch),
                    ),
                },
                Err(e) => Attempt::Fail(e),
            }
        }
    })
    .await;

    result.map_err(|e| match e {
        RetryError::Failed(e) => e,
        RetryError::Timeout {
            timeout,
            last_error,
        } => {
            let detail = last_error
                .map(|e| e.message)
                .unwrap_or_else(|| "no read completed".to_string());
            ProviderError::new(format!(
                "state did not become consistent within {:?}: {}",
                timeout, detail
            ))
            .with_kind(ErrorKind::Consistency)
            .for_resource(desired.id.clone())
        }
        RetryError::Exhausted { last_error, .. } => last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceId;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn desired() -> Resource {
        Resource::new("routing_wrapupcode", "sales")
            .with_attribute("name", Value::String("Sales".into()))
            .with_attribute("tags", Value::List(vec![]))
    }

    fn state_with(name: &str) -> State {
        let mut attrs = HashMap::new();
        attrs.insert("name".to_string(), Value::String(name.to_string()));
        attrs.insert("dateCreated".to_string(), Value::String("2024".to_string()));
        State::existing(ResourceId::new("routing_wrapupcode", "sales"), attrs)
    }

    #[test]
    fn matching_state_is_consistent() {
        assert!(check_consistency(&desired(), &state_with("Sales")).is_ok());
    }

    #[test]
    fn mismatch_reports_attribute() {
        let err = check_consistency(&desired(), &state_with("Old")).unwrap_err();
        assert_eq!(err.key, "name");
        assert_eq!(
            err.to_string(),
            "mismatch on attribute name:\nexpected value: \"Sales\"\nactual value:   \"Old\""
        );
    }

    #[test]
    fn missing_state_is_inconsistent() {
        let state = State::not_found(ResourceId::new("routing_wrapupcode", "sales"));
        assert_eq!(check_consistency(&desired(), &state).unwrap_err().key, "id");
    }

    #[test]
    fn single_empty_map_equals_unset_list() {
        let desired = Resource::new("group", "g")
            .with_attribute("owners", Value::List(vec![Value::Map(HashMap::new())]));
        let state = State::existing(ResourceId::new("group", "g"), HashMap::new());
        assert!(check_consistency(&desired, &state).is_ok());
    }

    fn map(entries: &[(&str, Value)]) -> Value {
        Value::Map(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    fn wrapupcode_in_division(division: Value) -> (Resource, State) {
        let desired = Resource::new("routing_wrapupcode", "sales")
            .with_attribute("division", map(&[("id", Value::String("home".into()))]));
        let mut attrs = HashMap::new();
        attrs.insert("division".to_string(), division);
        let state = State::existing(ResourceId::new("routing_wrapupcode", "sales"), attrs);
        (desired, state)
    }

    #[test]
    fn nested_reference_ignores_computed_fields() {
        let (desired, state) = wrapupcode_in_division(map(&[
            ("id", Value::String("home".into())),
            ("name", Value::String("Home".into())),
            (
                "selfUri",
                Value::String("/api/v2/authorization/divisions/home".into()),
            ),
        ]));
        assert!(check_consistency(&desired, &state).is_ok());
    }

    #[test]
    fn nested_reference_still_compares_declared_keys() {
        let (desired, state) = wrapupcode_in_division(map(&[
            ("id", Value::String("other".into())),
            ("name", Value::String("Other".into())),
        ]));
        assert_eq!(check_consistency(&desired, &state).unwrap_err().key, "division");
    }

    #[test]
    fn nested_maps_inside_lists() {
        let desired = Resource::new("architect_greeting", "hello").with_attribute(
            "owners",
            Value::List(vec![map(&[("id", Value::String("u-1".into()))])]),
        );
        let mut attrs = HashMap::new();
        attrs.insert(
            "owners".to_string(),
            Value::List(vec![map(&[
                ("id", Value::String("u-1".into())),
                ("selfUri", Value::String("/api/v2/users/u-1".into())),
            ])]),
        );
        let state = State::existing(ResourceId::new("architect_greeting", "hello"), attrs.clone());
        assert!(check_consistency(&desired, &state).is_ok());

        // an extra element is a real difference
        if let Some(Value::List(owners)) = attrs.get_mut("owners") {
            owners.push(map(&[("id", Value::String("u-2".into()))]));
        }
        let state = State::existing(ResourceId::new("architect_greeting", "hello"), attrs);
        assert!(check_consistency(&desired, &state).is_err());
    }

    #[test]
    fn numbers_compare_by_value() {
        let desired = Resource::new("oauth_client", "ci")
            .with_attribute("accessTokenValiditySeconds", Value::Float(3.0));
        let mut attrs = HashMap::new();
        attrs.insert("accessTokenValiditySeconds".to_string(), Value::Int(3));
        let state = State::existing(ResourceId::new("oauth_client", "ci"), attrs.clone());
        assert!(check_consistency(&desired, &state).is_ok());

        attrs.insert("accessTokenValiditySeconds".to_string(), Value::Float(3.5));
        let state = State::existing(ResourceId::new("oauth_client", "ci"), attrs);
        assert!(check_consistency(&desired, &state).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn nested_computed_fields_do_not_stall_the_wait() {
        let (desired, state) = wrapupcode_in_division(map(&[
            ("id", Value::String("home".into())),
            ("name", Value::String("Home".into())),
        ]));
        let start = tokio::time::Instant::now();
        let result = wait_for_consistency(Duration::from_secs(60), &desired, || {
            let state = state.clone();
            async move { Ok(state) }
        })
        .await;

        assert!(result.is_ok());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_until_read_matches() {
        let reads = Arc::new(AtomicU32::new(0));
        let counter = reads.clone();
        let state = wait_for_consistency(Duration::from_secs(30), &desired(), || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(state_with(if n < 2 { "Old" } else { "Sales" })) }
        })
        .await
        .unwrap();

        assert_eq!(reads.load(Ordering::SeqCst), 3);
        assert_eq!(state.attributes["name"], Value::String("Sales".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_timeout() {
        let err = wait_for_consistency(Duration::from_secs(2), &desired(), || async {
            Ok(state_with("Old"))
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Consistency);
        assert!(err.message.contains("mismatch on attribute name"));
    }

    #[tokio::test]
    async fn read_errors_are_not_retried() {
        let err = wait_for_consistency(Duration::from_secs(30), &desired(), || async {
            Err(ProviderError::new("403 forbidden").with_kind(ErrorKind::Api))
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Api);
    }
}
