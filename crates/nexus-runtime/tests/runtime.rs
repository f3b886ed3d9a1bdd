use std::{sync::Arc, time::Duration};

use nexus_runtime::{
    ErrorCode, Runtime, RuntimeConfig,
    capability::CapabilitySet,
    exec::{
        AsyncResult, DeclaredType, ExecutionContext, ExecutionResult, ExecutionStatus, LogLevel,
        StateMutation,
    },
    value::RuntimeValue,
};

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::default()).expect("runtime")
}

fn runtime_with(config: RuntimeConfig) -> Runtime {
    Runtime::new(config).expect("runtime")
}

fn context(capabilities: &[&str]) -> ExecutionContext {
    let mut context = ExecutionContext::default();
    context.panel_id = "panel-1".into();
    context.handler_name = "test".into();
    context.granted_capabilities = CapabilitySet::parse(capabilities).expect("capabilities");
    context
}

async fn execute(runtime: &Runtime, source: &str, context: ExecutionContext) -> ExecutionResult {
    runtime
        .execute_handler(source, context, None)
        .await
        .expect("execute")
}

fn error_code(result: &ExecutionResult) -> ErrorCode {
    assert_eq!(result.status, ExecutionStatus::Error, "{result:?}");
    result.error.as_ref().expect("error envelope").code
}

#[tokio::test(flavor = "multi_thread")]
async fn counter_increment() {
    let runtime = runtime();
    let mut context = context(&["state:read:count", "state:write:count"]);
    context
        .state_snapshot
        .insert("count".into(), RuntimeValue::Int(5));
    context.args = RuntimeValue::from_json(r#"{"by": 3}"#).expect("args");

    let result = execute(
        &runtime,
        "$state.count = ($state.count ?? 0) + $args.by;",
        context,
    )
    .await;

    assert_eq!(result.status, ExecutionStatus::Success, "{result:?}");
    assert_eq!(
        result.state_mutations,
        vec![StateMutation::Set {
            key: "count".into(),
            value: RuntimeValue::Int(8),
        }]
    );
    assert!(result.emitted_events.is_empty());
    assert!(result.view_commands.is_empty());
    assert!(result.return_value.is_none());
    assert!(result.metrics.execution_duration_us > 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn write_without_capability_is_denied() {
    let runtime = runtime();
    let result = execute(&runtime, "$state.secret = 1;", context(&["state:read:*"])).await;

    assert_eq!(error_code(&result), ErrorCode::CapabilityDenied);
    let envelope = result.error.as_ref().expect("envelope");
    assert_eq!(
        envelope.required_capability.as_deref(),
        Some("state:write:secret")
    );
    assert!(result.state_mutations.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn emit_mutate_and_return() {
    let runtime = runtime();
    let mut context = context(&["state:write:seen", "events:emit:ping"]);
    context.args = RuntimeValue::from_json(r#"{"n": 21}"#).expect("args");

    let result = execute(
        &runtime,
        r#"$state.seen = true; $emit("ping", {n: $args.n}); return $args.n * 2;"#,
        context,
    )
    .await;

    assert_eq!(result.status, ExecutionStatus::Success, "{result:?}");
    assert_eq!(
        result.state_mutations,
        vec![StateMutation::Set {
            key: "seen".into(),
            value: RuntimeValue::Bool(true),
        }]
    );
    assert_eq!(result.emitted_events.len(), 1);
    assert_eq!(result.emitted_events[0].name, "ping");
    assert_eq!(
        result.emitted_events[0].payload.get("n"),
        Some(&RuntimeValue::Int(21))
    );
    assert_eq!(result.return_value, Some(RuntimeValue::Int(42)));
}

#[tokio::test(flavor = "multi_thread")]
async fn suspend_resume_and_idempotence() {
    let runtime = runtime();
    let mut context = context(&["ext:http"]);
    context.extension_registry.insert("http", "get");

    let first = execute(
        &runtime,
        r#"const r = $ext.http.get("https://x"); return r.status;"#,
        context,
    )
    .await;

    assert_eq!(first.status, ExecutionStatus::Suspended, "{first:?}");
    assert!(first.state_mutations.is_empty());
    let suspension = first.suspension.as_ref().expect("suspension");
    assert_eq!(suspension.extension, "http");
    assert_eq!(suspension.method, "get");
    assert_eq!(suspension.args, RuntimeValue::String("https://x".into()));

    let resumed = runtime
        .resume_handler(
            &suspension.id,
            AsyncResult::Success(RuntimeValue::from_json(r#"{"status": 200}"#).expect("value")),
        )
        .await
        .expect("resume");
    assert_eq!(resumed.status, ExecutionStatus::Success, "{resumed:?}");
    assert_eq!(resumed.return_value, Some(RuntimeValue::Int(200)));

    // A suspension id settles at most once.
    let replay = runtime
        .resume_handler(&suspension.id, AsyncResult::Success(RuntimeValue::Null))
        .await
        .expect("resume");
    assert_eq!(error_code(&replay), ErrorCode::UnknownSuspension);
}

#[tokio::test(flavor = "multi_thread")]
async fn resume_failure_is_thrown_into_the_script() {
    let runtime = runtime();
    let mut context = context(&["ext:http"]);
    context.extension_registry.insert("http", "get");

    let first = execute(
        &runtime,
        r#"const r = $ext.http.get("https://x"); return r.status;"#,
        context,
    )
    .await;
    let suspension = first.suspension.expect("suspension");

    let resumed = runtime
        .resume_handler(
            &suspension.id,
            AsyncResult::Failure {
                message: "connection refused".into(),
                code: None,
            },
        )
        .await
        .expect("resume");
    assert_eq!(error_code(&resumed), ErrorCode::RuntimeError);
    assert!(
        resumed
            .error
            .as_ref()
            .expect("envelope")
            .message
            .contains("connection refused")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn effects_accumulate_across_suspension_cycles() {
    let runtime = runtime();
    let mut context = context(&["state:write:*", "ext:http"]);
    context.extension_registry.insert("http", "get");

    let first = execute(
        &runtime,
        r#"$state.before = 1; const r = $ext.http.get("https://x"); $state.after = r; return null;"#,
        context,
    )
    .await;
    assert_eq!(first.status, ExecutionStatus::Suspended);
    assert_eq!(first.state_mutations.len(), 1);

    let resumed = runtime
        .resume_handler(
            &first.suspension.expect("suspension").id,
            AsyncResult::Success(RuntimeValue::Int(2)),
        )
        .await
        .expect("resume");
    assert_eq!(resumed.status, ExecutionStatus::Success, "{resumed:?}");
    // The final envelope extends the suspended one.
    assert_eq!(
        resumed
            .state_mutations
            .iter()
            .map(StateMutation::key)
            .collect::<Vec<_>>(),
        vec!["before", "after"]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn tight_loop_times_out_and_instance_is_dropped() {
    let runtime = runtime_with(RuntimeConfig::default().max_instances(1));
    let result = runtime
        .execute_handler("while (true) {}", context(&[]), Some(Duration::from_millis(50)))
        .await
        .expect("execute");

    assert_eq!(error_code(&result), ErrorCode::Timeout);
    assert!(result.metrics.execution_duration_us >= 50_000);

    let stats = runtime.stats();
    assert_eq!(stats.executions_timed_out, 1);
    assert_eq!(stats.active_instances, 0);
    assert_eq!(stats.idle_instances, 0, "timed-out instance must not be pooled");

    // The pool slot is free again.
    let next = execute(&runtime, "return 1;", context(&[])).await;
    assert_eq!(next.status, ExecutionStatus::Success);
}

#[tokio::test(flavor = "multi_thread")]
async fn allocation_beyond_memory_limit_errors() {
    let runtime = runtime_with(RuntimeConfig::default().memory_limit_bytes(4 << 20));
    let result = execute(
        &runtime,
        r#"const chunks = []; for (;;) { chunks.push("abcdefgh".repeat(65536)); }"#,
        context(&[]),
    )
    .await;

    assert_eq!(error_code(&result), ErrorCode::MemoryLimit);
    assert_eq!(runtime.stats().idle_instances, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn second_execution_hits_the_compile_cache() {
    let runtime = runtime();
    let source = "$state.count = ($state.count ?? 0) + 1;";
    let caps = ["state:read:count", "state:write:count"];

    let first = execute(&runtime, source, context(&caps)).await;
    assert!(!first.metrics.compile_cache_hit);

    let second = execute(&runtime, source, context(&caps)).await;
    assert!(second.metrics.compile_cache_hit);

    let stats = runtime.stats();
    assert_eq!(stats.compile_cache_misses, 1);
    assert!(stats.compile_cache_hits >= 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn read_your_writes() {
    let runtime = runtime();
    let result = execute(
        &runtime,
        "$state.k = 7; return $state.k;",
        context(&["state:read:k", "state:write:k"]),
    )
    .await;
    assert_eq!(result.return_value, Some(RuntimeValue::Int(7)));
}

#[tokio::test(flavor = "multi_thread")]
async fn effect_lists_preserve_call_order() {
    let runtime = runtime();
    let result = execute(
        &runtime,
        r#"$state.a = 1; $emit("x", null); $state.b = 2;"#,
        context(&["state:write:*", "events:emit:x"]),
    )
    .await;

    assert_eq!(result.status, ExecutionStatus::Success, "{result:?}");
    assert_eq!(
        result
            .state_mutations
            .iter()
            .map(StateMutation::key)
            .collect::<Vec<_>>(),
        vec!["a", "b"]
    );
    assert_eq!(result.emitted_events.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_records_a_distinct_marker() {
    let runtime = runtime();
    let mut context = context(&["state:read:*", "state:write:*"]);
    context
        .state_snapshot
        .insert("gone".into(), RuntimeValue::Int(1));

    let result = execute(
        &runtime,
        "delete $state.gone; $state.kept = 1; return $state.gone;",
        context,
    )
    .await;

    assert_eq!(result.status, ExecutionStatus::Success, "{result:?}");
    assert_eq!(
        result.state_mutations,
        vec![
            StateMutation::Delete { key: "gone".into() },
            StateMutation::Set {
                key: "kept".into(),
                value: RuntimeValue::Int(1),
            },
        ]
    );
    // Reads after delete see null.
    assert_eq!(result.return_value, Some(RuntimeValue::Null));
}

#[tokio::test(flavor = "multi_thread")]
async fn state_keys_requires_the_wildcard_read() {
    let runtime = runtime();
    let mut scoped = context(&["state:read:count"]);
    scoped
        .state_snapshot
        .insert("count".into(), RuntimeValue::Int(1));
    let denied = execute(&runtime, "return Object.keys($state);", scoped).await;
    assert_eq!(error_code(&denied), ErrorCode::CapabilityDenied);

    let mut wide = context(&["state:read:*"]);
    wide.state_snapshot
        .insert("a".into(), RuntimeValue::Int(1));
    wide.state_snapshot
        .insert("b".into(), RuntimeValue::Int(2));
    let listed = execute(&runtime, "return Object.keys($state);", wide).await;
    assert_eq!(
        listed.return_value,
        Some(RuntimeValue::List(vec![
            RuntimeValue::String("a".into()),
            RuntimeValue::String("b".into()),
        ]))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn no_capabilities_means_no_effects() {
    let runtime = runtime();
    let result = execute(&runtime, "return 1 + 1;", context(&[])).await;

    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(result.return_value, Some(RuntimeValue::Int(2)));
    assert!(result.state_mutations.is_empty());
    assert!(result.emitted_events.is_empty());
    assert!(result.view_commands.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn dynamic_code_entry_points_are_unreachable() {
    let runtime = runtime();
    let result = execute(
        &runtime,
        r#"return [typeof eval, typeof Function, typeof (() => {}).constructor].join(",");"#,
        context(&[]),
    )
    .await;
    assert_eq!(
        result.return_value,
        Some(RuntimeValue::String("undefined,undefined,undefined".into()))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn scope_bindings_are_frozen() {
    let runtime = runtime();
    let mut readable = context(&[]);
    readable
        .scope_variables
        .insert("item".into(), RuntimeValue::String("a".into()));
    let result = execute(&runtime, "return $scope.item;", readable).await;
    assert_eq!(result.return_value, Some(RuntimeValue::String("a".into())));

    let mut frozen = context(&[]);
    frozen
        .scope_variables
        .insert("item".into(), RuntimeValue::String("a".into()));
    let write = execute(&runtime, r#"$scope.item = "b"; return $scope.item;"#, frozen).await;
    assert_eq!(error_code(&write), ErrorCode::RuntimeError);
}

#[tokio::test(flavor = "multi_thread")]
async fn declared_type_is_enforced_on_state_set() {
    let runtime = runtime();
    let mut context = context(&["state:write:n"]);
    context.state_types.insert("n".into(), DeclaredType::Int);

    let result = execute(&runtime, r#"$state.n = "not a number";"#, context).await;
    assert_eq!(error_code(&result), ErrorCode::TypeMismatch);
    assert!(result.state_mutations.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn unregistered_extension_method_errors() {
    let runtime = runtime();
    let result = execute(&runtime, "$ext.mail.send({});", context(&["ext:*"])).await;
    assert_eq!(error_code(&result), ErrorCode::UnknownExtension);
}

#[tokio::test(flavor = "multi_thread")]
async fn view_commands_capture_the_argument_list() {
    let runtime = runtime();
    let result = execute(
        &runtime,
        r#"$view.chart.update({x: 1}, "fast");"#,
        context(&["view:update:chart"]),
    )
    .await;

    assert_eq!(result.status, ExecutionStatus::Success, "{result:?}");
    assert_eq!(result.view_commands.len(), 1);
    let command = &result.view_commands[0];
    assert_eq!(command.target, "chart");
    assert_eq!(command.command, "update");
    match &command.args {
        RuntimeValue::List(args) => {
            assert_eq!(args.len(), 2);
            assert_eq!(args[0].get("x"), Some(&RuntimeValue::Int(1)));
        }
        other => panic!("expected argument list, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn logs_reach_the_result_sink() {
    let runtime = runtime();
    let result = execute(
        &runtime,
        r#"$log("warn", "low disk", {left: 5}); return null;"#,
        context(&[]),
    )
    .await;

    assert_eq!(result.status, ExecutionStatus::Success, "{result:?}");
    assert_eq!(result.logs.len(), 1);
    assert_eq!(result.logs[0].level, LogLevel::Warn);
    assert_eq!(result.logs[0].message, "low disk");
    assert_eq!(
        result.logs[0].data.as_ref().and_then(|d| d.get("left")),
        Some(&RuntimeValue::Int(5))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn syntax_errors_surface_with_the_compile_code() {
    let runtime = runtime();
    let result = execute(&runtime, "const = ;", context(&[])).await;
    assert_eq!(error_code(&result), ErrorCode::CompileError);
}

#[tokio::test(flavor = "multi_thread")]
async fn uncaught_script_errors_are_runtime_errors() {
    let runtime = runtime();
    let result = execute(&runtime, "null.missing;", context(&[])).await;
    assert_eq!(error_code(&result), ErrorCode::RuntimeError);
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_suspension_cannot_be_resumed() {
    let runtime = runtime_with(
        RuntimeConfig::default().suspension_timeout(Duration::from_millis(100)),
    );
    let mut context = context(&["ext:http"]);
    context.extension_registry.insert("http", "get");

    let first = execute(&runtime, r#"$ext.http.get("https://x");"#, context).await;
    let suspension = first.suspension.expect("suspension");

    tokio::time::sleep(Duration::from_millis(400)).await;
    let resumed = runtime
        .resume_handler(&suspension.id, AsyncResult::Success(RuntimeValue::Null))
        .await
        .expect("resume");
    assert_eq!(error_code(&resumed), ErrorCode::UnknownSuspension);
    assert_eq!(runtime.stats().suspended_instances, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_bound_holds_with_suspended_instances() {
    let runtime = Arc::new(runtime_with(RuntimeConfig::default().max_instances(2)));

    let suspend_context = || {
        let mut context = context(&["ext:http"]);
        context.extension_registry.insert("http", "get");
        context
    };
    let source = r#"const r = $ext.http.get("https://x"); return r;"#;

    let first = execute(&runtime, source, suspend_context()).await;
    let second = execute(&runtime, source, suspend_context()).await;
    let stats = runtime.stats();
    assert_eq!(stats.suspended_instances, 2);
    assert_eq!(stats.active_instances, 0);
    assert_eq!(stats.idle_instances, 0);

    // Both slots are held by suspended instances; a third caller waits.
    let third = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move {
            runtime
                .execute_handler("return 3;", context(&[]), None)
                .await
                .expect("execute")
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!third.is_finished());

    let resumed = runtime
        .resume_handler(
            &first.suspension.expect("suspension").id,
            AsyncResult::Success(RuntimeValue::Int(1)),
        )
        .await
        .expect("resume");
    assert_eq!(resumed.status, ExecutionStatus::Success);

    let third = third.await.expect("join");
    assert_eq!(third.return_value, Some(RuntimeValue::Int(3)));

    // Leave nothing suspended.
    let resumed = runtime
        .resume_handler(
            &second.suspension.expect("suspension").id,
            AsyncResult::Success(RuntimeValue::Int(2)),
        )
        .await
        .expect("resume");
    assert_eq!(resumed.status, ExecutionStatus::Success);
}

#[tokio::test(flavor = "multi_thread")]
async fn precompiled_handlers_execute() {
    let runtime = runtime();
    let artifact = runtime
        .precompile_handler("return $args;")
        .await
        .expect("precompile");

    let mut context = context(&[]);
    context.args = RuntimeValue::Int(9);
    let result = runtime
        .execute_compiled_handler(artifact, context, None)
        .await
        .expect("execute");
    assert_eq!(result.return_value, Some(RuntimeValue::Int(9)));
    assert!(result.metrics.compile_cache_hit);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_rejects_new_work() {
    let runtime = runtime();
    runtime.shutdown();
    let result = execute(&runtime, "return 1;", context(&[])).await;
    assert_eq!(error_code(&result), ErrorCode::PoolShutdown);
    // Idempotent.
    runtime.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn stats_and_exposition_cover_outcomes() {
    let runtime = runtime();
    let ok = execute(&runtime, "return 1;", context(&[])).await;
    assert_eq!(ok.status, ExecutionStatus::Success);
    let err = execute(&runtime, "null.missing;", context(&[])).await;
    assert_eq!(err.status, ExecutionStatus::Error);

    let stats = runtime.stats();
    assert_eq!(stats.executions_succeeded, 1);
    assert_eq!(stats.executions_failed, 1);
    assert!(stats.peak_execution_us >= stats.average_execution_us);

    // Rendering degrades to empty when another embedding owns the global
    // recorder (test processes share it); when owned, the exposition carries
    // the nexus_ metric families.
    let exposition = runtime.prometheus_metrics();
    if !exposition.is_empty() {
        assert!(exposition.contains("nexus_handler_executions_total"));
    }
}
