//! Concurrent dispatch of the `ToolCall` blocks in one Assistant message.

use std::sync::Arc;

use serde_json::Value;

use turnloop_core::AbortSignal;

use crate::registry::{Tool, ToolOutcome, ToolRegistry, ToolUpdate};

/// Observes the lifecycle events named by the tool-execution contract
/// (`tool_execution_start`, `tool_execution_update`, `tool_execution_end`).
/// Implementations are expected to just publish to an event fan-out; errors
/// inside an observer callback must never abort dispatch, so these are
/// plain synchronous calls rather than fallible ones.
pub trait ToolExecutionObserver: Send + Sync {
    fn on_start(&self, call_id: &str, name: &str, arguments: &Value);
    fn on_update(&self, call_id: &str, update: &ToolUpdate);
    fn on_end(&self, call_id: &str, name: &str, outcome: &ToolOutcome);
}

/// An observer that discards every event. Useful in tests that only care
/// about the returned outcomes.
pub struct NullObserver;

impl ToolExecutionObserver for NullObserver {
    fn on_start(&self, _call_id: &str, _name: &str, _arguments: &Value) {}
    fn on_update(&self, _call_id: &str, _update: &ToolUpdate) {}
    fn on_end(&self, _call_id: &str, _name: &str, _outcome: &ToolOutcome) {}
}

pub struct ToolExecutor;

impl ToolExecutor {
    /// Runs every call concurrently and returns outcomes in the same order
    /// `calls` was given in — required so the caller can zip them back
    /// against their originating `ToolCall` ids one-for-one. A call naming
    /// an unregistered tool never reaches a task; it's synthesized as an
    /// error immediately. Every other call is dispatched inside its own
    /// `tokio::spawn`, so a panicking `Tool::execute` never takes this
    /// executor (or a sibling call) down with it.
    pub async fn execute_calls(
        registry: &ToolRegistry,
        calls: &[(String, String, Value)],
        abort: &AbortSignal,
        observer: Arc<dyn ToolExecutionObserver>,
    ) -> Vec<(String, ToolOutcome)> {
        let futures = calls.iter().map(|(call_id, name, arguments)| {
            let tool = registry.get(name);
            run_one(
                tool,
                call_id.clone(),
                name.clone(),
                arguments.clone(),
                abort.child(),
                observer.clone(),
            )
        });
        futures::future::join_all(futures).await
    }
}

async fn run_one(
    tool: Option<Arc<dyn Tool>>,
    call_id: String,
    name: String,
    arguments: Value,
    abort: AbortSignal,
    observer: Arc<dyn ToolExecutionObserver>,
) -> (String, ToolOutcome) {
    observer.on_start(&call_id, &name, &arguments);

    let outcome = match tool {
        None => ToolOutcome::error(format!("Unknown tool: {name}")),
        Some(tool) => {
            let obs = observer.clone();
            let update_call_id = call_id.clone();
            let on_update: crate::registry::OnUpdate = Arc::new(move |update: ToolUpdate| {
                obs.on_update(&update_call_id, &update);
            });

            let task_call_id = call_id.clone();
            let join = tokio::spawn(async move {
                tool.execute(&task_call_id, arguments, abort, on_update).await
            });

            match join.await {
                Ok(outcome) => outcome,
                Err(join_err) if join_err.is_cancelled() => ToolOutcome::error("aborted"),
                Err(join_err) => ToolOutcome::error(format!("tool crashed: {join_err}")),
            }
        }
    };

    observer.on_end(&call_id, &name, &outcome);
    (call_id, outcome)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(
            &self,
            _call_id: &str,
            arguments: Value,
            _abort: AbortSignal,
            _on_update: crate::registry::OnUpdate,
        ) -> ToolOutcome {
            ToolOutcome::text(arguments.to_string())
        }
    }

    struct PanicTool;

    #[async_trait]
    impl Tool for PanicTool {
        fn name(&self) -> &str {
            "panics"
        }
        fn description(&self) -> &str {
            "always panics"
        }
        fn parameters(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(
            &self,
            _call_id: &str,
            _arguments: Value,
            _abort: AbortSignal,
            _on_update: crate::registry::OnUpdate,
        ) -> ToolOutcome {
            panic!("boom");
        }
    }

    struct CooperativeTool;

    #[async_trait]
    impl Tool for CooperativeTool {
        fn name(&self) -> &str {
            "sleeper"
        }
        fn description(&self) -> &str {
            "polls abort every tick"
        }
        fn parameters(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(
            &self,
            _call_id: &str,
            _arguments: Value,
            abort: AbortSignal,
            _on_update: crate::registry::OnUpdate,
        ) -> ToolOutcome {
            loop {
                if abort.is_aborted() {
                    return ToolOutcome::error("aborted");
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        }
    }

    fn registry_with(tools: Vec<Box<dyn Fn(&mut ToolRegistry)>>) -> ToolRegistry {
        let mut r = ToolRegistry::new();
        for f in tools {
            f(&mut r);
        }
        r
    }

    #[tokio::test]
    async fn unknown_tool_synthesizes_error_without_dispatch() {
        let registry = ToolRegistry::new();
        let abort = AbortSignal::new();
        let calls = vec![("c1".to_string(), "missing".to_string(), Value::Null)];
        let results = ToolExecutor::execute_calls(&registry, &calls, &abort, Arc::new(NullObserver)).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_error());
        match &results[0].1 {
            ToolOutcome::Error { message } => assert!(message.contains("Unknown tool: missing")),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn results_preserve_original_call_order() {
        let registry = registry_with(vec![Box::new(|r| r.register(EchoTool))]);
        let abort = AbortSignal::new();
        let calls = vec![
            ("c1".to_string(), "echo".to_string(), serde_json::json!({"n": 1})),
            ("c2".to_string(), "echo".to_string(), serde_json::json!({"n": 2})),
            ("c3".to_string(), "echo".to_string(), serde_json::json!({"n": 3})),
        ];
        let results = ToolExecutor::execute_calls(&registry, &calls, &abort, Arc::new(NullObserver)).await;
        let ids: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
    }

    #[tokio::test]
    async fn panicking_tool_is_isolated_as_error_outcome() {
        let registry = registry_with(vec![Box::new(|r| r.register(PanicTool))]);
        let abort = AbortSignal::new();
        let calls = vec![("c1".to_string(), "panics".to_string(), Value::Null)];
        let results = ToolExecutor::execute_calls(&registry, &calls, &abort, Arc::new(NullObserver)).await;
        assert!(results[0].1.is_error());
    }

    #[tokio::test]
    async fn abort_is_observed_by_cooperative_tool() {
        let registry = registry_with(vec![Box::new(|r| r.register(CooperativeTool))]);
        let abort = AbortSignal::new();
        let calls = vec![("c1".to_string(), "sleeper".to_string(), Value::Null)];

        let abort_clone = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            abort_clone.abort();
        });

        let results = ToolExecutor::execute_calls(&registry, &calls, &abort, Arc::new(NullObserver)).await;
        match &results[0].1 {
            ToolOutcome::Error { message } => assert_eq!(message, "aborted"),
            _ => panic!("expected aborted error outcome"),
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        starts: Mutex<Vec<String>>,
        ends: Mutex<Vec<String>>,
    }

    impl ToolExecutionObserver for RecordingObserver {
        fn on_start(&self, call_id: &str, _name: &str, _arguments: &Value) {
            self.starts.try_lock().unwrap().push(call_id.to_string());
        }
        fn on_update(&self, _call_id: &str, _update: &ToolUpdate) {}
        fn on_end(&self, call_id: &str, _name: &str, _outcome: &ToolOutcome) {
            self.ends.try_lock().unwrap().push(call_id.to_string());
        }
    }

    #[tokio::test]
    async fn observer_sees_start_and_end_for_every_call() {
        let registry = registry_with(vec![Box::new(|r| r.register(EchoTool))]);
        let abort = AbortSignal::new();
        let calls = vec![("c1".to_string(), "echo".to_string(), Value::Null)];
        let observer = Arc::new(RecordingObserver::default());
        let _ = ToolExecutor::execute_calls(&registry, &calls, &abort, observer.clone()).await;
        assert_eq!(*observer.starts.lock().await, vec!["c1".to_string()]);
        assert_eq!(*observer.ends.lock().await, vec!["c1".to_string()]);
    }
}
