use std::sync::{Arc, Mutex, MutexGuard};

use connector_plugin::message::{MessageFormat, OutboundMessage};
use rhai::{Array, Dynamic, Engine, EvalAltResult, Scope};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::context::CapabilityContext;

/// Default Rhai operation cap. A script that exhausts it aborts with an
/// evaluation error, so a hot loop cannot pin a blocking-pool thread
/// past the turn timeout.
pub const DEFAULT_MAX_SCRIPT_OPS: u64 = 5_000_000;

/// Distinguishes first arrival at a block (`enter`, render the prompt)
/// from a user reply to that block's prompt (`message`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TurnEvent {
    Enter,
    Message,
}

impl TurnEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnEvent::Enter => "enter",
            TurnEvent::Message => "message",
        }
    }
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script evaluation failed: {0}")]
    Eval(String),
    #[error("script runtime fault: {0}")]
    Internal(String),
}

/// The effects of one block run. Queued messages are returned even when
/// the script failed partway, so everything queued before the failure
/// still gets delivered in order.
pub struct BlockOutcome {
    pub outbox: Vec<OutboundMessage>,
    pub jumped: bool,
    pub error: Option<ScriptError>,
}

/// Runs one block script inside a fresh interpreter whose only free
/// variables are `input_text`, `event` and the six capability
/// primitives. Blocking; the engine schedules it on the blocking pool.
pub fn run_block(
    script: &str,
    input_text: &str,
    event: TurnEvent,
    context: CapabilityContext,
    max_operations: u64,
) -> BlockOutcome {
    let shared = Arc::new(Mutex::new(context));

    let mut engine = Engine::new();
    engine.set_max_operations(max_operations);
    engine.on_print(|text| debug!(target: "block_script", "{text}"));
    engine.on_debug(|text, _source, position| debug!(target: "block_script", %position, "{text}"));
    register_capabilities(&mut engine, &shared);

    let mut scope = Scope::new();
    scope.push_constant("input_text", input_text.to_string());
    scope.push_constant("event", event.as_str().to_string());

    let run = engine.run_with_scope(&mut scope, script);
    drop(scope);
    drop(engine);

    match Arc::try_unwrap(shared) {
        Ok(mutex) => {
            let context = mutex.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
            let (outbox, jumped) = context.into_effects();
            BlockOutcome {
                outbox,
                jumped,
                error: run.err().map(|err| ScriptError::Eval(err.to_string())),
            }
        }
        Err(_) => BlockOutcome {
            outbox: Vec::new(),
            jumped: false,
            error: Some(ScriptError::Internal(
                "capability context still shared after run".to_string(),
            )),
        },
    }
}

/// Interpreter used for plugin sources. No capability table: plugins
/// are pure functions over their arguments.
pub(crate) fn plugin_engine() -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(DEFAULT_MAX_SCRIPT_OPS);
    engine.on_print(|text| debug!(target: "plugin", "{text}"));
    engine
}

fn register_capabilities(engine: &mut Engine, shared: &Arc<Mutex<CapabilityContext>>) {
    let ctx = shared.clone();
    engine.register_fn("get_param", move |key: &str| -> Result<Dynamic, Box<EvalAltResult>> {
        let value = lock(&ctx)?.get_param(key).map_err(into_script_err)?;
        Ok(match value {
            Some(value) => value.into(),
            None => Dynamic::UNIT,
        })
    });

    let ctx = shared.clone();
    engine.register_fn(
        "set_param",
        move |key: &str, value: Dynamic| -> Result<(), Box<EvalAltResult>> {
            lock(&ctx)?.set_param(key, &value.to_string()).map_err(into_script_err)
        },
    );

    // send_message(text [, buttons [, format [, request_contact]]])
    let ctx = shared.clone();
    engine.register_fn("send_message", move |text: &str| -> Result<(), Box<EvalAltResult>> {
        lock(&ctx)?.queue_message(OutboundMessage::text(text));
        Ok(())
    });
    let ctx = shared.clone();
    engine.register_fn(
        "send_message",
        move |text: &str, buttons: Array| -> Result<(), Box<EvalAltResult>> {
            lock(&ctx)?.queue_message(OutboundMessage::text(text).with_buttons(button_labels(buttons)));
            Ok(())
        },
    );
    let ctx = shared.clone();
    engine.register_fn(
        "send_message",
        move |text: &str, _buttons: ()| -> Result<(), Box<EvalAltResult>> {
            lock(&ctx)?.queue_message(OutboundMessage::text(text));
            Ok(())
        },
    );
    let ctx = shared.clone();
    engine.register_fn(
        "send_message",
        move |text: &str, buttons: Array, format: &str| -> Result<(), Box<EvalAltResult>> {
            lock(&ctx)?.queue_message(
                OutboundMessage::text(text)
                    .with_buttons(button_labels(buttons))
                    .with_format(MessageFormat::from_name(format)),
            );
            Ok(())
        },
    );
    let ctx = shared.clone();
    engine.register_fn(
        "send_message",
        move |text: &str,
              buttons: Array,
              format: &str,
              request_contact: bool|
              -> Result<(), Box<EvalAltResult>> {
            lock(&ctx)?.queue_message(
                OutboundMessage::text(text)
                    .with_buttons(button_labels(buttons))
                    .with_format(MessageFormat::from_name(format))
                    .with_request_contact(request_contact),
            );
            Ok(())
        },
    );

    let ctx = shared.clone();
    engine.register_fn("go_to", move |block_id: i64| -> Result<(), Box<EvalAltResult>> {
        lock(&ctx)?.go_to(block_id).map_err(into_script_err)
    });

    let ctx = shared.clone();
    engine.register_fn("start_module", move |name: &str| -> Result<(), Box<EvalAltResult>> {
        lock(&ctx)?.start_module(name).map_err(into_script_err)
    });

    // call_module(name, function [, up to four arguments])
    let ctx = shared.clone();
    engine.register_fn(
        "call_module",
        move |name: &str, function: &str| -> Result<Dynamic, Box<EvalAltResult>> {
            lock(&ctx)?.call_module(name, function, Vec::new()).map_err(into_script_err)
        },
    );
    let ctx = shared.clone();
    engine.register_fn(
        "call_module",
        move |name: &str, function: &str, a1: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
            lock(&ctx)?.call_module(name, function, vec![a1]).map_err(into_script_err)
        },
    );
    let ctx = shared.clone();
    engine.register_fn(
        "call_module",
        move |name: &str, function: &str, a1: Dynamic, a2: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
            lock(&ctx)?
                .call_module(name, function, vec![a1, a2])
                .map_err(into_script_err)
        },
    );
    let ctx = shared.clone();
    engine.register_fn(
        "call_module",
        move |name: &str,
              function: &str,
              a1: Dynamic,
              a2: Dynamic,
              a3: Dynamic|
              -> Result<Dynamic, Box<EvalAltResult>> {
            lock(&ctx)?
                .call_module(name, function, vec![a1, a2, a3])
                .map_err(into_script_err)
        },
    );
    let ctx = shared.clone();
    engine.register_fn(
        "call_module",
        move |name: &str,
              function: &str,
              a1: Dynamic,
              a2: Dynamic,
              a3: Dynamic,
              a4: Dynamic|
              -> Result<Dynamic, Box<EvalAltResult>> {
            lock(&ctx)?
                .call_module(name, function, vec![a1, a2, a3, a4])
                .map_err(into_script_err)
        },
    );
}

fn button_labels(buttons: Array) -> Vec<String> {
    buttons.into_iter().map(|button| button.to_string()).collect()
}

fn lock<'a>(
    ctx: &'a Arc<Mutex<CapabilityContext>>,
) -> Result<MutexGuard<'a, CapabilityContext>, Box<EvalAltResult>> {
    ctx.lock().map_err(|_| "capability context poisoned".into())
}

fn into_script_err(err: impl std::fmt::Display) -> Box<EvalAltResult> {
    err.to_string().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModuleRecord, UserSession};
    use crate::modules::ModuleManager;
    use crate::storage::{MemoryStorage, Storage};
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn context_with_session() -> (CapabilityContext, Arc<MemoryStorage>) {
        let storage = MemoryStorage::new();
        storage.create_session(UserSession::new("u1", "test", 1)).unwrap();
        let modules = ModuleManager::new(storage.clone(), "/nonexistent");
        let context = CapabilityContext::new("u1", "test", storage.clone(), modules);
        (context, storage)
    }

    fn run(script: &str, input_text: &str, event: TurnEvent) -> (BlockOutcome, Arc<MemoryStorage>) {
        let (context, storage) = context_with_session();
        let outcome = run_block(script, input_text, event, context, DEFAULT_MAX_SCRIPT_OPS);
        (outcome, storage)
    }

    #[test]
    fn test_params_round_trip_through_script() {
        let script = r#"
            set_param("name", input_text);
            send_message("Hi " + get_param("name"));
        "#;
        let (outcome, storage) = run(script, "Alice", TurnEvent::Message);

        assert!(outcome.error.is_none());
        assert_eq!(storage.get_param("u1", "test", "name").unwrap().as_deref(), Some("Alice"));
        assert_eq!(outcome.outbox.len(), 1);
        assert_eq!(outcome.outbox[0].text, "Hi Alice");
    }

    #[test]
    fn test_missing_param_is_unit() {
        let script = r#"
            if get_param("missing") == () {
                send_message("absent");
            }
        "#;
        let (outcome, _storage) = run(script, "", TurnEvent::Message);

        assert!(outcome.error.is_none());
        assert_eq!(outcome.outbox[0].text, "absent");
    }

    #[test]
    fn test_set_param_stringifies_values() {
        let script = r#"set_param("answer", 41 + 1);"#;
        let (outcome, storage) = run(script, "", TurnEvent::Message);

        assert!(outcome.error.is_none());
        assert_eq!(storage.get_param("u1", "test", "answer").unwrap().as_deref(), Some("42"));
    }

    #[test]
    fn test_event_and_input_text_in_scope() {
        let script = r#"
            if event == "enter" {
                send_message("prompt");
            } else {
                send_message("reply to " + input_text);
            }
        "#;

        let (entered, _) = run(script, "", TurnEvent::Enter);
        assert_eq!(entered.outbox[0].text, "prompt");

        let (replied, _) = run(script, "hello", TurnEvent::Message);
        assert_eq!(replied.outbox[0].text, "reply to hello");
    }

    #[test]
    fn test_send_message_argument_forms() {
        let script = r#"
            send_message("plain");
            send_message("menu", ["A", "B"]);
            send_message("fancy", [], "markdown");
            send_message("phone", [], "text", true);
        "#;
        let (outcome, _storage) = run(script, "", TurnEvent::Enter);

        assert!(outcome.error.is_none());
        let outbox = &outcome.outbox;
        assert_eq!(outbox.len(), 4);
        assert_eq!(outbox[0].buttons, None);
        assert_eq!(outbox[1].buttons, Some(vec!["A".to_string(), "B".to_string()]));
        assert_eq!(outbox[2].format, MessageFormat::Markdown);
        assert!(outbox[3].request_contact);
    }

    #[test]
    fn test_go_to_does_not_stop_execution() {
        let script = r#"
            go_to(2);
            set_param("after_jump", "ran");
        "#;
        let (outcome, storage) = run(script, "", TurnEvent::Message);

        assert!(outcome.error.is_none());
        assert!(outcome.jumped);
        assert_eq!(storage.find_session("u1", "test").unwrap().unwrap().current_block_id, 2);
        assert_eq!(
            storage.get_param("u1", "test", "after_jump").unwrap().as_deref(),
            Some("ran")
        );
    }

    #[test]
    fn test_queued_messages_survive_a_failure() {
        let script = r#"
            send_message("one");
            send_message("two");
            this_function_does_not_exist();
        "#;
        let (outcome, _storage) = run(script, "", TurnEvent::Message);

        assert!(matches!(outcome.error, Some(ScriptError::Eval(_))));
        assert_eq!(outcome.outbox.len(), 2);
        assert_eq!(outcome.outbox[0].text, "one");
        assert_eq!(outcome.outbox[1].text, "two");
    }

    #[test]
    fn test_operation_cap_stops_hot_loops() {
        let script = r#"
            let x = 0;
            while true {
                x += 1;
            }
        "#;
        let (context, _storage) = context_with_session();
        let outcome = run_block(script, "", TurnEvent::Message, context, 10_000);

        assert!(matches!(outcome.error, Some(ScriptError::Eval(_))));
    }

    #[test]
    fn test_call_module_from_script() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("calc.rhai"), "fn add(a, b) { a + b }").unwrap();

        let storage = MemoryStorage::new();
        storage.create_session(UserSession::new("u1", "test", 1)).unwrap();
        storage.insert_module(ModuleRecord::new("calc", "calc.rhai")).unwrap();
        let modules = ModuleManager::new(storage.clone(), dir.path());
        let context = CapabilityContext::new("u1", "test", storage.clone(), modules);

        let script = r#"
            let sum = call_module("calc", "add", 2, 3);
            set_param("sum", sum);
        "#;
        let outcome = run_block(script, "", TurnEvent::Message, context, DEFAULT_MAX_SCRIPT_OPS);

        assert!(outcome.error.is_none());
        assert_eq!(storage.get_param("u1", "test", "sum").unwrap().as_deref(), Some("5"));
    }

    #[test]
    fn test_call_module_missing_function_fails_the_run() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("calc.rhai"), "fn add(a, b) { a + b }").unwrap();

        let storage = MemoryStorage::new();
        storage.create_session(UserSession::new("u1", "test", 1)).unwrap();
        storage.insert_module(ModuleRecord::new("calc", "calc.rhai")).unwrap();
        let modules = ModuleManager::new(storage.clone(), dir.path());
        let context = CapabilityContext::new("u1", "test", storage, modules);

        let outcome = run_block(
            r#"call_module("calc", "subtract", 2, 3);"#,
            "",
            TurnEvent::Message,
            context,
            DEFAULT_MAX_SCRIPT_OPS,
        );

        let error = outcome.error.expect("missing function must fail");
        assert!(error.to_string().contains("no function"));
    }
}
