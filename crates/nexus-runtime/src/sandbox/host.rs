//! Host bridge installed into every sandbox context.
//!
//! The bridge functions are the only way script code can affect the outside
//! world. Each one fetches the per-execution environment from context
//! userdata, checks the required capability, and either records the effect or
//! reports a structured failure that the bootstrap turns into a script
//! exception. A denied call never touches the accumulator.

use std::{cell::RefCell, collections::BTreeMap, rc::Rc, sync::mpsc};

use anyhow::{Context as _, anyhow};
use rquickjs::{
    Array, CatchResultExt, Ctx, Exception, Function, JsLifetime, Object, Value, prelude::Opt,
};
use tokio::sync::mpsc::UnboundedSender;

use super::{ExecEvent, SCRIPT_LOG_TARGET, convert, mint_suspension_id};
use crate::{
    capability::{CapabilitySet, CapabilityToken, Domain},
    error::ErrorCode,
    exec::{
        AsyncResult, DeclaredType, EmittedEvent, ExtensionRegistry, LogEntry, LogLevel,
        StateMutation, Suspension, ViewCommand,
    },
    value::RuntimeValue,
};

const BOOTSTRAP: &str = include_str!("bootstrap.js");

/// Effects accumulated by host calls, in call order.
#[derive(Clone, Debug, Default)]
pub(crate) struct Effects {
    pub state_mutations: Vec<StateMutation>,
    pub emitted_events: Vec<EmittedEvent>,
    pub view_commands: Vec<ViewCommand>,
    pub logs: Vec<LogEntry>,
}

/// Per-execution environment seeded by the instance thread before each run.
#[derive(Default)]
pub(crate) struct ExecutionEnv {
    pub snapshot: BTreeMap<String, RuntimeValue>,
    pub state_types: BTreeMap<String, DeclaredType>,
    pub capabilities: CapabilitySet,
    pub registry: ExtensionRegistry,
    pub effects: Effects,
    pub host_call_count: u64,
    pub panel_id: String,
    pub events: Option<UnboundedSender<ExecEvent>>,
    pub resume: Option<mpsc::Receiver<AsyncResult>>,
}

/// Context userdata giving host functions access to the execution state.
#[derive(Clone, Default, JsLifetime)]
pub(crate) struct HostBridge {
    env: Rc<RefCell<ExecutionEnv>>,
}

impl HostBridge {
    pub(crate) fn seed(&self, env: ExecutionEnv) {
        *self.env.borrow_mut() = env;
    }

    /// Detach channels and take the accumulated effects after a run.
    pub(crate) fn drain(&self) -> (Effects, u64) {
        let mut env = self.env.borrow_mut();
        env.events = None;
        env.resume = None;
        (std::mem::take(&mut env.effects), env.host_call_count)
    }
}

/// Register the bridge functions and evaluate the bootstrap script.
pub(crate) fn install(ctx: &Ctx<'_>, bridge: &HostBridge) -> anyhow::Result<()> {
    if ctx.store_userdata(bridge.clone()).is_err() {
        return Err(anyhow!("failed to store host bridge userdata"));
    }

    let globals = ctx.globals();
    macro_rules! register {
        ($name:literal, $func:expr) => {
            globals
                .set(
                    $name,
                    Function::new(ctx.clone(), $func)
                        .and_then(|f| f.with_name($name))
                        .map_err(|e| anyhow!("failed to bind {}: {e}", $name))?,
                )
                .map_err(|e| anyhow!("failed to install {}: {e}", $name))?;
        };
    }

    register!("__nx_state_get", js_state_get);
    register!("__nx_state_set", js_state_set);
    register!("__nx_state_delete", js_state_delete);
    register!("__nx_state_has", js_state_has);
    register!("__nx_state_keys", js_state_keys);
    register!("__nx_emit", js_emit);
    register!("__nx_view_update", js_view_update);
    register!("__nx_ext_call", js_ext_call);
    register!("__nx_log", js_log);

    ctx.eval::<(), _>(BOOTSTRAP)
        .catch(ctx)
        .map_err(|e| anyhow!("bootstrap failed: {e}"))
        .context("installing host bridge")?;
    Ok(())
}

fn bridge<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<HostBridge> {
    ctx.userdata::<HostBridge>()
        .map(|b| HostBridge::clone(&b))
        .ok_or_else(|| Exception::throw_internal(ctx, "host bridge is not installed"))
}

fn ok_unit<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
    let reply = Object::new(ctx.clone())?;
    reply.set("ok", true)?;
    Ok(reply)
}

fn ok_value<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<Object<'js>> {
    let reply = ok_unit(ctx)?;
    reply.set("value", value)?;
    Ok(reply)
}

fn fail<'js>(ctx: &Ctx<'js>, code: &str, message: &str) -> rquickjs::Result<Object<'js>> {
    let reply = Object::new(ctx.clone())?;
    reply.set("ok", false)?;
    reply.set("code", code)?;
    reply.set("message", message)?;
    Ok(reply)
}

fn denied<'js>(
    ctx: &Ctx<'js>,
    panel_id: &str,
    required: &CapabilityToken,
    domain: Domain,
) -> rquickjs::Result<Object<'js>> {
    let required = required.to_string();
    metrics::counter!("nexus_capability_denied_total", "domain" => domain.as_str()).increment(1);
    tracing::debug!(%panel_id, %required, "capability denied");
    let reply = fail(
        ctx,
        ErrorCode::CapabilityDenied.as_str(),
        &format!("missing capability {required}"),
    )?;
    reply.set("required", required)?;
    Ok(reply)
}

fn js_state_get<'js>(ctx: Ctx<'js>, key: String) -> rquickjs::Result<Object<'js>> {
    let bridge = bridge(&ctx)?;
    let value = {
        let mut env = bridge.env.borrow_mut();
        if !env.capabilities.can_read_state(&key) {
            let panel_id = env.panel_id.clone();
            drop(env);
            return denied(
                &ctx,
                &panel_id,
                &CapabilityToken::state_read(key),
                Domain::State,
            );
        }
        env.host_call_count += 1;
        env.snapshot.get(&key).cloned().unwrap_or_default()
    };
    let value = convert::value_to_js(&ctx, &value)?;
    ok_value(&ctx, value)
}

fn js_state_set<'js>(ctx: Ctx<'js>, key: String, value: Value<'js>) -> rquickjs::Result<Object<'js>> {
    let bridge = bridge(&ctx)?;
    {
        let env = bridge.env.borrow();
        if !env.capabilities.can_write_state(&key) {
            let panel_id = env.panel_id.clone();
            drop(env);
            return denied(
                &ctx,
                &panel_id,
                &CapabilityToken::state_write(key),
                Domain::State,
            );
        }
    }
    // Conversion may run script getters that re-enter the bridge, so it
    // happens outside any borrow of the environment.
    let value = match convert::js_to_value(&value) {
        Ok(value) => value,
        Err(e) => {
            return fail(
                &ctx,
                ErrorCode::TypeMismatch.as_str(),
                &format!("state value for {key:?} has no boundary representation: {e}"),
            );
        }
    };
    let mut env = bridge.env.borrow_mut();
    if let Some(declared) = env.state_types.get(&key)
        && !declared.accepts(&value)
    {
        let message = format!(
            "state key {key:?} expects {}, got {}",
            declared.as_str(),
            value.type_name()
        );
        drop(env);
        return fail(&ctx, ErrorCode::TypeMismatch.as_str(), &message);
    }
    env.host_call_count += 1;
    env.effects.state_mutations.push(StateMutation::Set {
        key: key.clone(),
        value: value.clone(),
    });
    env.snapshot.insert(key, value);
    drop(env);
    ok_unit(&ctx)
}

fn js_state_delete<'js>(ctx: Ctx<'js>, key: String) -> rquickjs::Result<Object<'js>> {
    let bridge = bridge(&ctx)?;
    let mut env = bridge.env.borrow_mut();
    if !env.capabilities.can_write_state(&key) {
        let panel_id = env.panel_id.clone();
        drop(env);
        return denied(
            &ctx,
            &panel_id,
            &CapabilityToken::state_write(key),
            Domain::State,
        );
    }
    env.host_call_count += 1;
    env.effects
        .state_mutations
        .push(StateMutation::Delete { key: key.clone() });
    env.snapshot.remove(&key);
    drop(env);
    ok_unit(&ctx)
}

fn js_state_has<'js>(ctx: Ctx<'js>, key: String) -> rquickjs::Result<Object<'js>> {
    let bridge = bridge(&ctx)?;
    let present = {
        let mut env = bridge.env.borrow_mut();
        if !env.capabilities.can_read_state(&key) {
            let panel_id = env.panel_id.clone();
            drop(env);
            return denied(
                &ctx,
                &panel_id,
                &CapabilityToken::state_read(key),
                Domain::State,
            );
        }
        env.host_call_count += 1;
        env.snapshot.contains_key(&key)
    };
    ok_value(&ctx, Value::new_bool(ctx.clone(), present))
}

fn js_state_keys(ctx: Ctx<'_>) -> rquickjs::Result<Object<'_>> {
    let bridge = bridge(&ctx)?;
    let keys = {
        let mut env = bridge.env.borrow_mut();
        let required = CapabilityToken::StateRead(crate::capability::ScopeMatch::Any);
        if !env.capabilities.check(&required) {
            let panel_id = env.panel_id.clone();
            drop(env);
            return denied(&ctx, &panel_id, &required, Domain::State);
        }
        env.host_call_count += 1;
        env.snapshot.keys().cloned().collect::<Vec<_>>()
    };
    let array = Array::new(ctx.clone())?;
    for (i, key) in keys.into_iter().enumerate() {
        array.set(i, key)?;
    }
    ok_value(&ctx, array.into_value())
}

fn js_emit<'js>(ctx: Ctx<'js>, name: String, payload: Value<'js>) -> rquickjs::Result<Object<'js>> {
    let bridge = bridge(&ctx)?;
    {
        let env = bridge.env.borrow();
        if !env.capabilities.can_emit_event(&name) {
            let panel_id = env.panel_id.clone();
            drop(env);
            return denied(
                &ctx,
                &panel_id,
                &CapabilityToken::emit_event(name),
                Domain::Events,
            );
        }
    }
    let payload = match convert::js_to_value(&payload) {
        Ok(payload) => payload,
        Err(e) => {
            return fail(
                &ctx,
                ErrorCode::TypeMismatch.as_str(),
                &format!("event payload has no boundary representation: {e}"),
            );
        }
    };
    let mut env = bridge.env.borrow_mut();
    env.host_call_count += 1;
    env.effects.emitted_events.push(EmittedEvent { name, payload });
    drop(env);
    ok_unit(&ctx)
}

fn js_view_update<'js>(
    ctx: Ctx<'js>,
    target: String,
    command: String,
    args: Value<'js>,
) -> rquickjs::Result<Object<'js>> {
    let bridge = bridge(&ctx)?;
    {
        let env = bridge.env.borrow();
        if !env.capabilities.can_update_view(&target) {
            let panel_id = env.panel_id.clone();
            drop(env);
            return denied(
                &ctx,
                &panel_id,
                &CapabilityToken::update_view(target),
                Domain::View,
            );
        }
    }
    let args = match convert::js_to_value(&args) {
        Ok(args) => args,
        Err(e) => {
            return fail(
                &ctx,
                ErrorCode::TypeMismatch.as_str(),
                &format!("view arguments have no boundary representation: {e}"),
            );
        }
    };
    let mut env = bridge.env.borrow_mut();
    env.host_call_count += 1;
    env.effects.view_commands.push(ViewCommand {
        target,
        command,
        args,
    });
    drop(env);
    ok_unit(&ctx)
}

fn js_ext_call<'js>(
    ctx: Ctx<'js>,
    extension: String,
    method: String,
    args: Value<'js>,
) -> rquickjs::Result<Object<'js>> {
    let bridge = bridge(&ctx)?;

    {
        let env = bridge.env.borrow();
        if !env.capabilities.can_access_extension(&extension) {
            let panel_id = env.panel_id.clone();
            drop(env);
            return denied(
                &ctx,
                &panel_id,
                &CapabilityToken::extension(extension),
                Domain::Ext,
            );
        }
        if !env.registry.contains(&extension, &method) {
            let message = format!("extension method {extension}.{method} is not registered");
            drop(env);
            return fail(&ctx, ErrorCode::UnknownExtension.as_str(), &message);
        }
    }
    let args = match convert::js_to_value(&args) {
        Ok(args) => args,
        Err(e) => {
            return fail(
                &ctx,
                ErrorCode::TypeMismatch.as_str(),
                &format!("extension arguments have no boundary representation: {e}"),
            );
        }
    };

    let (event, events) = {
        let mut env = bridge.env.borrow_mut();
        env.host_call_count += 1;
        let suspension = Suspension {
            id: mint_suspension_id(),
            extension,
            method,
            args,
        };
        tracing::debug!(
            panel_id = %env.panel_id,
            suspension_id = %suspension.id,
            extension = %suspension.extension,
            method = %suspension.method,
            "handler suspended on extension call"
        );
        let event = ExecEvent::Suspended {
            suspension,
            effects: env.effects.clone(),
            host_call_count: env.host_call_count,
        };
        (event, env.events.clone())
    };

    let Some(events) = events else {
        return Err(Exception::throw_internal(&ctx, "suspension channel missing"));
    };
    if events.send(event).is_err() {
        return fail(
            &ctx,
            "suspension_dropped",
            "executor detached before suspension",
        );
    }

    // Park the instance thread without holding a borrow on the environment;
    // the executor owns the sending half and delivers the resume outcome.
    let receiver = bridge.env.borrow_mut().resume.take();
    let Some(receiver) = receiver else {
        return Err(Exception::throw_internal(&ctx, "resume channel missing"));
    };
    let outcome = receiver.recv();
    bridge.env.borrow_mut().resume = Some(receiver);

    match outcome {
        Ok(AsyncResult::Success(value)) => {
            let value = convert::value_to_js(&ctx, &value)?;
            ok_value(&ctx, value)
        }
        Ok(AsyncResult::Failure { message, code }) => fail(
            &ctx,
            code.as_deref().unwrap_or("extension_error"),
            &message,
        ),
        Err(_) => fail(
            &ctx,
            "suspension_dropped",
            "suspension expired before a resume arrived",
        ),
    }
}

fn js_log<'js>(
    ctx: Ctx<'js>,
    level: String,
    message: String,
    data: Opt<Value<'js>>,
) -> rquickjs::Result<Object<'js>> {
    let bridge = bridge(&ctx)?;
    let data = data
        .into_inner()
        .filter(|v| !v.is_undefined() && !v.is_null())
        .and_then(|v| convert::js_to_value(&v).ok());
    let level = LogLevel::parse(&level);
    let mut env = bridge.env.borrow_mut();
    env.host_call_count += 1;
    let panel_id = env.panel_id.clone();
    env.effects.logs.push(LogEntry {
        level,
        message: message.clone(),
        data,
    });
    drop(env);
    match level {
        LogLevel::Trace => {
            tracing::event!(target: SCRIPT_LOG_TARGET, tracing::Level::TRACE, %panel_id, log.message = %message);
        }
        LogLevel::Debug => {
            tracing::event!(target: SCRIPT_LOG_TARGET, tracing::Level::DEBUG, %panel_id, log.message = %message);
        }
        LogLevel::Info => {
            tracing::event!(target: SCRIPT_LOG_TARGET, tracing::Level::INFO, %panel_id, log.message = %message);
        }
        LogLevel::Warn => {
            tracing::event!(target: SCRIPT_LOG_TARGET, tracing::Level::WARN, %panel_id, log.message = %message);
        }
        LogLevel::Error => {
            tracing::event!(target: SCRIPT_LOG_TARGET, tracing::Level::ERROR, %panel_id, log.message = %message);
        }
    }
    ok_unit(&ctx)
}
