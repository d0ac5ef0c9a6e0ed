//! The administrative command channel (string in, string out).
//!
//! Services drive runtime actions by name: `TIMEOUT`, `REG`, `QUERY`,
//! `NAME`, `EXIT`, `KILL`, `LAUNCH`, `GETENV`, `SETENV`, `STARTTIME`,
//! `ABORT`, `MONITOR`, `STAT`, `LOGON`, `LOGOFF`, `SIGNAL`. Handle
//! arguments accept the `:hex` and `.name` address forms.

use std::sync::Arc;

use warren_core::{Handle, MessageKind};

use crate::context::ServiceContext;
use crate::node::{split_command, Node};
use crate::service_log;
use crate::timer::thread_time_micros;

/// Execute one command on behalf of `ctx`. `None` means "no result"
/// (both for unknown commands and commands without output).
pub(crate) fn execute(
    node: &Arc<Node>,
    ctx: &Arc<ServiceContext>,
    name: &str,
    param: &str,
) -> Option<String> {
    match name {
        "TIMEOUT" => cmd_timeout(node, ctx, param),
        "REG" => cmd_reg(node, ctx, param),
        "QUERY" => cmd_query(node, param),
        "NAME" => cmd_name(node, ctx, param),
        "EXIT" => {
            handle_exit(node, ctx, Handle::INVALID);
            None
        }
        "KILL" => {
            let target = to_handle(node, ctx, param);
            if target.is_valid() {
                handle_exit(node, ctx, target);
            }
            None
        }
        "LAUNCH" => cmd_launch(node, param),
        "GETENV" => node.env().get(param),
        "SETENV" => cmd_setenv(node, param),
        "STARTTIME" => Some(node.starttime().to_string()),
        "ABORT" => {
            node.retire_all();
            None
        }
        "MONITOR" => cmd_monitor(node, ctx, param),
        "STAT" => Some(cmd_stat(ctx, param)),
        "LOGON" => {
            with_target(node, ctx, param, |target| {
                service_log::open(node, ctx.handle(), &target)
            });
            None
        }
        "LOGOFF" => {
            with_target(node, ctx, param, |target| {
                service_log::close(node, ctx.handle(), &target)
            });
            None
        }
        "SIGNAL" => cmd_signal(node, ctx, param),
        _ => None,
    }
}

/// Resolve `:hex` / `.name` into a handle; invalid on anything else.
fn to_handle(node: &Node, ctx: &ServiceContext, param: &str) -> Handle {
    match param.as_bytes().first() {
        Some(b':') => u32::from_str_radix(&param[1..], 16)
            .map(Handle::from_raw)
            .unwrap_or(Handle::INVALID),
        Some(b'.') => node.find_name(&param[1..]).unwrap_or(Handle::INVALID),
        _ => {
            node.report(ctx.handle(), format!("Can't convert {} to handle", param));
            Handle::INVALID
        }
    }
}

fn with_target(
    node: &Arc<Node>,
    ctx: &Arc<ServiceContext>,
    param: &str,
    f: impl FnOnce(Arc<ServiceContext>),
) {
    let handle = to_handle(node, ctx, param);
    if !handle.is_valid() {
        return;
    }
    if let Some(target) = node.lookup(handle) {
        f(target);
    }
}

/// Retire `target` (or the calling service when invalid), notifying the
/// installed exit monitor first.
fn handle_exit(node: &Arc<Node>, ctx: &Arc<ServiceContext>, target: Handle) {
    let target = if target.is_valid() {
        node.report(ctx.handle(), format!("KILL {}", target));
        target
    } else {
        node.report(ctx.handle(), "KILL self");
        ctx.handle()
    };
    let watcher = node.monitor_exit();
    if watcher.is_valid() {
        let _ = node.send_message(target, watcher, MessageKind::Client, 0, warren_core::Payload::Empty);
    }
    node.retire(target);
}

fn cmd_timeout(node: &Arc<Node>, ctx: &Arc<ServiceContext>, param: &str) -> Option<String> {
    let ticks: i32 = param.trim().parse().unwrap_or(0);
    let session = ctx.new_session();
    node.timeout(ctx.handle(), ticks, session);
    Some(session.to_string())
}

fn cmd_reg(node: &Arc<Node>, ctx: &Arc<ServiceContext>, param: &str) -> Option<String> {
    if param.is_empty() {
        return Some(format!(":{:x}", ctx.handle().raw()));
    }
    if let Some(name) = param.strip_prefix('.') {
        if node.registry().bind_name(name, ctx.handle()) {
            return Some(name.to_string());
        }
        return None;
    }
    node.report(
        ctx.handle(),
        format!("Can't register global name {}", param),
    );
    None
}

fn cmd_query(node: &Arc<Node>, param: &str) -> Option<String> {
    let name = param.strip_prefix('.')?;
    node.find_name(name).map(|h| format!(":{:x}", h.raw()))
}

fn cmd_name(node: &Arc<Node>, ctx: &Arc<ServiceContext>, param: &str) -> Option<String> {
    let (name, handle_str) = split_command(param);
    let handle_hex = handle_str.strip_prefix(':')?;
    let handle = u32::from_str_radix(handle_hex, 16).ok().map(Handle::from_raw)?;
    if !handle.is_valid() {
        return None;
    }
    if let Some(name) = name.strip_prefix('.') {
        if node.registry().bind_name(name, handle) {
            return Some(name.to_string());
        }
        return None;
    }
    node.report(ctx.handle(), format!("Can't set global name {}", name));
    None
}

fn cmd_launch(node: &Arc<Node>, param: &str) -> Option<String> {
    let (module, args) = split_command(param);
    match node.launch(module, args) {
        Ok(handle) => Some(handle.to_string()),
        Err(_) => None,
    }
}

fn cmd_setenv(node: &Arc<Node>, param: &str) -> Option<String> {
    let (key, value) = split_command(param);
    if key.is_empty() || value.is_empty() {
        return None;
    }
    node.env().set(key, value);
    None
}

fn cmd_monitor(node: &Arc<Node>, ctx: &Arc<ServiceContext>, param: &str) -> Option<String> {
    if param.is_empty() {
        let current = node.monitor_exit();
        if current.is_valid() {
            return Some(format!(":{:x}", current.raw()));
        }
        return None;
    }
    let handle = to_handle(node, ctx, param);
    node.set_monitor_exit(handle);
    None
}

fn cmd_stat(ctx: &Arc<ServiceContext>, param: &str) -> String {
    match param {
        "mqlen" => ctx.queue().len().to_string(),
        "endless" => {
            if ctx.take_endless() {
                "1".to_string()
            } else {
                "0".to_string()
            }
        }
        "cpu" => {
            let seconds = ctx.cpu_cost_micros() as f64 / 1_000_000.0;
            format!("{:.6}", seconds)
        }
        "time" => {
            if ctx.profiling() {
                let micros = thread_time_micros().saturating_sub(ctx.cpu_start());
                format!("{:.6}", micros as f64 / 1_000_000.0)
            } else {
                "0".to_string()
            }
        }
        "message" => ctx.message_count().to_string(),
        "overload" => ctx.take_overload().to_string(),
        _ => String::new(),
    }
}

fn cmd_signal(node: &Arc<Node>, ctx: &Arc<ServiceContext>, param: &str) -> Option<String> {
    let (target, sig) = split_command(param);
    let handle = to_handle(node, ctx, target);
    if !handle.is_valid() {
        return None;
    }
    let sig: i32 = sig.trim().parse().unwrap_or(0);
    if let Some(target) = node.lookup(handle) {
        // Runs without taking the instance lock; see Service::signal_hook.
        target.signal(sig);
    }
    None
}
