//! Per-service raw message traces (the `LOGON` / `LOGOFF` commands).
//!
//! When tracing is on for a service, every dispatched message is
//! appended to `{logpath}/{handle:08x}.log`: source, type tag, session,
//! tick timestamp and the payload rendered as hex (socket events get a
//! structured line instead).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::PoisonError;

use chrono::{Local, TimeZone};

use warren_core::{Handle, Message, Payload, SocketData};

use crate::context::ServiceContext;
use crate::node::Node;

/// Open the trace file for `handle` and attach it to `ctx`. Requires the
/// `logpath` environment key; a second LOGON while open is a no-op.
pub(crate) fn open(node: &Node, reporter: Handle, ctx: &ServiceContext) {
    let Some(logpath) = node.env().get("logpath") else {
        return;
    };
    let handle = ctx.handle();
    let path = format!("{}/{:08x}.log", logpath, handle.raw());
    let mut slot = ctx
        .logfile()
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if slot.is_some() {
        return;
    }
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(mut file) => {
            let now = node.now();
            let wall = i64::from(node.starttime()) + (now / 100) as i64;
            let stamp = Local
                .timestamp_opt(wall, 0)
                .single()
                .map(|t| t.to_rfc2822())
                .unwrap_or_default();
            let _ = writeln!(file, "open time: {} {}", now, stamp);
            let _ = file.flush();
            node.report(reporter, format!("Open log file {}", path));
            *slot = Some(file);
        }
        Err(_) => {
            node.report(reporter, format!("Open log file {} fail", path));
        }
    }
}

/// Detach and finalize the trace file, if one is open.
pub(crate) fn close(node: &Node, reporter: Handle, ctx: &ServiceContext) {
    let mut slot = ctx
        .logfile()
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some(mut file) = slot.take() {
        node.report(reporter, format!("Close log file {}", ctx.handle()));
        let _ = writeln!(file, "close time: {}", node.now());
    }
}

fn write_hex(file: &mut File, bytes: &[u8]) {
    let mut line = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        line.push_str(&format!("{:02x}", b));
    }
    let _ = file.write_all(line.as_bytes());
}

/// Append one dispatched message to the trace.
pub(crate) fn output(file: &mut File, message: &Message, now: u64) {
    match &message.payload {
        Payload::Socket(sm) => {
            let _ = write!(file, "[socket] {} {} {} ", sm.kind as u8, sm.id, sm.ud);
            match &sm.data {
                SocketData::Bytes(bytes) => write_hex(file, bytes),
                SocketData::Info(text) => {
                    let _ = write!(file, "[{}]", text);
                }
                SocketData::None => {}
            }
            let _ = writeln!(file);
        }
        payload => {
            let _ = write!(
                file,
                "{} {} {} {} ",
                message.source,
                message.kind.tag(),
                message.session,
                now
            );
            if let Some(bytes) = payload.as_bytes() {
                write_hex(file, bytes);
            }
            let _ = writeln!(file);
        }
    }
    let _ = file.flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use warren_core::MessageKind;

    #[test]
    fn output_renders_payload_as_hex() {
        let dir = std::env::temp_dir().join("warren-service-log-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("trace.log");
        let mut file = File::create(&path).unwrap();
        let message = Message {
            source: Handle::from_raw(0x0100_0001),
            session: 5,
            kind: MessageKind::Client,
            payload: Payload::from(vec![0xde, 0xad]),
        };
        output(&mut file, &message, 42);
        let mut text = String::new();
        File::open(&path).unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, ":01000001 3 5 42 dead\n");
        std::fs::remove_file(&path).ok();
    }
}
