//! The built-in logger service.
//!
//! Receives `Text` messages from the whole node and writes one
//! `[:xxxxxxxx] line` record per message to stdout or a file. The
//! `System` message (sent on SIGHUP) reopens the file so external log
//! rotation works. Binds the global name `logger` during init.

use std::fs::{File, OpenOptions};
use std::io::Write;

use warren_core::{Message, MessageKind};

use crate::module::{Module, Service, ServiceError};
use crate::scope::ServiceScope;

/// Factory for the logger service; install under the configured
/// `logservice` name (default `"logger"`).
pub struct LoggerModule;

impl Module for LoggerModule {
    fn create(&self) -> Box<dyn Service> {
        Box::new(Logger { sink: Sink::Stdout })
    }
}

enum Sink {
    Stdout,
    File { file: File, path: String },
}

struct Logger {
    sink: Sink,
}

impl Logger {
    fn write_line(&mut self, source: warren_core::Handle, line: &[u8]) {
        match &mut self.sink {
            Sink::Stdout => {
                let out = std::io::stdout();
                let mut out = out.lock();
                let _ = write!(out, "[{}] ", source);
                let _ = out.write_all(line);
                let _ = writeln!(out);
            }
            Sink::File { file, .. } => {
                let _ = write!(file, "[{}] ", source);
                let _ = file.write_all(line);
                let _ = writeln!(file);
                let _ = file.flush();
            }
        }
    }

    fn reopen(&mut self) {
        if let Sink::File { file, path } = &mut self.sink {
            if let Ok(reopened) = OpenOptions::new().create(true).append(true).open(&*path) {
                *file = reopened;
            }
        }
    }
}

impl Service for Logger {
    fn init(&mut self, scope: &ServiceScope<'_>, args: &str) -> Result<(), ServiceError> {
        if !args.is_empty() {
            let file = File::create(args)
                .map_err(|e| ServiceError::new(format!("can't open log file {}: {}", args, e)))?;
            self.sink = Sink::File {
                file,
                path: args.to_string(),
            };
        }
        scope.command("REG", ".logger");
        Ok(())
    }

    fn dispatch(&mut self, _scope: &ServiceScope<'_>, message: Message) {
        match message.kind {
            MessageKind::System => self.reopen(),
            MessageKind::Text => {
                if let Some(bytes) = message.payload.as_bytes() {
                    self.write_line(message.source, bytes);
                } else {
                    self.write_line(message.source, b"");
                }
            }
            _ => {}
        }
    }
}
