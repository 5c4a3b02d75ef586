//! Logger configuration and structured output formatting.
//!
//! Structured, column-aligned log output shared by the gateway, worker, and
//! vault binaries. Each line carries a timestamp, the level, the source
//! file:line, and the message:
//!
//! ```text
//! Jul 28 26 02:30:45 PM | [INFO ]  | supervisor.rs:142    | worker 1 ready (pid 4312)
//! Jul 28 26 02:30:45 PM | [ERROR]  | bridge.rs:96         | worker 1 channel lost
//! ```
//!
//! Colors are applied per level and suppressed when `NO_COLOR` is set.
//! `RUST_LOG` selects the filter as usual.

use chrono::Local;
use env_logger::Builder;
use std::env;
use std::io::Write;

/// Visible width of the `[LEVEL]` column including padding.
const LEVEL_FIELD_WIDTH: usize = 8;

/// Visible width of the `file:line` column including padding.
const FILE_LINE_FIELD_WIDTH: usize = 22;

/// Visible length of a string with ANSI color sequences stripped.
///
/// Needed for column alignment: the level field is colored, so its byte
/// length overstates its display width.
fn visible_len(s: &str) -> usize {
    let bytes = s.as_bytes();
    let mut visible = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == 0x1b {
            i += 1;
            if i < bytes.len() && bytes[i] == b'[' {
                i += 1;
            }
            while i < bytes.len() {
                let b = bytes[i];
                i += 1;
                if b == b'm' {
                    break;
                }
            }
        } else {
            // Advance one UTF-8 code point, count one visible character.
            let first = bytes[i];
            let width = if first < 0x80 {
                1
            } else if first >> 5 == 0b110 {
                2
            } else if first >> 4 == 0b1110 {
                3
            } else if first >> 3 == 0b11110 {
                4
            } else {
                1
            };
            visible += 1;
            i += width;
        }
    }
    visible
}

/// Configure and initialize the process-wide logger.
///
/// Call once at binary startup, before any other subsystem logs. The `name`
/// is prefixed to every line so interleaved gateway/worker/vault output in a
/// shared terminal stays attributable.
pub fn configure_logger(name: &'static str) {
    let no_color = env::var("NO_COLOR").is_ok();

    Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(move |buf, record| {
            let level = record.level();
            let level_plain = level.to_string();

            let (prefix, colored_level, suffix) = if no_color {
                ("".to_string(), level_plain.clone(), "".to_string())
            } else {
                let prefix = "\x1b[1m".to_string();
                let colored = match level {
                    log::Level::Error => format!("\x1b[31m{}\x1b[39m", level_plain),
                    log::Level::Warn => format!("\x1b[33m{}\x1b[39m", level_plain),
                    log::Level::Info => format!("\x1b[32m{}\x1b[39m", level_plain),
                    log::Level::Debug => format!("\x1b[34m{}\x1b[39m", level_plain),
                    log::Level::Trace => format!("\x1b[35m{}\x1b[39m", level_plain),
                };
                (prefix, colored, "\x1b[0m".to_string())
            };

            let level_display = format!("[{}]", colored_level);
            let level_vis = visible_len(&level_display);
            let level_padding = if level_vis >= LEVEL_FIELD_WIDTH {
                1
            } else {
                LEVEL_FIELD_WIDTH - level_vis
            };

            let file = record
                .file()
                .map(|f| f.rsplit('/').next().unwrap_or(f))
                .unwrap_or("unknown");
            let file_line = format!("{}:{}", file, record.line().unwrap_or(0));
            let file_line_vis = visible_len(&file_line);
            let file_line_padding = if file_line_vis >= FILE_LINE_FIELD_WIDTH {
                1
            } else {
                FILE_LINE_FIELD_WIDTH - file_line_vis
            };

            writeln!(
                buf,
                "{}{} {} | {}{}| {}{}| {}{}",
                prefix,
                Local::now().format("%b %d %y %I:%M:%S %p"),
                name,
                level_display,
                " ".repeat(level_padding),
                file_line,
                " ".repeat(file_line_padding),
                record.args(),
                suffix,
            )
        })
        .try_init()
        .ok();
}
