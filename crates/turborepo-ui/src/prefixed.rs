use std::{fmt::Display, io::Write};

use console::{Style, StyledObject};

use crate::ColorConfig;

/// Wraps a pair of writers with prefixes for normal output, warnings and
/// errors. This is the interface cache status lines and task banners go
/// through.
pub struct PrefixedUI<W> {
    color_config: ColorConfig,
    output_prefix: Option<StyledObject<String>>,
    warn_prefix: Option<StyledObject<String>>,
    error_prefix: Option<StyledObject<String>>,
    out: W,
    err: W,
}

impl<W: Write> PrefixedUI<W> {
    pub fn new(color_config: ColorConfig, out: W, err: W) -> Self {
        Self {
            color_config,
            out,
            err,
            output_prefix: None,
            warn_prefix: None,
            error_prefix: None,
        }
    }

    pub fn with_output_prefix(mut self, output_prefix: StyledObject<String>) -> Self {
        self.output_prefix = Some(output_prefix);
        self
    }

    pub fn with_warn_prefix(mut self, warn_prefix: StyledObject<String>) -> Self {
        self.warn_prefix = Some(warn_prefix);
        self
    }

    pub fn with_error_prefix(mut self, error_prefix: StyledObject<String>) -> Self {
        self.error_prefix = Some(error_prefix);
        self
    }

    pub fn output(&mut self, message: impl Display) {
        self.write_line(message, Command::Output)
    }

    pub fn warn(&mut self, message: impl Display) {
        self.write_line(message, Command::Warn)
    }

    pub fn error(&mut self, message: impl Display) {
        self.write_line(message, Command::Error)
    }

    fn write_line(&mut self, message: impl Display, command: Command) {
        let prefix = match command {
            Command::Output => &self.output_prefix,
            Command::Warn => &self.warn_prefix,
            Command::Error => &self.error_prefix,
        }
        .as_ref()
        .map(|prefix| self.color_config.apply(prefix.clone()))
        .unwrap_or_default();
        let writer = match command {
            Command::Output => &mut self.out,
            Command::Warn | Command::Error => &mut self.err,
        };

        // There's no good way to surface a write failure to the user at
        // this point; the write target is the terminal itself.
        let _ = writeln!(writer, "{prefix}{message}");
    }

    /// A writer that applies this UI's output prefix to every line, used
    /// to stream child process output and replayed logs.
    pub fn output_prefixed_writer(&mut self) -> PrefixedWriter<&mut W> {
        PrefixedWriter {
            prefix: self
                .output_prefix
                .as_ref()
                .map(|prefix| self.color_config.apply(prefix.clone()))
                .unwrap_or_default(),
            writer: &mut self.out,
            buffer: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Command {
    Output,
    Warn,
    Error,
}

/// A writer that prepends a prefix to each line written through it.
/// Bytes are buffered until a newline so a prefix never lands mid-line.
pub struct PrefixedWriter<W> {
    prefix: String,
    writer: W,
    buffer: Vec<u8>,
}

impl<W: Write> PrefixedWriter<W> {
    pub fn new(color_config: ColorConfig, prefix: StyledObject<impl Display>, writer: W) -> Self {
        let prefix = color_config.apply(Style::new().apply_to(prefix.to_string()));
        Self {
            prefix,
            writer,
            buffer: Vec::new(),
        }
    }
}

impl<W: Write> Write for PrefixedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for &byte in buf {
            self.buffer.push(byte);
            if byte == b'\n' {
                self.writer.write_all(self.prefix.as_bytes())?;
                self.writer.write_all(&self.buffer)?;
                self.buffer.clear();
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.buffer.is_empty() {
            self.writer.write_all(self.prefix.as_bytes())?;
            self.writer.write_all(&self.buffer)?;
            self.buffer.clear();
        }
        self.writer.flush()
    }
}
