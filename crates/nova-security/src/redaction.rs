use std::io::{self, Write};

use tracing_subscriber::fmt::MakeWriter;

/// Wraps any [`MakeWriter`] so every formatted log record is scrubbed with
/// [`redact_secrets`] before it reaches the sink.
#[derive(Debug, Clone)]
pub struct RedactingWriter<M> {
    make: M,
}

impl<M> RedactingWriter<M> {
    pub fn new(make: M) -> Self {
        Self { make }
    }
}

impl RedactingWriter<fn() -> io::Stderr> {
    pub fn stderr() -> Self {
        Self::new(io::stderr)
    }
}

impl<'a, M: MakeWriter<'a>> MakeWriter<'a> for RedactingWriter<M> {
    type Writer = Redacted<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        Redacted {
            inner: self.make.make_writer(),
        }
    }
}

/// One log record's writer. Records arrive whole, so a secret is never
/// split across two `write` calls.
pub struct Redacted<W> {
    inner: W,
}

impl<W: Write> Write for Redacted<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let line = String::from_utf8_lossy(buf);
        self.inner.write_all(redact_secrets(&line).as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Replace known credential shapes with `[REDACTED]`.
///
/// Applied to log lines and to transcript text before it is persisted.
pub fn redact_secrets(input: &str) -> String {
    static PATTERNS: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
        regex::Regex::new(
            r"(?x)
              sk-ant-api\S{10,}                 # Anthropic API keys
            | sk-[A-Za-z0-9_\-]{20,}            # OpenAI-style keys
            | sbp_[A-Za-z0-9]{20,}              # Supabase personal tokens
            | AIza[0-9A-Za-z_\-]{30,}           # Google API keys
            | eyJ[A-Za-z0-9_\-]{10,}\.[A-Za-z0-9_\-]{10,}\.[A-Za-z0-9_\-]{10,}  # JWTs
            | (?i:bearer)\s+[A-Za-z0-9._\-]{20,}  # Authorization headers
            ",
        )
        .expect("redaction regex should compile")
    });

    PATTERNS.replace_all(input, "[REDACTED]").into_owned()
}
