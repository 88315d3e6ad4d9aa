// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log formatting for the client's own diagnostics.
//!
//! Lines look like:
//! ```text
//! MONITOR | WARN | TRANSPORT | Queue full, dropping envelope
//! MONITOR | DEBUG | flush{timeout=2s}: Client initialized
//! ```

use std::fmt;

use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Formats events as `MONITOR | LEVEL | ` followed by the span chain and fields.
///
/// Every line is prefixed so client diagnostics stand out among the host's own logs.
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(&mut writer, "MONITOR | {} | ", event.metadata().level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs a global fmt subscriber using [`Formatter`] filtered at `level`.
///
/// `level` accepts any `EnvFilter` directive; `RUST_LOG`-style targets included.
/// Fails when the directive is invalid or a global subscriber is already set.
pub fn init(level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_new(level)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(Formatter)
        .try_init()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing::{debug_span, warn};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Buffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Buffer {
        type Writer = Buffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn capture_logs(f: impl FnOnce()) -> String {
        let buffer = Buffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(buffer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .event_format(Formatter)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        buffer.contents()
    }

    #[test]
    fn test_formats_level_and_message() {
        let logs = capture_logs(|| warn!("TRANSPORT | Queue full, dropping envelope"));
        assert_eq!(logs, "MONITOR | WARN | TRANSPORT | Queue full, dropping envelope\n");
    }

    #[test]
    fn test_formats_span_chain_and_fields() {
        let logs = capture_logs(|| {
            let span = debug_span!("flush", attempt = 2);
            let _entered = span.enter();
            warn!(pending = 3, "Flush timed out");
        });
        assert_eq!(
            logs,
            "MONITOR | WARN | flush{attempt=2}: Flush timed out pending=3\n"
        );
    }

    #[test]
    fn test_init_rejects_invalid_filter() {
        assert!(init("monitor_client=notalevel").is_err());
    }
}
