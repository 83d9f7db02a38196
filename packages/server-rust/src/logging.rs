//! Log sink construction.
//!
//! [`build_dispatch`] turns `log_settings` into a `tracing::Dispatch`. The
//! dispatch is handed to the runner and service explicitly; nothing here
//! installs a global subscriber.

use std::fs::OpenOptions;
use std::io;
use std::sync::Mutex;

use anyhow::Context as _;
use authrpc_core::{AmqpConfig, LogConfig, LogHandler, LogLevel};
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Connection, ConnectionProperties};
use tokio::sync::mpsc;
use tracing::level_filters::LevelFilter;
use tracing::Dispatch;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log lines buffered for the amqp sink; newer lines are dropped when full.
pub const AMQP_LOG_BUFFER: usize = 1024;

#[must_use]
pub fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Critical | LogLevel::Error => LevelFilter::ERROR,
        LogLevel::Warning => LevelFilter::WARN,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::NotSet => LevelFilter::TRACE,
    }
}

/// Builds the dispatch for `config`; `None` logs to stdout at info.
///
/// `RUST_LOG` directives, when set, refine the configured level.
///
/// # Errors
///
/// Returns an error if a log file cannot be opened, or if the `amqp`
/// handler is requested outside a tokio runtime.
pub fn build_dispatch(config: Option<&LogConfig>) -> anyhow::Result<Dispatch> {
    let (level, handler) = match config {
        Some(config) => (config.level, &config.handler),
        None => (LogLevel::Info, &LogHandler::Console),
    };

    let filter = EnvFilter::builder()
        .with_default_directive(level_filter(level).into())
        .from_env_lossy();

    let layer: BoxedLayer = match handler {
        LogHandler::Console => fmt::layer().with_writer(io::stdout).boxed(),
        LogHandler::Stderr => fmt::layer().with_writer(io::stderr).boxed(),
        LogHandler::Json => fmt::layer().json().with_writer(io::stdout).boxed(),
        LogHandler::File { path } => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .boxed()
        }
        LogHandler::Amqp { config, queue } => {
            let writer = AmqpLogWriter::spawn(config.clone(), queue.clone())?;
            fmt::layer().json().with_writer(writer).boxed()
        }
    };

    Ok(Dispatch::new(Registry::default().with(layer).with(filter)))
}

/// Stderr dispatch used until the configuration has been read.
#[must_use]
pub fn bootstrap_dispatch() -> Dispatch {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    Dispatch::new(
        Registry::default()
            .with(fmt::layer().with_writer(io::stderr))
            .with(filter),
    )
}

// ---------------------------------------------------------------------------
// AMQP sink
// ---------------------------------------------------------------------------

/// Forwards formatted log lines to a publisher task that owns its own
/// broker connection. Lines are dropped while the buffer is full.
#[derive(Debug, Clone)]
pub struct AmqpLogWriter {
    lines: mpsc::Sender<Vec<u8>>,
}

impl AmqpLogWriter {
    /// Starts the publisher task on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error when called outside a tokio runtime.
    pub fn spawn(config: AmqpConfig, queue: String) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .context("the amqp log handler needs a running tokio runtime")?;
        let (lines, rx) = mpsc::channel(AMQP_LOG_BUFFER);
        runtime.spawn(publish_lines(config, queue, rx));
        Ok(Self { lines })
    }

    /// Writer whose lines land on `rx`; used where no broker is available.
    #[must_use]
    pub fn from_channel(lines: mpsc::Sender<Vec<u8>>) -> Self {
        Self { lines }
    }
}

impl<'a> MakeWriter<'a> for AmqpLogWriter {
    type Writer = AmqpLogLine;

    fn make_writer(&'a self) -> Self::Writer {
        AmqpLogLine {
            buf: Vec::new(),
            lines: self.lines.clone(),
        }
    }
}

/// Buffers one formatted event and sends it on drop.
pub struct AmqpLogLine {
    buf: Vec<u8>,
    lines: mpsc::Sender<Vec<u8>>,
}

impl io::Write for AmqpLogLine {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for AmqpLogLine {
    fn drop(&mut self) {
        while self.buf.last() == Some(&b'\n') {
            self.buf.pop();
        }
        if !self.buf.is_empty() {
            // Full: the broker is behind. Closed: the publisher gave up.
            // Either way the line is lost.
            let _ = self.lines.try_send(std::mem::take(&mut self.buf));
        }
    }
}

async fn publish_lines(config: AmqpConfig, queue: String, mut rx: mpsc::Receiver<Vec<u8>>) {
    // Logging from here would feed back into this sink, so failures go to stderr.
    let connection = match Connection::connect(&config.uri(), ConnectionProperties::default()).await {
        Ok(connection) => connection,
        Err(err) => {
            eprintln!("amqp log sink: cannot connect to {}: {err}", config.hostname);
            return;
        }
    };
    let channel = match connection.create_channel().await {
        Ok(channel) => channel,
        Err(err) => {
            eprintln!("amqp log sink: cannot open channel: {err}");
            return;
        }
    };
    let declare = QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    };
    if let Err(err) = channel
        .queue_declare(&queue, declare, FieldTable::default())
        .await
    {
        eprintln!("amqp log sink: cannot declare queue {queue}: {err}");
        return;
    }

    while let Some(line) = rx.recv().await {
        let properties =
            BasicProperties::default().with_content_type(ShortString::from("application/json"));
        if let Err(err) = channel
            .basic_publish("", &queue, BasicPublishOptions::default(), &line, properties)
            .await
        {
            eprintln!("amqp log sink: publish failed: {err}");
        }
    }
    let _ = connection.close(200, "log sink closed").await;
}
