use crate::config::{LogFormat, LogOutput, LoggingConfig};
use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use tracing::{Event, Subscriber};
use tracing_subscriber::{
    fmt::{format::Writer, writer::BoxMakeWriter, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Structured log entry for JSON output
#[derive(Debug, Serialize)]
pub struct StructuredLogEntry {
    /// Timestamp in RFC3339 format
    pub timestamp: String,
    pub level: String,
    /// Target of the event, usually the module path
    pub component: String,
    pub message: String,
    /// Name of the enclosing span, such as the pool name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
    #[serde(flatten)]
    pub fields: HashMap<String, serde_json::Value>,
}

/// JSON formatter with optional redaction of credentials
pub struct JsonFormatter {
    redact_sensitive: bool,
}

impl JsonFormatter {
    pub fn new(redact_sensitive: bool) -> Self {
        Self { redact_sensitive }
    }

    /// Redact credentials from log fields
    fn redact_fields(&self, fields: &mut HashMap<String, serde_json::Value>) {
        if !self.redact_sensitive {
            return;
        }

        let sensitive_keys = ["password", "secret", "token", "auth", "credential", "rpc_user"];

        for (key, value) in fields.iter_mut() {
            let key_lower = key.to_lowercase();
            if sensitive_keys.iter().any(|&sensitive| key_lower.contains(sensitive)) {
                *value = serde_json::Value::String("[REDACTED]".to_string());
            } else if let serde_json::Value::String(s) = value {
                if let Some(redacted) = redact_url_credentials(s) {
                    *value = serde_json::Value::String(redacted);
                }
            }
        }
    }
}

/// Strip `user:password@` from URLs embedded in a string
fn redact_url_credentials(s: &str) -> Option<String> {
    let scheme_end = s.find("://")? + 3;
    let rest = &s[scheme_end..];
    let at = rest.find('@')?;
    if rest[..at].contains('/') || !rest[..at].contains(':') {
        return None;
    }
    Some(format!("{}[REDACTED]@{}", &s[..scheme_end], &rest[at + 1..]))
}

impl<S, N> FormatEvent<S, N> for JsonFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let span = ctx.lookup_current().map(|span| span.name().to_string());

        let mut fields = HashMap::new();
        let mut visitor = JsonFieldVisitor::new(&mut fields);
        event.record(&mut visitor);
        self.redact_fields(&mut fields);

        let message = fields
            .remove("message")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();

        let entry = StructuredLogEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: metadata.level().to_string().to_uppercase(),
            component: metadata.target().to_string(),
            message,
            span,
            fields,
        };

        let json = serde_json::to_string(&entry).map_err(|_| fmt::Error)?;
        writeln!(writer, "{}", json)
    }
}

/// Visitor for collecting event fields into a HashMap
struct JsonFieldVisitor<'a> {
    fields: &'a mut HashMap<String, serde_json::Value>,
}

impl<'a> JsonFieldVisitor<'a> {
    fn new(fields: &'a mut HashMap<String, serde_json::Value>) -> Self {
        Self { fields }
    }
}

impl<'a> tracing::field::Visit for JsonFieldVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        self.fields.insert(
            field.name().to_string(),
            serde_json::Value::String(format!("{:?}", value)),
        );
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.fields.insert(
            field.name().to_string(),
            serde_json::Value::String(value.to_string()),
        );
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields.insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

/// Build the level filter from the global and per-component levels
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let mut filter = EnvFilter::try_new(&config.level)
        .map_err(|e| Error::Config(format!("Invalid log level '{}': {}", config.level, e)))?;

    for (component, level) in &config.component_levels {
        let directive = format!("{}={}", component, level)
            .parse()
            .map_err(|e| Error::Config(format!("Invalid log directive for {}: {}", component, e)))?;
        filter = filter.add_directive(directive);
    }

    Ok(filter)
}

fn make_writer(output: &LogOutput) -> Result<BoxMakeWriter> {
    match output {
        LogOutput::Stdout => Ok(BoxMakeWriter::new(std::io::stdout)),
        LogOutput::File(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Ok(BoxMakeWriter::new(Mutex::new(file)))
        }
    }
}

/// Initialize the global subscriber with the given configuration
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(config)?;
    let writer = make_writer(&config.output)?;
    let ansi = matches!(config.output, LogOutput::Stdout);
    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .event_format(JsonFormatter::new(config.redact_sensitive_data))
                    .with_writer(writer),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty().with_ansi(ansi).with_writer(writer))
            .try_init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact().with_ansi(ansi).with_writer(writer))
            .try_init(),
    };

    result.map_err(|e| Error::Internal(format!("Failed to install log subscriber: {}", e)))
}
