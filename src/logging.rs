use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, Clone, Copy, PartialEq)]
enum LogFormat {
    Pretty,
    Compact,
    Json,
}

/// Install the global subscriber. Called once by each binary.
pub fn initialize_tracing(verbose: bool) {
    let format = env_log_format();

    tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(build_fmt_layer(format, format != LogFormat::Json))
        .init();
}

fn env_filter(verbose: bool) -> EnvFilter {
    if let Ok(filter) = std::env::var("RUST_LOG") {
        EnvFilter::new(filter)
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    }
}

fn env_log_format() -> LogFormat {
    std::env::var("TUNNELMUX_LOG_FORMAT")
        .ok()
        .map(|v| parse_format(&v))
        .unwrap_or(LogFormat::Pretty)
}

fn build_fmt_layer<S>(format: LogFormat, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let base = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(ansi);

    match format {
        LogFormat::Json => Box::new(base.json()),
        LogFormat::Compact => Box::new(base.compact()),
        LogFormat::Pretty => Box::new(base.pretty()),
    }
}

fn parse_format(value: &str) -> LogFormat {
    match value.trim().to_ascii_lowercase().as_str() {
        "json" => LogFormat::Json,
        "compact" => LogFormat::Compact,
        _ => LogFormat::Pretty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format() {
        assert_eq!(parse_format("json"), LogFormat::Json);
        assert_eq!(parse_format(" Compact "), LogFormat::Compact);
        assert_eq!(parse_format("anything"), LogFormat::Pretty);
    }
}
