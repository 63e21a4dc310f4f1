use std::str::FromStr;

use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, Registry, filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
};

#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, $($msg:tt)*) => {{
        let span = $crate::tracing::span!($level, $span);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($msg)*)
    }};
}

/// Traffic leaving courier: messenger pushes, provider callbacks.
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "outgoing", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::outgoing!(level = TRACE, $($msg)*)
    };
}

/// Traffic entering courier: webhook payloads, mailbox scans.
#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "incoming", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::incoming!(level = TRACE, $($msg)*)
    };
}

#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::internal!(level = TRACE, $($msg)*)
    };
}

/// Output format selected through `LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Compact,
    Json,
}

impl Format {
    fn from_env() -> Self {
        match std::env::var("LOG_FORMAT") {
            Ok(format) if format.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Compact,
        }
    }
}

fn level_from_env() -> LevelFilter {
    let default = if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };

    std::env::var("LOG_LEVEL").map_or(default, |level| {
        LevelFilter::from_str(level.as_str()).unwrap_or_else(|_| {
            eprintln!("Invalid log level specified {level}, defaulting to {default}");
            default
        })
    })
}

/// Install the global subscriber.
///
/// `LOG_LEVEL` picks the maximum level and `LOG_FORMAT=json` switches to
/// line-delimited JSON. Only events from courier crates are emitted.
/// Calling this more than once leaves the first subscriber in place.
pub fn init() {
    let level = level_from_env();

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match Format::from_env() {
        Format::Compact => tracing_subscriber::fmt::layer()
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_ansi(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .boxed(),
        Format::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .boxed(),
    };

    let installed = tracing_subscriber::Registry::default()
        .with(
            layer
                .with_filter(level)
                .with_filter(FilterFn::new(|metadata| {
                    metadata.target().starts_with("courier")
                })),
        )
        .try_init();

    if let Err(err) = installed {
        eprintln!("Logging already initialised: {err}");
    }
}
