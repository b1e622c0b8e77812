use sentry::integrations::tracing::EventFilter;
use tracing::Level;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::{MakeWriter, fmt};
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

/// Maps tracing levels to what the sentry layer records.
///
/// Only errors become sentry events. Terminal load failures and preload failures are logged at
/// `WARN` and end up as sentry logs together with cleanup sweeps.
pub fn sentry_event_filter(level: &Level) -> EventFilter {
    match *level {
        Level::ERROR => EventFilter::Event | EventFilter::Log,
        Level::WARN | Level::INFO => EventFilter::Log,
        Level::DEBUG | Level::TRACE => EventFilter::Ignore,
    }
}

/// Installs a global JSON subscriber that also forwards events to sentry.
///
/// Each loader records its name as the `loader` field, so filtering a single loader's events
/// works on the flattened output.
pub fn init_json_logging<W>(env_filter: &str, make_writer: W)
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let sentry_layer = sentry::integrations::tracing::layer()
        .event_filter(|metadata| sentry_event_filter(metadata.level()));

    fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_env_filter(env_filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_writer(make_writer)
        .finish()
        .with(sentry_layer)
        .init();
}
