use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize structured logging with JSON output
pub fn init_tracing() -> Result<()> {
    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .wrap_err("Failed to install the tracing subscriber")?;

    tracing::info!("Waypoint structured logging initialized");
    Ok(())
}

/// Initialize tracing with an explicit filter and output format
pub fn init_tracing_with_config(level: &str, json_format: bool, include_spans: bool) -> Result<()> {
    let env_filter =
        EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json_format {
        Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(include_spans)
                    .with_span_list(include_spans),
            )
            .try_init()
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
    }
    .wrap_err("Failed to install the tracing subscriber")?;

    tracing::info!(level, json_format, include_spans, "Waypoint logging initialized");
    Ok(())
}

/// Span covering one request forwarded to a destination
pub fn create_forward_span(
    cluster_id: &str,
    destination_id: &str,
    method: &str,
    path: &str,
) -> tracing::Span {
    tracing::info_span!(
        "forward",
        cluster.id = cluster_id,
        destination.id = destination_id,
        http.method = method,
        http.path = path,
        http.status_code = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}

/// Span covering the proxy pipeline of one request on a route
pub fn create_proxy_span(route_id: &str, method: &str, path: &str) -> tracing::Span {
    tracing::info_span!(
        "proxy",
        route.id = route_id,
        http.method = method,
        http.path = path,
        affinity.status = tracing::field::Empty,
    )
}
