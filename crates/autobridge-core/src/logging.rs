//! Structured logging bootstrap and log hygiene helpers.

/// Longest peer-supplied text written to the log before truncation.
pub const MAX_LOGGED_CHARS: usize = 512;

/// Initialize the global tracing subscriber with stderr output.
///
/// Call once at application startup. Subsequent calls are no-ops.
/// `RUST_LOG` wins over `level` when set.
pub fn init_subscriber(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    // set_global_default is a no-op if already set
    let _ = subscriber.try_init();
}

/// Make peer-supplied text safe to log.
///
/// Control characters become `?` and the result is cut at
/// [`MAX_LOGGED_CHARS`] characters with a `[TRUNCATED]` marker.
pub fn sanitize_for_log(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LOGGED_CHARS + 16));
    for (i, c) in input.chars().enumerate() {
        if i == MAX_LOGGED_CHARS {
            out.push_str("[TRUNCATED]");
            break;
        }
        out.push(if c.is_control() { '?' } else { c });
    }
    out
}
