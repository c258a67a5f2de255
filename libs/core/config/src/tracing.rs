use crate::Environment;
use tracing_subscriber::EnvFilter;

/// How logs should come out for one environment.
struct LogProfile {
    default_filter: &'static str,
    json: bool,
    show_target: bool,
}

fn profile_for(environment: Environment) -> LogProfile {
    match environment {
        // Machine-readable for log shippers, module paths add no value
        Environment::Production => LogProfile {
            default_filter: "info,tokio_nsq=warn",
            json: true,
            show_target: false,
        },
        Environment::Development => LogProfile {
            default_filter: "debug,tokio_nsq=info,redis=info",
            json: false,
            show_target: true,
        },
    }
}

/// Install the global tracing subscriber for the given environment.
///
/// Production gets JSON output; development gets a pretty printer with
/// module targets. `RUST_LOG` overrides the default filter either way.
/// Safe to call more than once: later calls leave the installed
/// subscriber in place.
pub fn init_tracing(environment: &Environment) {
    let profile = profile_for(*environment);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(profile.default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(profile.show_target);

    let installed = if profile.json {
        builder.json().try_init()
    } else {
        builder.pretty().try_init()
    };

    if installed.is_ok() {
        tracing::info!(environment = ?environment, "logging ready");
    }
}
