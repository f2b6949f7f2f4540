use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter directive for the chosen verbosity
fn filter_directive(debug: bool, quiet: bool) -> &'static str {
    if debug {
        "blockflow=debug"
    } else if quiet {
        "blockflow=error"
    } else {
        "blockflow=info"
    }
}

/// Initialize logging based on output mode and debug flag
///
/// `RUST_LOG` overrides the verbosity flags when set.
pub fn init_logging(debug: bool, quiet: bool, log_file: Option<PathBuf>) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(debug, quiet)));

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_line_number(debug)
        .with_file(debug)
        .with_writer(std::io::stderr);

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(file)
                    .with_target(true)
                    .with_line_number(true),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(file_layer)
        .try_init()?;

    Ok(())
}

/// Default log file for a run of `flow_id`
pub fn default_log_path(flow_id: &str) -> anyhow::Result<PathBuf> {
    let log_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
        .join("blockflow")
        .join("logs");

    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let stem = if flow_id.is_empty() { "flow" } else { flow_id };

    Ok(log_dir.join(format!("{}-{}.log", stem, timestamp)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directive() {
        assert_eq!(filter_directive(true, true), "blockflow=debug");
        assert_eq!(filter_directive(false, true), "blockflow=error");
        assert_eq!(filter_directive(false, false), "blockflow=info");
    }

    #[test]
    fn test_default_log_path_names_flow() {
        let Ok(path) = default_log_path("orders") else {
            return;
        };
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("orders-"));
        assert!(name.ends_with(".log"));
        assert!(path.parent().unwrap().ends_with("blockflow/logs"));
    }
}
