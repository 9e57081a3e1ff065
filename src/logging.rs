//! Subscriber setup driven by the run verbosity.

use tracing_subscriber::EnvFilter;

/// Filter level for a verbosity: 1 errors only, 2 info, 3 debug. Any other
/// value silences the crate.
pub fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        1 => "error",
        2 => "info",
        3 => "debug",
        _ => "off",
    }
}

/// Install the global subscriber. `RUST_LOG` directives still apply to
/// other crates. Returns false when a subscriber was already installed.
pub fn init(verbosity: u8) -> anyhow::Result<bool> {
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("steprun={}", level_for(verbosity)).parse()?);
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok();
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels() {
        assert_eq!(level_for(1), "error");
        assert_eq!(level_for(2), "info");
        assert_eq!(level_for(3), "debug");
        assert_eq!(level_for(0), "off");
        assert_eq!(level_for(9), "off");
    }

    #[test]
    fn test_second_init_is_a_no_op() {
        init(2).unwrap();
        assert!(!init(3).unwrap());
    }
}
