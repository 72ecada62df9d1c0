use clap::{builder::ValueParser, Arg, ArgAction, Command};

pub const ARG_LOG_LEVEL: &str = "log-level";

// Index is the verbosity count: `error` is the default, each `-v` moves one step right.
const LEVEL_NAMES: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// `GARDISTO_LOG_LEVEL` takes a level name or the equivalent `-v` count (0-5).
fn parse_log_level(value: &str) -> Result<u8, String> {
    let value = value.trim();
    if let Ok(count) = value.parse::<u8>() {
        return if count <= 5 {
            Ok(count)
        } else {
            Err(format!("log level {count} is out of range 0-5"))
        };
    }

    LEVEL_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(value))
        .and_then(|index| u8::try_from(index).ok())
        .ok_or_else(|| {
            format!(
                "unknown log level '{value}', expected one of: {}",
                LEVEL_NAMES.join(", ")
            )
        })
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command.arg(
        Arg::new(ARG_LOG_LEVEL)
            .short('v')
            .long("verbose")
            .help("Raise log verbosity, repeat for more (-v warn, -vv info, -vvv debug, -vvvv trace)")
            .env("GARDISTO_LOG_LEVEL")
            .global(true)
            .action(ArgAction::Count)
            .value_parser(ValueParser::new(parse_log_level)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_map_to_counts() {
        assert_eq!(parse_log_level("error"), Ok(0));
        assert_eq!(parse_log_level("WARN"), Ok(1));
        assert_eq!(parse_log_level(" info "), Ok(2));
        assert_eq!(parse_log_level("trace"), Ok(4));
    }

    #[test]
    fn numeric_levels_are_bounded() {
        assert_eq!(parse_log_level("5"), Ok(5));
        assert!(parse_log_level("6").is_err());
        assert!(parse_log_level("loud").is_err());
    }
}
