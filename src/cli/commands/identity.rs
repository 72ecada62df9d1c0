use crate::security::identity::DEFAULT_INTROSPECTION_URL;
use clap::{Arg, Command};

pub const ARG_INTROSPECTION_URL: &str = "identity-introspection-url";
pub const ARG_AUDIENCE: &str = "identity-audience";
pub const ARG_TIMEOUT: &str = "identity-timeout-seconds";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_INTROSPECTION_URL)
                .long(ARG_INTROSPECTION_URL)
                .help("Endpoint that validates identity-provider tokens")
                .env("GARDISTO_IDENTITY_INTROSPECTION_URL")
                .default_value(DEFAULT_INTROSPECTION_URL),
        )
        .arg(
            Arg::new(ARG_AUDIENCE)
                .long(ARG_AUDIENCE)
                .help("Expected audience (OAuth client id) of identity tokens")
                .env("GARDISTO_IDENTITY_AUDIENCE"),
        )
        .arg(
            Arg::new(ARG_TIMEOUT)
                .long(ARG_TIMEOUT)
                .help("Timeout for one credential verification call")
                .env("GARDISTO_IDENTITY_TIMEOUT_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}
