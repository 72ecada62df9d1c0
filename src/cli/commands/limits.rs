use clap::{Arg, Command};

pub const ARG_LOGIN_IP_LIMIT: &str = "login-ip-limit";
pub const ARG_LOGIN_IP_WINDOW: &str = "login-ip-window-seconds";
pub const ARG_LOCKOUT_THRESHOLD: &str = "lockout-threshold";
pub const ARG_LOCKOUT_WINDOW: &str = "lockout-window-seconds";
pub const ARG_LOCKOUT_DURATION: &str = "lockout-duration-seconds";
pub const ARG_LIMITER_CAPACITY: &str = "limiter-capacity";
pub const ARG_LIMITER_IDLE: &str = "limiter-idle-seconds";

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_login_args(command);
    with_store_args(command)
}

fn with_login_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_LOGIN_IP_LIMIT)
                .long(ARG_LOGIN_IP_LIMIT)
                .help("Login attempts allowed per client IP per window")
                .env("GARDISTO_LOGIN_IP_LIMIT")
                .default_value("5")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_LOGIN_IP_WINDOW)
                .long(ARG_LOGIN_IP_WINDOW)
                .help("Window for the per-IP login limit in seconds")
                .env("GARDISTO_LOGIN_IP_WINDOW_SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_LOCKOUT_THRESHOLD)
                .long(ARG_LOCKOUT_THRESHOLD)
                .help("Failed logins that lock an account")
                .env("GARDISTO_LOCKOUT_THRESHOLD")
                .default_value("3")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_LOCKOUT_WINDOW)
                .long(ARG_LOCKOUT_WINDOW)
                .help("Failures older than this many seconds stop counting")
                .env("GARDISTO_LOCKOUT_WINDOW_SECONDS")
                .default_value("600")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_LOCKOUT_DURATION)
                .long(ARG_LOCKOUT_DURATION)
                .help("How long a locked account stays locked in seconds")
                .env("GARDISTO_LOCKOUT_DURATION_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}

fn with_store_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_LIMITER_CAPACITY)
                .long(ARG_LIMITER_CAPACITY)
                .help("Maximum keys tracked by each in-memory limiter")
                .env("GARDISTO_LIMITER_CAPACITY")
                .default_value("10000")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_LIMITER_IDLE)
                .long(ARG_LIMITER_IDLE)
                .help("Seconds after which an untouched limiter entry is dropped")
                .env("GARDISTO_LIMITER_IDLE_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}
