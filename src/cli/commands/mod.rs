pub mod database;
pub mod engine;
pub mod logging;

use clap::{
    builder::styling::{AnsiColor, Effects, Styles},
    Arg, ArgAction, ColorChoice, Command,
};

pub const CMD_MIGRATE: &str = "migrate";
pub const CMD_SWEEP: &str = "sweep";
pub const ARG_ONCE: &str = "once";
pub const ARG_SWEEP_INTERVAL_SECONDS: &str = "sweep-interval-seconds";

fn sweep_command() -> Command {
    Command::new(CMD_SWEEP)
        .about("Remove expired preregistrations, sessions and password reset grants")
        .arg(
            Arg::new(ARG_ONCE)
                .long(ARG_ONCE)
                .help("Run a single sweep and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_SWEEP_INTERVAL_SECONDS)
                .long(ARG_SWEEP_INTERVAL_SECONDS)
                .help("Seconds between sweeps")
                .env("SIGNET_SWEEP_INTERVAL_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let command = Command::new("signet")
        .about("User identity and session lifecycle engine")
        .version(env!("CARGO_PKG_VERSION"))
        .color(ColorChoice::Auto)
        .styles(styles)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(Command::new(CMD_MIGRATE).about("Apply pending database migrations"))
        .subcommand(sweep_command());

    let command = database::with_args(command);
    let command = engine::with_args(command);
    logging::with_args(command)
}
