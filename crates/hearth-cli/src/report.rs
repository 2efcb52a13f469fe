use console::Style;
use hearth_core::{Ack, CoreError};

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_MANIFEST_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;
pub const EXIT_COORDINATION_ERROR: u8 = 4;
pub const EXIT_LIFECYCLE_ERROR: u8 = 5;

pub fn exit_code(err: &CoreError) -> u8 {
    match err {
        CoreError::Manifest(_) | CoreError::Schema(_) | CoreError::Telemetry(_) => {
            EXIT_MANIFEST_ERROR
        }
        CoreError::Store(_) => EXIT_STORE_ERROR,
        e if e.is_coordination() => EXIT_COORDINATION_ERROR,
        e if e.is_lifecycle() => EXIT_LIFECYCLE_ERROR,
        _ => EXIT_FAILURE,
    }
}

pub fn error(msg: &str) {
    eprintln!("{} {msg}", Style::new().red().bold().apply_to("error:"));
}

/// Print what the primary answered and pick the exit code for it.
pub fn ack(ack: &Ack) -> u8 {
    if !ack.is_accepted() {
        error(&ack.message);
        return EXIT_FAILURE;
    }
    for line in ack.message.lines() {
        println!("{}", colorize_line(line));
    }
    EXIT_SUCCESS
}

pub fn colorize_state(state: &str) -> String {
    match state {
        "started" => Style::new().green().apply_to(state).to_string(),
        "starting" | "stopping" => Style::new().yellow().apply_to(state).to_string(),
        "stopped" => Style::new().dim().apply_to(state).to_string(),
        other => other.to_owned(),
    }
}

/// Status replies read `<identity> <state> pid=.. version=..`.
fn colorize_line(line: &str) -> String {
    let mut parts = line.splitn(3, ' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(identity), Some(state), Some(rest))
            if identity.contains('/') && rest.starts_with("pid=") =>
        {
            format!("{identity} {} {rest}", colorize_state(state))
        }
        _ => line.to_owned(),
    }
}
