//! Integration tests for CLI argument handling
//!
//! Runs the binary for argument errors that must stop the server before it
//! binds, and checks the parsed configuration through the library.

use std::process::Command;

/// Helper to run the server binary with given args and capture output
fn run_cli(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_strasboard"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute strasboard")
}

#[test]
fn test_help_flag_exits_successfully() {
    let output = run_cli(&["--help"]);
    assert!(
        output.status.success(),
        "Expected --help to exit successfully"
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("strasboard"), "Help should mention strasboard");
    assert!(stdout.contains("--port"), "Help should mention --port flag");
    assert!(
        stdout.contains("TRANSPORT_STOPS"),
        "Help should name the environment variables"
    );
}

#[test]
fn test_help_hides_secret_values() {
    let output = Command::new(env!("CARGO_BIN_EXE_strasboard"))
        .arg("--help")
        .env("ELECTRICITY_PASSWORD", "hunter2")
        .output()
        .expect("Failed to execute strasboard");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.contains("hunter2"));
}

#[test]
fn test_invalid_timezone_prints_error_and_exits() {
    let output = run_cli(&["--weather-timezone", "Mars/Olympus", "--port", "0"]);
    assert!(!output.status.success(), "Expected invalid timezone to fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("Mars/Olympus"),
        "Should print error message naming the timezone: {}",
        stderr
    );
}

#[test]
fn test_inverted_tempo_hours_exit_with_error() {
    let output = run_cli(&[
        "--tempo-provisional-hour",
        "12",
        "--tempo-definitive-hour",
        "11",
        "--port",
        "0",
    ]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("provisional"), "{}", stderr);
}

#[test]
fn test_invalid_stop_entry_is_logged_before_startup_fails() {
    let output = Command::new(env!("CARGO_BIN_EXE_strasboard"))
        .args(["--weather-timezone", "Mars/Olympus", "--port", "0"])
        .env("TRANSPORT_STOPS", "A,Homme de Fer,Hautepierre;broken-entry")
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute strasboard");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid stop config"), "{}", stderr);
    assert!(stderr.contains("broken-entry"), "{}", stderr);
}

#[test]
fn test_no_warmup_accepts_numeric_env_value() {
    for value in ["1", "yes", "true"] {
        let output = Command::new(env!("CARGO_BIN_EXE_strasboard"))
            .args(["--weather-timezone", "Mars/Olympus", "--port", "0"])
            .env("NO_WARMUP", value)
            .env_remove("RUST_LOG")
            .output()
            .expect("Failed to execute strasboard");
        assert!(!output.status.success());
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Parsing got past NO_WARMUP and failed on the timezone instead
        assert!(stderr.contains("Mars/Olympus"), "NO_WARMUP={}: {}", value, stderr);
        assert!(!stderr.contains("--no-warmup"), "NO_WARMUP={}: {}", value, stderr);
    }
}

#[test]
fn test_non_numeric_port_is_rejected_by_parser() {
    let output = run_cli(&["--port", "eighty"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--port"), "{}", stderr);
}

#[cfg(test)]
mod unit_tests {
    //! Unit tests for CLI parsing that don't require running the binary

    use chrono_tz::Europe::Paris;
    use clap::Parser;
    use strasboard::cli::{Cli, Config, ConfigError};

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["strasboard"]);
        assert_eq!(cli.port, 80);
        assert_eq!(cli.bind_address, "0.0.0.0");
        assert_eq!(cli.source_timeout_secs, 30);
        assert!(!cli.no_warmup);
        assert_eq!(cli.electricity_cutoff_hour, 4);
        assert_eq!(cli.tempo_provisional_hour, 8);
        assert_eq!(cli.tempo_definitive_hour, 11);
    }

    #[test]
    fn test_config_from_cli_with_defaults() {
        let cli = Cli::parse_from(["strasboard", "--port", "8080"]);
        let config = Config::from_cli(&cli).unwrap();
        assert_eq!(config.listen.port(), 8080);
        assert!(config.warm_up);
        assert_eq!(config.source_timeout, std::time::Duration::from_secs(30));
        assert_eq!(config.tempo.timezone, Paris);
        assert_eq!(config.electricity.cutoff_hour, 4);
    }

    #[test]
    fn test_no_warmup_flag_disables_warm_up() {
        let cli = Cli::parse_from(["strasboard", "--no-warmup"]);
        assert!(cli.no_warmup);
        let config = Config::from_cli(&cli).unwrap();
        assert!(!config.warm_up);
    }

    #[test]
    fn test_out_of_range_cutoff_hour_is_rejected() {
        let cli = Cli::parse_from(["strasboard", "--electricity-cutoff-hour", "24"]);
        let err = Config::from_cli(&cli).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidHour { hour: 24, .. }));
    }
}
