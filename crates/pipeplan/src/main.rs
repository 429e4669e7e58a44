use std::io;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use pipeplan_core::config::session::SessionConfig;
use pipeplan_core::execution::scalar::ScalarValue;
use pipeplan_core::explain::{ExplainFormat, format_stages};
use pipeplan_core::logical::LogicalPlan;
use pipeplan_core::optimizer::PhysicalOptimizer;
use pipeplan_core::optimizer::cost::StaticCostOracle;
use pipeplan_error::Result;

#[derive(Parser)]
#[clap(name = "pipeplan")]
struct Arguments {
    #[clap(subcommand)]
    command: Command,
    /// Log lines as json.
    #[clap(long, global = true)]
    log_json: bool,
    /// Default log level, overridden by RUST_LOG.
    #[clap(long, global = true, default_value = "warn")]
    log_level: tracing::Level,
}

#[derive(Subcommand)]
enum Command {
    /// Generate stages for a logical plan and print them.
    Plan {
        /// JSON file containing the logical plan.
        #[clap(long)]
        plan: PathBuf,
        /// JSON file mapping `database:set` to estimated size in bytes.
        #[clap(long)]
        sizes: Option<PathBuf>,
        /// Settings to apply before planning, `name=value`.
        #[clap(long = "set", value_parser = parse_setting)]
        settings: Vec<(String, String)>,
        #[clap(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },
    /// List available settings.
    Settings,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

fn parse_setting(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) => Ok((name.trim().to_string(), value.trim().to_string())),
        None => Err(format!("expected name=value, got '{s}'")),
    }
}

/// Interpret a setting value from the command line.
fn setting_value(value: &str) -> ScalarValue {
    if let Ok(v) = value.parse::<i64>() {
        return ScalarValue::Int64(v);
    }
    if let Ok(v) = value.parse::<bool>() {
        return ScalarValue::Boolean(v);
    }
    ScalarValue::Utf8(value.to_string())
}

fn main() {
    let args = Arguments::parse();
    let format = if args.log_json {
        logutil::LogFormat::Json
    } else {
        logutil::LogFormat::HumanReadable
    };
    logutil::configure_global_logger(args.log_level, format, io::stderr);

    if let Err(err) = inner(args.command) {
        println!("ERROR: {err}");
        std::process::exit(1);
    }
}

fn inner(command: Command) -> Result<()> {
    match command {
        Command::Plan {
            plan,
            sizes,
            settings,
            format,
        } => {
            let mut conf = SessionConfig::new();
            for (name, value) in settings {
                conf.set_from_scalar(&name, setting_value(&value))?;
            }

            let plan = LogicalPlan::from_json(&std::fs::read_to_string(plan)?)?;
            let oracle = match sizes {
                Some(path) => StaticCostOracle::from_json(&std::fs::read_to_string(path)?)?,
                None => StaticCostOracle::new(),
            };

            let optimizer = PhysicalOptimizer::new(conf.optimizer_config());
            let stages = optimizer.run(&plan, &oracle)?;

            let format = match format {
                Format::Text => ExplainFormat::Text,
                Format::Json => ExplainFormat::Json,
            };
            print!("{}", format_stages(&stages, format)?);
            if matches!(format, ExplainFormat::Json) {
                println!();
            }
            Ok(())
        }
        Command::Settings => {
            let conf = SessionConfig::new();
            for (name, description) in SessionConfig::settings() {
                let value = conf.get_as_scalar(name)?;
                println!("{name} = {value}\n    {description}");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_settings() {
        assert_eq!(
            ("broadcast_threshold".to_string(), "100".to_string()),
            parse_setting("broadcast_threshold = 100").unwrap()
        );
        parse_setting("nope").unwrap_err();
    }

    #[test]
    fn setting_values() {
        assert_eq!(ScalarValue::Int64(4), setting_value("4"));
        assert_eq!(ScalarValue::Boolean(true), setting_value("true"));
        assert_eq!(ScalarValue::Utf8("random".to_string()), setting_value("random"));
    }

    #[test]
    fn cli_parses() {
        let args = Arguments::parse_from([
            "pipeplan",
            "plan",
            "--plan",
            "plan.json",
            "--set",
            "job_id=j1",
            "--format",
            "json",
        ]);
        assert!(matches!(args.command, Command::Plan { .. }));
    }
}
