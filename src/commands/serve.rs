use crate::config::{ListenAddr, Settings, parse_listen_addr};
use crate::logging::{self, RotatingFile};
use crate::runner::ShellRunner;
use crate::web::{self, AppState};
use clap::Args;
use std::sync::Arc;

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Server address (host:port). The host is optional and defaults to all interfaces
    #[arg(
        short,
        long,
        value_name = "[HOST:]PORT",
        default_value = "8000",
        value_parser = parse_listen_addr
    )]
    pub port: ListenAddr,
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

pub struct ServeCommand;

impl ServeCommand {
    pub async fn execute(args: ServeArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let settings = Settings::from_env()?;

        let sink = RotatingFile::open(
            &settings.log_file,
            settings.log_max_bytes,
            settings.log_backups,
        )?;
        let sink = Arc::new(sink);
        logging::init(&args.log_level, sink.clone())?;

        tracing::info!("Logging to {}", sink.path().display());
        tracing::info!("Deploy command: {}", settings.deploy_command);
        tracing::info!("Webhook endpoint at http://{}/ (POST, any path)", args.port);

        let runner = ShellRunner::new(settings.deploy_command.clone())?;
        let state = AppState::new(runner, &settings);

        web::start_server(&args.port, state).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        serve: ServeArgs,
    }

    #[test]
    fn test_default_port() {
        let cli = TestCli::try_parse_from(["deploy-hook"]).unwrap();
        assert_eq!(cli.serve.port, ListenAddr::default());
        assert_eq!(cli.serve.port.to_string(), "0.0.0.0:8000");
        assert_eq!(cli.serve.log_level, "info");
    }

    #[test]
    fn test_port_only_binds_all_interfaces() {
        let cli = TestCli::try_parse_from(["deploy-hook", "--port", "9000"]).unwrap();
        assert_eq!(cli.serve.port.host, "0.0.0.0");
        assert_eq!(cli.serve.port.port, 9000);
    }

    #[test]
    fn test_host_and_port() {
        let cli = TestCli::try_parse_from(["deploy-hook", "-p", "127.0.0.1:9000"]).unwrap();
        assert_eq!(cli.serve.port.host, "127.0.0.1");
        assert_eq!(cli.serve.port.port, 9000);
    }

    #[test]
    fn test_invalid_address_rejected() {
        for bad in ["nine-thousand", "127.0.0.1:", "127.0.0.1:99999", ""] {
            let result = TestCli::try_parse_from(["deploy-hook", "--port", bad]);
            assert!(result.is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_help_is_not_an_error_exit() {
        let err = TestCli::try_parse_from(["deploy-hook", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
        assert_eq!(err.exit_code(), 0);
    }
}
