//! Command-line configuration for the `snakestream` binary.

use std::time::Duration;

use anyhow::bail;
use clap::Parser;

use crate::encoder::PixelSettings;
use crate::session::SessionSettings;
use crate::transport::ws::ServerConfig;
use crate::worker_bridge::CommandSpawner;

#[derive(Debug, Parser)]
#[command(
    name = "snakestream",
    version,
    about = "Stream simulation runs to WebSocket clients, one worker process per client"
)]
pub struct Cli {
    /// Address to bind the server to.
    #[arg(long, env = "SNAKESTREAM_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "SNAKESTREAM_PORT", default_value_t = 4200)]
    pub port: u16,

    /// Concurrent sessions allowed; further connections get a 503.
    #[arg(long, env = "SNAKESTREAM_MAX_STREAMS", default_value_t = 5)]
    pub max_streams: usize,

    /// Simulation worker executable, started once per session.
    #[arg(long, env = "SNAKESTREAM_WORKER")]
    pub worker_program: String,

    /// Argument passed to the worker (repeatable).
    #[arg(long = "worker-arg", allow_hyphen_values = true)]
    pub worker_args: Vec<String>,

    /// Timed delivery cadence.
    #[arg(long, default_value_t = 50)]
    pub push_interval_ms: u64,

    /// How long one worker read waits before re-checking the session.
    #[arg(long, default_value_t = 100)]
    pub poll_timeout_ms: u64,

    /// Deadline for the worker's init record.
    #[arg(long, default_value_t = 10_000)]
    pub init_timeout_ms: u64,

    /// Deadline for the client's run config.
    #[arg(long, default_value_t = 30_000)]
    pub handshake_timeout_ms: u64,

    /// Time a worker gets to exit after `stop` before it is terminated.
    #[arg(long, default_value_t = 2_000)]
    pub stop_grace_ms: u64,

    /// Screen pixels per grid cell in pixel mode.
    #[arg(long, default_value_t = 2)]
    pub expand_factor: u8,

    /// Pixel offset applied to both axes in pixel mode.
    #[arg(long, default_value_t = 1)]
    pub pixel_offset: u8,

    /// Time live sessions get to finish on shutdown.
    #[arg(long, env = "SNAKESTREAM_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

/// Everything the binary needs to start serving.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub server: ServerConfig,
    pub max_streams: usize,
    pub session: SessionSettings,
    pub worker: CommandSpawner,
}

impl TryFrom<Cli> for BrokerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        if cli.max_streams == 0 {
            bail!("--max-streams must be at least 1");
        }
        if cli.expand_factor == 0 {
            bail!("--expand-factor must be at least 1");
        }
        if cli.push_interval_ms == 0 {
            bail!("--push-interval-ms must be at least 1");
        }
        if cli.worker_program.trim().is_empty() {
            bail!("--worker-program must not be empty");
        }

        let session = SessionSettings::default()
            .with_push_interval(Duration::from_millis(cli.push_interval_ms))
            .with_poll_timeout(Duration::from_millis(cli.poll_timeout_ms))
            .with_init_timeout(Duration::from_millis(cli.init_timeout_ms))
            .with_handshake_timeout(Duration::from_millis(cli.handshake_timeout_ms))
            .with_stop_grace(Duration::from_millis(cli.stop_grace_ms))
            .with_pixels(
                PixelSettings::default()
                    .with_expand_factor(cli.expand_factor)
                    .with_offset(cli.pixel_offset, cli.pixel_offset),
            );

        Ok(Self {
            server: ServerConfig::default()
                .with_host(cli.host)
                .with_port(cli.port)
                .with_shutdown_grace(Duration::from_secs(cli.shutdown_grace_secs)),
            max_streams: cli.max_streams,
            session,
            worker: CommandSpawner::new(cli.worker_program).with_args(cli.worker_args),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("snakestream").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults() {
        let config = BrokerConfig::try_from(parse(&["--worker-program", "snake-worker"])).unwrap();

        assert_eq!(config.server.port, 4200);
        assert_eq!(config.max_streams, 5);
        assert_eq!(config.session.push_interval, Duration::from_millis(50));
        assert_eq!(config.session.poll_timeout, Duration::from_millis(100));
        assert_eq!(config.session.init_timeout, Duration::from_secs(10));
        assert_eq!(config.session.handshake_timeout, Duration::from_secs(30));
        assert_eq!(config.session.stop_grace, Duration::from_secs(2));
        assert_eq!(config.session.pixels, PixelSettings::default());
        assert_eq!(config.worker.program(), "snake-worker");
    }

    #[test]
    fn overrides() {
        let config = BrokerConfig::try_from(parse(&[
            "--worker-program",
            "python3",
            "--worker-arg",
            "-m",
            "--worker-arg",
            "snake_worker",
            "--max-streams",
            "12",
            "--push-interval-ms",
            "20",
            "--expand-factor",
            "3",
            "--pixel-offset",
            "0",
        ]))
        .unwrap();

        assert_eq!(config.max_streams, 12);
        assert_eq!(config.session.push_interval, Duration::from_millis(20));
        assert_eq!(config.session.pixels.expand_factor, 3);
        assert_eq!(config.session.pixels.offset, (0, 0));
        assert_eq!(config.worker.program(), "python3");
    }

    #[test]
    fn rejects_unusable_values() {
        for (flag, value) in [
            ("--max-streams", "0"),
            ("--expand-factor", "0"),
            ("--push-interval-ms", "0"),
        ] {
            let cli = parse(&["--worker-program", "w", flag, value]);
            assert!(BrokerConfig::try_from(cli).is_err(), "{flag} {value:?}");
        }
        let cli = parse(&["--worker-program", " "]);
        assert!(BrokerConfig::try_from(cli).is_err());
    }

    #[test]
    fn worker_args_keep_order() {
        let cli = parse(&["--worker-program", "w", "--worker-arg", "--seed", "--worker-arg", "7"]);
        assert_eq!(cli.worker_args, ["--seed", "7"]);
    }
}
