use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

use webdav_server::config::{self, Config, LogFormat, Overrides};
use webdav_server::server;

const LONG_ABOUT: &str = "\
If you don't set \"config\", the server looks for a configuration file
called config.{yaml, yml, json, toml} in the following directories:

- ./
- /etc/webdav/

The precedence of the configuration values is as follows:

- flags
- environment variables
- configuration file
- defaults

Environment variables are prefixed by \"WD_\" followed by the option name
in caps, so \"cert\" is set via WD_CERT.";

#[derive(Debug, Parser)]
#[command(name = "webdav", version, about = "A simple to use WebDAV server", long_about = LONG_ABOUT)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the WebDAV server (the default when no command is given)
    Serve(ServeArgs),

    /// Generate a bcrypt encrypted password
    Bcrypt {
        /// Password to hash
        password: String,

        /// Cost used to generate the password; a higher cost leads to
        /// slower verification times
        #[arg(
            short,
            long,
            default_value_t = bcrypt::DEFAULT_COST,
            value_parser = clap::value_parser!(u32).range(4..=31)
        )]
        cost: u32,
    },

    /// Print the version number
    Version,
}

#[derive(Debug, Args, Default)]
struct ServeArgs {
    /// Config file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    address: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable TLS
    #[arg(short, long, num_args = 0..=1, default_missing_value = "true")]
    tls: Option<bool>,

    /// Path to the TLS certificate
    #[arg(long)]
    cert: Option<String>,

    /// Path to the TLS key
    #[arg(long)]
    key: Option<String>,

    /// URL path prefix
    #[arg(short = 'P', long)]
    prefix: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Bcrypt { password, cost }) => bcrypt_password(&password, cost),
        Some(Command::Version) => {
            println!("webdav version {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Command::Serve(args)) => run(args).await,
        None => run(cli.serve).await,
    }
}

async fn run(args: ServeArgs) -> anyhow::Result<()> {
    let overrides = Overrides {
        address: args.address,
        port: args.port,
        tls: args.tls,
        cert: args.cert,
        key: args.key,
        prefix: args.prefix,
    };

    let config = config::parse_config(args.config.as_deref(), &overrides)?;
    init_logging(&config)?;

    server::serve(config).await?;
    Ok(())
}

fn bcrypt_password(password: &str, cost: u32) -> anyhow::Result<()> {
    anyhow::ensure!(!password.is_empty(), "password argument must not be empty");
    let hash = bcrypt::hash(password, cost)?;
    println!("{hash}");
    Ok(())
}

// Subscriber setup from the log section: console or JSON encoding, ANSI
// colors, and any combination of stderr/stdout/file outputs. RUST_LOG
// still wins over the config when set.
fn init_logging(config: &Config) -> anyhow::Result<()> {
    let default_level = if config.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer(&config.log.outputs)?)
        .with_ansi(config.log.colors && config.log.format != LogFormat::Json);

    match config.log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Console => builder.init(),
    }
    Ok(())
}

fn make_writer(outputs: &[String]) -> anyhow::Result<BoxMakeWriter> {
    let mut writer: Option<BoxMakeWriter> = None;

    for output in outputs {
        let next = match output.as_str() {
            "stderr" => BoxMakeWriter::new(std::io::stderr),
            "stdout" => BoxMakeWriter::new(std::io::stdout),
            path => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("opening log output {path:?}"))?;
                BoxMakeWriter::new(Arc::new(file))
            }
        };
        writer = Some(match writer {
            None => next,
            Some(current) => BoxMakeWriter::new(current.and(next)),
        });
    }

    Ok(writer.unwrap_or_else(|| BoxMakeWriter::new(std::io::stderr)))
}
