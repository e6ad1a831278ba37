use std::path::PathBuf;

use clap::{Parser, Subcommand};
use shimbox::{RunOptions, TracingConfig, TracingFormat};

#[derive(Debug, Parser)]
#[command(name = "shimbox", version, about = "Run applications against a virtual registry and file table")]
struct Cli {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = TracingFormat::Pretty, env = "SHIMBOX_LOG_FORMAT")]
    log_format: TracingFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start an executable inside the sandbox and wait for it to end
    Run {
        /// Host config file (JSON)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// The executable targets a managed runtime
        #[arg(long)]
        managed: bool,

        /// Snapshot to seed from and flush to, overriding the config
        #[arg(long)]
        snapshot: Option<PathBuf>,

        /// JSONL change journal, overriding the config
        #[arg(long)]
        journal: Option<PathBuf>,

        executable: PathBuf,

        /// Arguments passed to the executable
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Print the contents of a snapshot file
    Snapshot { file: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    shimbox::init_subscriber_with_config(TracingConfig {
        format: cli.log_format,
        ..Default::default()
    });

    match cli.command {
        Command::Run {
            config,
            managed,
            snapshot,
            journal,
            executable,
            args,
        } => {
            let code = shimbox::run(RunOptions {
                config,
                managed,
                snapshot,
                journal,
                executable,
                args,
            })
            .await?;
            std::process::exit(code);
        }
        Command::Snapshot { file } => {
            let stdout = std::io::stdout();
            shimbox::render_snapshot(&file, &mut stdout.lock())?;
        }
    }
    Ok(())
}
