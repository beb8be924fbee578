use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::{Read, Write};

mod je;

use je::mock::EmulatorBackend;
use je::path::{DEFAULT_JAIL_ROOT, DEFAULT_POOL};
#[cfg(feature = "libzfs")]
use je::zfs::LibZfsBackend;
use je::{Activation, Backend, Engine, Imported, Layout, Update};

#[derive(Parser)]
#[command(version, about = "Jail Environment Administration")]
struct Cli {
    /// Set the jail root
    ///
    /// The jail root is a dataset with one child dataset per jail.
    #[arg(
        short = 'R',
        long = "jail-root",
        env = "JECTL_JAIL_ROOT",
        default_value = DEFAULT_JAIL_ROOT,
        global = true,
        help_heading = "Global options"
    )]
    jail_root: String,

    /// Set the jail environment pool
    ///
    /// The pool holds jail environments that are not yet in use by any jail.
    #[arg(
        short = 'P',
        long = "pool",
        env = "JECTL_POOL",
        default_value = DEFAULT_POOL,
        global = true,
        help_heading = "Global options"
    )]
    pool: String,

    /// Verbose output
    #[arg(short = 'v', global = true, help_heading = "Global options")]
    verbose: bool,

    /// Client implementation
    #[arg(
        long = "client",
        global = true,
        help_heading = "Global options",
        value_enum,
        default_value_t = ClientType::default()
    )]
    client: ClientType,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Make a jail environment the active one for a jail.
    ///
    /// An environment that is not yet in the jail is cloned from the pool.
    Activate {
        /// The jail.
        jail: String,

        /// The jail environment to activate.
        environment: String,
    },
    /// Show jails, their jail environments and the pool.
    Dump {
        /// Show only this jail.
        jail: Option<String>,

        /// Print the report as JSON.
        #[cfg(feature = "json")]
        #[arg(long)]
        json: bool,
    },
    /// Import a jail or jail environment from a replication stream on
    /// standard input.
    Import {
        /// A name for the new jail or jail environment.
        name: String,
    },
    /// List the datasets of all jails and the pool.
    List {
        /// List only this jail.
        jail: Option<String>,
    },
    /// Mount the active jail environment of a jail.
    Mount {
        /// The jail.
        jail: String,

        /// Where to mount it.
        #[arg(value_hint = clap::ValueHint::DirPath)]
        mountpoint: String,
    },
    /// Unmount the active jail environment of a jail.
    #[command(alias = "unmount")]
    Umount {
        /// The jail.
        jail: String,

        /// Force unmounting.
        #[arg(short = 'f')]
        force: bool,
    },
    /// Activate the newest compatible jail environment from the pool.
    Update {
        /// The jail.
        jail: String,

        /// Mount the active jail environment here afterwards.
        #[arg(value_hint = clap::ValueHint::DirPath)]
        mountpoint: Option<String>,
    },
}

/// Client selection.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum ClientType {
    /// Use LibZFS directly.
    #[cfg(feature = "libzfs")]
    #[value(name = "libzfs")]
    LibZfs,
    /// Use a mock/emulator client (for testing).
    #[value(name = "mock")]
    Mock,
}

impl Default for ClientType {
    #[cfg(feature = "libzfs")]
    fn default() -> Self {
        ClientType::LibZfs
    }

    #[cfg(not(feature = "libzfs"))]
    fn default() -> Self {
        ClientType::Mock
    }
}

fn execute_command<B: Backend>(
    command: &Commands,
    engine: &Engine<B>,
    input: &mut dyn Read,
    output: &mut dyn Write,
) -> Result<()> {
    match command {
        Commands::Activate { jail, environment } => {
            let activation = engine
                .activate(jail, environment)
                .context("Failed to activate jail environment")?;
            match activation {
                Activation::AlreadyActive => writeln!(
                    output,
                    "'{}' is already active for jail '{}'.",
                    environment, jail
                )?,
                Activation::First => {
                    writeln!(output, "Activated '{}' for jail '{}'.", environment, jail)?
                }
                Activation::Swapped { previous } => writeln!(
                    output,
                    "Activated '{}' for jail '{}' (previously '{}').",
                    environment,
                    jail,
                    previous.basename()
                )?,
            }
            Ok(())
        }
        #[cfg(feature = "json")]
        Commands::Dump { jail, json: true } => {
            let report = engine
                .report(jail.as_deref())
                .context("Failed to read jail environments")?;
            serde_json::to_writer_pretty(&mut *output, &report)
                .context("Failed to write report")?;
            writeln!(output)?;
            Ok(())
        }
        Commands::Dump { jail, .. } => {
            let report = engine
                .report(jail.as_deref())
                .context("Failed to read jail environments")?;
            write!(output, "{}", report)?;
            Ok(())
        }
        Commands::Import { name } => {
            let imported = engine
                .import(name, input)
                .with_context(|| format!("Failed to import '{}'", name))?;
            match imported {
                Imported::Jail { .. } => writeln!(output, "Imported jail '{}'.", name)?,
                Imported::Environment { .. } => {
                    writeln!(output, "Imported jail environment '{}'.", name)?
                }
            }
            Ok(())
        }
        Commands::List { jail } => {
            let roots = match jail {
                Some(jail) => vec![engine.jail(jail)?],
                None => vec![
                    engine.layout().jail_root.clone(),
                    engine.layout().pool.clone(),
                ],
            };
            engine
                .backend()
                .list(&roots, output)
                .context("Failed to list datasets")?;
            Ok(())
        }
        Commands::Mount { jail, mountpoint } => {
            engine
                .mount(jail, mountpoint)
                .context("Failed to mount jail environment")?;
            Ok(())
        }
        Commands::Umount { jail, force } => {
            engine
                .unmount(jail, *force)
                .context("Failed to unmount jail environment")?;
            Ok(())
        }
        Commands::Update { jail, mountpoint } => {
            let updated = engine.update(jail);
            match &updated {
                Ok(Update::UpToDate) => writeln!(output, "'{}' is up to date.", jail)?,
                Ok(Update::Updated { from, to }) => writeln!(
                    output,
                    "Updated '{}' from '{}' to '{}'.",
                    jail,
                    from.basename(),
                    to.basename()
                )?,
                Err(_) => {}
            }

            // The jail is mounted whether or not the update went through.
            if let Some(mountpoint) = mountpoint {
                let mounted = engine.mount(jail, mountpoint);
                if let (Err(err), Err(_)) = (&mounted, &updated) {
                    tracing::error!(jail = %jail, error = %err, "failed to mount jail environment");
                } else {
                    mounted.context("Failed to mount jail environment")?;
                }
            }
            updated.with_context(|| format!("Failed to update '{}'", jail))?;
            Ok(())
        }
    }
}

fn run<B: Backend>(command: &Commands, engine: Engine<B>) -> Result<()> {
    engine
        .init_root()
        .context("Failed to create the jail dataset layout")?;
    execute_command(
        command,
        &engine,
        &mut std::io::stdin().lock(),
        &mut std::io::stdout().lock(),
    )
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("JECTL_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    let layout = Layout::new(&cli.jail_root, &cli.pool).context("Invalid dataset layout")?;
    match cli.client {
        ClientType::Mock => run(&cli.command, Engine::new(EmulatorBackend::sampled(), layout)),
        #[cfg(feature = "libzfs")]
        ClientType::LibZfs => run(&cli.command, Engine::new(LibZfsBackend::new(), layout)),
    }
}
