//! Auto-unlock command-line interface for operators, the web layer, and boot hooks.

use anyhow::{bail, ensure, Context, Result};
use autounlock_core::{
    archive::{SevenZipPackager, ARCHIVE_READY_MARKER},
    config::DEFAULT_CONFIG_PATH,
    derive_key,
    inspector::DeviceInspector,
    keyfile::{clear_key_file, write_key_file},
    logging,
    workflow::{process_devices, ProcessRequest},
    AutoUnlockConfig, AutoUnlockError, ConfigStore, Controller, Credential, DerivedKey,
    FileConfigStore, HardwareFingerprint, ProcessOptions, Readiness, WorkflowLevel,
    WorkflowReport,
};
use autounlock_hardware::{SystemHardwareProbe, VarIniArrayProbe};
use autounlock_luks::SystemLuksProvider;
use clap::{Parser, Subcommand};
use log::warn;
use rpassword::prompt_password;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Top-level options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "autounlock",
    version,
    about = "Bind LUKS unlock keys to this host's board serial and gateway."
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Derive the hardware key and print it with its inputs.
    GenerateKey,

    /// Install the hardware key on every encrypted device.
    Process {
        /// Report planned actions without touching any header.
        #[arg(long)]
        dry_run: bool,

        /// Place the archive in the download directory instead of the backup directory.
        #[arg(long)]
        download_mode: bool,

        /// Back up and archive headers without touching key slots.
        #[arg(long)]
        headers_only: bool,

        /// Authenticate with a keyfile instead of a passphrase.
        #[arg(long, conflicts_with = "passphrase_stdin")]
        keyfile: Option<PathBuf>,

        /// Read the passphrase from the first line of stdin instead of prompting.
        #[arg(long)]
        passphrase_stdin: bool,

        /// Read the archive password from the next line of stdin.
        #[arg(long, conflicts_with = "prompt_archive_password")]
        archive_password_stdin: bool,

        /// Prompt for the archive password (required with --keyfile).
        #[arg(long)]
        prompt_archive_password: bool,
    },

    /// Print the readiness token.
    Status,

    /// Persist enabled = true and install the boot hooks.
    Enable,

    /// Persist enabled = false and remove the boot hooks.
    Disable,

    /// Print boot hook presence: installed, missing, or partial.
    Hooks,

    /// Print how many devices the derived key unlocks.
    UnlockableCount,

    /// Print how many devices carry an annotated hardware key.
    KeysExist,

    /// Print whether the derived key unlocks at least one device.
    KeysWork,

    /// Stage the derived key as the array keyfile (boot hook).
    FetchKey,

    /// Erase the staged array keyfile (boot hook).
    ClearKey,

    /// Emit the configuration JSON schema.
    ConfigSchema,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

/// Host probes and configuration shared by the query subcommands.
struct Host {
    store: FileConfigStore,
    config: AutoUnlockConfig,
    array: VarIniArrayProbe,
    luks: SystemLuksProvider,
    hardware: SystemHardwareProbe,
}

impl Host {
    fn open(path: &Path) -> Result<Self> {
        let store = FileConfigStore::new(path);
        let config = load_cli_config(&store)?;
        let luks = SystemLuksProvider::from_config(&config).context("cryptsetup/lsblk unavailable")?;
        let hardware =
            SystemHardwareProbe::from_config(&config).context("network probes unavailable")?;
        Ok(Self {
            array: VarIniArrayProbe::from_config(&config),
            store,
            config,
            luks,
            hardware,
        })
    }

    fn readiness(
        &self,
    ) -> Readiness<'_, FileConfigStore, VarIniArrayProbe, SystemLuksProvider, SystemHardwareProbe>
    {
        Readiness {
            store: &self.store,
            array: &self.array,
            luks: &self.luks,
            hardware: &self.hardware,
            probe_timeout: self.config.probe_timeout(),
        }
    }

    fn derive(&self) -> Result<(HardwareFingerprint, DerivedKey)> {
        derive_key(&self.hardware, self.config.probe_timeout())
            .context("failed to derive the hardware key")
    }
}

fn load_cli_config(store: &FileConfigStore) -> Result<AutoUnlockConfig> {
    let config = store
        .load()
        .with_context(|| format!("failed to load configuration from {}", store.path().display()))?;
    for issue in config.validate() {
        warn!("configuration: {issue}");
    }
    Ok(config)
}

/// Dispatch to the requested subcommand.
fn run() -> Result<()> {
    logging::init("info");
    let cli = Cli::parse();

    match cli.command {
        Commands::GenerateKey => {
            let host = Host::open(&cli.config)?;
            let (fingerprint, key) = host.derive()?;
            println!("Motherboard serial: {}", fingerprint.board_serial());
            println!("Gateway MAC: {}", fingerprint.gateway_mac());
            println!("Derived key: {}", key.as_str());
        }
        Commands::Process {
            dry_run,
            download_mode,
            headers_only,
            keyfile,
            passphrase_stdin,
            archive_password_stdin,
            prompt_archive_password,
        } => {
            let options = ProcessOptions {
                dry_run,
                download_mode,
                headers_only,
            };
            let credential = read_credential(keyfile, passphrase_stdin)?;
            let archive_password = if archive_password_stdin {
                Some(read_stdin_line().context("failed to read archive password from stdin")?)
            } else if prompt_archive_password {
                Some(Zeroizing::new(
                    prompt_password("Archive password: ")
                        .context("failed to read archive password")?,
                ))
            } else {
                None
            };
            let succeeded = run_process(
                &cli.config,
                &credential,
                archive_password.as_ref().map(|pw| pw.as_str()),
                options,
            )?;
            if !succeeded {
                std::process::exit(2);
            }
        }
        Commands::Status => {
            let host = Host::open(&cli.config)?;
            let state = host
                .readiness()
                .evaluate()
                .context("failed to evaluate readiness")?;
            println!("{state}");
        }
        Commands::Enable => {
            let store = FileConfigStore::new(&cli.config);
            let report = Controller::new(&store)
                .enable()
                .context("failed to enable auto-unlock")?;
            print_report(report);
        }
        Commands::Disable => {
            let store = FileConfigStore::new(&cli.config);
            let report = Controller::new(&store)
                .disable()
                .context("failed to disable auto-unlock")?;
            print_report(report);
        }
        Commands::Hooks => {
            let store = FileConfigStore::new(&cli.config);
            let status = Controller::new(&store).hook_status()?;
            println!("{}", status.as_str());
        }
        Commands::UnlockableCount => {
            let host = Host::open(&cli.config)?;
            println!("{}", host.readiness().unlockable_count()?);
        }
        Commands::KeysExist => {
            let host = Host::open(&cli.config)?;
            println!("{}", host.readiness().keys_exist()?);
        }
        Commands::KeysWork => {
            let host = Host::open(&cli.config)?;
            println!("{}", host.readiness().keys_work()?);
        }
        Commands::FetchKey => fetch_key(&cli.config)?,
        Commands::ClearKey => {
            let store = FileConfigStore::new(&cli.config);
            let config = load_cli_config(&store)?;
            let path = config.keyfile_path();
            if clear_key_file(&path)
                .with_context(|| format!("failed to clear {}", path.display()))?
            {
                println!("Cleared {}", path.display());
            } else {
                println!("No keyfile staged at {}", path.display());
            }
        }
        Commands::ConfigSchema => {
            let schema = schema_for!(AutoUnlockConfig);
            println!("{}", to_string_pretty(&schema)?);
        }
    }

    Ok(())
}

/// Returns whether at least one device ended up added or skipped.
fn run_process(
    config_path: &Path,
    credential: &Credential,
    archive_password: Option<&str>,
    options: ProcessOptions,
) -> Result<bool> {
    let host = Host::open(config_path)?;
    let packager = SevenZipPackager::from_config(&host.config)
        .context("7z is required to archive header backups")?;
    let derived = match host.derive() {
        Ok(derived) => Some(derived),
        Err(err) => {
            warn!("{err:#}; header backups continue without a hardware key");
            None
        }
    };

    let request = ProcessRequest {
        fingerprint: derived.as_ref().map(|(fingerprint, _)| fingerprint),
        key: derived.as_ref().map(|(_, key)| key),
        credential,
        archive_password,
        options,
    };
    let report = match process_devices(&host.config, &host.luks, &packager, &request) {
        Ok(report) => report,
        Err(AutoUnlockError::NoEncryptedDevices) => bail!("no encrypted devices found"),
        Err(err) => return Err(anyhow::Error::new(err).context("device processing failed")),
    };

    print_report(report.to_workflow_report());
    if let Some(archive) = &report.archive {
        println!("{ARCHIVE_READY_MARKER}{}", archive.display());
    }
    Ok(report.succeeded())
}

fn fetch_key(config_path: &Path) -> Result<()> {
    let host = Host::open(config_path)?;
    let (_, key) = host.derive()?;

    let inspector = DeviceInspector::new(&host.luks);
    let devices = inspector.list_encrypted_devices()?;
    let unlockable = inspector.unlockable_devices(&devices, &key);
    ensure!(
        !unlockable.is_empty(),
        "derived key unlocks none of {} encrypted device(s); keyfile not staged",
        devices.len()
    );

    let path = host.config.keyfile_path();
    write_key_file(&path, key.as_bytes())
        .with_context(|| format!("failed to stage keyfile at {}", path.display()))?;
    println!(
        "Staged keyfile at {} ({} of {} device(s) unlockable)",
        path.display(),
        unlockable.len(),
        devices.len()
    );
    Ok(())
}

fn read_credential(keyfile: Option<PathBuf>, passphrase_stdin: bool) -> Result<Credential> {
    if let Some(path) = keyfile {
        ensure!(path.is_file(), "keyfile {} does not exist", path.display());
        return Ok(Credential::keyfile(path));
    }
    let passphrase = if passphrase_stdin {
        read_stdin_line().context("failed to read passphrase from stdin")?
    } else {
        Zeroizing::new(prompt_password("LUKS passphrase: ").context("failed to read passphrase")?)
    };
    ensure!(!passphrase.is_empty(), "passphrase must not be empty");
    Ok(Credential::passphrase(passphrase.as_str()))
}

fn read_stdin_line() -> io::Result<Zeroizing<String>> {
    let mut line = Zeroizing::new(String::new());
    io::stdin().lock().read_line(&mut line)?;
    let trimmed = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(trimmed);
    Ok(line)
}

/// Print a workflow report followed by its events.
fn print_report(report: WorkflowReport) {
    println!("{}", report.title);
    for event in report.events {
        println!("  [{}] {}", level_tag(event.level), event.message);
    }
}

/// Short tag used when printing workflow severity levels.
fn level_tag(level: WorkflowLevel) -> &'static str {
    match level {
        WorkflowLevel::Info => "INFO",
        WorkflowLevel::Success => "OK",
        WorkflowLevel::Warn => "WARN",
        WorkflowLevel::Error => "ERR",
        WorkflowLevel::Security => "SEC",
    }
}
