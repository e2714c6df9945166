// wale-provision - Converges WAL-E credentials and settings onto a host
//
// This is the main entry point for the application.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::Path;
use std::process::Command;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wale_provision::config::Config;
use wale_provision::converge::ConvergenceDriver;
use wale_provision::lock::ConvergeLock;
use wale_provision::materializer::{ArtifactKind, Outcome};

/// wale-provision - Converges WAL-E credentials and settings onto a host
#[derive(Parser, Debug)]
#[command(name = "wale-provision")]
#[command(version)]
#[command(about = "Converges WAL-E credentials and settings onto a host", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve credentials and write the WAL-E configuration files
    Converge {
        /// Path to the configuration file (default: wal-e.yaml)
        #[arg(short, long, default_value = "wal-e.yaml")]
        config: String,
    },

    /// Show the files a convergence would write, without writing them
    Plan {
        /// Path to the configuration file (default: wal-e.yaml)
        #[arg(short, long, default_value = "wal-e.yaml")]
        config: String,
    },

    /// Check that WAL-E and its prerequisites are installed
    Doctor {
        /// Path to the configuration file (default: wal-e.yaml)
        #[arg(short, long, default_value = "wal-e.yaml")]
        config: String,
    },
}

fn init_tracing() {
    // Logs go to stderr so command output stays clean on stdout.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn load_config(config_path: &str) -> Result<Config> {
    let config = Config::from_file(config_path)
        .with_context(|| format!("Failed to load config from: {}", config_path))?;

    config
        .validate()
        .with_context(|| "Configuration validation failed")?;

    Ok(config)
}

fn run_converge(config_path: &str) -> Result<()> {
    println!("🔐 wale-provision converge");
    println!("Loading configuration from: {}\n", config_path);

    // Step 1: Load and validate configuration
    let config = load_config(config_path)?;
    println!("✓ Configuration loaded and validated");

    // Step 2: Serialize against other runs on this host
    let lock_path = config.lock_path()?;
    let _lock = ConvergeLock::acquire(&lock_path)?;
    println!("✓ Lock acquired: {}", lock_path.display());

    // Step 3: Resolve, derive and materialize
    let source = config.credential_source()?;
    let mut driver = ConvergenceDriver::new(&source, config.layout()?);

    let report = driver
        .run(&config.selector(), &config.declared_settings())
        .map_err(|e| {
            let state = e.state();
            anyhow::Error::new(e).context(format!("Convergence failed while {}", state))
        })?;

    // Step 4: Summary (paths only, never contents)
    println!("\n📁 Artifacts:");
    for applied in &report.applied {
        let marker = if applied.outcome.is_change() { "→" } else { "·" };
        println!("  {} {} ({})", marker, applied.path.display(), applied.outcome);
    }

    let changed = report
        .applied
        .iter()
        .filter(|a| a.outcome.is_change())
        .count();
    println!(
        "\n✅ Converged: {} changed, {} up to date",
        changed,
        report.count(Outcome::Unchanged) + report.count(Outcome::AlreadyAbsent)
    );

    Ok(())
}

fn run_plan(config_path: &str) -> Result<()> {
    println!("📋 wale-provision plan");
    println!("Loading configuration from: {}\n", config_path);

    let config = load_config(config_path)?;
    let source = config.credential_source()?;
    let driver = ConvergenceDriver::new(&source, config.layout()?);

    let plan = driver
        .plan(&config.selector(), &config.declared_settings())
        .with_context(|| "Failed to build plan")?;

    for artifact in &plan {
        match &artifact.kind {
            ArtifactKind::Directory { ownership } => println!(
                "  dir     {} {}:{} {:o}",
                artifact.path.display(),
                ownership.owner,
                ownership.group,
                ownership.mode
            ),
            ArtifactKind::File {
                ownership,
                contents,
            } => println!(
                "  file    {} {}:{} {:o} ({} bytes)",
                artifact.path.display(),
                ownership.owner,
                ownership.group,
                ownership.mode,
                contents.len()
            ),
            ArtifactKind::Absent => println!("  absent  {}", artifact.path.display()),
        }
    }

    println!("\n✓ {} artifact(s) planned", plan.len());
    Ok(())
}

fn check_binary(name: &str) -> bool {
    which::which(name).is_ok()
}

fn check_file_exists(path: &Path) -> bool {
    path.exists()
}

fn installed_wale_version(wale: &Path) -> Option<String> {
    let output = Command::new(wale).arg("version").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!version.is_empty()).then_some(version)
}

fn run_doctor(config_path: &str) -> Result<()> {
    println!("🔍 wale-provision Doctor");
    println!("Checking prerequisites...\n");

    let mut all_checks_passed = true;

    // Check 1: configuration
    print!("1. Checking configuration file '{}'... ", config_path);
    let config = match load_config(config_path) {
        Ok(config) => {
            println!("✓");
            config
        }
        Err(e) => {
            println!("✗");
            println!("   ❌ {:#}", e);
            println!("\n❌ Some checks failed. Please fix the issues above.");
            return Err(anyhow::anyhow!("Doctor checks failed"));
        }
    };

    // Check 2: binaries WAL-E shells out to
    for (index, binary) in config.install.binaries.iter().enumerate() {
        print!("{}. Checking if '{}' is installed... ", index + 2, binary);
        if check_binary(binary) {
            println!("✓");
        } else {
            println!("✗");
            println!("   ❌ '{}' is not installed or not in PATH", binary);
            all_checks_passed = false;
        }
    }
    let mut step = config.install.binaries.len() + 2;

    // Check 3: WAL-E itself, at the pinned version
    let wale = config.wale_binary()?;
    let expected = &config.install.version;
    print!("{}. Checking WAL-E {} at {}... ", step, expected, wale.display());
    if !check_file_exists(&wale) {
        println!("✗");
        println!("   ❌ WAL-E is not installed in the virtualenv");
        all_checks_passed = false;
    } else {
        match installed_wale_version(&wale) {
            Some(found) if &found == expected => println!("✓"),
            Some(found) => {
                println!("✗");
                println!("   ❌ WAL-E version mismatch: found {}, expected {}", found, expected);
                all_checks_passed = false;
            }
            None => {
                println!("✗");
                println!("   ❌ WAL-E is installed but 'wal-e version' failed");
                all_checks_passed = false;
            }
        }
    }
    step += 1;

    // Check 4: data bag directory
    let data_bags = config.data_bag_path()?.join(&config.s3.data_bag);
    print!("{}. Checking data bag directory {}... ", step, data_bags.display());
    if data_bags.is_dir() {
        println!("✓");
    } else {
        println!("✗");
        println!("   ❌ Data bag directory not found");
        all_checks_passed = false;
    }
    step += 1;

    // Check 5: decryption key, only needed for encrypted data bags
    print!("{}. Checking data bag secret key... ", step);
    if config.s3.use_encrypted_data_bag {
        let key_file = config.secret_key_file()?;
        if check_file_exists(&key_file) {
            println!("✓");
        } else {
            println!("✗");
            println!("   ❌ File not found: {}", key_file.display());
            all_checks_passed = false;
        }
    } else {
        println!("⊘");
        println!("   ⚠️  Skipped (plain data bag selected)");
    }

    println!();
    if all_checks_passed {
        println!("✅ All checks passed! Your system is ready.");
        Ok(())
    } else {
        println!("❌ Some checks failed. Please fix the issues above.");
        Err(anyhow::anyhow!("Doctor checks failed"))
    }
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Converge { config } => run_converge(&config),
        Commands::Plan { config } => run_plan(&config),
        Commands::Doctor { config } => run_doctor(&config),
    };

    if let Err(e) = result {
        eprintln!("\nError: {:#}", e);
        eprintln!("💡 Run 'wale-provision doctor' to check your configuration.");
        std::process::exit(1);
    }
}
