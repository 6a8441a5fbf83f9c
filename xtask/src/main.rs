use std::path::{Path, PathBuf};
use std::process::Command;
use std::{env, fs};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

const BIN: &str = "fsaudit";
const INSTALL_PATH: &str = "/usr/local/bin/fsaudit";
const ENV_FILE: &str = "/etc/fsaudit/fsaudit.env";

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build, run and package fsaudit")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the agent (the BPF object is compiled and embedded by build.rs)
    Build {
        #[arg(long)]
        release: bool,

        /// Target triple for cross-compilation, e.g. aarch64-unknown-linux-gnu
        #[arg(long)]
        target: Option<String>,
    },

    /// Build, then run the agent under sudo
    Run {
        #[arg(long)]
        release: bool,

        /// Arguments passed through to fsaudit
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Print the systemd unit, or write it to a file
    ServiceUnit {
        /// EnvironmentFile for the unit
        #[arg(long, default_value = ENV_FILE)]
        env_file: String,

        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Build a release tarball with install scripts
    Package {
        #[arg(long)]
        target: Option<String>,

        #[arg(long, default_value = "dist")]
        output: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build { release, target } => {
            build(release, target.as_deref())?;
        }
        Commands::Run { release, args } => run(release, &args)?,
        Commands::ServiceUnit { env_file, output } => {
            let unit = systemd_unit(&env_file);
            match output {
                Some(path) => {
                    fs::write(&path, unit)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("Wrote {}", path.display());
                }
                None => print!("{}", unit),
            }
        }
        Commands::Package { target, output } => {
            package(target.as_deref(), &output)?;
        }
    }

    Ok(())
}

fn project_root() -> Result<PathBuf> {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .context("xtask has no parent directory")
}

fn binary_path(root: &Path, release: bool, target: Option<&str>) -> PathBuf {
    let profile = if release { "release" } else { "debug" };
    let mut dir = root.join("target");
    if let Some(t) = target {
        dir = dir.join(t);
    }
    dir.join(profile).join(BIN)
}

/// Builds the agent and returns the path of the binary.
fn build(release: bool, target: Option<&str>) -> Result<PathBuf> {
    let root = project_root()?;

    println!("Building {}...", BIN);

    // Only Linux can host the BPF toolchain; elsewhere go through `cross`.
    let cross = target.is_some_and(|t| t.contains("linux")) && !cfg!(target_os = "linux");
    let program = if cross {
        which::which("cross").context(
            "Cross-compiling to Linux needs `cross` (cargo install cross) and a running Docker",
        )?;
        "cross"
    } else {
        "cargo"
    };

    let mut cmd = Command::new(program);
    cmd.current_dir(&root).args(["build", "-p", BIN]);
    if release {
        cmd.arg("--release");
    }
    if let Some(t) = target {
        cmd.args(["--target", t]);
    }

    let status = cmd
        .status()
        .with_context(|| format!("Failed to run {} build", program))?;
    if !status.success() {
        bail!("Build failed");
    }

    let binary = binary_path(&root, release, target);
    if !binary.exists() {
        bail!("Binary not found at: {}", binary.display());
    }
    println!("Built {}", binary.display());
    Ok(binary)
}

fn run(release: bool, args: &[String]) -> Result<()> {
    let binary = build(release, None)?;

    // Keep RUST_LOG and the FSAUDIT_* settings across sudo.
    let mut preserved = vec!["RUST_LOG".to_string(), "OTEL_EXPORTER_OTLP_ENDPOINT".to_string()];
    preserved.extend(env::vars().map(|(k, _)| k).filter(|k| k.starts_with("FSAUDIT_")));

    let status = Command::new("sudo")
        .arg(format!("--preserve-env={}", preserved.join(",")))
        .arg(&binary)
        .args(args)
        .status()
        .context("Failed to run sudo")?;
    if !status.success() {
        bail!("{} exited with {}", BIN, status);
    }
    Ok(())
}

fn systemd_unit(env_file: &str) -> String {
    format!(
        r#"[Unit]
Description=fsaudit file access auditing (eBPF)
After=local-fs.target

[Service]
Type=simple
ExecStart={exe}
Restart=on-failure
RestartSec=5
EnvironmentFile=-{env_file}

NoNewPrivileges=no
CapabilityBoundingSet=CAP_SYS_ADMIN CAP_BPF CAP_PERFMON CAP_SYS_RESOURCE
AmbientCapabilities=CAP_SYS_ADMIN CAP_BPF CAP_PERFMON CAP_SYS_RESOURCE

[Install]
WantedBy=multi-user.target
"#,
        exe = INSTALL_PATH,
        env_file = env_file,
    )
}

fn package(target: Option<&str>, output_dir: &str) -> Result<()> {
    let binary = build(true, target)?;

    let root = project_root()?;
    let output_path = root.join(output_dir);
    let arch = target.unwrap_or(env::consts::ARCH);
    let package_name = format!("{}-{}-{}", BIN, env!("CARGO_PKG_VERSION"), arch);
    let package_dir = output_path.join(&package_name);
    fs::create_dir_all(&package_dir).context("Failed to create package directory")?;

    fs::copy(&binary, package_dir.join(BIN))?;

    let env_example = root.join("fsaudit.env.example");
    if env_example.exists() {
        fs::copy(&env_example, package_dir.join("fsaudit.env.example"))?;
    }

    fs::write(package_dir.join("fsaudit.service"), systemd_unit(ENV_FILE))?;
    fs::write(package_dir.join("install.sh"), install_script())?;

    let tarball = output_path.join(format!("{}.tar.gz", package_name));
    let status = Command::new("tar")
        .current_dir(&output_path)
        .arg("-czf")
        .arg(&tarball)
        .arg(&package_name)
        .status()
        .context("Failed to run tar")?;
    if !status.success() {
        bail!("Failed to create tarball");
    }

    fs::remove_dir_all(&package_dir)?;
    println!("Package created: {}", tarball.display());
    Ok(())
}

fn install_script() -> String {
    format!(
        r#"#!/bin/bash
set -e

CONFIG_DIR="$(dirname {env_file})"

sudo install -m 755 {bin} {exe}
sudo mkdir -p "$CONFIG_DIR"
if [ -f fsaudit.env.example ] && [ ! -f {env_file} ]; then
    sudo cp fsaudit.env.example {env_file}
fi

sudo install -m 644 fsaudit.service /etc/systemd/system/fsaudit.service
sudo systemctl daemon-reload
sudo systemctl enable fsaudit

echo "Installed {exe}; start with: sudo systemctl start fsaudit"
"#,
        bin = BIN,
        exe = INSTALL_PATH,
        env_file = ENV_FILE,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_points_at_the_env_file_and_binary() {
        let unit = systemd_unit("/tmp/custom.env");
        assert!(unit.contains("ExecStart=/usr/local/bin/fsaudit\n"));
        assert!(unit.contains("EnvironmentFile=-/tmp/custom.env\n"));
        assert!(unit.contains("CAP_BPF"));
    }

    #[test]
    fn binary_path_includes_target_triple() {
        let root = Path::new("/w");
        assert_eq!(
            binary_path(root, true, Some("aarch64-unknown-linux-gnu")),
            PathBuf::from("/w/target/aarch64-unknown-linux-gnu/release/fsaudit")
        );
        assert_eq!(
            binary_path(root, false, None),
            PathBuf::from("/w/target/debug/fsaudit")
        );
    }
}
