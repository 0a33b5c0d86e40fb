// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use hostdev::discovery::DEFAULT_SYSFS_ROOT;
use hostdev::logger::{
    DEFAULT_INSTANCE_ID, HostDevLineWriter, INSTANCE_ID, IncMetric, LOGGER, LoggerUpdateError,
    METRICS, MetricsError, error, info,
};
use hostdev::{
    AllocatorError, BoundDevice, ConfigError, HostDeviceAllocator, LaunchConfig, PoolSet,
    SysfsMdevParents,
};

/// Process exit codes of the allocator.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostDevExitCode {
    /// Devices bound, result written.
    Ok = 0,
    /// Generic error.
    GenericError = 1,
    /// Launch configuration or discovery input is invalid.
    BadConfiguration = 152,
    /// Command line arguments could not be parsed.
    ArgParsing = 153,
    /// Not enough free devices for a requested resource.
    InsufficientDevices = 160,
    /// Pools changed between the capacity check and the commit.
    AllocationRace = 161,
}

#[derive(Debug, thiserror::Error, displaydoc::Display)]
enum HostDevAllocError {
    /// Invalid launch configuration: {0}
    Config(#[from] ConfigError),
    /// Failed to configure the logger: {0}
    Logger(#[from] LoggerUpdateError),
    /// Failed to open {0}: {1}
    Open(PathBuf, std::io::Error),
    /// Failed to initialize metrics: {0}
    Metrics(#[from] MetricsError),
    /// Failed to allocate host devices: {0}
    Allocate(#[from] AllocatorError),
    /// Failed to serialize the result: {0}
    Serialize(#[from] serde_json::Error),
    /// Failed to write the result: {0}
    Write(std::io::Error),
}

impl HostDevAllocError {
    fn exit_code(&self) -> HostDevExitCode {
        match self {
            HostDevAllocError::Config(_) => HostDevExitCode::BadConfiguration,
            HostDevAllocError::Allocate(AllocatorError::InsufficientDevices { .. }) => {
                HostDevExitCode::InsufficientDevices
            }
            HostDevAllocError::Allocate(
                AllocatorError::AllocationRaceDetected { .. } | AllocatorError::MissingParent { .. },
            ) => HostDevExitCode::AllocationRace,
            HostDevAllocError::Allocate(AllocatorError::Release { .. }) => {
                HostDevExitCode::GenericError
            }
            // Everything else is rejected by validation, i.e. the request itself is wrong.
            HostDevAllocError::Allocate(_) => HostDevExitCode::BadConfiguration,
            HostDevAllocError::Logger(_)
            | HostDevAllocError::Open(..)
            | HostDevAllocError::Metrics(_)
            | HostDevAllocError::Serialize(_)
            | HostDevAllocError::Write(_) => HostDevExitCode::GenericError,
        }
    }
}

#[derive(Debug, Parser)]
#[command(version, about = "Binds host passthrough devices to a guest launch.")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Allocate the devices requested by a launch configuration.
    Allocate {
        /// Path of the launch configuration file.
        #[arg(short, long, value_name = "PATH")]
        config: PathBuf,
        /// Path of the output file. The bound devices are printed to stdout when omitted.
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
        /// Path of the file metrics are appended to.
        #[arg(long, value_name = "PATH")]
        metrics: Option<PathBuf>,
        /// Identifier of the launch, used in log lines.
        #[arg(long, value_name = "ID", default_value = DEFAULT_INSTANCE_ID)]
        instance_id: String,
        /// Mount point of sysfs, used to resolve mediated device parents.
        #[arg(long, value_name = "PATH", default_value = DEFAULT_SYSFS_ROOT)]
        sysfs_root: PathBuf,
    },
    /// Print the free and used devices of every pool described by a launch configuration.
    Inspect {
        /// Path of the launch configuration file.
        #[arg(short, long, value_name = "PATH")]
        config: PathBuf,
        /// Mount point of sysfs, used to resolve mediated device parents.
        #[arg(long, value_name = "PATH", default_value = DEFAULT_SYSFS_ROOT)]
        sysfs_root: PathBuf,
    },
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn load(config: &Path, sysfs_root: &Path) -> Result<(LaunchConfig, PoolSet), HostDevAllocError> {
    let config = LaunchConfig::from_file(config)?;
    if let Some(logger) = config.logger.clone() {
        LOGGER.update(logger)?;
    }
    let pools = config.build_pools(env_lookup, &SysfsMdevParents::new(sysfs_root))?;
    Ok((config, pools))
}

fn write_output(output: Option<&Path>, json: &str) -> Result<(), HostDevAllocError> {
    match output {
        Some(path) => std::fs::write(path, format!("{json}\n")).map_err(HostDevAllocError::Write),
        None => writeln!(std::io::stdout(), "{json}").map_err(HostDevAllocError::Write),
    }
}

fn init_metrics(path: &Path) -> Result<(), HostDevAllocError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| HostDevAllocError::Open(path.to_path_buf(), err))?;
    METRICS.init(HostDevLineWriter::new(file))?;
    Ok(())
}

fn flush_metrics() {
    if let Err(err) = METRICS.write() {
        METRICS.app_metrics.logger.missed_metrics_count.inc();
        error!("Failed to write metrics: {err}");
    }
}

fn allocate(
    config: &Path,
    output: Option<&Path>,
    sysfs_root: &Path,
) -> Result<Vec<BoundDevice>, HostDevAllocError> {
    let (config, pools) = load(config, sysfs_root)?;
    let devices = HostDeviceAllocator::new(pools).allocate(&config.devices)?;

    let json = serde_json::to_string_pretty(&devices)?;
    write_output(output, &json)?;

    info!("Bound {} host device(s)", devices.len());
    Ok(devices)
}

fn inspect(config: &Path, sysfs_root: &Path) -> Result<(), HostDevAllocError> {
    let (_, pools) = load(config, sysfs_root)?;
    let json = serde_json::to_string_pretty(&pools.usage())?;
    write_output(None, &json)
}

fn run(cli: Cli) -> Result<(), HostDevAllocError> {
    match cli.command {
        Command::Allocate {
            config,
            output,
            metrics,
            instance_id,
            sysfs_root,
        } => {
            // Only fails if it was already set, in which case the first id stays.
            let _ = INSTANCE_ID.set(instance_id);
            if let Some(metrics) = &metrics {
                init_metrics(metrics)?;
            }

            let result = allocate(&config, output.as_deref(), &sysfs_root);
            flush_metrics();
            result.map(|_| ())
        }
        Command::Inspect { config, sysfs_root } => inspect(&config, &sysfs_root),
    }
}

fn main_exit_code() -> HostDevExitCode {
    if let Err(err) = LOGGER.init() {
        eprintln!("Failed to initialize logger: {err}");
        return HostDevExitCode::GenericError;
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Help and version requests also end up here.
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => HostDevExitCode::Ok,
                _ => HostDevExitCode::ArgParsing,
            };
            if let Err(print_err) = err.print() {
                eprintln!("Failed to print arguments error: {print_err}");
            }
            return code;
        }
    };

    match run(cli) {
        Ok(()) => HostDevExitCode::Ok,
        Err(err) => {
            error!("{err}");
            eprintln!("Error: {err}");
            err.exit_code()
        }
    }
}

#[allow(clippy::exit)]
fn main() {
    let exit_code = main_exit_code();
    std::process::exit(exit_code as i32);
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use hostdev::ResourceName;
    use hostdev::pool::PoolError;
    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    const CONFIG: &str = r#"{
        "discovery": {
            "resources": [
                { "name": "gpu.example.com/teslaT4", "kind": "pci",
                  "devices": [{ "address": "0000:81:00.0" }, { "address": "0000:82:00.0" }] }
            ]
        },
        "devices": [
            { "name": "gpu0", "class": "gpu", "resource_name": "gpu.example.com/teslaT4" }
        ]
    }"#;

    fn config_file(contents: &str) -> TempFile {
        let file = TempFile::new().unwrap();
        file.as_file().write_all(contents.as_bytes()).unwrap();
        file
    }

    fn t4() -> ResourceName {
        ResourceName::new("gpu.example.com/teslaT4").unwrap()
    }

    #[test]
    fn test_exit_codes() {
        let insufficient = HostDevAllocError::Allocate(AllocatorError::InsufficientDevices {
            resource: t4(),
            requested: 3,
            available: 2,
        });
        assert_eq!(
            insufficient.exit_code(),
            HostDevExitCode::InsufficientDevices
        );
        assert_eq!(insufficient.exit_code() as i32, 160);

        let race = HostDevAllocError::Allocate(AllocatorError::AllocationRaceDetected {
            resource: t4(),
            requested: 1,
            available: 0,
        });
        assert_eq!(race.exit_code() as i32, 161);

        let unknown = HostDevAllocError::Allocate(AllocatorError::UnknownResource(t4()));
        assert_eq!(unknown.exit_code(), HostDevExitCode::BadConfiguration);

        let release = HostDevAllocError::Allocate(AllocatorError::Release {
            resource: t4(),
            source: PoolError::UnknownResource(t4()),
        });
        assert_eq!(release.exit_code(), HostDevExitCode::GenericError);

        let config = HostDevAllocError::Config(ConfigError::Read(std::io::Error::from(
            std::io::ErrorKind::NotFound,
        )));
        assert_eq!(config.exit_code() as i32, 152);
    }

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["hostdev-alloc", "allocate", "--config", "launch.json"])
            .unwrap();
        match cli.command {
            Command::Allocate {
                config,
                output,
                metrics,
                instance_id,
                sysfs_root,
            } => {
                assert_eq!(config, PathBuf::from("launch.json"));
                assert_eq!(output, None);
                assert_eq!(metrics, None);
                assert_eq!(instance_id, DEFAULT_INSTANCE_ID);
                assert_eq!(sysfs_root, PathBuf::from(DEFAULT_SYSFS_ROOT));
            }
            Command::Inspect { .. } => panic!("unexpected subcommand"),
        }

        Cli::try_parse_from(["hostdev-alloc", "allocate"]).unwrap_err();
        Cli::try_parse_from(["hostdev-alloc", "release", "--config", "launch.json"]).unwrap_err();
    }

    #[test]
    fn test_allocate_to_file() {
        let config = config_file(CONFIG);
        let output = TempFile::new().unwrap();

        let devices = allocate(
            config.as_path(),
            Some(output.as_path()),
            Path::new(DEFAULT_SYSFS_ROOT),
        )
        .unwrap();
        assert_eq!(devices.len(), 1);

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(output.as_path()).unwrap()).unwrap();
        assert_eq!(
            written,
            serde_json::json!([{
                "resource_name": "gpu.example.com/teslaT4",
                "kind": "pci",
                "address": "0000:81:00.0",
                "alias": "ua-gpu-gpu0"
            }])
        );
    }

    #[test]
    fn test_allocate_errors() {
        let config = config_file(&CONFIG.replace(
            r#""resource_name": "gpu.example.com/teslaT4""#,
            r#""resource_name": "gpu.example.com/teslaT4", "count": 3"#,
        ));
        let err = allocate(config.as_path(), None, Path::new(DEFAULT_SYSFS_ROOT)).unwrap_err();
        assert_eq!(err.exit_code(), HostDevExitCode::InsufficientDevices);

        let config = config_file(r#"{ "devices": [], "unknown": 1 }"#);
        let err = allocate(config.as_path(), None, Path::new(DEFAULT_SYSFS_ROOT)).unwrap_err();
        assert_eq!(err.exit_code(), HostDevExitCode::BadConfiguration);
    }
}
