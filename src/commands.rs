//! CLI commands for apkforge
//!
//! Each command loads the pipeline configuration, runs, and prints a short
//! report. Failures are returned as `BuildError` so the binary can map
//! them to a per-stage exit code.

use std::path::PathBuf;

use tracing::info;

use apkforge_build_engine::{ArtifactInspector, BuildOptions, BuildRunner, BuildVariant};
use apkforge_core::events::{Event, EventSubscription};
use apkforge_core::{Abi, PipelineConfig, Result};

/// `apkforge build`
pub struct BuildCommand {
    pub manifest: PathBuf,
    pub config: Option<PathBuf>,
    pub release: bool,
    pub abis: Vec<Abi>,
    pub reproducible: bool,
    pub jobs: Option<usize>,
}

impl BuildCommand {
    pub async fn execute(&self) -> Result<PathBuf> {
        let config = PipelineConfig::load(self.config.as_deref()).await?;
        let runner = BuildRunner::new(config)?;
        let progress = runner.events().subscribe();
        std::thread::spawn(move || print_progress(progress));

        let options = BuildOptions {
            variant: if self.release {
                BuildVariant::Release
            } else {
                BuildVariant::Debug
            },
            abis: (!self.abis.is_empty()).then(|| self.abis.clone()),
            reproducible: self.reproducible,
            jobs: self.jobs,
        };

        info!("Building {:?}", self.manifest);
        let output = runner.build(&self.manifest, &options).await?;

        for failure in &output.compile_failures {
            eprintln!("warning: {} [{}] left out: {}", failure.dependency, failure.abi, failure.kind);
        }
        println!(
            "Built {} ({}, {:.1}s)",
            output.artifact.path.display(),
            ArtifactInspector::format_size(output.artifact.size),
            output.duration.as_secs_f64()
        );
        println!("sha256 {}", output.artifact.sha256);
        Ok(output.artifact.path)
    }
}

/// `apkforge check`
pub struct CheckCommand {
    pub manifest: PathBuf,
    pub config: Option<PathBuf>,
}

impl CheckCommand {
    pub async fn execute(&self) -> Result<()> {
        let config = PipelineConfig::load(self.config.as_deref()).await?;
        let report = BuildRunner::new(config)?.check(&self.manifest).await?;
        let manifest = &report.manifest;
        let platform = manifest.platform();

        for warning in &report.warnings {
            eprintln!("warning: {}", warning);
        }
        println!("{} {}", manifest.package_id(), manifest.version());
        println!(
            "  api {} (min {}, ndk {}), sdk {}, ndk {}",
            platform.target_api,
            platform.min_api,
            platform.ndk_api,
            platform.sdk_version,
            platform.ndk_version
        );
        let abis: Vec<&str> = manifest.archs().iter().map(|a| a.abi_name()).collect();
        println!("  abis: {}", abis.join(", "));
        println!(
            "  requirements: {}",
            manifest
                .requirements()
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(())
    }
}

/// `apkforge inspect`
pub struct InspectCommand {
    pub artifact: PathBuf,
}

impl InspectCommand {
    pub fn execute(&self) -> Result<()> {
        let info = ArtifactInspector::inspect(&self.artifact)?;

        println!(
            "{} ({}, {})",
            info.path.display(),
            info.artifact,
            ArtifactInspector::format_size(info.size)
        );
        // Linked manifests are binary; the build metadata carries the same fields
        match (&info.manifest, &info.metadata) {
            (Some(m), _) => println!(
                "  package {} {} (code {})",
                m.package,
                m.version_name.as_deref().unwrap_or("?"),
                m.version_code.map(|c| c.to_string()).unwrap_or_else(|| "?".into())
            ),
            (None, Some(meta)) => println!(
                "  package {} {} (code {})",
                meta.package, meta.version, meta.version_code
            ),
            (None, None) => println!("  manifest not readable"),
        }
        println!("  signed: {}", if info.signed { "yes" } else { "no" });
        println!("  abis: {}", info.abis().join(", "));
        for lib in &info.native_libs {
            println!("    {}/{} ({})", lib.abi, lib.name, ArtifactInspector::format_size(lib.size));
        }
        for (key, value) in &info.build_info {
            println!("  {}: {}", key, value);
        }
        Ok(())
    }
}

/// Print pipeline events until the bus goes away
fn print_progress(events: EventSubscription) {
    for event in events.iter() {
        match event {
            Event::StageStarted { stage } => eprintln!("==> {}", stage),
            Event::ToolchainFetch { component, version } => {
                eprintln!("    fetching {} {}", component, version)
            }
            Event::DependencyFetch { name, version } => {
                eprintln!("    fetching {} {}", name, version)
            }
            Event::Compiling { dependency, abi } => eprintln!("    compiling {} for {}", dependency, abi),
            Event::AbiFailed { abi, failures } => {
                eprintln!("    {} failed ({} error(s))", abi, failures)
            }
            Event::Warning { message } => eprintln!("warning: {}", message),
            Event::BuildCompleted { .. } => break,
            _ => {}
        }
    }
}
