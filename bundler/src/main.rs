//! Airgap bundler CLI entrypoint.
//!
//! This binary fills a bundle directory with verified artefacts and prints a
//! per-component summary. Artefact failures are reported but do not change
//! the exit code; only an unsupported host, a broken configuration or an
//! unusable bundle directory do.

use airgap_bundler::artefact::download::HttpDownloader;
use airgap_bundler::artefact::retry::ThreadSleeper;
use airgap_bundler::cli::Cli;
use airgap_bundler::config::BundleConfig;
use airgap_bundler::dirs::{BaseDirs, SystemBaseDirs};
use airgap_bundler::error::{Result, check_platform};
use airgap_bundler::output::{DryRunInfo, completion_message, write_stderr_line};
use airgap_bundler::pipeline::{BundleContext, Collaborators, run_bundle};
use airgap_bundler::tools::SystemCommandExecutor;
use airgap_bundler::workspace::BundleLayout;
use clap::Parser;
use std::io::Write;

fn main() {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.log_level())
        .format_timestamp(None)
        .init();
    let mut stderr = std::io::stderr();
    let run_result = run(&cli, &SystemBaseDirs::new(), &mut stderr);
    let exit_code = exit_code_for_run_result(run_result, &mut stderr);
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

fn run(cli: &Cli, dirs: &dyn BaseDirs, stderr: &mut dyn Write) -> Result<()> {
    if cli.skip_platform_check {
        log::warn!("platform check skipped; the bundle may not suit linux/x86_64 hosts");
    } else {
        check_platform(std::env::consts::OS, std::env::consts::ARCH)?;
    }

    let loaded = BundleConfig::load(cli.config.as_deref(), dirs)?;
    let mut config = loaded.config;
    config.apply_overrides(cli);

    if cli.dry_run {
        let layout = BundleLayout::new(config.bundle_dir.clone());
        let info = DryRunInfo {
            config: &config,
            layout: &layout,
            config_source: loaded.source.as_deref(),
            verbosity: cli.verbosity,
            quiet: cli.quiet,
        };
        write_stderr_line(stderr, info.display_text());
        return Ok(());
    }

    let executor = SystemCommandExecutor;
    let downloader = HttpDownloader;
    let sleeper = ThreadSleeper;
    let collaborators = Collaborators {
        executor: &executor,
        downloader: &downloader,
        sleeper: &sleeper,
    };
    let context = BundleContext::new(config, cli.quiet);
    let root = context.layout.root().to_owned();
    let ledger = run_bundle(context, &collaborators, stderr)?;

    write_stderr_line(stderr, "");
    write_stderr_line(stderr, ledger.render_summary());
    write_stderr_line(stderr, completion_message(ledger.tally().failed, &root));
    Ok(())
}

fn exit_code_for_run_result(result: Result<()>, stderr: &mut dyn Write) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => {
            write_stderr_line(stderr, err);
            1
        }
    }
}
