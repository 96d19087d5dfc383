//! library-loader - native library bootstrap
//!
//! Loads and initializes the native libraries described by a JSON config,
//! then exits with the loader's error code on failure.
//!
//! Usage: library-loader --config <path> [--process <type>]
//!        [--source-dir <path>] [--cache-dir <path>] [--summary] [--<switch>...]

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use library_loader::config::JsonFileSettings;
use library_loader::metrics::HistogramRecorder;
use library_loader::process::{CommandLine, StaticContext, ThreadTaskRunner};
use library_loader::{ApplicationInfo, LibraryLoader, LoaderConfig, LoaderErrorCode, NAME, ProcessType, VERSION};
use log::{error, info};

struct Options {
    config: Option<PathBuf>,
    process_type: ProcessType,
    source_dir: PathBuf,
    cache_dir: PathBuf,
    summary: bool,
}

fn parse_options(args: &[String]) -> Result<Options, String> {
    let mut options = Options {
        config: None,
        process_type: ProcessType::Browser,
        source_dir: PathBuf::from("."),
        cache_dir: env::temp_dir().join(NAME),
        summary: false,
    };

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        let mut value = || iter.next().cloned().ok_or_else(|| format!("{arg} needs a value"));
        match arg.as_str() {
            "--config" => options.config = Some(PathBuf::from(value()?)),
            "--process" => options.process_type = value()?.parse()?,
            "--source-dir" => options.source_dir = PathBuf::from(value()?),
            "--cache-dir" => options.cache_dir = PathBuf::from(value()?),
            "--summary" => options.summary = true,
            // Everything else is a switch for the native command line.
            _ => {}
        }
    }
    Ok(options)
}

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let options = match parse_options(&args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{NAME} v{VERSION}: {e}");
            return ExitCode::from(LoaderErrorCode::NativeStartupFailed.as_i32() as u8);
        }
    };

    let config = match &options.config {
        Some(path) => match LoaderConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!(target: "LibraryLoader", "{e}");
                return ExitCode::from(e.code().as_i32() as u8);
            }
        },
        None => LoaderConfig::default(),
    };

    let context = StaticContext::new(ApplicationInfo::new(&options.source_dir, &options.cache_dir));
    let metrics = Arc::new(HistogramRecorder::new());
    let settings = JsonFileSettings::new(options.cache_dir.join("loader_settings.json"));
    let command_line = CommandLine::from_args(
        args.iter()
            .skip(1)
            .filter(|a| !matches!(a.as_str(), "--config" | "--process" | "--source-dir" | "--cache-dir" | "--summary")),
    );

    let loader = LibraryLoader::builder(config, Arc::new(context))
        .settings(Arc::new(settings))
        .task_runner(Arc::new(ThreadTaskRunner::default()))
        .metrics(metrics.clone())
        .command_line(Arc::new(command_line))
        .build();

    if let Err(e) = loader.ensure_initialized(options.process_type) {
        error!(target: "LibraryLoader", "{e}");
        return ExitCode::from(e.code().as_i32() as u8);
    }
    if options.process_type.is_browser() {
        loader.on_browser_native_initialization_complete();
    } else {
        loader.register_renderer_process_histogram();
    }

    info!(
        target: "LibraryLoader",
        "{NAME} v{VERSION}: initialized as {}",
        options.process_type
    );
    if options.summary {
        let times = metrics.summary();
        for name in metrics.names() {
            match times.get(&name) {
                Some(ms) => println!("{name}: {ms:.2} ms"),
                None => println!("{name}: {:?}", metrics.samples(&name)),
            }
        }
    }
    ExitCode::SUCCESS
}
