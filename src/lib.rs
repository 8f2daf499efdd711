/// High-level command line app
mod app;
/// Definition of command-line args
mod args;
/// Configuration and the collaborators a workflow is given
pub mod context;
/// Building, persisting and submitting workflows
pub mod engine;
/// Combined command-line and config file run settings
mod settings;
/// Text UI
mod ui;

// exported for tests:
pub use app::App;
pub use args::{Args, JobscriptCell};
pub use context::{Config, Context};
pub use engine::Workflow;
pub use settings::{Action, Settings};

/// Run the command-line app.
pub fn run() -> Result<(), anyhow::Error> {
    use clap::Parser;
    let args = Args::parse();

    // INTERPRET SETTINGS ///////////////
    let settings: Settings = args.try_into()?;

    let log_level = match settings.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    simple_logging::log_to_stderr(log_level);

    // RUN THE THING /////////////////
    let app = App::new(settings);
    app.run()?;

    Ok(())
}
