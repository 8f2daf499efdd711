use std::cell::RefCell;
use std::time::Instant;

use anyhow::Result;
use colored::Colorize;

use crate::settings::Settings;

/// All interactions with the text UI should go through this struct.
pub struct Ui {
    /// -v setting, displays progress and timings
    pub verbose: bool,
    /// -y setting, answers yes to every confirmation prompt
    assume_yes: bool,
    /// start of the step currently being timed
    step_start: Instant,
    /// reused line buffer for reading answers from stdin
    answer: RefCell<String>,
}

impl Ui {
    pub fn new(settings: &Settings) -> Self {
        Self {
            verbose: settings.verbose > 0,
            assume_yes: settings.yes,
            step_start: Instant::now(),
            answer: RefCell::new(String::with_capacity(16)),
        }
    }

    /// Ask a yes/no question on stderr. Anything but an answer starting with 'y' is a no.
    pub fn confirm(&self, prompt: &str) -> Result<bool> {
        if self.assume_yes {
            return Ok(true);
        }
        eprintln!("{} (y/N)", prompt.yellow());

        let mut answer = self.answer.borrow_mut();
        answer.clear();
        std::io::stdin().read_line(&mut answer)?;
        Ok(answer.trim_start().starts_with(['y', 'Y']))
    }

    // PROGRESS ////////////////

    /// Print a progress message and start timing the step it names.
    pub fn step(&mut self, msg: &str) {
        if self.verbose {
            self.step_start = Instant::now();
            eprint!("{}... ", msg.magenta());
        }
    }

    pub fn step_debug<T: std::fmt::Debug>(&mut self, msg: &str, arg: T) {
        if self.verbose {
            self.step_start = Instant::now();
            eprint!("{} {:?}... ", msg.magenta(), arg);
        }
    }

    /// Finish the current step, with its duration.
    pub fn done(&self) {
        if self.verbose {
            eprintln!("{} ({:?}).", "done".green(), self.step_start.elapsed());
        }
    }

    // OUTPUT //////////////////

    /// A command's result summary, always shown.
    pub fn success(&self, msg: &str) {
        eprintln!("{}", msg.green());
    }

    /// The command had nothing to do.
    pub fn nothing_to_do(&self, what: &str) {
        eprintln!("{} {}", "No pending EARs;".green(), what);
    }

    /// Heading for a listing printed to stdout.
    pub fn heading(&self, name: &str, detail: impl std::fmt::Display) {
        println!("{} ({})", name.bold(), detail);
    }

    /// One labelled line of a listing.
    pub fn item(&self, label: impl std::fmt::Display, name: &str, detail: impl std::fmt::Display) {
        println!("  {} {}: {}", label, name.cyan(), detail);
    }
}
