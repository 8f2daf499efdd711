use clap::{Parser, Subcommand};

const CMD_NAME: &str = "jf";

/// Stores our command-line args format.
#[derive(Parser, Debug)]
#[command(name = CMD_NAME, version, about = None, long_about = None)]
pub struct Args {
    /// JSON config file (store format, I/O retries, environments)
    #[arg(short, long, value_name = "FILE", global = true)]
    #[arg(env = "JOBFLOW_CONFIG")]
    pub config: Option<String>,

    /// Bypass user confirmation
    #[arg(short, long, global = true)]
    pub yes: bool,

    /// Print additional debugging info (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a workflow from a template file
    Make {
        /// Workflow template (JSON)
        #[arg(value_name = "TEMPLATE")]
        template: String,

        /// Directory to create the workflow in (default: ./<name>)
        #[arg(short, long, value_name = "DIR")]
        path: Option<String>,

        /// Workflow name, overriding the template's
        #[arg(short, long)]
        name: Option<String>,

        /// Replace an existing workflow at the same path
        #[arg(long)]
        overwrite: bool,

        /// Store format, overriding the config file ("json" or "chunked")
        #[arg(short, long, value_name = "FORMAT")]
        #[arg(env = "JOBFLOW_STORE")]
        store: Option<String>,
    },
    /// Summarise a workflow's tasks and EARs
    Show {
        #[arg(value_name = "WORKFLOW")]
        workflow: String,
    },
    /// Print the jobscripts pending EARs would be grouped into
    Jobscripts {
        #[arg(value_name = "WORKFLOW")]
        workflow: String,
    },
    /// Record pending EARs as a new submission
    Prepare {
        #[arg(value_name = "WORKFLOW")]
        workflow: String,
    },
    /// Dispatch prepared submissions, preparing one first if needed
    Submit {
        #[arg(value_name = "WORKFLOW")]
        workflow: String,
    },
    /// Initialise EARs whose rules can now be evaluated
    InitEars {
        #[arg(value_name = "WORKFLOW")]
        workflow: String,
    },
    /// Call-backs made by running jobs
    #[command(hide = true)]
    Internal {
        #[arg(value_name = "WORKFLOW")]
        workflow: String,

        #[command(subcommand)]
        call: InternalCall,
    },
}

#[derive(Subcommand, Debug)]
pub enum InternalCall {
    /// Record that an EAR has started
    EarStart(JobscriptCell),
    /// Record that an EAR has finished
    EarEnd(JobscriptCell),
    /// Save the value of one of an EAR's outputs
    SaveParameter {
        name: String,
        /// JSON value; anything that is not valid JSON is saved as a string
        value: String,
        #[command(flatten)]
        cell: JobscriptCell,
    },
}

/// Addresses one EAR as a running job sees it.
#[derive(clap::Args, Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobscriptCell {
    pub submission: usize,
    pub jobscript: usize,
    pub element: usize,
    pub action: usize,
}
