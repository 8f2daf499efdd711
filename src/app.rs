use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};

use workflow::{EarStatus, Jobscript};

use crate::args::JobscriptCell;
use crate::context::{BasicEvaluator, Context, JsonTemplateLoader, RecordingSubmitter, TemplateLoader};
use crate::engine::Workflow;
use crate::settings::{Action, Settings};
use crate::ui::Ui;

/// This struct actually runs the command-line app.
pub struct App {
    /// Interpreted command line settings
    settings: Settings,
    /// User interface
    ui: Ui,
}

impl App {
    /// Create a new `App`.
    pub fn new(settings: Settings) -> Self {
        let ui = Ui::new(&settings);
        Self { settings, ui }
    }

    /// Run the app, using settings to determine which command to run.
    pub fn run(mut self) -> Result<()> {
        let ctx = Context::new(self.settings.config.clone(), Box::new(BasicEvaluator));
        log::debug!(
            "using {} store format, {} environments",
            ctx.config.store_format,
            ctx.config.environments.len()
        );

        match self.settings.action.clone() {
            Action::Make {
                template,
                path,
                name,
                overwrite,
            } => self.make(&ctx, &template, path, name, overwrite),
            Action::Show(path) => self.show(&ctx, &path),
            Action::Jobscripts(path) => self.jobscripts(&ctx, &path),
            Action::Prepare(path) => self.prepare(&ctx, &path),
            Action::Submit(path) => self.submit(&ctx, &path),
            Action::InitEars(path) => {
                let n = self.open(&ctx, &path)?.initialise_ears()?;
                self.ui.success(&format!("Initialised EARs for {n} iterations."));
                Ok(())
            }
            Action::EarStart(path, cell) => {
                let id = self.open(&ctx, &path)?.set_ear_start(
                    cell.submission,
                    cell.jobscript,
                    cell.element,
                    cell.action,
                )?;
                log::info!("{}", format_cell("started", &cell, id));
                Ok(())
            }
            Action::EarEnd(path, cell) => {
                let id = self.open(&ctx, &path)?.set_ear_end(
                    cell.submission,
                    cell.jobscript,
                    cell.element,
                    cell.action,
                )?;
                log::info!("{}", format_cell("ended", &cell, id));
                Ok(())
            }
            Action::SaveParameter {
                workflow,
                name,
                value,
                cell,
            } => {
                self.open(&ctx, &workflow)?.save_parameter(
                    &name,
                    value,
                    cell.submission,
                    cell.jobscript,
                    cell.element,
                    cell.action,
                )?;
                Ok(())
            }
        }
    }

    fn open<'ctx>(&mut self, ctx: &'ctx Context, path: &Path) -> Result<Workflow<'ctx>> {
        self.ui.step_debug("Opening workflow", path);
        let wf = Workflow::open(ctx, path)
            .with_context(|| format!("while opening workflow {}", path.display()))?;
        self.ui.done();
        Ok(wf)
    }
}

// CREATING ////////////////
impl App {
    fn make(
        &mut self,
        ctx: &Context,
        template_path: &Path,
        path: Option<PathBuf>,
        name: Option<String>,
        overwrite: bool,
    ) -> Result<()> {
        self.ui.step_debug("Reading template", template_path);
        let mut template = JsonTemplateLoader.load(template_path)?;
        self.ui.done();
        if let Some(name) = name {
            template.name = name;
        }

        let path = match path {
            Some(path) => path,
            None => std::env::current_dir()?.join(&template.name),
        };
        if overwrite && path.exists() && !self.ui.confirm(&format!("Replace {}?", path.display()))? {
            return Ok(());
        }

        self.ui.step("Creating workflow");
        let wf = Workflow::create(ctx, &template, &path, overwrite)?;
        self.ui.done();

        let doc = wf.doc();
        let num_elements: usize = doc.tasks.iter().map(|t| t.elements.len()).sum();
        self.ui.success(&format!(
            "Created workflow \"{}\" at {}: {} tasks, {} elements, {} loops.",
            wf.name(),
            wf.path().display(),
            doc.template.tasks.len(),
            num_elements,
            doc.loops.len(),
        ));
        Ok(())
    }
}

// INSPECTING //////////////
impl App {
    fn show(&mut self, ctx: &Context, path: &Path) -> Result<()> {
        let wf = self.open(ctx, path)?;
        let doc = wf.doc();
        self.ui.heading(wf.name(), wf.path().display());

        for (task, records) in doc.template.tasks.iter().zip(&doc.tasks) {
            let mut statuses: BTreeMap<EarStatus, usize> = BTreeMap::new();
            for id in wf.ear_ids(task.insert_id)? {
                *statuses.entry(wf.ear_status(id.task_insert_id, id.ear_idx)?).or_default() += 1;
            }
            let uninitialised = records
                .iterations
                .iter()
                .filter(|it| !it.ears_initialised)
                .count();
            let statuses = statuses
                .iter()
                .map(|(status, n)| format!("{n} {status}"))
                .collect::<Vec<_>>()
                .join(", ");
            self.ui.item(
                format!("[{}]", task.insert_id),
                &task.name,
                format!(
                    "{} elements, {} iterations ({} waiting), EARs: {}",
                    records.elements.len(),
                    records.iterations.len(),
                    uninitialised,
                    if statuses.is_empty() { "none".to_owned() } else { statuses },
                ),
            );
        }
        for lp in &doc.loops {
            self.ui.item(
                "loop",
                &lp.name,
                format!("{} of {} iterations added", lp.num_added_iterations, lp.num_iterations),
            );
        }
        for (i, sub) in doc.submissions.iter().enumerate() {
            let state = if sub.is_dispatched() { "submitted" } else { "prepared" };
            self.ui.item(
                "submission",
                &i.to_string(),
                format!("{} jobscripts, {state}", sub.jobscripts.len()),
            );
        }
        Ok(())
    }

    fn jobscripts(&mut self, ctx: &Context, path: &Path) -> Result<()> {
        let wf = self.open(ctx, path)?;
        self.ui.step("Resolving jobscripts");
        let jobscripts = wf.resolve_jobscripts()?;
        self.ui.done();

        if jobscripts.is_empty() {
            self.ui.nothing_to_do("no jobscripts to resolve.");
        }
        for (i, js) in jobscripts.iter().enumerate() {
            println!("{}", describe_jobscript(i, js));
        }
        Ok(())
    }
}

// SUBMITTING //////////////
impl App {
    fn prepare(&mut self, ctx: &Context, path: &Path) -> Result<()> {
        let mut wf = self.open(ctx, path)?;
        match wf.add_submission()? {
            Some(sub) => {
                let num = wf.doc().submissions[sub].jobscripts.len();
                self.ui.success(&format!("Prepared submission {sub} with {num} jobscripts."));
            }
            None => self.ui.nothing_to_do("nothing to prepare."),
        }
        Ok(())
    }

    fn submit(&mut self, ctx: &Context, path: &Path) -> Result<()> {
        let mut wf = self.open(ctx, path)?;
        let has_prepared = wf.doc().submissions.iter().any(|s| !s.is_dispatched());
        if !has_prepared && wf.add_submission()?.is_none() {
            self.ui.nothing_to_do("nothing to submit.");
            return Ok(());
        }
        if !self.ui.confirm("Submit prepared jobscripts?")? {
            return Ok(());
        }

        let mut submitter = RecordingSubmitter::default();
        let subs = wf.submit(&mut submitter)?;
        for job in &submitter.submitted {
            println!(
                "{}: tasks {:?}, {} actions x {} elements, after [{}]",
                job.job_ref,
                job.tasks.iter().map(|t| t.to_string()).collect::<Vec<_>>(),
                job.num_actions,
                job.num_elements,
                job.dependencies.join(", ")
            );
        }
        self.ui.success(&format!(
            "Submitted {} jobscripts from {} submissions.",
            submitter.submitted.len(),
            subs.len()
        ));
        Ok(())
    }
}

fn describe_jobscript(idx: usize, js: &Jobscript) -> String {
    let deps = js
        .dependencies
        .iter()
        .map(|(dep, d)| if d.is_array { format!("{dep} (array)") } else { dep.to_string() })
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "jobscript {idx}: tasks {:?}, {} actions x {} elements, {} EARs, resources {}, depends on [{}]",
        js.task_insert_ids.iter().map(|t| t.to_string()).collect::<Vec<_>>(),
        js.num_actions(),
        js.num_elements(),
        js.cells().count(),
        js.resources.to_value(),
        deps
    )
}

fn format_cell(what: &str, cell: &JobscriptCell, id: workflow::EarId) -> String {
    format!(
        "EAR {id} {what} (submission {}, jobscript {}, element {}, action {})",
        cell.submission, cell.jobscript, cell.element, cell.action
    )
}
