use anyhow::{Context as _, Result};
use chrono::Utc;
use serde_json::Value;

use schedule::{generate_ear_resource_map, iteration_task_pathway, DependencyCache};
use store::Error as StoreError;
use workflow::{
    output_path, Action, EarId, EarIdx, Error as WorkflowError, InsertId, Jobscript, ParamId,
    ParamRef, Resources, Submission,
};

use super::ears::task_actions;
use super::lookup::ear_id;
use super::{Error, Workflow};
use crate::context::JobscriptSubmitter;

// JOBSCRIPTS ////////////////////
impl Workflow<'_> {
    pub fn dependency_cache(&self) -> DependencyCache {
        let doc = self.store.doc();
        DependencyCache::build(&doc.tasks, &doc.sources)
    }

    /// Group every pending EAR into jobscripts, without claiming them.
    ///
    /// Fails if an EAR's environments, or the executables its commands use,
    /// are not available for its resources.
    pub fn resolve_jobscripts(&self) -> Result<Vec<Jobscript>> {
        let doc = self.store.doc();
        let task_ids: Vec<InsertId> = doc.insert_ids().collect();
        let pathway = iteration_task_pathway(&task_ids, &doc.loops);

        let mut maps = Vec::with_capacity(pathway.len());
        for (task, loop_idx) in pathway {
            let (stored, records) = doc.task(task)?;
            let actions = task_actions(doc, stored);
            let map = generate_ear_resource_map(records, actions.len(), &loop_idx, |ear_idx, run| {
                let action_idx = usize::from(run.action_idx);
                let (_, action) = actions
                    .get(action_idx)
                    .ok_or(Error::UnknownAction(task, action_idx))?;
                let resources = self.merged_resources(&run.data_idx, &action.scope())?;
                self.check_environments(action, &resources)
                    .with_context(|| format!("checking environments for EAR {ear_idx} of task {task}"))?;
                Ok(resources)
            })?;
            maps.push((task, loop_idx, map));
        }

        schedule::resolve_jobscripts(&maps, &self.dependency_cache())
    }

    fn check_environments(&self, action: &Action, resources: &Resources) -> Result<()> {
        let mut envs = Vec::with_capacity(action.environments.len());
        for name in &action.environments {
            envs.push(
                self.ctx
                    .environment(name)
                    .ok_or_else(|| WorkflowError::MissingEnvironment(name.clone()))?,
            );
        }
        let num_cores = resources.num_cores();
        for label in action.executables() {
            let found = envs.iter().any(|env| {
                env.executable(&label)
                    .and_then(|exe| exe.instance(num_cores, resources.parallel_mode()))
                    .is_some()
            });
            if !found {
                return Err(WorkflowError::MissingEnvironmentExecutable {
                    env: action.environments.join(", "),
                    label,
                    num_cores,
                }
                .into());
            }
        }
        Ok(())
    }
}

// SUBMISSIONS ////////////////////
impl Workflow<'_> {
    /// Resolve jobscripts for every pending EAR and record them as a new
    /// submission, claiming the EARs. Returns `None` if there is nothing to run.
    pub fn add_submission(&mut self) -> Result<Option<usize>> {
        self.batch_update(|wf| {
            let jobscripts = wf.resolve_jobscripts()?;
            if jobscripts.is_empty() {
                log::info!("no pending EARs to submit");
                return Ok(None);
            }
            let claimed: Vec<(InsertId, EarIdx)> = jobscripts
                .iter()
                .flat_map(|js| {
                    js.cells()
                        .map(move |(row, _, ear)| (js.task_actions[row].task_insert_id, ear))
                })
                .collect();
            let num_jobscripts = jobscripts.len();
            let sub = wf.store.add_submission(Submission {
                jobscripts,
                submit_time: None,
            });
            for (task, ear) in &claimed {
                wf.store.set_ear_submission_idx(*task, *ear, sub)?;
            }
            log::info!(
                "prepared submission {sub}: {num_jobscripts} jobscripts, {} EARs",
                claimed.len()
            );
            Ok(Some(sub))
        })
    }

    /// Hand every jobscript of every undispatched submission to `submitter`, in order.
    ///
    /// Each dispatch is committed as soon as it happens, so a failure part way
    /// through leaves the earlier jobscripts recorded as submitted.
    pub fn submit(&mut self, submitter: &mut dyn JobscriptSubmitter) -> Result<Vec<usize>> {
        let pending: Vec<usize> = self
            .store
            .doc()
            .submissions
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_dispatched())
            .map(|(i, _)| i)
            .collect();
        if pending.is_empty() {
            return Err(Error::NothingToSubmit.into());
        }

        for &sub in &pending {
            let num_jobscripts = self.submission(sub)?.jobscripts.len();
            for js in 0..num_jobscripts {
                let jobscript = self.submission(sub)?.jobscripts[js].clone();
                if jobscript.submit_time.is_some() {
                    continue;
                }
                let deps = self.dependency_refs(sub, js, &jobscript)?;
                let job_ref = submitter
                    .submit(&jobscript, &deps)
                    .with_context(|| format!("submitting jobscript {js} of submission {sub}"))?;
                log::info!("submitted jobscript {js} of submission {sub} as {job_ref}");
                self.batch_update(|wf| {
                    wf.store
                        .set_jobscript_dispatched(sub, js, Utc::now(), Some(job_ref))
                })?;
            }
            self.batch_update(|wf| wf.store.set_submission_dispatched(sub, Utc::now()))?;
        }
        Ok(pending)
    }

    fn submission(&self, sub: usize) -> Result<&Submission> {
        Ok(self
            .store
            .doc()
            .submissions
            .get(sub)
            .ok_or(StoreError::UnknownSubmission(sub))?)
    }

    /// Job references of the jobscripts `jobscript` depends on.
    fn dependency_refs(&self, sub: usize, js: usize, jobscript: &Jobscript) -> Result<Vec<String>> {
        let submission = self.submission(sub)?;
        jobscript
            .dependencies
            .keys()
            .map(|&dep| {
                submission
                    .jobscripts
                    .get(dep)
                    .and_then(|d| d.scheduler_job_ref.clone())
                    .ok_or_else(|| anyhow::Error::from(Error::DependencyNotSubmitted(sub, js, dep)))
            })
            .collect()
    }
}

// CALL-BACKS ////////////////////
impl Workflow<'_> {
    /// The EAR in a jobscript cell, as addressed by a running job.
    pub fn ear_at(&self, sub: usize, js: usize, element: usize, action: usize) -> Result<EarId> {
        let jobscript = self
            .submission(sub)?
            .jobscripts
            .get(js)
            .ok_or(StoreError::UnknownJobscript(sub, js))?;
        let cell = jobscript
            .ear_idx
            .get(action)
            .and_then(|row| row.get(element))
            .copied()
            .flatten();
        let empty = Error::JobscriptCellEmpty {
            sub,
            js,
            element,
            action,
        };
        let (Some(ear_idx), Some(task_action)) = (cell, jobscript.task_actions.get(action)) else {
            return Err(empty.into());
        };
        let task = task_action.task_insert_id;
        Ok(ear_id(task, ear_idx, self.run(task, ear_idx)?))
    }

    pub fn set_ear_start(&mut self, sub: usize, js: usize, element: usize, action: usize) -> Result<EarId> {
        let id = self.ear_at(sub, js, element, action)?;
        self.batch_update(|wf| wf.store.set_ear_start(id.task_insert_id, id.ear_idx, Utc::now()))?;
        log::info!("EAR {id} started");
        Ok(id)
    }

    /// Mark an EAR complete, then initialise any EARs that were waiting on its outputs.
    pub fn set_ear_end(&mut self, sub: usize, js: usize, element: usize, action: usize) -> Result<EarId> {
        let id = self.ear_at(sub, js, element, action)?;
        self.batch_update(|wf| {
            wf.store.set_ear_end(id.task_insert_id, id.ear_idx, Utc::now())?;
            wf.initialise_pending_ears()
        })?;
        log::info!("EAR {id} ended");
        Ok(id)
    }

    /// Set the value of the output `name` of the EAR in a jobscript cell.
    pub fn save_parameter(
        &mut self,
        name: &str,
        value: Value,
        sub: usize,
        js: usize,
        element: usize,
        action: usize,
    ) -> Result<ParamId> {
        let id = self.ear_at(sub, js, element, action)?;
        let run = self.run(id.task_insert_id, id.ear_idx)?;
        let param = match run.data_idx.get(&output_path(name)) {
            Some(ParamRef::One(param)) => *param,
            _ => return Err(Error::UnknownOutput(id, name.to_owned()).into()),
        };
        self.set_parameter(param, value)?;
        log::debug!("EAR {id} saved {name} to parameter {param}");
        Ok(param)
    }

    /// Give an unset parameter its value, then initialise any EARs waiting on it.
    pub fn set_parameter(&mut self, id: ParamId, value: Value) -> Result<()> {
        self.batch_update(|wf| {
            wf.store.set_parameter(id, value)?;
            wf.initialise_pending_ears()?;
            Ok(())
        })
    }
}
