use anyhow::Result;

use workflow::{InsertId, Jobscript};

/// Hands a jobscript to an external scheduler.
pub trait JobscriptSubmitter {
    /// `dependencies` holds the job references of the jobscripts this one depends on,
    /// in the order of its dependency keys. Returns the new job's reference.
    fn submit(&mut self, jobscript: &Jobscript, dependencies: &[String]) -> Result<String>;
}

/// What a [`RecordingSubmitter`] was asked to submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedJobscript {
    pub job_ref: String,
    pub tasks: Vec<InsertId>,
    pub num_actions: usize,
    pub num_elements: usize,
    pub dependencies: Vec<String>,
}

/// Submits nothing; records each jobscript and hands out sequential references.
#[derive(Debug, Default)]
pub struct RecordingSubmitter {
    pub submitted: Vec<SubmittedJobscript>,
}

impl JobscriptSubmitter for RecordingSubmitter {
    fn submit(&mut self, jobscript: &Jobscript, dependencies: &[String]) -> Result<String> {
        let job_ref = format!("job-{}", self.submitted.len());
        log::info!(
            "recording {job_ref}: {} actions x {} elements, after [{}]",
            jobscript.num_actions(),
            jobscript.num_elements(),
            dependencies.join(", ")
        );
        self.submitted.push(SubmittedJobscript {
            job_ref: job_ref.clone(),
            tasks: jobscript.task_insert_ids.clone(),
            num_actions: jobscript.num_actions(),
            num_elements: jobscript.num_elements(),
            dependencies: dependencies.to_vec(),
        });
        Ok(job_ref)
    }
}
