//! Types describing a workflow: the templates users write, and the
//! elements, iterations and runs they expand into.

mod id;
pub use id::{ActionIdx, EarId, EarIdx, ElementId, ElementIdx, InsertId, IterIdx, IterationId, ParamId};

mod error;
pub use error::{AggregatedErrors, Errors};

mod param;
pub use param::{
    get_in, input_file_path, input_path, output_file_path, output_path, resource_path,
    root_param, set_in, split_path, DataIdx, ParamData, ParamRef, ParamSource, SourceKind, SourcePatch, INPUTS, INPUT_FILES,
    OUTPUTS, OUTPUT_FILES, RESOURCES,
};

mod resources;
pub use resources::{ResourceSpec, Resources, SCOPE_ANY, SCOPE_MAIN, SCOPE_PROCESSING};

mod schema;
pub use schema::{
    Action, ActionRule, ActionScope, Cast, Command, Condition, Predicate, SchemaInput,
    SchemaOutput, TaskSchema,
};

mod template;
pub use template::{
    ElementGroup, ElementPropagation, ElementSet, InputSource, InputValue, LoopTemplate,
    TaskSourceType, TaskTemplate, ValueSequence, WorkflowTemplate,
};

mod records;
pub use records::{EarStatus, Element, Iteration, IterableParam, Loop, Run, TaskRecords};

mod jobscript;
pub use jobscript::{Jobscript, JobscriptDependency, Submission, TaskAction};

mod env;
pub use env::{Environment, Executable, ExecutableInstance, NumCores};

mod multiplicity;
pub use multiplicity::{resolve_multiplicities, MultiplicityRecord, BROADCAST};

mod hash;
pub use hash::content_hash;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Task schemas have more than one objective: {0}")]
    TaskTemplateMultipleSchemaObjectives(String),
    #[error("Input \"{0}\" is defined more than once")]
    TaskTemplateMultipleInputValues(String),
    #[error("Task \"{task}\" does not accept input \"{input}\"")]
    TaskTemplateUnexpectedInput { task: String, input: String },
    #[error("Invalid nesting order {order} for \"{path}\"; nesting orders must be non-negative")]
    TaskTemplateInvalidNesting { path: String, order: f64 },
    #[error(
        "Inconsistent multiplicity at nesting order {order}: \"{path}\" has {found} values, \
        but other paths at this order have {expected}"
    )]
    InconsistentMultiplicity {
        order: f64,
        path: String,
        found: usize,
        expected: usize,
    },
    #[error("Task \"{task}\" is missing inputs: {}", .missing.join(", "))]
    MissingInputs { task: String, missing: Vec<String> },
    #[error("Invalid source for input \"{input}\": {reason}")]
    InvalidInputSource { input: String, reason: String },
    #[error("No task with insert ID {0}")]
    UnknownTask(InsertId),
    #[error("Loop \"{0}\" must cover a contiguous range of tasks")]
    LoopTasksNotContiguous(String),
    #[error("Loop \"{0}\": tasks in the loop must have the same number of elements")]
    LoopElementMismatch(String),
    #[error("Parameter at \"{0}\" has no value yet")]
    UnsetParameterData(String),
    #[error("Environment \"{0}\" is not defined")]
    MissingEnvironment(String),
    #[error(
        "Environment \"{env}\" has no executable \"{label}\" that can run on {num_cores} cores"
    )]
    MissingEnvironmentExecutable {
        env: String,
        label: String,
        num_cores: u32,
    },
}
