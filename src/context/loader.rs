use std::path::Path;

use anyhow::{Context, Result};

use workflow::WorkflowTemplate;

/// Produces a workflow template from a file.
pub trait TemplateLoader {
    fn load(&self, path: &Path) -> Result<WorkflowTemplate>;
}

/// Reads templates written as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonTemplateLoader;

impl TemplateLoader for JsonTemplateLoader {
    fn load(&self, path: &Path) -> Result<WorkflowTemplate> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading template {}", path.display()))?;
        let template: WorkflowTemplate = serde_json::from_str(&text)
            .with_context(|| format!("parsing template {}", path.display()))?;
        log::debug!(
            "loaded template \"{}\" with {} tasks",
            template.name,
            template.tasks.len()
        );
        Ok(template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_json_and_reports_bad_files() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, r#"{{"name": "w1", "tasks": []}}"#)?;
        let template = JsonTemplateLoader.load(file.path())?;
        assert_eq!(template.name, "w1");

        let mut bad = tempfile::NamedTempFile::new()?;
        write!(bad, "name: w1")?;
        let err = JsonTemplateLoader.load(bad.path()).unwrap_err();
        assert!(format!("{err:#}").contains("parsing template"));
        Ok(())
    }
}
