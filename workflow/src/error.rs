use anyhow::Result;
use colored::Colorize;

/// For re-throwing after we've collected a list of errors.
#[derive(Debug, thiserror::Error)]
#[error("{0} failed due to {1} errors")]
pub struct AggregatedErrors(pub String, pub usize);

// in future we can add a `warnings` field, too.
pub struct Errors {
    errors: Vec<anyhow::Error>,
}

impl Default for Errors {
    fn default() -> Self {
        Self {
            // ideally we won't have any,
            // and we don't mind reallocating if we're already in an error state:
            errors: Vec::with_capacity(0),
        }
    }
}

impl Errors {
    pub fn add_context(&mut self, e: anyhow::Error, msg: String) {
        log::trace!("{msg}: {e:?}");
        self.errors.push(e.context(msg));
    }

    pub fn add(&mut self, e: anyhow::Error) {
        log::trace!("error: {e:?}");
        self.errors.push(e);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Fail with the single collected error as-is, or with an aggregate
    /// (after printing every error) if there were several.
    pub fn into_result(mut self, label: &str) -> Result<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => self.print_recap(label),
        }
    }

    /// Print full list of errors to stderr, fail w/ an aggregated error
    /// if there were one or more errors.
    pub fn print_recap(&self, label: &str) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            eprintln!("\n{} {}:\n", "Encountered errors while".red(), label.red());
            for e in &self.errors {
                eprintln!("{}: {e:?}\n", "ERROR".red());
            }
            Err(AggregatedErrors(label.to_owned(), self.errors.len()).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn single_error_is_passed_through() {
        let mut errors = Errors::default();
        errors.add(Boom.into());
        let e = errors.into_result("adding task").unwrap_err();
        assert!(e.downcast_ref::<Boom>().is_some());
    }

    #[test]
    fn several_errors_are_aggregated() {
        let mut errors = Errors::default();
        errors.add(Boom.into());
        errors.add_context(Boom.into(), "element set 1".to_owned());
        let e = errors.into_result("adding task").unwrap_err();
        let agg = e.downcast_ref::<AggregatedErrors>().unwrap();
        assert_eq!(agg.1, 2);
    }
}
