//! The read-only interface the core expects from the git collaborator.
//!
//! The actual implementation (shelling out to git, or a hosted API client)
//! lives with the CLI; the core only consumes it, and tests stub it.

use camino::Utf8PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ScmError {
    #[error("git operation failed: {0}")]
    Git(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub trait Scm {
    fn current_branch(&self) -> Result<String, ScmError>;

    /// Finds the configured remote whose URL contains `partial_url`.
    fn remote(&self, partial_url: &str) -> Result<Option<String>, ScmError>;

    /// Files changed relative to `reference`, repo-root relative.
    fn changed_files_since(
        &self,
        reference: &str,
        remote: Option<&str>,
    ) -> Result<Vec<Utf8PathBuf>, ScmError>;

    fn fetch_tags(&self) -> Result<(), ScmError>;

    fn tags_matching(&self, prefix: &str) -> Result<Vec<String>, ScmError>;

    /// ISO-8601 date of the commit a tag points at.
    fn commit_date(&self, tag: &str) -> Result<Option<String>, ScmError>;
}
