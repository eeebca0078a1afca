//! Group loading: reading and parsing rule files.
//!
//! [`GroupLoader`] is the seam the manager uses to turn a file path into a
//! validated [`RuleFile`] and a query string into an [`Expr`]. The default
//! [`FileLoader`] reads YAML from the filesystem; hosts may substitute a
//! loader backed by an API or object store.

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use vigil_model::expr::Expr;

use crate::schema::RuleFile;

/// Errors that can occur during rule loading and evaluation setup.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// Filesystem I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse/deserialization error.
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Rule validation error (missing fields, duplicate names, bad labels).
    #[error("validation error: {0}")]
    Validation(String),
}

/// Result alias for loader operations.
pub type Result<T> = std::result::Result<T, RuleError>;

/// Loads rule groups from arbitrary sources and parses query expressions.
pub trait GroupLoader: Send + Sync {
    /// Load and validate all rule groups in `path`.
    ///
    /// Every problem found is reported; on any error the caller keeps its
    /// previous rule set.
    fn load(&self, path: &Path) -> std::result::Result<RuleFile, Vec<RuleError>>;

    /// Parse a query expression.
    fn parse(&self, expr: &str) -> Result<Expr>;
}

impl<T: GroupLoader + ?Sized> GroupLoader for Arc<T> {
    fn load(&self, path: &Path) -> std::result::Result<RuleFile, Vec<RuleError>> {
        (**self).load(path)
    }

    fn parse(&self, expr: &str) -> Result<Expr> {
        (**self).parse(expr)
    }
}

/// The default [`GroupLoader`]: YAML files on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileLoader;

impl GroupLoader for FileLoader {
    fn load(&self, path: &Path) -> std::result::Result<RuleFile, Vec<RuleError>> {
        let contents = std::fs::read_to_string(path).map_err(|e| vec![RuleError::Io(e)])?;
        let file: RuleFile =
            serde_yaml::from_str(&contents).map_err(|e| vec![RuleError::Parse(e)])?;

        let problems = file.validate();
        if !problems.is_empty() {
            return Err(problems
                .into_iter()
                .map(|p| RuleError::Validation(format!("{}: {}", path.display(), p)))
                .collect());
        }

        debug!(path = %path.display(), groups = file.groups.len(), "loaded rule file");
        Ok(file)
    }

    fn parse(&self, expr: &str) -> Result<Expr> {
        if expr.trim().is_empty() {
            return Err(RuleError::Validation("empty expression".to_string()));
        }
        Ok(Expr::parse(expr))
    }
}

// ── Tests ───────────────────────────────────────────────────────────
