//! Script enhancers: user-supplied text around generated statements.

use super::renderer::ScriptType;
use crate::schema::Table;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Supplies text to write before and after a table's statements, or at the
/// start and end of a script when `table` is `None`.
pub trait ScriptEnhancer: Send + Sync {
    fn prolog(&self, script: ScriptType, table: Option<&Table>) -> io::Result<Option<String>>;

    fn epilog(&self, script: ScriptType, table: Option<&Table>) -> io::Result<Option<String>>;
}

/// Reads enhancement files from a directory:
///
/// ```text
/// <dir>/prolog/INSERT/PROLOG.sql     start of the insert script
/// <dir>/prolog/INSERT/<table>.sql    before the statements of <table>
/// <dir>/epilog/INSERT/<table>.sql    after the statements of <table>
/// <dir>/epilog/INSERT/EPILOG.sql     end of the insert script
/// ```
///
/// and the same under `DELETE/` for the delete script. Missing files are
/// skipped.
#[derive(Debug, Clone)]
pub struct FileScriptEnhancer {
    base: PathBuf,
}

impl FileScriptEnhancer {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn read(&self, kind: &str, script: ScriptType, file: &str) -> io::Result<Option<String>> {
        let dir = self.base.join(kind).join(script.as_str());
        for candidate in [file.to_string(), file.to_lowercase()] {
            let path = dir.join(format!("{}.sql", candidate));
            match fs::read_to_string(&path) {
                Ok(text) => return Ok(Some(text)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

impl ScriptEnhancer for FileScriptEnhancer {
    fn prolog(&self, script: ScriptType, table: Option<&Table>) -> io::Result<Option<String>> {
        match table {
            Some(t) => self.read("prolog", script, &t.name),
            None => self.read("prolog", script, "PROLOG"),
        }
    }

    fn epilog(&self, script: ScriptType, table: Option<&Table>) -> io::Result<Option<String>> {
        match table {
            Some(t) => self.read("epilog", script, &t.name),
            None => self.read("epilog", script, "EPILOG"),
        }
    }
}
