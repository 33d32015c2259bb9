// src/watch/backend.rs

//! Contract with the external file-watch service.

use std::path::{Path, PathBuf};

use tokio::sync::mpsc;

use crate::errors::Result;

use super::expression::Expression;

/// One changed path, relative to the subscription root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedFile {
    pub name: String,
    pub new: bool,
    pub exists: bool,
}

impl ChangedFile {
    pub fn changed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            new: false,
            exists: true,
        }
    }

    pub fn deleted(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            new: false,
            exists: false,
        }
    }
}

/// A batch of changes under one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub root: PathBuf,
    pub files: Vec<ChangedFile>,
}

impl FileEvent {
    pub fn path_of(&self, file: &ChangedFile) -> PathBuf {
        self.root.join(&file.name)
    }
}

pub trait Subscription: Send {
    /// Replace the expression deciding which paths are reported.
    fn update_expression(&mut self, expression: Expression) -> Result<()>;

    /// Stop delivering events; the event stream ends.
    fn close(&mut self);
}

pub trait WatchBackend: Send {
    fn subscribe(
        &mut self,
        root: &Path,
        name: &str,
        expression: Expression,
    ) -> Result<(Box<dyn Subscription>, mpsc::Receiver<FileEvent>)>;

    /// Close every subscription and release the connection.
    fn close(&mut self);
}
