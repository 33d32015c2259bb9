//! In-memory watch backend: tests push change batches by hand and inspect
//! every expression the engine pushed.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use qa::errors::{QaError, Result};
use qa::watch::{Expression, FileEvent, Subscription, WatchBackend};

#[derive(Debug, Default)]
pub struct BackendLog {
    /// `(root, name, initial expression)` per subscribe call.
    pub subscriptions: Vec<(PathBuf, String, Expression)>,
    /// Every `update_expression` call, in order.
    pub updates: Vec<Expression>,
    pub closed: bool,
}

#[derive(Default)]
pub struct ScriptedBackend {
    log: Arc<Mutex<BackendLog>>,
    senders: Vec<mpsc::Sender<FileEvent>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> Arc<Mutex<BackendLog>> {
        Arc::clone(&self.log)
    }

    /// Sender feeding subscription `index`.
    pub fn sender(&self, index: usize) -> mpsc::Sender<FileEvent> {
        self.senders[index].clone()
    }
}

impl WatchBackend for ScriptedBackend {
    fn subscribe(
        &mut self,
        root: &Path,
        name: &str,
        expression: Expression,
    ) -> Result<(Box<dyn Subscription>, mpsc::Receiver<FileEvent>)> {
        let (tx, rx) = mpsc::channel(16);
        self.senders.push(tx);
        self.log
            .lock()
            .unwrap()
            .subscriptions
            .push((root.to_path_buf(), name.to_string(), expression));
        Ok((
            Box::new(ScriptedSubscription::new(&self.log)),
            rx,
        ))
    }

    fn close(&mut self) {
        self.senders.clear();
        self.log.lock().unwrap().closed = true;
    }
}

pub struct ScriptedSubscription {
    log: Arc<Mutex<BackendLog>>,
    failing: bool,
}

impl ScriptedSubscription {
    pub fn new(log: &Arc<Mutex<BackendLog>>) -> Self {
        Self {
            log: Arc::clone(log),
            failing: false,
        }
    }

    /// Logs every update, then rejects it.
    pub fn failing(log: &Arc<Mutex<BackendLog>>) -> Self {
        Self {
            failing: true,
            ..Self::new(log)
        }
    }
}

impl Subscription for ScriptedSubscription {
    fn update_expression(&mut self, expression: Expression) -> Result<()> {
        self.log.lock().unwrap().updates.push(expression);
        if self.failing {
            return Err(QaError::Watch("watch set update rejected".to_string()));
        }
        Ok(())
    }

    fn close(&mut self) {}
}
