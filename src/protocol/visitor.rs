// src/protocol/visitor.rs

//! Consumers of a decoded event stream.

use crate::errors::{QaError, Result};

use super::events::{SuiteBegin, SuiteFinish, TestBegin, TestFinish, TraceEvent};

/// Receives events in stream order.
///
/// `end` is terminal and fires exactly once per stream, with the reason the
/// stream stopped (`None` on a clean finish).
pub trait Visitor: Send {
    fn suite_begin(&mut self, _suite: &SuiteBegin) -> Result<()> {
        Ok(())
    }

    fn test_begin(&mut self, _test: &TestBegin) -> Result<()> {
        Ok(())
    }

    fn test_finish(&mut self, _test: &TestFinish) -> Result<()> {
        Ok(())
    }

    fn trace(&mut self, _trace: &TraceEvent) -> Result<()> {
        Ok(())
    }

    fn suite_finish(&mut self, _finish: &SuiteFinish) -> Result<()> {
        Ok(())
    }

    fn end(&mut self, _reason: Option<&QaError>) {}
}

impl<V: Visitor + ?Sized> Visitor for Box<V> {
    fn suite_begin(&mut self, suite: &SuiteBegin) -> Result<()> {
        (**self).suite_begin(suite)
    }

    fn test_begin(&mut self, test: &TestBegin) -> Result<()> {
        (**self).test_begin(test)
    }

    fn test_finish(&mut self, test: &TestFinish) -> Result<()> {
        (**self).test_finish(test)
    }

    fn trace(&mut self, trace: &TraceEvent) -> Result<()> {
        (**self).trace(trace)
    }

    fn suite_finish(&mut self, finish: &SuiteFinish) -> Result<()> {
        (**self).suite_finish(finish)
    }

    fn end(&mut self, reason: Option<&QaError>) {
        (**self).end(reason)
    }
}

type Hook<E> = Box<dyn FnMut(&E) -> Result<()> + Send>;

/// A visitor assembled from optional closures.
#[derive(Default)]
pub struct Callbacks {
    pub on_suite_begin: Option<Hook<SuiteBegin>>,
    pub on_test_begin: Option<Hook<TestBegin>>,
    pub on_test_finish: Option<Hook<TestFinish>>,
    pub on_trace: Option<Hook<TraceEvent>>,
    pub on_suite_finish: Option<Hook<SuiteFinish>>,
    pub on_end: Option<Box<dyn FnMut(Option<&QaError>) + Send>>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks").finish_non_exhaustive()
    }
}

fn call<E>(hook: &mut Option<Hook<E>>, event: &E) -> Result<()> {
    match hook {
        Some(h) => h(event),
        None => Ok(()),
    }
}

impl Visitor for Callbacks {
    fn suite_begin(&mut self, suite: &SuiteBegin) -> Result<()> {
        call(&mut self.on_suite_begin, suite)
    }

    fn test_begin(&mut self, test: &TestBegin) -> Result<()> {
        call(&mut self.on_test_begin, test)
    }

    fn test_finish(&mut self, test: &TestFinish) -> Result<()> {
        call(&mut self.on_test_finish, test)
    }

    fn trace(&mut self, trace: &TraceEvent) -> Result<()> {
        call(&mut self.on_trace, trace)
    }

    fn suite_finish(&mut self, finish: &SuiteFinish) -> Result<()> {
        call(&mut self.on_suite_finish, finish)
    }

    fn end(&mut self, reason: Option<&QaError>) {
        if let Some(h) = &mut self.on_end {
            h(reason);
        }
    }
}

/// Fans one stream out to several visitors in registration order.
///
/// The first sub-visitor error stops fan-out of that event. `end` always
/// reaches every visitor.
#[derive(Default)]
pub struct MultiVisitor {
    visitors: Vec<Box<dyn Visitor>>,
}

impl MultiVisitor {
    pub fn new(visitors: Vec<Box<dyn Visitor>>) -> Self {
        Self { visitors }
    }

    pub fn push(&mut self, visitor: Box<dyn Visitor>) {
        self.visitors.push(visitor);
    }

    pub fn len(&self) -> usize {
        self.visitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visitors.is_empty()
    }

    fn each(&mut self, mut f: impl FnMut(&mut dyn Visitor) -> Result<()>) -> Result<()> {
        for v in self.visitors.iter_mut() {
            f(v.as_mut())?;
        }
        Ok(())
    }
}

impl Visitor for MultiVisitor {
    fn suite_begin(&mut self, suite: &SuiteBegin) -> Result<()> {
        self.each(|v| v.suite_begin(suite))
    }

    fn test_begin(&mut self, test: &TestBegin) -> Result<()> {
        self.each(|v| v.test_begin(test))
    }

    fn test_finish(&mut self, test: &TestFinish) -> Result<()> {
        self.each(|v| v.test_finish(test))
    }

    fn trace(&mut self, trace: &TraceEvent) -> Result<()> {
        self.each(|v| v.trace(trace))
    }

    fn suite_finish(&mut self, finish: &SuiteFinish) -> Result<()> {
        self.each(|v| v.suite_finish(finish))
    }

    fn end(&mut self, reason: Option<&QaError>) {
        for v in self.visitors.iter_mut() {
            v.end(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::protocol::events::{Status, TestFilter};

    fn recorder(name: &'static str, log: Arc<Mutex<Vec<String>>>, fail: bool) -> Box<dyn Visitor> {
        let end_log = Arc::clone(&log);
        Box::new(Callbacks {
            on_test_finish: Some(Box::new(move |t: &TestFinish| {
                log.lock().unwrap().push(format!("{name}:{}", t.label));
                if fail {
                    Err(QaError::Transport(format!("{name} refused")))
                } else {
                    Ok(())
                }
            })),
            on_end: Some(Box::new(move |_: Option<&QaError>| {
                end_log.lock().unwrap().push(format!("{name}:end"));
            })),
            ..Callbacks::default()
        })
    }

    #[test]
    fn multi_visitor_stops_at_first_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut multi = MultiVisitor::new(vec![
            recorder("a", Arc::clone(&log), false),
            recorder("b", Arc::clone(&log), true),
            recorder("c", Arc::clone(&log), false),
        ]);

        let finish = TestFinish::new("t1", TestFilter::from("f:1"), Status::Pass);
        let err = multi.test_finish(&finish).unwrap_err();
        assert!(err.to_string().contains("b refused"));

        multi.end(None);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:t1", "b:t1", "a:end", "b:end", "c:end"]
        );
    }
}
