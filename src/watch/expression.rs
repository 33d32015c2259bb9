// src/watch/expression.rs

//! Boolean match expressions over root-relative paths.

use std::collections::HashSet;

use globset::{Glob, GlobMatcher};

use crate::errors::{QaError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    AnyOf(Vec<Expression>),
    AllOf(Vec<Expression>),
    Not(Box<Expression>),
    /// Glob over the whole relative path.
    Match(String),
    /// Exact relative paths.
    Name(Vec<String>),
}

impl Expression {
    /// `anyof(match <pattern>..., name <paths>)`.
    pub fn watching(patterns: &[String], paths: &[String]) -> Self {
        let mut terms: Vec<Expression> = patterns.iter().cloned().map(Expression::Match).collect();
        if !paths.is_empty() {
            terms.push(Expression::Name(paths.to_vec()));
        }
        Expression::AnyOf(terms)
    }

    pub fn compile(&self) -> Result<CompiledExpression> {
        Ok(match self {
            Expression::AnyOf(terms) => {
                CompiledExpression::AnyOf(terms.iter().map(|t| t.compile()).collect::<Result<_>>()?)
            }
            Expression::AllOf(terms) => {
                CompiledExpression::AllOf(terms.iter().map(|t| t.compile()).collect::<Result<_>>()?)
            }
            Expression::Not(term) => CompiledExpression::Not(Box::new(term.compile()?)),
            Expression::Match(pattern) => {
                let glob = Glob::new(pattern).map_err(|e| {
                    QaError::Watch(format!("invalid glob '{pattern}' in watch expression: {e}"))
                })?;
                CompiledExpression::Match(glob.compile_matcher())
            }
            Expression::Name(paths) => CompiledExpression::Name(paths.iter().cloned().collect()),
        })
    }
}

#[derive(Debug, Clone)]
pub enum CompiledExpression {
    AnyOf(Vec<CompiledExpression>),
    AllOf(Vec<CompiledExpression>),
    Not(Box<CompiledExpression>),
    Match(GlobMatcher),
    Name(HashSet<String>),
}

impl CompiledExpression {
    pub fn matches(&self, rel_path: &str) -> bool {
        match self {
            CompiledExpression::AnyOf(terms) => terms.iter().any(|t| t.matches(rel_path)),
            CompiledExpression::AllOf(terms) => terms.iter().all(|t| t.matches(rel_path)),
            CompiledExpression::Not(term) => !term.matches(rel_path),
            CompiledExpression::Match(glob) => glob.is_match(rel_path),
            CompiledExpression::Name(paths) => paths.contains(rel_path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watching_matches_globs_and_named_paths() {
        let expr = Expression::watching(
            &["spec/**/*_spec.rb".to_string()],
            &["lib/a.rb".to_string()],
        )
        .compile()
        .unwrap();

        assert!(expr.matches("spec/models/user_spec.rb"));
        assert!(expr.matches("lib/a.rb"));
        assert!(!expr.matches("lib/b.rb"));
    }

    #[test]
    fn boolean_combinators() {
        let expr = Expression::AllOf(vec![
            Expression::Match("**/*.rb".into()),
            Expression::Not(Box::new(Expression::Match("tmp/**".into()))),
        ])
        .compile()
        .unwrap();
        assert!(expr.matches("lib/a.rb"));
        assert!(!expr.matches("tmp/a.rb"));
        assert!(!expr.matches("lib/a.py"));
    }
}
