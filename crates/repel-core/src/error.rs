//! Unified error types for the repel ecosystem
//!
//! This module provides a common error type [`CurveError`] for failures in
//! curve construction and geometry queries. Numerical modules define their
//! own error enums and convert to [`CurveError`] at API boundaries where a
//! uniform type is convenient.

use thiserror::Error;

/// Unified error type for curve-network operations.
///
/// Topology errors fail construction: a curve that passes [`crate::CurveNetwork::new`]
/// satisfies every structural invariant the numerical layers rely on.
#[derive(Error, Debug)]
pub enum CurveError {
    /// Curve has no vertices or no edges
    #[error("Topology error: curve has no vertices or no edges")]
    EmptyCurve,

    /// Edge endpoint index outside the vertex table
    #[error("Topology error: edge {edge} references vertex {vertex} but only {vertex_count} vertices exist")]
    VertexOutOfRange {
        edge: usize,
        vertex: usize,
        vertex_count: usize,
    },

    /// Edge connecting a vertex to itself
    #[error("Topology error: edge {edge} is a self-loop on vertex {vertex}")]
    SelfLoopEdge { edge: usize, vertex: usize },

    /// Two edges with the same (unordered) endpoints
    #[error("Topology error: duplicate edge between vertices {a} and {b}")]
    DuplicateEdge { a: usize, b: usize },

    /// Query against a vertex or edge index that does not exist
    #[error("Index error: {0}")]
    IndexOutOfBounds(String),

    /// Generic errors (for wrapping external errors)
    #[error("{0}")]
    Other(String),
}

/// Convenience type alias for Results using CurveError.
pub type CurveResult<T> = Result<T, CurveError>;

impl From<anyhow::Error> for CurveError {
    fn from(err: anyhow::Error) -> Self {
        CurveError::Other(err.to_string())
    }
}

impl From<String> for CurveError {
    fn from(s: String) -> Self {
        CurveError::Other(s)
    }
}

impl From<&str> for CurveError {
    fn from(s: &str) -> Self {
        CurveError::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CurveError::SelfLoopEdge { edge: 3, vertex: 7 };
        assert!(err.to_string().contains("self-loop"));
        assert!(err.to_string().contains('3'));
    }

    #[test]
    fn test_result_type_alias() {
        fn example_fn() -> CurveResult<i32> {
            Ok(42)
        }
        assert_eq!(example_fn().unwrap(), 42);
    }

    #[test]
    fn test_question_mark_operator() {
        fn inner() -> CurveResult<()> {
            Err(CurveError::EmptyCurve)
        }

        fn outer() -> CurveResult<()> {
            inner()?;
            Ok(())
        }

        assert!(outer().is_err());
    }
}
