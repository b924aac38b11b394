//! Cadence Graph - Task Dependency Graph
//!
//! Owns tasks and directed depends-on edges. The edge set stays acyclic:
//! an insertion that would close a cycle is rejected under the same write
//! lock that would have committed it, so no reader ever sees a cycle.

mod algorithms;
mod graph;

pub use graph::TaskGraph;
