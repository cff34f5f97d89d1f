//! Low-level primitives the tree reader is built on.

/// Block I/O abstractions and the file and in-memory block sources.
pub mod io;
