//! Prefix-trie HTTP route table.
//!
//! Compiles `(method, path template)` pairs into a prefix trie with
//! literal, named-parameter and greedy-tail segments. Supports path
//! parameter capture, literal-over-param-over-tail precedence, path
//! normalization, and rejects ambiguous registrations at insert time.

pub mod trie;

pub use trie::{normalize_path, RouteConflict, RouteEntry, RouteMatch, Router, ANY_METHOD};
