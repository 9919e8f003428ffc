//! Collector behaviour tests
//! Each module drives a real heap and its collector thread.

mod common;

mod failure;
mod weakrefs;
