//! Metainfo Test & Validation Infrastructure
//!
//! Cross-crate tests for the segment coordination client running against the
//! in-process coordinator: full segment lifecycles, listing pagination,
//! cancellation and connection release, concurrent use of a shared client,
//! persistence through the file-backed store, and property tests for
//! redundancy validation and authorization alignment.

pub mod concurrency_tests;
pub mod harness;
pub mod proptest_metainfo;

pub use harness::{small_scheme, upload, wide_scheme, TestEnv, TEST_API_KEY};
