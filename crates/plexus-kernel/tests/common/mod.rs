//! Common test utilities shared across `plexus-kernel` integration tests.
//!
//! Not a standalone test binary; declared with `mod common;` inside each
//! integration test file that needs it.

#![allow(dead_code)]

pub mod mock_plugin;
