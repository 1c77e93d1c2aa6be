//! Lambda emulator workspace - end-to-end tests for the invoke emulator.
//!
//! This is a virtual package that provides workspace-level integration tests.
//! The actual functionality is provided by the workspace member crate:
//!
//! - `lambda-emulator`: Invoke API and function URL front end over a local
//!   Runtime API sandbox
//!
//! The harness in `tests/` runs a real `lambda_runtime` function against it.
