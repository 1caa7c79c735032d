//! LocaLM engine library
//!
//! Model lifecycle and generation engine for the LocaLM desktop application.

pub mod inference;
pub mod storage;
