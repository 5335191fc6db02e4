//! Integration tests for imgsquash
//!
//! These tests build synthetic `docker save` exports, run the whole squash
//! pipeline on them and inspect the archives it writes.

pub mod common;
pub mod squash;
