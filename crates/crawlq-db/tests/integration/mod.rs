pub mod common;
mod queue_tests;
mod record_tests;
