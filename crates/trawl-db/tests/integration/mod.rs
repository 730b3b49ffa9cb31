pub mod common;
mod sink_tests;
