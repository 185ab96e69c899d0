pub mod generators;
pub mod harness;

#[allow(unused_imports)]
pub use harness::TestHarness;
