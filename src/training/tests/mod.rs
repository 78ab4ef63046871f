//! End-to-end tests for the fold training pipeline
//!
//! Unit tests live next to each component; the modules here exercise the
//! pieces together on a tiny randomly initialised encoder and a generated
//! data directory.

pub mod trainer_tests;

// Utility modules for testing
pub mod fixtures;
pub mod test_utils;

pub use fixtures::TrainingFixture;
pub use test_utils::{
    assert_close, create_test_config, create_test_device, create_test_model, test_vocab,
    tiny_encoder_config,
};
